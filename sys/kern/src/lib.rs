// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Machaira kernel.
//!
//! This is the portable core of a Mach-style microkernel: ports and message
//! queues, per-task port-name spaces, atomic message transfer, virtual
//! memory objects with copy-on-write shadow chains, per-task VM maps, and a
//! FIFO scheduler with wait queues and timers. User programs interact with
//! it exclusively by sending typed messages through ports.
//!
//! Everything architecture-specific -- page-table manipulation, context
//! switching, IPI delivery, the boot-time frame allocator, CPU-local
//! storage -- lives behind the [`hal::Hal`] trait and is supplied by the
//! platform. That keeps this crate portable and lets the test suite drive
//! the whole kernel against an in-memory machine.
//!
//! # Design principles
//!
//! 1. Errors are values: every primitive returns `Result`, and the wire
//!    encodings of the error space live in the `abi` crate.
//! 2. Primitives that may block never spin in place. They enroll the caller
//!    in a wait queue and report [`err::Progress::Retry`]; the syscall layer
//!    re-drives the operation when the thread wakes.
//! 3. A strong preference for safe code. The unavoidable unsafety of frame
//!    and page-table access is confined to the HAL.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod cacheobj;
pub mod err;
pub mod hal;
pub mod host;
pub mod imap;
pub mod kipc;
pub mod memcache;
pub mod msg;
pub mod msgbuf;
pub mod physmem;
pub mod port;
pub mod sched;
pub mod space;
pub mod startup;
pub mod syscalls;
pub mod task;
pub mod thread;
pub mod timer;
pub mod vmmap;
pub mod vmobj;

#[cfg(test)]
pub(crate) mod test_support;
