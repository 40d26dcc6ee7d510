// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ports and message queues.
//!
//! A port is one of three kinds, and only ever moves forward toward
//! *dead*: kernel ports route their traffic to a per-CPU queue consumed by
//! the kernel-server demux; queue ports carry a bounded FIFO of in-transit
//! messages with wait queues for blocked senders and receivers; dead ports
//! refuse everything.
//!
//! Queue capacity scales with the machine (two slots per CPU). A send that
//! finds the queue full -- or finds earlier senders already waiting, which
//! preserves sender FIFO order -- enrolls the caller and reports retry.

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};

use abi::{MsgIoError, MsgIoResult};
use spin::{Mutex, MutexGuard};

use crate::err::Progress;
use crate::msg::IntMsg;
use crate::sched;
use crate::task::Task;
use crate::thread::Thread;
use crate::vmobj::VmObj;

pub type PortRef = Arc<Port>;

/// What a kernel port stands for. Contexts are weak back-references; the
/// named object owns the port, not the other way around.
#[derive(Clone)]
pub enum KernCtx {
    Task(Weak<Task>),
    Thread(Weak<Thread>),
    VmObjCtl(Weak<VmObj>),
    VmObjName(Weak<VmObj>),
    HostCtl,
    HostName,
}

/// The queue state of a queue-kind port.
pub struct PortQueue {
    msgq: VecDeque<IntMsg>,
    send_waitq: sched::WaitQ,
    recv_waitq: sched::WaitQ,
    entries: usize,
    capacity: usize,
}

impl PortQueue {
    fn new(capacity: usize) -> Self {
        Self {
            msgq: VecDeque::new(),
            send_waitq: sched::WaitQ::new(),
            recv_waitq: sched::WaitQ::new(),
            entries: 0,
            capacity,
        }
    }
}

pub enum PortState {
    Kernel(KernCtx),
    Queue(PortQueue),
    Dead,
}

pub struct Port {
    state: Mutex<PortState>,
}

/// How an enqueue attempt ended.
#[must_use]
pub enum EnqueueOutcome {
    /// Message queued (or handed to the kernel demux).
    Sent,
    /// Queue full or senders already waiting: the caller was enrolled in
    /// the send wait queue. The message comes back so its rights can be
    /// returned before the operation is re-driven.
    Retry(IntMsg),
    /// The port refused the message; its rights have been released.
    Refused(MsgIoError),
}


impl Port {
    /// Creates a kernel port with the given context.
    pub fn new_kernel(ctx: KernCtx) -> PortRef {
        Arc::new(Port {
            state: Mutex::new(PortState::Kernel(ctx)),
        })
    }

    /// Creates a queue port with the machine-scaled capacity.
    pub fn new_queue() -> PortRef {
        Self::new_queue_sized(2 * crate::hal::hal().cpu_num())
    }

    /// Creates a queue port with an explicit capacity.
    pub fn new_queue_sized(capacity: usize) -> PortRef {
        Arc::new(Port {
            state: Mutex::new(PortState::Queue(PortQueue::new(capacity))),
        })
    }

    pub fn is_dead(&self) -> bool {
        matches!(*self.state.lock(), PortState::Dead)
    }

    pub fn is_kernel(&self) -> bool {
        matches!(*self.state.lock(), PortState::Kernel(_))
    }

    /// The kernel context of a kernel port, if this is one.
    pub fn kernel_ctx(&self) -> Option<KernCtx> {
        match &*self.state.lock() {
            PortState::Kernel(ctx) => Some(ctx.clone()),
            _ => None,
        }
    }

    /// Number of queued messages. Diagnostic.
    pub fn queued(&self) -> usize {
        match &*self.state.lock() {
            PortState::Queue(q) => q.entries,
            _ => 0,
        }
    }

    /// Moves the port to the dead state: queued messages are consumed
    /// (their rights released) and every blocked sender and receiver is
    /// woken to observe the death on its re-drive.
    pub fn destroy(&self) {
        let prev = {
            let mut st = self.state.lock();
            core::mem::replace(&mut *st, PortState::Dead)
        };
        if let PortState::Queue(q) = prev {
            drop(q.msgq);
            sched::wake_all(&q.send_waitq);
            sched::wake_all(&q.recv_waitq);
        }
    }

    /// Locks two ports in address order, for operations that must view a
    /// message's destination and reply port atomically.
    pub fn lock_pair<'a>(
        a: &'a PortRef,
        b: &'a PortRef,
    ) -> (MutexGuard<'a, PortState>, Option<MutexGuard<'a, PortState>>) {
        if Arc::ptr_eq(a, b) {
            (a.state.lock(), None)
        } else if Arc::as_ptr(a) < Arc::as_ptr(b) {
            let ga = a.state.lock();
            let gb = b.state.lock();
            (ga, Some(gb))
        } else {
            let gb = b.state.lock();
            let ga = a.state.lock();
            (ga, Some(gb))
        }
    }
}

impl Drop for Port {
    // Zero references: tear the queue down. Waiters hold no reference to
    // the port, so they must be woken here; their re-driven operations
    // re-resolve the (now gone) name and fail cleanly.
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if let PortState::Queue(q) = core::mem::replace(st, PortState::Dead) {
            drop(q.msgq);
            sched::wake_all(&q.send_waitq);
            sched::wake_all(&q.recv_waitq);
        }
    }
}

/// Queues `msg` on its destination port (the message's `local` field).
///
/// With `force` the capacity check is bypassed; kernel-originated sends
/// use this so replies cannot deadlock the demux. A blocking attempt
/// enrolls the caller with `timeout_ms` and returns the message for right
/// unwinding.
pub fn enqueue(msg: IntMsg, timeout_ms: u64, force: bool) -> EnqueueOutcome {
    let Some(port) = msg.local.clone() else {
        return EnqueueOutcome::Refused(MsgIoError::SendInvalidDest);
    };

    let mut st = port.state.lock();
    match &mut *st {
        PortState::Kernel(_) => {
            sched::cur_cpu().kern_msgq.lock().push_back(msg);
            EnqueueOutcome::Sent
        }
        PortState::Dead => EnqueueOutcome::Refused(MsgIoError::SendInvalidDest),
        PortState::Queue(q) => {
            if !force
                && (!q.send_waitq.is_empty() || q.entries == q.capacity)
            {
                sched::wait(&q.send_waitq, timeout_ms);
                EnqueueOutcome::Retry(msg)
            } else {
                q.msgq.push_back(msg);
                q.entries += 1;
                sched::wakeone(&q.recv_waitq);
                EnqueueOutcome::Sent
            }
        }
    }
}

/// Takes the next message off a queue port. An empty queue enrolls the
/// caller in the receive wait queue and reports retry.
pub fn dequeue(
    port: &PortRef,
    timeout_ms: u64,
) -> Progress<MsgIoResult<IntMsg>> {
    let mut st = port.state.lock();
    match &mut *st {
        PortState::Kernel(_) => {
            Progress::Done(Err(MsgIoError::RcvInvalidName))
        }
        PortState::Dead => Progress::Done(Err(MsgIoError::RcvPortDied)),
        PortState::Queue(q) => match q.msgq.pop_front() {
            None => {
                sched::wait(&q.recv_waitq, timeout_ms);
                Progress::Retry
            }
            Some(msg) => {
                q.entries -= 1;
                sched::wakeone(&q.send_waitq);
                Progress::Done(Ok(msg))
            }
        },
    }
}
