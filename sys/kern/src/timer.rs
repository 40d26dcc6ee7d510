// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel timers.
//!
//! A single globally ordered list of absolute deadlines multiplexes the
//! HAL's one-shot timer. Expiry handlers run from [`run`], which the
//! platform calls on timer interrupts; handlers run outside the timer lock
//! so they are free to take thread and scheduler locks.

use alloc::collections::BTreeMap;
use alloc::sync::Weak;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::hal::hal;
use crate::thread::Thread;

/// What to do when a deadline passes.
pub enum TimerEvent {
    /// A timed wait ran out: abort the thread's wait with
    /// `KERN_THREAD_TIMEDOUT`.
    WaitTimeout(Weak<Thread>),
}

/// Handle for a registered timer, ordered by absolute deadline. The
/// sequence number keeps simultaneous deadlines distinct.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct TimerId {
    deadline: u64,
    seq: u64,
}

static TIMERS: Mutex<BTreeMap<TimerId, TimerEvent>> =
    Mutex::new(BTreeMap::new());
static SEQ: AtomicU64 = AtomicU64::new(0);

fn rearm(timers: &BTreeMap<TimerId, TimerEvent>, now: u64) {
    match timers.keys().next() {
        Some(first) => hal().timer_arm(first.deadline.saturating_sub(now)),
        None => hal().timer_clear(),
    }
}

/// Registers an event to fire `delta_ns` from now.
pub fn register(delta_ns: u64, ev: TimerEvent) -> TimerId {
    let now = hal().now();
    let id = TimerId {
        deadline: now + delta_ns,
        seq: SEQ.fetch_add(1, Ordering::Relaxed),
    };
    let mut timers = TIMERS.lock();
    timers.insert(id, ev);
    rearm(&timers, now);
    id
}

/// Cancels a registered event. Harmless if it already fired.
pub fn remove(id: TimerId) {
    let mut timers = TIMERS.lock();
    if timers.remove(&id).is_some() {
        rearm(&timers, hal().now());
    }
}

/// Fires every expired event. Called by the platform on timer interrupts.
pub fn run() {
    let now = hal().now();

    let due: Vec<TimerEvent> = {
        let mut timers = TIMERS.lock();
        let mut due = Vec::new();
        while let Some(first) = timers.keys().next().copied() {
            if first.deadline > now {
                break;
            }
            due.push(timers.remove(&first).unwrap());
        }
        if !due.is_empty() {
            rearm(&timers, now);
        }
        due
    };

    for ev in due {
        match ev {
            TimerEvent::WaitTimeout(th) => {
                // The wake may have raced the deadline; abort is a no-op
                // for threads no longer in a wait queue.
                if let Some(th) = th.upgrade() {
                    crate::sched::abort(&th, true);
                }
            }
        }
    }
}

/// Nanoseconds per millisecond; syscall timeouts arrive in milliseconds.
pub const NSEC_PER_MSEC: u64 = 1_000_000;
