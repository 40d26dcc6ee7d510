// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduler and wait queues.
//!
//! Threads move between per-CPU runnable FIFOs, a running slot per CPU,
//! and wait queues. Blocking never happens inline: primitives record a
//! pending suspend on the current thread and the switch is enacted at the
//! next kernel return, when the platform calls [`next`].
//!
//! Lock order: task, then thread, then `SCHED`, then wait-queue. The
//! scheduler lock is never held while taking an object lock.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, Once};

use crate::hal::hal;
use crate::msg::IntMsg;
use crate::thread::{SchedStatus, Thread};
use crate::timer::{self, TimerEvent, NSEC_PER_MSEC};

/// A lock-protected FIFO of blocked threads.
///
/// The handle is cheap to clone; all clones share the queue. Threads keep
/// a back-link to the queue they are enrolled in so cancellation can find
/// them.
#[derive(Clone, Default)]
pub struct WaitQ {
    inner: Arc<WaitQInner>,
}

#[derive(Default)]
pub struct WaitQInner {
    queue: Mutex<VecDeque<Arc<Thread>>>,
}

impl WaitQ {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.lock().is_empty()
    }

    fn same(inner: &Arc<WaitQInner>, other: &WaitQ) -> bool {
        Arc::ptr_eq(inner, &other.inner)
    }
}

/// Per-CPU scheduler state.
pub struct CpuData {
    /// Thread currently running on this CPU.
    current: Mutex<Option<Arc<Thread>>>,
    /// This CPU's idle thread; never enters a runnable FIFO.
    idle: Arc<Thread>,
    /// Messages addressed to kernel ports, drained between scheduler
    /// passes by the kernel-server demux.
    pub kern_msgq: Mutex<VecDeque<IntMsg>>,
    /// Threads destroyed on this CPU, awaiting reap at kernel return.
    pub dead_threads: Mutex<Vec<Arc<Thread>>>,
}

static CPUS: Once<Vec<CpuData>> = Once::new();

/// Per-CPU runnable FIFOs behind the single scheduler lock.
static SCHED: Mutex<Vec<VecDeque<Arc<Thread>>>> = Mutex::new(Vec::new());

/// Bit per CPU, set while that CPU runs its idle thread.
static IDLE_MASK: AtomicU64 = AtomicU64::new(0);

/// Builds per-CPU state. Called once at boot, before any scheduling.
pub fn init() {
    let ncpu = hal().cpu_num();
    assert!(ncpu <= 64);
    CPUS.call_once(|| {
        let mut cpus = Vec::with_capacity(ncpu);
        for _ in 0..ncpu {
            cpus.push(CpuData {
                current: Mutex::new(None),
                idle: Thread::new_idle(),
                kern_msgq: Mutex::new(VecDeque::new()),
                dead_threads: Mutex::new(Vec::new()),
            });
        }
        cpus
    });
    *SCHED.lock() = (0..ncpu).map(|_| VecDeque::new()).collect();
    IDLE_MASK.store((1u64 << ncpu) - 1, Ordering::Relaxed);
}

pub fn cur_cpu() -> &'static CpuData {
    &CPUS.get().expect("scheduler not initialized")[hal().cpu_id()]
}

/// The thread running on this CPU; the idle thread when nothing is.
pub fn cur_thread() -> Arc<Thread> {
    let cpu = cur_cpu();
    let cur = cpu.current.lock();
    cur.clone().unwrap_or_else(|| cpu.idle.clone())
}

/// Wakes one idle CPU so it reconsiders its runnable queue.
pub fn cpu_kick() {
    let mask = IDLE_MASK.load(Ordering::Acquire);
    for cpu in 0..hal().cpu_num() {
        if mask & (1 << cpu) != 0 {
            hal().cpu_ipi(cpu);
        }
    }
}

/// Makes a thread runnable on its preferred CPU.
pub fn add(th: &Arc<Thread>) {
    {
        let mut sch = th.sched.lock();
        sch.status = SchedStatus::Runnable;
        let cpu = sch.cpu.min(hal().cpu_num() - 1);
        SCHED.lock()[cpu].push_back(th.clone());
    }
    cpu_kick();
}

/// Picks the thread to run next on this CPU, enacting any pending
/// operation on the current one. Called at kernel return; the platform
/// context-switches to whatever this returns.
pub fn next() -> Arc<Thread> {
    let cpu_id = hal().cpu_id();
    let cpu = cur_cpu();
    let cur = cur_thread();

    if !cur.is_idle() {
        let mut sch = cur.sched.lock();
        assert_eq!(sch.status, SchedStatus::Running);
        if sch.ops.destroy {
            sch.ops.destroy = false;
            sch.status = SchedStatus::Removed;
            cpu.dead_threads.lock().push(cur.clone());
        } else if sch.ops.suspend {
            sch.ops.suspend = false;
            sch.status = SchedStatus::Stopped;
        } else if sch.ops.yield_ {
            sch.ops.yield_ = false;
            sch.status = SchedStatus::Runnable;
            SCHED.lock()[cpu_id].push_back(cur.clone());
        } else {
            // Nothing pending: keep running.
            return cur.clone();
        }
    }

    let newth = {
        let mut sched = SCHED.lock();
        sched[cpu_id].pop_front()
    };
    let newth = match newth {
        Some(th) => {
            IDLE_MASK.fetch_and(!(1 << cpu_id), Ordering::Release);
            th
        }
        None => {
            IDLE_MASK.fetch_or(1 << cpu_id, Ordering::Release);
            cpu.idle.clone()
        }
    };

    if !Arc::ptr_eq(&newth, &cur) {
        // Virtual-time bookkeeping for the outgoing thread.
        if !cur.is_idle() {
            let mut sch = cur.sched.lock();
            sch.vtt_offset = hal().now().wrapping_sub(sch.vtt_rttbase);
        }
        if !newth.is_idle() {
            let mut sch = newth.sched.lock();
            sch.status = SchedStatus::Running;
            sch.cpu = cpu_id;
            sch.vtt_rttbase = hal().now();
        }
        *cpu.current.lock() = Some(newth.clone());
        if let Some(task) = newth.task() {
            task.vmmap.enter();
        }
    }
    newth
}

/// Enrolls the current thread in `wq`, arming a timeout if `timeout_ms`
/// is nonzero, and records a pending suspend. The switch happens at the
/// next kernel return.
pub fn wait(wq: &WaitQ, timeout_ms: u64) {
    let curth = cur_thread();
    assert!(!curth.is_idle(), "idle thread cannot wait");

    let mut sch = curth.sched.lock();
    if timeout_ms != 0 {
        let id = timer::register(
            timeout_ms * NSEC_PER_MSEC,
            TimerEvent::WaitTimeout(Arc::downgrade(&curth)),
        );
        *curth.timeout.lock() = Some(id);
    }
    assert_eq!(sch.status, SchedStatus::Running);
    assert!(sch.waitq.is_none());
    sch.ops.suspend = true;
    sch.waitq = Some(wq.inner.clone());
    wq.inner.queue.lock().push_back(curth.clone());
}

/// Wakes the first thread blocked on `wq`, if any.
pub fn wakeone(wq: &WaitQ) {
    let th = wq.inner.queue.lock().pop_front();
    if let Some(th) = th {
        resume(&th, wq);
    }
}

/// Wakes every thread blocked on `wq`.
pub fn wake_all(wq: &WaitQ) {
    loop {
        let th = wq.inner.queue.lock().pop_front();
        match th {
            Some(th) => resume(&th, wq),
            None => break,
        }
    }
}

fn resume(th: &Arc<Thread>, wq: &WaitQ) {
    let mut kick = false;
    {
        let mut sch = th.sched.lock();
        if let Some(id) = th.timeout.lock().take() {
            timer::remove(id);
        }
        match sch.status {
            SchedStatus::Running => {
                // Blocked but not yet switched away: cancel the pending
                // suspend instead of re-queueing.
                assert!(sch.ops.suspend);
                debug_assert!(sch
                    .waitq
                    .as_ref()
                    .is_some_and(|w| WaitQ::same(w, wq)));
                sch.ops.suspend = false;
            }
            SchedStatus::Stopped => {
                sch.status = SchedStatus::Runnable;
                let cpu = sch.cpu.min(hal().cpu_num() - 1);
                SCHED.lock()[cpu].push_back(th.clone());
                kick = true;
            }
            SchedStatus::Runnable | SchedStatus::Removed => (),
        }
        sch.waitq = None;
    }
    if kick {
        cpu_kick();
    }
}

/// Pulls a thread out of whatever wait queue it is enrolled in and
/// resumes it. With `timedout` the thread's user-visible return value is
/// rewritten to `KERN_THREAD_TIMEDOUT`. Returns false if the thread was
/// not waiting.
pub fn abort(th: &Arc<Thread>, timedout: bool) -> bool {
    let inner = {
        let sch = th.sched.lock();
        match &sch.waitq {
            Some(w) => w.clone(),
            None => return false,
        }
    };
    {
        let mut q = inner.queue.lock();
        if let Some(pos) = q.iter().position(|t| Arc::ptr_eq(t, th)) {
            q.remove(pos);
        } else {
            // A wakeone raced us and already owns the resume.
            return false;
        }
    }
    if timedout {
        th.set_retval(abi::KernError::ThreadTimedOut as i64);
    }
    resume(th, &WaitQ { inner });
    true
}

/// Requests destruction of a thread at its next kernel return.
pub fn destroy(th: &Arc<Thread>) {
    th.sched.lock().ops.destroy = true;
}

/// Requests that the current thread round-robin to the back of its FIFO.
pub fn yield_cur() {
    cur_thread().sched.lock().ops.yield_ = true;
}
