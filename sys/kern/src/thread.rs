// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Threads.

use alloc::sync::{Arc, Weak};

use abi::KernError;
use spin::Mutex;

use crate::msgbuf::MsgBuf;
use crate::port::{KernCtx, Port, PortRef};
use crate::sched::WaitQInner;
use crate::task::Task;
use crate::timer::TimerId;

/// Scheduler-visible state of a thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchedStatus {
    Runnable,
    Running,
    Stopped,
    Removed,
}

/// Operations latched on a running thread, enacted at its next kernel
/// return.
#[derive(Default)]
pub struct SchedOps {
    pub destroy: bool,
    pub suspend: bool,
    pub yield_: bool,
}

pub struct ThreadSched {
    pub status: SchedStatus,
    pub ops: SchedOps,
    /// CPU the thread last ran on; used as its runnable-queue home.
    pub cpu: usize,
    /// Wait queue the thread is enrolled in, if any.
    pub waitq: Option<Arc<WaitQInner>>,
    /// Virtual-time accounting.
    pub vtt_offset: u64,
    pub vtt_rttbase: u64,
}

/// The user-context view the portable kernel keeps: the syscall return
/// value slot. Register state proper is owned by the platform.
struct UserCtxt {
    retval: i64,
}

pub struct Thread {
    idle: bool,
    pub(crate) sched: Mutex<ThreadSched>,
    uctxt: Mutex<UserCtxt>,
    /// Timeout timer for the current timed wait.
    pub(crate) timeout: Mutex<Option<TimerId>>,
    /// Kernel/user shared message buffer. Idle threads have none.
    msgbuf: Option<MsgBuf>,
    /// Thread-local-storage block and the seeded TLS pointer.
    tls_block: Option<MsgBuf>,
    tls: u64,
    task: Weak<Task>,
    self_port: Option<PortRef>,
}

impl Thread {
    /// Creates a thread belonging to `task`, with a fresh message buffer,
    /// TLS block, and self port.
    pub fn new(task: &Arc<Task>) -> Result<Arc<Thread>, KernError> {
        let msgbuf = task
            .vmmap
            .alloc_msgbuf()
            .ok_or(KernError::ResourceShortage)?;
        let Some((tls_block, tls)) = task.vmmap.alloc_tls() else {
            task.vmmap.free_msgbuf(msgbuf);
            return Err(KernError::ResourceShortage);
        };

        Ok(Arc::new_cyclic(|weak: &Weak<Thread>| Thread {
            idle: false,
            sched: Mutex::new(ThreadSched {
                status: SchedStatus::Stopped,
                ops: SchedOps::default(),
                cpu: 0,
                waitq: None,
                vtt_offset: 0,
                vtt_rttbase: 0,
            }),
            uctxt: Mutex::new(UserCtxt { retval: 0 }),
            timeout: Mutex::new(None),
            msgbuf: Some(msgbuf),
            tls_block: Some(tls_block),
            tls,
            task: Arc::downgrade(task),
            self_port: Some(Port::new_kernel(KernCtx::Thread(weak.clone()))),
        }))
    }

    /// A minimal per-CPU idle thread. Never enqueued on a runnable FIFO
    /// and owns no task resources.
    pub fn new_idle() -> Arc<Thread> {
        Arc::new(Thread {
            idle: true,
            sched: Mutex::new(ThreadSched {
                status: SchedStatus::Runnable,
                ops: SchedOps::default(),
                cpu: 0,
                waitq: None,
                vtt_offset: 0,
                vtt_rttbase: 0,
            }),
            uctxt: Mutex::new(UserCtxt { retval: 0 }),
            timeout: Mutex::new(None),
            msgbuf: None,
            tls_block: None,
            tls: 0,
            task: Weak::new(),
            self_port: None,
        })
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    pub fn task(&self) -> Option<Arc<Task>> {
        self.task.upgrade()
    }

    /// The thread's shared message buffer.
    ///
    /// # Panics
    ///
    /// On idle threads, which never perform message I/O.
    pub fn msgbuf(&self) -> &MsgBuf {
        self.msgbuf.as_ref().expect("idle thread has no msgbuf")
    }

    pub fn tls(&self) -> u64 {
        self.tls
    }

    /// A fresh reference to the thread's self port.
    pub fn self_port(&self) -> Option<PortRef> {
        self.self_port.clone()
    }

    /// Stores the user-visible syscall return value.
    pub fn set_retval(&self, v: i64) {
        self.uctxt.lock().retval = v;
    }

    pub fn retval(&self) -> i64 {
        self.uctxt.lock().retval
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // Return the shared buffers to the owning task's zone; if the task
        // is already gone its map teardown reclaimed the page table, and
        // the frames go back with it.
        if let Some(task) = self.task.upgrade() {
            if let Some(mb) = self.msgbuf.take() {
                task.vmmap.free_msgbuf(mb);
            }
            if let Some(tls) = self.tls_block.take() {
                task.vmmap.free_msgbuf(tls);
            }
        }
    }
}
