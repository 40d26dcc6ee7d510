// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup and the platform entry points.
//!
//! The platform boots, installs its HAL, and calls [`init_bsp`] exactly
//! once; secondary CPUs call [`init_ap`] after that. From then on every
//! trap funnels back through one of the `handle_*` entry points and ends
//! with [`kern_return`], which drains kernel-port messages, reaps dead
//! threads, and picks the next thread to run.

use alloc::sync::Arc;
use alloc::vec::Vec;

use abi::{KernResult, VmProt};

use crate::hal::{self, Hal};
use crate::task::Task;
use crate::thread::Thread;
use crate::{host, kipc, memcache, physmem, sched, timer};

/// Boot-CPU initialization. Must run before anything else in this crate.
pub fn init_bsp(h: &'static dyn Hal) {
    hal::install(h);
    physmem::init();
    memcache::init();
    sched::init();
    host::init();
    log::info!("machaira started ({} cpus)", hal::hal().cpu_num());
}

/// Secondary-CPU initialization. Per-CPU state was built by `init_bsp`;
/// the CPU only needs to start scheduling.
pub fn init_ap() {
    let _ = sched::cur_cpu();
}

/// Creates the first user task with one runnable thread.
pub fn bootstrap_task() -> KernResult<Arc<Task>> {
    let task = Task::create();
    let th = task.spawn_thread()?;
    sched::add(&th);
    Ok(task)
}

/// Common tail of every kernel entry: run the kernel-port demux, pick the
/// next thread, and reap whatever died on this CPU.
pub fn kern_return() -> Arc<Thread> {
    kipc::exec();
    let next = sched::next();
    reap_dead_threads();
    next
}

/// Releases threads that were destroyed on this CPU.
pub fn reap_dead_threads() {
    let dead: Vec<Arc<Thread>> = {
        let mut list = sched::cur_cpu().dead_threads.lock();
        list.drain(..).collect()
    };
    for th in dead {
        if let Some(task) = th.task() {
            task.retire_thread(&th);
        }
    }
}

/// Timer-interrupt entry: fire due timers.
pub fn handle_alarm() {
    timer::run();
}

/// Page-fault entry. Returns true if the fault was resolved; the platform
/// terminates the thread otherwise.
pub fn handle_page_fault(va: u64, reqprot: VmProt) -> bool {
    let th = sched::cur_thread();
    let Some(task) = th.task() else {
        return false;
    };
    task.vmmap.fault(va, reqprot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn bootstrap_task_is_runnable() {
        let _g = test_support::sched_guard();
        test_support::boot();

        let task = bootstrap_task().unwrap();
        assert_eq!(task.thread_count(), 1);

        let th = kern_return();
        assert!(!th.is_idle());
        assert!(th.task().is_some_and(|t| Arc::ptr_eq(&t, &task)));

        sched::destroy(&th);
        let idle = kern_return();
        assert!(idle.is_idle());
        // The reap dropped the scheduler's reference and told the task.
        assert_eq!(task.thread_count(), 0);
    }

    #[test]
    fn page_fault_entry_resolves_through_current_task() {
        let _g = test_support::sched_guard();
        test_support::boot();

        let task = bootstrap_task().unwrap();
        let th = kern_return();
        assert!(!th.is_idle());

        let mut addr = 0u64;
        task.vm_allocate(&mut addr, abi::PAGE_SIZE as u64, true).unwrap();
        assert!(handle_page_fault(addr, VmProt::READ));
        assert!(!handle_page_fault(addr - abi::PAGE_SIZE as u64, VmProt::READ));

        sched::destroy(&th);
        let _ = kern_return();
    }
}
