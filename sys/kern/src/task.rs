// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tasks.
//!
//! A task is the unit of resource ownership: an address space, a
//! port-name space, the threads running in them, and a kernel-typed self
//! port serving as the task's public identity.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use abi::{KernError, KernResult, PortId, VmProt};
use spin::Mutex;

use crate::port::{KernCtx, Port, PortRef};
use crate::space::{IpcSpace, PortRight};
use crate::thread::Thread;
use crate::vmmap::VmMap;
use crate::vmobj::VmObj;

pub struct Task {
    // Threads release their shared buffers through the map, so they are
    // declared (and dropped) ahead of it.
    threads: Mutex<Vec<Arc<Thread>>>,
    ipcspace: IpcSpace,
    pub vmmap: VmMap,
    self_port: PortRef,
}

impl Task {
    /// Creates an empty task.
    pub fn create() -> Arc<Task> {
        Arc::new_cyclic(|weak: &Weak<Task>| Task {
            threads: Mutex::new(Vec::new()),
            ipcspace: IpcSpace::new(),
            vmmap: VmMap::new(),
            self_port: Port::new_kernel(KernCtx::Task(weak.clone())),
        })
    }

    pub fn ipcspace(&self) -> &IpcSpace {
        &self.ipcspace
    }

    pub fn self_port(&self) -> PortRef {
        self.self_port.clone()
    }

    /// Creates a thread in this task, registering it with the task.
    pub fn spawn_thread(self: &Arc<Task>) -> KernResult<Arc<Thread>> {
        let th = Thread::new(self)?;
        self.threads.lock().push(th.clone());
        Ok(th)
    }

    /// Forgets a dead thread. The thread's resources go when its last
    /// reference does.
    pub fn retire_thread(&self, th: &Arc<Thread>) {
        self.threads.lock().retain(|t| !Arc::ptr_eq(t, th));
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Inserts a send right to the task's self port into its own space
    /// and returns the name. This is the `task_self` syscall.
    pub fn task_self(&self) -> KernResult<PortId> {
        self.ipcspace
            .insert(PortRight::Send(self.self_port.clone()))
    }

    /// Inserts an arbitrary right into the task's space.
    pub fn add_port_right(&self, right: PortRight) -> KernResult<PortId> {
        self.ipcspace.insert(right)
    }

    /// Creates a queue port and hands this task the receive right.
    pub fn allocate_port(&self) -> KernResult<PortId> {
        let port = Port::new_queue();
        self.ipcspace.insert(PortRight::Recv(port))
    }

    /// Backs `[addr, addr+size)` (or an arbitrary free range, with
    /// `anywhere`) with a fresh anonymous object.
    pub fn vm_allocate(
        &self,
        addr: &mut u64,
        size: u64,
        anywhere: bool,
    ) -> KernResult<()> {
        let obj = VmObj::new(true, size);
        if anywhere {
            *addr = self.vmmap.alloc(
                obj,
                0,
                size,
                VmProt::DEFAULT,
                VmProt::ALL,
            )?;
        } else {
            self.vmmap.map(
                *addr,
                obj,
                0,
                size,
                VmProt::DEFAULT,
                VmProt::ALL,
            )?;
        }
        Ok(())
    }

    pub fn vm_deallocate(&self, addr: u64, size: u64) -> KernResult<()> {
        self.vmmap.free(addr, size)
    }

    /// Makes this task's address space current on the calling CPU.
    pub fn enter(&self) {
        self.vmmap.enter();
    }
}

/// Recovers the task a kernel port stands for, as used by syscalls taking
/// a task port argument.
pub fn from_port(port: &PortRef) -> KernResult<Arc<Task>> {
    match port.kernel_ctx() {
        Some(KernCtx::Task(w)) => w.upgrade().ok_or(KernError::InvalidTask),
        _ => Err(KernError::InvalidName),
    }
}
