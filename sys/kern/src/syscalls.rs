// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Syscall entry points.
//!
//! The platform traps into [`dispatch`] with the syscall number and raw
//! argument registers; bulk arguments travel through the calling thread's
//! shared message buffer. Return values are the wire encodings from
//! `abi`: zero for success, a `KERN_*` or `MSGIO_*` code otherwise.
//!
//! Primitives that enroll the caller in a wait queue return `KERN_RETRY`;
//! the user-side syscall stub re-drives the operation when the thread
//! resumes (or observes `KERN_THREAD_TIMEDOUT` written by the timeout
//! path).

use alloc::sync::Arc;
use alloc::vec;

use abi::{
    KernError, KernResult, MsgIoError, MsgTypeName, PortId, PortRightKind,
    VmMapArgs, VmProt, VmRegionInfo, MSGBUF_SIZE, SYS_MSGBUF, SYS_MSGRECV,
    SYS_MSGSEND, SYS_PORT_ALLOCATE, SYS_REPLY_PORT, SYS_TASK_SELF,
    SYS_VM_ALLOCATE, SYS_VM_DEALLOCATE, SYS_VM_MAP, SYS_VM_REGION,
    VM_INHERIT_DEFAULT,
};

use crate::err::Progress;
use crate::msg;
use crate::port::{self, EnqueueOutcome, KernCtx};
use crate::sched;
use crate::space::PortRight;
use crate::task::{self, Task};
use crate::thread::Thread;
use crate::vmobj::{self, VmObj, VmObjRef};

/// Syscall dispatch. `nr` is the (negative) syscall number; `a2..a5` are
/// the raw argument registers.
pub fn dispatch(nr: i64, a2: u64, a3: u64, a4: u64, a5: u64) -> i64 {
    let th = sched::cur_thread();
    if th.is_idle() {
        return KernError::InvalidArgument as i64;
    }
    let Some(cur) = th.task() else {
        return KernError::InvalidTask as i64;
    };

    match nr {
        SYS_MSGBUF => th.msgbuf().uaddr as i64,
        SYS_MSGSEND => msgsend(&cur, &th, a2, a3, a4),
        SYS_MSGRECV => msgrecv(&cur, &th, a2, a3, a4, a5),
        SYS_REPLY_PORT => match cur.allocate_port() {
            Ok(id) => id.0 as i64,
            Err(_) => PortId::NULL.0 as i64,
        },
        SYS_TASK_SELF => match cur.task_self() {
            Ok(id) => id.0 as i64,
            Err(_) => PortId::NULL.0 as i64,
        },
        SYS_VM_REGION => kern_code(vm_region(&cur, &th)),
        SYS_VM_MAP => kern_code(vm_map(&cur, &th, a2)),
        SYS_VM_ALLOCATE => kern_code(vm_allocate(&cur, &th, a2, a3, a4)),
        SYS_VM_DEALLOCATE => kern_code(vm_deallocate(&cur, a2, a3, a4)),
        SYS_PORT_ALLOCATE => kern_code(port_allocate(&cur, &th, a2, a3)),
        _ => {
            log::info!("unknown syscall {nr}");
            -1
        }
    }
}

fn kern_code(r: KernResult<()>) -> i64 {
    abi::kern_return(r) as i64
}

fn msgio_code(e: MsgIoError) -> i64 {
    e as u32 as i64
}

/// `msgsend`: internalize the message in the caller's buffer and queue it
/// on its destination. `notify` is accepted for ABI compatibility and
/// ignored.
fn msgsend(
    cur: &Arc<Task>,
    th: &Arc<Thread>,
    _opt: u64,
    timeout: u64,
    _notify: u64,
) -> i64 {
    let mut buf = vec![0u8; MSGBUF_SIZE];
    th.msgbuf().read(0, &mut buf);

    let space = cur.ipcspace();
    let intmsg = match msg::internalize(space, &buf) {
        Ok(m) => m,
        Err(e) => return msgio_code(e),
    };

    match port::enqueue(intmsg, timeout, false) {
        EnqueueOutcome::Sent => 0,
        EnqueueOutcome::Retry(m) => {
            // The caller is parked; give the rights back so the re-driven
            // send can take them again.
            msg::unwind(space, m);
            KernError::Retry as i64
        }
        EnqueueOutcome::Refused(e) => msgio_code(e),
    }
}

/// `msgrecv`: dequeue from the named receive right and externalize into
/// the caller's buffer.
fn msgrecv(
    cur: &Arc<Task>,
    th: &Arc<Thread>,
    recv_port: u64,
    _opt: u64,
    timeout: u64,
    _notify: u64,
) -> i64 {
    let space = cur.ipcspace();
    let port = match space.resolve_receive(PortId(recv_port)) {
        Ok(p) => p,
        Err(_) => return msgio_code(MsgIoError::RcvInvalidName),
    };

    match port::dequeue(&port, timeout) {
        Progress::Done(Ok(m)) => {
            let mut out = vec![0u8; MSGBUF_SIZE];
            match msg::externalize(space, m, &mut out) {
                Ok(n) => {
                    th.msgbuf().write(0, &out[..n]);
                    0
                }
                Err(e) => msgio_code(e),
            }
        }
        Progress::Retry => KernError::Retry as i64,
        Progress::Done(Err(e)) => msgio_code(e),
    }
}

/// Reads a serialized argument structure out of the caller's buffer.
fn read_inbuf<T>(th: &Thread) -> KernResult<T>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let mut buf = [0u8; 128];
    th.msgbuf().read(0, &mut buf);
    let (v, _) =
        ssmarshal::deserialize(&buf).map_err(|_| KernError::InvalidArgument)?;
    Ok(v)
}

/// Writes a serialized result structure into the caller's buffer.
fn write_outbuf<T: serde::Serialize>(th: &Thread, v: &T) -> KernResult<()> {
    let mut buf = [0u8; 128];
    let n = ssmarshal::serialize(&mut buf, v)
        .map_err(|_| KernError::InvalidArgument)?;
    th.msgbuf().write(0, &buf[..n]);
    Ok(())
}

/// Resolves a task-port name in the caller's space to the task it names.
fn resolve_task(cur: &Task, id: u64) -> KernResult<Arc<Task>> {
    let right = cur
        .ipcspace()
        .resolve(MsgTypeName::CopySend, PortId(id))?;
    task::from_port(right.port())
}

/// Resolves an object-name-port name to its VM object.
fn resolve_vmobj(cur: &Task, id: PortId) -> KernResult<VmObjRef> {
    let right = cur.ipcspace().resolve(MsgTypeName::CopySend, id)?;
    match right.port().kernel_ctx() {
        Some(KernCtx::VmObjName(w)) => {
            w.upgrade().ok_or(KernError::InvalidName)
        }
        _ => Err(KernError::InvalidName),
    }
}

fn vm_allocate(
    cur: &Arc<Task>,
    th: &Thread,
    task_port: u64,
    size: u64,
    anywhere: u64,
) -> KernResult<()> {
    let target = resolve_task(cur, task_port)?;
    let mut addr: u64 = read_inbuf(th)?;
    target.vm_allocate(&mut addr, size, anywhere != 0)?;
    write_outbuf(th, &addr)
}

fn vm_deallocate(
    cur: &Arc<Task>,
    task_port: u64,
    addr: u64,
    size: u64,
) -> KernResult<()> {
    let target = resolve_task(cur, task_port)?;
    target.vm_deallocate(addr, size)
}

fn vm_region(cur: &Arc<Task>, th: &Thread) -> KernResult<()> {
    let addr: u64 = read_inbuf(th)?;
    let (start, size, curprot, maxprot, off, name_port) =
        cur.vmmap.region(addr)?;

    // The caller gets a send right to the backing object's name port; a
    // full space degrades to the null name.
    let objname = cur
        .ipcspace()
        .insert(PortRight::Send(name_port))
        .unwrap_or(PortId::NULL);

    write_outbuf(
        th,
        &VmRegionInfo {
            addr: start,
            size,
            curprot: curprot.bits(),
            maxprot: maxprot.bits(),
            inherit: VM_INHERIT_DEFAULT,
            shared: false,
            objname,
            off,
        },
    )
}

fn vm_map(cur: &Arc<Task>, th: &Thread, task_port: u64) -> KernResult<()> {
    let target = resolve_task(cur, task_port)?;
    let mut args: VmMapArgs = read_inbuf(th)?;

    let obj = if args.objname.is_null() {
        VmObj::new(true, args.size)
    } else {
        resolve_vmobj(cur, args.objname)?
    };
    let obj = if args.copy {
        vmobj::shadow_copy(&obj)
    } else {
        obj
    };

    let curprot = VmProt::from_bits_truncate(args.curprot);
    let maxprot = VmProt::from_bits_truncate(args.maxprot);
    if args.anywhere {
        args.addr =
            target
                .vmmap
                .alloc(obj, args.off, args.size, curprot, maxprot)?;
    } else {
        target
            .vmmap
            .map(args.addr, obj, args.off, args.size, curprot, maxprot)?;
    }
    write_outbuf(th, &args.addr)
}

fn port_allocate(
    cur: &Arc<Task>,
    th: &Thread,
    task_port: u64,
    kind: u64,
) -> KernResult<()> {
    let target = resolve_task(cur, task_port)?;
    let kind =
        PortRightKind::try_from(kind).map_err(|_| KernError::InvalidValue)?;
    match kind {
        PortRightKind::Receive => {
            let id = target.allocate_port()?;
            write_outbuf(th, &id.0)
        }
        // Port sets and dead names are not implemented.
        _ => Err(KernError::InvalidValue),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use abi::{MsgBits, MsgHeader, MSG_HEADER_SIZE};
    use zerocopy::{FromBytes, IntoBytes};

    /// Boots, creates a task with one thread, and makes it current.
    fn current_task() -> (Arc<Task>, Arc<Thread>) {
        test_support::boot();
        let task = Task::create();
        let th = task.spawn_thread().unwrap();
        sched::add(&th);
        assert!(Arc::ptr_eq(&sched::next(), &th));
        (task, th)
    }

    fn park_current() {
        let th = sched::cur_thread();
        sched::destroy(&th);
        let _ = sched::next();
        test_support::reap();
    }

    #[test]
    fn msgbuf_returns_shared_buffer_address() {
        let _g = test_support::sched_guard();
        let (_task, th) = current_task();
        assert_eq!(
            dispatch(SYS_MSGBUF, 0, 0, 0, 0),
            th.msgbuf().uaddr as i64
        );
        park_current();
    }

    #[test]
    fn send_recv_round_trip_through_msgbuf() {
        let _g = test_support::sched_guard();
        let (_task, th) = current_task();

        // A receive right to talk to ourselves.
        let rid = dispatch(SYS_REPLY_PORT, 0, 0, 0, 0) as u64;
        assert_ne!(rid, 0);

        let hdr = MsgHeader {
            bits: MsgBits::compose(MsgTypeName::MakeSend as u8, 0),
            size: (MSG_HEADER_SIZE + 5) as u32,
            remote: PortId(rid),
            local: PortId::NULL,
            seqno: 0,
            msgid: 9,
        };
        th.msgbuf().write(0, hdr.as_bytes());
        th.msgbuf().write(MSG_HEADER_SIZE, b"hello");

        assert_eq!(dispatch(SYS_MSGSEND, 0, 0, 0, 0), 0);
        assert_eq!(dispatch(SYS_MSGRECV, rid, 0, 0, 0), 0);

        let mut out = [0u8; MSG_HEADER_SIZE + 5];
        th.msgbuf().read(0, &mut out);
        let rhdr = MsgHeader::read_from_bytes(&out[..MSG_HEADER_SIZE]).unwrap();
        // We made a send right to our own port: the receiver's local name
        // is the same entry; there was no reply right.
        assert_eq!(rhdr.local, PortId(rid));
        assert_eq!(rhdr.remote, PortId::NULL);
        assert_eq!(rhdr.msgid, 9);
        assert_eq!(&out[MSG_HEADER_SIZE..], b"hello");

        park_current();
    }

    #[test]
    fn recv_on_bad_name_and_send_to_unknown_dest() {
        let _g = test_support::sched_guard();
        let (_task, th) = current_task();

        assert_eq!(
            dispatch(SYS_MSGRECV, 99, 0, 0, 0),
            MsgIoError::RcvInvalidName as u32 as i64
        );

        let hdr = MsgHeader {
            bits: MsgBits::compose(MsgTypeName::CopySend as u8, 0),
            size: MSG_HEADER_SIZE as u32,
            remote: PortId(55),
            local: PortId::NULL,
            seqno: 0,
            msgid: 0,
        };
        th.msgbuf().write(0, hdr.as_bytes());
        assert_eq!(
            dispatch(SYS_MSGSEND, 0, 0, 0, 0),
            MsgIoError::SendInvalidDest as u32 as i64
        );

        park_current();
    }

    #[test]
    fn vm_allocate_through_task_port() {
        let _g = test_support::sched_guard();
        let (task, th) = current_task();

        let tid = dispatch(SYS_TASK_SELF, 0, 0, 0, 0) as u64;
        assert_ne!(tid, 0);

        // anywhere = 1; requested address ignored.
        write_outbuf(&th, &0u64).unwrap();
        let rc = dispatch(
            SYS_VM_ALLOCATE,
            tid,
            2 * abi::PAGE_SIZE as u64,
            1,
            0,
        );
        assert_eq!(rc, 0);
        let addr: u64 = read_inbuf(&th).unwrap();
        assert!(addr >= abi::VM_MAP_USER_START);
        assert_eq!(task.vmmap.region_at(addr).map(|r| r.2), Some(true));

        // And release it again.
        let rc = dispatch(
            SYS_VM_DEALLOCATE,
            tid,
            addr,
            2 * abi::PAGE_SIZE as u64,
            0,
        );
        assert_eq!(rc, 0);
        assert_eq!(task.vmmap.region_at(addr).map(|r| r.2), Some(false));

        park_current();
    }

    #[test]
    fn vm_region_reports_attributes_and_name_right() {
        let _g = test_support::sched_guard();
        let (task, th) = current_task();

        let tid = dispatch(SYS_TASK_SELF, 0, 0, 0, 0) as u64;
        write_outbuf(&th, &0u64).unwrap();
        assert_eq!(
            dispatch(SYS_VM_ALLOCATE, tid, abi::PAGE_SIZE as u64, 1, 0),
            0
        );
        let addr: u64 = read_inbuf(&th).unwrap();

        write_outbuf(&th, &addr).unwrap();
        assert_eq!(dispatch(SYS_VM_REGION, 0, 0, 0, 0), 0);
        let info: VmRegionInfo = read_inbuf(&th).unwrap();
        assert_eq!(info.addr, addr);
        assert_eq!(info.size, abi::PAGE_SIZE as u64);
        assert_eq!(info.curprot, VmProt::DEFAULT.bits());
        assert_eq!(info.maxprot, VmProt::ALL.bits());
        assert_ne!(info.objname, PortId::NULL);
        // The returned name right really is the object's name port.
        let right = task
            .ipcspace()
            .resolve(MsgTypeName::CopySend, info.objname)
            .unwrap();
        assert!(right.port().kernel_ctx().is_some());

        park_current();
    }

    #[test]
    fn port_allocate_receive_right() {
        let _g = test_support::sched_guard();
        let (task, th) = current_task();

        let tid = dispatch(SYS_TASK_SELF, 0, 0, 0, 0) as u64;
        let rc = dispatch(
            SYS_PORT_ALLOCATE,
            tid,
            PortRightKind::Receive as u64,
            0,
            0,
        );
        assert_eq!(rc, 0);
        let id: u64 = read_inbuf(&th).unwrap();
        assert!(task.ipcspace().resolve_receive(PortId(id)).is_ok());

        // Unsupported right kinds are rejected.
        assert_eq!(
            dispatch(SYS_PORT_ALLOCATE, tid, PortRightKind::PortSet as u64, 0, 0),
            KernError::InvalidValue as i64
        );

        park_current();
    }

    #[test]
    fn vm_map_with_copy_object() {
        let _g = test_support::sched_guard();
        let (task, th) = current_task();
        const PAGE: u64 = abi::PAGE_SIZE as u64;

        let tid = dispatch(SYS_TASK_SELF, 0, 0, 0, 0) as u64;

        // First get an object name via vm_allocate + vm_region.
        write_outbuf(&th, &0u64).unwrap();
        assert_eq!(dispatch(SYS_VM_ALLOCATE, tid, 2 * PAGE, 1, 0), 0);
        let addr: u64 = read_inbuf(&th).unwrap();
        write_outbuf(&th, &addr).unwrap();
        assert_eq!(dispatch(SYS_VM_REGION, 0, 0, 0, 0), 0);
        let info: VmRegionInfo = read_inbuf(&th).unwrap();

        // Map a copy of that object somewhere else.
        let args = VmMapArgs {
            addr: 0,
            size: 2 * PAGE,
            mask: 0,
            anywhere: true,
            objname: info.objname,
            off: 0,
            copy: true,
            curprot: VmProt::DEFAULT.bits(),
            maxprot: VmProt::ALL.bits(),
            inherit: VM_INHERIT_DEFAULT,
        };
        write_outbuf(&th, &args).unwrap();
        assert_eq!(dispatch(SYS_VM_MAP, tid, 0, 0, 0), 0);
        let mapped: u64 = read_inbuf(&th).unwrap();
        assert_ne!(mapped, addr);
        assert_eq!(task.vmmap.region_at(mapped).map(|r| r.2), Some(true));

        park_current();
    }
}
