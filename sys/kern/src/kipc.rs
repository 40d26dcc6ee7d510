// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel-port message dispatch.
//!
//! Messages sent to kernel ports bypass the generic queues and land in a
//! per-CPU kernel queue, drained between scheduler passes. What happens to
//! them is up to the installed [`KernelServer`] -- in a full system that
//! is the generated stub demux; the kernel core only routes.

use abi::MsgIoError;

use crate::msg::{self, IntMsg};
use crate::port::KernCtx;
use crate::sched;

/// A consumer of kernel-port messages, typically generated from interface
/// definitions. `dispatch` may produce a reply, which is sent with the
/// backpressure bypass so the demux can never wedge on a full queue.
pub trait KernelServer: Send + Sync {
    fn dispatch(&self, ctx: &KernCtx, msg: &IntMsg) -> Option<IntMsg>;
}

static SERVER: spin::Once<&'static dyn KernelServer> = spin::Once::new();

/// Installs the kernel server. Later installs are ignored.
pub fn set_server(s: &'static dyn KernelServer) {
    SERVER.call_once(|| s);
}

/// Drains this CPU's kernel queue. Called at every kernel return.
pub fn exec() {
    loop {
        let msg = sched::cur_cpu().kern_msgq.lock().pop_front();
        let Some(msg) = msg else { break };

        let Some(ctx) = msg.local.as_ref().and_then(|p| p.kernel_ctx())
        else {
            // Destination died in transit; dropping the message releases
            // its rights.
            continue;
        };

        let Some(server) = SERVER.get() else { continue };
        if let Some(reply) = server.dispatch(&ctx, &msg) {
            if let Err(e) = msg::send_from_kernel(reply) {
                if e != MsgIoError::SendInvalidDest {
                    log::warn!("kernel reply failed: {e:?}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{self, EnqueueOutcome, KernCtx, Port};
    use crate::test_support;
    use abi::{MsgBits, MsgTypeName, MSG_HEADER_SIZE};
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU64, Ordering};

    struct Echo {
        seen: AtomicU64,
    }

    static ECHO: Echo = Echo {
        seen: AtomicU64::new(0),
    };

    impl KernelServer for Echo {
        fn dispatch(&self, ctx: &KernCtx, msg: &IntMsg) -> Option<IntMsg> {
            assert!(matches!(*ctx, KernCtx::HostName));
            self.seen.fetch_add(1, Ordering::Relaxed);
            // Reply to the carried reply port.
            let reply_port = msg.remote.clone()?;
            Some(IntMsg {
                bits: MsgBits::compose(0, MsgTypeName::PORT_SEND as u8),
                size: MSG_HEADER_SIZE as u32,
                remote: None,
                local: Some(reply_port),
                seqno: 0,
                msgid: msg.msgid + 100,
                body: alloc::vec::Vec::new(),
            })
        }
    }

    #[test]
    fn kernel_messages_route_to_demux_and_reply() {
        let _g = test_support::sched_guard();
        test_support::boot();
        set_server(&ECHO);

        let kport = Port::new_kernel(KernCtx::HostName);
        let reply = Port::new_queue_sized(2);

        let msg = IntMsg {
            bits: MsgBits::compose(
                MsgTypeName::PORT_ONCE as u8,
                MsgTypeName::PORT_SEND as u8,
            ),
            size: MSG_HEADER_SIZE as u32,
            remote: Some(reply.clone()),
            local: Some(kport.clone()),
            seqno: 0,
            msgid: 7,
            body: alloc::vec::Vec::new(),
        };
        assert!(matches!(
            port::enqueue(msg, 0, false),
            EnqueueOutcome::Sent
        ));
        assert_eq!(reply.queued(), 0);

        exec();
        assert!(ECHO.seen.load(Ordering::Relaxed) >= 1);
        assert_eq!(reply.queued(), 1);
        match port::dequeue(&reply, 0) {
            crate::err::Progress::Done(Ok(m)) => {
                assert_eq!(m.msgid, 107);
                assert!(m.local.as_ref().is_some_and(|p| Arc::ptr_eq(p, &reply)));
            }
            _ => panic!("expected reply"),
        }
    }
}
