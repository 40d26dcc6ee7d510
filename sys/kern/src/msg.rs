// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message transfer.
//!
//! Messages exist in two forms. The *external* form lives in a task's
//! shared message buffer and names ports by their ids in that task's
//! space. The *internal* form is kernel-owned: both header slots hold
//! direct port references, already translated.
//!
//! `internalize` runs on send. It resolves the header's two rights
//! atomically through the sender's space and swaps them: the destination
//! right lands in the internal message's `local` slot (that is where the
//! receiver's name for it will go), the reply right in `remote`. The type
//! bits are rewritten to their received forms in the same swap.
//! `externalize` runs on receive and is the inverse against the
//! receiver's space.

use alloc::vec::Vec;

use abi::{
    MsgBits, MsgHeader, MsgIoError, MsgIoResult, MsgTypeName, PortId,
    MSGBUF_SIZE, MSG_HEADER_SIZE,
};
use zerocopy::{FromBytes, IntoBytes};

use crate::port::{self, EnqueueOutcome, PortRef};
use crate::space::{IpcSpace, PortRight};

/// A message in kernel ownership.
///
/// Field naming follows the header the receiver will eventually see:
/// `local` is the destination port (the receiver's side), `remote` the
/// sender's reply port. Dropping an `IntMsg` releases the port references
/// it carries.
pub struct IntMsg {
    pub bits: MsgBits,
    pub size: u32,
    /// Reply port, inserted into the receiver's space on externalize.
    pub remote: Option<PortRef>,
    /// Destination port; the message queues here.
    pub local: Option<PortRef>,
    pub seqno: u64,
    pub msgid: u64,
    pub body: Vec<u8>,
}

/// Maps a send-side right code to the form the receiver observes.
fn recv_form(ty: Option<MsgTypeName>) -> u8 {
    match ty {
        None => 0,
        Some(
            MsgTypeName::MoveSend | MsgTypeName::CopySend | MsgTypeName::MakeSend,
        ) => MsgTypeName::PORT_SEND as u8,
        Some(MsgTypeName::MoveOnce | MsgTypeName::MakeOnce) => {
            MsgTypeName::PORT_ONCE as u8
        }
        Some(other) => panic!("unvalidated right code {other:?}"),
    }
}

/// Builds the internal form of the message in `ext`, taking its rights
/// out of `space`. Failure takes nothing.
pub fn internalize(space: &IpcSpace, ext: &[u8]) -> MsgIoResult<IntMsg> {
    let hdr = MsgHeader::read_from_bytes(
        ext.get(..MSG_HEADER_SIZE).ok_or(MsgIoError::SendInvalidData)?,
    )
    .map_err(|_| MsgIoError::SendInvalidData)?;

    let size = hdr.size as usize;
    if size < MSG_HEADER_SIZE || size > MSGBUF_SIZE || size > ext.len() {
        return Err(MsgIoError::SendInvalidData);
    }

    // The two right codes form a closed set; anything else is a malformed
    // header. A null reply port must be typeless and vice versa.
    let remty = MsgTypeName::try_from(hdr.bits.remote())
        .map_err(|_| MsgIoError::SendInvalidHeader)?;
    let locty = match hdr.bits.local() {
        0 => {
            if !hdr.local.is_null() {
                return Err(MsgIoError::SendInvalidHeader);
            }
            None
        }
        raw => Some(
            MsgTypeName::try_from(raw)
                .map_err(|_| MsgIoError::SendInvalidHeader)?,
        ),
    };

    let (remright, locright) =
        space.resolve_sendmsg(remty, hdr.remote, locty, hdr.local)?;

    Ok(IntMsg {
        bits: MsgBits::compose(recv_form(locty), recv_form(Some(remty))),
        size: hdr.size,
        remote: locright.map(PortRight::into_port),
        local: Some(remright.into_port()),
        seqno: 0,
        msgid: hdr.msgid,
        body: ext[MSG_HEADER_SIZE..size].to_vec(),
    })
}

/// Writes the external form of `msg` into `out`, translating through the
/// receiver's `space`. Consumes the message and its rights.
pub fn externalize(
    space: &IpcSpace,
    msg: IntMsg,
    out: &mut [u8],
) -> MsgIoResult<usize> {
    let size = msg.size as usize;
    if size < MSG_HEADER_SIZE || size > MSGBUF_SIZE || size > out.len() {
        return Err(MsgIoError::RcvInvalidData);
    }

    // The destination should be this receiver's receive right; report
    // whatever name the space has for it.
    let local = match &msg.local {
        Some(port) => space.lookup(port),
        None => PortId::NULL,
    };

    // The reply right enters the receiver's space as a fresh (or
    // coalesced) name. If the space cannot take it, the right is dropped
    // and the receiver sees a null name.
    let mut remote = PortId::NULL;
    if let Some(port) = msg.remote.clone() {
        if let Some(right) =
            PortRight::from_recv_form(msg.bits.remote(), port)
        {
            if let Ok(id) = space.insert(right) {
                remote = id;
            }
        }
    }

    let hdr = MsgHeader {
        bits: msg.bits,
        size: msg.size,
        remote,
        local,
        seqno: msg.seqno,
        msgid: msg.msgid,
    };
    out[..MSG_HEADER_SIZE].copy_from_slice(hdr.as_bytes());
    out[MSG_HEADER_SIZE..size].copy_from_slice(&msg.body);
    Ok(size)
}

/// Returns the rights of a message whose enqueue could not complete to
/// the sender's space, so the re-driven operation finds them again.
///
/// Rights come back in their received form: moved and copied send rights
/// re-insert as send references, send-once rights as fresh once entries.
pub fn unwind(space: &IpcSpace, msg: IntMsg) {
    if let Some(port) = msg.local.clone() {
        if let Some(right) =
            PortRight::from_recv_form(msg.bits.local(), port)
        {
            let _ = space.insert(right);
        }
    }
    if let Some(port) = msg.remote.clone() {
        if let Some(right) =
            PortRight::from_recv_form(msg.bits.remote(), port)
        {
            let _ = space.insert(right);
        }
    }
}

/// Sends a kernel-built message, bypassing backpressure so the demux can
/// always reply. Any refusal consumes the message.
pub fn send_from_kernel(msg: IntMsg) -> MsgIoResult<()> {
    match port::enqueue(msg, 0, true) {
        EnqueueOutcome::Sent => Ok(()),
        EnqueueOutcome::Refused(e) => Err(e),
        EnqueueOutcome::Retry(_) => unreachable!("forced send cannot block"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::Port;
    use crate::test_support;
    use alloc::sync::Arc;
    use zerocopy::IntoBytes;

    fn ext_msg(
        rem: (u8, PortId),
        loc: (u8, PortId),
        msgid: u64,
        body: &[u8],
    ) -> Vec<u8> {
        let hdr = MsgHeader {
            bits: MsgBits::compose(rem.0, loc.0),
            size: (MSG_HEADER_SIZE + body.len()) as u32,
            remote: rem.1,
            local: loc.1,
            seqno: 0,
            msgid,
        };
        let mut buf = hdr.as_bytes().to_vec();
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn internalize_swaps_rights_and_copies_body() {
        test_support::boot();
        let space = IpcSpace::new();
        let dest = Port::new_queue_sized(2);
        let reply = Port::new_queue_sized(2);
        let dest_id = space.insert(PortRight::Send(dest.clone())).unwrap();
        let reply_id = space.insert(PortRight::Recv(reply.clone())).unwrap();

        let ext = ext_msg(
            (MsgTypeName::CopySend as u8, dest_id),
            (MsgTypeName::MakeOnce as u8, reply_id),
            0x77,
            b"ping",
        );
        let msg = internalize(&space, &ext).unwrap();

        assert!(Arc::ptr_eq(msg.local.as_ref().unwrap(), &dest));
        assert!(Arc::ptr_eq(msg.remote.as_ref().unwrap(), &reply));
        assert_eq!(msg.bits.remote(), MsgTypeName::PORT_ONCE as u8);
        assert_eq!(msg.bits.local(), MsgTypeName::PORT_SEND as u8);
        assert_eq!(msg.msgid, 0x77);
        assert_eq!(msg.body, b"ping");
    }

    #[test]
    fn internalize_rejects_bad_sizes_and_headers() {
        test_support::boot();
        let space = IpcSpace::new();
        let dest = Port::new_queue_sized(2);
        let dest_id = space.insert(PortRight::Send(dest.clone())).unwrap();

        // Size below the header.
        let mut ext = ext_msg((MsgTypeName::CopySend as u8, dest_id), (0, PortId::NULL), 1, b"");
        ext[4] = 8;
        assert_eq!(
            internalize(&space, &ext).err(),
            Some(MsgIoError::SendInvalidData)
        );

        // Unknown right code.
        let ext = ext_msg((0x33, dest_id), (0, PortId::NULL), 1, b"");
        assert_eq!(
            internalize(&space, &ext).err(),
            Some(MsgIoError::SendInvalidHeader)
        );

        // Reply name without a reply disposition.
        let ext = ext_msg(
            (MsgTypeName::CopySend as u8, dest_id),
            (0, PortId(7)),
            1,
            b"",
        );
        assert_eq!(
            internalize(&space, &ext).err(),
            Some(MsgIoError::SendInvalidHeader)
        );

        // Unknown destination name.
        let ext = ext_msg(
            (MsgTypeName::CopySend as u8, PortId(42)),
            (0, PortId::NULL),
            1,
            b"",
        );
        assert_eq!(
            internalize(&space, &ext).err(),
            Some(MsgIoError::SendInvalidDest)
        );

        // Failures took nothing.
        assert_eq!(space.entry_info(dest_id), Some((false, 1, false)));
    }

    #[test]
    fn externalize_round_trips_header_fields() {
        test_support::boot();

        // Sender resolves; receiver holds the receive right for the
        // destination and gains a name for the reply right.
        let sender = IpcSpace::new();
        let receiver = IpcSpace::new();
        let dest = Port::new_queue_sized(2);
        let reply = Port::new_queue_sized(2);

        let s_dest = sender.insert(PortRight::Send(dest.clone())).unwrap();
        let s_reply = sender.insert(PortRight::Recv(reply.clone())).unwrap();
        let r_dest = receiver.insert(PortRight::Recv(dest.clone())).unwrap();

        let ext = ext_msg(
            (MsgTypeName::MoveSend as u8, s_dest),
            (MsgTypeName::MakeOnce as u8, s_reply),
            0xbeef,
            b"hello",
        );
        let msg = internalize(&sender, &ext).unwrap();

        let mut out = alloc::vec![0u8; MSGBUF_SIZE];
        let n = externalize(&receiver, msg, &mut out).unwrap();
        let hdr = MsgHeader::read_from_bytes(&out[..MSG_HEADER_SIZE]).unwrap();

        // (bits, size, msgid) survive the round trip.
        assert_eq!(hdr.size as usize, n);
        assert_eq!(hdr.msgid, 0xbeef);
        assert_eq!(hdr.bits.remote(), MsgTypeName::PORT_ONCE as u8);
        assert_eq!(hdr.bits.local(), MsgTypeName::PORT_SEND as u8);
        // Destination resolves to the receiver's own name for it.
        assert_eq!(hdr.local, r_dest);
        // The reply right materialized as a fresh once entry.
        assert_eq!(receiver.entry_info(hdr.remote), Some((true, 0, false)));
        assert_eq!(&out[MSG_HEADER_SIZE..n], b"hello");
    }

    #[test]
    fn unwind_restores_taken_rights() {
        test_support::boot();
        let space = IpcSpace::new();
        let dest = Port::new_queue_sized(2);
        let dest_id = space.insert(PortRight::Send(dest.clone())).unwrap();

        let ext = ext_msg(
            (MsgTypeName::MoveSend as u8, dest_id),
            (0, PortId::NULL),
            1,
            b"",
        );
        let msg = internalize(&space, &ext).unwrap();
        // The move took the only reference.
        assert_eq!(space.entry_info(dest_id), None);

        unwind(&space, msg);
        assert_eq!(space.lookup(&dest), dest_id);
        assert_eq!(space.entry_info(dest_id), Some((false, 1, false)));
    }
}
