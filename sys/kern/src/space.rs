// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Port-name spaces.
//!
//! Port-right bookkeeping follows Mach's rules, which are a bit involved:
//!
//! 1. Send and receive rights to the same port coalesce into a single
//!    entry per space, managed through a user-reference count and a
//!    receive flag. The entry exists while `send_count > 0` or the
//!    receive flag is set.
//! 2. Every send-once right gets an entry of its own.
//!
//! Entries are indexed two ways: by name, and -- for the coalesced
//! send/receive entries only -- by port, so that inserting a right can
//! find the name this space already uses for that port. Send-once entries
//! stay out of the port index; a space can hold many of them for one
//! port, so there is no unique port-to-name relationship to record.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use abi::{KernError, KernResult, MsgIoError, MsgTypeName, PortId};
use spin::Mutex;

use crate::port::PortRef;

/// A port right in flight: a capability detached from any name space.
pub enum PortRight {
    Send(PortRef),
    Recv(PortRef),
    Once(PortRef),
}

impl PortRight {
    pub fn port(&self) -> &PortRef {
        match self {
            Self::Send(p) | Self::Recv(p) | Self::Once(p) => p,
        }
    }

    pub fn into_port(self) -> PortRef {
        match self {
            Self::Send(p) | Self::Recv(p) | Self::Once(p) => p,
        }
    }

    /// Rebuilds a right from its received-form wire encoding.
    pub fn from_recv_form(form: u8, port: PortRef) -> Option<Self> {
        match MsgTypeName::try_from(form).ok()? {
            MsgTypeName::PORT_SEND => Some(Self::Send(port)),
            MsgTypeName::PORT_ONCE => Some(Self::Once(port)),
            MsgTypeName::PORT_RECV => Some(Self::Recv(port)),
            _ => None,
        }
    }
}

enum EntryKind {
    /// Coalesced send/receive rights.
    Normal { recv: bool, send_count: u64 },
    /// A single send-once right.
    Once,
}

struct Entry {
    port: PortRef,
    kind: EntryKind,
}

#[derive(Default)]
struct SpaceState {
    id_tree: BTreeMap<PortId, Entry>,
    /// Port identity -> name, for normal entries only.
    port_tree: BTreeMap<usize, PortId>,
}

fn port_key(p: &PortRef) -> usize {
    Arc::as_ptr(p) as usize
}

impl SpaceState {
    fn alloc_id(&self) -> KernResult<PortId> {
        let max = self
            .id_tree
            .last_key_value()
            .map(|(id, _)| id.0)
            .unwrap_or(0);
        let id = max.checked_add(1).ok_or(KernError::NoSpace)?;
        Ok(PortId(id))
    }

    fn remove_entry(&mut self, id: PortId) -> Entry {
        let e = self.id_tree.remove(&id).expect("entry vanished");
        if matches!(e.kind, EntryKind::Normal { .. }) {
            self.port_tree.remove(&port_key(&e.port));
        }
        e
    }

    /// Checks an operation's preconditions against an entry.
    ///
    /// `send_only` restricts the set to operations legal in a message
    /// header, which cannot move a receive right.
    fn check_op(&self, op: MsgTypeName, send_only: bool, id: PortId) -> bool {
        let Some(e) = self.id_tree.get(&id) else {
            return false;
        };
        match (op, &e.kind) {
            (
                MsgTypeName::CopySend | MsgTypeName::MoveSend,
                EntryKind::Normal { send_count, .. },
            ) => *send_count > 0,
            (
                MsgTypeName::MakeSend | MsgTypeName::MakeOnce,
                EntryKind::Normal { recv, .. },
            ) => *recv,
            (MsgTypeName::MoveOnce, EntryKind::Once) => true,
            (MsgTypeName::MoveRecv, EntryKind::Normal { recv, .. }) => {
                !send_only && *recv
            }
            _ => false,
        }
    }

    /// Executes an operation whose preconditions hold, yielding the
    /// right.
    fn exec_op(&mut self, op: MsgTypeName, id: PortId) -> PortRight {
        match op {
            MsgTypeName::CopySend | MsgTypeName::MakeSend => {
                let e = self.id_tree.get(&id).expect("entry vanished");
                PortRight::Send(e.port.clone())
            }
            MsgTypeName::MakeOnce => {
                let e = self.id_tree.get(&id).expect("entry vanished");
                PortRight::Once(e.port.clone())
            }
            MsgTypeName::MoveSend => {
                let (gone, port) = {
                    let e = self.id_tree.get_mut(&id).expect("entry vanished");
                    let EntryKind::Normal { recv, send_count } = &mut e.kind
                    else {
                        panic!("movesend on once entry");
                    };
                    assert!(*send_count > 0);
                    *send_count -= 1;
                    (*send_count == 0 && !*recv, e.port.clone())
                };
                if gone {
                    self.remove_entry(id);
                }
                PortRight::Send(port)
            }
            MsgTypeName::MoveOnce => {
                PortRight::Once(self.remove_entry(id).port)
            }
            MsgTypeName::MoveRecv => {
                let (gone, port) = {
                    let e = self.id_tree.get_mut(&id).expect("entry vanished");
                    let EntryKind::Normal { recv, send_count } = &mut e.kind
                    else {
                        panic!("moverecv on once entry");
                    };
                    assert!(*recv);
                    *recv = false;
                    (*send_count == 0, e.port.clone())
                };
                if gone {
                    self.remove_entry(id);
                }
                PortRight::Recv(port)
            }
            _ => panic!("unexpected right operation {op:?}"),
        }
    }

    fn insert_send_recv(&mut self, right: PortRight) -> KernResult<PortId> {
        if let Some(&id) = self.port_tree.get(&port_key(right.port())) {
            // This space already names the port: fold the right into the
            // existing entry.
            let e = self.id_tree.get_mut(&id).expect("port tree desync");
            let EntryKind::Normal { recv, send_count } = &mut e.kind else {
                panic!("once entry in the port tree");
            };
            match right {
                PortRight::Send(_) => {
                    *send_count = send_count
                        .checked_add(1)
                        .ok_or(KernError::UrefsOverflow)?;
                }
                PortRight::Recv(_) => {
                    assert!(!*recv, "second receive right for a port");
                    *recv = true;
                }
                PortRight::Once(_) => unreachable!(),
            }
            return Ok(id);
        }

        let id = self.alloc_id()?;
        let (kind, port) = match right {
            PortRight::Send(p) => {
                (EntryKind::Normal { recv: false, send_count: 1 }, p)
            }
            PortRight::Recv(p) => {
                (EntryKind::Normal { recv: true, send_count: 0 }, p)
            }
            PortRight::Once(_) => unreachable!(),
        };
        self.port_tree.insert(port_key(&port), id);
        self.id_tree.insert(id, Entry { port, kind });
        Ok(id)
    }
}

/// A task's port-name space.
#[derive(Default)]
pub struct IpcSpace {
    state: Mutex<SpaceState>,
}

impl IpcSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a right, returning the name it received. Send and receive
    /// rights coalesce with any existing entry for the same port;
    /// send-once rights always get a fresh name.
    pub fn insert(&self, right: PortRight) -> KernResult<PortId> {
        let mut st = self.state.lock();
        match right {
            PortRight::Send(_) | PortRight::Recv(_) => {
                st.insert_send_recv(right)
            }
            PortRight::Once(port) => {
                let id = st.alloc_id()?;
                // Deliberately absent from the port tree.
                st.id_tree.insert(
                    id,
                    Entry {
                        port,
                        kind: EntryKind::Once,
                    },
                );
                Ok(id)
            }
        }
    }

    /// Resolves one right by name according to `op`. Any precondition
    /// failure is `KERN_INVALID_NAME` and leaves the space unchanged.
    pub fn resolve(&self, op: MsgTypeName, id: PortId) -> KernResult<PortRight> {
        let mut st = self.state.lock();
        if !st.check_op(op, false, id) {
            return Err(KernError::InvalidName);
        }
        Ok(st.exec_op(op, id))
    }

    /// Fetches the port behind a receive right without consuming the
    /// right. This is the `msgrecv` lookup.
    pub fn resolve_receive(&self, id: PortId) -> KernResult<PortRef> {
        let st = self.state.lock();
        match st.id_tree.get(&id) {
            Some(Entry {
                port,
                kind: EntryKind::Normal { recv: true, .. },
            }) => Ok(port.clone()),
            _ => Err(KernError::InvalidName),
        }
    }

    /// Atomically resolves a message header's destination and reply
    /// rights: both succeed or the space is untouched.
    ///
    /// The same name may appear on both sides, which Mach supports with
    /// two rules beyond the obvious ones: moving the only send right
    /// twice fails, and a move paired with a copy behaves as if the move
    /// ran first against a still-present entry.
    pub fn resolve_sendmsg(
        &self,
        remty: MsgTypeName,
        remid: PortId,
        locty: Option<MsgTypeName>,
        locid: PortId,
    ) -> Result<(PortRight, Option<PortRight>), MsgIoError> {
        let mut st = self.state.lock();

        if !st.check_op(remty, true, remid) {
            return Err(MsgIoError::SendInvalidDest);
        }
        let Some(locty) = locty else {
            let rem = st.exec_op(remty, remid);
            return Ok((rem, None));
        };
        if !st.check_op(locty, true, locid) {
            return Err(MsgIoError::SendInvalidReply);
        }

        if remid == locid {
            use MsgTypeName::{CopySend, MoveOnce, MoveSend};

            if remty == MoveSend && locty == MoveSend {
                // Two user references leave the same entry; there must be
                // two to take.
                let Some(Entry {
                    kind: EntryKind::Normal { send_count, .. },
                    ..
                }) = st.id_tree.get(&remid)
                else {
                    return Err(MsgIoError::SendInvalidReply);
                };
                if *send_count < 2 {
                    return Err(MsgIoError::SendInvalidReply);
                }
            }
            if remty == MoveOnce && locty == MoveOnce {
                // A send-once right moves, as the name implies, once.
                return Err(MsgIoError::SendInvalidReply);
            }
            if (remty == MoveSend && locty == CopySend)
                || (remty == CopySend && locty == MoveSend)
            {
                // The move runs first but the copy still observes the
                // entry, so removal is deferred until both are out.
                let e = st.id_tree.get_mut(&remid).expect("entry vanished");
                let EntryKind::Normal { recv, send_count } = &mut e.kind
                else {
                    panic!("movesend on once entry");
                };
                *send_count -= 1;
                let gone = *send_count == 0 && !*recv;
                let rem = PortRight::Send(e.port.clone());
                let loc = PortRight::Send(e.port.clone());
                if gone {
                    st.remove_entry(remid);
                }
                return Ok((rem, Some(loc)));
            }
        }

        // Any remaining combination is safe to run in either order.
        let loc = st.exec_op(locty, locid);
        let rem = st.exec_op(remty, remid);
        Ok((rem, Some(loc)))
    }

    /// Name this space uses for `port`, or the null name. Only the
    /// coalesced send/receive entries are indexed.
    pub fn lookup(&self, port: &PortRef) -> PortId {
        let st = self.state.lock();
        st.port_tree
            .get(&port_key(port))
            .copied()
            .unwrap_or(PortId::NULL)
    }

    /// Snapshot of an entry for diagnostics: `(is_once, send_count,
    /// recv)`.
    pub fn entry_info(&self, id: PortId) -> Option<(bool, u64, bool)> {
        let st = self.state.lock();
        st.id_tree.get(&id).map(|e| match &e.kind {
            EntryKind::Once => (true, 0, false),
            EntryKind::Normal { recv, send_count } => {
                (false, *send_count, *recv)
            }
        })
    }

    /// Number of entries in the space.
    pub fn len(&self) -> usize {
        self.state.lock().id_tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Installs an entry at a caller-chosen name. Test scaffolding for
    /// exhaustion scenarios.
    #[cfg(test)]
    pub(crate) fn insert_at(&self, id: PortId, right: PortRight) {
        let mut st = self.state.lock();
        let (kind, port) = match right {
            PortRight::Send(p) => {
                (EntryKind::Normal { recv: false, send_count: 1 }, p)
            }
            PortRight::Recv(p) => {
                (EntryKind::Normal { recv: true, send_count: 0 }, p)
            }
            PortRight::Once(p) => (EntryKind::Once, p),
        };
        if matches!(kind, EntryKind::Normal { .. }) {
            st.port_tree.insert(port_key(&port), id);
        }
        st.id_tree.insert(id, Entry { port, kind });
    }
}
