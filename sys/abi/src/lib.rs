// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and applications.
//!
//! Everything in this crate is part of the contract between the kernel and
//! user programs: port names, message headers, message-type codes, option
//! bits, the error space, syscall numbers, and the virtual-memory layout
//! constants. The kernel crate re-exports nothing from here; user-side
//! libraries and generated stubs depend on this crate directly.

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Name of a port right within one task's port-name space.
///
/// Names are plain integers, private to the task that holds them; the same
/// port typically has different names in different tasks. Name `0` is
/// reserved as the null name and `PortId::DEAD` marks names whose port has
/// died.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Default,
    Serialize, Deserialize, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(transparent)]
pub struct PortId(pub u64);

impl PortId {
    /// The null port name. Never names a right.
    pub const NULL: Self = Self(0);
    /// Distinguished value for names whose backing port has died.
    pub const DEAD: Self = Self(!0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// The shape of a port right, as named by `port_allocate` and friends.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum PortRightKind {
    Send = 0,
    Receive = 1,
    SendOnce = 2,
    PortSet = 3,
    DeadName = 4,
}

impl TryFrom<u64> for PortRightKind {
    type Error = ();

    fn try_from(v: u64) -> Result<Self, ()> {
        match v {
            0 => Ok(Self::Send),
            1 => Ok(Self::Receive),
            2 => Ok(Self::SendOnce),
            3 => Ok(Self::PortSet),
            4 => Ok(Self::DeadName),
            _ => Err(()),
        }
    }
}

/// Message-type codes, used both for the two port rights carried in a
/// message header and for inline typed descriptors.
///
/// The port-right subrange (`MoveRecv..=MakeOnce`) doubles as the encoding
/// of a right's *received* form: a moved, copied, or made send right is
/// reported to the receiver as `PORT_SEND`, a send-once right as
/// `PORT_ONCE`, a moved receive right as `PORT_RECV`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MsgTypeName {
    /// Unstructured data; also bit and boolean.
    Unstructured = 0,
    Int16 = 1,
    Int32 = 2,
    Char = 8,
    Byte = 9,
    Real = 10,
    Int64 = 11,
    CString = 12,
    /// A port name with no right attached.
    PortName = 15,
    MoveRecv = 16,
    MoveSend = 17,
    MoveOnce = 18,
    CopySend = 19,
    MakeSend = 20,
    MakeOnce = 21,
    /// Wildcard used by stub generators; never valid on the wire.
    Polymorphic = 0xff,
}

impl MsgTypeName {
    /// Received form of a receive right.
    pub const PORT_RECV: Self = Self::MoveRecv;
    /// Received form of any send right.
    pub const PORT_SEND: Self = Self::MoveSend;
    /// Received form of a send-once right.
    pub const PORT_ONCE: Self = Self::MoveOnce;

    /// True if this code transfers a port right.
    pub fn is_port(&self) -> bool {
        matches!(
            self,
            Self::MoveRecv
                | Self::MoveSend
                | Self::MoveOnce
                | Self::CopySend
                | Self::MakeSend
                | Self::MakeOnce
        )
    }

    /// True if this code produces a send or send-once right, i.e. one that
    /// can name the destination or reply port of a message.
    pub fn is_send(&self) -> bool {
        self.is_port() && *self != Self::MoveRecv
    }
}

impl TryFrom<u8> for MsgTypeName {
    type Error = ();

    fn try_from(v: u8) -> Result<Self, ()> {
        match v {
            0 => Ok(Self::Unstructured),
            1 => Ok(Self::Int16),
            2 => Ok(Self::Int32),
            8 => Ok(Self::Char),
            9 => Ok(Self::Byte),
            10 => Ok(Self::Real),
            11 => Ok(Self::Int64),
            12 => Ok(Self::CString),
            15 => Ok(Self::PortName),
            16 => Ok(Self::MoveRecv),
            17 => Ok(Self::MoveSend),
            18 => Ok(Self::MoveOnce),
            19 => Ok(Self::CopySend),
            20 => Ok(Self::MakeSend),
            21 => Ok(Self::MakeOnce),
            0xff => Ok(Self::Polymorphic),
            _ => Err(()),
        }
    }
}

/// The `bits` word of a message header.
///
/// Layout: low 8 bits describe the right attached to the remote (i.e.
/// destination, on send) port; the next 8 bits describe the right attached
/// to the local (reply) port; bit 19 flags a complex message carrying typed
/// descriptors in its body.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Default,
    FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(transparent)]
pub struct MsgBits(pub u32);

impl MsgBits {
    pub const REMOTE_MASK: u32 = 0x000ff;
    pub const LOCAL_MASK: u32 = 0x0ff00;
    pub const COMPLEX: u32 = 0x80000;

    /// Composes a bits word from raw remote and local type codes.
    pub const fn compose(remote: u8, local: u8) -> Self {
        Self(remote as u32 | ((local as u32) << 8))
    }

    /// Raw type code of the remote-port right.
    pub const fn remote(&self) -> u8 {
        (self.0 & Self::REMOTE_MASK) as u8
    }

    /// Raw type code of the local-port right.
    pub const fn local(&self) -> u8 {
        ((self.0 & Self::LOCAL_MASK) >> 8) as u8
    }

    pub const fn complex(&self) -> bool {
        self.0 & Self::COMPLEX != 0
    }
}

/// Wire representation of a message header: six fields, 64-bit
/// little-endian layout, 40 bytes total.
///
/// On send, `remote` names the destination right and `local` optionally
/// names the caller's reply right. On receive the kernel rewrites both: the
/// receiver sees its own name for the receive port in `local` and a fresh
/// name for the sender's reply right in `remote`.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq,
    FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct MsgHeader {
    pub bits: MsgBits,
    pub size: u32,
    pub remote: PortId,
    pub local: PortId,
    pub seqno: u64,
    pub msgid: u64,
}

/// Header size in bytes; every legal message is at least this long.
pub const MSG_HEADER_SIZE: usize = core::mem::size_of::<MsgHeader>();
const_assert_eq!(MSG_HEADER_SIZE, 40);

bitflags::bitflags! {
    /// Options accepted by `msgsend`/`msgrecv`.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct MsgOpt: u32 {
        const SEND_TIMEOUT = 0x010;
        const SEND_NOTIFY = 0x020;
        const SEND_CANCEL = 0x080;
        const RECV_TIMEOUT = 0x100;
        const RECV_NOTIFY = 0x200;
    }
}

/// Timeout argument meaning "block forever".
pub const MSG_TIMEOUT_NONE: u64 = 0;

bitflags::bitflags! {
    /// Virtual-memory protection bits.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct VmProt: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXECUTE = 4;
        /// Used by lock requests to mean "leave protection alone".
        const NO_CHANGE = 8;
    }
}

impl VmProt {
    pub const DEFAULT: Self = Self::READ.union(Self::WRITE);
    pub const ALL: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE);
}

/// Region inheritance codes, reported by `vm_region`.
pub const VM_INHERIT_SHARE: u32 = 0;
pub const VM_INHERIT_COPY: u32 = 1;
pub const VM_INHERIT_NONE: u32 = 2;
pub const VM_INHERIT_DEFAULT: u32 = VM_INHERIT_COPY;

// --------------------------------------------------------------------------
// Error space.
//
// Errors are 32-bit values split as  | system(6) | subsystem(12) | code(14) |.
// Plain kernel return codes live in system 0, subsystem 0.
// --------------------------------------------------------------------------

/// Builds the system field of an error value.
pub const fn err_system(s: u32) -> u32 {
    (s & 0x3f) << 26
}

/// Builds the subsystem field of an error value.
pub const fn err_sub(s: u32) -> u32 {
    (s & 0xfff) << 14
}

pub const fn err_get_system(e: u32) -> u32 {
    (e >> 26) & 0x3f
}

pub const fn err_get_sub(e: u32) -> u32 {
    (e >> 14) & 0xfff
}

pub const fn err_get_code(e: u32) -> u32 {
    e & 0x3fff
}

/// Error systems in use.
pub const ERR_KERN: u32 = err_system(0x00);
pub const ERR_US: u32 = err_system(0x01);
pub const ERR_SERVER: u32 = err_system(0x02);
pub const ERR_IPC: u32 = err_system(0x04);
pub const ERR_BOOTSTRAP: u32 = err_system(0x05);
pub const ERR_LOCAL: u32 = err_system(0x3e);
pub const ERR_MAX_SYSTEM: u32 = 0x3f;

/// Kernel return codes.
///
/// `KERN_SUCCESS` (zero) is represented by `Ok(..)`; everything here is a
/// failure. The numeric values are ABI and match the classic Mach
/// assignments.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum KernError {
    InvalidAddress = 1,
    ProtectionFailure = 2,
    NoSpace = 3,
    InvalidArgument = 4,
    Failure = 5,
    ResourceShortage = 6,
    NotReceiver = 7,
    NoAccess = 8,
    MemoryFailure = 9,
    MemoryError = 10,
    NotInSet = 12,
    NameExists = 13,
    Aborted = 14,
    InvalidName = 15,
    InvalidTask = 16,
    InvalidRight = 17,
    InvalidValue = 18,
    UrefsOverflow = 19,
    InvalidCapability = 20,
    RightExists = 21,
    InvalidHost = 22,
    MemoryPresent = 23,

    /// The calling thread has been queued; re-run the operation on wake.
    Retry = 100,
    /// A timed wait expired.
    ThreadTimedOut = 101,
}

pub type KernResult<T> = Result<T, KernError>;

/// Maps a kernel result onto its wire representation, where zero is
/// success.
pub fn kern_return<T>(r: KernResult<T>) -> i32 {
    match r {
        Ok(_) => 0,
        Err(e) => e as i32,
    }
}

/// Message-I/O return codes for `msgsend` and `msgrecv`.
///
/// Send-side errors count up from `0x1000_0001`, receive-side errors from
/// `0x1000_4001`; success is zero (`Ok`).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum MsgIoError {
    SendInProgress = 0x1000_0001,
    SendInvalidData = 0x1000_0002,
    SendInvalidDest = 0x1000_0003,
    SendTimedOut = 0x1000_0004,
    SendWillNotify = 0x1000_0005,
    SendNotifyInProgress = 0x1000_0006,
    SendInterrupted = 0x1000_0007,
    SendMsgTooSmall = 0x1000_0008,
    SendInvalidReply = 0x1000_0009,
    SendInvalidRight = 0x1000_000a,
    SendInvalidNotify = 0x1000_000b,
    SendInvalidMemory = 0x1000_000c,
    SendNoBuffer = 0x1000_000d,
    SendNoNotify = 0x1000_000e,
    SendInvalidType = 0x1000_000f,
    SendInvalidHeader = 0x1000_0010,

    RcvInProgress = 0x1000_4001,
    RcvInvalidName = 0x1000_4002,
    RcvTimedOut = 0x1000_4003,
    RcvTooLarge = 0x1000_4004,
    RcvInterrupted = 0x1000_4005,
    RcvPortChanged = 0x1000_4006,
    RcvInvalidNotify = 0x1000_4007,
    RcvInvalidData = 0x1000_4008,
    RcvPortDied = 0x1000_4009,
    RcvInSet = 0x1000_400a,
    RcvHeaderError = 0x1000_400b,
    RcvBodyError = 0x1000_400c,
}

pub type MsgIoResult<T> = Result<T, MsgIoError>;

/// Class bits a kernel demux may OR into a message-I/O error to locate the
/// failure.
pub const MSGIO_MSG_MASK: u32 = 0x0000_3c00;
pub const MSGIO_MSG_IPC_SPACE: u32 = 0x0000_2000;
pub const MSGIO_MSG_VM_SPACE: u32 = 0x0000_1000;
pub const MSGIO_MSG_IPC_KERNEL: u32 = 0x0000_0800;
pub const MSGIO_MSG_VM_KERNEL: u32 = 0x0000_0400;

/// Maps a message-I/O result onto its wire representation.
pub fn msgio_return<T>(r: MsgIoResult<T>) -> u32 {
    match r {
        Ok(_) => 0,
        Err(e) => e as u32,
    }
}

// --------------------------------------------------------------------------
// Syscall numbers.
//
// Syscall numbers are negative longs; positive values are reserved for
// debugging entry points.
// --------------------------------------------------------------------------

pub const SYS_MSGBUF: i64 = -1;
pub const SYS_MSGSEND: i64 = -20;
pub const SYS_MSGRECV: i64 = -21;
pub const SYS_REPLY_PORT: i64 = -26;
pub const SYS_TASK_SELF: i64 = -27;
pub const SYS_VM_REGION: i64 = -63;
pub const SYS_VM_MAP: i64 = -64;
pub const SYS_VM_ALLOCATE: i64 = -65;
pub const SYS_VM_DEALLOCATE: i64 = -66;
pub const SYS_PORT_ALLOCATE: i64 = -72;

/// Out-parameters of `vm_region`, exchanged through the caller's message
/// buffer.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct VmRegionInfo {
    pub addr: u64,
    pub size: u64,
    pub curprot: u32,
    pub maxprot: u32,
    pub inherit: u32,
    pub shared: bool,
    pub objname: PortId,
    pub off: u64,
}

/// In-parameters of `vm_map`, exchanged through the caller's message
/// buffer.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct VmMapArgs {
    pub addr: u64,
    pub size: u64,
    pub mask: u64,
    pub anywhere: bool,
    pub objname: PortId,
    pub off: u64,
    pub copy: bool,
    pub curprot: u32,
    pub maxprot: u32,
    pub inherit: u32,
}

// --------------------------------------------------------------------------
// Virtual-memory layout.
// --------------------------------------------------------------------------

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        /// Maximum user address. 42-bit user spaces on 64-bit targets.
        pub const VM_ADDR_MAX: u64 = 0x3ff_ffff_f000;
        /// Maximum threads per task.
        pub const MAX_THREADS: usize = 64 * 1024;
        /// Maximum ports per task.
        pub const MAX_PORTS: usize = 1024;
    } else {
        /// Maximum user address.
        pub const VM_ADDR_MAX: u64 = 0xbfff_f000;
        /// Maximum threads per task.
        pub const MAX_THREADS: usize = 1024;
        /// Maximum ports per task.
        pub const MAX_PORTS: usize = 128;
    }
}

/// Size of a per-thread shared message buffer. One page, by construction of
/// the msgbuf zone.
pub const MSGBUF_SHIFT: usize = PAGE_SHIFT;
pub const MSGBUF_SIZE: usize = 1 << MSGBUF_SHIFT;

/// The message-buffer zone occupies a fixed range at the top of the address
/// space, one slot per possible thread.
pub const VM_MAP_MSGBUF_END: u64 = VM_ADDR_MAX;
pub const VM_MAP_MSGBUF_START: u64 =
    VM_ADDR_MAX - (MAX_THREADS * MSGBUF_SIZE) as u64;

/// Legal user addresses, exclusive of the msgbuf zone and its guard page.
pub const VM_MAP_USER_START: u64 = 0x1000;
pub const VM_MAP_USER_END: u64 = VM_MAP_MSGBUF_START - PAGE_SIZE as u64;
pub const VM_MAP_USER_SIZE: u64 = VM_MAP_USER_END - VM_MAP_USER_START;
