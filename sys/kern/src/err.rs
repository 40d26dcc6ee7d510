// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.

use abi::KernError;

/// Outcome of a kernel primitive that may block.
///
/// Primitives that would have to wait (a send on a full queue, a receive on
/// an empty one) do not sleep inline. They enroll the calling thread in a
/// wait queue, return `Retry`, and let the syscall layer re-drive the whole
/// operation after the thread is resumed. `Retry` therefore means "the
/// caller is now queued"; its wire encoding is `KernError::Retry`.
///
/// This is marked `must_use` because dropping a `Retry` on the floor leaves
/// a thread parked in a wait queue with nobody re-driving it.
#[derive(Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum Progress<T> {
    /// The operation ran to completion with the given result.
    Done(T),
    /// The calling thread was enrolled in a wait queue; re-run the
    /// operation once it resumes.
    Retry,
}

impl<T> Progress<T> {
    /// Extracts the completed result, if there is one.
    pub fn done(self) -> Option<T> {
        match self {
            Self::Done(v) => Some(v),
            Self::Retry => None,
        }
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry)
    }
}

/// Why a page fault could not be resolved.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultError {
    /// The access exceeded the region's current protection.
    Protection,
    /// The page is in a transient pager state (paging in or out, or resident
    /// only in backing store). No pager protocol is wired up, so callers
    /// surface this as an unresolved fault.
    Transient,
    /// No frame could be allocated to satisfy the fault.
    Shortage,
}

impl From<FaultError> for KernError {
    fn from(e: FaultError) -> Self {
        match e {
            FaultError::Protection => KernError::ProtectionFailure,
            FaultError::Transient => KernError::MemoryError,
            FaultError::Shortage => KernError::ResourceShortage,
        }
    }
}
