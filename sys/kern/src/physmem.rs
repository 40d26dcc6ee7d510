// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Physical memory handling.
//!
//! At boot the kernel drains every frame out of the platform's boot
//! allocator, builds a `Frame` record for each one, and switches to its own
//! list-based allocator. Each frame is typed, and cached frames
//! additionally carry their memory-cache classification (see
//! [`crate::memcache`]).
//!
//! A slice of RAM is held back as a reserve for kernel allocations made
//! when memory is low; freed frames refill the reserve before returning to
//! the general free list.

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::{Mutex, Once, RwLock};

use crate::hal::{hal, Pfn};
use crate::memcache::PageClass;

/// RAM reserved for kernel allocation when memory is low.
///
/// This is the maximum amount; the effective reserve is the minimum of this
/// and 1/16th of total RAM.
pub const RESERVED_MEMORY: usize = 16 * 1024 * 1024;

/// Allocation state of one physical frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameKind {
    /// Not yet seen, or allocated before the hand-off from the boot
    /// allocator.
    Unknown,
    /// Held in the low-memory reserve.
    Reserved,
    /// Immediately available for allocation.
    Free,
    /// Available, but still holding working-set data.
    Standby,
    /// Contents must reach a pager before the frame can be reused.
    Modified,
    /// Actively used by a working set (user-visible memory).
    Working,
    /// Allocated by the kernel itself.
    System,
    /// Not RAM, or firmware-owned.
    NonRam,
}

/// Per-frame record.
#[derive(Debug)]
pub struct Frame {
    pub kind: FrameKind,
    /// Memory-cache classification, for frames backing cache objects.
    pub class: Option<PageClass>,
}

impl Frame {
    const fn new() -> Self {
        Self {
            kind: FrameKind::Unknown,
            class: None,
        }
    }
}

type FrameSlot = Mutex<Frame>;

/// Frame records are grouped into page-sized tables indexed by PFN, so the
/// database grows in page steps and leaves holes for non-RAM ranges.
const NUM_ENTRIES: usize = abi::PAGE_SIZE / core::mem::size_of::<FrameSlot>();

fn l1_off(pfn: Pfn) -> usize {
    pfn as usize / NUM_ENTRIES
}

fn l0_off(pfn: Pfn) -> usize {
    pfn as usize % NUM_ENTRIES
}

struct PhysMem {
    db: RwLock<Vec<Option<Box<[FrameSlot; NUM_ENTRIES]>>>>,
    free: Mutex<Vec<Pfn>>,
    reserved: Mutex<Vec<Pfn>>,
    reserve_target: usize,
}

static PHYSMEM: Once<PhysMem> = Once::new();

fn physmem() -> &'static PhysMem {
    PHYSMEM.get().expect("physmem not initialized")
}

fn new_table() -> Box<[FrameSlot; NUM_ENTRIES]> {
    Box::new(core::array::from_fn(|_| Mutex::new(Frame::new())))
}

/// Runs `f` against the frame record for `pfn`, creating the record on
/// first touch.
pub fn with_frame<R>(pfn: Pfn, f: impl FnOnce(&mut Frame) -> R) -> R {
    let pm = physmem();
    debug_assert!(pfn <= hal().max_pfn());

    {
        let db = pm.db.read();
        if let Some(Some(table)) = db.get(l1_off(pfn)) {
            return f(&mut table[l0_off(pfn)].lock());
        }
    }

    let mut db = pm.db.write();
    let l1 = l1_off(pfn);
    if db.len() <= l1 {
        db.resize_with(l1 + 1, || None);
    }
    let table = db[l1].get_or_insert_with(new_table);
    let result = f(&mut table[l0_off(pfn)].lock());
    result
}

/// Reads the current kind of a frame.
pub fn frame_kind(pfn: Pfn) -> FrameKind {
    with_frame(pfn, |fr| fr.kind)
}

fn reserve_needs_refill(pm: &PhysMem) -> bool {
    pm.reserved.lock().len() < pm.reserve_target
}

/// Takes ownership of all boot memory and builds the frame database.
///
/// Called once at startup, before any other allocation.
pub fn init() {
    let mut all = Vec::new();
    while let Some(pfn) = hal().frame_alloc() {
        all.push(pfn);
    }

    let reserve_target =
        (RESERVED_MEMORY / abi::PAGE_SIZE).min(all.len() / 16);

    PHYSMEM.call_once(|| PhysMem {
        db: RwLock::new(Vec::new()),
        free: Mutex::new(Vec::new()),
        reserved: Mutex::new(Vec::new()),
        reserve_target,
    });

    let pm = physmem();
    for (i, pfn) in all.into_iter().enumerate() {
        if i < reserve_target {
            with_frame(pfn, |fr| fr.kind = FrameKind::Reserved);
            pm.reserved.lock().push(pfn);
        } else {
            with_frame(pfn, |fr| fr.kind = FrameKind::Free);
            pm.free.lock().push(pfn);
        }
    }

    log::info!(
        "physmem: {} KiB reserved, {} KiB available",
        (pm.reserved.lock().len() * abi::PAGE_SIZE) >> 10,
        (pm.free.lock().len() * abi::PAGE_SIZE) >> 10,
    );
}

fn take_frame(mayfail: bool) -> Option<Pfn> {
    let pm = physmem();

    if let Some(pfn) = pm.free.lock().pop() {
        debug_assert_eq!(frame_kind(pfn), FrameKind::Free);
        return Some(pfn);
    }
    if mayfail {
        return None;
    }

    log::warn!("physmem: using reserved memory");
    let pfn = pm.reserved.lock().pop()?;
    debug_assert_eq!(frame_kind(pfn), FrameKind::Reserved);
    Some(pfn)
}

/// Allocates a zeroed frame for kernel use.
///
/// With `mayfail` false the allocation may dip into the low-memory
/// reserve; that mode is for allocations the kernel cannot recover from
/// losing.
pub fn alloc_kernel(mayfail: bool) -> Option<Pfn> {
    let pfn = take_frame(mayfail)?;
    with_frame(pfn, |fr| fr.kind = FrameKind::System);
    hal().frame_zero(pfn);
    Some(pfn)
}

/// Allocates a zeroed frame destined for user-visible memory. Never dips
/// into the reserve.
pub fn alloc_user() -> Option<Pfn> {
    let pfn = take_frame(true)?;
    with_frame(pfn, |fr| fr.kind = FrameKind::Working);
    hal().frame_zero(pfn);
    Some(pfn)
}

/// Returns a frame to the allocator, refilling the reserve first when it
/// is below target.
pub fn free_frame(pfn: Pfn) {
    let pm = physmem();

    with_frame(pfn, |fr| {
        assert!(matches!(
            fr.kind,
            FrameKind::System | FrameKind::Working | FrameKind::Unknown
        ));
        fr.class = None;
        fr.kind = FrameKind::Unknown;
    });

    if reserve_needs_refill(pm) {
        with_frame(pfn, |fr| fr.kind = FrameKind::Reserved);
        pm.reserved.lock().push(pfn);
    } else {
        with_frame(pfn, |fr| fr.kind = FrameKind::Free);
        pm.free.lock().push(pfn);
    }
}

/// Number of frames currently on the free list.
pub fn free_pages() -> usize {
    physmem().free.lock().len()
}

/// Number of frames currently held in reserve.
pub fn reserved_pages() -> usize {
    physmem().reserved.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn alloc_free_round_trip() {
        test_support::boot();

        let pfn = alloc_kernel(true).unwrap();
        assert_eq!(frame_kind(pfn), FrameKind::System);
        free_frame(pfn);
        assert!(matches!(
            frame_kind(pfn),
            FrameKind::Free | FrameKind::Reserved
        ));
    }

    #[test]
    fn user_frames_are_typed_and_zeroed() {
        test_support::boot();

        let pfn = alloc_user().unwrap();
        assert_eq!(frame_kind(pfn), FrameKind::Working);
        let mut buf = [0xffu8; 32];
        crate::hal::hal().frame_read(pfn, 0, &mut buf);
        assert_eq!(buf, [0u8; 32]);
        free_frame(pfn);
    }

    #[test]
    fn reserve_refills_before_free_list() {
        test_support::boot();

        // Pull a frame straight out of the reserve, then free a kernel
        // frame: the free must land in the reserve, not the free list.
        let stolen = {
            let pm = physmem();
            pm.reserved.lock().pop().unwrap()
        };
        with_frame(stolen, |fr| fr.kind = FrameKind::System);

        let before = reserved_pages();
        free_frame(stolen);
        assert_eq!(reserved_pages(), before + 1);
        assert_eq!(frame_kind(stolen), FrameKind::Reserved);
    }
}
