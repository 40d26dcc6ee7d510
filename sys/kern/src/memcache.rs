// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The physical memory cache.
//!
//! Frames backing cache objects are classified three ways. Private frames
//! belong to exactly one cache object and may be written. Read-only-shared
//! frames are referenced by several cache objects and carry the list of
//! `(object, offset)` back-pointers; they must stay read-only, and a write
//! unshares them into a fresh private copy. The zero frame is a single
//! permanent read-only page of zeroes; being permanent, its referencing
//! objects are not tracked.

use alloc::vec::Vec;

use abi::VmProt;
use spin::Once;

use crate::cacheobj::{CacheObj, CacheObjId};
use crate::hal::{hal, Pfn};
use crate::physmem;

/// Memory-cache classification of a frame, stored in its
/// [`physmem::Frame`] record.
#[derive(Clone, Debug)]
pub enum PageClass {
    /// The permanent zero page.
    ZeroShared,
    /// Shared read-only; `links` lists every `(object, offset)` viewing it.
    RoShared { links: Vec<(CacheObjId, u64)> },
    /// Owned and writable by a single cache object.
    Private { cobj: CacheObjId, off: u64 },
}

static ZERO_PFN: Once<Pfn> = Once::new();

/// Creates the permanent zero page. Called once at startup.
pub fn init() {
    ZERO_PFN.call_once(|| {
        let pfn = physmem::alloc_kernel(false)
            .expect("no memory for the zero page at boot");
        physmem::with_frame(pfn, |fr| fr.class = Some(PageClass::ZeroShared));
        pfn
    });
}

/// The permanent shared page of zeroes.
pub fn zero_pfn() -> Pfn {
    *ZERO_PFN.get().expect("memcache not initialized")
}

fn new_private(cobj: &CacheObj, off: u64) -> Option<Pfn> {
    let pfn = physmem::alloc_user()?;
    physmem::with_frame(pfn, |fr| {
        fr.class = Some(PageClass::Private {
            cobj: cobj.id(),
            off,
        })
    });
    Some(pfn)
}

/// Resolves a fault on a never-seen page by installing zeroes.
///
/// Read faults share the permanent zero page read-only; write faults get a
/// fresh private zero frame. Returns the installed frame, or `None` on
/// memory exhaustion.
pub fn zeropage_new(
    cobj: &CacheObj,
    off: u64,
    roshared: bool,
    protmask: VmProt,
) -> Option<Pfn> {
    let pfn = if roshared {
        zero_pfn()
    } else {
        new_private(cobj, off)?
    };
    cobj.map(off, pfn, roshared, protmask);
    Some(pfn)
}

/// Shares an existing frame read-only into `cobj` at `off`, registering the
/// back-pointer. Used when a fault is satisfied by a page found further
/// down a shadow chain.
pub fn share(pfn: Pfn, cobj: &CacheObj, off: u64, protmask: VmProt) {
    physmem::with_frame(pfn, |fr| match &mut fr.class {
        Some(PageClass::ZeroShared) => (),
        Some(PageClass::RoShared { links }) => links.push((cobj.id(), off)),
        Some(PageClass::Private {
            cobj: owner,
            off: owner_off,
        }) => {
            // First additional viewer: the frame graduates to shared.
            let links = alloc::vec![(*owner, *owner_off), (cobj.id(), off)];
            fr.class = Some(PageClass::RoShared { links });
        }
        None => panic!("sharing unclassified frame {pfn:#x}"),
    });
    cobj.map(off, pfn, true, protmask);
}

/// Reclassifies a private frame as read-only-shared, keeping its owner as
/// the first link. Used when an object is put behind a shadow copy.
pub fn make_shared(pfn: Pfn, cobj: CacheObjId, off: u64) {
    physmem::with_frame(pfn, |fr| match &mut fr.class {
        Some(PageClass::Private { .. }) | None => {
            fr.class = Some(PageClass::RoShared {
                links: alloc::vec![(cobj, off)],
            });
        }
        Some(PageClass::RoShared { links }) => {
            if !links.contains(&(cobj, off)) {
                links.push((cobj, off));
            }
        }
        Some(PageClass::ZeroShared) => (),
    });
}

/// Replaces a shared frame with a private copy so `cobj` can write it.
///
/// The zero page unshares into a fresh zero frame; a read-only-shared frame
/// is copied and `cobj`'s back-pointer moves to the copy. Returns the new
/// private frame, or `None` on memory exhaustion.
pub fn unshare(
    pfn: Pfn,
    cobj: &CacheObj,
    off: u64,
    protmask: VmProt,
) -> Option<Pfn> {
    enum Source {
        Zero,
        Copy,
    }

    let src = physmem::with_frame(pfn, |fr| match &mut fr.class {
        Some(PageClass::ZeroShared) => Source::Zero,
        Some(PageClass::RoShared { links }) => {
            links.retain(|l| *l != (cobj.id(), off));
            Source::Copy
        }
        Some(PageClass::Private { .. }) => {
            panic!("can't unshare private frame {pfn:#x}")
        }
        None => panic!("unsharing unclassified frame {pfn:#x}"),
    });

    let new = new_private(cobj, off)?;
    if let Source::Copy = src {
        hal().frame_copy(new, pfn);
        release_if_unreferenced(pfn);
    }
    cobj.map(off, new, false, protmask);
    Some(new)
}

/// Duplicates a resident frame into a private copy for `cobj` at `off`.
/// Used when a write fault is satisfied from a shadow's page.
pub fn copy_private(
    src: Pfn,
    cobj: &CacheObj,
    off: u64,
    protmask: VmProt,
) -> Option<Pfn> {
    let new = new_private(cobj, off)?;
    hal().frame_copy(new, src);
    cobj.map(off, new, false, protmask);
    Some(new)
}

/// Drops `cobj`'s claim on a frame at object teardown, freeing the frame
/// once nothing references it.
pub fn release(pfn: Pfn, cobj: CacheObjId, off: u64, roshared: bool) {
    if roshared {
        let gone = physmem::with_frame(pfn, |fr| match &mut fr.class {
            Some(PageClass::ZeroShared) => false,
            Some(PageClass::RoShared { links }) => {
                links.retain(|l| *l != (cobj, off));
                links.is_empty()
            }
            _ => false,
        });
        if gone {
            physmem::free_frame(pfn);
        }
    } else {
        physmem::free_frame(pfn);
    }
}

fn release_if_unreferenced(pfn: Pfn) {
    let free = physmem::with_frame(pfn, |fr| {
        matches!(&fr.class, Some(PageClass::RoShared { links }) if links.is_empty())
    });
    if free {
        physmem::free_frame(pfn);
    }
}
