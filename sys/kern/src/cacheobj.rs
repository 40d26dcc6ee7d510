// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cache objects.
//!
//! A cache object is the offset-to-frame map backing a VM object: a sparse
//! [`Imap`] plus the list of user mappings currently viewing the object.
//! Updating an entry atomically updates or invalidates those user mappings,
//! so page tables can never disagree with the cache for longer than one
//! commit.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use abi::VmProt;
use spin::RwLock;

use crate::hal::{hal, Pfn, UmapId};
use crate::imap::{Imap, Ipte};
use crate::memcache;

/// Stable identity of a cache object, used by the physical-page records to
/// point back at the objects referencing a shared frame without holding
/// them alive.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct CacheObjId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// One user mapping of a cache object: `size` bytes of the object starting
/// at `off`, visible at `start` in the page table `umap`, never with more
/// access than `prot`.
#[derive(Clone, Debug)]
pub struct CacheObjMapping {
    pub umap: UmapId,
    pub start: u64,
    pub size: u64,
    pub off: u64,
    pub prot: VmProt,
}

impl CacheObjMapping {
    fn covers(&self, off: u64) -> bool {
        off >= self.off && off < self.off + self.size
    }

    fn va_of(&self, off: u64) -> u64 {
        self.start + (off - self.off)
    }
}

struct CacheObjState {
    map: Imap,
    mappings: Vec<CacheObjMapping>,
}

pub struct CacheObj {
    id: CacheObjId,
    size: u64,
    state: RwLock<CacheObjState>,
}

impl CacheObj {
    pub fn new(size: u64) -> Self {
        Self {
            id: CacheObjId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            size,
            state: RwLock::new(CacheObjState {
                map: Imap::new(),
                mappings: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> CacheObjId {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Enrolls a user mapping of this object.
    pub fn add_mapping(&self, m: CacheObjMapping) {
        self.state.write().mappings.push(m);
    }

    /// Removes the mapping identified by `(umap, start)` and drops every
    /// page-table entry it contributed.
    pub fn del_mapping(&self, umap: UmapId, start: u64) {
        let mut st = self.state.write();
        let Some(pos) = st
            .mappings
            .iter()
            .position(|m| m.umap == umap && m.start == start)
        else {
            return;
        };
        let m = st.mappings.swap_remove(pos);
        let mut va = m.start;
        while va < m.start + m.size {
            hal().umap_unmap(m.umap, va);
            va += abi::PAGE_SIZE as u64;
        }
        hal().umap_commit(m.umap);
    }

    /// Number of enrolled mappings. Diagnostic.
    pub fn mapping_count(&self) -> usize {
        self.state.read().mappings.len()
    }

    /// True if `(umap, start)` is enrolled exactly once.
    pub fn has_mapping(&self, umap: UmapId, start: u64) -> bool {
        self.state
            .read()
            .mappings
            .iter()
            .filter(|m| m.umap == umap && m.start == start)
            .count()
            == 1
    }

    /// Installs a frame at `off`, returning the previous entry.
    ///
    /// If this replaces a present entry with a different frame, every user
    /// mapping of `off` is invalidated before the update becomes visible.
    /// If the new frame is read-only-shared, user mappings are refreshed
    /// with `protmask` intersected with each mapping's own allowance, minus
    /// write.
    pub fn map(
        &self,
        off: u64,
        pfn: Pfn,
        roshared: bool,
        protmask: VmProt,
    ) -> Ipte {
        let mut st = self.state.write();
        let old = st.map.map(off, Ipte::page(pfn, roshared, protmask));

        let invalidate = old.present() && old.pfn() != pfn;
        for m in &st.mappings {
            if !m.covers(off) {
                continue;
            }
            let va = m.va_of(off);
            if invalidate {
                hal().umap_unmap(m.umap, va);
            }
            if roshared {
                let prot = (protmask & m.prot) - VmProt::WRITE;
                hal().umap_map(m.umap, va, pfn, prot);
            }
            hal().umap_commit(m.umap);
        }
        old
    }

    /// Fetches the entry at `off`.
    pub fn lookup(&self, off: u64) -> Ipte {
        self.state.read().map.lookup(off)
    }

    /// Prepares `orig` for copy-on-write against a freshly created shadow
    /// object `dst`.
    ///
    /// Every resident private page of `orig` is downgraded to
    /// read-only-shared: its entry gains the shared flag, every user
    /// mapping of it loses write access, and its frame record switches to
    /// the shared class. `dst` starts out empty and populates lazily
    /// through the shadow chain.
    pub fn shadow(orig: &CacheObj, dst: &CacheObj) {
        debug_assert_eq!(dst.mapping_count(), 0);

        let mut downgraded = Vec::new();
        {
            let mut st = orig.state.write();

            let mut resident = Vec::new();
            st.map.foreach(|off, e| {
                if e.present() && !e.roshared() {
                    resident.push((off, e));
                }
            });

            for (off, e) in resident {
                let shared = Ipte::page(e.pfn(), true, e.protmask());
                st.map.map(off, shared);
                for m in &st.mappings {
                    if !m.covers(off) {
                        continue;
                    }
                    let prot = (e.protmask() & m.prot) - VmProt::WRITE;
                    hal().umap_map(m.umap, m.va_of(off), e.pfn(), prot);
                    hal().umap_commit(m.umap);
                }
                downgraded.push((off, e.pfn()));
            }
        }

        // Frame reclassification happens outside the object lock; frame
        // locks nest outside cache-object locks elsewhere.
        for (off, pfn) in downgraded {
            memcache::make_shared(pfn, orig.id, off);
        }
    }
}

impl Drop for CacheObj {
    fn drop(&mut self) {
        // Last reference: return resident frames to the allocator, or drop
        // our link to shared ones.
        let st = self.state.get_mut();
        let id = self.id;
        st.map.foreach(|off, e| {
            if e.present() {
                memcache::release(e.pfn(), id, off, e.roshared());
            }
        });
    }
}
