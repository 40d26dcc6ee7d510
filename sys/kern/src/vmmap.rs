// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-task VM maps and the region allocator.
//!
//! A map is an address-ordered tree of regions that tile the legal user
//! range with no overlaps: every address is inside exactly one region,
//! either *free* or *used*. Free regions are additionally indexed by a
//! size-class freelist array with a bitmap over non-empty classes, giving
//! best-fit allocation from the smallest class that can satisfy a request.
//!
//! Installing a region over occupied space goes through *make-hole*:
//! regions wholly inside the span are dropped, and regions straddling an
//! endpoint are trimmed, keeping their object references with adjusted
//! offsets.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use abi::{
    KernError, KernResult, VmProt, VM_MAP_USER_END, VM_MAP_USER_SIZE,
    VM_MAP_USER_START,
};
use spin::Mutex;

use crate::cacheobj::CacheObjMapping;
use crate::hal::{hal, round_page, trunc_page, UmapId};
use crate::msgbuf::{self, MsgBuf, MsgbufZone};
use crate::port::PortRef;
use crate::vmobj::{self, VmObjRef};

/// Attributes of a used region.
#[derive(Clone)]
pub struct UsedRegion {
    pub objref: VmObjRef,
    pub off: u64,
    pub curprot: VmProt,
    pub maxprot: VmProt,
}

#[derive(Clone)]
pub enum RegionKind {
    Free,
    Used(UsedRegion),
}

#[derive(Clone)]
pub struct VmRegion {
    pub start: u64,
    pub size: u64,
    pub kind: RegionKind,
}

impl VmRegion {
    pub fn is_free(&self) -> bool {
        matches!(self.kind, RegionKind::Free)
    }

    fn end(&self) -> u64 {
        self.start + self.size
    }
}

const VM_ORDMAX: usize = 64;

fn msbit(x: u64) -> usize {
    debug_assert!(x != 0);
    63 - x.leading_zeros() as usize
}

/// Size-class index over free regions: per-class freelists of region start
/// addresses and a bitmap of non-empty classes.
struct RegionZones {
    bmap: u64,
    lists: [Vec<u64>; VM_ORDMAX],
    nfree: u64,
}

impl RegionZones {
    fn new() -> Self {
        Self {
            bmap: 0,
            lists: core::array::from_fn(|_| Vec::new()),
            nfree: 0,
        }
    }

    fn attach(&mut self, start: u64, size: u64) {
        let cls = msbit(size);
        self.lists[cls].push(start);
        self.bmap |= 1 << cls;
        self.nfree += size;
    }

    fn detach(&mut self, start: u64, size: u64) {
        let cls = msbit(size);
        let pos = self.lists[cls]
            .iter()
            .position(|s| *s == start)
            .expect("free region missing from its size class");
        self.lists[cls].swap_remove(pos);
        if self.lists[cls].is_empty() {
            self.bmap &= !(1 << cls);
        }
        self.nfree -= size;
    }

    /// Start address of some free region of at least `size` bytes, found
    /// through the smallest non-empty class that can hold it.
    fn find_free(&self, size: u64) -> Option<u64> {
        let mut minbit = msbit(size);
        if size != (1 << minbit) {
            minbit += 1;
        }
        if minbit >= VM_ORDMAX {
            return None;
        }
        let above = self.bmap >> minbit;
        if above == 0 {
            return None;
        }
        let cls = minbit + above.trailing_zeros() as usize;
        self.lists[cls].last().copied()
    }
}

struct MapState {
    regions: BTreeMap<u64, VmRegion>,
    zones: RegionZones,
    total: u64,
    free: u64,
}

impl MapState {
    fn find(&self, va: u64) -> Option<&VmRegion> {
        let (_, r) = self.regions.range(..=va).next_back()?;
        (va < r.end()).then_some(r)
    }

    /// Inserts a free region without looking at its neighbors.
    fn insert_free_raw(&mut self, start: u64, size: u64) {
        self.zones.attach(start, size);
        self.free += size;
        self.regions.insert(
            start,
            VmRegion {
                start,
                size,
                kind: RegionKind::Free,
            },
        );
    }

    /// Inserts a free region, coalescing with free neighbors.
    fn create_free_region(&mut self, start: u64, size: u64) {
        let mut lo = start;
        let mut hi = start + size;

        let prev = (start > 0)
            .then(|| self.find(start - 1))
            .flatten()
            .filter(|p| p.is_free())
            .map(|p| p.start);
        if let Some(p) = prev {
            lo = p;
            self.remove_free_raw(p);
        }
        let next = self
            .find(hi)
            .filter(|n| n.is_free())
            .map(|n| (n.start, n.end()));
        if let Some((n, nend)) = next {
            hi = nend;
            self.remove_free_raw(n);
        }
        self.insert_free_raw(lo, hi - lo);
    }

    fn remove_free_raw(&mut self, start: u64) {
        let r = self.regions.remove(&start).expect("free region vanished");
        debug_assert!(r.is_free());
        self.zones.detach(r.start, r.size);
        self.free -= r.size;
    }

    /// Installs a used region and enrolls it with its object.
    fn insert_used(
        &mut self,
        umap: UmapId,
        start: u64,
        size: u64,
        used: UsedRegion,
    ) {
        used.objref.add_region(CacheObjMapping {
            umap,
            start,
            size,
            off: used.off,
            prot: used.curprot,
        });
        self.regions.insert(
            start,
            VmRegion {
                start,
                size,
                kind: RegionKind::Used(used),
            },
        );
    }

    /// Removes one region node, releasing whatever it held.
    fn remove_region(&mut self, umap: UmapId, start: u64) {
        let r = self.regions.remove(&start).expect("region vanished");
        match r.kind {
            RegionKind::Free => {
                self.zones.detach(r.start, r.size);
                self.free -= r.size;
            }
            RegionKind::Used(u) => {
                u.objref.del_region(umap, r.start);
            }
        }
    }

    /// Vacates `[start, end)`: interior regions are dropped, endpoint
    /// regions trimmed. Used fragments keep their object with adjusted
    /// offsets; free fragments re-coalesce.
    fn make_hole(&mut self, umap: UmapId, start: u64, end: u64) {
        let Some(first) = self.find(start) else {
            return;
        };
        let first_key = first.start;
        let keys: Vec<u64> =
            self.regions.range(first_key..end).map(|(k, _)| *k).collect();

        let mut head: Option<VmRegion> = None;
        let mut tail: Option<VmRegion> = None;
        for k in keys {
            let r = self.regions.get(&k).expect("region vanished").clone();
            if r.start < start {
                let mut h = r.clone();
                h.size = start - r.start;
                head = Some(h);
            }
            if r.end() > end {
                let mut t = r.clone();
                t.start = end;
                t.size = r.end() - end;
                if let RegionKind::Used(u) = &mut t.kind {
                    u.off += end - r.start;
                }
                tail = Some(t);
            }
            self.remove_region(umap, k);
        }

        for frag in [head, tail].into_iter().flatten() {
            if frag.size == 0 {
                continue;
            }
            match frag.kind {
                RegionKind::Free => {
                    self.create_free_region(frag.start, frag.size)
                }
                RegionKind::Used(u) => {
                    self.insert_used(umap, frag.start, frag.size, u)
                }
            }
        }
    }
}

/// A task's address space: region tree, user page table, and the
/// message-buffer sub-zone.
pub struct VmMap {
    umap: UmapId,
    state: Mutex<MapState>,
    msgbuf_zone: Mutex<MsgbufZone>,
}

fn check_range(start: u64, size: u64) -> KernResult<(u64, u64)> {
    let end = round_page(start.checked_add(size).ok_or(KernError::InvalidAddress)?);
    let start = trunc_page(start);
    if start < VM_MAP_USER_START || end > VM_MAP_USER_END || start >= end {
        return Err(KernError::InvalidAddress);
    }
    Ok((start, end))
}

impl VmMap {
    /// Creates an empty map: one free region tiling the whole user range.
    pub fn new() -> Self {
        let mut state = MapState {
            regions: BTreeMap::new(),
            zones: RegionZones::new(),
            total: VM_MAP_USER_SIZE,
            free: 0,
        };
        state.create_free_region(VM_MAP_USER_START, VM_MAP_USER_SIZE);
        Self {
            umap: hal().umap_new(),
            state: Mutex::new(state),
            msgbuf_zone: Mutex::new(MsgbufZone::new()),
        }
    }

    pub fn umap(&self) -> UmapId {
        self.umap
    }

    /// Activates this map's page table on the calling CPU.
    pub fn enter(&self) {
        hal().umap_enter(self.umap);
    }

    /// Bytes currently free.
    pub fn free_bytes(&self) -> u64 {
        self.state.lock().free
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total
    }

    /// Finds a free range of at least `size` bytes and installs a used
    /// region there.
    pub fn alloc(
        &self,
        objref: VmObjRef,
        off: u64,
        size: u64,
        curprot: VmProt,
        maxprot: VmProt,
    ) -> KernResult<u64> {
        if size == 0 {
            return Err(KernError::InvalidArgument);
        }
        let size = round_page(size);
        let mut st = self.state.lock();

        let start = st
            .zones
            .find_free(size)
            .ok_or(KernError::ResourceShortage)?;
        let found = st.find(start).expect("freelist points at nothing");
        debug_assert!(found.is_free());
        let found_size = found.size;
        debug_assert!(found_size >= size);

        st.remove_free_raw(start);
        if found_size > size {
            st.create_free_region(start + size, found_size - size);
        }
        st.insert_used(
            self.umap,
            start,
            size,
            UsedRegion {
                objref,
                off,
                curprot,
                maxprot,
            },
        );
        Ok(start)
    }

    /// Installs a used region at a caller-chosen address, overwriting
    /// whatever was there.
    pub fn map(
        &self,
        start: u64,
        objref: VmObjRef,
        off: u64,
        size: u64,
        curprot: VmProt,
        maxprot: VmProt,
    ) -> KernResult<()> {
        let (start, end) = check_range(start, size)?;
        let mut st = self.state.lock();
        st.make_hole(self.umap, start, end);
        st.insert_used(
            self.umap,
            start,
            end - start,
            UsedRegion {
                objref,
                off,
                curprot,
                maxprot,
            },
        );
        Ok(())
    }

    /// Vacates a range, returning it to the free pool.
    pub fn free(&self, start: u64, size: u64) -> KernResult<()> {
        let (start, end) = check_range(start, size)?;
        let mut st = self.state.lock();
        st.make_hole(self.umap, start, end);
        st.create_free_region(start, end - start);
        Ok(())
    }

    /// Resolves a page fault at `va` for an access of `reqprot`. Returns
    /// true if the fault was satisfied and the translation installed.
    pub fn fault(&self, va: u64, reqprot: VmProt) -> bool {
        let st = self.state.lock();
        let Some(r) = st.find(va) else {
            return false;
        };
        let RegionKind::Used(u) = &r.kind else {
            log::debug!("fault at {va:#x}: free region");
            return false;
        };
        if !u.curprot.contains(reqprot) {
            return false;
        }

        let page = trunc_page(va);
        let off = u.off + (page - r.start);
        let ipte = match vmobj::fault(&u.objref, off, reqprot, u.maxprot) {
            Ok(ipte) => ipte,
            Err(e) => {
                log::debug!("fault at {va:#x}: {e:?}");
                return false;
            }
        };

        let mut prot = ipte.protmask() & u.curprot;
        if ipte.roshared() {
            prot -= VmProt::WRITE;
        }
        if !hal().umap_map(self.umap, page, ipte.pfn(), prot) {
            return false;
        }
        hal().umap_commit(self.umap);
        true
    }

    /// Reports the region containing `addr`: its tile, attributes, and a
    /// reference to the backing object's name port.
    pub fn region(
        &self,
        addr: u64,
    ) -> KernResult<(u64, u64, VmProt, VmProt, u64, PortRef)> {
        let st = self.state.lock();
        let r = st.find(addr).ok_or(KernError::InvalidAddress)?;
        let RegionKind::Used(u) = &r.kind else {
            return Err(KernError::InvalidAddress);
        };
        Ok((
            r.start,
            r.size,
            u.curprot,
            u.maxprot,
            u.off,
            u.objref.name_port(),
        ))
    }

    /// Diagnostic snapshot of the region containing `va`.
    pub fn region_at(&self, va: u64) -> Option<(u64, u64, bool, u64)> {
        let st = self.state.lock();
        let r = st.find(va)?;
        let (used, off) = match &r.kind {
            RegionKind::Free => (false, 0),
            RegionKind::Used(u) => (true, u.off),
        };
        Some((r.start, r.size, used, off))
    }

    /// Logs the full region list.
    pub fn dump(&self) {
        let st = self.state.lock();
        for r in st.regions.values() {
            match &r.kind {
                RegionKind::Free => {
                    log::debug!("{:016x}:{:016x} FREE", r.start, r.end())
                }
                RegionKind::Used(u) => log::debug!(
                    "{:016x}:{:016x} BUSY off={:x}",
                    r.start,
                    r.end(),
                    u.off
                ),
            }
        }
    }

    /// Allocates a per-thread message buffer out of the msgbuf sub-zone.
    pub fn alloc_msgbuf(&self) -> Option<MsgBuf> {
        msgbuf::alloc(&mut self.msgbuf_zone.lock(), self.umap)
    }

    pub fn free_msgbuf(&self, mb: MsgBuf) {
        msgbuf::free(&mut self.msgbuf_zone.lock(), self.umap, mb)
    }

    /// Allocates a thread-local-storage block. See [`msgbuf::alloc_tls`].
    pub fn alloc_tls(&self) -> Option<(MsgBuf, u64)> {
        msgbuf::alloc_tls(&mut self.msgbuf_zone.lock(), self.umap)
    }

    #[cfg(test)]
    pub(crate) fn zones_snapshot(&self) -> (u64, u64) {
        let st = self.state.lock();
        (st.zones.bmap, st.zones.nfree)
    }
}

impl Default for VmMap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VmMap {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        let keys: Vec<u64> = st.regions.keys().copied().collect();
        for k in keys {
            st.remove_region(self.umap, k);
        }
        hal().umap_destroy(self.umap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use crate::vmobj::VmObj;

    const PAGE: u64 = abi::PAGE_SIZE as u64;

    fn rw() -> VmProt {
        VmProt::READ | VmProt::WRITE
    }

    #[test]
    fn alloc_then_free_restores_size_class_index() {
        test_support::boot();
        let map = VmMap::new();
        let before = map.zones_snapshot();

        let obj = VmObj::new(true, 4 * PAGE);
        let addr = map.alloc(obj, 0, 4 * PAGE, rw(), VmProt::ALL).unwrap();
        assert_ne!(map.zones_snapshot(), before);

        map.free(addr, 4 * PAGE).unwrap();
        assert_eq!(map.zones_snapshot(), before);
    }

    #[test]
    fn map_enrolls_region_with_object_exactly_once() {
        test_support::boot();
        let map = VmMap::new();
        let obj = VmObj::new(true, 0x10000);

        map.map(0x10000, obj.clone(), 0, 4 * PAGE, rw(), VmProt::ALL)
            .unwrap();
        assert!(obj.cobj().has_mapping(map.umap(), 0x10000));

        map.free(0x10000, 4 * PAGE).unwrap();
        assert_eq!(obj.cobj().mapping_count(), 0);
    }

    #[test]
    fn free_splits_used_region_and_repairs_offsets() {
        // Map a single used region [0x1000, 0x9000), free the middle
        // [0x3000, 0x5000): the tail keeps the object at offset +0x4000.
        test_support::boot();
        let map = VmMap::new();
        let obj = VmObj::new(true, 0x10000);

        map.map(0x1000, obj.clone(), 0, 0x8000, rw(), VmProt::ALL).unwrap();
        map.free(0x3000, 0x2000).unwrap();

        assert_eq!(map.region_at(0x1000), Some((0x1000, 0x2000, true, 0)));
        assert_eq!(map.region_at(0x3000), Some((0x3000, 0x2000, false, 0)));
        assert_eq!(
            map.region_at(0x5000),
            Some((0x5000, 0x4000, true, 0x4000))
        );

        // Both fragments are enrolled with the object, once each.
        assert!(obj.cobj().has_mapping(map.umap(), 0x1000));
        assert!(obj.cobj().has_mapping(map.umap(), 0x5000));
        assert_eq!(obj.cobj().mapping_count(), 2);
    }

    #[test]
    fn free_across_multiple_regions_drops_interiors() {
        test_support::boot();
        let map = VmMap::new();
        let a = VmObj::new(true, 0x4000);
        let b = VmObj::new(true, 0x4000);
        let c = VmObj::new(true, 0x4000);

        map.map(0x10000, a.clone(), 0, 2 * PAGE, rw(), VmProt::ALL).unwrap();
        map.map(0x12000, b.clone(), 0, 2 * PAGE, rw(), VmProt::ALL).unwrap();
        map.map(0x14000, c.clone(), 0, 2 * PAGE, rw(), VmProt::ALL).unwrap();

        // Hole spans the tail of a, all of b, and the head of c.
        map.free(0x11000, 0x4000).unwrap();

        assert_eq!(map.region_at(0x10000), Some((0x10000, PAGE, true, 0)));
        assert_eq!(map.region_at(0x11000), Some((0x11000, 0x4000, false, 0)));
        assert_eq!(map.region_at(0x15000), Some((0x15000, PAGE, true, PAGE)));
        assert_eq!(b.cobj().mapping_count(), 0);
    }

    #[test]
    fn map_overwrites_overlapping_regions() {
        test_support::boot();
        let map = VmMap::new();
        let a = VmObj::new(true, 0x8000);
        let b = VmObj::new(true, 0x8000);

        map.map(0x20000, a.clone(), 0, 4 * PAGE, rw(), VmProt::ALL).unwrap();
        map.map(0x21000, b.clone(), 0, 2 * PAGE, rw(), VmProt::ALL).unwrap();

        assert_eq!(map.region_at(0x20000), Some((0x20000, PAGE, true, 0)));
        assert_eq!(map.region_at(0x21000), Some((0x21000, 0x2000, true, 0)));
        assert_eq!(
            map.region_at(0x23000),
            Some((0x23000, PAGE, true, 0x3000))
        );
        assert_eq!(a.cobj().mapping_count(), 2);
        assert_eq!(b.cobj().mapping_count(), 1);
    }

    #[test]
    fn addresses_outside_user_range_are_rejected() {
        test_support::boot();
        let map = VmMap::new();
        let obj = VmObj::new(true, 0x4000);

        assert_eq!(
            map.map(0, obj.clone(), 0, PAGE, rw(), VmProt::ALL),
            Err(KernError::InvalidAddress)
        );
        assert_eq!(
            map.map(VM_MAP_USER_END, obj, 0, PAGE, rw(), VmProt::ALL),
            Err(KernError::InvalidAddress)
        );
        assert_eq!(map.free(0, PAGE), Err(KernError::InvalidAddress));
    }

    #[test]
    fn fault_on_anonymous_region() {
        // Read faults install the shared zero page read-only; a write
        // fault then unshares to a private frame, and the neighbor page
        // still reads as zero.
        let thal = test_support::boot();
        let map = VmMap::new();
        let obj = VmObj::new(true, 2 * PAGE);
        map.map(0x10000, obj, 0, 2 * PAGE, rw(), VmProt::ALL).unwrap();

        assert!(map.fault(0x10000, VmProt::READ));
        let (pfn, prot) = thal.umap_lookup(map.umap(), 0x10000).unwrap();
        assert_eq!(pfn, crate::memcache::zero_pfn());
        assert_eq!(prot, VmProt::READ);

        assert!(map.fault(0x10000, rw()));
        let (pfn, prot) = thal.umap_lookup(map.umap(), 0x10000).unwrap();
        assert_ne!(pfn, crate::memcache::zero_pfn());
        assert_eq!(prot, rw());

        assert!(map.fault(0x11000, VmProt::READ));
        let (pfn2, _) = thal.umap_lookup(map.umap(), 0x11000).unwrap();
        assert_eq!(pfn2, crate::memcache::zero_pfn());
    }

    #[test]
    fn fault_needs_region_and_protection() {
        test_support::boot();
        let map = VmMap::new();
        let obj = VmObj::new(true, PAGE);
        map.map(0x30000, obj, 0, PAGE, VmProt::READ, VmProt::ALL).unwrap();

        // Write exceeds curprot; free space can't fault at all.
        assert!(!map.fault(0x30000, rw()));
        assert!(!map.fault(0x50000, VmProt::READ));
        assert!(map.fault(0x30000, VmProt::READ));
    }

    #[test]
    fn region_reports_tile_and_name_port() {
        test_support::boot();
        let map = VmMap::new();
        let obj = VmObj::new(true, 0x4000);
        map.map(0x40000, obj.clone(), 0x1000, 2 * PAGE, rw(), VmProt::ALL)
            .unwrap();

        let (start, size, cur, max, off, name) = map.region(0x41000).unwrap();
        assert_eq!((start, size), (0x40000, 2 * PAGE));
        assert_eq!((cur, max), (rw(), VmProt::ALL));
        assert_eq!(off, 0x1000);
        assert!(PortRef::ptr_eq(&name, &obj.name_port()));

        assert_eq!(map.region(0x60000).err(), Some(KernError::InvalidAddress));
    }
}
