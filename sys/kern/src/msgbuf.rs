// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-thread message buffers.
//!
//! Every thread owns one page of memory shared between the kernel and the
//! task, used to exchange message bodies and syscall argument structures.
//! Buffers live in a fixed range at the top of the address space, one slot
//! per possible thread, handed out by bit; the range never interacts with
//! region allocation in the VM map proper.

use alloc::vec;
use alloc::vec::Vec;

use abi::{VmProt, MSGBUF_SIZE, VM_MAP_MSGBUF_END, VM_MAP_MSGBUF_START};

use crate::hal::{hal, Pfn, UmapId};
use crate::physmem;

/// A thread's kernel/user shared buffer: the user-visible address plus the
/// backing frame the kernel reads and writes directly.
#[derive(Debug)]
pub struct MsgBuf {
    pub uaddr: u64,
    pub pfn: Pfn,
}

impl MsgBuf {
    /// Kernel-side read from the shared buffer.
    pub fn read(&self, off: usize, buf: &mut [u8]) {
        assert!(off + buf.len() <= MSGBUF_SIZE);
        hal().frame_read(self.pfn, off, buf);
    }

    /// Kernel-side write into the shared buffer.
    pub fn write(&self, off: usize, data: &[u8]) {
        assert!(off + data.len() <= MSGBUF_SIZE);
        hal().frame_write(self.pfn, off, data);
    }
}

const SLOTS: usize =
    ((VM_MAP_MSGBUF_END - VM_MAP_MSGBUF_START) as usize) / MSGBUF_SIZE;

/// Bit-per-slot allocator over the msgbuf range.
pub struct MsgbufZone {
    bitmap: Vec<u64>,
}

impl MsgbufZone {
    pub fn new() -> Self {
        Self {
            bitmap: vec![0; SLOTS.div_ceil(64)],
        }
    }

    fn alloc_slot(&mut self) -> Option<usize> {
        for (i, word) in self.bitmap.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                *word |= 1 << bit;
                let slot = i * 64 + bit;
                return (slot < SLOTS).then_some(slot);
            }
        }
        None
    }

    fn free_slot(&mut self, slot: usize) {
        let word = &mut self.bitmap[slot / 64];
        let bit = 1 << (slot % 64);
        assert!(*word & bit != 0, "double free of msgbuf slot {slot}");
        *word &= !bit;
    }
}

impl Default for MsgbufZone {
    fn default() -> Self {
        Self::new()
    }
}

fn slot_addr(slot: usize) -> u64 {
    VM_MAP_MSGBUF_START + (slot * MSGBUF_SIZE) as u64
}

/// Allocates a buffer in `zone` and maps it writable into `umap`.
pub fn alloc(zone: &mut MsgbufZone, umap: UmapId) -> Option<MsgBuf> {
    let slot = zone.alloc_slot()?;
    let Some(pfn) = physmem::alloc_kernel(true) else {
        zone.free_slot(slot);
        return None;
    };

    let uaddr = slot_addr(slot);
    if !hal().umap_map(umap, uaddr, pfn, VmProt::READ | VmProt::WRITE) {
        physmem::free_frame(pfn);
        zone.free_slot(slot);
        return None;
    }
    hal().umap_commit(umap);

    Some(MsgBuf { uaddr, pfn })
}

/// Unmaps and releases a buffer.
pub fn free(zone: &mut MsgbufZone, umap: UmapId, mb: MsgBuf) {
    hal().umap_unmap(umap, mb.uaddr);
    hal().umap_commit(umap);
    physmem::free_frame(mb.pfn);
    let slot = ((mb.uaddr - VM_MAP_MSGBUF_START) as usize) / MSGBUF_SIZE;
    zone.free_slot(slot);
}

/// Carves a thread-local-storage block out of the msgbuf zone and seeds
/// the variant-II self-pointer at its top.
///
/// TODO: give TLS its own region in the VM map so its size can track the
/// program's TLS segment instead of being one msgbuf.
pub fn alloc_tls(zone: &mut MsgbufZone, umap: UmapId) -> Option<(MsgBuf, u64)> {
    let mb = alloc(zone, umap)?;
    let tls = mb.uaddr + (MSGBUF_SIZE - core::mem::size_of::<u64>()) as u64;
    mb.write(MSGBUF_SIZE - 8, &tls.to_le_bytes());
    Some((mb, tls))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn alloc_assigns_distinct_slots() {
        let thal = test_support::boot();
        let umap = hal().umap_new();
        let mut zone = MsgbufZone::new();

        let a = alloc(&mut zone, umap).unwrap();
        let b = alloc(&mut zone, umap).unwrap();
        assert_ne!(a.uaddr, b.uaddr);
        assert!(a.uaddr >= VM_MAP_MSGBUF_START && a.uaddr < VM_MAP_MSGBUF_END);
        assert!(thal.umap_lookup(umap, a.uaddr).is_some());

        // Freeing recycles the slot.
        let freed = a.uaddr;
        free(&mut zone, umap, a);
        assert!(thal.umap_lookup(umap, freed).is_none());
        let c = alloc(&mut zone, umap).unwrap();
        assert_eq!(c.uaddr, freed);

        free(&mut zone, umap, b);
        free(&mut zone, umap, c);
        hal().umap_destroy(umap);
    }

    #[test]
    fn buffer_is_kernel_accessible() {
        test_support::boot();
        let umap = hal().umap_new();
        let mut zone = MsgbufZone::new();

        let mb = alloc(&mut zone, umap).unwrap();
        mb.write(16, &[1, 2, 3, 4]);
        let mut buf = [0u8; 4];
        mb.read(16, &mut buf);
        assert_eq!(buf, [1, 2, 3, 4]);

        free(&mut zone, umap, mb);
        hal().umap_destroy(umap);
    }

    #[test]
    fn tls_block_is_seeded_with_self_pointer() {
        test_support::boot();
        let umap = hal().umap_new();
        let mut zone = MsgbufZone::new();

        let (mb, tls) = alloc_tls(&mut zone, umap).unwrap();
        assert_eq!(tls, mb.uaddr + MSGBUF_SIZE as u64 - 8);
        let mut buf = [0u8; 8];
        mb.read(MSGBUF_SIZE - 8, &mut buf);
        assert_eq!(u64::from_le_bytes(buf), tls);

        free(&mut zone, umap, mb);
        hal().umap_destroy(umap);
    }
}
