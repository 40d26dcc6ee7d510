// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the architecture-specific layer.
//!
//! The kernel core never touches page tables, frame memory, or interrupt
//! hardware directly; it goes through a platform-supplied [`Hal`]
//! implementation installed once at boot. The test suite installs an
//! in-memory machine behind the same trait.

use abi::VmProt;

/// A page frame number. Frame `pfn` covers physical bytes
/// `[pfn << PAGE_SHIFT, (pfn + 1) << PAGE_SHIFT)`.
pub type Pfn = u64;

/// Opaque handle for a user page-table root.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct UmapId(pub u64);

/// Services the platform must provide to the kernel core.
///
/// Frame-content access is expressed as copying operations rather than raw
/// pointers so that the core stays entirely safe; on real hardware these
/// are thin wrappers over the direct map.
pub trait Hal: Send + Sync {
    /// Number of CPUs brought up by the platform.
    fn cpu_num(&self) -> usize;

    /// Identifier of the calling CPU, in `0..cpu_num()`.
    fn cpu_id(&self) -> usize;

    /// Interrupts the given CPU so it re-enters the scheduler.
    fn cpu_ipi(&self, cpu: usize);

    /// Hands one frame from the boot allocator to the kernel, or `None`
    /// when boot memory is exhausted. [`crate::physmem`] drains this once
    /// at startup and owns all frames afterwards.
    fn frame_alloc(&self) -> Option<Pfn>;

    /// Highest frame number backed by RAM.
    fn max_pfn(&self) -> Pfn;

    /// Fills a frame with zeroes.
    fn frame_zero(&self, pfn: Pfn);

    /// Copies the full contents of frame `src` into frame `dst`.
    fn frame_copy(&self, dst: Pfn, src: Pfn);

    /// Reads `buf.len()` bytes from byte offset `off` of the frame.
    fn frame_read(&self, pfn: Pfn, off: usize, buf: &mut [u8]);

    /// Writes `buf` at byte offset `off` of the frame.
    fn frame_write(&self, pfn: Pfn, off: usize, buf: &[u8]);

    /// Creates an empty user page table.
    fn umap_new(&self) -> UmapId;

    /// Maps a frame at `va` with the given protection, replacing any
    /// previous mapping of `va`. Returns false on translation-structure
    /// exhaustion.
    fn umap_map(&self, umap: UmapId, va: u64, pfn: Pfn, prot: VmProt) -> bool;

    /// Removes the mapping of `va`, if any.
    fn umap_unmap(&self, umap: UmapId, va: u64);

    /// Flushes queued invalidations out to every CPU using this page table
    /// (TLB shootdown). Mapping updates take effect no later than this.
    fn umap_commit(&self, umap: UmapId);

    /// Activates the page table on the calling CPU.
    fn umap_enter(&self, umap: UmapId);

    /// Releases the page table. All mappings must have been removed.
    fn umap_destroy(&self, umap: UmapId);

    /// Monotonic clock, in nanoseconds.
    fn now(&self) -> u64;

    /// Arms the one-shot CPU timer to fire `delta_ns` from now.
    fn timer_arm(&self, delta_ns: u64);

    /// Disarms the one-shot CPU timer.
    fn timer_clear(&self);
}

static HAL: spin::Once<&'static dyn Hal> = spin::Once::new();

/// Installs the platform HAL. Must happen exactly once, before any other
/// kernel entry point runs.
pub fn install(h: &'static dyn Hal) {
    HAL.call_once(|| h);
}

/// Returns the installed HAL.
///
/// # Panics
///
/// If called before [`install`]; that is a boot-order bug.
pub fn hal() -> &'static dyn Hal {
    *HAL.get().expect("HAL not installed")
}

/// Rounds an address down to its page base.
pub fn trunc_page(addr: u64) -> u64 {
    addr & !(abi::PAGE_SIZE as u64 - 1)
}

/// Rounds an address up to the next page boundary.
pub fn round_page(addr: u64) -> u64 {
    trunc_page(addr + abi::PAGE_SIZE as u64 - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(trunc_page(0x1fff), 0x1000);
        assert_eq!(trunc_page(0x2000), 0x2000);
        assert_eq!(round_page(0x2001), 0x3000);
        assert_eq!(round_page(0x2000), 0x2000);
        assert_eq!(round_page(0), 0);
    }
}
