// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test machine.
//!
//! An in-memory [`Hal`] implementation driving the whole kernel from the
//! host test runner: frames are boxed pages, user page tables are maps,
//! the clock is a counter the tests advance by hand. One instance boots
//! once per process; tests share the frame pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, Once, OnceLock};

use abi::{VmProt, PAGE_SIZE};

use crate::hal::{Hal, Pfn, UmapId};

const FIRST_PFN: Pfn = 0x100;
const TOTAL_FRAMES: u64 = 4096;

type Page = Box<[u8; PAGE_SIZE]>;

pub struct TestHal {
    frames: Mutex<HashMap<Pfn, Page>>,
    next_pfn: AtomicU64,
    umaps: Mutex<HashMap<u64, HashMap<u64, (Pfn, VmProt)>>>,
    next_umap: AtomicU64,
    clock: AtomicU64,
    armed: Mutex<Option<u64>>,
    ipis: AtomicU64,
}

impl TestHal {
    fn new() -> Self {
        Self {
            frames: Mutex::new(HashMap::new()),
            next_pfn: AtomicU64::new(FIRST_PFN),
            umaps: Mutex::new(HashMap::new()),
            next_umap: AtomicU64::new(1),
            clock: AtomicU64::new(0),
            armed: Mutex::new(None),
            ipis: AtomicU64::new(0),
        }
    }

    /// Test accessor: current translation of `va`, if any.
    pub fn umap_lookup(&self, umap: UmapId, va: u64) -> Option<(Pfn, VmProt)> {
        self.umaps.lock().unwrap().get(&umap.0)?.get(&va).copied()
    }

    /// Advances the monotonic clock.
    pub fn advance(&self, ns: u64) {
        self.clock.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn ipi_count(&self) -> u64 {
        self.ipis.load(Ordering::Relaxed)
    }

    /// Currently armed one-shot timer delta, if any.
    pub fn armed(&self) -> Option<u64> {
        *self.armed.lock().unwrap()
    }

    fn with_page<R>(&self, pfn: Pfn, f: impl FnOnce(&mut Page) -> R) -> R {
        let mut frames = self.frames.lock().unwrap();
        let page = frames.get_mut(&pfn).expect("access to unallocated frame");
        f(page)
    }
}

impl Hal for TestHal {
    fn cpu_num(&self) -> usize {
        1
    }

    fn cpu_id(&self) -> usize {
        0
    }

    fn cpu_ipi(&self, _cpu: usize) {
        self.ipis.fetch_add(1, Ordering::Relaxed);
    }

    fn frame_alloc(&self) -> Option<Pfn> {
        let pfn = self.next_pfn.fetch_add(1, Ordering::Relaxed);
        if pfn >= FIRST_PFN + TOTAL_FRAMES {
            return None;
        }
        self.frames
            .lock()
            .unwrap()
            .insert(pfn, Box::new([0; PAGE_SIZE]));
        Some(pfn)
    }

    fn max_pfn(&self) -> Pfn {
        FIRST_PFN + TOTAL_FRAMES
    }

    fn frame_zero(&self, pfn: Pfn) {
        self.with_page(pfn, |p| p.fill(0));
    }

    fn frame_copy(&self, dst: Pfn, src: Pfn) {
        let data = self.with_page(src, |p| **p);
        self.with_page(dst, |p| **p = data);
    }

    fn frame_read(&self, pfn: Pfn, off: usize, buf: &mut [u8]) {
        self.with_page(pfn, |p| buf.copy_from_slice(&p[off..off + buf.len()]));
    }

    fn frame_write(&self, pfn: Pfn, off: usize, buf: &[u8]) {
        self.with_page(pfn, |p| p[off..off + buf.len()].copy_from_slice(buf));
    }

    fn umap_new(&self) -> UmapId {
        let id = self.next_umap.fetch_add(1, Ordering::Relaxed);
        self.umaps.lock().unwrap().insert(id, HashMap::new());
        UmapId(id)
    }

    fn umap_map(&self, umap: UmapId, va: u64, pfn: Pfn, prot: VmProt) -> bool {
        self.umaps
            .lock()
            .unwrap()
            .get_mut(&umap.0)
            .expect("map into destroyed umap")
            .insert(va, (pfn, prot));
        true
    }

    fn umap_unmap(&self, umap: UmapId, va: u64) {
        if let Some(m) = self.umaps.lock().unwrap().get_mut(&umap.0) {
            m.remove(&va);
        }
    }

    fn umap_commit(&self, _umap: UmapId) {}

    fn umap_enter(&self, _umap: UmapId) {}

    fn umap_destroy(&self, umap: UmapId) {
        self.umaps.lock().unwrap().remove(&umap.0);
    }

    fn now(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    fn timer_arm(&self, delta_ns: u64) {
        *self.armed.lock().unwrap() = Some(delta_ns);
    }

    fn timer_clear(&self) {
        *self.armed.lock().unwrap() = None;
    }
}

static HAL_CELL: OnceLock<TestHal> = OnceLock::new();
static BOOT: Once = Once::new();

/// Boots the kernel against the test machine, once per process, and
/// returns the HAL for introspection.
pub fn boot() -> &'static TestHal {
    let h = HAL_CELL.get_or_init(TestHal::new);
    BOOT.call_once(|| crate::startup::init_bsp(h));
    h
}

/// Serializes tests that drive the scheduler or syscalls: CPU-current
/// state is global, so such tests cannot overlap.
pub fn sched_guard() -> MutexGuard<'static, ()> {
    static GUARD: Mutex<()> = Mutex::new(());
    GUARD.lock().unwrap_or_else(|e| e.into_inner())
}

/// Reaps threads destroyed by the running test.
pub fn reap() {
    crate::startup::reap_dead_threads();
}
