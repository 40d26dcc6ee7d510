// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VM objects and shadow chains.
//!
//! A VM object wraps a cache object and gives it identity: a control port,
//! a name port, and a position in a copy-on-write *shadow chain*. An object
//! that lacks a page consults its shadow (the object it was copied from)
//! for unmodified data; the first write to a shared page copies it into the
//! faulting object.
//!
//! Shadow edges are owning and form a DAG; the `copy` back-edge (from an
//! object to its most recent shadow copy) is weak and used only for
//! structural bookkeeping, never for liveness.
//!
//! All objects in one shadow chain share a single chain lock; taking it
//! once serializes fault resolution across the whole chain.

use alloc::sync::{Arc, Weak};

use abi::VmProt;
use spin::Mutex;

use crate::cacheobj::{CacheObj, CacheObjMapping};
use crate::err::FaultError;
use crate::hal::UmapId;
use crate::imap::{Ipte, IpteStatus};
use crate::memcache;
use crate::port::{KernCtx, Port, PortRef};

pub type VmObjRef = Arc<VmObj>;

struct Links {
    /// Object consulted for pages this one does not own. Owning edge.
    shadow: Option<VmObjRef>,
    /// Most recent shadow copy of this object. Non-owning back-edge.
    copy: Weak<VmObj>,
}

pub struct VmObj {
    /// Shared with every object in this shadow chain.
    chain_lock: Arc<Mutex<()>>,
    cobj: CacheObj,
    private: bool,
    control_port: PortRef,
    name_port: PortRef,
    links: Mutex<Links>,
}

impl VmObj {
    /// Creates an empty object of `size` bytes with a fresh chain-lock
    /// group and its own control and name ports.
    pub fn new(private: bool, size: u64) -> VmObjRef {
        Arc::new_cyclic(|weak: &Weak<VmObj>| VmObj {
            chain_lock: Arc::new(Mutex::new(())),
            cobj: CacheObj::new(size),
            private,
            control_port: Port::new_kernel(KernCtx::VmObjCtl(weak.clone())),
            name_port: Port::new_kernel(KernCtx::VmObjName(weak.clone())),
            links: Mutex::new(Links {
                shadow: None,
                copy: Weak::new(),
            }),
        })
    }

    pub fn cobj(&self) -> &CacheObj {
        &self.cobj
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    pub fn control_port(&self) -> PortRef {
        self.control_port.clone()
    }

    pub fn name_port(&self) -> PortRef {
        self.name_port.clone()
    }

    pub fn shadow(&self) -> Option<VmObjRef> {
        self.links.lock().shadow.clone()
    }

    /// The live shadow copy of this object, if any.
    pub fn copy(&self) -> Option<VmObjRef> {
        self.links.lock().copy.upgrade()
    }

    /// True if the two objects belong to the same shadow chain.
    pub fn same_chain(a: &VmObj, b: &VmObj) -> bool {
        Arc::ptr_eq(&a.chain_lock, &b.chain_lock)
    }

    /// Enrolls a user mapping with the backing cache object.
    pub fn add_region(&self, m: CacheObjMapping) {
        self.cobj.add_mapping(m);
    }

    /// Retires the user mapping identified by `(umap, start)`.
    pub fn del_region(&self, umap: UmapId, start: u64) {
        self.cobj.del_mapping(umap, start);
    }
}

/// Creates a copy-on-write snapshot of `orig`.
///
/// The new object `s` has `s.shadow = orig` and joins `orig`'s chain-lock
/// group; `orig.copy` is pointed (weakly) at `s`. Resident pages of `orig`
/// are downgraded to read-only-shared so that writes on either side fault
/// and copy.
pub fn shadow_copy(orig: &VmObjRef) -> VmObjRef {
    let s = Arc::new_cyclic(|weak: &Weak<VmObj>| VmObj {
        chain_lock: orig.chain_lock.clone(),
        cobj: CacheObj::new(orig.cobj.size()),
        private: orig.private,
        control_port: Port::new_kernel(KernCtx::VmObjCtl(weak.clone())),
        name_port: Port::new_kernel(KernCtx::VmObjName(weak.clone())),
        links: Mutex::new(Links {
            shadow: Some(orig.clone()),
            copy: Weak::new(),
        }),
    });

    let _chain = orig.chain_lock.lock();
    orig.links.lock().copy = Arc::downgrade(&s);
    CacheObj::shadow(&orig.cobj, &s.cobj);
    s
}

/// Resolves a page fault against `obj` at `off` for an access of
/// `reqprot`.
///
/// On success the object's cache holds a valid entry at `off` whose
/// protection permits `reqprot` for any region bounded by `maxprot`; the
/// installed entry is returned so the caller can wire its page table.
pub fn fault(
    obj: &VmObjRef,
    off: u64,
    reqprot: VmProt,
    maxprot: VmProt,
) -> Result<Ipte, FaultError> {
    let _chain = obj.chain_lock.lock();
    let wants_write = reqprot.contains(VmProt::WRITE);

    let e = obj.cobj.lookup(off);
    if e.present() {
        if e.roshared() && wants_write {
            memcache::unshare(e.pfn(), &obj.cobj, off, maxprot)
                .ok_or(FaultError::Shortage)?;
            return Ok(obj.cobj.lookup(off));
        }
        return Ok(e);
    }
    if e.status() != IpteStatus::Empty {
        return Err(FaultError::Transient);
    }

    // Not resident here. Walk the shadow chain for the page.
    let mut found = None;
    let mut cur = obj.shadow();
    while let Some(link) = cur {
        let se = link.cobj.lookup(off);
        if se.present() {
            found = Some(se);
            break;
        }
        if se.status() != IpteStatus::Empty {
            return Err(FaultError::Transient);
        }
        cur = link.shadow();
    }

    match found {
        None => {
            // No link has the page: zero fill. Reads share the permanent
            // zero page; writes get a private zero frame.
            memcache::zeropage_new(&obj.cobj, off, !wants_write, maxprot)
                .ok_or(FaultError::Shortage)?;
        }
        Some(se) => {
            if wants_write {
                memcache::copy_private(se.pfn(), &obj.cobj, off, maxprot)
                    .ok_or(FaultError::Shortage)?;
            } else {
                memcache::share(se.pfn(), &obj.cobj, off, maxprot);
            }
        }
    }
    Ok(obj.cobj.lookup(off))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::hal;
    use crate::test_support;

    fn rw() -> VmProt {
        VmProt::READ | VmProt::WRITE
    }

    #[test]
    fn zero_fill_read_then_write_unshares() {
        test_support::boot();
        let obj = VmObj::new(true, 0x4000);

        let e = fault(&obj, 0x1000, VmProt::READ, rw()).unwrap();
        assert!(e.roshared());
        assert_eq!(e.pfn(), memcache::zero_pfn());

        let e = fault(&obj, 0x1000, rw(), rw()).unwrap();
        assert!(!e.roshared());
        assert_ne!(e.pfn(), memcache::zero_pfn());

        // Resolution is idempotent once the page is private.
        let again = fault(&obj, 0x1000, rw(), rw()).unwrap();
        assert_eq!(again, e);
    }

    #[test]
    fn write_fault_on_fresh_page_is_private_immediately() {
        test_support::boot();
        let obj = VmObj::new(true, 0x4000);

        let e = fault(&obj, 0, VmProt::WRITE | VmProt::READ, rw()).unwrap();
        assert!(!e.roshared());
        assert_eq!(e.protmask(), rw());
    }

    #[test]
    fn shadow_copy_links_and_shares_lock() {
        test_support::boot();
        let obj = VmObj::new(true, 0x4000);
        let copy = shadow_copy(&obj);

        assert!(VmObj::same_chain(&obj, &copy));
        assert!(Arc::ptr_eq(&copy.shadow().unwrap(), &obj));
        assert!(Arc::ptr_eq(&obj.copy().unwrap(), &copy));
        // Back-edge is weak: dropping the copy must not leak through it.
        drop(copy);
        assert!(obj.copy().is_none());
    }

    #[test]
    fn read_through_chain_shares_parent_page() {
        test_support::boot();
        let parent = VmObj::new(true, 0x4000);

        // Parent owns a written page.
        let pe = fault(&parent, 0, rw(), rw()).unwrap();
        hal().frame_write(pe.pfn(), 0, &[0x42; 4]);

        let child = shadow_copy(&parent);
        let ce = fault(&child, 0, VmProt::READ, rw()).unwrap();
        assert!(ce.roshared());
        assert_eq!(ce.pfn(), fault(&parent, 0, VmProt::READ, rw()).unwrap().pfn());

        let mut buf = [0u8; 4];
        hal().frame_read(ce.pfn(), 0, &mut buf);
        assert_eq!(buf, [0x42; 4]);
    }

    #[test]
    fn write_through_chain_copies_parent_page() {
        test_support::boot();
        let parent = VmObj::new(true, 0x4000);
        let pe = fault(&parent, 0, rw(), rw()).unwrap();
        hal().frame_write(pe.pfn(), 0, &[0x17; 8]);

        let child = shadow_copy(&parent);
        let ce = fault(&child, 0, rw(), rw()).unwrap();
        assert!(!ce.roshared());
        assert_ne!(ce.pfn(), pe.pfn());

        // Copy carries the parent's bytes; writes stay private.
        let mut buf = [0u8; 8];
        hal().frame_read(ce.pfn(), 0, &mut buf);
        assert_eq!(buf, [0x17; 8]);
        hal().frame_write(ce.pfn(), 0, &[0x18; 8]);
        let mut pbuf = [0u8; 8];
        hal().frame_read(pe.pfn(), 0, &mut pbuf);
        assert_eq!(pbuf, [0x17; 8]);
    }

    #[test]
    fn shadowed_parent_write_faults_to_private_copy() {
        test_support::boot();
        let parent = VmObj::new(true, 0x4000);
        let before = fault(&parent, 0, rw(), rw()).unwrap();
        let _child = shadow_copy(&parent);

        // The snapshot downgraded the parent's page; a write must unshare.
        let e = parent.cobj().lookup(0);
        assert!(e.roshared());
        let after = fault(&parent, 0, rw(), rw()).unwrap();
        assert!(!after.roshared());
        assert_ne!(after.pfn(), before.pfn());
    }
}
