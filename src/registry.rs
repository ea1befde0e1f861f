//! Process-wide, immutable descriptor registry.
//!
//! spec.md §9 re-architects the original `asn1_descs_g` thread-local
//! sweep into "a build-time or startup-time generated, immutable
//! descriptor graph; register via a pure-data table ... free of
//! thread-local state. Cyclic descriptors (mutually recursive
//! sequences) are encoded as indices into the table (arena+index)."
//!
//! [`Registry`] is that table. A binary (or a library consumer, at
//! process start) reserves slots for every descriptor it needs — this
//! two-phase reserve/define split is what lets mutually recursive
//! descriptors reference each other by index before either is fully
//! built. Once [`Registry::close`] is called the table never mutates
//! again; readers only ever take a shared borrow.

use std::sync::{OnceLock, RwLock};

use crate::asn1::descriptor::Descriptor;

/// An index into a [`Registry`]'s descriptor arena. Stable for the
/// lifetime of the registry once assigned by [`Registry::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorRef(pub(crate) usize);

/// Process-wide descriptor table.
///
/// A single process normally has exactly one `Registry`, reachable via
/// [`global`]. Tests construct private instances to avoid cross-test
/// interference.
pub struct Registry {
    descriptors: RwLock<Vec<Option<Descriptor>>>,
    closed: std::sync::atomic::AtomicBool,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            descriptors: RwLock::new(Vec::new()),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Reserves a slot for a descriptor that hasn't been fully built
    /// yet, returning the index other in-flight descriptors can refer
    /// to before [`define`](Self::define) fills it in.
    pub fn reserve(&self) -> DescriptorRef {
        let mut descs = self.descriptors.write().expect("registry poisoned");
        let idx = descs.len();
        descs.push(None);
        DescriptorRef(idx)
    }

    /// Fills in a previously reserved slot. Panics if registration has
    /// already been closed, the slot doesn't exist, or it was already
    /// defined — registration is write-once per slot.
    pub fn define(&self, r: DescriptorRef, descriptor: Descriptor) {
        assert!(
            !self.closed.load(std::sync::atomic::Ordering::Acquire),
            "cannot register new descriptors after the registry is closed"
        );
        let mut descs = self.descriptors.write().expect("registry poisoned");
        let slot = descs
            .get_mut(r.0)
            .expect("DescriptorRef from a different registry");
        assert!(slot.is_none(), "descriptor slot {} already defined", r.0);
        *slot = Some(descriptor);
    }

    /// Convenience for non-recursive descriptors: reserve and define in
    /// one call.
    pub fn register(&self, descriptor: Descriptor) -> DescriptorRef {
        let r = self.reserve();
        self.define(r, descriptor);
        r
    }

    /// Freezes the table. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::Release);
    }

    /// Scans the table for a class descriptor whose `fq_name` matches,
    /// used by the IOP XML unpacker to resolve an `xsi:type` attribute
    /// to a concrete descriptor (spec.md §4.3 "Class polymorphism").
    /// O(n) in the table size; class dispatch happens once per XML
    /// element, not per byte, so this is not on a hot path.
    pub fn find_by_fq_name(&self, name: &str) -> Option<DescriptorRef> {
        let descs = self.descriptors.read().expect("registry poisoned");
        descs.iter().position(|slot| {
            slot.as_ref()
                .and_then(|d| d.class_info.as_ref())
                .is_some_and(|ci| ci.fq_name == name)
        }).map(DescriptorRef)
    }

    /// Looks up a descriptor by reference. Panics (a programmer error,
    /// per spec.md §4.2 "Failure semantics") if the slot was reserved
    /// but never defined — every reserved slot must be filled before
    /// the graph is used.
    pub fn get(&self, r: DescriptorRef) -> Descriptor {
        let descs = self.descriptors.read().expect("registry poisoned");
        descs
            .get(r.0)
            .and_then(|d| d.clone())
            .expect("dangling DescriptorRef: slot reserved but never defined")
    }
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// The process-wide registry, built once at first use. No thread-local
/// variation; every thread observes the same immutable table once
/// registration is closed (spec.md §5, §9).
pub fn global() -> &'static Registry {
    GLOBAL.get_or_init(Registry::new)
}
