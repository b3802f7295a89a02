//! Per-VM state.
//!
//! A [`Kvm`] bundles what the stage-2 core keeps per VM: the VMID that tags
//! its TLB entries, the stage-2 root behind `mmu_lock`, the registered
//! memslots, the host-notifier generation counter, and the cloning role
//! plus the state shared with the other half of a clone.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use log::error;

use crate::error::Error;
use crate::host::HostMemory;
use crate::memslot::{Memslot, MemslotFlags, Memslots};
use crate::mm::clone::ClonePair;
use crate::sync::{LockClass, SpinLock};
use crate::{Gfn, HostVirtAddr, PhysAddr, Pfn};

/// Which half of a clone, if any, this VM currently is.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum CloningRole {
    None = 0,
    Source = 1,
    Target = 2,
}

/// Stage-2 translation state, guarded by `mmu_lock`.
pub(crate) struct Stage2 {
    /// Root table frame, present between `alloc_stage2_pgd` and
    /// `free_stage2_pgd`.
    pub(crate) pgd: Option<Pfn>,
}

pub struct Kvm {
    vmid: u16,
    /// `mmu_lock`: every stage-2 structure mutation happens under it.
    pub(crate) mmu: SpinLock<Stage2>,
    memslots: SpinLock<Memslots>,
    /// Bumped by the host-notifier hooks before they touch the tree; the
    /// fault path snapshots it before resolving a GFN and retries if it
    /// moved (see `user_mem_abort`).
    pub(crate) mmu_notifier_seq: AtomicU64,
    cloning_role: AtomicU8,
    clone_pair: SpinLock<Option<Arc<ClonePair>>>,
    host: Arc<dyn HostMemory>,
}

impl Kvm {
    pub fn new(vmid: u16, host: Arc<dyn HostMemory>) -> Self {
        Self {
            vmid,
            mmu: SpinLock::new(LockClass::Mmu, Stage2 { pgd: None }),
            memslots: SpinLock::new(LockClass::Bookkeeping, Memslots::new()),
            mmu_notifier_seq: AtomicU64::new(0),
            cloning_role: AtomicU8::new(CloningRole::None as u8),
            clone_pair: SpinLock::new(LockClass::Bookkeeping, None),
            host,
        }
    }

    pub fn vmid(&self) -> u16 {
        self.vmid
    }

    pub fn host(&self) -> &dyn HostMemory {
        &*self.host
    }

    // ── Cloning role ────────────────────────────────────────────────

    pub fn cloning_role(&self) -> CloningRole {
        match self.cloning_role.load(Ordering::Acquire) {
            1 => CloningRole::Source,
            2 => CloningRole::Target,
            _ => CloningRole::None,
        }
    }

    /// Assign this VM its half of a clone. The cloning orchestrator calls
    /// this on both VMs with the same [`ClonePair`] before arming the
    /// source, and with `None`/no pair once the clone fully diverged.
    pub fn set_cloning_role(&self, role: CloningRole, pair: Option<Arc<ClonePair>>) {
        debug_assert_eq!(role == CloningRole::None, pair.is_none());
        *self.clone_pair.lock() = pair;
        self.cloning_role.store(role as u8, Ordering::Release);
    }

    pub(crate) fn clone_pair(&self) -> Option<Arc<ClonePair>> {
        self.clone_pair.lock().clone()
    }

    // ── Memslots ────────────────────────────────────────────────────

    /// Register a slot of guest memory. Slots must not overlap.
    pub fn register_memslot(&self, slot: Memslot) -> Arc<Memslot> {
        let slot = Arc::new(slot);
        self.memslots.lock().insert(slot.clone());
        slot
    }

    pub fn gfn_to_memslot(&self, gfn: Gfn) -> Option<Arc<Memslot>> {
        self.memslots.lock().find(gfn)
    }

    pub fn is_visible_gfn(&self, gfn: Gfn) -> bool {
        self.gfn_to_memslot(gfn).is_some()
    }

    pub fn for_each_memslot(&self, mut f: impl FnMut(&Arc<Memslot>)) {
        for slot in self.memslots_snapshot() {
            f(&slot);
        }
    }

    pub(crate) fn memslots_snapshot(&self) -> Vec<Arc<Memslot>> {
        self.memslots.lock().snapshot()
    }

    /// Set the dirty bit for `gfn`. Tolerates GFNs outside any slot
    /// (device mappings installed through ioremap have none).
    pub fn mark_page_dirty(&self, gfn: Gfn) {
        if let Some(slot) = self.gfn_to_memslot(gfn) {
            slot.mark_dirty(gfn);
        }
    }

    pub(crate) fn mark_gfn_unshared(&self, gfn: Gfn) {
        let Some(slot) = self.gfn_to_memslot(gfn) else {
            error!(
                "no memslot for unshared gfn {:#x}, cloning role {:?}",
                gfn,
                self.cloning_role()
            );
            panic!("unshare bookkeeping for a gfn outside every memslot");
        };
        slot.set_unshared(gfn);
    }

    pub(crate) fn is_gfn_unshared(&self, gfn: Gfn) -> bool {
        let Some(slot) = self.gfn_to_memslot(gfn) else {
            error!(
                "no memslot for gfn {:#x}, cloning role {:?}",
                gfn,
                self.cloning_role()
            );
            panic!("unshare bookkeeping for a gfn outside every memslot");
        };
        slot.is_unshared(gfn)
    }

    // ── Host address translation ────────────────────────────────────

    /// Host virtual address backing a guest physical address. Only valid
    /// for GPAs inside a registered slot; the copy-on-access paths that
    /// call this have already established that.
    pub fn gpa_to_hva(&self, gpa: PhysAddr) -> HostVirtAddr {
        let gfn = gpa >> crate::arch::arm::defs::PAGE_SHIFT;
        let slot = self
            .gfn_to_memslot(gfn)
            .expect("gpa_to_hva outside every memslot");
        slot.hva_for(gfn)
    }

    /// Resolve a guest frame to the host frame backing it.
    ///
    /// `write` asks for write access; the grant comes back in the second
    /// tuple field and is never given for a read-only slot.
    pub fn gfn_to_pfn_prot(&self, gfn: Gfn, write: bool) -> Result<(Pfn, bool), Error> {
        let slot = self.gfn_to_memslot(gfn).ok_or(Error::InvalidInput)?;
        let want_write = write && !slot.flags.contains(MemslotFlags::READONLY);
        let (pfn, granted) = self.host.hva_to_pfn(slot.hva_for(gfn), want_write)?;
        Ok((pfn, granted && want_write))
    }

    /// Whether a write fault on `gfn` could ever be granted: the backing
    /// VMA must be writable and the slot must not be read-only.
    pub(crate) fn gfn_is_writable(&self, gfn: Gfn) -> bool {
        let hva = self.gpa_to_hva(gfn << crate::arch::arm::defs::PAGE_SHIFT);
        let slot = self.gfn_to_memslot(gfn).expect("slot vanished under us");
        self.host.vma_writable(hva) && !slot.flags.contains(MemslotFlags::READONLY)
    }

    // ── Host notifier generation ────────────────────────────────────

    /// True if the host invalidated something since `seq` was snapshotted;
    /// the caller must drop its translation and let the guest refault.
    pub fn mmu_notifier_retry(&self, seq: u64) -> bool {
        self.mmu_notifier_seq.load(Ordering::Acquire) != seq
    }
}
