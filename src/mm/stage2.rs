//! Stage-2 table mutation, root lifecycle, and host-side hooks.
//!
//! Everything here mutates a VM's stage-2 tree and therefore runs under
//! that VM's `mmu_lock`, except root allocation and teardown which happen
//! single-threaded at VM birth and death.

use core::sync::atomic::Ordering;
use log::error;

use crate::arch::arm::cache;
use crate::arch::arm::defs::*;
use crate::arch::arm::tlb;
use crate::error::Error;
use crate::mm::heap;
use crate::mm::pgtable::{
    pmd_addr_end, pmd_index, pte_index, pud_addr_end, pud_index, read_slot, translate,
    unmap_range, write_slot, Desc, DescKind, Pte,
};
use crate::mm::reserve::MmuMemoryCache;
use crate::mm::clone;
use crate::memslot::Memslot;
use crate::vm::{CloningRole, Kvm, Stage2};
use crate::{HostVirtAddr, PhysAddr, Pfn};

impl Kvm {
    /// Allocate the stage-2 root for this VM. Called exactly once at VM
    /// creation; a second call is refused.
    pub fn alloc_stage2_pgd(&self) -> Result<(), Error> {
        let mut s2 = self.mmu.lock();
        if s2.pgd.is_some() {
            error!("stage-2 tables already initialized");
            return Err(Error::AlreadyInitialized);
        }
        s2.pgd = Some(heap::alloc_page().ok_or(Error::OutOfMemory)?);
        Ok(())
    }

    /// Tear down every stage-2 mapping and release the root. Safe to call
    /// more than once.
    pub fn free_stage2_pgd(&self) {
        let mut s2 = self.mmu.lock();
        if let Some(pgd) = s2.pgd.take() {
            unmap_range(Some(self.vmid()), pgd, 0, KVM_PHYS_SIZE);
            heap::free_page(pgd);
        }
    }

    /// Clear a range of stage-2 mappings, lowering the various ref-counts.
    /// Must be called with `mmu_lock` held (hence the `Stage2` guard),
    /// otherwise another faulting VCPU may come in and mess with things
    /// behind our backs.
    pub(crate) fn unmap_stage2_range(&self, s2: &mut Stage2, start: PhysAddr, size: u64) {
        if let Some(pgd) = s2.pgd {
            unmap_range(Some(self.vmid()), pgd, start, size);
        }
    }

    /// Read-only walk: the leaf currently recorded for `ipa`, if the walk
    /// reaches one. Sentinel intermediates are walked through; a returned
    /// leaf may itself be a non-present sentinel.
    pub fn stage2_translate(&self, ipa: PhysAddr) -> Option<Pte> {
        let s2 = self.mmu.lock();
        translate(s2.pgd?, ipa)
    }

    /// Map a device range into the guest at `guest_ipa`.
    pub fn phys_addr_ioremap(&self, guest_ipa: PhysAddr, pa: u64, size: u64) -> Result<(), Error> {
        let end = (guest_ipa + size + PAGE_SIZE - 1) & PAGE_MASK;
        let mut pfn = pa >> PAGE_SHIFT;
        let mut cache = MmuMemoryCache::new();

        let mut addr = guest_ipa;
        while addr < end {
            let pte = Pte::page(pfn, PAGE_S2_DEVICE);

            cache.topup(2, 2)?;
            let mut s2 = self.mmu.lock();
            stage2_set_pte(self, &mut s2, Some(&mut cache), addr, pte, true)?;
            drop(s2);

            pfn += 1;
            addr += PAGE_SIZE;
        }
        Ok(())
    }

    /// Sweep a memslot's present leaves to stage-2 read-only. Invoked when
    /// dirty-page tracking starts for the slot.
    pub fn set_memslot_readonly(&self, memslot: &Memslot) {
        let start = memslot.base_gfn << PAGE_SHIFT;
        let end = start + (memslot.npages << PAGE_SHIFT);

        let s2 = self.mmu.lock();
        let Some(pgd) = s2.pgd else { return };

        let mut addr = start;
        while addr < end {
            let pud = Desc::from_raw(read_slot(pgd, pud_index(addr)));
            if pud.raw() == 0 {
                addr = pud_addr_end(addr, end);
                continue;
            }

            let pmd_table = pud.table_pfn();
            let pmd = Desc::from_raw(read_slot(pmd_table, pmd_index(addr)));
            if pmd.raw() == 0 {
                addr = pmd_addr_end(addr, end);
                continue;
            }

            let pte_table = pmd.table_pfn();
            let idx = pte_index(addr);
            let mut pte = Pte::from_raw(read_slot(pte_table, idx));
            if self.is_visible_gfn(addr >> PAGE_SHIFT) && !pte.is_none() {
                pte.set_s2_readonly();
                write_slot(pte_table, idx, pte.raw());
                tlb::flush_vmid_ipa(self.vmid(), addr);
            }
            addr += PAGE_SIZE;
        }
    }

    // ── Host-notifier hooks ─────────────────────────────────────────

    /// For every guest page backed by `[start, end)`, apply `handler` to
    /// its guest physical address. We only care about the pages the guest
    /// sees, so the walk is driven by the memslots.
    fn handle_hva_to_gpa(
        &self,
        start: HostVirtAddr,
        end: HostVirtAddr,
        mut handler: impl FnMut(&Kvm, PhysAddr),
    ) {
        for memslot in self.memslots_snapshot() {
            let (slot_start, slot_end) = memslot.hva_range();
            let hva_start = start.max(slot_start);
            let hva_end = end.min(slot_end);
            if hva_start >= hva_end {
                continue;
            }

            let mut gfn = memslot.hva_to_gfn(hva_start);
            let gfn_end = memslot.hva_to_gfn(hva_end + PAGE_SIZE - 1);
            while gfn < gfn_end {
                handler(self, gfn << PAGE_SHIFT);
                gfn += 1;
            }
        }
    }

    /// The host unmapped one page of the backing process: drop the
    /// matching stage-2 page, if any.
    pub fn unmap_hva(&self, hva: HostVirtAddr) {
        if self.mmu.lock().pgd.is_none() {
            return;
        }
        // Pairs with the acquire read in user_mem_abort: a fault that
        // snapshotted the old generation will notice and refault.
        self.mmu_notifier_seq.fetch_add(1, Ordering::Release);
        self.handle_hva_to_gpa(hva, hva + PAGE_SIZE, |kvm, gpa| {
            let mut s2 = kvm.mmu.lock();
            kvm.unmap_stage2_range(&mut s2, gpa, PAGE_SIZE);
        });
    }

    /// Range flavour of [`Kvm::unmap_hva`].
    pub fn unmap_hva_range(&self, start: HostVirtAddr, end: HostVirtAddr) {
        if self.mmu.lock().pgd.is_none() {
            return;
        }
        self.mmu_notifier_seq.fetch_add(1, Ordering::Release);
        self.handle_hva_to_gpa(start, end, |kvm, gpa| {
            let mut s2 = kvm.mmu.lock();
            kvm.unmap_stage2_range(&mut s2, gpa, PAGE_SIZE);
        });
    }

    /// The host moved one page of the backing process to a new frame:
    /// rewrite the matching stage-2 leaves. Runs with a null reserve, so
    /// if the walk would have to allocate it silently declines and the
    /// guest repopulates through the fault path later.
    pub fn set_spte_hva(&self, hva: HostVirtAddr, pfn: Pfn) {
        if self.mmu.lock().pgd.is_none() {
            return;
        }
        self.mmu_notifier_seq.fetch_add(1, Ordering::Release);
        let stage2_pte = Pte::page(pfn, PAGE_S2);
        self.handle_hva_to_gpa(hva, hva + PAGE_SIZE, |kvm, gpa| {
            let mut s2 = kvm.mmu.lock();
            let _ = stage2_set_pte(kvm, &mut s2, None, gpa, stage2_pte, false);
        });
    }
}

/// Install a leaf at `addr` in `kvm`'s stage-2 tree. Caller holds
/// `mmu_lock` (witnessed by the `Stage2` guard).
///
/// With a `None` cache (the host-notifier path, which must not allocate)
/// the walk silently declines whenever it would need a frame or hit a
/// copy-on-access sentinel. With a cache, sentinel intermediates are
/// resolved through the clone engine before the walk continues.
pub(crate) fn stage2_set_pte(
    kvm: &Kvm,
    s2: &mut Stage2,
    mut cache: Option<&mut MmuMemoryCache>,
    addr: PhysAddr,
    new_pte: Pte,
    iomap: bool,
) -> Result<(), Error> {
    let Some(pgd) = s2.pgd else { return Ok(()) };
    let cloning = kvm.cloning_role() != CloningRole::None;

    // Level 1
    let pud_idx = pud_index(addr);
    match Desc::from_raw(read_slot(pgd, pud_idx)).kind() {
        DescKind::Absent => {
            let Some(cache) = cache.as_deref_mut() else {
                return Ok(());
            };
            let pmd_table = cache.alloc();
            write_slot(pgd, pud_idx, Desc::table(pmd_table).raw());
            heap::get_page(pgd);
        }
        DescKind::InvalidTable(_) => {
            if cache.is_none() {
                return Ok(());
            }
            if cloning {
                clone::handle_coa_pud(kvm, cache.as_deref_mut().unwrap(), addr, pgd, pud_idx);
            }
        }
        DescKind::Table(_) => {}
    }
    let pmd_table = Desc::from_raw(read_slot(pgd, pud_idx)).table_pfn();

    // Level 2
    let pmd_idx = pmd_index(addr);
    match Desc::from_raw(read_slot(pmd_table, pmd_idx)).kind() {
        DescKind::Absent => {
            let Some(cache) = cache.as_deref_mut() else {
                return Ok(());
            };
            let pte_table = cache.alloc();
            write_slot(pmd_table, pmd_idx, Desc::table(pte_table).raw());
            heap::get_page(pmd_table);
        }
        DescKind::InvalidTable(_) => {
            if cache.is_none() {
                return Ok(());
            }
            if cloning {
                clone::handle_coa_pmd(kvm, cache.as_deref_mut().unwrap(), addr, pmd_table, pmd_idx);
            }
        }
        DescKind::Table(_) => {}
    }
    let pte_table = Desc::from_raw(read_slot(pmd_table, pmd_idx)).table_pfn();

    // Level 3
    let pte_idx = pte_index(addr);
    let old_pte = Pte::from_raw(read_slot(pte_table, pte_idx));

    // A cloning VM re-establishes its I/O mappings, so the PA may already
    // be mapped; only reject the collision outside of cloning.
    if iomap && old_pte.is_present() && !cloning {
        return Err(Error::PermissionConflict);
    }

    write_slot(pte_table, pte_idx, new_pte.raw());
    kvm.mark_page_dirty(addr >> PAGE_SHIFT);
    if old_pte.is_present() {
        tlb::flush_vmid_ipa(kvm.vmid(), addr);
    } else if !old_pte.is_none() && cloning {
        clone::handle_coa_pte(kvm, addr, old_pte, new_pte, iomap)?;
    } else {
        heap::get_page(pte_table);
    }

    if cloning && !iomap {
        kvm.mark_gfn_unshared(addr >> PAGE_SHIFT);
    }

    // Device memory is not cacheable; for RAM, clean the freshly exposed
    // guest page to the point of coherency.
    if !iomap {
        cache::flush_dcache_guest_page(new_pte.pfn());
    }
    Ok(())
}
