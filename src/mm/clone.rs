//! VM-clone copy-on-access engine.
//!
//! Cloning hands a target VM the source's stage-2 tree without copying any
//! memory up front. Arming clears the table-type bits on every top-level
//! entry of the source (the entry keeps its child's address but no longer
//! translates), so the first touch from either side faults. The fault path
//! then splits the shared intermediate tables one level at a time,
//! propagating the sentinel downwards, until it reaches the shared data
//! page, which is duplicated exactly once between the two VMs:
//!
//! * if the source touches first, it stashes a snapshot of the page in the
//!   pool and keeps the original frame;
//! * if the target touches first, it copies the still-untouched frame
//!   directly and the pool is never involved.
//!
//! The shared-PFN registry is the arbiter: a PFN is removed from it exactly
//! once, and whoever removes it owns the copy obligation.

use alloc::sync::Arc;
use log::error;

use crate::arch::arm::cache;
use crate::arch::arm::defs::*;
use crate::arch::arm::tlb;
use crate::error::Error;
use crate::mm::pgtable::{pud_addr_end, pud_index, read_slot, translate, write_slot, Desc, DescKind, Pte};
use crate::mm::reserve::{MmuMemoryCache, KVM_NR_MEM_OBJS};
use crate::mm::shared::{PagePool, PoolPage, SharedPfnSet};
use crate::mm::stage2::stage2_set_pte;
use crate::mm::heap;
use crate::sync::{LockClass, SpinLock};
use crate::vcpu::Vcpu;
use crate::vm::{CloningRole, Kvm};
use crate::{Gfn, PhysAddr, Pfn};

/// State shared by exactly one source VM and its clone: the copy-on-access
/// lock serializing the two sides' splits, the registry of still-shared
/// PFNs, and the pool of snapshots in flight from source to target.
pub struct ClonePair {
    pub(crate) coa_lock: SpinLock<()>,
    pub(crate) shared: SharedPfnSet,
    pub(crate) pool: PagePool,
}

impl ClonePair {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            coa_lock: SpinLock::new(LockClass::Coa, ()),
            shared: SharedPfnSet::new(),
            pool: PagePool::new(),
        })
    }

    /// Both collections drained means every page either side ever touched
    /// has been fully split.
    pub fn fully_split(&self) -> bool {
        self.shared.is_empty() && self.pool.is_empty()
    }
}

impl Kvm {
    /// Arm this VM as a cloning source: walk every memslot and turn each
    /// present top-level entry into a sentinel, registering the child pmd
    /// table as shared. I/O regions sit outside the memslots and are left
    /// alone.
    ///
    /// The orchestrator has already paused the VM and assigned roles on
    /// both sides.
    pub fn mark_s2_non_present(&self) {
        for memslot in self.memslots_snapshot() {
            self.set_memslot_non_present(&memslot);
        }
    }

    fn set_memslot_non_present(&self, memslot: &crate::memslot::Memslot) {
        let pair = self
            .clone_pair()
            .expect("arming a VM with no clone pair assigned");
        let start = memslot.base_gfn << PAGE_SHIFT;
        let end = start + (memslot.npages << PAGE_SHIFT);

        let s2 = self.mmu.lock();
        let Some(pgd) = s2.pgd else { return };

        let mut addr = start;
        while addr < end {
            let idx = pud_index(addr);
            let pud = Desc::from_raw(read_slot(pgd, idx));
            if let DescKind::Table(pmd_table) = pud.kind() {
                write_slot(pgd, idx, pud.clear_table_type().raw());
                pair.shared.add(pmd_table);
            }
            addr = pud_addr_end(addr, end);
        }
    }
}

/// Hand an armed source's top level to a freshly created target: copy the
/// root entries (all sentinels by now) so both roots reference the same
/// child tables. The orchestrator calls this after `mark_s2_non_present`,
/// with both VMs paused.
pub fn clone_stage2_pgd(source: &Kvm, target: &Kvm) -> Result<(), Error> {
    let src = source.mmu.lock();
    let dst = target.mmu.lock();
    let (Some(src_pgd), Some(dst_pgd)) = (src.pgd, dst.pgd) else {
        return Err(Error::InvalidInput);
    };

    for idx in 0..PTRS_PER_S2_PGD {
        let raw = read_slot(src_pgd, idx);
        write_slot(dst_pgd, idx, raw);
        if raw != 0 {
            // The target root now carries one more populated entry.
            heap::get_page(dst_pgd);
        }
    }
    Ok(())
}

/// Copy every entry of the shared pmd table into a private one, turning
/// both copies into sentinels and registering each child pte table as
/// shared between the two VMs.
fn duplicate_pmd_and_set_non_present(pair: &ClonePair, new_table: Pfn, old_table: Pfn) {
    for i in 0..PTRS_PER_PMD {
        let raw = read_slot(old_table, i);
        if raw == 0 {
            continue;
        }
        let sentinel = Desc::from_raw(raw).clear_table_type().raw();
        write_slot(old_table, i, sentinel);
        write_slot(new_table, i, sentinel);
        pair.shared.add(Desc::from_raw(sentinel).table_pfn());
        heap::get_page(new_table);
    }
}

/// Same one level down: the propagated sentinel is the leaf present bit,
/// and the PFNs registered as shared are guest data pages.
fn duplicate_pte_and_set_non_present(pair: &ClonePair, new_table: Pfn, old_table: Pfn) {
    for i in 0..PTRS_PER_PTE {
        let raw = read_slot(old_table, i);
        if raw == 0 {
            continue;
        }
        let sentinel = Pte::from_raw(raw).clear_present().raw();
        write_slot(old_table, i, sentinel);
        write_slot(new_table, i, sentinel);
        pair.shared.add(Pte::from_raw(sentinel).pfn());
        heap::get_page(new_table);
    }
}

/// A walk hit a sentinel top-level entry. If the child pmd table is still
/// shared, split it: take it off the registry, copy it into a frame from
/// the reserve, push the sentinel one level down on both copies, and
/// repoint this VM's entry at the private copy. If the other side already
/// split it, the table is ours alone; just repair the type bits.
///
/// Caller holds `mmu_lock`.
pub(crate) fn handle_coa_pud(
    kvm: &Kvm,
    cache: &mut MmuMemoryCache,
    _gpa: PhysAddr,
    pgd: Pfn,
    pud_idx: usize,
) {
    let pair = kvm
        .clone_pair()
        .expect("copy-on-access fault with no clone pair");
    let _coa = pair.coa_lock.lock();

    let pud = Desc::from_raw(read_slot(pgd, pud_idx));
    let old_pmd = pud.table_pfn();
    if pair.shared.contains(old_pmd) {
        pair.shared.del(old_pmd);
        let new_pmd = cache.alloc();
        duplicate_pmd_and_set_non_present(&pair, new_pmd, old_pmd);
        write_slot(pgd, pud_idx, Desc::table(new_pmd).raw());
    } else {
        write_slot(pgd, pud_idx, pud.set_table_type().raw());
    }
}

/// Symmetric split of a shared pte table under a sentinel pmd entry.
pub(crate) fn handle_coa_pmd(
    kvm: &Kvm,
    cache: &mut MmuMemoryCache,
    gpa: PhysAddr,
    pmd_table: Pfn,
    pmd_idx: usize,
) {
    let pair = kvm
        .clone_pair()
        .expect("copy-on-access fault with no clone pair");
    let _coa = pair.coa_lock.lock();

    let pmd = Desc::from_raw(read_slot(pmd_table, pmd_idx));
    let old_pte = pmd.table_pfn();
    if pair.shared.contains(old_pte) {
        pair.shared.del(old_pte);
        let new_pte = cache.alloc();
        duplicate_pte_and_set_non_present(&pair, new_pte, old_pte);
        write_slot(pmd_table, pmd_idx, Desc::table(new_pte).raw());
    } else {
        write_slot(pmd_table, pmd_idx, pmd.set_table_type().raw());
    }
    tlb::flush_vmid_ipa(kvm.vmid(), gpa);
}

/// Source side of a data-page split. The translator handed back the same
/// frame the VM always had; if it is still shared, park a snapshot of its
/// current contents in the pool for the target's future first touch.
fn handle_coa_pte_src(
    kvm: &Kvm,
    pair: &ClonePair,
    gpa: PhysAddr,
    old_pte: Pte,
    new_pte: Pte,
) -> Result<(), Error> {
    let old_pfn = old_pte.pfn();
    let new_pfn = new_pte.pfn();
    if old_pfn != new_pfn {
        error!(
            "source VM backing moved during cloning: old pfn {:#x}, new pfn {:#x}",
            old_pfn, new_pfn
        );
        panic!("source VM lost its original frame mid-clone");
    }

    if pair.shared.contains(old_pfn) {
        let hva = kvm.gpa_to_hva(gpa);
        let mut page = PoolPage::alloc()?;
        if kvm.host().copy_from_user(page.as_mut_slice(), hva).is_err() {
            error!("source failed to copy original data for gpa {:#x}", gpa);
        }
        pair.pool.add(old_pfn, page);
        pair.shared.del(old_pfn);
    }
    // The fault path has already written the new leaf with the right
    // attributes; nothing else to do.
    Ok(())
}

/// Target side of a data-page split. The translator handed back a fresh
/// frame; fill it with the page's pre-clone contents, which live either in
/// the still-shared source frame or in the snapshot the source parked in
/// the pool.
fn handle_coa_pte_target(kvm: &Kvm, pair: &ClonePair, gpa: PhysAddr, old_pte: Pte, new_pte: Pte) {
    let old_pfn = old_pte.pfn();
    let new_pfn = new_pte.pfn();
    if old_pfn == new_pfn {
        error!(
            "target VM expected fresh backing: old pfn {:#x}, new pfn {:#x}",
            old_pfn, new_pfn
        );
        panic!("target VM still backed by the source's frame");
    }

    let hva = kvm.gpa_to_hva(gpa);
    if pair.shared.contains(old_pfn) {
        // The source has not diverged yet; its frame still holds the
        // pre-clone contents.
        let from = unsafe {
            core::slice::from_raw_parts(heap::page_va(old_pfn), PAGE_SIZE as usize)
        };
        if kvm.host().copy_to_user(hva, from).is_err() {
            error!("target failed to copy original data for gpa {:#x}", gpa);
        }
        pair.shared.del(old_pfn);
    } else {
        let page = pair
            .pool
            .take(old_pfn)
            .expect("shared page has neither a registry entry nor a snapshot");
        if kvm.host().copy_to_user(hva, page.as_slice()).is_err() {
            error!("target failed to copy original data for gpa {:#x}", gpa);
        }
        // Dropping the snapshot releases its frame.
    }
}

/// An I/O install replaced a sentinel leaf: both halves of a clone redo
/// their ioremaps, so there is nothing to copy, only the sharing record to
/// retire.
fn handle_coa_pte_ioaddr(pair: &ClonePair, old_pte: Pte) {
    let old_pfn = old_pte.pfn();
    if pair.shared.contains(old_pfn) {
        pair.shared.del(old_pfn);
    }
}

/// A leaf install replaced a non-zero, non-present leaf on a cloning VM:
/// run the data-page half of the copy-on-access protocol. The new leaf has
/// already been written by the caller.
///
/// Caller holds `mmu_lock`.
pub(crate) fn handle_coa_pte(
    kvm: &Kvm,
    gpa: PhysAddr,
    old_pte: Pte,
    new_pte: Pte,
    iomap: bool,
) -> Result<(), Error> {
    let pair = kvm
        .clone_pair()
        .expect("copy-on-access fault with no clone pair");
    let _coa = pair.coa_lock.lock();

    let ret = if iomap {
        handle_coa_pte_ioaddr(&pair, old_pte);
        Ok(())
    } else if kvm.cloning_role() == CloningRole::Source {
        handle_coa_pte_src(kvm, &pair, gpa, old_pte, new_pte)
    } else {
        handle_coa_pte_target(kvm, &pair, gpa, old_pte, new_pte);
        Ok(())
    };

    tlb::flush_vmid_ipa(kvm.vmid(), gpa);
    ret
}

impl Kvm {
    /// Proactively run the copy-on-access protocol for one guest frame, as
    /// if the guest had read-faulted on it. Skips frames the VM never
    /// accessed and frames already known exclusive.
    fn unshare_gfn(&self, vcpu: &mut Vcpu, gfn: Gfn, addr: PhysAddr) -> Result<(), Error> {
        {
            let s2 = self.mmu.lock();
            let Some(pgd) = s2.pgd else { return Ok(()) };
            // Unsharing a never-accessed frame is meaningless; the guest
            // will populate it through the regular fault path.
            if translate(pgd, addr).is_none() {
                return Ok(());
            }
        }
        if self.is_gfn_unshared(gfn) {
            return Ok(());
        }

        vcpu.mmu_page_cache.topup(2, KVM_NR_MEM_OBJS)?;

        let (pfn, _) = self.gfn_to_pfn_prot(gfn, true)?;
        let new_pte = Pte::page(pfn, PAGE_S2);
        cache::coherent_icache_guest_page(pfn);

        let mut s2 = self.mmu.lock();
        let ret = stage2_set_pte(self, &mut s2, Some(&mut vcpu.mmu_page_cache), addr, new_pte, false);
        drop(s2);

        self.host().release_pfn(pfn);
        ret
    }

    /// Drive the copy-on-access protocol to completion over a guest
    /// physical range, without any actual guest access.
    ///
    /// Precondition: all VCPUs of both clone halves are paused; the passed
    /// VCPU's reserve is the one consumed.
    pub fn unshare_gfns(
        &self,
        vcpu: &mut Vcpu,
        guest_phys_addr: PhysAddr,
        memory_size: u64,
    ) -> Result<(), Error> {
        let mut gfn = guest_phys_addr >> PAGE_SHIFT;
        let mut addr = guest_phys_addr;
        // The region size from user space is not page-aligned.
        let npages = (memory_size + PAGE_SIZE - 1) >> PAGE_SHIFT;

        for _ in 0..npages {
            self.unshare_gfn(vcpu, gfn, addr)?;
            gfn += 1;
            addr += PAGE_SIZE;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::MockHost;
    use crate::host::HostMemory;
    use crate::memslot::{Memslot, MemslotFlags};
    use crate::testutil::*;
    use alloc::sync::Arc;

    /// A source VM with `npages` populated guest pages, armed for cloning,
    /// plus a target VM adopting the shared tree.
    fn armed_pair(npages: u64) -> (Arc<Kvm>, Arc<Kvm>, Arc<MockHost>, Arc<MockHost>, Arc<ClonePair>) {
        let (src, src_host) = new_vm();
        src.register_memslot(Memslot::new(
            GUEST_BASE_GFN,
            64,
            HOST_BASE_HVA,
            MemslotFlags::empty(),
        ));

        // Seed distinct contents and fault every page in.
        for i in 0..npages {
            let hva = HOST_BASE_HVA + i * PAGE_SIZE;
            src_host.copy_to_user(hva, &page_filled(0x40 + i as u8)).unwrap();
            fault_in(&src, (GUEST_BASE_GFN + i) << PAGE_SHIFT, false).unwrap();
        }

        let pair = ClonePair::new();
        src.set_cloning_role(CloningRole::Source, Some(pair.clone()));
        src.mark_s2_non_present();

        let (tgt, tgt_host) = new_vm_at(TARGET_BASE_HVA);
        tgt.register_memslot(Memslot::new(
            GUEST_BASE_GFN,
            64,
            TARGET_BASE_HVA,
            MemslotFlags::empty(),
        ));
        tgt.set_cloning_role(CloningRole::Target, Some(pair.clone()));
        clone_stage2_pgd(&src, &tgt).unwrap();

        (src, tgt, src_host, tgt_host, pair)
    }

    #[test]
    fn test_arming_plants_sentinels_and_registers_tables() {
        let (src, _src_host) = new_vm();
        src.register_memslot(Memslot::new(
            GUEST_BASE_GFN,
            64,
            HOST_BASE_HVA,
            MemslotFlags::empty(),
        ));
        let ipa = GUEST_BASE_GFN << PAGE_SHIFT;
        fault_in(&src, ipa, false).unwrap();

        let pair = ClonePair::new();
        src.set_cloning_role(CloningRole::Source, Some(pair.clone()));
        src.mark_s2_non_present();

        let pgd = src.mmu.lock().pgd.unwrap();
        let pud = Desc::from_raw(read_slot(pgd, pud_index(ipa)));
        let DescKind::InvalidTable(pmd_table) = pud.kind() else {
            panic!("top-level entry not turned into a sentinel");
        };
        assert!(pair.shared.contains(pmd_table));
        assert_eq!(pair.shared.len(), 1);
    }

    #[test]
    fn test_source_first_touch_stashes_snapshot() {
        // Source reads its page first: the pmd and pte tables split, then
        // the source parks a snapshot in the pool and keeps its frame.
        let (src, _tgt, src_host, _tgt_host, pair) = armed_pair(1);
        let ipa = GUEST_BASE_GFN << PAGE_SHIFT;
        let original_pfn = src_host.frame_for(HOST_BASE_HVA).unwrap();

        fault_in(&src, ipa, false).unwrap();

        let leaf = src.stage2_translate(ipa).expect("leaf reinstalled");
        assert!(leaf.is_present());
        assert_eq!(leaf.pfn(), original_pfn);

        // The data page moved from the registry into the pool.
        assert!(!pair.shared.contains(original_pfn));
        assert_eq!(pair.pool.len(), 1);

        // The top-level sentinel was repaired on the source.
        let pgd = src.mmu.lock().pgd.unwrap();
        assert!(matches!(
            Desc::from_raw(read_slot(pgd, pud_index(ipa))).kind(),
            DescKind::Table(_)
        ));
    }

    #[test]
    fn test_target_touch_after_source_consumes_pool_snapshot() {
        let (src, tgt, src_host, tgt_host, pair) = armed_pair(1);
        let ipa = GUEST_BASE_GFN << PAGE_SHIFT;

        // Source touches first and then scribbles over its page.
        fault_in(&src, ipa, false).unwrap();
        src_host.copy_to_user(HOST_BASE_HVA, &page_filled(0xEE)).unwrap();

        // Target's first touch must see the pre-divergence contents.
        fault_in(&tgt, ipa, false).unwrap();

        let src_pfn = src_host.frame_for(HOST_BASE_HVA).unwrap();
        let tgt_leaf = tgt.stage2_translate(ipa).unwrap();
        assert!(tgt_leaf.is_present());
        assert_ne!(tgt_leaf.pfn(), src_pfn);

        let mut got = [0u8; PAGE_SIZE as usize];
        tgt_host.copy_from_user(&mut got, TARGET_BASE_HVA).unwrap();
        assert_eq!(got, page_filled(0x40));

        assert!(pair.fully_split());
    }

    #[test]
    fn test_target_first_touch_copies_live_frame() {
        let (src, tgt, src_host, tgt_host, pair) = armed_pair(1);
        let ipa = GUEST_BASE_GFN << PAGE_SHIFT;

        // Target touches first: it reads the still-shared source frame and
        // the pool stays empty.
        fault_in(&tgt, ipa, false).unwrap();
        assert!(pair.pool.is_empty());

        let mut got = [0u8; PAGE_SIZE as usize];
        tgt_host.copy_from_user(&mut got, TARGET_BASE_HVA).unwrap();
        assert_eq!(got, page_filled(0x40));

        // The source's later read proceeds as a plain population with its
        // original frame, with nothing left to copy.
        fault_in(&src, ipa, false).unwrap();
        let src_leaf = src.stage2_translate(ipa).unwrap();
        assert_eq!(src_leaf.pfn(), src_host.frame_for(HOST_BASE_HVA).unwrap());

        assert!(pair.fully_split());
    }

    #[test]
    fn test_both_sides_converge_regardless_of_order() {
        // Four pages, touched in different interleavings: both VMs must end
        // up with distinct frames and byte-equal contents everywhere, and
        // the shared state must drain completely.
        let (src, tgt, src_host, tgt_host, pair) = armed_pair(4);

        let ipa = |i: u64| (GUEST_BASE_GFN + i) << PAGE_SHIFT;
        fault_in(&src, ipa(0), false).unwrap(); // source first
        fault_in(&tgt, ipa(0), false).unwrap();
        fault_in(&tgt, ipa(1), false).unwrap(); // target first
        fault_in(&src, ipa(1), false).unwrap();
        fault_in(&src, ipa(2), false).unwrap(); // source only, then target
        fault_in(&tgt, ipa(2), false).unwrap();
        fault_in(&tgt, ipa(3), false).unwrap();
        fault_in(&src, ipa(3), false).unwrap();

        for i in 0..4u64 {
            let src_leaf = src.stage2_translate(ipa(i)).unwrap();
            let tgt_leaf = tgt.stage2_translate(ipa(i)).unwrap();
            assert!(src_leaf.is_present() && tgt_leaf.is_present());
            assert_ne!(src_leaf.pfn(), tgt_leaf.pfn());

            let mut src_bytes = [0u8; PAGE_SIZE as usize];
            let mut tgt_bytes = [0u8; PAGE_SIZE as usize];
            src_host.copy_from_user(&mut src_bytes, HOST_BASE_HVA + i * PAGE_SIZE).unwrap();
            tgt_host.copy_from_user(&mut tgt_bytes, TARGET_BASE_HVA + i * PAGE_SIZE).unwrap();
            assert_eq!(src_bytes, tgt_bytes);
            assert_eq!(src_bytes, page_filled(0x40 + i as u8));
        }

        assert!(pair.shared.is_empty(), "registry must drain");
        assert!(pair.pool.is_empty(), "pool must drain");
    }

    #[test]
    fn test_unshare_gfns_equals_guest_read_faults() {
        let (src, tgt, _src_host, _tgt_host, pair) = armed_pair(3);
        let base = GUEST_BASE_GFN << PAGE_SHIFT;

        let mut vcpu = Vcpu::new();
        src.unshare_gfns(&mut vcpu, base, 3 * PAGE_SIZE).unwrap();

        for i in 0..3u64 {
            let gfn = GUEST_BASE_GFN + i;
            let leaf = src.stage2_translate(gfn << PAGE_SHIFT).unwrap();
            assert!(leaf.is_present());
            assert!(src.is_gfn_unshared(gfn));
        }
        // Every touched data page moved into the pool for the target.
        assert_eq!(pair.pool.len(), 3);

        // A second run is a no-op.
        src.unshare_gfns(&mut vcpu, base, 3 * PAGE_SIZE).unwrap();
        assert_eq!(pair.pool.len(), 3);

        // The target still gets pristine contents afterwards.
        fault_in(&tgt, base, false).unwrap();
        assert_eq!(pair.pool.len(), 2);
    }

    #[test]
    fn test_source_fault_respects_readonly_vma() {
        // An armed VM decides writability from the backing VMA, not from
        // the fault: a read-only VMA yields a read-only leaf.
        let (src, _tgt, src_host, _tgt_host, _pair) = armed_pair(1);
        src_host.set_vma_writable(false);

        let ipa = GUEST_BASE_GFN << PAGE_SHIFT;
        fault_in(&src, ipa, false).unwrap();

        let leaf = src.stage2_translate(ipa).unwrap();
        assert!(leaf.is_present());
        assert!(!leaf.is_s2_writable());
    }

    #[test]
    fn test_unshare_skips_untouched_gfns() {
        let (src, _tgt, _sh, _th, pair) = armed_pair(1);
        let registered = pair.shared.len();

        // GFNs the guest never accessed are left for the fault path.
        let mut vcpu = Vcpu::new();
        let untouched = (GUEST_BASE_GFN + 20) << PAGE_SHIFT;
        src.unshare_gfns(&mut vcpu, untouched, PAGE_SIZE).unwrap();
        assert_eq!(pair.shared.len(), registered);
        assert!(src.stage2_translate(untouched).is_none());
    }
}
