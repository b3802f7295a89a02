//! Stage-2 abort dispatch.
//!
//! Any abort that gets here is almost guaranteed to be either a missing
//! stage-2 translation (the guest simply needs the page populated) or an
//! access to I/O memory emulated by user space. The distinction is made on
//! whether the faulting IPA falls inside a registered memslot.

use core::sync::atomic::Ordering;
use log::error;

use crate::arch::arm::cache;
use crate::arch::arm::defs::*;
use crate::error::Error;
use crate::mm::reserve::KVM_NR_MEM_OBJS;
use crate::mm::pgtable::Pte;
use crate::mm::stage2::stage2_set_pte;
use crate::vcpu::Vcpu;
use crate::vm::{CloningRole, Kvm};
use crate::{Gfn, PhysAddr};

/// What the embedder should do with the guest after a handled abort.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GuestExit {
    /// The fault was resolved (or an abort was injected); re-enter the
    /// guest.
    Resume,
    /// The access hit emulated I/O space: hand `fault_ipa` to the
    /// user-space MMIO emulator.
    Mmio { fault_ipa: PhysAddr },
}

impl Kvm {
    /// Handle a stage-2 abort recorded on `vcpu`.
    pub fn handle_guest_abort(&self, vcpu: &mut Vcpu) -> Result<GuestExit, Error> {
        let is_iabt = vcpu.trap_is_iabt();
        let mut fault_ipa = vcpu.fault_ipa();

        let fault_status = vcpu.trap_fault_status();
        if fault_status != FSC_FAULT && fault_status != FSC_PERM {
            error!(
                "unsupported fault status: EC={:#x} FSC={:#x}",
                vcpu.trap_class(),
                fault_status
            );
            return Err(Error::BadFaultStatus);
        }

        let gfn = fault_ipa >> PAGE_SHIFT;
        if !self.is_visible_gfn(gfn) {
            if is_iabt {
                // Prefetch abort on an I/O address.
                vcpu.inject_pabt(vcpu.hfar());
                return Ok(GuestExit::Resume);
            }

            if fault_status != FSC_FAULT {
                error!("unsupported fault status on io memory: {:#x}", fault_status);
                return Err(Error::BadFaultStatus);
            }

            // The IPA is reported as [39:12], so complement it with the
            // bottom 12 bits of the faulting VA. These are always 12 bits,
            // irrespective of the page size.
            fault_ipa |= (vcpu.hfar() as PhysAddr) & ((1 << 12) - 1);
            return Ok(GuestExit::Mmio { fault_ipa });
        }

        self.user_mem_abort(vcpu, fault_ipa, gfn, fault_status)?;
        Ok(GuestExit::Resume)
    }

    /// Populate (or re-permission) the stage-2 leaf for a faulting RAM
    /// page.
    fn user_mem_abort(
        &self,
        vcpu: &mut Vcpu,
        fault_ipa: PhysAddr,
        gfn: Gfn,
        fault_status: u32,
    ) -> Result<(), Error> {
        let write_fault = vcpu.is_write_fault();
        let cloning = self.cloning_role() != CloningRole::None;

        // Read permission faults do not happen on a correctly populated
        // tree; on a cloning VM they are the non-present sentinel at work.
        if fault_status == FSC_PERM && !write_fault && !cloning {
            error!("unexpected stage-2 read permission fault at {:#x}", fault_ipa);
            return Err(Error::PermissionConflict);
        }

        // We need at worst second and third level tables for the walk.
        vcpu.mmu_page_cache.topup(2, KVM_NR_MEM_OBJS)?;

        let mmu_seq = self.mmu_notifier_seq.load(Ordering::Acquire);
        // The acquire read of mmu_notifier_seq must happen before the
        // GFN->PFN translation below. Otherwise the page we get a reference
        // to could be unmapped by the host before we grab mmu_lock, and the
        // retry check underneath the lock would not notice. Pairs with the
        // release increment in the unmap_hva hooks.

        let is_writable = if cloning {
            self.gfn_is_writable(gfn)
        } else {
            write_fault
        };

        let (pfn, writable) = self.gfn_to_pfn_prot(gfn, is_writable)?;
        let mut new_pte = Pte::page(pfn, PAGE_S2);
        cache::coherent_icache_guest_page(pfn);

        let mut ret = Ok(());
        {
            let mut s2 = self.mmu.lock();
            if self.mmu_notifier_retry(mmu_seq) {
                // The host invalidated the backing while we were resolving
                // it; drop everything and let the guest refault.
            } else {
                if writable {
                    new_pte.set_s2_writable();
                    self.host().set_pfn_dirty(pfn);
                }
                ret = stage2_set_pte(
                    self,
                    &mut s2,
                    Some(&mut vcpu.mmu_page_cache),
                    fault_ipa,
                    new_pte,
                    false,
                );
                if ret.is_ok() && write_fault {
                    self.mark_page_dirty(gfn);
                }
            }
        }
        self.host().release_pfn(pfn);
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memslot::{Memslot, MemslotFlags};
    use crate::testutil::*;

    #[test]
    fn test_lazy_population_on_read_fault() {
        let (kvm, host) = new_vm();
        kvm.register_memslot(Memslot::new(
            GUEST_BASE_GFN,
            16,
            HOST_BASE_HVA,
            MemslotFlags::empty(),
        ));

        let ipa = 0x4000_1000u64;
        let exit = fault_in(&kvm, ipa, false).unwrap();
        assert_eq!(exit, GuestExit::Resume);

        let leaf = kvm.stage2_translate(ipa).expect("populated");
        assert!(leaf.is_present());
        assert!(!leaf.is_s2_writable());
        assert_eq!(leaf.pfn(), host.frame_for(HOST_BASE_HVA + 0x1000).unwrap());
        // The translator reference was dropped after install.
        assert_eq!(host.released(), 1);
    }

    #[test]
    fn test_write_fault_installs_writable_leaf_and_marks_dirty() {
        let (kvm, host) = new_vm();
        let slot = kvm.register_memslot(Memslot::new(
            GUEST_BASE_GFN,
            16,
            HOST_BASE_HVA,
            MemslotFlags::empty(),
        ));

        let ipa = GUEST_BASE_GFN << PAGE_SHIFT;
        fault_in(&kvm, ipa, true).unwrap();

        let leaf = kvm.stage2_translate(ipa).unwrap();
        assert!(leaf.is_s2_writable());
        assert!(slot.is_dirty(GUEST_BASE_GFN));
        assert_eq!(host.dirtied(), 1);
    }

    #[test]
    fn test_write_to_readonly_slot_stays_readonly() {
        let (kvm, _host) = new_vm();
        kvm.register_memslot(Memslot::new(
            GUEST_BASE_GFN,
            16,
            HOST_BASE_HVA,
            MemslotFlags::READONLY,
        ));

        let ipa = GUEST_BASE_GFN << PAGE_SHIFT;
        // A write permission fault passes the perm-non-write check, but the
        // slot never grants write access, so the leaf stays read-only and
        // user space has to intervene.
        let mut vcpu = vcpu_with_fault(ipa, true, FSC_PERM);
        assert_eq!(kvm.handle_guest_abort(&mut vcpu), Ok(GuestExit::Resume));

        let leaf = kvm.stage2_translate(ipa).unwrap();
        assert!(leaf.is_present());
        assert!(!leaf.is_s2_writable());
    }

    #[test]
    fn test_read_permission_fault_is_rejected_outside_cloning() {
        let (kvm, _host) = new_vm();
        kvm.register_memslot(Memslot::new(
            GUEST_BASE_GFN,
            16,
            HOST_BASE_HVA,
            MemslotFlags::empty(),
        ));

        let ipa = GUEST_BASE_GFN << PAGE_SHIFT;
        let mut vcpu = vcpu_with_fault(ipa, false, FSC_PERM);
        assert_eq!(
            kvm.handle_guest_abort(&mut vcpu),
            Err(Error::PermissionConflict)
        );
    }

    #[test]
    fn test_unsupported_fault_status_is_fatal() {
        let (kvm, _host) = new_vm();
        // FSC 0x10: synchronous external abort.
        let mut vcpu = vcpu_with_fault(0x4000_0000, false, 0x10);
        assert_eq!(kvm.handle_guest_abort(&mut vcpu), Err(Error::BadFaultStatus));
    }

    #[test]
    fn test_data_abort_outside_memslots_routes_to_mmio() {
        let (kvm, _host) = new_vm();
        // No memslot registered at all: everything is I/O space. The low
        // 12 bits come back from the faulting VA.
        let ipa = 0x0900_0000u64;
        let mut vcpu = Vcpu::new();
        vcpu.set_fault(
            (HSR_EC_DABT << HSR_EC_SHIFT) | HSR_WNR | FSC_FAULT,
            0xF100_0004,
            (ipa >> 8) as u32,
        );
        assert_eq!(
            kvm.handle_guest_abort(&mut vcpu),
            Ok(GuestExit::Mmio { fault_ipa: ipa | 0x004 })
        );
    }

    #[test]
    fn test_instruction_fetch_outside_memslots_injects_pabt() {
        let (kvm, _host) = new_vm();
        let mut vcpu = Vcpu::new();
        vcpu.set_fault(
            (HSR_EC_IABT << HSR_EC_SHIFT) | FSC_FAULT,
            0xDEAD_0000,
            (0x0900_0000u64 >> 8) as u32,
        );
        assert_eq!(kvm.handle_guest_abort(&mut vcpu), Ok(GuestExit::Resume));
        assert_eq!(vcpu.take_pending_pabt(), Some(0xDEAD_0000));
        assert!(kvm.stage2_translate(0x0900_0000).is_none());
    }

    #[test]
    fn test_perm_fault_on_io_memory_is_fatal() {
        let (kvm, _host) = new_vm();
        let mut vcpu = vcpu_with_fault(0x0900_0000, true, FSC_PERM);
        assert_eq!(kvm.handle_guest_abort(&mut vcpu), Err(Error::BadFaultStatus));
    }

    #[test]
    fn test_racing_host_invalidation_retries_cleanly() {
        let (kvm, host) = new_vm();
        kvm.register_memslot(Memslot::new(
            GUEST_BASE_GFN,
            16,
            HOST_BASE_HVA,
            MemslotFlags::empty(),
        ));

        // The host unmaps the page between our notifier snapshot and the
        // mmu_lock acquisition: the handler must install nothing and
        // succeed, leaving the guest to refault.
        host.invalidate_on_next_translate();
        let ipa = GUEST_BASE_GFN << PAGE_SHIFT;
        assert_eq!(fault_in(&kvm, ipa, false), Ok(GuestExit::Resume));
        assert!(kvm.stage2_translate(ipa).is_none());
        assert_eq!(host.released(), 1);

        // The refault then sticks.
        fault_in(&kvm, ipa, false).unwrap();
        assert!(kvm.stage2_translate(ipa).is_some());
    }
}
