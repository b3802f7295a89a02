//! Shared fixtures for the host-side test suite.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU16, Ordering};

use crate::arch::arm::defs::*;
use crate::error::Error;
use crate::host::mock::MockHost;
use crate::mm::fault::GuestExit;
use crate::mm::heap;
use crate::mm::pgtable::Pte;
use crate::mm::reserve::MmuMemoryCache;
use crate::mm::stage2::stage2_set_pte;
use crate::vcpu::Vcpu;
use crate::vm::Kvm;
use crate::{Gfn, HostVirtAddr, PhysAddr, Pfn};

pub(crate) const GUEST_BASE_GFN: Gfn = 0x40000;
pub(crate) const HOST_BASE_HVA: HostVirtAddr = 0x7000_0000;
pub(crate) const TARGET_BASE_HVA: HostVirtAddr = 0x7800_0000;

const MOCK_NPAGES: u64 = 64;

/// Tests run in parallel and the TLB journal is global, so every VM gets a
/// fresh VMID to key its journal entries.
static NEXT_VMID: AtomicU16 = AtomicU16::new(1);

/// A VM with an allocated stage-2 root and a mock host of `MOCK_NPAGES`
/// user pages starting at `base`.
pub(crate) fn new_vm_at(base: HostVirtAddr) -> (Arc<Kvm>, Arc<MockHost>) {
    let host = MockHost::new(base, MOCK_NPAGES);
    let kvm = Arc::new(Kvm::new(
        NEXT_VMID.fetch_add(1, Ordering::Relaxed),
        host.clone(),
    ));
    host.bind(&kvm);
    kvm.alloc_stage2_pgd().unwrap();
    (kvm, host)
}

pub(crate) fn new_vm() -> (Arc<Kvm>, Arc<MockHost>) {
    new_vm_at(HOST_BASE_HVA)
}

/// An owned frame (or a naturally aligned pair) released on drop.
pub(crate) struct OwnedFrame {
    pub pfn: Pfn,
    pages: usize,
}

impl OwnedFrame {
    pub fn alloc() -> Self {
        Self {
            pfn: heap::alloc_page().unwrap(),
            pages: 1,
        }
    }

    /// Two physically contiguous frames, for ranges that must straddle a
    /// page boundary.
    pub fn alloc_pair() -> Self {
        let layout = pair_layout();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self {
            pfn: (ptr as u64) >> PAGE_SHIFT,
            pages: 2,
        }
    }
}

fn pair_layout() -> std::alloc::Layout {
    std::alloc::Layout::from_size_align(2 * PAGE_SIZE as usize, PAGE_SIZE as usize).unwrap()
}

impl Drop for OwnedFrame {
    fn drop(&mut self) {
        if self.pages == 1 {
            heap::free_page(self.pfn);
        } else {
            unsafe { std::alloc::dealloc(heap::page_va(self.pfn), pair_layout()) };
        }
    }
}

pub(crate) fn alloc_guest_frame() -> OwnedFrame {
    OwnedFrame::alloc()
}

/// Install a leaf directly, with a locally topped-up reserve.
pub(crate) fn set_pte(kvm: &Kvm, ipa: PhysAddr, pte: Pte, iomap: bool) -> Result<(), Error> {
    let mut cache = MmuMemoryCache::new();
    cache.topup(2, 4)?;
    let mut s2 = kvm.mmu.lock();
    stage2_set_pte(kvm, &mut s2, Some(&mut cache), ipa, pte, iomap)
}

/// A VCPU that just took a data abort at `ipa` with fault status `fsc`.
pub(crate) fn vcpu_with_fault(ipa: PhysAddr, write: bool, fsc: u32) -> Vcpu {
    let mut hsr = (HSR_EC_DABT << HSR_EC_SHIFT) | fsc;
    if write {
        hsr |= HSR_WNR;
    }
    let mut vcpu = Vcpu::new();
    // The guest VA is arbitrary; only its low 12 bits ever matter.
    vcpu.set_fault(hsr, ipa as u32, (ipa >> 8) as u32);
    vcpu
}

/// Run a translation fault at `ipa` through the dispatcher.
pub(crate) fn fault_in(kvm: &Kvm, ipa: PhysAddr, write: bool) -> Result<GuestExit, Error> {
    let mut vcpu = vcpu_with_fault(ipa, write, FSC_FAULT);
    kvm.handle_guest_abort(&mut vcpu)
}

/// A page-sized buffer filled with `byte`.
pub(crate) fn page_filled(byte: u8) -> [u8; PAGE_SIZE as usize] {
    [byte; PAGE_SIZE as usize]
}
