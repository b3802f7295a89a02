//! Per-VCPU state the memory core needs.
//!
//! Register emulation lives outside this crate; what the fault path needs
//! from a VCPU is the trap syndrome the front-end recorded on exit, a
//! per-VCPU page-table reserve, and somewhere to latch an injected
//! prefetch abort for the emulation layer to deliver.

use crate::arch::arm::defs::*;
use crate::mm::reserve::MmuMemoryCache;
use crate::PhysAddr;

/// Syndrome of the last stage-2 abort, as captured by the trap front-end.
#[derive(Clone, Copy, Default)]
struct FaultInfo {
    /// Hyp Syndrome Register.
    hsr: u32,
    /// Hyp fault address register (HDFAR or HIFAR): the faulting VA.
    hxfar: u32,
    /// Hyp IPA fault address register: IPA[39:12] in bits [31:4].
    hpfar: u32,
}

pub struct Vcpu {
    fault: FaultInfo,
    pub(crate) mmu_page_cache: MmuMemoryCache,
    pending_pabt: Option<u32>,
}

impl Vcpu {
    pub fn new() -> Self {
        Self {
            fault: FaultInfo::default(),
            mmu_page_cache: MmuMemoryCache::new(),
            pending_pabt: None,
        }
    }

    /// Record the syndrome of a fresh guest exit.
    pub fn set_fault(&mut self, hsr: u32, hxfar: u32, hpfar: u32) {
        self.fault = FaultInfo { hsr, hxfar, hpfar };
    }

    pub fn hsr(&self) -> u32 {
        self.fault.hsr
    }

    /// Faulting virtual address.
    pub fn hfar(&self) -> u32 {
        self.fault.hxfar
    }

    /// Faulting IPA. Only bits [39:12] are reported by hardware; the page
    /// offset has to be reconstructed from the VA when it matters.
    pub fn fault_ipa(&self) -> PhysAddr {
        (self.fault.hpfar as PhysAddr) << 8
    }

    pub fn trap_class(&self) -> u32 {
        (self.fault.hsr >> HSR_EC_SHIFT) & HSR_EC_MASK
    }

    pub fn trap_is_iabt(&self) -> bool {
        self.trap_class() == HSR_EC_IABT
    }

    /// Fault status with the level bits masked off (FSC_FAULT, FSC_PERM...).
    pub fn trap_fault_status(&self) -> u32 {
        self.fault.hsr & HSR_FSC_TYPE
    }

    pub fn is_write_fault(&self) -> bool {
        if self.trap_is_iabt() {
            return false;
        }
        self.fault.hsr & HSR_WNR != 0
    }

    /// Queue a prefetch abort at `addr` for the guest. The register
    /// emulation layer picks it up before the next guest entry.
    pub fn inject_pabt(&mut self, addr: u32) {
        self.pending_pabt = Some(addr);
    }

    /// Consume the queued prefetch abort, if any.
    pub fn take_pending_pabt(&mut self) -> Option<u32> {
        self.pending_pabt.take()
    }

    /// Release the frames held by this VCPU's page-table reserve.
    pub fn free_memory_cache(&mut self) {
        self.mmu_page_cache.free_all();
    }
}

impl Default for Vcpu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_decode() {
        let mut vcpu = Vcpu::new();

        // Data abort, write, translation fault at IPA 0x4000_1000.
        let hsr = (HSR_EC_DABT << HSR_EC_SHIFT) | HSR_WNR | FSC_FAULT;
        vcpu.set_fault(hsr, 0x8000_1234, (0x4000_1000u64 >> 8) as u32);

        assert!(!vcpu.trap_is_iabt());
        assert!(vcpu.is_write_fault());
        assert_eq!(vcpu.trap_fault_status(), FSC_FAULT);
        assert_eq!(vcpu.fault_ipa(), 0x4000_1000);
        assert_eq!(vcpu.hfar(), 0x8000_1234);
    }

    #[test]
    fn test_iabt_is_never_a_write() {
        let mut vcpu = Vcpu::new();
        let hsr = (HSR_EC_IABT << HSR_EC_SHIFT) | HSR_WNR | FSC_FAULT;
        vcpu.set_fault(hsr, 0, 0);
        assert!(vcpu.trap_is_iabt());
        assert!(!vcpu.is_write_fault());
    }

    #[test]
    fn test_pending_pabt_latch() {
        let mut vcpu = Vcpu::new();
        assert!(vcpu.take_pending_pabt().is_none());
        vcpu.inject_pabt(0xdead_b000);
        assert_eq!(vcpu.take_pending_pabt(), Some(0xdead_b000));
        assert!(vcpu.take_pending_pabt().is_none());
    }
}
