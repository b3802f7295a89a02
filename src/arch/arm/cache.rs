//! Cache maintenance.
//!
//! The CPU table walker reads page tables from memory at the point of
//! coherency, and a guest may run with caches disabled, so freshly written
//! descriptors and freshly populated guest pages have to be cleaned out of
//! the data cache before they become architecturally visible.

use crate::arch::arm::defs::{PAGE_SHIFT, PAGE_SIZE};
use crate::Pfn;

#[cfg(target_arch = "arm")]
const DCACHE_LINE: u64 = 64;

/// Clean `[addr, addr + len)` to the point of coherency.
pub fn clean_dcache_to_poc(addr: u64, len: u64) {
    #[cfg(target_arch = "arm")]
    unsafe {
        let mut va = addr & !(DCACHE_LINE - 1);
        while va < addr + len {
            // DCCMVAC: clean data cache line by MVA to PoC.
            core::arch::asm!(
                "mcr p15, 0, {va}, c7, c10, 1",
                va = in(reg) va as u32,
                options(nostack),
            );
            va += DCACHE_LINE;
        }
        core::arch::asm!("dsb ish", options(nostack));
    }

    #[cfg(not(target_arch = "arm"))]
    let _ = (addr, len);
}

/// Clean a whole guest data page to the point of coherency.
pub fn flush_dcache_guest_page(pfn: Pfn) {
    clean_dcache_to_poc(pfn << PAGE_SHIFT, PAGE_SIZE);
}

/// Make the instruction stream coherent with a freshly populated guest
/// page, for the case where the guest is about to execute from it.
pub fn coherent_icache_guest_page(pfn: Pfn) {
    clean_dcache_to_poc(pfn << PAGE_SHIFT, PAGE_SIZE);

    #[cfg(target_arch = "arm")]
    unsafe {
        // ICIALLUIS: the page may be mapped at any guest VA, so invalidate
        // the whole instruction cache rather than chase aliases.
        core::arch::asm!(
            "mcr p15, 0, {zero}, c7, c1, 0",
            "dsb ish",
            "isb",
            zero = in(reg) 0u32,
            options(nostack),
        );
    }
}
