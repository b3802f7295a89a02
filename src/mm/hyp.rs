//! HYP-mode page tables.
//!
//! HYP mode runs with its own stage-1 translation. Two trees are built at
//! init and never mutated afterwards:
//!
//! * a boot tree holding an identity mapping of the HYP init code plus the
//!   trampoline page, used exactly once to enter HYP with the MMU coming
//!   up at a predictable address;
//! * a runtime tree holding the trampoline plus every kernel-range and
//!   vmalloc-range mapping the hypervisor needs at runtime.
//!
//! If the init code straddles a page boundary the identity mapping would
//! need two pages, so the code is copied into a freshly allocated bounce
//! page, flushed to the point of coherency (HYP runs with caches off at
//! that point), and the entry vector is rebased into the copy.

use core::ops::Range;
use log::{error, info};

use crate::arch::arm::cache;
use crate::arch::arm::defs::*;
use crate::error::Error;
use crate::mm::heap;
use crate::mm::pgtable::{
    pmd_addr_end, pmd_index, pte_index, pud_addr_end, pud_index, read_slot, translate,
    unmap_range, write_slot, Desc, Pte,
};
use crate::sync::{LockClass, SpinLock};
use crate::{PhysAddr, Pfn};

/// The hypervisor's own memory is linearly mapped; a kernel virtual
/// address and its physical address coincide.
fn virt_to_phys(va: u64) -> PhysAddr {
    va
}

/// HYP VAs mirror kernel VAs one to one (the HYP offset is zero), so a
/// kernel range can be duplicated into the HYP tree at the same address.
fn kern_to_hyp(kva: u64) -> u64 {
    kva
}

/// Addresses the HYP builder needs from the embedding kernel image.
pub struct HypLayout {
    /// Kernel VA range of the HYP init code to identity-map.
    pub idmap_text_start: u64,
    pub idmap_text_end: u64,
    /// Kernel VA of the HYP init entry point, inside the idmap text.
    pub init_vector: u64,
    /// VA range of the linearly mapped kernel, accepted by
    /// [`HypMmu::create_hyp_mappings`].
    pub kernel_range: Range<u64>,
    /// VA range of the kernel's vmalloc/ioremap area, accepted by
    /// [`HypMmu::create_hyp_io_mappings`].
    pub vmalloc_range: Range<u64>,
}

struct HypTables {
    boot_pgd: Option<Pfn>,
    pgd: Option<Pfn>,
    init_bounce_page: Option<Pfn>,
    /// Physical range of the (possibly bounced) init code.
    idmap_start: PhysAddr,
    idmap_end: PhysAddr,
    idmap_vector: PhysAddr,
    kernel_range: Range<u64>,
    vmalloc_range: Range<u64>,
}

pub struct HypMmu {
    tables: SpinLock<HypTables>,
}

impl HypMmu {
    /// Build the boot and runtime HYP trees.
    pub fn init(layout: HypLayout) -> Result<Self, Error> {
        let mut idmap_start = virt_to_phys(layout.idmap_text_start);
        let mut idmap_end = virt_to_phys(layout.idmap_text_end);
        let mut idmap_vector = virt_to_phys(layout.init_vector);
        let mut init_bounce_page = None;

        if (idmap_start ^ idmap_end) & PAGE_MASK != 0 {
            // Our init code is crossing a page boundary. Allocate a bounce
            // page, copy the code over and use that.
            let len = (idmap_end - idmap_start) as usize;
            let Some(bounce) = heap::alloc_page() else {
                error!("couldn't allocate HYP init bounce page");
                return Err(Error::OutOfMemory);
            };
            unsafe {
                core::ptr::copy_nonoverlapping(
                    layout.idmap_text_start as usize as *const u8,
                    heap::page_va(bounce),
                    len,
                );
            }
            // The copy must reach the point of coherency: HYP fetches it
            // with caches off.
            cache::clean_dcache_to_poc(bounce << PAGE_SHIFT, len as u64);

            let phys_base = bounce << PAGE_SHIFT;
            idmap_vector = idmap_vector.wrapping_add(phys_base.wrapping_sub(idmap_start));
            idmap_start = phys_base;
            idmap_end = phys_base + len as u64;
            init_bounce_page = Some(bounce);

            info!("using HYP init bounce page @{:#x}", phys_base);
        }

        let pgd = heap::alloc_page();
        let boot_pgd = heap::alloc_page();
        let hyp = Self {
            tables: SpinLock::new(LockClass::Mmu, HypTables {
                boot_pgd,
                pgd,
                init_bounce_page,
                idmap_start,
                idmap_end,
                idmap_vector,
                kernel_range: layout.kernel_range,
                vmalloc_range: layout.vmalloc_range,
            }),
        };
        if pgd.is_none() || boot_pgd.is_none() {
            error!("HYP mode PGD not allocated");
            hyp.free_pgds();
            return Err(Error::OutOfMemory);
        }

        if let Err(err) = hyp.build_boot_mappings() {
            hyp.free_pgds();
            return Err(err);
        }
        Ok(hyp)
    }

    fn build_boot_mappings(&self) -> Result<(), Error> {
        let t = self.tables.lock();
        let boot_pgd = t.boot_pgd.unwrap();
        let pgd = t.pgd.unwrap();

        // Create the idmap in the boot table.
        if let Err(err) = __create_hyp_mappings(
            boot_pgd,
            t.idmap_start,
            t.idmap_end,
            t.idmap_start >> PAGE_SHIFT,
            PAGE_HYP,
        ) {
            error!("failed to idmap {:#x}-{:#x}", t.idmap_start, t.idmap_end);
            return Err(err);
        }

        // Map the very same page at the trampoline VA.
        if let Err(err) = __create_hyp_mappings(
            boot_pgd,
            TRAMPOLINE_VA,
            TRAMPOLINE_VA + PAGE_SIZE,
            t.idmap_start >> PAGE_SHIFT,
            PAGE_HYP,
        ) {
            error!("failed to map trampoline @{:#x} into boot HYP table", TRAMPOLINE_VA);
            return Err(err);
        }

        // Map the same page again into the runtime table.
        if let Err(err) = __create_hyp_mappings(
            pgd,
            TRAMPOLINE_VA,
            TRAMPOLINE_VA + PAGE_SIZE,
            t.idmap_start >> PAGE_SHIFT,
            PAGE_HYP,
        ) {
            error!(
                "failed to map trampoline @{:#x} into runtime HYP table",
                TRAMPOLINE_VA
            );
            return Err(err);
        }

        Ok(())
    }

    /// Duplicate a kernel virtual address range into HYP mode, backed by
    /// the same physical pages.
    pub fn create_hyp_mappings(&self, from: u64, to: u64) -> Result<(), Error> {
        let t = self.tables.lock();
        // Check for a valid kernel memory mapping.
        if !t.kernel_range.contains(&from) || !t.kernel_range.contains(&(to - 1)) {
            return Err(Error::InvalidInput);
        }
        let Some(pgd) = t.pgd else {
            return Err(Error::InvalidInput);
        };
        let phys_addr = virt_to_phys(from);
        __create_hyp_mappings(
            pgd,
            kern_to_hyp(from),
            kern_to_hyp(to),
            phys_addr >> PAGE_SHIFT,
            PAGE_HYP,
        )
    }

    /// Duplicate a kernel I/O mapping into HYP mode, pointing it at
    /// `phys_addr`.
    pub fn create_hyp_io_mappings(&self, from: u64, to: u64, phys_addr: PhysAddr) -> Result<(), Error> {
        let t = self.tables.lock();
        // Check for a valid kernel IO mapping.
        if !t.vmalloc_range.contains(&from) || !t.vmalloc_range.contains(&(to - 1)) {
            return Err(Error::InvalidInput);
        }
        let Some(pgd) = t.pgd else {
            return Err(Error::InvalidInput);
        };
        __create_hyp_mappings(
            pgd,
            kern_to_hyp(from),
            kern_to_hyp(to),
            phys_addr >> PAGE_SHIFT,
            PAGE_HYP_DEVICE,
        )
    }

    /// Free the boot tree and the bounce page, and drop the trampoline
    /// from the runtime tree. Called once HYP is fully up.
    pub fn free_boot_pgd(&self) {
        let mut t = self.tables.lock();

        if let Some(boot_pgd) = t.boot_pgd.take() {
            unmap_range(None, boot_pgd, t.idmap_start, PAGE_SIZE);
            unmap_range(None, boot_pgd, TRAMPOLINE_VA, PAGE_SIZE);
            heap::free_page(boot_pgd);
        }

        if let Some(pgd) = t.pgd {
            unmap_range(None, pgd, TRAMPOLINE_VA, PAGE_SIZE);
        }

        if let Some(bounce) = t.init_bounce_page.take() {
            heap::free_page(bounce);
        }
    }

    /// Tear down both HYP trees entirely.
    pub fn free_pgds(&self) {
        self.free_boot_pgd();

        let mut t = self.tables.lock();
        if let Some(pgd) = t.pgd.take() {
            let mut addr = t.kernel_range.start;
            while addr < t.kernel_range.end {
                unmap_range(None, pgd, kern_to_hyp(addr), PGDIR_SIZE);
                addr += PGDIR_SIZE;
            }
            let mut addr = t.vmalloc_range.start;
            while addr < t.vmalloc_range.end {
                unmap_range(None, pgd, kern_to_hyp(addr), PGDIR_SIZE);
                addr += PGDIR_SIZE;
            }
            heap::free_page(pgd);
        }
    }

    /// Physical address of the runtime HYP table, for HTTBR.
    pub fn httbr(&self) -> PhysAddr {
        self.tables.lock().pgd.map_or(0, |pgd| pgd << PAGE_SHIFT)
    }

    /// Physical address of the boot HYP table, for the first HTTBR load.
    pub fn boot_httbr(&self) -> PhysAddr {
        self.tables
            .lock()
            .boot_pgd
            .map_or(0, |pgd| pgd << PAGE_SHIFT)
    }

    /// Physical address of the HYP init entry, rebased into the bounce
    /// page when one is in use.
    pub fn idmap_vector(&self) -> PhysAddr {
        self.tables.lock().idmap_vector
    }

    /// Test the runtime tree's view of a HYP VA.
    pub fn hyp_translate(&self, va: u64) -> Option<Pte> {
        translate(self.tables.lock().pgd?, va)
    }

    /// Test the boot tree's view of a HYP VA.
    pub fn boot_translate(&self, va: u64) -> Option<Pte> {
        translate(self.tables.lock().boot_pgd?, va)
    }
}

/// Install `[start, end)` -> `pfn...` into the tree rooted at `pgd`,
/// allocating intermediate tables as needed. `start`/`end` need not be
/// page-aligned; they are aligned here.
fn __create_hyp_mappings(
    pgd: Pfn,
    start: u64,
    end: u64,
    mut pfn: Pfn,
    prot: u64,
) -> Result<(), Error> {
    let mut addr = start & PAGE_MASK;
    let end = (end + PAGE_SIZE - 1) & PAGE_MASK;

    while addr < end {
        let pud_idx = pud_index(addr);
        let pud = Desc::from_raw(read_slot(pgd, pud_idx));
        let pmd_table = if pud.raw() == 0 {
            let Some(pmd) = heap::alloc_page() else {
                error!("cannot allocate HYP pmd table");
                return Err(Error::OutOfMemory);
            };
            write_slot(pgd, pud_idx, Desc::table(pmd).raw());
            heap::get_page(pgd);
            pmd
        } else {
            pud.table_pfn()
        };

        let next = pud_addr_end(addr, end);
        create_hyp_pmd_mappings(pmd_table, addr, next, pfn, prot)?;
        pfn += (next - addr) >> PAGE_SHIFT;
        addr = next;
    }
    Ok(())
}

fn create_hyp_pmd_mappings(
    pmd_table: Pfn,
    start: u64,
    end: u64,
    mut pfn: Pfn,
    prot: u64,
) -> Result<(), Error> {
    let mut addr = start;
    while addr < end {
        let pmd_idx = pmd_index(addr);
        let pmd = Desc::from_raw(read_slot(pmd_table, pmd_idx));
        let pte_table = if pmd.raw() == 0 {
            let Some(pte) = heap::alloc_page() else {
                error!("cannot allocate HYP pte table");
                return Err(Error::OutOfMemory);
            };
            write_slot(pmd_table, pmd_idx, Desc::table(pte).raw());
            heap::get_page(pmd_table);
            pte
        } else {
            pmd.table_pfn()
        };

        let next = pmd_addr_end(addr, end);
        create_hyp_pte_mappings(pte_table, addr, next, pfn, prot);
        pfn += (next - addr) >> PAGE_SHIFT;
        addr = next;
    }
    Ok(())
}

fn create_hyp_pte_mappings(pte_table: Pfn, start: u64, end: u64, mut pfn: Pfn, prot: u64) {
    let mut addr = start;
    while addr < end {
        write_slot(pte_table, pte_index(addr), Pte::page(pfn, prot).raw());
        heap::get_page(pte_table);
        pfn += 1;
        addr += PAGE_SIZE;
    }
}
