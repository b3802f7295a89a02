//! Guest memory slots.
//!
//! A memslot ties a range of guest frames to the user-space virtual memory
//! backing them. The fault path holds slots across sleeps, so they are
//! handed out as `Arc`s; the bitmaps are atomic so dirty and unshare state
//! can be flipped while the tree is being walked under `mmu_lock`.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::arm::defs::{PAGE_SHIFT, PAGE_SIZE};
use crate::{Gfn, HostVirtAddr};

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct MemslotFlags: u32 {
        /// The guest may never be granted stage-2 write access to this slot.
        const READONLY = 1 << 0;
    }
}

/// One bit per page, atomically settable.
struct Bitmap {
    words: Box<[AtomicU64]>,
}

impl Bitmap {
    fn new(nbits: u64) -> Self {
        let nwords = ((nbits + 63) / 64) as usize;
        let words = (0..nwords).map(|_| AtomicU64::new(0)).collect::<Vec<_>>();
        Self {
            words: words.into_boxed_slice(),
        }
    }

    fn set(&self, bit: u64) {
        self.words[(bit / 64) as usize].fetch_or(1 << (bit % 64), Ordering::Relaxed);
    }

    fn test(&self, bit: u64) -> bool {
        self.words[(bit / 64) as usize].load(Ordering::Relaxed) & (1 << (bit % 64)) != 0
    }
}

pub struct Memslot {
    pub base_gfn: Gfn,
    pub npages: u64,
    pub userspace_addr: HostVirtAddr,
    pub flags: MemslotFlags,
    /// Pages the guest wrote since dirty tracking started.
    dirty_bitmap: Bitmap,
    /// Pages known to be exclusively this VM's after cloning; such a page
    /// never re-enters the copy-on-access path.
    unshare_bitmap: Bitmap,
}

impl Memslot {
    pub fn new(base_gfn: Gfn, npages: u64, userspace_addr: HostVirtAddr, flags: MemslotFlags) -> Self {
        Self {
            base_gfn,
            npages,
            userspace_addr,
            flags,
            dirty_bitmap: Bitmap::new(npages),
            unshare_bitmap: Bitmap::new(npages),
        }
    }

    pub fn contains(&self, gfn: Gfn) -> bool {
        gfn >= self.base_gfn && gfn < self.base_gfn + self.npages
    }

    /// Host virtual address backing `gfn`, which must be inside the slot.
    pub fn hva_for(&self, gfn: Gfn) -> HostVirtAddr {
        debug_assert!(self.contains(gfn));
        self.userspace_addr + ((gfn - self.base_gfn) << PAGE_SHIFT)
    }

    /// Host virtual range `[start, end)` covered by the slot.
    pub fn hva_range(&self) -> (HostVirtAddr, HostVirtAddr) {
        (
            self.userspace_addr,
            self.userspace_addr + (self.npages << PAGE_SHIFT),
        )
    }

    /// Guest frame backed by `hva`, rounding down to the page.
    pub fn hva_to_gfn(&self, hva: HostVirtAddr) -> Gfn {
        self.base_gfn + ((hva - self.userspace_addr) / PAGE_SIZE)
    }

    pub fn mark_dirty(&self, gfn: Gfn) {
        self.dirty_bitmap.set(gfn - self.base_gfn);
    }

    pub fn is_dirty(&self, gfn: Gfn) -> bool {
        self.dirty_bitmap.test(gfn - self.base_gfn)
    }

    pub fn set_unshared(&self, gfn: Gfn) {
        self.unshare_bitmap.set(gfn - self.base_gfn);
    }

    pub fn is_unshared(&self, gfn: Gfn) -> bool {
        self.unshare_bitmap.test(gfn - self.base_gfn)
    }
}

/// The registered slots of one VM.
pub(crate) struct Memslots {
    slots: Vec<Arc<Memslot>>,
}

impl Memslots {
    pub(crate) const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub(crate) fn insert(&mut self, slot: Arc<Memslot>) {
        debug_assert!(
            !self
                .slots
                .iter()
                .any(|s| s.base_gfn < slot.base_gfn + slot.npages
                    && slot.base_gfn < s.base_gfn + s.npages),
            "overlapping memslots"
        );
        self.slots.push(slot);
    }

    pub(crate) fn find(&self, gfn: Gfn) -> Option<Arc<Memslot>> {
        self.slots.iter().find(|s| s.contains(gfn)).cloned()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Memslot>> {
        self.slots.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_addressing() {
        let slot = Memslot::new(0x40000, 16, 0x7000_0000, MemslotFlags::empty());
        assert!(slot.contains(0x40000));
        assert!(slot.contains(0x4000F));
        assert!(!slot.contains(0x40010));

        assert_eq!(slot.hva_for(0x40003), 0x7000_3000);
        assert_eq!(slot.hva_to_gfn(0x7000_3fff), 0x40003);
        assert_eq!(slot.hva_range(), (0x7000_0000, 0x7001_0000));
    }

    #[test]
    fn test_bitmaps() {
        let slot = Memslot::new(0x100, 80, 0x1000, MemslotFlags::empty());
        assert!(!slot.is_dirty(0x100));
        slot.mark_dirty(0x100);
        slot.mark_dirty(0x14F);
        assert!(slot.is_dirty(0x100));
        assert!(slot.is_dirty(0x14F));
        assert!(!slot.is_dirty(0x101));

        assert!(!slot.is_unshared(0x123));
        slot.set_unshared(0x123);
        assert!(slot.is_unshared(0x123));
    }
}
