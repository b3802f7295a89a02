//! Host-side memory services consumed by the fault path.
//!
//! The stage-2 core does not own the user-space address space backing a
//! VM; it asks the host for GFN backing, VMA permissions and user copies
//! through this trait. On the real system the implementation sits on the
//! kernel's get-user-pages and VMA machinery; tests plug in a mock backed
//! by plain frames.

use crate::error::Error;
use crate::{HostVirtAddr, Pfn};

pub trait HostMemory: Send + Sync {
    /// Resolve a host virtual address to the frame backing it, faulting the
    /// page in if needed. May sleep; never call it under `mmu_lock`.
    ///
    /// Returns the PFN and whether write access was actually granted.
    fn hva_to_pfn(&self, hva: HostVirtAddr, writable: bool) -> Result<(Pfn, bool), Error>;

    /// Whether the VMA covering `hva` permits writes at all.
    fn vma_writable(&self, hva: HostVirtAddr) -> bool;

    /// Copy `dst.len()` bytes from user memory at `hva`. May sleep.
    fn copy_from_user(&self, dst: &mut [u8], hva: HostVirtAddr) -> Result<(), Error>;

    /// Copy `src` into user memory at `hva`. May sleep.
    fn copy_to_user(&self, hva: HostVirtAddr, src: &[u8]) -> Result<(), Error>;

    /// The guest was granted write access to `pfn`; the host should treat
    /// the page as dirty.
    fn set_pfn_dirty(&self, _pfn: Pfn) {}

    /// Drop the reference `hva_to_pfn` took on the frame.
    fn release_pfn(&self, _pfn: Pfn) {}
}
