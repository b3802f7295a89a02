//! Pre-reserved page frames for page-table allocations under the MMU lock.
//!
//! The walker may need to install a pmd or pte table while holding a VM's
//! `mmu_lock`, where allocation is forbidden. Callers top the reserve up
//! outside the lock and the walker draws from it inside.

use crate::error::Error;
use crate::mm::heap;
use crate::Pfn;

/// Upper bound on frames a reserve can hold.
pub const KVM_NR_MEM_OBJS: usize = 40;

pub struct MmuMemoryCache {
    nobjs: usize,
    objects: [Pfn; KVM_NR_MEM_OBJS],
}

impl MmuMemoryCache {
    pub const fn new() -> Self {
        Self {
            nobjs: 0,
            objects: [0; KVM_NR_MEM_OBJS],
        }
    }

    /// Ensure at least `min` frames are held, filling towards `max` on a
    /// best-effort basis. Fails only if allocation gives out before `min`
    /// frames are reserved.
    pub fn topup(&mut self, min: usize, max: usize) -> Result<(), Error> {
        debug_assert!(max <= KVM_NR_MEM_OBJS);
        if self.nobjs >= min {
            return Ok(());
        }
        while self.nobjs < max {
            match heap::alloc_page() {
                Some(pfn) => {
                    self.objects[self.nobjs] = pfn;
                    self.nobjs += 1;
                }
                None if self.nobjs >= min => break,
                None => return Err(Error::OutOfMemory),
            }
        }
        Ok(())
    }

    /// Take one pre-reserved frame. Calling this on an empty reserve is a
    /// caller bug: the fault path promises a topped-up reserve before it
    /// takes the MMU lock.
    pub fn alloc(&mut self) -> Pfn {
        assert!(self.nobjs > 0, "page-table reserve drained under mmu_lock");
        self.nobjs -= 1;
        self.objects[self.nobjs]
    }

    /// Release every held frame.
    pub fn free_all(&mut self) {
        while self.nobjs > 0 {
            self.nobjs -= 1;
            heap::free_page(self.objects[self.nobjs]);
        }
    }

    pub fn len(&self) -> usize {
        self.nobjs
    }

    pub fn is_empty(&self) -> bool {
        self.nobjs == 0
    }
}

impl Default for MmuMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MmuMemoryCache {
    fn drop(&mut self) {
        self.free_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topup_reaches_min_and_fills_to_max() {
        let mut cache = MmuMemoryCache::new();
        cache.topup(2, 5).unwrap();
        assert_eq!(cache.len(), 5);

        // Already above min: no refill.
        cache.topup(2, KVM_NR_MEM_OBJS).unwrap();
        assert_eq!(cache.len(), 5);

        let a = cache.alloc();
        let b = cache.alloc();
        assert_ne!(a, b);
        assert_eq!(cache.len(), 3);

        cache.free_all();
        assert!(cache.is_empty());
    }

    #[test]
    #[should_panic(expected = "reserve drained")]
    fn test_alloc_on_empty_reserve_panics() {
        let mut cache = MmuMemoryCache::new();
        let _ = cache.alloc();
    }
}
