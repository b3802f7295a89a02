//! Page-frame allocation and frame reference counts.
//!
//! The hypervisor runs on a linear map, so a frame's virtual address and
//! its physical address coincide and a PFN is just `address >> PAGE_SHIFT`.
//! Frames come from the global allocator through a thin facade so callers
//! deal in raw PFNs, the currency of the page tables themselves.
//!
//! Each allocated frame carries a reference count. For a page-table node
//! the count is 1 (the allocation's own hold) plus the number of populated
//! entries the node currently contains; the tree walker frees a child node
//! exactly when its parent observes the child's count back at 1.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use hashbrown::HashMap;

use crate::arch::arm::defs::{PAGE_SHIFT, PAGE_SIZE};
use crate::sync::{LockClass, SpinLock};
use crate::Pfn;

const PAGE_LAYOUT: Layout =
    unsafe { Layout::from_size_align_unchecked(PAGE_SIZE as usize, PAGE_SIZE as usize) };

static PAGE_COUNTS: SpinLock<Option<HashMap<Pfn, usize>>> =
    SpinLock::new(LockClass::Frames, None);

fn with_counts<R>(f: impl FnOnce(&mut HashMap<Pfn, usize>) -> R) -> R {
    let mut counts = PAGE_COUNTS.lock();
    f(counts.get_or_insert_with(HashMap::new))
}

/// Allocate one zeroed, page-aligned frame. The frame starts with a
/// reference count of 1.
pub fn alloc_page() -> Option<Pfn> {
    let ptr = unsafe { alloc_zeroed(PAGE_LAYOUT) };
    if ptr.is_null() {
        return None;
    }
    let pfn = (ptr as u64) >> PAGE_SHIFT;
    with_counts(|c| c.insert(pfn, 1));
    Some(pfn)
}

/// Release a frame. The caller must hold the last reference.
pub fn free_page(pfn: Pfn) {
    let count = with_counts(|c| c.remove(&pfn));
    debug_assert_eq!(count, Some(1), "freeing frame {:#x} with live references", pfn);
    unsafe { dealloc(page_va(pfn), PAGE_LAYOUT) };
}

/// Take a reference on a frame.
pub fn get_page(pfn: Pfn) {
    with_counts(|c| {
        let count = c.get_mut(&pfn).expect("get_page on an untracked frame");
        *count += 1;
    });
}

/// Drop a reference on a frame. The allocation's own hold stays; frames are
/// returned to the allocator only through `free_page`.
pub fn put_page(pfn: Pfn) {
    with_counts(|c| {
        let count = c.get_mut(&pfn).expect("put_page on an untracked frame");
        debug_assert!(*count > 1, "put_page dropping the last hold on {:#x}", pfn);
        *count -= 1;
    });
}

/// Current reference count of a frame.
pub fn page_count(pfn: Pfn) -> usize {
    with_counts(|c| c.get(&pfn).copied().unwrap_or(0))
}

/// Whether only the allocation's own hold remains, i.e. a page-table node
/// has no populated entries left.
pub fn page_empty(pfn: Pfn) -> bool {
    page_count(pfn) == 1
}

/// Linear-map virtual address of a frame.
pub fn page_va(pfn: Pfn) -> *mut u8 {
    ((pfn << PAGE_SHIFT) as usize) as *mut u8
}
