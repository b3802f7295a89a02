use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

/// Lock classes, outermost first.
///
/// The stage-2 fault path nests its locks in one fixed order: a VM's
/// `mmu_lock`, then the clone pair's copy-on-access lock, then the
/// bookkeeping sets, with the frame reference counts innermost. The HYP
/// table lock never nests with VM locks and shares the outermost class.
/// Every lock is tagged with its class at construction and host-side tests
/// assert each acquisition against the order, so a path that would deadlock
/// on real hardware fails loudly instead.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum LockClass {
    /// A VM's `mmu_lock`, or the HYP table lock.
    Mmu = 0,
    /// A clone pair's copy-on-access lock.
    Coa = 1,
    /// Shared-PFN registry, page pool, memslots and other bookkeeping.
    Bookkeeping = 2,
    /// The frame reference-count table.
    Frames = 3,
}

/// Ticket spinlock.
///
/// FIFO-fair: contending CPUs are served in arrival order, which matters on
/// the fault path where the two halves of a clone hammer the same
/// copy-on-access state. Guards must not be held across anything that can
/// sleep, and a lock may only be taken while every held lock is of the same
/// or an outer class.
pub struct SpinLock<T> {
    class: LockClass,
    next_ticket: AtomicU32,
    now_serving: AtomicU32,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    ticket: u32,
}

impl<T> SpinLock<T> {
    pub const fn new(class: LockClass, data: T) -> Self {
        Self {
            class,
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn class(&self) -> LockClass {
        self.class
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        // Checked before taking a ticket: an ordering bug is reported even
        // when the lock happens to be uncontended.
        #[cfg(test)]
        order::acquired(self.class);

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }
        SpinLockGuard { lock: self, ticket }
    }
}

impl<T> core::ops::Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> core::ops::DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(test)]
        order::released(self.lock.class);

        self.lock
            .now_serving
            .store(self.ticket + 1, Ordering::Release);
        // SEV wakes cores parked in WFE-based spin loops.
        #[cfg(target_arch = "arm")]
        unsafe {
            core::arch::asm!("sev", options(nostack, nomem))
        };
    }
}
