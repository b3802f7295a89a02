//! Stage-2 TLB maintenance.
//!
//! Stage-2 TLB entries are tagged with the VMID in VTTBR, so a single-IPA
//! invalidate only hits the faulting VM. The caller is expected to run with
//! the owning VM's VTTBR installed (the HYP stub switches it around the
//! invalidate), which is why the instruction itself takes only the IPA.

/// Invalidate the stage-2 TLB entry covering `ipa` for the VM `vmid`.
///
/// Must be issued after every mutation of a present leaf and after clearing
/// an intermediate entry, before the mutating critical section ends.
pub fn flush_vmid_ipa(vmid: u16, ipa: u64) {
    let _ = vmid;

    #[cfg(test)]
    journal::record(vmid, ipa);

    #[cfg(target_arch = "arm")]
    unsafe {
        // TLBIIPAS2IS takes IPA[39:12] in bits [27:0].
        core::arch::asm!(
            "dsb ishst",
            "mcr p15, 4, {ipa}, c8, c0, 1",
            "dsb ish",
            "isb",
            ipa = in(reg) (ipa >> 12) as u32,
            options(nostack),
        );
    }

    #[cfg(not(any(test, target_arch = "arm")))]
    let _ = ipa;
}

/// Invalidation journal for host-side tests: every `flush_vmid_ipa` call is
/// recorded so tests can assert that a mutation was followed by the matching
/// VMID+IPA invalidate.
#[cfg(test)]
pub(crate) mod journal {
    use std::sync::Mutex;

    static FLUSHES: Mutex<Vec<(u16, u64)>> = Mutex::new(Vec::new());

    pub fn record(vmid: u16, ipa: u64) {
        FLUSHES.lock().unwrap().push((vmid, ipa));
    }

    /// All IPAs invalidated so far for `vmid`, in issue order.
    pub fn flushes_for(vmid: u16) -> Vec<u64> {
        FLUSHES
            .lock()
            .unwrap()
            .iter()
            .filter(|(v, _)| *v == vmid)
            .map(|(_, ipa)| *ipa)
            .collect()
    }
}
