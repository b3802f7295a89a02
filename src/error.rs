//! Error kinds surfaced by the memory-management core.
//!
//! Everything is reported synchronously; there is no unwinding across the
//! fault path. Invariant violations that would leave a VM's page tables in
//! an unknown state are not errors but panics (the VM must be aborted).

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The stage-2 root for this VM was already allocated.
    AlreadyInitialized,
    /// A page frame could not be allocated.
    OutOfMemory,
    /// A range handed to the HYP mapper is not a kernel (respectively
    /// vmalloc) mapping, or a guest frame has no host backing.
    InvalidInput,
    /// An I/O mapping would replace a present leaf outside of cloning, or a
    /// permission fault arrived that cannot be made progress on.
    PermissionConflict,
    /// A stage-2 abort carried a fault-status code the handler does not
    /// support.
    BadFaultStatus,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::AlreadyInitialized => "stage-2 tables already initialized",
            Error::OutOfMemory => "out of memory",
            Error::InvalidInput => "invalid address range",
            Error::PermissionConflict => "mapping permission conflict",
            Error::BadFaultStatus => "unsupported fault status",
        };
        f.write_str(s)
    }
}
