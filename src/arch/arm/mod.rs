//! 32-bit ARM (ARMv7 + LPAE + virtualization extensions) support.

pub mod cache;
pub mod defs;
pub mod tlb;
