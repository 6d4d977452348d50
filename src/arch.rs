//! Architecture abstraction.
//!
//! This module defines the `Architecture` trait, which encapsulates the
//! relocation semantics of a target CPU. The relocation engine in `reloc`
//! decides *what* a record points at; the backend decides how that target is
//! folded into the instruction bytes.

use object::macho::RelocationInfo;

use crate::error::Result;

pub mod x86_64;

/// Everything a backend needs to apply one relocation record.
#[derive(Debug, Clone, Copy)]
pub struct Fixup {
    /// The decoded record.
    pub info: RelocationInfo,
    /// Address of the fixup location once linked (`r_address + load_address`).
    pub link_pc: u64,
    /// Address the KEXT is being linked at.
    pub load_address: u64,
    /// Resolved symbol value, or the section's link delta for section records.
    pub target: u64,
    /// Target of the successor record, for pair kinds.
    pub pair_target: Option<u64>,
}

/// A trait representing a target architecture.
pub trait Architecture {
    /// Mach-O `cputype` handled by this backend.
    fn cpu_type(&self) -> u32;

    /// Whether records of `r_type` consume the following record.
    fn is_pair(&self, r_type: u8) -> bool;

    /// Whether records of `r_type` stay in the output for the kernel to slide.
    fn preserves(&self, r_type: u8) -> bool;

    /// Applies `fixup` to `location`, which starts at the fixup address and
    /// holds at least `1 << r_length` bytes.
    fn apply_relocation(&self, fixup: &Fixup, location: &mut [u8]) -> Result<()>;
}
