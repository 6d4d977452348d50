//! x86_64 Architecture backend.
//!
//! Implements the `Architecture` trait for 64-bit x86 Mach-O relocations.
//! Only the kinds the kernel linker accepts in a KEXT are supported; thread
//! local variables (`X86_64_RELOC_TLV`) are rejected.

use object::macho::{
    self, X86_64_RELOC_BRANCH, X86_64_RELOC_GOT, X86_64_RELOC_GOT_LOAD, X86_64_RELOC_SIGNED,
    X86_64_RELOC_SIGNED_1, X86_64_RELOC_SIGNED_2, X86_64_RELOC_SIGNED_4,
    X86_64_RELOC_SUBTRACTOR, X86_64_RELOC_UNSIGNED,
};

use super::{Architecture, Fixup};
use crate::error::{malformed, PrelinkError, Result};

/// Exclusive bound on the magnitude of a RIP-relative displacement.
pub const RIP_RELATIVE_LIMIT: u64 = 0x8000_0000;

/// `(instruction + target) - adjustment`, when it fits a RIP-relative operand.
///
/// On overflow the out-of-range displacement is returned as the error.
pub fn compute_displacement(instruction: i32, target: u64, adjustment: u64) -> std::result::Result<i32, i64> {
    let displacement = (instruction as i64 as u64)
        .wrapping_add(target)
        .wrapping_sub(adjustment) as i64;
    if displacement.unsigned_abs() >= RIP_RELATIVE_LIMIT {
        return Err(displacement);
    }
    Ok(displacement as i32)
}

/// Narrows a 32-bit absolute fixup result.
fn fit_i32(value: i64, address: u64) -> Result<i32> {
    i32::try_from(value).map_err(|_| PrelinkError::DisplacementOutOfRange {
        address,
        displacement: value,
    })
}

fn pair_target(fixup: &Fixup) -> Result<u64> {
    fixup.pair_target.ok_or_else(|| {
        malformed(format!(
            "relocation at {:#x} is missing its pair",
            fixup.link_pc
        ))
    })
}

/// The x86_64 architecture backend.
pub struct X86_64;

impl X86_64 {
    fn apply_32(&self, fixup: &Fixup, location: &mut [u8]) -> Result<()> {
        let info = &fixup.info;
        let instruction = i32::from_le_bytes([location[0], location[1], location[2], location[3]]);
        let local = !info.r_extern;
        let mut target = fixup.target;

        // (is pc-relative, adjustment) for the RIP-relative kinds.
        let relative = match info.r_type {
            X86_64_RELOC_SIGNED | X86_64_RELOC_SIGNED_1 | X86_64_RELOC_SIGNED_2 | X86_64_RELOC_SIGNED_4 => {
                let adjustment = if local {
                    match info.r_type {
                        X86_64_RELOC_SIGNED => 0,
                        X86_64_RELOC_SIGNED_1 => 1,
                        X86_64_RELOC_SIGNED_2 => 2,
                        _ => 4,
                    }
                } else {
                    1u64 << info.r_length
                };
                let base = if local { fixup.load_address } else { fixup.link_pc };
                Some(adjustment.wrapping_add(base))
            }
            X86_64_RELOC_BRANCH => Some((1u64 << info.r_length).wrapping_add(fixup.link_pc)),
            X86_64_RELOC_GOT | X86_64_RELOC_GOT_LOAD => {
                target = pair_target(fixup)?;
                Some((1u64 << info.r_length).wrapping_add(fixup.link_pc))
            }
            X86_64_RELOC_UNSIGNED | X86_64_RELOC_SUBTRACTOR => None,
            r_type => {
                return Err(PrelinkError::UnsupportedRelocation {
                    r_type,
                    r_length: info.r_length,
                })
            }
        };

        if info.r_pcrel != relative.is_some() {
            tracing::warn!(
                "relocation at {:#x} has an invalid pc-relative flag",
                fixup.link_pc
            );
        }

        let value = match relative {
            Some(adjustment) => compute_displacement(instruction, target, adjustment).map_err(
                |displacement| PrelinkError::DisplacementOutOfRange {
                    address: fixup.link_pc,
                    displacement,
                },
            )?,
            // The paired UNSIGNED record names the minuend, this one the subtrahend.
            None if info.r_type == X86_64_RELOC_SUBTRACTOR => {
                let value = (instruction as i64)
                    .wrapping_add(pair_target(fixup)? as i64)
                    .wrapping_sub(target as i64);
                fit_i32(value, fixup.link_pc)?
            }
            None => fit_i32((instruction as i64).wrapping_add(target as i64), fixup.link_pc)?,
        };
        location[..4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn apply_64(&self, fixup: &Fixup, location: &mut [u8]) -> Result<()> {
        let info = &fixup.info;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&location[..8]);
        let instruction = u64::from_le_bytes(raw);

        let value = match info.r_type {
            X86_64_RELOC_UNSIGNED => instruction.wrapping_add(fixup.target),
            // Pair target minus this record's target, added to the stored addend.
            X86_64_RELOC_SUBTRACTOR => instruction
                .wrapping_add(pair_target(fixup)?)
                .wrapping_sub(fixup.target),
            r_type => {
                return Err(PrelinkError::UnsupportedRelocation {
                    r_type,
                    r_length: info.r_length,
                })
            }
        };
        if info.r_pcrel {
            tracing::warn!(
                "relocation at {:#x} has an invalid pc-relative flag",
                fixup.link_pc
            );
        }
        location[..8].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

impl Architecture for X86_64 {
    fn cpu_type(&self) -> u32 {
        macho::CPU_TYPE_X86_64
    }

    fn is_pair(&self, r_type: u8) -> bool {
        matches!(
            r_type,
            X86_64_RELOC_SUBTRACTOR | X86_64_RELOC_GOT | X86_64_RELOC_GOT_LOAD
        )
    }

    fn preserves(&self, r_type: u8) -> bool {
        r_type == X86_64_RELOC_UNSIGNED
    }

    fn apply_relocation(&self, fixup: &Fixup, location: &mut [u8]) -> Result<()> {
        let info = &fixup.info;
        let width = match info.r_length {
            2 => 4,
            3 => 8,
            r_length => {
                return Err(PrelinkError::UnsupportedRelocation {
                    r_type: info.r_type,
                    r_length,
                })
            }
        };
        if location.len() < width {
            return Err(malformed(format!(
                "relocation at {:#x} runs past its segment",
                fixup.link_pc
            )));
        }
        if width == 4 {
            self.apply_32(fixup, location)
        } else {
            self.apply_64(fixup, location)
        }
    }
}
