//! Relocation engine.
//!
//! Walks the local and external relocation tables of a KEXT, computes each
//! record's target and hands the arithmetic to the `Architecture` backend.
//! Records the kernel still needs for sliding are returned, rewritten as
//! section relocations, so the LINKEDIT rebuild can store them.

use object::macho::RelocationInfo;

use crate::arch::{Architecture, Fixup};
use crate::dependency::DependencyChain;
use crate::error::{malformed, PrelinkError, Result};
use crate::macho::{self, cxx, MachoImage, LE, R_ABS};
use crate::vtable::{VTable, VTableArena, VTABLE_ENTRY_SIZE, VTABLE_HEADER_SIZE};

/// Highest valid section ordinal.
const MAX_SECT: u32 = 255;

/// What to do with a record after it has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelocationOutcome {
    /// Keep the record in the output image.
    pub preserve: bool,
    /// The successor record was consumed as this record's pair.
    pub skip_next: bool,
}

/// Fails if `operand`, an offset into `vtable`, selects a pure virtual slot.
fn check_direct_pure_virtual(vtable: &VTable, operand: u64) -> Result<()> {
    if operand % VTABLE_ENTRY_SIZE != 0 || operand < VTABLE_HEADER_SIZE {
        return Ok(());
    }
    let Ok(index) = usize::try_from((operand - VTABLE_HEADER_SIZE) / VTABLE_ENTRY_SIZE) else {
        return Ok(());
    };
    let pure = vtable
        .entries
        .get(index)
        .and_then(|entry| entry.name.as_deref())
        .map_or(false, cxx::is_pure_virtual);
    if pure {
        return Err(PrelinkError::DirectPureVirtualCall {
            vtable: vtable.name.clone(),
            index,
        });
    }
    Ok(())
}

pub struct Relocator<'r, 'a: 'r, A, D> {
    arch: &'r A,
    image: &'r mut MachoImage<D>,
    chain: &'r DependencyChain<'a>,
    vtables: &'r VTableArena,
    load_address: u64,
}

impl<'r, 'a: 'r, A: Architecture, D: AsRef<[u8]> + AsMut<[u8]>> Relocator<'r, 'a, A, D> {
    pub fn new(
        arch: &'r A,
        image: &'r mut MachoImage<D>,
        chain: &'r DependencyChain<'a>,
        vtables: &'r VTableArena,
        load_address: u64,
    ) -> Self {
        Self {
            arch,
            image,
            chain,
            vtables,
            load_address,
        }
    }

    /// Target address of `reloc`, plus the vtable it names, if any.
    fn target(&self, reloc: &RelocationInfo) -> Result<(u64, Option<&'r VTable>)> {
        if reloc.r_extern {
            let index = reloc.r_symbolnum;
            let sym = self.image.symbol(index)?;
            let name = self.image.symbol_name(index)?;
            if macho::is_unresolved(sym) {
                return Err(if cxx::is_padslot(name) {
                    PrelinkError::UnpatchedPadSlot(name.to_string())
                } else {
                    PrelinkError::SymbolNotFound(name.to_string())
                });
            }
            let vtable = if cxx::is_vtable(name) {
                self.vtables
                    .find(name)
                    .or_else(|| self.chain.find_vtable(name))
            } else {
                None
            };
            return Ok((sym.n_value.get(LE), vtable));
        }

        let ordinal = reloc.r_symbolnum;
        if ordinal == 0 || ordinal > MAX_SECT {
            return Err(malformed(format!("bad section ordinal {ordinal} in relocation")));
        }
        let section = self
            .image
            .section(ordinal)
            .ok_or_else(|| malformed(format!("relocation references missing section {ordinal}")))?;
        let delta = section
            .link_delta(self.load_address)
            .ok_or_else(|| malformed(format!("section {} has a bad alignment", section.name)))?;
        Ok((delta, None))
    }

    /// Applies one record. `next` is the record that follows it in its table.
    pub fn relocate(
        &mut self,
        reloc: &RelocationInfo,
        next: Option<&RelocationInfo>,
    ) -> Result<RelocationOutcome> {
        let (target, vtable) = self.target(reloc)?;
        let pair_target = if self.arch.is_pair(reloc.r_type) {
            let next = next.ok_or_else(|| {
                malformed(format!("relocation at {:#x} is missing its pair", reloc.r_address))
            })?;
            Some(self.target(next)?.0)
        } else {
            None
        };

        let width: usize = match reloc.r_length {
            2 => 4,
            3 => 8,
            r_length => {
                return Err(PrelinkError::UnsupportedRelocation {
                    r_type: reloc.r_type,
                    r_length,
                })
            }
        };
        let address = self
            .image
            .relocation_base()
            .wrapping_add(u64::from(reloc.r_address));
        let offset = self.image.file_offset(address, width as u64)?;
        let location = &mut self.image.bytes_mut()[offset..offset + width];

        if let Some(vtable) = vtable {
            let operand = if width == 4 {
                i32::from_le_bytes([location[0], location[1], location[2], location[3]]) as i64 as u64
            } else {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(location);
                u64::from_le_bytes(raw)
            };
            check_direct_pure_virtual(vtable, operand)?;
        }

        let fixup = Fixup {
            info: *reloc,
            link_pc: u64::from(reloc.r_address).wrapping_add(self.load_address),
            load_address: self.load_address,
            target,
            pair_target,
        };
        self.arch.apply_relocation(&fixup, location)?;

        Ok(RelocationOutcome {
            preserve: self.arch.preserves(reloc.r_type),
            skip_next: pair_target.is_some(),
        })
    }

    /// Applies every record of `records` and returns the ones to keep.
    ///
    /// Kept external records are turned into section records against section
    /// 1: their targets are final and the KEXT only slides as a whole.
    pub fn relocate_and_copy(&mut self, records: &[RelocationInfo]) -> Result<Vec<RelocationInfo>> {
        let mut preserved = Vec::new();
        let mut index = 0;
        while index < records.len() {
            let reloc = records[index];
            if !reloc.r_extern && reloc.r_symbolnum == R_ABS {
                index += 1;
                continue;
            }
            let outcome = self.relocate(&reloc, records.get(index + 1))?;
            if outcome.preserve {
                let mut kept = reloc;
                if kept.r_extern {
                    kept.r_extern = false;
                    kept.r_symbolnum = 1;
                }
                preserved.push(kept);
            }
            index += if outcome.skip_next { 2 } else { 1 };
        }
        Ok(preserved)
    }
}
