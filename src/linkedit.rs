//! Link-metadata rebuild.
//!
//! Once a KEXT's symbols and relocations are final, its `__LINKEDIT` segment
//! is rewritten in the layout the kernel expects of a prelinked binary:
//!
//! ```text
//! [symbols without the undefined region][preserved relocations][string table]
//! ```
//!
//! This module also holds the smaller fixups that run around the rebuild:
//! symbol relocation, non-lazy symbol pointers, segment addresses and
//! `kmod_info`.

use object::macho::{self, RelocationInfo};
use object::pod::bytes_of;

use crate::error::{malformed, Result};
use crate::layout::PAGE_SIZE;
use crate::macho::{MachoImage, LE, NLIST_SIZE, RELOCATION_SIZE};
use crate::utils::align_up;

pub const LINKEDIT_SEGMENT: &str = "__LINKEDIT";
pub const TEXT_SEGMENT: &str = "__TEXT";
pub const KMOD_INFO_SYMBOL: &str = "_kmod_info";

const TEXT_PROT: u32 = macho::VM_PROT_READ | macho::VM_PROT_EXECUTE;
const DATA_PROT: u32 = macho::VM_PROT_READ | macho::VM_PROT_WRITE;

/// Size of the 64-bit `kmod_info_t` and the offsets of the fields we fill.
const KMOD_INFO_SIZE: usize = 196;
const KMOD_ADDRESS: usize = 156;
const KMOD_SIZE: usize = 164;
const KMOD_HDR_SIZE: usize = 172;

/// Verifies that the rebuilt metadata will fit in the current `__LINKEDIT`.
///
/// Assumes every relocation is preserved, so later stages cannot run out of
/// room.
pub fn check_capacity<D: AsRef<[u8]>>(image: &MachoImage<D>) -> Result<()> {
    let linkedit = image
        .segment(LINKEDIT_SEGMENT)
        .ok_or_else(|| malformed("missing __LINKEDIT segment"))?;
    let symtab = image.symtab()?;
    let dysymtab = image.dysymtab()?;
    let kept_symbols = symtab
        .nsyms
        .get(LE)
        .checked_sub(dysymtab.nundefsym.get(LE))
        .map(u64::from)
        .ok_or_else(|| malformed("more undefined symbols than symbols"))?;
    let relocations = u64::from(dysymtab.nlocrel.get(LE)) + u64::from(dysymtab.nextrel.get(LE));
    let needed = kept_symbols * NLIST_SIZE as u64
        + relocations * RELOCATION_SIZE as u64
        + u64::from(symtab.strsize.get(LE));
    if needed > linkedit.filesize {
        return Err(malformed(format!(
            "rebuilt __LINKEDIT needs {needed:#x} bytes, segment holds {:#x}",
            linkedit.filesize
        )));
    }
    Ok(())
}

/// Moves section-based symbols in `range` to their linked addresses.
pub fn relocate_symbols<D: AsRef<[u8]> + AsMut<[u8]>>(
    image: &mut MachoImage<D>,
    range: std::ops::Range<u32>,
    load_address: u64,
) -> Result<()> {
    for index in range {
        let sym = image.symbol(index)?;
        if !crate::macho::is_section_based(sym) || sym.n_sect == macho::NO_SECT {
            continue;
        }
        let ordinal = u32::from(sym.n_sect);
        let section = image
            .section(ordinal)
            .ok_or_else(|| malformed(format!("symbol {index} references missing section {ordinal}")))?;
        let delta = section
            .link_delta(load_address)
            .ok_or_else(|| malformed(format!("section {} has a bad alignment", section.name)))?;
        let sym = image.symbol_mut(index)?;
        let value = sym.n_value.get(LE).wrapping_add(delta);
        sym.n_value.set(LE, value);
    }
    Ok(())
}

/// Fills every non-lazy symbol pointer from the indirect symbol table.
pub fn process_symbol_pointers<D: AsRef<[u8]> + AsMut<[u8]>>(
    image: &mut MachoImage<D>,
    load_address: u64,
) -> Result<()> {
    let sections: Vec<_> = image
        .sections()
        .filter(|sect| sect.section_type() == macho::S_NON_LAZY_SYMBOL_POINTERS)
        .cloned()
        .collect();
    if sections.is_empty() {
        return Ok(());
    }
    let indirect = image.indirect_symbols()?;

    for section in sections {
        let count = (section.size / 8) as usize;
        let first = section.reserved1 as usize;
        let entries = indirect
            .get(first..first.saturating_add(count))
            .ok_or_else(|| malformed(format!("{} exceeds the indirect symbol table", section.name)))?;
        for (slot, &entry) in entries.iter().enumerate() {
            if entry & macho::INDIRECT_SYMBOL_ABS != 0 {
                continue;
            }
            let addend = if entry & macho::INDIRECT_SYMBOL_LOCAL != 0 {
                load_address
            } else {
                image.symbol(entry)?.n_value.get(LE)
            };
            let address = section
                .addr
                .checked_add(slot as u64 * 8)
                .ok_or_else(|| malformed(format!("{} overflows the address space", section.name)))?;
            let value = image.read_u64(address)?.wrapping_add(addend);
            image.write_u64(address, value)?;
        }
    }
    Ok(())
}

/// File offset of `_kmod_info`, read before symbols move.
pub fn kmod_info_offset<D: AsRef<[u8]>>(image: &MachoImage<D>) -> Result<Option<usize>> {
    let Some(index) = image.find_defined_symbol(KMOD_INFO_SYMBOL)? else {
        return Ok(None);
    };
    let address = image.symbol(index)?.n_value.get(LE);
    let offset = image.file_offset(address, KMOD_INFO_SIZE as u64)?;
    if offset % 4 != 0 {
        return Err(malformed("_kmod_info is misaligned"));
    }
    Ok(Some(offset))
}

/// Records the KEXT's load address and size in its `kmod_info`.
pub fn write_kmod_info<D: AsRef<[u8]> + AsMut<[u8]>>(
    image: &mut MachoImage<D>,
    offset: usize,
    load_address: u64,
) -> Result<()> {
    let size = image.vm_size();
    let bytes = image
        .bytes_mut()
        .get_mut(offset..offset + KMOD_INFO_SIZE)
        .ok_or_else(|| malformed("_kmod_info is out of bounds"))?;
    bytes[KMOD_ADDRESS..KMOD_ADDRESS + 8].copy_from_slice(&load_address.to_le_bytes());
    bytes[KMOD_SIZE..KMOD_SIZE + 8].copy_from_slice(&size.to_le_bytes());
    bytes[KMOD_HDR_SIZE..KMOD_HDR_SIZE + 8].copy_from_slice(&0u64.to_le_bytes());
    Ok(())
}

/// Rewrites `__LINKEDIT` and the symtab and dysymtab commands.
///
/// `preserved` are the relocations that survived relocation, already in
/// their final form.
pub fn rebuild<D: AsRef<[u8]> + AsMut<[u8]>>(
    image: &mut MachoImage<D>,
    preserved: &[RelocationInfo],
) -> Result<()> {
    let linkedit = image
        .segment(LINKEDIT_SEGMENT)
        .cloned()
        .ok_or_else(|| malformed("missing __LINKEDIT segment"))?;
    let symtab = image.symtab()?;
    let symoff = symtab.symoff.get(LE) as usize;
    let nsyms = symtab.nsyms.get(LE) as usize;
    let undefined = image.undefined_range()?;
    let (undef_start, undef_end) = (undefined.start as usize, undefined.end as usize);

    let mut region = Vec::new();
    let data = image.bytes();
    region.extend_from_slice(&data[symoff..symoff + undef_start * NLIST_SIZE]);
    region.extend_from_slice(&data[symoff + undef_end * NLIST_SIZE..symoff + nsyms * NLIST_SIZE]);
    let kept_symbols = nsyms - (undef_end - undef_start);
    let relocations_at = region.len();
    for reloc in preserved {
        region.extend_from_slice(bytes_of(&reloc.relocation(LE)));
    }
    let strings_at = region.len();
    region.extend_from_slice(image.string_table()?);

    if region.len() as u64 > linkedit.filesize {
        return Err(malformed("rebuilt __LINKEDIT does not fit its segment"));
    }
    let start = usize::try_from(linkedit.fileoff).map_err(|_| malformed("bad __LINKEDIT offset"))?;
    let end = usize::try_from(linkedit.filesize)
        .ok()
        .and_then(|size| start.checked_add(size))
        .ok_or_else(|| malformed("__LINKEDIT size overflows"))?;
    let area = image
        .bytes_mut()
        .get_mut(start..end)
        .ok_or_else(|| malformed("__LINKEDIT exceeds the image"))?;
    area[..region.len()].copy_from_slice(&region);
    area[region.len()..].fill(0);

    let size = align_up(region.len() as u64, PAGE_SIZE);
    let command = image.segment_command_mut(&linkedit)?;
    command.filesize.set(LE, size);
    command.vmsize.set(LE, size);

    let base = u32::try_from(linkedit.fileoff).map_err(|_| malformed("__LINKEDIT offset exceeds 32 bits"))?;
    let table_offset = |at: usize| {
        u32::try_from(at)
            .ok()
            .and_then(|at| base.checked_add(at))
            .ok_or_else(|| malformed("__LINKEDIT table offset exceeds 32 bits"))
    };
    let stroff = table_offset(strings_at)?;
    let locreloff = if preserved.is_empty() {
        0
    } else {
        table_offset(relocations_at)?
    };

    let symtab = image.symtab_mut()?;
    symtab.symoff.set(LE, base);
    symtab.nsyms.set(LE, kept_symbols as u32);
    symtab.stroff.set(LE, stroff);

    let dysymtab = image.dysymtab_mut()?;
    dysymtab.locreloff.set(LE, locreloff);
    dysymtab.nlocrel.set(LE, preserved.len() as u32);
    for field in [
        &mut dysymtab.ilocalsym,
        &mut dysymtab.nlocalsym,
        &mut dysymtab.iextdefsym,
        &mut dysymtab.nextdefsym,
        &mut dysymtab.iundefsym,
        &mut dysymtab.nundefsym,
        &mut dysymtab.extreloff,
        &mut dysymtab.nextrel,
        &mut dysymtab.indirectsymoff,
        &mut dysymtab.nindirectsyms,
    ] {
        field.set(LE, 0);
    }

    tracing::debug!(
        "rebuilt __LINKEDIT: {} symbols, {} relocations, {:#x} bytes",
        kept_symbols,
        preserved.len(),
        size
    );
    image.refresh()
}

/// Moves segments and sections to `load_address`, sets protections and marks
/// the image as fully linked.
pub fn adjust_segments<D: AsRef<[u8]> + AsMut<[u8]>>(
    image: &mut MachoImage<D>,
    load_address: u64,
) -> Result<()> {
    let segments = image.segments().to_vec();
    for segment in &segments {
        for section in &segment.sections {
            let linked = section
                .link_address(load_address)
                .ok_or_else(|| malformed(format!("section {} has a bad alignment", section.name)))?;
            image.section_header_mut(section)?.addr.set(LE, linked);
        }
        let prot = if segment.name == TEXT_SEGMENT {
            TEXT_PROT
        } else {
            DATA_PROT
        };
        let command = image.segment_command_mut(segment)?;
        command.vmaddr.set(LE, segment.vmaddr.wrapping_add(load_address));
        command.initprot.set(LE, prot);
        command.maxprot.set(LE, prot);
    }
    image.header_mut()?.flags.set(LE, macho::MH_NOUNDEFS);
    image.refresh()
}
