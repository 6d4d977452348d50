//! Mach-O accessor.
//!
//! `MachoImage` is a checked, in-place view over a 64-bit little-endian
//! x86_64 Mach-O image. It exposes the pieces the prelinker works on:
//! 1. Header and load commands (with stripping of commands that no longer apply).
//! 2. Segment and section snapshots (see `layout`).
//! 3. The symbol table, its local/extdef/undef regions and the string table.
//! 4. Local and external relocation records and the indirect symbol table.
//!
//! Read access works on any `D: AsRef<[u8]>`; mutation additionally needs
//! `D: AsMut<[u8]>`. Every offset and count coming from the image is bounds
//! checked before use.

use object::macho::{
    self, DysymtabCommand, LoadCommand, MachHeader64, Nlist64, Relocation, RelocationInfo,
    Section64, SegmentCommand64, SymtabCommand,
};
use object::pod::{self, Pod};
use object::Endianness;
use std::collections::HashMap;
use std::mem::size_of;
use std::ops::Range;

use crate::error::{malformed, PrelinkError, Result};
use crate::layout::{Section, Segment};
use crate::utils::{c_str_at, fixed_name};

pub mod cxx;

pub const LE: Endianness = Endianness::Little;

pub const HEADER_SIZE: usize = size_of::<MachHeader64<Endianness>>();
pub const NLIST_SIZE: usize = size_of::<Nlist64<Endianness>>();
pub const RELOCATION_SIZE: usize = size_of::<Relocation<Endianness>>();

/// `symbolnum` of a section relocation that references no section.
pub const R_ABS: u32 = 0;

/// Load commands that are invalid once an image has been prelinked.
const STRIPPED_COMMANDS: [u32; 7] = [
    macho::LC_CODE_SIGNATURE,
    macho::LC_DYLD_INFO,
    macho::LC_DYLD_INFO_ONLY,
    macho::LC_FUNCTION_STARTS,
    macho::LC_DATA_IN_CODE,
    macho::LC_DYLIB_CODE_SIGN_DRS,
    macho::LC_UNIXTHREAD,
];

pub type Nlist = Nlist64<Endianness>;

/// Casts the bytes at `offset` to a `T`.
pub fn pod_at<T: Pod>(data: &[u8], offset: usize) -> Result<&T> {
    data.get(offset..)
        .and_then(|tail| pod::from_bytes::<T>(tail).ok())
        .map(|(value, _)| value)
        .ok_or_else(|| malformed(format!("structure at {offset:#x} is out of bounds")))
}

/// Mutable variant of [`pod_at`].
pub fn pod_at_mut<T: Pod>(data: &mut [u8], offset: usize) -> Result<&mut T> {
    data.get_mut(offset..)
        .and_then(|tail| pod::from_bytes_mut::<T>(tail).ok())
        .map(|(value, _)| value)
        .ok_or_else(|| malformed(format!("structure at {offset:#x} is out of bounds")))
}

/// Validates that `count` records of `size` bytes at `offset` fit in `len`.
fn table_range(offset: u32, count: u32, size: usize, len: usize, what: &str) -> Result<Range<usize>> {
    let start = offset as usize;
    let end = (count as usize)
        .checked_mul(size)
        .and_then(|bytes| start.checked_add(bytes))
        .filter(|&end| end <= len)
        .ok_or_else(|| malformed(format!("{what} exceeds the image")))?;
    Ok(start..end)
}

// Symbol predicates.

pub fn is_stab(sym: &Nlist) -> bool {
    sym.n_type & macho::N_STAB != 0
}

pub fn symbol_type(sym: &Nlist) -> u8 {
    sym.n_type & macho::N_TYPE
}

pub fn is_undefined(sym: &Nlist) -> bool {
    !is_stab(sym) && symbol_type(sym) == macho::N_UNDF
}

pub fn is_indirect(sym: &Nlist) -> bool {
    !is_stab(sym) && symbol_type(sym) == macho::N_INDR
}

/// Undefined or indirect: still waiting for a value from a dependency.
pub fn is_unresolved(sym: &Nlist) -> bool {
    is_undefined(sym) || is_indirect(sym)
}

pub fn is_defined(sym: &Nlist) -> bool {
    !is_stab(sym) && matches!(symbol_type(sym), macho::N_ABS | macho::N_SECT)
}

pub fn is_external(sym: &Nlist) -> bool {
    sym.n_type & macho::N_EXT != 0
}

pub fn is_weak(sym: &Nlist) -> bool {
    sym.n_desc.get(LE) & macho::N_WEAK_DEF != 0
}

/// Whether the symbol value is an address inside section `n_sect`.
pub fn is_section_based(sym: &Nlist) -> bool {
    if is_stab(sym) {
        matches!(
            sym.n_type,
            macho::N_FUN
                | macho::N_STSYM
                | macho::N_LCSYM
                | macho::N_BNSYM
                | macho::N_SLINE
                | macho::N_ENSYM
                | macho::N_SO
                | macho::N_SOL
                | macho::N_ENTRY
                | macho::N_ECOMM
                | macho::N_ECOML
                | macho::N_RBRAC
                | macho::N_LBRAC
        )
    } else {
        symbol_type(sym) == macho::N_SECT
    }
}

/// Turns `sym` into an absolute, external, section-less definition of `value`.
pub fn set_absolute(sym: &mut Nlist, value: u64) {
    sym.n_type = macho::N_ABS | macho::N_EXT;
    sym.n_sect = macho::NO_SECT;
    sym.n_value.set(LE, value);
}

/// A load command's position within the image.
#[derive(Debug, Clone, Copy)]
pub struct LoadCommandRef {
    pub offset: usize,
    pub cmd: u32,
    pub cmdsize: u32,
}

/// A checked view over a Mach-O image.
pub struct MachoImage<D> {
    data: D,
    symtab_offset: usize,
    dysymtab_offset: usize,
    segments: Vec<Segment>,
}

impl<D: AsRef<[u8]>> MachoImage<D> {
    /// Validates the image layout and indexes its load commands.
    pub fn parse(data: D) -> Result<Self> {
        let mut image = Self {
            data,
            symtab_offset: 0,
            dysymtab_offset: 0,
            segments: Vec::new(),
        };
        image.rescan()?;
        Ok(image)
    }

    pub fn bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    pub fn into_inner(self) -> D {
        self.data
    }

    pub fn header(&self) -> Result<&MachHeader64<Endianness>> {
        pod_at(self.bytes(), 0)
    }

    pub fn flags(&self) -> Result<u32> {
        Ok(self.header()?.flags.get(LE))
    }

    pub fn load_commands(&self) -> Result<Vec<LoadCommandRef>> {
        let data = self.bytes();
        let header = self.header()?;
        let end = HEADER_SIZE
            .checked_add(header.sizeofcmds.get(LE) as usize)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| malformed("load commands exceed the image"))?;

        let mut commands = Vec::new();
        let mut offset = HEADER_SIZE;
        for _ in 0..header.ncmds.get(LE) {
            if offset + size_of::<LoadCommand<Endianness>>() > end {
                return Err(malformed("truncated load command"));
            }
            let command: &LoadCommand<Endianness> = pod_at(data, offset)?;
            let cmdsize = command.cmdsize.get(LE);
            if (cmdsize as usize) < size_of::<LoadCommand<Endianness>>()
                || offset + cmdsize as usize > end
            {
                return Err(malformed(format!("bad load command size {cmdsize} at {offset:#x}")));
            }
            commands.push(LoadCommandRef {
                offset,
                cmd: command.cmd.get(LE),
                cmdsize,
            });
            offset += cmdsize as usize;
        }
        Ok(commands)
    }

    /// Re-reads the load commands after a structural change.
    fn rescan(&mut self) -> Result<()> {
        let data = self.bytes();
        if data.len() < HEADER_SIZE || data[..4] != macho::MH_MAGIC_64.to_le_bytes() {
            return Err(PrelinkError::Unsupported(
                "not a little-endian 64-bit Mach-O image".into(),
            ));
        }
        let cputype = self.header()?.cputype.get(LE);
        if cputype != macho::CPU_TYPE_X86_64 {
            return Err(PrelinkError::Unsupported(format!(
                "cpu type {cputype:#x} is not x86_64"
            )));
        }

        let mut segments = Vec::new();
        let mut symtab = None;
        let mut dysymtab = None;
        let mut ordinal = 0u32;
        for command in self.load_commands()? {
            match command.cmd {
                macho::LC_SEGMENT_64 => {
                    let segment = self.read_segment(command, &mut ordinal)?;
                    segments.push(segment);
                }
                macho::LC_SYMTAB => {
                    if symtab.replace(command.offset).is_some() {
                        return Err(malformed("more than one LC_SYMTAB"));
                    }
                    if (command.cmdsize as usize) < size_of::<SymtabCommand<Endianness>>() {
                        return Err(malformed("LC_SYMTAB is truncated"));
                    }
                }
                macho::LC_DYSYMTAB => {
                    if dysymtab.replace(command.offset).is_some() {
                        return Err(malformed("more than one LC_DYSYMTAB"));
                    }
                    if (command.cmdsize as usize) < size_of::<DysymtabCommand<Endianness>>() {
                        return Err(malformed("LC_DYSYMTAB is truncated"));
                    }
                }
                _ => {}
            }
        }

        self.symtab_offset = symtab.ok_or_else(|| malformed("missing LC_SYMTAB"))?;
        self.dysymtab_offset = dysymtab.ok_or_else(|| malformed("missing LC_DYSYMTAB"))?;
        self.segments = segments;
        self.validate_tables()
    }

    fn read_segment(&self, command: LoadCommandRef, ordinal: &mut u32) -> Result<Segment> {
        let data = self.bytes();
        let segment: &SegmentCommand64<Endianness> = pod_at(data, command.offset)?;
        let nsects = segment.nsects.get(LE) as usize;
        let needed = size_of::<SegmentCommand64<Endianness>>()
            + nsects * size_of::<Section64<Endianness>>();
        if (command.cmdsize as usize) < needed {
            return Err(malformed("segment command is too small for its sections"));
        }

        let mut sections = Vec::with_capacity(nsects);
        let mut header_offset = command.offset + size_of::<SegmentCommand64<Endianness>>();
        for _ in 0..nsects {
            let section: &Section64<Endianness> = pod_at(data, header_offset)?;
            *ordinal += 1;
            sections.push(Section {
                ordinal: *ordinal,
                name: fixed_name(&section.sectname).to_string(),
                segment_name: fixed_name(&section.segname).to_string(),
                addr: section.addr.get(LE),
                size: section.size.get(LE),
                offset: section.offset.get(LE),
                align: section.align.get(LE),
                flags: section.flags.get(LE),
                reserved1: section.reserved1.get(LE),
                header_offset,
            });
            header_offset += size_of::<Section64<Endianness>>();
        }

        Ok(Segment {
            name: fixed_name(&segment.segname).to_string(),
            vmaddr: segment.vmaddr.get(LE),
            vmsize: segment.vmsize.get(LE),
            fileoff: segment.fileoff.get(LE),
            filesize: segment.filesize.get(LE),
            command_offset: command.offset,
            sections,
        })
    }

    fn validate_tables(&self) -> Result<()> {
        let len = self.bytes().len();
        let symtab = self.symtab()?;
        let nsyms = symtab.nsyms.get(LE);
        table_range(symtab.symoff.get(LE), nsyms, NLIST_SIZE, len, "symbol table")?;
        table_range(symtab.stroff.get(LE), symtab.strsize.get(LE), 1, len, "string table")?;

        let dysymtab = self.dysymtab()?;
        let local = dysymtab.ilocalsym.get(LE) as u64..(dysymtab.ilocalsym.get(LE) as u64 + dysymtab.nlocalsym.get(LE) as u64);
        let extdef = dysymtab.iextdefsym.get(LE) as u64..(dysymtab.iextdefsym.get(LE) as u64 + dysymtab.nextdefsym.get(LE) as u64);
        let undef = dysymtab.iundefsym.get(LE) as u64..(dysymtab.iundefsym.get(LE) as u64 + dysymtab.nundefsym.get(LE) as u64);
        if extdef.start != local.end || undef.start != extdef.end || undef.end > nsyms as u64 {
            return Err(malformed(
                "symbol regions are not contiguous local, extdef, undef",
            ));
        }

        table_range(dysymtab.extreloff.get(LE), dysymtab.nextrel.get(LE), RELOCATION_SIZE, len, "external relocations")?;
        table_range(dysymtab.locreloff.get(LE), dysymtab.nlocrel.get(LE), RELOCATION_SIZE, len, "local relocations")?;
        table_range(dysymtab.indirectsymoff.get(LE), dysymtab.nindirectsyms.get(LE), 4, len, "indirect symbol table")?;
        Ok(())
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|seg| seg.name == name)
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.segments.iter().flat_map(|seg| seg.sections.iter())
    }

    /// Section by its 1-based ordinal.
    pub fn section(&self, ordinal: u32) -> Option<&Section> {
        self.sections().find(|sect| sect.ordinal == ordinal)
    }

    pub fn section_by_name(&self, segment: &str, section: &str) -> Option<&Section> {
        self.sections()
            .find(|sect| sect.segment_name == segment && sect.name == section)
    }

    /// Address relocation offsets are relative to.
    pub fn relocation_base(&self) -> u64 {
        self.segments.first().map_or(0, |seg| seg.vmaddr)
    }

    /// Sum of all segment sizes.
    pub fn vm_size(&self) -> u64 {
        self.segments.iter().map(|seg| seg.vmsize).sum()
    }

    /// End of the highest segment.
    pub fn last_address(&self) -> u64 {
        self.segments.iter().map(Segment::end).max().unwrap_or(0)
    }

    pub fn is_address_mapped(&self, address: u64) -> bool {
        self.segments.iter().any(|seg| seg.contains(address, 1))
    }

    /// File offset of `len` bytes at virtual `address`.
    pub fn file_offset(&self, address: u64, len: u64) -> Result<usize> {
        let offset = self
            .segments
            .iter()
            .find_map(|seg| seg.file_offset(address, len))
            .ok_or_else(|| malformed(format!("address {address:#x} is not backed by file data")))?;
        let offset = usize::try_from(offset).map_err(|_| malformed("file offset overflow"))?;
        if offset + len as usize > self.bytes().len() {
            return Err(malformed(format!("address {address:#x} is past the end of the image")));
        }
        Ok(offset)
    }

    pub fn read_u64(&self, address: u64) -> Result<u64> {
        let offset = self.file_offset(address, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes()[offset..offset + 8]);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn symtab(&self) -> Result<&SymtabCommand<Endianness>> {
        pod_at(self.bytes(), self.symtab_offset)
    }

    pub fn dysymtab(&self) -> Result<&DysymtabCommand<Endianness>> {
        pod_at(self.bytes(), self.dysymtab_offset)
    }

    pub fn symbol_count(&self) -> Result<u32> {
        Ok(self.symtab()?.nsyms.get(LE))
    }

    fn symbol_offset(&self, index: u32) -> Result<usize> {
        let symtab = self.symtab()?;
        if index >= symtab.nsyms.get(LE) {
            return Err(malformed(format!("symbol index {index} out of range")));
        }
        Ok(symtab.symoff.get(LE) as usize + index as usize * NLIST_SIZE)
    }

    pub fn symbol(&self, index: u32) -> Result<&Nlist> {
        pod_at(self.bytes(), self.symbol_offset(index)?)
    }

    pub fn string_table(&self) -> Result<&[u8]> {
        let symtab = self.symtab()?;
        let range = table_range(
            symtab.stroff.get(LE),
            symtab.strsize.get(LE),
            1,
            self.bytes().len(),
            "string table",
        )?;
        Ok(&self.bytes()[range])
    }

    /// String at `strx` in the string table.
    pub fn string(&self, strx: u32) -> Result<&str> {
        c_str_at(self.string_table()?, strx as usize)
            .ok_or_else(|| malformed(format!("bad string table index {strx}")))
    }

    pub fn symbol_name(&self, index: u32) -> Result<&str> {
        self.string(self.symbol(index)?.n_strx.get(LE))
    }

    pub fn local_range(&self) -> Result<Range<u32>> {
        let dysymtab = self.dysymtab()?;
        let start = dysymtab.ilocalsym.get(LE);
        Ok(start..start + dysymtab.nlocalsym.get(LE))
    }

    pub fn external_defined_range(&self) -> Result<Range<u32>> {
        let dysymtab = self.dysymtab()?;
        let start = dysymtab.iextdefsym.get(LE);
        Ok(start..start + dysymtab.nextdefsym.get(LE))
    }

    pub fn undefined_range(&self) -> Result<Range<u32>> {
        let dysymtab = self.dysymtab()?;
        let start = dysymtab.iundefsym.get(LE);
        Ok(start..start + dysymtab.nundefsym.get(LE))
    }

    /// Defined here rather than imported: outside the undefined region, not
    /// indirect, and of a defined type.
    pub fn is_locally_defined(&self, index: u32) -> Result<bool> {
        if self.undefined_range()?.contains(&index) {
            return Ok(false);
        }
        let sym = self.symbol(index)?;
        Ok(!is_indirect(sym) && is_defined(sym))
    }

    /// Locally defined symbol by name.
    pub fn find_defined_symbol(&self, name: &str) -> Result<Option<u32>> {
        let undefined = self.undefined_range()?;
        for index in 0..self.symbol_count()? {
            if undefined.contains(&index) {
                continue;
            }
            let sym = self.symbol(index)?;
            if is_defined(sym) && self.string(sym.n_strx.get(LE))? == name {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Symbol by name within the undefined region, whatever its current state.
    pub fn find_undefined_symbol(&self, name: &str) -> Result<Option<u32>> {
        for index in self.undefined_range()? {
            if self.symbol_name(index)? == name {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Defined C++ symbol whose value is exactly `value`.
    pub fn find_cxx_symbol_by_value(&self, value: u64) -> Result<Option<&str>> {
        for index in 0..self.symbol_count()? {
            let sym = self.symbol(index)?;
            if !is_defined(sym) || sym.n_value.get(LE) != value {
                continue;
            }
            let name = self.string(sym.n_strx.get(LE))?;
            if cxx::is_cxx(name) {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }

    fn relocations(&self, offset: u32, count: u32) -> Result<Vec<RelocationInfo>> {
        let range = table_range(offset, count, RELOCATION_SIZE, self.bytes().len(), "relocations")?;
        let (records, _) =
            pod::slice_from_bytes::<Relocation<Endianness>>(&self.bytes()[range], count as usize)
                .map_err(|()| malformed("relocation table is truncated"))?;
        Ok(records.iter().map(|reloc| reloc.info(LE)).collect())
    }

    pub fn local_relocations(&self) -> Result<Vec<RelocationInfo>> {
        let dysymtab = self.dysymtab()?;
        self.relocations(dysymtab.locreloff.get(LE), dysymtab.nlocrel.get(LE))
    }

    pub fn external_relocations(&self) -> Result<Vec<RelocationInfo>> {
        let dysymtab = self.dysymtab()?;
        self.relocations(dysymtab.extreloff.get(LE), dysymtab.nextrel.get(LE))
    }

    /// Symbols bound by external relocations, keyed by fixup address.
    ///
    /// The first record wins when several share a location.
    pub fn external_relocation_targets(&self) -> Result<HashMap<u64, u32>> {
        let base = self.relocation_base();
        let mut targets = HashMap::new();
        for reloc in self.external_relocations()? {
            if reloc.r_extern {
                targets
                    .entry(base.wrapping_add(u64::from(reloc.r_address)))
                    .or_insert(reloc.r_symbolnum);
            }
        }
        Ok(targets)
    }

    pub fn indirect_symbols(&self) -> Result<Vec<u32>> {
        let dysymtab = self.dysymtab()?;
        let count = dysymtab.nindirectsyms.get(LE);
        let range = table_range(dysymtab.indirectsymoff.get(LE), count, 4, self.bytes().len(), "indirect symbol table")?;
        Ok(self.bytes()[range]
            .chunks_exact(4)
            .map(|raw| u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
            .collect())
    }
}

impl<D: AsRef<[u8]> + AsMut<[u8]>> MachoImage<D> {
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_mut()
    }

    pub fn header_mut(&mut self) -> Result<&mut MachHeader64<Endianness>> {
        pod_at_mut(self.bytes_mut(), 0)
    }

    pub fn symtab_mut(&mut self) -> Result<&mut SymtabCommand<Endianness>> {
        let offset = self.symtab_offset;
        pod_at_mut(self.bytes_mut(), offset)
    }

    pub fn dysymtab_mut(&mut self) -> Result<&mut DysymtabCommand<Endianness>> {
        let offset = self.dysymtab_offset;
        pod_at_mut(self.bytes_mut(), offset)
    }

    pub fn symbol_mut(&mut self, index: u32) -> Result<&mut Nlist> {
        let offset = self.symbol_offset(index)?;
        pod_at_mut(self.bytes_mut(), offset)
    }

    pub fn write_u64(&mut self, address: u64, value: u64) -> Result<()> {
        let offset = self.file_offset(address, 8)?;
        self.bytes_mut()[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// The segment command of a snapshot taken earlier.
    pub fn segment_command_mut(&mut self, segment: &Segment) -> Result<&mut SegmentCommand64<Endianness>> {
        pod_at_mut(self.bytes_mut(), segment.command_offset)
    }

    pub fn section_header_mut(&mut self, section: &Section) -> Result<&mut Section64<Endianness>> {
        pod_at_mut(self.bytes_mut(), section.header_offset)
    }

    /// Re-reads segment snapshots after segment commands were edited.
    pub fn refresh(&mut self) -> Result<()> {
        self.rescan()
    }

    /// Removes load commands that are invalid once the image is prelinked,
    /// compacting the remaining commands. Returns how many were removed.
    pub fn strip_load_commands(&mut self) -> Result<usize> {
        let commands = self.load_commands()?;
        let sizeofcmds = self.header()?.sizeofcmds.get(LE) as usize;

        let mut kept = Vec::with_capacity(sizeofcmds);
        let mut ncmds = 0u32;
        for command in &commands {
            if STRIPPED_COMMANDS.contains(&command.cmd) {
                tracing::trace!("stripping load command {:#x}", command.cmd);
                continue;
            }
            let range = command.offset..command.offset + command.cmdsize as usize;
            kept.extend_from_slice(&self.bytes()[range]);
            ncmds += 1;
        }

        let removed = commands.len() - ncmds as usize;
        if removed == 0 {
            return Ok(0);
        }

        let area = HEADER_SIZE..HEADER_SIZE + sizeofcmds;
        let new_size = kept.len();
        let bytes = &mut self.bytes_mut()[area];
        bytes[..new_size].copy_from_slice(&kept);
        bytes[new_size..].fill(0);

        let header = self.header_mut()?;
        header.ncmds.set(LE, ncmds);
        header.sizeofcmds.set(LE, new_size as u32);
        self.rescan()?;
        Ok(removed)
    }
}
