//! Synthetic KEXT images for unit tests.
//!
//! The builder lays out a minimal `MH_KEXT_BUNDLE`:
//!
//! ```text
//! 0x0000 __TEXT     header, load commands, __text at 0x800
//! 0x1000 __DATA     __data at 0x1000, __nl_symbol_ptr at 0x1800
//! 0x2000 __LINKEDIT symbols, relocations, indirect table, strings
//! ```
//!
//! Virtual addresses equal file offsets, so tests can reason about both.

use object::endian::{BigEndian, U32Bytes, U64Bytes, U16, U32, U64};
use object::macho::{
    self, DysymtabCommand, LinkeditDataCommand, MachHeader64, Nlist64, RelocationInfo, Section64,
    SegmentCommand64, SymtabCommand,
};
use object::pod::bytes_of;
use object::Endianness;

use crate::dependency::LinkedKext;
use crate::layout::PAGE_SIZE;
use crate::macho::{cxx, LE};
use crate::symbol::SymbolTable;
use crate::utils::{align_up, to_fixed_name};
use crate::vtable::{VTable, VTableArena, VTableEntry};

struct SymbolSpec {
    name: String,
    n_type: u8,
    n_sect: u8,
    n_desc: u16,
    value: u64,
    /// Name whose string index becomes the value (indirect symbols).
    indirect_target: Option<String>,
}

struct RelocSpec {
    address: u32,
    symbol: Option<String>,
    section: u32,
    pcrel: bool,
    length: u8,
    r_type: u8,
}

pub struct KextBuilder {
    flags: u32,
    text: Vec<u8>,
    data: Vec<u8>,
    symbol_pointers: Vec<u64>,
    indirect: Vec<u32>,
    locals: Vec<SymbolSpec>,
    externals: Vec<SymbolSpec>,
    undefined: Vec<SymbolSpec>,
    local_relocs: Vec<RelocSpec>,
    external_relocs: Vec<RelocSpec>,
    with_symtab: bool,
    with_function_starts: bool,
    linkedit_slack: u64,
    extra_segments: Vec<ExtraSegment>,
}

/// A one-section segment placed in the file after `__LINKEDIT`.
struct ExtraSegment {
    segname: String,
    sectname: String,
    vmaddr: u64,
    bytes: Vec<u8>,
}

impl Default for KextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KextBuilder {
    pub const TEXT_ADDR: u64 = 0x800;
    pub const DATA_ADDR: u64 = 0x1000;
    pub const POINTERS_ADDR: u64 = 0x1800;
    pub const LINKEDIT_ADDR: u64 = 0x2000;

    pub fn new() -> Self {
        Self {
            flags: macho::MH_DYLDLINK,
            text: vec![0; 0x10],
            data: Vec::new(),
            symbol_pointers: Vec::new(),
            indirect: Vec::new(),
            locals: Vec::new(),
            externals: Vec::new(),
            undefined: Vec::new(),
            local_relocs: Vec::new(),
            external_relocs: Vec::new(),
            with_symtab: true,
            with_function_starts: false,
            linkedit_slack: 0,
            extra_segments: Vec::new(),
        }
    }

    pub fn flags(&mut self, flags: u32) -> &mut Self {
        self.flags = flags;
        self
    }

    pub fn text(&mut self, bytes: &[u8]) -> &mut Self {
        self.text = bytes.to_vec();
        self
    }

    /// Appends little-endian words to `__data`, returning the first one's address.
    pub fn data_words(&mut self, words: &[u64]) -> u64 {
        let address = Self::DATA_ADDR + self.data.len() as u64;
        for word in words {
            self.data.extend_from_slice(&word.to_le_bytes());
        }
        address
    }

    /// Adds a non-lazy pointer slot bound to indirect table entry `indirect`.
    pub fn symbol_pointer(&mut self, initial: u64, indirect: u32) -> u64 {
        let address = Self::POINTERS_ADDR + self.symbol_pointers.len() as u64 * 8;
        self.symbol_pointers.push(initial);
        self.indirect.push(indirect);
        address
    }

    fn spec(name: &str, n_type: u8, n_sect: u8, value: u64) -> SymbolSpec {
        SymbolSpec {
            name: name.to_string(),
            n_type,
            n_sect,
            n_desc: 0,
            value,
            indirect_target: None,
        }
    }

    pub fn local(&mut self, name: &str, sect: u8, value: u64) -> &mut Self {
        self.locals.push(Self::spec(name, macho::N_SECT, sect, value));
        self
    }

    pub fn external(&mut self, name: &str, sect: u8, value: u64) -> &mut Self {
        self.externals
            .push(Self::spec(name, macho::N_SECT | macho::N_EXT, sect, value));
        self
    }

    /// External N_INDR symbol re-exporting `target`.
    pub fn indirect(&mut self, name: &str, target: &str) -> &mut Self {
        let mut spec = Self::spec(name, macho::N_INDR | macho::N_EXT, 0, 0);
        spec.indirect_target = Some(target.to_string());
        self.externals.push(spec);
        self
    }

    pub fn undefined(&mut self, name: &str) -> &mut Self {
        self.undefined
            .push(Self::spec(name, macho::N_UNDF | macho::N_EXT, 0, 0));
        self
    }

    pub fn weak_undefined(&mut self, name: &str) -> &mut Self {
        let mut spec = Self::spec(name, macho::N_UNDF | macho::N_EXT, 0, 0);
        spec.n_desc = macho::N_WEAK_DEF;
        self.undefined.push(spec);
        self
    }

    /// Undefined symbol with a size, i.e. a common symbol.
    pub fn common(&mut self, name: &str, size: u64) -> &mut Self {
        self.undefined
            .push(Self::spec(name, macho::N_UNDF | macho::N_EXT, 0, size));
        self
    }

    pub fn external_reloc(&mut self, address: u64, symbol: &str, r_type: u8, length: u8, pcrel: bool) -> &mut Self {
        self.external_relocs.push(RelocSpec {
            address: address as u32,
            symbol: Some(symbol.to_string()),
            section: 0,
            pcrel,
            length,
            r_type,
        });
        self
    }

    pub fn local_reloc(&mut self, address: u64, section: u32, r_type: u8, length: u8, pcrel: bool) -> &mut Self {
        self.local_relocs.push(RelocSpec {
            address: address as u32,
            symbol: None,
            section,
            pcrel,
            length,
            r_type,
        });
        self
    }

    pub fn omit_symtab(&mut self) -> &mut Self {
        self.with_symtab = false;
        self
    }

    pub fn function_starts(&mut self) -> &mut Self {
        self.with_function_starts = true;
        self
    }

    /// Extra bytes reserved at the end of `__LINKEDIT`.
    pub fn linkedit_slack(&mut self, bytes: u64) -> &mut Self {
        self.linkedit_slack = bytes;
        self
    }

    /// Adds a segment at `vmaddr` whose file data follows `__LINKEDIT`.
    pub fn segment(&mut self, segname: &str, sectname: &str, vmaddr: u64, bytes: &[u8]) -> &mut Self {
        self.extra_segments.push(ExtraSegment {
            segname: segname.to_string(),
            sectname: sectname.to_string(),
            vmaddr,
            bytes: bytes.to_vec(),
        });
        self
    }

    fn symbols(&self) -> impl Iterator<Item = &SymbolSpec> {
        self.locals
            .iter()
            .chain(self.externals.iter())
            .chain(self.undefined.iter())
    }

    fn symbol_index(&self, name: &str) -> u32 {
        self.symbols()
            .position(|spec| spec.name == name)
            .map(|index| index as u32)
            .unwrap_or_else(|| panic!("relocation against unknown symbol {name}"))
    }

    pub fn build(&self) -> Vec<u8> {
        // String table.
        let mut strings = vec![0u8];
        let intern = |name: &str, strings: &mut Vec<u8>| -> u32 {
            let strx = strings.len() as u32;
            strings.extend_from_slice(name.as_bytes());
            strings.push(0);
            strx
        };
        let mut nlists = Vec::new();
        for spec in self.symbols() {
            let strx = intern(&spec.name, &mut strings);
            let value = match &spec.indirect_target {
                Some(target) => intern(target, &mut strings) as u64,
                None => spec.value,
            };
            nlists.push(Nlist64::<Endianness> {
                n_strx: U32::new(LE, strx),
                n_type: spec.n_type,
                n_sect: spec.n_sect,
                n_desc: U16::new(LE, spec.n_desc),
                n_value: U64Bytes::new(LE, value),
            });
        }
        while strings.len() % 8 != 0 {
            strings.push(0);
        }

        let encode = |spec: &RelocSpec| {
            let (symbolnum, is_extern) = match &spec.symbol {
                Some(name) => (self.symbol_index(name), true),
                None => (spec.section, false),
            };
            RelocationInfo {
                r_address: spec.address,
                r_symbolnum: symbolnum,
                r_pcrel: spec.pcrel,
                r_length: spec.length,
                r_extern: is_extern,
                r_type: spec.r_type,
            }
            .relocation(LE)
        };

        // __LINKEDIT contents.
        let linkedit_off = Self::LINKEDIT_ADDR;
        let mut linkedit = Vec::new();
        let symoff = linkedit_off + linkedit.len() as u64;
        for nlist in &nlists {
            linkedit.extend_from_slice(bytes_of(nlist));
        }
        let locreloff = linkedit_off + linkedit.len() as u64;
        for spec in &self.local_relocs {
            linkedit.extend_from_slice(bytes_of(&encode(spec)));
        }
        let extreloff = linkedit_off + linkedit.len() as u64;
        for spec in &self.external_relocs {
            linkedit.extend_from_slice(bytes_of(&encode(spec)));
        }
        let indirectoff = linkedit_off + linkedit.len() as u64;
        for index in &self.indirect {
            linkedit.extend_from_slice(&index.to_le_bytes());
        }
        while linkedit.len() % 8 != 0 {
            linkedit.push(0);
        }
        let function_starts_off = linkedit_off + linkedit.len() as u64;
        if self.with_function_starts {
            linkedit.extend_from_slice(&[0; 8]);
        }
        let stroff = linkedit_off + linkedit.len() as u64;
        linkedit.extend_from_slice(&strings);
        let linkedit_size = align_up(linkedit.len() as u64 + self.linkedit_slack, PAGE_SIZE);

        // Load commands.
        let mut commands = Vec::new();
        let mut ncmds = 0u32;
        let section = |sectname: &str, segname: &str, addr: u64, size: u64, align: u32, flags: u32, reserved1: u32| {
            Section64::<Endianness> {
                sectname: to_fixed_name(sectname),
                segname: to_fixed_name(segname),
                addr: U64::new(LE, addr),
                size: U64::new(LE, size),
                offset: U32::new(LE, addr as u32),
                align: U32::new(LE, align),
                reloff: U32::new(LE, 0),
                nreloc: U32::new(LE, 0),
                flags: U32::new(LE, flags),
                reserved1: U32::new(LE, reserved1),
                reserved2: U32::new(LE, 0),
                reserved3: U32::new(LE, 0),
            }
        };
        let segment = |segname: &str, vmaddr: u64, fileoff: u64, size: u64, sections: &[Section64<Endianness>], prot: u32| {
            let cmdsize = std::mem::size_of::<SegmentCommand64<Endianness>>()
                + sections.len() * std::mem::size_of::<Section64<Endianness>>();
            let mut out = bytes_of(&SegmentCommand64::<Endianness> {
                cmd: U32::new(LE, macho::LC_SEGMENT_64),
                cmdsize: U32::new(LE, cmdsize as u32),
                segname: to_fixed_name(segname),
                vmaddr: U64::new(LE, vmaddr),
                vmsize: U64::new(LE, size),
                fileoff: U64::new(LE, fileoff),
                filesize: U64::new(LE, size),
                maxprot: U32::new(LE, prot),
                initprot: U32::new(LE, prot),
                nsects: U32::new(LE, sections.len() as u32),
                flags: U32::new(LE, 0),
            })
            .to_vec();
            for sect in sections {
                out.extend_from_slice(bytes_of(sect));
            }
            out
        };

        let rwx = macho::VM_PROT_READ | macho::VM_PROT_WRITE | macho::VM_PROT_EXECUTE;
        commands.extend(segment(
            "__TEXT",
            0,
            0,
            PAGE_SIZE,
            &[section("__text", "__TEXT", Self::TEXT_ADDR, self.text.len() as u64, 4, 0, 0)],
            rwx,
        ));
        ncmds += 1;

        let mut data_sections = vec![section("__data", "__DATA", Self::DATA_ADDR, self.data.len() as u64, 3, 0, 0)];
        if !self.symbol_pointers.is_empty() {
            data_sections.push(section(
                "__nl_symbol_ptr",
                "__DATA",
                Self::POINTERS_ADDR,
                self.symbol_pointers.len() as u64 * 8,
                3,
                macho::S_NON_LAZY_SYMBOL_POINTERS,
                0,
            ));
        }
        commands.extend(segment("__DATA", Self::DATA_ADDR, Self::DATA_ADDR, PAGE_SIZE, &data_sections, rwx));
        ncmds += 1;
        commands.extend(segment("__LINKEDIT", Self::LINKEDIT_ADDR, Self::LINKEDIT_ADDR, linkedit_size, &[], macho::VM_PROT_READ));
        ncmds += 1;

        let mut extra_offsets = Vec::new();
        let mut file_end = Self::LINKEDIT_ADDR + linkedit_size;
        for extra in &self.extra_segments {
            let size = align_up(extra.bytes.len() as u64, PAGE_SIZE);
            let mut sect = section(&extra.sectname, &extra.segname, extra.vmaddr, extra.bytes.len() as u64, 0, 0, 0);
            sect.offset = U32::new(LE, file_end as u32);
            commands.extend(segment(&extra.segname, extra.vmaddr, file_end, size, &[sect], macho::VM_PROT_READ));
            ncmds += 1;
            extra_offsets.push(file_end as usize);
            file_end += size;
        }

        if self.with_symtab {
            commands.extend_from_slice(bytes_of(&SymtabCommand::<Endianness> {
                cmd: U32::new(LE, macho::LC_SYMTAB),
                cmdsize: U32::new(LE, std::mem::size_of::<SymtabCommand<Endianness>>() as u32),
                symoff: U32::new(LE, symoff as u32),
                nsyms: U32::new(LE, nlists.len() as u32),
                stroff: U32::new(LE, stroff as u32),
                strsize: U32::new(LE, strings.len() as u32),
            }));
            ncmds += 1;
        }

        let nlocal = self.locals.len() as u32;
        let nextdef = self.externals.len() as u32;
        let zero = || U32::new(LE, 0);
        commands.extend_from_slice(bytes_of(&DysymtabCommand::<Endianness> {
            cmd: U32::new(LE, macho::LC_DYSYMTAB),
            cmdsize: U32::new(LE, std::mem::size_of::<DysymtabCommand<Endianness>>() as u32),
            ilocalsym: zero(),
            nlocalsym: U32::new(LE, nlocal),
            iextdefsym: U32::new(LE, nlocal),
            nextdefsym: U32::new(LE, nextdef),
            iundefsym: U32::new(LE, nlocal + nextdef),
            nundefsym: U32::new(LE, self.undefined.len() as u32),
            tocoff: zero(),
            ntoc: zero(),
            modtaboff: zero(),
            nmodtab: zero(),
            extrefsymoff: zero(),
            nextrefsyms: zero(),
            indirectsymoff: U32::new(LE, if self.indirect.is_empty() { 0 } else { indirectoff as u32 }),
            nindirectsyms: U32::new(LE, self.indirect.len() as u32),
            extreloff: U32::new(LE, if self.external_relocs.is_empty() { 0 } else { extreloff as u32 }),
            nextrel: U32::new(LE, self.external_relocs.len() as u32),
            locreloff: U32::new(LE, if self.local_relocs.is_empty() { 0 } else { locreloff as u32 }),
            nlocrel: U32::new(LE, self.local_relocs.len() as u32),
        }));
        ncmds += 1;

        if self.with_function_starts {
            commands.extend_from_slice(bytes_of(&LinkeditDataCommand::<Endianness> {
                cmd: U32::new(LE, macho::LC_FUNCTION_STARTS),
                cmdsize: U32::new(LE, std::mem::size_of::<LinkeditDataCommand<Endianness>>() as u32),
                dataoff: U32::new(LE, function_starts_off as u32),
                datasize: U32::new(LE, 8),
            }));
            ncmds += 1;
        }

        let header = MachHeader64::<Endianness> {
            magic: U32Bytes::new(BigEndian, macho::MH_CIGAM_64),
            cputype: U32::new(LE, macho::CPU_TYPE_X86_64),
            cpusubtype: U32::new(LE, macho::CPU_SUBTYPE_X86_64_ALL),
            filetype: U32::new(LE, macho::MH_KEXT_BUNDLE),
            ncmds: U32::new(LE, ncmds),
            sizeofcmds: U32::new(LE, commands.len() as u32),
            flags: U32::new(LE, self.flags),
            reserved: U32::new(LE, 0),
        };

        let mut image = vec![0u8; file_end as usize];
        let header_bytes = bytes_of(&header);
        image[..header_bytes.len()].copy_from_slice(header_bytes);
        image[header_bytes.len()..header_bytes.len() + commands.len()].copy_from_slice(&commands);
        assert!(header_bytes.len() + commands.len() <= Self::TEXT_ADDR as usize);

        let text_at = Self::TEXT_ADDR as usize;
        image[text_at..text_at + self.text.len()].copy_from_slice(&self.text);
        let data_at = Self::DATA_ADDR as usize;
        image[data_at..data_at + self.data.len()].copy_from_slice(&self.data);
        let mut pointer_at = Self::POINTERS_ADDR as usize;
        for pointer in &self.symbol_pointers {
            image[pointer_at..pointer_at + 8].copy_from_slice(&pointer.to_le_bytes());
            pointer_at += 8;
        }
        let linkedit_at = Self::LINKEDIT_ADDR as usize;
        image[linkedit_at..linkedit_at + linkedit.len()].copy_from_slice(&linkedit);
        for (extra, at) in self.extra_segments.iter().zip(extra_offsets) {
            image[at..at + extra.bytes.len()].copy_from_slice(&extra.bytes);
        }
        image
    }
}

/// An already linked KEXT exporting class `6Parent` and the root
/// metaclass vtable.
pub fn parent_kext() -> LinkedKext {
    let symbols = SymbolTable::from_entries([
        ("__ZN6Parent10gMetaClassE", 0x5000),
        ("__ZN6Parent3fooEv", 0x5100),
        ("__ZN6Parent27_RESERVEDParent0Ev", 0x5200),
        ("__ZN11OSMetaClass5allocEv", 0x5300),
        ("__ZTV6Parent", 0x6000),
        ("__ZTV11OSMetaClass", 0x6100),
    ]);
    let mut vtables = VTableArena::new();
    vtables.push(VTable {
        name: "__ZTV6Parent".into(),
        entries: vec![
            VTableEntry::new("__ZN6Parent3fooEv", 0x5100),
            VTableEntry::new("__ZN6Parent27_RESERVEDParent0Ev", 0x5200),
        ],
    });
    vtables.push(VTable {
        name: cxx::OS_METACLASS_VTABLE.into(),
        entries: vec![VTableEntry::new("__ZN11OSMetaClass5allocEv", 0x5300)],
    });
    LinkedKext::new("com.example.parent", symbols, vtables)
}

/// A KEXT declaring `5Child : 6Parent` whose vtable slots import `slots`.
pub fn child_kext(slots: &[&str]) -> KextBuilder {
    let mut builder = KextBuilder::new();
    let vtable = builder.data_words(&vec![0u64; 2 + slots.len() + 1]);
    let meta = builder.data_words(&[0, 0, 0, 0]);
    let smcp = builder.data_words(&[0]);

    builder.external("__ZTV5Child", 2, vtable);
    builder.external("__ZTVN5Child9MetaClassE", 2, meta);
    builder.external("__ZN5Child10superClassE", 2, smcp);
    builder.undefined("__ZN6Parent10gMetaClassE");
    builder.undefined("__ZN11OSMetaClass5allocEv");
    for (slot, name) in slots.iter().enumerate() {
        builder.undefined(name);
        builder.external_reloc(
            vtable + 16 + slot as u64 * 8,
            name,
            macho::X86_64_RELOC_UNSIGNED,
            3,
            false,
        );
    }
    builder.external_reloc(meta + 16, "__ZN11OSMetaClass5allocEv", macho::X86_64_RELOC_UNSIGNED, 3, false);
    builder.external_reloc(smcp, "__ZN6Parent10gMetaClassE", macho::X86_64_RELOC_UNSIGNED, 3, false);
    builder
}
