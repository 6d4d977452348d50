//! Virtual method tables.
//!
//! IOKit classes are linked by patching each class's vtable against its
//! already-patched superclass vtable. This module provides:
//! 1. `VTableArena`: the vtables of one binary, addressed by `VTableHandle`.
//! 2. `decide_override`: the slot override rules.
//! 3. `VTablePatcher`: builds and patches a class's vtable from raw image data.
//! 4. `patch_vtables`: the per-class state machine, repeated until every
//!    class whose superclass is known has been patched.

use std::collections::HashMap;

use crate::dependency::DependencyChain;
use crate::error::{malformed, PrelinkError, Result};
use crate::macho::{self, cxx, MachoImage, LE};

/// Number of header slots (offset-to-top and RTTI) before the first entry.
pub const VTABLE_HEADER_SLOTS: u64 = 2;
pub const VTABLE_ENTRY_SIZE: u64 = 8;
pub const VTABLE_HEADER_SIZE: u64 = VTABLE_HEADER_SLOTS * VTABLE_ENTRY_SIZE;

/// One resolved vtable slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VTableEntry {
    /// Implementation symbol; `None` when the implementation was inlined and
    /// no symbol carries its address.
    pub name: Option<String>,
    pub address: u64,
}

impl VTableEntry {
    pub fn new(name: impl Into<String>, address: u64) -> Self {
        Self {
            name: Some(name.into()),
            address,
        }
    }

    fn name_str(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VTable {
    pub name: String,
    pub entries: Vec<VTableEntry>,
}

/// Stable index of a vtable inside its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VTableHandle(usize);

/// The vtables produced for one binary.
#[derive(Debug, Clone, Default)]
pub struct VTableArena {
    vtables: Vec<VTable>,
}

impl VTableArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, vtable: VTable) -> VTableHandle {
        self.vtables.push(vtable);
        VTableHandle(self.vtables.len() - 1)
    }

    pub fn get(&self, handle: VTableHandle) -> Option<&VTable> {
        self.vtables.get(handle.0)
    }

    pub fn handle_of(&self, name: &str) -> Option<VTableHandle> {
        self.vtables
            .iter()
            .position(|vtable| vtable.name == name)
            .map(VTableHandle)
    }

    pub fn find(&self, name: &str) -> Option<&VTable> {
        self.handle_of(name).and_then(|handle| self.get(handle))
    }

    pub fn len(&self) -> usize {
        self.vtables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vtables.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VTable> {
        self.vtables.iter()
    }

    /// Rewrites entry addresses for names `address_of` knows about.
    pub fn rebase(&mut self, address_of: impl Fn(&str) -> Option<u64>) {
        for entry in self.vtables.iter_mut().flat_map(|vt| vt.entries.iter_mut()) {
            if let Some(address) = entry.name.as_deref().and_then(&address_of) {
                entry.address = address;
            }
        }
    }

    /// Reads the vtables of an image that has already been linked.
    ///
    /// Entries are read until the first null pointer; each is named after a
    /// C++ symbol of the image with that address, falling back to
    /// `name_of`. Unmatched entries stay anonymous.
    pub fn from_prelinked<D: AsRef<[u8]>>(
        image: &MachoImage<D>,
        name_of: impl Fn(u64) -> Option<String>,
    ) -> Result<Self> {
        let mut by_value: HashMap<u64, &str> = HashMap::new();
        let mut vtable_symbols = Vec::new();
        for index in 0..image.symbol_count()? {
            let sym = image.symbol(index)?;
            if !macho::is_defined(sym) {
                continue;
            }
            let name = image.symbol_name(index)?;
            if !cxx::is_cxx(name) {
                continue;
            }
            let value = sym.n_value.get(LE);
            by_value.entry(value).or_insert(name);
            if cxx::is_vtable(name) {
                vtable_symbols.push((name, value));
            }
        }

        let mut arena = Self::new();
        for (name, base) in vtable_symbols {
            let mut entries = Vec::new();
            let end = vtable_data_end(image, base);
            let mut address = base.wrapping_add(VTABLE_HEADER_SIZE);
            while address.checked_add(VTABLE_ENTRY_SIZE).map_or(false, |next| next <= end) {
                let Ok(value) = image.read_u64(address) else {
                    break;
                };
                if value == 0 {
                    break;
                }
                let entry_name = match by_value.get(&value) {
                    Some(name) => Some((*name).to_string()),
                    None => name_of(value),
                };
                entries.push(VTableEntry {
                    name: entry_name,
                    address: value,
                });
                address += VTABLE_ENTRY_SIZE;
            }
            tracing::trace!("prelinked vtable {} with {} entries", name, entries.len());
            arena.push(VTable {
                name: name.to_string(),
                entries,
            });
        }
        Ok(arena)
    }
}

/// End of the section holding vtable data at `base`, or of its segment.
fn vtable_data_end<D: AsRef<[u8]>>(image: &MachoImage<D>, base: u64) -> u64 {
    if let Some(section) = image.sections().find(|sect| sect.contains(base)) {
        return section.addr.wrapping_add(section.size);
    }
    image
        .segments()
        .iter()
        .find(|seg| seg.contains(base, 1))
        .map_or(base, |seg| seg.end())
}

/// The child symbol bound to a vtable slot.
#[derive(Debug, Clone, Copy)]
pub struct SlotSymbol<'n> {
    pub name: &'n str,
    pub value: u64,
    pub locally_defined: bool,
    pub unresolved: bool,
}

/// Outcome of the override rules for one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Override {
    /// The child's own symbol stands.
    Keep,
    /// The child inherits the parent slot's implementation.
    Inherit,
}

/// Applies the override rules to a child slot and the matching parent slot.
pub fn decide_override(
    vtable: &str,
    function_prefix: &str,
    child: &SlotSymbol<'_>,
    parent: &VTableEntry,
) -> Result<Override> {
    let Some(parent_name) = parent.name_str() else {
        return Ok(Override::Keep);
    };
    if child.locally_defined || cxx::is_pure_virtual(child.name) || child.name == parent_name {
        return Ok(Override::Keep);
    }
    if cxx::is_padslot(parent_name) {
        return Err(PrelinkError::PadSlotOverride {
            vtable: vtable.to_string(),
            symbol: child.name.to_string(),
        });
    }
    if child.unresolved && child.name.starts_with(function_prefix) {
        return Err(PrelinkError::UnimplementedVirtual {
            vtable: vtable.to_string(),
            symbol: child.name.to_string(),
        });
    }
    if parent.address & 1 != 0 && !cxx::is_pure_virtual(parent_name) {
        return Err(PrelinkError::MisalignedFunction {
            vtable: vtable.to_string(),
            symbol: parent_name.to_string(),
            value: parent.address,
        });
    }
    Ok(Override::Inherit)
}

/// Builds the vtables of one KEXT against its dependency chain.
pub struct VTablePatcher<'p, 'a, D> {
    image: &'p mut MachoImage<D>,
    chain: &'p DependencyChain<'a>,
    /// Symbol bound to each externally relocated address.
    slot_symbols: HashMap<u64, u32>,
}

impl<'p, 'a, D: AsRef<[u8]> + AsMut<[u8]>> VTablePatcher<'p, 'a, D> {
    pub fn new(image: &'p mut MachoImage<D>, chain: &'p DependencyChain<'a>) -> Result<Self> {
        let slot_symbols = image.external_relocation_targets()?;
        Ok(Self {
            image,
            chain,
            slot_symbols,
        })
    }

    /// Vtable named `name`, looked up in this binary's finished vtables first.
    fn lookup_vtable<'v>(&self, own: &'v VTableArena, name: &str) -> Option<&'v VTable>
    where
        'a: 'v,
    {
        own.find(name).or_else(|| self.chain.find_vtable(name))
    }

    fn name_for_value(&self, value: u64) -> Result<Option<String>> {
        if let Some(name) = self.image.find_cxx_symbol_by_value(value)? {
            return Ok(Some(name.to_string()));
        }
        Ok(self.chain.lookup_cxx_by_value(value).map(str::to_string))
    }

    fn check_in_range(&self, index: u32) -> Result<()> {
        if !self.image.is_locally_defined(index)? {
            return Ok(());
        }
        let value = self.image.symbol(index)?.n_value.get(LE);
        if self.image.is_address_mapped(value) {
            Ok(())
        } else {
            Err(PrelinkError::InvariantViolation(format!(
                "symbol {} = {value:#x} lies outside every segment",
                self.image.symbol_name(index)?
            )))
        }
    }

    /// Builds the vtable whose data starts at symbol `vtable_symbol`, patching
    /// unresolved slots against `parent`.
    pub fn build_vtable(&mut self, parent: &VTable, vtable_symbol: u32) -> Result<VTable> {
        let name = self.image.symbol_name(vtable_symbol)?.to_string();
        let base = self.image.symbol(vtable_symbol)?.n_value.get(LE);
        let function_prefix = cxx::class_from_vtable(&name)
            .and_then(cxx::function_prefix)
            .ok_or_else(|| malformed(format!("{name} is not a vtable symbol")))?;
        let end = vtable_data_end(self.image, base);

        let mut entries = Vec::new();
        for slot in 0u64.. {
            let address = base
                .checked_add(VTABLE_HEADER_SIZE + slot * VTABLE_ENTRY_SIZE)
                .ok_or_else(|| malformed(format!("{name} overflows the address space")))?;
            match address.checked_add(VTABLE_ENTRY_SIZE) {
                Some(slot_end) if slot_end <= end => {}
                _ => break,
            }
            let raw = self.image.read_u64(address)?;

            if raw != 0 {
                let entry_name = self.name_for_value(raw)?.ok_or_else(|| {
                    PrelinkError::SymbolNotFound(format!("{name} slot {slot} ({raw:#x})"))
                })?;
                entries.push(VTableEntry::new(entry_name, raw));
                continue;
            }

            let Some(&index) = self.slot_symbols.get(&address) else {
                break;
            };
            let child_name = self.image.symbol_name(index)?.to_string();
            let sym = self.image.symbol(index)?;
            let child = SlotSymbol {
                name: &child_name,
                value: sym.n_value.get(LE),
                locally_defined: self.image.is_locally_defined(index)?,
                unresolved: macho::is_unresolved(sym),
            };

            let entry = match parent.entries.get(slot as usize) {
                Some(parent_entry) => {
                    match decide_override(&name, &function_prefix, &child, parent_entry)? {
                        Override::Keep => {
                            self.check_in_range(index)?;
                            VTableEntry::new(child.name, child.value)
                        }
                        Override::Inherit => {
                            tracing::trace!(
                                "{}: slot {} {} inherits {:?}",
                                name,
                                slot,
                                child.name,
                                parent_entry.name
                            );
                            macho::set_absolute(self.image.symbol_mut(index)?, parent_entry.address);
                            parent_entry.clone()
                        }
                    }
                }
                None => VTableEntry::new(child.name, child.value),
            };
            entries.push(entry);
        }

        if entries.len() < parent.entries.len() {
            entries.extend_from_slice(&parent.entries[entries.len()..]);
        }
        Ok(VTable { name, entries })
    }

    /// Superclass metaclass pointer referenced by the SMCP at `address`.
    fn super_metaclass_name(&self, address: u64) -> Result<String> {
        if let Some(&index) = self.slot_symbols.get(&address) {
            return Ok(self.image.symbol_name(index)?.to_string());
        }
        // Superclass defined in this binary: the slot holds its address.
        let target = self.image.read_u64(address)?;
        for index in 0..self.image.symbol_count()? {
            let sym = self.image.symbol(index)?;
            if macho::is_defined(sym) && sym.n_value.get(LE) == target {
                let name = self.image.symbol_name(index)?;
                if cxx::class_from_metaclass_pointer(name).is_some() {
                    return Ok(name.to_string());
                }
            }
        }
        Err(malformed(format!(
            "no metaclass pointer referenced at {address:#x}"
        )))
    }

    fn defined_vtable(&self, name: &str) -> Result<u32> {
        self.image
            .find_defined_symbol(name)?
            .ok_or_else(|| PrelinkError::VTableNotFound(name.to_string()))
    }

    fn is_known_symbol(&self, name: &str) -> Result<bool> {
        Ok(self.chain.lookup(name).is_some() || self.image.find_defined_symbol(name)?.is_some())
    }

    /// Patches the class and metaclass vtables of the class owning `smcp`.
    ///
    /// Returns `false` when the superclass vtable is not available yet.
    fn patch_class(&mut self, own: &mut VTableArena, smcp: u32) -> Result<bool> {
        let smcp_name = self.image.symbol_name(smcp)?.to_string();
        let smcp_address = self.image.symbol(smcp)?.n_value.get(LE);
        let class = cxx::class_from_super_metaclass_pointer(&smcp_name)
            .ok_or_else(|| malformed(format!("bad super metaclass pointer {smcp_name}")))?
            .to_string();
        let vtable_name = cxx::vtable_name(&class)
            .ok_or_else(|| malformed(format!("class name {class} is too long")))?;
        let meta_vtable_name = cxx::metaclass_vtable_name(&class)
            .ok_or_else(|| malformed(format!("class name {class} is too long")))?;
        let vtable_symbol = self.defined_vtable(&vtable_name)?;
        let meta_vtable_symbol = self.defined_vtable(&meta_vtable_name)?;

        let super_pointer = self.super_metaclass_name(smcp_address)?;
        let superclass = cxx::class_from_metaclass_pointer(&super_pointer)
            .ok_or_else(|| malformed(format!("{super_pointer} is not a metaclass pointer")))?
            .to_string();
        let super_vtable_name = cxx::vtable_name(&superclass)
            .ok_or_else(|| malformed(format!("class name {superclass} is too long")))?;

        let Some(parent) = self.lookup_vtable(own, &super_vtable_name).cloned() else {
            tracing::trace!("{} waits for {}", vtable_name, super_vtable_name);
            return Ok(false);
        };

        let final_symbol = cxx::final_class_symbol(&superclass)
            .ok_or_else(|| malformed(format!("class name {superclass} is too long")))?;
        if self.is_known_symbol(&final_symbol)? {
            return Err(PrelinkError::FinalSuperclass { class, superclass });
        }

        let vtable = self.build_vtable(&parent, vtable_symbol)?;

        if self.chain.find_vtable(&meta_vtable_name).is_some() {
            return Err(PrelinkError::DuplicateClass(class));
        }
        let root = self
            .lookup_vtable(own, cxx::OS_METACLASS_VTABLE)
            .cloned()
            .ok_or_else(|| PrelinkError::VTableNotFound(cxx::OS_METACLASS_VTABLE.to_string()))?;
        let meta_vtable = self.build_vtable(&root, meta_vtable_symbol)?;

        tracing::debug!(
            "patched {} ({} entries) against {}",
            vtable.name,
            vtable.entries.len(),
            super_vtable_name
        );
        own.push(vtable);
        own.push(meta_vtable);
        Ok(true)
    }

    /// Runs the class state machine over every super metaclass pointer.
    pub fn patch_all(mut self) -> Result<VTableArena> {
        let mut pending = Vec::new();
        for index in 0..self.image.symbol_count()? {
            if self.image.is_locally_defined(index)?
                && cxx::is_super_metaclass_pointer(self.image.symbol_name(index)?)
            {
                pending.push(index);
            }
        }

        let mut own = VTableArena::new();
        while !pending.is_empty() {
            let before = pending.len();
            let mut waiting = Vec::with_capacity(before);
            for smcp in pending {
                if !self.patch_class(&mut own, smcp)? {
                    waiting.push(smcp);
                }
            }
            if waiting.len() == before {
                return Err(PrelinkError::VTablePatchStalled(before));
            }
            pending = waiting;
        }
        Ok(own)
    }
}

/// Patches every class vtable of `image` and returns the resulting arena.
pub fn patch_vtables<D: AsRef<[u8]> + AsMut<[u8]>>(
    image: &mut MachoImage<D>,
    chain: &DependencyChain<'_>,
) -> Result<VTableArena> {
    VTablePatcher::new(image, chain)?.patch_all()
}
