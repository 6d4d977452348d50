//! Single-KEXT prelinking.
//!
//! `prelink_kext` links one KEXT image at a load address against its
//! dependency chain. The stages are:
//! 1. Resolve indirect symbols, then the undefined region.
//! 2. Patch the class vtables, which may bind further symbols.
//! 3. Fail if anything is still unresolved.
//! 4. Relocate local and external symbols and rebase the vtables.
//! 5. Fill non-lazy symbol pointers and apply all relocations.
//! 6. Strip stale load commands, rebuild `__LINKEDIT`, move segments.
//! 7. Fill `kmod_info`.
//!
//! The image is linked on a scratch copy that only replaces the caller's
//! buffer when every stage succeeded.

use std::collections::HashMap;

use object::macho::MH_DYLDLINK;

use crate::arch::Architecture;
use crate::dependency::{DependencyChain, LinkedKext};
use crate::error::{PrelinkError, Result};
use crate::linkedit;
use crate::macho::{self, MachoImage, LE};
use crate::reloc::Relocator;
use crate::resolve::SymbolResolver;
use crate::symbol::SymbolTable;
use crate::vtable::{self, VTableArena};

/// Exports the symbols and vtables of an image that is already linked.
pub fn export_linked<D: AsRef<[u8]>>(
    identifier: &str,
    image: &MachoImage<D>,
    chain: &DependencyChain<'_>,
) -> Result<LinkedKext> {
    let symbols = SymbolTable::from_image(image, 0..image.symbol_count()?)?;
    let vtables = VTableArena::from_prelinked(image, |value| {
        symbols
            .find_cxx_by_value(value)
            .and_then(|sym| symbols.name(sym))
            .or_else(|| chain.lookup_cxx_by_value(value))
            .map(str::to_string)
    })?;
    Ok(LinkedKext::new(identifier, symbols, vtables))
}

/// Links `bytes` in place at `load_address`.
///
/// On failure `bytes` is left untouched.
pub fn prelink_kext<A: Architecture>(
    arch: &A,
    identifier: &str,
    bytes: &mut [u8],
    load_address: u64,
    chain: &DependencyChain<'_>,
) -> Result<LinkedKext> {
    let mut scratch = bytes.to_vec();
    let linked = link_image(arch, identifier, &mut scratch, load_address, chain)?;
    bytes.copy_from_slice(&scratch);
    Ok(linked)
}

fn unresolved_names<D: AsRef<[u8]>>(image: &MachoImage<D>) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for index in 0..image.symbol_count()? {
        if macho::is_unresolved(image.symbol(index)?) {
            names.push(image.symbol_name(index)?.to_string());
        }
    }
    Ok(names)
}

fn defined_values<D: AsRef<[u8]>>(image: &MachoImage<D>) -> Result<HashMap<String, u64>> {
    let mut values = HashMap::new();
    for index in 0..image.undefined_range()?.start {
        let sym = image.symbol(index)?;
        if macho::is_defined(sym) {
            values
                .entry(image.symbol_name(index)?.to_string())
                .or_insert(sym.n_value.get(LE));
        }
    }
    Ok(values)
}

fn link_image<A: Architecture>(
    arch: &A,
    identifier: &str,
    bytes: &mut [u8],
    load_address: u64,
    chain: &DependencyChain<'_>,
) -> Result<LinkedKext> {
    let mut image = MachoImage::parse(bytes)?;
    let cputype = image.header()?.cputype.get(LE);
    if cputype != arch.cpu_type() {
        return Err(PrelinkError::Unsupported(format!(
            "{identifier}: cpu type {cputype:#x} does not match the target"
        )));
    }
    if image.flags()? & MH_DYLDLINK == 0 {
        tracing::debug!("{} is already linked", identifier);
        return export_linked(identifier, &image, chain);
    }
    linkedit::check_capacity(&image)?;

    let mut resolver = SymbolResolver::new(chain);
    let indirect: Vec<u32> = (0..image.symbol_count()?)
        .filter(|&index| image.symbol(index).map_or(false, macho::is_indirect))
        .collect();
    for index in indirect.into_iter().chain(image.undefined_range()?) {
        match resolver.resolve(&mut image, index) {
            Ok(()) => {}
            // Vtable patching may still bind it.
            Err(PrelinkError::SymbolNotFound(name)) => {
                tracing::trace!("{}: {} not found in dependencies", identifier, name);
            }
            Err(err) => return Err(err),
        }
    }

    let mut vtables = vtable::patch_vtables(&mut image, chain)?;
    let unresolved = unresolved_names(&image)?;
    if !unresolved.is_empty() {
        return Err(PrelinkError::UnresolvedSymbols(unresolved));
    }

    let kmod_info = linkedit::kmod_info_offset(&image)?;
    let locals = image.local_range()?;
    linkedit::relocate_symbols(&mut image, locals, load_address)?;
    let externals = image.external_defined_range()?;
    linkedit::relocate_symbols(&mut image, externals.clone(), load_address)?;
    let values = defined_values(&image)?;
    vtables.rebase(|name| values.get(name).copied());
    let symbols = SymbolTable::from_image(&image, externals)?;

    linkedit::process_symbol_pointers(&mut image, load_address)?;
    let local_relocations = image.local_relocations()?;
    let external_relocations = image.external_relocations()?;
    let mut relocator = Relocator::new(arch, &mut image, chain, &vtables, load_address);
    let mut preserved = relocator.relocate_and_copy(&local_relocations)?;
    preserved.extend(relocator.relocate_and_copy(&external_relocations)?);

    let stripped = image.strip_load_commands()?;
    linkedit::rebuild(&mut image, &preserved)?;
    linkedit::adjust_segments(&mut image, load_address)?;
    if let Some(offset) = kmod_info {
        linkedit::write_kmod_info(&mut image, offset, load_address)?;
    }

    tracing::info!(
        "linked {} at {:#x}: {} exports, {} vtables, {} relocations kept, {} load commands stripped",
        identifier,
        load_address,
        symbols.len(),
        vtables.len(),
        preserved.len(),
        stripped
    );
    Ok(LinkedKext::new(identifier, symbols, vtables))
}
