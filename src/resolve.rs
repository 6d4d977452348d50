//! Symbol resolution against a dependency chain.
//!
//! Undefined and indirect symbols of the KEXT being linked are looked up in
//! its chain and rewritten in place as absolute definitions. Weak imports
//! that no dependency provides are bound to the address of
//! `_gOSKextUnresolved`, so code can test them at run time.

use crate::dependency::DependencyChain;
use crate::error::{malformed, PrelinkError, Result};
use crate::macho::{self, cxx, MachoImage, LE};

pub struct SymbolResolver<'c, 'a> {
    chain: &'c DependencyChain<'a>,
    /// Value weak imports fall back to, computed on first use.
    weak_fallback: Option<u64>,
}

impl<'c, 'a> SymbolResolver<'c, 'a> {
    pub fn new(chain: &'c DependencyChain<'a>) -> Self {
        Self {
            chain,
            weak_fallback: None,
        }
    }

    /// Resolves symbol `index` in place.
    ///
    /// Debug symbols and symbols that are already defined are left alone.
    pub fn resolve<D: AsRef<[u8]> + AsMut<[u8]>>(
        &mut self,
        image: &mut MachoImage<D>,
        index: u32,
    ) -> Result<()> {
        let sym = image.symbol(index)?;
        if !macho::is_unresolved(sym) {
            return Ok(());
        }
        let name = image.symbol_name(index)?;
        let value = sym.n_value.get(LE);
        if macho::is_undefined(sym) && value != 0 {
            return Err(PrelinkError::CommonSymbol(name.to_string()));
        }
        let weak = macho::is_weak(sym);
        let target = if macho::is_indirect(sym) {
            let strx = u32::try_from(value)
                .map_err(|_| malformed(format!("indirect symbol {name} has a bad target")))?;
            image.string(strx)?
        } else {
            name
        };

        let resolved = match self.chain.lookup(target) {
            Some(found) => found.value,
            None if weak => self.weak_fallback(image, target)?,
            None => return Err(PrelinkError::SymbolNotFound(target.to_string())),
        };
        tracing::trace!("resolved symbol {} to {:#x}", index, resolved);
        macho::set_absolute(image.symbol_mut(index)?, resolved);
        Ok(())
    }

    fn weak_fallback<D: AsRef<[u8]>>(&mut self, image: &MachoImage<D>, wanted: &str) -> Result<u64> {
        if let Some(value) = self.weak_fallback {
            return Ok(value);
        }
        let index = image
            .find_undefined_symbol(cxx::WEAK_TEST_SYMBOL)?
            .ok_or_else(|| PrelinkError::SymbolNotFound(wanted.to_string()))?;
        let sym = image.symbol(index)?;
        let value = if macho::is_unresolved(sym) {
            self.chain
                .lookup(cxx::WEAK_TEST_SYMBOL)
                .map(|found| found.value)
                .ok_or_else(|| PrelinkError::SymbolNotFound(cxx::WEAK_TEST_SYMBOL.to_string()))?
        } else {
            sym.n_value.get(LE)
        };
        self.weak_fallback = Some(value);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::LinkedKext;
    use crate::symbol::SymbolTable;
    use crate::testing::KextBuilder;
    use crate::vtable::VTableArena;

    fn kernel() -> LinkedKext {
        LinkedKext::new(
            "com.example.kernel",
            SymbolTable::from_entries([
                ("_IOLog", 0xffff_ff80_0010_0000),
                ("_gOSKextUnresolved", 0xffff_ff80_0020_0000),
                ("__ZN8OSObject4freeEv", 0xffff_ff80_0030_0000),
            ]),
            VTableArena::new(),
        )
    }

    fn resolve_all(builder: &KextBuilder, chain: &DependencyChain<'_>) -> (Vec<u8>, Vec<Result<()>>) {
        let mut data = builder.build();
        let mut image = MachoImage::parse(&mut data[..]).unwrap();
        let mut resolver = SymbolResolver::new(chain);
        let results = (0..image.symbol_count().unwrap())
            .map(|index| resolver.resolve(&mut image, index))
            .collect();
        (data, results)
    }

    #[test]
    fn binds_undefined_symbols_as_absolute() {
        let kernel = kernel();
        let mut chain = DependencyChain::new();
        chain.push(&kernel, false);
        let mut builder = KextBuilder::new();
        builder.external("_start", 1, 0x800);
        builder.undefined("_IOLog");

        let (data, results) = resolve_all(&builder, &chain);
        assert!(results.iter().all(Result::is_ok));
        let image = MachoImage::parse(&data[..]).unwrap();
        let sym = image.symbol(1).unwrap();
        assert_eq!(sym.n_type, object::macho::N_ABS | object::macho::N_EXT);
        assert_eq!(sym.n_sect, 0);
        assert_eq!(sym.n_value.get(LE), 0xffff_ff80_0010_0000);
        assert_eq!(image.symbol(0).unwrap().n_value.get(LE), 0x800);
    }

    #[test]
    fn weak_imports_fall_back_to_the_unresolved_marker() {
        let kernel = kernel();
        let mut chain = DependencyChain::new();
        chain.push(&kernel, false);
        let mut builder = KextBuilder::new();
        builder.undefined("_gOSKextUnresolved");
        builder.weak_undefined("_optional_api");

        let (data, results) = resolve_all(&builder, &chain);
        assert!(results.iter().all(Result::is_ok));
        let image = MachoImage::parse(&data[..]).unwrap();
        assert_eq!(image.symbol(1).unwrap().n_value.get(LE), 0xffff_ff80_0020_0000);
    }

    #[test]
    fn weak_import_without_marker_fails() {
        let chain = DependencyChain::new();
        let mut builder = KextBuilder::new();
        builder.weak_undefined("_optional_api");

        let (_, results) = resolve_all(&builder, &chain);
        assert_eq!(
            results[0],
            Err(PrelinkError::SymbolNotFound("_optional_api".into()))
        );
    }

    #[test]
    fn indirect_symbols_follow_their_target() {
        let kernel = kernel();
        let mut chain = DependencyChain::new();
        chain.push(&kernel, false);
        let mut builder = KextBuilder::new();
        builder.indirect("_my_log", "_IOLog");

        let (data, results) = resolve_all(&builder, &chain);
        assert!(results[0].is_ok());
        let image = MachoImage::parse(&data[..]).unwrap();
        assert_eq!(image.symbol(0).unwrap().n_value.get(LE), 0xffff_ff80_0010_0000);
    }

    #[test]
    fn common_and_missing_symbols_are_errors() {
        let kernel = kernel();
        let mut chain = DependencyChain::new();
        chain.push(&kernel, true);
        let mut builder = KextBuilder::new();
        builder.common("_buffer", 64);
        builder.undefined("_IOLog");
        builder.undefined("__ZN8OSObject4freeEv");

        let (_, results) = resolve_all(&builder, &chain);
        assert_eq!(results[0], Err(PrelinkError::CommonSymbol("_buffer".into())));
        // Indirect dependencies only expose C++ symbols.
        assert_eq!(results[1], Err(PrelinkError::SymbolNotFound("_IOLog".into())));
        assert!(results[2].is_ok());
    }
}
