//! Symbol table management.
//!
//! A `SymbolTable` is what a linked KEXT exports to its dependents: resolved
//! `(name, value)` pairs with the C++ symbols gathered at the top of the table
//! so vtable lookups only scan that region.

use std::ops::Range;

use crate::error::{malformed, Result};
use crate::macho::{self, cxx, MachoImage, LE};
use crate::utils::c_str_at;

/// A resolved symbol exported by a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Symbol {
    /// Offset of the name in the owning table's string table.
    pub name_offset: u32,
    pub value: u64,
}

/// Exported symbols of one linked KEXT.
///
/// Indices `[0, n - c)` hold ordinary symbols in their original order;
/// `[n - c, n)` hold the `c` C++ symbols. Neither the count nor the boundary
/// changes after construction.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    cxx_start: usize,
    strings: Vec<u8>,
}

impl SymbolTable {
    /// Splits `entries` into the ordinary and C++ regions.
    ///
    /// Ordinary symbols fill the table from the bottom, C++ symbols from the top.
    fn fill(entries: Vec<(Symbol, bool)>, strings: Vec<u8>) -> Self {
        let total = entries.len();
        let mut symbols = vec![Symbol::default(); total];
        let mut ordinary = 0;
        let mut top = total;
        for (symbol, is_cxx) in entries {
            if is_cxx {
                top -= 1;
                symbols[top] = symbol;
            } else {
                symbols[ordinary] = symbol;
                ordinary += 1;
            }
        }
        Self {
            symbols,
            cxx_start: ordinary,
            strings,
        }
    }

    /// Builds a table from names and values, interning the names.
    pub fn from_entries<'n>(entries: impl IntoIterator<Item = (&'n str, u64)>) -> Self {
        let mut strings = vec![0u8];
        let mut split = Vec::new();
        for (name, value) in entries {
            let name_offset = strings.len() as u32;
            strings.extend_from_slice(name.as_bytes());
            strings.push(0);
            split.push((Symbol { name_offset, value }, cxx::is_cxx(name)));
        }
        Self::fill(split, strings)
    }

    /// Exports the external, defined, non-debug symbols in `range` of `image`.
    pub fn from_image<D: AsRef<[u8]>>(image: &MachoImage<D>, range: Range<u32>) -> Result<Self> {
        let strings = image.string_table()?.to_vec();
        let mut split = Vec::new();
        for index in range {
            let sym = image.symbol(index)?;
            if !macho::is_defined(sym) || !macho::is_external(sym) {
                continue;
            }
            let name_offset = sym.n_strx.get(LE);
            let name = c_str_at(&strings, name_offset as usize)
                .ok_or_else(|| malformed(format!("bad name for symbol {index}")))?;
            split.push((
                Symbol {
                    name_offset,
                    value: sym.n_value.get(LE),
                },
                cxx::is_cxx(name),
            ));
        }
        Ok(Self::fill(split, strings))
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn cxx_len(&self) -> usize {
        self.symbols.len() - self.cxx_start
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn ordinary(&self) -> &[Symbol] {
        &self.symbols[..self.cxx_start]
    }

    pub fn cxx(&self) -> &[Symbol] {
        &self.symbols[self.cxx_start..]
    }

    pub fn name(&self, symbol: &Symbol) -> Option<&str> {
        c_str_at(&self.strings, symbol.name_offset as usize)
    }

    /// Looks `name` up in the whole table, or only in the C++ region.
    pub fn find(&self, name: &str, cxx_only: bool) -> Option<&Symbol> {
        let region = if cxx_only { self.cxx() } else { self.symbols() };
        region.iter().find(|sym| self.name(sym) == Some(name))
    }

    /// C++ symbol whose value is exactly `value`.
    pub fn find_cxx_by_value(&self, value: u64) -> Option<&Symbol> {
        self.cxx().iter().find(|sym| sym.value == value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.symbols
            .iter()
            .map(move |sym| (self.name(sym).unwrap_or(""), sym.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::KextBuilder;

    #[test]
    fn cxx_symbols_occupy_the_top_region() {
        let entries = [
            ("_IOLog", 0x10),
            ("__ZN8OSObject4freeEv", 0x20),
            ("_bzero", 0x30),
            ("__ZTV8OSObject", 0x40),
            ("__ZN8OSObject10gMetaClassE", 0x50),
        ];
        let table = SymbolTable::from_entries(entries);

        assert_eq!(table.len(), 5);
        assert_eq!(table.cxx_len(), 3);
        for sym in &table.symbols()[2..] {
            assert!(cxx::is_cxx(table.name(sym).unwrap()));
        }
        let ordinary: Vec<_> = table.ordinary().iter().map(|s| table.name(s).unwrap()).collect();
        assert_eq!(ordinary, ["_IOLog", "_bzero"]);

        for (name, value) in entries {
            assert_eq!(table.find(name, false).map(|s| s.value), Some(value));
        }
        assert!(table.find("_IOLog", true).is_none());
        assert_eq!(table.find("__ZTV8OSObject", true).map(|s| s.value), Some(0x40));
        assert_eq!(
            table.find_cxx_by_value(0x20).and_then(|s| table.name(s)),
            Some("__ZN8OSObject4freeEv")
        );
        assert!(table.find_cxx_by_value(0x10).is_none());
    }

    #[test]
    fn exports_only_external_definitions() {
        let mut builder = KextBuilder::new();
        builder.local("_private", 1, 0x800);
        builder.external("_public", 1, 0x804);
        builder.external("__ZN3Foo3barEv", 1, 0x808);
        builder.undefined("_imported");
        let data = builder.build();
        let image = MachoImage::parse(&data[..]).unwrap();

        let table = SymbolTable::from_image(&image, 0..image.symbol_count().unwrap()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.cxx_len(), 1);
        assert_eq!(table.find("_public", false).map(|s| s.value), Some(0x804));
        assert!(table.find("_private", false).is_none());
        assert!(table.find("_imported", false).is_none());
    }
}
