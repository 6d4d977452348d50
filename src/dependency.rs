//! Dependency chains.
//!
//! A `DependencyChain` is the ordered view of everything one KEXT may link
//! against. It borrows each dependency's exported `LinkedKext` from the
//! orchestrator and is dropped once that KEXT is done; the dependencies
//! themselves are never modified.

use crate::symbol::{Symbol, SymbolTable};
use crate::vtable::{VTable, VTableArena};

/// Everything a linked KEXT exports to its dependents.
#[derive(Debug, Clone, Default)]
pub struct LinkedKext {
    pub identifier: String,
    pub symbols: SymbolTable,
    pub vtables: VTableArena,
}

impl LinkedKext {
    pub fn new(identifier: impl Into<String>, symbols: SymbolTable, vtables: VTableArena) -> Self {
        Self {
            identifier: identifier.into(),
            symbols,
            vtables,
        }
    }
}

/// One dependency as seen from the KEXT being linked.
#[derive(Debug, Clone, Copy)]
pub struct ChainLink<'a> {
    pub kext: &'a LinkedKext,
    /// Reached only through another dependency: only the C++ region is visible.
    pub indirect: bool,
}

/// Ordered, deduplicated dependencies of one KEXT.
#[derive(Debug, Clone, Default)]
pub struct DependencyChain<'a> {
    links: Vec<ChainLink<'a>>,
}

impl<'a> DependencyChain<'a> {
    pub fn new() -> Self {
        Self { links: Vec::new() }
    }

    /// Appends `kext` unless it is already part of the chain.
    ///
    /// A direct dependency that was first reached transitively becomes direct.
    pub fn push(&mut self, kext: &'a LinkedKext, indirect: bool) {
        if let Some(link) = self
            .links
            .iter_mut()
            .find(|link| std::ptr::eq(link.kext, kext))
        {
            link.indirect &= indirect;
            return;
        }
        self.links.push(ChainLink { kext, indirect });
    }

    pub fn links(&self) -> &[ChainLink<'a>] {
        &self.links
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// First visible symbol named `name`, in chain order.
    pub fn lookup(&self, name: &str) -> Option<&'a Symbol> {
        self.links
            .iter()
            .find_map(|link| link.kext.symbols.find(name, link.indirect))
    }

    /// Name of the first C++ symbol with exactly `value`.
    pub fn lookup_cxx_by_value(&self, value: u64) -> Option<&'a str> {
        self.links.iter().find_map(|link| {
            let table = &link.kext.symbols;
            table.find_cxx_by_value(value).and_then(|sym| table.name(sym))
        })
    }

    /// First exported vtable named `name`.
    pub fn find_vtable(&self, name: &str) -> Option<&'a VTable> {
        self.links
            .iter()
            .find_map(|link| link.kext.vtables.find(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kext(id: &str, entries: &[(&str, u64)]) -> LinkedKext {
        LinkedKext::new(
            id,
            SymbolTable::from_entries(entries.iter().copied()),
            VTableArena::new(),
        )
    }

    #[test]
    fn indirect_links_only_expose_cxx_symbols() {
        let direct = kext("com.example.direct", &[("_direct_fn", 0x100)]);
        let transitive = kext(
            "com.example.base",
            &[("_base_fn", 0x200), ("__ZN4Base3fooEv", 0x210)],
        );
        let mut chain = DependencyChain::new();
        chain.push(&direct, false);
        chain.push(&transitive, true);

        assert_eq!(chain.lookup("_direct_fn").map(|s| s.value), Some(0x100));
        assert!(chain.lookup("_base_fn").is_none());
        assert_eq!(chain.lookup("__ZN4Base3fooEv").map(|s| s.value), Some(0x210));
        assert_eq!(chain.lookup_cxx_by_value(0x210), Some("__ZN4Base3fooEv"));
    }

    #[test]
    fn first_match_wins_and_duplicates_merge() {
        let first = kext("a", &[("_shared", 1)]);
        let second = kext("b", &[("_shared", 2), ("_only_b", 3)]);
        let mut chain = DependencyChain::new();
        chain.push(&first, false);
        chain.push(&second, true);
        chain.push(&second, false);

        assert_eq!(chain.len(), 2);
        assert_eq!(chain.lookup("_shared").map(|s| s.value), Some(1));
        assert_eq!(chain.lookup("_only_b").map(|s| s.value), Some(3));
    }
}
