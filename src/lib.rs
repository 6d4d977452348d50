//! KEXT prelinking library.
//!
//! This library provides the core components for the `kxprelink` tool, which
//! links x86_64 kernel extensions ahead of time so they can be mapped without
//! a runtime kernel linker.
//! It is organized into several modules:
//! - `config`: CLI configuration.
//! - `macho`: Checked in-place access to Mach-O images.
//! - `layout`: Segment and section snapshots, load address allocation.
//! - `symbol`, `dependency`: Exported symbols and dependency chains.
//! - `resolve`: Undefined and indirect symbol resolution.
//! - `vtable`: C++ vtable construction and patching.
//! - `arch`, `reloc`: Relocation processing.
//! - `linkedit`: `__LINKEDIT` rebuild and segment adjustment.
//! - `kext`: The single-KEXT prelinking pipeline.
//! - `plist`, `manifest`: Bundle manifests.
//! - `prelinked`: Reading an existing prelinked kernel.
//! - `linker`: Dependency-ordered prelinking of many KEXTs.

pub mod arch;
pub mod config;
pub mod dependency;
pub mod error;
pub mod kext;
pub mod layout;
pub mod linkedit;
pub mod linker;
pub mod macho;
pub mod manifest;
pub mod plist;
pub mod prelinked;
pub mod reloc;
pub mod resolve;
pub mod symbol;
pub mod utils;
pub mod vtable;

#[cfg(test)]
pub(crate) mod testing;
