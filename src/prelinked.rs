//! Prelinked kernels.
//!
//! A prelinked kernel carries the KEXTs it was built with in `__PRELINK_TEXT`
//! and describes them in the XML property list stored in
//! `__PRELINK_INFO,__info`. Reading it yields the kernel's own exports, one
//! [`PrelinkedKext`] per described bundle, and the first free load address
//! past the prelinked images.

use crate::dependency::{DependencyChain, LinkedKext};
use crate::error::{malformed, Result};
use crate::kext;
use crate::layout::PAGE_SIZE;
use crate::macho::MachoImage;
use crate::manifest::KextManifest;
use crate::plist::{self, PlistValue};
use crate::utils::align_up;

pub const PRELINK_TEXT_SEGMENT: &str = "__PRELINK_TEXT";
pub const PRELINK_INFO_SEGMENT: &str = "__PRELINK_INFO";
pub const PRELINK_INFO_SECTION: &str = "__info";

pub const INFO_DICTIONARY_KEY: &str = "_PrelinkInfoDictionary";
pub const EXECUTABLE_LOAD_ADDR_KEY: &str = "_PrelinkExecutableLoadAddr";
pub const EXECUTABLE_SOURCE_ADDR_KEY: &str = "_PrelinkExecutableSourceAddr";
pub const EXECUTABLE_SIZE_KEY: &str = "_PrelinkExecutableSize";

/// Identifier the kernel's own exports are registered under.
pub const KERNEL_IDENTIFIER: &str = "__kernel__";

/// Where a prelinked bundle's exports come from.
#[derive(Debug, Clone)]
pub enum PrelinkedExports {
    /// Codeless bundles, such as the `com.apple.kpi.*` pseudo-KEXTs, stand
    /// for the kernel itself.
    Kernel,
    Kext(LinkedKext),
}

#[derive(Debug, Clone)]
pub struct PrelinkedKext {
    pub manifest: KextManifest,
    pub load_address: Option<u64>,
    pub exports: PrelinkedExports,
}

#[derive(Debug, Clone)]
pub struct PrelinkedKernel {
    pub kernel: LinkedKext,
    pub kexts: Vec<PrelinkedKext>,
    /// Highest page-aligned `_PrelinkExecutableLoadAddr + _PrelinkExecutableSize`
    /// over all entries, and at least the start of `__PRELINK_TEXT`.
    pub next_load_address: u64,
}

fn integer(entry: &PlistValue, key: &str) -> Option<u64> {
    entry.get(key).and_then(PlistValue::as_integer)
}

/// Text of `__PRELINK_INFO,__info`, without its trailing NULs.
fn prelink_info_text<'b>(image: &'b MachoImage<&[u8]>) -> Result<&'b str> {
    let section = image
        .section_by_name(PRELINK_INFO_SEGMENT, PRELINK_INFO_SECTION)
        .ok_or_else(|| malformed("missing __PRELINK_INFO,__info"))?;
    let start = section.offset as usize;
    let end = usize::try_from(section.size)
        .ok()
        .and_then(|size| start.checked_add(size))
        .filter(|&end| end <= image.bytes().len())
        .ok_or_else(|| malformed("__PRELINK_INFO,__info exceeds the image"))?;
    let raw = &image.bytes()[start..end];
    let used = raw.iter().rposition(|&b| b != 0).map_or(0, |last| last + 1);
    std::str::from_utf8(&raw[..used]).map_err(|_| malformed("prelink info is not UTF-8"))
}

impl PrelinkedKernel {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let image = MachoImage::parse(bytes)?;
        let kernel = kext::export_linked(KERNEL_IDENTIFIER, &image, &DependencyChain::new())?;
        tracing::debug!(
            "kernel exports {} symbols and {} vtables",
            kernel.symbols.len(),
            kernel.vtables.len()
        );

        let root = plist::parse(prelink_info_text(&image)?)?;
        let entries = root
            .get(INFO_DICTIONARY_KEY)
            .and_then(PlistValue::as_array)
            .ok_or_else(|| malformed(format!("prelink info has no {INFO_DICTIONARY_KEY} array")))?;
        let text = image.segment(PRELINK_TEXT_SEGMENT);

        let mut kexts = Vec::new();
        let mut next_load_address = text.map_or(0, |seg| seg.vmaddr);
        for entry in entries {
            let manifest = match KextManifest::from_plist(entry) {
                Ok(manifest) => manifest,
                Err(err) => {
                    tracing::warn!("skipping prelinked bundle: {}", err);
                    continue;
                }
            };
            let load_address = integer(entry, EXECUTABLE_LOAD_ADDR_KEY);
            if let (Some(load), Some(size)) = (load_address, integer(entry, EXECUTABLE_SIZE_KEY)) {
                next_load_address = next_load_address.max(align_up(load.saturating_add(size), PAGE_SIZE));
            }

            let source = integer(entry, EXECUTABLE_SOURCE_ADDR_KEY);
            let exports = match (&manifest.executable, source) {
                (Some(_), Some(source)) => {
                    match Self::export_kext(&image, entry, &manifest, source, &kernel) {
                        Ok(linked) => PrelinkedExports::Kext(linked),
                        Err(err) => {
                            tracing::warn!("skipping prelinked {}: {}", manifest.identifier, err);
                            continue;
                        }
                    }
                }
                _ => PrelinkedExports::Kernel,
            };
            tracing::trace!("prelinked bundle {} {}", manifest.identifier, manifest.version);
            kexts.push(PrelinkedKext {
                manifest,
                load_address,
                exports,
            });
        }

        Ok(Self {
            kernel,
            kexts,
            next_load_address,
        })
    }

    /// Exports the image of a prelinked KEXT found at `source` in `__PRELINK_TEXT`.
    fn export_kext(
        kernel_image: &MachoImage<&[u8]>,
        entry: &PlistValue,
        manifest: &KextManifest,
        source: u64,
        kernel: &LinkedKext,
    ) -> Result<LinkedKext> {
        let text = kernel_image
            .segment(PRELINK_TEXT_SEGMENT)
            .ok_or_else(|| malformed("missing __PRELINK_TEXT"))?;
        let size = integer(entry, EXECUTABLE_SIZE_KEY)
            .ok_or_else(|| malformed(format!("{} has no {EXECUTABLE_SIZE_KEY}", manifest.identifier)))?;
        let offset = text
            .file_offset(source, size)
            .and_then(|offset| usize::try_from(offset).ok())
            .ok_or_else(|| malformed(format!("{} lies outside __PRELINK_TEXT", manifest.identifier)))?;
        let end = offset
            .checked_add(size as usize)
            .filter(|&end| end <= kernel_image.bytes().len())
            .ok_or_else(|| malformed(format!("{} exceeds the kernel image", manifest.identifier)))?;

        let image = MachoImage::parse(&kernel_image.bytes()[offset..end])?;
        let mut chain = DependencyChain::new();
        chain.push(kernel, false);
        kext::export_linked(&manifest.identifier, &image, &chain)
    }
}
