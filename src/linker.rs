//! Core Linker logic.
//!
//! This module contains the `Linker` struct which prelinks a batch of KEXTs:
//! 1. Registration: already-prelinked bundles (from a prelinked kernel or
//!    supplied directly) and requests, each with its parsed manifest.
//! 2. Dependency resolution: every declared library is matched against the
//!    registered bundles by identifier and compatible version range.
//! 3. Linking: requests are linked in passes, each once all of its
//!    dependencies are linked, at addresses handed out by the allocator.
//! 4. Failure propagation: a failed request fails everything depending on
//!    it; requests that never become ready are part of a cycle.

use crate::arch::Architecture;
use crate::dependency::{DependencyChain, LinkedKext};
use crate::error::{PrelinkError, Result};
use crate::kext;
use crate::layout::LoadAddressAllocator;
use crate::macho::MachoImage;
use crate::manifest::{KextManifest, KextVersion};
use crate::prelinked::{PrelinkedExports, PrelinkedKernel};

/// Result of prelinking one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KextOutcome {
    Linked { load_address: u64 },
    Failed(PrelinkError),
}

/// A KEXT to prelink: its manifest and its executable image.
///
/// `image` is rewritten in place when, and only when, linking succeeds.
#[derive(Debug, Clone)]
pub struct KextRequest {
    pub manifest: KextManifest,
    pub image: Vec<u8>,
    pub outcome: Option<KextOutcome>,
}

impl KextRequest {
    pub fn new(manifest: KextManifest, image: Vec<u8>) -> Self {
        Self {
            manifest,
            image,
            outcome: None,
        }
    }

    /// Builds a request from the text of an `Info.plist`.
    pub fn from_info_plist(text: &str, image: Vec<u8>) -> Result<Self> {
        Ok(Self::new(KextManifest::parse(text)?, image))
    }
}

#[derive(Debug, Clone, Copy)]
enum Origin {
    Prelinked,
    Request(usize),
}

/// A registered bundle, prelinked or requested.
#[derive(Debug)]
struct Bundle {
    manifest: KextManifest,
    origin: Origin,
    /// Index into `Linker::exports` once linked.
    exports: Option<usize>,
    /// Direct dependencies, as bundle indices in declaration order.
    dependencies: Vec<usize>,
    failed: bool,
}

pub struct Linker<A: Architecture> {
    arch: A,
    exports: Vec<LinkedKext>,
    bundles: Vec<Bundle>,
    requests: Vec<KextRequest>,
    allocator: LoadAddressAllocator,
}

impl<A: Architecture> Linker<A> {
    /// Creates a linker placing KEXTs at or above `base_address`.
    pub fn new(arch: A, base_address: u64) -> Self {
        Self {
            arch,
            exports: Vec::new(),
            bundles: Vec::new(),
            requests: Vec::new(),
            allocator: LoadAddressAllocator::new(base_address),
        }
    }

    fn push_prelinked(&mut self, manifest: KextManifest, exports: usize) {
        self.bundles.push(Bundle {
            manifest,
            origin: Origin::Prelinked,
            exports: Some(exports),
            dependencies: Vec::new(),
            failed: false,
        });
    }

    /// Registers an already linked bundle that requests may depend on.
    pub fn add_prelinked(&mut self, manifest: KextManifest, linked: LinkedKext) {
        self.exports.push(linked);
        self.push_prelinked(manifest, self.exports.len() - 1);
    }

    /// Registers the kernel and every bundle it was prelinked with, and
    /// moves the allocator past their images.
    pub fn add_prelinked_kernel(&mut self, kernel: PrelinkedKernel) {
        self.exports.push(kernel.kernel);
        let kernel_exports = self.exports.len() - 1;
        for kext in kernel.kexts {
            match kext.exports {
                PrelinkedExports::Kernel => self.push_prelinked(kext.manifest, kernel_exports),
                PrelinkedExports::Kext(linked) => self.add_prelinked(kext.manifest, linked),
            }
        }
        self.allocator.reserve_through(kernel.next_load_address);
    }

    /// Queues `request`, returning its index in [`Linker::requests`].
    pub fn add_request(&mut self, request: KextRequest) -> usize {
        let index = self.requests.len();
        self.bundles.push(Bundle {
            manifest: request.manifest.clone(),
            origin: Origin::Request(index),
            exports: None,
            dependencies: Vec::new(),
            failed: false,
        });
        self.requests.push(request);
        index
    }

    pub fn requests(&self) -> &[KextRequest] {
        &self.requests
    }

    pub fn into_requests(self) -> Vec<KextRequest> {
        self.requests
    }

    /// Exports of the linked or prelinked bundle `identifier`.
    pub fn linked(&self, identifier: &str) -> Option<&LinkedKext> {
        self.bundles
            .iter()
            .find(|bundle| bundle.manifest.identifier == identifier && !bundle.failed)
            .and_then(|bundle| bundle.exports)
            .map(|index| &self.exports[index])
    }

    /// The bundle providing library `name` at `requested`.
    fn find_provider(&self, name: &str, requested: &KextVersion) -> Result<usize> {
        let mut found = false;
        let mut failed = false;
        for (index, bundle) in self.bundles.iter().enumerate() {
            if bundle.manifest.identifier != name {
                continue;
            }
            found = true;
            if !bundle.manifest.satisfies(requested) {
                continue;
            }
            if bundle.failed {
                failed = true;
                continue;
            }
            return Ok(index);
        }
        Err(if failed {
            PrelinkError::DependencyFailed(name.to_string())
        } else if found {
            PrelinkError::VersionMismatch {
                name: name.to_string(),
                requested: requested.to_string(),
            }
        } else {
            PrelinkError::DependencyMissing(name.to_string())
        })
    }

    fn resolve_dependencies(&mut self, index: usize) -> Result<()> {
        let strict = matches!(self.bundles[index].origin, Origin::Request(_));
        let mut dependencies = Vec::new();
        for (name, requested) in &self.bundles[index].manifest.libraries {
            match self.find_provider(name, requested) {
                Ok(provider) => dependencies.push(provider),
                Err(err) if strict => return Err(err),
                // Prelinked bundles were validated by whoever linked them.
                Err(err) => tracing::trace!("{}: {}", self.bundles[index].manifest.identifier, err),
            }
        }
        self.bundles[index].dependencies = dependencies;
        Ok(())
    }

    fn is_pending(&self, index: usize) -> bool {
        let bundle = &self.bundles[index];
        matches!(bundle.origin, Origin::Request(_)) && !bundle.failed && bundle.exports.is_none()
    }

    fn dependencies_ready(&self, index: usize) -> bool {
        self.bundles[index]
            .dependencies
            .iter()
            .all(|&dep| self.bundles[dep].exports.is_some())
    }

    /// Marks `index` failed and cascades to every pending dependent.
    fn fail(&mut self, index: usize, err: PrelinkError) {
        let bundle = &mut self.bundles[index];
        if bundle.failed {
            return;
        }
        bundle.failed = true;
        tracing::warn!("failed to prelink {}: {}", bundle.manifest.identifier, err);
        let identifier = bundle.manifest.identifier.clone();
        if let Origin::Request(request) = bundle.origin {
            self.requests[request].outcome = Some(KextOutcome::Failed(err));
        }

        for dependent in 0..self.bundles.len() {
            if self.is_pending(dependent) && self.bundles[dependent].dependencies.contains(&index) {
                self.fail(dependent, PrelinkError::DependencyFailed(identifier.clone()));
            }
        }
    }

    /// Exports visible to `index`: direct dependencies first, then
    /// everything reachable through them, depth first.
    fn chain_exports(&self, index: usize) -> Vec<(usize, bool)> {
        fn visit<A: Architecture>(
            linker: &Linker<A>,
            bundle: usize,
            seen: &mut Vec<usize>,
            out: &mut Vec<(usize, bool)>,
        ) {
            for &dep in &linker.bundles[bundle].dependencies {
                if seen.contains(&dep) {
                    continue;
                }
                seen.push(dep);
                if let Some(exports) = linker.bundles[dep].exports {
                    out.push((exports, true));
                }
                visit(linker, dep, seen, out);
            }
        }

        let direct = &self.bundles[index].dependencies;
        let mut out: Vec<(usize, bool)> = direct
            .iter()
            .filter_map(|&dep| self.bundles[dep].exports)
            .map(|exports| (exports, false))
            .collect();
        let mut seen = direct.clone();
        seen.push(index);
        for &dep in direct {
            visit(self, dep, &mut seen, &mut out);
        }
        out
    }

    fn link(&mut self, index: usize) {
        let Origin::Request(request_index) = self.bundles[index].origin else {
            return;
        };
        let links = self.chain_exports(index);
        let load_address = self.allocator.next_address();
        let identifier = self.bundles[index].manifest.identifier.clone();

        let result = {
            let mut chain = DependencyChain::new();
            for &(exports, indirect) in &links {
                chain.push(&self.exports[exports], indirect);
            }
            let image = &mut self.requests[request_index].image;
            kext::prelink_kext(&self.arch, &identifier, image, load_address, &chain).and_then(|linked| {
                let size = MachoImage::parse(&image[..])?.vm_size();
                Ok((linked, size))
            })
        };

        match result {
            Ok((linked, size)) => {
                self.allocator.allocate(size);
                self.exports.push(linked);
                self.bundles[index].exports = Some(self.exports.len() - 1);
                self.requests[request_index].outcome = Some(KextOutcome::Linked { load_address });
                tracing::info!("prelinked {} at {:#x}", identifier, load_address);
            }
            Err(err) => self.fail(index, err),
        }
    }

    /// Links every queued request whose dependencies can be satisfied.
    ///
    /// Each request ends with an outcome; failures never stop the batch.
    pub fn prelink_all(&mut self) {
        for index in 0..self.bundles.len() {
            if let Err(err) = self.resolve_dependencies(index) {
                self.fail(index, err);
            }
        }

        loop {
            let mut progress = false;
            for index in 0..self.bundles.len() {
                if self.is_pending(index) && self.dependencies_ready(index) {
                    self.link(index);
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }

        for index in 0..self.bundles.len() {
            if self.is_pending(index) {
                let identifier = self.bundles[index].manifest.identifier.clone();
                self.fail(index, PrelinkError::DependencyCycle(identifier));
            }
        }
    }
}
