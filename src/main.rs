//! Entry point for the kxprelink tool.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap` and set up logging.
//! 2. Load the prelinked kernel, if any, and register its KEXTs.
//! 3. Load every KEXT bundle's manifest and executable.
//! 4. Prelink the batch with the `X86_64` backend and write each result.
//!
//! Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use memmap2::Mmap;
use std::fs::{self, File};
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use kxprelink::arch::x86_64::X86_64;
use kxprelink::config::{Config, DEFAULT_BASE_ADDRESS};
use kxprelink::linker::{KextOutcome, KextRequest, Linker};
use kxprelink::prelinked::PrelinkedKernel;

fn map_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mmap = unsafe { Mmap::map(&file) }.with_context(|| format!("failed to map {}", path.display()))?;
    Ok(mmap)
}

/// Reads `Contents/Info.plist` and the executable it names.
fn load_bundle(bundle: &Path) -> Result<KextRequest> {
    let plist_path = bundle.join("Contents").join("Info.plist");
    let text = fs::read_to_string(&plist_path)
        .with_context(|| format!("failed to read {}", plist_path.display()))?;
    let request = KextRequest::from_info_plist(&text, Vec::new())
        .with_context(|| format!("failed to parse {}", plist_path.display()))?;
    let executable = request
        .manifest
        .executable
        .as_deref()
        .with_context(|| format!("{} has no CFBundleExecutable", bundle.display()))?;
    let executable_path = bundle.join("Contents").join("MacOS").join(executable);
    let image = map_file(&executable_path)?.to_vec();
    Ok(KextRequest { image, ..request })
}

fn main() -> Result<ExitCode> {
    let config = Config::parse();
    let filter = EnvFilter::try_new(&config.log_level)
        .with_context(|| format!("invalid log level {:?}", config.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut linker = Linker::new(X86_64, config.base_address.unwrap_or(DEFAULT_BASE_ADDRESS));

    if let Some(path) = &config.kernel {
        let mmap = map_file(path)?;
        let kernel = PrelinkedKernel::parse(&mmap)
            .with_context(|| format!("failed to read prelinked kernel {}", path.display()))?;
        tracing::info!(
            "{} prelinked bundles, next load address {:#x}",
            kernel.kexts.len(),
            kernel.next_load_address
        );
        linker.add_prelinked_kernel(kernel);
    }

    for bundle in &config.bundles {
        linker.add_request(load_bundle(bundle)?);
    }

    linker.prelink_all();

    fs::create_dir_all(&config.output)
        .with_context(|| format!("failed to create {}", config.output.display()))?;
    let mut failures = 0;
    for request in linker.requests() {
        let identifier = &request.manifest.identifier;
        match &request.outcome {
            Some(KextOutcome::Linked { load_address }) => {
                let path = config.output.join(identifier);
                fs::write(&path, &request.image)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                println!("Prelinked {} at {:#x} to {}", identifier, load_address, path.display());
            }
            Some(KextOutcome::Failed(err)) => {
                eprintln!("{}: {}", identifier, err);
                failures += 1;
            }
            None => {
                eprintln!("{}: not processed", identifier);
                failures += 1;
            }
        }
    }

    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
