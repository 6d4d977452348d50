//! Error types.
//!
//! Every structural check on an input image, every resolution failure and
//! every ABI policy violation surfaces as a [`PrelinkError`]. The binary wraps
//! these with `anyhow` context; the library never panics on bad input.

use thiserror::Error;

/// Broad classes of failure, used by the orchestrator when reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The input violates a documented structural rule of the format.
    MalformedInput,
    /// Internal state disagrees with itself.
    InvariantViolation,
    /// A symbol, class or dependency could not be found or matched.
    Resolution,
    /// The input is well formed but breaks a C++ or x86_64 ABI rule.
    AbiPolicy,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrelinkError {
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("unsupported input: {0}")]
    Unsupported(String),
    #[error("invalid manifest: {0}")]
    Manifest(String),
    #[error("plist parse error at offset {offset}: {message}")]
    Plist { offset: usize, message: String },

    #[error("symbol {0} not found in any dependency")]
    SymbolNotFound(String),
    #[error("common symbol {0} is not supported")]
    CommonSymbol(String),
    #[error("unresolved symbols: {}", .0.join(", "))]
    UnresolvedSymbols(Vec<String>),
    #[error("vtable {0} not found")]
    VTableNotFound(String),
    #[error("class {0} is already defined by a dependency")]
    DuplicateClass(String),
    #[error("vtable patching made no progress, {0} classes left unpatched")]
    VTablePatchStalled(usize),
    #[error("dependency {0} not found")]
    DependencyMissing(String),
    #[error("dependency {name} {requested} is not compatible with the available version")]
    VersionMismatch { name: String, requested: String },
    #[error("dependency cycle involving {0}")]
    DependencyCycle(String),
    #[error("dependency {0} failed to link")]
    DependencyFailed(String),

    #[error("{vtable}: {symbol} overrides a pad slot of its superclass")]
    PadSlotOverride { vtable: String, symbol: String },
    #[error("{vtable}: virtual method {symbol} is declared but not implemented")]
    UnimplementedVirtual { vtable: String, symbol: String },
    #[error("{vtable}: function pointer {symbol} = {value:#x} is not aligned")]
    MisalignedFunction { vtable: String, symbol: String, value: u64 },
    #[error("class {class} subclasses final class {superclass}")]
    FinalSuperclass { class: String, superclass: String },
    #[error("direct call to pure virtual method through {vtable} slot {index}")]
    DirectPureVirtualCall { vtable: String, index: usize },
    #[error("relocation references unpatched pad slot {0}")]
    UnpatchedPadSlot(String),
    #[error("relocation at {address:#x}: displacement {displacement:#x} out of range")]
    DisplacementOutOfRange { address: u64, displacement: i64 },
    #[error("unsupported relocation type {r_type} with length {r_length}")]
    UnsupportedRelocation { r_type: u8, r_length: u8 },
}

impl PrelinkError {
    pub fn category(&self) -> ErrorCategory {
        use PrelinkError::*;
        match self {
            MalformedInput(_) | Unsupported(_) | Manifest(_) | Plist { .. } => {
                ErrorCategory::MalformedInput
            }
            InvariantViolation(_) => ErrorCategory::InvariantViolation,
            SymbolNotFound(_)
            | CommonSymbol(_)
            | UnresolvedSymbols(_)
            | VTableNotFound(_)
            | DuplicateClass(_)
            | VTablePatchStalled(_)
            | DependencyMissing(_)
            | VersionMismatch { .. }
            | DependencyCycle(_)
            | DependencyFailed(_) => ErrorCategory::Resolution,
            PadSlotOverride { .. }
            | UnimplementedVirtual { .. }
            | MisalignedFunction { .. }
            | FinalSuperclass { .. }
            | DirectPureVirtualCall { .. }
            | UnpatchedPadSlot(_)
            | DisplacementOutOfRange { .. }
            | UnsupportedRelocation { .. } => ErrorCategory::AbiPolicy,
        }
    }
}

pub type Result<T> = std::result::Result<T, PrelinkError>;

/// Shorthand for [`PrelinkError::MalformedInput`].
pub(crate) fn malformed(message: impl Into<String>) -> PrelinkError {
    PrelinkError::MalformedInput(message.into())
}
