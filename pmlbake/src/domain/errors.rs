//! Structured error types for pmlbake
//!
//! Using thiserror for automatic Display implementation and error chaining.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures while decoding a trace container. All of them are fatal: binary
/// offsets that disagree cannot be guessed around.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Not a trace file: bad magic {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("Unsupported trace version {found} (only version {expected} is supported)")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Only 64-bit traces are supported")]
    Not64Bit,

    #[error(
        "Incomplete capture: first event offset 0x{first:x} does not match event data offset \
         0x{declared:x} (the capture was killed rather than stopped)"
    )]
    IncompleteCapture { first: u64, declared: u64 },

    #[error("Malformed {what} at offset 0x{offset:x}: {reason}")]
    Format { what: &'static str, offset: u64, reason: String },

    #[error("Event index {index} out of range ({count} events)")]
    EventOutOfRange { index: u32, count: u32 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures while loading a managed (JIT) symbol file.
#[derive(Error, Debug)]
pub enum ManagedSymbolError {
    #[error("Cannot parse process id and domain serial from file name {0}")]
    FileName(PathBuf),

    #[error("{path}: unsupported header {found:?}")]
    Header { path: PathBuf, found: String },

    #[error("{path}:{line}: {reason}")]
    Line { path: PathBuf, line: usize, reason: String },

    #[error("Failed to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Outcomes reported by a native symbol backend.
#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Invalid address 0x{0:x}")]
    InvalidAddress(u64),

    #[error("No module loaded at 0x{0:x}")]
    ModuleNotFound(u64),

    #[error("Unreadable image {path}: {reason}")]
    BadImage { path: String, reason: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ResolverError {
    /// The image was deleted or moved since the capture.
    #[must_use]
    pub fn is_soft_module_miss(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::PathNotFound(_))
    }

    /// The address has no symbol, or falls outside every loaded image.
    #[must_use]
    pub fn is_soft_address_miss(&self) -> bool {
        matches!(self, Self::InvalidAddress(_) | Self::ModuleNotFound(_))
    }
}

/// Hard symbol failures, wrapped with the module and address involved.
#[derive(Error, Debug)]
pub enum SymbolError {
    #[error("Failed to load module {image_path} at 0x{base:x}: {source}")]
    ModuleLoad {
        image_path: String,
        base: u64,
        #[source]
        source: ResolverError,
    },

    #[error("Failed to resolve 0x{address:x} in {image_path}: {source}")]
    Resolve {
        image_path: String,
        address: u64,
        #[source]
        source: ResolverError,
    },
}

/// Failures while writing or reading a baked file.
#[derive(Error, Debug)]
pub enum BakedError {
    #[error("Not a baked file, or corrupt")]
    BadHeader,

    #[error("Baked file is corrupt: {0}")]
    Corrupt(String),

    #[error("Cannot intern {0:?}: strings must not contain newline, carriage return or tab")]
    ForbiddenCharacter(String),

    #[error("Event {sequence} is out of order, the next free slot is {next}")]
    OutOfOrder { sequence: u32, next: u32 },

    #[error("Too many {0} for a baked file")]
    TooLarge(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Anything that aborts a symbolication run.
#[derive(Error, Debug)]
pub enum SymbolicateError {
    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error(transparent)]
    Managed(#[from] ManagedSymbolError),

    #[error(transparent)]
    Symbol(#[from] SymbolError),

    #[error(transparent)]
    Baked(#[from] BakedError),

    #[error("Failed to write {path}: {source}")]
    Output { path: PathBuf, source: io::Error },
}
