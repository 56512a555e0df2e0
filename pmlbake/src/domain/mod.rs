//! Domain model for pmlbake
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety for frame and event classification
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{EventClass, FileTime, FrameType};

pub use errors::{
    BakedError, ManagedSymbolError, ResolverError, SymbolError, SymbolicateError, TraceError,
};
