//! Analysis over baked stacks
//!
//! Read-only queries that run after symbolication, separated from the CLI
//! presentation layer.

pub mod query_index;

pub use query_index::{QueryIndex, SymbolRank};
