//! # pmlbake - Offline Stack Symbolication for Process Monitor Traces
//!
//! Process monitor captures record a raw call stack with every event, but no
//! symbols. pmlbake reads such a capture, resolves every return address to
//! `module!symbol + offset` and stores the result in a compact "baked" file
//! that later tools can query without touching the symbol sources again.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────────────┐   ┌──────────────┐
//! │  capture.pml │──▶│       Symbolicator        │──▶│ .pmlbaked    │
//! │  (trace)     │   │                           │   │ (+ text)     │
//! └──────────────┘   │  per process SymbolCache  │   └──────┬───────┘
//!                    │   ├─ native resolver      │          │
//! ┌──────────────┐   │   └─ managed tables       │          ▼
//! │ pmip_*.txt   │──▶│                           │   ┌──────────────┐
//! │ module images│   └───────────────────────────┘   │  QueryIndex  │
//! └──────────────┘                                   └──────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`trace`]: decoding of the binary trace container (header, string and
//!   process tables, events, stacks, file system details)
//! - [`symbolization`]: native and managed symbol sources, the per-process
//!   cache and the symbolication driver
//! - [`baked`]: the baked file writer, reader and text rendering
//! - [`analysis`]: regex queries and symbol rankings over a baked file
//! - [`cli`]: command-line argument parsing
//! - [`domain`]: value types and error enums
//!
//! ## Typical Usage
//!
//! ```bash
//! # Symbolicate, writing capture.pmlbaked next to the trace
//! pmlbake bake capture.pml --text capture.txt
//!
//! # Which events went through ReadFile?
//! pmlbake query capture.pmlbaked --symbol 'ReadFile$' --stacks
//! ```
//!
//! ## Key Concepts
//!
//! - **Frame type**: kernel (`K`) and user (`U`) frames are told apart by the
//!   top address bit; frames resolved from managed tables become `M`
//! - **Managed symbol table**: a text file written by a JIT runtime listing
//!   the code ranges it generated, one file per domain generation
//! - **Gap**: an event slot that was never captured; baked files keep it as
//!   an empty stack so event indices line up with the trace

pub mod analysis;
pub mod baked;
pub mod cli;
pub mod domain;
pub mod symbolization;
pub mod trace;
