//! # Trace Container Decoding
//!
//! Reads the binary capture files produced by the monitoring tool: a fixed
//! header, an event-offset index, a UTF-16 string table, a process table
//! (with each process's modules) and the event records themselves.
//!
//! ## File Layout
//!
//! ```text
//! ┌──────────────┐ 0x000
//! │ Header       │ magic, version, 64-bit flag, table offsets
//! ├──────────────┤ events offset
//! │ Event data   │ header + stack + detail, one record per event
//! ├──────────────┤ event-offset index offset
//! │ Offset index │ {u32 offset, u8 flags} per event
//! ├──────────────┤ string table offset
//! │ Strings      │ count, offsets, length-prefixed UTF-16
//! ├──────────────┤ process table offset
//! │ Processes    │ count, indices, offsets, records + modules
//! └──────────────┘
//! ```
//!
//! Byte-level field offsets live in `pmlbake-common`.
//!
//! ## Failure Model
//!
//! Every structural mismatch is fatal. A capture whose producer was killed
//! instead of stopped leaves an offset index that does not start at the
//! event data; such files are rejected with
//! [`TraceError::IncompleteCapture`](crate::domain::TraceError::IncompleteCapture)
//! rather than repaired.

pub mod detail;
pub mod event;
pub mod process;
pub mod reader;

pub use detail::{EventDetail, FileReadWrite};
pub use event::{EventFilter, TraceEvent};
pub use process::{Module, Process};
pub use reader::{Events, TraceReader};
