//! # Baked Stack Files
//!
//! A baked file stores the symbolicated stack of every event of a trace in
//! a compact, random-access form:
//!
//! ```text
//! "PMLBAKED:1->"            uncompressed header
//! zlib {
//!     u64 n, u32 frame_count[n]        one per event, gaps are 0
//!     u64 m, frame[m]                  20-byte records, see pmlbake-common
//!     u64 k, u32 string_offset[k]      string 0 is the empty string
//!     u64 b, u8  string_bytes[b]       UTF-8, no terminators
//! }
//! ```
//!
//! Strings are interned by exact match and may not contain newline, carriage
//! return or tab characters, which keeps the text rendering line-oriented.

pub mod reader;
pub mod text;
pub mod writer;

pub use reader::BakedFile;
pub use text::{write_baked_event, TextFrame};
pub use writer::{BakedFrame, BakedWriter};
