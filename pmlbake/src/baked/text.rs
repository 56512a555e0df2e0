//! Human-readable rendering of symbolicated stacks.
//!
//! ```text
//! Event #12 at 2024-03-01T10:15:02.1234567Z
//!     1 U [app.exe] main + 0x1a (0x7ff612341a2a)
//!     0 K 0xfffff80312345678
//!
//! ```
//!
//! Frames are listed in stored order (outermost first) but numbered from
//! the innermost frame, so the first line carries the highest number.

use super::reader::BakedFile;
use crate::domain::{FileTime, FrameType};
use std::io::{self, Write};

/// One frame ready for printing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextFrame<'a> {
    pub frame_type: FrameType,
    /// Empty when the frame is unresolved.
    pub module: &'a str,
    /// Empty when only the module is known.
    pub symbol: &'a str,
    /// Offset from the symbol (or module base), or the absolute address of
    /// an unresolved frame.
    pub address_or_offset: u64,
    /// Absolute address, when still known.
    pub address: Option<u64>,
}

/// Display number of the frame stored at `position` in a stack of `count`.
#[must_use]
pub fn display_index(count: usize, position: usize) -> usize {
    count - position - 1
}

pub fn write_event_header<W: Write>(
    out: &mut W,
    index: u64,
    capture_time: Option<FileTime>,
) -> io::Result<()> {
    match capture_time {
        Some(time) => writeln!(out, "Event #{index} at {time}"),
        None => writeln!(out, "Event #{index}"),
    }
}

pub fn write_frame<W: Write>(out: &mut W, display: usize, frame: &TextFrame<'_>) -> io::Result<()> {
    let letter = frame.frame_type.letter();
    if frame.module.is_empty() {
        return writeln!(out, "    {display} {letter} 0x{:x}", frame.address_or_offset);
    }

    write!(out, "    {display} {letter} [{}]", frame.module)?;
    if !frame.symbol.is_empty() {
        write!(out, " {}", frame.symbol)?;
    }
    write!(out, " + 0x{:x}", frame.address_or_offset)?;
    if let Some(address) = frame.address {
        write!(out, " (0x{address:x})")?;
    }
    writeln!(out)
}

/// Blank line closing an event block.
pub fn write_event_end<W: Write>(out: &mut W) -> io::Result<()> {
    writeln!(out)
}

/// Render one event of a baked file. Events without frames print nothing.
pub fn write_baked_event<W: Write>(out: &mut W, baked: &BakedFile, event: usize) -> io::Result<()> {
    let frames = baked.frames(event).unwrap_or_default();
    if frames.is_empty() {
        return Ok(());
    }

    write_event_header(out, event as u64, None)?;
    for (position, record) in frames.iter().enumerate() {
        let frame = TextFrame {
            frame_type: FrameType::from_u32(record.frame_type).unwrap_or(FrameType::User),
            module: baked.string(record.module).unwrap_or_default(),
            symbol: baked.string(record.symbol).unwrap_or_default(),
            address_or_offset: record.address_or_offset,
            address: None,
        };
        write_frame(out, display_index(frames.len(), position), &frame)?;
    }
    write_event_end(out)
}
