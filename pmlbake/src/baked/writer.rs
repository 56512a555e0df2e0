//! Accumulates symbolicated frames and serializes them as a baked file.

use crate::domain::{BakedError, FrameType};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::debug;
use pmlbake_common::{BakedFrameRecord, BAKED_MAGIC};
use std::collections::HashMap;
use std::io::Write;

/// One frame as handed to [`BakedWriter::add_event`].
///
/// An empty `module` marks an unresolved frame whose `address_or_offset` is
/// the absolute address; otherwise it is the offset from the symbol (or from
/// the module base when `symbol` is empty).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BakedFrame<'a> {
    pub frame_type: FrameType,
    pub module: &'a str,
    pub symbol: &'a str,
    pub address_or_offset: u64,
}

/// In-memory builder for a baked file.
///
/// Event indices match trace sequence numbers: skipped sequences get a zero
/// frame count.
#[derive(Debug)]
pub struct BakedWriter {
    counts: Vec<u32>,
    frames: Vec<BakedFrameRecord>,
    string_offsets: Vec<u32>,
    string_bytes: Vec<u8>,
    interned: HashMap<String, u32>,
}

impl Default for BakedWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BakedWriter {
    #[must_use]
    pub fn new() -> Self {
        let mut interned = HashMap::new();
        interned.insert(String::new(), 0);
        Self {
            counts: Vec::new(),
            frames: Vec::new(),
            string_offsets: vec![0],
            string_bytes: Vec::new(),
            interned,
        }
    }

    /// Number of event slots written so far, gaps included.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.counts.len()
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Number of distinct strings, the empty string included.
    #[must_use]
    pub fn string_count(&self) -> usize {
        self.string_offsets.len()
    }

    /// Return the index of `value`, adding it on first use. Index 0 is the
    /// empty string.
    ///
    /// # Errors
    /// - [`BakedError::ForbiddenCharacter`] if `value` contains a newline,
    ///   carriage return or tab
    /// - [`BakedError::TooLarge`] once the string table outgrows 32-bit indices
    pub fn intern(&mut self, value: &str) -> Result<u32, BakedError> {
        if let Some(&index) = self.interned.get(value) {
            return Ok(index);
        }
        if value.contains(['\n', '\r', '\t']) {
            return Err(BakedError::ForbiddenCharacter(value.to_string()));
        }

        let index = to_u32(self.string_offsets.len(), "strings")?;
        let offset = to_u32(self.string_bytes.len(), "string bytes")?;
        self.string_offsets.push(offset);
        self.string_bytes.extend_from_slice(value.as_bytes());
        self.interned.insert(value.to_string(), index);
        Ok(index)
    }

    /// Record the frames of event `sequence`, zero-filling any sequences
    /// skipped since the previous event.
    ///
    /// # Errors
    /// - [`BakedError::OutOfOrder`] if `sequence` was already written
    /// - [`BakedError::ForbiddenCharacter`] or [`BakedError::TooLarge`] from
    ///   interning
    pub fn add_event(
        &mut self,
        sequence: u32,
        frames: &[BakedFrame<'_>],
    ) -> Result<(), BakedError> {
        let next = to_u32(self.counts.len(), "events")?;
        if sequence < next {
            return Err(BakedError::OutOfOrder { sequence, next });
        }

        let mut records = Vec::with_capacity(frames.len());
        for frame in frames {
            records.push(BakedFrameRecord {
                frame_type: frame.frame_type.to_u32(),
                module: self.intern(frame.module)?,
                symbol: self.intern(frame.symbol)?,
                address_or_offset: frame.address_or_offset,
            });
        }

        let count = to_u32(records.len(), "frames in one event")?;
        self.pad_to(sequence);
        self.counts.push(count);
        self.frames.extend(records);
        Ok(())
    }

    /// Zero-fill event slots up to (not including) `event_count`.
    pub fn pad_to(&mut self, event_count: u32) {
        let event_count = event_count as usize;
        if self.counts.len() < event_count {
            self.counts.resize(event_count, 0);
        }
    }

    /// Write the header and the compressed block.
    ///
    /// # Errors
    /// Returns an error if writing or compressing fails
    pub fn finish<W: Write>(self, mut out: W) -> Result<W, BakedError> {
        debug!(
            "Baking {} events, {} frames, {} strings",
            self.counts.len(),
            self.frames.len(),
            self.string_offsets.len()
        );

        out.write_all(BAKED_MAGIC)?;
        let mut block = ZlibEncoder::new(out, Compression::default());

        write_len(&mut block, self.counts.len())?;
        for count in &self.counts {
            block.write_all(&count.to_le_bytes())?;
        }

        write_len(&mut block, self.frames.len())?;
        let mut buf = [0u8; BakedFrameRecord::LEN];
        for record in &self.frames {
            record.encode(&mut buf);
            block.write_all(&buf)?;
        }

        write_len(&mut block, self.string_offsets.len())?;
        for offset in &self.string_offsets {
            block.write_all(&offset.to_le_bytes())?;
        }

        write_len(&mut block, self.string_bytes.len())?;
        block.write_all(&self.string_bytes)?;

        Ok(block.finish()?)
    }
}

fn to_u32(value: usize, what: &'static str) -> Result<u32, BakedError> {
    u32::try_from(value).map_err(|_| BakedError::TooLarge(what))
}

fn write_len<W: Write>(out: &mut W, len: usize) -> std::io::Result<()> {
    out.write_all(&(len as u64).to_le_bytes())
}
