//! Loads a baked file fully into memory for random access.

use crate::domain::{BakedError, FrameType};
use flate2::read::ZlibDecoder;
use log::info;
use pmlbake_common::{le_u32, BakedFrameRecord, BAKED_MAGIC};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// A decoded baked file.
///
/// `event_offsets` and `string_offsets` each carry one trailing terminator,
/// so every event and every string is a single slice.
#[derive(Debug)]
pub struct BakedFile {
    event_offsets: Vec<usize>,
    frames: Vec<BakedFrameRecord>,
    string_offsets: Vec<usize>,
    strings: String,
}

impl BakedFile {
    /// # Errors
    /// Returns an error if the file cannot be read or is not a valid baked file
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BakedError> {
        let path = path.as_ref();
        let baked = Self::from_reader(BufReader::new(File::open(path)?))?;
        info!(
            "Loaded {} ({} events, {} frames)",
            path.display(),
            baked.event_count(),
            baked.frames.len()
        );
        Ok(baked)
    }

    /// # Errors
    /// - [`BakedError::BadHeader`] if the header does not match exactly
    /// - [`BakedError::Corrupt`] if the block is truncated or inconsistent
    pub fn from_reader<R: Read>(mut input: R) -> Result<Self, BakedError> {
        let mut magic = [0u8; BAKED_MAGIC.len()];
        match input.read_exact(&mut magic) {
            Ok(()) if magic == BAKED_MAGIC => {}
            Ok(()) => return Err(BakedError::BadHeader),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(BakedError::BadHeader)
            }
            Err(e) => return Err(e.into()),
        }

        let mut block = ZlibDecoder::new(input);
        let counts = read_array(&mut block, 4, "frame counts")?;
        let frame_bytes = read_array(&mut block, BakedFrameRecord::LEN, "frames")?;
        let offset_bytes = read_array(&mut block, 4, "string offsets")?;
        let string_bytes = read_array(&mut block, 1, "string bytes")?;

        let strings = String::from_utf8(string_bytes)
            .map_err(|e| BakedError::Corrupt(format!("string bytes are not UTF-8: {e}")))?;

        let mut string_offsets: Vec<usize> =
            offset_bytes.chunks_exact(4).map(|b| le_u32(b) as usize).collect();
        string_offsets.push(strings.len());
        let well_formed = string_offsets.windows(2).all(|w| w[0] <= w[1])
            && string_offsets.iter().all(|&offset| strings.is_char_boundary(offset));
        if string_offsets.len() < 2 || string_offsets[0] != 0 || !well_formed {
            return Err(BakedError::Corrupt("string offsets are out of order".to_string()));
        }

        let mut event_offsets = Vec::with_capacity(counts.len() / 4 + 1);
        let mut total = 0usize;
        event_offsets.push(0);
        for count in counts.chunks_exact(4) {
            total += le_u32(count) as usize;
            event_offsets.push(total);
        }

        let frames: Vec<BakedFrameRecord> = frame_bytes
            .chunks_exact(BakedFrameRecord::LEN)
            .map(|chunk| {
                let mut buf = [0u8; BakedFrameRecord::LEN];
                buf.copy_from_slice(chunk);
                BakedFrameRecord::decode(&buf)
            })
            .collect();
        if total != frames.len() {
            return Err(BakedError::Corrupt(format!(
                "frame counts add up to {total}, but {} frames are stored",
                frames.len()
            )));
        }

        let string_count = string_offsets.len() - 1;
        for record in &frames {
            if FrameType::from_u32(record.frame_type).is_none() {
                return Err(BakedError::Corrupt(format!(
                    "unknown frame type {}",
                    record.frame_type
                )));
            }
            if record.module as usize >= string_count || record.symbol as usize >= string_count {
                return Err(BakedError::Corrupt(format!(
                    "string index out of range ({} strings)",
                    string_count
                )));
            }
        }

        Ok(Self { event_offsets, frames, string_offsets, strings })
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.event_offsets.len() - 1
    }

    /// Frames of `event` in stored order (outermost first).
    #[must_use]
    pub fn frames(&self, event: usize) -> Option<&[BakedFrameRecord]> {
        let start = *self.event_offsets.get(event)?;
        let end = *self.event_offsets.get(event + 1)?;
        Some(&self.frames[start..end])
    }

    #[must_use]
    pub fn string(&self, index: u32) -> Option<&str> {
        let index = index as usize;
        let start = *self.string_offsets.get(index)?;
        let end = *self.string_offsets.get(index + 1)?;
        Some(&self.strings[start..end])
    }

    /// Number of distinct strings, the empty string included.
    #[must_use]
    pub fn string_count(&self) -> usize {
        self.string_offsets.len() - 1
    }
}

/// Read a `u64` element count followed by `count * element_len` bytes.
fn read_array<R: Read>(
    block: &mut R,
    element_len: usize,
    what: &str,
) -> Result<Vec<u8>, BakedError> {
    let mut len_bytes = [0u8; 8];
    block
        .read_exact(&mut len_bytes)
        .map_err(|e| BakedError::Corrupt(format!("{what}: missing length ({e})")))?;
    let count = u64::from_le_bytes(len_bytes);

    let byte_len = count
        .checked_mul(element_len as u64)
        .ok_or_else(|| BakedError::Corrupt(format!("{what}: length {count} overflows")))?;

    let mut bytes = Vec::new();
    block
        .take(byte_len)
        .read_to_end(&mut bytes)
        .map_err(|e| BakedError::Corrupt(format!("{what}: {e}")))?;
    if bytes.len() as u64 != byte_len {
        return Err(BakedError::Corrupt(format!(
            "{what}: expected {byte_len} bytes, found {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}
