//! Operation-specific event detail payloads.
//!
//! Only file system reads and writes are decoded. Everything else is kept as
//! a generic record holding the raw bytes.

use crate::domain::{EventClass, TraceError};
use log::trace;
use pmlbake_common::{
    le_u16, ReadWriteTail, DETAIL_STRING_ASCII, FS_DETAIL_PATH_INFO, FS_DETAIL_PREFIX_LEN,
    FS_OP_CREATE_FILE, FS_OP_DEVICE_IO_CONTROL, FS_OP_DIRECTORY_CONTROL, FS_OP_READ_FILE,
    FS_OP_WRITE_FILE,
};

/// Decoded detail of a `ReadFile` or `WriteFile` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReadWrite {
    pub is_write: bool,
    pub sub_operation: u8,
    pub path: String,
    pub offset: i64,
    pub length: u32,
    pub io_flags: u32,
    pub priority: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDetail {
    FileReadWrite(FileReadWrite),
    Generic { class: EventClass, operation: u16, raw: Vec<u8> },
}

/// Decode the detail payload of an event.
///
/// `offset` is the file position of `raw`, for error context only.
///
/// # Errors
/// Returns [`TraceError::Format`] if a decoded payload is truncated or its
/// path is not valid UTF-16.
pub fn decode_detail(
    class: EventClass,
    operation: u16,
    raw: Vec<u8>,
    offset: u64,
) -> Result<EventDetail, TraceError> {
    match (class, operation) {
        (EventClass::FileSystem, FS_OP_READ_FILE | FS_OP_WRITE_FILE) => {
            decode_read_write(operation == FS_OP_WRITE_FILE, &raw, offset)
                .map(EventDetail::FileReadWrite)
        }
        (
            EventClass::FileSystem,
            FS_OP_CREATE_FILE | FS_OP_DEVICE_IO_CONTROL | FS_OP_DIRECTORY_CONTROL,
        ) => Ok(decoder_not_implemented(class, operation, raw)),
        _ => Ok(EventDetail::Generic { class, operation, raw }),
    }
}

/// CreateFile, DeviceIoControl and DirectoryControl have known layouts that
/// are not decoded yet. They deliberately stay generic.
fn decoder_not_implemented(class: EventClass, operation: u16, raw: Vec<u8>) -> EventDetail {
    trace!(
        "Detail decoder for {} not implemented, keeping raw bytes",
        operation_name(class, operation)
    );
    EventDetail::Generic { class, operation, raw }
}

fn decode_read_write(
    is_write: bool,
    raw: &[u8],
    offset: u64,
) -> Result<FileReadWrite, TraceError> {
    let truncated = |reason: &str| TraceError::Format {
        what: "file read/write detail",
        offset,
        reason: reason.to_string(),
    };

    if raw.len() < FS_DETAIL_PREFIX_LEN {
        return Err(truncated("shorter than the file system prefix"));
    }
    let sub_operation = raw[0];
    let (path, path_len) =
        decode_detail_string(&raw[FS_DETAIL_PATH_INFO..], &raw[FS_DETAIL_PREFIX_LEN..])
            .ok_or_else(|| truncated("path runs past the payload or is not valid UTF-16"))?;

    let tail_start = FS_DETAIL_PREFIX_LEN + path_len;
    let tail: &[u8; ReadWriteTail::LEN] = raw
        .get(tail_start..tail_start + ReadWriteTail::LEN)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| truncated("read/write fields run past the payload"))?;
    let tail = ReadWriteTail::decode(tail);

    Ok(FileReadWrite {
        is_write,
        sub_operation,
        path,
        offset: tail.offset,
        length: tail.length,
        io_flags: tail.io_flags,
        priority: tail.priority,
    })
}

/// Decode a detail string given its info word and the bytes that follow.
/// Returns the string and the number of bytes it occupied.
fn decode_detail_string(info: &[u8], data: &[u8]) -> Option<(String, usize)> {
    let info = le_u16(info.get(..2)?);
    let chars = usize::from(info & !DETAIL_STRING_ASCII);

    if info & DETAIL_STRING_ASCII != 0 {
        let bytes = data.get(..chars)?;
        Some((bytes.iter().map(|&b| char::from(b)).collect(), chars))
    } else {
        let bytes = data.get(..chars * 2)?;
        let units: Vec<u16> = bytes.chunks_exact(2).map(le_u16).collect();
        String::from_utf16(&units).ok().map(|s| (s, chars * 2))
    }
}

/// Human-readable operation name for display.
#[must_use]
pub fn operation_name(class: EventClass, operation: u16) -> String {
    let known = match (class, operation) {
        (EventClass::FileSystem, FS_OP_CREATE_FILE) => Some("CreateFile"),
        (EventClass::FileSystem, FS_OP_READ_FILE) => Some("ReadFile"),
        (EventClass::FileSystem, FS_OP_WRITE_FILE) => Some("WriteFile"),
        (EventClass::FileSystem, FS_OP_DIRECTORY_CONTROL) => Some("DirectoryControl"),
        (EventClass::FileSystem, FS_OP_DEVICE_IO_CONTROL) => Some("DeviceIoControl"),
        _ => None,
    };
    known.map_or_else(|| format!("{class} #{operation}"), str::to_string)
}
