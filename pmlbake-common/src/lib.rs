//! # Fixed-Layout Binary Records (Trace Container ↔ Baked File)
//!
//! Defines the byte layouts shared by the trace reader, the baked writer and
//! the test fixtures that synthesize trace files. Every record is encoded and
//! decoded field by field over little-endian byte buffers; nothing here relies
//! on `#[repr(C)]` layout equivalence.
//!
//! ## Key Types
//!
//! - [`FileHeader`] - Decoded prefix of the trace container header
//! - [`EventOffsetEntry`] - One slot of the event-offset index
//! - [`EventHeader`] - Fixed part of every event record
//! - [`ProcessRecord`] / [`ModuleRecord`] - Process table entries
//! - [`BakedFrameRecord`] - One symbolicated frame in a baked file
//!
//! Only the 64-bit flavour of the trace container is described. Pointer-sized
//! fields are therefore always 8 bytes wide.

#![cfg_attr(not(test), no_std)]

// ============================================================================
// Trace Container Constants
// ============================================================================

/// Magic bytes at offset 0 of every trace container.
pub const PML_MAGIC: [u8; 4] = *b"PML_";

/// The one container version this crate understands.
pub const PML_VERSION: u32 = 9;

/// Size of a pointer in the 64-bit container flavour.
pub const POINTER_SIZE: usize = 8;

/// Name of the process that owns kernel modules.
pub const SYSTEM_PROCESS_NAME: &str = "System";

/// Event classes as stored in [`EventHeader::class`].
pub const CLASS_PROCESS: u32 = 1;
pub const CLASS_REGISTRY: u32 = 2;
pub const CLASS_FILE_SYSTEM: u32 = 3;
pub const CLASS_PROFILING: u32 = 4;
pub const CLASS_NETWORK: u32 = 5;

/// File system operations with dedicated handling in the detail decoder.
pub const FS_OP_CREATE_FILE: u16 = 20;
pub const FS_OP_READ_FILE: u16 = 23;
pub const FS_OP_WRITE_FILE: u16 = 24;
pub const FS_OP_DIRECTORY_CONTROL: u16 = 32;
pub const FS_OP_DEVICE_IO_CONTROL: u16 = 34;

// ============================================================================
// Little-Endian Helpers
// ============================================================================

#[inline]
fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

#[inline]
fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[inline]
fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

#[inline]
fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

/// Read a little-endian `u16` from the start of `buf`.
///
/// # Panics
/// Panics if `buf` is shorter than 2 bytes.
#[must_use]
pub fn le_u16(buf: &[u8]) -> u16 {
    get_u16(buf, 0)
}

/// Read a little-endian `u32` from the start of `buf`.
///
/// # Panics
/// Panics if `buf` is shorter than 4 bytes.
#[must_use]
pub fn le_u32(buf: &[u8]) -> u32 {
    get_u32(buf, 0)
}

/// Read a little-endian `u64` from the start of `buf`.
///
/// # Panics
/// Panics if `buf` is shorter than 8 bytes.
#[must_use]
pub fn le_u64(buf: &[u8]) -> u64 {
    get_u64(buf, 0)
}

// ============================================================================
// File Header
// ============================================================================

/// Decoded prefix of the trace container header.
///
/// **Layout** (offsets in bytes):
///
/// | Offset  | Size  | Field                                   |
/// |---------|-------|-----------------------------------------|
/// | `0x000` | 4     | magic `PML_`                            |
/// | `0x004` | 4     | version                                 |
/// | `0x008` | 4     | 64-bit flag (1 = 64-bit)                |
/// | `0x00C` | 0x40  | computer name, UTF-16 (skipped)         |
/// | `0x04C` | 0x208 | system root, UTF-16 (skipped)           |
/// | `0x254` | 4     | event count                             |
/// | `0x258` | 8     | reserved                                |
/// | `0x260` | 8     | offset of event data                    |
/// | `0x268` | 8     | offset of the event-offset index        |
/// | `0x270` | 8     | offset of the process table             |
/// | `0x278` | 8     | offset of the string table              |
/// | `0x280` | 8     | offset of the icon table (unused)       |
///
/// Fields past `0x288` (OS version, processor count, ...) are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub is_64bit: u32,
    pub event_count: u32,
    pub events_offset: u64,
    pub event_offsets_offset: u64,
    pub process_table_offset: u64,
    pub string_table_offset: u64,
    pub icon_table_offset: u64,
}

impl FileHeader {
    /// Bytes of the header decoded by [`FileHeader::decode`].
    pub const LEN: usize = 0x288;

    const VERSION: usize = 0x004;
    const IS_64BIT: usize = 0x008;
    const EVENT_COUNT: usize = 0x254;
    const EVENTS_OFFSET: usize = 0x260;
    const EVENT_OFFSETS_OFFSET: usize = 0x268;
    const PROCESS_TABLE_OFFSET: usize = 0x270;
    const STRING_TABLE_OFFSET: usize = 0x278;
    const ICON_TABLE_OFFSET: usize = 0x280;

    #[must_use]
    pub fn decode(buf: &[u8; Self::LEN]) -> Self {
        Self {
            magic: [buf[0], buf[1], buf[2], buf[3]],
            version: get_u32(buf, Self::VERSION),
            is_64bit: get_u32(buf, Self::IS_64BIT),
            event_count: get_u32(buf, Self::EVENT_COUNT),
            events_offset: get_u64(buf, Self::EVENTS_OFFSET),
            event_offsets_offset: get_u64(buf, Self::EVENT_OFFSETS_OFFSET),
            process_table_offset: get_u64(buf, Self::PROCESS_TABLE_OFFSET),
            string_table_offset: get_u64(buf, Self::STRING_TABLE_OFFSET),
            icon_table_offset: get_u64(buf, Self::ICON_TABLE_OFFSET),
        }
    }

    /// Encode into `buf`. Skipped regions are left as zeros.
    pub fn encode(&self, buf: &mut [u8; Self::LEN]) {
        buf.fill(0);
        buf[0..4].copy_from_slice(&self.magic);
        put_u32(buf, Self::VERSION, self.version);
        put_u32(buf, Self::IS_64BIT, self.is_64bit);
        put_u32(buf, Self::EVENT_COUNT, self.event_count);
        put_u64(buf, Self::EVENTS_OFFSET, self.events_offset);
        put_u64(buf, Self::EVENT_OFFSETS_OFFSET, self.event_offsets_offset);
        put_u64(buf, Self::PROCESS_TABLE_OFFSET, self.process_table_offset);
        put_u64(buf, Self::STRING_TABLE_OFFSET, self.string_table_offset);
        put_u64(buf, Self::ICON_TABLE_OFFSET, self.icon_table_offset);
    }
}

// ============================================================================
// Event-Offset Index
// ============================================================================

/// One slot of the event-offset index: `{offset u32 @0, flags u8 @4}`.
///
/// An offset of zero marks a slot that was never written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventOffsetEntry {
    pub offset: u32,
    pub flags: u8,
}

impl EventOffsetEntry {
    pub const LEN: usize = 5;

    #[must_use]
    pub fn decode(buf: &[u8; Self::LEN]) -> Self {
        Self { offset: get_u32(buf, 0), flags: buf[4] }
    }

    pub fn encode(&self, buf: &mut [u8; Self::LEN]) {
        put_u32(buf, 0, self.offset);
        buf[4] = self.flags;
    }
}

// ============================================================================
// Event Header
// ============================================================================

/// Fixed part of an event record.
///
/// **Layout**:
///
/// | Offset | Size | Field                                       |
/// |--------|------|---------------------------------------------|
/// | `0x00` | 4    | process index (into the process table)      |
/// | `0x04` | 4    | thread id                                   |
/// | `0x08` | 4    | event class                                 |
/// | `0x0C` | 2    | operation                                   |
/// | `0x0E` | 6    | reserved                                    |
/// | `0x14` | 8    | duration, 100ns ticks                       |
/// | `0x1C` | 8    | capture time, FILETIME                      |
/// | `0x24` | 4    | result (NTSTATUS-like)                      |
/// | `0x28` | 2    | stack depth                                 |
/// | `0x2A` | 2    | reserved                                    |
/// | `0x2C` | 4    | details size                                |
/// | `0x30` | 4    | extra details offset, relative to the event |
///
/// The header is followed by `stack_depth` pointer-sized addresses and then
/// `details_size` bytes of class-specific detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventHeader {
    pub process_index: u32,
    pub thread_id: u32,
    pub class: u32,
    pub operation: u16,
    pub duration: u64,
    pub timestamp: u64,
    pub result: u32,
    pub stack_depth: u16,
    pub details_size: u32,
    pub extra_details_offset: u32,
}

impl EventHeader {
    pub const LEN: usize = 0x34;

    const THREAD_ID: usize = 0x04;
    const CLASS: usize = 0x08;
    const OPERATION: usize = 0x0C;
    const DURATION: usize = 0x14;
    const TIMESTAMP: usize = 0x1C;
    const RESULT: usize = 0x24;
    const STACK_DEPTH: usize = 0x28;
    const DETAILS_SIZE: usize = 0x2C;
    const EXTRA_DETAILS_OFFSET: usize = 0x30;

    #[must_use]
    pub fn decode(buf: &[u8; Self::LEN]) -> Self {
        Self {
            process_index: get_u32(buf, 0),
            thread_id: get_u32(buf, Self::THREAD_ID),
            class: get_u32(buf, Self::CLASS),
            operation: get_u16(buf, Self::OPERATION),
            duration: get_u64(buf, Self::DURATION),
            timestamp: get_u64(buf, Self::TIMESTAMP),
            result: get_u32(buf, Self::RESULT),
            stack_depth: get_u16(buf, Self::STACK_DEPTH),
            details_size: get_u32(buf, Self::DETAILS_SIZE),
            extra_details_offset: get_u32(buf, Self::EXTRA_DETAILS_OFFSET),
        }
    }

    pub fn encode(&self, buf: &mut [u8; Self::LEN]) {
        buf.fill(0);
        put_u32(buf, 0, self.process_index);
        put_u32(buf, Self::THREAD_ID, self.thread_id);
        put_u32(buf, Self::CLASS, self.class);
        put_u16(buf, Self::OPERATION, self.operation);
        put_u64(buf, Self::DURATION, self.duration);
        put_u64(buf, Self::TIMESTAMP, self.timestamp);
        put_u32(buf, Self::RESULT, self.result);
        put_u16(buf, Self::STACK_DEPTH, self.stack_depth);
        put_u32(buf, Self::DETAILS_SIZE, self.details_size);
        put_u32(buf, Self::EXTRA_DETAILS_OFFSET, self.extra_details_offset);
    }

    /// Bytes occupied by the stack that follows the header.
    #[must_use]
    pub fn stack_len(&self) -> usize {
        usize::from(self.stack_depth) * POINTER_SIZE
    }
}

// ============================================================================
// Process Table
// ============================================================================

/// Fixed part of a process table entry.
///
/// **Layout** (string fields are indices into the string table):
///
/// | Offset | Size | Field                           |
/// |--------|------|---------------------------------|
/// | `0x00` | 4    | process index                   |
/// | `0x04` | 4    | process id                      |
/// | `0x08` | 4    | parent process id               |
/// | `0x0C` | 4    | parent process index            |
/// | `0x10` | 8    | authentication id (skipped)     |
/// | `0x18` | 4    | session                         |
/// | `0x1C` | 4    | reserved                        |
/// | `0x20` | 8    | start time, FILETIME            |
/// | `0x28` | 8    | end time, FILETIME              |
/// | `0x30` | 8    | virtualized / 64-bit flags      |
/// | `0x38` | 4    | integrity string (skipped)      |
/// | `0x3C` | 4    | user string (skipped)           |
/// | `0x40` | 4    | process name string             |
/// | `0x44` | 4    | image path string               |
/// | `0x48` | 4    | command line string             |
/// | `0x4C` | 0x1C | company .. icons, pointer       |
/// | `0x68` | 4    | module count                    |
///
/// `module_count` [`ModuleRecord`]s follow immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessRecord {
    pub process_index: u32,
    pub process_id: u32,
    pub parent_process_id: u32,
    pub session: u32,
    pub start_time: u64,
    pub end_time: u64,
    pub name: u32,
    pub image_path: u32,
    pub command_line: u32,
    pub module_count: u32,
}

impl ProcessRecord {
    pub const LEN: usize = 0x6C;

    const PROCESS_ID: usize = 0x04;
    const PARENT_PROCESS_ID: usize = 0x08;
    const SESSION: usize = 0x18;
    const START_TIME: usize = 0x20;
    const END_TIME: usize = 0x28;
    const NAME: usize = 0x40;
    const IMAGE_PATH: usize = 0x44;
    const COMMAND_LINE: usize = 0x48;
    const MODULE_COUNT: usize = 0x68;

    #[must_use]
    pub fn decode(buf: &[u8; Self::LEN]) -> Self {
        Self {
            process_index: get_u32(buf, 0),
            process_id: get_u32(buf, Self::PROCESS_ID),
            parent_process_id: get_u32(buf, Self::PARENT_PROCESS_ID),
            session: get_u32(buf, Self::SESSION),
            start_time: get_u64(buf, Self::START_TIME),
            end_time: get_u64(buf, Self::END_TIME),
            name: get_u32(buf, Self::NAME),
            image_path: get_u32(buf, Self::IMAGE_PATH),
            command_line: get_u32(buf, Self::COMMAND_LINE),
            module_count: get_u32(buf, Self::MODULE_COUNT),
        }
    }

    pub fn encode(&self, buf: &mut [u8; Self::LEN]) {
        buf.fill(0);
        put_u32(buf, 0, self.process_index);
        put_u32(buf, Self::PROCESS_ID, self.process_id);
        put_u32(buf, Self::PARENT_PROCESS_ID, self.parent_process_id);
        put_u32(buf, Self::SESSION, self.session);
        put_u64(buf, Self::START_TIME, self.start_time);
        put_u64(buf, Self::END_TIME, self.end_time);
        put_u32(buf, Self::NAME, self.name);
        put_u32(buf, Self::IMAGE_PATH, self.image_path);
        put_u32(buf, Self::COMMAND_LINE, self.command_line);
        put_u32(buf, Self::MODULE_COUNT, self.module_count);
    }
}

/// A module loaded in a process.
///
/// **Layout**:
///
/// | Offset | Size | Field                         |
/// |--------|------|-------------------------------|
/// | `0x00` | 8    | reserved pointer              |
/// | `0x08` | 8    | base address                  |
/// | `0x10` | 4    | image size                    |
/// | `0x14` | 4    | image path string             |
/// | `0x18` | 4    | version string (skipped)      |
/// | `0x1C` | 4    | company string (skipped)      |
/// | `0x20` | 4    | description string (skipped)  |
/// | `0x24` | 4    | link timestamp                |
/// | `0x28` | 0x18 | reserved                      |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModuleRecord {
    pub base: u64,
    pub size: u32,
    pub image_path: u32,
    pub timestamp: u32,
}

impl ModuleRecord {
    pub const LEN: usize = 0x40;

    const BASE: usize = 0x08;
    const SIZE: usize = 0x10;
    const IMAGE_PATH: usize = 0x14;
    const TIMESTAMP: usize = 0x24;

    #[must_use]
    pub fn decode(buf: &[u8; Self::LEN]) -> Self {
        Self {
            base: get_u64(buf, Self::BASE),
            size: get_u32(buf, Self::SIZE),
            image_path: get_u32(buf, Self::IMAGE_PATH),
            timestamp: get_u32(buf, Self::TIMESTAMP),
        }
    }

    pub fn encode(&self, buf: &mut [u8; Self::LEN]) {
        buf.fill(0);
        put_u64(buf, Self::BASE, self.base);
        put_u32(buf, Self::SIZE, self.size);
        put_u32(buf, Self::IMAGE_PATH, self.image_path);
        put_u32(buf, Self::TIMESTAMP, self.timestamp);
    }
}

// ============================================================================
// File System Detail
// ============================================================================

/// Prefix shared by every file system detail payload.
///
/// **Layout**:
///
/// | Offset | Size | Field                                         |
/// |--------|------|-----------------------------------------------|
/// | `0x00` | 1    | sub-operation                                 |
/// | `0x01` | 3    | reserved                                      |
/// | `0x04` | 0x28 | five reserved pointers                        |
/// | `0x2C` | 2    | path info: bit 15 = ASCII, bits 0..15 = chars |
/// | `0x2E` | 2    | reserved                                      |
///
/// The path follows (`chars` bytes if ASCII, else `chars * 2` UTF-16 bytes),
/// then the operation-specific tail.
pub const FS_DETAIL_PREFIX_LEN: usize = 0x30;
pub const FS_DETAIL_PATH_INFO: usize = 0x2C;

/// Flag bit in a detail string's info word marking single-byte characters.
pub const DETAIL_STRING_ASCII: u16 = 0x8000;

/// Read/write tail that follows the path of a `ReadFile`/`WriteFile` detail.
///
/// **Layout**: `io_flags u32 @0x00`, `priority u32 @0x04`, `length u32
/// @0x08`, reserved `u32 @0x0C`, `offset i64 @0x10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadWriteTail {
    pub io_flags: u32,
    pub priority: u32,
    pub length: u32,
    pub offset: i64,
}

impl ReadWriteTail {
    pub const LEN: usize = 0x18;

    #[must_use]
    pub fn decode(buf: &[u8; Self::LEN]) -> Self {
        Self {
            io_flags: get_u32(buf, 0x00),
            priority: get_u32(buf, 0x04),
            length: get_u32(buf, 0x08),
            offset: i64::from_le_bytes(get_u64(buf, 0x10).to_le_bytes()),
        }
    }

    pub fn encode(&self, buf: &mut [u8; Self::LEN]) {
        buf.fill(0);
        put_u32(buf, 0x00, self.io_flags);
        put_u32(buf, 0x04, self.priority);
        put_u32(buf, 0x08, self.length);
        buf[0x10..0x18].copy_from_slice(&self.offset.to_le_bytes());
    }
}

// ============================================================================
// Baked File
// ============================================================================

/// Header written uncompressed at the start of every baked file.
pub const BAKED_MAGIC: &[u8] = b"PMLBAKED:1->";

/// One symbolicated frame in a baked file.
///
/// **Layout**:
///
/// | Offset | Size | Field                                            |
/// |--------|------|--------------------------------------------------|
/// | `0x00` | 4    | frame type (0 = kernel, 1 = user, 2 = managed)   |
/// | `0x04` | 4    | module string index                              |
/// | `0x08` | 4    | symbol string index (0 = no symbol)              |
/// | `0x0C` | 8    | offset into the symbol, or the raw address       |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BakedFrameRecord {
    pub frame_type: u32,
    pub module: u32,
    pub symbol: u32,
    pub address_or_offset: u64,
}

impl BakedFrameRecord {
    pub const LEN: usize = 20;

    #[must_use]
    pub fn decode(buf: &[u8; Self::LEN]) -> Self {
        Self {
            frame_type: get_u32(buf, 0x00),
            module: get_u32(buf, 0x04),
            symbol: get_u32(buf, 0x08),
            address_or_offset: get_u64(buf, 0x0C),
        }
    }

    pub fn encode(&self, buf: &mut [u8; Self::LEN]) {
        put_u32(buf, 0x00, self.frame_type);
        put_u32(buf, 0x04, self.module);
        put_u32(buf, 0x08, self.symbol);
        put_u64(buf, 0x0C, self.address_or_offset);
    }
}
