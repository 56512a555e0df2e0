//! Synthetic trace builder shared by the integration tests.
//!
//! Lays out a complete 64-bit trace container in memory using the record
//! codecs from `pmlbake-common`: header, event data, event-offset index,
//! string table and process table, in that order.

#![allow(dead_code)]

use pmlbake_common::{
    EventHeader, EventOffsetEntry, FileHeader, ModuleRecord, ProcessRecord, ReadWriteTail,
    CLASS_FILE_SYSTEM, DETAIL_STRING_ASCII, FS_DETAIL_PATH_INFO, FS_DETAIL_PREFIX_LEN,
    PML_MAGIC, PML_VERSION,
};
use std::path::{Path, PathBuf};

/// FILETIME of 1970-01-01T00:00:00Z.
pub const UNIX_EPOCH_TICKS: u64 = 116_444_736_000_000_000;

pub const KERNEL_BASE: u64 = 0xFFFF_F800_0000_0000;
pub const APP_BASE: u64 = 0x7FF6_0000_0000;
pub const KERNEL_IMAGE: &str = "C:\\Windows\\system32\\ntoskrnl.exe";
pub const APP_IMAGE: &str = "C:\\Apps\\app.exe";

pub struct ModuleSpec {
    pub base: u64,
    pub size: u32,
    pub image_path: String,
}

pub struct ProcessSpec {
    pub index: u32,
    pub pid: u32,
    pub name: String,
    pub image_path: String,
    pub modules: Vec<ModuleSpec>,
}

#[derive(Clone)]
pub struct EventSpec {
    pub process_index: u32,
    pub thread_id: u32,
    pub class: u32,
    pub operation: u16,
    pub timestamp: u64,
    pub frames: Vec<u64>,
    pub detail: Vec<u8>,
}

impl EventSpec {
    pub fn new(process_index: u32) -> Self {
        Self {
            process_index,
            thread_id: 1,
            class: CLASS_FILE_SYSTEM,
            operation: 0,
            timestamp: UNIX_EPOCH_TICKS,
            frames: Vec::new(),
            detail: Vec::new(),
        }
    }

    pub fn class(mut self, class: u32, operation: u16) -> Self {
        self.class = class;
        self.operation = operation;
        self
    }

    pub fn frames(mut self, frames: &[u64]) -> Self {
        self.frames = frames.to_vec();
        self
    }

    pub fn detail(mut self, detail: Vec<u8>) -> Self {
        self.detail = detail;
        self
    }

    pub fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

pub struct TraceBuilder {
    magic: [u8; 4],
    version: u32,
    is_64bit: u32,
    first_offset: Option<u32>,
    processes: Vec<ProcessSpec>,
    events: Vec<Option<EventSpec>>,
}

impl Default for TraceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceBuilder {
    pub fn new() -> Self {
        Self {
            magic: PML_MAGIC,
            version: PML_VERSION,
            is_64bit: 1,
            first_offset: None,
            processes: Vec::new(),
            events: Vec::new(),
        }
    }

    /// The `System` process (index 0, pid 4) owning one kernel module, plus
    /// `app.exe` (index 1, pid 1234) with its own image mapped.
    pub fn two_processes() -> Self {
        Self::new()
            .process(0, 4, "System", "System", &[(KERNEL_BASE, 0x0010_0000, KERNEL_IMAGE)])
            .process(1, 1234, "app.exe", APP_IMAGE, &[(APP_BASE, 0x0001_0000, APP_IMAGE)])
    }

    pub fn magic(mut self, magic: [u8; 4]) -> Self {
        self.magic = magic;
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn bitness_32(mut self) -> Self {
        self.is_64bit = 0;
        self
    }

    /// Overwrite the first event-offset slot, as an unflushed capture would.
    pub fn first_offset(mut self, offset: u32) -> Self {
        self.first_offset = Some(offset);
        self
    }

    pub fn process(
        mut self,
        index: u32,
        pid: u32,
        name: &str,
        image_path: &str,
        modules: &[(u64, u32, &str)],
    ) -> Self {
        self.processes.push(ProcessSpec {
            index,
            pid,
            name: name.to_string(),
            image_path: image_path.to_string(),
            modules: modules
                .iter()
                .map(|&(base, size, path)| ModuleSpec {
                    base,
                    size,
                    image_path: path.to_string(),
                })
                .collect(),
        });
        self
    }

    pub fn event(mut self, event: EventSpec) -> Self {
        self.events.push(Some(event));
        self
    }

    /// A slot that was never captured.
    pub fn gap(mut self) -> Self {
        self.events.push(None);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut strings = StringTable::default();
        let mut out = vec![0u8; FileHeader::LEN];

        // Event data.
        let events_offset = out.len() as u64;
        let mut slots = Vec::with_capacity(self.events.len());
        for event in &self.events {
            let Some(event) = event else {
                slots.push(EventOffsetEntry::default());
                continue;
            };
            slots.push(EventOffsetEntry { offset: out.len() as u32, flags: 0 });

            let header = EventHeader {
                process_index: event.process_index,
                thread_id: event.thread_id,
                class: event.class,
                operation: event.operation,
                duration: 10,
                timestamp: event.timestamp,
                result: 0,
                stack_depth: event.frames.len() as u16,
                details_size: event.detail.len() as u32,
                extra_details_offset: 0,
            };
            let mut buf = [0u8; EventHeader::LEN];
            header.encode(&mut buf);
            out.extend_from_slice(&buf);
            for frame in &event.frames {
                out.extend_from_slice(&frame.to_le_bytes());
            }
            out.extend_from_slice(&event.detail);
        }
        if let (Some(offset), Some(first)) = (self.first_offset, slots.first_mut()) {
            first.offset = offset;
        }

        // Event-offset index.
        let event_offsets_offset = out.len() as u64;
        for slot in &slots {
            let mut buf = [0u8; EventOffsetEntry::LEN];
            slot.encode(&mut buf);
            out.extend_from_slice(&buf);
        }

        // Process table; strings are interned while building it.
        let mut records = Vec::new();
        for process in &self.processes {
            let record = ProcessRecord {
                process_index: process.index,
                process_id: process.pid,
                parent_process_id: 0,
                session: 1,
                start_time: UNIX_EPOCH_TICKS,
                end_time: 0,
                name: strings.intern(&process.name),
                image_path: strings.intern(&process.image_path),
                command_line: strings.intern(&format!("\"{}\"", process.image_path)),
                module_count: process.modules.len() as u32,
            };
            let mut buf = [0u8; ProcessRecord::LEN];
            record.encode(&mut buf);
            let mut bytes = buf.to_vec();
            for module in &process.modules {
                let record = ModuleRecord {
                    base: module.base,
                    size: module.size,
                    image_path: strings.intern(&module.image_path),
                    timestamp: 0,
                };
                let mut buf = [0u8; ModuleRecord::LEN];
                record.encode(&mut buf);
                bytes.extend_from_slice(&buf);
            }
            records.push((process.index, bytes));
        }

        let process_table_offset = out.len() as u64;
        let count = records.len() as u32;
        let mut table = Vec::new();
        table.extend_from_slice(&count.to_le_bytes());
        for (index, _) in &records {
            table.extend_from_slice(&index.to_le_bytes());
        }
        let mut relative = 4 + 8 * records.len();
        for (_, bytes) in &records {
            table.extend_from_slice(&(relative as u32).to_le_bytes());
            relative += bytes.len();
        }
        for (_, bytes) in &records {
            table.extend_from_slice(bytes);
        }
        out.extend_from_slice(&table);

        let string_table_offset = out.len() as u64;
        out.extend_from_slice(&strings.encode());

        let header = FileHeader {
            magic: self.magic,
            version: self.version,
            is_64bit: self.is_64bit,
            event_count: self.events.len() as u32,
            events_offset,
            event_offsets_offset,
            process_table_offset,
            string_table_offset,
            icon_table_offset: 0,
        };
        let mut buf = [0u8; FileHeader::LEN];
        header.encode(&mut buf);
        out[..FileHeader::LEN].copy_from_slice(&buf);
        out
    }

    pub fn write_to(&self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, self.build()).expect("Failed to write trace");
        path
    }
}

/// String table with the empty string at index 0.
#[derive(Default)]
struct StringTable {
    strings: Vec<String>,
}

impl StringTable {
    fn intern(&mut self, value: &str) -> u32 {
        if self.strings.is_empty() {
            self.strings.push(String::new());
        }
        if let Some(index) = self.strings.iter().position(|s| s == value) {
            return index as u32;
        }
        self.strings.push(value.to_string());
        (self.strings.len() - 1) as u32
    }

    fn encode(&self) -> Vec<u8> {
        let count = self.strings.len();
        let mut entries = Vec::new();
        let mut offsets = Vec::with_capacity(count);
        let entries_start = 4 + 4 * count;
        for value in &self.strings {
            offsets.push((entries_start + entries.len()) as u32);
            if value.is_empty() {
                entries.extend_from_slice(&0u32.to_le_bytes());
                continue;
            }
            let units: Vec<u8> = value
                .encode_utf16()
                .chain(std::iter::once(0))
                .flat_map(u16::to_le_bytes)
                .collect();
            entries.extend_from_slice(&(units.len() as u32).to_le_bytes());
            entries.extend_from_slice(&units);
        }

        let mut out = Vec::with_capacity(entries_start + entries.len());
        out.extend_from_slice(&(count as u32).to_le_bytes());
        for offset in offsets {
            out.extend_from_slice(&offset.to_le_bytes());
        }
        out.extend_from_slice(&entries);
        out
    }
}

/// Detail payload of a file system read or write.
pub fn read_write_detail(path: &str, offset: i64, length: u32) -> Vec<u8> {
    let mut raw = vec![0u8; FS_DETAIL_PREFIX_LEN];
    let info = path.len() as u16 | DETAIL_STRING_ASCII;
    raw[FS_DETAIL_PATH_INFO..FS_DETAIL_PATH_INFO + 2].copy_from_slice(&info.to_le_bytes());
    raw.extend_from_slice(path.as_bytes());

    let tail = ReadWriteTail { io_flags: 0, priority: 0, length, offset };
    let mut buf = [0u8; ReadWriteTail::LEN];
    tail.encode(&mut buf);
    raw.extend_from_slice(&buf);
    raw
}
