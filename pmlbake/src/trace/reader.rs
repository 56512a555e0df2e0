//! Streaming decoder for the trace container.
//!
//! Opening a trace reads the header, the event-offset index, the string table
//! and the process table up front. Events are decoded lazily, one record at a
//! time, by seeking through the precomputed offset index.

use super::detail::decode_detail;
use super::event::{EventFilter, TraceEvent};
use super::process::{share_kernel_modules, Module, Process};
use crate::domain::{EventClass, FileTime, TraceError};
use log::{debug, info};
use pmlbake_common::{
    le_u32, le_u64, EventHeader, EventOffsetEntry, FileHeader, ModuleRecord, ProcessRecord,
    PML_MAGIC, PML_VERSION, POINTER_SIZE,
};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// Bounds-checked positional reads over the underlying stream.
///
/// Jumps relative to the current position go through
/// [`BufReader::seek_relative`], which keeps the buffered bytes when the
/// target is already inside them.
struct Source<R> {
    inner: BufReader<R>,
    len: u64,
    pos: u64,
}

impl<R: Read + Seek> Source<R> {
    fn new(stream: R) -> Result<Self, TraceError> {
        let mut inner = BufReader::new(stream);
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self { inner, len, pos: 0 })
    }

    fn seek_to(&mut self, offset: u64) -> Result<(), TraceError> {
        if self.pos == offset {
            return Ok(());
        }
        let delta = if self.pos == u64::MAX {
            None
        } else {
            let to = i64::try_from(offset).ok();
            let from = i64::try_from(self.pos).ok();
            to.zip(from).map(|(to, from)| to - from)
        };
        match delta {
            Some(delta) => self.inner.seek_relative(delta)?,
            None => {
                self.inner.seek(SeekFrom::Start(offset))?;
            }
        }
        Ok(())
    }

    fn check_bounds(
        &self,
        offset: u64,
        count: usize,
        what: &'static str,
    ) -> Result<(), TraceError> {
        let end = u64::try_from(count).ok().and_then(|count| offset.checked_add(count));
        match end {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(TraceError::Format {
                what,
                offset,
                reason: format!("{count} bytes run past the end of the file (0x{:x})", self.len),
            }),
        }
    }

    fn read_at(
        &mut self,
        offset: u64,
        buf: &mut [u8],
        what: &'static str,
    ) -> Result<(), TraceError> {
        self.check_bounds(offset, buf.len(), what)?;
        self.seek_to(offset)?;
        // Unknown until the read succeeds.
        self.pos = u64::MAX;
        self.inner.read_exact(buf)?;
        self.pos = offset + buf.len() as u64;
        Ok(())
    }

    fn read_vec_at(
        &mut self,
        offset: u64,
        count: usize,
        what: &'static str,
    ) -> Result<Vec<u8>, TraceError> {
        // Checked before allocating so a corrupt count cannot request gigabytes.
        self.check_bounds(offset, count, what)?;
        let mut buf = vec![0u8; count];
        self.read_at(offset, &mut buf, what)?;
        Ok(buf)
    }

    fn read_u32_at(&mut self, offset: u64, what: &'static str) -> Result<u32, TraceError> {
        let mut buf = [0u8; 4];
        self.read_at(offset, &mut buf, what)?;
        Ok(le_u32(&buf))
    }

    fn read_u32_array(
        &mut self,
        offset: u64,
        count: u32,
        what: &'static str,
    ) -> Result<Vec<u32>, TraceError> {
        let bytes = self.read_vec_at(offset, count as usize * 4, what)?;
        Ok(bytes.chunks_exact(4).map(le_u32).collect())
    }
}

/// Decoder for one trace file. Owns its stream exclusively; scans borrow
/// the reader mutably, so two scans can never interleave.
pub struct TraceReader<R = File> {
    source: Source<R>,
    header: FileHeader,
    event_offsets: Vec<EventOffsetEntry>,
    strings: Vec<String>,
    processes: Vec<Process>,
    process_slots: HashMap<u32, usize>,
}

impl TraceReader<File> {
    /// Open a trace file from disk.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or fails validation
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let path = path.as_ref();
        info!("Opening trace {}", path.display());
        Self::new(File::open(path)?)
    }
}

impl<R: Read + Seek> TraceReader<R> {
    /// Decode the header and tables of a trace held by `stream`. The stream
    /// is buffered internally.
    ///
    /// # Errors
    /// - Wrong magic, version or bitness
    /// - An event-offset index that does not start at the event data
    ///   (the capture was not flushed)
    /// - Any table that runs past the end of the file or is malformed
    pub fn new(stream: R) -> Result<Self, TraceError> {
        let mut source = Source::new(stream)?;

        let header = read_header(&mut source)?;
        let event_offsets = read_event_offsets(&mut source, &header)?;
        let strings = read_string_table(&mut source, header.string_table_offset)?;
        let mut processes =
            read_process_table(&mut source, header.process_table_offset, &strings)?;
        share_kernel_modules(&mut processes);

        let process_slots =
            processes.iter().enumerate().map(|(slot, process)| (process.index, slot)).collect();

        info!(
            "Trace has {} events, {} processes, {} strings",
            header.event_count,
            processes.len(),
            strings.len()
        );

        Ok(Self { source, header, event_offsets, strings, processes, process_slots })
    }

    #[must_use]
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    #[must_use]
    pub fn event_count(&self) -> u32 {
        self.header.event_count
    }

    #[must_use]
    pub fn processes(&self) -> &[Process] {
        &self.processes
    }

    /// Look up a process by the index events refer to it with.
    #[must_use]
    pub fn process_by_index(&self, index: u32) -> Option<&Process> {
        self.process_slots.get(&index).map(|&slot| &self.processes[slot])
    }

    #[must_use]
    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    /// Decode the event at `index`, regardless of the filter's class
    /// selection. Never-captured slots come back as gap events.
    ///
    /// # Errors
    /// Returns an error if `index` is out of range or the record is malformed
    pub fn event_at(
        &mut self,
        index: u32,
        filter: &EventFilter,
    ) -> Result<TraceEvent, TraceError> {
        if index >= self.event_count() {
            return Err(TraceError::EventOutOfRange { index, count: self.event_count() });
        }
        let unfiltered = EventFilter { classes: None, require_stack: false, ..filter.clone() };
        Ok(self.read_event(index, &unfiltered)?.unwrap_or_else(|| TraceEvent::gap(index)))
    }

    /// Lazily decode events from `start_index` onwards.
    ///
    /// Events the filter rejects and never-captured slots are skipped. The
    /// iterator stops at the first error.
    pub fn select_events(&mut self, filter: EventFilter, start_index: u32) -> Events<'_, R> {
        Events { reader: self, filter, next: start_index, failed: false }
    }

    /// `Ok(None)` when the slot is a gap or the filter rejects the event.
    fn read_event(
        &mut self,
        index: u32,
        filter: &EventFilter,
    ) -> Result<Option<TraceEvent>, TraceError> {
        let entry = self.event_offsets[index as usize];
        if entry.offset == 0 {
            return Ok(None);
        }
        let offset = u64::from(entry.offset);

        let mut buf = [0u8; EventHeader::LEN];
        self.source.read_at(offset, &mut buf, "event header")?;
        let header = EventHeader::decode(&buf);

        let class = EventClass::from_u32(header.class);
        if !filter.accepts_class(class) || (filter.require_stack && header.stack_depth == 0) {
            return Ok(None);
        }

        let stack_offset = offset + EventHeader::LEN as u64;
        let frames = if filter.stacks && header.stack_depth > 0 {
            self.source
                .read_vec_at(stack_offset, header.stack_len(), "event stack")?
                .chunks_exact(POINTER_SIZE)
                .map(le_u64)
                .collect()
        } else {
            Vec::new()
        };

        let detail = if filter.details && header.details_size > 0 {
            let detail_offset = stack_offset + header.stack_len() as u64;
            let raw = self.source.read_vec_at(
                detail_offset,
                header.details_size as usize,
                "event detail",
            )?;
            Some(decode_detail(class, header.operation, raw, detail_offset)?)
        } else {
            None
        };

        let process_id = match self.process_by_index(header.process_index) {
            Some(process) => process.id,
            None => {
                debug!("Event {index} refers to unknown process index {}", header.process_index);
                0
            }
        };

        Ok(Some(TraceEvent {
            sequence: index,
            process_index: header.process_index,
            process_id,
            thread_id: header.thread_id,
            class,
            operation: header.operation,
            capture_time: FileTime(header.timestamp),
            result: header.result,
            duration: header.duration,
            frames,
            detail,
        }))
    }
}

/// Forward-only iterator returned by [`TraceReader::select_events`].
pub struct Events<'a, R> {
    reader: &'a mut TraceReader<R>,
    filter: EventFilter,
    next: u32,
    failed: bool,
}

impl<R: Read + Seek> Iterator for Events<'_, R> {
    type Item = Result<TraceEvent, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        while self.next < self.reader.event_count() {
            let index = self.next;
            self.next += 1;
            match self.reader.read_event(index, &self.filter) {
                Ok(Some(event)) => return Some(Ok(event)),
                Ok(None) => {}
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

fn read_header<R: Read + Seek>(source: &mut Source<R>) -> Result<FileHeader, TraceError> {
    let mut buf = [0u8; FileHeader::LEN];
    source.read_at(0, &mut buf, "file header")?;
    let header = FileHeader::decode(&buf);

    if header.magic != PML_MAGIC {
        return Err(TraceError::BadMagic(header.magic));
    }
    if header.version != PML_VERSION {
        return Err(TraceError::UnsupportedVersion { found: header.version, expected: PML_VERSION });
    }
    if header.is_64bit != 1 {
        return Err(TraceError::Not64Bit);
    }
    Ok(header)
}

fn read_event_offsets<R: Read + Seek>(
    source: &mut Source<R>,
    header: &FileHeader,
) -> Result<Vec<EventOffsetEntry>, TraceError> {
    let count = header.event_count as usize;
    let bytes = source.read_vec_at(
        header.event_offsets_offset,
        count * EventOffsetEntry::LEN,
        "event offset index",
    )?;

    let entries: Vec<EventOffsetEntry> = bytes
        .chunks_exact(EventOffsetEntry::LEN)
        .map(|chunk| {
            let mut slot = [0u8; EventOffsetEntry::LEN];
            slot.copy_from_slice(chunk);
            EventOffsetEntry::decode(&slot)
        })
        .collect();

    if let Some(first) = entries.first() {
        if u64::from(first.offset) != header.events_offset {
            return Err(TraceError::IncompleteCapture {
                first: u64::from(first.offset),
                declared: header.events_offset,
            });
        }
    }
    Ok(entries)
}

fn read_string_table<R: Read + Seek>(
    source: &mut Source<R>,
    table_offset: u64,
) -> Result<Vec<String>, TraceError> {
    let count = source.read_u32_at(table_offset, "string table")?;
    let offsets = source.read_u32_array(table_offset + 4, count, "string offsets")?;

    let mut strings = Vec::with_capacity(offsets.len());
    for relative in offsets {
        let at = table_offset + u64::from(relative);
        let size = source.read_u32_at(at, "string length")?;
        // The empty string stores a zero length and no terminator.
        if size == 0 {
            strings.push(String::new());
            continue;
        }
        let bytes = source.read_vec_at(at + 4, size as usize, "string")?;
        strings.push(decode_utf16z(&bytes).ok_or_else(|| TraceError::Format {
            what: "string",
            offset: at,
            reason: "not valid UTF-16".to_string(),
        })?);
    }
    Ok(strings)
}

/// Decode NUL-terminated UTF-16LE.
fn decode_utf16z(bytes: &[u8]) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    String::from_utf16(&units).ok()
}

fn lookup_string(strings: &[String], index: u32, offset: u64) -> Result<String, TraceError> {
    strings.get(index as usize).cloned().ok_or_else(|| TraceError::Format {
        what: "process table",
        offset,
        reason: format!("string index {index} out of range ({} strings)", strings.len()),
    })
}

fn read_process_table<R: Read + Seek>(
    source: &mut Source<R>,
    table_offset: u64,
    strings: &[String],
) -> Result<Vec<Process>, TraceError> {
    let count = source.read_u32_at(table_offset, "process table")?;
    let indices = source.read_u32_array(table_offset + 4, count, "process indices")?;
    let offsets =
        source.read_u32_array(table_offset + 4 + u64::from(count) * 4, count, "process offsets")?;

    let mut processes = Vec::with_capacity(indices.len());
    for (&index, &relative) in indices.iter().zip(&offsets) {
        let at = table_offset + u64::from(relative);
        let mut buf = [0u8; ProcessRecord::LEN];
        source.read_at(at, &mut buf, "process record")?;
        let record = ProcessRecord::decode(&buf);
        if record.process_index != index {
            return Err(TraceError::Format {
                what: "process record",
                offset: at,
                reason: format!(
                    "record claims index {} but the table lists {index}",
                    record.process_index
                ),
            });
        }

        let modules_offset = at + ProcessRecord::LEN as u64;
        let module_bytes = source.read_vec_at(
            modules_offset,
            record.module_count as usize * ModuleRecord::LEN,
            "module records",
        )?;
        let mut modules = Vec::with_capacity(record.module_count as usize);
        for chunk in module_bytes.chunks_exact(ModuleRecord::LEN) {
            let mut slot = [0u8; ModuleRecord::LEN];
            slot.copy_from_slice(chunk);
            let module = ModuleRecord::decode(&slot);
            modules.push(Module {
                base: module.base,
                size: module.size,
                image_path: lookup_string(strings, module.image_path, modules_offset)?,
            });
        }

        processes.push(Process {
            index,
            id: record.process_id,
            parent_id: record.parent_process_id,
            name: lookup_string(strings, record.name, at)?,
            image_path: lookup_string(strings, record.image_path, at)?,
            command_line: lookup_string(strings, record.command_line, at)?,
            modules,
        });
    }
    Ok(processes)
}
