//! Stack symbolication driver
//!
//! Streams the events of a trace, resolves every frame through the owning
//! process's [`SymbolCache`] and writes the result as a baked file, plus an
//! optional text mirror for eyeballing.

use super::cache::SymbolCache;
use super::managed;
use super::native::ResolverFactory;
use crate::baked::text::{display_index, write_event_end, write_event_header, write_frame};
use crate::baked::{BakedFrame, BakedWriter, TextFrame};
use crate::domain::{FrameType, SymbolError, SymbolicateError};
use crate::trace::{EventFilter, Process, TraceEvent, TraceReader};
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::{self, BufWriter, Read, Seek, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// How to run a symbolication pass.
#[derive(Debug, Clone)]
pub struct SymbolicateOptions {
    /// Directory holding `pmip_<pid>_<serial>.txt` managed symbol tables.
    pub managed_symbol_dir: PathBuf,
    /// Extra native search directories, in addition to each process's
    /// image directory and the bootstrap environment.
    pub search_paths: Vec<PathBuf>,
    /// Also write the human-readable mirror here.
    pub text_output: Option<PathBuf>,
    /// First trace sequence to consider.
    pub start_index: u32,
    pub filter: EventFilter,
}

impl SymbolicateOptions {
    /// Defaults for a trace at `trace_path`: managed tables are looked up
    /// next to the trace.
    #[must_use]
    pub fn for_trace(trace_path: &Path) -> Self {
        Self {
            managed_symbol_dir: parent_dir(trace_path).to_path_buf(),
            search_paths: Vec::new(),
            text_output: None,
            start_index: 0,
            filter: EventFilter::with_stacks(),
        }
    }
}

/// One resolved frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolDescriptor {
    pub frame_type: FrameType,
    /// Module file name or managed assembly; empty when unresolved.
    pub module: String,
    /// Empty when only the module is known.
    pub symbol: String,
    /// Distance from the symbol, or from the module base without a symbol.
    pub offset: u64,
    pub address: u64,
}

impl SymbolDescriptor {
    fn bare(address: u64) -> Self {
        Self {
            frame_type: FrameType::from_address(address),
            module: String::new(),
            symbol: String::new(),
            offset: 0,
            address,
        }
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        !self.module.is_empty()
    }

    /// Value stored in the baked record.
    #[must_use]
    pub fn address_or_offset(&self) -> u64 {
        if self.is_resolved() {
            self.offset
        } else {
            self.address
        }
    }

    fn as_baked(&self) -> BakedFrame<'_> {
        BakedFrame {
            frame_type: self.frame_type,
            module: &self.module,
            symbol: &self.symbol,
            address_or_offset: self.address_or_offset(),
        }
    }

    fn as_text(&self) -> TextFrame<'_> {
        TextFrame {
            frame_type: self.frame_type,
            module: &self.module,
            symbol: &self.symbol,
            address_or_offset: self.address_or_offset(),
            address: Some(self.address),
        }
    }
}

/// Passed to the progress callback once per symbolicated event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub sequence: u32,
    pub event_count: u32,
    pub events_done: u64,
}

/// Outcome of a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SymbolicateSummary {
    pub events: u64,
    pub frames: u64,
    pub resolved_frames: u64,
    pub managed_frames: u64,
    /// The progress callback stopped the run; nothing was written.
    pub cancelled: bool,
}

/// Owns the per-process caches for one symbolication pass.
pub struct Symbolicator<'f> {
    factory: &'f dyn ResolverFactory,
    options: SymbolicateOptions,
    caches: HashMap<u32, SymbolCache>,
}

impl<'f> Symbolicator<'f> {
    #[must_use]
    pub fn new(factory: &'f dyn ResolverFactory, options: SymbolicateOptions) -> Self {
        Self { factory, options, caches: HashMap::new() }
    }

    /// Symbolicate every selected event of `reader` into a baked file at
    /// `output`.
    ///
    /// Output goes to temporary files next to the destinations and is only
    /// moved into place when the whole pass succeeds; a cancelled or failed
    /// pass leaves existing files untouched.
    ///
    /// # Errors
    /// - Trace decoding errors
    /// - Malformed managed symbol tables
    /// - Hard native backend failures, with image path and address
    /// - Output that cannot be written
    pub fn run<R, F>(
        &mut self,
        reader: &mut TraceReader<R>,
        output: &Path,
        mut progress: F,
    ) -> Result<SymbolicateSummary, SymbolicateError>
    where
        R: Read + Seek,
        F: FnMut(&Progress) -> ControlFlow<()>,
    {
        let processes: HashMap<u32, Process> =
            reader.processes().iter().map(|process| (process.index, process.clone())).collect();
        let event_count = reader.event_count();

        let mut text = match &self.options.text_output {
            Some(path) => Some((path.clone(), BufWriter::new(temp_file_for(path)?))),
            None => None,
        };
        let mut writer = BakedWriter::new();
        let mut summary = SymbolicateSummary::default();

        let filter = self.options.filter.clone();
        for event in reader.select_events(filter, self.options.start_index) {
            let event = event?;
            if event.frames.is_empty() {
                continue;
            }
            let Some(process) = processes.get(&event.process_index).filter(|_| !event.is_gap())
            else {
                debug!("Skipping event {} of unknown process", event.sequence);
                continue;
            };

            let descriptors = self.symbolicate_event(process, &event)?;

            let frames: Vec<BakedFrame<'_>> =
                descriptors.iter().map(SymbolDescriptor::as_baked).collect();
            writer.add_event(event.sequence, &frames)?;

            if let Some((path, out)) = &mut text {
                write_text_event(out, &event, &descriptors)
                    .map_err(|source| output_error(path, source))?;
            }

            summary.events += 1;
            for descriptor in &descriptors {
                summary.frames += 1;
                summary.resolved_frames += u64::from(descriptor.is_resolved());
                summary.managed_frames += u64::from(descriptor.frame_type == FrameType::Managed);
            }

            let step =
                Progress { sequence: event.sequence, event_count, events_done: summary.events };
            if progress(&step).is_break() {
                info!("Symbolication cancelled at event {}", event.sequence);
                summary.cancelled = true;
                return Ok(summary);
            }
        }
        writer.pad_to(event_count);

        let baked_tmp = writer
            .finish(BufWriter::new(temp_file_for(output)?))?
            .into_inner()
            .map_err(|e| output_error(output, e.into_error()))?;

        let text_tmp = match text {
            Some((path, out)) => {
                let file = out.into_inner().map_err(|e| output_error(&path, e.into_error()))?;
                Some((path, file))
            }
            None => None,
        };

        baked_tmp.persist(output).map_err(|e| output_error(output, e.error))?;
        if let Some((path, file)) = text_tmp {
            file.persist(&path).map_err(|e| output_error(&path, e.error))?;
        }

        info!(
            "Symbolicated {} events, {} frames ({} resolved, {} managed)",
            summary.events, summary.frames, summary.resolved_frames, summary.managed_frames
        );
        Ok(summary)
    }

    /// Resolve the frames of one event in stored order.
    ///
    /// # Errors
    /// Returns an error if the process's cache cannot be set up or a hard
    /// native failure occurs
    pub fn symbolicate_event(
        &mut self,
        process: &Process,
        event: &TraceEvent,
    ) -> Result<Vec<SymbolDescriptor>, SymbolicateError> {
        let event_time = event.capture_time.to_utc();
        let cache = self.cache_for(process)?;
        event
            .frames
            .iter()
            .map(|&address| describe_frame(cache, process, event_time, address).map_err(Into::into))
            .collect()
    }

    /// The process's cache, created on first sight: managed tables are
    /// loaded, the image directory becomes a search path and every module
    /// is loaded.
    fn cache_for(&mut self, process: &Process) -> Result<&mut SymbolCache, SymbolicateError> {
        let slot = match self.caches.entry(process.index) {
            Entry::Occupied(slot) => return Ok(slot.into_mut()),
            Entry::Vacant(slot) => slot,
        };

        debug!("Preparing symbols for {} (pid {})", process.name, process.id);
        let mut cache = SymbolCache::new(process.id, self.factory.create(process.id));
        for table in managed::discover(&self.options.managed_symbol_dir, process.id)? {
            cache.load_managed_symbols(table);
        }
        if let Some(dir) = process.image_directory() {
            cache.add_search_path(Path::new(dir));
        }
        for dir in &self.options.search_paths {
            cache.add_search_path(dir);
        }
        for module in &process.modules {
            cache.load_module(module)?;
        }
        Ok(slot.insert(cache))
    }
}

fn describe_frame(
    cache: &mut SymbolCache,
    process: &Process,
    event_time: DateTime<Utc>,
    address: u64,
) -> Result<SymbolDescriptor, SymbolError> {
    let frame_type = FrameType::from_address(address);

    if let Some(module) = process.find_module(address) {
        let symbol = cache.try_get_native_symbol(address).map_err(|source| SymbolError::Resolve {
            image_path: module.image_path.clone(),
            address,
            source,
        })?;
        let (symbol, offset) = match symbol {
            Some(native) => (strip_suffix(&native.name).to_string(), native.offset),
            None => (String::new(), address - module.base),
        };
        return Ok(SymbolDescriptor {
            frame_type,
            module: module.name().to_string(),
            symbol,
            offset,
            address,
        });
    }

    if let Some(hit) = cache.try_get_managed_symbol(event_time, address) {
        return Ok(SymbolDescriptor {
            frame_type: FrameType::Managed,
            module: hit.assembly_name.to_string(),
            symbol: hit.symbol.to_string(),
            offset: address - hit.entry.base,
            address,
        });
    }

    Ok(SymbolDescriptor::bare(address))
}

/// Drop a `$##...` suffix some native symbol names carry.
fn strip_suffix(name: &str) -> &str {
    name.find("$##").map_or(name, |cut| &name[..cut])
}

fn write_text_event<W: Write>(
    out: &mut W,
    event: &TraceEvent,
    descriptors: &[SymbolDescriptor],
) -> io::Result<()> {
    write_event_header(out, u64::from(event.sequence), Some(event.capture_time))?;
    for (position, descriptor) in descriptors.iter().enumerate() {
        write_frame(out, display_index(descriptors.len(), position), &descriptor.as_text())?;
    }
    write_event_end(out)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn output_error(path: &Path, source: io::Error) -> SymbolicateError {
    SymbolicateError::Output { path: path.to_path_buf(), source }
}

/// Temporary file in the destination's directory, so the final rename never
/// crosses file systems.
fn temp_file_for(destination: &Path) -> Result<NamedTempFile, SymbolicateError> {
    NamedTempFile::new_in(parent_dir(destination))
        .map_err(|source| output_error(destination, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventClass, FileTime, ResolverError};
    use crate::symbolization::native::{NativeSymbol, NativeSymbolResolver, NoopResolverFactory};
    use crate::trace::Module;

    struct OneSymbol;

    impl NativeSymbolResolver for OneSymbol {
        fn load_module(&mut self, _: &str, _: u64, _: u32) -> Result<(), ResolverError> {
            Ok(())
        }

        fn resolve_address(&mut self, address: u64) -> Result<NativeSymbol, ResolverError> {
            match address {
                0x1_0000..=0x1_0fff => Ok(NativeSymbol {
                    name: "main$##12".to_string(),
                    offset: address - 0x1_0000,
                }),
                0x1_2000 => Err(ResolverError::Io(std::io::Error::other("backend gone"))),
                _ => Err(ResolverError::InvalidAddress(address)),
            }
        }

        fn add_search_path(&mut self, _: &Path) {}
    }

    struct OneSymbolFactory;

    impl ResolverFactory for OneSymbolFactory {
        fn create(&self, _: u32) -> Box<dyn NativeSymbolResolver> {
            Box::new(OneSymbol)
        }
    }

    fn process() -> Process {
        Process {
            index: 1,
            id: 4242,
            parent_id: 0,
            name: "app.exe".to_string(),
            image_path: "C:\\Apps\\app.exe".to_string(),
            command_line: String::new(),
            modules: vec![Module {
                base: 0x1_0000,
                size: 0x4000,
                image_path: "C:\\Apps\\app.exe".to_string(),
            }],
        }
    }

    fn event(frames: Vec<u64>) -> TraceEvent {
        TraceEvent {
            sequence: 0,
            process_index: 1,
            process_id: 4242,
            thread_id: 1,
            class: EventClass::FileSystem,
            operation: 0,
            capture_time: FileTime(0),
            result: 0,
            duration: 0,
            frames,
            detail: None,
        }
    }

    fn options() -> SymbolicateOptions {
        SymbolicateOptions::for_trace(Path::new("/nonexistent/capture.pml"))
    }

    #[test]
    fn test_frame_resolution_order() {
        let factory = OneSymbolFactory;
        let mut symbolicator = Symbolicator::new(&factory, options());

        let kernel = 0xffff_f800_0000_1000;
        let frames = symbolicator
            .symbolicate_event(&process(), &event(vec![0x1_0010, 0x1_3000, kernel]))
            .unwrap();

        assert_eq!(frames[0].module, "app.exe");
        assert_eq!(frames[0].symbol, "main");
        assert_eq!(frames[0].offset, 0x10);
        assert_eq!(frames[0].frame_type, FrameType::User);

        assert_eq!(frames[1].module, "app.exe");
        assert_eq!(frames[1].symbol, "");
        assert_eq!(frames[1].address_or_offset(), 0x3000);

        assert!(!frames[2].is_resolved());
        assert_eq!(frames[2].frame_type, FrameType::Kernel);
        assert_eq!(frames[2].address_or_offset(), kernel);
    }

    #[test]
    fn test_hard_resolve_failure_carries_context() {
        let factory = OneSymbolFactory;
        let mut symbolicator = Symbolicator::new(&factory, options());

        let err = symbolicator.symbolicate_event(&process(), &event(vec![0x1_2000])).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("app.exe"), "{message}");
        assert!(message.contains("0x12000"), "{message}");
    }

    #[test]
    fn test_noop_backend_keeps_module_offsets() {
        let factory = NoopResolverFactory;
        let mut symbolicator = Symbolicator::new(&factory, options());

        let frames = symbolicator.symbolicate_event(&process(), &event(vec![0x1_0010])).unwrap();
        assert_eq!(frames[0].module, "app.exe");
        assert_eq!(frames[0].symbol, "");
        assert_eq!(frames[0].offset, 0x10);
    }

    #[test]
    fn test_strip_suffix() {
        assert_eq!(strip_suffix("memcpy$##0001"), "memcpy");
        assert_eq!(strip_suffix("memcpy"), "memcpy");
        assert_eq!(strip_suffix("a$b"), "a$b");
    }

    #[test]
    fn test_text_mirror_numbering() {
        let descriptors = vec![
            SymbolDescriptor {
                frame_type: FrameType::User,
                module: "app.exe".to_string(),
                symbol: "main".to_string(),
                offset: 0x10,
                address: 0x1_0010,
            },
            SymbolDescriptor::bare(0xffff_f800_0000_1000),
        ];
        let mut out = Vec::new();
        write_text_event(&mut out, &event(Vec::new()), &descriptors).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Event #0 at 1970-01-01T00:00:00.0000000Z\n\
             \x20   1 U [app.exe] main + 0x10 (0x10010)\n\
             \x20   0 K 0xfffff80000001000\n\n"
        );
    }
}
