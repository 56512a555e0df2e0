mod common;

use chrono::{Duration, Utc};
use common::{EventSpec, TraceBuilder, APP_BASE, APP_IMAGE, KERNEL_BASE, KERNEL_IMAGE};
use pmlbake::baked::BakedFile;
use pmlbake::domain::{FileTime, FrameType, ResolverError, SymbolicateError};
use pmlbake::symbolization::{
    NativeSymbol, NativeSymbolResolver, NoopResolverFactory, ResolverFactory, SymbolicateOptions,
    Symbolicator,
};
use pmlbake::trace::TraceReader;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

const MANAGED_BASE: u64 = 0x01E0_E1AC_1000;
const MAIN_START: u64 = APP_BASE + 0x1000;

/// Knows one function, `main`, in the first page of app.exe's code.
struct AppSymbols;

impl NativeSymbolResolver for AppSymbols {
    fn load_module(&mut self, _: &str, _: u64, _: u32) -> Result<(), ResolverError> {
        Ok(())
    }

    fn resolve_address(&mut self, address: u64) -> Result<NativeSymbol, ResolverError> {
        if (MAIN_START..MAIN_START + 0x1000).contains(&address) {
            Ok(NativeSymbol { name: "main$##3".to_string(), offset: address - MAIN_START })
        } else {
            Err(ResolverError::InvalidAddress(address))
        }
    }

    fn add_search_path(&mut self, _: &Path) {}
}

struct AppSymbolsFactory;

impl ResolverFactory for AppSymbolsFactory {
    fn create(&self, _: u32) -> Box<dyn NativeSymbolResolver> {
        Box::new(AppSymbols)
    }
}

struct Workspace {
    _dir: tempfile::TempDir,
    trace: PathBuf,
    baked: PathBuf,
    text: PathBuf,
}

impl Workspace {
    fn new(builder: &TraceBuilder) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let trace = builder.write_to(dir.path(), "capture.pml");
        let baked = dir.path().join("capture.pmlbaked");
        let text = dir.path().join("capture.txt");
        Self { _dir: dir, trace, baked, text }
    }

    fn dir(&self) -> &Path {
        self.trace.parent().unwrap()
    }

    fn write_managed_table(&self, name: &str, body: &str) {
        std::fs::write(self.dir().join(name), format!("UnityMixedCallstacks:1.0\n{body}")).unwrap();
    }

    fn options(&self) -> SymbolicateOptions {
        let mut options = SymbolicateOptions::for_trace(&self.trace);
        options.text_output = Some(self.text.clone());
        options
    }

    fn run(
        &self,
        factory: &dyn ResolverFactory,
        options: SymbolicateOptions,
    ) -> Result<pmlbake::symbolization::SymbolicateSummary, SymbolicateError> {
        let mut reader = TraceReader::open(&self.trace).unwrap();
        Symbolicator::new(factory, options).run(&mut reader, &self.baked, |_| {
            ControlFlow::Continue(())
        })
    }
}

/// Capture time a day ahead, so managed tables written by the test predate it.
fn tomorrow() -> u64 {
    FileTime::from_utc(Utc::now() + Duration::days(1)).0
}

fn sample_trace(timestamp: u64) -> TraceBuilder {
    TraceBuilder::two_processes()
        .event(EventSpec::new(1).at(timestamp).frames(&[APP_BASE + 0x1234, KERNEL_BASE + 0x1000]))
        .gap()
        .event(EventSpec::new(1).at(timestamp))
        .event(EventSpec::new(1).at(timestamp).frames(&[MANAGED_BASE + 0x10, 0x1000]))
}

#[test]
fn test_bake_with_native_and_managed_symbols() {
    let time = tomorrow();
    let workspace = Workspace::new(&sample_trace(time));
    workspace.write_managed_table(
        "pmip_1234_1.txt",
        "000001E0E1AC1000;000001E0E1AC1067;[UnityEngine.CoreModule] UnityEngine.Object:Destroy (int)\n",
    );

    let summary = workspace.run(&AppSymbolsFactory, workspace.options()).expect("bake succeeds");
    assert!(!summary.cancelled);
    assert_eq!(summary.events, 2);
    assert_eq!(summary.frames, 4);
    assert_eq!(summary.resolved_frames, 3);
    assert_eq!(summary.managed_frames, 1);

    let baked = BakedFile::open(&workspace.baked).unwrap();
    assert_eq!(baked.event_count(), 4, "gap and frameless events keep their slots");
    assert!(baked.frames(1).unwrap().is_empty());
    assert!(baked.frames(2).unwrap().is_empty());

    let first = baked.frames(0).unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(FrameType::from_u32(first[0].frame_type), Some(FrameType::User));
    assert_eq!(baked.string(first[0].module), Some("app.exe"));
    assert_eq!(baked.string(first[0].symbol), Some("main"));
    assert_eq!(first[0].address_or_offset, 0x234);
    assert_eq!(FrameType::from_u32(first[1].frame_type), Some(FrameType::Kernel));
    assert_eq!(baked.string(first[1].module), Some("ntoskrnl.exe"));
    assert_eq!(baked.string(first[1].symbol), Some(""));
    assert_eq!(first[1].address_or_offset, 0x1000);

    let last = baked.frames(3).unwrap();
    assert_eq!(FrameType::from_u32(last[0].frame_type), Some(FrameType::Managed));
    assert_eq!(baked.string(last[0].module), Some("UnityEngine.CoreModule"));
    assert_eq!(baked.string(last[0].symbol), Some("UnityEngine.Object.Destroy(int)"));
    assert_eq!(last[0].address_or_offset, 0x10);
    assert_eq!(last[1].module, 0);
    assert_eq!(last[1].address_or_offset, 0x1000);

    let text = std::fs::read_to_string(&workspace.text).unwrap();
    let at = FileTime(time);
    let expected = format!(
        "Event #0 at {at}\n\
         \x20   1 U [app.exe] main + 0x234 (0x7ff600001234)\n\
         \x20   0 K [ntoskrnl.exe] + 0x1000 (0xfffff80000001000)\n\
         \n\
         Event #3 at {at}\n\
         \x20   1 M [UnityEngine.CoreModule] UnityEngine.Object.Destroy(int) + 0x10 (0x1e0e1ac1010)\n\
         \x20   0 U 0x1000\n\
         \n"
    );
    assert_eq!(text, expected);
}

#[test]
fn test_bake_without_native_backend() {
    let workspace = Workspace::new(&sample_trace(tomorrow()));

    let summary = workspace.run(&NoopResolverFactory, workspace.options()).unwrap();
    assert_eq!(summary.events, 2);
    assert_eq!(summary.managed_frames, 0);

    let baked = BakedFile::open(&workspace.baked).unwrap();
    let first = baked.frames(0).unwrap();
    assert_eq!(baked.string(first[0].module), Some("app.exe"));
    assert_eq!(baked.string(first[0].symbol), Some(""));
    assert_eq!(first[0].address_or_offset, 0x1234);

    // No table for pid 1234: the managed address stays bare.
    let last = baked.frames(3).unwrap();
    assert_eq!(last[0].module, 0);
    assert_eq!(last[0].address_or_offset, MANAGED_BASE + 0x10);
}

#[test]
fn test_two_process_capture_symbolicates_both_frames() {
    let builder = TraceBuilder::new()
        .process(0, 4, "System", "System", &[(0xFFFF_0000_0000_0000, 0x1000, KERNEL_IMAGE)])
        .process(1, 1234, "app.exe", APP_IMAGE, &[(0x0000_7FF0_0000_0000, 0x2000, APP_IMAGE)])
        .event(EventSpec::new(1).frames(&[0x0000_7FF0_0000_0100, 0xFFFF_0000_0000_0100]));
    let workspace = Workspace::new(&builder);

    let summary = workspace.run(&NoopResolverFactory, workspace.options()).unwrap();
    assert_eq!(summary.events, 1);
    assert_eq!(summary.frames, 2);

    let baked = BakedFile::open(&workspace.baked).unwrap();
    let frames = baked.frames(0).unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(FrameType::from_u32(frames[0].frame_type), Some(FrameType::User));
    assert_eq!(baked.string(frames[0].module), Some("app.exe"));
    assert_eq!(frames[0].address_or_offset, 0x100);
    assert_eq!(FrameType::from_u32(frames[1].frame_type), Some(FrameType::Kernel));
    assert_eq!(baked.string(frames[1].module), Some("ntoskrnl.exe"));
    assert_eq!(frames[1].address_or_offset, 0x100);

    let text = std::fs::read_to_string(&workspace.text).unwrap();
    assert!(text.contains("    1 U [app.exe] + 0x100 (0x7ff000000100)\n"), "{text}");
    assert!(text.contains("    0 K [ntoskrnl.exe] + 0x100 (0xffff000000000100)\n"), "{text}");
}

#[test]
fn test_managed_table_newer_than_event_is_ignored() {
    let workspace = Workspace::new(&sample_trace(common::UNIX_EPOCH_TICKS));
    workspace.write_managed_table(
        "pmip_1234_1.txt",
        "000001E0E1AC1000;000001E0E1AC1067;[Game] Player:Update ()\n",
    );

    let summary = workspace.run(&NoopResolverFactory, workspace.options()).unwrap();
    assert_eq!(summary.managed_frames, 0);

    let baked = BakedFile::open(&workspace.baked).unwrap();
    assert_eq!(baked.frames(3).unwrap()[0].module, 0);
}

#[test]
fn test_malformed_managed_table_fails_the_run() {
    let workspace = Workspace::new(&sample_trace(tomorrow()));
    workspace.write_managed_table("pmip_1234_1.txt", "not a range\n");

    let err = workspace.run(&NoopResolverFactory, workspace.options()).unwrap_err();
    assert!(matches!(err, SymbolicateError::Managed(_)), "got {err:?}");
    assert!(!workspace.baked.exists());
    assert!(!workspace.text.exists());
}

#[test]
fn test_start_index_keeps_full_event_range() {
    let workspace = Workspace::new(&sample_trace(tomorrow()));
    let mut options = workspace.options();
    options.start_index = 3;

    let summary = workspace.run(&NoopResolverFactory, options).unwrap();
    assert_eq!(summary.events, 1);

    let baked = BakedFile::open(&workspace.baked).unwrap();
    assert_eq!(baked.event_count(), 4);
    assert!(baked.frames(0).unwrap().is_empty());
    assert_eq!(baked.frames(3).unwrap().len(), 2);
}

#[test]
fn test_cancelled_run_leaves_outputs_untouched() {
    let workspace = Workspace::new(&sample_trace(tomorrow()));
    std::fs::write(&workspace.baked, "previous").unwrap();

    let mut reader = TraceReader::open(&workspace.trace).unwrap();
    let mut seen = Vec::new();
    let summary = Symbolicator::new(&NoopResolverFactory, workspace.options())
        .run(&mut reader, &workspace.baked, |progress| {
            seen.push(progress.sequence);
            assert_eq!(progress.event_count, 4);
            ControlFlow::Break(())
        })
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(seen, vec![0]);
    assert_eq!(std::fs::read_to_string(&workspace.baked).unwrap(), "previous");
    assert!(!workspace.text.exists());

    let leftovers: Vec<_> = std::fs::read_dir(workspace.dir())
        .unwrap()
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| !name.starts_with("capture."))
        .collect();
    assert!(leftovers.is_empty(), "temporary files were left behind: {leftovers:?}");
}
