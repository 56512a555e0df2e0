//! # pmlbake - Main Entry Point
//!
//! Subcommands:
//! - **bake**: symbolicate a trace into a baked file (plus optional text)
//! - **query**: regex search over a baked file, as text or JSON
//! - **dump**: print the stacks of a baked file
//! - **events**: list raw trace events or the process table

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use pmlbake::analysis::{QueryIndex, SymbolRank};
use pmlbake::baked::{write_baked_event, BakedFile};
use pmlbake::cli::{Args, BakeArgs, Command, DumpArgs, EventsArgs, QueryArgs};
use pmlbake::domain::{BakedError, EventClass, SymbolicateError, TraceError};
use pmlbake::symbolization::{
    bootstrap, NoopResolverFactory, ObjectResolverFactory, ResolverFactory, SymbolicateOptions,
    Symbolicator,
};
use pmlbake::trace::{EventDetail, EventFilter, TraceEvent, TraceReader};
use regex::Regex;
use serde::Serialize;
use std::io::{self, BufWriter, Write};
use std::ops::ControlFlow;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_DATAERR: i32 = 65;
const EXIT_NOINPUT: i32 = 66;

/// Progress is reported every this many symbolicated events.
const PROGRESS_INTERVAL: u64 = 10_000;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.is::<regex::Error>() {
            return EXIT_USAGE;
        }
        if let Some(e) = cause.downcast_ref::<SymbolicateError>() {
            return match e {
                SymbolicateError::Trace(e) => trace_exit_code(e),
                SymbolicateError::Managed(_) | SymbolicateError::Baked(_) => EXIT_DATAERR,
                SymbolicateError::Symbol(_) | SymbolicateError::Output { .. } => EXIT_ERROR,
            };
        }
        if let Some(e) = cause.downcast_ref::<TraceError>() {
            return trace_exit_code(e);
        }
        if let Some(e) = cause.downcast_ref::<BakedError>() {
            return match e {
                BakedError::Io(io) => io_exit_code(io),
                _ => EXIT_DATAERR,
            };
        }
    }
    EXIT_ERROR
}

fn trace_exit_code(err: &TraceError) -> i32 {
    match err {
        TraceError::Io(io) => io_exit_code(io),
        _ => EXIT_DATAERR,
    }
}

fn io_exit_code(err: &io::Error) -> i32 {
    if err.kind() == io::ErrorKind::NotFound {
        EXIT_NOINPUT
    } else {
        EXIT_ERROR
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    match &args.command {
        Command::Bake(bake_args) => bake(bake_args, args.quiet),
        Command::Query(query_args) => query(query_args),
        Command::Dump(dump_args) => dump(dump_args),
        Command::Events(events_args) => events(events_args),
    }
}

// =============================================================================
// BAKE
// =============================================================================

fn bake(args: &BakeArgs, quiet: bool) -> Result<()> {
    let output = args.output_path();

    let mut reader = TraceReader::open(&args.trace)
        .with_context(|| format!("Failed to open trace {}", args.trace.display()))?;

    // The symbol environment must exist before the first resolver session.
    let environment = bootstrap();
    let factory: Box<dyn ResolverFactory> = if args.no_native {
        Box::new(NoopResolverFactory)
    } else {
        Box::new(ObjectResolverFactory::new(environment, &[]))
    };

    let mut options = SymbolicateOptions::for_trace(&args.trace);
    if let Some(dir) = &args.managed_symbols {
        options.managed_symbol_dir.clone_from(dir);
    }
    options.search_paths.clone_from(&args.symbol_paths);
    options.text_output.clone_from(&args.text);
    options.start_index = args.start;

    if !quiet {
        println!("pmlbake v{}", env!("CARGO_PKG_VERSION"));
        println!("trace: {} ({} events)", args.trace.display(), reader.event_count());
        println!("output: {}", output.display());
    }

    let summary = Symbolicator::new(factory.as_ref(), options)
        .run(&mut reader, &output, |progress| {
            if !quiet && progress.events_done % PROGRESS_INTERVAL == 0 {
                let (done, at) = (progress.events_done, progress.sequence);
                eprint!("\rsymbolicated {done} events (at #{at})");
            }
            ControlFlow::Continue(())
        })
        .with_context(|| format!("Failed to symbolicate {}", args.trace.display()))?;

    if !quiet {
        if summary.events >= PROGRESS_INTERVAL {
            eprintln!();
        }
        println!(
            "events: {}  frames: {}  resolved: {}  managed: {}",
            summary.events, summary.frames, summary.resolved_frames, summary.managed_frames
        );
    }
    info!("Wrote {}", output.display());
    Ok(())
}

// =============================================================================
// QUERY
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MatchReport<'a> {
    field: &'a str,
    pattern: &'a str,
    events: Vec<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TopReport {
    events_with_stacks: usize,
    symbols: Vec<SymbolRank>,
}

fn query(args: &QueryArgs) -> Result<()> {
    let baked = BakedFile::open(&args.baked)
        .with_context(|| format!("Failed to load {}", args.baked.display()))?;
    let index = QueryIndex::build(&baked);

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    if let Some(n) = args.top {
        let symbols = index.top_symbols(n);
        if args.json {
            let report = TopReport { events_with_stacks: index.events_with_stacks(), symbols };
            serde_json::to_writer_pretty(&mut out, &report)?;
            writeln!(out)?;
        } else {
            for rank in &symbols {
                writeln!(out, "{:>8} {:>6.2}%  {}", rank.events, rank.percentage, rank.symbol)?;
            }
        }
        return Ok(out.flush()?);
    }

    let (field, pattern) = match (&args.symbol, &args.module) {
        (Some(pattern), _) => ("symbol", pattern),
        (None, Some(pattern)) => ("module", pattern),
        (None, None) => anyhow::bail!("Missing required argument: --symbol, --module or --top"),
    };
    let regex = Regex::new(pattern).with_context(|| format!("Invalid regex {pattern:?}"))?;
    let events = if field == "symbol" {
        index.match_records_by_symbol(&regex)
    } else {
        index.match_records_by_module(&regex)
    };
    info!("{} event(s) match {field} /{pattern}/", events.len());

    if args.json {
        serde_json::to_writer_pretty(&mut out, &MatchReport { field, pattern, events })?;
        writeln!(out)?;
    } else if args.stacks {
        for event in events {
            write_baked_event(&mut out, &baked, event as usize)?;
        }
    } else {
        for event in events {
            writeln!(out, "{event}")?;
        }
    }
    Ok(out.flush()?)
}

// =============================================================================
// DUMP
// =============================================================================

fn dump(args: &DumpArgs) -> Result<()> {
    let baked = BakedFile::open(&args.baked)
        .with_context(|| format!("Failed to load {}", args.baked.display()))?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    let with_stacks = (args.start..baked.event_count())
        .filter(|&event| baked.frames(event).is_some_and(|frames| !frames.is_empty()))
        .take(args.limit.unwrap_or(usize::MAX));
    for event in with_stacks {
        write_baked_event(&mut out, &baked, event)?;
    }
    Ok(out.flush()?)
}

// =============================================================================
// EVENTS
// =============================================================================

fn events(args: &EventsArgs) -> Result<()> {
    let mut reader = TraceReader::open(&args.trace)
        .with_context(|| format!("Failed to open trace {}", args.trace.display()))?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    if args.processes {
        for process in reader.processes() {
            writeln!(
                out,
                "#{:<4} pid {:<6} ppid {:<6} {:<24} modules {:<4} {}",
                process.index,
                process.id,
                process.parent_id,
                process.name,
                process.modules.len(),
                process.command_line
            )?;
        }
        return Ok(out.flush()?);
    }

    let mut filter = EventFilter::everything();
    if !args.class.is_empty() {
        let classes: Vec<EventClass> = args.class.iter().copied().map(EventClass::from).collect();
        filter = filter.only(&classes);
    }
    filter.require_stack = args.stacks_only;

    let names: std::collections::HashMap<u32, String> =
        reader.processes().iter().map(|p| (p.index, p.name.clone())).collect();

    let limit = args.limit.unwrap_or(usize::MAX);
    for event in reader.select_events(filter, args.start).take(limit) {
        let event = event.with_context(|| format!("Failed to read {}", args.trace.display()))?;
        let process = names.get(&event.process_index).map_or("?", String::as_str);
        writeln!(out, "{}", describe_event(&event, process))?;
    }
    Ok(out.flush()?)
}

fn describe_event(event: &TraceEvent, process: &str) -> String {
    let mut line = format!(
        "{:>8} {} {}({}) tid {} {} {} frames {}",
        event.sequence,
        event.capture_time,
        process,
        event.process_id,
        event.thread_id,
        event.class,
        event.operation_name(),
        event.frames.len()
    );
    if let Some(EventDetail::FileReadWrite(rw)) = &event.detail {
        line.push_str(&format!(" {} offset {} length {}", rw.path, rw.offset, rw.length));
    }
    line
}
