//! CLI argument definitions

use crate::domain::EventClass;
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Extension given to baked files when `--output` is omitted.
pub const BAKED_EXTENSION: &str = "pmlbaked";

#[derive(Parser)]
#[command(
    name = "pmlbake",
    version,
    about = "Symbolicate the stacks of process monitor traces",
    after_help = "\
EXAMPLES:
    pmlbake bake capture.pml                      Write capture.pmlbaked next to the trace
    pmlbake bake capture.pml --text stacks.txt    Also write a readable mirror
    pmlbake query capture.pmlbaked --symbol Read  Events whose stack mentions Read
    pmlbake query capture.pmlbaked --top 20       Most frequent symbols

ENVIRONMENT:
    PMLBAKE_SYMBOL_PATH    ';'-separated directories searched for module images
    RUST_LOG               Log filter (e.g. RUST_LOG=pmlbake=debug)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Symbolicate every stack of a trace into a baked file
    Bake(BakeArgs),

    /// Find events whose stacks match a module or symbol regex
    Query(QueryArgs),

    /// Print the stacks stored in a baked file
    Dump(DumpArgs),

    /// List raw trace events, or the process table
    Events(EventsArgs),
}

#[derive(clap::Args)]
pub struct BakeArgs {
    /// Trace file to symbolicate
    #[arg(value_name = "TRACE")]
    pub trace: PathBuf,

    /// Baked output file [default: TRACE with a .pmlbaked extension]
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Also write the stacks as text
    #[arg(long, value_name = "FILE")]
    pub text: Option<PathBuf>,

    /// Directory holding pmip_<pid>_<serial>.txt files [default: the trace's directory]
    #[arg(long, value_name = "DIR")]
    pub managed_symbols: Option<PathBuf>,

    /// Extra directory to search for module images (repeatable)
    #[arg(long = "symbol-path", value_name = "DIR")]
    pub symbol_paths: Vec<PathBuf>,

    /// First event to symbolicate
    #[arg(long, default_value = "0", value_name = "INDEX")]
    pub start: u32,

    /// Skip native symbol lookup; only managed symbols and module offsets
    #[arg(long)]
    pub no_native: bool,
}

impl BakeArgs {
    #[must_use]
    pub fn output_path(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| self.trace.with_extension(BAKED_EXTENSION))
    }
}

#[derive(clap::Args)]
#[command(group(ArgGroup::new("query").required(true).args(["symbol", "module", "top"])))]
pub struct QueryArgs {
    /// Baked file to search
    #[arg(value_name = "BAKED")]
    pub baked: PathBuf,

    /// Regex matched against symbol names
    #[arg(long, value_name = "REGEX", conflicts_with = "module")]
    pub symbol: Option<String>,

    /// Regex matched against module and assembly names
    #[arg(long, value_name = "REGEX")]
    pub module: Option<String>,

    /// Rank the N symbols present in the most events
    #[arg(long, value_name = "N", conflicts_with_all = ["symbol", "module"])]
    pub top: Option<usize>,

    /// Print each matching event's stack instead of its index
    #[arg(long, conflicts_with = "json")]
    pub stacks: bool,

    /// Emit JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Args)]
pub struct DumpArgs {
    /// Baked file to print
    #[arg(value_name = "BAKED")]
    pub baked: PathBuf,

    /// First event to print
    #[arg(long, default_value = "0", value_name = "INDEX")]
    pub start: usize,

    /// Stop after N events with stacks
    #[arg(long, value_name = "N")]
    pub limit: Option<usize>,
}

#[derive(clap::Args)]
pub struct EventsArgs {
    /// Trace file to read
    #[arg(value_name = "TRACE")]
    pub trace: PathBuf,

    /// Only these event classes (repeatable)
    #[arg(long, value_enum, value_name = "CLASS")]
    pub class: Vec<ClassArg>,

    /// First event to list
    #[arg(long, default_value = "0", value_name = "INDEX")]
    pub start: u32,

    /// Stop after N events
    #[arg(long, value_name = "N")]
    pub limit: Option<usize>,

    /// Only events that carry a stack
    #[arg(long)]
    pub stacks_only: bool,

    /// Print the process table instead of events
    #[arg(long)]
    pub processes: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ClassArg {
    Process,
    Registry,
    FileSystem,
    Profiling,
    Network,
}

impl From<ClassArg> for EventClass {
    fn from(class: ClassArg) -> Self {
        match class {
            ClassArg::Process => Self::Process,
            ClassArg::Registry => Self::Registry,
            ClassArg::FileSystem => Self::FileSystem,
            ClassArg::Profiling => Self::Profiling,
            ClassArg::Network => Self::Network,
        }
    }
}
