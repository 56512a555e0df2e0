//! Command-line interface

pub mod args;

pub use args::{Args, BakeArgs, ClassArg, Command, DumpArgs, EventsArgs, QueryArgs};
