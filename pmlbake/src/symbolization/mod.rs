//! # Stack Symbolication
//!
//! Turns the raw return addresses stored with each trace event into
//! `module!symbol + offset` descriptions.
//!
//! ## Resolution Order
//!
//! For every frame, in stored order:
//!
//! 1. **Native**: the address falls inside a module the process had loaded.
//!    The module's symbols come from a [`NativeSymbolResolver`] session owned
//!    by the process. A module with no symbols still yields `module + offset`.
//! 2. **Managed**: the address falls inside JIT-generated code listed in one
//!    of the process's managed symbol tables. The frame is reclassified as
//!    [`FrameType::Managed`](crate::domain::FrameType::Managed).
//! 3. **Bare**: nothing matched; only the address is kept.
//!
//! Kernel frames are told apart from user frames by the top address bit.
//!
//! ## Module Structure
//!
//! - **`address_range`**: the one binary search shared by modules, images and
//!   managed code ranges
//! - **`native`**: the resolver trait, the once-only environment bootstrap
//!   and a no-op backend
//! - **`object_resolver`**: a portable backend reading ELF/PE/COFF symbol
//!   tables and exports with the `object` crate
//! - **`managed`**: `pmip_<pid>_<serial>.txt` table parsing and discovery
//! - **`cache`**: per-process memoization over both sources
//! - **`symbolicator`**: the driver that streams a trace into a baked file
//!
//! ## Example
//!
//! ```rust,ignore
//! let environment = native::bootstrap();
//! let factory = ObjectResolverFactory::new(environment, &[]);
//! let mut reader = TraceReader::open("capture.pml")?;
//! let options = SymbolicateOptions::for_trace(Path::new("capture.pml"));
//! Symbolicator::new(&factory, options)
//!     .run(&mut reader, Path::new("capture.pmlbaked"), |_| ControlFlow::Continue(()))?;
//! ```

pub mod address_range;
pub mod cache;
pub mod managed;
pub mod native;
pub mod object_resolver;
pub mod symbolicator;

pub use address_range::AddressRange;
pub use cache::SymbolCache;
pub use managed::{ManagedSymbolEntry, ManagedSymbolTable};
pub use native::{
    bootstrap, NativeSymbol, NativeSymbolResolver, NoopResolverFactory, ResolverFactory,
    SymbolEnvironment,
};
pub use object_resolver::{ObjectResolver, ObjectResolverFactory};
pub use symbolicator::{
    Progress, SymbolDescriptor, SymbolicateOptions, SymbolicateSummary, Symbolicator,
};
