//! Native symbol backend boundary
//!
//! Native symbols come from an external debug-symbol service. This module
//! defines the capability the rest of the pipeline consumes, the once-only
//! process-wide bootstrap that must run before the first resolver is built,
//! and a no-op adapter for platforms (and tests) without a backend.

use crate::domain::ResolverError;
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Environment variable listing symbol directories, `;`-separated.
pub const SYMBOL_PATH_ENV: &str = "PMLBAKE_SYMBOL_PATH";

/// A resolved native symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeSymbol {
    pub name: String,
    /// Distance from the start of the symbol.
    pub offset: u64,
}

/// One symbol session, scoped to a single captured process.
pub trait NativeSymbolResolver {
    /// Make symbols of the image mapped at `base` available.
    ///
    /// # Errors
    /// [`ResolverError::NotFound`] / [`ResolverError::PathNotFound`] when the
    /// image no longer exists; anything else is a hard failure.
    fn load_module(&mut self, image_path: &str, base: u64, size: u32) -> Result<(), ResolverError>;

    /// Resolve an absolute address to a symbol name and offset.
    ///
    /// # Errors
    /// [`ResolverError::InvalidAddress`] / [`ResolverError::ModuleNotFound`]
    /// for addresses without symbols; anything else is a hard failure.
    fn resolve_address(&mut self, address: u64) -> Result<NativeSymbol, ResolverError>;

    /// Add a directory to search for images and symbol files.
    fn add_search_path(&mut self, dir: &Path);
}

/// Creates one resolver session per captured process.
pub trait ResolverFactory {
    fn create(&self, process_id: u32) -> Box<dyn NativeSymbolResolver>;
}

// =============================================================================
// BOOTSTRAP
// =============================================================================

/// Process-wide symbol environment, initialized once by [`bootstrap`].
#[derive(Debug, Default)]
pub struct SymbolEnvironment {
    search_paths: Vec<PathBuf>,
}

impl SymbolEnvironment {
    /// Parse a `;`-separated symbol path. Symbol-server (`srv*`) and cache
    /// (`cache*`) directives are ignored; only plain directories are kept.
    #[must_use]
    pub fn from_symbol_path(value: &str) -> Self {
        let search_paths = value
            .split(';')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .filter(|entry| {
                let lower = entry.to_ascii_lowercase();
                !lower.starts_with("srv*") && !lower.starts_with("cache*")
            })
            .map(PathBuf::from)
            .collect();
        Self { search_paths }
    }

    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }
}

static ENVIRONMENT: OnceLock<SymbolEnvironment> = OnceLock::new();

/// Initialize the native symbol environment. Call once before constructing
/// the first resolver; later calls return the same environment.
pub fn bootstrap() -> &'static SymbolEnvironment {
    ENVIRONMENT.get_or_init(|| {
        let environment = std::env::var(SYMBOL_PATH_ENV)
            .map(|value| SymbolEnvironment::from_symbol_path(&value))
            .unwrap_or_default();
        info!(
            "Symbol search path: {} director(ies) from {SYMBOL_PATH_ENV}",
            environment.search_paths.len()
        );
        environment
    })
}

// =============================================================================
// NO-OP ADAPTER
// =============================================================================

/// Resolver that knows no images: every module is reported missing and every
/// address unresolvable, so the pipeline degrades to managed symbols and bare
/// addresses.
#[derive(Debug, Default)]
pub struct NoopResolver;

impl NativeSymbolResolver for NoopResolver {
    fn load_module(
        &mut self,
        image_path: &str,
        _base: u64,
        _size: u32,
    ) -> Result<(), ResolverError> {
        Err(ResolverError::NotFound(image_path.to_string()))
    }

    fn resolve_address(&mut self, address: u64) -> Result<NativeSymbol, ResolverError> {
        Err(ResolverError::ModuleNotFound(address))
    }

    fn add_search_path(&mut self, dir: &Path) {
        debug!("Ignoring search path {} (no native backend)", dir.display());
    }
}

/// Factory for [`NoopResolver`] sessions.
#[derive(Debug, Default)]
pub struct NoopResolverFactory;

impl ResolverFactory for NoopResolverFactory {
    fn create(&self, _process_id: u32) -> Box<dyn NativeSymbolResolver> {
        Box::new(NoopResolver)
    }
}
