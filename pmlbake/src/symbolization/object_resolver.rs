//! Portable native resolver reading symbol tables out of module images
//!
//! Loads each image with the `object` crate (ELF, PE and COFF) and resolves
//! addresses against its symbol table and export directory. No debug
//! information is needed, and nothing platform-specific is called, so this
//! adapter works wherever the captured images can be copied.

use super::address_range::{self, AddressRange};
use super::native::{NativeSymbol, NativeSymbolResolver, ResolverFactory, SymbolEnvironment};
use crate::domain::ResolverError;
use crate::trace::process::file_name;
use log::{debug, trace};
use object::{Object, ObjectSymbol as _};
use rustc_demangle::demangle;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A symbol, relative to its image's load base.
#[derive(Debug, Clone)]
struct ImageSymbol {
    rva: u64,
    name: String,
}

/// An image mapped at a known base with its symbols sorted by rva.
#[derive(Debug)]
struct LoadedImage {
    base: u64,
    size: u32,
    path: PathBuf,
    symbols: Vec<ImageSymbol>,
}

impl AddressRange for LoadedImage {
    fn base(&self) -> u64 {
        self.base
    }

    fn size(&self) -> u32 {
        self.size
    }
}

/// Resolver session backed by on-disk images.
#[derive(Debug, Default)]
pub struct ObjectResolver {
    search_paths: Vec<PathBuf>,
    images: Vec<LoadedImage>,
}

impl ObjectResolver {
    #[must_use]
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths, images: Vec::new() }
    }

    /// Find the image on disk: first at its recorded path, then by file name
    /// in every search directory.
    fn locate(&self, image_path: &str) -> Result<PathBuf, ResolverError> {
        let recorded = Path::new(image_path);
        if recorded.is_file() {
            return Ok(recorded.to_path_buf());
        }

        let name = file_name(image_path);
        if name.is_empty() {
            return Err(ResolverError::PathNotFound(image_path.to_string()));
        }
        self.search_paths
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| ResolverError::NotFound(image_path.to_string()))
    }
}

impl NativeSymbolResolver for ObjectResolver {
    fn load_module(&mut self, image_path: &str, base: u64, size: u32) -> Result<(), ResolverError> {
        if self.images.iter().any(|image| image.base == base) {
            return Ok(());
        }

        let path = self.locate(image_path)?;
        let data = fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ResolverError::NotFound(image_path.to_string()),
            _ => ResolverError::Io(e),
        })?;
        let symbols = read_symbols(&data).map_err(|reason| ResolverError::BadImage {
            path: path.display().to_string(),
            reason,
        })?;

        debug!("Loaded {} symbols from {} at 0x{base:x}", symbols.len(), path.display());
        self.images.push(LoadedImage { base, size, path, symbols });
        address_range::sort_by_base(&mut self.images);
        Ok(())
    }

    fn resolve_address(&mut self, address: u64) -> Result<NativeSymbol, ResolverError> {
        let image = address_range::try_find(&self.images, address)
            .ok_or(ResolverError::ModuleNotFound(address))?;
        let rva = address - image.base;

        let index = image.symbols.partition_point(|symbol| symbol.rva <= rva);
        let Some(symbol) = index.checked_sub(1).map(|i| &image.symbols[i]) else {
            trace!("0x{address:x} precedes every symbol of {}", image.path.display());
            return Err(ResolverError::InvalidAddress(address));
        };

        Ok(NativeSymbol { name: symbol.name.clone(), offset: rva - symbol.rva })
    }

    fn add_search_path(&mut self, dir: &Path) {
        if !self.search_paths.iter().any(|known| known == dir) {
            self.search_paths.push(dir.to_path_buf());
        }
    }
}

/// Collect symbol table entries and exports, relative to the image base.
fn read_symbols(data: &[u8]) -> Result<Vec<ImageSymbol>, String> {
    let obj = object::File::parse(data).map_err(|e| e.to_string())?;
    let image_base = obj.relative_address_base();

    let mut symbols: Vec<ImageSymbol> = obj
        .symbol_map()
        .symbols()
        .iter()
        .filter_map(|symbol| {
            let rva = symbol.address().checked_sub(image_base)?;
            Some(ImageSymbol { rva, name: format!("{:#}", demangle(symbol.name())) })
        })
        .collect();

    // Stripped images often keep only their exports.
    if symbols.is_empty() {
        symbols = obj
            .symbols()
            .filter(|symbol| symbol.is_definition())
            .filter_map(|symbol| {
                let rva = symbol.address().checked_sub(image_base)?;
                let name = symbol.name().ok()?;
                Some(ImageSymbol { rva, name: format!("{:#}", demangle(name)) })
            })
            .collect();
    }
    for export in obj.exports().map_err(|e| e.to_string())? {
        let Some(rva) = export.address().checked_sub(image_base) else {
            continue;
        };
        let name = String::from_utf8_lossy(export.name());
        symbols.push(ImageSymbol { rva, name: format!("{:#}", demangle(&name)) });
    }

    symbols.sort_by_key(|symbol| symbol.rva);
    symbols.dedup_by_key(|symbol| symbol.rva);
    Ok(symbols)
}

/// Creates an [`ObjectResolver`] per process, seeded with the bootstrap
/// environment's search paths plus any configured ones.
#[derive(Debug)]
pub struct ObjectResolverFactory {
    search_paths: Vec<PathBuf>,
}

impl ObjectResolverFactory {
    #[must_use]
    pub fn new(environment: &SymbolEnvironment, extra_search_paths: &[PathBuf]) -> Self {
        let mut search_paths = extra_search_paths.to_vec();
        search_paths.extend(environment.search_paths().iter().cloned());
        Self { search_paths }
    }
}

impl ResolverFactory for ObjectResolverFactory {
    fn create(&self, _process_id: u32) -> Box<dyn NativeSymbolResolver> {
        Box::new(ObjectResolver::new(self.search_paths.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x7FF0_0000_0000;

    fn current_exe() -> PathBuf {
        std::env::current_exe().expect("Failed to get current exe")
    }

    #[test]
    fn test_missing_image_is_soft() {
        let mut resolver = ObjectResolver::new(Vec::new());
        let err = resolver.load_module("C:\\gone\\deleted.dll", BASE, 0x1000).unwrap_err();
        assert!(err.is_soft_module_miss());
    }

    #[test]
    fn test_garbage_image_is_hard() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("junk.dll"), b"definitely not an image").unwrap();

        let mut resolver = ObjectResolver::new(vec![dir.path().to_path_buf()]);
        let err = resolver.load_module("C:\\Windows\\junk.dll", BASE, 0x1000).unwrap_err();
        assert!(matches!(err, ResolverError::BadImage { .. }));
        assert!(!err.is_soft_module_miss());
    }

    #[test]
    fn test_unloaded_address_is_soft() {
        let mut resolver = ObjectResolver::new(Vec::new());
        assert!(resolver.resolve_address(BASE).unwrap_err().is_soft_address_miss());
    }

    #[test]
    fn test_resolves_own_symbols_via_search_path() {
        let exe = current_exe();
        let dir = exe.parent().unwrap().to_path_buf();
        let recorded = format!("C:\\Program Files\\{}", exe.file_name().unwrap().to_str().unwrap());

        let mut resolver = ObjectResolver::new(Vec::new());
        resolver.add_search_path(&dir);
        resolver.add_search_path(&dir);
        assert_eq!(resolver.search_paths.len(), 1);

        resolver.load_module(&recorded, BASE, u32::MAX).unwrap();
        // idempotent per base
        resolver.load_module(&recorded, BASE, u32::MAX).unwrap();
        assert_eq!(resolver.images.len(), 1);

        let symbols = resolver.images[0].symbols.clone();
        let Some(pair) = symbols.windows(2).find(|w| w[1].rva > w[0].rva + 1) else {
            // Fully stripped test binary; nothing further to check.
            return;
        };
        let resolved = resolver.resolve_address(BASE + pair[0].rva + 1).unwrap();
        assert_eq!(resolved.name, pair[0].name);
        assert_eq!(resolved.offset, 1);
    }
}
