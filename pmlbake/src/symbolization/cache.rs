//! Per-process symbol cache
//!
//! Unifies the native resolver session and the managed symbol tables of one
//! captured process, memoizing native lookups since the same return
//! addresses recur in thousands of stacks.

use super::managed::{ManagedSymbolEntry, ManagedSymbolTable};
use super::native::{NativeSymbol, NativeSymbolResolver};
use crate::domain::{ResolverError, SymbolError};
use crate::trace::Module;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};

/// A managed symbol hit: both parts are guaranteed non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagedHit<'a> {
    pub assembly_name: &'a str,
    pub symbol: &'a str,
    pub entry: &'a ManagedSymbolEntry,
}

pub struct SymbolCache {
    process_id: u32,
    native: Box<dyn NativeSymbolResolver>,
    loaded_images: HashSet<String>,
    native_cache: HashMap<u64, Option<NativeSymbol>>,
    /// Newest domain first.
    managed: Vec<ManagedSymbolTable>,
}

impl SymbolCache {
    #[must_use]
    pub fn new(process_id: u32, native: Box<dyn NativeSymbolResolver>) -> Self {
        Self {
            process_id,
            native,
            loaded_images: HashSet::new(),
            native_cache: HashMap::new(),
            managed: Vec::new(),
        }
    }

    #[must_use]
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Give the native session another place to look for images.
    pub fn add_search_path(&mut self, dir: &std::path::Path) {
        self.native.add_search_path(dir);
    }

    /// Load a module's native symbols once per image path.
    ///
    /// Images deleted since the capture are skipped with a warning.
    ///
    /// # Errors
    /// Returns [`SymbolError::ModuleLoad`] for any other backend failure
    pub fn load_module(&mut self, module: &Module) -> Result<(), SymbolError> {
        if !self.loaded_images.insert(module.image_path.clone()) {
            return Ok(());
        }

        match self.native.load_module(&module.image_path, module.base, module.size) {
            Ok(()) => Ok(()),
            Err(e) if e.is_soft_module_miss() => {
                warn!("pid {}: {e}; its frames stay unsymbolicated", self.process_id);
                Ok(())
            }
            Err(source) => Err(SymbolError::ModuleLoad {
                image_path: module.image_path.clone(),
                base: module.base,
                source,
            }),
        }
    }

    /// Register a managed symbol table, keeping the newest domain first.
    pub fn load_managed_symbols(&mut self, table: ManagedSymbolTable) {
        debug!(
            "pid {}: managed domain {} created {}",
            self.process_id, table.domain_serial, table.domain_creation_time
        );
        let at = self
            .managed
            .partition_point(|known| known.domain_creation_time >= table.domain_creation_time);
        self.managed.insert(at, table);
    }

    #[must_use]
    pub fn managed_tables(&self) -> &[ManagedSymbolTable] {
        &self.managed
    }

    /// Resolve `address` through the native session, memoizing the outcome.
    ///
    /// # Errors
    /// Returns the backend error for anything but an invalid address or an
    /// address outside every loaded module; those are cached misses.
    pub fn try_get_native_symbol(
        &mut self,
        address: u64,
    ) -> Result<Option<&NativeSymbol>, ResolverError> {
        if !self.native_cache.contains_key(&address) {
            let resolved = match self.native.resolve_address(address) {
                Ok(symbol) => Some(symbol),
                Err(e) if e.is_soft_address_miss() => None,
                Err(e) => return Err(e),
            };
            self.native_cache.insert(address, resolved);
        }
        Ok(self.native_cache.get(&address).and_then(Option::as_ref))
    }

    /// Resolve `address` against the managed tables, newest domain first,
    /// ignoring domains created after the event.
    #[must_use]
    pub fn try_get_managed_symbol(
        &self,
        event_time: DateTime<Utc>,
        address: u64,
    ) -> Option<ManagedHit<'_>> {
        self.managed
            .iter()
            .filter(|table| table.domain_creation_time <= event_time)
            .find_map(|table| {
                let entry = table.try_find_symbol(address)?;
                let assembly_name = entry.assembly_name.as_deref().filter(|s| !s.is_empty())?;
                let symbol = entry.symbol.as_deref().filter(|s| !s.is_empty())?;
                Some(ManagedHit { assembly_name, symbol, entry })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::cell::Cell;
    use std::io::Cursor;
    use std::path::Path;
    use std::rc::Rc;

    /// Scripted backend counting resolve calls.
    struct Scripted {
        resolves: Rc<Cell<usize>>,
    }

    impl NativeSymbolResolver for Scripted {
        fn load_module(
            &mut self,
            image_path: &str,
            _base: u64,
            _size: u32,
        ) -> Result<(), ResolverError> {
            match image_path {
                "gone.dll" => Err(ResolverError::NotFound(image_path.to_string())),
                "broken.dll" => Err(ResolverError::BadImage {
                    path: image_path.to_string(),
                    reason: "truncated".to_string(),
                }),
                _ => Ok(()),
            }
        }

        fn resolve_address(&mut self, address: u64) -> Result<NativeSymbol, ResolverError> {
            self.resolves.set(self.resolves.get() + 1);
            match address {
                0x1000..=0x1FFF => {
                    Ok(NativeSymbol { name: "main".to_string(), offset: address - 0x1000 })
                }
                0x2000 => Err(ResolverError::InvalidAddress(address)),
                0x3000 => Err(ResolverError::Io(std::io::Error::other("session lost"))),
                _ => Err(ResolverError::ModuleNotFound(address)),
            }
        }

        fn add_search_path(&mut self, _dir: &Path) {}
    }

    fn cache() -> (SymbolCache, Rc<Cell<usize>>) {
        let resolves = Rc::new(Cell::new(0));
        (SymbolCache::new(7, Box::new(Scripted { resolves: resolves.clone() })), resolves)
    }

    fn module(path: &str) -> Module {
        Module { base: 0x1000, size: 0x1000, image_path: path.to_string() }
    }

    fn table(serial: u32, created: DateTime<Utc>, lines: &str) -> ManagedSymbolTable {
        let text = format!("UnityMixedCallstacks:1.0\n{lines}");
        let name = format!("pmip_7_{serial}.txt");
        ManagedSymbolTable::from_reader(Path::new(&name), Cursor::new(text), created).unwrap()
    }

    #[test]
    fn test_load_module_soft_and_hard() {
        let (mut cache, _) = cache();
        cache.load_module(&module("app.exe")).unwrap();
        cache.load_module(&module("gone.dll")).unwrap();

        let err = cache.load_module(&module("broken.dll")).unwrap_err();
        assert!(err.to_string().contains("broken.dll"));
        // Already attempted: not retried.
        cache.load_module(&module("broken.dll")).unwrap();
    }

    #[test]
    fn test_native_lookup_is_memoized() {
        let (mut cache, resolves) = cache();

        let hit = cache.try_get_native_symbol(0x1010).unwrap().cloned();
        assert_eq!(hit, Some(NativeSymbol { name: "main".to_string(), offset: 0x10 }));
        cache.try_get_native_symbol(0x1010).unwrap();
        assert_eq!(resolves.get(), 1);

        assert!(cache.try_get_native_symbol(0x2000).unwrap().is_none());
        assert!(cache.try_get_native_symbol(0x9000).unwrap().is_none());
        assert!(cache.try_get_native_symbol(0x2000).unwrap().is_none());
        assert_eq!(resolves.get(), 3);

        assert!(matches!(cache.try_get_native_symbol(0x3000), Err(ResolverError::Io(_))));
    }

    #[test]
    fn test_managed_prefers_newest_domain_before_event() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let (mut cache, _) = cache();
        cache.load_managed_symbols(table(
            1,
            t0,
            "0000000000005000;0000000000005100;[Old] Old:Run ()\n",
        ));
        cache.load_managed_symbols(table(
            3,
            t0 + Duration::hours(2),
            "0000000000005000;0000000000005100;[Future] Future:Run ()\n",
        ));
        cache.load_managed_symbols(table(
            2,
            t0 + Duration::hours(1),
            "0000000000005000;0000000000005100;[New] New:Run ()\n",
        ));

        let serials: Vec<u32> = cache.managed_tables().iter().map(|t| t.domain_serial).collect();
        assert_eq!(serials, vec![3, 2, 1]);

        let hit = cache.try_get_managed_symbol(t0 + Duration::minutes(90), 0x5010).unwrap();
        assert_eq!(hit.assembly_name, "New");
        assert_eq!(hit.symbol, "New.Run()");

        let hit = cache.try_get_managed_symbol(t0 + Duration::minutes(30), 0x5010).unwrap();
        assert_eq!(hit.assembly_name, "Old");

        assert!(cache.try_get_managed_symbol(t0 - Duration::minutes(1), 0x5010).is_none());
        assert!(cache.try_get_managed_symbol(t0 + Duration::hours(5), 0x6000).is_none());
    }

    #[test]
    fn test_managed_hit_needs_assembly_and_symbol() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let (mut cache, _) = cache();
        cache.load_managed_symbols(table(
            1,
            t0,
            "0000000000005000;0000000000005100;[] NoAssembly ()\n\
             0000000000006000;0000000000006100;[Asm] \n",
        ));

        assert!(cache.try_get_managed_symbol(t0, 0x5000).is_none());
        assert!(cache.try_get_managed_symbol(t0, 0x6000).is_none());
    }
}
