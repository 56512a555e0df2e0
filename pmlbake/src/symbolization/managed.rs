//! Managed (JIT) symbol tables
//!
//! A managed runtime generates code at run time, so its frames are invisible
//! to the native symbol backend. The runtime instead writes one companion text
//! file per domain, `pmip_<processId>_<domainSerial>.txt`, listing the code
//! ranges it emitted:
//!
//! ```text
//! UnityMixedCallstacks:1.0
//! 000001E0E1AC1000;000001E0E1AC1067;[UnityEngine.CoreModule] UnityEngine.Object:Destroy (int)
//! ```
//!
//! A domain may be torn down and recreated during a capture; each generation
//! gets its own file, and the file's creation time stands in for the domain's.

use super::address_range::{self, AddressRange};
use crate::domain::ManagedSymbolError;
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Required first line of every managed symbol file.
pub const PMIP_HEADER: &str = "UnityMixedCallstacks:1.0";

const FILE_PREFIX: &str = "pmip_";
const FILE_SUFFIX: &str = ".txt";

/// One JIT-compiled code range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedSymbolEntry {
    pub base: u64,
    pub size: u32,
    pub assembly_name: Option<String>,
    pub symbol: Option<String>,
}

impl AddressRange for ManagedSymbolEntry {
    fn base(&self) -> u64 {
        self.base
    }

    fn size(&self) -> u32 {
        self.size
    }
}

/// All code ranges of one domain generation, sorted by base.
#[derive(Debug, Clone)]
pub struct ManagedSymbolTable {
    pub path: PathBuf,
    pub process_id: u32,
    pub domain_serial: u32,
    pub domain_creation_time: DateTime<Utc>,
    entries: Vec<ManagedSymbolEntry>,
}

impl ManagedSymbolTable {
    /// Load a table from disk. The domain creation time is the file's
    /// creation time (modification time where the platform has none).
    ///
    /// # Errors
    /// - The file name does not encode a process id and domain serial
    /// - The header line or any data line is malformed
    /// - The file cannot be read
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManagedSymbolError> {
        let path = path.as_ref();
        let io_err =
            |source: io::Error| ManagedSymbolError::Io { path: path.to_path_buf(), source };

        let file = File::open(path).map_err(io_err)?;
        let metadata = file.metadata().map_err(io_err)?;
        let created = metadata.created().or_else(|_| metadata.modified()).map_err(io_err)?;

        Self::from_reader(path, BufReader::new(file), DateTime::<Utc>::from(created))
    }

    /// Parse a table from `reader`; `path` supplies the process id, domain
    /// serial and error context.
    ///
    /// # Errors
    /// Same as [`ManagedSymbolTable::load`], minus the metadata lookup.
    pub fn from_reader(
        path: &Path,
        reader: impl BufRead,
        domain_creation_time: DateTime<Utc>,
    ) -> Result<Self, ManagedSymbolError> {
        let (process_id, domain_serial) = parse_file_name(path)?;
        let mut lines = reader.lines();

        let header = lines
            .next()
            .transpose()
            .map_err(|source| ManagedSymbolError::Io { path: path.to_path_buf(), source })?
            .unwrap_or_default();
        if header.trim_end_matches('\r') != PMIP_HEADER {
            return Err(ManagedSymbolError::Header { path: path.to_path_buf(), found: header });
        }

        let mut entries = Vec::new();
        for (number, line) in lines.enumerate() {
            let line =
                line.map_err(|source| ManagedSymbolError::Io { path: path.to_path_buf(), source })?;
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let entry = parse_line(line).map_err(|reason| ManagedSymbolError::Line {
                path: path.to_path_buf(),
                // +1 for the header, +1 for one-based numbering
                line: number + 2,
                reason,
            })?;
            entries.push(entry);
        }
        address_range::sort_by_base(&mut entries);

        debug!(
            "Loaded {} managed symbols for pid {process_id} domain {domain_serial} from {}",
            entries.len(),
            path.display()
        );

        Ok(Self {
            path: path.to_path_buf(),
            process_id,
            domain_serial,
            domain_creation_time,
            entries,
        })
    }

    #[must_use]
    pub fn entries(&self) -> &[ManagedSymbolEntry] {
        &self.entries
    }

    /// Entry whose range contains `address`.
    #[must_use]
    pub fn try_find_symbol(&self, address: u64) -> Option<&ManagedSymbolEntry> {
        address_range::try_find(&self.entries, address)
    }
}

/// Parse `<hexStart>;<hexEnd>;[<module>] <symbol>`.
fn parse_line(line: &str) -> Result<ManagedSymbolEntry, String> {
    let mut fields = line.splitn(3, ';');
    let (Some(start), Some(end), Some(rest)) = (fields.next(), fields.next(), fields.next()) else {
        return Err(format!("expected `start;end;[module] symbol`, got {line:?}"));
    };

    let parse_hex = |text: &str| {
        u64::from_str_radix(text.trim(), 16).map_err(|e| format!("bad address {text:?}: {e}"))
    };
    let (start, end) = (parse_hex(start)?, parse_hex(end)?);
    let size = end
        .checked_sub(start)
        .and_then(|size| u32::try_from(size).ok())
        .ok_or_else(|| format!("invalid range 0x{start:x}..0x{end:x}"))?;

    let (assembly_name, symbol) = match rest.strip_prefix('[') {
        Some(bracketed) => {
            let (module, symbol) = bracketed
                .split_once(']')
                .ok_or_else(|| format!("unterminated module name in {rest:?}"))?;
            (non_empty(module), symbol)
        }
        None => (None, rest),
    };

    Ok(ManagedSymbolEntry {
        base: start,
        size,
        assembly_name,
        symbol: non_empty(symbol).map(|symbol| normalize_symbol(&symbol)),
    })
}

fn non_empty(text: &str) -> Option<String> {
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Rewrite a runtime-mangled method name into display form.
///
/// - `/` (nested type) and `:` (member) become `.`; a `.` right after `:`
///   is absorbed (`:.ctor` → `.ctor`)
/// - a missing space after `,` is inserted
/// - a space before `(` is removed
#[must_use]
pub fn normalize_symbol(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '/' => out.push('.'),
            ':' => {
                out.push('.');
                if chars.peek() == Some(&'.') {
                    chars.next();
                }
            }
            ',' => {
                out.push(',');
                if matches!(chars.peek(), Some(&next) if next != ' ') {
                    out.push(' ');
                }
            }
            ' ' if chars.peek() == Some(&'(') => {}
            other => out.push(other),
        }
    }
    out
}

/// Extract `(processId, domainSerial)` from `pmip_<pid>_<serial>.txt`.
///
/// # Errors
/// Returns [`ManagedSymbolError::FileName`] for any other name.
pub fn parse_file_name(path: &Path) -> Result<(u32, u32), ManagedSymbolError> {
    let bad = || ManagedSymbolError::FileName(path.to_path_buf());

    let name = path.file_name().and_then(|name| name.to_str()).ok_or_else(bad)?;
    let (pid, serial) = name
        .strip_prefix(FILE_PREFIX)
        .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
        .and_then(|rest| rest.split_once('_'))
        .ok_or_else(bad)?;

    Ok((pid.parse().map_err(|_| bad())?, serial.parse().map_err(|_| bad())?))
}

/// Load every managed symbol table written for `process_id` in `dir`.
///
/// A missing directory yields no tables.
///
/// # Errors
/// Returns an error if a matching file cannot be read or parsed
pub fn discover(
    dir: &Path,
    process_id: u32,
) -> Result<Vec<ManagedSymbolTable>, ManagedSymbolError> {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("Managed symbol directory {} does not exist", dir.display());
            return Ok(Vec::new());
        }
        Err(source) => return Err(ManagedSymbolError::Io { path: dir.to_path_buf(), source }),
    };

    let entries = read_dir.map(|entry| entry.map(|entry| entry.path()));
    let tables = table_paths(dir, entries, process_id)?
        .into_iter()
        .map(ManagedSymbolTable::load)
        .collect::<Result<Vec<_>, _>>()?;

    if !tables.is_empty() {
        info!("Found {} managed symbol table(s) for pid {process_id}", tables.len());
    }
    Ok(tables)
}

/// Pick the table files of `process_id` out of a directory listing. A failed
/// entry fails the whole listing.
fn table_paths(
    dir: &Path,
    entries: impl IntoIterator<Item = io::Result<PathBuf>>,
    process_id: u32,
) -> Result<Vec<PathBuf>, ManagedSymbolError> {
    let io_err = |source: io::Error| ManagedSymbolError::Io { path: dir.to_path_buf(), source };
    let prefix = format!("{FILE_PREFIX}{process_id}_");
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry.map_err(io_err)?;
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if name.starts_with(&prefix) && name.ends_with(FILE_SUFFIX) {
            paths.push(path);
        }
    }
    Ok(paths)
}
