//! C++ symbols inside shared libraries
//!
//! A V8 log only records the address range of each shared library. The
//! functions inside it come from a [`LibrarySymbolProvider`], usually backed
//! by `nm` output saved next to the log.

use rustc_hash::FxHashMap as HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// One function symbol, with addresses as the symbol table lists them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibrarySymbol {
    pub name: String,
    pub start: u64,
    /// Exclusive
    pub end: u64,
}

/// Where library symbols come from
pub trait LibrarySymbolProvider: Send + Sync {
    /// Function symbols of `library`; empty when none are known
    fn symbols(&self, library: &str) -> Result<Vec<LibrarySymbol>>;
}

/// Knows no symbols
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLibrarySymbols;

impl LibrarySymbolProvider for NoLibrarySymbols {
    fn symbols(&self, _library: &str) -> Result<Vec<LibrarySymbol>> {
        Ok(Vec::new())
    }
}

/// Reads `<dir>/<library file name>.nm`, the output of
/// `nm --demangle --defined-only --print-size` for that library
#[derive(Debug, Clone)]
pub struct NmSymbolFiles {
    dir: PathBuf,
}

impl NmSymbolFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, library: &str) -> Option<PathBuf> {
        let file_name = Path::new(library).file_name()?;
        let mut name = file_name.to_os_string();
        name.push(".nm");
        Some(self.dir.join(name))
    }
}

impl LibrarySymbolProvider for NmSymbolFiles {
    fn symbols(&self, library: &str) -> Result<Vec<LibrarySymbol>> {
        let Some(path) = self.path_for(library) else {
            return Ok(Vec::new());
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let symbols = parse_nm_output(&text);
                tracing::debug!(library, count = symbols.len(), path = %path.display(), "loaded library symbols");
                Ok(symbols)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory symbols keyed by library path
#[derive(Debug, Default, Clone)]
pub struct StaticSymbols {
    libraries: HashMap<String, Vec<LibrarySymbol>>,
}

impl StaticSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the symbols of `library`
    pub fn with_library(mut self, library: &str, symbols: Vec<LibrarySymbol>) -> Self {
        self.libraries.insert(library.to_string(), symbols);
        self
    }
}

impl LibrarySymbolProvider for StaticSymbols {
    fn symbols(&self, library: &str) -> Result<Vec<LibrarySymbol>> {
        Ok(self.libraries.get(library).cloned().unwrap_or_default())
    }
}

/// Parse `nm` output, keeping text symbols (`t`, `T`, `w`, `W`).
///
/// Lines are `ADDR [SIZE] TYPE NAME`. A symbol without a size ends where the
/// next one starts; a trailing one without a size is dropped.
pub fn parse_nm_output(text: &str) -> Vec<LibrarySymbol> {
    let mut parsed: Vec<(u64, Option<u64>, String)> = Vec::new();
    for line in text.lines() {
        let mut rest = line.trim_start();
        let Some((addr, after)) = rest.split_once(char::is_whitespace) else {
            continue;
        };
        let Ok(start) = u64::from_str_radix(addr, 16) else {
            continue;
        };
        rest = after.trim_start();
        let (size, after) = match rest.split_once(char::is_whitespace) {
            Some((field, after)) if field.len() > 1 => match u64::from_str_radix(field, 16) {
                Ok(size) => (Some(size), after.trim_start()),
                Err(_) => continue,
            },
            _ => (None, rest),
        };
        let Some((kind, name)) = after.split_once(char::is_whitespace) else {
            continue;
        };
        if !matches!(kind, "t" | "T" | "w" | "W") || name.trim().is_empty() {
            continue;
        }
        parsed.push((start, size, name.trim().to_string()));
    }

    parsed.sort_by_key(|(start, _, _)| *start);
    let mut symbols = Vec::with_capacity(parsed.len());
    for (idx, (start, size, name)) in parsed.iter().enumerate() {
        let end = match size {
            Some(size) => start.saturating_add(*size),
            None => match parsed.get(idx + 1) {
                Some((next, _, _)) => *next,
                None => continue,
            },
        };
        if end > *start {
            symbols.push(LibrarySymbol {
                name: name.clone(),
                start: *start,
                end,
            });
        }
    }
    symbols
}

/// Rebase `symbols` into a library mapped at `[start, end)`.
///
/// Addresses smaller than the library size are offsets into the library;
/// larger ones are taken as already absolute. Symbols that do not fit inside
/// the mapping are dropped.
pub fn place_symbols(symbols: &[LibrarySymbol], start: u64, end: u64) -> Vec<LibrarySymbol> {
    let size = end.saturating_sub(start);
    symbols
        .iter()
        .filter_map(|symbol| {
            let slide = if symbol.start < size { start } else { 0 };
            let placed = LibrarySymbol {
                name: symbol.name.clone(),
                start: symbol.start.checked_add(slide)?,
                end: symbol.end.checked_add(slide)?,
            };
            (placed.start >= start && placed.end <= end).then_some(placed)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn symbol(name: &str, start: u64, end: u64) -> LibrarySymbol {
        LibrarySymbol {
            name: name.to_string(),
            start,
            end,
        }
    }

    #[test]
    fn test_parse_nm_output() {
        let text = "\
0000000000002000 0000000000000100 T v8::internal::Runtime_Foo(int, v8::internal::Object*)
0000000000001000 t helper
0000000000001800 W inline_thing
0000000000003000 0000000000000010 D some_data
                 U undefined_import
0000000000004000 T last_without_size
";
        assert_eq!(
            parse_nm_output(text),
            vec![
                symbol("helper", 0x1000, 0x1800),
                symbol("inline_thing", 0x1800, 0x2000),
                symbol("v8::internal::Runtime_Foo(int, v8::internal::Object*)", 0x2000, 0x2100),
            ]
        );
    }

    #[test]
    fn test_place_symbols() {
        let symbols = vec![
            symbol("relative", 0x100, 0x200),
            symbol("absolute", 0x7000_0400, 0x7000_0500),
            symbol("outside", 0x9000_0000, 0x9000_0010),
        ];
        assert_eq!(
            place_symbols(&symbols, 0x7000_0000, 0x7001_0000),
            vec![
                symbol("relative", 0x7000_0100, 0x7000_0200),
                symbol("absolute", 0x7000_0400, 0x7000_0500),
            ]
        );
    }

    #[test]
    fn test_nm_files_by_library_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("libfoo.so.1.nm"), "0000000000000010 0000000000000010 T foo\n").unwrap();
        let provider = NmSymbolFiles::new(dir.path());
        assert_eq!(provider.symbols("/usr/lib/libfoo.so.1").unwrap(), vec![symbol("foo", 0x10, 0x20)]);
        assert!(provider.symbols("/usr/lib/libbar.so").unwrap().is_empty());
    }
}
