//! Scripts and the compact position encodings of `code-source-info`

use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use rustc_hash::FxHashMap as HashMap;
use rustc_hash::FxHashSet as HashSet;
use std::path::PathBuf;

use crate::codemap::{InliningPosition, PositionEntry};
use crate::error::{Error, Result};

static POSITION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"C(\d+)O(\d+)(?:I(\d+))?").unwrap());
static INLINING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"F(\d+)O(\d+)(?:I(\d+))?").unwrap());
static FUNCTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"S(0x[0-9a-fA-F]+)").unwrap());

fn number<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::parse_error(format!("invalid {} '{}'", what, raw)))
}

fn ensure_matched(encoded: &str, matched: usize, what: &str) -> Result<()> {
    if matched == 0 && !encoded.is_empty() {
        return Err(Error::parse_error(format!("malformed {} '{}'", what, encoded)));
    }
    Ok(())
}

/// Parse `C<code>O<script>[I<inlining>]...` into entries sorted by code offset
pub fn parse_positions(encoded: &str) -> Result<Vec<PositionEntry>> {
    let mut positions = Vec::new();
    for caps in POSITION_RE.captures_iter(encoded) {
        positions.push(PositionEntry {
            code_offset: number(&caps[1], "code offset")?,
            script_offset: number(&caps[2], "script offset")?,
            inlining_id: caps.get(3).map(|m| number(m.as_str(), "inlining id")).transpose()?,
        });
    }
    ensure_matched(encoded, positions.len(), "source positions")?;
    positions.sort_by_key(|p| p.code_offset);
    Ok(positions)
}

/// Parse `F<fn>O<script>[I<parent>]...`, indexed by inlining id
pub fn parse_inlining_positions(encoded: &str) -> Result<Vec<InliningPosition>> {
    let mut inlining = Vec::new();
    for caps in INLINING_RE.captures_iter(encoded) {
        inlining.push(InliningPosition {
            function_index: number(&caps[1], "function index")?,
            script_offset: number(&caps[2], "script offset")?,
            parent: caps.get(3).map(|m| number(m.as_str(), "inlining id")).transpose()?,
        });
    }
    ensure_matched(encoded, inlining.len(), "inlining positions")?;
    Ok(inlining)
}

/// Parse `S0x<addr>...` into shared function addresses
pub fn parse_inlined_functions(encoded: &str) -> Result<Vec<u64>> {
    let functions = FUNCTION_RE
        .captures_iter(encoded)
        .map(|caps| crate::logreader::parse_address(&caps[1]))
        .collect::<Result<Vec<_>>>()?;
    ensure_matched(encoded, functions.len(), "inlined functions")?;
    Ok(functions)
}

// ============================================================================
// Scripts
// ============================================================================

/// A script known to the profile
#[derive(Debug)]
pub struct Script {
    pub id: u32,
    pub url: String,
    source: Option<String>,
    line_starts: OnceCell<Vec<usize>>,
}

impl Script {
    /// A script with no text yet
    pub fn new(id: u32, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            source: None,
            line_starts: OnceCell::new(),
        }
    }

    /// Script text, when the log embedded it or it was loaded
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    fn set_source(&mut self, source: String) {
        self.source = Some(source);
        self.line_starts = OnceCell::new();
    }

    /// Byte offsets at which each line begins, computed on first use
    pub fn line_starts(&self) -> Option<&[usize]> {
        let source = self.source.as_deref()?;
        let starts = self.line_starts.get_or_init(|| {
            std::iter::once(0)
                .chain(source.match_indices('\n').map(|(i, _)| i + 1))
                .collect()
        });
        Some(starts)
    }

    /// 1-based line and 0-based column of a source offset
    pub fn line_column(&self, offset: u64) -> Option<(u32, u32)> {
        let offset = usize::try_from(offset).ok()?;
        if offset > self.source.as_deref()?.len() {
            return None;
        }
        let starts = self.line_starts()?;
        let line = starts.partition_point(|&start| start <= offset);
        let column = offset - starts[line - 1];
        Some((line as u32, column as u32))
    }
}

/// Where script text comes from when the log did not embed it
pub trait ScriptSourceProvider: Send + Sync {
    /// Load the text behind `url`; `Ok(None)` when it does not exist
    fn load(&self, url: &str) -> Result<Option<String>>;
}

/// Never finds anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoScriptSource;

impl ScriptSourceProvider for NoScriptSource {
    fn load(&self, _url: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Reads scripts from the local filesystem, accepting `file://` urls
#[derive(Debug, Default, Clone)]
pub struct FsScriptSource {
    root: Option<PathBuf>,
}

impl FsScriptSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative urls against `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }
}

impl ScriptSourceProvider for FsScriptSource {
    fn load(&self, url: &str) -> Result<Option<String>> {
        if url.is_empty() || url.starts_with("node:") {
            return Ok(None);
        }
        let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
        let path = match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path,
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Scripts by id, fetching missing text at most once per script
pub struct ScriptRegistry {
    scripts: HashMap<u32, Script>,
    attempted: HashSet<u32>,
    provider: Box<dyn ScriptSourceProvider>,
}

impl ScriptRegistry {
    pub fn new(provider: Box<dyn ScriptSourceProvider>) -> Self {
        Self {
            scripts: HashMap::default(),
            attempted: HashSet::default(),
            provider,
        }
    }

    /// Record a `script-source` record
    pub fn add_source(&mut self, id: u32, url: &str, source: String) {
        let script = self.scripts.entry(id).or_insert_with(|| Script::new(id, url));
        if !url.is_empty() {
            script.url = url.to_string();
        }
        script.set_source(source);
        self.attempted.insert(id);
    }

    /// Record a script whose text the log does not carry
    pub fn add_details(&mut self, id: u32, url: &str) {
        let script = self.scripts.entry(id).or_insert_with(|| Script::new(id, url));
        if script.url.is_empty() {
            script.url = url.to_string();
        }
    }

    pub fn get(&self, id: u32) -> Option<&Script> {
        self.scripts.get(&id)
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    /// Scripts ordered by id
    pub fn iter(&self) -> impl Iterator<Item = &Script> {
        let mut scripts: Vec<&Script> = self.scripts.values().collect();
        scripts.sort_by_key(|s| s.id);
        scripts.into_iter()
    }

    /// Make sure the script has text if it can be found, asking the provider
    /// only the first time
    pub fn ensure_source(&mut self, id: u32) -> Result<()> {
        let Some(script) = self.scripts.get_mut(&id) else {
            return Ok(());
        };
        if !self.attempted.insert(id) {
            return Ok(());
        }
        if script.source.is_some() {
            return Ok(());
        }
        if let Some(text) = self.provider.load(&script.url)? {
            tracing::debug!(script = id, url = %script.url, "loaded script source");
            script.set_source(text);
        }
        Ok(())
    }

    /// 1-based line of `offset` in script `id`
    pub fn line_of(&self, id: u32, offset: u64) -> Option<u32> {
        self.get(id)?.line_column(offset).map(|(line, _)| line)
    }
}

impl Default for ScriptRegistry {
    fn default() -> Self {
        Self::new(Box::new(NoScriptSource))
    }
}

impl std::fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRegistry")
            .field("scripts", &self.scripts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_parse_positions() {
        let positions = parse_positions("C0O10C8O20I0C4O15").unwrap();
        let offsets: Vec<u64> = positions.iter().map(|p| p.code_offset).collect();
        assert_eq!(offsets, vec![0, 4, 8]);
        assert_eq!(positions[2].inlining_id, Some(0));
        assert!(parse_positions("").unwrap().is_empty());
        assert!(parse_positions("garbage").is_err());
    }

    #[test]
    fn test_parse_inlining() {
        let inlining = parse_inlining_positions("F0O5F1O9I0").unwrap();
        assert_eq!(inlining[0].parent, None);
        assert_eq!(inlining[1].function_index, 1);
        assert_eq!(inlining[1].parent, Some(0));
        assert_eq!(parse_inlined_functions("S0x10S0xab").unwrap(), vec![0x10, 0xab]);
    }

    #[test]
    fn test_line_column() {
        let mut script = Script::new(1, "a.js");
        assert!(script.line_column(0).is_none());
        script.set_source("ab\ncd\n\nx".to_string());
        assert_eq!(script.line_column(0), Some((1, 0)));
        assert_eq!(script.line_column(2), Some((1, 2)));
        assert_eq!(script.line_column(3), Some((2, 0)));
        assert_eq!(script.line_column(7), Some((4, 0)));
        assert!(script.line_column(100).is_none());
    }

    struct Counting(Arc<AtomicUsize>);

    impl ScriptSourceProvider for Counting {
        fn load(&self, _url: &str) -> Result<Option<String>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some("let x = 1;\nx++;\n".to_string()))
        }
    }

    #[test]
    fn test_provider_asked_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ScriptRegistry::new(Box::new(Counting(calls.clone())));
        registry.add_details(3, "/tmp/x.js");
        registry.ensure_source(3).unwrap();
        registry.ensure_source(3).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.line_of(3, 12), Some(2));

        registry.add_source(4, "inline.js", "y".to_string());
        registry.ensure_source(4).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fs_provider() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.js"), "run();\n").unwrap();
        let provider = FsScriptSource::with_root(dir.path());
        assert_eq!(provider.load("app.js").unwrap().as_deref(), Some("run();\n"));
        let url = format!("file://{}", dir.path().join("app.js").display());
        assert!(FsScriptSource::new().load(&url).unwrap().is_some());
        assert!(provider.load("missing.js").unwrap().is_none());
        assert!(provider.load("node:internal/main").unwrap().is_none());
    }
}
