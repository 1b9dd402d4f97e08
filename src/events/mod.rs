//! Deoptimization, inline cache and map histories
//!
//! Deopts and IC transitions are grouped by the source position they
//! happened at, maps by their address. Each group keeps its updates in the
//! order the log delivered them.

use rustc_hash::FxHashMap as HashMap;
use serde::Serialize;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::versions::{DeoptimizeKind, IcState};

/// A position in a script
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FilePosition {
    pub uri: String,
    /// 1-based
    pub line: u32,
    /// 1-based
    pub column: u32,
}

impl FilePosition {
    pub fn new(uri: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            uri: uri.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for FilePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.uri, self.line, self.column)
    }
}

impl FromStr for FilePosition {
    type Err = Error;

    /// Parses `uri:line:column`, optionally wrapped in `<...>` the way
    /// `code-deopt` writes it
    fn from_str(s: &str) -> Result<Self> {
        let inner = s.trim();
        let inner = inner
            .strip_prefix('<')
            .and_then(|rest| rest.strip_suffix('>'))
            .unwrap_or(inner);
        let invalid = || Error::parse_error(format!("invalid source position '{}'", s));
        let mut parts = inner.rsplitn(3, ':');
        let column = parts.next().and_then(|c| c.parse().ok()).ok_or_else(invalid)?;
        let line = parts.next().and_then(|l| l.parse().ok()).ok_or_else(invalid)?;
        let uri = parts.next().filter(|u| !u.is_empty()).ok_or_else(invalid)?;
        Ok(Self::new(uri, line, column))
    }
}

// ============================================================================
// Updates
// ============================================================================

/// One `code-deopt`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeoptUpdate {
    /// Microseconds
    pub timestamp: u64,
    pub kind: DeoptimizeKind,
    pub reason: String,
    /// Name of the deoptimized code, when it was known
    pub function_name: Option<String>,
    pub inlining_id: i64,
}

/// One IC state transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IcUpdate {
    pub timestamp: u64,
    /// Record name: `LoadIC`, `KeyedStoreIC`, ...
    pub ic_type: String,
    pub old_state: IcState,
    pub new_state: IcState,
    pub map: u64,
    pub key: String,
    pub modifier: String,
    pub slow_reason: String,
    pub function_name: Option<String>,
}

/// What happened to a map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MapEvent {
    Create,
    Details,
    /// `map` records; the string is the transition type V8 logged
    Transition,
}

/// One map event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapUpdate {
    pub timestamp: u64,
    pub event: MapEvent,
    /// Transition type, details text or empty
    pub detail: String,
    /// Source map of a transition
    pub from: Option<u64>,
    pub reason: String,
    pub name: String,
    pub position: Option<FilePosition>,
}

// ============================================================================
// Entries
// ============================================================================

/// Deopts at one position
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeoptEntry {
    pub position: FilePosition,
    pub updates: Vec<DeoptUpdate>,
}

impl DeoptEntry {
    /// The most severe bailout kind seen
    pub fn worst_kind(&self) -> Option<DeoptimizeKind> {
        self.updates.iter().map(|u| u.kind).max_by_key(|k| k.severity())
    }

    pub fn latest(&self) -> Option<&DeoptUpdate> {
        self.updates.last()
    }
}

/// IC transitions at one position
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IcEntry {
    pub position: FilePosition,
    pub updates: Vec<IcUpdate>,
}

impl IcEntry {
    /// The most polymorphic state the IC reached
    pub fn worst_state(&self) -> Option<IcState> {
        self.updates.iter().map(|u| u.new_state).max_by_key(|s| s.severity())
    }

    pub fn latest(&self) -> Option<&IcUpdate> {
        self.updates.last()
    }

    /// Distinct maps seen, in order of first appearance
    pub fn maps(&self) -> Vec<u64> {
        let mut maps = Vec::new();
        for update in &self.updates {
            if update.map != 0 && !maps.contains(&update.map) {
                maps.push(update.map);
            }
        }
        maps
    }
}

/// History of one map
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapEntry {
    pub id: u64,
    pub updates: Vec<MapUpdate>,
}

impl MapEntry {
    pub fn latest(&self) -> Option<&MapUpdate> {
        self.updates.last()
    }

    /// Latest details text
    pub fn details(&self) -> Option<&str> {
        self.updates
            .iter()
            .rev()
            .find(|u| u.event == MapEvent::Details)
            .map(|u| u.detail.as_str())
    }

    /// Map this one was transitioned from, if logged
    pub fn parent(&self) -> Option<u64> {
        self.updates.iter().rev().find_map(|u| u.from)
    }
}

/// Entries in first-seen order with lookup by key
#[derive(Debug, Clone)]
struct EntryIndex<K, E> {
    entries: Vec<E>,
    index: HashMap<K, usize>,
}

impl<K: Hash + Eq + Clone, E> EntryIndex<K, E> {
    fn get_or_insert_with(&mut self, key: &K, make: impl FnOnce() -> E) -> &mut E {
        let idx = match self.index.get(key) {
            Some(idx) => *idx,
            None => {
                self.entries.push(make());
                self.index.insert(key.clone(), self.entries.len() - 1);
                self.entries.len() - 1
            }
        };
        &mut self.entries[idx]
    }

    fn get(&self, key: &K) -> Option<&E> {
        self.index.get(key).map(|idx| &self.entries[*idx])
    }
}

impl<K, E> Default for EntryIndex<K, E> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::default(),
        }
    }
}

/// A function V8 gave up optimizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisabledOptimization {
    pub function_name: String,
    pub reason: String,
}

/// All non-profile events of a log
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    deopts: EntryIndex<FilePosition, DeoptEntry>,
    ics: EntryIndex<FilePosition, IcEntry>,
    maps: EntryIndex<u64, MapEntry>,
    disabled: Vec<DisabledOptimization>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_deopt(&mut self, position: FilePosition, update: DeoptUpdate) {
        self.deopts
            .get_or_insert_with(&position, || DeoptEntry {
                position: position.clone(),
                updates: Vec::new(),
            })
            .updates
            .push(update);
    }

    pub fn add_ic(&mut self, position: FilePosition, update: IcUpdate) {
        self.ics
            .get_or_insert_with(&position, || IcEntry {
                position: position.clone(),
                updates: Vec::new(),
            })
            .updates
            .push(update);
    }

    pub fn add_map_update(&mut self, id: u64, update: MapUpdate) {
        self.maps
            .get_or_insert_with(&id, || MapEntry {
                id,
                updates: Vec::new(),
            })
            .updates
            .push(update);
    }

    pub fn add_disabled_optimization(&mut self, function_name: &str, reason: &str) {
        self.disabled.push(DisabledOptimization {
            function_name: function_name.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Deopt groups in first-seen order
    pub fn deopts(&self) -> &[DeoptEntry] {
        &self.deopts.entries
    }

    pub fn ics(&self) -> &[IcEntry] {
        &self.ics.entries
    }

    pub fn maps(&self) -> &[MapEntry] {
        &self.maps.entries
    }

    pub fn disabled_optimizations(&self) -> &[DisabledOptimization] {
        &self.disabled
    }

    pub fn deopt_at(&self, position: &FilePosition) -> Option<&DeoptEntry> {
        self.deopts.get(position)
    }

    pub fn ic_at(&self, position: &FilePosition) -> Option<&IcEntry> {
        self.ics.get(position)
    }

    pub fn map(&self, id: u64) -> Option<&MapEntry> {
        self.maps.get(&id)
    }

    /// Deopt groups sorted by number of deopts, most first
    pub fn deopts_by_count(&self) -> Vec<&DeoptEntry> {
        let mut sorted: Vec<&DeoptEntry> = self.deopts.entries.iter().collect();
        sorted.sort_by(|a, b| {
            b.updates
                .len()
                .cmp(&a.updates.len())
                .then_with(|| a.position.cmp(&b.position))
        });
        sorted
    }

    /// IC groups sorted by worst state, most polymorphic first
    pub fn ics_by_severity(&self) -> Vec<&IcEntry> {
        let mut sorted: Vec<&IcEntry> = self.ics.entries.iter().collect();
        sorted.sort_by(|a, b| {
            let severity = |e: &IcEntry| e.worst_state().map_or(0, IcState::severity);
            severity(b)
                .cmp(&severity(a))
                .then_with(|| a.position.cmp(&b.position))
        });
        sorted
    }
}
