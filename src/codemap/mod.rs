//! Address-keyed registry of code entries
//!
//! Library and static code live in their own ordered indices and are routed
//! to through a page bitmap, so most lookups for native frames never touch
//! the (much larger and constantly churning) dynamic index. Dynamic code may
//! overlap earlier dynamic code when the JIT recycles memory; the newer entry
//! evicts the older ones.
//!
//! All entries are owned by an arena and referred to by [`CodeId`].

mod entry;

pub use entry::{
    CodeEntry, CodeFlavor, CodeId, EntryIdentity, InliningPosition, PositionEntry, SourceInfo,
};

use rustc_hash::FxHashMap as HashMap;
use rustc_hash::FxHashSet as HashSet;

use crate::error::{Error, Result};
use crate::splay::SplayTree;

/// log2 of the page size used to route lookups to the static indices
pub const PAGE_ALIGNMENT: u32 = 12;

/// A successful address lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    pub id: CodeId,
    /// Start address of the entry
    pub start: u64,
    /// `addr - start`
    pub offset: u64,
}

/// Hands out `name {n}` suffixes for repeated dynamic names
#[derive(Debug, Default, Clone)]
struct NameGenerator {
    known: HashMap<String, u32>,
}

impl NameGenerator {
    fn name_for(&mut self, name: &str) -> String {
        match self.known.get_mut(name) {
            None => {
                self.known.insert(name.to_string(), 0);
                name.to_string()
            }
            Some(count) => {
                *count += 1;
                format!("{} {{{}}}", name, count)
            }
        }
    }
}

/// The code registry
#[derive(Debug, Default)]
pub struct CodeMap {
    arena: Vec<CodeEntry>,
    dynamics: SplayTree<u64, CodeId>,
    statics: SplayTree<u64, CodeId>,
    libraries: SplayTree<u64, CodeId>,
    pages: HashSet<u64>,
    names: NameGenerator,
}

impl CodeMap {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Arena
    // ========================================================================

    /// Entry behind `id`
    pub fn entry(&self, id: CodeId) -> &CodeEntry {
        &self.arena[id.index()]
    }

    /// Mutable entry behind `id`
    pub fn entry_mut(&mut self, id: CodeId) -> &mut CodeEntry {
        &mut self.arena[id.index()]
    }

    /// Number of entries ever created, including evicted ones
    pub fn arena_len(&self) -> usize {
        self.arena.len()
    }

    /// Store an entry that is not reachable through any address
    pub fn add_detached(&mut self, entry: CodeEntry) -> CodeId {
        let id = CodeId(self.arena.len() as u32);
        self.arena.push(entry);
        id
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a shared library spanning `[start, start + size)`
    pub fn add_library(&mut self, start: u64, entry: CodeEntry) -> CodeId {
        self.mark_pages(start, start.saturating_add(entry.size));
        let id = self.add_detached(entry);
        self.libraries.insert(start, id);
        id
    }

    /// Register a static symbol. Static code must fall inside a library whose
    /// pages are already marked to be found.
    pub fn add_static_code(&mut self, start: u64, entry: CodeEntry) -> CodeId {
        let id = self.add_detached(entry);
        self.statics.insert(start, id);
        id
    }

    /// Register dynamic code, evicting any dynamic entries it overlaps
    pub fn add_code(&mut self, start: u64, entry: CodeEntry) -> CodeId {
        let end = start.saturating_add(entry.size);
        self.delete_all_covered(start, end);
        self.dynamics.remove(&start);
        let id = self.add_detached(entry);
        self.dynamics.insert(start, id);
        id
    }

    /// Relocate the dynamic entry at `from`
    pub fn move_code(&mut self, from: u64, to: u64) -> Result<()> {
        let id = self
            .dynamics
            .remove(&from)
            .ok_or(Error::CodeNotFound { address: from })?;
        let end = to.saturating_add(self.entry(id).size);
        self.delete_all_covered(to, end);
        self.dynamics.remove(&to);
        self.dynamics.insert(to, id);
        Ok(())
    }

    /// Drop the dynamic entry starting at `start`, if any
    pub fn delete_code(&mut self, start: u64) -> Option<CodeId> {
        self.dynamics.remove(&start)
    }

    /// Keep only the dynamic entries for which `keep` returns `true`
    pub fn retain_dynamic(&mut self, mut keep: impl FnMut(u64, CodeId, &CodeEntry) -> bool) -> usize {
        let before = self.dynamics.len();
        let arena = &self.arena;
        self.dynamics.retain(|addr, id| keep(*addr, *id, &arena[id.index()]));
        before - self.dynamics.len()
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Entry covering `addr`
    pub fn find_entry(&mut self, addr: u64) -> Option<CodeId> {
        self.find_address(addr).map(|located| located.id)
    }

    /// Entry covering `addr` together with its start address.
    ///
    /// Dynamic entries get their name deduplicated the first time they are
    /// returned from here.
    pub fn find_address(&mut self, addr: u64) -> Option<Located> {
        if self.pages.contains(&(addr >> PAGE_ALIGNMENT)) {
            return Self::find_in_tree(&mut self.statics, &self.arena, addr)
                .or_else(|| Self::find_in_tree(&mut self.libraries, &self.arena, addr));
        }
        if !self.in_dynamic_range(addr) {
            return None;
        }
        let located = Self::find_in_tree(&mut self.dynamics, &self.arena, addr)?;
        let entry = &mut self.arena[located.id.index()];
        if !entry.name_updated && !entry.name.is_empty() {
            entry.name = self.names.name_for(&entry.name);
            entry.name_updated = true;
        }
        Some(located)
    }

    /// Read-only variant of [`CodeMap::find_address`]: no splaying and no
    /// name deduplication
    pub fn lookup(&self, addr: u64) -> Option<Located> {
        if self.pages.contains(&(addr >> PAGE_ALIGNMENT)) {
            return Self::peek_in_tree(&self.statics, &self.arena, addr)
                .or_else(|| Self::peek_in_tree(&self.libraries, &self.arena, addr));
        }
        if !self.in_dynamic_range(addr) {
            return None;
        }
        Self::peek_in_tree(&self.dynamics, &self.arena, addr)
    }

    /// Dynamic entry starting exactly at `addr`
    pub fn find_dynamic_entry_by_start_address(&mut self, addr: u64) -> Option<CodeId> {
        self.dynamics.get(&addr).copied()
    }

    /// Start address of a live dynamic entry; linear in the number of
    /// dynamic entries
    pub fn dynamic_address_of(&self, id: CodeId) -> Option<u64> {
        self.dynamics
            .iter()
            .find(|(_, v)| **v == id)
            .map(|(addr, _)| *addr)
    }

    /// Live dynamic entries in address order
    pub fn dynamic_entries(&self) -> impl Iterator<Item = (u64, CodeId)> + '_ {
        self.dynamics.iter().map(|(addr, id)| (*addr, *id))
    }

    /// Static entries in address order
    pub fn static_entries(&self) -> impl Iterator<Item = (u64, CodeId)> + '_ {
        self.statics.iter().map(|(addr, id)| (*addr, *id))
    }

    /// Libraries in address order
    pub fn libraries(&self) -> impl Iterator<Item = (u64, CodeId)> + '_ {
        self.libraries.iter().map(|(addr, id)| (*addr, *id))
    }

    /// Number of live dynamic entries
    pub fn dynamic_len(&self) -> usize {
        self.dynamics.len()
    }

    /// Rendered name of an entry, as used for call-tree labels
    pub fn display_name(&self, id: CodeId) -> String {
        let entry = self.entry(id);
        match entry.flavor {
            CodeFlavor::Plain => entry.name.clone(),
            CodeFlavor::Dynamic => format!("{}: {}", entry.code_type, entry.name),
            CodeFlavor::DynamicFunc { func, state } => format!(
                "{}: {}{}",
                entry.code_type,
                state.prefix(),
                self.entry(func).function_display_name()
            ),
            CodeFlavor::SharedFunction => entry.function_display_name(),
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn in_dynamic_range(&self, addr: u64) -> bool {
        let (Some(min), Some(max)) = (self.dynamics.find_min(), self.dynamics.find_max()) else {
            return false;
        };
        let max_end = self
            .dynamics
            .key(max)
            .saturating_add(self.arena[self.dynamics.value(max).index()].size);
        addr >= *self.dynamics.key(min) && addr < max_end
    }

    fn find_in_tree(
        tree: &mut SplayTree<u64, CodeId>,
        arena: &[CodeEntry],
        addr: u64,
    ) -> Option<Located> {
        let node = tree.find_greatest_less_than_or_equal(&addr)?;
        Self::contains(tree, node, arena, addr)
    }

    fn peek_in_tree(tree: &SplayTree<u64, CodeId>, arena: &[CodeEntry], addr: u64) -> Option<Located> {
        let node = tree.peek_greatest_less_than_or_equal(&addr)?;
        Self::contains(tree, node, arena, addr)
    }

    fn contains(
        tree: &SplayTree<u64, CodeId>,
        node: crate::splay::NodeId,
        arena: &[CodeEntry],
        addr: u64,
    ) -> Option<Located> {
        let start = *tree.key(node);
        let id = *tree.value(node);
        let size = arena[id.index()].size;
        (addr >= start && addr < start.saturating_add(size)).then_some(Located {
            id,
            start,
            offset: addr - start,
        })
    }

    fn mark_pages(&mut self, start: u64, end: u64) {
        let first = start >> PAGE_ALIGNMENT;
        let last = end.saturating_sub(1).max(start) >> PAGE_ALIGNMENT;
        for page in first..=last {
            self.pages.insert(page);
        }
    }

    /// Remove every dynamic entry overlapping `[start, end)`, walking down
    /// from the end of the range.
    fn delete_all_covered(&mut self, start: u64, end: u64) {
        if end <= start {
            return;
        }
        let mut doomed = Vec::new();
        let mut addr = end - 1;
        loop {
            let Some(node) = self.dynamics.find_greatest_less_than_or_equal(&addr) else {
                break;
            };
            let node_start = *self.dynamics.key(node);
            let node_end = node_start.saturating_add(self.arena[self.dynamics.value(node).index()].size);
            if node_start < end && start < node_end {
                doomed.push(node_start);
            }
            if node_start <= start || node_start == 0 {
                break;
            }
            addr = node_start - 1;
        }
        for addr in doomed {
            self.dynamics.remove(&addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::versions::FunctionState;

    fn name_at(map: &mut CodeMap, addr: u64) -> Option<String> {
        map.find_entry(addr).map(|id| map.entry(id).name.clone())
    }

    #[test]
    fn test_dynamic_lookup() {
        let mut map = CodeMap::new();
        map.add_code(0x1500, CodeEntry::dynamic(0x200, "code1", "JS"));
        map.add_code(0x1700, CodeEntry::dynamic(0x100, "code2", "JS"));
        map.add_code(0x1900, CodeEntry::dynamic(0x50, "code3", "JS"));
        map.add_code(0x1950, CodeEntry::dynamic(0x10, "code4", "JS"));

        assert_eq!(name_at(&mut map, 0x1500).as_deref(), Some("code1"));
        assert_eq!(name_at(&mut map, 0x1500 + 0x100).as_deref(), Some("code1"));
        assert_eq!(name_at(&mut map, 0x1500 + 0x200 - 1).as_deref(), Some("code1"));
        assert_eq!(name_at(&mut map, 0x1700).as_deref(), Some("code2"));
        assert_eq!(name_at(&mut map, 0x1900 + 0x28).as_deref(), Some("code3"));
        assert_eq!(name_at(&mut map, 0x1950 + 0x7).as_deref(), Some("code4"));
        assert!(map.find_entry(0x1950 + 0x10).is_none());
        assert!(map.find_entry(0x1500 - 1).is_none());
        assert!(map.find_entry(0x1800).is_none());
    }

    #[test]
    fn test_library_and_static_lookup() {
        let mut map = CodeMap::new();
        map.add_library(0x1500, CodeEntry::plain(0x3000, "lib1", CodeEntry::SHARED_LIB));
        map.add_static_code(0x1500, CodeEntry::plain(0x100, "lib1_f1", CodeEntry::CPP));
        map.add_static_code(0x1600, CodeEntry::plain(0x50, "lib1_f2", CodeEntry::CPP));

        assert_eq!(name_at(&mut map, 0x1500 + 0x10).as_deref(), Some("lib1_f1"));
        assert_eq!(name_at(&mut map, 0x1600 + 0x10).as_deref(), Some("lib1_f2"));
        // Holes between statics resolve to the library.
        assert_eq!(name_at(&mut map, 0x1700).as_deref(), Some("lib1"));
        assert_eq!(name_at(&mut map, 0x1500 + 0x3000 - 1).as_deref(), Some("lib1"));
        assert!(map.find_entry(0x1500 + 0x3000).is_none());
    }

    #[test]
    fn test_overlap_eviction() {
        let mut map = CodeMap::new();
        let a = map.add_code(0x1000, CodeEntry::dynamic(0x10, "a", "JS"));
        let b = map.add_code(0x1010, CodeEntry::dynamic(0x10, "b", "JS"));
        let c = map.add_code(0x1020, CodeEntry::dynamic(0x10, "c", "JS"));
        let d = map.add_code(0x1040, CodeEntry::dynamic(0x10, "d", "JS"));

        let e = map.add_code(0x1008, CodeEntry::dynamic(0x18, "e", "JS"));
        let live: Vec<CodeId> = map.dynamic_entries().map(|(_, id)| id).collect();
        assert_eq!(live, vec![e, c, d]);
        assert!(!live.contains(&a) && !live.contains(&b));
        assert_eq!(map.find_entry(0x1008), Some(e));
        assert_eq!(map.find_entry(0x101f), Some(e));
        assert_eq!(map.find_entry(0x1020), Some(c));
        assert!(map.find_entry(0x1000).is_none());
    }

    #[test]
    fn test_move_code() {
        let mut map = CodeMap::new();
        let foo = map.add_code(0x1000, CodeEntry::dynamic(0x20, "foo", "JS"));
        let bar = map.add_code(0x2010, CodeEntry::dynamic(0x20, "bar", "JS"));

        map.move_code(0x1000, 0x2000).unwrap();
        assert!(map.find_entry(0x1008).is_none());
        assert_eq!(map.find_entry(0x2008), Some(foo));
        assert_eq!(map.find_dynamic_entry_by_start_address(0x2010), None, "bar was evicted");
        assert!(map.dynamic_entries().all(|(_, id)| id != bar));
    }

    #[test]
    fn test_move_missing_code_leaves_map_unchanged() {
        let mut map = CodeMap::new();
        map.add_code(0x1000, CodeEntry::dynamic(0x20, "foo", "JS"));
        let before: Vec<_> = map.dynamic_entries().collect();

        let err = map.move_code(0x3000, 0x1000).unwrap_err();
        assert!(matches!(err, Error::CodeNotFound { address: 0x3000 }));
        assert_eq!(map.dynamic_entries().collect::<Vec<_>>(), before);
    }

    #[test]
    fn test_delete_code() {
        let mut map = CodeMap::new();
        let foo = map.add_code(0x1000, CodeEntry::dynamic(0x20, "foo", "JS"));
        assert_eq!(map.delete_code(0x1008), None);
        assert_eq!(map.delete_code(0x1000), Some(foo));
        assert!(map.find_entry(0x1000).is_none());
        // The arena keeps the entry alive for existing references.
        assert_eq!(map.entry(foo).name, "foo");
    }

    #[test]
    fn test_lazy_name_dedup() {
        let mut map = CodeMap::new();
        map.add_code(0x1000, CodeEntry::dynamic(0x10, "stub", "Stub"));
        map.add_code(0x2000, CodeEntry::dynamic(0x10, "stub", "Stub"));
        map.add_code(0x3000, CodeEntry::dynamic(0x10, "stub", "Stub"));

        // Suffixes follow lookup order, not insertion order.
        assert_eq!(name_at(&mut map, 0x3000).as_deref(), Some("stub"));
        assert_eq!(name_at(&mut map, 0x1000).as_deref(), Some("stub {1}"));
        assert_eq!(name_at(&mut map, 0x3004).as_deref(), Some("stub"));
        // Read-only lookup never renames.
        let located = map.lookup(0x2000).unwrap();
        assert_eq!(map.entry(located.id).name, "stub");
        assert_eq!(name_at(&mut map, 0x2000).as_deref(), Some("stub {2}"));
    }

    #[test]
    fn test_display_names() {
        let mut map = CodeMap::new();
        let func = map.add_code(0x9000, CodeEntry::shared_function("foo a.js:1:1"));
        let code = map.add_code(0x1000, CodeEntry::dynamic_func(0x20, "JS", func, FunctionState::Turbofan));
        let stub = map.add_code(0x2000, CodeEntry::dynamic(0x20, "ArgumentsAdaptor", "Builtin"));
        let anon = map.add_code(0x9100, CodeEntry::shared_function(" a.js:5:1"));

        assert_eq!(map.display_name(code), "JS: *foo a.js:1:1");
        assert_eq!(map.display_name(stub), "Builtin: ArgumentsAdaptor");
        assert_eq!(map.display_name(anon), "<anonymous> a.js:5:1");
        // Shared functions are zero sized and never match an address.
        assert!(map.find_entry(0x9000).is_none());
    }

    #[test]
    fn test_retain_dynamic() {
        let mut map = CodeMap::new();
        map.add_code(0x1000, CodeEntry::shared_function("a"));
        map.add_code(0x1100, CodeEntry::dynamic(0x10, "b", "JS"));
        let removed = map.retain_dynamic(|_, _, entry| !entry.is_shared_function());
        assert_eq!(removed, 1);
        assert_eq!(map.dynamic_len(), 1);
    }
}
