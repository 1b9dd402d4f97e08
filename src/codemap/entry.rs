//! Code entries stored in the [`CodeMap`](super::CodeMap) arena

use std::fmt;

use crate::versions::{CodeKind, FunctionState};

/// Stable handle to an entry in the code arena
///
/// Handles are never reused: entries evicted from the address indices stay
/// in the arena so call-tree nodes and samples can keep referring to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeId(pub(crate) u32);

impl CodeId {
    /// Position of this entry in the arena
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which of the four entry shapes an entry has
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeFlavor {
    /// Library, static or builtin code; never moved or deleted
    Plain,
    /// JIT code without a known function
    Dynamic,
    /// JIT code compiled from a [`CodeFlavor::SharedFunction`]
    DynamicFunc {
        func: CodeId,
        state: FunctionState,
    },
    /// The logical function behind any number of compiled code objects
    SharedFunction,
}

/// One `C<offset>O<offset>[I<id>]` triple from `code-source-info`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionEntry {
    /// Offset into the machine code
    pub code_offset: u64,
    /// Offset into the script source
    pub script_offset: u64,
    /// Inlining id when the position belongs to inlined code
    pub inlining_id: Option<usize>,
}

/// One `F<fn>O<offset>[I<parent>]` triple: where an inlined call happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InliningPosition {
    /// Index into [`SourceInfo::inlined_functions`]
    pub function_index: usize,
    /// Script offset of the call site in the caller
    pub script_offset: u64,
    /// Inlining id of the caller, `None` when the caller is the outer function
    pub parent: Option<usize>,
}

/// Source mapping attached by `code-source-info`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceInfo {
    pub script_id: u32,
    pub start: u64,
    pub end: u64,
    /// Sorted by `code_offset`
    pub positions: Vec<PositionEntry>,
    /// Indexed by inlining id
    pub inlining: Vec<InliningPosition>,
    /// Shared function addresses, indexed by function index
    pub inlined_functions: Vec<u64>,
}

impl SourceInfo {
    /// The last position at or before `code_offset`
    pub fn position_at(&self, code_offset: u64) -> Option<&PositionEntry> {
        let idx = self
            .positions
            .partition_point(|p| p.code_offset <= code_offset);
        idx.checked_sub(1).map(|i| &self.positions[i])
    }
}

/// What two entries are compared by when deciding whether they are the same
/// function
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryIdentity {
    Script { script_id: u32, start: u64 },
    Named { name: String, code_type: String },
}

/// A unit of code: JIT output, a builtin, a native library, or a function
#[derive(Debug, Clone)]
pub struct CodeEntry {
    pub size: u64,
    pub name: String,
    /// Log type tag (`JS`, `CPP`, `SHARED_LIB`, `Builtin`, `Stub`, ...)
    pub code_type: String,
    pub kind: Option<CodeKind>,
    pub flavor: CodeFlavor,
    pub timestamp: Option<u64>,
    pub source: Option<SourceInfo>,
    pub deopt_reasons: Vec<String>,
    pub optimization_disabled: Option<String>,
    pub(crate) name_updated: bool,
}

impl CodeEntry {
    /// Type tag of C++ code inside a shared library
    pub const CPP: &'static str = "CPP";
    /// Type tag of a whole shared library
    pub const SHARED_LIB: &'static str = "SHARED_LIB";
    /// Type tag of VM pseudo functions like `(program)`
    pub const VM: &'static str = "VM";

    fn with_flavor(size: u64, name: impl Into<String>, code_type: impl Into<String>, flavor: CodeFlavor) -> Self {
        Self {
            size,
            name: name.into(),
            code_type: code_type.into(),
            kind: None,
            flavor,
            timestamp: None,
            source: None,
            deopt_reasons: Vec::new(),
            optimization_disabled: None,
            name_updated: false,
        }
    }

    /// Library, static or builtin code
    pub fn plain(size: u64, name: impl Into<String>, code_type: impl Into<String>) -> Self {
        Self::with_flavor(size, name, code_type, CodeFlavor::Plain)
    }

    /// JIT code without a backing function
    pub fn dynamic(size: u64, name: impl Into<String>, code_type: impl Into<String>) -> Self {
        Self::with_flavor(size, name, code_type, CodeFlavor::Dynamic)
    }

    /// JIT code compiled from `func`
    pub fn dynamic_func(size: u64, code_type: impl Into<String>, func: CodeId, state: FunctionState) -> Self {
        Self::with_flavor(size, "", code_type, CodeFlavor::DynamicFunc { func, state })
    }

    /// A shared function; occupies no address range
    pub fn shared_function(name: impl Into<String>) -> Self {
        Self::with_flavor(0, name, "SharedFunctionInfo", CodeFlavor::SharedFunction)
    }

    /// A VM pseudo function such as `(program)` or `(gc)`
    pub fn pseudo(name: impl Into<String>) -> Self {
        Self::with_flavor(0, name, Self::VM, CodeFlavor::Plain)
    }

    /// Set the code kind reported by `code-creation`
    pub fn with_kind(mut self, kind: Option<CodeKind>) -> Self {
        self.kind = kind;
        self
    }

    /// Set the creation timestamp
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Whether this entry is JS code compiled from a known function
    pub fn is_js_function(&self) -> bool {
        matches!(self.flavor, CodeFlavor::DynamicFunc { .. })
    }

    /// Whether this entry is a shared function record
    pub fn is_shared_function(&self) -> bool {
        self.flavor == CodeFlavor::SharedFunction
    }

    /// Whether this entry was registered as dynamic (JIT) code
    pub fn is_dynamic(&self) -> bool {
        matches!(
            self.flavor,
            CodeFlavor::Dynamic | CodeFlavor::DynamicFunc { .. } | CodeFlavor::SharedFunction
        )
    }

    /// Whether this is C++ or shared library code
    pub fn is_native(&self) -> bool {
        self.code_type == Self::CPP || self.code_type == Self::SHARED_LIB
    }

    /// The backing function of a [`CodeFlavor::DynamicFunc`] entry
    pub fn func(&self) -> Option<CodeId> {
        match self.flavor {
            CodeFlavor::DynamicFunc { func, .. } => Some(func),
            _ => None,
        }
    }

    /// Tier of a [`CodeFlavor::DynamicFunc`] entry
    pub fn state(&self) -> Option<FunctionState> {
        match self.flavor {
            CodeFlavor::DynamicFunc { state, .. } => Some(state),
            _ => None,
        }
    }

    /// Name of a shared function as shown to users.
    ///
    /// V8 writes anonymous functions as an empty name or a name that starts
    /// with the location (` file.js:1:2`).
    pub fn function_display_name(&self) -> String {
        if self.name.is_empty() {
            "<anonymous>".to_string()
        } else if self.name.starts_with(' ') {
            format!("<anonymous>{}", self.name)
        } else {
            self.name.clone()
        }
    }

    /// The function name without the trailing source location
    pub fn bare_function_name(&self) -> &str {
        match self.name.split_once(' ') {
            Some((head, _)) => head,
            None => &self.name,
        }
    }

    /// Key used to decide whether two entries are the same function
    pub fn identity(&self) -> EntryIdentity {
        match &self.source {
            Some(source) => EntryIdentity::Script {
                script_id: source.script_id,
                start: source.start,
            },
            None => EntryIdentity::Named {
                name: self.name.clone(),
                code_type: self.code_type.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_display_name() {
        assert_eq!(CodeEntry::shared_function("").function_display_name(), "<anonymous>");
        assert_eq!(
            CodeEntry::shared_function(" a.js:1:1").function_display_name(),
            "<anonymous> a.js:1:1"
        );
        assert_eq!(CodeEntry::shared_function("foo a.js:1:1").bare_function_name(), "foo");
    }

    #[test]
    fn test_position_at() {
        let info = SourceInfo {
            positions: vec![
                PositionEntry { code_offset: 0, script_offset: 10, inlining_id: None },
                PositionEntry { code_offset: 8, script_offset: 20, inlining_id: Some(0) },
                PositionEntry { code_offset: 16, script_offset: 30, inlining_id: None },
            ],
            ..SourceInfo::default()
        };
        assert_eq!(info.position_at(0).map(|p| p.script_offset), Some(10));
        assert_eq!(info.position_at(12).map(|p| p.script_offset), Some(20));
        assert_eq!(info.position_at(100).map(|p| p.script_offset), Some(30));

        let empty = SourceInfo::default();
        assert!(empty.position_at(4).is_none());
    }

    #[test]
    fn test_identity_prefers_script_position() {
        let mut a = CodeEntry::dynamic(16, "foo", "JS");
        let b = CodeEntry::dynamic(32, "foo", "JS");
        assert_eq!(a.identity(), b.identity());
        a.source = Some(SourceInfo { script_id: 3, start: 40, ..SourceInfo::default() });
        assert_eq!(a.identity(), EntryIdentity::Script { script_id: 3, start: 40 });
    }
}
