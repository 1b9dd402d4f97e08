//! Encoding tables for the enums V8 writes into its log.
//!
//! Each table is reference data transcribed from V8's release history; keep
//! bounds ordered newest first and always end with `*`.

use serde::Serialize;

use super::{entry, Version, VersionBound, VersionTable, VersionedEnum};
use crate::error::Result;

// ============================================================================
// DeoptimizeKind
// ============================================================================

/// Why and how optimized code was abandoned (`code-deopt` bailout type)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum DeoptimizeKind {
    Eager,
    Soft,
    Lazy,
    EagerWithResume,
}

pub(crate) static DEOPTIMIZE_KIND: VersionedEnum<DeoptimizeKind> = VersionedEnum::new(
    "DeoptimizeKind",
    &[
        VersionTable {
            bound: VersionBound::at_least(10, 1, 0),
            entries: &[
                entry(0, "Eager", DeoptimizeKind::Eager),
                entry(1, "Lazy", DeoptimizeKind::Lazy),
            ],
        },
        VersionTable {
            bound: VersionBound::at_least(9, 6, 0),
            entries: &[
                entry(0, "Eager", DeoptimizeKind::Eager),
                entry(1, "Soft", DeoptimizeKind::Soft),
                entry(2, "Lazy", DeoptimizeKind::Lazy),
                entry(3, "EagerWithResume", DeoptimizeKind::EagerWithResume),
            ],
        },
        VersionTable {
            bound: VersionBound::at_least(8, 6, 79),
            entries: &[
                entry(0, "Eager", DeoptimizeKind::Eager),
                entry(1, "Soft", DeoptimizeKind::Soft),
                entry(2, "Lazy", DeoptimizeKind::Lazy),
            ],
        },
        VersionTable {
            bound: VersionBound::Any,
            entries: &[
                entry(0, "eager", DeoptimizeKind::Eager),
                entry(1, "soft", DeoptimizeKind::Soft),
                entry(2, "lazy", DeoptimizeKind::Lazy),
            ],
        },
    ],
);

impl DeoptimizeKind {
    /// Decode a bailout type as written by `version`
    pub fn decode(raw: &str, version: Version) -> Result<Self> {
        DEOPTIMIZE_KIND.decode(raw, version)
    }

    /// Print this kind the way `version` writes it
    pub fn format(self, version: Version) -> Result<&'static str> {
        DEOPTIMIZE_KIND.format(self, version)
    }

    /// Ranking used by "worst deopt" queries
    pub fn severity(self) -> u8 {
        match self {
            DeoptimizeKind::Lazy => 0,
            DeoptimizeKind::Soft => 1,
            DeoptimizeKind::EagerWithResume => 2,
            DeoptimizeKind::Eager => 3,
        }
    }
}

// ============================================================================
// CodeKind
// ============================================================================

/// The `kind` column of `code-creation` records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CodeKind {
    BytecodeHandler,
    ForTesting,
    Builtin,
    RegExp,
    WasmFunction,
    WasmToCapiFunction,
    WasmToJsFunction,
    JsToWasmFunction,
    JsToJsFunction,
    WasmInterpreterEntry,
    CWasmEntry,
    InterpretedFunction,
    Baseline,
    NativeContextIndependent,
    Turboprop,
    Maglev,
    Turbofan,
    OptimizedFunction,
    Stub,
}

pub(crate) static CODE_KIND: VersionedEnum<CodeKind> = VersionedEnum::new(
    "CodeKind",
    &[
        VersionTable {
            bound: VersionBound::at_least(11, 0, 0),
            entries: &[
                entry(0, "BYTECODE_HANDLER", CodeKind::BytecodeHandler),
                entry(1, "FOR_TESTING", CodeKind::ForTesting),
                entry(2, "BUILTIN", CodeKind::Builtin),
                entry(3, "REGEXP", CodeKind::RegExp),
                entry(4, "WASM_FUNCTION", CodeKind::WasmFunction),
                entry(5, "WASM_TO_CAPI_FUNCTION", CodeKind::WasmToCapiFunction),
                entry(6, "WASM_TO_JS_FUNCTION", CodeKind::WasmToJsFunction),
                entry(7, "JS_TO_WASM_FUNCTION", CodeKind::JsToWasmFunction),
                entry(8, "JS_TO_JS_FUNCTION", CodeKind::JsToJsFunction),
                entry(9, "C_WASM_ENTRY", CodeKind::CWasmEntry),
                entry(10, "INTERPRETED_FUNCTION", CodeKind::InterpretedFunction),
                entry(11, "BASELINE", CodeKind::Baseline),
                entry(12, "MAGLEV", CodeKind::Maglev),
                entry(13, "TURBOFAN", CodeKind::Turbofan),
            ],
        },
        VersionTable {
            bound: VersionBound::at_least(9, 2, 0),
            entries: &[
                entry(0, "BYTECODE_HANDLER", CodeKind::BytecodeHandler),
                entry(1, "FOR_TESTING", CodeKind::ForTesting),
                entry(2, "BUILTIN", CodeKind::Builtin),
                entry(3, "REGEXP", CodeKind::RegExp),
                entry(4, "WASM_FUNCTION", CodeKind::WasmFunction),
                entry(5, "WASM_TO_CAPI_FUNCTION", CodeKind::WasmToCapiFunction),
                entry(6, "WASM_TO_JS_FUNCTION", CodeKind::WasmToJsFunction),
                entry(7, "JS_TO_WASM_FUNCTION", CodeKind::JsToWasmFunction),
                entry(8, "JS_TO_JS_FUNCTION", CodeKind::JsToJsFunction),
                entry(9, "C_WASM_ENTRY", CodeKind::CWasmEntry),
                entry(10, "INTERPRETED_FUNCTION", CodeKind::InterpretedFunction),
                entry(11, "BASELINE", CodeKind::Baseline),
                entry(12, "TURBOPROP", CodeKind::Turboprop),
                entry(13, "TURBOFAN", CodeKind::Turbofan),
            ],
        },
        VersionTable {
            bound: VersionBound::at_least(8, 9, 0),
            entries: &[
                entry(0, "BYTECODE_HANDLER", CodeKind::BytecodeHandler),
                entry(1, "FOR_TESTING", CodeKind::ForTesting),
                entry(2, "BUILTIN", CodeKind::Builtin),
                entry(3, "REGEXP", CodeKind::RegExp),
                entry(4, "WASM_FUNCTION", CodeKind::WasmFunction),
                entry(5, "WASM_TO_CAPI_FUNCTION", CodeKind::WasmToCapiFunction),
                entry(6, "WASM_TO_JS_FUNCTION", CodeKind::WasmToJsFunction),
                entry(7, "JS_TO_WASM_FUNCTION", CodeKind::JsToWasmFunction),
                entry(8, "JS_TO_JS_FUNCTION", CodeKind::JsToJsFunction),
                entry(9, "C_WASM_ENTRY", CodeKind::CWasmEntry),
                entry(10, "INTERPRETED_FUNCTION", CodeKind::InterpretedFunction),
                entry(11, "NATIVE_CONTEXT_INDEPENDENT", CodeKind::NativeContextIndependent),
                entry(12, "TURBOPROP", CodeKind::Turboprop),
                entry(13, "TURBOFAN", CodeKind::Turbofan),
            ],
        },
        VersionTable {
            bound: VersionBound::Any,
            entries: &[
                entry(0, "OPTIMIZED_FUNCTION", CodeKind::OptimizedFunction),
                entry(1, "BYTECODE_HANDLER", CodeKind::BytecodeHandler),
                entry(2, "STUB", CodeKind::Stub),
                entry(3, "BUILTIN", CodeKind::Builtin),
                entry(4, "REGEXP", CodeKind::RegExp),
                entry(5, "WASM_FUNCTION", CodeKind::WasmFunction),
                entry(6, "WASM_TO_CAPI_FUNCTION", CodeKind::WasmToCapiFunction),
                entry(7, "WASM_TO_JS_FUNCTION", CodeKind::WasmToJsFunction),
                entry(8, "JS_TO_WASM_FUNCTION", CodeKind::JsToWasmFunction),
                entry(9, "JS_TO_JS_FUNCTION", CodeKind::JsToJsFunction),
                entry(10, "WASM_INTERPRETER_ENTRY", CodeKind::WasmInterpreterEntry),
                entry(11, "C_WASM_ENTRY", CodeKind::CWasmEntry),
            ],
        },
    ],
);

impl CodeKind {
    /// Decode the numeric `kind` column as written by `version`
    pub fn decode(raw: &str, version: Version) -> Result<Self> {
        CODE_KIND.decode(raw, version)
    }

    /// Print this kind the way `version` writes it
    pub fn format(self, version: Version) -> Result<&'static str> {
        CODE_KIND.format(self, version)
    }

    /// Whether code of this kind was produced by an optimizing tier
    pub fn is_optimized(self) -> bool {
        matches!(
            self,
            CodeKind::Turbofan
                | CodeKind::Turboprop
                | CodeKind::Maglev
                | CodeKind::NativeContextIndependent
                | CodeKind::OptimizedFunction
        )
    }
}

// ============================================================================
// IcState
// ============================================================================

/// Inline cache state markers (`0`, `1`, `P`, `N`, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IcState {
    NoFeedback,
    Uninitialized,
    Premonomorphic,
    Monomorphic,
    RecomputeHandler,
    Polymorphic,
    Megadom,
    Megamorphic,
    Generic,
}

pub(crate) static IC_STATE: VersionedEnum<IcState> = VersionedEnum::new(
    "IcState",
    &[
        VersionTable {
            bound: VersionBound::at_least(9, 4, 0),
            entries: &[
                entry(0, "X", IcState::NoFeedback),
                entry(1, "0", IcState::Uninitialized),
                entry(2, "1", IcState::Monomorphic),
                entry(3, "^", IcState::RecomputeHandler),
                entry(4, "P", IcState::Polymorphic),
                entry(5, "D", IcState::Megadom),
                entry(6, "N", IcState::Megamorphic),
                entry(7, "G", IcState::Generic),
            ],
        },
        VersionTable {
            bound: VersionBound::at_least(7, 9, 0),
            entries: &[
                entry(0, "X", IcState::NoFeedback),
                entry(1, "0", IcState::Uninitialized),
                entry(2, "1", IcState::Monomorphic),
                entry(3, "^", IcState::RecomputeHandler),
                entry(4, "P", IcState::Polymorphic),
                entry(5, "N", IcState::Megamorphic),
                entry(6, "G", IcState::Generic),
            ],
        },
        VersionTable {
            bound: VersionBound::Any,
            entries: &[
                entry(0, "0", IcState::Uninitialized),
                entry(1, ".", IcState::Premonomorphic),
                entry(2, "1", IcState::Monomorphic),
                entry(3, "^", IcState::RecomputeHandler),
                entry(4, "P", IcState::Polymorphic),
                entry(5, "N", IcState::Megamorphic),
                entry(6, "G", IcState::Generic),
            ],
        },
    ],
);

impl IcState {
    /// Decode an IC state marker. Markers are single characters, so numeric
    /// digits are looked up by name, not by ordinal.
    pub fn decode(raw: &str, version: Version) -> Result<Self> {
        IC_STATE.decode_name(raw.trim(), version)
    }

    /// Print this state the way `version` writes it
    pub fn format(self, version: Version) -> Result<&'static str> {
        IC_STATE.format(self, version)
    }

    /// Ranking used by "worst state" queries
    pub fn severity(self) -> u8 {
        match self {
            IcState::NoFeedback | IcState::Uninitialized | IcState::Premonomorphic => 0,
            IcState::Monomorphic | IcState::RecomputeHandler => 1,
            IcState::Polymorphic => 2,
            IcState::Megadom => 3,
            IcState::Megamorphic => 4,
            IcState::Generic => 5,
        }
    }
}

// ============================================================================
// VmState
// ============================================================================

/// VM state recorded with each tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum VmState {
    Js,
    Gc,
    Parser,
    BytecodeCompiler,
    Compiler,
    Other,
    External,
    AtomicsWait,
    Idle,
    Logging,
    IdleExternal,
}

pub(crate) static VM_STATE: VersionedEnum<VmState> = VersionedEnum::new(
    "VmState",
    &[
        VersionTable {
            bound: VersionBound::at_least(10, 9, 0),
            entries: &[
                entry(0, "JS", VmState::Js),
                entry(1, "GC", VmState::Gc),
                entry(2, "PARSER", VmState::Parser),
                entry(3, "BYTECODE_COMPILER", VmState::BytecodeCompiler),
                entry(4, "COMPILER", VmState::Compiler),
                entry(5, "OTHER", VmState::Other),
                entry(6, "EXTERNAL", VmState::External),
                entry(7, "ATOMICS_WAIT", VmState::AtomicsWait),
                entry(8, "IDLE", VmState::Idle),
                entry(9, "LOGGING", VmState::Logging),
                entry(10, "IDLE_EXTERNAL", VmState::IdleExternal),
            ],
        },
        VersionTable {
            bound: VersionBound::at_least(8, 1, 0),
            entries: &[
                entry(0, "JS", VmState::Js),
                entry(1, "GC", VmState::Gc),
                entry(2, "PARSER", VmState::Parser),
                entry(3, "BYTECODE_COMPILER", VmState::BytecodeCompiler),
                entry(4, "COMPILER", VmState::Compiler),
                entry(5, "OTHER", VmState::Other),
                entry(6, "EXTERNAL", VmState::External),
                entry(7, "ATOMICS_WAIT", VmState::AtomicsWait),
                entry(8, "IDLE", VmState::Idle),
            ],
        },
        VersionTable {
            bound: VersionBound::Any,
            entries: &[
                entry(0, "JS", VmState::Js),
                entry(1, "GC", VmState::Gc),
                entry(2, "PARSER", VmState::Parser),
                entry(3, "BYTECODE_COMPILER", VmState::BytecodeCompiler),
                entry(4, "COMPILER", VmState::Compiler),
                entry(5, "OTHER", VmState::Other),
                entry(6, "EXTERNAL", VmState::External),
                entry(7, "IDLE", VmState::Idle),
            ],
        },
    ],
);

impl VmState {
    /// Decode the numeric VM state of a tick
    pub fn decode(raw: &str, version: Version) -> Result<Self> {
        VM_STATE.decode(raw, version)
    }

    /// Decode an already parsed ordinal
    pub fn from_ordinal(ordinal: i64, version: Version) -> Result<Self> {
        VM_STATE.decode_ordinal(ordinal, version)
    }

    /// Print this state the way `version` writes it
    pub fn format(self, version: Version) -> Result<&'static str> {
        VM_STATE.format(self, version)
    }

    /// Whether the VM was idle (no JS or VM work)
    pub fn is_idle(self) -> bool {
        matches!(self, VmState::Idle | VmState::IdleExternal)
    }
}

// ============================================================================
// FunctionState
// ============================================================================

/// Execution tier marker that prefixes function names in `code-creation`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FunctionState {
    Compiled,
    Interpreted,
    Baseline,
    NativeContextIndependent,
    Turboprop,
    Maglev,
    Turbofan,
}

pub(crate) static FUNCTION_STATE: VersionedEnum<FunctionState> = VersionedEnum::new(
    "FunctionState",
    &[
        VersionTable {
            bound: VersionBound::at_least(11, 0, 0),
            entries: &[
                entry(0, "", FunctionState::Compiled),
                entry(1, "~", FunctionState::Interpreted),
                entry(2, "^", FunctionState::Baseline),
                entry(3, "+", FunctionState::Maglev),
                entry(4, "*", FunctionState::Turbofan),
            ],
        },
        VersionTable {
            bound: VersionBound::at_least(9, 2, 0),
            entries: &[
                entry(0, "", FunctionState::Compiled),
                entry(1, "~", FunctionState::Interpreted),
                entry(2, "^", FunctionState::Baseline),
                entry(3, "+", FunctionState::Turboprop),
                entry(4, "*", FunctionState::Turbofan),
            ],
        },
        VersionTable {
            bound: VersionBound::at_least(8, 9, 0),
            entries: &[
                entry(0, "", FunctionState::Compiled),
                entry(1, "~", FunctionState::Interpreted),
                entry(2, "-", FunctionState::NativeContextIndependent),
                entry(3, "+", FunctionState::Turboprop),
                entry(4, "*", FunctionState::Turbofan),
            ],
        },
        VersionTable {
            bound: VersionBound::Any,
            entries: &[
                entry(0, "", FunctionState::Compiled),
                entry(1, "~", FunctionState::Interpreted),
                entry(2, "*", FunctionState::Turbofan),
            ],
        },
    ],
);

impl FunctionState {
    /// Decode the state marker of a `code-creation` record
    pub fn decode(raw: &str, version: Version) -> Result<Self> {
        FUNCTION_STATE.decode_name(raw.trim(), version)
    }

    /// Print this state the way `version` writes it
    pub fn format(self, version: Version) -> Result<&'static str> {
        FUNCTION_STATE.format(self, version)
    }

    /// Marker used when rendering function names
    pub fn prefix(self) -> &'static str {
        match self {
            FunctionState::Compiled => "",
            FunctionState::Interpreted => "~",
            FunctionState::Baseline => "^",
            FunctionState::NativeContextIndependent => "-",
            FunctionState::Turboprop | FunctionState::Maglev => "+",
            FunctionState::Turbofan => "*",
        }
    }

    /// Whether code in this state came out of an optimizing compiler
    pub fn is_optimized(self) -> bool {
        matches!(
            self,
            FunctionState::Turbofan
                | FunctionState::Turboprop
                | FunctionState::Maglev
                | FunctionState::NativeContextIndependent
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deopt_kind_across_versions() {
        let v8_5 = Version::new(8, 5, 0);
        let v9_0 = Version::new(9, 0, 0);
        assert_eq!(DeoptimizeKind::decode("eager", v8_5).unwrap(), DeoptimizeKind::Eager);
        assert_eq!(DeoptimizeKind::Eager.format(v9_0).unwrap(), "Eager");
        assert_eq!(DeoptimizeKind::Eager.format(v8_5).unwrap(), "eager");
        assert!(DeoptimizeKind::decode("Eager", v8_5).is_err());
        assert!(DeoptimizeKind::Soft.format(Version::new(10, 2, 0)).is_err());
        assert_eq!(
            DeoptimizeKind::decode("1", Version::new(10, 2, 0)).unwrap(),
            DeoptimizeKind::Lazy
        );
    }

    #[test]
    fn test_code_kind_renumbering() {
        assert_eq!(CodeKind::decode("12", Version::new(11, 3, 0)).unwrap(), CodeKind::Maglev);
        assert_eq!(CodeKind::decode("12", Version::new(9, 4, 0)).unwrap(), CodeKind::Turboprop);
        assert_eq!(CodeKind::decode("0", Version::new(7, 0, 0)).unwrap(), CodeKind::OptimizedFunction);
        assert!(CodeKind::decode("14", Version::MAX).is_err());
    }

    #[test]
    fn test_ic_state_markers() {
        let modern = Version::new(10, 0, 0);
        assert_eq!(IcState::decode("1", modern).unwrap(), IcState::Monomorphic);
        assert_eq!(IcState::decode("D", modern).unwrap(), IcState::Megadom);
        assert!(IcState::decode("D", Version::new(8, 0, 0)).is_err());
        assert_eq!(IcState::decode(".", Version::new(6, 0, 0)).unwrap(), IcState::Premonomorphic);
        assert!(IcState::Megamorphic.severity() > IcState::Polymorphic.severity());
    }

    #[test]
    fn test_vm_state_idle_renumbered() {
        assert_eq!(VmState::decode("7", Version::new(7, 0, 0)).unwrap(), VmState::Idle);
        assert_eq!(VmState::decode("7", Version::new(9, 0, 0)).unwrap(), VmState::AtomicsWait);
        assert_eq!(VmState::decode("8", Version::MAX).unwrap(), VmState::Idle);
    }

    #[test]
    fn test_function_state_prefixes() {
        assert_eq!(FunctionState::decode("+", Version::new(11, 1, 0)).unwrap(), FunctionState::Maglev);
        assert_eq!(FunctionState::decode("+", Version::new(9, 4, 0)).unwrap(), FunctionState::Turboprop);
        assert_eq!(FunctionState::decode("", Version::MAX).unwrap(), FunctionState::Compiled);
        assert!(FunctionState::decode("^", Version::new(8, 0, 0)).is_err());
        assert_eq!(FunctionState::Turbofan.prefix(), "*");
    }

    #[test]
    fn test_every_table_ends_with_catch_all() {
        fn check<T: Copy + PartialEq>(e: &VersionedEnum<T>) {
            let tables = e.tables();
            assert!(matches!(tables.last().unwrap().bound, VersionBound::Any), "{}", e.name());
            for pair in tables.windows(2) {
                if let (VersionBound::AtLeast(a), VersionBound::AtLeast(b)) = (pair[0].bound, pair[1].bound) {
                    assert!(a > b, "{} tables must be newest first", e.name());
                }
            }
        }
        check(&DEOPTIMIZE_KIND);
        check(&CODE_KIND);
        check(&IC_STATE);
        check(&VM_STATE);
        check(&FUNCTION_STATE);
    }
}
