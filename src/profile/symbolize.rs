//! Turning raw tick stacks into logical frames

use regex::Regex;

use crate::codemap::{CodeId, CodeMap, Located};
use crate::config::SkipFilter;
use crate::error::Result;
use crate::logreader::parse_address;

const IC_PATTERN: &str =
    r"^(LoadGlobalIC: )|(Handler: )|(?:CallIC|LoadIC|StoreIC)|(?:Builtin: (?:Keyed)?(?:Load|Store)IC_)";
const BYTECODE_PATTERN: &str = r"^(BytecodeHandler: )";
const BUILTIN_PATTERN: &str = r"^(Builtin: )";
const STUB_PATTERN: &str = r"^(Stub: )";
const NATIVE_LIBRARY_PATTERN: &str = r"\.(?:dll|so|dylib)(?:\.\d+)*$";

/// Builtins through which the real caller of a frameless call is lost
const APPLY_BUILTINS: &[&str] = &[
    "Builtin: FunctionPrototypeApply",
    "Builtin: FunctionPrototypeCall",
    "Builtin: ReflectApply",
];

/// Decides which frames are dropped from logical stacks
#[derive(Debug, Clone)]
pub struct SkipMatcher {
    filter: SkipFilter,
    patterns: Vec<Regex>,
}

impl SkipMatcher {
    /// Compile the patterns selected by `filter`
    pub fn new(filter: SkipFilter) -> Result<Self> {
        let selected = [
            (SkipFilter::IC, IC_PATTERN),
            (SkipFilter::BYTECODES, BYTECODE_PATTERN),
            (SkipFilter::BUILTINS, BUILTIN_PATTERN),
            (SkipFilter::STUBS, STUB_PATTERN),
            (SkipFilter::NATIVE_LIBRARIES, NATIVE_LIBRARY_PATTERN),
        ];
        let patterns = selected
            .iter()
            .filter(|(flag, _)| filter.contains(*flag))
            .map(|(_, pattern)| {
                Regex::new(pattern).map_err(|e| crate::error::Error::configuration(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { filter, patterns })
    }

    /// The categories being dropped
    pub fn filter(&self) -> SkipFilter {
        self.filter
    }

    /// Whether a frame with this label is dropped
    pub fn skips(&self, label: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(label))
    }
}

/// Whether a rendered name is one of the apply/call builtins
pub fn is_apply_builtin(label: &str) -> bool {
    APPLY_BUILTINS.contains(&label)
}

/// Resolve the textual frames of a tick into addresses.
///
/// `+`/`-` frames are hex offsets from the previous frame; `overflow`
/// markers and anything else starting with `o` are dropped.
pub fn parse_stack_frames(pc: u64, frames: &[&str]) -> Result<Vec<u64>> {
    let mut previous = pc;
    let mut stack = Vec::with_capacity(frames.len());
    for frame in frames {
        let frame = frame.trim();
        if let Some(delta) = frame.strip_prefix('+') {
            previous = previous.wrapping_add(parse_address(&hex(delta))?);
            stack.push(previous);
        } else if let Some(delta) = frame.strip_prefix('-') {
            previous = previous.wrapping_sub(parse_address(&hex(delta))?);
            stack.push(previous);
        } else if frame.starts_with('o') {
            tracing::debug!(frame, "dropping unknown tick frame");
        } else if !frame.is_empty() {
            stack.push(parse_address(&hex(frame))?);
        }
    }
    Ok(stack)
}

fn hex(raw: &str) -> String {
    if raw.starts_with("0x") || raw.starts_with("0X") {
        raw.to_string()
    } else {
        format!("0x{}", raw)
    }
}

/// One frame of a logical (inline-expanded) stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalFrame {
    pub entry: CodeId,
    pub label: String,
    /// Script the position below refers to
    pub script_id: Option<u32>,
    pub script_offset: Option<u64>,
}

/// Expand one physical frame into the frames it stands for, innermost first.
///
/// `return_address` frames are looked up one byte earlier so the position
/// belongs to the call instruction rather than whatever follows it.
pub fn expand_frame(code_map: &mut CodeMap, located: Located, return_address: bool) -> Vec<LogicalFrame> {
    let physical = LogicalFrame {
        entry: located.id,
        label: code_map.display_name(located.id),
        script_id: None,
        script_offset: None,
    };
    let Some(source) = code_map.entry(located.id).source.clone() else {
        return vec![physical];
    };
    let code_offset = if return_address {
        located.offset.saturating_sub(1)
    } else {
        located.offset
    };
    let Some(position) = source.position_at(code_offset).copied() else {
        return vec![LogicalFrame {
            script_id: Some(source.script_id),
            ..physical
        }];
    };

    let mut frames = Vec::new();
    let mut script_offset = position.script_offset;
    let mut inlining_id = position.inlining_id;
    while let Some(id) = inlining_id {
        let Some(inlined) = source.inlining.get(id) else {
            break;
        };
        let func = source
            .inlined_functions
            .get(inlined.function_index)
            .and_then(|addr| code_map.find_dynamic_entry_by_start_address(*addr));
        if let Some(func) = func {
            let script_id = code_map
                .entry(func)
                .source
                .as_ref()
                .map_or(source.script_id, |s| s.script_id);
            frames.push(LogicalFrame {
                entry: func,
                label: code_map.display_name(func),
                script_id: Some(script_id),
                script_offset: Some(script_offset),
            });
        }
        script_offset = inlined.script_offset;
        inlining_id = inlined.parent;
    }
    frames.push(LogicalFrame {
        script_id: Some(source.script_id),
        script_offset: Some(script_offset),
        ..physical
    });
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codemap::{CodeEntry, InliningPosition, PositionEntry, SourceInfo};
    use crate::versions::FunctionState;

    #[test]
    fn test_skip_patterns() {
        let matcher = SkipMatcher::new(SkipFilter::IC | SkipFilter::BYTECODES).unwrap();
        assert!(matcher.skips("LoadGlobalIC: x"));
        assert!(matcher.skips("Builtin: KeyedLoadIC_Megamorphic"));
        assert!(matcher.skips("BytecodeHandler: Ldar"));
        assert!(!matcher.skips("Builtin: ArrayPush"));
        assert!(!matcher.skips("JS: *foo a.js:1:1"));

        let natives = SkipMatcher::new(SkipFilter::NATIVE_LIBRARIES | SkipFilter::BUILTINS).unwrap();
        assert!(natives.skips("/usr/lib/libc.so.6"));
        assert!(natives.skips("C:\\Windows\\ntdll.dll"));
        assert!(natives.skips("Builtin: ArrayPush"));
        assert!(!natives.skips("/usr/bin/node"));

        assert!(!SkipMatcher::new(SkipFilter::empty()).unwrap().skips("Stub: x"));
    }

    #[test]
    fn test_parse_stack_frames() {
        let stack = parse_stack_frames(0x1000, &["0x2000", "+10", "-8", "overflow", "3000"]).unwrap();
        assert_eq!(stack, vec![0x2000, 0x1010, 0x1008, 0x3000]);
        let stack = parse_stack_frames(0x500, &["0x9000", "+4", "0x7000", "+4"]).unwrap();
        assert_eq!(stack, vec![0x9000, 0x504, 0x7000, 0x508]);
        assert!(parse_stack_frames(0, &["zz"]).is_err());
    }

    #[test]
    fn test_expand_inlined_frames() {
        let mut map = CodeMap::new();
        let outer_fn = map.add_code(0x500, CodeEntry::shared_function("outer a.js:1:1"));
        let inner_fn = map.add_code(0x600, CodeEntry::shared_function("inner a.js:5:1"));
        let mut code = CodeEntry::dynamic_func(0x40, "JS", outer_fn, FunctionState::Turbofan);
        code.source = Some(SourceInfo {
            script_id: 1,
            start: 0,
            end: 100,
            positions: vec![
                PositionEntry { code_offset: 0, script_offset: 2, inlining_id: None },
                PositionEntry { code_offset: 0x10, script_offset: 50, inlining_id: Some(0) },
            ],
            inlining: vec![InliningPosition { function_index: 0, script_offset: 7, parent: None }],
            inlined_functions: vec![0x600],
        });
        map.add_code(0x1000, code);

        let located = map.find_address(0x1011).unwrap();
        let frames = expand_frame(&mut map, located, false);
        let labels: Vec<&str> = frames.iter().map(|f| f.label.as_str()).collect();
        assert_eq!(labels, vec!["inner a.js:5:1", "JS: *outer a.js:1:1"]);
        assert_eq!(frames[0].entry, inner_fn);
        assert_eq!(frames[0].script_offset, Some(50));
        assert_eq!(frames[1].script_offset, Some(7));

        // A return address right after the inlined region belongs to it.
        let located = map.find_address(0x1010).unwrap();
        let frames = expand_frame(&mut map, located, true);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].script_offset, Some(2));
    }
}
