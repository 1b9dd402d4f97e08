//! Profile construction from code events and ticks
//!
//! A [`Profile`] starts out recording: code events mutate its [`CodeMap`]
//! and ticks are symbolized into its top-down [`CallTree`]. [`Profile::finalize`]
//! prunes functions no live code refers to, smooths misattributed
//! `(program)` samples and computes total weights. After that the profile
//! only answers queries; every mutator fails with
//! [`Error::IllegalState`].

pub mod source;
pub mod symbolize;
pub mod symbols;

pub use source::{FsScriptSource, NoScriptSource, Script, ScriptRegistry, ScriptSourceProvider};
pub use symbols::{LibrarySymbol, LibrarySymbolProvider, NmSymbolFiles, NoLibrarySymbols, StaticSymbols};
pub use symbolize::{LogicalFrame, SkipMatcher};

use rustc_hash::FxHashMap as HashMap;
use rustc_hash::FxHashSet as HashSet;

use crate::calltree::{CallNodeId, CallTree, CpuProfile, ProfileView, ViewBuilder};
use crate::codemap::{CodeEntry, CodeFlavor, CodeId, CodeMap, SourceInfo};
use crate::config::ProfileConfig;
use crate::error::{CodeOperation, Error, Result};
use crate::versions::{CodeKind, FunctionState, VmState};

/// An address that a move, delete or tick referred to but no code owned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownCode {
    pub operation: CodeOperation,
    pub address: u64,
    /// Frame index for ticks
    pub stack_pos: Option<usize>,
}

/// One recorded tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub node: CallNodeId,
    /// Microseconds
    pub timestamp: u64,
    /// 1-based line in the leaf frame's script
    pub line: Option<u32>,
    pub vm_state: VmState,
    /// Attributed to a VM pseudo function rather than real code
    pub system: bool,
}

/// A raw tick, as read from the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickSample {
    pub pc: u64,
    pub timestamp: u64,
    pub is_external_callback: bool,
    /// The external callback when `is_external_callback`, otherwise the top
    /// of stack (zero when unknown)
    pub tos_or_external_callback: u64,
    pub vm_state: VmState,
    /// Return addresses, innermost first
    pub stack: Vec<u64>,
}

/// Tick counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickCounters {
    pub total: u64,
    /// Ticks whose pc resolved to no code
    pub unaccounted: u64,
    pub by_state: HashMap<VmState, u64>,
}

impl TickCounters {
    /// Ticks taken in `state`
    pub fn in_state(&self, state: VmState) -> u64 {
        self.by_state.get(&state).copied().unwrap_or(0)
    }
}

/// A row of the C++ entry listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CEntry {
    pub name: String,
    pub ticks: u64,
}

/// Counters reported by [`Profile::finalize`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalizeStats {
    pub pruned_functions: usize,
    pub smoothed_samples: usize,
}

#[derive(Debug, Clone, Copy)]
struct PseudoFunctions {
    root: CodeId,
    program: CodeId,
    idle: CodeId,
    gc: CodeId,
    unresolved: CodeId,
}

impl PseudoFunctions {
    const PROGRAM: &'static str = "(program)";
    const IDLE: &'static str = "(idle)";
    const GC: &'static str = "(gc)";
    const UNRESOLVED: &'static str = "(unresolved function)";

    fn register(code_map: &mut CodeMap) -> Self {
        Self {
            root: code_map.add_detached(CodeEntry::pseudo(CallTree::ROOT_LABEL)),
            program: code_map.add_detached(CodeEntry::pseudo(Self::PROGRAM)),
            idle: code_map.add_detached(CodeEntry::pseudo(Self::IDLE)),
            gc: code_map.add_detached(CodeEntry::pseudo(Self::GC)),
            unresolved: code_map.add_detached(CodeEntry::pseudo(Self::UNRESOLVED)),
        }
    }

    fn for_state(&self, state: VmState) -> CodeId {
        match state {
            VmState::Gc => self.gc,
            VmState::Idle | VmState::IdleExternal => self.idle,
            _ => self.program,
        }
    }
}

/// The profile builder
#[derive(Debug)]
pub struct Profile {
    code_map: CodeMap,
    tree: CallTree,
    samples: Vec<Sample>,
    scripts: ScriptRegistry,
    skip: SkipMatcher,
    sampling_rate: f64,
    pseudo: PseudoFunctions,
    c_entries: HashMap<String, u64>,
    counters: TickCounters,
    unknown_code: Vec<UnknownCode>,
    start_time: Option<u64>,
    end_time: Option<u64>,
    finalized: bool,
}

impl Profile {
    /// Create a profile that fetches no script text from outside the log
    pub fn new(config: &ProfileConfig) -> Result<Self> {
        Self::with_source_provider(config, Box::new(NoScriptSource))
    }

    /// Create a profile that loads missing script text through `provider`
    pub fn with_source_provider(
        config: &ProfileConfig,
        provider: Box<dyn ScriptSourceProvider>,
    ) -> Result<Self> {
        let mut code_map = CodeMap::new();
        let pseudo = PseudoFunctions::register(&mut code_map);
        Ok(Self {
            code_map,
            tree: CallTree::with_root(CallTree::ROOT_LABEL, Some(pseudo.root)),
            samples: Vec::new(),
            scripts: ScriptRegistry::new(provider),
            skip: SkipMatcher::new(config.skip_filter())?,
            sampling_rate: config.sampling_rate,
            pseudo,
            c_entries: HashMap::default(),
            counters: TickCounters::default(),
            unknown_code: Vec::new(),
            start_time: None,
            end_time: None,
            finalized: false,
        })
    }

    fn ensure_recording(&self, operation: &str) -> Result<()> {
        if self.finalized {
            return Err(Error::finalized(operation));
        }
        Ok(())
    }

    fn observe_time(&mut self, timestamp: u64) {
        self.start_time = Some(self.start_time.map_or(timestamp, |t| t.min(timestamp)));
        self.end_time = Some(self.end_time.map_or(timestamp, |t| t.max(timestamp)));
    }

    fn handle_unknown_code(&mut self, operation: CodeOperation, address: u64, stack_pos: Option<usize>) {
        tracing::debug!(%operation, address = format_args!("{:#x}", address), ?stack_pos, "unknown code");
        self.unknown_code.push(UnknownCode {
            operation,
            address,
            stack_pos,
        });
    }

    // ========================================================================
    // Code events
    // ========================================================================

    /// Register a shared library spanning `[start, end)`
    pub fn add_library(&mut self, name: &str, start: u64, end: u64) -> Result<CodeId> {
        self.ensure_recording("add a library")?;
        let entry = CodeEntry::plain(end.saturating_sub(start), name, CodeEntry::SHARED_LIB);
        Ok(self.code_map.add_library(start, entry))
    }

    /// Register a C++ symbol spanning `[start, end)`
    pub fn add_static_code(&mut self, name: &str, start: u64, end: u64) -> Result<CodeId> {
        self.ensure_recording("add static code")?;
        let entry = CodeEntry::plain(end.saturating_sub(start), name, CodeEntry::CPP);
        Ok(self.code_map.add_static_code(start, entry))
    }

    /// Register JIT code with no known function
    pub fn add_code(
        &mut self,
        code_type: &str,
        name: &str,
        timestamp: u64,
        start: u64,
        size: u64,
        kind: Option<CodeKind>,
    ) -> Result<CodeId> {
        self.ensure_recording("add code")?;
        let entry = CodeEntry::dynamic(size, name, code_type)
            .with_kind(kind)
            .with_timestamp(timestamp);
        Ok(self.code_map.add_code(start, entry))
    }

    /// Register JIT code compiled from the function at `func_addr`.
    ///
    /// The shared function is created on first sight and renamed when V8
    /// reports a different name. Code re-reported at the same address with
    /// the same size and function only has its state updated.
    #[allow(clippy::too_many_arguments)]
    pub fn add_func_code(
        &mut self,
        code_type: &str,
        name: &str,
        timestamp: u64,
        start: u64,
        size: u64,
        func_addr: u64,
        state: FunctionState,
        kind: Option<CodeKind>,
    ) -> Result<CodeId> {
        self.ensure_recording("add function code")?;
        let func = match self.code_map.find_dynamic_entry_by_start_address(func_addr) {
            Some(func) => {
                let entry = self.code_map.entry_mut(func);
                if entry.name != name {
                    entry.name = name.to_string();
                }
                func
            }
            None => self
                .code_map
                .add_code(func_addr, CodeEntry::shared_function(name)),
        };

        if let Some(existing) = self.code_map.find_dynamic_entry_by_start_address(start) {
            let entry = self.code_map.entry_mut(existing);
            if entry.size == size && entry.func() == Some(func) {
                entry.flavor = CodeFlavor::DynamicFunc { func, state };
                entry.kind = kind.or(entry.kind);
                return Ok(existing);
            }
            self.code_map.delete_code(start);
        }
        let entry = CodeEntry::dynamic_func(size, code_type, func, state)
            .with_kind(kind)
            .with_timestamp(timestamp);
        Ok(self.code_map.add_code(start, entry))
    }

    /// Relocate code. An unknown `from` is reported, not an error.
    pub fn move_code(&mut self, from: u64, to: u64) -> Result<()> {
        self.ensure_recording("move code")?;
        match self.code_map.move_code(from, to) {
            Ok(()) => Ok(()),
            Err(Error::CodeNotFound { address }) => {
                self.handle_unknown_code(CodeOperation::Move, address, None);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Drop code. An unknown `start` is reported, not an error.
    pub fn delete_code(&mut self, start: u64) -> Result<()> {
        self.ensure_recording("delete code")?;
        if self.code_map.delete_code(start).is_none() {
            self.handle_unknown_code(CodeOperation::Delete, start, None);
        }
        Ok(())
    }

    /// Relocate a shared function; nothing happens when none is at `from`
    pub fn move_func(&mut self, from: u64, to: u64) -> Result<()> {
        self.ensure_recording("move a function")?;
        if self.code_map.find_dynamic_entry_by_start_address(from).is_some() {
            self.code_map.move_code(from, to)?;
        }
        Ok(())
    }

    /// Attach `code-source-info` to the code starting at `start`. Script
    /// text missing from the log is fetched here, once per script.
    #[allow(clippy::too_many_arguments)]
    pub fn add_source_positions(
        &mut self,
        start: u64,
        script_id: u32,
        start_pos: u64,
        end_pos: u64,
        positions: &str,
        inlining_positions: &str,
        inlined_functions: &str,
    ) -> Result<()> {
        self.ensure_recording("add source positions")?;
        let Some(id) = self.code_map.find_dynamic_entry_by_start_address(start) else {
            tracing::debug!(start = format_args!("{:#x}", start), "source positions for unknown code");
            return Ok(());
        };
        let info = SourceInfo {
            script_id,
            start: start_pos,
            end: end_pos,
            positions: source::parse_positions(positions)?,
            inlining: source::parse_inlining_positions(inlining_positions)?,
            inlined_functions: source::parse_inlined_functions(inlined_functions)?,
        };
        self.code_map.entry_mut(id).source = Some(info);
        self.scripts.ensure_source(script_id)
    }

    /// Record embedded script text
    pub fn add_script_source(&mut self, script_id: u32, url: &str, source: String) -> Result<()> {
        self.ensure_recording("add a script")?;
        self.scripts.add_source(script_id, url, source);
        Ok(())
    }

    /// Record a script url without text
    pub fn add_script_details(&mut self, script_id: u32, url: &str) -> Result<()> {
        self.ensure_recording("add a script")?;
        self.scripts.add_details(script_id, url);
        Ok(())
    }

    /// Attach a deopt reason to the code covering `addr`
    pub fn add_deopt_reason(&mut self, addr: u64, reason: &str) -> Result<Option<CodeId>> {
        self.ensure_recording("add a deopt")?;
        let Some(located) = self.code_map.lookup(addr) else {
            return Ok(None);
        };
        self.code_map
            .entry_mut(located.id)
            .deopt_reasons
            .push(reason.to_string());
        Ok(Some(located.id))
    }

    /// Mark every function named `name` as never optimized again; returns
    /// how many were marked
    pub fn disable_optimization(&mut self, name: &str, reason: &str) -> Result<usize> {
        self.ensure_recording("disable optimization")?;
        let matching: Vec<CodeId> = self
            .code_map
            .dynamic_entries()
            .map(|(_, id)| id)
            .filter(|id| {
                let entry = self.code_map.entry(*id);
                entry.is_shared_function() && entry.bare_function_name() == name
            })
            .collect();
        for id in &matching {
            self.code_map.entry_mut(*id).optimization_disabled = Some(reason.to_string());
        }
        Ok(matching.len())
    }

    // ========================================================================
    // Ticks
    // ========================================================================

    /// Symbolize a tick and add it to the call tree
    pub fn record_tick(&mut self, tick: &TickSample) -> Result<CallNodeId> {
        self.ensure_recording("record a tick")?;
        self.observe_time(tick.timestamp);
        self.counters.total += 1;
        *self.counters.by_state.entry(tick.vm_state).or_insert(0) += 1;

        let mut pc = tick.pc;
        let mut tos = tick.tos_or_external_callback;
        if tick.is_external_callback {
            // The pc may point inside the callback itself, which would make it
            // look like it calls itself.
            pc = tos;
            tos = 0;
        } else if tos != 0 {
            let frameless_js = self
                .code_map
                .lookup(tos)
                .is_some_and(|l| self.code_map.entry(l.id).is_js_function());
            if !frameless_js {
                tos = 0;
            }
        }

        let mut physical = Vec::with_capacity(tick.stack.len() + 2);
        physical.push(pc);
        if tos != 0 {
            physical.push(tos);
        }
        physical.extend_from_slice(&tick.stack);

        let frames = self.resolve_frames(&physical, tick.is_external_callback, tos != 0);
        let (entry, leaf_line) = match frames.first() {
            Some(leaf) => (None, self.line_of(leaf)),
            None => (Some(self.pseudo.for_state(tick.vm_state)), None),
        };

        let node = match entry {
            Some(pseudo) => {
                let label = self.code_map.display_name(pseudo);
                self.tree.add_path([(label.as_str(), Some(pseudo))])
            }
            None => self
                .tree
                .add_path(frames.iter().rev().map(|f| (f.label.as_str(), Some(f.entry)))),
        };
        self.tree.record_sample(node, leaf_line);
        self.samples.push(Sample {
            node,
            timestamp: tick.timestamp,
            line: leaf_line,
            vm_state: tick.vm_state,
            system: entry.is_some(),
        });
        Ok(node)
    }

    /// Resolve physical addresses into the logical stack, innermost first,
    /// dropping skipped and unresolved frames
    fn resolve_frames(&mut self, physical: &[u64], external_callback: bool, has_tos: bool) -> Vec<LogicalFrame> {
        let mut frames = Vec::new();
        let mut last_c_function: Option<String> = None;
        let mut looking_for_c_entry = false;

        for (i, &addr) in physical.iter().enumerate() {
            let located = self.code_map.find_address(addr);
            let entry_type = located.map(|l| self.code_map.entry(l.id).code_type.clone());

            match located {
                Some(located) => {
                    let is_cpp = entry_type.as_deref() == Some(CodeEntry::CPP);
                    if i == 0 && self.code_map.entry(located.id).is_native() {
                        looking_for_c_entry = true;
                    }
                    if looking_for_c_entry && is_cpp {
                        last_c_function = Some(self.code_map.display_name(located.id));
                    }
                    for frame in symbolize::expand_frame(&mut self.code_map, located, i > 0) {
                        if !self.skip.skips(&frame.label) {
                            frames.push(frame);
                        }
                    }
                    if i == 0
                        && !external_callback
                        && !has_tos
                        && symbolize::is_apply_builtin(&self.code_map.display_name(located.id))
                    {
                        frames.push(LogicalFrame {
                            entry: self.pseudo.unresolved,
                            label: PseudoFunctions::UNRESOLVED.to_string(),
                            script_id: None,
                            script_offset: None,
                        });
                    }
                }
                None => {
                    if i == 0 {
                        self.counters.unaccounted += 1;
                    }
                    self.handle_unknown_code(CodeOperation::Tick, addr, Some(i));
                }
            }

            if looking_for_c_entry && i > 0 && entry_type.as_deref() != Some(CodeEntry::CPP) {
                if let Some(name) = last_c_function.take() {
                    *self.c_entries.entry(name).or_insert(0) += 1;
                    looking_for_c_entry = false;
                }
            }
        }
        frames
    }

    fn line_of(&self, frame: &LogicalFrame) -> Option<u32> {
        self.scripts.line_of(frame.script_id?, frame.script_offset?)
    }

    // ========================================================================
    // Finalize
    // ========================================================================

    /// Close the profile. Calling it again does nothing.
    pub fn finalize(&mut self) -> FinalizeStats {
        if self.finalized {
            return FinalizeStats::default();
        }
        let used: HashSet<CodeId> = self
            .code_map
            .dynamic_entries()
            .filter_map(|(_, id)| self.code_map.entry(id).func())
            .collect();
        let pruned_functions = self
            .code_map
            .retain_dynamic(|_, id, entry| !entry.is_shared_function() || used.contains(&id));

        let smoothed_samples = self.smooth_program_samples();
        self.tree.compute_total_weights();
        self.finalized = true;
        tracing::debug!(pruned_functions, smoothed_samples, samples = self.samples.len(), "profile finalized");
        FinalizeStats {
            pruned_functions,
            smoothed_samples,
        }
    }

    /// Give a lone `(program)` sample to its predecessor when both neighbors
    /// run under the same top-level function
    fn smooth_program_samples(&mut self) -> usize {
        let program = self.tree.find_child(self.tree.root(), PseudoFunctions::PROGRAM);
        let Some(program) = program else {
            return 0;
        };
        let mut moved = 0;
        for i in 1..self.samples.len().saturating_sub(1) {
            let (prev, current, next) = (self.samples[i - 1], self.samples[i], self.samples[i + 1]);
            if current.node != program || prev.system || next.system {
                continue;
            }
            let prev_top = self.tree.top_level_ancestor(prev.node);
            if prev_top.is_none() || prev_top != self.tree.top_level_ancestor(next.node) {
                continue;
            }
            self.tree.move_sample(current.node, current.line, prev.node, prev.line);
            self.samples[i] = Sample {
                node: prev.node,
                line: prev.line,
                system: false,
                ..current
            };
            moved += 1;
        }
        moved
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Code covering `addr`, without disturbing the indices
    pub fn find_entry(&self, addr: u64) -> Option<CodeId> {
        self.code_map.lookup(addr).map(|l| l.id)
    }

    pub fn entry(&self, id: CodeId) -> &CodeEntry {
        self.code_map.entry(id)
    }

    /// Rendered name of an entry
    pub fn display_name(&self, id: CodeId) -> String {
        self.code_map.display_name(id)
    }

    pub fn code_map(&self) -> &CodeMap {
        &self.code_map
    }

    /// The top-down call tree
    pub fn tree(&self) -> &CallTree {
        &self.tree
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn scripts(&self) -> &ScriptRegistry {
        &self.scripts
    }

    pub fn counters(&self) -> &TickCounters {
        &self.counters
    }

    /// Unknown-address notifications, in the order they happened
    pub fn unknown_code(&self) -> &[UnknownCode] {
        &self.unknown_code
    }

    /// Earliest timestamp seen, in microseconds
    pub fn start_time(&self) -> Option<u64> {
        self.start_time
    }

    /// Latest timestamp seen, in microseconds
    pub fn end_time(&self) -> Option<u64> {
        self.end_time
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    /// Url of the script an entry was compiled from. Falls back to the
    /// location V8 appends to function names.
    pub fn script_url(&self, id: CodeId) -> Option<String> {
        let entry = self.code_map.entry(id);
        if let Some(script) = entry.source.as_ref().and_then(|s| self.scripts.get(s.script_id)) {
            if !script.url.is_empty() {
                return Some(script.url.clone());
            }
        }
        let func = entry.func().map_or(entry, |f| self.code_map.entry(f));
        parse_name_location(&func.name).map(|(url, _, _)| url.to_string())
    }

    /// C++ entry points sorted by ticks, headed by a `TOTAL` row
    pub fn c_entry_profile(&self) -> Vec<CEntry> {
        let mut rows: Vec<CEntry> = self
            .c_entries
            .iter()
            .map(|(name, ticks)| CEntry {
                name: name.clone(),
                ticks: *ticks,
            })
            .collect();
        rows.sort_by(|a, b| b.ticks.cmp(&a.ticks).then_with(|| a.name.cmp(&b.name)));
        let total = rows.iter().map(|r| r.ticks).sum();
        let mut result = Vec::with_capacity(rows.len() + 1);
        result.push(CEntry {
            name: "TOTAL".to_string(),
            ticks: total,
        });
        result.extend(rows);
        result
    }

    /// Bottom-up tree derived from the top-down one
    pub fn bottom_up_tree(&self) -> CallTree {
        self.tree.bottom_up()
    }

    /// Flat tree, optionally limited to the subtree under `label`
    pub fn flat_tree(&self, label: Option<&str>) -> CallTree {
        self.tree.flat(label)
    }

    /// Top-down view scaled by the sampling rate
    pub fn top_down_view(&self) -> ProfileView {
        ViewBuilder::new(self.sampling_rate).build_view(&self.tree, false)
    }

    /// Bottom-up view scaled by the sampling rate
    pub fn bottom_up_view(&self) -> ProfileView {
        ViewBuilder::new(self.sampling_rate).build_view(&self.bottom_up_tree(), true)
    }

    /// Flat view scaled by the sampling rate
    pub fn flat_view(&self) -> ProfileView {
        ViewBuilder::new(self.sampling_rate).build_view(&self.flat_tree(None), false)
    }

    /// Export as a `.cpuprofile` document; the profile must be finalized
    pub fn cpu_profile(&self) -> Result<CpuProfile> {
        CpuProfile::from_profile(self)
    }
}

/// Split a V8 function name of the form `name url:line:column` into its
/// location
pub fn parse_name_location(name: &str) -> Option<(&str, u32, u32)> {
    let (_, location) = name.rsplit_once(' ').unwrap_or(("", name));
    let mut parts = location.rsplitn(3, ':');
    let column = parts.next()?.parse().ok()?;
    let line = parts.next()?.parse().ok()?;
    let url = parts.next().filter(|u| !u.is_empty())?;
    Some((url, line, column))
}
