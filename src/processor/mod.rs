//! Wiring of V8 log records to the profile and event log
//!
//! [`LogProcessor`] is the sink a [`LogReader`] drives. Each supported record
//! has a field list and a handler here; the handlers decode versioned enums
//! with the version announced by `v8-version` (or the configured override)
//! and forward to [`Profile`] and [`EventLog`].
//!
//! # Example
//! ```
//! use v8lens::config::AnalyzerConfig;
//! use v8lens::processor::analyze_str;
//!
//! let log = "code-creation,Builtin,2,10,0x1000,0x20,Foo\ntick,0x1008,20,0,0,0\n";
//! let analysis = analyze_str(log, &AnalyzerConfig::default()).unwrap();
//! let profile = &analysis.profile;
//! assert_eq!(profile.counters().total, 1);
//! let node = profile.tree().find_path(["Builtin: Foo"]).unwrap();
//! assert_eq!(profile.tree().node(node).total_weight, 1);
//! ```

use std::io::BufRead;
use std::path::Path;

use crate::config::AnalyzerConfig;
use crate::error::{Error, Result};
use crate::events::{DeoptUpdate, EventLog, FilePosition, IcUpdate, MapEvent, MapUpdate};
use crate::logreader::{
    Args, CancellationToken, DispatchTable, FieldParser, FieldValue, LineFailure, LogReader,
    ReaderStats, TIMER_MARKER,
};
use crate::profile::symbols::place_symbols;
use crate::profile::{
    parse_name_location, FsScriptSource, LibrarySymbolProvider, NmSymbolFiles, NoLibrarySymbols,
    NoScriptSource, Profile, ScriptSourceProvider, TickSample,
};
use crate::versions::{CodeKind, DeoptimizeKind, FunctionState, IcState, Version, VmState};

/// IC record names
pub const IC_RECORDS: &[&str] = &[
    "LoadIC",
    "StoreIC",
    "KeyedLoadIC",
    "KeyedStoreIC",
    "LoadGlobalIC",
    "StoreGlobalIC",
    "StoreInArrayLiteralIC",
];

const UNKNOWN_URI: &str = "<unknown>";

/// The result of reading a whole log
#[derive(Debug)]
pub struct Analysis {
    /// Finalized profile
    pub profile: Profile,
    pub events: EventLog,
    /// Version the enums were decoded with
    pub version: Version,
    pub failures: Vec<LineFailure>,
    pub stats: ReaderStats,
}

/// Sink for a [`LogReader`]
pub struct LogProcessor {
    profile: Profile,
    events: EventLog,
    version: Version,
    version_locked: bool,
    symbols: Box<dyn LibrarySymbolProvider>,
}

impl std::fmt::Debug for LogProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogProcessor")
            .field("profile", &self.profile)
            .field("events", &self.events)
            .field("version", &self.version)
            .field("version_locked", &self.version_locked)
            .finish_non_exhaustive()
    }
}

impl LogProcessor {
    /// Create a processor that fetches no script text from outside the log
    pub fn new(config: &AnalyzerConfig) -> Result<Self> {
        Self::with_source_provider(config, Box::new(NoScriptSource))
    }

    /// Create a processor that loads missing scripts through `provider`
    pub fn with_source_provider(
        config: &AnalyzerConfig,
        provider: Box<dyn ScriptSourceProvider>,
    ) -> Result<Self> {
        let forced = config.version_override()?;
        let symbols: Box<dyn LibrarySymbolProvider> = match &config.symbols_dir {
            Some(dir) => Box::new(NmSymbolFiles::new(dir)),
            None => Box::new(NoLibrarySymbols),
        };
        Ok(Self {
            profile: Profile::with_source_provider(&config.profile, provider)?,
            events: EventLog::new(),
            version: forced.unwrap_or(Version::MAX),
            version_locked: forced.is_some(),
            symbols,
        })
    }

    /// Resolve C++ functions inside shared libraries through `provider`
    pub fn with_symbol_provider(mut self, provider: Box<dyn LibrarySymbolProvider>) -> Self {
        self.symbols = provider;
        self
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn profile_mut(&mut self) -> &mut Profile {
        &mut self.profile
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Version used for decoding
    pub fn version(&self) -> Version {
        self.version
    }

    /// Finalize and package the results of `reader`
    pub fn finish(mut self, reader: &LogReader<Self>) -> Analysis {
        self.profile.finalize();
        Analysis {
            profile: self.profile,
            events: self.events,
            version: self.version,
            failures: reader.failures().to_vec(),
            stats: reader.stats(),
        }
    }

    /// Every supported record
    pub fn dispatch_table() -> Result<DispatchTable<Self>> {
        use FieldParser::{Address, Command, Int, Str};

        let absent = || FieldValue::Absent;
        let zero = || FieldValue::Int(0);
        let mut table = DispatchTable::new();
        table
            .register("v8-version", vec![Int, Int, Int], Self::on_version)?
            .register(
                "shared-library",
                vec![Str, Address, Address, FieldParser::optional(Int, zero)],
                Self::on_shared_library,
            )?
            .register(
                "code-creation",
                vec![
                    Str,
                    Int,
                    Int,
                    Address,
                    Int,
                    Str,
                    FieldParser::optional(Address, absent),
                    FieldParser::optional(Str, absent),
                ],
                Self::on_code_creation,
            )?
            .register("code-move", vec![Address, Address], Self::on_code_move)?
            .register("code-delete", vec![Address], Self::on_code_delete)?
            .register("sfi-move", vec![Address, Address], Self::on_sfi_move)?
            .register(
                "code-source-info",
                vec![Address, Int, Int, Int, Str, Str, Str],
                Self::on_code_source_info,
            )?
            .register("script-source", vec![Int, Str, Str], Self::on_script_source)?
            .register(
                "script-details",
                vec![Int, Str, FieldParser::rest(Str)],
                Self::on_script_details,
            )?
            .register(
                "code-deopt",
                vec![Int, Int, Address, Int, Int, Str, Str, Str],
                Self::on_code_deopt,
            )?
            .register(
                "code-disable-optimization",
                vec![Str, Str],
                Self::on_disable_optimization,
            )?
            .register("map-create", vec![Int, Address], Self::on_map_create)?
            .register("map-details", vec![Int, Address, Str], Self::on_map_details)?
            .register(
                "map",
                vec![
                    Str,
                    Int,
                    Address,
                    Address,
                    FieldParser::optional(Address, zero),
                    FieldParser::optional(Int, zero),
                    FieldParser::optional(Int, zero),
                    FieldParser::optional(Str, absent),
                    FieldParser::optional(Str, absent),
                ],
                Self::on_map,
            )?
            .register(
                "tick",
                vec![Address, Int, Int, Address, Int, FieldParser::rest(Str)],
                Self::on_tick,
            )?
            .register(TIMER_MARKER, vec![Int], |_, _| Ok(()))?;

        for name in IC_RECORDS {
            table.register(
                name,
                vec![
                    Command,
                    Address,
                    Int,
                    Int,
                    Int,
                    Str,
                    Str,
                    Address,
                    Str,
                    FieldParser::optional(Str, absent),
                    FieldParser::optional(Str, absent),
                ],
                Self::on_ic,
            )?;
        }
        Ok(table)
    }

    /// A reader over [`LogProcessor::dispatch_table`]
    pub fn reader(config: &AnalyzerConfig) -> Result<LogReader<Self>> {
        Ok(LogReader::new(Self::dispatch_table()?, config.reader.clone()))
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn name_at(&self, addr: u64) -> Option<String> {
        self.profile
            .find_entry(addr)
            .map(|id| self.profile.display_name(id))
    }

    /// Best known position of the code covering `addr`
    fn code_position(&self, addr: u64) -> FilePosition {
        let Some(id) = self.profile.find_entry(addr) else {
            return FilePosition::new(UNKNOWN_URI, 0, 0);
        };
        let entry = self.profile.entry(id);
        let func = entry.func().map_or(entry, |f| self.profile.entry(f));
        match parse_name_location(&func.name) {
            Some((url, line, column)) => FilePosition::new(url, line, column),
            None => FilePosition::new(
                self.profile.script_url(id).unwrap_or_else(|| UNKNOWN_URI.to_string()),
                0,
                0,
            ),
        }
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    fn on_version(&mut self, args: &Args) -> Result<()> {
        let part = |idx: usize| -> Result<u32> {
            u32::try_from(args.int(idx)?)
                .map_err(|_| Error::parse_error("negative version component"))
        };
        let logged = Version::new(part(0)?, part(1)?, part(2)?);
        if self.version_locked {
            tracing::info!(%logged, forced = %self.version, "ignoring logged V8 version");
        } else {
            tracing::info!(version = %logged, "V8 version");
            self.version = logged;
        }
        Ok(())
    }

    fn on_shared_library(&mut self, args: &Args) -> Result<()> {
        let (name, start, end) = (args.str(0)?, args.address(1)?, args.address(2)?);
        self.profile.add_library(name, start, end)?;
        let symbols = place_symbols(&self.symbols.symbols(name)?, start, end);
        tracing::debug!(library = name, symbols = symbols.len(), "registering library symbols");
        for symbol in symbols {
            self.profile.add_static_code(&symbol.name, symbol.start, symbol.end)?;
        }
        Ok(())
    }

    fn on_code_creation(&mut self, args: &Args) -> Result<()> {
        let code_type = args.str(0)?;
        let kind = match CodeKind::decode(&args.int(1)?.to_string(), self.version) {
            Ok(kind) => Some(kind),
            Err(err) => {
                tracing::debug!("{err}");
                None
            }
        };
        let timestamp = timestamp(args, 2)?;
        let start = args.address(3)?;
        let size = size(args, 4)?;
        let name = args.str(5)?;
        match args.opt_address(6)? {
            Some(func_addr) => {
                let state = FunctionState::decode(args.opt_str(7)?.unwrap_or(""), self.version)?;
                self.profile
                    .add_func_code(code_type, name, timestamp, start, size, func_addr, state, kind)?;
            }
            None => {
                self.profile
                    .add_code(code_type, name, timestamp, start, size, kind)?;
            }
        }
        Ok(())
    }

    fn on_code_move(&mut self, args: &Args) -> Result<()> {
        self.profile.move_code(args.address(0)?, args.address(1)?)
    }

    fn on_code_delete(&mut self, args: &Args) -> Result<()> {
        self.profile.delete_code(args.address(0)?)
    }

    fn on_sfi_move(&mut self, args: &Args) -> Result<()> {
        self.profile.move_func(args.address(0)?, args.address(1)?)
    }

    fn on_code_source_info(&mut self, args: &Args) -> Result<()> {
        self.profile.add_source_positions(
            args.address(0)?,
            script_id(args, 1)?,
            offset(args, 2)?,
            offset(args, 3)?,
            args.str(4)?,
            args.str(5)?,
            args.str(6)?,
        )
    }

    fn on_script_source(&mut self, args: &Args) -> Result<()> {
        self.profile
            .add_script_source(script_id(args, 0)?, args.str(1)?, args.str(2)?.to_string())
    }

    fn on_script_details(&mut self, args: &Args) -> Result<()> {
        self.profile.add_script_details(script_id(args, 0)?, args.str(1)?)
    }

    fn on_code_deopt(&mut self, args: &Args) -> Result<()> {
        let timestamp = timestamp(args, 0)?;
        let code = args.address(2)?;
        let inlining_id = args.int(3)?;
        let kind = DeoptimizeKind::decode(args.str(5)?, self.version)?;
        let reason = args.str(7)?;
        let position = args
            .str(6)?
            .parse::<FilePosition>()
            .unwrap_or_else(|_| self.code_position(code));
        let function_name = self.name_at(code);
        self.profile.add_deopt_reason(code, reason)?;
        self.events.add_deopt(
            position,
            DeoptUpdate {
                timestamp,
                kind,
                reason: reason.to_string(),
                function_name,
                inlining_id,
            },
        );
        Ok(())
    }

    fn on_disable_optimization(&mut self, args: &Args) -> Result<()> {
        let (name, reason) = (args.str(0)?, args.str(1)?);
        let marked = self.profile.disable_optimization(name, reason)?;
        tracing::debug!(name, reason, marked, "optimization disabled");
        self.events.add_disabled_optimization(name, reason);
        Ok(())
    }

    fn on_ic(&mut self, args: &Args) -> Result<()> {
        let pc = args.address(1)?;
        let update = IcUpdate {
            timestamp: timestamp(args, 2)?,
            ic_type: args.command().to_string(),
            old_state: IcState::decode(args.str(5)?, self.version)?,
            new_state: IcState::decode(args.str(6)?, self.version)?,
            map: args.address(7)?,
            key: args.str(8)?.to_string(),
            modifier: args.opt_str(9)?.unwrap_or_default().to_string(),
            slow_reason: args.opt_str(10)?.unwrap_or_default().to_string(),
            function_name: self.name_at(pc),
        };
        let uri = self
            .profile
            .find_entry(pc)
            .and_then(|id| self.profile.script_url(id))
            .unwrap_or_else(|| UNKNOWN_URI.to_string());
        let position = FilePosition::new(uri, clamp(args.int(3)?), clamp(args.int(4)?));
        self.events.add_ic(position, update);
        Ok(())
    }

    fn on_map_create(&mut self, args: &Args) -> Result<()> {
        self.events.add_map_update(
            args.address(1)?,
            MapUpdate {
                timestamp: timestamp(args, 0)?,
                event: MapEvent::Create,
                detail: String::new(),
                from: None,
                reason: String::new(),
                name: String::new(),
                position: None,
            },
        );
        Ok(())
    }

    fn on_map_details(&mut self, args: &Args) -> Result<()> {
        self.events.add_map_update(
            args.address(1)?,
            MapUpdate {
                timestamp: timestamp(args, 0)?,
                event: MapEvent::Details,
                detail: args.str(2)?.to_string(),
                from: None,
                reason: String::new(),
                name: String::new(),
                position: None,
            },
        );
        Ok(())
    }

    fn on_map(&mut self, args: &Args) -> Result<()> {
        let from = args.address(2)?;
        let pc = args.address(4)?;
        let position = (pc != 0).then(|| {
            let code = self.code_position(pc);
            FilePosition::new(code.uri, clamp(args.int(5).unwrap_or(0)), clamp(args.int(6).unwrap_or(0)))
        });
        self.events.add_map_update(
            args.address(3)?,
            MapUpdate {
                timestamp: timestamp(args, 1)?,
                event: MapEvent::Transition,
                detail: args.str(0)?.to_string(),
                from: (from != 0).then_some(from),
                reason: args.opt_str(7)?.unwrap_or_default().to_string(),
                name: args.opt_str(8)?.unwrap_or_default().to_string(),
                position,
            },
        );
        Ok(())
    }

    fn on_tick(&mut self, args: &Args) -> Result<()> {
        let pc = args.address(0)?;
        let frames = args.str_list(5)?;
        let tick = TickSample {
            pc,
            timestamp: timestamp(args, 1)?,
            is_external_callback: args.int(2)? != 0,
            tos_or_external_callback: args.address(3)?,
            vm_state: VmState::from_ordinal(args.int(4)?, self.version)?,
            stack: crate::profile::symbolize::parse_stack_frames(pc, &frames)?,
        };
        self.profile.record_tick(&tick)?;
        Ok(())
    }
}

fn non_negative(args: &Args, idx: usize, what: &str) -> Result<u64> {
    let value = args.int(idx)?;
    u64::try_from(value).map_err(|_| Error::parse_error(format!("negative {} {}", what, value)))
}

fn timestamp(args: &Args, idx: usize) -> Result<u64> {
    non_negative(args, idx, "timestamp")
}

fn size(args: &Args, idx: usize) -> Result<u64> {
    non_negative(args, idx, "size")
}

fn offset(args: &Args, idx: usize) -> Result<u64> {
    non_negative(args, idx, "offset")
}

fn script_id(args: &Args, idx: usize) -> Result<u32> {
    let value = args.int(idx)?;
    u32::try_from(value).map_err(|_| Error::parse_error(format!("invalid script id {}", value)))
}

fn clamp(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

// ============================================================================
// Entry points
// ============================================================================

/// Read a whole log from `input`
pub fn analyze_reader<R: BufRead>(
    input: R,
    config: &AnalyzerConfig,
    provider: Box<dyn ScriptSourceProvider>,
    token: CancellationToken,
) -> Result<Analysis> {
    let mut processor = LogProcessor::with_source_provider(config, provider)?;
    let mut reader = LogProcessor::reader(config)?.with_cancellation(token);
    reader.process_reader(&mut processor, input)?;
    Ok(processor.finish(&reader))
}

/// Read a log held in memory
pub fn analyze_str(text: &str, config: &AnalyzerConfig) -> Result<Analysis> {
    let mut processor = LogProcessor::new(config)?;
    let mut reader = LogProcessor::reader(config)?;
    reader.process_chunk(&mut processor, text)?;
    reader.finish(&mut processor)?;
    Ok(processor.finish(&reader))
}

/// Read a log file. Scripts the log does not embed are looked up relative
/// to the log's directory.
pub fn analyze_file(path: &Path, config: &AnalyzerConfig, token: CancellationToken) -> Result<Analysis> {
    let file = std::fs::File::open(path)?;
    let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
    analyze_reader(
        std::io::BufReader::new(file),
        config,
        Box::new(FsScriptSource::with_root(root)),
        token,
    )
}
