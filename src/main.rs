//! v8lens CLI
//!
//! Analyzes a V8 `--log`/`--prof` file and prints a profile summary, exports
//! a `.cpuprofile`, emits folded stacks, or lists deopts and IC transitions.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use v8lens::calltree::WeightKind;
use v8lens::config::AnalyzerConfig;
use v8lens::logreader::CancellationToken;
use v8lens::versions::VmState;
use v8lens::{analyze_file, Analysis, VERSION};

#[derive(Parser)]
#[command(name = "v8lens")]
#[command(author, version, about = "Analyze V8 execution-trace logs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Keep IC frames as separate nodes
    #[arg(long, global = true, value_name = "BOOL")]
    separate_ic: Option<bool>,

    /// Keep bytecode handler frames as separate nodes
    #[arg(long, global = true, value_name = "BOOL")]
    separate_bytecodes: Option<bool>,

    /// Keep builtin frames as separate nodes
    #[arg(long, global = true, value_name = "BOOL")]
    separate_builtins: Option<bool>,

    /// Keep stub frames as separate nodes
    #[arg(long, global = true, value_name = "BOOL")]
    separate_stubs: Option<bool>,

    /// Only use lines between `current-time` markers
    #[arg(long, global = true)]
    timed_range: bool,

    /// Close the timed range after each pair of markers
    #[arg(long, global = true)]
    pairwise_timed_range: bool,

    /// Directory holding `<library>.nm` files (`nm -C --defined-only --print-size`)
    #[arg(long, global = true, value_name = "DIR")]
    symbols_dir: Option<PathBuf>,

    /// Decode the log as this V8 version (e.g. 11.3.0)
    #[arg(long, global = true, value_name = "VERSION")]
    version_override: Option<String>,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Print tick counters and the heaviest functions
    Summary {
        /// The log file
        log: PathBuf,
        /// Number of functions to list
        #[arg(short = 'n', long, default_value_t = 20)]
        top: usize,
    },

    /// Write a DevTools `.cpuprofile`
    Export {
        /// The log file
        log: PathBuf,
        /// Output path (defaults to the log path with a `.cpuprofile` extension)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Print folded stacks for flame graph tools
    Folded {
        /// The log file
        log: PathBuf,
    },

    /// List deoptimizations by position, most frequent first
    Deopts {
        /// The log file
        log: PathBuf,
    },

    /// List inline cache transitions by position, most degraded first
    Ics {
        /// The log file
        log: PathBuf,
    },
}

impl Commands {
    fn log(&self) -> &Path {
        match self {
            Commands::Summary { log, .. }
            | Commands::Export { log, .. }
            | Commands::Folded { log }
            | Commands::Deopts { log }
            | Commands::Ics { log } => log,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    tracing::debug!(version = VERSION, "v8lens starting");

    let config = load_config(&cli)?;
    let log = cli.command.log();
    let analysis = analyze_file(log, &config, CancellationToken::new())
        .with_context(|| format!("failed to analyze {}", log.display()))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match &cli.command {
        Commands::Summary { top, .. } => print_summary(&mut out, &analysis, *top)?,
        Commands::Export { log, out: path } => {
            let path = path.clone().unwrap_or_else(|| log.with_extension("cpuprofile"));
            analysis
                .profile
                .cpu_profile()?
                .save(&path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            writeln!(out, "wrote {}", path.display())?;
        }
        Commands::Folded { .. } => write!(out, "{}", analysis.profile.tree().folded_stacks())?,
        Commands::Deopts { .. } => print_deopts(&mut out, &analysis)?,
        Commands::Ics { .. } => print_ics(&mut out, &analysis)?,
    }
    out.flush()?;

    report_failures(&analysis);
    Ok(())
}

/// Default to warn; each `-v` raises our level. `RUST_LOG` wins when set.
fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,v8lens={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<AnalyzerConfig> {
    let mut config = match &cli.config {
        Some(path) => AnalyzerConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => AnalyzerConfig::default(),
    };
    let profile = &mut config.profile;
    if let Some(v) = cli.separate_ic {
        profile.separate_ic = v;
    }
    if let Some(v) = cli.separate_bytecodes {
        profile.separate_bytecodes = v;
    }
    if let Some(v) = cli.separate_builtins {
        profile.separate_builtins = v;
    }
    if let Some(v) = cli.separate_stubs {
        profile.separate_stubs = v;
    }
    if let Some(dir) = &cli.symbols_dir {
        config.symbols_dir = Some(dir.clone());
    }
    config.reader.timed_range |= cli.timed_range;
    config.reader.pairwise_timed_range |= cli.pairwise_timed_range;
    if let Some(version) = &cli.version_override {
        config.version = Some(version.clone());
        config
            .version_override()
            .with_context(|| format!("invalid --version-override {version}"))?;
    }
    Ok(config)
}

// ============================================================================
// Output
// ============================================================================

fn print_summary(out: &mut impl Write, analysis: &Analysis, top: usize) -> Result<()> {
    let profile = &analysis.profile;
    let counters = profile.counters();
    writeln!(out, "V8 version: {}", analysis.version)?;
    writeln!(
        out,
        "Ticks: {} total, {} unaccounted",
        counters.total, counters.unaccounted
    )?;
    let mut states: Vec<(VmState, u64)> = counters.by_state.iter().map(|(s, n)| (*s, *n)).collect();
    states.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| format!("{:?}", a.0).cmp(&format!("{:?}", b.0))));
    for (state, ticks) in states {
        writeln!(out, "  {:<16} {:>8}", format!("{state:?}"), ticks)?;
    }

    writeln!(out)?;
    writeln!(out, " self ticks   self%  total%  function")?;
    for row in profile.tree().top_functions(top, WeightKind::SelfWeight) {
        writeln!(
            out,
            "{:>11} {:>6.1}% {:>6.1}%  {}",
            row.self_weight, row.self_percent, row.total_percent, row.label
        )?;
    }

    let c_entries = profile.c_entry_profile();
    if c_entries.len() > 1 {
        writeln!(out)?;
        writeln!(out, "C entry points:")?;
        for entry in &c_entries {
            writeln!(out, "{:>11}  {}", entry.ticks, entry.name)?;
        }
    }

    let deopts = analysis.events.deopts().len();
    let ics = analysis.events.ics().len();
    let disabled = analysis.events.disabled_optimizations().len();
    if deopts + ics + disabled > 0 {
        writeln!(out)?;
        writeln!(
            out,
            "Deopt positions: {deopts}, IC positions: {ics}, optimizations disabled: {disabled}"
        )?;
    }
    Ok(())
}

fn print_deopts(out: &mut impl Write, analysis: &Analysis) -> Result<()> {
    for entry in analysis.events.deopts_by_count() {
        let kind = entry
            .worst_kind()
            .map(|k| format!("{k:?}"))
            .unwrap_or_default();
        writeln!(out, "{:>6}  {:<16} {}", entry.updates.len(), kind, entry.position)?;
        if let Some(latest) = entry.latest() {
            let function = latest.function_name.as_deref().unwrap_or("<unknown>");
            writeln!(out, "        {} ({})", latest.reason, function)?;
        }
    }
    for disabled in analysis.events.disabled_optimizations() {
        writeln!(
            out,
            "disabled  {}: {}",
            disabled.function_name, disabled.reason
        )?;
    }
    Ok(())
}

fn print_ics(out: &mut impl Write, analysis: &Analysis) -> Result<()> {
    for entry in analysis.events.ics_by_severity() {
        let state = entry
            .worst_state()
            .map(|s| format!("{s:?}"))
            .unwrap_or_default();
        writeln!(
            out,
            "{:>6}  {:<16} maps={:<3} {}",
            entry.updates.len(),
            state,
            entry.maps().len(),
            entry.position
        )?;
        if let Some(latest) = entry.latest() {
            writeln!(out, "        {} {}", latest.ic_type, latest.key)?;
        }
    }
    Ok(())
}

fn report_failures(analysis: &Analysis) {
    let unknown = analysis.profile.unknown_code().len();
    if unknown > 0 {
        eprintln!("{unknown} code events referred to unknown addresses");
    }
    if analysis.failures.is_empty() {
        return;
    }
    eprintln!(
        "{} of {} lines could not be processed",
        analysis.failures.len(),
        analysis.stats.lines
    );
    for failure in analysis.failures.iter().take(10) {
        eprintln!(
            "  line {}: {}: {}",
            failure.line,
            failure.command.as_deref().unwrap_or("?"),
            failure.message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::try_parse_from([
            "v8lens",
            "summary",
            "v8.log",
            "--separate-bytecodes",
            "true",
            "--timed-range",
            "--symbols-dir",
            "syms",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let config = load_config(&cli).unwrap();
        assert!(config.profile.separate_bytecodes);
        assert!(config.profile.separate_ic);
        assert!(config.reader.timed_range);
        assert_eq!(config.symbols_dir.as_deref(), Some(Path::new("syms")));
        assert_eq!(cli.command.log(), Path::new("v8.log"));
    }

    #[test]
    fn test_bad_version_override_is_rejected() {
        let cli = Cli::try_parse_from(["v8lens", "ics", "v8.log", "--version-override", "x.y"]).unwrap();
        assert!(load_config(&cli).is_err());
    }
}
