//! v8lens: V8 execution-trace log analysis
//!
//! v8lens reads the text logs V8 writes with `--log`/`--prof` (code events,
//! deoptimizations, inline cache and map transitions, profiler ticks) and
//! turns them into a symbolized CPU profile plus per-position deopt and IC
//! histories. Malformed lines are reported and skipped; the rest of the log
//! is still used.
//!
//! # Quick Start
//!
//! ```no_run
//! use v8lens::config::AnalyzerConfig;
//! use v8lens::logreader::CancellationToken;
//! use v8lens::processor::analyze_file;
//!
//! fn main() -> v8lens::Result<()> {
//!     let config = AnalyzerConfig::default();
//!     let analysis = analyze_file("v8.log".as_ref(), &config, CancellationToken::new())?;
//!     analysis.profile.cpu_profile()?.save("v8.cpuprofile".as_ref())?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! Log text flows: [`logreader`] → [`processor`] → [`profile`] (over [`codemap`] and [`calltree`]) → views and export
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Ingest** | [`logreader`], [`processor`], [`versions`], [`config`] |
//! | **Model** | [`splay`], [`codemap`], [`profile`], [`events`] |
//! | **Output** | [`calltree`] (views, `.cpuprofile` export, folded stacks) |

pub mod calltree;
pub mod codemap;
pub mod config;
pub mod events;
pub mod logreader;
pub mod processor;
pub mod profile;
pub mod splay;
pub mod versions;

mod error;

pub use error::{CodeOperation, Error, Result};
pub use processor::{analyze_file, analyze_reader, analyze_str, Analysis, LogProcessor};
pub use profile::Profile;

/// v8lens version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
