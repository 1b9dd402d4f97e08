//! Analyzer configuration
//!
//! Settings come from an optional JSON file; command-line flags are layered
//! on top by the binary. Every field has a default, so `{}` is a valid file.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::versions::Version;

bitflags! {
    /// Categories of frames dropped from logical stacks
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SkipFilter: u8 {
        /// IC handlers and IC builtins
        const IC = 1 << 0;
        /// Bytecode handlers
        const BYTECODES = 1 << 1;
        /// Builtins
        const BUILTINS = 1 << 2;
        /// Code stubs
        const STUBS = 1 << 3;
        /// Frames inside native shared libraries
        const NATIVE_LIBRARIES = 1 << 4;
    }
}

impl Default for SkipFilter {
    /// Bytecode handlers are folded into their callers unless asked for
    fn default() -> Self {
        SkipFilter::BYTECODES
    }
}

/// Call-tree construction settings.
///
/// A `separate_*` flag keeps that category of frames as its own tree nodes;
/// clearing it attributes their time to the calling frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub separate_ic: bool,
    pub separate_bytecodes: bool,
    pub separate_builtins: bool,
    pub separate_stubs: bool,
    pub separate_native_libraries: bool,
    /// Milliseconds represented by one sample in derived views
    pub sampling_rate: f64,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            separate_ic: true,
            separate_bytecodes: false,
            separate_builtins: true,
            separate_stubs: true,
            separate_native_libraries: true,
            sampling_rate: 1.0,
        }
    }
}

impl ProfileConfig {
    /// The categories to drop
    pub fn skip_filter(&self) -> SkipFilter {
        let mut skip = SkipFilter::empty();
        skip.set(SkipFilter::IC, !self.separate_ic);
        skip.set(SkipFilter::BYTECODES, !self.separate_bytecodes);
        skip.set(SkipFilter::BUILTINS, !self.separate_builtins);
        skip.set(SkipFilter::STUBS, !self.separate_stubs);
        skip.set(SkipFilter::NATIVE_LIBRARIES, !self.separate_native_libraries);
        skip
    }
}

/// Log reader settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Only dispatch lines between `current-time` markers
    pub timed_range: bool,
    /// Close the range after each pair of markers
    pub pairwise_timed_range: bool,
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub profile: ProfileConfig,
    pub reader: ReaderConfig,
    /// Decode enums for this V8 version instead of the log's `v8-version`
    pub version: Option<String>,
    /// Directory of `<library>.nm` symbol listings for shared libraries
    pub symbols_dir: Option<PathBuf>,
}

impl AnalyzerConfig {
    /// Parse a configuration from JSON text
    pub fn from_json(json: &str) -> Result<Self> {
        let config: AnalyzerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Forced tool version, if configured
    pub fn version_override(&self) -> Result<Option<Version>> {
        self.version.as_deref().map(str::parse).transpose()
    }

    fn validate(&self) -> Result<()> {
        let rate = self.profile.sampling_rate;
        if rate.is_nan() || rate <= 0.0 {
            return Err(Error::configuration(format!(
                "sampling_rate must be positive, got {}",
                rate
            )));
        }
        if self.reader.pairwise_timed_range && !self.reader.timed_range {
            tracing::warn!("pairwise_timed_range has no effect without timed_range");
        }
        self.version_override()?;
        Ok(())
    }
}
