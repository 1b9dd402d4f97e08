//! Shared test helpers for integration tests

#![allow(dead_code)]

use std::fmt::Write;

use v8lens::config::AnalyzerConfig;
use v8lens::{analyze_str, Analysis};

/// Builds a synthetic V8 log one record at a time
#[derive(Default)]
pub struct LogBuilder {
    text: String,
}

impl LogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any raw line, malformed or not
    pub fn line(mut self, line: &str) -> Self {
        self.text.push_str(line);
        self.text.push('\n');
        self
    }

    pub fn version(self, major: u32, minor: u32, build: u32) -> Self {
        let line = format!("v8-version,{major},{minor},{build},0,0");
        self.line(&line)
    }

    pub fn library(self, name: &str, start: u64, end: u64) -> Self {
        let line = format!("shared-library,{name},{start:#x},{end:#x},0");
        self.line(&line)
    }

    /// Code without a backing function
    pub fn code(self, code_type: &str, start: u64, size: u64, name: &str) -> Self {
        let line = format!("code-creation,{code_type},2,1,{start:#x},{size:#x},{name}");
        self.line(&line)
    }

    /// JS code compiled from the function at `func`
    pub fn js(self, start: u64, size: u64, name: &str, func: u64, state: &str) -> Self {
        let line = format!("code-creation,JS,13,1,{start:#x},{size:#x},{name},{func:#x},{state}");
        self.line(&line)
    }

    pub fn code_move(self, from: u64, to: u64) -> Self {
        let line = format!("code-move,{from:#x},{to:#x}");
        self.line(&line)
    }

    pub fn code_delete(self, start: u64) -> Self {
        let line = format!("code-delete,{start:#x}");
        self.line(&line)
    }

    /// A JS-state tick; `stack` lists return addresses, innermost caller first
    pub fn tick(self, pc: u64, timestamp: u64, stack: &[u64]) -> Self {
        let mut line = format!("tick,{pc:#x},{timestamp},0,0,0");
        for frame in stack {
            let _ = write!(line, ",{frame:#x}");
        }
        self.line(&line)
    }

    pub fn build(self) -> String {
        self.text
    }

    pub fn analyze(self) -> Analysis {
        analyze(&self.build())
    }
}

/// Analyze a log with the default configuration
pub fn analyze(log: &str) -> Analysis {
    analyze_str(log, &AnalyzerConfig::default()).unwrap()
}

/// A log with two JS functions calling into a builtin
pub fn sample_log() -> LogBuilder {
    LogBuilder::new()
        .version(11, 3, 244)
        .js(0x1000, 0x100, "main file:///app.js:1:1", 0x9000, "~")
        .js(0x2000, 0x100, "work file:///app.js:5:1", 0x9100, "*")
        .code("Builtin", 0x5000, 0x80, "ArrayPrototypePush")
        .tick(0x1010, 100, &[])
        .tick(0x2010, 110, &[0x1020])
        .tick(0x2020, 120, &[0x1020])
        .tick(0x5010, 130, &[0x2030, 0x1020])
        .tick(0x2010, 140, &[0x1020])
}
