//! Streaming reader for V8 `--log` files
//!
//! The reader tokenizes each line, looks the record up in a
//! [`DispatchTable`] and hands the parsed fields to its handler. A line that
//! fails to parse or whose handler fails is logged and recorded as a
//! [`LineFailure`]; the rest of the log is still processed. Only
//! [`Error::Cancelled`] aborts a read.
//!
//! # Example
//! ```
//! use v8lens::logreader::{DispatchTable, FieldParser, LogReader};
//! use v8lens::config::ReaderConfig;
//!
//! let mut table: DispatchTable<Vec<i64>> = DispatchTable::new();
//! table.register("n", vec![FieldParser::Int], |sink, args| {
//!     sink.push(args.int(0)?);
//!     Ok(())
//! }).unwrap();
//!
//! let mut reader = LogReader::new(table, ReaderConfig::default());
//! let mut seen = Vec::new();
//! reader.process_chunk(&mut seen, "n,1\nn,oops\nn,3\n").unwrap();
//! assert_eq!(seen, vec![1, 3]);
//! assert_eq!(reader.failures()[0].line, 2);
//! ```

mod cancel;
pub mod csv;
mod dispatch;

pub use cancel::CancellationToken;
pub use dispatch::{
    parse_address, parse_int, Args, DispatchTable, FieldParser, FieldValue, Handler, RecordSpec,
};

use std::io::BufRead;

use crate::config::ReaderConfig;
use crate::error::{Error, Result};

/// Record that brackets timed ranges
pub const TIMER_MARKER: &str = "current-time";

/// A line that could not be processed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineFailure {
    /// 1-based line number
    pub line: usize,
    /// Record name, when the line tokenized far enough to have one
    pub command: Option<String>,
    pub message: String,
}

/// Counters for one read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Physical lines seen
    pub lines: usize,
    /// Lines handed to a handler successfully
    pub dispatched: usize,
    /// Lines whose record name has no handler
    pub unknown: usize,
    /// Lines dropped by timed-range filtering
    pub filtered: usize,
}

#[derive(Debug, Default)]
struct TimedRange {
    seen_marker: bool,
    buffered: Vec<(usize, String)>,
}

/// Line-at-a-time driver for a [`DispatchTable`]
pub struct LogReader<S> {
    dispatch: DispatchTable<S>,
    config: ReaderConfig,
    token: CancellationToken,
    line_number: usize,
    partial: String,
    timed: TimedRange,
    failures: Vec<LineFailure>,
    stats: ReaderStats,
}

impl<S> LogReader<S> {
    /// Create a reader over `dispatch`
    pub fn new(dispatch: DispatchTable<S>, config: ReaderConfig) -> Self {
        Self {
            dispatch,
            config,
            token: CancellationToken::new(),
            line_number: 0,
            partial: String::new(),
            timed: TimedRange::default(),
            failures: Vec::new(),
            stats: ReaderStats::default(),
        }
    }

    /// Use `token` for cooperative cancellation
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// The token checked before each line
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Lines that failed so far
    pub fn failures(&self) -> &[LineFailure] {
        &self.failures
    }

    /// Counters so far
    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    /// Process a chunk of log text. A trailing line without `\n` is held
    /// back until the next chunk or [`LogReader::finish`].
    pub fn process_chunk(&mut self, sink: &mut S, chunk: &str) -> Result<()> {
        let mut text = std::mem::take(&mut self.partial);
        text.push_str(chunk);
        let mut lines = text.split('\n').peekable();
        while let Some(line) = lines.next() {
            if lines.peek().is_none() {
                self.partial = line.to_string();
                break;
            }
            self.process_log_line(sink, line)?;
        }
        Ok(())
    }

    /// Flush a held-back final line
    pub fn finish(&mut self, sink: &mut S) -> Result<()> {
        let last = std::mem::take(&mut self.partial);
        if !last.is_empty() {
            self.process_log_line(sink, &last)?;
        }
        Ok(())
    }

    /// Process every line of `input`.
    ///
    /// A line that is not valid UTF-8 is recorded as a [`LineFailure`] and
    /// skipped; IO errors and cancellation abort the read.
    pub fn process_reader<R: BufRead>(&mut self, sink: &mut S, mut input: R) -> Result<()> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if input.read_until(b'\n', &mut buf)? == 0 {
                return Ok(());
            }
            if buf.last() == Some(&b'\n') {
                buf.pop();
            }
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            match std::str::from_utf8(&buf) {
                Ok(line) => self.process_log_line(sink, line)?,
                Err(err) => self.record_undecodable_line(&buf, err)?,
            }
        }
    }

    fn record_undecodable_line(&mut self, raw: &[u8], err: std::str::Utf8Error) -> Result<()> {
        self.token.check()?;
        self.line_number += 1;
        self.stats.lines += 1;
        let line_number = self.line_number;
        let command = raw
            .split(|b| *b == b',')
            .next()
            .filter(|name| !name.is_empty())
            .map(|name| String::from_utf8_lossy(name).into_owned());
        tracing::warn!(line = line_number, ?command, "skipping line that is not valid UTF-8: {err}");
        self.failures.push(LineFailure {
            line: line_number,
            command,
            message: format!("ParseError: invalid UTF-8: {err}"),
        });
        Ok(())
    }

    /// Process one complete line, honoring timed-range settings
    pub fn process_log_line(&mut self, sink: &mut S, line: &str) -> Result<()> {
        self.token.check()?;
        self.line_number += 1;
        self.stats.lines += 1;
        let line_number = self.line_number;

        if !self.config.timed_range {
            return self.process_line_now(sink, line_number, line);
        }

        if line.starts_with(TIMER_MARKER) {
            if self.timed.seen_marker {
                let buffered = std::mem::take(&mut self.timed.buffered);
                for (number, text) in buffered {
                    self.token.check()?;
                    self.process_line_now(sink, number, &text)?;
                }
                if self.config.pairwise_timed_range {
                    self.timed.seen_marker = false;
                }
            } else {
                self.timed.seen_marker = true;
            }
        } else if self.timed.seen_marker {
            self.timed.buffered.push((line_number, line.to_string()));
        } else if line.starts_with("tick") {
            self.stats.filtered += 1;
        } else {
            self.process_line_now(sink, line_number, line)?;
        }
        Ok(())
    }

    fn process_line_now(&mut self, sink: &mut S, line_number: usize, line: &str) -> Result<()> {
        if line.trim().is_empty() {
            return Ok(());
        }
        let mut command = None;
        let result = csv::parse_line(line).and_then(|tokens| {
            command = tokens.first().cloned();
            self.dispatch.dispatch(sink, &tokens, &self.token)
        });
        match result {
            Ok(true) => self.stats.dispatched += 1,
            Ok(false) => {
                self.stats.unknown += 1;
                tracing::trace!(line = line_number, ?command, "skipping unknown record");
            }
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) => {
                tracing::warn!(line = line_number, ?command, "failed to process log line: {err}");
                self.failures.push(LineFailure {
                    line: line_number,
                    command,
                    message: err.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Give back the dispatch table
    pub fn into_dispatch(self) -> DispatchTable<S> {
        self.dispatch
    }
}

impl<S> std::fmt::Debug for LogReader<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogReader")
            .field("config", &self.config)
            .field("line_number", &self.line_number)
            .field("failures", &self.failures.len())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Fail unless `failures` is empty; used by callers that want strict reads
pub fn ensure_no_failures(failures: &[LineFailure]) -> Result<()> {
    match failures.first() {
        None => Ok(()),
        Some(first) => Err(Error::parse_error(format!(
            "{} line(s) failed, first at line {}: {}",
            failures.len(),
            first.line,
            first.message
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn table() -> DispatchTable<Vec<String>> {
        let mut table = DispatchTable::new();
        table
            .register("code", vec![FieldParser::Address], |sink: &mut Vec<String>, args| {
                sink.push(format!("code {:#x}", args.address(0)?));
                Ok(())
            })
            .unwrap()
            .register("tick", vec![FieldParser::Int], |sink: &mut Vec<String>, args| {
                sink.push(format!("tick {}", args.int(0)?));
                Ok(())
            })
            .unwrap()
            .register(TIMER_MARKER, vec![FieldParser::Int], |_: &mut Vec<String>, _| Ok(()))
            .unwrap()
            .register("stop", vec![FieldParser::Cancellation], |_: &mut Vec<String>, args| {
                args.token(0)?.cancel();
                Err(Error::Cancelled)
            })
            .unwrap();
        table
    }

    #[test]
    fn test_chunks_split_mid_line() {
        let mut reader = LogReader::new(table(), ReaderConfig::default());
        let mut sink = Vec::new();
        reader.process_chunk(&mut sink, "code,0x10\nti").unwrap();
        reader.process_chunk(&mut sink, "ck,5\ncode,0x").unwrap();
        reader.process_chunk(&mut sink, "20").unwrap();
        reader.finish(&mut sink).unwrap();
        assert_eq!(sink, vec!["code 0x10", "tick 5", "code 0x20"]);
        assert_eq!(reader.stats().lines, 3);
    }

    #[test]
    fn test_failures_do_not_stop_the_stream() {
        let mut reader = LogReader::new(table(), ReaderConfig::default());
        let mut sink = Vec::new();
        reader
            .process_chunk(&mut sink, "code,0x10\nunknown,1\ntick,abc\n\ntick,\"unterminated\ncode,0x30\n")
            .unwrap();
        assert_eq!(sink, vec!["code 0x10", "code 0x30"]);
        let lines: Vec<usize> = reader.failures().iter().map(|f| f.line).collect();
        assert_eq!(lines, vec![3, 5]);
        assert_eq!(reader.failures()[0].command.as_deref(), Some("tick"));
        assert_eq!(reader.stats().unknown, 1);
        assert!(ensure_no_failures(reader.failures()).is_err());
    }

    #[test]
    fn test_cancellation_propagates() {
        let mut reader = LogReader::new(table(), ReaderConfig::default());
        let mut sink = Vec::new();
        let err = reader
            .process_chunk(&mut sink, "code,0x10\nstop\ncode,0x20\n")
            .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(sink, vec!["code 0x10"]);
        assert!(reader.failures().is_empty());
        assert!(reader.cancellation_token().is_cancelled());
    }

    #[test]
    fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let mut reader = LogReader::new(table(), ReaderConfig::default()).with_cancellation(token);
        let mut sink = Vec::new();
        assert!(matches!(
            reader.process_log_line(&mut sink, "code,0x10"),
            Err(Error::Cancelled)
        ));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_timed_range() {
        let config = ReaderConfig {
            timed_range: true,
            pairwise_timed_range: false,
        };
        let mut reader = LogReader::new(table(), config);
        let mut sink = Vec::new();
        let log = "code,0x1\ntick,1\ncurrent-time,10\ntick,2\ncode,0x2\ncurrent-time,20\ntick,3\ncurrent-time,30\ntick,4\n";
        reader.process_chunk(&mut sink, log).unwrap();
        // Ticks outside the range are dropped, other records pass through;
        // lines after the last marker are never flushed.
        assert_eq!(sink, vec!["code 0x1", "tick 2", "code 0x2", "tick 3"]);
        assert_eq!(reader.stats().filtered, 1);
    }

    #[test]
    fn test_pairwise_timed_range() {
        let config = ReaderConfig {
            timed_range: true,
            pairwise_timed_range: true,
        };
        let mut reader = LogReader::new(table(), config);
        let mut sink = Vec::new();
        let log = "current-time,1\ntick,1\ncurrent-time,2\ntick,2\ncode,0x5\ncurrent-time,3\ntick,3\ncurrent-time,4\n";
        reader.process_chunk(&mut sink, log).unwrap();
        assert_eq!(sink, vec!["tick 1", "code 0x5", "tick 3"]);
    }

    #[test]
    fn test_process_reader() {
        let mut reader = LogReader::new(table(), ReaderConfig::default());
        let mut sink = Vec::new();
        reader
            .process_reader(&mut sink, std::io::Cursor::new("code,16\ntick,2\n"))
            .unwrap();
        assert_eq!(sink, vec!["code 0x10", "tick 2"]);
    }

    #[test]
    fn test_invalid_utf8_line_is_recorded() {
        let mut reader = LogReader::new(table(), ReaderConfig::default());
        let mut sink = Vec::new();
        let input: &[u8] = b"code,16\r\ntick,\xff\xfe\ncode,32\ntick,3";
        reader.process_reader(&mut sink, input).unwrap();
        assert_eq!(sink, vec!["code 0x10", "code 0x20", "tick 3"]);
        assert_eq!(reader.stats().lines, 4);
        assert_eq!(reader.failures().len(), 1);
        let failure = &reader.failures()[0];
        assert_eq!(failure.line, 2);
        assert_eq!(failure.command.as_deref(), Some("tick"));
        assert!(failure.message.contains("UTF-8"), "{}", failure.message);
    }
}
