//! Declarative record dispatch
//!
//! Each record name maps to a list of [`FieldParser`]s and a handler. Field
//! lists are validated when they are registered, so a malformed table fails
//! before any log line is read.

use rustc_hash::FxHashMap as HashMap;
use std::fmt;

use super::cancel::CancellationToken;
use crate::error::{Error, Result};

/// How one field of a record is read
#[derive(Clone)]
pub enum FieldParser {
    /// Signed integer, decimal or `0x` hex
    Int,
    /// Unsigned address, `0x` hex or decimal
    Address,
    /// The raw field text
    Str,
    /// Any other conversion
    Custom(fn(&str) -> Result<FieldValue>),
    /// A trailing field that may be missing; the thunk supplies the default
    Optional(Box<FieldParser>, fn() -> FieldValue),
    /// Every remaining field, parsed with the inner parser. Must be last.
    Rest(Box<FieldParser>),
    /// Injects the record name without consuming a field
    Command,
    /// Injects the reader's cancellation token without consuming a field
    Cancellation,
}

impl FieldParser {
    /// Shorthand for [`FieldParser::Optional`]
    pub fn optional(inner: FieldParser, default: fn() -> FieldValue) -> Self {
        FieldParser::Optional(Box::new(inner), default)
    }

    /// Shorthand for [`FieldParser::Rest`]
    pub fn rest(inner: FieldParser) -> Self {
        FieldParser::Rest(Box::new(inner))
    }

    fn is_scalar(&self) -> bool {
        matches!(
            self,
            FieldParser::Int | FieldParser::Address | FieldParser::Str | FieldParser::Custom(_)
        )
    }

    fn is_pseudo(&self) -> bool {
        matches!(self, FieldParser::Command | FieldParser::Cancellation)
    }

    fn parse_scalar(&self, raw: &str) -> Result<FieldValue> {
        match self {
            FieldParser::Int => parse_int(raw).map(FieldValue::Int),
            FieldParser::Address => parse_address(raw).map(FieldValue::Address),
            FieldParser::Str => Ok(FieldValue::Str(raw.to_string())),
            FieldParser::Custom(parse) => parse(raw),
            _ => Err(Error::configuration(format!("{:?} is not a scalar parser", self))),
        }
    }
}

impl fmt::Debug for FieldParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldParser::Int => write!(f, "Int"),
            FieldParser::Address => write!(f, "Address"),
            FieldParser::Str => write!(f, "Str"),
            FieldParser::Custom(_) => write!(f, "Custom"),
            FieldParser::Optional(inner, _) => write!(f, "Optional({:?})", inner),
            FieldParser::Rest(inner) => write!(f, "Rest({:?})", inner),
            FieldParser::Command => write!(f, "Command"),
            FieldParser::Cancellation => write!(f, "Cancellation"),
        }
    }
}

/// A parsed field
#[derive(Debug, Clone)]
pub enum FieldValue {
    Int(i64),
    Address(u64),
    Str(String),
    List(Vec<FieldValue>),
    Cancellation(CancellationToken),
    Absent,
}

/// Parse an integer field (`-12`, `42`, `0x2a`)
pub fn parse_int(raw: &str) -> Result<i64> {
    let raw = raw.trim();
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => digits.parse::<i64>(),
    }
    .map_err(|_| Error::parse_error(format!("invalid integer '{}'", raw)))?;
    Ok(if negative { -value } else { value })
}

/// Parse an address field (`0x1f00` or decimal)
pub fn parse_address(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse::<u64>(),
    }
    .map_err(|_| Error::parse_error(format!("invalid address '{}'", raw)))
}

/// The parsed fields of one record, in declaration order
#[derive(Debug)]
pub struct Args {
    command: String,
    values: Vec<FieldValue>,
}

impl Args {
    /// Record name
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Number of declared fields
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the record declared no fields
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value at `idx`
    pub fn get(&self, idx: usize) -> Option<&FieldValue> {
        self.values.get(idx)
    }

    /// Integer at `idx`
    pub fn int(&self, idx: usize) -> Result<i64> {
        match self.values.get(idx) {
            Some(FieldValue::Int(v)) => Ok(*v),
            Some(FieldValue::Address(v)) => Ok(*v as i64),
            other => Err(self.mismatch(idx, "an integer", other)),
        }
    }

    /// Address at `idx`
    pub fn address(&self, idx: usize) -> Result<u64> {
        match self.values.get(idx) {
            Some(FieldValue::Address(v)) => Ok(*v),
            Some(FieldValue::Int(v)) if *v >= 0 => Ok(*v as u64),
            other => Err(self.mismatch(idx, "an address", other)),
        }
    }

    /// String at `idx`
    pub fn str(&self, idx: usize) -> Result<&str> {
        match self.values.get(idx) {
            Some(FieldValue::Str(s)) => Ok(s),
            other => Err(self.mismatch(idx, "a string", other)),
        }
    }

    /// Optional string at `idx`: `None` when the field was absent
    pub fn opt_str(&self, idx: usize) -> Result<Option<&str>> {
        match self.values.get(idx) {
            Some(FieldValue::Absent) | None => Ok(None),
            _ => self.str(idx).map(Some),
        }
    }

    /// Optional address at `idx`
    pub fn opt_address(&self, idx: usize) -> Result<Option<u64>> {
        match self.values.get(idx) {
            Some(FieldValue::Absent) | None => Ok(None),
            _ => self.address(idx).map(Some),
        }
    }

    /// Variadic tail at `idx`
    pub fn list(&self, idx: usize) -> Result<&[FieldValue]> {
        match self.values.get(idx) {
            Some(FieldValue::List(items)) => Ok(items),
            other => Err(self.mismatch(idx, "a list", other)),
        }
    }

    /// Variadic tail at `idx` as strings
    pub fn str_list(&self, idx: usize) -> Result<Vec<&str>> {
        self.list(idx)?
            .iter()
            .map(|item| match item {
                FieldValue::Str(s) => Ok(s.as_str()),
                other => Err(self.mismatch(idx, "a list of strings", Some(other))),
            })
            .collect()
    }

    /// Cancellation token injected at `idx`
    pub fn token(&self, idx: usize) -> Result<&CancellationToken> {
        match self.values.get(idx) {
            Some(FieldValue::Cancellation(token)) => Ok(token),
            other => Err(self.mismatch(idx, "a cancellation token", other)),
        }
    }

    fn mismatch(&self, idx: usize, expected: &str, found: Option<&FieldValue>) -> Error {
        Error::configuration(format!(
            "field {} of '{}' is not {} (found {:?})",
            idx, self.command, expected, found
        ))
    }
}

/// Handler invoked with the parsed fields of a record
pub type Handler<S> = fn(&mut S, &Args) -> Result<()>;

/// Field list and handler of one record type
pub struct RecordSpec<S> {
    fields: Vec<FieldParser>,
    handler: Handler<S>,
}

impl<S> RecordSpec<S> {
    /// Validate a field list.
    ///
    /// `Rest` may appear once, as the last field; only `Optional`, `Rest`
    /// and pseudo fields may follow an `Optional`.
    pub fn new(name: &str, fields: Vec<FieldParser>, handler: Handler<S>) -> Result<Self> {
        let mut seen_optional = false;
        for (idx, field) in fields.iter().enumerate() {
            match field {
                FieldParser::Rest(inner) => {
                    if idx + 1 != fields.len() {
                        return Err(Error::configuration(format!(
                            "'{}': rest field at position {} must be last",
                            name, idx
                        )));
                    }
                    if !inner.is_scalar() {
                        return Err(Error::configuration(format!(
                            "'{}': rest field must wrap a scalar parser",
                            name
                        )));
                    }
                }
                FieldParser::Optional(inner, _) => {
                    if !inner.is_scalar() {
                        return Err(Error::configuration(format!(
                            "'{}': optional field must wrap a scalar parser",
                            name
                        )));
                    }
                    seen_optional = true;
                }
                field if field.is_pseudo() => {}
                _ if seen_optional => {
                    return Err(Error::configuration(format!(
                        "'{}': required field at position {} follows an optional field",
                        name, idx
                    )));
                }
                _ => {}
            }
        }
        Ok(Self { fields, handler })
    }

    fn parse(&self, command: &str, tokens: &[String], token: &CancellationToken) -> Result<Args> {
        let mut values = Vec::with_capacity(self.fields.len());
        let mut cursor = 0;
        for field in &self.fields {
            let value = match field {
                FieldParser::Command => FieldValue::Str(command.to_string()),
                FieldParser::Cancellation => FieldValue::Cancellation(token.clone()),
                FieldParser::Optional(inner, default) => match tokens.get(cursor) {
                    Some(raw) => {
                        cursor += 1;
                        inner.parse_scalar(raw)?
                    }
                    None => default(),
                },
                FieldParser::Rest(inner) => {
                    let items = tokens
                        .get(cursor..)
                        .unwrap_or_default()
                        .iter()
                        .map(|raw| inner.parse_scalar(raw))
                        .collect::<Result<Vec<_>>>()?;
                    cursor = tokens.len();
                    FieldValue::List(items)
                }
                scalar => {
                    let raw = tokens.get(cursor).ok_or_else(|| {
                        Error::parse_error(format!(
                            "'{}' expects more fields, got {}",
                            command,
                            tokens.len()
                        ))
                    })?;
                    cursor += 1;
                    scalar.parse_scalar(raw)?
                }
            };
            values.push(value);
        }
        Ok(Args {
            command: command.to_string(),
            values,
        })
    }
}

/// Record name to [`RecordSpec`] table
pub struct DispatchTable<S> {
    records: HashMap<String, RecordSpec<S>>,
}

impl<S> DispatchTable<S> {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            records: HashMap::default(),
        }
    }

    /// Register a record type, replacing any previous registration
    pub fn register(
        &mut self,
        name: &str,
        fields: Vec<FieldParser>,
        handler: Handler<S>,
    ) -> Result<&mut Self> {
        let spec = RecordSpec::new(name, fields, handler)?;
        self.records.insert(name.to_string(), spec);
        Ok(self)
    }

    /// Whether `name` has a handler
    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    /// Registered record names, unordered
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    /// Parse and handle one tokenized line.
    ///
    /// Returns `Ok(false)` when the record type is unknown.
    pub fn dispatch(&self, sink: &mut S, tokens: &[String], token: &CancellationToken) -> Result<bool> {
        let Some((command, fields)) = tokens.split_first() else {
            return Ok(false);
        };
        let Some(spec) = self.records.get(command.as_str()) else {
            return Ok(false);
        };
        let args = spec.parse(command, fields, token)?;
        (spec.handler)(sink, &args)?;
        Ok(true)
    }
}

impl<S> Default for DispatchTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Sink {
        seen: Vec<String>,
    }

    fn tokens(line: &str) -> Vec<String> {
        line.split(',').map(str::to_string).collect()
    }

    fn record_add(sink: &mut Sink, args: &Args) -> Result<()> {
        let total = args.int(0)? + args.int(1)?;
        sink.seen.push(format!("{}={}", args.str(2)?, total));
        Ok(())
    }

    fn record_stack(sink: &mut Sink, args: &Args) -> Result<()> {
        assert_eq!(args.str(1)?, args.command());
        let frames: Vec<String> = args
            .list(2)?
            .iter()
            .map(|v| match v {
                FieldValue::Address(a) => format!("{:#x}", a),
                other => format!("{:?}", other),
            })
            .collect();
        sink.seen.push(format!("{}@{:#x}:{}", args.command(), args.address(0)?, frames.join("|")));
        Ok(())
    }

    fn record_optional(sink: &mut Sink, args: &Args) -> Result<()> {
        sink.seen.push(format!("{}:{:?}", args.str(0)?, args.opt_str(1)?));
        args.token(2)?.check()
    }

    fn table() -> DispatchTable<Sink> {
        let mut table = DispatchTable::new();
        table
            .register("add", vec![FieldParser::Int, FieldParser::Int, FieldParser::Str], record_add)
            .unwrap()
            .register(
                "stack",
                vec![FieldParser::Address, FieldParser::Command, FieldParser::rest(FieldParser::Address)],
                record_stack,
            )
            .unwrap()
            .register(
                "opt",
                vec![
                    FieldParser::Str,
                    FieldParser::optional(FieldParser::Str, || FieldValue::Absent),
                    FieldParser::Cancellation,
                ],
                record_optional,
            )
            .unwrap();
        table
    }

    #[test]
    fn test_dispatch_known_and_unknown() {
        let table = table();
        let token = CancellationToken::new();
        let mut sink = Sink::default();

        assert!(table.dispatch(&mut sink, &tokens("add,0x10,-6,sum"), &token).unwrap());
        assert!(!table.dispatch(&mut sink, &tokens("future-record,1,2"), &token).unwrap());
        assert!(table.dispatch(&mut sink, &tokens("stack,0x100,0x200,300"), &token).unwrap());
        assert!(table.dispatch(&mut sink, &tokens("opt,a"), &token).unwrap());
        assert!(table.dispatch(&mut sink, &tokens("opt,a,b,extra"), &token).unwrap());

        assert_eq!(
            sink.seen,
            vec![
                "sum=10".to_string(),
                "stack@0x100:0x200|0x12c".to_string(),
                "a:None".to_string(),
                "a:Some(\"b\")".to_string(),
            ]
        );
    }

    #[test]
    fn test_missing_and_malformed_fields() {
        let table = table();
        let token = CancellationToken::new();
        let mut sink = Sink::default();
        assert!(matches!(
            table.dispatch(&mut sink, &tokens("add,1"), &token),
            Err(Error::ParseError { .. })
        ));
        assert!(matches!(
            table.dispatch(&mut sink, &tokens("add,1,zz,x"), &token),
            Err(Error::ParseError { .. })
        ));
        assert!(sink.seen.is_empty());
    }

    #[test]
    fn test_cancellation_field() {
        let table = table();
        let token = CancellationToken::new();
        token.cancel();
        let mut sink = Sink::default();
        assert!(matches!(
            table.dispatch(&mut sink, &tokens("opt,a"), &token),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn test_invalid_field_lists_are_rejected() {
        let mut table: DispatchTable<Sink> = DispatchTable::new();
        let err = table
            .register("bad", vec![FieldParser::rest(FieldParser::Str), FieldParser::Int], record_add)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration(_)));

        assert!(table
            .register(
                "bad",
                vec![FieldParser::optional(FieldParser::Int, || FieldValue::Int(0)), FieldParser::Int],
                record_add
            )
            .is_err());
        assert!(table
            .register("bad", vec![FieldParser::rest(FieldParser::rest(FieldParser::Int))], record_add)
            .is_err());
        assert!(table
            .register(
                "ok",
                vec![FieldParser::optional(FieldParser::Int, || FieldValue::Int(0)), FieldParser::Command],
                record_add
            )
            .is_ok());
        assert!(!table.contains("bad"));
    }

    #[test]
    fn test_number_parsing() {
        assert_eq!(parse_int("0x1f").unwrap(), 31);
        assert_eq!(parse_int("-3").unwrap(), -3);
        assert_eq!(parse_address("4096").unwrap(), 4096);
        assert_eq!(parse_address("0xffff").unwrap(), 0xffff);
        assert!(parse_address("-1").is_err());
        assert!(parse_int("").is_err());
    }
}
