//! Version-keyed decoding of V8's legacy enum encodings
//!
//! V8 has renumbered and renamed the enums it writes into `--log` output many
//! times (deopt kinds, code kinds, IC states, VM states, function tiers). Each
//! logical enum here is backed by a [`VersionedEnum`]: an ordered list of
//! tables guarded by a [`VersionBound`], most specific first, ending in a
//! catch-all `*`. Lookup picks the first table whose bound admits the log's
//! version.
//!
//! The tables are `static` data; nothing is built or mutated at runtime.

mod tables;

pub use tables::{CodeKind, DeoptimizeKind, FunctionState, IcState, VmState};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

// ============================================================================
// Version
// ============================================================================

/// A V8 version as `major.minor.build`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl Version {
    /// Sentinel for "newest known encoding"; used when a log has no
    /// `v8-version` record.
    pub const MAX: Version = Version {
        major: u32::MAX,
        minor: u32::MAX,
        build: u32::MAX,
    };

    /// Create a version
    pub const fn new(major: u32, minor: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            build,
        }
    }

    /// Whether this is the [`Version::MAX`] sentinel
    pub fn is_max(&self) -> bool {
        *self == Version::MAX
    }
}

impl Default for Version {
    fn default() -> Self {
        Version::MAX
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_max() {
            write!(f, "latest")
        } else {
            write!(f, "{}.{}.{}", self.major, self.minor, self.build)
        }
    }
}

impl FromStr for Version {
    type Err = Error;

    /// Accepts `latest`, `X`, `X.Y` or `X.Y.Z`; trailing components such as a
    /// V8 patch number (`X.Y.Z.P`) are ignored.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("latest") || s.eq_ignore_ascii_case("max") {
            return Ok(Version::MAX);
        }
        let mut parts = [0u32; 3];
        let mut count = 0;
        for (i, part) in s.split('.').enumerate() {
            let value: u32 = part
                .parse()
                .map_err(|_| Error::parse_error(format!("invalid version '{}'", s)))?;
            if i < 3 {
                parts[i] = value;
            }
            count += 1;
        }
        if count == 0 || s.is_empty() {
            return Err(Error::parse_error("empty version"));
        }
        Ok(Version::new(parts[0], parts[1], parts[2]))
    }
}

// ============================================================================
// Bounds
// ============================================================================

/// The predicate guarding one table of a [`VersionedEnum`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionBound {
    /// `>=X.Y.Z`
    AtLeast(Version),
    /// `*`
    Any,
}

impl VersionBound {
    /// `>=major.minor.build`
    pub const fn at_least(major: u32, minor: u32, build: u32) -> Self {
        VersionBound::AtLeast(Version::new(major, minor, build))
    }

    /// Whether `version` satisfies this bound
    pub fn matches(&self, version: Version) -> bool {
        match self {
            VersionBound::AtLeast(lower) => version >= *lower,
            VersionBound::Any => true,
        }
    }
}

impl fmt::Display for VersionBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionBound::AtLeast(v) => write!(f, ">={}", v),
            VersionBound::Any => write!(f, "*"),
        }
    }
}

impl FromStr for VersionBound {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "*" {
            return Ok(VersionBound::Any);
        }
        match s.strip_prefix(">=") {
            Some(rest) => Ok(VersionBound::AtLeast(rest.parse()?)),
            None => Err(Error::configuration(format!(
                "unsupported version bound '{}', expected '>=X.Y.Z' or '*'",
                s
            ))),
        }
    }
}

// ============================================================================
// Tables
// ============================================================================

/// One encoded value: its ordinal and its printed name in a given table
#[derive(Debug, Clone, Copy)]
pub struct EnumEntry<T: 'static> {
    pub ordinal: i64,
    pub name: &'static str,
    pub value: T,
}

/// Shorthand for building [`EnumEntry`] tables
pub const fn entry<T>(ordinal: i64, name: &'static str, value: T) -> EnumEntry<T> {
    EnumEntry {
        ordinal,
        name,
        value,
    }
}

/// The encoding in force from `bound` onward
#[derive(Debug)]
pub struct VersionTable<T: 'static> {
    pub bound: VersionBound,
    pub entries: &'static [EnumEntry<T>],
}

/// An ordered, first-match-wins list of [`VersionTable`]s for one enum
#[derive(Debug)]
pub struct VersionedEnum<T: 'static> {
    name: &'static str,
    tables: &'static [VersionTable<T>],
}

impl<T: Copy + PartialEq + 'static> VersionedEnum<T> {
    /// Declare a versioned enum. Tables must be ordered most specific first.
    pub const fn new(name: &'static str, tables: &'static [VersionTable<T>]) -> Self {
        Self { name, tables }
    }

    /// Logical enum name, used in error messages
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// All tables in declaration order
    pub fn tables(&self) -> &'static [VersionTable<T>] {
        self.tables
    }

    /// The first table whose bound admits `version`
    pub fn table_for(&self, version: Version) -> Result<&'static VersionTable<T>> {
        self.tables
            .iter()
            .find(|table| table.bound.matches(version))
            .ok_or_else(|| {
                Error::configuration(format!(
                    "{} has no table for V8 {} (missing '*' entry)",
                    self.name, version
                ))
            })
    }

    /// Decode a numeric encoding
    pub fn decode_ordinal(&self, ordinal: i64, version: Version) -> Result<T> {
        self.table_for(version)?
            .entries
            .iter()
            .find(|e| e.ordinal == ordinal)
            .map(|e| e.value)
            .ok_or_else(|| Error::unknown_enum_value(self.name, ordinal, version))
    }

    /// Decode a printed encoding
    pub fn decode_name(&self, name: &str, version: Version) -> Result<T> {
        self.table_for(version)?
            .entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value)
            .ok_or_else(|| Error::unknown_enum_value(self.name, name, version))
    }

    /// Decode either encoding: integers by ordinal, anything else by name
    pub fn decode(&self, raw: &str, version: Version) -> Result<T> {
        match raw.trim().parse::<i64>() {
            Ok(ordinal) => self.decode_ordinal(ordinal, version),
            Err(_) => self.decode_name(raw, version),
        }
    }

    /// Printed name of `value` as the given version writes it
    pub fn format(&self, value: T, version: Version) -> Result<&'static str> {
        self.lookup(value, version).map(|e| e.name)
    }

    /// Ordinal of `value` as the given version writes it
    pub fn ordinal(&self, value: T, version: Version) -> Result<i64> {
        self.lookup(value, version).map(|e| e.ordinal)
    }

    fn lookup(&self, value: T, version: Version) -> Result<&'static EnumEntry<T>> {
        let table = self.table_for(version)?;
        table
            .entries
            .iter()
            .find(|e| e.value == value)
            .ok_or_else(|| Error::UnknownEnumValue {
                name: self.name,
                value: format!("<no encoding in {}>", table.bound),
                version,
            })
    }
}
