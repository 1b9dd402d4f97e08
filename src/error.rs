//! Error types for v8lens

use std::fmt;
use thiserror::Error;

use crate::versions::Version;

/// Which mutating profile operation referenced an address nobody owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeOperation {
    /// `code-move` from a vacant address
    Move,
    /// `code-delete` of a vacant address
    Delete,
    /// A tick frame that did not resolve to any code
    Tick,
}

impl fmt::Display for CodeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeOperation::Move => write!(f, "move"),
            CodeOperation::Delete => write!(f, "delete"),
            CodeOperation::Tick => write!(f, "tick"),
        }
    }
}

/// Main error type for v8lens
#[derive(Error, Debug)]
pub enum Error {
    /// A log field could not be converted to the type its record expects
    #[error("ParseError: {message}")]
    ParseError { message: String },

    /// `move_code` was asked to relocate an address with no dynamic entry
    #[error("CodeNotFound: no dynamic code entry at {address:#x}")]
    CodeNotFound { address: u64 },

    /// A mutator was called on a profile that has already been finalized
    #[error("IllegalState: {0}")]
    IllegalState(String),

    /// A programming error in a dispatch table, version bound or config
    #[error("ConfigurationError: {0}")]
    Configuration(String),

    /// A legacy enum value has no mapping for the requested tool version
    #[error("UnknownEnumValue: {value:?} is not a valid {name} for V8 {version}")]
    UnknownEnumValue {
        name: &'static str,
        value: String,
        version: Version,
    },

    /// The ingest was cancelled by its caller
    #[error("Cancelled: log processing was cancelled")]
    Cancelled,

    /// IO error
    #[error("IOError: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },

    /// JSON (de)serialization error
    #[error("JsonError: {source}")]
    JsonError {
        #[from]
        source: serde_json::Error,
    },
}

impl Error {
    /// Create a parse error
    pub fn parse_error(message: impl Into<String>) -> Self {
        Error::ParseError {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    /// Create the error raised when a finalized profile is mutated
    pub fn finalized(operation: &str) -> Self {
        Error::IllegalState(format!(
            "cannot {} after the profile has been finalized",
            operation
        ))
    }

    /// Create an unknown enum value error
    pub fn unknown_enum_value(
        name: &'static str,
        value: impl fmt::Display,
        version: Version,
    ) -> Self {
        Error::UnknownEnumValue {
            name,
            value: value.to_string(),
            version,
        }
    }

    /// Whether this error is a cancellation that must propagate past
    /// per-line recovery
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Result type alias for v8lens
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = Error::CodeNotFound { address: 0x1000 };
        assert_eq!(
            err.to_string(),
            "CodeNotFound: no dynamic code entry at 0x1000"
        );

        let err = Error::finalized("add code");
        assert!(err.to_string().contains("cannot add code"));

        let err = Error::unknown_enum_value("IcState", "Q", Version::new(9, 0, 0));
        assert!(err.to_string().contains("\"Q\" is not a valid IcState for V8 9.0.0"));
    }

    #[test]
    fn test_cancellation_is_distinct() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(!Error::parse_error("bad int").is_cancellation());
        assert!(!Error::finalized("tick").is_cancellation());
    }
}
