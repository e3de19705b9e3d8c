//! Error types shared across framestore crates.
use std::fmt;

/// Boxed error produced by user supplied callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum FrameStoreError {
    #[error("io error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt storage: {0}")]
    Corrupt(String),

    #[error("invalid range [{begin}, {end}) for length {len}")]
    InvalidRange { begin: u64, end: u64, len: u64 },

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("operator '{operator}' failed: {source}")]
    OperatorFailure {
        operator: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("permutation assertion violated: {0}")]
    PermutationAssertion(String),

    #[error("invalid value for setting '{name}': {reason}")]
    InvalidSetting { name: String, reason: String },

    #[error("unknown setting: {0}")]
    UnknownSetting(String),

    #[error("missing column: {0}")]
    MissingColumn(String),

    #[error("duplicate column: {0}")]
    DuplicateColumn(String),

    #[error("length mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: u64, got: u64 },

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error("internal: {0}")]
    Internal(String),
}

/// Coarse classification of errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Open, read, write or corruption in the storage layer. Never retried.
    Io,
    /// Out of bounds slice or segment request.
    InvalidRange,
    /// Operator applied to an incompatible type.
    TypeMismatch,
    /// A user supplied callback failed.
    OperatorFailure,
    /// A forward map was not a permutation.
    PermutationAssertion,
    /// Bad setting name or value.
    Config,
    /// Frame shape errors (missing, duplicate columns, length mismatches).
    Schema,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Io => "IoError",
            Self::InvalidRange => "InvalidRange",
            Self::TypeMismatch => "TypeMismatch",
            Self::OperatorFailure => "OperatorFailure",
            Self::PermutationAssertion => "PermutationAssertionViolation",
            Self::Config => "ConfigError",
            Self::Schema => "SchemaError",
            Self::Internal => "InternalError",
        };
        write!(f, "{s}")
    }
}

impl FrameStoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } | Self::Corrupt(_) | Self::Serde(_) => ErrorKind::Io,
            Self::InvalidRange { .. } => ErrorKind::InvalidRange,
            Self::TypeMismatch(_) => ErrorKind::TypeMismatch,
            Self::OperatorFailure { .. } => ErrorKind::OperatorFailure,
            Self::PermutationAssertion(_) => ErrorKind::PermutationAssertion,
            Self::InvalidSetting { .. } | Self::UnknownSetting(_) => ErrorKind::Config,
            Self::MissingColumn(_) | Self::DuplicateColumn(_) | Self::LengthMismatch { .. } => {
                ErrorKind::Schema
            }
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Wrap an io error with some context about what we were doing.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        FrameStoreError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn operator_failure(operator: &'static str, source: BoxError) -> Self {
        FrameStoreError::OperatorFailure { operator, source }
    }

    pub fn type_mismatch(msg: impl Into<String>) -> Self {
        FrameStoreError::TypeMismatch(msg.into())
    }

    pub fn invalid_range(begin: u64, end: u64, len: u64) -> Self {
        FrameStoreError::InvalidRange { begin, end, len }
    }
}

impl From<std::io::Error> for FrameStoreError {
    fn from(e: std::io::Error) -> Self {
        FrameStoreError::io("unspecified", e)
    }
}

pub type Result<T, E = FrameStoreError> = std::result::Result<T, E>;

/// Attach context to io results.
pub trait IoResultExt<T> {
    fn io_context<C>(self, context: C) -> Result<T>
    where
        C: FnOnce() -> String;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn io_context<C>(self, context: C) -> Result<T>
    where
        C: FnOnce() -> String,
    {
        self.map_err(|e| FrameStoreError::io(context(), e))
    }
}

#[macro_export]
macro_rules! internal {
    ($($arg:tt)*) => {
        $crate::FrameStoreError::Internal(std::format!($($arg)*))
    };
}

#[macro_export]
macro_rules! corrupt {
    ($($arg:tt)*) => {
        $crate::FrameStoreError::Corrupt(std::format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        let err = FrameStoreError::invalid_range(4, 10, 8);
        assert_eq!(ErrorKind::InvalidRange, err.kind());
        assert_eq!("invalid range [4, 10) for length 8", err.to_string());

        let err = corrupt!("checksum mismatch for block {}", 3);
        assert_eq!(ErrorKind::Io, err.kind());

        let err = internal!("bad state");
        assert_eq!("internal: bad state", err.to_string());
    }

    #[test]
    fn operator_failure_keeps_source() {
        let cause: BoxError = "boom".into();
        let err = FrameStoreError::operator_failure("Transform", cause);
        assert_eq!(ErrorKind::OperatorFailure, err.kind());
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!("boom", source.to_string());
    }
}
