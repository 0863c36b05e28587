use std::error::Error;
use std::fmt;
use std::io;

use thiserror::Error;

/// The error type for [`CfiError`].
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfiErrorKind {
    /// Required unwind sections are missing in the `Object` file.
    MissingDebugInfo,

    /// The unwind information in the `Object` file is not supported.
    UnsupportedDebugFormat,

    /// The unwind information in the `Object` file is invalid.
    BadDebugInfo,

    /// The `Object`s architecture is not supported by symbolic.
    UnsupportedArch,

    /// Unwind rows are not sorted, or lie outside of their table's range.
    InvalidAddress,

    /// An unwind rule uses an operation that cannot be expressed as a postfix rule.
    UnsupportedOperation,

    /// A value cannot be written to the cache as it overflows the record size.
    ValueTooLarge,

    /// Generic error when writing CFI information, likely IO.
    WriteFailed,

    /// Invalid magic bytes in the cfi cache header.
    BadFileMagic,

    /// The cache was written on a system with different endianness.
    WrongEndianness,

    /// The cache was written with a format version this library does not read.
    UnsupportedVersion,

    /// The cache is truncated or its sections are inconsistent.
    InvalidData,
}

impl CfiErrorKind {
    /// Maps this kind onto the coarse classification shared by all crates.
    pub fn coarse(self) -> symbolic_common::ErrorKind {
        use symbolic_common::ErrorKind as Coarse;

        match self {
            Self::MissingDebugInfo | Self::UnsupportedDebugFormat | Self::UnsupportedArch => {
                Coarse::Unsupported
            }
            Self::UnsupportedOperation => Coarse::Unsupported,
            Self::ValueTooLarge => Coarse::CapacityExceeded,
            Self::BadDebugInfo
            | Self::InvalidAddress
            | Self::WriteFailed
            | Self::BadFileMagic
            | Self::WrongEndianness
            | Self::UnsupportedVersion
            | Self::InvalidData => Coarse::MalformedInput,
        }
    }
}

impl fmt::Display for CfiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDebugInfo => write!(f, "missing cfi debug sections"),
            Self::UnsupportedDebugFormat => write!(f, "unsupported debug format"),
            Self::BadDebugInfo => write!(f, "bad debug information"),
            Self::UnsupportedArch => write!(f, "unsupported architecture"),
            Self::InvalidAddress => write!(f, "invalid cfi address"),
            Self::UnsupportedOperation => write!(f, "unsupported unwind operation"),
            Self::ValueTooLarge => write!(f, "value too large for cfi cache"),
            Self::WriteFailed => write!(f, "failed to write cfi"),
            Self::BadFileMagic => write!(f, "bad cfi cache magic"),
            Self::WrongEndianness => write!(f, "cfi cache endianness mismatch"),
            Self::UnsupportedVersion => write!(f, "unsupported cfi cache version"),
            Self::InvalidData => write!(f, "invalid cfi cache data"),
        }
    }
}

/// An error returned when building or reading a [`CfiCache`](crate::CfiCache).
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct CfiError {
    kind: CfiErrorKind,
    #[source]
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl CfiError {
    /// Creates a new CFI error from a known kind of error as well as an
    /// arbitrary error payload.
    pub(crate) fn new<E>(kind: CfiErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        let source = Some(source.into());
        Self { kind, source }
    }

    /// Returns the corresponding [`CfiErrorKind`] for this error.
    pub fn kind(&self) -> CfiErrorKind {
        self.kind
    }

    /// Returns the coarse classification of this error.
    pub fn coarse_kind(&self) -> symbolic_common::ErrorKind {
        self.kind.coarse()
    }
}

impl From<CfiErrorKind> for CfiError {
    fn from(kind: CfiErrorKind) -> Self {
        Self { kind, source: None }
    }
}

impl From<io::Error> for CfiError {
    fn from(e: io::Error) -> Self {
        Self::new(CfiErrorKind::WriteFailed, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coarse_kinds() {
        use symbolic_common::ErrorKind as Coarse;

        assert_eq!(CfiErrorKind::MissingDebugInfo.coarse(), Coarse::Unsupported);
        assert_eq!(CfiErrorKind::UnsupportedVersion.coarse(), Coarse::MalformedInput);
        assert_eq!(CfiErrorKind::ValueTooLarge.coarse(), Coarse::CapacityExceeded);

        let err = CfiError::from(io::Error::new(io::ErrorKind::Other, "disk full"));
        assert_eq!(err.kind(), CfiErrorKind::WriteFailed);
        assert_eq!(err.to_string(), "failed to write cfi");
        assert!(err.source().is_some());
    }
}
