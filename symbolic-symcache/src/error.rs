use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

/// The kind of value that did not fit into the SymCache format.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ValueKind {
    /// An address relative to the object's load address.
    Address,
    /// A string offset or the total size of all strings.
    String,
    /// A function record.
    Function,
    /// A file record.
    File,
    /// A line number or line record.
    Line,
    /// An address range.
    Range,
    /// An inlined call.
    Inlinee,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ValueKind::Address => write!(f, "address"),
            ValueKind::String => write!(f, "string"),
            ValueKind::Function => write!(f, "function"),
            ValueKind::File => write!(f, "file"),
            ValueKind::Line => write!(f, "line record"),
            ValueKind::Range => write!(f, "range"),
            ValueKind::Inlinee => write!(f, "inlinee"),
        }
    }
}

/// The kind of a [`Error`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The file was generated by a system with different endianness.
    WrongEndianness,
    /// The file magic does not match.
    WrongFormat,
    /// The file version is not supported.
    WrongVersion,
    /// The header could not be read.
    InvalidHeader,
    /// The files section could not be read.
    InvalidFiles,
    /// The functions section could not be read.
    InvalidFunctions,
    /// The ranges section could not be read.
    InvalidRanges,
    /// The inlinees section could not be read.
    InvalidInlinees,
    /// The line tables could not be read.
    InvalidLines,
    /// The string data section is shorter than the header claims.
    UnexpectedStringBytes {
        /// Expected number of string bytes.
        expected: usize,
        /// Number of string bytes actually found.
        found: usize,
    },
    /// The `Object` contains invalid data and cannot be converted.
    BadDebugFile,
    /// A value cannot be written to the SymCache as it overflows the record size.
    ValueTooLarge(ValueKind),
    /// A value cannot be written to the SymCache as it overflows the segment counter.
    TooManyValues(ValueKind),
    /// Generic error when writing a SymCache, most likely IO.
    WriteFailed,
}

impl ErrorKind {
    /// Maps this kind onto the coarse classification shared by all crates.
    pub fn coarse(self) -> symbolic_common::ErrorKind {
        use symbolic_common::ErrorKind as Coarse;

        match self {
            Self::WrongEndianness
            | Self::WrongFormat
            | Self::WrongVersion
            | Self::InvalidHeader
            | Self::InvalidFiles
            | Self::InvalidFunctions
            | Self::InvalidRanges
            | Self::InvalidInlinees
            | Self::InvalidLines
            | Self::UnexpectedStringBytes { .. }
            | Self::BadDebugFile
            | Self::WriteFailed => Coarse::MalformedInput,
            Self::ValueTooLarge(_) | Self::TooManyValues(_) => Coarse::CapacityExceeded,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongEndianness => write!(f, "endianness mismatch"),
            Self::WrongFormat => write!(f, "wrong format magic"),
            Self::WrongVersion => write!(f, "unknown SymCache version"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidFiles => write!(f, "invalid files"),
            Self::InvalidFunctions => write!(f, "invalid functions"),
            Self::InvalidRanges => write!(f, "invalid ranges"),
            Self::InvalidInlinees => write!(f, "invalid inlinees"),
            Self::InvalidLines => write!(f, "invalid line tables"),
            Self::UnexpectedStringBytes { expected, found } => write!(
                f,
                "unexpected string bytes: expected {expected}, found {found}"
            ),
            Self::BadDebugFile => write!(f, "malformed debug info file"),
            Self::ValueTooLarge(kind) => write!(f, "{kind} too large for symcache file format"),
            Self::TooManyValues(kind) => write!(f, "too many {kind}s for symcache"),
            Self::WriteFailed => write!(f, "failed to write symcache"),
        }
    }
}

/// An error encountered while building or parsing a [`SymCache`](crate::SymCache).
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct Error {
    pub(crate) kind: ErrorKind,
    #[source]
    pub(crate) source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl Error {
    /// Creates a new SymCache error from a known kind of error as well as an
    /// arbitrary error payload.
    pub(crate) fn new<E>(kind: ErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let source = Some(source.into());
        Self { kind, source }
    }

    /// Returns the corresponding [`ErrorKind`] for this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the coarse classification of this error.
    pub fn coarse_kind(&self) -> symbolic_common::ErrorKind {
        self.kind.coarse()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coarse_kinds() {
        let err = Error::from(ErrorKind::WrongVersion);
        assert_eq!(err.coarse_kind(), symbolic_common::ErrorKind::MalformedInput);
        assert_eq!(err.to_string(), "unknown SymCache version");

        let err = Error::from(ErrorKind::ValueTooLarge(ValueKind::Address));
        assert_eq!(err.coarse_kind(), symbolic_common::ErrorKind::CapacityExceeded);
        assert_eq!(err.to_string(), "address too large for symcache file format");
    }
}
