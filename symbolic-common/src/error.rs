use std::fmt;

/// The coarse classification shared by all errors in the symbolication pipeline.
///
/// Every crate has its own detailed error kind. Those map onto this enum so that callers can
/// decide how to react without matching on crate-specific variants: retry with other debug
/// files, give up on one module, or reject an input outright.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ErrorKind {
    /// A persisted cache has bad magic, an unknown version, or is truncated.
    MalformedInput,
    /// The input is valid, but its architecture or debug information kind is not supported.
    Unsupported,
    /// A value cannot be represented in the target binary layout.
    CapacityExceeded,
    /// An address or identifier is absent. This is an expected outcome.
    NotFound,
    /// A minidump is structurally invalid.
    CorruptedSnapshot,
}

impl ErrorKind {
    /// Returns whether the operation failed because of the input itself, in which case a retry
    /// with the same input is pointless.
    pub fn is_input_error(self) -> bool {
        matches!(
            self,
            ErrorKind::MalformedInput | ErrorKind::CorruptedSnapshot | ErrorKind::CapacityExceeded
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::MalformedInput => "malformed input",
            ErrorKind::Unsupported => "unsupported input",
            ErrorKind::CapacityExceeded => "capacity exceeded",
            ErrorKind::NotFound => "not found",
            ErrorKind::CorruptedSnapshot => "corrupted snapshot",
        })
    }
}
