use std::fmt;

use symbolic_common::ErrorKind;

/// Result of processing a Minidump file.
///
/// Usually included in [`ProcessMinidumpError`] when the file cannot be processed.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProcessResult {
    /// The dump was processed successfully.
    Ok,

    /// The minidump file was not found or the buffer was empty.
    MinidumpNotFound,

    /// The minidump file had no header.
    NoMinidumpHeader,

    /// The minidump file has no thread list.
    NoThreadList,

    /// There was an error getting one thread's data from the dump.
    InvalidThreadIndex,

    /// There was an error getting a thread id from the thread's data.
    InvalidThreadId,

    /// There was more than one requesting thread.
    DuplicateRequestingThreads,

    /// The dump processing was interrupted (not fatal).
    SymbolSupplierInterrupted,
}

impl ProcessResult {
    /// Indicates whether the process state is usable.
    ///
    /// Depending on the result, the process state might only contain partial information. For a
    /// full minidump, check for `ProcessResult::Ok` instead.
    pub fn is_usable(self) -> bool {
        matches!(self, ProcessResult::Ok | ProcessResult::NoThreadList)
    }
}

impl fmt::Display for ProcessResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formatted = match *self {
            ProcessResult::Ok => "dump processed successfully",
            ProcessResult::MinidumpNotFound => "file could not be opened",
            ProcessResult::NoMinidumpHeader => "minidump header missing",
            ProcessResult::NoThreadList => "minidump has no thread list",
            ProcessResult::InvalidThreadIndex => "could not get thread data",
            ProcessResult::InvalidThreadId => "could not get a thread by id",
            ProcessResult::DuplicateRequestingThreads => "multiple requesting threads",
            ProcessResult::SymbolSupplierInterrupted => "processing was interrupted (not fatal)",
        };

        f.write_str(formatted)
    }
}

/// An error generated when trying to process a minidump.
#[derive(Debug, thiserror::Error)]
#[error("minidump processing failed: {kind}")]
pub struct ProcessMinidumpError {
    kind: ProcessResult,
    #[source]
    source: Option<minidump::Error>,
}

impl ProcessMinidumpError {
    pub(crate) fn new(kind: ProcessResult, source: Option<minidump::Error>) -> Self {
        Self { kind, source }
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> ProcessResult {
        self.kind
    }

    /// Returns the coarse classification of this error.
    ///
    /// Every failure that aborts processing means the minidump is structurally unusable.
    pub fn coarse_kind(&self) -> ErrorKind {
        ErrorKind::CorruptedSnapshot
    }
}

impl From<ProcessResult> for ProcessMinidumpError {
    fn from(kind: ProcessResult) -> Self {
        Self::new(kind, None)
    }
}
