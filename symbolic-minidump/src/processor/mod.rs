//! Minidump processing and stack walking.
//!
//! [`process`] reads a minidump into a [`ProcessSnapshot`] and walks the stack of every thread.
//! Crash data from other sources can be processed with [`process_snapshot`] directly. Stack
//! walking uses the call frame information registered in a [`FrameInfoMap`] and falls back to
//! frame pointers and stack scanning for modules without it. The method that recovered each
//! frame is reported as its [`FrameTrust`].

use std::collections::BTreeSet;
use std::fmt;

mod error;
mod frame_info;
mod range_map;
mod reader;
mod snapshot;
mod system_info;
mod types;
mod walker;

pub use error::*;
pub use frame_info::*;
pub use snapshot::*;
pub use system_info::*;
pub use types::*;
pub use walker::WalkerConfig;

use range_map::ModuleMap;
use walker::StackWalker;

/// Snapshot of the state of a processes during its crash.
///
/// The object is obtained by processing a minidump with [`process`], or a [`ProcessSnapshot`]
/// with [`process_snapshot`]. It owns all of its data.
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProcessState {
    requesting_thread: i32,
    timestamp: u64,
    exception: Option<ExceptionInfo>,
    assertion: String,
    system_info: SystemInfo,
    threads: Vec<CallStack>,
    modules: Vec<CodeModule>,
}

impl ProcessState {
    /// The index of the thread that requested a dump be written in the threads vector.
    ///
    /// If a dump was produced as a result of a crash, this will point to the thread that crashed.
    /// If the dump was produced as by user code without crashing, and the dump contains extended
    /// Breakpad information, this will point to the thread that requested the dump. If the dump was
    /// not produced as a result of an exception and no extended Breakpad information is present,
    /// this field will be set to -1, indicating that the dump thread is not available.
    pub fn requesting_thread(&self) -> i32 {
        self.requesting_thread
    }

    /// The time-date stamp of the minidump.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// True if the process crashed, false if the dump was produced outside
    /// of an exception handler.
    pub fn crashed(&self) -> bool {
        self.exception.is_some()
    }

    /// If the process crashed, and if crash_reason implicates memory, the memory address that
    /// caused the crash.
    ///
    /// For data access errors, this will be the data address that caused the fault.  For code
    /// errors, this will be the address of the instruction that caused the fault.
    pub fn crash_address(&self) -> u64 {
        self.exception.as_ref().map_or(0, |exception| exception.address)
    }

    /// If the process crashed, the type of crash.
    ///
    /// OS- and possibly CPU-specific.  For example, "EXCEPTION_ACCESS_VIOLATION" (Windows),
    /// "EXC_BAD_ACCESS / KERN_INVALID_ADDRESS" (Mac OS X), "SIGSEGV" (other Unix).
    pub fn crash_reason(&self) -> &str {
        self.exception
            .as_ref()
            .map_or("", |exception| exception.reason.as_str())
    }

    /// If there was an assertion that was hit, a textual representation
    /// of that assertion, possibly including the file and line at which
    /// it occurred.
    pub fn assertion(&self) -> &str {
        &self.assertion
    }

    /// Returns OS and CPU information.
    pub fn system_info(&self) -> &SystemInfo {
        &self.system_info
    }

    /// Returns a list of `CallStack`s in the minidump.
    pub fn threads(&self) -> &[CallStack] {
        &self.threads
    }

    /// Returns the full list of loaded `CodeModule`s, sorted by base address.
    pub fn modules(&self) -> &[CodeModule] {
        &self.modules
    }

    /// Returns a list of all `CodeModule`s referenced in one of the `CallStack`s.
    pub fn referenced_modules(&self) -> BTreeSet<&CodeModule> {
        self.threads
            .iter()
            .flat_map(|stack| stack.frames().iter())
            .filter_map(|frame| frame.module())
            .collect()
    }
}

impl fmt::Debug for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessState")
            .field("requesting_thread", &self.requesting_thread())
            .field("timestamp", &self.timestamp())
            .field("crash_address", &self.crash_address())
            .field("crash_reason", &self.crash_reason())
            .field("assertion", &self.assertion())
            .field("system_info", &self.system_info())
            .field("threads", &self.threads())
            .field("modules", &self.modules())
            .finish()
    }
}

/// Processes a minidump supplied via raw binary data.
///
/// Returns a [`ProcessState`] that contains information about the crashed process. The
/// parameter `frame_infos` holds the CFI caches of loaded modules, which allow stack walking
/// with omitted frame pointers.
///
/// Threads whose context or stack cannot be read are reported with an empty call stack. Only a
/// minidump that cannot be read at all results in an error.
pub fn process(
    minidump: &[u8],
    frame_infos: &FrameInfoMap,
) -> Result<ProcessState, ProcessMinidumpError> {
    process_with_config(minidump, frame_infos, &WalkerConfig::default())
}

/// Processes a minidump with custom stack walking limits.
///
/// See [`process`] for details.
#[tracing::instrument(level = "trace", name = "process_minidump", skip_all)]
pub fn process_with_config(
    minidump: &[u8],
    frame_infos: &FrameInfoMap,
    config: &WalkerConfig,
) -> Result<ProcessState, ProcessMinidumpError> {
    let snapshot = reader::read_snapshot(minidump)?;
    process_snapshot_with_config(&snapshot, frame_infos, config)
}

/// Walks the stacks of a process snapshot.
///
/// This is the format independent part of [`process`].
pub fn process_snapshot(
    snapshot: &ProcessSnapshot,
    frame_infos: &FrameInfoMap,
) -> Result<ProcessState, ProcessMinidumpError> {
    process_snapshot_with_config(snapshot, frame_infos, &WalkerConfig::default())
}

/// Walks the stacks of a process snapshot with custom stack walking limits.
#[tracing::instrument(level = "trace", name = "process_snapshot", skip_all)]
pub fn process_snapshot_with_config(
    snapshot: &ProcessSnapshot,
    frame_infos: &FrameInfoMap,
    config: &WalkerConfig,
) -> Result<ProcessState, ProcessMinidumpError> {
    let requesting_thread = requesting_thread_index(snapshot)?;
    let arch = snapshot.system_info.cpu_arch();
    let modules = ModuleMap::new(snapshot.modules.clone());

    if arch.cpu_family().pointer_size().is_none() {
        tracing::warn!(
            cpu_family = snapshot.system_info.cpu_family(),
            "unsupported cpu, skipping stack walking"
        );
    }

    let threads = tracing::trace_span!("walk threads").in_scope(|| {
        snapshot
            .threads
            .iter()
            .map(|thread| {
                let stack = thread.stack.as_ref().map(MemoryBlock::region);
                match StackWalker::new(arch, stack, &modules, frame_infos, config) {
                    Some(walker) => walker.walk(thread),
                    None => CallStack {
                        thread_id: thread.thread_id,
                        frames: Vec::new(),
                    },
                }
            })
            .collect()
    });

    Ok(ProcessState {
        requesting_thread,
        timestamp: snapshot.timestamp,
        exception: snapshot.exception.clone(),
        assertion: snapshot.assertion.clone().unwrap_or_default(),
        system_info: snapshot.system_info.clone(),
        threads,
        modules: modules.into_modules(),
    })
}

/// Resolves the index of the crashed or requesting thread.
///
/// The exception thread takes precedence over the thread recorded by Breakpad.
fn requesting_thread_index(snapshot: &ProcessSnapshot) -> Result<i32, ProcessMinidumpError> {
    let thread_id = match snapshot.exception.as_ref() {
        Some(exception) => exception.thread_id,
        None => match snapshot.requesting_thread_id {
            Some(thread_id) => thread_id,
            None => return Ok(-1),
        },
    };

    let mut indexes = snapshot
        .threads
        .iter()
        .enumerate()
        .filter(|(_, thread)| thread.thread_id == thread_id)
        .map(|(index, _)| index);

    let Some(index) = indexes.next() else {
        tracing::warn!(thread_id, "requesting thread not found in thread list");
        return Ok(-1);
    };

    if indexes.next().is_some() {
        return Err(ProcessResult::DuplicateRequestingThreads.into());
    }

    Ok(i32::try_from(index).unwrap_or(-1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(thread_id: u32) -> ThreadSnapshot {
        ThreadSnapshot {
            thread_id,
            ..ThreadSnapshot::default()
        }
    }

    #[test]
    fn test_requesting_thread_from_exception() {
        let snapshot = ProcessSnapshot {
            threads: vec![thread(1), thread(2), thread(3)],
            exception: Some(ExceptionInfo {
                thread_id: 3,
                reason: "SIGSEGV".into(),
                address: 0x10,
            }),
            requesting_thread_id: Some(1),
            ..ProcessSnapshot::default()
        };

        assert_eq!(requesting_thread_index(&snapshot).unwrap(), 2);
    }

    #[test]
    fn test_requesting_thread_missing() {
        let mut snapshot = ProcessSnapshot {
            threads: vec![thread(1)],
            ..ProcessSnapshot::default()
        };
        assert_eq!(requesting_thread_index(&snapshot).unwrap(), -1);

        snapshot.requesting_thread_id = Some(7);
        assert_eq!(requesting_thread_index(&snapshot).unwrap(), -1);
    }

    #[test]
    fn test_duplicate_requesting_threads() {
        let snapshot = ProcessSnapshot {
            threads: vec![thread(4), thread(4)],
            requesting_thread_id: Some(4),
            ..ProcessSnapshot::default()
        };

        let error = requesting_thread_index(&snapshot).unwrap_err();
        assert_eq!(error.kind(), ProcessResult::DuplicateRequestingThreads);
    }
}
