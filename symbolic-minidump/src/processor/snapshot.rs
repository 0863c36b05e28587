use std::collections::BTreeMap;

use symbolic_unwind::MemoryRegion;

use super::system_info::SystemInfo;
use super::types::CodeModule;

/// A block of memory captured from the crashed process.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryBlock {
    /// The address of the first byte.
    pub base_address: u64,
    /// The captured bytes.
    pub data: Vec<u8>,
}

impl MemoryBlock {
    /// Creates a memory block at `base_address`.
    pub fn new(base_address: u64, data: Vec<u8>) -> Self {
        Self { base_address, data }
    }

    /// Creates a memory block from a sequence of little-endian machine words.
    pub fn from_words(base_address: u64, words: &[u64], word_size: usize) -> Self {
        let data = words
            .iter()
            .flat_map(|word| word.to_le_bytes().into_iter().take(word_size))
            .collect();

        Self { base_address, data }
    }

    /// Returns a borrowed view for unwind rule evaluation.
    pub fn region(&self) -> MemoryRegion<'_> {
        MemoryRegion {
            base_addr: self.base_address,
            contents: &self.data,
        }
    }
}

/// A frame recovered by an external stack walker.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PrewalkedFrame {
    /// The instruction address of the frame.
    pub instruction: u64,
    /// Register values known for this frame.
    pub registers: BTreeMap<String, u64>,
}

/// Captured state of one thread.
#[derive(Clone, Debug, Default)]
pub struct ThreadSnapshot {
    /// The operating system's identifier of the thread.
    pub thread_id: u32,
    /// Register values at the time of the crash, keyed by the context register name (`rip`,
    /// `sp`, ...). `None` if the context could not be read.
    pub context: Option<BTreeMap<String, u64>>,
    /// The captured stack memory, starting at or below the stack pointer.
    pub stack: Option<MemoryBlock>,
    /// Caller frames that have already been recovered. When present, they are used verbatim
    /// instead of unwinding.
    pub prewalked: Option<Vec<PrewalkedFrame>>,
}

/// Details of the exception that terminated the process.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExceptionInfo {
    /// The thread that raised the exception.
    pub thread_id: u32,
    /// An OS specific description, such as `SIGSEGV` or `EXCEPTION_ACCESS_VIOLATION`.
    pub reason: String,
    /// The address related to the crash, either the faulting data address or instruction.
    pub address: u64,
}

/// An owned, format independent model of a crashed process.
///
/// [`process`](super::process) builds this from a minidump. Callers with crash data in another
/// format construct it directly and pass it to [`process_snapshot`](super::process_snapshot).
#[derive(Clone, Debug, Default)]
pub struct ProcessSnapshot {
    /// The time the snapshot was taken, in seconds since the UNIX epoch.
    pub timestamp: u64,
    /// OS and CPU of the crashed system.
    pub system_info: SystemInfo,
    /// The threads of the process.
    pub threads: Vec<ThreadSnapshot>,
    /// All modules loaded into the process.
    pub modules: Vec<CodeModule>,
    /// The exception, if the process crashed.
    pub exception: Option<ExceptionInfo>,
    /// The thread that requested the snapshot if it was written without a crash.
    pub requesting_thread_id: Option<u32>,
    /// A textual description of a failed assertion.
    pub assertion: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_from_words() {
        let block = MemoryBlock::from_words(0x100, &[0x11223344, 0x55667788], 4);
        assert_eq!(block.data, [0x44, 0x33, 0x22, 0x11, 0x88, 0x77, 0x66, 0x55]);

        let region = block.region();
        assert_eq!(region.end_addr(), 0x108);
        assert_eq!(
            region.get::<u32, _>(0x104, symbolic_unwind::LittleEndian),
            Some(0x55667788)
        );
    }
}
