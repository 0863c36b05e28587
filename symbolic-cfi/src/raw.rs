//! The raw CfiCache binary file format internals.

use watto::Pod;

/// The magic file preamble to identify cficache files.
///
/// Serialized as ASCII "CFIC" on little-endian (x64) systems.
pub const CFICACHE_MAGIC: u32 = u32::from_le_bytes(*b"CFIC");
/// The byte-flipped magic, which indicates an endianness mismatch.
pub(crate) const CFICACHE_MAGIC_FLIPPED: u32 = CFICACHE_MAGIC.swap_bytes();

/// The header of a CfiCache file.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct Header {
    /// The file magic representing the file format and endianness.
    pub(crate) magic: u32,
    /// The CfiCache format version.
    pub(crate) version: u32,
    /// CPU architecture of the object file, see [`Arch::from_u32`](symbolic_common::Arch).
    pub(crate) arch: u32,
    /// Number of included [`Entry`]s.
    pub(crate) num_entries: u32,
    /// Total number of bytes in the rule programs.
    pub(crate) program_bytes: u32,
    /// Total number of bytes used for string data.
    pub(crate) string_bytes: u32,
    /// The address all stored addresses are relative to.
    pub(crate) load_address: u64,
    /// Reserved for future use.
    pub(crate) _reserved: [u8; 8],
}

/// One disjoint code range with its rule program.
///
/// A program is a sequence of LEB128 varints: the string offset of the initial rules, the number
/// of deltas, and then for every delta its address relative to the previous one together with
/// the string offset of the changed rules.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct Entry {
    /// Start address, relative to the load address.
    pub(crate) start: u32,
    /// End address, exclusive.
    pub(crate) end: u32,
    /// Byte offset of this entry's program.
    pub(crate) program_offset: u32,
    /// The [`UnwindSource`](symbolic_debuginfo::UnwindSource) the rules were taken from.
    pub(crate) source: u32,
}

unsafe impl Pod for Header {}
unsafe impl Pod for Entry {}

#[cfg(test)]
mod tests {
    use std::mem;

    use super::*;

    #[test]
    fn test_sizeof() {
        assert_eq!(mem::size_of::<Header>(), 40);
        assert_eq!(mem::align_of::<Header>(), 8);

        assert_eq!(mem::size_of::<Entry>(), 16);
        assert_eq!(mem::align_of::<Entry>(), 4);
    }
}
