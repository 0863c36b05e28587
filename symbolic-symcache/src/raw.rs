//! The raw SymCache binary file format internals.

use symbolic_common::DebugId;
use watto::Pod;

/// The magic file preamble as individual bytes.
const SYMCACHE_MAGIC_BYTES: [u8; 4] = *b"SYMC";

/// The magic file preamble to identify SymCache files.
///
/// Serialized as ASCII "SYMC" on little-endian (x64) systems.
pub(crate) const SYMCACHE_MAGIC: u32 = u32::from_le_bytes(SYMCACHE_MAGIC_BYTES);
/// The byte-flipped magic, which indicates an endianness mismatch.
pub(crate) const SYMCACHE_MAGIC_FLIPPED: u32 = SYMCACHE_MAGIC.swap_bytes();

/// Marks an absent file, parent or address.
pub(crate) const NONE: u32 = u32::MAX;

/// The number of line records per [`LineBlock`].
pub(crate) const LINE_BLOCK_SIZE: usize = 16;

/// Set in [`Range::flags`] when the range comes from the symbol table.
pub(crate) const RANGE_FROM_SYMBOL: u32 = 1;

/// The header of a SymCache file.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct Header {
    /// The file magic representing the file format and endianness.
    pub(crate) magic: u32,
    /// The SymCache format version.
    pub(crate) version: u32,

    /// Debug identifier of the object file.
    pub(crate) debug_id: DebugId,
    /// CPU architecture of the object file, see [`Arch::from_u32`](symbolic_common::Arch).
    pub(crate) arch: u32,

    /// Number of included [`File`]s.
    pub(crate) num_files: u32,
    /// Number of included [`Function`]s.
    pub(crate) num_functions: u32,
    /// Number of included [`Range`]s.
    pub(crate) num_ranges: u32,
    /// Number of included [`Inlinee`]s.
    pub(crate) num_inlinees: u32,
    /// Number of included [`LineBlock`]s.
    pub(crate) num_line_blocks: u32,
    /// Total number of bytes in the line program.
    pub(crate) line_bytes: u32,
    /// Total number of bytes used for string data.
    pub(crate) string_bytes: u32,

    /// The address all stored addresses are relative to.
    pub(crate) range_offset: u64,

    /// Reserved for future use.
    pub(crate) _reserved: [u8; 16],
}

/// Serialized file in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub(crate) struct File {
    /// The optional compilation directory prefix.
    pub(crate) comp_dir_offset: u32,
    /// The optional directory prefix.
    pub(crate) directory_offset: u32,
    /// The file path.
    pub(crate) name_offset: u32,
}

/// Serialized function in the cache.
///
/// Outer functions and inlined functions share this table. Its entries are referenced by
/// [`Range`]s and [`Inlinee`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub(crate) struct Function {
    /// The function's name.
    pub(crate) name_offset: u32,
    /// The compilation directory of the function.
    pub(crate) comp_dir_offset: u32,
    /// The first address of the function, relative to the header's `range_offset`.
    pub(crate) entry_pc: u32,
    /// The language of the function.
    pub(crate) lang: u32,
}

/// A disjoint, address-sorted range owned by exactly one outer function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct Range {
    /// Start address, inclusive.
    pub(crate) start: u32,
    /// End address, exclusive.
    pub(crate) end: u32,
    /// Index of the outer [`Function`].
    pub(crate) function_idx: u32,
    /// See [`RANGE_FROM_SYMBOL`].
    pub(crate) flags: u32,
    /// Index of the first [`LineBlock`] of the outer function in this range.
    pub(crate) first_line_block: u32,
    /// Number of line blocks of the outer function in this range.
    pub(crate) num_line_blocks: u32,
    /// Index of the first [`Inlinee`] in this range.
    pub(crate) first_inlinee: u32,
    /// Number of inlinees in this range.
    pub(crate) num_inlinees: u32,
}

/// An inlined call inside of a [`Range`].
///
/// The inlinees of one range are stored in pre-order: a parent always precedes its children, and
/// siblings are sorted by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct Inlinee {
    /// Start address, inclusive.
    pub(crate) start: u32,
    /// End address, exclusive.
    pub(crate) end: u32,
    /// Index of the inlined [`Function`].
    pub(crate) function_idx: u32,
    /// Index of the calling inlinee, or [`NONE`] if called by the range's outer function.
    pub(crate) parent_idx: u32,
    /// Nesting depth, starting at 1 for calls made by the outer function.
    pub(crate) depth: u32,
    /// Index of the first [`LineBlock`] of this inlinee.
    pub(crate) first_line_block: u32,
    /// Number of line blocks of this inlinee.
    pub(crate) num_line_blocks: u32,
    pub(crate) _padding: u32,
}

/// A group of up to [`LINE_BLOCK_SIZE`] consecutive line records.
///
/// The first record is stored inline, which allows binary searching the blocks. The remaining
/// records are delta-encoded in the line program, starting at `program_offset`:
///
/// - address delta to the previous record (ULEB128, never negative),
/// - line delta to the previous record (SLEB128),
/// - file index plus one, zero marking an absent file (ULEB128).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct LineBlock {
    /// Address of the first record.
    pub(crate) address: u32,
    /// Line number of the first record.
    pub(crate) line: u32,
    /// File index of the first record, or [`NONE`].
    pub(crate) file_idx: u32,
    /// Offset of the remaining records in the line program.
    pub(crate) program_offset: u32,
    /// Total number of records in this block.
    pub(crate) len: u32,
}

unsafe impl Pod for Header {}
unsafe impl Pod for File {}
unsafe impl Pod for Function {}
unsafe impl Pod for Range {}
unsafe impl Pod for Inlinee {}
unsafe impl Pod for LineBlock {}

#[cfg(test)]
mod tests {
    use std::mem;

    use super::*;

    #[test]
    fn test_sizeof() {
        assert_eq!(mem::size_of::<Header>(), 96);
        assert_eq!(mem::align_of::<Header>(), 8);

        assert_eq!(mem::size_of::<File>(), 12);
        assert_eq!(mem::size_of::<Function>(), 16);
        assert_eq!(mem::size_of::<Range>(), 32);
        assert_eq!(mem::size_of::<Inlinee>(), 32);
        assert_eq!(mem::size_of::<LineBlock>(), 20);
        assert_eq!(mem::align_of::<LineBlock>(), 4);
    }
}
