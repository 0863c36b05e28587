//! Provides SymCache support.
//!
//! This includes a reader and writer for the binary format. A SymCache is built once from an
//! object file's debug information with a [`SymCacheConverter`], persisted, and later loaded with
//! [`SymCache::parse`] to resolve instruction addresses into functions, files and lines.
//!
//! # Structure of a SymCache
//!
//! A SymCache contains the following primary kinds of data, written in the following order, each
//! section aligned to 8 bytes:
//!
//! 1. Header
//! 2. Files
//! 3. Functions
//! 4. Ranges
//! 5. Inlinees
//! 6. Line Blocks
//! 7. Line Program
//! 8. String Data
//!
//! The format uses `u32`s to represent line numbers, addresses, references, and string offsets.
//! Line numbers use `0` to represent an unknown or invalid value. Addresses, references, and string
//! offsets instead use `u32::MAX`. All addresses are stored relative to the `range_offset` in the
//! header, which is the load address of the object.
//!
//! Strings are saved in one contiguous section with each individual string prefixed by its
//! LEB128 encoded length. Functions and files refer to strings by an offset into this section.
//!
//! ## Files and Functions
//!
//! A file contains string offsets for its compilation directory, parent directory and file
//! name. A function contains string offsets for its name and compilation directory, a u32 for its
//! entry address, and a u32 representing the source language. Both are deduplicated.
//!
//! ## Ranges
//!
//! Ranges are disjoint and sorted by address. Every range is owned by exactly one outer function,
//! either from the debug information or from the symbol table. When the debug information
//! contains overlapping functions, the smaller function wins and the larger one is split around
//! it. A function from the debug information always wins over a symbol table entry, so symbols
//! only fill gaps. Remaining ties are broken by the lower start address, and then by the
//! lexicographically smaller name.
//!
//! ## Inlinees
//!
//! Every range owns a contiguous slice of inlinees, stored in pre-order with a reference to their
//! parent inlinee. This forms the inline tree without any owned pointers.
//!
//! ## Line Tables
//!
//! Ranges and inlinees each own an address-sorted line table. Line tables are split into blocks
//! of 16 records. The first record of each block is stored in full so that blocks can be binary
//! searched. The rest are delta-encoded with LEB128 varints in the line program.
//!
//! The line table of a function that has inlinees contains the call site of the inlined function
//! for all addresses covered by the inlinee.
//!
//! # Lookups
//!
//! To look up an address `addr` in a SymCache:
//!
//! 1. Find the range covering `addr` via binary search.
//! 2. Find the innermost inlinee of that range covering `addr`.
//! 3. Return an iterator over a series of source locations that starts at the innermost inlinee.
//!    The iterator climbs up through the inlining hierarchy, ending at the outer function. For each
//!    level, the line is found by a binary search over its line blocks.
//!
//! ```
//! use symbolic_symcache::{SymCache, SymCacheConverter};
//!
//! let object = symbolic_testutils::inline_object();
//!
//! let mut converter = SymCacheConverter::new();
//! converter.process_object(&object).unwrap();
//! let mut buffer = Vec::new();
//! converter.serialize(&mut buffer).unwrap();
//!
//! let symcache = SymCache::parse(&buffer).unwrap();
//! let names: Vec<_> = symcache
//!     .lookup(0x1015)
//!     .map(|location| location.function().name().to_owned())
//!     .collect();
//! assert_eq!(names, ["g", "f"]);
//! ```

#![warn(missing_docs)]

mod error;
mod lookup;
mod raw;
mod writer;

use symbolic_common::{Arch, DebugId};
use watto::{align_to, Pod};

pub use error::{Error, ErrorKind, ValueKind};
pub use lookup::*;
pub use writer::SymCacheConverter;

type Result<T, E = Error> = std::result::Result<T, E>;

/// The latest version of the file format.
pub const SYMCACHE_VERSION: u32 = 1;

// Version history:
//
// 1: Initial implementation, with LEB128 line blocks and a pre-order inlinee table.
//
// Any change to the layout requires a version bump. Older and newer versions are rejected.

/// The serialized SymCache binary format.
///
/// This can be parsed from a binary buffer via [`SymCache::parse`] and lookups on it can be
/// performed via the [`SymCache::lookup`] method.
#[derive(Clone, PartialEq, Eq)]
pub struct SymCache<'data> {
    header: &'data raw::Header,
    files: &'data [raw::File],
    functions: &'data [raw::Function],
    ranges: &'data [raw::Range],
    inlinees: &'data [raw::Inlinee],
    line_blocks: &'data [raw::LineBlock],
    line_program: &'data [u8],
    string_bytes: &'data [u8],
}

impl std::fmt::Debug for SymCache<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymCache")
            .field("version", &self.header.version)
            .field("debug_id", &self.header.debug_id)
            .field("arch", &self.arch())
            .field("files", &self.header.num_files)
            .field("functions", &self.header.num_functions)
            .field("ranges", &self.header.num_ranges)
            .field("inlinees", &self.header.num_inlinees)
            .field("line_blocks", &self.header.num_line_blocks)
            .field("string_bytes", &self.header.string_bytes)
            .finish()
    }
}

impl<'data> SymCache<'data> {
    /// Parse the SymCache binary format into a convenient type that allows safe access and
    /// fast lookups.
    ///
    /// Only the latest version is accepted. Files written by other versions are rejected
    /// entirely, never partially parsed.
    pub fn parse(buf: &'data [u8]) -> Result<Self> {
        let (header, rest) = raw::Header::ref_from_prefix(buf).ok_or(ErrorKind::InvalidHeader)?;

        if header.magic == raw::SYMCACHE_MAGIC_FLIPPED {
            return Err(ErrorKind::WrongEndianness.into());
        }
        if header.magic != raw::SYMCACHE_MAGIC {
            return Err(ErrorKind::WrongFormat.into());
        }
        if header.version != SYMCACHE_VERSION {
            return Err(ErrorKind::WrongVersion.into());
        }

        let (_, rest) = align_to(rest, 8).ok_or(ErrorKind::InvalidFiles)?;
        let (files, rest) = raw::File::slice_from_prefix(rest, header.num_files as usize)
            .ok_or(ErrorKind::InvalidFiles)?;

        let (_, rest) = align_to(rest, 8).ok_or(ErrorKind::InvalidFunctions)?;
        let (functions, rest) =
            raw::Function::slice_from_prefix(rest, header.num_functions as usize)
                .ok_or(ErrorKind::InvalidFunctions)?;

        let (_, rest) = align_to(rest, 8).ok_or(ErrorKind::InvalidRanges)?;
        let (ranges, rest) = raw::Range::slice_from_prefix(rest, header.num_ranges as usize)
            .ok_or(ErrorKind::InvalidRanges)?;

        let (_, rest) = align_to(rest, 8).ok_or(ErrorKind::InvalidInlinees)?;
        let (inlinees, rest) = raw::Inlinee::slice_from_prefix(rest, header.num_inlinees as usize)
            .ok_or(ErrorKind::InvalidInlinees)?;

        let (_, rest) = align_to(rest, 8).ok_or(ErrorKind::InvalidLines)?;
        let (line_blocks, rest) =
            raw::LineBlock::slice_from_prefix(rest, header.num_line_blocks as usize)
                .ok_or(ErrorKind::InvalidLines)?;

        let (_, rest) = align_to(rest, 8).ok_or(ErrorKind::InvalidLines)?;
        let line_len = header.line_bytes as usize;
        if rest.len() < line_len {
            return Err(ErrorKind::InvalidLines.into());
        }
        let (line_program, rest) = rest.split_at(line_len);

        let (_, rest) = align_to(rest, 8).ok_or(ErrorKind::UnexpectedStringBytes {
            expected: header.string_bytes as usize,
            found: 0,
        })?;
        if rest.len() < header.string_bytes as usize {
            return Err(ErrorKind::UnexpectedStringBytes {
                expected: header.string_bytes as usize,
                found: rest.len(),
            }
            .into());
        }

        Ok(SymCache {
            header,
            files,
            functions,
            ranges,
            inlinees,
            line_blocks,
            line_program,
            string_bytes: rest,
        })
    }

    /// Resolves a string reference to the pointed-to `&str` data.
    fn get_string(&self, offset: u32) -> Option<&'data str> {
        symbolic_common::read_string(self.string_bytes, offset)
    }

    /// The version of the SymCache file format.
    pub fn version(&self) -> u32 {
        self.header.version
    }

    /// Returns true if this symcache's version is the current version of the format.
    pub fn is_latest(&self) -> bool {
        self.header.version == SYMCACHE_VERSION
    }

    /// The architecture of the symbol file.
    pub fn arch(&self) -> Arch {
        Arch::from_u32(self.header.arch)
    }

    /// The debug identifier of the cache file.
    pub fn debug_id(&self) -> DebugId {
        self.header.debug_id
    }

    /// The address all lookups are relative to.
    pub fn load_address(&self) -> u64 {
        self.header.range_offset
    }

    /// Returns true if line information is included.
    pub fn has_line_info(&self) -> bool {
        !self.line_blocks.is_empty()
    }

    /// Returns true if file information is included.
    pub fn has_file_info(&self) -> bool {
        !self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build() -> Vec<u8> {
        let object = symbolic_testutils::inline_object();
        let mut converter = SymCacheConverter::new();
        converter.process_object(&object).unwrap();
        let mut buffer = Vec::new();
        converter.serialize(&mut buffer).unwrap();
        buffer
    }

    fn patch_u32(buffer: &mut [u8], offset: usize, value: u32) {
        buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn test_header() {
        let buffer = build();
        let symcache = SymCache::parse(&buffer).unwrap();

        assert_eq!(symcache.version(), SYMCACHE_VERSION);
        assert!(symcache.is_latest());
        assert_eq!(symcache.arch(), Arch::Amd64);
        assert_eq!(symcache.debug_id(), symbolic_testutils::fixture_debug_id());
        assert!(symcache.has_line_info());
        assert!(symcache.has_file_info());
    }

    #[test]
    fn test_rejects_newer_version() {
        let mut buffer = build();
        patch_u32(&mut buffer, 4, SYMCACHE_VERSION + 1);

        let err = SymCache::parse(&buffer).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongVersion);
        assert_eq!(err.coarse_kind(), symbolic_common::ErrorKind::MalformedInput);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut buffer = build();
        patch_u32(&mut buffer, 0, raw::SYMCACHE_MAGIC_FLIPPED);
        let err = SymCache::parse(&buffer).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongEndianness);

        patch_u32(&mut buffer, 0, u32::from_le_bytes(*b"CFIC"));
        let err = SymCache::parse(&buffer).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongFormat);
    }

    #[test]
    fn test_rejects_truncated() {
        let buffer = build();

        let err = SymCache::parse(&buffer[..16]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidHeader);

        let err = SymCache::parse(&buffer[..buffer.len() - 1]).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::UnexpectedStringBytes { .. }
        ));
    }
}
