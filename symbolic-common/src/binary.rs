//! Encoding primitives shared by the binary cache formats.
//!
//! Both the SymCache and the CfiCache store their variable-sized data as LEB128 encoded
//! integers and reference strings through a deduplicated, length-prefixed string table. Both
//! also need to turn a set of possibly overlapping address ranges into a set of disjoint ones,
//! which is what [`RangeClaims`] does.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

/// The string offset used for absent strings.
pub const NO_STRING: u32 = u32::MAX;

/// An error returned when a string table outgrows its 32-bit offsets.
#[derive(Debug, thiserror::Error)]
#[error("string table exceeds 4GiB")]
pub struct StringTableFull;

/// A deduplicating table of LEB128 length-prefixed UTF-8 strings.
///
/// Strings are referenced by their byte offset into the table. Inserting the same string twice
/// yields the same offset. The empty string is never stored and maps to [`NO_STRING`].
#[derive(Debug, Default)]
pub struct StringTable {
    bytes: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl StringTable {
    /// Creates an empty string table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a string and returns its offset.
    pub fn insert(&mut self, s: &str) -> Result<u32, StringTableFull> {
        if s.is_empty() {
            return Ok(NO_STRING);
        }
        if let Some(&offset) = self.offsets.get(s) {
            return Ok(offset);
        }

        let offset = u32::try_from(self.bytes.len())
            .ok()
            .filter(|&offset| offset != NO_STRING)
            .ok_or(StringTableFull)?;

        write_uleb128(&mut self.bytes, s.len() as u64);
        self.bytes.extend_from_slice(s.as_bytes());
        self.offsets.insert(s.to_owned(), offset);

        Ok(offset)
    }

    /// Returns the number of bytes currently used.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if no strings were inserted.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Consumes the table and returns the serialized bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Reads a string written by [`StringTable`] at the given offset.
///
/// Returns `None` for [`NO_STRING`], out of bounds offsets, and invalid UTF-8.
pub fn read_string(bytes: &[u8], offset: u32) -> Option<&str> {
    if offset == NO_STRING {
        return None;
    }

    let reader = &mut bytes.get(offset as usize..)?;
    let len = leb128::read::unsigned(reader).ok()? as usize;
    let string = reader.get(..len)?;
    std::str::from_utf8(string).ok()
}

/// Appends an unsigned LEB128 value.
pub fn write_uleb128(out: &mut Vec<u8>, value: u64) {
    // Writing into a `Vec` is infallible.
    let _ = leb128::write::unsigned(out, value);
}

/// Appends a signed LEB128 value.
pub fn write_sleb128(out: &mut Vec<u8>, value: i64) {
    let _ = leb128::write::signed(out, value);
}

/// A forward-only reader over LEB128 encoded data.
///
/// All reads return `None` once the data is exhausted or malformed, which callers treat as a
/// corrupted cache.
#[derive(Clone, Debug)]
pub struct VarintReader<'data> {
    data: &'data [u8],
}

impl<'data> VarintReader<'data> {
    /// Creates a reader at the start of `data`.
    pub fn new(data: &'data [u8]) -> Self {
        Self { data }
    }

    /// Reads an unsigned LEB128 value.
    pub fn read_uleb128(&mut self) -> Option<u64> {
        leb128::read::unsigned(&mut self.data).ok()
    }

    /// Reads a signed LEB128 value.
    pub fn read_sleb128(&mut self) -> Option<i64> {
        leb128::read::signed(&mut self.data).ok()
    }

    /// Reads an unsigned LEB128 value that must fit into a `u32`.
    pub fn read_u32(&mut self) -> Option<u32> {
        self.read_uleb128().and_then(|v| u32::try_from(v).ok())
    }

    /// Reads a single raw byte.
    pub fn read_u8(&mut self) -> Option<u8> {
        let (&byte, rest) = self.data.split_first()?;
        self.data = rest;
        Some(byte)
    }

    /// Returns the bytes not consumed yet.
    pub fn remaining(&self) -> &'data [u8] {
        self.data
    }

    /// Returns `true` if all data has been consumed.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Resolves overlapping address range claims into disjoint ranges.
///
/// Every claim covers a half-open address range. Claims are processed in priority order, and
/// each claim receives the parts of its range that no higher-priority claim has taken yet. A
/// claim that loses part of its range is therefore split into the remaining fragments.
///
/// ```
/// use symbolic_common::RangeClaims;
///
/// let mut claims = RangeClaims::new();
/// claims.push(0x1000..0x1050, "outer");
/// claims.push(0x1010..0x1020, "inner");
///
/// // smaller ranges win
/// let resolved = claims.resolve_by(|a, b| (a.0.end - a.0.start).cmp(&(b.0.end - b.0.start)));
/// assert_eq!(resolved, vec![
///     (0x1000..0x1010, "outer"),
///     (0x1010..0x1020, "inner"),
///     (0x1020..0x1050, "outer"),
/// ]);
/// ```
#[derive(Clone, Debug)]
pub struct RangeClaims<T> {
    claims: Vec<(Range<u64>, T)>,
}

impl<T> Default for RangeClaims<T> {
    fn default() -> Self {
        Self { claims: Vec::new() }
    }
}

impl<T: Clone> RangeClaims<T> {
    /// Creates an empty set of claims.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a claim. Empty ranges are ignored.
    pub fn push(&mut self, range: Range<u64>, value: T) {
        if range.start < range.end {
            self.claims.push((range, value));
        }
    }

    /// Returns the number of claims.
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    /// Returns `true` if there are no claims.
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Resolves all claims into disjoint ranges sorted by start address.
    ///
    /// `priority` orders claims so that the winning claim compares as `Less`. Claims that compare
    /// equal keep their insertion order, so the result only depends on the claims and the
    /// priority function.
    pub fn resolve_by<F>(mut self, mut priority: F) -> Vec<(Range<u64>, T)>
    where
        F: FnMut(&(Range<u64>, T), &(Range<u64>, T)) -> Ordering,
    {
        self.claims.sort_by(|a, b| priority(a, b));

        // start -> (end, claim index)
        let mut taken: BTreeMap<u64, (u64, usize)> = BTreeMap::new();

        for (index, (range, _)) in self.claims.iter().enumerate() {
            let mut cursor = range.start;
            if let Some((_, &(prev_end, _))) = taken.range(..range.start).next_back() {
                cursor = cursor.max(prev_end);
            }

            let overlapping: Vec<(u64, u64)> = taken
                .range(range.start..range.end)
                .map(|(&start, &(end, _))| (start, end))
                .collect();

            let mut free = Vec::new();
            for (start, end) in overlapping {
                if start > cursor {
                    free.push(cursor..start);
                }
                cursor = cursor.max(end);
            }
            if cursor < range.end {
                free.push(cursor..range.end);
            }

            for piece in free {
                taken.insert(piece.start, (piece.end, index));
            }
        }

        taken
            .into_iter()
            .map(|(start, (end, index))| (start..end, self.claims[index].1.clone()))
            .collect()
    }
}
