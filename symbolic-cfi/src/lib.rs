//! Handling of Call Frame Information (stack frame info).
//!
//! The root type exposed by this crate is [`CfiCache`], which extracts the unwind information of
//! an object file into a compact binary table that the stack walker can query by address.
//!
//! # Background
//!
//! Call Frame Information (CFI) is used by the stack walker to improve the quality of stack
//! traces. When an executable was compiled with frame pointer omission, the call stack does not
//! contain sufficient information to resolve frames on its own. CFI contains programs that can
//! calculate the base address of a frame based on register values of the current frame.
//!
//! Without CFI, the stack walker needs to scan the stack memory for values that look like valid
//! return addresses. This frequently yields false-positives.
//!
//! # Structure of a CfiCache
//!
//! A CfiCache starts with a header carrying the magic, version, architecture and load address of
//! the object. It is followed by these sections, each aligned to 8 bytes:
//!
//! 1. Entries: disjoint code ranges sorted by address, relative to the load address.
//! 2. Rule programs: LEB128 encoded references to the rules in effect at the start of an entry,
//!    followed by the rules that change at later addresses.
//! 3. String data: deduplicated rules in Breakpad's postfix notation, such as
//!    `.cfa: $rsp 8 + .ra: .cfa -8 + ^`.
//!
//! An object may contain several kinds of unwind information for the same code, for instance
//! both compact unwind info and DWARF CFI. When building the cache, the table covering the
//! smaller range always wins. Tables with identical sizes are ranked by
//! [`UnwindSource::priority`]: compact unwind info, then `.debug_frame`, then `.eh_frame`, then
//! the Windows formats, then Breakpad records.
//!
//! ```
//! use symbolic_cfi::CfiCache;
//! use symbolic_unwind::Register;
//!
//! let object = symbolic_testutils::unwind_object();
//! let cache = CfiCache::from_object(&object).unwrap();
//!
//! let rules = cache.lookup::<u64>(0x1000).unwrap();
//! assert_eq!(rules[0].0, Register::cfa());
//! assert_eq!(cache.program_at(0x1000).unwrap(), ".cfa: $rsp 8 + .ra: .cfa -8 + ^");
//! ```

#![warn(missing_docs)]

mod error;
mod raw;
mod rules;
mod writer;

use std::borrow::Cow;
use std::fmt;
use std::io::{self, Write};

use symbolic_common::{read_string, Arch, VarintReader};
use symbolic_debuginfo::{ObjectLike, UnwindSource};
use symbolic_unwind::parsing::rules_complete;
use symbolic_unwind::{RegisterValue, Rule};
use watto::{align_to, Pod};

pub use error::{CfiError, CfiErrorKind};
pub use raw::CFICACHE_MAGIC;

use rules::RuleSet;
use writer::CfiConverter;

/// The latest version of the file format.
pub const CFICACHE_LATEST_VERSION: u32 = 3;

// Version history:
//
// 1: Initial ASCII-only implementation
// 2: Implementation with a versioned preamble
// 3: Binary entry table with deduplicated rule strings
//
// Only the latest version is read. Older and newer files are rejected.

/// Maps an unwind source to the tag stored in [`raw::Entry::source`].
pub(crate) fn source_tag(source: UnwindSource) -> u32 {
    match source {
        UnwindSource::CompactUnwind => 0,
        UnwindSource::DebugFrame => 1,
        UnwindSource::EhFrame => 2,
        UnwindSource::PdbFrameData => 3,
        UnwindSource::PeUnwind => 4,
        UnwindSource::Breakpad => 5,
    }
}

fn source_from_tag(tag: u32) -> Option<UnwindSource> {
    Some(match tag {
        0 => UnwindSource::CompactUnwind,
        1 => UnwindSource::DebugFrame,
        2 => UnwindSource::EhFrame,
        3 => UnwindSource::PdbFrameData,
        4 => UnwindSource::PeUnwind,
        5 => UnwindSource::Breakpad,
        _ => return None,
    })
}

/// The parsed sections of a cache buffer.
struct Sections<'data> {
    header: &'data raw::Header,
    entries: &'data [raw::Entry],
    programs: &'data [u8],
    string_bytes: &'data [u8],
}

impl<'data> Sections<'data> {
    fn parse(buf: &'data [u8]) -> Result<Self, CfiError> {
        let (header, rest) = raw::Header::ref_from_prefix(buf).ok_or_else(|| {
            CfiError::new(CfiErrorKind::InvalidData, "cfi cache header truncated")
        })?;

        if header.magic == raw::CFICACHE_MAGIC_FLIPPED {
            return Err(CfiErrorKind::WrongEndianness.into());
        }
        if header.magic != raw::CFICACHE_MAGIC {
            return Err(CfiErrorKind::BadFileMagic.into());
        }
        if header.version != CFICACHE_LATEST_VERSION {
            return Err(CfiError::new(
                CfiErrorKind::UnsupportedVersion,
                format!("cfi cache version {}", header.version),
            ));
        }

        let (_, rest) = align_to(rest, 8).ok_or(CfiErrorKind::InvalidData)?;
        let (entries, rest) = raw::Entry::slice_from_prefix(rest, header.num_entries as usize)
            .ok_or_else(|| CfiError::new(CfiErrorKind::InvalidData, "entries truncated"))?;

        let (_, rest) = align_to(rest, 8).ok_or(CfiErrorKind::InvalidData)?;
        let program_len = header.program_bytes as usize;
        if rest.len() < program_len {
            return Err(CfiError::new(CfiErrorKind::InvalidData, "programs truncated"));
        }
        let (programs, rest) = rest.split_at(program_len);

        let (_, rest) = align_to(rest, 8).ok_or(CfiErrorKind::InvalidData)?;
        if rest.len() < header.string_bytes as usize {
            return Err(CfiError::new(CfiErrorKind::InvalidData, "strings truncated"));
        }

        Ok(Sections {
            header,
            entries,
            programs,
            string_bytes: rest,
        })
    }

    fn entry(&self, raw: &raw::Entry) -> Option<CfiEntry<'data>> {
        let load_address = self.header.load_address;
        let mut reader = VarintReader::new(self.programs.get(raw.program_offset as usize..)?);

        let init = read_string(self.string_bytes, u32::try_from(reader.read_uleb128()?).ok()?)?;
        let num_deltas = reader.read_uleb128()?;

        let mut address = load_address.saturating_add(u64::from(raw.start));
        let mut deltas = Vec::new();
        for _ in 0..num_deltas {
            address = address.checked_add(reader.read_uleb128()?)?;
            let offset = u32::try_from(reader.read_uleb128()?).ok()?;
            deltas.push((address, read_string(self.string_bytes, offset)?));
        }

        Some(CfiEntry {
            start: load_address.saturating_add(u64::from(raw.start)),
            end: load_address.saturating_add(u64::from(raw.end)),
            source: source_from_tag(raw.source)?,
            init,
            deltas,
        })
    }
}

/// The unwind rules of one contiguous code range in a [`CfiCache`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CfiEntry<'data> {
    start: u64,
    end: u64,
    source: UnwindSource,
    init: &'data str,
    deltas: Vec<(u64, &'data str)>,
}

impl<'data> CfiEntry<'data> {
    /// The absolute start address of this range.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// The absolute end address of this range, exclusive.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// The kind of unwind information these rules were taken from.
    pub fn source(&self) -> UnwindSource {
        self.source
    }

    /// The rules in effect at the start of the range.
    pub fn init_rules(&self) -> &'data str {
        self.init
    }

    /// Rules that change at later addresses within the range.
    pub fn delta_rules(&self) -> &[(u64, &'data str)] {
        &self.deltas
    }

    /// Returns all rules in effect at `address`.
    fn rules_at(&self, address: u64) -> RuleSet {
        let mut rules = RuleSet::parse(self.init);
        for (_, delta) in self.deltas.iter().take_while(|(start, _)| *start <= address) {
            rules.apply(delta);
        }
        rules
    }
}

/// Formats the entry as Breakpad `STACK CFI` records.
impl fmt::Display for CfiEntry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "STACK CFI INIT {:x} {:x} {}",
            self.start,
            self.end - self.start,
            self.init
        )?;
        for (address, rules) in &self.deltas {
            write!(f, "\nSTACK CFI {address:x} {rules}")?;
        }
        Ok(())
    }
}

/// An iterator over all entries of a [`CfiCache`].
pub struct CfiEntries<'a> {
    sections: Option<Sections<'a>>,
    index: usize,
}

impl<'a> Iterator for CfiEntries<'a> {
    type Item = CfiEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let sections = self.sections.as_ref()?;
        while let Some(raw) = sections.entries.get(self.index) {
            self.index += 1;
            match sections.entry(raw) {
                Some(entry) => return Some(entry),
                None => tracing::warn!(index = self.index - 1, "skipping corrupt cfi entry"),
            }
        }
        None
    }
}

/// A cache file for call frame information (CFI).
///
/// The default way to use this cache is to construct it from an `Object` and save it to a file.
/// Then, load it from the file and pass it to the stack walker.
///
/// ```
/// use symbolic_cfi::CfiCache;
///
/// let object = symbolic_testutils::unwind_object();
/// let cache = CfiCache::from_object(&object).unwrap();
///
/// let mut buffer = Vec::new();
/// cache.write_to(&mut buffer).unwrap();
///
/// let loaded = CfiCache::from_bytes(&buffer).unwrap();
/// assert!(loaded.is_latest());
/// assert_eq!(loaded.as_slice(), cache.as_slice());
/// ```
#[derive(Clone)]
pub struct CfiCache<'a> {
    data: Cow<'a, [u8]>,
}

impl CfiCache<'static> {
    /// Construct a CFI cache from an `Object`.
    ///
    /// Fails if the object carries no unwind information, if its architecture has no known
    /// register names, or if an unwind table cannot be represented.
    pub fn from_object<'d, 'o, O>(object: &'o O) -> Result<Self, CfiError>
    where
        O: ObjectLike<'d, 'o>,
        O::Error: std::error::Error + Send + Sync + 'static,
    {
        let mut converter = CfiConverter::new(object.arch(), object.load_address())?;
        converter.process_object(object)?;

        let mut buffer = Vec::new();
        converter.serialize(&mut buffer)?;
        Ok(CfiCache {
            data: Cow::Owned(buffer),
        })
    }

    /// Load a CFI cache from an owned buffer.
    pub fn from_vec(buffer: Vec<u8>) -> Result<Self, CfiError> {
        Sections::parse(&buffer)?;
        Ok(CfiCache {
            data: Cow::Owned(buffer),
        })
    }
}

impl<'a> CfiCache<'a> {
    /// Load a CFI cache from a borrowed buffer.
    ///
    /// Only the latest version is accepted. Files written by other versions are rejected
    /// entirely, never partially parsed.
    pub fn from_bytes(buffer: &'a [u8]) -> Result<Self, CfiError> {
        Sections::parse(buffer)?;
        Ok(CfiCache {
            data: Cow::Borrowed(buffer),
        })
    }

    /// Converts this cache into one that owns its buffer.
    pub fn into_owned(self) -> CfiCache<'static> {
        CfiCache {
            data: Cow::Owned(self.data.into_owned()),
        }
    }

    fn sections(&self) -> Option<Sections<'_>> {
        Sections::parse(&self.data).ok()
    }

    fn header(&self) -> Option<&raw::Header> {
        raw::Header::ref_from_prefix(&self.data).map(|(header, _)| header)
    }

    /// Returns the cache file format version.
    pub fn version(&self) -> u32 {
        self.header().map_or(0, |header| header.version)
    }

    /// Returns whether this cache is up-to-date.
    pub fn is_latest(&self) -> bool {
        self.version() == CFICACHE_LATEST_VERSION
    }

    /// The architecture of the object this cache was built from.
    pub fn arch(&self) -> Arch {
        self.header()
            .map_or(Arch::Unknown, |header| Arch::from_u32(header.arch))
    }

    /// The address all lookups are relative to.
    pub fn load_address(&self) -> u64 {
        self.header().map_or(0, |header| header.load_address)
    }

    /// Returns the raw buffer of the cache file.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Writes the cache to the given writer.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<(), io::Error> {
        writer.write_all(&self.data)
    }

    /// Returns an iterator over all entries, sorted by address.
    pub fn entries(&self) -> CfiEntries<'_> {
        CfiEntries {
            sections: self.sections(),
            index: 0,
        }
    }

    /// Returns the entry covering `address`.
    pub fn entry(&self, address: u64) -> Option<CfiEntry<'_>> {
        let sections = self.sections()?;
        let relative = u32::try_from(address.checked_sub(sections.header.load_address)?).ok()?;

        let index = sections
            .entries
            .partition_point(|entry| entry.start <= relative)
            .checked_sub(1)?;
        let raw = sections.entries.get(index)?;
        if relative >= raw.end {
            return None;
        }

        sections.entry(raw)
    }

    /// Returns the postfix program of all rules in effect at `address`.
    pub fn program_at(&self, address: u64) -> Option<String> {
        Some(self.entry(address)?.rules_at(address).to_string())
    }

    /// Returns all rules in effect at `address`.
    ///
    /// Returns `None` if no unwind information covers the address.
    pub fn lookup<A: RegisterValue>(&self, address: u64) -> Option<Vec<Rule<A>>> {
        let program = self.program_at(address)?;
        match rules_complete::<A>(&program) {
            Ok(rules) => Some(rules),
            Err(error) => {
                tracing::warn!(
                    address = %format_args!("{address:#x}"),
                    error = %error,
                    "invalid cfi program"
                );
                None
            }
        }
    }
}

impl fmt::Debug for CfiCache<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CfiCache")
            .field("version", &self.version())
            .field("arch", &self.arch())
            .field("load_address", &format_args!("{:#x}", self.load_address()))
            .field("size", &self.data.len())
            .finish()
    }
}
