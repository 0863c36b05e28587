//! Defines the [`SymCacheConverter`].

use std::io::Write;
use std::ops::Range;

use indexmap::IndexSet;
use symbolic_common::{
    write_sleb128, write_uleb128, Arch, DebugId, Language, RangeClaims, StringTable,
};
use symbolic_debuginfo::{DebugSession, Function, ObjectLike, Symbol};
use watto::{Pod, Writer};

use crate::raw::{self, NONE};
use crate::{Error, ErrorKind, Result, ValueKind, SYMCACHE_VERSION};

/// The SymCache Converter.
///
/// This collects functions, line records and symbols from one or more objects into an
/// intermediate representation, which can then be serialized to disk via its
/// [`SymCacheConverter::serialize`] method.
///
/// Input does not need to be sorted or free of overlaps. Overlapping functions are resolved while
/// serializing, see the [crate documentation](crate) for the rules.
#[derive(Debug, Default)]
pub struct SymCacheConverter {
    /// Debug identifier of the object file.
    debug_id: DebugId,
    /// CPU architecture of the object file.
    arch: Arch,

    /// The minimum address of all ranges in the debug file.
    ///
    /// Ranges below it are skipped, as linkers tend to leave the data of removed functions intact
    /// and move them to 0. All addresses are stored relative to it, to reduce the likelihood of
    /// overflowing `u32`.
    load_address: u64,

    /// All strings that have been added to this converter.
    strings: StringTable,
    /// The set of all [`raw::File`]s that have been added to this converter.
    files: IndexSet<raw::File>,
    /// The set of all functions that have been added to this converter.
    functions: IndexSet<FunctionKey>,
    /// Outer functions and symbols, in insertion order.
    outer: Vec<OuterFunction>,
}

/// A function record before its entry address is made relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FunctionKey {
    name_offset: u32,
    comp_dir_offset: u32,
    entry_pc: u64,
    lang: u32,
}

/// A line record with an absolute address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LineRow {
    address: u64,
    line: u32,
    file_idx: u32,
}

/// A function or inlinee with its line table and inlinees, using absolute addresses.
#[derive(Debug)]
struct Scope {
    start: u64,
    end: u64,
    function_idx: u32,
    lines: Vec<LineRow>,
    inlinees: Vec<Scope>,
}

#[derive(Debug)]
struct OuterFunction {
    scope: Scope,
    name: String,
    from_symbol: bool,
}

impl SymCacheConverter {
    /// Creates a new Converter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the CPU architecture of this SymCache.
    pub fn set_arch(&mut self, arch: Arch) {
        self.arch = arch;
    }

    /// Sets the debug identifier of this SymCache.
    pub fn set_debug_id(&mut self, debug_id: DebugId) {
        self.debug_id = debug_id;
    }

    /// Sets the address that all addresses in this SymCache are relative to.
    ///
    /// [`process_object`](Self::process_object) initializes this from the object's load address.
    pub fn set_load_address(&mut self, load_address: u64) {
        self.load_address = load_address;
    }

    /// Insert a string into this converter.
    ///
    /// If the string was already present, it is not added again. The empty string is not stored
    /// and yields `u32::MAX`.
    fn insert_string(&mut self, s: &str) -> Result<u32> {
        self.strings
            .insert(s)
            .map_err(|e| Error::new(ErrorKind::ValueTooLarge(ValueKind::String), e))
    }

    /// Insert a file into this converter.
    ///
    /// If the file was already present, it is not added again. The returned `u32`
    /// is the file's index in insertion order.
    fn insert_file(&mut self, name: &str, directory: &str, comp_dir: &str) -> Result<u32> {
        let file = raw::File {
            comp_dir_offset: self.insert_string(comp_dir)?,
            directory_offset: self.insert_string(directory)?,
            name_offset: self.insert_string(name)?,
        };

        let (file_idx, _) = self.files.insert_full(file);
        u32::try_from(file_idx).map_err(|_| ErrorKind::TooManyValues(ValueKind::File).into())
    }

    /// Insert a function into this converter.
    ///
    /// If the function was already present, it is not added again. The returned `u32`
    /// is the function's index in insertion order.
    fn insert_function(
        &mut self,
        name: &str,
        comp_dir: &str,
        entry_pc: u64,
        lang: Language,
    ) -> Result<u32> {
        let function = FunctionKey {
            name_offset: self.insert_string(name)?,
            comp_dir_offset: self.insert_string(comp_dir)?,
            entry_pc,
            lang: lang as u32,
        };

        let (function_idx, _) = self.functions.insert_full(function);
        u32::try_from(function_idx)
            .map_err(|_| ErrorKind::TooManyValues(ValueKind::Function).into())
    }

    /// This processes the given [`ObjectLike`] object, collecting all its functions, line
    /// information and symbols into the converter.
    ///
    /// This also takes over the architecture, debug identifier and load address of the object.
    #[tracing::instrument(level = "trace", name = "SymCacheConverter::process_object", skip_all)]
    pub fn process_object<'d, 'o, O>(&mut self, object: &'o O) -> Result<()>
    where
        O: ObjectLike<'d, 'o>,
        O::Error: std::error::Error + Send + Sync + 'static,
    {
        self.set_arch(object.arch());
        self.set_debug_id(object.debug_id());
        self.set_load_address(object.load_address());

        let session = object
            .debug_session()
            .map_err(|e| Error::new(ErrorKind::BadDebugFile, e))?;

        tracing::trace_span!("process functions").in_scope(|| {
            for function in session.functions() {
                let function = function.map_err(|e| Error::new(ErrorKind::BadDebugFile, e))?;
                self.process_symbolic_function(&function)?;
            }
            Ok::<_, Error>(())
        })?;

        tracing::trace_span!("process symbols").in_scope(|| {
            for symbol in object.symbol_map() {
                self.process_symbolic_symbol(&symbol)?;
            }
            Ok(())
        })
    }

    /// Adds a single top-level function with all of its line records and inlinees.
    pub fn process_symbolic_function(&mut self, function: &Function<'_>) -> Result<()> {
        if function.size == 0 {
            tracing::trace!(name = function.name.as_str(), "skipping empty function");
            return Ok(());
        }

        let comp_dir = String::from_utf8_lossy(&function.compilation_dir);
        let scope = self.convert_scope(function, &comp_dir)?;

        self.outer.push(OuterFunction {
            scope,
            name: function.name.as_str().to_owned(),
            from_symbol: false,
        });

        Ok(())
    }

    fn convert_scope(&mut self, function: &Function<'_>, comp_dir: &str) -> Result<Scope> {
        let start = function.address;
        let end = function.end_address();

        let function_idx =
            self.insert_function(function.name.as_str(), comp_dir, start, function.name.language())?;

        let mut lines = Vec::with_capacity(function.lines.len());
        for line in &function.lines {
            let file_idx = self.insert_file(&line.file.name_str(), &line.file.dir_str(), comp_dir)?;
            let line_number = u32::try_from(line.line)
                .map_err(|_| Error::from(ErrorKind::ValueTooLarge(ValueKind::Line)))?;

            let row = LineRow {
                address: line.address,
                line: line_number,
                file_idx,
            };
            let row_end = line.size.map(|size| line.address.saturating_add(size));
            lines.push((row, row_end));
        }

        let mut inlinees = Vec::with_capacity(function.inlinees.len());
        for inlinee in &function.inlinees {
            if inlinee.size == 0 || inlinee.address < start || inlinee.end_address() > end {
                tracing::debug!(
                    caller = function.name.as_str(),
                    inlinee = inlinee.name.as_str(),
                    address = %format_args!("{:#x}", inlinee.address),
                    "dropping inlinee outside of its caller"
                );
                continue;
            }
            inlinees.push(self.convert_scope(inlinee, comp_dir)?);
        }
        inlinees.sort_by_key(|inlinee| inlinee.start);

        Ok(Scope {
            start,
            end,
            function_idx,
            lines: normalize_lines(lines, start..end),
            inlinees,
        })
    }

    /// Adds a symbol table entry, which only covers addresses that have no debug information.
    pub fn process_symbolic_symbol(&mut self, symbol: &Symbol<'_>) -> Result<()> {
        let Some(name) = symbol.name() else {
            return Ok(());
        };
        if symbol.size == 0 {
            tracing::trace!(name, "skipping symbol without size");
            return Ok(());
        }

        let start = symbol.address;
        let end = start.saturating_add(symbol.size);
        let function_idx = self.insert_function(name, "", start, Language::Unknown)?;

        self.outer.push(OuterFunction {
            scope: Scope {
                start,
                end,
                function_idx,
                lines: Vec::new(),
                inlinees: Vec::new(),
            },
            name: name.to_owned(),
            from_symbol: true,
        });

        Ok(())
    }

    /// Splits all outer functions into disjoint ranges, each owned by one of them.
    fn resolve_ranges(&self) -> Vec<(Range<u64>, usize)> {
        let mut claims = RangeClaims::new();
        for (index, outer) in self.outer.iter().enumerate() {
            if outer.scope.start < self.load_address {
                tracing::debug!(
                    name = outer.name.as_str(),
                    address = %format_args!("{:#x}", outer.scope.start),
                    "skipping function below the load address"
                );
                continue;
            }
            claims.push(outer.scope.start..outer.scope.end, index);
        }

        claims.resolve_by(|(range_a, a), (range_b, b)| {
            let (a, b) = (&self.outer[*a], &self.outer[*b]);
            a.from_symbol
                .cmp(&b.from_symbol)
                .then_with(|| (range_a.end - range_a.start).cmp(&(range_b.end - range_b.start)))
                .then_with(|| range_a.start.cmp(&range_b.start))
                .then_with(|| a.name.cmp(&b.name))
        })
    }

    /// Serialize the converted data.
    ///
    /// This writes the SymCache binary format into the given [`Write`]. Serializing the same
    /// input twice produces identical bytes.
    #[tracing::instrument(level = "trace", name = "SymCacheConverter::serialize", skip_all)]
    pub fn serialize<W: Write>(self, writer: &mut W) -> Result<()> {
        let resolved = tracing::trace_span!("resolve ranges").in_scope(|| self.resolve_ranges());

        let mut encoder = Encoder::new(self.load_address);
        tracing::trace_span!("encode ranges").in_scope(|| {
            for (range, index) in resolved {
                encoder.push_range(range, &self.outer[index])?;
            }
            Ok::<_, Error>(())
        })?;

        let functions: Vec<raw::Function> = self
            .functions
            .iter()
            .map(|function| raw::Function {
                name_offset: function.name_offset,
                comp_dir_offset: function.comp_dir_offset,
                entry_pc: encoder.offset_addr(function.entry_pc).unwrap_or(NONE),
                lang: function.lang,
            })
            .collect();

        let string_bytes = self.strings.into_bytes();

        let header = raw::Header {
            magic: raw::SYMCACHE_MAGIC,
            version: SYMCACHE_VERSION,

            debug_id: self.debug_id,
            arch: self.arch as u32,

            num_files: count(self.files.len(), ValueKind::File)?,
            num_functions: count(functions.len(), ValueKind::Function)?,
            num_ranges: count(encoder.ranges.len(), ValueKind::Range)?,
            num_inlinees: count(encoder.inlinees.len(), ValueKind::Inlinee)?,
            num_line_blocks: count(encoder.line_blocks.len(), ValueKind::Line)?,
            line_bytes: count(encoder.line_program.len(), ValueKind::Line)?,
            string_bytes: count(string_bytes.len(), ValueKind::String)?,

            range_offset: self.load_address,

            _reserved: [0; 16],
        };

        let mut writer = Writer::new(writer);
        write_sections(
            &mut writer,
            &header,
            &self.files,
            &functions,
            &encoder,
            &string_bytes,
        )
        .map_err(|e| Error::new(ErrorKind::WriteFailed, e))
    }
}

fn count(len: usize, kind: ValueKind) -> Result<u32> {
    u32::try_from(len).map_err(|_| ErrorKind::TooManyValues(kind).into())
}

fn write_sections<W: Write>(
    writer: &mut Writer<W>,
    header: &raw::Header,
    files: &IndexSet<raw::File>,
    functions: &[raw::Function],
    encoder: &Encoder,
    string_bytes: &[u8],
) -> std::io::Result<()> {
    writer.write_all(header.as_bytes())?;
    writer.align_to(8)?;

    for file in files {
        writer.write_all(file.as_bytes())?;
    }
    writer.align_to(8)?;

    writer.write_all(functions.as_bytes())?;
    writer.align_to(8)?;

    writer.write_all(encoder.ranges.as_bytes())?;
    writer.align_to(8)?;

    writer.write_all(encoder.inlinees.as_bytes())?;
    writer.align_to(8)?;

    writer.write_all(encoder.line_blocks.as_bytes())?;
    writer.align_to(8)?;

    writer.write_all(&encoder.line_program)?;
    writer.align_to(8)?;

    writer.write_all(string_bytes)?;

    Ok(())
}

/// Sorts line records, drops those outside of `range`, and fills gaps between sized records with
/// records for line 0.
fn normalize_lines(mut lines: Vec<(LineRow, Option<u64>)>, range: Range<u64>) -> Vec<LineRow> {
    lines.retain(|(row, _)| range.contains(&row.address));
    lines.sort_by_key(|(row, _)| row.address);
    lines.dedup_by_key(|(row, _)| row.address);

    let mut rows: Vec<LineRow> = Vec::with_capacity(lines.len());
    for (index, &(row, row_end)) in lines.iter().enumerate() {
        if rows.last().map_or(true, |last| last.line != row.line || last.file_idx != row.file_idx)
        {
            rows.push(row);
        }

        let next = lines.get(index + 1).map_or(range.end, |(next, _)| next.address);
        if let Some(row_end) = row_end {
            // A zero-sized record has no known end, so it extends to the next one.
            if row_end > row.address && row_end < next {
                rows.push(LineRow {
                    address: row_end,
                    line: 0,
                    file_idx: NONE,
                });
            }
        }
    }

    rows
}

/// Returns the line records covering `range`, with the first record moved to its start.
fn clip_lines(rows: &[LineRow], range: &Range<u64>) -> Vec<LineRow> {
    let first_inside = rows.partition_point(|row| row.address <= range.start);

    let mut clipped = Vec::new();
    if let Some(previous) = first_inside.checked_sub(1).and_then(|index| rows.get(index)) {
        clipped.push(LineRow {
            address: range.start,
            ..*previous
        });
    }
    clipped.extend(
        rows[first_inside..]
            .iter()
            .take_while(|row| row.address < range.end)
            .copied(),
    );

    clipped
}

/// Lays out ranges, inlinees and line tables in their final order.
struct Encoder {
    range_offset: u64,
    ranges: Vec<raw::Range>,
    inlinees: Vec<raw::Inlinee>,
    line_blocks: Vec<raw::LineBlock>,
    line_program: Vec<u8>,
}

impl Encoder {
    fn new(range_offset: u64) -> Self {
        Self {
            range_offset,
            ranges: Vec::new(),
            inlinees: Vec::new(),
            line_blocks: Vec::new(),
            line_program: Vec::new(),
        }
    }

    /// Compresses the given `addr` into 32 bits relative to the range offset, rejecting any
    /// address below the offset or exceeding 32 bits.
    fn offset_addr(&self, addr: u64) -> Result<u32> {
        addr.checked_sub(self.range_offset)
            .and_then(|r| u32::try_from(r).ok())
            .ok_or_else(|| ErrorKind::ValueTooLarge(ValueKind::Address).into())
    }

    fn push_range(&mut self, range: Range<u64>, outer: &OuterFunction) -> Result<()> {
        let start = self.offset_addr(range.start)?;
        let end = self.offset_addr(range.end)?;

        let (first_line_block, num_line_blocks) = self.push_lines(&outer.scope.lines, &range)?;

        let first_inlinee = count(self.inlinees.len(), ValueKind::Inlinee)?;
        for inlinee in &outer.scope.inlinees {
            self.push_inlinee(inlinee, &range, NONE, 1)?;
        }
        let num_inlinees = count(self.inlinees.len(), ValueKind::Inlinee)? - first_inlinee;

        self.ranges.push(raw::Range {
            start,
            end,
            function_idx: outer.scope.function_idx,
            flags: if outer.from_symbol {
                raw::RANGE_FROM_SYMBOL
            } else {
                0
            },
            first_line_block,
            num_line_blocks,
            first_inlinee,
            num_inlinees,
        });

        Ok(())
    }

    fn push_inlinee(
        &mut self,
        scope: &Scope,
        clip: &Range<u64>,
        parent_idx: u32,
        depth: u32,
    ) -> Result<()> {
        let range = scope.start.max(clip.start)..scope.end.min(clip.end);
        if range.is_empty() {
            return Ok(());
        }

        let index = count(self.inlinees.len(), ValueKind::Inlinee)?;
        let start = self.offset_addr(range.start)?;
        let end = self.offset_addr(range.end)?;
        let (first_line_block, num_line_blocks) = self.push_lines(&scope.lines, &range)?;

        self.inlinees.push(raw::Inlinee {
            start,
            end,
            function_idx: scope.function_idx,
            parent_idx,
            depth,
            first_line_block,
            num_line_blocks,
            _padding: 0,
        });

        for child in &scope.inlinees {
            self.push_inlinee(child, &range, index, depth + 1)?;
        }

        Ok(())
    }

    /// Writes the line records covering `range` and returns the index and number of blocks.
    fn push_lines(&mut self, rows: &[LineRow], range: &Range<u64>) -> Result<(u32, u32)> {
        let first_block = count(self.line_blocks.len(), ValueKind::Line)?;

        for block in clip_lines(rows, range).chunks(raw::LINE_BLOCK_SIZE) {
            let Some((head, rest)) = block.split_first() else {
                continue;
            };

            let program_offset = count(self.line_program.len(), ValueKind::Line)?;
            let mut previous = head;
            for row in rest {
                write_uleb128(&mut self.line_program, row.address - previous.address);
                write_sleb128(
                    &mut self.line_program,
                    i64::from(row.line) - i64::from(previous.line),
                );
                let file = match row.file_idx {
                    NONE => 0,
                    file_idx => u64::from(file_idx) + 1,
                };
                write_uleb128(&mut self.line_program, file);
                previous = row;
            }

            self.line_blocks.push(raw::LineBlock {
                address: self.offset_addr(head.address)?,
                line: head.line,
                file_idx: head.file_idx,
                program_offset,
                len: block.len() as u32,
            });
        }

        let num_blocks = count(self.line_blocks.len(), ValueKind::Line)? - first_block;
        Ok((first_block, num_blocks))
    }
}
