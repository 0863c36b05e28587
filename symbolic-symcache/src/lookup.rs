use std::fmt;

use symbolic_common::{Language, Name, VarintReader};

use super::raw::{self, NONE};
use super::SymCache;

impl<'data> SymCache<'data> {
    /// Looks up an instruction address in the SymCache, yielding an iterator of [`SourceLocation`]s
    /// representing a hierarchy of inlined function calls.
    ///
    /// The innermost inlined function comes first and the outer function last. The iterator is
    /// empty if no function covers the address.
    pub fn lookup(&self, addr: u64) -> SourceLocations<'data, '_> {
        let mut locations = SourceLocations {
            cache: self,
            frames: Vec::new(),
            next: 0,
        };

        let Some(addr) = addr
            .checked_sub(self.header.range_offset)
            .and_then(|addr| u32::try_from(addr).ok())
        else {
            return locations;
        };

        let range_idx = match self.ranges.binary_search_by_key(&addr, |r| r.start) {
            Ok(idx) => idx,
            Err(0) => return locations,
            Err(idx) => idx - 1,
        };
        let Some(range) = self.ranges.get(range_idx).filter(|r| addr < r.end) else {
            return locations;
        };

        let first_inlinee = range.first_inlinee as usize;
        let inlinees = self
            .inlinees
            .get(first_inlinee..first_inlinee.saturating_add(range.num_inlinees as usize))
            .unwrap_or_default();

        // sibling inlinees may overlap, so a later sibling can start before an earlier child
        let mut innermost: Option<(usize, &raw::Inlinee)> = None;
        for (offset, inlinee) in inlinees.iter().enumerate() {
            if !(inlinee.start..inlinee.end).contains(&addr) {
                continue;
            }
            if innermost.map_or(true, |(_, i)| i.depth < inlinee.depth) {
                innermost = Some((first_inlinee + offset, inlinee));
            }
        }

        let mut current = innermost;
        while let Some((idx, inlinee)) = current {
            locations.frames.push(self.make_location(
                addr,
                inlinee.function_idx,
                inlinee.depth,
                inlinee.start,
                inlinee.first_line_block,
                inlinee.num_line_blocks,
            ));

            // parents precede their children, anything else is corrupt
            current = match inlinee.parent_idx as usize {
                parent if parent < idx => self.inlinees.get(parent).map(|p| (parent, p)),
                _ => None,
            };
        }

        locations.frames.push(self.make_location(
            addr,
            range.function_idx,
            0,
            range.start,
            range.first_line_block,
            range.num_line_blocks,
        ));

        locations
    }

    fn make_location(
        &self,
        addr: u32,
        function_idx: u32,
        inline_depth: u32,
        scope_start: u32,
        first_line_block: u32,
        num_line_blocks: u32,
    ) -> Location {
        let first = first_line_block as usize;
        let blocks = self
            .line_blocks
            .get(first..first.saturating_add(num_line_blocks as usize))
            .unwrap_or_default();

        let record = self.find_line(blocks, addr);
        Location {
            function_idx,
            inline_depth,
            scope_start,
            line: record.map_or(0, |r| r.line),
            file_idx: record.map_or(NONE, |r| r.file_idx),
            line_address: record.map_or(scope_start, |r| r.address),
        }
    }

    /// Finds the last line record at or before `addr`.
    ///
    /// A corrupted line program ends the search at the last record that could be decoded.
    fn find_line(&self, blocks: &[raw::LineBlock], addr: u32) -> Option<LineRecord> {
        let block_idx = match blocks.binary_search_by_key(&addr, |b| b.address) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let block = blocks.get(block_idx)?;

        let mut record = LineRecord {
            address: block.address,
            line: block.line,
            file_idx: block.file_idx,
        };

        let program = self
            .line_program
            .get(block.program_offset as usize..)
            .unwrap_or_default();
        let mut reader = VarintReader::new(program);

        for _ in 1..block.len {
            match record.decode_next(&mut reader) {
                Some(next) if next.address <= addr => record = next,
                _ => break,
            }
        }

        Some(record)
    }

    pub(crate) fn get_file(&self, file_idx: u32) -> Option<File<'data>> {
        let raw_file = self.files.get(file_idx as usize)?;
        Some(File {
            comp_dir: self.get_string(raw_file.comp_dir_offset),
            directory: self.get_string(raw_file.directory_offset),
            name: self.get_string(raw_file.name_offset).unwrap_or_default(),
        })
    }

    pub(crate) fn get_function(&self, function_idx: u32) -> Option<Function<'data>> {
        let raw_function = self.functions.get(function_idx as usize)?;
        Some(Function {
            name: self.get_string(raw_function.name_offset).unwrap_or("?"),
            entry_pc: raw_function.entry_pc,
            language: Language::from_u32(raw_function.lang),
        })
    }

    /// An iterator over the functions in this SymCache.
    ///
    /// Only functions with a valid entry pc, i.e., one not equal to `u32::MAX`,
    /// will be returned.
    /// Note that functions are *not* returned ordered by name or entry pc,
    /// but in insertion order.
    pub fn functions(&self) -> Functions<'data> {
        Functions {
            cache: self.clone(),
            function_idx: 0,
        }
    }

    /// An iterator over the files in this SymCache.
    ///
    /// Note that files are *not* returned ordered by name or full path,
    /// but in insertion order.
    pub fn files(&self) -> Files<'data> {
        Files {
            cache: self.clone(),
            file_idx: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LineRecord {
    address: u32,
    line: u32,
    file_idx: u32,
}

impl LineRecord {
    fn decode_next(&self, reader: &mut VarintReader<'_>) -> Option<Self> {
        let address_delta = u32::try_from(reader.read_uleb128()?).ok()?;
        let line = i64::from(self.line).checked_add(reader.read_sleb128()?)?;
        let file_idx = match reader.read_uleb128()? {
            0 => NONE,
            file => u32::try_from(file - 1).ok()?,
        };

        Some(LineRecord {
            address: self.address.checked_add(address_delta)?,
            line: u32::try_from(line).ok()?,
            file_idx,
        })
    }
}

/// A resolved level of an inlining hierarchy, relative to the cache's range offset.
#[derive(Debug, Clone, Copy)]
struct Location {
    function_idx: u32,
    inline_depth: u32,
    scope_start: u32,
    line: u32,
    file_idx: u32,
    line_address: u32,
}

/// A source File included in the SymCache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File<'data> {
    /// The optional compilation directory prefix.
    comp_dir: Option<&'data str>,
    /// The optional directory prefix.
    directory: Option<&'data str>,
    /// The file path.
    name: &'data str,
}

impl<'data> File<'data> {
    /// Returns this file's name.
    pub fn name(&self) -> &'data str {
        self.name
    }

    /// Returns this file's directory, if any.
    pub fn directory(&self) -> Option<&'data str> {
        self.directory
    }

    /// Returns the compilation directory of this file, if any.
    pub fn comp_dir(&self) -> Option<&'data str> {
        self.comp_dir
    }

    /// Returns this file's full path.
    pub fn full_path(&self) -> String {
        let comp_dir = self.comp_dir.unwrap_or_default();
        let directory = self.directory.unwrap_or_default();

        let prefix = symbolic_common::join_path(comp_dir, directory);
        symbolic_common::join_path(&prefix, self.name)
    }
}

/// A Function definition as included in the SymCache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function<'data> {
    name: &'data str,
    entry_pc: u32,
    language: Language,
}

impl<'data> Function<'data> {
    /// The possibly mangled name/symbol of this function.
    pub fn name(&self) -> &'data str {
        self.name
    }

    /// The name of this function tagged with its language.
    pub fn name_with_language(&self) -> Name<'data> {
        Name::with_language(self.name, self.language)
    }

    /// The entry pc of the function, relative to the load address.
    pub fn entry_pc(&self) -> u32 {
        self.entry_pc
    }

    /// The language the function is written in.
    pub fn language(&self) -> Language {
        self.language
    }
}

impl Default for Function<'_> {
    fn default() -> Self {
        Self {
            name: "?",
            entry_pc: u32::MAX,
            language: Language::Unknown,
        }
    }
}

/// A source location as included in the SymCache.
///
/// A `SourceLocation` represents source information about a particular instruction.
/// It always has a [`Function`] associated with it and may also have a [`File`] and a line number.
#[derive(Debug, Clone)]
pub struct SourceLocation<'data, 'cache> {
    cache: &'cache SymCache<'data>,
    location: Location,
}

impl<'data> SourceLocation<'data, '_> {
    /// The source line corresponding to the instruction.
    ///
    /// 0 denotes an unknown line number.
    pub fn line(&self) -> u32 {
        self.location.line
    }

    /// The source file corresponding to the instruction.
    pub fn file(&self) -> Option<File<'data>> {
        self.cache.get_file(self.location.file_idx)
    }

    /// The function corresponding to the instruction.
    pub fn function(&self) -> Function<'data> {
        self.cache
            .get_function(self.location.function_idx)
            .unwrap_or_default()
    }

    /// The nesting level of this location, `0` for the outer function.
    pub fn inline_depth(&self) -> u32 {
        self.location.inline_depth
    }

    /// The absolute address at which the function starts.
    pub fn symbol_address(&self) -> u64 {
        let entry_pc = match self.function().entry_pc {
            NONE => self.location.scope_start,
            entry_pc => entry_pc,
        };
        self.cache.header.range_offset + u64::from(entry_pc)
    }

    /// The absolute address at which the line record containing the instruction starts.
    pub fn line_address(&self) -> u64 {
        self.cache.header.range_offset + u64::from(self.location.line_address)
    }
}

/// An Iterator that yields [`SourceLocation`]s, representing an inlining hierarchy.
#[derive(Debug, Clone)]
pub struct SourceLocations<'data, 'cache> {
    cache: &'cache SymCache<'data>,
    /// Innermost first.
    frames: Vec<Location>,
    next: usize,
}

impl<'data, 'cache> Iterator for SourceLocations<'data, 'cache> {
    type Item = SourceLocation<'data, 'cache>;

    fn next(&mut self) -> Option<Self::Item> {
        let location = *self.frames.get(self.next)?;
        self.next += 1;
        Some(SourceLocation {
            cache: self.cache,
            location,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.frames.len() - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for SourceLocations<'_, '_> {}

/// Iterator returned by [`SymCache::functions`]; see documentation there.
#[derive(Debug, Clone)]
pub struct Functions<'data> {
    cache: SymCache<'data>,
    function_idx: u32,
}

impl<'data> Iterator for Functions<'data> {
    type Item = Function<'data>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let function = self.cache.get_function(self.function_idx)?;
            self.function_idx += 1;
            if function.entry_pc != NONE {
                return Some(function);
            }
        }
    }
}

/// Iterator returned by [`SymCache::files`]; see documentation there.
#[derive(Debug, Clone)]
pub struct Files<'data> {
    cache: SymCache<'data>,
    file_idx: u32,
}

impl<'data> Iterator for Files<'data> {
    type Item = File<'data>;

    fn next(&mut self) -> Option<Self::Item> {
        let file = self.cache.get_file(self.file_idx)?;
        self.file_idx += 1;
        Some(file)
    }
}

/// A helper struct for printing the functions contained in a symcache.
///
/// This struct's `Debug` impl prints the entry pcs and names of the
/// functions returned by [`SymCache::functions`], sorted first by entry pc
/// and then by name.
pub struct FunctionsDebug<'a>(pub &'a SymCache<'a>);

impl fmt::Debug for FunctionsDebug<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut vec: Vec<_> = self.0.functions().collect();
        vec.sort_by_key(|f| (f.entry_pc, f.name));

        for function in vec {
            writeln!(f, "{:>16x} {}", function.entry_pc, function.name)?;
        }

        Ok(())
    }
}

/// A helper struct for printing the files contained in a symcache.
///
/// This struct's `Debug` impl prints the full paths of the files returned by
/// [`SymCache::files`] in sorted order.
pub struct FilesDebug<'a>(pub &'a SymCache<'a>);

impl fmt::Debug for FilesDebug<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut vec: Vec<_> = self.0.files().map(|file| file.full_path()).collect();
        vec.sort();

        for file in vec {
            writeln!(f, "{file}")?;
        }

        Ok(())
    }
}
