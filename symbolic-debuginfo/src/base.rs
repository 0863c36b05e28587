use std::borrow::Cow;
use std::fmt;
use std::iter::FromIterator;
use std::ops::Deref;
use std::str::FromStr;

use symbolic_common::{join_path, Arch, CodeId, DebugId, Name};

use crate::unwind::UnwindTable;

/// An error returned for unknown or invalid [`ObjectKind`] strings.
#[derive(Debug, thiserror::Error)]
#[error("unknown object class")]
pub struct UnknownObjectKindError;

/// Represents the designated use of the object file and hints at its contents.
#[derive(Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone)]
pub enum ObjectKind {
    /// There is no object class specified for this object file.
    #[default]
    None,
    /// An intermediate object file, usually one per compiled source file.
    Relocatable,
    /// A standalone executable program.
    Executable,
    /// A dynamic shared library.
    Library,
    /// A core file with the address space of a crashed process.
    Dump,
    /// A debug companion file for a corresponding binary.
    Debug,
    /// A container for source code files only.
    Sources,
    /// Any valid object class that does not fit the other classes.
    Other,
}

impl ObjectKind {
    /// Returns the name of the object kind.
    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::None => "none",
            ObjectKind::Relocatable => "rel",
            ObjectKind::Executable => "exe",
            ObjectKind::Library => "lib",
            ObjectKind::Dump => "dump",
            ObjectKind::Debug => "dbg",
            ObjectKind::Sources => "src",
            ObjectKind::Other => "other",
        }
    }

    /// Returns a human readable name of the object kind, also used in alternate formatting.
    ///
    /// ```rust
    /// # use symbolic_debuginfo::ObjectKind;
    /// assert_eq!(format!("{:#}", ObjectKind::Executable), "executable");
    /// ```
    pub fn human_name(self) -> &'static str {
        match self {
            ObjectKind::None | ObjectKind::Other => "file",
            ObjectKind::Relocatable => "object",
            ObjectKind::Executable => "executable",
            ObjectKind::Library => "library",
            ObjectKind::Dump => "memory dump",
            ObjectKind::Debug => "debug companion",
            ObjectKind::Sources => "sources",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            f.write_str(self.human_name())
        } else {
            f.write_str(self.name())
        }
    }
}

impl FromStr for ObjectKind {
    type Err = UnknownObjectKindError;

    fn from_str(string: &str) -> Result<ObjectKind, UnknownObjectKindError> {
        Ok(match string {
            "none" => ObjectKind::None,
            "rel" => ObjectKind::Relocatable,
            "exe" => ObjectKind::Executable,
            "lib" => ObjectKind::Library,
            "dump" => ObjectKind::Dump,
            "dbg" => ObjectKind::Debug,
            "src" => ObjectKind::Sources,
            "other" => ObjectKind::Other,
            _ => return Err(UnknownObjectKindError),
        })
    }
}

/// An error returned for unknown or invalid [`FileFormat`] strings.
#[derive(Debug, thiserror::Error)]
#[error("unknown file format")]
pub struct UnknownFileFormatError;

/// The physical container format the object was read from.
///
/// The container parsers live outside of this crate. They only report which format they read so
/// that caches can record where their data came from.
#[derive(Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone)]
pub enum FileFormat {
    /// An unknown file format, also used for objects assembled in memory.
    #[default]
    Unknown,
    /// Breakpad ASCII symbol.
    Breakpad,
    /// Executable and Linkable Format, used on Linux.
    Elf,
    /// Mach Objects, used on macOS and iOS derivatives.
    MachO,
    /// Program Database, the debug companion format on Windows.
    Pdb,
    /// Portable Executable, an extension of COFF used on Windows.
    Pe,
    /// WASM container.
    Wasm,
}

impl FileFormat {
    /// Returns the name of the file format.
    pub fn name(self) -> &'static str {
        match self {
            FileFormat::Unknown => "unknown",
            FileFormat::Breakpad => "breakpad",
            FileFormat::Elf => "elf",
            FileFormat::MachO => "macho",
            FileFormat::Pdb => "pdb",
            FileFormat::Pe => "pe",
            FileFormat::Wasm => "wasm",
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FileFormat {
    type Err = UnknownFileFormatError;

    fn from_str(string: &str) -> Result<FileFormat, UnknownFileFormatError> {
        Ok(match string {
            "unknown" => FileFormat::Unknown,
            "breakpad" => FileFormat::Breakpad,
            "elf" => FileFormat::Elf,
            "macho" => FileFormat::MachO,
            "pdb" => FileFormat::Pdb,
            "pe" => FileFormat::Pe,
            "wasm" => FileFormat::Wasm,
            _ => return Err(UnknownFileFormatError),
        })
    }
}

/// The kinds of information an object carries.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ObjectFeatures {
    /// The object has a public symbol table.
    pub symtab: bool,
    /// The object has debug information with functions and line records.
    pub debug: bool,
    /// The object has stack unwinding information.
    pub unwind: bool,
    /// The object has embedded source files.
    pub sources: bool,
}

/// A symbol from a symbol table.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct Symbol<'data> {
    /// The name of the symbol, usually mangled.
    pub name: Option<Cow<'data, str>>,

    /// The relative address of this symbol.
    pub address: u64,

    /// The size of this symbol, if known.
    ///
    /// Symbol tables usually do not record sizes. [`SymbolMap`] fills them in from the distance
    /// to the next symbol.
    pub size: u64,
}

impl<'data> Symbol<'data> {
    /// Returns the name of this symbol as string.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Determines whether the given address is covered by this symbol.
    ///
    /// A symbol without size covers every address from its start.
    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && (self.size == 0 || address < self.address + self.size)
    }
}

impl fmt::Debug for Symbol<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Symbol")
            .field("name", &self.name().unwrap_or("<unknown>"))
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

/// A sorted list of symbols, suitable for quick lookups.
///
/// Symbols are sorted by address, only the first symbol at any address is kept, and missing
/// sizes are computed from the offset to the subsequent symbol. The last symbol keeps a size
/// of zero if it had none.
///
/// ```rust
/// # use symbolic_debuginfo::{Symbol, SymbolMap};
/// let map = SymbolMap::from(vec![
///     Symbol { name: Some("A".into()), address: 0x4400, size: 0 },
///     Symbol { name: Some("B".into()), address: 0x4200, size: 0 },
///     Symbol { name: Some("C".into()), address: 0x4000, size: 0 },
/// ]);
///
/// assert_eq!(map[0], Symbol {
///     name: Some("C".into()),
///     address: 0x4000,
///     size: 0x200,
/// });
/// ```
#[derive(Clone, Debug, Default)]
pub struct SymbolMap<'data> {
    symbols: Vec<Symbol<'data>>,
}

impl<'data> SymbolMap<'data> {
    /// Creates a new, empty symbol map.
    pub fn new() -> Self {
        SymbolMap {
            symbols: Vec::new(),
        }
    }

    /// Looks up the symbol covering the given address.
    pub fn lookup(&self, address: u64) -> Option<&Symbol<'data>> {
        let index = match self.symbols.binary_search_by_key(&address, Self::key) {
            Ok(index) => index,
            Err(0) => return None,
            Err(next) => next - 1,
        };

        let symbol = &self.symbols[index];
        symbol.contains(address).then_some(symbol)
    }

    /// Looks up a symbol by its start address.
    pub fn lookup_exact(&self, address: u64) -> Option<&Symbol<'data>> {
        let index = self
            .symbols
            .binary_search_by_key(&address, Self::key)
            .ok()?;
        self.symbols.get(index)
    }

    fn key(symbol: &Symbol<'data>) -> u64 {
        symbol.address
    }
}

impl<'d> Deref for SymbolMap<'d> {
    type Target = [Symbol<'d>];

    fn deref(&self) -> &Self::Target {
        &self.symbols
    }
}

impl<'d> IntoIterator for SymbolMap<'d> {
    type Item = Symbol<'d>;
    type IntoIter = std::vec::IntoIter<Symbol<'d>>;

    fn into_iter(self) -> Self::IntoIter {
        self.symbols.into_iter()
    }
}

impl<'data, 'a> IntoIterator for &'a SymbolMap<'data> {
    type Item = &'a Symbol<'data>;
    type IntoIter = std::slice::Iter<'a, Symbol<'data>>;

    fn into_iter(self) -> Self::IntoIter {
        self.symbols.iter()
    }
}

impl<'d> From<Vec<Symbol<'d>>> for SymbolMap<'d> {
    fn from(mut symbols: Vec<Symbol<'d>>) -> Self {
        if !symbols.is_empty() {
            // Symbols sharing an address are usually aliases of the same code (such as C1/C2
            // constructors), so which one survives does not matter.
            dmsort::sort_by_key(&mut symbols, Self::key);

            symbols.dedup_by(|next, symbol| {
                if symbol.size == 0 {
                    symbol.size = next.address - symbol.address;
                }
                symbol.address == next.address
            })
        }

        SymbolMap { symbols }
    }
}

impl<'d> FromIterator<Symbol<'d>> for SymbolMap<'d> {
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = Symbol<'d>>,
    {
        Vec::from_iter(iter).into()
    }
}

/// File information referred to by [`LineInfo`], comprising a directory and a name.
///
/// The directory is usually relative to a compilation directory and may be empty.
#[derive(Clone, Default, Eq, Hash, PartialEq)]
pub struct FileInfo<'data> {
    /// The file's basename or relative path.
    pub name: Cow<'data, [u8]>,
    /// Path to the directory containing the file.
    pub dir: Cow<'data, [u8]>,
}

impl<'data> FileInfo<'data> {
    /// Creates a file info from a name and directory.
    pub fn new<N, D>(name: N, dir: D) -> Self
    where
        N: Into<Cow<'data, [u8]>>,
        D: Into<Cow<'data, [u8]>>,
    {
        FileInfo {
            name: name.into(),
            dir: dir.into(),
        }
    }

    /// Creates a file info without directory.
    pub fn from_filename<N>(name: N) -> Self
    where
        N: Into<Cow<'data, [u8]>>,
    {
        Self::new(name, Cow::Borrowed(&[][..]))
    }

    /// The file name as UTF-8 string.
    pub fn name_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    /// The directory as UTF-8 string.
    pub fn dir_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.dir)
    }

    /// The directory and name joined into one path.
    pub fn path_str(&self) -> String {
        join_path(&self.dir_str(), &self.name_str())
    }

    /// Converts this file info into an owned, `'static` file info.
    pub fn into_owned(self) -> FileInfo<'static> {
        FileInfo {
            name: Cow::Owned(self.name.into_owned()),
            dir: Cow::Owned(self.dir.into_owned()),
        }
    }
}

impl fmt::Debug for FileInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileInfo")
            .field("name", &self.name_str())
            .field("dir", &self.dir_str())
            .finish()
    }
}

/// A file referenced by the debug information, together with its compilation directory.
#[derive(Clone)]
pub struct FileEntry<'data> {
    /// Path to the compilation directory. File paths are relative to this.
    pub compilation_dir: Cow<'data, [u8]>,
    /// File name and path.
    pub info: FileInfo<'data>,
}

impl<'data> FileEntry<'data> {
    /// Path to the compilation directory.
    pub fn compilation_dir_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.compilation_dir)
    }

    /// Absolute path to the file, including the compilation directory.
    pub fn abs_path_str(&self) -> String {
        let dir = join_path(&self.compilation_dir_str(), &self.info.dir_str());
        join_path(&dir, &self.info.name_str())
    }
}

impl fmt::Debug for FileEntry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileEntry")
            .field("compilation_dir", &self.compilation_dir_str())
            .field("name", &self.info.name_str())
            .field("dir", &self.info.dir_str())
            .finish()
    }
}

impl<'data> Deref for FileEntry<'data> {
    type Target = FileInfo<'data>;

    fn deref(&self) -> &Self::Target {
        &self.info
    }
}

/// File and line number mapping for an instruction address.
#[derive(Clone, Eq, PartialEq)]
pub struct LineInfo<'data> {
    /// The instruction address relative to the image base (load address).
    pub address: u64,
    /// Total code size covered by this line record.
    pub size: Option<u64>,
    /// File name and path.
    pub file: FileInfo<'data>,
    /// Absolute line number starting at 1. Zero means no line number.
    pub line: u64,
}

impl<'data> LineInfo<'data> {
    /// Creates a line record for a file without directory.
    pub fn new<N>(address: u64, size: u64, file: N, line: u64) -> Self
    where
        N: Into<Cow<'data, [u8]>>,
    {
        LineInfo {
            address,
            size: Some(size),
            file: FileInfo::from_filename(file),
            line,
        }
    }
}

impl fmt::Debug for LineInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("LineInfo");
        s.field("address", &format_args!("{:#x}", self.address));

        match self.size {
            Some(size) => s.field("size", &format_args!("{size:#x}")),
            None => s.field("size", &self.size),
        };

        s.field("file", &self.file)
            .field("line", &self.line)
            .finish()
    }
}

/// Debug information for a function.
///
/// A function forms a tree with its inlinees. The line records of every node cover the node's
/// entire range: where a child is inlined, the parent carries a line record pointing at the
/// call site.
#[derive(Clone)]
pub struct Function<'data> {
    /// Relative instruction address of the start of the function.
    pub address: u64,
    /// Total code size covered by the function body, including inlined functions.
    pub size: u64,
    /// The name and language of the function symbol.
    pub name: Name<'data>,
    /// Path to the compilation directory. File paths are relative to this.
    pub compilation_dir: Cow<'data, [u8]>,
    /// Lines covered by this function, including inlined children.
    pub lines: Vec<LineInfo<'data>>,
    /// Functions that have been inlined into this function's body.
    pub inlinees: Vec<Function<'data>>,
    /// Specifies whether this function is inlined.
    pub inline: bool,
}

impl Function<'_> {
    /// End address of the entire function body, including inlined functions.
    pub fn end_address(&self) -> u64 {
        self.address.saturating_add(self.size)
    }
}

impl fmt::Debug for Function<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &format_args!("{:#x}", self.size))
            .field("name", &self.name)
            .field(
                "compilation_dir",
                &String::from_utf8_lossy(&self.compilation_dir),
            )
            .field("lines", &self.lines)
            .field("inlinees", &self.inlinees)
            .field("inline", &self.inline)
            .finish()
    }
}

/// A dynamically dispatched iterator over items with the given lifetime.
pub type DynIterator<'a, T> = Box<dyn Iterator<Item = T> + 'a>;

/// A stateful session for reading debug information.
///
/// Debug sessions are obtained via [`ObjectLike::debug_session`]. Building one may be costly for
/// container formats that need to decompress sections or index compilation units, so sessions
/// should be reused. Items returned from a session borrow from it.
pub trait DebugSession<'session> {
    /// The error returned when reading debug information fails.
    type Error;

    /// An iterator over all functions in this debug file.
    type FunctionIterator: Iterator<Item = Result<Function<'session>, Self::Error>>;

    /// An iterator over all source files referenced by this debug file.
    type FileIterator: Iterator<Item = Result<FileEntry<'session>, Self::Error>>;

    /// Returns an iterator over all top-level functions with their inlinees and line records.
    ///
    /// Functions are not guaranteed to be sorted or free of overlaps.
    fn functions(&'session self) -> Self::FunctionIterator;

    /// Returns an iterator over all source files referenced by this debug file.
    fn files(&'session self) -> Self::FileIterator;
}

/// A normalized view of one object file and its debug information.
///
/// This is the only interface the cache builders rely on. Parsers for the individual container
/// formats implement it, and [`OwnedObject`](crate::OwnedObject) implements it for data that was
/// assembled in memory.
pub trait ObjectLike<'data, 'object> {
    /// Errors thrown when reading information from this object.
    type Error;

    /// A session that allows optimized access to debugging information.
    type Session: for<'session> DebugSession<'session, Error = Self::Error>;

    /// The iterator over the symbols in the public symbol table.
    type SymbolIterator: Iterator<Item = Symbol<'data>>;

    /// The iterator over normalized unwind tables.
    type UnwindIterator: Iterator<Item = Result<UnwindTable, Self::Error>>;

    /// The container format of this file.
    fn file_format(&self) -> FileFormat;

    /// The code identifier of this object, if it was not stripped.
    fn code_id(&self) -> Option<CodeId>;

    /// The debug information identifier of this object.
    fn debug_id(&self) -> DebugId;

    /// The CPU architecture of this object.
    fn arch(&self) -> Arch;

    /// The kind of this object.
    fn kind(&self) -> ObjectKind;

    /// The address at which the image prefers to be loaded into memory.
    fn load_address(&self) -> u64;

    /// Determines whether this object exposes a public symbol table.
    fn has_symbols(&self) -> bool;

    /// Returns an iterator over symbols in the public symbol table.
    fn symbols(&'object self) -> Self::SymbolIterator;

    /// Returns an ordered map of symbols in the symbol table.
    fn symbol_map(&self) -> SymbolMap<'data>;

    /// Determines whether this object contains debug information.
    fn has_debug_info(&self) -> bool;

    /// Constructs a debugging session.
    ///
    /// This also succeeds for objects without debug information, in which case the session
    /// yields no functions.
    fn debug_session(&'object self) -> Result<Self::Session, Self::Error>;

    /// Determines whether this object contains stack unwinding information.
    fn has_unwind_info(&self) -> bool;

    /// Returns the unwind tables of all unwind sections in this object.
    fn unwind_tables(&'object self) -> Self::UnwindIterator;

    /// Determines whether this object contains embedded sources.
    fn has_sources(&self) -> bool;

    /// Determines whether this object is malformed and was only partially parsed.
    fn is_malformed(&self) -> bool;

    /// Returns the feature flags of this object.
    fn features(&self) -> ObjectFeatures {
        ObjectFeatures {
            symtab: self.has_symbols(),
            debug: self.has_debug_info(),
            unwind: self.has_unwind_info(),
            sources: self.has_sources(),
        }
    }
}

#[cfg(feature = "serde")]
mod derive_serde {
    macro_rules! impl_str_serde {
        ($type:ty) => {
            impl ::serde::ser::Serialize for $type {
                fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
                where
                    S: ::serde::ser::Serializer,
                {
                    serializer.serialize_str(self.name())
                }
            }

            impl<'de> ::serde::de::Deserialize<'de> for $type {
                fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
                where
                    D: ::serde::de::Deserializer<'de>,
                {
                    <::std::borrow::Cow<'_, str>>::deserialize(deserializer)?
                        .parse()
                        .map_err(::serde::de::Error::custom)
                }
            }
        };
    }

    impl_str_serde!(super::ObjectKind);
    impl_str_serde!(super::FileFormat);
}
