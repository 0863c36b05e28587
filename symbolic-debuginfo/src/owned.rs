//! An object assembled in memory.
//!
//! [`OwnedObject`] implements [`ObjectLike`] over plain vectors. Container parsers that cannot
//! hand out borrowed iterators, and tests that need synthetic debug information, collect their
//! data into it and pass it to the cache builders.

use std::convert::Infallible;
use std::iter::Cloned;
use std::slice;

use symbolic_common::{Arch, CodeId, DebugId};

use crate::base::*;
use crate::unwind::UnwindTable;

/// An object file whose debug information is held in memory.
///
/// ```
/// use symbolic_common::{Arch, DebugId, Name};
/// use symbolic_debuginfo::{Function, ObjectLike, OwnedObject};
///
/// let mut object = OwnedObject::new(Arch::Amd64, DebugId::nil());
/// object.add_function(Function {
///     address: 0x1000,
///     size: 0x50,
///     name: Name::from("main"),
///     compilation_dir: Default::default(),
///     lines: vec![],
///     inlinees: vec![],
///     inline: false,
/// });
///
/// assert!(object.has_debug_info());
/// assert!(!object.has_unwind_info());
/// ```
#[derive(Clone, Debug, Default)]
pub struct OwnedObject {
    arch: Arch,
    debug_id: DebugId,
    code_id: Option<CodeId>,
    kind: ObjectKind,
    file_format: FileFormat,
    load_address: u64,
    malformed: bool,
    functions: Vec<Function<'static>>,
    files: Vec<FileEntry<'static>>,
    symbols: Vec<Symbol<'static>>,
    unwind_tables: Vec<UnwindTable>,
}

impl OwnedObject {
    /// Creates an empty debug companion object.
    pub fn new(arch: Arch, debug_id: DebugId) -> Self {
        Self {
            arch,
            debug_id,
            kind: ObjectKind::Debug,
            ..Default::default()
        }
    }

    /// Sets the code identifier.
    pub fn set_code_id(&mut self, code_id: Option<CodeId>) -> &mut Self {
        self.code_id = code_id;
        self
    }

    /// Sets the object kind.
    pub fn set_kind(&mut self, kind: ObjectKind) -> &mut Self {
        self.kind = kind;
        self
    }

    /// Sets the container format the data was read from.
    pub fn set_file_format(&mut self, file_format: FileFormat) -> &mut Self {
        self.file_format = file_format;
        self
    }

    /// Sets the preferred load address. All addresses in this object are absolute.
    pub fn set_load_address(&mut self, load_address: u64) -> &mut Self {
        self.load_address = load_address;
        self
    }

    /// Marks the object as only partially parsed.
    pub fn set_malformed(&mut self, malformed: bool) -> &mut Self {
        self.malformed = malformed;
        self
    }

    /// Adds a top-level function with its inlinees and line records.
    pub fn add_function(&mut self, function: Function<'static>) -> &mut Self {
        self.functions.push(function);
        self
    }

    /// Adds a source file referenced by the debug information.
    pub fn add_file(&mut self, file: FileEntry<'static>) -> &mut Self {
        self.files.push(file);
        self
    }

    /// Adds a public symbol.
    pub fn add_symbol(&mut self, symbol: Symbol<'static>) -> &mut Self {
        self.symbols.push(symbol);
        self
    }

    /// Adds the unwind information of one code range.
    pub fn add_unwind_table(&mut self, table: UnwindTable) -> &mut Self {
        self.unwind_tables.push(table);
        self
    }
}

impl<'object> ObjectLike<'static, 'object> for OwnedObject {
    type Error = Infallible;
    type Session = OwnedSession<'object>;
    type SymbolIterator = Cloned<slice::Iter<'object, Symbol<'static>>>;
    type UnwindIterator = OwnedUnwindIterator<'object>;

    fn file_format(&self) -> FileFormat {
        self.file_format
    }

    fn code_id(&self) -> Option<CodeId> {
        self.code_id.clone()
    }

    fn debug_id(&self) -> DebugId {
        self.debug_id
    }

    fn arch(&self) -> Arch {
        self.arch
    }

    fn kind(&self) -> ObjectKind {
        self.kind
    }

    fn load_address(&self) -> u64 {
        self.load_address
    }

    fn has_symbols(&self) -> bool {
        !self.symbols.is_empty()
    }

    fn symbols(&'object self) -> Self::SymbolIterator {
        self.symbols.iter().cloned()
    }

    fn symbol_map(&self) -> SymbolMap<'static> {
        self.symbols.iter().cloned().collect()
    }

    fn has_debug_info(&self) -> bool {
        !self.functions.is_empty()
    }

    fn debug_session(&'object self) -> Result<Self::Session, Self::Error> {
        Ok(OwnedSession {
            functions: &self.functions,
            files: &self.files,
        })
    }

    fn has_unwind_info(&self) -> bool {
        !self.unwind_tables.is_empty()
    }

    fn unwind_tables(&'object self) -> Self::UnwindIterator {
        OwnedUnwindIterator {
            inner: self.unwind_tables.iter(),
        }
    }

    fn has_sources(&self) -> bool {
        false
    }

    fn is_malformed(&self) -> bool {
        self.malformed
    }
}

/// Debug session over an [`OwnedObject`].
#[derive(Debug)]
pub struct OwnedSession<'object> {
    functions: &'object [Function<'static>],
    files: &'object [FileEntry<'static>],
}

impl<'session> DebugSession<'session> for OwnedSession<'_> {
    type Error = Infallible;
    type FunctionIterator = OwnedFunctionIterator<'session>;
    type FileIterator = OwnedFileIterator<'session>;

    fn functions(&'session self) -> Self::FunctionIterator {
        OwnedFunctionIterator {
            inner: self.functions.iter(),
        }
    }

    fn files(&'session self) -> Self::FileIterator {
        OwnedFileIterator {
            inner: self.files.iter(),
        }
    }
}

/// Iterator over the functions of an [`OwnedSession`].
pub struct OwnedFunctionIterator<'session> {
    inner: slice::Iter<'session, Function<'static>>,
}

impl<'session> Iterator for OwnedFunctionIterator<'session> {
    type Item = Result<Function<'session>, Infallible>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|function| Ok(function.clone()))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Iterator over the files of an [`OwnedSession`].
pub struct OwnedFileIterator<'session> {
    inner: slice::Iter<'session, FileEntry<'static>>,
}

impl<'session> Iterator for OwnedFileIterator<'session> {
    type Item = Result<FileEntry<'session>, Infallible>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|file| Ok(file.clone()))
    }
}

/// Iterator over the unwind tables of an [`OwnedObject`].
pub struct OwnedUnwindIterator<'object> {
    inner: slice::Iter<'object, UnwindTable>,
}

impl Iterator for OwnedUnwindIterator<'_> {
    type Item = Result<UnwindTable, Infallible>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().cloned().map(Ok)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unwind::{UnwindRules, UnwindSource};
    use symbolic_common::Name;

    #[test]
    fn test_features() {
        let mut object = OwnedObject::new(Arch::Arm64, DebugId::nil());
        assert_eq!(object.features(), ObjectFeatures::default());

        object
            .add_symbol(Symbol {
                name: Some("_start".into()),
                address: 0x100,
                size: 0,
            })
            .add_unwind_table(UnwindTable {
                source: UnwindSource::Breakpad,
                address: 0x100,
                size: 0x10,
                rules: UnwindRules::Postfix {
                    init: ".cfa: sp 0 + .ra: lr".into(),
                    deltas: vec![],
                },
            });

        let features = object.features();
        assert!(features.symtab);
        assert!(features.unwind);
        assert!(!features.debug);
        assert_eq!(object.kind(), ObjectKind::Debug);
        assert_eq!(object.unwind_tables().count(), 1);
    }

    #[test]
    fn test_session_yields_functions() {
        let mut object = OwnedObject::new(Arch::Amd64, DebugId::nil());
        object.add_function(Function {
            address: 0x10,
            size: 0x10,
            name: Name::from("f"),
            compilation_dir: Default::default(),
            lines: vec![],
            inlinees: vec![],
            inline: false,
        });

        let session = object.debug_session().unwrap();
        let names: Vec<_> = session
            .functions()
            .map(|f| f.unwrap().name.into_string())
            .collect();
        assert_eq!(names, ["f"]);
        assert_eq!(session.files().count(), 0);
    }
}
