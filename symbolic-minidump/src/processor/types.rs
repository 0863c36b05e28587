use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::{self, FromStr};

use symbolic_common::{DebugId, ParseDebugIdError, Uuid};

/// An error returned when parsing an invalid [`CodeModuleId`].
pub type ParseCodeModuleIdError = ParseDebugIdError;

/// Breakpad code module IDs.
///
/// Parsing accepts the Breakpad form as well as the UUID form with an optional appendix, in any
/// letter case. Both spellings of the same identifier compare equal, and `Display` always
/// renders the canonical Breakpad form.
///
/// # Example
///
/// ```rust
/// use std::str::FromStr;
/// use symbolic_minidump::processor::CodeModuleId;
/// # use symbolic_minidump::processor::ParseCodeModuleIdError;
///
/// # fn main() -> Result<(), ParseCodeModuleIdError> {
/// let id = CodeModuleId::from_str("DFB8E43AF2423D73A453AEB6A777EF75a")?;
/// assert_eq!(
///     "DFB8E43AF2423D73A453AEB6A777EF75a".to_string(),
///     id.to_string()
/// );
///
/// let lower = CodeModuleId::from_str("dfb8e43a-f242-3d73-a453-aeb6a777ef75-a")?;
/// assert_eq!(id, lower);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Copy)]
pub struct CodeModuleId {
    inner: DebugId,
}

impl CodeModuleId {
    /// Constructs a `CodeModuleId` from its `uuid` and `age` parts.
    pub fn from_parts(uuid: Uuid, age: u32) -> CodeModuleId {
        CodeModuleId {
            inner: DebugId::from_parts(uuid, age),
        }
    }

    /// Returns the UUID part of the code module id.
    pub fn uuid(&self) -> Uuid {
        self.inner.uuid()
    }

    /// Returns the appendix part of the code module id.
    ///
    /// On Windows, this is an incrementing counter to identify the build.
    /// On all other platforms, this value will always be zero.
    pub fn age(&self) -> u32 {
        self.inner.appendix()
    }

    /// Converts this code module id into a debug identifier.
    pub fn as_object_id(&self) -> DebugId {
        self.inner
    }

    /// Returns whether this is the all-zero placeholder that some crash reporters write for
    /// mapped files without an identifier.
    pub fn is_nil(&self) -> bool {
        self.inner.is_nil()
    }
}

impl From<DebugId> for CodeModuleId {
    fn from(inner: DebugId) -> Self {
        CodeModuleId { inner }
    }
}

impl From<CodeModuleId> for DebugId {
    fn from(source: CodeModuleId) -> Self {
        source.inner
    }
}

impl fmt::Display for CodeModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.breakpad().fmt(f)
    }
}

impl str::FromStr for CodeModuleId {
    type Err = ParseCodeModuleIdError;

    fn from_str(string: &str) -> Result<CodeModuleId, ParseCodeModuleIdError> {
        let string = string.trim();
        let inner = match DebugId::from_breakpad(string) {
            Ok(inner) => inner,
            Err(_) => DebugId::from_str(string)?,
        };

        Ok(CodeModuleId { inner })
    }
}

#[cfg(feature = "serde")]
impl ::serde::ser::Serialize for CodeModuleId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: ::serde::ser::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(feature = "serde")]
impl<'de> ::serde::de::Deserialize<'de> for CodeModuleId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: ::serde::de::Deserializer<'de>,
    {
        <::std::borrow::Cow<str>>::deserialize(deserializer)?
            .parse()
            .map_err(::serde::de::Error::custom)
    }
}

/// Carries information about a code module loaded into the process during the
/// crash. The `debug_identifier` uniquely identifies this module.
#[derive(Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CodeModule {
    id: Option<CodeModuleId>,
    base_address: u64,
    size: u64,
    code_file: String,
    code_identifier: String,
    debug_file: String,
}

impl CodeModule {
    /// Creates a module covering `size` bytes starting at `base_address`.
    pub fn new(base_address: u64, size: u64) -> Self {
        CodeModule {
            base_address,
            size,
            ..CodeModule::default()
        }
    }

    /// Sets the debug identifier.
    ///
    /// The all-zero identifier is treated as missing.
    pub fn with_id(mut self, id: CodeModuleId) -> Self {
        self.id = Some(id).filter(|id| !id.is_nil());
        self
    }

    /// Sets the path or file name that the module was loaded from.
    pub fn with_code_file(mut self, code_file: impl Into<String>) -> Self {
        self.code_file = code_file.into();
        self
    }

    /// Sets the code identifier.
    ///
    /// Some crash reporters write the placeholder `"id"` for platforms without code identifiers,
    /// which is treated as missing.
    pub fn with_code_identifier(mut self, code_identifier: impl Into<String>) -> Self {
        let code_identifier = code_identifier.into();
        self.code_identifier = if code_identifier == "id" {
            String::new()
        } else {
            code_identifier
        };
        self
    }

    /// Sets the file name of the debug companion file.
    pub fn with_debug_file(mut self, debug_file: impl Into<String>) -> Self {
        self.debug_file = debug_file.into();
        self
    }

    /// Returns the unique identifier of this `CodeModule`, which corresponds to the identifier
    /// returned by [`debug_identifier`](Self::debug_identifier).
    pub fn id(&self) -> Option<CodeModuleId> {
        self.id
    }

    /// Returns the base address of this code module as it was loaded by the process.
    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    /// The size of the code module.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the first address past the end of this module.
    pub fn end_address(&self) -> u64 {
        self.base_address.saturating_add(self.size)
    }

    /// Returns whether the module's image covers `address`.
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base_address && address < self.end_address()
    }

    /// Returns the path or file name that the code module was loaded from.
    pub fn code_file(&self) -> &str {
        &self.code_file
    }

    /// An identifying string used to discriminate between multiple versions and builds of the same
    /// code module.
    ///
    /// The contents of this identifier are implementation defined. GCC generally uses a 40
    /// character (20 byte) SHA1 checksum of the code. On Windows, this is the program timestamp and
    /// version number. On macOS, this value is empty.
    pub fn code_identifier(&self) -> &str {
        &self.code_identifier
    }

    /// Returns the filename containing debugging information of this code module.
    ///
    /// If debugging information is stored in a file separate from the code module itself (as is the
    /// case when .pdb or .dSYM files are used), this will be different from `code_file`.  If
    /// debugging information is stored in the code module itself (possibly prior to stripping),
    /// this will be the same as code_file.
    pub fn debug_file(&self) -> &str {
        &self.debug_file
    }

    /// Returns a string identifying the specific version and build of the associated debug file.
    ///
    /// It usually comprises the library's UUID and an age field. On Windows, the age field is a
    /// generation counter, on all other platforms it is mostly zero. Empty if the module has no
    /// identifier.
    pub fn debug_identifier(&self) -> String {
        self.id.map(|id| id.to_string()).unwrap_or_default()
    }
}

impl Eq for CodeModule {}

impl PartialEq for CodeModule {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Hash for CodeModule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.base_address.hash(state);
    }
}

impl Ord for CodeModule {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id
            .cmp(&other.id)
            .then(self.base_address.cmp(&other.base_address))
    }
}

impl PartialOrd for CodeModule {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for CodeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeModule")
            .field("id", &self.id())
            .field("base_address", &format_args!("{:#x}", self.base_address()))
            .field("size", &format_args!("{:#x}", self.size()))
            .field("code_file", &self.code_file())
            .field("code_identifier", &self.code_identifier())
            .field("debug_file", &self.debug_file())
            .field("debug_identifier", &self.debug_identifier())
            .finish()
    }
}

/// Indicates how well the instruction pointer derived during
/// stack walking is trusted. Since the stack walker can resort to
/// stack scanning, it can wind up with dubious frames.
///
/// Variants are declared in ascending order of trust, so they can be compared directly.
#[allow(clippy::upper_case_acronyms)]
#[repr(u32)]
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum FrameTrust {
    /// Unknown trust.
    #[default]
    None,

    /// Scanned the stack, found this (lowest precision).
    Scan,

    /// Found while scanning stack using call frame info.
    CFIScan,

    /// Derived from frame pointer.
    FP,

    /// Derived from call frame info.
    CFI,

    /// Explicitly provided by some external stack walker.
    Prewalked,

    /// Given as instruction pointer in a context (highest precision).
    Context,
}

impl FrameTrust {
    /// Returns the short name used by `FromStr` and serialization.
    pub fn name(self) -> &'static str {
        match self {
            FrameTrust::None => "none",
            FrameTrust::Scan => "scan",
            FrameTrust::CFIScan => "cfiscan",
            FrameTrust::FP => "fp",
            FrameTrust::CFI => "cfi",
            FrameTrust::Prewalked => "prewalked",
            FrameTrust::Context => "context",
        }
    }
}

impl fmt::Display for FrameTrust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let string = match *self {
            FrameTrust::None => "none",
            FrameTrust::Scan => "stack scanning",
            FrameTrust::CFIScan => "call frame info with scanning",
            FrameTrust::FP => "previous frame's frame pointer",
            FrameTrust::CFI => "call frame info",
            FrameTrust::Prewalked => "recovered by external stack walker",
            FrameTrust::Context => "given as instruction pointer in context",
        };

        f.write_str(string)
    }
}

/// Error when converting a string to [`FrameTrust`].
#[derive(Debug, thiserror::Error)]
#[error("failed to parse frame trust")]
pub struct ParseFrameTrustError;

impl FromStr for FrameTrust {
    type Err = ParseFrameTrustError;

    fn from_str(string: &str) -> Result<FrameTrust, Self::Err> {
        Ok(match string {
            "none" => FrameTrust::None,
            "scan" => FrameTrust::Scan,
            "cfiscan" => FrameTrust::CFIScan,
            "fp" => FrameTrust::FP,
            "cfi" => FrameTrust::CFI,
            "prewalked" => FrameTrust::Prewalked,
            "context" => FrameTrust::Context,
            _ => return Err(ParseFrameTrustError),
        })
    }
}

#[cfg(feature = "serde")]
impl ::serde::ser::Serialize for FrameTrust {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: ::serde::ser::Serializer,
    {
        serializer.serialize_str(self.name())
    }
}

#[cfg(feature = "serde")]
impl<'de> ::serde::de::Deserialize<'de> for FrameTrust {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: ::serde::de::Deserializer<'de>,
    {
        <::std::borrow::Cow<str>>::deserialize(deserializer)?
            .parse()
            .map_err(::serde::de::Error::custom)
    }
}

/// Value of a stack frame register.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RegVal {
    /// 32-bit register value.
    U32(u32),
    /// 64-bit register value.
    U64(u64),
}

impl RegVal {
    /// Creates a register value of the given width in bytes.
    pub(crate) fn with_width(value: u64, width: u64) -> Self {
        if width == 4 {
            RegVal::U32(value as u32)
        } else {
            RegVal::U64(value)
        }
    }

    /// Returns the value widened to 64 bits.
    pub fn value(self) -> u64 {
        match self {
            RegVal::U32(u) => u.into(),
            RegVal::U64(u) => u,
        }
    }
}

impl fmt::Display for RegVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RegVal::U32(u) => write!(f, "{u:#010x}"),
            RegVal::U64(u) => write!(f, "{u:#018x}"),
        }
    }
}

/// Contains information from the memorydump, especially the frame's instruction
/// pointer. Also references an optional `CodeModule` that contains the
/// instruction of this stack frame.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StackFrame {
    pub(crate) instruction: u64,
    pub(crate) return_address: u64,
    pub(crate) trust: FrameTrust,
    pub(crate) module: Option<CodeModule>,
    pub(crate) registers: BTreeMap<String, RegVal>,
}

impl StackFrame {
    /// Returns the program counter location as an absolute virtual address.
    ///
    /// - For the innermost called frame in a stack, this will be an exact
    ///   program counter or instruction pointer value.
    ///
    /// - For all other frames, this address is within the instruction that
    ///   caused execution to branch to this frame's callee (although it may
    ///   not point to the exact beginning of that instruction). This ensures
    ///   that, when we look up the source code location for this frame, we
    ///   get the source location of the call, not of the point at which
    ///   control will resume when the call returns, which may be on the next
    ///   line.
    ///
    /// Use `trust` to obtain how trustworthy this instruction is.
    pub fn instruction(&self) -> u64 {
        self.instruction
    }

    /// Return the actual return address, as saved on the stack or in a
    /// register. See the comments for `StackFrame::instruction` for
    /// details.
    pub fn return_address(&self) -> u64 {
        self.return_address
    }

    /// Returns the `CodeModule` that contains this frame's instruction.
    pub fn module(&self) -> Option<&CodeModule> {
        self.module.as_ref()
    }

    /// Returns how well the instruction pointer is trusted.
    pub fn trust(&self) -> FrameTrust {
        self.trust
    }

    /// Returns a mapping of registers to their known values, if any.
    pub fn registers(&self) -> &BTreeMap<String, RegVal> {
        &self.registers
    }
}

/// Represents a thread of the `ProcessState` which holds a list of [`StackFrame`]s.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CallStack {
    pub(crate) thread_id: u32,
    pub(crate) frames: Vec<StackFrame>,
}

impl CallStack {
    /// Returns the thread identifier of this callstack.
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Returns the list of `StackFrame`s in the call stack, innermost first.
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_code_module_id_forms() {
        let breakpad: CodeModuleId = "DFB8E43AF2423D73A453AEB6A777EF75a".parse().unwrap();
        let lower: CodeModuleId = "dfb8e43af2423d73a453aeb6a777ef75a".parse().unwrap();
        let uuid: CodeModuleId = "dfb8e43a-f242-3d73-a453-aeb6a777ef75-a".parse().unwrap();

        assert_eq!(breakpad, lower);
        assert_eq!(breakpad, uuid);
        assert_eq!(breakpad.age(), 10);
        assert_eq!(uuid.to_string(), "DFB8E43AF2423D73A453AEB6A777EF75a");

        let no_age: CodeModuleId = "dfb8e43a-f242-3d73-a453-aeb6a777ef75".parse().unwrap();
        assert_eq!(no_age.to_string(), "DFB8E43AF2423D73A453AEB6A777EF750");

        assert!("not an id".parse::<CodeModuleId>().is_err());
    }

    #[test]
    fn test_nil_module_id_is_dropped() {
        let module = CodeModule::new(0x1000, 0x100)
            .with_id(CodeModuleId::default())
            .with_code_identifier("id");
        assert_eq!(module.id(), None);
        assert_eq!(module.debug_identifier(), "");
        assert_eq!(module.code_identifier(), "");
    }

    #[test]
    fn test_frame_trust_order() {
        assert!(FrameTrust::Context > FrameTrust::Prewalked);
        assert!(FrameTrust::Prewalked > FrameTrust::CFI);
        assert!(FrameTrust::CFI > FrameTrust::FP);
        assert!(FrameTrust::FP > FrameTrust::CFIScan);
        assert!(FrameTrust::CFIScan > FrameTrust::Scan);

        for trust in [FrameTrust::Scan, FrameTrust::CFIScan, FrameTrust::Context] {
            assert_eq!(trust.name().parse::<FrameTrust>().unwrap(), trust);
        }
        assert!("bogus".parse::<FrameTrust>().is_err());
    }

    #[test]
    fn test_regval_display() {
        assert_eq!(RegVal::with_width(0x1234, 4).to_string(), "0x00001234");
        assert_eq!(RegVal::with_width(0x1234, 8).to_string(), "0x0000000000001234");
        assert_eq!(RegVal::U32(7).value(), 7);
    }
}
