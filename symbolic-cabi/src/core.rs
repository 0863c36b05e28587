use std::borrow::Cow;
use std::ffi::CStr;
use std::mem;
use std::os::raw::c_char;
use std::ptr;
use std::slice;
use std::str;

use symbolic_cfi::{CfiError, CfiErrorKind};
use symbolic_common::{Arch, CodeId, DebugId, ParseDebugIdError, UnknownArchError};
use symbolic_minidump::processor::{ProcessMinidumpError, ProcessResult};
use symbolic_symcache::{Error as SymCacheError, ErrorKind as SymCacheErrorKind};

use crate::utils::{clear_last_error, set_panic_hook, with_last_error, NullPointer, Panic};

/// A length-prefixed UTF-8 string.
///
/// As opposed to C strings, this string is not null-terminated. If the string is owned, indicated
/// by the `owned` flag, the owner must call the `free` function on this string. The convention is:
///
///  - When obtained as instance through return values, always free the string.
///  - When obtained as pointer through field access, never free the string.
#[repr(C)]
pub struct SymbolicStr {
    /// Pointer to the UTF-8 encoded string data.
    pub data: *mut c_char,
    /// The length of the string pointed to by `data`.
    pub len: usize,
    /// Indicates that the string is owned and must be freed.
    pub owned: bool,
}

impl Default for SymbolicStr {
    fn default() -> SymbolicStr {
        SymbolicStr {
            data: ptr::null_mut(),
            len: 0,
            owned: false,
        }
    }
}

impl SymbolicStr {
    /// Borrows a Rust string. The result must not outlive `s`.
    pub fn new(s: &str) -> SymbolicStr {
        SymbolicStr {
            data: s.as_ptr() as *mut c_char,
            len: s.len(),
            owned: false,
        }
    }

    /// Takes ownership of a Rust string.
    pub fn from_string(s: String) -> SymbolicStr {
        let mut bytes = mem::ManuallyDrop::new(s.into_bytes().into_boxed_slice());
        SymbolicStr {
            data: bytes.as_mut_ptr() as *mut c_char,
            len: bytes.len(),
            owned: true,
        }
    }

    /// Releases memory held by an owned `SymbolicStr`. Borrowed strings are left untouched.
    pub unsafe fn free(&mut self) {
        if self.owned && !self.data.is_null() {
            let bytes = ptr::slice_from_raw_parts_mut(self.data as *mut u8, self.len);
            drop(Box::from_raw(bytes));
        }

        self.data = ptr::null_mut();
        self.len = 0;
        self.owned = false;
    }

    /// Returns the Rust string managed by a `SymbolicStr`.
    pub unsafe fn as_str(&self) -> &str {
        if self.data.is_null() {
            return "";
        }
        str::from_utf8_unchecked(slice::from_raw_parts(self.data as *const u8, self.len))
    }
}

impl Drop for SymbolicStr {
    fn drop(&mut self) {
        unsafe { self.free() }
    }
}

impl From<String> for SymbolicStr {
    fn from(string: String) -> SymbolicStr {
        SymbolicStr::from_string(string)
    }
}

impl<'a> From<&'a str> for SymbolicStr {
    fn from(string: &str) -> SymbolicStr {
        SymbolicStr::new(string)
    }
}

impl<'a> From<Cow<'a, str>> for SymbolicStr {
    fn from(cow: Cow<'a, str>) -> SymbolicStr {
        match cow {
            Cow::Borrowed(string) => SymbolicStr::new(string),
            Cow::Owned(string) => SymbolicStr::from_string(string),
        }
    }
}

/// Represents all possible error codes.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SymbolicErrorCode {
    NoError = 0,
    Panic = 1,
    Unknown = 2,
    NullPointer = 3,

    // std::io
    IoError = 101,

    // symbolic_common
    UnknownArchError = 1001,
    ParseDebugIdError = 1003,

    // symbolic_cfi
    CfiErrorMissingDebugInfo = 3001,
    CfiErrorUnsupportedDebugFormat = 3002,
    CfiErrorBadDebugInfo = 3003,
    CfiErrorUnsupportedArch = 3004,
    CfiErrorWriteFailed = 3005,
    CfiErrorBadFileMagic = 3006,
    CfiErrorInvalidAddress = 3007,
    CfiErrorUnsupportedOperation = 3008,
    CfiErrorValueTooLarge = 3009,
    CfiErrorWrongEndianness = 3010,
    CfiErrorUnsupportedVersion = 3011,
    CfiErrorInvalidData = 3012,

    // symbolic_minidump
    ProcessMinidumpErrorMinidumpNotFound = 4001,
    ProcessMinidumpErrorNoMinidumpHeader = 4002,
    ProcessMinidumpErrorNoThreadList = 4003,
    ProcessMinidumpErrorInvalidThreadIndex = 4004,
    ProcessMinidumpErrorInvalidThreadId = 4005,
    ProcessMinidumpErrorDuplicateRequestingThreads = 4006,
    ProcessMinidumpErrorSymbolSupplierInterrupted = 4007,

    // symbolic_symcache
    SymCacheErrorUnknown = 6000,
    SymCacheErrorWrongEndianness = 6001,
    SymCacheErrorBadFileMagic = 6002,
    SymCacheErrorUnsupportedVersion = 6003,
    SymCacheErrorBadFileHeader = 6004,
    SymCacheErrorBadCacheFile = 6005,
    SymCacheErrorBadDebugFile = 6006,
    SymCacheErrorValueTooLarge = 6007,
    SymCacheErrorTooManyValues = 6008,
    SymCacheErrorWriteFailed = 6009,
}

impl SymbolicErrorCode {
    /// Returns the code of the first error in the source chain that has a known type.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> SymbolicErrorCode {
        let mut next = Some(error);
        while let Some(error) = next {
            if let Some(code) = Self::from_known_error(error) {
                return code;
            }
            next = error.source();
        }

        SymbolicErrorCode::Unknown
    }

    fn from_known_error(error: &(dyn std::error::Error + 'static)) -> Option<SymbolicErrorCode> {
        if error.downcast_ref::<Panic>().is_some() {
            return Some(SymbolicErrorCode::Panic);
        }

        if error.downcast_ref::<NullPointer>().is_some() {
            return Some(SymbolicErrorCode::NullPointer);
        }

        if error.downcast_ref::<std::io::Error>().is_some() {
            return Some(SymbolicErrorCode::IoError);
        }

        if error.downcast_ref::<UnknownArchError>().is_some() {
            return Some(SymbolicErrorCode::UnknownArchError);
        }

        if error.downcast_ref::<ParseDebugIdError>().is_some() {
            return Some(SymbolicErrorCode::ParseDebugIdError);
        }

        if let Some(error) = error.downcast_ref::<CfiError>() {
            return Some(match error.kind() {
                CfiErrorKind::MissingDebugInfo => SymbolicErrorCode::CfiErrorMissingDebugInfo,
                CfiErrorKind::UnsupportedDebugFormat => {
                    SymbolicErrorCode::CfiErrorUnsupportedDebugFormat
                }
                CfiErrorKind::BadDebugInfo => SymbolicErrorCode::CfiErrorBadDebugInfo,
                CfiErrorKind::UnsupportedArch => SymbolicErrorCode::CfiErrorUnsupportedArch,
                CfiErrorKind::WriteFailed => SymbolicErrorCode::CfiErrorWriteFailed,
                CfiErrorKind::BadFileMagic => SymbolicErrorCode::CfiErrorBadFileMagic,
                CfiErrorKind::InvalidAddress => SymbolicErrorCode::CfiErrorInvalidAddress,
                CfiErrorKind::UnsupportedOperation => {
                    SymbolicErrorCode::CfiErrorUnsupportedOperation
                }
                CfiErrorKind::ValueTooLarge => SymbolicErrorCode::CfiErrorValueTooLarge,
                CfiErrorKind::WrongEndianness => SymbolicErrorCode::CfiErrorWrongEndianness,
                CfiErrorKind::UnsupportedVersion => SymbolicErrorCode::CfiErrorUnsupportedVersion,
                CfiErrorKind::InvalidData => SymbolicErrorCode::CfiErrorInvalidData,
                _ => SymbolicErrorCode::Unknown,
            });
        }

        if let Some(error) = error.downcast_ref::<ProcessMinidumpError>() {
            return Some(match error.kind() {
                // `Ok` is never used as an error kind
                ProcessResult::Ok => SymbolicErrorCode::Unknown,
                ProcessResult::MinidumpNotFound => {
                    SymbolicErrorCode::ProcessMinidumpErrorMinidumpNotFound
                }
                ProcessResult::NoMinidumpHeader => {
                    SymbolicErrorCode::ProcessMinidumpErrorNoMinidumpHeader
                }
                ProcessResult::NoThreadList => SymbolicErrorCode::ProcessMinidumpErrorNoThreadList,
                ProcessResult::InvalidThreadIndex => {
                    SymbolicErrorCode::ProcessMinidumpErrorInvalidThreadIndex
                }
                ProcessResult::InvalidThreadId => {
                    SymbolicErrorCode::ProcessMinidumpErrorInvalidThreadId
                }
                ProcessResult::DuplicateRequestingThreads => {
                    SymbolicErrorCode::ProcessMinidumpErrorDuplicateRequestingThreads
                }
                ProcessResult::SymbolSupplierInterrupted => {
                    SymbolicErrorCode::ProcessMinidumpErrorSymbolSupplierInterrupted
                }
            });
        }

        if let Some(error) = error.downcast_ref::<SymCacheError>() {
            return Some(match error.kind() {
                SymCacheErrorKind::WrongEndianness => SymbolicErrorCode::SymCacheErrorWrongEndianness,
                SymCacheErrorKind::WrongFormat => SymbolicErrorCode::SymCacheErrorBadFileMagic,
                SymCacheErrorKind::WrongVersion => SymbolicErrorCode::SymCacheErrorUnsupportedVersion,
                SymCacheErrorKind::InvalidHeader => SymbolicErrorCode::SymCacheErrorBadFileHeader,
                SymCacheErrorKind::InvalidFiles
                | SymCacheErrorKind::InvalidFunctions
                | SymCacheErrorKind::InvalidRanges
                | SymCacheErrorKind::InvalidInlinees
                | SymCacheErrorKind::InvalidLines
                | SymCacheErrorKind::UnexpectedStringBytes { .. } => {
                    SymbolicErrorCode::SymCacheErrorBadCacheFile
                }
                SymCacheErrorKind::BadDebugFile => SymbolicErrorCode::SymCacheErrorBadDebugFile,
                SymCacheErrorKind::ValueTooLarge(_) => SymbolicErrorCode::SymCacheErrorValueTooLarge,
                SymCacheErrorKind::TooManyValues(_) => SymbolicErrorCode::SymCacheErrorTooManyValues,
                SymCacheErrorKind::WriteFailed => SymbolicErrorCode::SymCacheErrorWriteFailed,
                _ => SymbolicErrorCode::SymCacheErrorUnknown,
            });
        }

        None
    }
}

/// Initializes the symbolic library.
///
/// Installs a panic hook that records panics as the last error instead of printing them.
#[no_mangle]
pub unsafe extern "C" fn symbolic_init() {
    set_panic_hook();
}

/// Returns the last error code.
///
/// If there is no error, 0 is returned.
#[no_mangle]
pub unsafe extern "C" fn symbolic_err_get_last_code() -> SymbolicErrorCode {
    with_last_error(|error| match error {
        Some(error) => SymbolicErrorCode::from_error(error),
        None => SymbolicErrorCode::NoError,
    })
}

/// Returns the last error message.
///
/// If there is no error an empty string is returned. This allocates new memory that needs to be
/// freed with `symbolic_str_free`.
#[no_mangle]
pub unsafe extern "C" fn symbolic_err_get_last_message() -> SymbolicStr {
    use std::fmt::Write;

    with_last_error(|error| {
        let Some(error) = error else {
            return SymbolicStr::default();
        };

        let mut message = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            write!(&mut message, "\n  caused by: {cause}").ok();
            source = cause.source();
        }

        SymbolicStr::from_string(message)
    })
}

/// Returns the backtrace of the last panic.
///
/// If the last error is not a panic, an empty string is returned. This allocates new memory that
/// needs to be freed with `symbolic_str_free`.
#[no_mangle]
pub unsafe extern "C" fn symbolic_err_get_backtrace() -> SymbolicStr {
    with_last_error(|error| match error.and_then(|e| e.downcast_ref::<Panic>()) {
        Some(panic) => SymbolicStr::from_string(panic.backtrace().to_owned()),
        None => SymbolicStr::default(),
    })
}

/// Clears the last error.
#[no_mangle]
pub unsafe extern "C" fn symbolic_err_clear() {
    clear_last_error();
}

/// Frees a symbolic str.
///
/// If the string is marked as not owned then this function does not do anything.
#[no_mangle]
pub unsafe extern "C" fn symbolic_str_free(string: *mut SymbolicStr) {
    if let Some(string) = string.as_mut() {
        string.free();
    }
}

/// Creates a symbolic string from a raw, NUL-terminated C string.
///
/// The string is copied and needs to be freed with `symbolic_str_free`.
#[no_mangle]
pub unsafe extern "C" fn symbolic_str_from_cstr(string: *const c_char) -> SymbolicStr {
    if string.is_null() {
        return SymbolicStr::default();
    }

    CStr::from_ptr(string).to_string_lossy().into_owned().into()
}

/// Parses an architecture name. Unknown names are recorded as error.
unsafe fn parse_arch(arch: *const SymbolicStr) -> Result<Arch, crate::utils::Error> {
    let arch = crate::utils::require(arch, "arch")?;
    Ok(arch.as_str().parse::<Arch>()?)
}

ffi_fn! {
    /// Checks if an architecture is known.
    unsafe fn symbolic_arch_is_known(arch: *const SymbolicStr) -> Result<bool> {
        let arch = crate::utils::require(arch, "arch")?;
        Ok(arch.as_str().parse::<Arch>().is_ok())
    }
}

ffi_fn! {
    /// Normalizes an architecture name.
    unsafe fn symbolic_normalize_arch(arch: *const SymbolicStr) -> Result<SymbolicStr> {
        Ok(parse_arch(arch)?.name().into())
    }
}

ffi_fn! {
    /// Returns the name of the instruction pointer register if known.
    ///
    /// The returned string is static and must not be freed.
    unsafe fn symbolic_arch_ip_reg_name(arch: *const SymbolicStr) -> Result<SymbolicStr> {
        let arch = parse_arch(arch)?;
        Ok(arch.cpu_family().ip_register_name().unwrap_or_default().into())
    }
}

ffi_fn! {
    /// Returns the name of the stack pointer register if known.
    ///
    /// The returned string is static and must not be freed.
    unsafe fn symbolic_arch_sp_reg_name(arch: *const SymbolicStr) -> Result<SymbolicStr> {
        let arch = parse_arch(arch)?;
        Ok(arch.cpu_family().sp_register_name().unwrap_or_default().into())
    }
}

ffi_fn! {
    /// Returns the pointer width of an architecture in bytes, or `0` if unknown.
    unsafe fn symbolic_arch_pointer_size(arch: *const SymbolicStr) -> Result<u32> {
        let arch = parse_arch(arch)?;
        Ok(arch.cpu_family().pointer_size().unwrap_or(0) as u32)
    }
}

ffi_fn! {
    /// Converts a Breakpad code module id to a debug identifier.
    unsafe fn symbolic_id_from_breakpad(breakpad_id: *const SymbolicStr) -> Result<SymbolicStr> {
        let breakpad_id = crate::utils::require(breakpad_id, "breakpad_id")?;
        let debug_id = DebugId::from_breakpad(breakpad_id.as_str())?;
        Ok(debug_id.to_string().into())
    }
}

ffi_fn! {
    /// Normalizes a code identifier to its lowercase hex representation.
    unsafe fn symbolic_normalize_code_id(code_id: *const SymbolicStr) -> Result<SymbolicStr> {
        let code_id = crate::utils::require(code_id, "code_id")?;
        Ok(CodeId::new(code_id.as_str().into()).to_string().into())
    }
}

ffi_fn! {
    /// Normalizes a debug identifier to its canonical representation.
    ///
    /// Both the hyphenated form and the compact Breakpad form are accepted.
    unsafe fn symbolic_normalize_debug_id(debug_id: *const SymbolicStr) -> Result<SymbolicStr> {
        let debug_id = crate::utils::require(debug_id, "debug_id")?;
        let debug_id = debug_id.as_str().trim();
        let debug_id = match DebugId::from_breakpad(debug_id) {
            Ok(debug_id) => debug_id,
            Err(_) => debug_id.parse::<DebugId>()?,
        };
        Ok(debug_id.to_string().into())
    }
}
