use std::ffi::CStr;
use std::os::raw::c_char;
use std::slice;

use symbolic_common::{Arch, InstructionInfo};
use symbolic_symcache::{SymCache, SYMCACHE_VERSION};

use crate::core::SymbolicStr;
use crate::utils::{require, ForeignObject};

/// The validated bytes of a SymCache.
///
/// The cache is parsed once when it is created, so later calls to [`get`](Self::get) only fail
/// if the bytes were modified in between.
pub struct OwnedSymCache {
    bytes: Vec<u8>,
}

impl OwnedSymCache {
    fn new(bytes: Vec<u8>) -> Result<Self, symbolic_symcache::Error> {
        SymCache::parse(&bytes)?;
        Ok(Self { bytes })
    }

    fn get(&self) -> Result<SymCache<'_>, symbolic_symcache::Error> {
        SymCache::parse(&self.bytes)
    }
}

/// Represents a symbolic sym cache.
pub struct SymbolicSymCache;

impl ForeignObject for SymbolicSymCache {
    type RustObject = OwnedSymCache;
}

/// Represents a single source location after lookup.
///
/// All strings except `full_path` borrow from the symcache and must not be used after the cache
/// has been freed.
#[repr(C)]
pub struct SymbolicLineInfo {
    pub sym_addr: u64,
    pub line_addr: u64,
    pub instr_addr: u64,
    pub line: u32,
    pub inline_depth: u32,
    pub lang: SymbolicStr,
    pub symbol: SymbolicStr,
    pub filename: SymbolicStr,
    pub base_dir: SymbolicStr,
    pub comp_dir: SymbolicStr,
    pub full_path: SymbolicStr,
}

/// Represents a lookup result of one or more items, innermost inlined frame first.
#[repr(C)]
pub struct SymbolicLookupResult {
    pub items: *mut SymbolicLineInfo,
    pub len: usize,
}

/// Represents an instruction info.
#[repr(C)]
pub struct SymbolicInstructionInfo {
    /// The address of the instruction we want to use as a base.
    pub addr: u64,
    /// The architecture we are dealing with.
    pub arch: *const SymbolicStr,
    /// This is true if the frame is the cause of the crash.
    pub crashing_frame: bool,
    /// If a signal is know that triggers the crash, it can be stored here (0 if unknown)
    pub signal: u32,
    /// The optional value of the IP register (0 if unknown).
    pub ip_reg: u64,
}

ffi_fn! {
    /// Creates a symcache from a given path.
    unsafe fn symbolic_symcache_open(path: *const c_char) -> Result<*mut SymbolicSymCache> {
        let path = require(path, "path")?;
        let bytes = std::fs::read(CStr::from_ptr(path).to_str()?)?;
        Ok(SymbolicSymCache::from_rust(OwnedSymCache::new(bytes)?))
    }
}

ffi_fn! {
    /// Creates a symcache from a byte buffer.
    ///
    /// The buffer is copied, so the caller keeps ownership of `bytes`.
    unsafe fn symbolic_symcache_from_bytes(
        bytes: *const u8,
        len: usize,
    ) -> Result<*mut SymbolicSymCache> {
        let bytes = require(bytes, "bytes")?;
        let bytes = slice::from_raw_parts(bytes, len).to_vec();
        Ok(SymbolicSymCache::from_rust(OwnedSymCache::new(bytes)?))
    }
}

ffi_fn! {
    /// Frees a symcache object.
    unsafe fn symbolic_symcache_free(symcache: *mut SymbolicSymCache) {
        SymbolicSymCache::drop(symcache);
    }
}

ffi_fn! {
    /// Returns the internal buffer of the symcache.
    ///
    /// The internal buffer is exactly `symbolic_symcache_get_size` bytes long.
    unsafe fn symbolic_symcache_get_bytes(symcache: *const SymbolicSymCache) -> Result<*const u8> {
        Ok(SymbolicSymCache::as_rust(symcache).bytes.as_ptr())
    }
}

ffi_fn! {
    /// Returns the size in bytes of the symcache.
    unsafe fn symbolic_symcache_get_size(symcache: *const SymbolicSymCache) -> Result<usize> {
        Ok(SymbolicSymCache::as_rust(symcache).bytes.len())
    }
}

ffi_fn! {
    /// Returns the architecture of the symcache.
    unsafe fn symbolic_symcache_get_arch(symcache: *const SymbolicSymCache) -> Result<SymbolicStr> {
        Ok(SymbolicSymCache::as_rust(symcache).get()?.arch().name().into())
    }
}

ffi_fn! {
    /// Returns the debug identifier of the symcache.
    unsafe fn symbolic_symcache_get_debug_id(
        symcache: *const SymbolicSymCache,
    ) -> Result<SymbolicStr> {
        Ok(SymbolicSymCache::as_rust(symcache).get()?.debug_id().to_string().into())
    }
}

ffi_fn! {
    /// Returns true if the symcache has line infos.
    unsafe fn symbolic_symcache_has_line_info(symcache: *const SymbolicSymCache) -> Result<bool> {
        Ok(SymbolicSymCache::as_rust(symcache).get()?.has_line_info())
    }
}

ffi_fn! {
    /// Returns true if the symcache has file infos.
    unsafe fn symbolic_symcache_has_file_info(symcache: *const SymbolicSymCache) -> Result<bool> {
        Ok(SymbolicSymCache::as_rust(symcache).get()?.has_file_info())
    }
}

ffi_fn! {
    /// Returns the version of the cache file.
    unsafe fn symbolic_symcache_get_version(symcache: *const SymbolicSymCache) -> Result<u32> {
        Ok(SymbolicSymCache::as_rust(symcache).get()?.version())
    }
}

ffi_fn! {
    /// Looks up all source locations at an absolute address.
    ///
    /// The result must be freed with `symbolic_lookup_result_free`.
    unsafe fn symbolic_symcache_lookup(
        symcache: *const SymbolicSymCache,
        addr: u64,
    ) -> Result<SymbolicLookupResult> {
        let cache = SymbolicSymCache::as_rust(symcache).get()?;

        let items: Box<[SymbolicLineInfo]> = cache
            .lookup(addr)
            .map(|location| {
                let function = location.function();
                let file = location.file();
                let directory = file.as_ref().and_then(|file| file.directory());
                let comp_dir = file.as_ref().and_then(|file| file.comp_dir());

                SymbolicLineInfo {
                    sym_addr: location.symbol_address(),
                    line_addr: location.line_address(),
                    instr_addr: addr,
                    line: location.line(),
                    inline_depth: location.inline_depth(),
                    lang: function.language().name().into(),
                    symbol: function.name().into(),
                    filename: file.as_ref().map_or("", |file| file.name()).into(),
                    base_dir: directory.unwrap_or_default().into(),
                    comp_dir: comp_dir.unwrap_or_default().into(),
                    full_path: file.map(|file| file.full_path()).unwrap_or_default().into(),
                }
            })
            .collect();

        let len = items.len();
        Ok(SymbolicLookupResult {
            items: Box::into_raw(items) as *mut SymbolicLineInfo,
            len,
        })
    }
}

ffi_fn! {
    /// Frees a lookup result.
    unsafe fn symbolic_lookup_result_free(lookup_result: *mut SymbolicLookupResult) {
        if let Some(result) = lookup_result.as_mut() {
            if !result.items.is_null() {
                let items = std::ptr::slice_from_raw_parts_mut(result.items, result.len);
                drop(Box::from_raw(items));
            }
            result.items = std::ptr::null_mut();
            result.len = 0;
        }
    }
}

ffi_fn! {
    /// Returns the best instruction for an instruction info.
    unsafe fn symbolic_find_best_instruction(ii: *const SymbolicInstructionInfo) -> Result<u64> {
        let info = require(ii, "instruction info")?;
        let arch = require(info.arch, "arch")?.as_str().parse::<Arch>()?;

        let address = InstructionInfo::new(arch, info.addr)
            .is_crashing_frame(info.crashing_frame)
            .signal(Some(info.signal).filter(|&s| s != 0))
            .ip_register_value(Some(info.ip_reg).filter(|&r| r != 0))
            .caller_address();

        Ok(address)
    }
}

ffi_fn! {
    /// Returns the latest symcache version.
    unsafe fn symbolic_symcache_latest_version() -> Result<u32> {
        Ok(SYMCACHE_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use symbolic_symcache::SymCacheConverter;
    use symbolic_testutils::{fixture_debug_id, inline_object};

    use super::*;
    use crate::core::{symbolic_err_clear, symbolic_err_get_last_code, SymbolicErrorCode};

    fn symcache_bytes() -> Vec<u8> {
        let mut converter = SymCacheConverter::new();
        converter.process_object(&inline_object()).unwrap();

        let mut buffer = Vec::new();
        converter.serialize(&mut buffer).unwrap();
        buffer
    }

    #[test]
    fn test_lookup() {
        let bytes = symcache_bytes();

        unsafe {
            let symcache = symbolic_symcache_from_bytes(bytes.as_ptr(), bytes.len());
            assert!(!symcache.is_null());

            assert_eq!(symbolic_symcache_get_arch(symcache).as_str(), "x86_64");
            assert_eq!(
                symbolic_symcache_get_debug_id(symcache).as_str(),
                fixture_debug_id().to_string()
            );
            assert_eq!(symbolic_symcache_get_version(symcache), SYMCACHE_VERSION);
            assert_eq!(symbolic_symcache_get_size(symcache), bytes.len());
            assert!(symbolic_symcache_has_line_info(symcache));

            let mut result = symbolic_symcache_lookup(symcache, 0x1015);
            let items = slice::from_raw_parts(result.items, result.len);
            let symbols: Vec<_> = items.iter().map(|item| item.symbol.as_str()).collect();
            assert_eq!(symbols, ["g", "f"]);
            assert_eq!(items[0].line, 3);
            assert_eq!(items[0].inline_depth, 1);
            assert_eq!(items[0].sym_addr, 0x1010);
            assert_eq!(items[1].full_path.as_str(), "/build/src/main.c");
            symbolic_lookup_result_free(&mut result);
            assert!(result.items.is_null());

            let mut empty = symbolic_symcache_lookup(symcache, 0x2000);
            assert_eq!(empty.len, 0);
            symbolic_lookup_result_free(&mut empty);

            symbolic_symcache_free(symcache);
        }
    }

    #[test]
    fn test_invalid_bytes() {
        let bytes = b"not a symcache";

        unsafe {
            symbolic_err_clear();
            let symcache = symbolic_symcache_from_bytes(bytes.as_ptr(), bytes.len());
            assert!(symcache.is_null());
            assert_ne!(symbolic_err_get_last_code(), SymbolicErrorCode::NoError);
            symbolic_err_clear();

            symbolic_symcache_from_bytes(ptr::null(), 0);
            assert_eq!(symbolic_err_get_last_code(), SymbolicErrorCode::NullPointer);
            symbolic_err_clear();
        }
    }

    #[test]
    fn test_find_best_instruction() {
        let arch = SymbolicStr::new("x86_64");
        let mut info = SymbolicInstructionInfo {
            addr: 0x1337,
            arch: &arch,
            crashing_frame: false,
            signal: 0,
            ip_reg: 0,
        };

        unsafe {
            assert_eq!(symbolic_find_best_instruction(&info), 0x1336);
            info.crashing_frame = true;
            assert_eq!(symbolic_find_best_instruction(&info), 0x1337);
        }
    }
}
