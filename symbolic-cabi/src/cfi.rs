use std::ffi::CStr;
use std::os::raw::c_char;
use std::slice;

use symbolic_cfi::{CfiCache, CFICACHE_LATEST_VERSION};

use crate::core::SymbolicStr;
use crate::utils::{require, ForeignObject};

/// Contains stack frame information (CFI) for an image.
pub struct SymbolicCfiCache;

impl ForeignObject for SymbolicCfiCache {
    type RustObject = CfiCache<'static>;
}

ffi_fn! {
    /// Loads a CFI cache from the given path.
    unsafe fn symbolic_cficache_open(path: *const c_char) -> Result<*mut SymbolicCfiCache> {
        let path = require(path, "path")?;
        let buffer = std::fs::read(CStr::from_ptr(path).to_str()?)?;
        Ok(SymbolicCfiCache::from_rust(CfiCache::from_vec(buffer)?))
    }
}

ffi_fn! {
    /// Loads a CFI cache from a byte buffer.
    ///
    /// The buffer is copied, so the caller keeps ownership of `bytes`.
    unsafe fn symbolic_cficache_from_bytes(
        bytes: *const u8,
        len: usize,
    ) -> Result<*mut SymbolicCfiCache> {
        let bytes = require(bytes, "bytes")?;
        let buffer = slice::from_raw_parts(bytes, len).to_vec();
        Ok(SymbolicCfiCache::from_rust(CfiCache::from_vec(buffer)?))
    }
}

ffi_fn! {
    /// Returns the file format version of the CFI cache.
    unsafe fn symbolic_cficache_get_version(cache: *const SymbolicCfiCache) -> Result<u32> {
        Ok(SymbolicCfiCache::as_rust(cache).version())
    }
}

ffi_fn! {
    /// Returns a pointer to the raw buffer of the CFI cache.
    unsafe fn symbolic_cficache_get_bytes(cache: *const SymbolicCfiCache) -> Result<*const u8> {
        Ok(SymbolicCfiCache::as_rust(cache).as_slice().as_ptr())
    }
}

ffi_fn! {
    /// Returns the size of the raw buffer of the CFI cache.
    unsafe fn symbolic_cficache_get_size(cache: *const SymbolicCfiCache) -> Result<usize> {
        Ok(SymbolicCfiCache::as_rust(cache).as_slice().len())
    }
}

ffi_fn! {
    /// Returns the unwind program that applies at an absolute address.
    ///
    /// If no unwind information covers the address, an empty string is returned. The string is
    /// owned and must be freed with `symbolic_str_free`.
    unsafe fn symbolic_cficache_get_program(
        cache: *const SymbolicCfiCache,
        addr: u64,
    ) -> Result<SymbolicStr> {
        let program = SymbolicCfiCache::as_rust(cache).program_at(addr);
        Ok(program.map(SymbolicStr::from_string).unwrap_or_default())
    }
}

ffi_fn! {
    /// Releases memory held by an unmanaged `SymbolicCfiCache` instance.
    unsafe fn symbolic_cficache_free(cache: *mut SymbolicCfiCache) {
        SymbolicCfiCache::drop(cache);
    }
}

ffi_fn! {
    /// Returns the latest CFI cache version.
    unsafe fn symbolic_cficache_latest_version() -> Result<u32> {
        Ok(CFICACHE_LATEST_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use symbolic_testutils::unwind_object;

    use super::*;
    use crate::core::{symbolic_err_clear, symbolic_err_get_last_code, SymbolicErrorCode};

    #[test]
    fn test_from_bytes() {
        let cache = CfiCache::from_object(&unwind_object()).unwrap();
        let bytes = cache.as_slice();

        unsafe {
            let handle = symbolic_cficache_from_bytes(bytes.as_ptr(), bytes.len());
            assert!(!handle.is_null());

            assert_eq!(symbolic_cficache_get_version(handle), CFICACHE_LATEST_VERSION);
            assert_eq!(symbolic_cficache_get_size(handle), bytes.len());
            let copied = slice::from_raw_parts(
                symbolic_cficache_get_bytes(handle),
                symbolic_cficache_get_size(handle),
            );
            assert_eq!(copied, bytes);

            assert_eq!(
                symbolic_cficache_get_program(handle, 0x1000).as_str(),
                cache.program_at(0x1000).unwrap()
            );
            assert_eq!(symbolic_cficache_get_program(handle, 0x9000).as_str(), "");

            symbolic_cficache_free(handle);
        }
    }

    #[test]
    fn test_bad_magic() {
        let bytes = b"STACK CFI INIT 1000 10 .cfa: $rsp 8 + .ra: .cfa -8 + ^";

        unsafe {
            symbolic_err_clear();
            let handle = symbolic_cficache_from_bytes(bytes.as_ptr(), bytes.len());
            assert!(handle.is_null());
            assert_eq!(
                symbolic_err_get_last_code(),
                SymbolicErrorCode::CfiErrorBadFileMagic
            );
            symbolic_err_clear();
        }
    }
}
