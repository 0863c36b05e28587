use std::ffi::CStr;
use std::os::raw::c_char;
use std::ptr;
use std::slice;

use symbolic_minidump::processor::{
    self, CallStack, CodeModule, CodeModuleId, FrameInfoMap, FrameTrust, ProcessState, RegVal,
    StackFrame, SystemInfo,
};

use crate::cfi::SymbolicCfiCache;
use crate::core::SymbolicStr;
use crate::utils::{require, ForeignObject};

/// A map of stack frame infos for images.
pub struct SymbolicFrameInfoMap;

impl ForeignObject for SymbolicFrameInfoMap {
    type RustObject = FrameInfoMap;
}

/// Indicates how well the instruction pointer derived during stack walking is trusted.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SymbolicFrameTrust {
    None,
    Scan,
    CfiScan,
    Fp,
    Cfi,
    Prewalked,
    Context,
}

impl From<FrameTrust> for SymbolicFrameTrust {
    fn from(trust: FrameTrust) -> Self {
        match trust {
            FrameTrust::None => SymbolicFrameTrust::None,
            FrameTrust::Scan => SymbolicFrameTrust::Scan,
            FrameTrust::CFIScan => SymbolicFrameTrust::CfiScan,
            FrameTrust::FP => SymbolicFrameTrust::Fp,
            FrameTrust::CFI => SymbolicFrameTrust::Cfi,
            FrameTrust::Prewalked => SymbolicFrameTrust::Prewalked,
            FrameTrust::Context => SymbolicFrameTrust::Context,
        }
    }
}

/// Carries information about a code module loaded into the process during the crash.
#[repr(C)]
#[derive(Default)]
pub struct SymbolicCodeModule {
    pub code_id: SymbolicStr,
    pub code_file: SymbolicStr,
    pub debug_id: SymbolicStr,
    pub debug_file: SymbolicStr,
    pub addr: u64,
    pub size: u64,
}

/// The CPU register value of a stack frame.
#[repr(C)]
pub struct SymbolicRegVal {
    pub name: SymbolicStr,
    pub value: SymbolicStr,
}

/// Contains the absolute instruction address and image information of a stack frame.
#[repr(C)]
pub struct SymbolicStackFrame {
    pub return_address: u64,
    pub instruction: u64,
    pub trust: SymbolicFrameTrust,
    pub module: SymbolicCodeModule,
    pub registers: *mut SymbolicRegVal,
    pub register_count: usize,
}

impl Drop for SymbolicStackFrame {
    fn drop(&mut self) {
        unsafe { free_slice(self.registers, self.register_count) }
    }
}

/// Represents a thread of the process state which holds a list of stack frames.
#[repr(C)]
pub struct SymbolicCallStack {
    pub thread_id: u32,
    pub frames: *mut SymbolicStackFrame,
    pub frame_count: usize,
}

impl Drop for SymbolicCallStack {
    fn drop(&mut self) {
        unsafe { free_slice(self.frames, self.frame_count) }
    }
}

/// OS and CPU information in a minidump.
#[repr(C)]
pub struct SymbolicSystemInfo {
    pub os_name: SymbolicStr,
    pub os_version: SymbolicStr,
    pub os_build: SymbolicStr,
    pub cpu_family: SymbolicStr,
    pub cpu_info: SymbolicStr,
    pub cpu_count: u32,
}

/// State of a crashed process in a minidump.
///
/// All strings and arrays are owned by this struct and released by
/// `symbolic_process_state_free`.
#[repr(C)]
pub struct SymbolicProcessState {
    pub requesting_thread: i32,
    pub timestamp: u64,
    pub crashed: bool,
    pub crash_address: u64,
    pub crash_reason: SymbolicStr,
    pub assertion: SymbolicStr,
    pub system_info: SymbolicSystemInfo,
    pub threads: *mut SymbolicCallStack,
    pub thread_count: usize,
    pub modules: *mut SymbolicCodeModule,
    pub module_count: usize,
}

impl From<&ProcessState> for SymbolicProcessState {
    fn from(state: &ProcessState) -> Self {
        let (threads, thread_count) = into_raw_slice(state.threads().iter().map(map_call_stack));
        let (modules, module_count) = into_raw_slice(state.modules().iter().map(map_code_module));

        SymbolicProcessState {
            requesting_thread: state.requesting_thread(),
            timestamp: state.timestamp(),
            crashed: state.crashed(),
            crash_address: state.crash_address(),
            crash_reason: owned(state.crash_reason()),
            assertion: owned(state.assertion()),
            system_info: map_system_info(state.system_info()),
            threads,
            thread_count,
            modules,
            module_count,
        }
    }
}

impl Drop for SymbolicProcessState {
    fn drop(&mut self) {
        unsafe {
            free_slice(self.threads, self.thread_count);
            free_slice(self.modules, self.module_count);
        }
    }
}

/// Moves mapped FFI elements into a boxed slice and leaks it.
fn into_raw_slice<S>(items: impl Iterator<Item = S>) -> (*mut S, usize) {
    let items: Box<[S]> = items.collect();
    let len = items.len();
    (Box::into_raw(items) as *mut S, len)
}

/// Releases a slice leaked by [`into_raw_slice`].
unsafe fn free_slice<S>(items: *mut S, len: usize) {
    if !items.is_null() {
        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(items, len)));
    }
}

/// Copies a string, since the process state does not outlive the FFI call.
fn owned(string: &str) -> SymbolicStr {
    SymbolicStr::from_string(string.to_owned())
}

fn map_code_module(module: &CodeModule) -> SymbolicCodeModule {
    SymbolicCodeModule {
        code_id: owned(module.code_identifier()),
        code_file: owned(module.code_file()),
        debug_id: module
            .id()
            .map(|id| id.to_string().into())
            .unwrap_or_default(),
        debug_file: owned(module.debug_file()),
        addr: module.base_address(),
        size: module.size(),
    }
}

fn map_regval((name, value): (&String, &RegVal)) -> SymbolicRegVal {
    SymbolicRegVal {
        name: owned(name),
        value: value.to_string().into(),
    }
}

fn map_stack_frame(frame: &StackFrame) -> SymbolicStackFrame {
    let (registers, register_count) = into_raw_slice(frame.registers().iter().map(map_regval));

    SymbolicStackFrame {
        return_address: frame.return_address(),
        instruction: frame.instruction(),
        trust: frame.trust().into(),
        module: frame.module().map(map_code_module).unwrap_or_default(),
        registers,
        register_count,
    }
}

fn map_call_stack(stack: &CallStack) -> SymbolicCallStack {
    let (frames, frame_count) = into_raw_slice(stack.frames().iter().map(map_stack_frame));

    SymbolicCallStack {
        thread_id: stack.thread_id(),
        frames,
        frame_count,
    }
}

fn map_system_info(info: &SystemInfo) -> SymbolicSystemInfo {
    SymbolicSystemInfo {
        os_name: owned(info.os_name()),
        os_version: info.os_version().into(),
        os_build: info.os_build().into(),
        cpu_family: owned(info.cpu_family()),
        cpu_info: owned(info.cpu_info()),
        cpu_count: info.cpu_count(),
    }
}

ffi_fn! {
    /// Creates a new frame info map.
    unsafe fn symbolic_frame_info_map_new() -> Result<*mut SymbolicFrameInfoMap> {
        Ok(SymbolicFrameInfoMap::from_rust(FrameInfoMap::new()))
    }
}

ffi_fn! {
    /// Adds the CfiCache for a module specified by `debug_id`.
    ///
    /// Assumes ownership over the cache, even if the identifier cannot be parsed. A cache
    /// previously registered for the same module is replaced.
    unsafe fn symbolic_frame_info_map_add(
        frame_info_map: *mut SymbolicFrameInfoMap,
        debug_id: *const SymbolicStr,
        cfi_cache: *mut SymbolicCfiCache,
    ) -> Result<()> {
        require(cfi_cache, "cfi cache")?;
        let cache = *SymbolicCfiCache::into_rust(cfi_cache);

        require(frame_info_map, "frame info map")?;
        let map = SymbolicFrameInfoMap::as_rust_mut(frame_info_map);
        let id = require(debug_id, "debug id")?.as_str().parse::<CodeModuleId>()?;

        map.register(id, cache);
        Ok(())
    }
}

ffi_fn! {
    /// Frees a frame info map object.
    unsafe fn symbolic_frame_info_map_free(frame_info_map: *mut SymbolicFrameInfoMap) {
        SymbolicFrameInfoMap::drop(frame_info_map);
    }
}

/// Processes a minidump buffer with an optional frame info map.
unsafe fn process_buffer(
    bytes: &[u8],
    frame_info_map: *const SymbolicFrameInfoMap,
) -> Result<*mut SymbolicProcessState, crate::utils::Error> {
    let empty;
    let frame_infos = if frame_info_map.is_null() {
        empty = FrameInfoMap::new();
        &empty
    } else {
        SymbolicFrameInfoMap::as_rust(frame_info_map)
    };

    let state = processor::process(bytes, frame_infos)?;
    Ok(Box::into_raw(Box::new(SymbolicProcessState::from(&state))))
}

ffi_fn! {
    /// Processes a minidump file with optional CFI information and returns the state of the
    /// process at the time of the crash.
    unsafe fn symbolic_process_minidump(
        path: *const c_char,
        frame_info_map: *const SymbolicFrameInfoMap,
    ) -> Result<*mut SymbolicProcessState> {
        let path = require(path, "path")?;
        let bytes = std::fs::read(CStr::from_ptr(path).to_str()?)?;
        process_buffer(&bytes, frame_info_map)
    }
}

ffi_fn! {
    /// Processes a minidump buffer with optional CFI information and returns the state of the
    /// process at the time of the crash.
    ///
    /// An empty buffer may be passed as a null pointer with a length of zero.
    unsafe fn symbolic_process_minidump_buffer(
        buffer: *const c_char,
        length: usize,
        frame_info_map: *const SymbolicFrameInfoMap,
    ) -> Result<*mut SymbolicProcessState> {
        let bytes = if buffer.is_null() {
            &[][..]
        } else {
            slice::from_raw_parts(buffer as *const u8, length)
        };

        process_buffer(bytes, frame_info_map)
    }
}

ffi_fn! {
    /// Frees a process state object.
    unsafe fn symbolic_process_state_free(process_state: *mut SymbolicProcessState) {
        if !process_state.is_null() {
            drop(Box::from_raw(process_state));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use symbolic_cfi::CfiCache;
    use symbolic_common::Arch;
    use symbolic_minidump::processor::{process_snapshot, ProcessSnapshot, ThreadSnapshot};
    use symbolic_testutils::{fixture_debug_id, unwind_object};

    use super::*;
    use crate::core::{symbolic_err_clear, symbolic_err_get_last_code, SymbolicErrorCode};

    fn snapshot() -> ProcessSnapshot {
        let module = CodeModule::new(0x1000, 0x1000)
            .with_id(CodeModuleId::from(fixture_debug_id()))
            .with_code_file("/usr/lib/libcrash.so");

        let context = BTreeMap::from([("rip".to_owned(), 0x1010), ("rsp".to_owned(), 0x8000)]);

        ProcessSnapshot {
            timestamp: 1_600_000_000,
            system_info: SystemInfo::new(Arch::Amd64),
            threads: vec![ThreadSnapshot {
                thread_id: 42,
                context: Some(context),
                ..ThreadSnapshot::default()
            }],
            modules: vec![module],
            requesting_thread_id: Some(42),
            ..ProcessSnapshot::default()
        }
    }

    #[test]
    fn test_map_process_state() {
        let state = process_snapshot(&snapshot(), &FrameInfoMap::new()).unwrap();
        let mapped = SymbolicProcessState::from(&state);

        assert_eq!(mapped.requesting_thread, 0);
        assert_eq!(mapped.timestamp, 1_600_000_000);
        assert!(!mapped.crashed);
        assert_eq!(unsafe { mapped.system_info.cpu_family.as_str() }, "amd64");

        let threads = unsafe { slice::from_raw_parts(mapped.threads, mapped.thread_count) };
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].thread_id, 42);

        let frames = unsafe { slice::from_raw_parts(threads[0].frames, threads[0].frame_count) };
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].instruction, 0x1010);
        assert_eq!(frames[0].trust, SymbolicFrameTrust::Context);
        assert_eq!(
            unsafe { frames[0].module.code_file.as_str() },
            "/usr/lib/libcrash.so"
        );

        let registers =
            unsafe { slice::from_raw_parts(frames[0].registers, frames[0].register_count) };
        let rip = registers
            .iter()
            .find(|register| unsafe { register.name.as_str() } == "rip")
            .unwrap();
        assert_eq!(unsafe { rip.value.as_str() }, "0x0000000000001010");

        assert_eq!(mapped.module_count, 1);
    }

    #[test]
    fn test_frame_info_map() {
        let cache = CfiCache::from_object(&unwind_object()).unwrap();
        let debug_id = SymbolicStr::from_string(fixture_debug_id().to_string());

        unsafe {
            let map = symbolic_frame_info_map_new();
            let handle = SymbolicCfiCache::from_rust(cache);
            symbolic_frame_info_map_add(map, &debug_id, handle);

            let id = CodeModuleId::from(fixture_debug_id());
            assert!(SymbolicFrameInfoMap::as_rust(map).contains(&id));

            symbolic_frame_info_map_free(map);
        }
    }

    #[test]
    fn test_invalid_minidump() {
        unsafe {
            symbolic_err_clear();
            let state = symbolic_process_minidump_buffer(ptr::null(), 0, ptr::null());
            assert!(state.is_null());
            assert_eq!(
                symbolic_err_get_last_code(),
                SymbolicErrorCode::ProcessMinidumpErrorMinidumpNotFound
            );

            let garbage = b"MDMP";
            let state = symbolic_process_minidump_buffer(
                garbage.as_ptr() as *const c_char,
                garbage.len(),
                ptr::null(),
            );
            assert!(state.is_null());
            assert_eq!(
                symbolic_err_get_last_code(),
                SymbolicErrorCode::ProcessMinidumpErrorNoMinidumpHeader
            );
            symbolic_err_clear();
        }
    }
}
