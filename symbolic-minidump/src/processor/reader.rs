//! Conversion of minidump files into [`ProcessSnapshot`]s.

use std::collections::BTreeMap;

use minidump::system_info::Cpu;
use minidump::{
    Minidump, MinidumpAssertion, MinidumpBreakpadInfo, MinidumpContext, MinidumpException,
    MinidumpMemoryList, MinidumpMiscInfo, MinidumpModuleList, MinidumpSystemInfo,
    MinidumpThreadList, Module,
};
use symbolic_common::{Arch, CpuFamily};

use super::error::{ProcessMinidumpError, ProcessResult};
use super::snapshot::{ExceptionInfo, MemoryBlock, ProcessSnapshot, ThreadSnapshot};
use super::system_info::SystemInfo;
use super::types::{CodeModule, CodeModuleId};

/// Reads all streams needed for stack walking from a minidump.
///
/// Only a missing or broken header is fatal. Missing or corrupt streams result in a snapshot with
/// less information.
pub(crate) fn read_snapshot(data: &[u8]) -> Result<ProcessSnapshot, ProcessMinidumpError> {
    if data.is_empty() {
        return Err(ProcessResult::MinidumpNotFound.into());
    }

    let dump = Minidump::read(data)
        .map_err(|error| ProcessMinidumpError::new(ProcessResult::NoMinidumpHeader, Some(error)))?;

    let system_info = dump.get_stream::<MinidumpSystemInfo>().ok();
    let misc_info = dump.get_stream::<MinidumpMiscInfo>().ok();
    let memory_list = minidump::UnifiedMemoryList::Memory(
        dump.get_stream::<MinidumpMemoryList<'_>>()
            .unwrap_or_default(),
    );

    let arch = system_info.as_ref().map_or(Arch::Unknown, |info| cpu_arch(info.cpu));

    let exception = dump.get_stream::<MinidumpException<'_>>().ok();
    let exception_context = match (exception.as_ref(), system_info.as_ref()) {
        (Some(exception), Some(system_info)) => exception
            .context(system_info, misc_info.as_ref())
            .map(|context| context_registers(&context, arch)),
        _ => None,
    };

    let threads = match dump.get_stream::<MinidumpThreadList<'_>>() {
        Ok(thread_list) => thread_list
            .threads
            .iter()
            .map(|thread| {
                let thread_id = thread.raw.thread_id;

                let crashed = exception
                    .as_ref()
                    .is_some_and(|exception| exception.get_crashing_thread_id() == thread_id);

                let context = match exception_context.as_ref() {
                    Some(context) if crashed => Some(context.clone()),
                    _ => system_info.as_ref().and_then(|system_info| {
                        thread
                            .context(system_info, misc_info.as_ref())
                            .map(|context| context_registers(&context, arch))
                    }),
                };

                if context.is_none() {
                    tracing::warn!(thread_id, "failed to read thread context");
                }

                let stack = thread
                    .stack_memory(&memory_list)
                    .map(|memory| MemoryBlock::new(memory.base_address(), memory.bytes().to_vec()));

                ThreadSnapshot {
                    thread_id,
                    context,
                    stack,
                    prewalked: None,
                }
            })
            .collect(),
        Err(error) => {
            tracing::warn!(error = %error, "minidump has no thread list");
            Vec::new()
        }
    };

    let modules = dump
        .get_stream::<MinidumpModuleList>()
        .unwrap_or_default()
        .iter()
        .map(|module| {
            let mut code_module = CodeModule::new(module.base_address(), module.size())
                .with_code_file(module.code_file())
                .with_code_identifier(
                    module
                        .code_identifier()
                        .map(|id| id.to_string())
                        .unwrap_or_default(),
                )
                .with_debug_file(module.debug_file().unwrap_or_default());

            if let Some(debug_id) = module.debug_identifier() {
                code_module = code_module.with_id(CodeModuleId::from(debug_id));
            }

            code_module
        })
        .collect();

    let exception = exception.map(|exception| {
        let thread_id = exception.get_crashing_thread_id();
        match system_info.as_ref() {
            Some(info) => ExceptionInfo {
                thread_id,
                reason: exception.get_crash_reason(info.os, info.cpu).to_string(),
                address: exception.get_crash_address(info.os, info.cpu),
            },
            None => ExceptionInfo {
                thread_id,
                reason: String::new(),
                address: exception.raw.exception_record.exception_address,
            },
        }
    });

    let requesting_thread_id = dump
        .get_stream::<MinidumpBreakpadInfo>()
        .ok()
        .and_then(|info| info.requesting_thread_id);

    let assertion = dump
        .get_stream::<MinidumpAssertion>()
        .ok()
        .map(|assertion| format_assertion(&assertion))
        .filter(|assertion| !assertion.is_empty());

    Ok(ProcessSnapshot {
        timestamp: dump.header.time_date_stamp.into(),
        system_info: system_info
            .as_ref()
            .map_or_else(|| SystemInfo::new(Arch::Unknown), convert_system_info),
        threads,
        modules,
        exception,
        requesting_thread_id,
        assertion,
    })
}

fn convert_system_info(info: &MinidumpSystemInfo) -> SystemInfo {
    let version = format!(
        "{}.{}.{}",
        info.raw.major_version, info.raw.minor_version, info.raw.build_number
    );

    SystemInfo::new(cpu_arch(info.cpu))
        .with_os(
            info.os.long_name().to_string(),
            version,
            info.csd_version().unwrap_or_default().to_string(),
        )
        .with_cpu_info(
            info.cpu_info().unwrap_or_default().to_string(),
            info.raw.number_of_processors.into(),
        )
}

fn cpu_arch(cpu: Cpu) -> Arch {
    match cpu {
        Cpu::X86 => Arch::X86,
        Cpu::X86_64 => Arch::Amd64,
        Cpu::Ppc => Arch::Ppc,
        Cpu::Ppc64 => Arch::Ppc64,
        Cpu::Arm => Arch::Arm,
        Cpu::Arm64 => Arch::Arm64,
        Cpu::Mips => Arch::Mips,
        Cpu::Mips64 => Arch::Mips64,
        _ => Arch::Unknown,
    }
}

/// Collects the valid registers of a thread context under their canonical names.
fn context_registers(context: &MinidumpContext, arch: Arch) -> BTreeMap<String, u64> {
    context
        .valid_registers()
        .map(|(name, value)| (canonical_register_name(arch, name).to_owned(), value))
        .collect()
}

/// ARM contexts name `r11` and `r12` by their ABI roles.
fn canonical_register_name(arch: Arch, name: &str) -> &str {
    match (arch.cpu_family(), name) {
        (CpuFamily::Arm32, "fp") => "r11",
        (CpuFamily::Arm32, "ip") => "r12",
        _ => name,
    }
}

/// Formats an assertion the way Breakpad prints it.
fn format_assertion(assertion: &MinidumpAssertion) -> String {
    let mut formatted = assertion.expression().unwrap_or_default();

    if let Some(function) = assertion.function().filter(|f| !f.is_empty()) {
        if formatted.is_empty() {
            formatted.push_str("Unknown assertion");
        }
        formatted.push_str(" in function ");
        formatted.push_str(&function);
    }

    if let Some(file) = assertion.file().filter(|f| !f.is_empty()) {
        formatted.push_str(", in file ");
        formatted.push_str(&file);
    }

    if assertion.raw.line != 0 {
        formatted.push_str(&format!(" at line {}", assertion.raw.line));
    }

    formatted
}
