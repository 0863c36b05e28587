//! Stack walking over a process snapshot.
//!
//! Every caller frame is recovered by trying a fixed list of strategies in descending order of
//! trust. The first strategy that produces a plausible caller wins and its [`FrameTrust`] is
//! recorded on the frame.

use std::collections::BTreeMap;

use symbolic_common::{Arch, CpuFamily, InstructionInfo};
use symbolic_unwind::{Evaluator, LittleEndian, MemoryRegion, Register, RegisterValue};

use super::frame_info::FrameInfoMap;
use super::range_map::ModuleMap;
use super::snapshot::{PrewalkedFrame, ThreadSnapshot};
use super::types::{CallStack, CodeModule, FrameTrust, RegVal, StackFrame};

/// Limits applied while walking the stack of a thread.
///
/// The limits guarantee termination on corrupted or adversarial stacks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WalkerConfig {
    /// The maximum number of frames per thread, including the context frame.
    pub max_frames: usize,
    /// The number of stack words searched when scanning for a caller.
    pub scan_words: usize,
    /// The number of stack words searched when scanning for the caller of the context frame.
    ///
    /// The innermost frame is often in the middle of a prologue or a leaf function, so its
    /// caller can be further away.
    pub context_scan_words: usize,
    /// The maximum number of consecutive frames recovered by plain stack scanning.
    pub max_consecutive_scan_frames: usize,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            max_frames: 1024,
            scan_words: 40,
            context_scan_words: 160,
            max_consecutive_scan_frames: 16,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Strategy {
    Cfi,
    FramePointer,
    CfiScan,
    Scan,
}

/// Unwind strategies in the order they are attempted.
const STRATEGIES: [Strategy; 4] = [
    Strategy::Cfi,
    Strategy::FramePointer,
    Strategy::CfiScan,
    Strategy::Scan,
];

impl Strategy {
    fn trust(self) -> FrameTrust {
        match self {
            Strategy::Cfi => FrameTrust::CFI,
            Strategy::FramePointer => FrameTrust::FP,
            Strategy::CfiScan => FrameTrust::CFIScan,
            Strategy::Scan => FrameTrust::Scan,
        }
    }

    fn name(self) -> &'static str {
        self.trust().name()
    }
}

/// The register state of a frame while walking.
#[derive(Clone, Debug)]
struct WalkFrame {
    registers: BTreeMap<String, u64>,
    ip: u64,
    sp: u64,
    /// The address used for module and CFI lookups.
    instruction: u64,
    trust: FrameTrust,
}

pub(crate) struct StackWalker<'a> {
    arch: Arch,
    family: CpuFamily,
    word_size: u64,
    ip_register: &'static str,
    sp_register: &'static str,
    stack: Option<MemoryRegion<'a>>,
    modules: &'a ModuleMap,
    frame_infos: &'a FrameInfoMap,
    config: &'a WalkerConfig,
}

impl<'a> StackWalker<'a> {
    /// Creates a walker for one thread.
    ///
    /// Returns `None` for CPU families without a known register layout.
    pub fn new(
        arch: Arch,
        stack: Option<MemoryRegion<'a>>,
        modules: &'a ModuleMap,
        frame_infos: &'a FrameInfoMap,
        config: &'a WalkerConfig,
    ) -> Option<Self> {
        let family = arch.cpu_family();
        Some(Self {
            arch,
            family,
            word_size: family.pointer_size()? as u64,
            ip_register: family.ip_register_name()?,
            sp_register: family.sp_register_name()?,
            stack,
            modules,
            frame_infos,
            config,
        })
    }

    /// Walks the stack of a thread, starting at its captured context.
    ///
    /// A thread without a usable context yields an empty call stack.
    pub fn walk(&self, thread: &ThreadSnapshot) -> CallStack {
        let mut call_stack = CallStack {
            thread_id: thread.thread_id,
            frames: Vec::new(),
        };

        let Some(context) = thread.context.as_ref() else {
            tracing::debug!(thread_id = thread.thread_id, "thread has no context");
            return call_stack;
        };

        let Some(mut callee) = self.context_frame(context) else {
            tracing::warn!(
                thread_id = thread.thread_id,
                "thread context lacks instruction or stack pointer"
            );
            return call_stack;
        };

        if self.config.max_frames == 0 {
            return call_stack;
        }
        call_stack.frames.push(self.stack_frame(&callee));

        if let Some(prewalked) = thread.prewalked.as_ref() {
            self.push_prewalked(&mut call_stack, prewalked);
            return call_stack;
        }

        let mut consecutive_scans = 0;
        while call_stack.frames.len() < self.config.max_frames {
            let depth = call_stack.frames.len();
            let Some(caller) = self.find_caller(&callee, depth, consecutive_scans) else {
                break;
            };

            if caller.trust == FrameTrust::Scan {
                consecutive_scans += 1;
            } else {
                consecutive_scans = 0;
            }

            call_stack.frames.push(self.stack_frame(&caller));
            callee = caller;
        }

        if call_stack.frames.len() >= self.config.max_frames {
            tracing::debug!(
                thread_id = thread.thread_id,
                max_frames = self.config.max_frames,
                "stack walk reached the frame limit"
            );
        }

        call_stack
    }

    fn context_frame(&self, context: &BTreeMap<String, u64>) -> Option<WalkFrame> {
        let ip = *context.get(self.ip_register)?;
        let sp = *context.get(self.sp_register)?;

        let instruction = InstructionInfo::new(self.arch, ip)
            .is_crashing_frame(true)
            .caller_address();

        Some(WalkFrame {
            registers: context.clone(),
            ip,
            sp,
            instruction,
            trust: FrameTrust::Context,
        })
    }

    fn push_prewalked(&self, call_stack: &mut CallStack, prewalked: &[PrewalkedFrame]) {
        for frame in prewalked {
            if call_stack.frames.len() >= self.config.max_frames {
                break;
            }

            let return_address = frame
                .registers
                .get(self.ip_register)
                .copied()
                .unwrap_or(frame.instruction);

            call_stack.frames.push(StackFrame {
                instruction: frame.instruction,
                return_address,
                trust: FrameTrust::Prewalked,
                module: self.modules.find(frame.instruction).cloned(),
                registers: self.register_values(&frame.registers),
            });
        }
    }

    /// Tries all strategies in order and returns the first plausible caller.
    fn find_caller(
        &self,
        callee: &WalkFrame,
        depth: usize,
        consecutive_scans: usize,
    ) -> Option<WalkFrame> {
        for strategy in STRATEGIES {
            tracing::trace!(strategy = strategy.name(), frame = depth, "trying unwind strategy");

            let candidate = match strategy {
                Strategy::Cfi => self.unwind_cfi(callee),
                Strategy::FramePointer => self.unwind_frame_pointer(callee),
                Strategy::CfiScan => self.scan(callee, true),
                Strategy::Scan if consecutive_scans >= self.config.max_consecutive_scan_frames => {
                    tracing::trace!(frame = depth, "too many consecutive scanned frames");
                    None
                }
                Strategy::Scan => self.scan(callee, false),
            };

            let Some((registers, ip, sp)) = candidate else {
                continue;
            };

            // A null return address terminates the stack.
            if ip == 0 {
                tracing::trace!(strategy = strategy.name(), frame = depth, "reached stack end");
                return None;
            }

            let caller = self.caller_frame(registers, ip, sp, strategy.trust());
            if self.is_plausible(callee, &caller) {
                return Some(caller);
            }

            tracing::trace!(
                strategy = strategy.name(),
                frame = depth,
                ip = %format_args!("{ip:#x}"),
                sp = %format_args!("{sp:#x}"),
                "rejected implausible caller"
            );
        }

        None
    }

    /// The stack must grow towards the caller and the return address must be mapped.
    fn is_plausible(&self, callee: &WalkFrame, caller: &WalkFrame) -> bool {
        caller.sp > callee.sp && self.modules.find(caller.instruction).is_some()
    }

    fn caller_frame(
        &self,
        mut registers: BTreeMap<String, u64>,
        ip: u64,
        sp: u64,
        trust: FrameTrust,
    ) -> WalkFrame {
        registers.insert(self.ip_register.to_owned(), ip);
        registers.insert(self.sp_register.to_owned(), sp);

        let instruction = InstructionInfo::new(self.arch, ip)
            .is_crashing_frame(false)
            .caller_address();

        WalkFrame {
            registers,
            ip,
            sp,
            instruction,
            trust,
        }
    }

    fn unwind_cfi(&self, callee: &WalkFrame) -> Option<(BTreeMap<String, u64>, u64, u64)> {
        let module = self.modules.find(callee.instruction)?;
        let cache = self.frame_infos.get(&module.id()?)?;
        let address = self.cfi_address(module, cache.load_address(), callee.instruction)?;

        if self.word_size == 4 {
            self.evaluate_cfi::<u32>(cache, address, callee)
        } else {
            self.evaluate_cfi::<u64>(cache, address, callee)
        }
    }

    fn evaluate_cfi<A: RegisterValue>(
        &self,
        cache: &symbolic_cfi::CfiCache<'_>,
        address: u64,
        callee: &WalkFrame,
    ) -> Option<(BTreeMap<String, u64>, u64, u64)> {
        let rules = cache.lookup::<A>(address)?;

        let mut registers = BTreeMap::new();
        for (name, &value) in &callee.registers {
            for alias in cfi_aliases(self.family, name) {
                registers.insert(Register::from_name(&alias), A::from_u64(value));
            }
        }

        let mut evaluator = Evaluator::new(LittleEndian).registers(registers);
        if let Some(stack) = self.stack {
            evaluator = evaluator.memory(stack);
        }

        let recovered = match evaluator.evaluate_rules(&rules) {
            Ok(recovered) => recovered,
            Err(error) => {
                tracing::trace!(error = %error, "failed to evaluate unwind rules");
                return None;
            }
        };

        let sp = recovered.get(&Register::cfa())?.into_u64();
        let ip = recovered.get(&Register::ra())?.into_u64();

        let mut caller = self.preserved_registers(callee);
        for (register, value) in &recovered {
            if register.is_pseudo() {
                continue;
            }
            let name = self.family.context_register_name(register.name());
            caller.insert(name.to_owned(), value.into_u64());
        }

        Some((caller, ip, sp))
    }

    /// Follows the frame pointer chain.
    ///
    /// The frame pointer points at the saved frame pointer of the caller, followed by the return
    /// address. The caller's stack pointer is right above both.
    fn unwind_frame_pointer(&self, callee: &WalkFrame) -> Option<(BTreeMap<String, u64>, u64, u64)> {
        let fp_register = self.family.fp_register_name()?;
        let fp = *callee.registers.get(fp_register)?;

        let caller_fp = self.read_word(fp)?;
        let ip = self.read_word(fp.checked_add(self.word_size)?)?;
        let sp = fp.checked_add(2 * self.word_size)?;

        // The chain must continue upwards, unless this was the outermost frame.
        if caller_fp != 0 && (caller_fp < sp || self.read_word(caller_fp).is_none()) {
            return None;
        }

        let mut registers = BTreeMap::new();
        registers.insert(fp_register.to_owned(), caller_fp);
        Some((registers, ip, sp))
    }

    /// Searches the stack for a word that looks like a return address.
    ///
    /// With `require_cfi`, only addresses covered by call frame information of their module are
    /// accepted.
    fn scan(
        &self,
        callee: &WalkFrame,
        require_cfi: bool,
    ) -> Option<(BTreeMap<String, u64>, u64, u64)> {
        let words = if callee.trust == FrameTrust::Context {
            self.config.context_scan_words
        } else {
            self.config.scan_words
        };

        for index in 0..words as u64 {
            let address = callee.sp.checked_add(index * self.word_size)?;
            let value = self.read_word(address)?;

            let instruction = InstructionInfo::new(self.arch, value)
                .is_crashing_frame(false)
                .caller_address();
            let Some(module) = self.modules.find(instruction) else {
                continue;
            };

            if require_cfi && !self.has_cfi(module, instruction) {
                continue;
            }

            let sp = address.checked_add(self.word_size)?;
            let mut registers = BTreeMap::new();

            // Keep the frame pointer if the callee preserved it for the caller.
            if let Some(fp_register) = self.family.fp_register_name() {
                if let Some(&fp) = callee.registers.get(fp_register) {
                    if fp >= sp && self.read_word(fp).is_some() {
                        registers.insert(fp_register.to_owned(), fp);
                    }
                }
            }

            return Some((registers, value, sp));
        }

        None
    }

    fn has_cfi(&self, module: &CodeModule, instruction: u64) -> bool {
        let Some(cache) = module.id().and_then(|id| self.frame_infos.get(&id)) else {
            return false;
        };

        self.cfi_address(module, cache.load_address(), instruction)
            .and_then(|address| cache.entry(address))
            .is_some()
    }

    /// Translates a runtime address into the address space of the module's CFI cache.
    fn cfi_address(&self, module: &CodeModule, load_address: u64, instruction: u64) -> Option<u64> {
        load_address.checked_add(instruction.checked_sub(module.base_address())?)
    }

    /// Returns the callee-saved registers that are forwarded to the caller unless its unwind
    /// rules say otherwise.
    fn preserved_registers(&self, callee: &WalkFrame) -> BTreeMap<String, u64> {
        self.family
            .callee_saved_registers()
            .iter()
            .filter_map(|&name| Some((name.to_owned(), *callee.registers.get(name)?)))
            .collect()
    }

    fn read_word(&self, address: u64) -> Option<u64> {
        let stack = self.stack.as_ref()?;
        if self.word_size == 4 {
            stack.get::<u32, _>(address, LittleEndian).map(u64::from)
        } else {
            stack.get::<u64, _>(address, LittleEndian)
        }
    }

    fn stack_frame(&self, frame: &WalkFrame) -> StackFrame {
        StackFrame {
            instruction: frame.instruction,
            return_address: frame.ip,
            trust: frame.trust,
            module: self.modules.find(frame.instruction).cloned(),
            registers: self.register_values(&frame.registers),
        }
    }

    fn register_values(&self, registers: &BTreeMap<String, u64>) -> BTreeMap<String, RegVal> {
        registers
            .iter()
            .map(|(name, &value)| (name.clone(), RegVal::with_width(value, self.word_size)))
            .collect()
    }
}

/// Returns the names under which a context register may appear in unwind rules.
fn cfi_aliases(family: CpuFamily, name: &str) -> Vec<String> {
    let mut aliases = vec![name.to_owned(), format!("${name}")];

    let extra = match (family, name) {
        (CpuFamily::Arm64 | CpuFamily::Arm64_32, "fp") => Some("x29"),
        (CpuFamily::Arm64 | CpuFamily::Arm64_32, "lr") => Some("x30"),
        (CpuFamily::Arm32, "sp") => Some("r13"),
        (CpuFamily::Arm32, "lr") => Some("r14"),
        (CpuFamily::Arm32, "pc") => Some("r15"),
        (CpuFamily::Mips32 | CpuFamily::Mips64, "fp") => Some("$s8"),
        _ => None,
    };
    aliases.extend(extra.map(str::to_owned));

    aliases
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_order() {
        let trust: Vec<_> = STRATEGIES.iter().map(|s| s.trust()).collect();
        let mut sorted = trust.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(trust, sorted);
    }

    #[test]
    fn test_cfi_aliases() {
        assert_eq!(cfi_aliases(CpuFamily::Amd64, "rsp"), ["rsp", "$rsp"]);
        assert_eq!(cfi_aliases(CpuFamily::Arm64, "fp"), ["fp", "$fp", "x29"]);
    }
}
