//! Instruction address adjustments for caller frames.

use crate::arch::{Arch, CpuFamily};

const SIGILL: u32 = 4;
const SIGBUS: u32 = 10;
const SIGSEGV: u32 = 11;

/// Derives the address of a call site from a frame's return address.
///
/// Every frame except the innermost one records where execution *resumes* after the call
/// returns, which usually is the first instruction after the call. Symbolicating that address
/// directly can attribute the frame to the wrong line, or even the wrong function when the call
/// is the last instruction of a function. [`caller_address`](Self::caller_address) moves the
/// address back into the calling instruction, using the instruction width of the CPU family.
///
/// The innermost frame of a thread holds the live instruction pointer and is not adjusted,
/// unless the crash was caused by a signal that left a return address in that slot.
///
/// ```
/// use symbolic_common::{Arch, InstructionInfo};
///
/// let caller = InstructionInfo::new(Arch::Arm64, 0x1337)
///     .is_crashing_frame(false)
///     .caller_address();
///
/// assert_eq!(caller, 0x1330);
/// ```
#[derive(Clone, Debug)]
pub struct InstructionInfo {
    addr: u64,
    arch: Arch,
    crashing_frame: bool,
    signal: Option<u32>,
    ip_reg: Option<u64>,
}

impl InstructionInfo {
    /// Creates info for a non-crashing frame without signal or register information.
    pub fn new(arch: Arch, instruction_address: u64) -> Self {
        Self {
            arch,
            addr: instruction_address,
            crashing_frame: false,
            signal: None,
            ip_reg: None,
        }
    }

    /// Marks this as the innermost frame of the thread.
    pub fn is_crashing_frame(&mut self, flag: bool) -> &mut Self {
        self.crashing_frame = flag;
        self
    }

    /// Sets the POSIX signal that terminated the process.
    pub fn signal(&mut self, signal: Option<u32>) -> &mut Self {
        self.signal = signal;
        self
    }

    /// Sets the original value of the instruction pointer register at crash time.
    pub fn ip_register_value(&mut self, value: Option<u64>) -> &mut Self {
        self.ip_reg = value;
        self
    }

    /// Aligns the address down to the instruction alignment of the CPU family.
    ///
    /// ```
    /// use symbolic_common::{Arch, InstructionInfo};
    ///
    /// assert_eq!(InstructionInfo::new(Arch::Arm64, 0x1337).aligned_address(), 0x1334);
    /// assert_eq!(InstructionInfo::new(Arch::Amd64, 0x1337).aligned_address(), 0x1337);
    /// ```
    pub fn aligned_address(&self) -> u64 {
        match self.arch.cpu_family().instruction_alignment() {
            Some(alignment) => self.addr - (self.addr % alignment),
            None => self.addr,
        }
    }

    /// Returns an address inside the instruction preceding the current one.
    ///
    /// On variable-width instruction sets this is an upper bound, one byte before the current
    /// address.
    pub fn previous_address(&self) -> u64 {
        let family = self.arch.cpu_family();
        let instruction_size = family.instruction_alignment().unwrap_or(1);

        // MIPS return addresses skip the branch delay slot.
        let pc_offset = match family {
            CpuFamily::Mips32 | CpuFamily::Mips64 => 2 * instruction_size,
            _ => instruction_size,
        };

        self.aligned_address().saturating_sub(pc_offset)
    }

    /// Returns whether the signal indicates a jump to an invalid, privileged or misaligned
    /// address.
    pub fn is_crash_signal(&self) -> bool {
        matches!(self.signal, Some(SIGILL) | Some(SIGBUS) | Some(SIGSEGV))
    }

    /// Returns whether this frame's address is a return address that needs adjustment.
    pub fn should_adjust_caller(&self) -> bool {
        if !self.crashing_frame {
            return true;
        }

        // Some crash reporters drop the signal handler frame, leaving a return address in the
        // innermost frame.
        if let Some(ip) = self.ip_reg {
            if ip != self.addr && self.is_crash_signal() {
                return true;
            }
        }

        false
    }

    /// Returns the best guess for the address of the calling instruction.
    pub fn caller_address(&self) -> u64 {
        if self.should_adjust_caller() {
            self.previous_address()
        } else {
            self.aligned_address()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crashing_frame_is_not_adjusted() {
        let addr = InstructionInfo::new(Arch::Amd64, 0x1337)
            .is_crashing_frame(true)
            .caller_address();
        assert_eq!(addr, 0x1337);
    }

    #[test]
    fn test_signal_handler_frame_is_adjusted() {
        let addr = InstructionInfo::new(Arch::Arm64, 0x1337)
            .is_crashing_frame(true)
            .signal(Some(SIGSEGV))
            .ip_register_value(Some(0x4242))
            .caller_address();
        assert_eq!(addr, 0x1330);
    }

    #[test]
    fn test_mips_skips_delay_slot() {
        let addr = InstructionInfo::new(Arch::Mips, 0x1010).caller_address();
        assert_eq!(addr, 0x1008);
    }

    #[test]
    fn test_previous_address_saturates() {
        assert_eq!(InstructionInfo::new(Arch::Arm64, 2).previous_address(), 0);
    }
}
