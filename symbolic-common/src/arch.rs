//! CPU architectures and their register conventions.

use std::fmt;
use std::str;

/// Names for x86 CPU registers by register number.
static I386: &[&str] = &[
    "$eax", "$ecx", "$edx", "$ebx", "$esp", "$ebp", "$esi", "$edi", "$eip", "$eflags", "$unused1",
    "$st0", "$st1", "$st2", "$st3", "$st4", "$st5", "$st6", "$st7", "$unused2", "$unused3",
    "$xmm0", "$xmm1", "$xmm2", "$xmm3", "$xmm4", "$xmm5", "$xmm6", "$xmm7", "$mm0", "$mm1", "$mm2",
    "$mm3", "$mm4", "$mm5", "$mm6", "$mm7", "$fcw", "$fsw", "$mxcsr", "$es", "$cs", "$ss", "$ds",
    "$fs", "$gs", "$unused4", "$unused5", "$tr", "$ldtr",
];

/// Names for x86_64 CPU registers by register number.
static X86_64: &[&str] = &[
    "$rax", "$rdx", "$rcx", "$rbx", "$rsi", "$rdi", "$rbp", "$rsp", "$r8", "$r9", "$r10", "$r11",
    "$r12", "$r13", "$r14", "$r15", "$rip", "$xmm0", "$xmm1", "$xmm2", "$xmm3", "$xmm4", "$xmm5",
    "$xmm6", "$xmm7", "$xmm8", "$xmm9", "$xmm10", "$xmm11", "$xmm12", "$xmm13", "$xmm14", "$xmm15",
    "$st0", "$st1", "$st2", "$st3", "$st4", "$st5", "$st6", "$st7", "$mm0", "$mm1", "$mm2", "$mm3",
    "$mm4", "$mm5", "$mm6", "$mm7", "$rflags", "$es", "$cs", "$ss", "$ds", "$fs", "$gs",
    "$unused1", "$unused2", "$fs.base", "$gs.base", "$unused3", "$unused4", "$tr", "$ldtr",
    "$mxcsr", "$fcw", "$fsw",
];

/// Names for 32bit ARM CPU registers by register number.
static ARM: &[&str] = &[
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp", "lr",
    "pc", "f0", "f1", "f2", "f3", "f4", "f5", "f6", "f7", "fps", "cpsr", "", "", "", "", "", "",
    "", "", "", "", "", "", "", "", "", "", "", "", "", "", "", "", "", "", "", "", "", "", "", "",
    "", "", "", "", "", "", "", "", "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9",
    "s10", "s11", "s12", "s13", "s14", "s15", "s16", "s17", "s18", "s19", "s20", "s21", "s22",
    "s23", "s24", "s25", "s26", "s27", "s28", "s29", "s30", "s31", "f0", "f1", "f2", "f3", "f4",
    "f5", "f6", "f7",
];

/// Names for 64bit ARM CPU registers by register number.
static ARM64: &[&str] = &[
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "x30", "sp", "", "", "", "", "", "", "", "", "", "", "", "", "", "", "", "", "",
    "", "", "", "", "", "", "", "", "", "", "", "", "", "", "", "v0", "v1", "v2", "v3", "v4", "v5",
    "v6", "v7", "v8", "v9", "v10", "v11", "v12", "v13", "v14", "v15", "v16", "v17", "v18", "v19",
    "v20", "v21", "v22", "v23", "v24", "v25", "v26", "v27", "v28", "v29", "v30", "v31",
];

/// Names for MIPS CPU registers by register number.
static MIPS: &[&str] = &[
    "$zero", "$at", "$v0", "$v1", "$a0", "$a1", "$a2", "$a3", "$t0", "$t1", "$t2", "$t3", "$t4",
    "$t5", "$t6", "$t7", "$s0", "$s1", "$s2", "$s3", "$s4", "$s5", "$s6", "$s7", "$t8", "$t9",
    "$k0", "$k1", "$gp", "$sp", "$fp", "$ra", "$lo", "$hi", "$pc", "$f0", "$f2", "$f3", "$f4",
    "$f5", "$f6", "$f7", "$f8", "$f9", "$f10", "$f11", "$f12", "$f13", "$f14", "$f15", "$f16",
    "$f17", "$f18", "$f19", "$f20", "$f21", "$f22", "$f23", "$f24", "$f25", "$f26", "$f27", "$f28",
    "$f29", "$f30", "$f31", "$fcsr", "$fir",
];

/// A family of CPUs sharing an instruction set, pointer width and register file.
///
/// Every [`Arch`] belongs to exactly one family. The stack walker and the CFI
/// builder only care about the family, never about the exact architecture variant.
///
/// Represented as `u32` so it can be stored in binary cache headers.
#[repr(u32)]
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CpuFamily {
    /// Any other CPU family that is not explicitly supported.
    #[default]
    Unknown = 0,
    /// 32-bit x86.
    Intel32 = 1,
    /// 64-bit x86, also known as `x86_64` or `amd64`.
    Amd64 = 2,
    /// 32-bit ARM.
    Arm32 = 3,
    /// 64-bit ARM (e.g. ARMv8-A).
    Arm64 = 4,
    /// 32-bit big-endian PowerPC.
    Ppc32 = 5,
    /// 64-bit big-endian PowerPC.
    Ppc64 = 6,
    /// 32-bit MIPS.
    Mips32 = 7,
    /// 64-bit MIPS.
    Mips64 = 8,
    /// ILP32 ABI on 64-bit ARM.
    Arm64_32 = 9,
}

impl CpuFamily {
    /// Returns the native pointer size in bytes, or `None` for unknown families.
    ///
    /// ```
    /// use symbolic_common::CpuFamily;
    ///
    /// assert_eq!(CpuFamily::Amd64.pointer_size(), Some(8));
    /// assert_eq!(CpuFamily::Intel32.pointer_size(), Some(4));
    /// ```
    pub fn pointer_size(self) -> Option<usize> {
        match self {
            CpuFamily::Unknown => None,
            CpuFamily::Amd64 | CpuFamily::Arm64 | CpuFamily::Ppc64 | CpuFamily::Mips64 => Some(8),
            CpuFamily::Intel32
            | CpuFamily::Arm32
            | CpuFamily::Ppc32
            | CpuFamily::Mips32
            | CpuFamily::Arm64_32 => Some(4),
        }
    }

    /// Returns the instruction alignment for fixed-width instruction sets.
    ///
    /// Variable-length encodings such as x86 return `None`.
    pub fn instruction_alignment(self) -> Option<u64> {
        match self {
            CpuFamily::Arm32 => Some(2),
            CpuFamily::Arm64 | CpuFamily::Arm64_32 => Some(4),
            CpuFamily::Ppc32 | CpuFamily::Mips32 | CpuFamily::Mips64 => Some(4),
            CpuFamily::Ppc64 => Some(8),
            CpuFamily::Intel32 | CpuFamily::Amd64 | CpuFamily::Unknown => None,
        }
    }

    /// Returns the name of the instruction pointer register as it appears in minidump contexts.
    ///
    /// ```
    /// use symbolic_common::CpuFamily;
    ///
    /// assert_eq!(CpuFamily::Amd64.ip_register_name(), Some("rip"));
    /// ```
    pub fn ip_register_name(self) -> Option<&'static str> {
        match self {
            CpuFamily::Intel32 => Some("eip"),
            CpuFamily::Amd64 => Some("rip"),
            CpuFamily::Arm32 | CpuFamily::Arm64 | CpuFamily::Arm64_32 => Some("pc"),
            CpuFamily::Ppc32 | CpuFamily::Ppc64 => Some("srr0"),
            CpuFamily::Mips32 | CpuFamily::Mips64 => Some("pc"),
            CpuFamily::Unknown => None,
        }
    }

    /// Returns the name of the stack pointer register.
    pub fn sp_register_name(self) -> Option<&'static str> {
        match self {
            CpuFamily::Intel32 => Some("esp"),
            CpuFamily::Amd64 => Some("rsp"),
            CpuFamily::Arm32 | CpuFamily::Arm64 | CpuFamily::Arm64_32 => Some("sp"),
            CpuFamily::Ppc32 | CpuFamily::Ppc64 => Some("r1"),
            CpuFamily::Mips32 | CpuFamily::Mips64 => Some("sp"),
            CpuFamily::Unknown => None,
        }
    }

    /// Returns the name of the frame pointer register, if the platform ABI keeps a frame
    /// pointer chain.
    pub fn fp_register_name(self) -> Option<&'static str> {
        match self {
            CpuFamily::Intel32 => Some("ebp"),
            CpuFamily::Amd64 => Some("rbp"),
            CpuFamily::Arm32 => Some("r11"),
            CpuFamily::Arm64 | CpuFamily::Arm64_32 => Some("fp"),
            CpuFamily::Mips32 | CpuFamily::Mips64 => Some("fp"),
            CpuFamily::Ppc32 | CpuFamily::Ppc64 | CpuFamily::Unknown => None,
        }
    }

    /// Returns the name of the link register holding the return address.
    ///
    /// Returns `None` on architectures that push the return address onto the stack.
    pub fn ra_register_name(self) -> Option<&'static str> {
        match self {
            CpuFamily::Arm32 | CpuFamily::Arm64 | CpuFamily::Arm64_32 => Some("lr"),
            CpuFamily::Mips32 | CpuFamily::Mips64 => Some("ra"),
            _ => None,
        }
    }

    /// Returns the registers that survive a call and are recovered by the caller's unwinder.
    pub fn callee_saved_registers(self) -> &'static [&'static str] {
        match self {
            CpuFamily::Intel32 => &["ebx", "esi", "edi", "ebp"],
            CpuFamily::Amd64 => &["rbx", "rbp", "r12", "r13", "r14", "r15"],
            CpuFamily::Arm32 => &["r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11"],
            CpuFamily::Arm64 | CpuFamily::Arm64_32 => &[
                "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27", "x28", "fp",
            ],
            CpuFamily::Mips32 | CpuFamily::Mips64 => {
                &["s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "gp", "fp"]
            }
            _ => &[],
        }
    }

    /// Maps a register name as used in unwind rules to the name used in minidump contexts.
    ///
    /// CFI programs spell registers the way the DWARF register tables do (`$rsp`, `x29`), while
    /// thread contexts use plain names (`rsp`, `fp`).
    ///
    /// ```
    /// use symbolic_common::CpuFamily;
    ///
    /// assert_eq!(CpuFamily::Amd64.context_register_name("$rbp"), "rbp");
    /// assert_eq!(CpuFamily::Arm64.context_register_name("x30"), "lr");
    /// ```
    pub fn context_register_name(self, name: &str) -> &str {
        let name = name.strip_prefix('$').unwrap_or(name);
        match (self, name) {
            (CpuFamily::Arm64 | CpuFamily::Arm64_32, "x29") => "fp",
            (CpuFamily::Arm64 | CpuFamily::Arm64_32, "x30") => "lr",
            (CpuFamily::Arm32, "r13") => "sp",
            (CpuFamily::Arm32, "r14") => "lr",
            (CpuFamily::Arm32, "r15") => "pc",
            (CpuFamily::Mips32 | CpuFamily::Mips64, "s8") => "fp",
            _ => name,
        }
    }

    /// Returns the CFI name of a DWARF register number for this family.
    ///
    /// The names follow Breakpad conventions, so x86 registers carry a `$` prefix.
    ///
    /// ```
    /// use symbolic_common::CpuFamily;
    ///
    /// assert_eq!(CpuFamily::Amd64.cfi_register_name(16), Some("$rip"));
    /// ```
    pub fn cfi_register_name(self, register: u16) -> Option<&'static str> {
        let index = register as usize;

        let opt = match self {
            CpuFamily::Intel32 => I386.get(index),
            CpuFamily::Amd64 => X86_64.get(index),
            CpuFamily::Arm64 | CpuFamily::Arm64_32 => ARM64.get(index),
            CpuFamily::Arm32 => ARM.get(index),
            CpuFamily::Mips32 | CpuFamily::Mips64 => MIPS.get(index),
            _ => None,
        };

        opt.copied().filter(|name| !name.is_empty())
    }
}

/// An error returned for an invalid [`Arch`] string.
#[derive(Debug, thiserror::Error)]
#[error("unknown architecture")]
pub struct UnknownArchError;

/// An enumeration of CPU architectures and variants.
///
/// Architectures group into a [`CpuFamily`]. The `*Unknown` variants keep the family when the
/// exact subtype is not recognized. Values are grouped by family in steps of 100 so that the
/// `u32` representation stays stable across additions.
#[repr(u32)]
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Arch {
    #[default]
    Unknown = 0,
    X86 = 101,
    X86Unknown = 199,
    Amd64 = 201,
    Amd64h = 202,
    Amd64Unknown = 299,
    Arm = 301,
    ArmV5 = 302,
    ArmV6 = 303,
    ArmV6m = 304,
    ArmV7 = 305,
    ArmV7f = 306,
    ArmV7s = 307,
    ArmV7k = 308,
    ArmV7m = 309,
    ArmV7em = 310,
    ArmUnknown = 399,
    Arm64 = 401,
    Arm64V8 = 402,
    Arm64e = 403,
    Arm64Unknown = 499,
    Ppc = 501,
    Ppc64 = 601,
    Mips = 701,
    Mips64 = 801,
    Arm64_32 = 901,
    Arm64_32V8 = 902,
    Arm64_32Unknown = 999,
}

impl Arch {
    /// Creates an `Arch` from its `u32` representation, falling back to `Arch::Unknown`.
    pub fn from_u32(val: u32) -> Arch {
        match val {
            101 => Arch::X86,
            199 => Arch::X86Unknown,
            201 => Arch::Amd64,
            202 => Arch::Amd64h,
            299 => Arch::Amd64Unknown,
            301 => Arch::Arm,
            302 => Arch::ArmV5,
            303 => Arch::ArmV6,
            304 => Arch::ArmV6m,
            305 => Arch::ArmV7,
            306 => Arch::ArmV7f,
            307 => Arch::ArmV7s,
            308 => Arch::ArmV7k,
            309 => Arch::ArmV7m,
            310 => Arch::ArmV7em,
            399 => Arch::ArmUnknown,
            401 => Arch::Arm64,
            402 => Arch::Arm64V8,
            403 => Arch::Arm64e,
            499 => Arch::Arm64Unknown,
            501 => Arch::Ppc,
            601 => Arch::Ppc64,
            701 => Arch::Mips,
            801 => Arch::Mips64,
            901 => Arch::Arm64_32,
            902 => Arch::Arm64_32V8,
            999 => Arch::Arm64_32Unknown,
            _ => Arch::Unknown,
        }
    }

    /// Returns the CPU family of this architecture.
    pub fn cpu_family(self) -> CpuFamily {
        match self {
            Arch::Unknown => CpuFamily::Unknown,
            Arch::X86 | Arch::X86Unknown => CpuFamily::Intel32,
            Arch::Amd64 | Arch::Amd64h | Arch::Amd64Unknown => CpuFamily::Amd64,
            Arch::Arm64 | Arch::Arm64V8 | Arch::Arm64e | Arch::Arm64Unknown => CpuFamily::Arm64,
            Arch::Arm
            | Arch::ArmV5
            | Arch::ArmV6
            | Arch::ArmV6m
            | Arch::ArmV7
            | Arch::ArmV7f
            | Arch::ArmV7s
            | Arch::ArmV7k
            | Arch::ArmV7m
            | Arch::ArmV7em
            | Arch::ArmUnknown => CpuFamily::Arm32,
            Arch::Ppc => CpuFamily::Ppc32,
            Arch::Ppc64 => CpuFamily::Ppc64,
            Arch::Mips => CpuFamily::Mips32,
            Arch::Mips64 => CpuFamily::Mips64,
            Arch::Arm64_32 | Arch::Arm64_32V8 | Arch::Arm64_32Unknown => CpuFamily::Arm64_32,
        }
    }

    /// Returns the canonical name of this architecture.
    ///
    /// ```
    /// use symbolic_common::Arch;
    ///
    /// assert_eq!(Arch::Amd64.name(), "x86_64");
    /// ```
    pub fn name(self) -> &'static str {
        match self {
            Arch::Unknown => "unknown",
            Arch::X86 => "x86",
            Arch::X86Unknown => "x86_unknown",
            Arch::Amd64 => "x86_64",
            Arch::Amd64h => "x86_64h",
            Arch::Amd64Unknown => "x86_64_unknown",
            Arch::Arm64 => "arm64",
            Arch::Arm64V8 => "arm64v8",
            Arch::Arm64e => "arm64e",
            Arch::Arm64Unknown => "arm64_unknown",
            Arch::Arm => "arm",
            Arch::ArmV5 => "armv5",
            Arch::ArmV6 => "armv6",
            Arch::ArmV6m => "armv6m",
            Arch::ArmV7 => "armv7",
            Arch::ArmV7f => "armv7f",
            Arch::ArmV7s => "armv7s",
            Arch::ArmV7k => "armv7k",
            Arch::ArmV7m => "armv7m",
            Arch::ArmV7em => "armv7em",
            Arch::ArmUnknown => "arm_unknown",
            Arch::Ppc => "ppc",
            Arch::Ppc64 => "ppc64",
            Arch::Mips => "mips",
            Arch::Mips64 => "mips64",
            Arch::Arm64_32 => "arm64_32",
            Arch::Arm64_32V8 => "arm64_32_v8",
            Arch::Arm64_32Unknown => "arm64_32_unknown",
        }
    }

    /// Returns whether this architecture is fully known, rather than a family placeholder.
    pub fn well_known(self) -> bool {
        !matches!(
            self,
            Arch::Unknown
                | Arch::ArmUnknown
                | Arch::Arm64Unknown
                | Arch::X86Unknown
                | Arch::Amd64Unknown
                | Arch::Arm64_32Unknown
        )
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl str::FromStr for Arch {
    type Err = UnknownArchError;

    fn from_str(string: &str) -> Result<Arch, UnknownArchError> {
        Ok(match string.to_ascii_lowercase().as_str() {
            "unknown" => Arch::Unknown,
            "i386" | "x86" => Arch::X86,
            "x86_unknown" => Arch::X86Unknown,
            "x86_64" | "amd64" | "x86-64" => Arch::Amd64,
            "x86_64h" => Arch::Amd64h,
            "x86_64_unknown" => Arch::Amd64Unknown,
            "arm64" | "aarch64" | "arm-64" => Arch::Arm64,
            "arm64v8" => Arch::Arm64V8,
            "arm64e" => Arch::Arm64e,
            "arm64_unknown" => Arch::Arm64Unknown,
            "arm" => Arch::Arm,
            "armv5" => Arch::ArmV5,
            "armv6" => Arch::ArmV6,
            "armv6m" => Arch::ArmV6m,
            "armv7" => Arch::ArmV7,
            "armv7f" => Arch::ArmV7f,
            "armv7s" => Arch::ArmV7s,
            "armv7k" => Arch::ArmV7k,
            "armv7m" => Arch::ArmV7m,
            "armv7em" => Arch::ArmV7em,
            "arm_unknown" => Arch::ArmUnknown,
            "ppc" => Arch::Ppc,
            "ppc64" => Arch::Ppc64,
            "mips" => Arch::Mips,
            "mips64" => Arch::Mips64,
            "arm64_32" => Arch::Arm64_32,
            "arm64_32_v8" => Arch::Arm64_32V8,
            "arm64_32_unknown" => Arch::Arm64_32Unknown,
            _ => return Err(UnknownArchError),
        })
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Arch {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.name())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Arch {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        <std::borrow::Cow<'_, str>>::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cfi_register_name_none() {
        assert_eq!(CpuFamily::Arm64.cfi_register_name(33), None);
    }

    #[test]
    fn test_arch_roundtrips_through_u32() {
        for arch in [Arch::X86, Arch::Amd64, Arch::ArmV7, Arch::Arm64e, Arch::Mips64] {
            assert_eq!(Arch::from_u32(arch as u32), arch);
        }
        assert_eq!(Arch::from_u32(12345), Arch::Unknown);
    }

    #[test]
    fn test_arch_aliases() {
        assert_eq!("AMD64".parse::<Arch>().unwrap(), Arch::Amd64);
        assert_eq!("i386".parse::<Arch>().unwrap(), Arch::X86);
        assert!("sparc".parse::<Arch>().is_err());
    }

    #[test]
    fn test_context_register_names() {
        assert_eq!(CpuFamily::Intel32.context_register_name("$esp"), "esp");
        assert_eq!(CpuFamily::Arm64.context_register_name("x29"), "fp");
        assert_eq!(CpuFamily::Arm64.context_register_name("x19"), "x19");
        assert_eq!(CpuFamily::Arm32.context_register_name("r14"), "lr");
    }
}
