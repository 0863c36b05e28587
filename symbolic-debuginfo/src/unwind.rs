//! Normalized stack unwinding information.
//!
//! Every container format stores call frame information differently. Parsers convert their
//! sections into [`UnwindTable`]s: one table per function or covered code range, describing how
//! to recover the caller's registers at every address in that range.

use std::fmt;

/// The kind of section an [`UnwindTable`] was read from.
///
/// When several sources describe the same code range, the variants earlier in this list are
/// more precise and take precedence.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum UnwindSource {
    /// Apple compact unwind encoding in `__unwind_info`.
    CompactUnwind,
    /// DWARF `.debug_frame`.
    DebugFrame,
    /// DWARF `.eh_frame`, the exception handling variant of call frame information.
    EhFrame,
    /// PDB `FrameData` streams describing x86 frames on Windows.
    PdbFrameData,
    /// PE `.pdata` / `.xdata` unwind codes on Windows x64.
    PeUnwind,
    /// Breakpad `STACK CFI` records.
    Breakpad,
}

impl UnwindSource {
    /// Returns the rank of this source. Lower ranks win over higher ones.
    pub fn priority(self) -> u8 {
        self as u8
    }

    /// Returns the name of this source.
    pub fn name(self) -> &'static str {
        match self {
            UnwindSource::CompactUnwind => "compact_unwind",
            UnwindSource::DebugFrame => "debug_frame",
            UnwindSource::EhFrame => "eh_frame",
            UnwindSource::PdbFrameData => "pdb_frame_data",
            UnwindSource::PeUnwind => "pe_unwind",
            UnwindSource::Breakpad => "breakpad",
        }
    }
}

impl fmt::Display for UnwindSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How to compute the canonical frame address (CFA) of a frame.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum CfaRule {
    /// The CFA is the value of a register plus a signed offset.
    RegisterAndOffset {
        /// DWARF register number.
        register: u16,
        /// Offset added to the register's value.
        offset: i64,
    },
    /// The CFA is computed by a DWARF expression.
    Expression(Vec<u8>),
}

/// How to recover the caller's value of one register.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum RegisterRule {
    /// The value cannot be recovered.
    Undefined,
    /// The register was not modified by the callee.
    SameValue,
    /// The value is stored in memory at `CFA + offset`.
    Offset(i64),
    /// The value is `CFA + offset` itself.
    ValOffset(i64),
    /// The value is stored in another register.
    Register(u16),
    /// The value is stored at the address computed by a DWARF expression.
    Expression(Vec<u8>),
    /// The value is computed by a DWARF expression.
    ValExpression(Vec<u8>),
    /// The value is defined by the architecture's ABI.
    Architectural,
}

/// The unwind rules in effect from `address` up to the next row.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnwindRow {
    /// Absolute start address of this row.
    pub address: u64,
    /// How to compute the CFA.
    pub cfa: CfaRule,
    /// Rules for the registers this row restores, keyed by DWARF register number.
    pub registers: Vec<(u16, RegisterRule)>,
}

/// Rules describing one code range.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UnwindRules {
    /// Structured rows in DWARF terms, used by all binary unwind formats after normalization.
    Rows {
        /// The DWARF register holding the return address.
        return_address_register: u16,
        /// Rows sorted by address, the first one starting at the table's address.
        rows: Vec<UnwindRow>,
    },
    /// Rules already expressed in Breakpad's postfix syntax.
    Postfix {
        /// Rules in effect at the start of the range, e.g. `.cfa: $rsp 8 + .ra: .cfa -8 + ^`.
        init: String,
        /// Additional rules taking effect at the given absolute addresses.
        deltas: Vec<(u64, String)>,
    },
}

/// Unwind information for one contiguous code range.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnwindTable {
    /// The section this table was read from.
    pub source: UnwindSource,
    /// Absolute start address of the covered range.
    pub address: u64,
    /// Size of the covered range in bytes.
    pub size: u64,
    /// The rules for this range.
    pub rules: UnwindRules,
}

impl UnwindTable {
    /// The end of the covered range, exclusive.
    pub fn end_address(&self) -> u64 {
        self.address.saturating_add(self.size)
    }
}
