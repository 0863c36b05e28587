use std::collections::HashMap;
use std::io::Write;
use std::ops::Range;

use symbolic_common::{write_uleb128, Arch, CpuFamily, RangeClaims, StringTable};
use symbolic_debuginfo::{
    CfaRule, ObjectLike, RegisterRule, UnwindRow, UnwindRules, UnwindSource, UnwindTable,
};
use symbolic_unwind::parsing::rules_complete;
use symbolic_unwind::Register;
use watto::{Pod, Writer};

use crate::raw;
use crate::rules::RuleSet;
use crate::{source_tag, CfiError, CfiErrorKind, CFICACHE_LATEST_VERSION};

/// Rules for one unwind table, in postfix notation.
#[derive(Clone, Debug, Default)]
struct Program {
    /// Rules in effect at the start of the table.
    init: String,
    /// Changed rules taking effect at the given absolute addresses, sorted by address.
    deltas: Vec<(u64, String)>,
}

impl Program {
    /// Returns the program for the fragment `range` of this table.
    ///
    /// Deltas before the fragment are folded into its initial rules.
    fn clip(&self, range: &Range<u64>) -> Program {
        let mut init = RuleSet::parse(&self.init);
        let mut deltas = Vec::new();

        for (address, rules) in &self.deltas {
            if *address <= range.start {
                init.apply(rules);
            } else if *address < range.end {
                deltas.push((*address, rules.clone()));
            }
        }

        Program {
            init: init.to_string(),
            deltas,
        }
    }
}

#[derive(Debug)]
struct Table {
    source: UnwindSource,
    range: Range<u64>,
    program: Program,
}

/// Converts unwind tables of an object into the CfiCache format.
#[derive(Debug)]
pub(crate) struct CfiConverter {
    arch: Arch,
    load_address: u64,
    tables: Vec<Table>,
}

impl CfiConverter {
    pub(crate) fn new(arch: Arch, load_address: u64) -> Result<Self, CfiError> {
        match arch.cpu_family() {
            CpuFamily::Intel32
            | CpuFamily::Amd64
            | CpuFamily::Arm32
            | CpuFamily::Arm64
            | CpuFamily::Arm64_32
            | CpuFamily::Mips32
            | CpuFamily::Mips64 => Ok(Self {
                arch,
                load_address,
                tables: Vec::new(),
            }),
            _ => Err(CfiErrorKind::UnsupportedArch.into()),
        }
    }

    #[tracing::instrument(level = "trace", name = "CfiConverter::process_object", skip_all)]
    pub(crate) fn process_object<'d, 'o, O>(&mut self, object: &'o O) -> Result<(), CfiError>
    where
        O: ObjectLike<'d, 'o>,
        O::Error: std::error::Error + Send + Sync + 'static,
    {
        if !object.has_unwind_info() {
            return Err(CfiErrorKind::MissingDebugInfo.into());
        }

        for table in object.unwind_tables() {
            let table = table.map_err(|e| CfiError::new(CfiErrorKind::BadDebugInfo, e))?;
            self.process_table(&table)?;
        }

        if self.tables.is_empty() {
            return Err(CfiErrorKind::MissingDebugInfo.into());
        }

        Ok(())
    }

    pub(crate) fn process_table(&mut self, table: &UnwindTable) -> Result<(), CfiError> {
        if table.size == 0 {
            return Ok(());
        }

        // Entries below the load address seem to indicate that the table is no longer valid.
        // Skip them, the rest of the file may still be usable.
        if table.address < self.load_address {
            tracing::debug!(
                source = %table.source,
                address = %format_args!("{:#x}", table.address),
                "skipping unwind table below the load address"
            );
            return Ok(());
        }

        let range = table.address..table.end_address();
        if range.end - self.load_address > u64::from(u32::MAX) {
            return Err(CfiError::new(
                CfiErrorKind::ValueTooLarge,
                format!("unwind table at {:#x} out of range", table.address),
            ));
        }

        let program = match &table.rules {
            UnwindRules::Rows {
                return_address_register,
                rows,
            } => self.convert_rows(&range, *return_address_register, rows)?,
            UnwindRules::Postfix { init, deltas } => convert_postfix(&range, init, deltas)?,
        };

        self.tables.push(Table {
            source: table.source,
            range,
            program,
        });

        Ok(())
    }

    fn convert_rows(
        &self,
        range: &Range<u64>,
        ra: u16,
        rows: &[UnwindRow],
    ) -> Result<Program, CfiError> {
        check_addresses(range, rows.iter().map(|row| row.address))?;

        let family = self.arch.cpu_family();

        // Every register rule in the table will be cached so that it can be compared with
        // subsequent occurrences. Only registers with changed rules will be written.
        let mut rule_cache: HashMap<u16, &RegisterRule> = HashMap::new();
        let mut cfa_cache = None;
        let mut program = Program::default();

        for (index, row) in rows.iter().enumerate() {
            let mut line = Vec::new();

            if cfa_cache != Some(&row.cfa) {
                cfa_cache = Some(&row.cfa);
                line.push(format_cfa_rule(family, &row.cfa)?);
            }

            let mut ra_written = false;
            for (register, rule) in &row.registers {
                if rule_cache.get(register) == Some(&rule) {
                    continue;
                }

                rule_cache.insert(*register, rule);
                if let Some(formatted) = format_register_rule(family, *register, rule, ra) {
                    ra_written |= *register == ra;
                    line.push(formatted);
                }
            }

            // On MIPS: if no explicit rule was encountered for the return address, recover it
            // from the $ra register.
            if index == 0 && !ra_written && matches!(family, CpuFamily::Mips32 | CpuFamily::Mips64)
            {
                line.push(".ra: $ra".to_owned());
            }

            if index == 0 {
                program.init = line.join(" ");
            } else if !line.is_empty() {
                program.deltas.push((row.address, line.join(" ")));
            }
        }

        Ok(program)
    }

    /// Resolves overlapping tables and writes the cache.
    ///
    /// A smaller table always wins over a larger one covering the same addresses. Tables with
    /// identical sizes are ranked by [`UnwindSource::priority`].
    #[tracing::instrument(level = "trace", name = "CfiConverter::serialize", skip_all)]
    pub(crate) fn serialize<W: Write>(self, writer: &mut W) -> Result<(), CfiError> {
        let fragments = tracing::trace_span!("claim ranges").in_scope(|| {
            let mut claims = RangeClaims::new();
            for (index, table) in self.tables.iter().enumerate() {
                claims.push(table.range.clone(), index);
            }

            claims.resolve_by(|(range_a, a), (range_b, b)| {
                let (a, b) = (&self.tables[*a], &self.tables[*b]);
                (range_a.end - range_a.start)
                    .cmp(&(range_b.end - range_b.start))
                    .then_with(|| a.source.priority().cmp(&b.source.priority()))
                    .then_with(|| range_a.start.cmp(&range_b.start))
            })
        });

        let mut strings = StringTable::new();
        let mut entries = Vec::with_capacity(fragments.len());
        let mut program_bytes = Vec::new();

        for (range, index) in fragments {
            let table = &self.tables[index];
            let program = table.program.clip(&range);

            let program_offset = u32::try_from(program_bytes.len())
                .map_err(|_| CfiError::new(CfiErrorKind::ValueTooLarge, "rule programs"))?;

            write_uleb128(&mut program_bytes, u64::from(insert(&mut strings, &program.init)?));
            write_uleb128(&mut program_bytes, program.deltas.len() as u64);
            let mut previous = range.start;
            for (address, rules) in &program.deltas {
                write_uleb128(&mut program_bytes, address - previous);
                write_uleb128(&mut program_bytes, u64::from(insert(&mut strings, rules)?));
                previous = *address;
            }

            entries.push(raw::Entry {
                start: self.relative(range.start)?,
                end: self.relative(range.end)?,
                program_offset,
                source: source_tag(table.source),
            });
        }

        let string_bytes = strings.into_bytes();
        let header = raw::Header {
            magic: raw::CFICACHE_MAGIC,
            version: CFICACHE_LATEST_VERSION,
            arch: self.arch as u32,
            num_entries: count(entries.len())?,
            program_bytes: count(program_bytes.len())?,
            string_bytes: count(string_bytes.len())?,
            load_address: self.load_address,
            _reserved: [0; 8],
        };

        let mut writer = Writer::new(writer);
        write_sections(&mut writer, &header, &entries, &program_bytes, &string_bytes)?;
        Ok(())
    }

    fn relative(&self, address: u64) -> Result<u32, CfiError> {
        u32::try_from(address - self.load_address).map_err(|_| {
            CfiError::new(
                CfiErrorKind::ValueTooLarge,
                format!("address {address:#x} out of range"),
            )
        })
    }
}

fn write_sections<W: Write>(
    writer: &mut Writer<W>,
    header: &raw::Header,
    entries: &[raw::Entry],
    program_bytes: &[u8],
    string_bytes: &[u8],
) -> std::io::Result<()> {
    writer.write_all(header.as_bytes())?;
    writer.align_to(8)?;

    writer.write_all(entries.as_bytes())?;
    writer.align_to(8)?;

    writer.write_all(program_bytes)?;
    writer.align_to(8)?;

    writer.write_all(string_bytes)?;

    Ok(())
}

fn insert(strings: &mut StringTable, rules: &str) -> Result<u32, CfiError> {
    strings
        .insert(rules)
        .map_err(|e| CfiError::new(CfiErrorKind::ValueTooLarge, e))
}

fn count(len: usize) -> Result<u32, CfiError> {
    u32::try_from(len).map_err(|_| CfiError::new(CfiErrorKind::ValueTooLarge, "too many values"))
}

/// Verifies that addresses start within `range`, strictly increase and stay inside it.
fn check_addresses<I>(range: &Range<u64>, addresses: I) -> Result<(), CfiError>
where
    I: IntoIterator<Item = u64>,
{
    let mut previous = None;
    for address in addresses {
        let monotonic = previous.map_or(address >= range.start, |prev| address > prev);
        if !monotonic || address >= range.end {
            return Err(CfiError::new(
                CfiErrorKind::InvalidAddress,
                format!(
                    "unwind row at {address:#x} out of order in {:#x}..{:#x}",
                    range.start, range.end
                ),
            ));
        }
        previous = Some(address);
    }

    if previous.is_none() {
        return Err(CfiError::new(
            CfiErrorKind::BadDebugInfo,
            format!("unwind table at {:#x} has no rows", range.start),
        ));
    }

    Ok(())
}

fn convert_postfix(
    range: &Range<u64>,
    init: &str,
    deltas: &[(u64, String)],
) -> Result<Program, CfiError> {
    let addresses = std::iter::once(range.start).chain(deltas.iter().map(|(addr, _)| *addr));
    check_addresses(range, addresses)?;

    let rules = rules_complete::<u64>(init)
        .map_err(|e| CfiError::new(CfiErrorKind::BadDebugInfo, e))?;
    if !rules.iter().any(|rule| rule.0 == Register::cfa()) {
        return Err(CfiError::new(
            CfiErrorKind::BadDebugInfo,
            format!("missing .cfa rule at {:#x}", range.start),
        ));
    }

    let mut program = Program {
        init: RuleSet::parse(init).to_string(),
        deltas: Vec::with_capacity(deltas.len()),
    };

    for (address, rules) in deltas {
        rules_complete::<u64>(rules).map_err(|e| CfiError::new(CfiErrorKind::BadDebugInfo, e))?;
        let normalized = RuleSet::parse(rules).to_string();
        if !normalized.is_empty() {
            program.deltas.push((*address, normalized));
        }
    }

    Ok(program)
}

fn register_name(family: CpuFamily, register: u16) -> Result<&'static str, CfiError> {
    family.cfi_register_name(register).ok_or_else(|| {
        CfiError::new(
            CfiErrorKind::BadDebugInfo,
            format!("unknown register {register} for {family:?}"),
        )
    })
}

fn format_cfa_rule(family: CpuFamily, rule: &CfaRule) -> Result<String, CfiError> {
    match rule {
        CfaRule::RegisterAndOffset { register, offset } => {
            Ok(format!(".cfa: {} {} +", register_name(family, *register)?, offset))
        }
        CfaRule::Expression(_) => Err(CfiError::new(
            CfiErrorKind::UnsupportedOperation,
            "cfa expressions cannot be expressed as postfix rules",
        )),
    }
}

/// Formats the rule for one register, or `None` if the register cannot be recovered.
fn format_register_rule(
    family: CpuFamily,
    register: u16,
    rule: &RegisterRule,
    ra: u16,
) -> Option<String> {
    let formatted = match rule {
        RegisterRule::Undefined | RegisterRule::Architectural => return None,
        RegisterRule::SameValue => family.cfi_register_name(register)?.to_owned(),
        RegisterRule::Offset(offset) => format!(".cfa {offset} + ^"),
        RegisterRule::ValOffset(offset) => format!(".cfa {offset} +"),
        RegisterRule::Register(other) => family.cfi_register_name(*other)?.to_owned(),
        RegisterRule::Expression(_) | RegisterRule::ValExpression(_) => {
            tracing::trace!(register, "skipping register expression");
            return None;
        }
    };

    // Breakpad requires an explicit name for the return address register. In all other cases,
    // platform specific names are used for each register.
    let name = if register == ra {
        ".ra"
    } else {
        family.cfi_register_name(register)?
    };

    Some(format!("{name}: {formatted}"))
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn row(address: u64, offset: i64, registers: Vec<(u16, RegisterRule)>) -> UnwindRow {
        UnwindRow {
            address,
            cfa: CfaRule::RegisterAndOffset {
                register: 7,
                offset,
            },
            registers,
        }
    }

    #[test]
    fn test_only_changed_rules_are_written() {
        let converter = CfiConverter::new(Arch::Amd64, 0).unwrap();
        let rows = [
            row(0x10, 8, vec![(16, RegisterRule::Offset(-8))]),
            row(0x11, 16, vec![(16, RegisterRule::Offset(-8))]),
            row(
                0x14,
                16,
                vec![(16, RegisterRule::Offset(-8)), (6, RegisterRule::Offset(-16))],
            ),
            row(0x18, 16, vec![(16, RegisterRule::Offset(-8))]),
        ];

        let program = converter.convert_rows(&(0x10..0x20), 16, &rows).unwrap();
        assert_eq!(program.init, ".cfa: $rsp 8 + .ra: .cfa -8 + ^");
        assert_eq!(
            program.deltas,
            [
                (0x11, ".cfa: $rsp 16 +".to_owned()),
                (0x14, "$rbp: .cfa -16 + ^".to_owned()),
            ]
        );
    }

    #[test]
    fn test_mips_return_address() {
        let converter = CfiConverter::new(Arch::Mips, 0).unwrap();
        let rows = [UnwindRow {
            address: 0x10,
            cfa: CfaRule::RegisterAndOffset {
                register: 29,
                offset: 0,
            },
            registers: vec![],
        }];

        let program = converter.convert_rows(&(0x10..0x20), 31, &rows).unwrap();
        assert_eq!(program.init, ".cfa: $sp 0 + .ra: $ra");
    }

    #[test]
    fn test_non_monotonic_rows() {
        let converter = CfiConverter::new(Arch::Amd64, 0).unwrap();
        let rows = [row(0x14, 8, vec![]), row(0x12, 16, vec![])];

        let err = converter.convert_rows(&(0x10..0x20), 16, &rows).unwrap_err();
        assert_eq!(err.kind(), CfiErrorKind::InvalidAddress);

        let rows = [row(0x20, 8, vec![])];
        let err = converter.convert_rows(&(0x10..0x20), 16, &rows).unwrap_err();
        assert_eq!(err.kind(), CfiErrorKind::InvalidAddress);
    }

    #[test]
    fn test_cfa_expression_unsupported() {
        let converter = CfiConverter::new(Arch::Amd64, 0).unwrap();
        let rows = [UnwindRow {
            address: 0x10,
            cfa: CfaRule::Expression(vec![0x77, 0x08]),
            registers: vec![],
        }];

        let err = converter.convert_rows(&(0x10..0x20), 16, &rows).unwrap_err();
        assert_eq!(err.kind(), CfiErrorKind::UnsupportedOperation);
    }

    #[test]
    fn test_register_expression_skipped() {
        assert_eq!(
            format_register_rule(CpuFamily::Amd64, 3, &RegisterRule::Expression(vec![]), 16),
            None
        );
        assert_eq!(
            format_register_rule(CpuFamily::Amd64, 3, &RegisterRule::SameValue, 16).as_deref(),
            Some("$rbx: $rbx")
        );
        assert_eq!(
            format_register_rule(CpuFamily::Arm64, 30, &RegisterRule::Register(30), 30)
                .as_deref(),
            Some(".ra: x30")
        );
    }

    #[test]
    fn test_unsupported_arch() {
        let err = CfiConverter::new(Arch::Unknown, 0).unwrap_err();
        assert_eq!(err.kind(), CfiErrorKind::UnsupportedArch);
    }

    #[test]
    fn test_postfix_validation() {
        let program =
            convert_postfix(&(0x10..0x20), ".cfa: $esp 4 +  .ra: .cfa 4 - ^", &[]).unwrap();
        assert_eq!(program.init, ".cfa: $esp 4 + .ra: .cfa 4 - ^");

        let err = convert_postfix(&(0x10..0x20), ".ra: .cfa 4 - ^", &[]).unwrap_err();
        assert_eq!(err.kind(), CfiErrorKind::BadDebugInfo);

        let err = convert_postfix(&(0x10..0x20), ".cfa: $esp +", &[]).unwrap_err();
        assert_eq!(err.kind(), CfiErrorKind::BadDebugInfo);

        let deltas = [(0x18, "$ebp: .cfa 8 - ^".to_owned()), (0x14, String::new())];
        let err = convert_postfix(&(0x10..0x20), ".cfa: $esp 4 +", &deltas).unwrap_err();
        assert_eq!(err.kind(), CfiErrorKind::InvalidAddress);
    }

    #[test]
    fn test_clip_folds_earlier_deltas() {
        let program = Program {
            init: ".cfa: $rsp 8 + .ra: .cfa -8 + ^".to_owned(),
            deltas: vec![
                (0x11, ".cfa: $rsp 16 +".to_owned()),
                (0x18, "$rbp: .cfa -16 + ^".to_owned()),
            ],
        };

        let clipped = program.clip(&(0x14..0x20));
        assert_eq!(clipped.init, ".cfa: $rsp 16 + .ra: .cfa -8 + ^");
        assert_eq!(clipped.deltas, [(0x18, "$rbp: .cfa -16 + ^".to_owned())]);
    }
}
