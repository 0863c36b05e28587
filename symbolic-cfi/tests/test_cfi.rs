use symbolic_cfi::{CfiCache, CfiErrorKind, CFICACHE_LATEST_VERSION};
use symbolic_common::Arch;
use symbolic_debuginfo::{OwnedObject, UnwindRules, UnwindSource, UnwindTable};
use symbolic_testutils::{fixture_debug_id, setup_logging, unwind_object};
use symbolic_unwind::Register;

use similar_asserts::assert_eq;

type Error = Box<dyn std::error::Error>;

fn render(cache: &CfiCache<'_>) -> String {
    cache
        .entries()
        .map(|entry| entry.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

fn cfa_offset(cache: &CfiCache<'_>, address: u64) -> Option<u64> {
    let program = cache.program_at(address)?;
    let rules = cache.lookup::<u64>(address)?;
    assert_eq!(rules[0].0, Register::cfa(), "{program}");
    program
        .split_whitespace()
        .nth(2)
        .and_then(|offset| offset.parse().ok())
}

#[test]
fn test_cfi_from_object() -> Result<(), Error> {
    setup_logging();
    let cache = CfiCache::from_object(&unwind_object())?;

    assert_eq!(cache.version(), CFICACHE_LATEST_VERSION);
    assert!(cache.is_latest());
    assert_eq!(cache.arch(), Arch::Amd64);

    insta::assert_snapshot!(render(&cache), @r###"
    STACK CFI INIT 1000 100 .cfa: $rsp 8 + .ra: .cfa -8 + ^
    STACK CFI 1001 .cfa: $rsp 16 +
    STACK CFI INIT 2000 10 .cfa: $rsp 32 + .ra: .cfa -8 + ^
    STACK CFI INIT 2010 f0 .cfa: $rsp 8 + .ra: .cfa -8 + ^
    "###);

    Ok(())
}

#[test]
fn test_lookup_applies_deltas() -> Result<(), Error> {
    let cache = CfiCache::from_object(&unwind_object())?;

    assert_eq!(cfa_offset(&cache, 0x1000), Some(8));
    assert_eq!(cfa_offset(&cache, 0x1005), Some(16));
    assert_eq!(cfa_offset(&cache, 0x10ff), Some(16));
    assert_eq!(
        cache.program_at(0x1005).as_deref(),
        Some(".cfa: $rsp 16 + .ra: .cfa -8 + ^")
    );

    let rules = cache.lookup::<u32>(0x1005).unwrap();
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[1].0, Register::ra());

    assert!(cache.lookup::<u64>(0xfff).is_none());
    assert!(cache.lookup::<u64>(0x1100).is_none());
    assert!(cache.lookup::<u64>(0x3000).is_none());
    assert!(cache.lookup::<u64>(u64::MAX).is_none());

    Ok(())
}

#[test]
fn test_conflicting_sources() -> Result<(), Error> {
    let cache = CfiCache::from_object(&unwind_object())?;

    // compact unwind info wins over `.debug_frame` for the same range
    let entry = cache.entry(0x2008).unwrap();
    assert_eq!(entry.source(), UnwindSource::CompactUnwind);
    assert_eq!(cfa_offset(&cache, 0x2008), Some(32));

    // the broader `.eh_frame` table only covers what remains
    let entry = cache.entry(0x2050).unwrap();
    assert_eq!(entry.source(), UnwindSource::EhFrame);
    assert_eq!((entry.start(), entry.end()), (0x2010, 0x2100));
    assert_eq!(cfa_offset(&cache, 0x2050), Some(8));

    Ok(())
}

#[test]
fn test_deterministic_output() -> Result<(), Error> {
    let first = CfiCache::from_object(&unwind_object())?;
    let second = CfiCache::from_object(&unwind_object())?;
    assert_eq!(first.as_slice(), second.as_slice());
    Ok(())
}

#[test]
fn test_roundtrip_bytes() -> Result<(), Error> {
    let cache = CfiCache::from_object(&unwind_object())?;

    let mut buffer = Vec::new();
    cache.write_to(&mut buffer)?;

    let loaded = CfiCache::from_vec(buffer)?;
    assert_eq!(render(&loaded), render(&cache));
    assert_eq!(loaded.program_at(0x1005), cache.program_at(0x1005));
    Ok(())
}

#[test]
fn test_rejects_other_versions() -> Result<(), Error> {
    let cache = CfiCache::from_object(&unwind_object())?;

    let mut buffer = cache.as_slice().to_vec();
    buffer[4..8].copy_from_slice(&(CFICACHE_LATEST_VERSION + 1).to_le_bytes());
    let err = CfiCache::from_vec(buffer).unwrap_err();
    assert_eq!(err.kind(), CfiErrorKind::UnsupportedVersion);
    assert_eq!(err.coarse_kind(), symbolic_common::ErrorKind::MalformedInput);

    let mut buffer = cache.as_slice().to_vec();
    buffer[0..4].reverse();
    let err = CfiCache::from_vec(buffer).unwrap_err();
    assert_eq!(err.kind(), CfiErrorKind::WrongEndianness);

    let buffer = cache.as_slice()[..cache.as_slice().len() - 1].to_vec();
    let err = CfiCache::from_vec(buffer).unwrap_err();
    assert_eq!(err.kind(), CfiErrorKind::InvalidData);

    Ok(())
}

#[test]
fn test_missing_unwind_info() {
    let object = OwnedObject::new(Arch::Amd64, fixture_debug_id());
    let err = CfiCache::from_object(&object).unwrap_err();
    assert_eq!(err.kind(), CfiErrorKind::MissingDebugInfo);
    assert_eq!(err.coarse_kind(), symbolic_common::ErrorKind::Unsupported);
}

#[test]
fn test_postfix_tables() -> Result<(), Error> {
    let mut object = OwnedObject::new(Arch::X86, fixture_debug_id());
    object.set_load_address(0x400000);
    object.add_unwind_table(UnwindTable {
        source: UnwindSource::Breakpad,
        address: 0x401000,
        size: 0x20,
        rules: UnwindRules::Postfix {
            init: ".cfa: $esp 4 + .ra: .cfa 4 - ^".into(),
            deltas: vec![
                (0x401001, ".cfa: $esp 8 + $ebp: .cfa 8 - ^".into()),
                (0x401003, ".cfa: $ebp 8 +".into()),
            ],
        },
    });
    // below the load address, skipped
    object.add_unwind_table(UnwindTable {
        source: UnwindSource::Breakpad,
        address: 0x1000,
        size: 0x20,
        rules: UnwindRules::Postfix {
            init: ".cfa: $esp 4 + .ra: .cfa 4 - ^".into(),
            deltas: vec![],
        },
    });

    let cache = CfiCache::from_object(&object)?;
    assert_eq!(cache.load_address(), 0x400000);
    assert_eq!(cache.entries().count(), 1);
    assert!(cache.lookup::<u32>(0x1000).is_none());

    assert_eq!(
        cache.program_at(0x401010).as_deref(),
        Some(".cfa: $ebp 8 + .ra: .cfa 4 - ^ $ebp: .cfa 8 - ^")
    );
    let rules = cache.lookup::<u32>(0x401010).unwrap();
    assert_eq!(rules.len(), 3);

    Ok(())
}

#[test]
fn test_invalid_postfix_rules() {
    let mut object = OwnedObject::new(Arch::X86, fixture_debug_id());
    object.add_unwind_table(UnwindTable {
        source: UnwindSource::Breakpad,
        address: 0x1000,
        size: 0x20,
        rules: UnwindRules::Postfix {
            init: ".cfa: $esp + + .ra: .cfa 4 - ^".into(),
            deltas: vec![],
        },
    });

    let err = CfiCache::from_object(&object).unwrap_err();
    assert_eq!(err.kind(), CfiErrorKind::BadDebugInfo);
}
