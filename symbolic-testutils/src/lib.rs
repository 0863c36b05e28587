//! Test helpers for `symbolic`.
//!
//! Instead of binary fixtures on disk, the helpers here assemble small objects in memory. Each
//! one mirrors a situation the cache builders need to handle and is shared between the tests of
//! several crates.
#![warn(missing_docs)]

use std::sync::Once;

use symbolic_common::{Arch, DebugId, Name};
use symbolic_debuginfo::{
    CfaRule, FileInfo, FunctionBuilder, OwnedObject, RegisterRule, Symbol, UnwindRow,
    UnwindRules, UnwindSource, UnwindTable,
};

/// The debug identifier of all fixture objects.
pub const FIXTURE_DEBUG_ID: &str = "3249d99d-0c40-4931-8610-f4e4fb0b6936-1";

/// Installs a `tracing` subscriber that writes to the test output.
///
/// The filter can be changed with `RUST_LOG`. Calling this more than once is harmless.
///
/// ```
/// symbolic_testutils::setup_logging();
/// tracing::trace!("visible with RUST_LOG=trace");
/// ```
pub fn setup_logging() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// Returns the debug identifier shared by all fixture objects.
pub fn fixture_debug_id() -> DebugId {
    FIXTURE_DEBUG_ID.parse().unwrap()
}

fn file(name: &'static str) -> FileInfo<'static> {
    FileInfo::new(name.as_bytes(), &b"src"[..])
}

/// An object with one function `f` at `[0x1000, 0x1050)` that has `g` inlined at
/// `[0x1010, 0x1020)`.
///
/// ```text
/// 0x1000 f  main.c:10
/// 0x1010 g  util.h:3   inlined into f at main.c:11
/// 0x1018 g  util.h:4   inlined into f at main.c:11
/// 0x1020 f  main.c:12
/// 0x1040 f  main.c:13
/// ```
pub fn inline_object() -> OwnedObject {
    let mut builder = FunctionBuilder::new(Name::from("f"), &b"/build"[..], 0x1000, 0x50);
    builder.add_inlinee(0, Name::from("g"), 0x1010, 0x10, file("main.c"), 11);
    builder.add_leaf_line(0x1000, Some(0x10), file("main.c"), 10);
    builder.add_leaf_line(0x1010, Some(0x08), file("util.h"), 3);
    builder.add_leaf_line(0x1018, Some(0x08), file("util.h"), 4);
    builder.add_leaf_line(0x1020, Some(0x20), file("main.c"), 12);
    builder.add_leaf_line(0x1040, Some(0x10), file("main.c"), 13);

    let mut object = OwnedObject::new(Arch::Amd64, fixture_debug_id());
    object.add_function(builder.finish());
    object
}

/// An object whose debug information and symbol table overlap.
///
/// - `outer` covers `[0x2000, 0x2100)` and is split by the smaller `inner` at
///   `[0x2040, 0x2060)`, which comes from a different compilation unit.
/// - `twin_a` and `twin_b` claim the identical range `[0x3000, 0x3010)`.
/// - The public symbol `exported` covers `[0x2000, 0x2200)`, so only its tail past `outer` is
///   visible. The symbol `lonely` at `0x4000` has no debug information at all.
pub fn overlapping_object() -> OwnedObject {
    let mut object = OwnedObject::new(Arch::Amd64, fixture_debug_id());

    let mut outer = FunctionBuilder::new(Name::from("outer"), &b""[..], 0x2000, 0x100);
    outer.add_leaf_line(0x2000, Some(0x100), file("outer.c"), 1);
    object.add_function(outer.finish());

    let mut inner = FunctionBuilder::new(Name::from("inner"), &b""[..], 0x2040, 0x20);
    inner.add_leaf_line(0x2040, Some(0x20), file("inner.c"), 7);
    object.add_function(inner.finish());

    // inserted in reverse name order, the result must not depend on it
    for name in ["twin_b", "twin_a"] {
        let mut twin = FunctionBuilder::new(Name::from(name), &b""[..], 0x3000, 0x10);
        twin.add_leaf_line(0x3000, Some(0x10), file("twin.c"), 1);
        object.add_function(twin.finish());
    }

    object.add_symbol(Symbol {
        name: Some("exported".into()),
        address: 0x2000,
        size: 0x200,
    });
    object.add_symbol(Symbol {
        name: Some("lonely".into()),
        address: 0x4000,
        size: 0x40,
    });

    object
}

fn cfa_row(address: u64, offset: i64) -> UnwindRow {
    UnwindRow {
        address,
        cfa: CfaRule::RegisterAndOffset {
            register: 7,
            offset,
        },
        registers: vec![(16, RegisterRule::Offset(-8))],
    }
}

/// An x86_64 object with unwind information from DWARF CFI and compact unwinding.
///
/// - `.eh_frame` describes `[0x1000, 0x1100)`: `.cfa = $rsp + 8` at the entry, and
///   `.cfa = $rsp + 16` from `0x1001` after `push rbp`.
/// - `.debug_frame` and compact unwind both describe `[0x2000, 0x2010)` with different offsets.
/// - `.eh_frame` additionally describes the broad range `[0x2000, 0x2100)`.
pub fn unwind_object() -> OwnedObject {
    let mut object = OwnedObject::new(Arch::Amd64, fixture_debug_id());

    object.add_unwind_table(UnwindTable {
        source: UnwindSource::EhFrame,
        address: 0x1000,
        size: 0x100,
        rules: UnwindRules::Rows {
            return_address_register: 16,
            rows: vec![cfa_row(0x1000, 8), cfa_row(0x1001, 16)],
        },
    });

    object.add_unwind_table(UnwindTable {
        source: UnwindSource::EhFrame,
        address: 0x2000,
        size: 0x100,
        rules: UnwindRules::Rows {
            return_address_register: 16,
            rows: vec![cfa_row(0x2000, 8)],
        },
    });

    object.add_unwind_table(UnwindTable {
        source: UnwindSource::DebugFrame,
        address: 0x2000,
        size: 0x10,
        rules: UnwindRules::Rows {
            return_address_register: 16,
            rows: vec![cfa_row(0x2000, 24)],
        },
    });

    object.add_unwind_table(UnwindTable {
        source: UnwindSource::CompactUnwind,
        address: 0x2000,
        size: 0x10,
        rules: UnwindRules::Rows {
            return_address_register: 16,
            rows: vec![cfa_row(0x2000, 32)],
        },
    });

    object
}
