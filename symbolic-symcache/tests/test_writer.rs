use symbolic_common::{Arch, Language, Name};
use symbolic_debuginfo::{FileInfo, Function, FunctionBuilder, OwnedObject};
use symbolic_symcache::{FilesDebug, FunctionsDebug, SymCache, SymCacheConverter};
use symbolic_testutils::{fixture_debug_id, inline_object, overlapping_object, setup_logging};

use similar_asserts::assert_eq;

fn build(object: &OwnedObject) -> Vec<u8> {
    let mut converter = SymCacheConverter::new();
    converter.process_object(object).unwrap();

    let mut buffer = Vec::new();
    converter.serialize(&mut buffer).unwrap();
    buffer
}

/// Renders the inline hierarchy at `addr`, innermost first.
fn render(symcache: &SymCache<'_>, addr: u64) -> String {
    symcache
        .lookup(addr)
        .map(|location| {
            let file = location
                .file()
                .map(|file| file.full_path())
                .unwrap_or_else(|| "<unknown>".into());
            format!(
                "{} at {}:{} (depth {}, symbol {:#x}, line {:#x})",
                location.function().name(),
                file,
                location.line(),
                location.inline_depth(),
                location.symbol_address(),
                location.line_address(),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn names(symcache: &SymCache<'_>, addr: u64) -> Vec<String> {
    symcache
        .lookup(addr)
        .map(|location| location.function().name().to_owned())
        .collect()
}

fn lines(symcache: &SymCache<'_>, addr: u64) -> Vec<u32> {
    symcache.lookup(addr).map(|location| location.line()).collect()
}

#[test]
fn test_inline_lookup() {
    setup_logging();
    let buffer = build(&inline_object());
    let symcache = SymCache::parse(&buffer).unwrap();

    assert_eq!(names(&symcache, 0x1015), ["g", "f"]);
    assert_eq!(names(&symcache, 0x1005), ["f"]);
    assert!(names(&symcache, 0x2000).is_empty());

    insta::assert_snapshot!(render(&symcache, 0x1015), @r###"
    g at /build/src/util.h:3 (depth 1, symbol 0x1010, line 0x1010)
    f at /build/src/main.c:11 (depth 0, symbol 0x1000, line 0x1010)
    "###);
}

#[test]
fn test_every_address() {
    let buffer = build(&inline_object());
    let symcache = SymCache::parse(&buffer).unwrap();

    for addr in 0x1000..0x1050 {
        let expected: &[u32] = match addr {
            0x1000..=0x100f => &[10],
            0x1010..=0x1017 => &[3, 11],
            0x1018..=0x101f => &[4, 11],
            0x1020..=0x103f => &[12],
            _ => &[13],
        };
        assert_eq!(lines(&symcache, addr), expected, "at {addr:#x}");
        assert_eq!(names(&symcache, addr).last().map(String::as_str), Some("f"));
    }

    assert!(names(&symcache, 0xfff).is_empty());
    assert!(names(&symcache, 0x1050).is_empty());
    assert!(names(&symcache, u64::MAX).is_empty());
}

#[test]
fn test_functions_and_files() {
    let buffer = build(&inline_object());
    let symcache = SymCache::parse(&buffer).unwrap();

    let functions: Vec<_> = symcache
        .functions()
        .map(|function| (function.name(), function.entry_pc()))
        .collect();
    assert_eq!(functions, [("f", 0x1000), ("g", 0x1010)]);
    assert!(symcache
        .functions()
        .all(|function| function.language() == Language::Unknown));

    assert_eq!(
        format!("{:?}", FilesDebug(&symcache)),
        "/build/src/main.c\n/build/src/util.h\n"
    );
    assert_eq!(format!("{:?}", FunctionsDebug(&symcache)).lines().count(), 2);
}

#[test]
fn test_overlapping_functions() {
    let buffer = build(&overlapping_object());
    let symcache = SymCache::parse(&buffer).unwrap();

    // the smaller function splits the larger one
    assert_eq!(names(&symcache, 0x2000), ["outer"]);
    assert_eq!(names(&symcache, 0x2050), ["inner"]);
    assert_eq!(lines(&symcache, 0x2050), [7]);
    assert_eq!(names(&symcache, 0x2070), ["outer"]);
    assert_eq!(lines(&symcache, 0x2070), [1]);

    // symbols only fill gaps
    assert_eq!(names(&symcache, 0x2150), ["exported"]);
    assert_eq!(lines(&symcache, 0x2150), [0]);
    assert_eq!(names(&symcache, 0x4010), ["lonely"]);
    assert!(names(&symcache, 0x2200).is_empty());

    insta::assert_snapshot!(render(&symcache, 0x2070), @"outer at src/outer.c:1 (depth 0, symbol 0x2000, line 0x2060)");
    insta::assert_snapshot!(render(&symcache, 0x2150), @"exported at <unknown>:0 (depth 0, symbol 0x2000, line 0x2100)");
}

#[test]
fn test_identical_ranges_tie_break() {
    let buffer = build(&overlapping_object());
    let symcache = SymCache::parse(&buffer).unwrap();

    // `twin_b` was inserted first, but the lexicographically smaller name wins
    assert_eq!(names(&symcache, 0x3008), ["twin_a"]);
}

#[test]
fn test_deterministic_output() {
    for object in [inline_object(), overlapping_object()] {
        assert_eq!(build(&object), build(&object));
    }
}

#[test]
fn test_explicit_load_address() {
    let mut converter = SymCacheConverter::new();
    converter.process_object(&inline_object()).unwrap();
    converter.set_load_address(0x1000);

    let mut buffer = Vec::new();
    converter.serialize(&mut buffer).unwrap();
    let symcache = SymCache::parse(&buffer).unwrap();

    assert_eq!(symcache.load_address(), 0x1000);
    assert_eq!(names(&symcache, 0x1015), ["g", "f"]);
    assert_eq!(
        symcache.functions().map(|f| f.entry_pc()).collect::<Vec<_>>(),
        [0x0, 0x10]
    );
}

#[test]
fn test_zero_sized_line_record() {
    let file = FileInfo::new(&b"h.c"[..], &b"src"[..]);
    let mut builder = FunctionBuilder::new(Name::from("h"), &b""[..], 0x1000, 0x20);
    builder.add_leaf_line(0x1000, Some(0), file.clone(), 5);
    builder.add_leaf_line(0x1010, None, file, 6);

    let mut object = OwnedObject::new(Arch::Amd64, fixture_debug_id());
    object.add_function(builder.finish());

    let buffer = build(&object);
    let symcache = SymCache::parse(&buffer).unwrap();

    assert_eq!(lines(&symcache, 0x1000), [5]);
    assert_eq!(lines(&symcache, 0x1004), [5]);
    assert_eq!(lines(&symcache, 0x1010), [6]);
}

fn inlined(
    name: &'static str,
    address: u64,
    size: u64,
    inlinees: Vec<Function<'static>>,
) -> Function<'static> {
    Function {
        address,
        size,
        name: Name::from(name),
        compilation_dir: Default::default(),
        lines: Vec::new(),
        inlinees,
        inline: true,
    }
}

#[test]
fn test_overlapping_sibling_inlinees() {
    // `b` overlaps its sibling `a`, but is listed after the later child of `a`
    let mut outer = inlined(
        "outer",
        0x1000,
        0x100,
        vec![
            inlined("a", 0x1000, 0x40, vec![inlined("a1", 0x1020, 0x10, vec![])]),
            inlined("b", 0x1010, 0x10, vec![inlined("b1", 0x1010, 0x08, vec![])]),
        ],
    );
    outer.inline = false;

    let mut object = OwnedObject::new(Arch::Amd64, fixture_debug_id());
    object.add_function(outer);

    let buffer = build(&object);
    let symcache = SymCache::parse(&buffer).unwrap();

    assert_eq!(names(&symcache, 0x1014), ["b1", "b", "outer"]);
    assert_eq!(names(&symcache, 0x1024), ["a1", "a", "outer"]);
    assert_eq!(names(&symcache, 0x1038), ["a", "outer"]);
}
