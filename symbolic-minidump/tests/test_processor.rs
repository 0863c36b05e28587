use std::collections::BTreeMap;

use proptest::prelude::*;
use similar_asserts::assert_eq;

use symbolic_cfi::CfiCache;
use symbolic_common::{Arch, ErrorKind};
use symbolic_debuginfo::{OwnedObject, UnwindRules, UnwindSource, UnwindTable};
use symbolic_minidump::processor::{
    process, process_snapshot, process_snapshot_with_config, CallStack, CodeModule, CodeModuleId,
    ExceptionInfo, FrameInfoMap, FrameTrust, MemoryBlock, PrewalkedFrame, ProcessResult,
    ProcessSnapshot, RegVal, SystemInfo, ThreadSnapshot, WalkerConfig,
};
use symbolic_testutils::{fixture_debug_id, setup_logging};

const MODULE_BASE: u64 = 0x10000;
const STACK_BASE: u64 = 0x8000;

/// Unwind rules of a function that has not set up a frame.
const LEAF_RULES: &str = ".cfa: $rsp 8 + .ra: .cfa -8 + ^";

/// A stack with a frame pointer chain through two frames of `main`.
///
/// ```text
/// 0x8000  0x10350  return address into main, as seen by CFI
/// 0x8010  0x8040   saved frame pointer
/// 0x8018  0x10360  return address into main, as seen by the frame pointer
/// 0x8040  0        end of the frame pointer chain
/// 0x8048  0x10370  return address into main
/// ```
const STACK_WORDS: [u64; 16] = [
    0x10350, 0, 0x8040, 0x10360, 0, 0, 0, 0, 0, 0x10370, 0, 0, 0, 0, 0, 0,
];

fn module_id() -> CodeModuleId {
    CodeModuleId::from(fixture_debug_id())
}

fn module() -> CodeModule {
    CodeModule::new(MODULE_BASE, 0x1000)
        .with_id(module_id())
        .with_code_file("/usr/lib/libcrash.so")
        .with_debug_file("libcrash.so")
}

/// Builds a CFI cache with the given module relative tables.
fn cfi_cache(tables: &[(u64, u64, &str)]) -> CfiCache<'static> {
    let mut object = OwnedObject::new(Arch::Amd64, fixture_debug_id());
    for &(address, size, init) in tables {
        object.add_unwind_table(UnwindTable {
            source: UnwindSource::Breakpad,
            address,
            size,
            rules: UnwindRules::Postfix {
                init: init.to_owned(),
                deltas: Vec::new(),
            },
        });
    }

    CfiCache::from_object(&object).unwrap()
}

fn frame_infos(tables: &[(u64, u64, &str)]) -> FrameInfoMap {
    let mut frame_infos = FrameInfoMap::new();
    frame_infos.register(module_id(), cfi_cache(tables));
    frame_infos
}

fn registers(values: &[(&str, u64)]) -> BTreeMap<String, u64> {
    values
        .iter()
        .map(|&(name, value)| (name.to_owned(), value))
        .collect()
}

fn amd64_thread(thread_id: u32, rbp: u64, words: &[u64]) -> ThreadSnapshot {
    ThreadSnapshot {
        thread_id,
        context: Some(registers(&[
            ("rip", 0x10150),
            ("rsp", STACK_BASE),
            ("rbp", rbp),
        ])),
        stack: Some(MemoryBlock::from_words(STACK_BASE, words, 8)),
        prewalked: None,
    }
}

fn amd64_snapshot(threads: Vec<ThreadSnapshot>) -> ProcessSnapshot {
    ProcessSnapshot {
        timestamp: 1_700_000_000,
        system_info: SystemInfo::new(Arch::Amd64).with_os("Linux", "5.10.0", "#1 SMP"),
        threads,
        modules: vec![module()],
        ..ProcessSnapshot::default()
    }
}

fn walk(snapshot: &ProcessSnapshot, frame_infos: &FrameInfoMap) -> CallStack {
    setup_logging();
    let state = process_snapshot(snapshot, frame_infos).unwrap();
    state.threads()[0].clone()
}

fn trusts(stack: &CallStack) -> Vec<FrameTrust> {
    stack.frames().iter().map(|frame| frame.trust()).collect()
}

fn stack_pointers(stack: &CallStack, name: &str) -> Vec<u64> {
    stack
        .frames()
        .iter()
        .map(|frame| frame.registers()[name].value())
        .collect()
}

fn render(stack: &CallStack) -> String {
    stack
        .frames()
        .iter()
        .map(|frame| {
            let sp = frame.registers().get("rsp").map_or(0, |value| value.value());
            format!(
                "{:#x} {} sp={:#x}",
                frame.instruction(),
                frame.trust().name(),
                sp
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[test]
fn test_cfi_preferred_over_frame_pointer() {
    let snapshot = amd64_snapshot(vec![amd64_thread(1, 0x8010, &STACK_WORDS)]);
    let stack = walk(&snapshot, &frame_infos(&[(0x100, 0x100, LEAF_RULES)]));

    insta::assert_snapshot!(render(&stack), @r###"
    0x10150 context sp=0x8000
    0x1034f cfi sp=0x8008
    0x1035f fp sp=0x8020
    0x1036f fp sp=0x8050
    "###);

    // the callee saved frame pointer survives the CFI frame
    assert_eq!(stack.frames()[1].registers()["rbp"], RegVal::U64(0x8010));
    assert_eq!(stack.frames()[1].return_address(), 0x10350);
    assert_eq!(
        stack.frames()[1].module().map(|m| m.code_file()),
        Some("/usr/lib/libcrash.so")
    );
}

#[test]
fn test_frame_pointer_without_cfi() {
    let snapshot = amd64_snapshot(vec![amd64_thread(1, 0x8010, &STACK_WORDS)]);
    let stack = walk(&snapshot, &FrameInfoMap::new());

    assert_eq!(
        trusts(&stack),
        [FrameTrust::Context, FrameTrust::FP, FrameTrust::FP]
    );
    assert_eq!(stack_pointers(&stack, "rsp"), [0x8000, 0x8020, 0x8050]);
    assert_eq!(stack.frames()[2].registers()["rbp"], RegVal::U64(0));
}

#[test]
fn test_scan_without_cfi_and_frame_pointer() {
    let snapshot = amd64_snapshot(vec![amd64_thread(1, 0, &STACK_WORDS)]);
    let stack = walk(&snapshot, &FrameInfoMap::new());

    insta::assert_snapshot!(render(&stack), @r###"
    0x10150 context sp=0x8000
    0x1034f scan sp=0x8008
    0x1035f scan sp=0x8020
    0x1036f scan sp=0x8050
    "###);
}

#[test]
fn test_cfi_scan() {
    // only `main` has unwind information, the leaf function does not
    let snapshot = amd64_snapshot(vec![amd64_thread(1, 0, &STACK_WORDS)]);
    let stack = walk(&snapshot, &frame_infos(&[(0x340, 0x40, LEAF_RULES)]));

    // `main` returns to a null address, which ends the stack
    assert_eq!(trusts(&stack), [FrameTrust::Context, FrameTrust::CFIScan]);
    assert_eq!(stack.frames()[1].instruction(), 0x1034f);
}

#[test]
fn test_cfi_without_stack_progress() {
    let snapshot = amd64_snapshot(vec![amd64_thread(1, 0, &STACK_WORDS)]);
    let stack = walk(
        &snapshot,
        &frame_infos(&[(0x100, 0x100, ".cfa: $rsp 0 + .ra: .cfa ^")]),
    );

    assert_eq!(stack.frames()[1].trust(), FrameTrust::Scan);
    assert_eq!(stack_pointers(&stack, "rsp")[..2].to_vec(), [0x8000, 0x8008]);
}

#[test]
fn test_frame_pointer_self_loop() {
    let mut words = [0; 16];
    words[2] = 0x8010;
    words[3] = 0x10360;

    let snapshot = amd64_snapshot(vec![amd64_thread(1, 0x8010, &words)]);
    let stack = walk(&snapshot, &FrameInfoMap::new());

    assert_eq!(trusts(&stack), [FrameTrust::Context, FrameTrust::Scan]);
    assert_eq!(stack_pointers(&stack, "rsp"), [0x8000, 0x8020]);
}

#[test]
fn test_consecutive_scan_limit() {
    let words = [0x10350; 64];
    let snapshot = amd64_snapshot(vec![amd64_thread(1, 0, &words)]);
    let stack = walk(&snapshot, &FrameInfoMap::new());

    let config = WalkerConfig::default();
    assert_eq!(stack.frames().len(), 1 + config.max_consecutive_scan_frames);
    assert!(stack.frames()[1..]
        .iter()
        .all(|frame| frame.trust() == FrameTrust::Scan));
}

#[test]
fn test_scan_at_end_of_address_space() {
    let top = u64::MAX - 7;
    let thread = ThreadSnapshot {
        thread_id: 1,
        context: Some(registers(&[("rip", 0x10150), ("rsp", top), ("rbp", 0)])),
        stack: Some(MemoryBlock::from_words(top, &[0x10350], 8)),
        prewalked: None,
    };

    let snapshot = amd64_snapshot(vec![thread]);
    let stack = walk(&snapshot, &FrameInfoMap::new());
    assert_eq!(trusts(&stack), [FrameTrust::Context]);
}

#[test]
fn test_frame_limit() {
    let words = [0x10350; 64];
    let snapshot = amd64_snapshot(vec![amd64_thread(1, 0, &words)]);
    let config = WalkerConfig {
        max_frames: 5,
        ..WalkerConfig::default()
    };

    let state = process_snapshot_with_config(&snapshot, &FrameInfoMap::new(), &config).unwrap();
    assert_eq!(state.threads()[0].frames().len(), 5);
}

#[test]
fn test_x86_frame_pointer() {
    let words = [0, 0, 0, 0x10360, 0, 0, 0, 0];
    let snapshot = ProcessSnapshot {
        system_info: SystemInfo::new(Arch::X86),
        threads: vec![ThreadSnapshot {
            thread_id: 1,
            context: Some(registers(&[
                ("eip", 0x10150),
                ("esp", STACK_BASE),
                ("ebp", 0x8008),
            ])),
            stack: Some(MemoryBlock::from_words(STACK_BASE, &words, 4)),
            prewalked: None,
        }],
        modules: vec![module()],
        ..ProcessSnapshot::default()
    };

    let stack = walk(&snapshot, &FrameInfoMap::new());
    assert_eq!(trusts(&stack), [FrameTrust::Context, FrameTrust::FP]);
    assert_eq!(stack.frames()[1].registers()["esp"], RegVal::U32(0x8010));
    assert_eq!(stack.frames()[1].registers()["esp"].to_string(), "0x00008010");
}

#[test]
fn test_broken_threads_do_not_abort() {
    let mut missing_context = amd64_thread(1, 0, &STACK_WORDS);
    missing_context.context = None;

    let mut missing_ip = amd64_thread(2, 0, &STACK_WORDS);
    missing_ip.context = Some(registers(&[("rsp", STACK_BASE)]));

    let mut missing_stack = amd64_thread(3, 0x8010, &STACK_WORDS);
    missing_stack.stack = None;

    let healthy = amd64_thread(4, 0x8010, &STACK_WORDS);

    let snapshot = amd64_snapshot(vec![missing_context, missing_ip, missing_stack, healthy]);
    let state = process_snapshot(&snapshot, &FrameInfoMap::new()).unwrap();

    let lengths: Vec<_> = state
        .threads()
        .iter()
        .map(|thread| (thread.thread_id(), thread.frames().len()))
        .collect();
    assert_eq!(lengths, [(1, 0), (2, 0), (3, 1), (4, 3)]);
}

#[test]
fn test_unknown_cpu() {
    let mut snapshot = amd64_snapshot(vec![amd64_thread(1, 0x8010, &STACK_WORDS)]);
    snapshot.system_info = SystemInfo::new(Arch::Unknown);

    let state = process_snapshot(&snapshot, &FrameInfoMap::new()).unwrap();
    assert_eq!(state.threads().len(), 1);
    assert!(state.threads()[0].frames().is_empty());
}

#[test]
fn test_prewalked_frames() {
    let mut thread = amd64_thread(1, 0, &STACK_WORDS);
    thread.prewalked = Some(vec![
        PrewalkedFrame {
            instruction: 0x1034f,
            registers: registers(&[("rip", 0x10350)]),
        },
        PrewalkedFrame {
            instruction: 0x20000,
            registers: BTreeMap::new(),
        },
    ]);

    let stack = walk(&amd64_snapshot(vec![thread]), &FrameInfoMap::new());

    assert_eq!(
        trusts(&stack),
        [
            FrameTrust::Context,
            FrameTrust::Prewalked,
            FrameTrust::Prewalked
        ]
    );
    assert_eq!(stack.frames()[1].return_address(), 0x10350);
    assert!(stack.frames()[1].module().is_some());
    assert_eq!(stack.frames()[2].return_address(), 0x20000);
    assert!(stack.frames()[2].module().is_none());
}

#[test]
fn test_crash_information() {
    let mut snapshot = amd64_snapshot(vec![
        amd64_thread(7, 0x8010, &STACK_WORDS),
        amd64_thread(9, 0x8010, &STACK_WORDS),
    ]);
    snapshot.modules.push(CodeModule::new(0x40000, 0x1000).with_code_file("unused.so"));
    snapshot.exception = Some(ExceptionInfo {
        thread_id: 9,
        reason: "SIGSEGV".into(),
        address: 0x10,
    });
    snapshot.assertion = Some("x > 0 in function main, in file main.c at line 4".into());

    let state = process_snapshot(&snapshot, &FrameInfoMap::new()).unwrap();

    assert!(state.crashed());
    assert_eq!(state.requesting_thread(), 1);
    assert_eq!(state.crash_reason(), "SIGSEGV");
    assert_eq!(state.crash_address(), 0x10);
    assert_eq!(state.timestamp(), 1_700_000_000);
    assert_eq!(
        state.assertion(),
        "x > 0 in function main, in file main.c at line 4"
    );
    assert_eq!(state.system_info().os_name(), "Linux");
    assert_eq!(state.modules().len(), 2);

    let referenced: Vec<_> = state
        .referenced_modules()
        .into_iter()
        .map(|module| module.code_file())
        .collect();
    assert_eq!(referenced, ["/usr/lib/libcrash.so"]);
}

#[test]
fn test_no_crash() {
    let state = process_snapshot(&amd64_snapshot(Vec::new()), &FrameInfoMap::new()).unwrap();

    assert!(!state.crashed());
    assert_eq!(state.requesting_thread(), -1);
    assert_eq!(state.crash_reason(), "");
    assert_eq!(state.crash_address(), 0);
    assert_eq!(state.assertion(), "");
}

#[test]
fn test_duplicate_requesting_threads() {
    let mut snapshot = amd64_snapshot(vec![
        amd64_thread(3, 0, &STACK_WORDS),
        amd64_thread(3, 0, &STACK_WORDS),
    ]);
    snapshot.requesting_thread_id = Some(3);

    let error = process_snapshot(&snapshot, &FrameInfoMap::new()).unwrap_err();
    assert_eq!(error.kind(), ProcessResult::DuplicateRequestingThreads);
    assert_eq!(error.coarse_kind(), ErrorKind::CorruptedSnapshot);
}

#[test]
fn test_process_empty_minidump() {
    let error = process(&[], &FrameInfoMap::new()).unwrap_err();
    assert_eq!(error.kind(), ProcessResult::MinidumpNotFound);
    assert_eq!(error.coarse_kind(), ErrorKind::CorruptedSnapshot);
}

#[test]
fn test_process_corrupt_header() {
    let error = process(b"this is not a minidump at all, not even close", &FrameInfoMap::new())
        .unwrap_err();
    assert_eq!(error.kind(), ProcessResult::NoMinidumpHeader);
    assert_eq!(error.coarse_kind(), ErrorKind::CorruptedSnapshot);
}

fn arb_word() -> impl Strategy<Value = u64> {
    prop_oneof![
        Just(0u64),
        (MODULE_BASE..MODULE_BASE + 0x1000),
        (STACK_BASE..STACK_BASE + 0x200),
        any::<u64>(),
    ]
}

proptest! {
    #[test]
    fn proptest_walk_terminates(
        words in prop::collection::vec(arb_word(), 0..64),
        rbp in arb_word(),
        rip in arb_word(),
        with_cfi in any::<bool>(),
    ) {
        let mut thread = amd64_thread(1, rbp, &words);
        if let Some(context) = thread.context.as_mut() {
            context.insert("rip".into(), rip);
        }

        let snapshot = amd64_snapshot(vec![thread]);
        let frame_infos = if with_cfi {
            frame_infos(&[(0x0, 0x1000, LEAF_RULES)])
        } else {
            FrameInfoMap::new()
        };
        let config = WalkerConfig { max_frames: 64, ..WalkerConfig::default() };

        let state = process_snapshot_with_config(&snapshot, &frame_infos, &config).unwrap();
        let stack = &state.threads()[0];
        prop_assert!(stack.frames().len() <= 64);

        let sps = stack_pointers(stack, "rsp");
        prop_assert!(sps.windows(2).all(|pair| pair[0] < pair[1]));
    }
}
