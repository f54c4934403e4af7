//! Unwind regression harness.
//!
//! Table-driven: every case builds a synthetic process image (stack plus
//! unwind metadata), starts a cursor inside the "leaf" function, unwinds
//! one activation record, and checks that the cursor arrived at the known
//! return site with the expected stack pointer and the expected
//! callee-saved register values.

mod common;

use common::{build_unwind_info, cfi, opcodes, EhFrameBuilder, ImageBuilder, SparseTask};
use crashsite::arch::{arm, x86_64};
use crashsite::macho::SEG_TEXT;
use crashsite::{Arch, Cursor, Error, FrameReader, ImageList, ThreadState};

const SENTINELS_X86_64: &[(u8, u64)] = &[
    (x86_64::RBX, 0x1234_5678_8765_4321),
    (x86_64::R12, 0x0246_8ACE_ECA8_6420),
    (x86_64::R13, 0x1357_9BDF_FDB9_7531),
    (x86_64::R14, 0x1122_3344_5566_7788),
    (x86_64::R15, 0x0022_4466_88AA_CCEE),
];

const IMAGE_BASE: u64 = 0x10_0000;
const LEAF_START: u64 = IMAGE_BASE + 0x100;
const LEAF_IP: u64 = IMAGE_BASE + 0x140;
const TARGET_IP: u64 = IMAGE_BASE + 0x500;
const STACK_BASE: u64 = 0x50_0000;

struct Fixture {
    task: SparseTask,
    images: ImageList,
    start: ThreadState,
    readers: &'static [FrameReader],
    /// Registers the unwound frame must hold, and their values.
    expected_regs: Vec<(u8, u64)>,
    expected_ip: u64,
    expected_sp: u64,
}

fn x86_64_state(sp: u64, sentinels_live: bool) -> ThreadState {
    let mut state = ThreadState::new(Arch::X86_64);
    state.set_ip(LEAF_IP);
    state.set_sp(sp);
    for &(reg, value) in SENTINELS_X86_64 {
        // For restore tests the live values are garbage; the unwinder must
        // bring the sentinels back from the stack.
        state.set(reg, if sentinels_live { value } else { 0xDEAD });
    }
    state
}

/// The 304-byte frameless frame shared by the compact and DWARF scenarios:
/// five callee-saved pushes right below the return address. Returns the
/// post-unwind stack pointer.
fn build_frameless_stack(task: &mut SparseTask) -> u64 {
    // Saved registers at sp + 256, return address at sp + 296.
    let mut words = vec![0u64; 304 / 8];
    for (i, &(_, value)) in SENTINELS_X86_64.iter().enumerate() {
        words[256 / 8 + i] = value;
    }
    words[296 / 8] = TARGET_IP;
    task.add_words64(STACK_BASE, &words);
    STACK_BASE + 304
}

/// The DWARF program for that same frame: CFA = rsp + 304, rbx..r15 at
/// CFA-48..CFA-16, return address at CFA-8.
fn frameless_eh_frame() -> (Vec<u8>, u32) {
    let mut cie_initial = Vec::new();
    cfi::def_cfa(&mut cie_initial, 7, 8);
    cfi::offset(&mut cie_initial, 16, 1);

    let mut instrs = Vec::new();
    cfi::def_cfa_offset(&mut instrs, 304);
    cfi::offset(&mut instrs, 3, 6); // rbx
    cfi::offset(&mut instrs, 12, 5);
    cfi::offset(&mut instrs, 13, 4);
    cfi::offset(&mut instrs, 14, 3);
    cfi::offset(&mut instrs, 15, 2);

    let mut builder = EhFrameBuilder::new();
    let cie = builder.cie(-8, 16, &cie_initial);
    let fde = builder.fde(cie, LEAF_START, 0x100, &instrs);
    (builder.finish(), fde)
}

/// Scenario: frame-pointer-only unwind of a small frame. The sentinels are
/// live in the register state and must carry through the step.
fn fp_small_frame() -> Fixture {
    let mut task = SparseTask::new();
    let fp = 0x60_0000u64;
    task.add_words64(fp, &[0x60_0040, TARGET_IP]);
    task.add_words64(0x60_0040, &[0, 0]);

    let mut start = x86_64_state(0x5f_ff80, true);
    start.set_fp(fp);
    Fixture {
        task,
        images: ImageList::new(),
        start,
        readers: &[FrameReader::FramePointer],
        expected_regs: SENTINELS_X86_64.to_vec(),
        expected_ip: TARGET_IP,
        expected_sp: fp + 16,
    }
}

/// Scenario: frameless compact unwind with a stack subtraction > 256 bytes.
fn compact_frameless_big() -> Fixture {
    let mut task = SparseTask::new();
    let expected_sp = build_frameless_stack(&mut task);

    let opcode = opcodes::frameless_immd(304 / 8, 5, 0);
    let unwind_info = build_unwind_info(&[(0x100, opcode)], 0x1000);
    let image = ImageBuilder::new64(IMAGE_BASE, 0x1000)
        .section(SEG_TEXT, "__unwind_info", IMAGE_BASE + 0x800, unwind_info)
        .build(&mut task, "/test/frameless");
    let images = ImageList::new();
    images.append(image);

    Fixture {
        task,
        images,
        start: x86_64_state(STACK_BASE, false),
        readers: &[FrameReader::CompactUnwind],
        expected_regs: SENTINELS_X86_64.to_vec(),
        expected_ip: TARGET_IP,
        expected_sp,
    }
}

/// Scenario: compact unwind frame-based mode, rbx and r12 stored below the
/// frame pointer.
fn compact_frame_based() -> Fixture {
    let mut task = SparseTask::new();
    let fp = STACK_BASE + 0x100;
    task.add_words64(
        fp - 16,
        &[
            SENTINELS_X86_64[0].1,
            SENTINELS_X86_64[1].1,
            STACK_BASE + 0x200,
            TARGET_IP,
        ],
    );

    let opcode = opcodes::frame_based(2, [1, 2, 0, 0, 0]);
    let unwind_info = build_unwind_info(&[(0x100, opcode)], 0x1000);
    let image = ImageBuilder::new64(IMAGE_BASE, 0x1000)
        .section(SEG_TEXT, "__unwind_info", IMAGE_BASE + 0x800, unwind_info)
        .build(&mut task, "/test/framed");
    let images = ImageList::new();
    images.append(image);

    let mut start = x86_64_state(STACK_BASE, false);
    start.set_fp(fp);
    Fixture {
        task,
        images,
        start,
        readers: &[FrameReader::CompactUnwind],
        expected_regs: SENTINELS_X86_64[..2].to_vec(),
        expected_ip: TARGET_IP,
        expected_sp: fp + 16,
    }
}

/// Scenario: DWARF CFI with `__eh_frame` only (compact unwind disabled via
/// the explicit reader list).
fn dwarf_only() -> Fixture {
    let mut task = SparseTask::new();
    let expected_sp = build_frameless_stack(&mut task);

    let (eh_frame, _) = frameless_eh_frame();
    let image = ImageBuilder::new64(IMAGE_BASE, 0x1000)
        .section(SEG_TEXT, "__eh_frame", IMAGE_BASE + 0xc00, eh_frame)
        .build(&mut task, "/test/dwarf");
    let images = ImageList::new();
    images.append(image);

    Fixture {
        task,
        images,
        start: x86_64_state(STACK_BASE, false),
        readers: &[FrameReader::DwarfCfi],
        expected_regs: SENTINELS_X86_64.to_vec(),
        expected_ip: TARGET_IP,
        expected_sp,
    }
}

/// Scenario: the compact-unwind entry is a DWARF-mode opcode carrying the
/// FDE offset; the DWARF reader finishes the step.
fn compact_defers_to_dwarf() -> Fixture {
    let mut task = SparseTask::new();
    let expected_sp = build_frameless_stack(&mut task);

    let (eh_frame, fde_offset) = frameless_eh_frame();
    let unwind_info = build_unwind_info(&[(0x100, opcodes::dwarf(fde_offset))], 0x1000);
    let image = ImageBuilder::new64(IMAGE_BASE, 0x1000)
        .section(SEG_TEXT, "__unwind_info", IMAGE_BASE + 0x800, unwind_info)
        .section(SEG_TEXT, "__eh_frame", IMAGE_BASE + 0xc00, eh_frame)
        .build(&mut task, "/test/handoff");
    let images = ImageList::new();
    images.append(image);

    Fixture {
        task,
        images,
        start: x86_64_state(STACK_BASE, false),
        readers: &[FrameReader::CompactUnwind],
        expected_regs: SENTINELS_X86_64.to_vec(),
        expected_ip: TARGET_IP,
        expected_sp,
    }
}

/// Scenario: 32-bit ARM frame-pointer walk through r7. The callee-saved
/// sentinels carry through; r7 itself becomes the saved frame pointer.
fn arm_frame_pointer() -> Fixture {
    let mut task = SparseTask::new();
    let fp = 0x30_0000u64;
    task.add_words32(fp, &[0x30_0040, 0x9000_0500]);
    task.add_words32(0x30_0040, &[0, 0]);

    let mut start = ThreadState::new(Arch::Arm);
    start.set_ip(0x9000_0100);
    start.set_sp(0x2f_ff80);
    start.set(arm::R4, 0x4444_4444);
    start.set(arm::R5, 0x5555_5555);
    start.set(arm::R6, 0x6666_6666);
    start.set(arm::R7, fp);
    start.set(arm::R8, 0x8888_8888);
    start.set(arm::R10, 0xAAAA_AAAA);
    start.set(arm::R11, 0xBBBB_BBBB);

    Fixture {
        task,
        images: ImageList::new(),
        start,
        readers: &[FrameReader::FramePointer],
        expected_regs: vec![
            (arm::R4, 0x4444_4444),
            (arm::R5, 0x5555_5555),
            (arm::R6, 0x6666_6666),
            (arm::R7, 0x30_0040),
            (arm::R8, 0x8888_8888),
            (arm::R10, 0xAAAA_AAAA),
            (arm::R11, 0xBBBB_BBBB),
        ],
        expected_ip: 0x9000_0500,
        expected_sp: fp + 8,
    }
}

fn run_case(name: &str, fixture: Fixture) {
    let Fixture {
        task,
        images,
        start,
        readers,
        expected_regs,
        expected_ip,
        expected_sp,
    } = fixture;

    let mut cursor = Cursor::new(&task, &images, start);
    let frame0 = cursor
        .next_with_readers(readers)
        .unwrap_or_else(|e| panic!("{name}: frame 0 failed: {e}"))
        .unwrap_or_else(|| panic!("{name}: no frame 0"));
    assert_eq!(frame0.ip().unwrap(), start.ip().unwrap(), "{name}: frame 0 ip");

    let frame1 = cursor
        .next_with_readers(readers)
        .unwrap_or_else(|e| panic!("{name}: unwind step failed: {e}"))
        .unwrap_or_else(|| panic!("{name}: stack ended prematurely"));

    assert_eq!(frame1.ip().unwrap(), expected_ip, "{name}: restored ip");
    assert_eq!(frame1.sp().unwrap(), expected_sp, "{name}: restored sp");

    let arch = frame1.arch();
    for (reg, value) in expected_regs {
        let reg_name = arch.reg_name(reg).unwrap();
        let got = frame1
            .get(reg)
            .unwrap_or_else(|_| panic!("{name}: {reg_name} unset"));
        assert_eq!(got, value, "{name}: register {reg_name}");
    }
}

#[test]
fn unwind_test_harness() {
    let cases: &[(&str, fn() -> Fixture)] = &[
        ("frame-pointer small frame", fp_small_frame),
        ("compact frameless big frame", compact_frameless_big),
        ("compact frame-based", compact_frame_based),
        ("dwarf only", dwarf_only),
        ("compact defers to dwarf", compact_defers_to_dwarf),
        ("arm frame pointer", arm_frame_pointer),
    ];
    for (name, build) in cases {
        run_case(name, build());
    }
}

#[test]
fn bad_stack_aborts_with_bad_frame() {
    // The saved frame pointer points below the current stack pointer.
    let mut task = SparseTask::new();
    let fp = 0x60_0000u64;
    task.add_words64(fp, &[0x5f_0000, TARGET_IP]);

    let mut start = x86_64_state(0x5f_ff80, true);
    start.set_fp(fp);

    let images = ImageList::new();
    let mut cursor = Cursor::new(&task, &images, start);
    let readers = [FrameReader::FramePointer];
    cursor.next_with_readers(&readers).unwrap();
    assert_eq!(
        cursor.next_with_readers(&readers).unwrap_err(),
        Error::BadFrame
    );
    // Terminated: no further frames are emitted.
    assert!(cursor.next_with_readers(&readers).unwrap().is_none());
}

#[test]
fn unknown_ip_with_no_image_falls_back_to_frame_pointer() {
    // Default chain: compact and DWARF answer NotFound (no image covers the
    // ip), the frame-pointer walk still recovers the caller.
    let mut task = SparseTask::new();
    let fp = 0x60_0000u64;
    task.add_words64(fp, &[0x60_0040, TARGET_IP]);
    task.add_words64(0x60_0040, &[0, 0]);

    let mut start = x86_64_state(0x5f_ff80, true);
    start.set_fp(fp);

    let images = ImageList::new();
    let mut cursor = Cursor::new(&task, &images, start);
    cursor.next().unwrap();
    let frame1 = cursor.next().unwrap().unwrap();
    assert_eq!(frame1.ip().unwrap(), TARGET_IP);
}
