//! x86_64 register numbering and ABI tables.

pub const RAX: u8 = 0;
pub const RBX: u8 = 1;
pub const RCX: u8 = 2;
pub const RDX: u8 = 3;
pub const RDI: u8 = 4;
pub const RSI: u8 = 5;
pub const RBP: u8 = 6;
pub const RSP: u8 = 7;
pub const R8: u8 = 8;
pub const R9: u8 = 9;
pub const R10: u8 = 10;
pub const R11: u8 = 11;
pub const R12: u8 = 12;
pub const R13: u8 = 13;
pub const R14: u8 = 14;
pub const R15: u8 = 15;
pub const RIP: u8 = 16;

pub const REG_COUNT: usize = 17;

pub(crate) const IP: u8 = RIP;
pub(crate) const SP: u8 = RSP;
pub(crate) const FP: u8 = RBP;

pub(crate) static NAMES: [&str; REG_COUNT] = [
    "rax", "rbx", "rcx", "rdx", "rdi", "rsi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15", "rip",
];

/// The SysV AMD64 callee-preserved set, plus the frame registers themselves.
pub(crate) static CALLEE_SAVED: &[u8] = &[RBX, R12, R13, R14, R15, RBP, RSP, RIP];

/// DWARF register numbering per the System V x86-64 psABI. Column 16 is the
/// return address pseudo-register.
pub(crate) static DWARF: &[(u8, u16)] = &[
    (RAX, 0),
    (RDX, 1),
    (RCX, 2),
    (RBX, 3),
    (RSI, 4),
    (RDI, 5),
    (RBP, 6),
    (RSP, 7),
    (R8, 8),
    (R9, 9),
    (R10, 10),
    (R11, 11),
    (R12, 12),
    (R13, 13),
    (R14, 14),
    (R15, 15),
    (RIP, 16),
];

/// Compact-unwind permutation register numbering (`UNWIND_X86_64_REG_*`).
pub(crate) fn compact_unwind_reg(n: u32) -> Option<u8> {
    match n {
        1 => Some(RBX),
        2 => Some(R12),
        3 => Some(R13),
        4 => Some(R14),
        5 => Some(R15),
        6 => Some(RBP),
        _ => None,
    }
}
