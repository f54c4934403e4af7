//! 32-bit ARM register numbering and ABI tables.
//!
//! The frame pointer is r7, per the iOS ARM function call convention.

pub const R0: u8 = 0;
pub const R1: u8 = 1;
pub const R2: u8 = 2;
pub const R3: u8 = 3;
pub const R4: u8 = 4;
pub const R5: u8 = 5;
pub const R6: u8 = 6;
pub const R7: u8 = 7;
pub const R8: u8 = 8;
pub const R9: u8 = 9;
pub const R10: u8 = 10;
pub const R11: u8 = 11;
pub const R12: u8 = 12;
pub const SP: u8 = 13;
pub const LR: u8 = 14;
pub const PC: u8 = 15;

pub const REG_COUNT: usize = 16;

pub(crate) const IP: u8 = PC;
pub(crate) const FP: u8 = R7;

pub(crate) static NAMES: [&str; REG_COUNT] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp", "lr",
    "pc",
];

pub(crate) static CALLEE_SAVED: &[u8] = &[R4, R5, R6, R7, R8, R10, R11];

/// DWARF numbering per "DWARF for the ARM Architecture" (ARM IHI 0040B):
/// the core registers map straight through.
pub(crate) static DWARF: &[(u8, u16)] = &[
    (R0, 0),
    (R1, 1),
    (R2, 2),
    (R3, 3),
    (R4, 4),
    (R5, 5),
    (R6, 6),
    (R7, 7),
    (R8, 8),
    (R9, 9),
    (R10, 10),
    (R11, 11),
    (R12, 12),
    (SP, 13),
    (LR, 14),
    (PC, 15),
];
