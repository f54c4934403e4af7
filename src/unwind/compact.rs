//! Compact unwind frame reader.
//!
//! Decodes the 32-bit opcodes found through the two-level `__unwind_info`
//! lookup. The high nibble selects a mode:
//!
//! - frame-based: callee-saved registers were pushed at fixed offsets below
//!   the frame pointer; restore them, then walk the frame pointer pair.
//! - frameless (immediate or indirect): the function subtracted a known
//!   amount from the stack pointer and pushed a permutation of up to six
//!   callee-saved registers right below the return address.
//! - DWARF: the frame was too complicated for the compact encoding; the low
//!   24 bits carry the FDE offset into `__eh_frame` and the DWARF reader
//!   takes over.
//!
//! The frameless register list is packed as a Lehmer code over the six
//! encodable registers; see [`decode_permutation`].

use arrayvec::ArrayVec;

use super::compact_unwind_info::{self, Function, OpcodeBitfield};
use super::dwarf;
use crate::arch::{x86, x86_64};
use crate::error::Error;
use crate::image_list::ImageListReader;
use crate::macho::{MachImage, SEG_TEXT};
use crate::task::TaskMemory;
use crate::thread_state::{Arch, ThreadState};
use crate::unaligned::ByteOrder;

const MODE_RBP_FRAME: u8 = 1;
const MODE_STACK_IMMD: u8 = 2;
const MODE_STACK_IND: u8 = 3;
const MODE_DWARF: u8 = 4;

pub(crate) fn advance<T: TaskMemory + ?Sized>(
    task: &T,
    images: &ImageListReader<'_>,
    state: &ThreadState,
    is_first_frame: bool,
) -> Result<ThreadState, Error> {
    let arch = state.arch();
    if arch == Arch::Arm {
        // Our ARM targets ship no __unwind_info.
        return Err(Error::NotFound);
    }
    let ip = state.ip().map_err(|_| Error::BadFrame)?;
    // For return addresses, look up the call instruction, not the
    // instruction the call will return to.
    let lookup_ip = if is_first_frame { ip } else { ip.saturating_sub(1) };

    let image = images.find_by_address(lookup_ip).ok_or(Error::NotFound)?;
    let section = image.map_section(task, SEG_TEXT, "__unwind_info")?;
    let rel =
        u32::try_from(lookup_ip - image.base()).map_err(|_| Error::InvalidData)?;
    let function = compact_unwind_info::lookup(section.bytes(), rel)?.ok_or(Error::NotFound)?;

    let opcode = OpcodeBitfield::new(function.opcode);
    if opcode.is_null() {
        // Covered by the section but carrying no description; another
        // reader may still describe this frame.
        return Err(Error::NotFound);
    }
    match opcode.kind() {
        MODE_RBP_FRAME => frame_based(task, state, &opcode),
        MODE_STACK_IMMD | MODE_STACK_IND => frameless(task, image, state, &opcode, &function),
        MODE_DWARF => {
            dwarf::advance_with_fde(task, image, state, is_first_frame, opcode.specific_bits())
        }
        _ => Err(Error::InvalidData),
    }
}

fn compact_reg(arch: Arch, regnum: u32) -> Option<u8> {
    match arch {
        Arch::X86_64 => x86_64::compact_unwind_reg(regnum),
        Arch::X86 => x86::compact_unwind_reg(regnum),
        Arch::Arm => None,
    }
}

/// Frame-based mode: five 3-bit register slots in bits 0..15, stored at
/// `fp - ptr * offset` upward; then an ordinary frame-pointer step.
fn frame_based<T: TaskMemory + ?Sized>(
    task: &T,
    state: &ThreadState,
    opcode: &OpcodeBitfield,
) -> Result<ThreadState, Error> {
    let bo = ByteOrder::LittleEndian;
    let arch = state.arch();
    let ps = arch.pointer_size();
    let is_64 = ps == 8;

    let fp = state.fp().map_err(|_| Error::BadFrame)?;
    let registers = opcode.specific_bits() & 0x7fff;
    let offset = (opcode.specific_bits() >> 16) & 0xff;

    let mut out = *state;
    out.clear_volatile();

    let saved_base = fp
        .checked_sub(ps * offset as u64)
        .ok_or(Error::BadFrame)?;
    for slot in 0..5 {
        let regnum = (registers >> (3 * slot)) & 0x7;
        if regnum == 0 {
            continue;
        }
        let reg = compact_reg(arch, regnum).ok_or(Error::InvalidData)?;
        let value = task
            .read_uword(saved_base + ps * slot as u64, is_64, bo)
            .map_err(|_| Error::BadFrame)?;
        out.set(reg, value);
    }

    let saved_fp = task.read_uword(fp, is_64, bo).map_err(|_| Error::BadFrame)?;
    let ret_addr = task
        .read_uword(fp + ps, is_64, bo)
        .map_err(|_| Error::BadFrame)?;
    if ret_addr == 0 {
        return Err(Error::StackEndReached);
    }
    out.set_fp(saved_fp);
    out.set_sp(fp.checked_add(2 * ps).ok_or(Error::BadFrame)?);
    out.set_ip(ret_addr);
    Ok(out)
}

/// Frameless mode: the stack size is either immediate (in pointer-sized
/// words) or read out of the `sub` instruction in the prologue; registers
/// sit in permutation order just below the return address slot.
fn frameless<T: TaskMemory + ?Sized>(
    task: &T,
    image: &MachImage,
    state: &ThreadState,
    opcode: &OpcodeBitfield,
    function: &Function,
) -> Result<ThreadState, Error> {
    let bo = ByteOrder::LittleEndian;
    let arch = state.arch();
    let ps = arch.pointer_size();
    let is_64 = ps == 8;

    let sp = state.sp().map_err(|_| Error::BadFrame)?;
    let bits = opcode.specific_bits();
    let stack_size_field = (bits >> 16) & 0xff;
    let stack_adjust = (bits >> 13) & 0x7;
    let reg_count = (bits >> 10) & 0x7;
    let permutation = bits & 0x3ff;

    let stack_size = if opcode.kind() == MODE_STACK_IMMD {
        stack_size_field as u64 * ps
    } else {
        // Indirect: the field is the offset of the `sub` immediate within
        // the function text.
        let imm_addr = image
            .base()
            .checked_add(function.start_address as u64 + stack_size_field as u64)
            .ok_or(Error::InvalidData)?;
        let imm = task
            .read_u32(imm_addr, bo)
            .map_err(|_| Error::BadFrame)? as u64;
        imm + stack_adjust as u64 * ps
    };
    if stack_size == 0 {
        return Err(Error::InvalidData);
    }

    let order = decode_permutation(reg_count, permutation).ok_or(Error::InvalidData)?;

    let mut out = *state;
    out.clear_volatile();

    let ra_slot = sp
        .checked_add(stack_size)
        .and_then(|v| v.checked_sub(ps))
        .ok_or(Error::BadFrame)?;
    let saved_base = ra_slot
        .checked_sub(ps * reg_count as u64)
        .ok_or(Error::BadFrame)?;
    for (i, regnum) in order.iter().enumerate() {
        let reg = compact_reg(arch, *regnum).ok_or(Error::InvalidData)?;
        let value = task
            .read_uword(saved_base + ps * i as u64, is_64, bo)
            .map_err(|_| Error::BadFrame)?;
        out.set(reg, value);
    }

    let ret_addr = task.read_uword(ra_slot, is_64, bo).map_err(|_| Error::BadFrame)?;
    if ret_addr == 0 {
        return Err(Error::StackEndReached);
    }
    out.set_sp(sp.checked_add(stack_size).ok_or(Error::BadFrame)?);
    out.set_ip(ret_addr);
    Ok(out)
}

/// Decode the frameless-mode register permutation: a Lehmer code over the
/// six encodable registers, with only as many digits as registers saved.
/// Returns compact register numbers (1..=6) in push order.
pub(crate) fn decode_permutation(count: u32, mut permutation: u32) -> Option<ArrayVec<u32, 6>> {
    let mut permunreg = [0u32; 6];
    match count {
        6 | 5 => {
            permunreg[0] = permutation / 120;
            permutation %= 120;
            permunreg[1] = permutation / 24;
            permutation %= 24;
            permunreg[2] = permutation / 6;
            permutation %= 6;
            permunreg[3] = permutation / 2;
            permutation %= 2;
            permunreg[4] = permutation;
            // The sixth register is the only one left.
            permunreg[5] = 0;
        }
        4 => {
            permunreg[0] = permutation / 60;
            permutation %= 60;
            permunreg[1] = permutation / 12;
            permutation %= 12;
            permunreg[2] = permutation / 3;
            permutation %= 3;
            permunreg[3] = permutation;
        }
        3 => {
            permunreg[0] = permutation / 20;
            permutation %= 20;
            permunreg[1] = permutation / 4;
            permutation %= 4;
            permunreg[2] = permutation;
        }
        2 => {
            permunreg[0] = permutation / 5;
            permutation %= 5;
            permunreg[1] = permutation;
        }
        1 => {
            permunreg[0] = permutation;
        }
        0 => {}
        _ => return None,
    }

    let mut used = [false; 7];
    let mut regs = ArrayVec::new();
    for &index in permunreg.iter().take(count as usize) {
        let mut remaining = index;
        let mut regnum = 0u32;
        for candidate in 1..=6u32 {
            if used[candidate as usize] {
                continue;
            }
            if remaining == 0 {
                regnum = candidate;
                break;
            }
            remaining -= 1;
        }
        if regnum == 0 {
            return None;
        }
        used[regnum as usize] = true;
        regs.push(regnum);
    }
    Some(regs)
}
