//! DWARF CFI frame reader.
//!
//! Finds the FDE covering the instruction pointer — either by linearly
//! scanning the image's `__eh_frame` section or through an FDE offset handed
//! over by the compact-unwind reader — then evaluates the CIE and FDE
//! programs up to the instruction pointer and applies the resulting rule
//! table: the CFA becomes the new stack pointer, the return-address column
//! becomes the new instruction pointer, and every register column with a
//! rule is restored into the output state.
//!
//! The evaluation scratch space ([`StoreOnStack`]) is fixed-size, so a
//! signal handler can run this without touching the heap.

use gimli::{
    BaseAddresses, CfaRule, CieOrFde, EhFrame, EhFrameOffset, EndianSlice, Evaluation,
    EvaluationResult, EvaluationStorage, Expression, Location, Piece, Reader, Register,
    RegisterRule, RunTimeEndian, UnwindContext, UnwindContextStorage, UnwindSection,
    UnwindTableRow, Value,
};

use crate::error::Error;
use crate::image_list::ImageListReader;
use crate::macho::{MachImage, SEG_TEXT};
use crate::task::TaskMemory;
use crate::thread_state::ThreadState;
use crate::unaligned::ByteOrder;

type R<'a> = EndianSlice<'a, RunTimeEndian>;

/// Fixed-size storage for gimli's unwind context and expression evaluator.
/// Sized for the rule tables the system compilers actually emit.
pub struct StoreOnStack;

impl<Rdr: Reader> UnwindContextStorage<Rdr> for StoreOnStack {
    type Rules = [(Register, RegisterRule<Rdr>); 192];
    type Stack = [UnwindTableRow<Rdr, Self>; 4];
}

impl<Rdr: Reader> EvaluationStorage<Rdr> for StoreOnStack {
    type Stack = [Value; 64];
    type ExpressionStack = [(Rdr, Rdr); 4];
    type Result = [Piece<Rdr>; 1];
}

pub(crate) fn advance<T: TaskMemory + ?Sized>(
    task: &T,
    images: &ImageListReader<'_>,
    state: &ThreadState,
    is_first_frame: bool,
) -> Result<ThreadState, Error> {
    let ip = state.ip().map_err(|_| Error::BadFrame)?;
    let lookup_ip = if is_first_frame { ip } else { ip.saturating_sub(1) };
    let image = images.find_by_address(lookup_ip).ok_or(Error::NotFound)?;
    advance_in_image(task, image, state, is_first_frame, None)
}

/// Entry point for the compact-unwind handoff: the opcode's low 24 bits are
/// the FDE's offset within `__eh_frame`.
pub(crate) fn advance_with_fde<T: TaskMemory + ?Sized>(
    task: &T,
    image: &MachImage,
    state: &ThreadState,
    is_first_frame: bool,
    fde_offset: u32,
) -> Result<ThreadState, Error> {
    advance_in_image(task, image, state, is_first_frame, Some(fde_offset))
}

fn advance_in_image<T: TaskMemory + ?Sized>(
    task: &T,
    image: &MachImage,
    state: &ThreadState,
    is_first_frame: bool,
    fde_offset: Option<u32>,
) -> Result<ThreadState, Error> {
    let arch = state.arch();
    let ip = state.ip().map_err(|_| Error::BadFrame)?;
    let lookup_ip = if is_first_frame { ip } else { ip.saturating_sub(1) };

    let section = image.map_section(task, SEG_TEXT, "__eh_frame")?;
    let endian = match image.byte_order() {
        ByteOrder::LittleEndian => RunTimeEndian::Little,
        ByteOrder::BigEndian => RunTimeEndian::Big,
    };
    let mut eh_frame = EhFrame::from(EndianSlice::new(section.bytes(), endian));
    eh_frame.set_address_size(image.pointer_width() as u8);
    let bases = BaseAddresses::default()
        .set_eh_frame(section.task_address())
        .set_text(image.text_range().start);

    let fde = match fde_offset {
        Some(offset) => eh_frame
            .fde_from_offset(
                &bases,
                EhFrameOffset::from(offset as usize),
                EhFrame::cie_from_offset,
            )
            .map_err(|_| Error::InvalidData)?,
        None => find_fde_linear(&eh_frame, &bases, lookup_ip)?.ok_or(Error::NotFound)?,
    };

    let encoding = fde.cie().encoding();
    let mut ctx: UnwindContext<R<'_>, StoreOnStack> = UnwindContext::new_in();
    let row = fde
        .unwind_info_for_address(&eh_frame, &bases, &mut ctx, lookup_ip)
        .map_err(|_| Error::InvalidData)?;

    let sp_in = state.sp().map_err(|_| Error::BadFrame)?;
    let cfa = match row.cfa() {
        CfaRule::RegisterAndOffset { register, offset } => {
            let reg = arch.reg_from_dwarf(register.0).ok_or(Error::InvalidData)?;
            let base = state.get(reg).map_err(|_| Error::BadFrame)?;
            base.checked_add_signed(*offset).ok_or(Error::BadFrame)?
        }
        CfaRule::Expression(expression) => {
            eval_expression(task, state, expression.clone(), encoding)?
        }
    };
    // A leaf frame may have pushed nothing, but the CFA can never sit below
    // the current stack pointer.
    if cfa < sp_in || cfa == 0 {
        return Err(Error::BadFrame);
    }

    let mut out = *state;
    out.clear_volatile();
    for (register, rule) in row.registers() {
        let Some(reg) = arch.reg_from_dwarf(register.0) else {
            // Columns for registers we do not model (vector, fp) are not
            // needed to produce a backtrace.
            continue;
        };
        match apply_rule(task, state, reg, rule.clone(), cfa, encoding)? {
            Some(value) => out.set(reg, value),
            None => out.clear(reg),
        }
    }
    out.set_sp(cfa);

    let ra_column = fde.cie().return_address_register();
    let ra_reg = arch.reg_from_dwarf(ra_column.0).ok_or(Error::InvalidData)?;
    // No recoverable return address means the frame below is the root.
    let ret_addr = out.get(ra_reg).map_err(|_| Error::StackEndReached)?;
    if ret_addr == 0 {
        return Err(Error::StackEndReached);
    }
    out.set_ip(ret_addr);
    Ok(out)
}

/// Linear `__eh_frame` scan: walk CIEs and FDEs in section order and return
/// the first FDE whose range covers `addr`.
fn find_fde_linear<'a>(
    eh_frame: &EhFrame<R<'a>>,
    bases: &BaseAddresses,
    addr: u64,
) -> Result<Option<gimli::FrameDescriptionEntry<R<'a>>>, Error> {
    let mut cur_cie = None;
    let mut entries = eh_frame.entries(bases);
    while let Some(entry) = entries.next().map_err(|_| Error::InvalidData)? {
        let fde = match entry {
            CieOrFde::Cie(cie) => {
                cur_cie = Some(cie);
                continue;
            }
            CieOrFde::Fde(partial_fde) => partial_fde
                .parse(|eh_frame, bases, cie_offset| {
                    if let Some(cie) = &cur_cie {
                        if cie.offset() == cie_offset.0 {
                            return Ok(cie.clone());
                        }
                    }
                    let cie = eh_frame.cie_from_offset(bases, cie_offset);
                    if let Ok(cie) = &cie {
                        cur_cie = Some(cie.clone());
                    }
                    cie
                })
                .map_err(|_| Error::InvalidData)?,
        };
        let start = fde.initial_address();
        if addr >= start && addr - start < fde.len() {
            return Ok(Some(fde));
        }
    }
    Ok(None)
}

fn apply_rule<T: TaskMemory + ?Sized>(
    task: &T,
    state: &ThreadState,
    reg: u8,
    rule: RegisterRule<R<'_>>,
    cfa: u64,
    encoding: gimli::Encoding,
) -> Result<Option<u64>, Error> {
    let arch = state.arch();
    let is_64 = arch.pointer_size() == 8;
    let bo = ByteOrder::LittleEndian;
    match rule {
        RegisterRule::Undefined => Ok(None),
        RegisterRule::SameValue => Ok(state.get(reg).ok()),
        RegisterRule::Offset(offset) => {
            let location = cfa.checked_add_signed(offset).ok_or(Error::BadFrame)?;
            let value = task
                .read_uword(location, is_64, bo)
                .map_err(|_| Error::BadFrame)?;
            Ok(Some(value))
        }
        RegisterRule::ValOffset(offset) => {
            Ok(Some(cfa.checked_add_signed(offset).ok_or(Error::BadFrame)?))
        }
        RegisterRule::Register(register) => {
            let src = arch.reg_from_dwarf(register.0).ok_or(Error::InvalidData)?;
            Ok(state.get(src).ok())
        }
        RegisterRule::Expression(expression) => {
            let location = eval_expression(task, state, expression, encoding)?;
            let value = task
                .read_uword(location, is_64, bo)
                .map_err(|_| Error::BadFrame)?;
            Ok(Some(value))
        }
        RegisterRule::ValExpression(expression) => {
            Ok(Some(eval_expression(task, state, expression, encoding)?))
        }
        RegisterRule::Architectural => Ok(None),
    }
}

/// Evaluate a DWARF expression on the bounded operand stack. Register reads
/// come from the input state, memory reads from the task. Opcodes outside
/// the storage bounds or unknown to gimli fail with `InvalidData`.
fn eval_expression<T: TaskMemory + ?Sized>(
    task: &T,
    state: &ThreadState,
    expression: Expression<R<'_>>,
    encoding: gimli::Encoding,
) -> Result<u64, Error> {
    let mut eval = Evaluation::<R<'_>, StoreOnStack>::new_in(expression.0, encoding);
    let mut result = eval.evaluate().map_err(|_| Error::InvalidData)?;
    loop {
        match result {
            EvaluationResult::Complete => break,
            EvaluationResult::RequiresRegister { register, .. } => {
                let reg = state
                    .arch()
                    .reg_from_dwarf(register.0)
                    .ok_or(Error::InvalidData)?;
                let value = state.get(reg).map_err(|_| Error::InvalidData)?;
                result = eval
                    .resume_with_register(Value::Generic(value))
                    .map_err(|_| Error::InvalidData)?;
            }
            EvaluationResult::RequiresMemory { address, size, .. } => {
                let mut buf = [0u8; 8];
                let size = (size as usize).min(8);
                task.read_bytes(address, &mut buf[..size])
                    .map_err(|_| Error::BadFrame)?;
                let value = u64::from_le_bytes(buf);
                result = eval
                    .resume_with_memory(Value::Generic(value))
                    .map_err(|_| Error::InvalidData)?;
            }
            _ => return Err(Error::InvalidData),
        }
    }
    let piece = eval.as_result().last().ok_or(Error::InvalidData)?;
    match &piece.location {
        Location::Address { address } => Ok(*address),
        _ => Err(Error::InvalidData),
    }
}
