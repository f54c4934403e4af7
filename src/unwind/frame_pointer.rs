//! Frame-pointer stack walking.
//!
//! Code compiled with frame pointers stores the caller's frame pointer and
//! the return address next to each other on the stack and points the frame
//! register at that pair. Walking the resulting linked list needs no unwind
//! metadata at all, which is why this reader is the fallback at the end of
//! the chain: it works on any frame, it is just wrong for frameless code.
//!
//! The saved frame pointer being zero is the conventional bottom-of-stack
//! sentinel. A candidate frame pointer below the current stack pointer, or
//! one that fails to move toward the stack base, means the chain is corrupt.

use crate::error::Error;
use crate::task::TaskMemory;
use crate::thread_state::ThreadState;
use crate::unaligned::ByteOrder;

pub(crate) fn advance<T: TaskMemory + ?Sized>(
    task: &T,
    state: &ThreadState,
) -> Result<ThreadState, Error> {
    // The supported targets are all little-endian.
    let bo = ByteOrder::LittleEndian;
    let arch = state.arch();
    let ptr_size = arch.pointer_size();

    let fp = state.fp().map_err(|_| Error::BadFrame)?;
    let sp = state.sp().map_err(|_| Error::BadFrame)?;
    if fp == 0 {
        return Err(Error::StackEndReached);
    }
    if fp < sp {
        return Err(Error::BadFrame);
    }

    // Two pointer-sized words at fp: the saved frame pointer and the return
    // address.
    let is_64 = ptr_size == 8;
    let ret_addr_slot = fp.checked_add(ptr_size).ok_or(Error::BadFrame)?;
    let saved_fp = task.read_uword(fp, is_64, bo).map_err(|_| Error::BadFrame)?;
    let ret_addr = task
        .read_uword(ret_addr_slot, is_64, bo)
        .map_err(|_| Error::BadFrame)?;

    if saved_fp == 0 {
        return Err(Error::StackEndReached);
    }
    // Frames must walk toward the stack base.
    if saved_fp <= fp {
        return Err(Error::BadFrame);
    }
    if ret_addr == 0 {
        return Err(Error::StackEndReached);
    }
    let new_sp = fp.checked_add(2 * ptr_size).ok_or(Error::BadFrame)?;

    let mut out = *state;
    out.clear_volatile();
    out.set_fp(saved_fp);
    out.set_sp(new_sp);
    out.set_ip(ret_addr);
    Ok(out)
}
