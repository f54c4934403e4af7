//! The unwind engine: frame readers and the cursor that drives them.
//!
//! A frame reader turns the register state of one activation record into the
//! register state of its caller. The three readers understand different
//! frame descriptions and are tried in a configurable order; a reader that
//! does not describe the instruction pointer at hand answers
//! [`Error::NotFound`] and the next one gets a chance. The set is closed, so
//! the chain is a tagged enum rather than dynamic dispatch.

mod compact;
pub mod compact_unwind_info;
mod cursor;
mod dwarf;
mod frame_pointer;

pub use cursor::{Cursor, DEFAULT_READERS, MAX_FRAME_DEPTH};
pub use dwarf::StoreOnStack;

use crate::error::Error;
use crate::image_list::ImageListReader;
use crate::task::TaskMemory;
use crate::thread_state::ThreadState;

/// The frame-description formats we can walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameReader {
    /// Follow the linked list of saved frame pointers.
    FramePointer,
    /// Decode the image's `__unwind_info` entry for the instruction pointer.
    CompactUnwind,
    /// Run the DWARF CFI program from the image's `__eh_frame`.
    DwarfCfi,
}

impl FrameReader {
    /// Produce the caller's register state.
    ///
    /// `is_first_frame` distinguishes a precise fault address from a return
    /// address: return addresses point one instruction past the call, so
    /// unwind-info lookups for them use `ip - 1`.
    pub fn advance<T: TaskMemory + ?Sized>(
        &self,
        task: &T,
        images: &ImageListReader<'_>,
        state: &ThreadState,
        is_first_frame: bool,
    ) -> Result<ThreadState, Error> {
        match self {
            FrameReader::FramePointer => frame_pointer::advance(task, state),
            FrameReader::CompactUnwind => compact::advance(task, images, state, is_first_frame),
            FrameReader::DwarfCfi => dwarf::advance(task, images, state, is_first_frame),
        }
    }
}
