//! The frame cursor: one in-flight stack traversal.
//!
//! The cursor owns a pinned image-list snapshot and the current register
//! state, and advances one activation record per `next()` call. The first
//! call yields the incoming state untouched (frame zero is the crash site
//! itself); each later call offers the frame to the configured readers in
//! order and takes the first answer that is not "not my format".
//!
//! Termination is enforced three ways: a reader reports the bottom-of-stack
//! sentinel, the stack pointer stops making progress (the stack would loop),
//! or the traversal hits the hard depth cap.

use fallible_iterator::FallibleIterator;

use crate::error::Error;
use crate::image_list::{ImageList, ImageListReader};
use crate::task::TaskMemory;
use crate::thread_state::ThreadState;

use super::FrameReader;

/// Maximum number of frames a single traversal will produce.
pub const MAX_FRAME_DEPTH: usize = 512;

/// The default reader chain: precise formats first, the frame-pointer walk
/// as the fallback.
pub static DEFAULT_READERS: &[FrameReader] = &[
    FrameReader::CompactUnwind,
    FrameReader::DwarfCfi,
    FrameReader::FramePointer,
];

enum CursorState {
    /// `next()` has not been called; the incoming registers are frame zero.
    Init,
    /// Mid-traversal.
    Stepping,
    /// A terminator was seen; all further calls yield `None`.
    Done,
}

pub struct Cursor<'a, T: TaskMemory + ?Sized> {
    task: &'a T,
    images: ImageListReader<'a>,
    state: CursorState,
    frame: ThreadState,
    depth: usize,
}

impl<'a, T: TaskMemory + ?Sized> Cursor<'a, T> {
    /// Begin a traversal from `state`, which must carry at least an
    /// instruction pointer and a stack pointer.
    pub fn new(task: &'a T, images: &'a ImageList, state: ThreadState) -> Self {
        Cursor {
            task,
            images: images.reader(),
            state: CursorState::Init,
            frame: state,
            depth: 0,
        }
    }

    /// The registers of the most recently yielded frame.
    pub fn frame(&self) -> &ThreadState {
        &self.frame
    }

    /// How many frames have been yielded so far.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Yield the next frame using the default reader chain.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<ThreadState>, Error> {
        self.next_with_readers(DEFAULT_READERS)
    }

    /// Yield the next frame using an explicit reader chain. Readers are
    /// tried in order; `NotFound` moves on to the next reader, the sentinel
    /// ends the traversal cleanly, anything else aborts it.
    pub fn next_with_readers(
        &mut self,
        readers: &[FrameReader],
    ) -> Result<Option<ThreadState>, Error> {
        match self.state {
            CursorState::Init => {
                if !self.frame.has(self.frame.arch().ip_reg()) {
                    self.state = CursorState::Done;
                    return Err(Error::BadFrame);
                }
                self.state = CursorState::Stepping;
                self.depth = 1;
                return Ok(Some(self.frame));
            }
            CursorState::Stepping => {}
            CursorState::Done => return Ok(None),
        }

        if self.depth >= MAX_FRAME_DEPTH {
            self.state = CursorState::Done;
            return Ok(None);
        }

        let is_first_frame = self.depth == 1;
        let mut result = Err(Error::NotFound);
        for reader in readers {
            result = reader.advance(self.task, &self.images, &self.frame, is_first_frame);
            if !matches!(result, Err(Error::NotFound)) {
                break;
            }
        }

        match result {
            Ok(next) => {
                // The stack grows down; walking toward callers must move the
                // stack pointer strictly up or we would loop.
                if let (Ok(old_sp), Ok(new_sp)) = (self.frame.sp(), next.sp()) {
                    if new_sp <= old_sp {
                        self.state = CursorState::Done;
                        return Err(Error::BadFrame);
                    }
                }
                self.frame = next;
                self.depth += 1;
                Ok(Some(next))
            }
            Err(Error::StackEndReached) => {
                self.state = CursorState::Done;
                Ok(None)
            }
            Err(err) => {
                self.state = CursorState::Done;
                Err(err)
            }
        }
    }
}

impl<'a, T: TaskMemory + ?Sized> FallibleIterator for Cursor<'a, T> {
    type Item = ThreadState;
    type Error = Error;

    fn next(&mut self) -> Result<Option<ThreadState>, Error> {
        self.next()
    }
}
