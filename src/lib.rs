//! Async-signal-safe in-process crash reporting.
//!
//! This crate contains the machinery that runs *after* a fatal signal has
//! been delivered: it walks the crashing thread's call stack across
//! heterogeneous frame-description formats (frame pointers, Mach-O compact
//! unwind info, DWARF CFI), restores caller register state one activation
//! record at a time, resolves instruction pointers to Objective-C method
//! identities, and serializes a crash log into a pre-opened file descriptor.
//!
//! Everything on the crash path obeys async-signal rules: no heap
//! allocation, no userspace locks, no stdio. The only blocking operations
//! are memory-read syscalls against the target task and `write`/`fsync`
//! against the pre-opened output descriptor. Buffers are sized when the
//! reporter is enabled, not when the crash happens.
//!
//! The unwinding and parsing code is target-independent: it reads the
//! "crashed" address space through the [`TaskMemory`](task::TaskMemory)
//! seam, so the full pipeline can be exercised against synthetic images on
//! any host. Only live register capture and signal plumbing are gated to the
//! supported targets (x86_64, x86, 32-bit ARM).

mod debug_log;
mod display_utils;
mod error;
#[cfg(test)]
mod testutil;
mod unaligned;

pub mod arch;
pub mod image_list;
pub mod macho;
pub mod mobject;
pub mod objc;
pub mod reporter;
pub mod signal;
pub mod task;
pub mod thread_state;
pub mod unwind;
pub mod writer;

pub use error::Error;
pub use image_list::{Image, ImageList};
pub use unaligned::ByteOrder;
pub use mobject::MemoryObject;
pub use reporter::{Config, ExceptionHandling, ExceptionRecord, Reporter};
pub use task::TaskMemory;
pub use thread_state::{Arch, ThreadState};
pub use unwind::{Cursor, FrameReader};
