//! Memory objects: bounds-checked windows over target task memory.
//!
//! A [`MemoryObject`] owns a private mapping populated from a contiguous
//! range of the target task. Addresses from the *target's* address space are
//! translated into reader-visible slices through [`MemoryObject::remap`],
//! which is the only way data leaves the object; raw pointers from one
//! address space never masquerade as pointers in the other.
//!
//! The backing pages come straight from `mmap`, so creating one costs a
//! syscall but never touches the userspace allocator.

use core::ptr;

use zerocopy::{FromBytes, LayoutVerified};

use crate::error::Error;
use crate::task::TaskMemory;

pub struct MemoryObject {
    task_address: u64,
    map_ptr: *mut u8,
    length: usize,
}

// The mapping is private and written only during `new`.
unsafe impl Send for MemoryObject {}
unsafe impl Sync for MemoryObject {}

impl core::fmt::Debug for MemoryObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryObject")
            .field("task_address", &crate::display_utils::HexNum(self.task_address))
            .field("length", &self.length)
            .finish()
    }
}

impl MemoryObject {
    /// Map `length` bytes starting at `task_address` in `task`.
    ///
    /// Fails with `Access` if the range is unmapped or unreadable in the
    /// target, and `Internal` if the local mapping cannot be created.
    pub fn new<T: TaskMemory + ?Sized>(
        task: &T,
        task_address: u64,
        length: u64,
    ) -> Result<Self, Error> {
        let length = usize::try_from(length).map_err(|_| Error::OutOfRange)?;
        if length == 0 {
            return Ok(MemoryObject {
                task_address,
                map_ptr: ptr::null_mut(),
                length: 0,
            });
        }

        let map_ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if map_ptr == libc::MAP_FAILED {
            return Err(Error::Internal);
        }
        let map_ptr = map_ptr as *mut u8;

        let buf = unsafe { core::slice::from_raw_parts_mut(map_ptr, length) };
        if let Err(err) = task.read_bytes(task_address, buf) {
            unsafe {
                libc::munmap(map_ptr as *mut libc::c_void, length);
            }
            return Err(err);
        }

        Ok(MemoryObject {
            task_address,
            map_ptr,
            length,
        })
    }

    /// The base address of the window, in the target's address space.
    pub fn task_address(&self) -> u64 {
        self.task_address
    }

    pub fn len(&self) -> u64 {
        self.length as u64
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The whole window as a local slice.
    pub fn bytes(&self) -> &[u8] {
        if self.length == 0 {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.map_ptr, self.length) }
    }

    /// Translate `[task_address + offset, task_address + offset + length)`
    /// into a local slice, or `None` if any part of the range falls outside
    /// the window. Overflow in the address arithmetic is rejected, never
    /// wrapped.
    pub fn remap(&self, task_address: u64, offset: u64, length: u64) -> Option<&[u8]> {
        let start = task_address.checked_add(offset)?;
        let end = start.checked_add(length)?;
        let window_end = self.task_address.checked_add(self.length as u64)?;
        if start < self.task_address || end > window_end {
            return None;
        }
        let rel = (start - self.task_address) as usize;
        Some(&self.bytes()[rel..rel + length as usize])
    }

    /// Overlay a `#[repr(C)]` structure on the window at a target address.
    pub fn remap_struct<T: FromBytes>(&self, task_address: u64, offset: u64) -> Option<&T> {
        let bytes = self.remap(task_address, offset, core::mem::size_of::<T>() as u64)?;
        Some(LayoutVerified::<&[u8], T>::new(bytes)?.into_ref())
    }
}

impl Drop for MemoryObject {
    fn drop(&mut self) {
        if self.length != 0 {
            unsafe {
                libc::munmap(self.map_ptr as *mut libc::c_void, self.length);
            }
        }
    }
}

/// Overlay helpers for plain mapped byte slices.
pub(crate) trait ReadStruct {
    fn read_at<T: FromBytes>(&self, offset: u64) -> Option<&T>;
    fn read_slice_at<T: FromBytes>(&self, offset: u64, len: usize) -> Option<&[T]>;
}

impl ReadStruct for [u8] {
    fn read_at<T: FromBytes>(&self, offset: u64) -> Option<&T> {
        let offset: usize = offset.try_into().ok()?;
        let end: usize = offset.checked_add(core::mem::size_of::<T>())?;
        let lv = LayoutVerified::<&[u8], T>::new(self.get(offset..end)?)?;
        Some(lv.into_ref())
    }

    fn read_slice_at<T: FromBytes>(&self, offset: u64, len: usize) -> Option<&[T]> {
        let offset: usize = offset.try_into().ok()?;
        let end: usize = offset.checked_add(core::mem::size_of::<T>().checked_mul(len)?)?;
        let lv = LayoutVerified::<&[u8], [T]>::new_slice(self.get(offset..end)?)?;
        Some(lv.into_slice())
    }
}
