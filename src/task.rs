//! Reading the target task's memory.
//!
//! Every component that inspects the crashed address space goes through
//! [`TaskMemory`] instead of dereferencing raw pointers, for two reasons:
//! reads of corrupt addresses must fail cleanly rather than fault inside the
//! signal handler, and tests need to substitute a synthetic address space.
//!
//! [`CurrentTask`] reads the running process through a memory-read syscall
//! (`process_vm_readv` on Linux, `mach_vm_read_overwrite` on macOS), which
//! validates the range in the kernel. Both are async-signal-safe.

use crate::error::Error;
use crate::unaligned::ByteOrder;

/// A read-only view of some task's virtual memory.
pub trait TaskMemory {
    /// Fill `buf` from `addr`. Either the whole read succeeds or an error is
    /// returned; partial reads are reported as `Error::Access`.
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), Error>;

    fn read_u8(&self, addr: u64) -> Result<u8, Error> {
        let mut buf = [0u8; 1];
        self.read_bytes(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, addr: u64, bo: ByteOrder) -> Result<u16, Error> {
        let mut buf = [0u8; 2];
        self.read_bytes(addr, &mut buf)?;
        Ok(match bo {
            ByteOrder::LittleEndian => u16::from_le_bytes(buf),
            ByteOrder::BigEndian => u16::from_be_bytes(buf),
        })
    }

    fn read_u32(&self, addr: u64, bo: ByteOrder) -> Result<u32, Error> {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf)?;
        Ok(match bo {
            ByteOrder::LittleEndian => u32::from_le_bytes(buf),
            ByteOrder::BigEndian => u32::from_be_bytes(buf),
        })
    }

    fn read_u64(&self, addr: u64, bo: ByteOrder) -> Result<u64, Error> {
        let mut buf = [0u8; 8];
        self.read_bytes(addr, &mut buf)?;
        Ok(match bo {
            ByteOrder::LittleEndian => u64::from_le_bytes(buf),
            ByteOrder::BigEndian => u64::from_be_bytes(buf),
        })
    }

    /// Read one pointer-sized word, widened to u64.
    fn read_uword(&self, addr: u64, is_64: bool, bo: ByteOrder) -> Result<u64, Error> {
        if is_64 {
            self.read_u64(addr, bo)
        } else {
            Ok(self.read_u32(addr, bo)? as u64)
        }
    }

    /// Read a NUL-terminated string into `buf`, truncating if it does not
    /// fit. Returns the initialized prefix. Invalid UTF-8 is replaced
    /// byte-wise so the crash path never fails on a garbled name.
    fn read_cstr<'buf>(&self, addr: u64, buf: &'buf mut [u8]) -> Result<&'buf str, Error> {
        let mut len = 0;
        // Chunked reads: the string may butt up against an unmapped page, so
        // fall back to byte-at-a-time when a whole chunk is unreadable.
        'outer: while len < buf.len() {
            let chunk_len = 32.min(buf.len() - len);
            let chunk = &mut buf[len..len + chunk_len];
            match self.read_bytes(addr + len as u64, chunk) {
                Ok(()) => {
                    if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                        len += nul;
                        break 'outer;
                    }
                    len += chunk_len;
                }
                Err(_) => {
                    for i in 0..chunk_len {
                        let b = self.read_u8(addr + (len + i) as u64)?;
                        if b == 0 {
                            len += i;
                            break 'outer;
                        }
                        buf[len + i] = b;
                    }
                    len += chunk_len;
                }
            }
        }
        match core::str::from_utf8(&buf[..len]) {
            Ok(s) => Ok(s),
            Err(e) => {
                let valid = e.valid_up_to();
                Ok(core::str::from_utf8(&buf[..valid]).unwrap_or(""))
            }
        }
    }
}

impl<T: TaskMemory + ?Sized> TaskMemory for &T {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
        (**self).read_bytes(addr, buf)
    }
}

/// The running process, read through the kernel so that bad addresses fail
/// instead of faulting.
#[derive(Clone, Copy, Default)]
pub struct CurrentTask;

#[cfg(target_os = "linux")]
impl TaskMemory for CurrentTask {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
        if buf.is_empty() {
            return Ok(());
        }
        let local = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: addr as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let n = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
        if n == buf.len() as isize {
            Ok(())
        } else {
            Err(Error::Access)
        }
    }
}

#[cfg(target_os = "macos")]
mod mach {
    use libc::{c_int, c_uint};

    pub type KernReturn = c_int;
    pub type MachPort = c_uint;

    pub const KERN_SUCCESS: KernReturn = 0;

    extern "C" {
        pub static mach_task_self_: MachPort;
        pub fn mach_vm_read_overwrite(
            target_task: MachPort,
            address: u64,
            size: u64,
            data: u64,
            outsize: *mut u64,
        ) -> KernReturn;
    }
}

#[cfg(target_os = "macos")]
impl TaskMemory for CurrentTask {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut outsize: u64 = 0;
        let kr = unsafe {
            mach::mach_vm_read_overwrite(
                mach::mach_task_self_,
                addr,
                buf.len() as u64,
                buf.as_mut_ptr() as u64,
                &mut outsize,
            )
        };
        if kr == mach::KERN_SUCCESS && outsize == buf.len() as u64 {
            Ok(())
        } else {
            Err(Error::Access)
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
impl TaskMemory for CurrentTask {
    fn read_bytes(&self, _addr: u64, _buf: &mut [u8]) -> Result<(), Error> {
        Err(Error::Access)
    }
}
