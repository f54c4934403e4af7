//! The buffered output descriptor.
//!
//! The report accumulates in a buffer sized when the reporter is enabled;
//! the buffer's capacity is the hard ceiling on report size. Overflow drops
//! the excess and reports `NoMemory` — a truncated report is still flushed,
//! because a partial report beats no report. Flushing is plain `write(2)`
//! against the pre-opened descriptor, the only file operation permitted on
//! the crash path.

use std::os::unix::io::RawFd;

use crate::debug_log::debug_log;
use crate::error::Error;
use crate::writer::proto::ProtoSink;

pub const DEFAULT_CAPACITY: usize = 64 * 1024;

pub struct BufferedFile {
    fd: RawFd,
    buf: Box<[u8]>,
    len: usize,
    truncated: bool,
}

impl BufferedFile {
    /// Allocate the output buffer. Called at enable time, never from the
    /// signal handler.
    pub fn new(fd: RawFd, capacity: usize) -> Self {
        BufferedFile {
            fd,
            buf: vec![0; capacity].into_boxed_slice(),
            len: 0,
            truncated: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contents(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Append to the buffer. The prefix that fits is kept on overflow, and
    /// the overflow is reported as `NoMemory`.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let avail = self.buf.len() - self.len;
        if bytes.len() > avail {
            self.buf[self.len..].copy_from_slice(&bytes[..avail]);
            self.len = self.buf.len();
            if !self.truncated {
                self.truncated = true;
                debug_log!("report exceeded the {} byte output ceiling", self.buf.len());
            }
            return Err(Error::NoMemory);
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// Push the buffered report to the descriptor and fsync it.
    pub fn flush(&mut self) -> Result<(), Error> {
        let mut written = 0;
        while written < self.len {
            let n = unsafe {
                libc::write(
                    self.fd,
                    self.buf[written..].as_ptr() as *const libc::c_void,
                    self.len - written,
                )
            };
            if n < 0 {
                let errno = std::io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(0);
                if errno == libc::EINTR {
                    continue;
                }
                return Err(Error::Internal);
            }
            written += n as usize;
        }
        if unsafe { libc::fsync(self.fd) } != 0 {
            return Err(Error::Internal);
        }
        Ok(())
    }
}

impl ProtoSink for BufferedFile {
    fn push(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.write(bytes)
    }
}
