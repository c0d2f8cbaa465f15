//! Application-level byte buffer.
//!
//! Layout is three regions over one contiguous allocation:
//!
//! ```text
//! | prependable bytes | readable bytes | writable bytes |
//! 0            reader_index      writer_index         len
//! ```
//!
//! The first 8 bytes are a reserved prepend region so a length header can be
//! added in front of queued data without shifting it. A fully drained buffer
//! resets both indices back to the prepend boundary.
//!
//! `read_from_fd` stages a scatter read through a 64 KiB scratch area, so a
//! single `readv` syscall can pull in `writable + 65536` bytes while the
//! steady-state buffer stays small.

use std::io;
use std::os::unix::io::RawFd;

/// Reserved prepend region at the head of the buffer.
pub const CHEAP_PREPEND: usize = 8;

/// Initial writable capacity.
pub const INITIAL_SIZE: usize = 1024;

const SCRATCH_SIZE: usize = 65536;

#[repr(align(64))]
struct Scratch([u8; SCRATCH_SIZE]);

pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
    scratch: Box<Scratch>,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(initial: usize) -> Self {
        Self {
            buf: vec![0; CHEAP_PREPEND + initial],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
            scratch: Box::new(Scratch([0; SCRATCH_SIZE])),
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// View of the readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Consume up to `len` readable bytes. Draining the buffer completely
    /// resets both indices to the prepend boundary.
    pub fn retrieve(&mut self, len: usize) {
        let len = len.min(self.readable_bytes());
        self.reader_index += len;
        if self.reader_index == self.writer_index {
            self.reset_indices();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reset_indices();
    }

    /// Copy out up to `len` readable bytes and consume them.
    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.readable_bytes());
        let out = self.peek()[..len].to_vec();
        self.retrieve(len);
        out
    }

    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let wi = self.writer_index;
        self.buf[wi..wi + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Scatter-read from `fd` into the writable region plus the scratch
    /// area. Overflow beyond the writable region is appended afterwards,
    /// growing the buffer.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let writable = self.writable_bytes();
        let iov = [
            libc::iovec {
                iov_base: unsafe { self.buf.as_mut_ptr().add(self.writer_index) }
                    as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: self.scratch.0.as_mut_ptr() as *mut libc::c_void,
                iov_len: SCRATCH_SIZE,
            },
        ];
        let iovcnt: libc::c_int = if writable < SCRATCH_SIZE { 2 } else { 1 };
        let n = unsafe { libc::readv(fd, iov.as_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let n = n as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            let overflow = n - writable;
            self.writer_index = self.buf.len();
            self.ensure_writable(overflow);
            let wi = self.writer_index;
            self.buf[wi..wi + overflow].copy_from_slice(&self.scratch.0[..overflow]);
            self.writer_index += overflow;
        }
        Ok(n)
    }

    /// Drain the readable region into `fd`. Partial writes are expected;
    /// the caller re-arms write interest for the remainder.
    pub fn write_to_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable_bytes();
        let n = unsafe {
            libc::write(
                fd,
                self.buf.as_ptr().add(self.reader_index) as *const libc::c_void,
                readable,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        self.retrieve(n);
        Ok(n)
    }

    fn reset_indices(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Reclaim consumed space by sliding readable bytes left when the slack
    /// covers the request; otherwise extend the allocation.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = self.reader_index + readable;
        }
    }

    #[cfg(test)]
    fn indices(&self) -> (usize, usize, usize) {
        (self.reader_index, self.writer_index, self.buf.len())
    }
}
