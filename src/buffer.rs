//! Growable byte buffer with a cheap-prepend slot and fd-aware I/O.
//!
//! The buffer is a single contiguous region partitioned by two indices
//! into prependable, readable, and writable spans:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0      <=      reader_index   <=   writer_index   <=   size
//! ```
//!
//! The prependable span starts at [`Buffer::CHEAP_PREPEND`] bytes so a
//! framing layer can prefix a length header in front of queued data
//! without shifting or reallocating.

use std::io;
use std::os::unix::io::RawFd;

/// Size of the stack-allocated auxiliary used by [`Buffer::read_fd`].
const EXTRA_BUF_SIZE: usize = 65536;

/// Growable byte region used for per-connection input and output.
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Buffer {
    /// Reserved space in front of the readable span.
    pub const CHEAP_PREPEND: usize = 8;
    /// Default capacity of the writable span at construction.
    pub const INITIAL_SIZE: usize = 1024;

    /// Create a buffer with the default initial size.
    pub fn new() -> Buffer {
        Buffer::with_capacity(Buffer::INITIAL_SIZE)
    }

    /// Create a buffer whose writable span starts at `initial_size` bytes.
    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0; Buffer::CHEAP_PREPEND + initial_size],
            reader_index: Buffer::CHEAP_PREPEND,
            writer_index: Buffer::CHEAP_PREPEND,
        }
    }

    /// Number of bytes available for reading.
    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// Number of bytes available for writing without growing.
    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    /// Number of bytes in front of the readable span.
    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// View of the readable span. Invalidated by any mutation.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Consume up to `len` readable bytes. Consuming the entire readable
    /// span resets both indices to the cheap-prepend offset.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Consume all readable bytes, resetting the indices.
    pub fn retrieve_all(&mut self) {
        self.reader_index = Buffer::CHEAP_PREPEND;
        self.writer_index = Buffer::CHEAP_PREPEND;
    }

    /// Copy out the entire readable span, then consume it.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    /// Copy out `len` readable bytes, then consume them.
    ///
    /// The copy is byte-exact; payloads are not assumed to be text.
    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.readable_bytes());
        let result = self.buf[self.reader_index..self.reader_index + len].to_vec();
        self.retrieve(len);
        result
    }

    /// Ensure at least `len` writable bytes, growing or compacting.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Append `data` to the writable span, growing if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + Buffer::CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            // Compact: slide readable bytes back to the prepend offset.
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, Buffer::CHEAP_PREPEND);
            self.reader_index = Buffer::CHEAP_PREPEND;
            self.writer_index = self.reader_index + readable;
        }
    }

    /// Read from `fd` into the buffer with a single vectored read.
    ///
    /// The read scatters into the current writable span plus a 64 KiB
    /// stack auxiliary, so a large read makes progress without
    /// preallocating large per-connection buffers. Overflow into the
    /// auxiliary is appended afterwards.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let iov = [
            libc::iovec {
                iov_base: self.buf[self.writer_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        let iovcnt = if writable < extra.len() { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let n = n as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Write the readable span to `fd` with a single write.
    ///
    /// The caller retrieves however many bytes were consumed. An empty
    /// readable span returns 0 without a syscall.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable_bytes();
        if readable == 0 {
            return Ok(0);
        }

        let n = unsafe {
            libc::write(
                fd,
                self.buf[self.reader_index..].as_ptr() as *const libc::c_void,
                readable,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}
