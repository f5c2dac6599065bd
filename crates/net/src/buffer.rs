//! A growable byte queue used for both directions of a connection.
//!
//! The layout keeps a small reserve in front of the readable area so a
//! length prefix can be written without moving data:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! |                   |     (CONTENT)    |                  |
//! +-------------------+------------------+------------------+
//! 0      <=      read_index   <=   write_index    <=     capacity
//! ```
//!
//! Reading from a socket uses a scatter read into the writable tail plus a
//! 64 KiB stack buffer, so a single syscall can drain a burst of data without
//! pre-growing every buffer to the worst case.

use std::io::{self, IoSliceMut, Read};

/// Bytes reserved in front of the readable area.
pub const CHEAP_PREPEND: usize = 8;

/// Writable bytes of a freshly created buffer.
pub const INITIAL_SIZE: usize = 1024;

const EXTRA_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Self {
        Self { buf: vec![0; CHEAP_PREPEND + initial_size], read_index: CHEAP_PREPEND, write_index: CHEAP_PREPEND }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_index
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_index == self.write_index
    }

    /// The readable bytes. The slice is only valid until the next mutation.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_index..self.write_index]
    }

    /// Offset (relative to [`peek`](Self::peek)) of the first `\r\n`.
    pub fn find_crlf(&self) -> Option<usize> {
        self.find_crlf_from(0)
    }

    /// Like [`find_crlf`](Self::find_crlf) but starts scanning at `start`.
    pub fn find_crlf_from(&self, start: usize) -> Option<usize> {
        let readable = self.peek();
        if start >= readable.len() {
            return None;
        }
        readable[start..].windows(2).position(|w| w == b"\r\n").map(|pos| pos + start)
    }

    /// Consumes `len` readable bytes.
    ///
    /// # Panics
    ///
    /// Panics when `len` is larger than [`readable_bytes`](Self::readable_bytes).
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes(), "retrieve {len} bytes but only {} readable", self.readable_bytes());
        if len < self.readable_bytes() {
            self.read_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_index = CHEAP_PREPEND;
        self.write_index = CHEAP_PREPEND;
    }

    /// Consumes `len` bytes and returns them as a string, replacing invalid utf-8.
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        assert!(len <= self.readable_bytes(), "retrieve {len} bytes but only {} readable", self.readable_bytes());
        let s = String::from_utf8_lossy(&self.peek()[..len]).into_owned();
        self.retrieve(len);
        s
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_index..self.write_index + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    /// Writes `data` directly in front of the readable bytes.
    ///
    /// # Panics
    ///
    /// Panics when there is not enough prependable space.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes(), "prepend {} bytes but only {} prependable", data.len(), self.read_index);
        self.read_index -= data.len();
        self.buf[self.read_index..self.read_index + data.len()].copy_from_slice(data);
    }

    /// Makes sure at least `len` bytes can be appended without another allocation.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Releases memory beyond the readable bytes plus `reserve`.
    pub fn shrink(&mut self, reserve: usize) {
        let mut other = Buffer::with_capacity(self.readable_bytes() + reserve);
        other.append(self.peek());
        *self = other;
    }

    /// Reads once from `reader` into the buffer and returns the number of bytes read.
    ///
    /// A return value of `0` means the peer closed its write side.
    pub fn read_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let n = {
            let (_, tail) = self.buf.split_at_mut(self.write_index);
            let mut bufs = [IoSliceMut::new(tail), IoSliceMut::new(&mut extra)];
            reader.read_vectored(&mut bufs)?
        };

        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.write_index + len, 0);
        } else {
            // enough room once the readable bytes slide back to the front
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_index..self.write_index, CHEAP_PREPEND);
            self.read_index = CHEAP_PREPEND;
            self.write_index = CHEAP_PREPEND + readable;
        }
    }
}
