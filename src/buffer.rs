//! A byte buffer with readable/writable cursors and a small prepend area.
//!
//! The layout follows the classic network-buffer shape:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0      <=      reader_index   <=   writer_index    <=    size
//! ```
//!
//! Application reads consume from the front, network input appends at the
//! back, and the prepend area lets a codec put a length header in front of
//! already-encoded payload without copying it.

use std::io;
use std::os::fd::RawFd;

/// Size of the prepend area, enough for an 8-byte header.
pub const CHEAP_PREPEND: usize = 8;

/// Initial capacity of the readable/writable region.
pub const INITIAL_SIZE: usize = 1024;

/// Buffer used for both connection input and output.
#[derive(Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl Buffer {
    /// Creates a buffer with the default initial size.
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    /// Creates a buffer with room for `initial_size` bytes before growing.
    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial_size],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// Number of bytes that can be appended without growing.
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    /// Bytes in front of the readable region (headers go here).
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// The readable region, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Consumes `len` readable bytes.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Consumes everything, resetting the cursors to the prepend mark.
    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Consumes and returns `len` bytes.
    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let data = self.peek()[..len].to_vec();
        self.retrieve(len);
        data
    }

    /// Consumes and returns the whole readable region.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        let len = self.readable_bytes();
        self.retrieve_as_bytes(len)
    }

    /// Appends `data` after the readable region, growing if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        self.buf[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Writes `data` immediately in front of the readable region.
    ///
    /// Panics if the prepend area cannot hold it; with the default layout
    /// there is always room for one header of up to [`CHEAP_PREPEND`] bytes.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        self.buf[self.reader_index..self.reader_index + data.len()].copy_from_slice(data);
    }

    /// Appends a `u32` in network byte order.
    pub fn append_u32(&mut self, value: u32) {
        self.append(&value.to_be_bytes());
    }

    /// Reads a network-order `u32` from the front without consuming it.
    ///
    /// Panics if fewer than four bytes are readable.
    pub fn peek_u32(&self) -> u32 {
        assert!(self.readable_bytes() >= 4);
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.peek()[..4]);
        u32::from_be_bytes(raw)
    }

    /// Consumes and returns a network-order `u32` from the front.
    pub fn read_u32(&mut self) -> u32 {
        let value = self.peek_u32();
        self.retrieve(4);
        value
    }

    /// Makes room for at least `len` more bytes, compacting before growing.
    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() >= len {
            return;
        }
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            // Enough slack in front: move the readable region back to the
            // prepend mark instead of reallocating.
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
    }

    /// Reads from `fd` into the buffer, using a stack extension so one call
    /// can pick up far more than the current writable region.
    ///
    /// Data beyond the writable region lands in a 64 KiB stack buffer and is
    /// appended afterwards, so a single level-triggered notification moves a
    /// large burst without pre-growing every connection's buffer.
    pub(crate) fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; 65536];
        let writable = self.writable_bytes();
        let iov = [
            libc::iovec {
                iov_base: unsafe { self.buf.as_mut_ptr().add(self.writer_index) }
                    as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        let iovcnt = if writable < extra.len() { 2 } else { 1 };
        let n = syscall!(readv(fd, iov.as_ptr(), iovcnt))? as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("readable", &self.readable_bytes())
            .field("writable", &self.writable_bytes())
            .field("prependable", &self.prependable_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_retrieve() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

        buf.append(b"hello, world");
        assert_eq!(buf.readable_bytes(), 12);
        assert_eq!(buf.peek(), b"hello, world");

        buf.retrieve(7);
        assert_eq!(buf.peek(), b"world");

        let rest = buf.retrieve_all_as_bytes();
        assert_eq!(rest, b"world");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn grows_when_full() {
        let mut buf = Buffer::new();
        let data = vec![b'x'; INITIAL_SIZE + 100];
        buf.append(&data);
        assert_eq!(buf.readable_bytes(), INITIAL_SIZE + 100);
        assert_eq!(buf.peek(), &data[..]);
    }

    #[test]
    fn compacts_inside_existing_space() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; 800]);
        buf.retrieve(600);
        // 200 readable, 224 writable, 608 prependable: room for 400 more
        // without reallocating.
        let cap_before = buf.buf.len();
        buf.append(&vec![b'b'; 400]);
        assert_eq!(buf.buf.len(), cap_before);
        assert_eq!(buf.readable_bytes(), 600);
        assert_eq!(&buf.peek()[..200], &vec![b'a'; 200][..]);
        assert_eq!(&buf.peek()[200..], &vec![b'b'; 400][..]);
    }

    #[test]
    fn prepend_header() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&7u32.to_be_bytes());
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.read_u32(), 7);
        assert_eq!(buf.peek(), b"payload");
    }

    #[test]
    fn u32_round_trip() {
        let mut buf = Buffer::new();
        buf.append_u32(0xdead_beef);
        assert_eq!(buf.readable_bytes(), 4);
        assert_eq!(buf.peek_u32(), 0xdead_beef);
        assert_eq!(buf.read_u32(), 0xdead_beef);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn read_fd_spills_into_extension() {
        let mut fds = [0; 2];
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC)).unwrap();
        let payload = vec![b'z'; 2000];
        let n = syscall!(write(
            fds[1],
            payload.as_ptr() as *const libc::c_void,
            payload.len()
        ))
        .unwrap();
        assert_eq!(n as usize, payload.len());

        let mut buf = Buffer::with_capacity(16);
        let read = buf.read_fd(fds[0]).unwrap();
        assert_eq!(read, payload.len());
        assert_eq!(buf.peek(), &payload[..]);

        syscall!(close(fds[0])).unwrap();
        syscall!(close(fds[1])).unwrap();
    }
}
