use std::io::{self, Write};

use bytes::{Buf, BufMut, BytesMut};

/// A byte buffer with an independent read cursor over refcounted storage.
///
/// Bytes are appended at the write end (`write_*`) and consumed from the
/// read end (`read_*`), big-endian throughout. The read cursor can be
/// marked and reset, which is what lets a frame consumer inspect a prefix
/// and back out when the frame is still incomplete. `read_bytes` splits
/// decoded frames off without copying; the split halves share the
/// underlying storage and each is released when dropped.
///
/// Primitive reads panic when fewer bytes are readable than the primitive
/// needs, the same contract as [`bytes::Buf`]; callers gate on
/// [`readable_bytes`](Buffer::readable_bytes) first.
#[derive(Debug, Default)]
pub struct Buffer {
    data: BytesMut,
    reader: usize,
    mark: usize,
}

impl Buffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty buffer able to hold `capacity` bytes before
    /// reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            data: BytesMut::with_capacity(capacity),
            reader: 0,
            mark: 0,
        }
    }

    /// Number of bytes between the read cursor and the write end.
    pub fn readable_bytes(&self) -> usize {
        self.data.len() - self.reader
    }

    /// Current read cursor position.
    pub fn reader_index(&self) -> usize {
        self.reader
    }

    /// Current write position (== total bytes held).
    pub fn writer_index(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// Remembers the current read cursor for a later
    /// [`reset_reader_index`](Buffer::reset_reader_index).
    pub fn mark_reader_index(&mut self) {
        self.mark = self.reader;
    }

    /// Rewinds the read cursor to the last marked position.
    pub fn reset_reader_index(&mut self) {
        self.reader = self.mark;
    }

    /// Drops all bytes before the read cursor, reclaiming their space.
    /// Invalidates the mark.
    pub fn discard_read_bytes(&mut self) {
        if self.reader > 0 {
            self.data.advance(self.reader);
            self.reader = 0;
            self.mark = 0;
        }
    }

    fn readable(&self) -> &[u8] {
        &self.data[self.reader..]
    }

    pub fn read_i16(&mut self) -> i16 {
        let v = self.readable().get_i16();
        self.reader += 2;
        v
    }

    pub fn read_i32(&mut self) -> i32 {
        let v = self.readable().get_i32();
        self.reader += 4;
        v
    }

    pub fn read_i64(&mut self) -> i64 {
        let v = self.readable().get_i64();
        self.reader += 8;
        v
    }

    pub fn read_f32(&mut self) -> f32 {
        let v = self.readable().get_f32();
        self.reader += 4;
        v
    }

    pub fn read_f64(&mut self) -> f64 {
        let v = self.readable().get_f64();
        self.reader += 8;
        v
    }

    /// Splits the next `n` readable bytes off into their own buffer.
    ///
    /// Zero-copy: both buffers keep referencing the shared storage.
    /// Panics if fewer than `n` bytes are readable.
    pub fn read_bytes(&mut self, n: usize) -> Buffer {
        assert!(n <= self.readable_bytes(), "read_bytes past writer index");
        self.discard_read_bytes();
        Buffer {
            data: self.data.split_to(n),
            reader: 0,
            mark: 0,
        }
    }

    /// Copies the next `n` readable bytes into `dst` and advances the
    /// cursor. Panics if fewer than `n` bytes are readable.
    pub fn read_into(&mut self, dst: &mut [u8]) {
        let n = dst.len();
        dst.copy_from_slice(&self.readable()[..n]);
        self.reader += n;
    }

    pub fn write_i16(&mut self, v: i16) -> &mut Self {
        self.data.put_i16(v);
        self
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.data.put_i32(v);
        self
    }

    pub fn write_i64(&mut self, v: i64) -> &mut Self {
        self.data.put_i64(v);
        self
    }

    pub fn write_f32(&mut self, v: f32) -> &mut Self {
        self.data.put_f32(v);
        self
    }

    pub fn write_f64(&mut self, v: f64) -> &mut Self {
        self.data.put_f64(v);
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.put_slice(bytes);
        self
    }

    /// Writes readable bytes into `dst`, advancing the read cursor by the
    /// amount accepted. Returns the number of bytes written; errors
    /// (including `WouldBlock`) are surfaced untouched.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> io::Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let n = dst.write(&self.data[self.reader..])?;
        self.reader += n;
        Ok(n)
    }

    /// A view of the readable bytes without consuming them.
    pub fn as_slice(&self) -> &[u8] {
        self.readable()
    }
}

impl From<&[u8]> for Buffer {
    fn from(bytes: &[u8]) -> Self {
        Buffer {
            data: BytesMut::from(bytes),
            reader: 0,
            mark: 0,
        }
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(bytes: Vec<u8>) -> Self {
        Buffer::from(&bytes[..])
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.readable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_round_trip_is_big_endian() {
        let mut buf = Buffer::new();
        buf.write_i32(0x0102_0304);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(buf.read_i32(), 0x0102_0304);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_mark_and_reset() {
        let mut buf = Buffer::new();
        buf.write_i32(7).write_i32(11);

        buf.mark_reader_index();
        assert_eq!(buf.read_i32(), 7);
        assert_eq!(buf.readable_bytes(), 4);

        buf.reset_reader_index();
        assert_eq!(buf.readable_bytes(), 8);
        assert_eq!(buf.read_i32(), 7);
        assert_eq!(buf.read_i32(), 11);
    }

    #[test]
    fn test_read_bytes_leaves_remainder() {
        let mut buf = Buffer::from(&b"hello world"[..]);
        let head = buf.read_bytes(5);
        assert_eq!(head.as_slice(), b"hello");
        assert_eq!(buf.as_slice(), b" world");
    }

    #[test]
    fn test_write_to_advances_cursor() {
        let mut buf = Buffer::from(&b"abcdef"[..]);
        let mut sink = Vec::new();
        let n = buf.write_to(&mut sink).unwrap();
        assert_eq!(n, 6);
        assert_eq!(sink, b"abcdef");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_discard_read_bytes_invalidates_mark() {
        let mut buf = Buffer::from(&b"abcd"[..]);
        buf.mark_reader_index();
        buf.read_i16();
        buf.discard_read_bytes();
        assert_eq!(buf.reader_index(), 0);
        assert_eq!(buf.readable_bytes(), 2);
    }

    #[test]
    #[should_panic]
    fn test_underflow_panics() {
        let mut buf = Buffer::from(&b"ab"[..]);
        buf.read_i32();
    }
}
