use bytes::{Bytes, BytesMut};

/// Fixed-capacity byte region with a read cursor and a write cursor.
///
/// Bytes in `[read, write)` are unread. [`Buffer::unread`] is the flipped
/// view a framing layer scans, [`Buffer::compact`] moves the unread bytes
/// back to offset 0 before the next receive. The capacity never grows.
#[derive(Debug)]
pub struct Buffer {
    data: BytesMut,
    read: usize,
    write: usize,
}

impl Buffer {
    pub fn new(capacity: usize) -> Buffer {
        Buffer {
            data: BytesMut::zeroed(capacity),
            read: 0,
            write: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.write - self.read
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// True if a compacted buffer would have room for at least one more byte.
    pub fn has_space(&self) -> bool {
        self.len() < self.capacity()
    }

    pub fn unread(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    /// Free region after the write cursor.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let write = self.write;
        &mut self.data[write..]
    }

    pub fn advance_write(&mut self, n: usize) {
        debug_assert!(self.write + n <= self.capacity());
        self.write = (self.write + n).min(self.capacity());
    }

    /// Takes the next `n` unread bytes.
    pub fn consume(&mut self, n: usize) -> Bytes {
        let n = n.min(self.len());
        let chunk = Bytes::copy_from_slice(&self.data[self.read..self.read + n]);
        self.skip(n);
        chunk
    }

    pub fn skip(&mut self, n: usize) {
        self.read = (self.read + n).min(self.write);
        if self.read == self.write {
            self.read = 0;
            self.write = 0;
        }
    }

    pub fn compact(&mut self) {
        if self.read > 0 {
            self.data.copy_within(self.read..self.write, 0);
            self.write -= self.read;
            self.read = 0;
        }
    }

    /// Copies as much of `chunk` as fits after the write cursor and returns
    /// the rest, if any.
    pub fn fill(&mut self, chunk: Bytes) -> Option<Bytes> {
        self.compact();
        let room = self.capacity() - self.write;
        let n = room.min(chunk.len());
        self.spare_mut()[..n].copy_from_slice(&chunk[..n]);
        self.write += n;
        if n < chunk.len() {
            Some(chunk.slice(n..))
        } else {
            None
        }
    }
}
