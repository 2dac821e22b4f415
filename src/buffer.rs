//! The growable byte region backing every send and receive pipeline in the
//! crate. Sessions and datagram endpoints supply their own synchronization;
//! the buffer itself has none.

use std::fmt;

/// Append-only byte buffer with explicit capacity management.
///
/// The backing region is kept fully allocated and zero-filled so that the
/// spare area past the logical size can be handed directly to a socket read.
/// Capacity grows geometrically and is never released except by dropping the
/// buffer; [`clear`](Buffer::clear) only resets the logical size.
pub struct Buffer {
    data: Vec<u8>,
    size: usize,
}

impl Buffer {
    /// Create a buffer with `capacity` bytes of backing storage.
    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            data: vec![0; capacity],
            size: 0,
        }
    }

    /// The number of bytes appended so far.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Returns true if no bytes have been appended.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The size of the backing region.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Reset the logical size to zero. Capacity is retained.
    pub fn clear(&mut self) {
        self.size = 0;
    }

    /// Ensure the backing region holds at least `capacity` bytes. Never
    /// shrinks.
    pub fn reserve(&mut self, capacity: usize) {
        if capacity > self.data.len() {
            self.data.resize(capacity, 0);
        }
    }

    /// Append `bytes` at the current end of the buffer, doubling capacity
    /// when the region is outgrown so repeated appends stay cheap.
    pub fn append(&mut self, bytes: &[u8]) {
        let required = self.size + bytes.len();
        if required > self.data.len() {
            self.reserve(required.max(self.data.len() * 2));
        }
        self.data[self.size..required].copy_from_slice(bytes);
        self.size += bytes.len();
    }

    /// The appended contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// The writable region past the appended contents, typically the target
    /// of a socket read.
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.data[self.size..]
    }

    /// Extend the logical size by `count` bytes previously written into
    /// [`space`](Buffer::space).
    pub fn advance(&mut self, count: usize) {
        debug_assert!(self.size + count <= self.data.len());
        self.size += count;
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer {
            data: Vec::new(),
            size: 0,
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size)
            .field("capacity", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_grows_geometrically() {
        let mut buffer = Buffer::with_capacity(8);
        buffer.append(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(buffer.capacity(), 8);

        // One byte past capacity doubles rather than growing by one.
        buffer.append(&[9]);
        assert_eq!(buffer.len(), 9);
        assert_eq!(buffer.capacity(), 16);
        assert_eq!(buffer.as_slice(), &[1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn reserve_never_shrinks() {
        let mut buffer = Buffer::with_capacity(64);
        buffer.reserve(16);
        assert_eq!(buffer.capacity(), 64);
        buffer.reserve(96);
        assert_eq!(buffer.capacity(), 96);
    }

    #[test]
    fn clear_retains_capacity() {
        let mut buffer = Buffer::with_capacity(4);
        buffer.append(b"abcdefgh");
        let capacity = buffer.capacity();
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), capacity);
    }

    #[test]
    fn space_exposes_spare_region() {
        let mut buffer = Buffer::with_capacity(8);
        buffer.append(b"ab");
        assert_eq!(buffer.space().len(), 6);

        buffer.space()[..3].copy_from_slice(b"cde");
        buffer.advance(3);
        assert_eq!(buffer.as_slice(), b"abcde");
    }

    #[test]
    fn oversized_append_reserves_exactly() {
        let mut buffer = Buffer::with_capacity(4);
        let payload: Vec<u8> = (0..100).collect();
        buffer.append(&payload);
        assert_eq!(buffer.as_slice(), &payload[..]);
        assert_eq!(buffer.capacity(), 100);
    }
}
