//! Byte Buffers
//!
//! Fixed-capacity payload of socket steps. A send step transmits the
//! filled bytes and empties the buffer; a receive step appends into the
//! spare capacity. The same buffer can therefore carry a request out and
//! its reply back.

use std::borrow::Cow;
use std::fmt;

/// A byte buffer with a fixed capacity.
#[derive(Clone, PartialEq, Eq)]
pub struct ByteBuffer {
    data: Vec<u8>,
    filled: usize,
}

impl ByteBuffer {
    /// Creates an empty buffer holding at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            filled: 0,
        }
    }

    /// Appends as much of `bytes` as fits and returns how many bytes were
    /// copied.
    pub fn put(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.remaining());
        self.data[self.filled..self.filled + n].copy_from_slice(&bytes[..n]);
        self.filled += n;
        n
    }

    /// Number of filled bytes.
    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Spare capacity.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.filled
    }

    pub fn is_full(&self) -> bool {
        self.filled == self.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// Discards the content, keeping the capacity.
    pub fn clear(&mut self) {
        self.filled = 0;
    }

    /// Filled bytes as text, invalid UTF-8 replaced.
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.as_slice())
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        self.data.truncate(self.filled);
        self.data
    }

    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.filled = (self.filled + n).min(self.capacity());
    }
}

/// A full buffer holding exactly `bytes`.
impl From<&[u8]> for ByteBuffer {
    fn from(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            filled: bytes.len(),
        }
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(data: Vec<u8>) -> Self {
        let filled = data.len();
        Self { data, filled }
    }
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("len", &self.filled)
            .field("capacity", &self.capacity())
            .finish()
    }
}
