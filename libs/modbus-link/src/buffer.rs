//! Fixed-size payload buffer
//!
//! Words are always stored big-endian (network order) regardless of host
//! byte order. Offsets outside `[0, len)` are programming errors and panic.

use std::fmt;

/// Fixed-length byte container carried inside requests and responses
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct DataBuffer {
    data: Box<[u8]>,
}

impl DataBuffer {
    /// Create a zero-filled buffer of `len` bytes
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0u8; len].into_boxed_slice(),
        }
    }

    /// Create a buffer holding a copy of `bytes`
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec().into_boxed_slice(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Get a single byte
    ///
    /// # Panics
    /// Panics if `offset >= len`.
    #[inline]
    pub fn get_byte(&self, offset: usize) -> u8 {
        self.check(offset, 1);
        self.data[offset]
    }

    /// Set a single byte
    ///
    /// # Panics
    /// Panics if `offset >= len`.
    #[inline]
    pub fn set_byte(&mut self, offset: usize, value: u8) {
        self.check(offset, 1);
        self.data[offset] = value;
    }

    /// Get a big-endian u16 spanning `offset` and `offset + 1`
    ///
    /// # Panics
    /// Panics if `offset + 1 >= len`.
    #[inline]
    pub fn get_u16_be(&self, offset: usize) -> u16 {
        self.check(offset, 2);
        u16::from_be_bytes([self.data[offset], self.data[offset + 1]])
    }

    /// Store `value` big-endian at `offset` and `offset + 1`
    ///
    /// # Panics
    /// Panics if `offset + 1 >= len`.
    #[inline]
    pub fn set_u16_be(&mut self, offset: usize, value: u16) {
        self.check(offset, 2);
        self.data[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    /// Borrow `len` bytes starting at `offset`
    ///
    /// # Panics
    /// Panics if the range exceeds the buffer.
    #[inline]
    pub fn get_range(&self, offset: usize, len: usize) -> &[u8] {
        self.check(offset, len);
        &self.data[offset..offset + len]
    }

    fn check(&self, offset: usize, len: usize) {
        let end = offset.checked_add(len);
        assert!(
            matches!(end, Some(end) if end <= self.data.len()),
            "DataBuffer access out of range: offset={} len={} size={}",
            offset,
            len,
            self.data.len()
        );
    }
}

impl From<Vec<u8>> for DataBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            data: bytes.into_boxed_slice(),
        }
    }
}

impl From<&[u8]> for DataBuffer {
    fn from(bytes: &[u8]) -> Self {
        Self::from_slice(bytes)
    }
}

impl AsRef<[u8]> for DataBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for DataBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataBuffer[{}]", crate::logger::hex_upper(&self.data))
    }
}
