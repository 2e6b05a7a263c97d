//! Owned, fixed-length byte buffers with bounds-checked access.
//!
//! Chunk buffers, the reader's chunk copy and the header codecs all go through `ByteBuf`
//! rather than raw pointer arithmetic. Out-of-range access returns `None` (or an error from the
//! caller's point of view) instead of panicking.

use byteorder::{ByteOrder, LittleEndian};
use std::ops::Range;

/// A zero-initialized, fixed-length heap buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct ByteBuf {
    bytes: Box<[u8]>,
}

impl std::fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBuf").field("len", &self.len()).finish()
    }
}

impl ByteBuf {
    /// Allocate `len` zeroed bytes.
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: vec![0u8; len].into_boxed_slice(),
        }
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer has zero length.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The whole buffer.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// The whole buffer, mutably.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Sub-slice, or `None` if `range` is out of bounds or inverted.
    #[inline]
    pub fn get(&self, range: Range<usize>) -> Option<&[u8]> {
        self.bytes.get(range)
    }

    /// Mutable sub-slice, or `None` if `range` is out of bounds or inverted.
    #[inline]
    pub fn get_mut(&mut self, range: Range<usize>) -> Option<&mut [u8]> {
        self.bytes.get_mut(range)
    }

    /// Copy `src` to `offset`. Returns `false` (writing nothing) if it would not fit.
    pub fn copy_in(&mut self, offset: usize, src: &[u8]) -> bool {
        let Some(end) = offset.checked_add(src.len()) else {
            return false;
        };
        match self.bytes.get_mut(offset..end) {
            Some(dst) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    /// Zero `range`. Returns `false` (writing nothing) if it is out of bounds.
    pub fn zero_range(&mut self, range: Range<usize>) -> bool {
        match self.bytes.get_mut(range) {
            Some(dst) => {
                dst.fill(0);
                true
            }
            None => false,
        }
    }

    /// Little-endian `u16` at `offset`.
    pub fn read_u16_le(&self, offset: usize) -> Option<u16> {
        self.get(offset..offset.checked_add(2)?)
            .map(LittleEndian::read_u16)
    }

    /// Store a little-endian `u16` at `offset`. Returns `false` if out of bounds.
    pub fn write_u16_le(&mut self, offset: usize, v: u16) -> bool {
        let Some(end) = offset.checked_add(2) else {
            return false;
        };
        match self.bytes.get_mut(offset..end) {
            Some(dst) => {
                LittleEndian::write_u16(dst, v);
                true
            }
            None => false,
        }
    }
}
