//! Tagged sequence numbers and a ring buffer indexed by them.
//!
//! Every counter space (slots, chunks, messages) gets its own `Sn<Tag>` type, so a chunk
//! number cannot index the slot ring by accident.
//!
//! ## Public invariants
//!
//! - Arithmetic wraps. `Sn + u64` and `Sn - u64` move a counter; `Sn - Sn` is the wrapping
//!   distance as a plain `u64`. Two sequence numbers cannot be added.
//! - There is no `Ord`. Comparisons (`lt`, `le`, `ge`, `gt`, `in_range`) treat `a` as before
//!   `b` when the forward distance from `a` to `b` is at most `u64::MAX / 2`. This is correct
//!   across wraparound as long as live counters stay within 2^63 of each other.
//! - `RingBuffer` capacity is a power of two; `sn` maps to index `sn & (capacity - 1)`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::{Add, AddAssign, Sub, SubAssign};

const HALF: u64 = u64::MAX / 2;

/// `a < b` on raw counter values.
#[inline]
pub fn sn64_lt(a: u64, b: u64) -> bool {
    b.wrapping_sub(a.wrapping_add(1)) <= HALF
}

/// `a <= b` on raw counter values.
#[inline]
pub fn sn64_le(a: u64, b: u64) -> bool {
    b.wrapping_sub(a) <= HALF
}

/// `a >= b` on raw counter values.
#[inline]
pub fn sn64_ge(a: u64, b: u64) -> bool {
    a.wrapping_sub(b) <= HALF
}

/// `a > b` on raw counter values.
#[inline]
pub fn sn64_gt(a: u64, b: u64) -> bool {
    a.wrapping_sub(b.wrapping_add(1)) <= HALF
}

/// `lo <= sn <= hi`, inclusive on both ends.
#[inline]
pub fn sn64_in_range(sn: u64, lo: u64, hi: u64) -> bool {
    sn.wrapping_sub(lo) <= hi.wrapping_sub(lo)
}

/// Tag for slot sequence numbers.
#[derive(Debug)]
pub enum SlotTag {}
/// Tag for chunk sequence numbers.
#[derive(Debug)]
pub enum ChunkTag {}
/// Tag for message sequence numbers.
#[derive(Debug)]
pub enum MsgTag {}

/// A 64-bit sequence number in the counter space named by `Tag`.
pub struct Sn<Tag> {
    value: u64,
    _tag: PhantomData<fn() -> Tag>,
}

/// Slot sequence number.
pub type Ssn = Sn<SlotTag>;
/// Chunk sequence number.
pub type Csn = Sn<ChunkTag>;
/// Message sequence number.
pub type Msn = Sn<MsgTag>;

impl<Tag> Sn<Tag> {
    /// Wrap a raw counter value.
    #[inline]
    pub const fn new(value: u64) -> Self {
        Self {
            value,
            _tag: PhantomData,
        }
    }

    /// The raw counter value.
    #[inline]
    pub const fn value(self) -> u64 {
        self.value
    }

    /// Wraparound-safe `self < other`.
    #[inline]
    pub fn lt(self, other: Self) -> bool {
        sn64_lt(self.value, other.value)
    }

    /// Wraparound-safe `self <= other`.
    #[inline]
    pub fn le(self, other: Self) -> bool {
        sn64_le(self.value, other.value)
    }

    /// Wraparound-safe `self >= other`.
    #[inline]
    pub fn ge(self, other: Self) -> bool {
        sn64_ge(self.value, other.value)
    }

    /// Wraparound-safe `self > other`.
    #[inline]
    pub fn gt(self, other: Self) -> bool {
        sn64_gt(self.value, other.value)
    }

    /// `lo <= self <= hi`.
    #[inline]
    pub fn in_range(self, lo: Self, hi: Self) -> bool {
        sn64_in_range(self.value, lo.value, hi.value)
    }
}

impl<Tag> Clone for Sn<Tag> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Tag> Copy for Sn<Tag> {}

impl<Tag> PartialEq for Sn<Tag> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<Tag> Eq for Sn<Tag> {}

impl<Tag> Hash for Sn<Tag> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl<Tag> Default for Sn<Tag> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<Tag> fmt::Debug for Sn<Tag> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl<Tag> fmt::Display for Sn<Tag> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl<Tag> Add<u64> for Sn<Tag> {
    type Output = Self;
    #[inline]
    fn add(self, d: u64) -> Self {
        Self::new(self.value.wrapping_add(d))
    }
}

impl<Tag> AddAssign<u64> for Sn<Tag> {
    #[inline]
    fn add_assign(&mut self, d: u64) {
        self.value = self.value.wrapping_add(d);
    }
}

impl<Tag> Sub<u64> for Sn<Tag> {
    type Output = Self;
    #[inline]
    fn sub(self, d: u64) -> Self {
        Self::new(self.value.wrapping_sub(d))
    }
}

impl<Tag> SubAssign<u64> for Sn<Tag> {
    #[inline]
    fn sub_assign(&mut self, d: u64) {
        self.value = self.value.wrapping_sub(d);
    }
}

impl<Tag> Sub for Sn<Tag> {
    type Output = u64;
    #[inline]
    fn sub(self, other: Self) -> u64 {
        self.value.wrapping_sub(other.value)
    }
}

/// `x - 1` for a power of two `x`.
#[inline]
pub fn mask_power_of_2(x: u64) -> u64 {
    debug_assert!(x.is_power_of_two());
    x - 1
}

/// Fixed-capacity ring of `V`, indexed by `Sn<Tag>`.
pub struct RingBuffer<Tag, V> {
    slots: Box<[V]>,
    mask: u64,
    _tag: PhantomData<fn() -> Tag>,
}

impl<Tag, V> RingBuffer<Tag, V> {
    /// Build a ring of `count` entries (a power of two), each produced by `init`.
    ///
    /// Returns `None` if `count` is zero or not a power of two.
    pub fn from_fn(count: usize, mut init: impl FnMut(usize) -> V) -> Option<Self> {
        if !count.is_power_of_two() {
            return None;
        }
        let slots: Box<[V]> = (0..count).map(&mut init).collect();
        Some(Self {
            slots,
            mask: mask_power_of_2(count as u64),
            _tag: PhantomData,
        })
    }

    /// Number of entries.
    #[inline]
    pub fn slot_count(&self) -> u64 {
        self.slots.len() as u64
    }

    /// Ring index for `sn`.
    #[inline]
    pub fn index_of(&self, sn: Sn<Tag>) -> usize {
        (sn.value() & self.mask) as usize
    }

    /// Entry for `sn`.
    #[inline]
    pub fn get(&self, sn: Sn<Tag>) -> &V {
        &self.slots[self.index_of(sn)]
    }

    /// Mutable entry for `sn`.
    #[inline]
    pub fn get_mut(&mut self, sn: Sn<Tag>) -> &mut V {
        let i = self.index_of(sn);
        &mut self.slots[i]
    }

    /// The backing entries in index order.
    pub fn as_slice(&self) -> &[V] {
        &self.slots
    }
}

impl<Tag, V: Default> RingBuffer<Tag, V> {
    /// Build a ring of `count` default entries.
    pub fn with_capacity(count: usize) -> Option<Self> {
        Self::from_fn(count, |_| V::default())
    }
}
