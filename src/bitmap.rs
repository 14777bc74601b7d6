// (c) Roel Kluin, 2023, GPL v3

use crate::error::MapError;
use bitvec::prelude::{BitSlice, BitStore, Lsb0};
use log::{debug, warn};
use std::borrow::Cow;
use std::fmt;
use std::num::NonZeroU64;
use std::ops::Range;

pub const DEFAULT_LOAD_FACTOR: f32 = 0.75;

// 2^40 slots of 16 bytes is already 16 TiB.
const MAX_LOG_CAPACITY: u32 = 40;

/// Backing word of the per-key bit vectors.
pub trait Word: BitStore + Copy + Default + Eq + fmt::Debug + Send + Sync + 'static {
    const BITS: usize;
}

impl Word for u16 {
    const BITS: usize = 16;
}

impl Word for u64 {
    const BITS: usize = 64;
}

/// murmur3 fmix64: every input bit affects every output bit.
#[inline(always)]
pub fn mix64(key: u64) -> u64 {
    let mut h = key;
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^ (h >> 33)
}

/// Number of words for a bit vector of `bit_len` bits. At least one, `add` always sets bit 0.
pub fn words_for<W: Word>(bit_len: usize) -> usize {
    bit_len.div_ceil(W::BITS).max(1)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Empty,
    /// `value` is the first word of this key's vector in the arena.
    Occupied { key: NonZeroU64, value: usize },
}

/// Sizing of a `BitIndexedLongMap`, fixed for its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, new)]
pub struct MapConfig {
    pub expected: usize,
    pub load_factor: f32,
    pub bit_len: usize,
}

impl MapConfig {
    pub fn with_expected(expected: usize, bit_len: usize) -> Self {
        MapConfig::new(expected, DEFAULT_LOAD_FACTOR, bit_len)
    }
    /// Smallest power of two table that keeps `expected` elements under the load factor.
    pub fn capacity(&self) -> Result<usize, MapError> {
        if !(self.load_factor > 0.0 && self.load_factor <= 1.0) {
            return Err(MapError::Config(format!(
                "load factor {} not in (0, 1]",
                self.load_factor
            )));
        }
        let slots = (self.expected as f64 / self.load_factor as f64).ceil() as u64;
        let capacity = slots.max(2).checked_next_power_of_two().ok_or_else(|| {
            MapError::Config(format!("{} expected elements overflow the table size", self.expected))
        })?;
        if capacity.trailing_zeros() > MAX_LOG_CAPACITY {
            return Err(MapError::Config(format!(
                "{} expected elements needs 2^{} slots, more than 2^{}",
                self.expected,
                capacity.trailing_zeros(),
                MAX_LOG_CAPACITY
            )));
        }
        usize::try_from(capacity).map_err(|e| MapError::Config(e.to_string()))
    }
}

/// Fixed capacity, open addressing map from a non-zero `u64` key to a bit vector of `bit_len`
/// bits, stored in words of type `W`.
///
/// The table is never resized. Linear probing from the mixed key finds either the key or an
/// empty slot; when neither exists the map is full and writes fail with
/// `MapError::CapacityExceeded`. Sizing is the caller's job.
///
/// Bit vectors are created zero-filled on the first `add` or `set` of a key and are kept
/// back to back in one arena, so a present key costs one slot plus its words and nothing
/// else. `reset` empties the slots and truncates the arena, keeping both allocations.
///
/// There is no internal locking. Writers from several threads need disjoint maps (see
/// `ShardedBitMap`) or a lock of their own.
pub struct BitIndexedLongMap<W: Word = u64> {
    slots: Vec<Slot>,
    arena: Vec<W>,
    mask: usize,
    bit_len: usize,
    words: usize,
    len: usize,
    max_fill: usize,
    overfilled: bool,
}

pub type ShortWordMap = BitIndexedLongMap<u16>;
pub type LongWordMap = BitIndexedLongMap<u64>;

impl<W: Word> BitIndexedLongMap<W> {
    pub fn new(config: MapConfig) -> Result<Self, MapError> {
        let capacity = config.capacity()?;
        let words = words_for::<W>(config.bit_len);
        let max_fill = ((capacity as f64 * config.load_factor as f64) as usize).min(capacity);
        debug!(
            "map: {} slots, {} bits in {} x {} bit words per key",
            capacity,
            config.bit_len,
            words,
            W::BITS
        );
        Ok(BitIndexedLongMap {
            slots: vec![Slot::Empty; capacity],
            arena: Vec::with_capacity(config.expected.min(capacity) * words),
            mask: capacity - 1,
            bit_len: config.bit_len,
            words,
            len: 0,
            max_fill,
            overfilled: false,
        })
    }
    pub fn with_expected(expected: usize, bit_len: usize) -> Result<Self, MapError> {
        Self::new(MapConfig::with_expected(expected, bit_len))
    }

    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
    pub fn bit_len(&self) -> usize {
        self.bit_len
    }
    pub fn words_per_value(&self) -> usize {
        self.words
    }
    pub fn load_factor(&self) -> f64 {
        self.len as f64 / self.slots.len() as f64
    }

    /// Slot holding `key`, or the empty slot where it would go. `None` if the probe wrapped
    /// around a full table.
    fn probe(&self, key: NonZeroU64) -> Option<usize> {
        let start = mix64(key.get()) as usize & self.mask;
        let mut pos = start;
        loop {
            match self.slots[pos] {
                Slot::Empty => return Some(pos),
                Slot::Occupied { key: k, .. } if k == key => return Some(pos),
                Slot::Occupied { .. } => {}
            }
            pos = (pos + 1) & self.mask;
            if pos == start {
                return None;
            }
        }
    }

    fn value_of(&self, key: u64) -> Option<&[W]> {
        let key = NonZeroU64::new(key)?;
        match self.slots[self.probe(key)?] {
            Slot::Occupied { value, .. } => Some(&self.arena[value..value + self.words]),
            Slot::Empty => None,
        }
    }

    /// Finds or creates the vector for `key`. Returns its arena offset and whether it was
    /// created by this call.
    fn touch(&mut self, key: u64) -> Result<(usize, bool), MapError> {
        let nz = NonZeroU64::new(key).ok_or(MapError::ReservedKey)?;
        let pos = self.probe(nz).ok_or(MapError::CapacityExceeded {
            key,
            capacity: self.slots.len(),
        })?;
        match self.slots[pos] {
            Slot::Occupied { value, .. } => Ok((value, false)),
            Slot::Empty => {
                let value = self.arena.len();
                self.arena.resize(value + self.words, W::default());
                self.slots[pos] = Slot::Occupied { key: nz, value };
                self.len += 1;
                if self.len > self.max_fill && !self.overfilled {
                    self.overfilled = true;
                    warn!(
                        "map holds {} keys in {} slots, over its load factor; lookups slow down",
                        self.len,
                        self.slots.len()
                    );
                }
                Ok((value, true))
            }
        }
    }

    fn check_bit(&self, index: usize) -> Result<(), MapError> {
        // bit 0 always exists, add() relies on it.
        if index >= self.bit_len.max(1) {
            return Err(MapError::BitOutOfRange {
                index,
                bit_len: self.bit_len,
            });
        }
        Ok(())
    }

    /// Ensures bit 0 is set for `key`. Returns true if the key was not present before.
    pub fn add(&mut self, key: u64) -> Result<bool, MapError> {
        let (value, created) = self.touch(key)?;
        BitSlice::<W, Lsb0>::from_slice_mut(&mut self.arena[value..value + self.words])
            .set(0, true);
        Ok(created)
    }

    /// Sets bit `index` for `key` and returns the vector as it was before, `None` if this call
    /// created the key.
    pub fn set(&mut self, key: u64, index: usize) -> Result<Option<Vec<W>>, MapError> {
        self.check_bit(index)?;
        let (value, created) = self.touch(key)?;
        let words = &mut self.arena[value..value + self.words];
        let prior = if created { None } else { Some(words.to_vec()) };
        BitSlice::<W, Lsb0>::from_slice_mut(words).set(index, true);
        Ok(prior)
    }

    /// Sets bit `index` for `key` without copying the prior vector. Returns true if the bit
    /// was not set before.
    pub fn insert_bit(&mut self, key: u64, index: usize) -> Result<bool, MapError> {
        self.check_bit(index)?;
        let (value, _) = self.touch(key)?;
        let bits =
            BitSlice::<W, Lsb0>::from_slice_mut(&mut self.arena[value..value + self.words]);
        Ok(!bits.replace(index, true))
    }

    pub fn get(&self, key: u64) -> Option<&[W]> {
        self.value_of(key)
    }

    pub fn get_bit(&self, key: u64, index: usize) -> bool {
        self.value_of(key)
            .map(BitSlice::<W, Lsb0>::from_slice)
            .and_then(|bits| bits.get(index).map(|b| *b))
            .unwrap_or(false)
    }

    /// Like `get`, but a single zero word for unknown keys.
    pub fn get_with_empty(&self, key: u64) -> Cow<'_, [W]> {
        match self.value_of(key) {
            Some(value) => Cow::Borrowed(value),
            None => Cow::Owned(vec![W::default()]),
        }
    }

    pub fn contains(&self, key: u64) -> bool {
        self.value_of(key).is_some()
    }

    pub fn cardinality(&self, key: u64) -> usize {
        self.value_of(key)
            .map(|value| BitSlice::<W, Lsb0>::from_slice(value).count_ones())
            .unwrap_or(0)
    }

    /// Set bits of `key` in `[range.start, range.end)`.
    ///
    /// # Panics
    /// If `range.start > range.end` or `range.end` exceeds the bit length, like slice indexing.
    pub fn cardinality_in(&self, key: u64, range: Range<usize>) -> usize {
        assert!(
            range.start <= range.end && range.end <= self.bit_len.max(1),
            "bit range {:?} out of bounds for bit length {}",
            range,
            self.bit_len
        );
        self.value_of(key)
            .map(|value| BitSlice::<W, Lsb0>::from_slice(value)[range].count_ones())
            .unwrap_or(0)
    }

    /// Forgets all keys. Capacity, bit length and both allocations are kept.
    pub fn reset(&mut self) {
        self.slots.fill(Slot::Empty);
        self.arena.clear();
        self.len = 0;
        self.overfilled = false;
    }

    /// All present keys with their vectors, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[W])> + '_ {
        self.slots.iter().filter_map(move |slot| match *slot {
            Slot::Occupied { key, value } => Some((key.get(), &self.arena[value..value + self.words])),
            Slot::Empty => None,
        })
    }
}

impl<W: Word> fmt::Debug for BitIndexedLongMap<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitIndexedLongMap")
            .field("len", &self.len)
            .field("capacity", &self.slots.len())
            .field("bit_len", &self.bit_len)
            .field("word_bits", &W::BITS)
            .finish()
    }
}
