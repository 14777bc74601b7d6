// (c) Roel Kluin, 2023, GPL v3

use crate::bitmap::{mix64, BitIndexedLongMap, MapConfig, Word};
use crate::error::MapError;
use log::debug;
use std::ops::Range;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Many small `BitIndexedLongMap`s behind one lock each, the shard picked by the top bits of
/// the mixed key. The slot inside a shard uses the low bits, so both choices stay independent.
///
/// This is the coarse grained locking the plain map leaves to its caller: writers to
/// different shards never contend, and `&mut self` access skips the locks altogether.
pub struct ShardedBitMap<W: Word = u64> {
    shards: Vec<Mutex<BitIndexedLongMap<W>>>,
    shift: u32,
}

impl<W: Word> ShardedBitMap<W> {
    /// `1 << log_shards` maps, each sized for its share of `config.expected`.
    pub fn new(log_shards: u32, config: MapConfig) -> Result<Self, MapError> {
        if log_shards > 16 {
            return Err(MapError::Config(format!("2^{log_shards} shards is too many")));
        }
        let count = 1_usize << log_shards;
        let per_shard = MapConfig {
            expected: config.expected.div_ceil(count),
            ..config
        };
        let shards = (0..count)
            .map(|_| BitIndexedLongMap::new(per_shard).map(Mutex::new))
            .collect::<Result<Vec<_>, _>>()?;
        debug!("created {} shards for {} expected keys", count, config.expected);
        Ok(ShardedBitMap {
            shards,
            // a shift by 64 would overflow, a single shard takes index 0 via checked_shr.
            shift: 64 - log_shards,
        })
    }

    /// Shards enough for `threads` writers to rarely meet:
    /// four times the next power of two.
    pub fn for_threads(threads: usize, config: MapConfig) -> Result<Self, MapError> {
        let log_shards = threads.max(1).next_power_of_two().trailing_zeros() + 2;
        Self::new(log_shards, config)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_of(&self, key: u64) -> usize {
        mix64(key).checked_shr(self.shift).unwrap_or(0) as usize
    }

    fn lock(&self, key: u64) -> MutexGuard<'_, BitIndexedLongMap<W>> {
        // a panicking writer leaves the shard consistent: every map write is a single slot
        // or word update after all checks passed.
        self.shards[self.shard_of(key)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn shard(&self, index: usize) -> MutexGuard<'_, BitIndexedLongMap<W>> {
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn shard_mut(&mut self, index: usize) -> &mut BitIndexedLongMap<W> {
        self.shards[index]
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, key: u64) -> Result<bool, MapError> {
        self.lock(key).add(key)
    }

    pub fn set(&self, key: u64, index: usize) -> Result<Option<Vec<W>>, MapError> {
        self.lock(key).set(key, index)
    }

    pub fn insert_bit(&self, key: u64, index: usize) -> Result<bool, MapError> {
        self.lock(key).insert_bit(key, index)
    }

    /// A copy of the vector, the shard is unlocked on return.
    pub fn get(&self, key: u64) -> Option<Vec<W>> {
        self.lock(key).get(key).map(<[W]>::to_vec)
    }

    pub fn get_with_empty(&self, key: u64) -> Vec<W> {
        self.lock(key).get_with_empty(key).into_owned()
    }

    pub fn get_bit(&self, key: u64, index: usize) -> bool {
        self.lock(key).get_bit(key, index)
    }

    pub fn contains(&self, key: u64) -> bool {
        self.lock(key).contains(key)
    }

    pub fn cardinality(&self, key: u64) -> usize {
        self.lock(key).cardinality(key)
    }

    pub fn cardinality_in(&self, key: u64, range: Range<usize>) -> usize {
        self.lock(key).cardinality_in(key, range)
    }

    pub fn len(&self) -> usize {
        (0..self.shards.len()).map(|i| self.shard(i).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        (0..self.shards.len()).all(|i| self.shard(i).is_empty())
    }

    pub fn bit_len(&self) -> usize {
        self.shard(0).bit_len()
    }

    pub fn capacity(&self) -> usize {
        (0..self.shards.len()).map(|i| self.shard(i).capacity()).sum()
    }

    pub fn reset(&mut self) {
        for shard in self.shards.iter_mut() {
            shard
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .reset();
        }
    }

    /// Visits every present key, one shard locked at a time.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(u64, &[W]),
    {
        for i in 0..self.shards.len() {
            let shard = self.shard(i);
            for (key, value) in shard.iter() {
                f(key, value);
            }
        }
    }
}
