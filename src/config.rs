use std::sync::Arc;

use crate::error::{Error, Result};
use crate::hasher::{HashAlgorithm, KeyHasher};
use crate::offheap::hashtable::MAX_BUCKETS;
use crate::serde::Serializer;
use crate::store::OffHeapCache;

const DEFAULT_CAPACITY: usize = 64 * 1024 * 1024;
const DEFAULT_LOAD_FACTOR: f32 = 0.75;
const DEFAULT_INITIAL_BUCKETS: usize = 256;
const MAX_LOAD_FACTOR: f32 = 16.0;
const MAX_SEGMENTS: usize = 1 << 16;

/// Validated construction parameters of an [`OffHeapCache`].
#[derive(Clone)]
pub struct CacheConfig {
    /// Total byte budget, split evenly across segments.
    pub capacity: usize,
    /// Number of independently locked segments, a power of two.
    pub segment_count: usize,
    /// Entries per bucket above which a segment doubles its bucket array.
    pub load_factor: f32,
    /// Buckets each segment starts with, a power of two.
    pub initial_buckets: usize,
    /// Largest accepted entry (header, key and value), 0 for the segment
    /// budget.
    pub max_entry_size: usize,
    pub hasher: Arc<dyn KeyHasher>,
}

impl CacheConfig {
    pub fn segment_budget(&self) -> usize {
        self.capacity / self.segment_count
    }

    /// Effective per-entry limit; an entry never exceeds its segment budget.
    pub fn entry_limit(&self) -> usize {
        match self.max_entry_size {
            0 => self.segment_budget(),
            max => max.min(self.segment_budget()),
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.segment_count.is_power_of_two() || self.segment_count > MAX_SEGMENTS {
            return Err(Error::Config(format!(
                "segment count must be a power of two up to {MAX_SEGMENTS}, got {}",
                self.segment_count
            )));
        }
        if self.capacity < self.segment_count {
            return Err(Error::Config(format!(
                "capacity {} too small for {} segments",
                self.capacity, self.segment_count
            )));
        }
        if !(self.load_factor > 0.0 && self.load_factor <= MAX_LOAD_FACTOR) {
            return Err(Error::Config(format!(
                "load factor must be in (0, {MAX_LOAD_FACTOR}], got {}",
                self.load_factor
            )));
        }
        if !self.initial_buckets.is_power_of_two() || self.initial_buckets > MAX_BUCKETS {
            return Err(Error::Config(format!(
                "initial buckets must be a power of two up to {MAX_BUCKETS}, got {}",
                self.initial_buckets
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheConfig")
            .field("capacity", &self.capacity)
            .field("segment_count", &self.segment_count)
            .field("load_factor", &self.load_factor)
            .field("initial_buckets", &self.initial_buckets)
            .field("max_entry_size", &self.max_entry_size)
            .finish_non_exhaustive()
    }
}

/// Twice the available parallelism, rounded up to a power of two.
fn default_segment_count() -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    (cpus * 2).next_power_of_two().min(MAX_SEGMENTS)
}

/// Builder for [`OffHeapCache`].
pub struct CacheBuilder {
    capacity: usize,
    segment_count: Option<usize>,
    load_factor: f32,
    initial_buckets: usize,
    max_entry_size: usize,
    hasher: Arc<dyn KeyHasher>,
}

impl Default for CacheBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl CacheBuilder {
    /// Builder for a cache holding up to `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            segment_count: None,
            load_factor: DEFAULT_LOAD_FACTOR,
            initial_buckets: DEFAULT_INITIAL_BUCKETS,
            max_entry_size: 0,
            hasher: HashAlgorithm::default().hasher(),
        }
    }

    pub fn with_segment_count(mut self, segment_count: usize) -> Self {
        self.segment_count = Some(segment_count);
        self
    }

    pub fn with_load_factor(mut self, load_factor: f32) -> Self {
        self.load_factor = load_factor;
        self
    }

    pub fn with_initial_buckets(mut self, initial_buckets: usize) -> Self {
        self.initial_buckets = initial_buckets;
        self
    }

    pub fn with_max_entry_size(mut self, max_entry_size: usize) -> Self {
        self.max_entry_size = max_entry_size;
        self
    }

    pub fn with_hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.hasher = algorithm.hasher();
        self
    }

    pub fn with_hasher(mut self, hasher: impl KeyHasher) -> Self {
        self.hasher = Arc::new(hasher);
        self
    }

    /// Validate the parameters without building a cache.
    pub fn config(self) -> Result<CacheConfig> {
        let config = CacheConfig {
            capacity: self.capacity,
            segment_count: self.segment_count.unwrap_or_else(default_segment_count),
            load_factor: self.load_factor,
            initial_buckets: self.initial_buckets,
            max_entry_size: self.max_entry_size,
            hasher: self.hasher,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn build<K: 'static, V: 'static>(
        self,
        key_serializer: impl Serializer<K>,
        value_serializer: impl Serializer<V>,
    ) -> Result<OffHeapCache<K, V>> {
        OffHeapCache::new(self.config()?, Arc::new(key_serializer), Arc::new(value_serializer))
    }
}
