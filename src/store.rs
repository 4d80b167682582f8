use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::entry::EntryRef;
use crate::error::{Error, Result};
use crate::hasher::KeyHasher;
use crate::key::KeyBuffer;
use crate::offheap::layout::{entry_size, EntryWriter};
use crate::offheap::segment::{PutMode, Segment, SegmentStats};
use crate::serde::{DataInput, Serializer};

/// Aggregated counters of all segments.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheInfo {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub removes: u64,
    pub evictions: u64,
    pub rehashes: u64,
    pub entries: usize,
    pub size: usize,
    pub capacity: usize,
    pub segment_count: usize,
}

/// Concurrent off-heap hash table with per-segment lru eviction.
///
/// Keys and values are stored as serialized bytes in untracked memory. The
/// top bits of a key's hash pick the segment, the low bits the bucket
/// within it. Each operation locks exactly one segment.
pub struct OffHeapCache<K, V> {
    segments: Box<[Segment]>,
    segment_shift: u32,
    capacity: AtomicUsize,
    /// Bytes of all linked entries, header included.
    usage: Arc<AtomicUsize>,
    max_entry_size: usize,
    entry_limit: AtomicUsize,
    hasher: Arc<dyn KeyHasher>,
    key_serializer: Arc<dyn Serializer<K>>,
    value_serializer: Arc<dyn Serializer<V>>,
}

impl<K: 'static, V: 'static> OffHeapCache<K, V> {
    pub fn new(
        config: CacheConfig,
        key_serializer: Arc<dyn Serializer<K>>,
        value_serializer: Arc<dyn Serializer<V>>,
    ) -> Result<Self> {
        let usage = Arc::new(AtomicUsize::new(0));
        let budget = config.segment_budget();
        let segments = (0..config.segment_count)
            .map(|id| {
                Segment::new(
                    id,
                    budget,
                    config.initial_buckets,
                    config.load_factor,
                    usage.clone(),
                )
            })
            .collect::<Result<Vec<_>>>()?
            .into_boxed_slice();

        tracing::debug!(
            "[cache]: created with {} segments, {} bytes each",
            config.segment_count,
            budget
        );

        Ok(Self {
            segments,
            segment_shift: 64 - config.segment_count.trailing_zeros(),
            capacity: AtomicUsize::new(config.capacity),
            usage,
            max_entry_size: config.max_entry_size,
            entry_limit: AtomicUsize::new(config.entry_limit()),
            hasher: config.hasher,
            key_serializer,
            value_serializer,
        })
    }

    /// Segment owning `hash`: the highest bits decide.
    #[inline]
    fn segment(&self, hash: u64) -> &Segment {
        let index = hash.checked_shr(self.segment_shift).unwrap_or(0) as usize;
        &self.segments[index]
    }

    fn key_buffer(&self, key: &K) -> Result<KeyBuffer> {
        let mut buffer = KeyBuffer::new(self.key_serializer.serialized_size(key));
        self.key_serializer.serialize(key, &mut buffer)?;
        buffer.finish(&*self.hasher)
    }

    /// Serialized value bytes in ordinary memory, for comparisons.
    fn value_bytes(&self, value: &V) -> Result<Vec<u8>> {
        let declared = self.value_serializer.serialized_size(value);
        let mut bytes = Vec::with_capacity(declared);
        self.value_serializer.serialize(value, &mut bytes)?;
        if bytes.len() != declared {
            return Err(Error::SizeMismatch {
                declared,
                written: bytes.len(),
            });
        }
        Ok(bytes)
    }

    /// Serialize key and value straight into a new off-heap entry.
    fn build_entry(&self, key: &K, value: &V) -> Result<EntryRef> {
        let key_len = self.key_serializer.serialized_size(key);
        let value_len = self.value_serializer.serialized_size(value);
        let size = entry_size(key_len, value_len);
        let max = self.entry_limit.load(Ordering::Relaxed);
        if size > max {
            tracing::warn!("[cache]: rejected entry of {} bytes (max {})", size, max);
            return Err(Error::EntryTooLarge { size, max });
        }

        let mut writer = EntryWriter::begin(key_len, value_len)?;
        self.key_serializer.serialize(key, &mut writer)?;
        writer.finish_key(&*self.hasher)?;
        self.value_serializer.serialize(value, &mut writer)?;
        writer.finish()
    }

    fn put_with(&self, key: &K, value: &V, mode: PutMode<'_>) -> Result<bool> {
        let entry = self.build_entry(key, value)?;
        let segment = self.segment(entry.hash());
        Ok(segment.put(entry, mode))
    }

    /// Look up `key` and decode its value.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        match self.get_direct(key)? {
            Some(entry) => {
                let value = self
                    .value_serializer
                    .deserialize(&mut DataInput::new(entry.value()));
                entry.release();
                value.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Look up `key` without decoding. The returned reference keeps the entry
    /// bytes alive until it is dropped, even if the key is removed or evicted
    /// meanwhile.
    pub fn get_direct(&self, key: &K) -> Result<Option<EntryRef>> {
        let key = self.key_buffer(key)?;
        Ok(self.segment(key.hash()).find(key.hash(), key.as_bytes()))
    }

    /// Presence check; does not count as an access.
    pub fn contains_key(&self, key: &K) -> Result<bool> {
        let key = self.key_buffer(key)?;
        Ok(self.segment(key.hash()).contains(key.hash(), key.as_bytes()))
    }

    /// Insert or replace.
    pub fn put(&self, key: &K, value: &V) -> Result<()> {
        self.put_with(key, value, PutMode::Always).map(|_| ())
    }

    /// Insert only if `key` is absent. Returns whether it was inserted.
    pub fn put_if_absent(&self, key: &K, value: &V) -> Result<bool> {
        self.put_with(key, value, PutMode::IfAbsent)
    }

    /// Replace only if `key` is present. Returns whether it was replaced.
    pub fn replace(&self, key: &K, value: &V) -> Result<bool> {
        self.put_with(key, value, PutMode::IfPresent)
    }

    /// Replace only if the stored value serializes to the same bytes as
    /// `old`.
    pub fn replace_if(&self, key: &K, old: &V, value: &V) -> Result<bool> {
        let expected = self.value_bytes(old)?;
        self.put_with(key, value, PutMode::IfValue(&expected))
    }

    /// Remove `key`. Returns whether anything was removed.
    pub fn remove(&self, key: &K) -> Result<bool> {
        let key = self.key_buffer(key)?;
        Ok(self.segment(key.hash()).remove(key.hash(), key.as_bytes()))
    }

    /// Remove every entry.
    pub fn clear(&self) {
        for segment in self.segments.iter() {
            segment.clear();
        }
    }

    /// Decoded keys of all entries at the time each segment is visited.
    pub fn keys(&self) -> Result<Vec<K>> {
        let mut keys = Vec::new();
        for segment in self.segments.iter() {
            for entry in segment.entries() {
                keys.push(self.key_serializer.deserialize(&mut DataInput::new(entry.key()))?);
            }
        }
        Ok(keys)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(Segment::is_empty)
    }

    /// Bytes of all entries, headers included.
    pub fn size_bytes(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Change the total budget. Segments that no longer fit evict at once.
    pub fn set_capacity(&self, capacity: usize) -> Result<()> {
        if capacity < self.segments.len() {
            return Err(Error::Config(format!(
                "capacity {} too small for {} segments",
                capacity,
                self.segments.len()
            )));
        }
        let budget = capacity / self.segments.len();
        let limit = match self.max_entry_size {
            0 => budget,
            max => max.min(budget),
        };
        self.capacity.store(capacity, Ordering::Relaxed);
        self.entry_limit.store(limit, Ordering::Relaxed);
        for segment in self.segments.iter() {
            segment.set_budget(budget);
        }
        tracing::debug!("[cache]: capacity set to {} bytes, {} per segment", capacity, budget);
        Ok(())
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment_stats(&self) -> Vec<SegmentStats> {
        self.segments.iter().map(Segment::stats).collect()
    }

    pub fn info(&self) -> CacheInfo {
        let mut info = CacheInfo {
            capacity: self.capacity(),
            segment_count: self.segments.len(),
            ..Default::default()
        };
        for stats in self.segment_stats() {
            info.hits += stats.hits;
            info.misses += stats.misses;
            info.puts += stats.puts;
            info.removes += stats.removes;
            info.evictions += stats.evictions;
            info.rehashes += stats.rehashes;
            info.entries += stats.entries;
            info.size += stats.size;
        }
        info
    }

    /// Index of the segment a key routes to.
    pub fn segment_of(&self, key: &K) -> Result<usize> {
        let key = self.key_buffer(key)?;
        Ok(key.hash().checked_shr(self.segment_shift).unwrap_or(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheBuilder;
    use crate::serde::{BytesSerializer, DataOutput, StringSerializer, U64Serializer};

    fn cache(capacity: usize, segments: usize) -> OffHeapCache<String, Vec<u8>> {
        CacheBuilder::new(capacity)
            .with_segment_count(segments)
            .with_initial_buckets(4)
            .build(StringSerializer, BytesSerializer)
            .unwrap()
    }

    #[test_log::test]
    fn round_trip() {
        let cache = cache(1 << 20, 4);
        cache.put(&"k".to_string(), &b"v".to_vec()).unwrap();
        assert_eq!(cache.get(&"k".to_string()).unwrap(), Some(b"v".to_vec()));
        assert_eq!(cache.get(&"missing".to_string()).unwrap(), None);
        let info = cache.info();
        assert_eq!((info.hits, info.misses, info.puts), (1, 1, 1));
    }

    #[test_log::test]
    fn conditional_operations() {
        let cache = cache(1 << 20, 2);
        let k = "k".to_string();
        assert!(!cache.replace(&k, &vec![0]).unwrap());
        assert!(cache.put_if_absent(&k, &vec![1]).unwrap());
        assert!(!cache.put_if_absent(&k, &vec![2]).unwrap());
        assert!(!cache.replace_if(&k, &vec![9], &vec![3]).unwrap());
        assert!(cache.replace_if(&k, &vec![1], &vec![4]).unwrap());
        assert!(cache.replace(&k, &vec![5]).unwrap());
        assert_eq!(cache.get(&k).unwrap(), Some(vec![5]));
        assert_eq!(cache.len(), 1);
    }

    /// Declares one byte more than it writes.
    struct ShortSerializer;

    impl Serializer<Vec<u8>> for ShortSerializer {
        fn serialized_size(&self, value: &Vec<u8>) -> usize {
            value.len() + 1
        }

        fn serialize(&self, value: &Vec<u8>, out: &mut dyn DataOutput) -> Result<()> {
            out.write_bytes(value)
        }

        fn deserialize(&self, input: &mut DataInput<'_>) -> Result<Vec<u8>> {
            Ok(input.read_remaining().to_vec())
        }
    }

    #[test_log::test]
    fn replace_if_compares_serialized_values() {
        let cache: OffHeapCache<String, String> = CacheBuilder::new(1 << 20)
            .with_segment_count(2)
            .build(StringSerializer, StringSerializer)
            .unwrap();
        let k = "k".to_string();
        assert!(!cache.replace_if(&k, &"a".to_string(), &"b".to_string()).unwrap());
        cache.put(&k, &"a".to_string()).unwrap();
        assert!(!cache.replace_if(&k, &"ab".to_string(), &"b".to_string()).unwrap());
        assert!(cache.replace_if(&k, &"a".to_string(), &"b".to_string()).unwrap());
        assert_eq!(cache.get(&k).unwrap(), Some("b".to_string()));

        let short: OffHeapCache<String, Vec<u8>> = CacheBuilder::new(1 << 20)
            .with_segment_count(2)
            .build(StringSerializer, ShortSerializer)
            .unwrap();
        assert!(matches!(
            short.replace_if(&k, &vec![1], &vec![2]),
            Err(Error::SizeMismatch {
                declared: 2,
                written: 1
            })
        ));
    }

    #[test_log::test]
    fn oversized_entry_is_rejected_without_side_effects() {
        let cache = cache(4096, 4);
        cache.put(&"a".to_string(), &vec![1; 10]).unwrap();
        let before = cache.size_bytes();
        let err = cache.put(&"b".to_string(), &vec![0; 2000]).unwrap_err();
        assert!(matches!(err, Error::EntryTooLarge { max: 1024, .. }));
        assert_eq!(cache.size_bytes(), before);
        assert_eq!(cache.len(), 1);
    }

    #[test_log::test]
    fn segment_routing_uses_high_bits() {
        let cache: OffHeapCache<u64, u64> = CacheBuilder::new(1 << 20)
            .with_segment_count(4)
            .with_hasher(|bytes: &[u8]| u64::from_be_bytes(bytes.try_into().unwrap()))
            .build(U64Serializer, U64Serializer)
            .unwrap();
        assert_eq!(cache.segment_of(&0).unwrap(), 0);
        assert_eq!(cache.segment_of(&(1 << 62)).unwrap(), 1);
        assert_eq!(cache.segment_of(&(3 << 62)).unwrap(), 3);
        assert_eq!(cache.segment_of(&0xffff).unwrap(), 0);
    }

    #[test_log::test]
    fn single_segment_routing() {
        let cache: OffHeapCache<u64, u64> = CacheBuilder::new(1 << 20)
            .with_segment_count(1)
            .build(U64Serializer, U64Serializer)
            .unwrap();
        for i in 0..100 {
            cache.put(&i, &(i * 2)).unwrap();
        }
        assert_eq!(cache.get(&42).unwrap(), Some(84));
        assert_eq!(cache.segment_count(), 1);
    }

    #[test_log::test]
    fn set_capacity_evicts() {
        let cache = cache(1 << 20, 1);
        for i in 0..100 {
            cache.put(&format!("{i:03}"), &vec![0; 100]).unwrap();
        }
        cache.set_capacity(10 * 1024).unwrap();
        assert!(cache.size_bytes() <= 10 * 1024);
        assert!(cache.info().evictions > 0);
        assert!(cache.get(&"099".to_string()).unwrap().is_some());
        assert!(cache.get(&"000".to_string()).unwrap().is_none());
        assert!(cache.set_capacity(0).is_err());
    }

    #[test_log::test]
    fn keys_and_clear() {
        let cache = cache(1 << 20, 4);
        for i in 0..20 {
            cache.put(&i.to_string(), &vec![i as u8]).unwrap();
        }
        let mut keys: Vec<u32> = cache.keys().unwrap().iter().map(|k| k.parse().unwrap()).collect();
        keys.sort_unstable();
        assert_eq!(keys, (0..20).collect::<Vec<_>>());

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.size_bytes(), 0);
    }
}
