/// One independently locked shard of the table.
///
/// A segment owns a bucket array, a slab holding the table's reference to
/// each linked entry, an lru list and its byte accounting. Every traversal and
/// every mutation happens under the segment mutex; readers leave the lock
/// holding their own [`EntryRef`] and never touch links afterwards.
///
/// Inserting may evict from the lru head until the segment is back within its
/// budget, and may double the bucket array when the load factor is exceeded.
/// Both happen inline, under the same lock, before the insert returns.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::entry::EntryRef;
use crate::error::{invariant, Result};
use crate::offheap::hashtable::{Buckets, MAX_BUCKETS};
use crate::offheap::ordering::LruList;
use crate::offheap::slab::Slab;

/// How an insert treats an existing entry with the same key.
#[derive(Debug, Clone, Copy)]
pub enum PutMode<'a> {
    /// Insert or replace.
    Always,
    /// Only insert when the key is absent.
    IfAbsent,
    /// Only replace an existing entry.
    IfPresent,
    /// Only replace an existing entry whose value bytes equal these.
    IfValue(&'a [u8]),
}

/// Counters of one segment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub removes: u64,
    pub evictions: u64,
    pub rehashes: u64,
    pub entries: usize,
    pub size: usize,
    pub budget: usize,
    pub buckets: usize,
}

struct SegmentInner {
    buckets: Buckets,
    slab: Slab,
    lru: LruList,
    size: usize,
    budget: usize,
    load_factor: f32,
    hits: u64,
    misses: u64,
    puts: u64,
    removes: u64,
    evictions: u64,
    rehashes: u64,
}

pub struct Segment {
    id: usize,
    inner: Mutex<SegmentInner>,
    /// Table-wide byte usage, shared by all segments.
    usage: Arc<AtomicUsize>,
}

impl Segment {
    pub fn new(
        id: usize,
        budget: usize,
        initial_buckets: usize,
        load_factor: f32,
        usage: Arc<AtomicUsize>,
    ) -> Result<Self> {
        Ok(Self {
            id,
            inner: Mutex::new(SegmentInner {
                buckets: Buckets::new(initial_buckets)?,
                slab: Slab::default(),
                lru: LruList::default(),
                size: 0,
                budget,
                load_factor,
                hits: 0,
                misses: 0,
                puts: 0,
                removes: 0,
                evictions: 0,
                rehashes: 0,
            }),
            usage,
        })
    }

    /// Look up a key and pin the entry for the caller. A hit becomes the most
    /// recently used entry of the segment.
    pub fn find(&self, hash: u64, key: &[u8]) -> Option<EntryRef> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        match inner.buckets.find(&inner.slab, hash, key) {
            Some(slot) => {
                inner.lru.move_to_tail(&mut inner.slab, slot);
                inner.hits += 1;
                Some(inner.slab.get(slot).clone())
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Presence check that leaves the lru order alone.
    pub fn contains(&self, hash: u64, key: &[u8]) -> bool {
        let inner = self.inner.lock();
        inner.buckets.find(&inner.slab, hash, key).is_some()
    }

    /// Link a freshly built entry according to `mode`.
    ///
    /// Returns whether the entry was linked. A displaced entry loses the
    /// table's reference and is freed as soon as its last reader lets go.
    pub fn put(&self, entry: EntryRef, mode: PutMode<'_>) -> bool {
        let hash = entry.hash();
        let mut inner = self.inner.lock();

        let existing = inner.buckets.find(&inner.slab, hash, entry.key());
        let proceed = match (mode, existing) {
            (PutMode::Always, _) => true,
            (PutMode::IfAbsent, existing) => existing.is_none(),
            (PutMode::IfPresent, existing) => existing.is_some(),
            (PutMode::IfValue(old), Some(slot)) => inner.slab.get(slot).value() == old,
            (PutMode::IfValue(_), None) => false,
        };
        if !proceed {
            return false;
        }

        if let Some(slot) = existing {
            drop(self.unlink(&mut inner, slot));
        }
        self.link(&mut inner, entry);
        inner.puts += 1;

        self.evict(&mut inner);
        self.maybe_resize(&mut inner);
        true
    }

    /// Unlink the entry for `key`, if any.
    pub fn remove(&self, hash: u64, key: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        match inner.buckets.find(&inner.slab, hash, key) {
            Some(slot) => {
                drop(self.unlink(&mut inner, slot));
                inner.removes += 1;
                true
            }
            None => false,
        }
    }

    /// Unlink every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let fresh = match Buckets::new(inner.buckets.count()) {
            Ok(buckets) => buckets,
            Err(e) => {
                // Keep the old array and unlink one by one.
                tracing::warn!("[segment {}]: clear without fresh buckets: {}", self.id, e);
                while let Some(slot) = inner.lru.head(&inner.slab) {
                    drop(self.unlink(inner, slot));
                }
                return;
            }
        };
        inner.buckets = fresh;
        inner.lru.clear();
        let entries = inner.slab.drain();
        let freed: usize = entries.iter().map(EntryRef::size).sum();
        inner.size -= freed;
        self.usage.fetch_sub(freed, Ordering::Relaxed);
        invariant!(inner.size == 0, "segment {} size {} after clear", self.id, inner.size);
    }

    /// Change the byte budget, evicting right away if it shrank.
    pub fn set_budget(&self, budget: usize) {
        let mut inner = self.inner.lock();
        inner.budget = budget;
        self.evict(&mut inner);
    }

    /// Snapshot of all linked entries, each pinned for the caller.
    pub fn entries(&self) -> Vec<EntryRef> {
        let inner = self.inner.lock();
        inner.lru.iter(&inner.slab).map(|slot| inner.slab.get(slot).clone()).collect()
    }

    pub fn stats(&self) -> SegmentStats {
        let inner = self.inner.lock();
        SegmentStats {
            hits: inner.hits,
            misses: inner.misses,
            puts: inner.puts,
            removes: inner.removes,
            evictions: inner.evictions,
            rehashes: inner.rehashes,
            entries: inner.slab.len(),
            size: inner.size,
            budget: inner.budget,
            buckets: inner.buckets.count(),
        }
    }

    /// Length of the longest bucket chain. Walks every bucket under the lock.
    pub fn longest_chain(&self) -> usize {
        let inner = self.inner.lock();
        inner.buckets.longest_chain(&inner.slab)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    /// Link at the chain head and the lru tail, and account for the bytes.
    fn link(&self, inner: &mut SegmentInner, entry: EntryRef) {
        let size = entry.size();
        let slot = inner.slab.insert(entry);
        inner.buckets.insert(&mut inner.slab, slot);
        inner.lru.push_tail(&mut inner.slab, slot);
        inner.size += size;
        self.usage.fetch_add(size, Ordering::Relaxed);
    }

    /// Detach from chain and lru and hand back the table's reference.
    fn unlink(&self, inner: &mut SegmentInner, slot: u32) -> EntryRef {
        inner.buckets.unlink(&mut inner.slab, slot);
        inner.lru.remove(&mut inner.slab, slot);
        let entry = inner.slab.remove(slot);
        let size = entry.size();
        invariant!(
            inner.size >= size,
            "segment {} size {} below entry size {}",
            self.id,
            inner.size,
            size
        );
        inner.size -= size;
        self.usage.fetch_sub(size, Ordering::Relaxed);
        entry
    }

    /// Drop least recently used entries until the segment fits its budget.
    fn evict(&self, inner: &mut SegmentInner) {
        let mut evicted = 0;
        let mut freed = 0;
        while inner.size > inner.budget {
            let Some(slot) = inner.lru.head(&inner.slab) else {
                break;
            };
            let entry = self.unlink(inner, slot);
            freed += entry.size();
            evicted += 1;
        }
        if evicted > 0 {
            inner.evictions += evicted;
            tracing::debug!(
                "[segment {}]: evicted {} entries ({} bytes), size {} / budget {}",
                self.id,
                evicted,
                freed,
                inner.size,
                inner.budget
            );
        }
    }

    /// Double the bucket array while the chains are too long.
    fn maybe_resize(&self, inner: &mut SegmentInner) {
        let entries = inner.slab.len() as f64;
        let mut target = inner.buckets.count();
        while entries > target as f64 * inner.load_factor as f64 && target < MAX_BUCKETS {
            target *= 2;
        }
        if target == inner.buckets.count() {
            return;
        }

        let from = inner.buckets.count();
        match inner.buckets.rehash(&mut inner.slab, target) {
            Ok(()) => {
                inner.rehashes += 1;
                tracing::debug!(
                    "[segment {}]: resized buckets {} => {} ({} entries)",
                    self.id,
                    from,
                    target,
                    inner.slab.len()
                );
            }
            Err(e) => {
                // Longer chains are still correct.
                tracing::warn!("[segment {}]: resize to {} buckets failed: {}", self.id, target, e);
            }
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let entries = inner.slab.drain();
        let freed: usize = entries.iter().map(EntryRef::size).sum();
        self.usage.fetch_sub(freed, Ordering::Relaxed);
        // Entries still pinned by readers outlive the segment and are freed
        // by their last reference.
        drop(entries);
    }
}
