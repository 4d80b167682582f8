use std::fmt;
use std::sync::atomic::Ordering;

use crate::error::invariant;
use crate::hasher::KeyHasher;
use crate::offheap::layout::{
    ENTRY_OFF_DATA, ENTRY_OFF_HASH, ENTRY_OFF_KEY_LEN, ENTRY_OFF_LRU_NEXT, ENTRY_OFF_LRU_PREV,
    ENTRY_OFF_NEXT, ENTRY_OFF_REFS, ENTRY_OFF_VALUE_LEN,
};
use crate::offheap::memory::{BlockView, RawBlock};

/// A counted reference to an off-heap entry.
///
/// The table holds one reference for as long as the entry is linked, every
/// reader holds another. The block is freed by whichever reference drops the
/// count to zero, so a reader can keep using the bytes after a concurrent
/// remove or eviction has unlinked the entry.
///
/// Key and value bytes never change once the entry is built. The link fields
/// are only touched through the table's own reference under the segment lock.
pub struct EntryRef {
    view: BlockView,
}

impl EntryRef {
    /// Adopt a fully written block; the returned reference is the only one.
    pub(crate) fn from_block(block: RawBlock) -> Self {
        block.view().atomic_u64(ENTRY_OFF_REFS).store(1, Ordering::SeqCst);
        Self {
            view: block.into_view(),
        }
    }

    /// Cached hash of the key bytes.
    pub fn hash(&self) -> u64 {
        self.view.read_u64(ENTRY_OFF_HASH)
    }

    pub fn key_len(&self) -> usize {
        self.view.read_u32(ENTRY_OFF_KEY_LEN) as usize
    }

    pub fn value_len(&self) -> usize {
        self.view.read_u32(ENTRY_OFF_VALUE_LEN) as usize
    }

    /// Serialized key bytes.
    pub fn key(&self) -> &[u8] {
        // Safety: `self` pins the block and the key region is immutable.
        unsafe { self.view.slice(ENTRY_OFF_DATA, self.key_len()) }
    }

    /// Serialized value bytes.
    pub fn value(&self) -> &[u8] {
        // Safety: as for `key`.
        unsafe { self.view.slice(ENTRY_OFF_DATA + self.key_len(), self.value_len()) }
    }

    /// Bytes accounted for this entry, header included.
    pub fn size(&self) -> usize {
        self.view.len()
    }

    /// Current reference count.
    pub fn refs(&self) -> u64 {
        self.view.atomic_u64(ENTRY_OFF_REFS).load(Ordering::Acquire)
    }

    /// Recompute the hash of the stored key with `hasher`.
    pub fn compute_hash(&self, hasher: &dyn KeyHasher) -> u64 {
        hasher.hash(self.key())
    }

    /// Cheap hash check first, full key comparison second.
    pub fn matches(&self, hash: u64, key: &[u8]) -> bool {
        self.hash() == hash && self.key() == key
    }

    /// Drop this reference, reporting whether it was the last one and the
    /// block has been freed.
    pub fn release(self) -> bool {
        let freed = self.unref();
        std::mem::forget(self);
        freed
    }

    fn unref(&self) -> bool {
        // Read before decrementing, another holder may free right after.
        let hash = self.hash();
        let old = self
            .view
            .atomic_u64(ENTRY_OFF_REFS)
            .fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(
            "[entry]: dec entry (hash: {}) refs: {} => {}",
            hash,
            old,
            old.wrapping_sub(1)
        );
        invariant!(old > 0, "entry (hash: {}) released with zero references", hash);
        if old == 1 {
            // Safety: the count reached zero, nobody else can observe the block.
            unsafe { RawBlock::from_view(self.view) }.free();
            return true;
        }
        false
    }

    pub(crate) fn next(&self) -> u64 {
        self.view.read_u64(ENTRY_OFF_NEXT)
    }

    pub(crate) fn lru_prev(&self) -> u64 {
        self.view.read_u64(ENTRY_OFF_LRU_PREV)
    }

    pub(crate) fn lru_next(&self) -> u64 {
        self.view.read_u64(ENTRY_OFF_LRU_NEXT)
    }

    pub(crate) fn set_next(&mut self, link: u64) {
        // Safety: link fields are only accessed by segment code holding the lock.
        unsafe { self.view.write_u64(ENTRY_OFF_NEXT, link) }
    }

    pub(crate) fn set_lru_prev(&mut self, link: u64) {
        unsafe { self.view.write_u64(ENTRY_OFF_LRU_PREV, link) }
    }

    pub(crate) fn set_lru_next(&mut self, link: u64) {
        unsafe { self.view.write_u64(ENTRY_OFF_LRU_NEXT, link) }
    }
}

impl Clone for EntryRef {
    fn clone(&self) -> Self {
        let old = self
            .view
            .atomic_u64(ENTRY_OFF_REFS)
            .fetch_add(1, Ordering::SeqCst);
        tracing::trace!(
            "[entry]: inc entry (hash: {}) refs: {} => {}",
            self.hash(),
            old,
            old + 1
        );
        invariant!(old > 0, "entry (hash: {}) revived from zero references", self.hash());
        Self { view: self.view }
    }
}

impl Drop for EntryRef {
    fn drop(&mut self) {
        self.unref();
    }
}

impl fmt::Debug for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryRef")
            .field("hash", &self.hash())
            .field("key_len", &self.key_len())
            .field("value_len", &self.value_len())
            .field("refs", &self.refs())
            .finish()
    }
}
