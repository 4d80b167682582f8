/// Chained hash table whose bucket array lives off-heap.
///
/// Each bucket holds the link of the first entry in its chain; entries carry
/// the link to the next one in their header. New entries go to the chain
/// head. The bucket index is `hash & (count - 1)`, the segment having already
/// been chosen by the high bits.
use crate::error::{invariant, Result};
use crate::offheap::layout::{BUCKET_SIZE, LINK_NONE};
use crate::offheap::memory::RawBlock;
use crate::offheap::slab::Slab;

/// Upper bound on buckets per segment.
pub const MAX_BUCKETS: usize = 1 << 30;

pub struct Buckets {
    block: RawBlock,
    mask: u64,
}

impl Buckets {
    /// Zeroed bucket array; `count` must be a power of two.
    pub fn new(count: usize) -> Result<Self> {
        invariant!(
            count.is_power_of_two() && count <= MAX_BUCKETS,
            "bad bucket count {}",
            count
        );
        Ok(Self {
            block: RawBlock::allocate(count * BUCKET_SIZE)?,
            mask: count as u64 - 1,
        })
    }

    pub fn count(&self) -> usize {
        self.mask as usize + 1
    }

    #[inline]
    pub fn index(&self, hash: u64) -> usize {
        (hash & self.mask) as usize
    }

    #[inline]
    pub fn head(&self, index: usize) -> u64 {
        self.block.read_u64(index * BUCKET_SIZE)
    }

    #[inline]
    pub fn set_head(&mut self, index: usize, link: u64) {
        self.block.write_u64(index * BUCKET_SIZE, link)
    }

    /// Walk the chain for `hash`, comparing the cached hash before the key
    /// bytes.
    pub fn find(&self, slab: &Slab, hash: u64, key: &[u8]) -> Option<u32> {
        let mut link = self.head(self.index(hash));
        while let Some((slot, entry)) = slab.follow(link) {
            if entry.matches(hash, key) {
                return Some(slot);
            }
            link = entry.next();
        }
        None
    }

    /// Link `slot` at the head of its chain.
    pub fn insert(&mut self, slab: &mut Slab, slot: u32) {
        let index = self.index(slab.get(slot).hash());
        let head = self.head(index);
        slab.get_mut(slot).set_next(head);
        self.set_head(index, Slab::link_of(slot));
    }

    /// Unlink `slot` from its chain. The slot must be linked.
    pub fn unlink(&mut self, slab: &mut Slab, slot: u32) {
        let target = Slab::link_of(slot);
        let entry = slab.get(slot);
        let index = self.index(entry.hash());
        let next = entry.next();

        let head = self.head(index);
        if head == target {
            self.set_head(index, next);
        } else {
            let mut link = head;
            loop {
                let Some((prev_slot, prev)) = slab.follow(link) else {
                    crate::error::invariant_violation(format_args!(
                        "slot {slot} missing from bucket {index}"
                    ));
                };
                if prev.next() == target {
                    slab.get_mut(prev_slot).set_next(next);
                    break;
                }
                link = prev.next();
            }
        }
        slab.get_mut(slot).set_next(LINK_NONE);
    }

    /// Re-link every entry into a fresh array of `count` buckets using the
    /// cached hashes. Each chain is walked once; on allocation failure the
    /// current array stays in place untouched.
    pub fn rehash(&mut self, slab: &mut Slab, count: usize) -> Result<()> {
        let mut fresh = Buckets::new(count)?;
        let mut moved = 0;
        for index in 0..self.count() {
            let mut link = self.head(index);
            while let Some((slot, entry)) = slab.follow(link) {
                link = entry.next();
                fresh.insert(slab, slot);
                moved += 1;
            }
        }
        invariant!(
            moved == slab.len(),
            "rehash moved {} entries, slab holds {}",
            moved,
            slab.len()
        );
        *self = fresh;
        Ok(())
    }

    /// Number of entries chained at `index`.
    pub fn chain_len(&self, slab: &Slab, index: usize) -> usize {
        let mut len = 0;
        let mut link = self.head(index);
        while let Some((_, entry)) = slab.follow(link) {
            len += 1;
            link = entry.next();
        }
        len
    }

    pub fn longest_chain(&self, slab: &Slab) -> usize {
        (0..self.count())
            .map(|index| self.chain_len(slab, index))
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryRef;
    use crate::offheap::layout::EntryWriter;
    use crate::serde::DataOutput;

    /// Entry whose "hash" is chosen by the test so bucket placement is known.
    fn entry_with_hash(hash: u64, key: &[u8]) -> EntryRef {
        let mut writer = EntryWriter::begin(key.len(), 0).unwrap();
        writer.write_bytes(key).unwrap();
        writer.finish_key(&move |_: &[u8]| hash).unwrap();
        writer.finish().unwrap()
    }

    fn table(count: usize, entries: &[(u64, &[u8])]) -> (Buckets, Slab) {
        let mut buckets = Buckets::new(count).unwrap();
        let mut slab = Slab::default();
        for &(hash, key) in entries {
            let slot = slab.insert(entry_with_hash(hash, key));
            buckets.insert(&mut slab, slot);
        }
        (buckets, slab)
    }

    #[test]
    fn insert_and_find() {
        let (buckets, slab) = table(8, &[(42, b"hello")]);
        assert_eq!(buckets.find(&slab, 42, b"hello"), Some(0));
        assert_eq!(buckets.find(&slab, 42, b"world"), None);
        assert_eq!(buckets.find(&slab, 99, b"hello"), None);
    }

    #[test]
    fn colliding_hashes_share_a_chain() {
        // 0x10 & 7 == 0x08 & 7 == 0
        let (buckets, slab) = table(8, &[(0x10, b"aaa"), (0x08, b"bbb"), (0x10, b"ccc")]);
        assert_eq!(buckets.find(&slab, 0x10, b"aaa"), Some(0));
        assert_eq!(buckets.find(&slab, 0x08, b"bbb"), Some(1));
        assert_eq!(buckets.find(&slab, 0x10, b"ccc"), Some(2));
        assert_eq!(buckets.chain_len(&slab, 0), 3);
        assert_eq!(buckets.longest_chain(&slab), 3);
    }

    #[test]
    fn unlink_head_middle_and_tail() {
        let (mut buckets, mut slab) =
            table(8, &[(1, b"k1"), (9, b"k2"), (17, b"k3"), (25, b"k4")]);
        // Chain order is k4, k3, k2, k1.
        buckets.unlink(&mut slab, 2);
        assert_eq!(buckets.find(&slab, 17, b"k3"), None);
        buckets.unlink(&mut slab, 3);
        buckets.unlink(&mut slab, 0);
        assert_eq!(buckets.find(&slab, 9, b"k2"), Some(1));
        assert_eq!(buckets.chain_len(&slab, 1), 1);
    }

    #[test]
    fn rehash_keeps_every_entry_reachable() {
        let entries: Vec<(u64, Vec<u8>)> =
            (0..64u64).map(|i| (i * 7, format!("k{i}").into_bytes())).collect();
        let refs: Vec<(u64, &[u8])> = entries.iter().map(|(h, k)| (*h, k.as_slice())).collect();
        let (mut buckets, mut slab) = table(4, &refs);

        buckets.rehash(&mut slab, 64).unwrap();
        assert_eq!(buckets.count(), 64);
        for (slot, (hash, key)) in entries.iter().enumerate() {
            assert_eq!(buckets.find(&slab, *hash, key), Some(slot as u32));
        }
        let chained: usize = (0..64).map(|index| buckets.chain_len(&slab, index)).sum();
        assert_eq!(chained, 64);
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn unlinking_an_unlinked_slot_is_fatal() {
        let (mut buckets, mut slab) = table(8, &[(1, b"k1"), (9, b"k2")]);
        buckets.unlink(&mut slab, 0);
        buckets.unlink(&mut slab, 0);
    }
}
