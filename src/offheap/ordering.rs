/// Intrusive doubly-linked lru list.
///
/// Uses the prev/next links stored in each entry header. The head is the
/// least recently used entry and the next eviction victim, the tail the most
/// recently used one.
use crate::offheap::layout::LINK_NONE;
use crate::offheap::slab::Slab;

#[derive(Debug)]
pub struct LruList {
    head: u64,
    tail: u64,
}

impl Default for LruList {
    fn default() -> Self {
        Self {
            head: LINK_NONE,
            tail: LINK_NONE,
        }
    }
}

impl LruList {
    /// Least recently used slot.
    pub fn head(&self, slab: &Slab) -> Option<u32> {
        slab.resolve(self.head)
    }

    /// Push a slot to the tail of the list (most recently used position).
    pub fn push_tail(&mut self, slab: &mut Slab, slot: u32) {
        let link = Slab::link_of(slot);
        let entry = slab.get_mut(slot);
        entry.set_lru_prev(self.tail);
        entry.set_lru_next(LINK_NONE);

        match slab.resolve(self.tail) {
            Some(tail) => slab.get_mut(tail).set_lru_next(link),
            None => self.head = link,
        }

        self.tail = link;
    }

    /// Remove a slot from the list.
    pub fn remove(&mut self, slab: &mut Slab, slot: u32) {
        let entry = slab.get(slot);
        let prev = entry.lru_prev();
        let next = entry.lru_next();

        match slab.resolve(prev) {
            Some(prev) => slab.get_mut(prev).set_lru_next(next),
            None => self.head = next,
        }

        match slab.resolve(next) {
            Some(next) => slab.get_mut(next).set_lru_prev(prev),
            None => self.tail = prev,
        }

        let entry = slab.get_mut(slot);
        entry.set_lru_prev(LINK_NONE);
        entry.set_lru_next(LINK_NONE);
    }

    /// Move a slot to the tail of the list (touch).
    pub fn move_to_tail(&mut self, slab: &mut Slab, slot: u32) {
        if self.tail == Slab::link_of(slot) {
            return;
        }
        self.remove(slab, slot);
        self.push_tail(slab, slot);
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Slots from least to most recently used.
    pub fn iter<'a>(&self, slab: &'a Slab) -> impl Iterator<Item = u32> + 'a {
        let mut link = self.head;
        std::iter::from_fn(move || {
            let (slot, entry) = slab.follow(link)?;
            link = entry.lru_next();
            Some(slot)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryRef;
    use crate::hasher::XxHasher64;
    use crate::offheap::layout::EntryWriter;
    use crate::serde::DataOutput;

    fn entry(key: u8) -> EntryRef {
        let mut writer = EntryWriter::begin(1, 0).unwrap();
        writer.write_u8(key).unwrap();
        writer.finish_key(&XxHasher64::default()).unwrap();
        writer.finish().unwrap()
    }

    fn list(n: u8) -> (LruList, Slab) {
        let mut lru = LruList::default();
        let mut slab = Slab::default();
        for key in 0..n {
            let slot = slab.insert(entry(key));
            lru.push_tail(&mut slab, slot);
        }
        (lru, slab)
    }

    #[test]
    fn push_keeps_insertion_order() {
        let (lru, slab) = list(4);
        assert_eq!(lru.iter(&slab).collect::<Vec<_>>(), [0, 1, 2, 3]);
        assert_eq!(lru.head(&slab), Some(0));
    }

    #[test]
    fn touch_moves_to_tail() {
        let (mut lru, mut slab) = list(4);
        lru.move_to_tail(&mut slab, 0);
        lru.move_to_tail(&mut slab, 2);
        lru.move_to_tail(&mut slab, 2);
        assert_eq!(lru.iter(&slab).collect::<Vec<_>>(), [1, 3, 0, 2]);
        assert_eq!(lru.head(&slab), Some(1));
    }

    #[test]
    fn remove_head_middle_tail() {
        let (mut lru, mut slab) = list(5);
        lru.remove(&mut slab, 0);
        lru.remove(&mut slab, 2);
        lru.remove(&mut slab, 4);
        assert_eq!(lru.iter(&slab).collect::<Vec<_>>(), [1, 3]);
        lru.remove(&mut slab, 1);
        lru.remove(&mut slab, 3);
        assert_eq!(lru.head(&slab), None);
        assert_eq!(lru.iter(&slab).count(), 0);
    }
}
