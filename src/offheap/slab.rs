/// Slot table owning the table's reference to every linked entry of a
/// segment.
///
/// Chain and lru links stored in entry headers are slot indices into this
/// table, so following a link is a bounds-checked lookup rather than a raw
/// pointer dereference. Freed slots are reused through a free list.
use crate::entry::EntryRef;
use crate::error::{invariant, invariant_violation};
use crate::offheap::layout::{decode_link, encode_link};

#[derive(Default)]
pub struct Slab {
    slots: Vec<Option<EntryRef>>,
    free: Vec<u32>,
    len: usize,
}

impl Slab {
    pub fn insert(&mut self, entry: EntryRef) -> u32 {
        self.len += 1;
        match self.free.pop() {
            Some(slot) => {
                let cell = &mut self.slots[slot as usize];
                invariant!(cell.is_none(), "free list points at occupied slot {}", slot);
                *cell = Some(entry);
                slot
            }
            None => {
                let slot = self.slots.len();
                invariant!(slot < u32::MAX as usize, "slab exhausted");
                self.slots.push(Some(entry));
                slot as u32
            }
        }
    }

    /// Take the table's reference out of `slot`.
    pub fn remove(&mut self, slot: u32) -> EntryRef {
        let entry = self
            .slots
            .get_mut(slot as usize)
            .and_then(Option::take)
            .unwrap_or_else(|| {
                invariant_violation(format_args!("remove of vacant slot {slot}"))
            });
        self.free.push(slot);
        self.len -= 1;
        entry
    }

    pub fn get(&self, slot: u32) -> &EntryRef {
        match self.slots.get(slot as usize) {
            Some(Some(entry)) => entry,
            _ => invariant_violation(format_args!("dangling slot {slot}")),
        }
    }

    pub fn get_mut(&mut self, slot: u32) -> &mut EntryRef {
        match self.slots.get_mut(slot as usize) {
            Some(Some(entry)) => entry,
            _ => invariant_violation(format_args!("dangling slot {slot}")),
        }
    }

    /// Resolve a link to its slot, `None` for the end of a list.
    pub fn follow(&self, link: u64) -> Option<(u32, &EntryRef)> {
        decode_link(link).map(|slot| (slot, self.get(slot)))
    }

    /// Like [`Slab::follow`] without borrowing the entry.
    pub fn resolve(&self, link: u64) -> Option<u32> {
        self.follow(link).map(|(slot, _)| slot)
    }

    pub fn link_of(slot: u32) -> u64 {
        encode_link(slot)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Hand back every entry, leaving the slab empty.
    pub fn drain(&mut self) -> Vec<EntryRef> {
        self.free.clear();
        self.len = 0;
        self.slots.drain(..).flatten().collect()
    }
}
