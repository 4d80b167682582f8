/// Byte layout of one cache entry and the writer that builds it.
///
/// An entry is a single [`RawBlock`]:
///
/// ```text
///  0..8   reference count   (native, atomic)
///  8..16  chain next        (link)
/// 16..24  lru prev          (link)
/// 24..32  lru next          (link)
/// 32..40  key hash
/// 40..44  key length
/// 44..48  value length
/// 48..    key bytes, then value bytes
/// ```
///
/// Links hold `slot + 1` of the owning segment's slab, `LINK_NONE` ends a
/// list. Everything except the reference count is big-endian.
use crate::entry::EntryRef;
use crate::error::{invariant, Error, Result};
use crate::hasher::KeyHasher;
use crate::offheap::memory::RawBlock;
use crate::serde::DataOutput;

pub const ENTRY_OFF_REFS: usize = 0;
pub const ENTRY_OFF_NEXT: usize = 8;
pub const ENTRY_OFF_LRU_PREV: usize = 16;
pub const ENTRY_OFF_LRU_NEXT: usize = 24;
pub const ENTRY_OFF_HASH: usize = 32;
pub const ENTRY_OFF_KEY_LEN: usize = 40;
pub const ENTRY_OFF_VALUE_LEN: usize = 44;
pub const ENTRY_OFF_DATA: usize = 48;

/// Fixed per-entry overhead.
pub const ENTRY_HEADER_SIZE: usize = ENTRY_OFF_DATA;

/// Sentinel meaning "no entry" in chain and lru links.
pub const LINK_NONE: u64 = 0;

/// One bucket head in a segment's bucket array.
pub const BUCKET_SIZE: usize = 8;

/// Total block length of an entry.
#[inline]
pub fn entry_size(key_len: usize, value_len: usize) -> usize {
    ENTRY_HEADER_SIZE + key_len + value_len
}

#[inline]
pub fn encode_link(slot: u32) -> u64 {
    slot as u64 + 1
}

#[inline]
pub fn decode_link(link: u64) -> Option<u32> {
    match link {
        LINK_NONE => None,
        link => {
            invariant!(link <= u32::MAX as u64 + 1, "corrupt link {:#x}", link);
            Some((link - 1) as u32)
        }
    }
}

/// Sequential writer filling a freshly allocated entry.
///
/// The key region is written first and sealed with [`EntryWriter::finish_key`],
/// which fixes the hash so the caller can route before the value is written.
pub struct EntryWriter {
    block: RawBlock,
    key_len: usize,
    value_len: usize,
    pos: usize,
    limit: usize,
    key_sealed: bool,
}

impl EntryWriter {
    /// Allocate an entry for a key and value of the given serialized sizes.
    pub fn begin(key_len: usize, value_len: usize) -> Result<Self> {
        let max = u32::MAX as usize;
        if key_len > max || value_len > max {
            return Err(Error::EntryTooLarge {
                size: key_len.saturating_add(value_len),
                max,
            });
        }

        let mut block = RawBlock::allocate_uninit(entry_size(key_len, value_len))?;
        block.fill(0, ENTRY_HEADER_SIZE, 0);
        block.write_u32(ENTRY_OFF_KEY_LEN, key_len as u32);
        block.write_u32(ENTRY_OFF_VALUE_LEN, value_len as u32);

        Ok(Self {
            block,
            key_len,
            value_len,
            pos: ENTRY_OFF_DATA,
            limit: ENTRY_OFF_DATA + key_len,
            key_sealed: false,
        })
    }

    /// Bytes left in the region currently being written.
    pub fn remaining(&self) -> usize {
        self.limit - self.pos
    }

    /// Seal the key region, hash it and move on to the value region.
    pub fn finish_key(&mut self, hasher: &dyn KeyHasher) -> Result<u64> {
        invariant!(!self.key_sealed, "entry key sealed twice");
        if self.pos != self.limit {
            return Err(Error::SizeMismatch {
                declared: self.key_len,
                written: self.pos - ENTRY_OFF_DATA,
            });
        }

        let hash = compute_hash(&self.block, hasher);
        self.block.write_u64(ENTRY_OFF_HASH, hash);
        self.limit += self.value_len;
        self.key_sealed = true;
        Ok(hash)
    }

    /// Seal the value region and hand the entry over with a reference count
    /// of one.
    pub fn finish(self) -> Result<EntryRef> {
        invariant!(self.key_sealed, "entry finished before its key was sealed");
        if self.pos != self.limit {
            return Err(Error::SizeMismatch {
                declared: self.value_len,
                written: self.pos - ENTRY_OFF_DATA - self.key_len,
            });
        }
        Ok(EntryRef::from_block(self.block))
    }
}

impl DataOutput for EntryWriter {
    fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        let remaining = self.remaining();
        if src.len() > remaining {
            return Err(Error::BufferOverrun {
                capacity: remaining,
                requested: src.len(),
            });
        }
        self.block.copy_from_slice(self.pos, src);
        self.pos += src.len();
        Ok(())
    }
}

/// Hash exactly the key region of an entry block.
pub fn compute_hash(block: &RawBlock, hasher: &dyn KeyHasher) -> u64 {
    let key_len = block.read_u32(ENTRY_OFF_KEY_LEN) as usize;
    hasher.hash(block.as_slice(ENTRY_OFF_DATA, key_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::XxHasher64;

    #[test]
    fn header_is_written_big_endian() {
        let mut writer = EntryWriter::begin(3, 2).unwrap();
        writer.write_bytes(b"abc").unwrap();
        let hash = writer.finish_key(&XxHasher64::default()).unwrap();
        writer.write_u16(0x0102).unwrap();
        let entry = writer.finish().unwrap();

        assert_eq!(entry.hash(), hash);
        assert_eq!(entry.size(), ENTRY_HEADER_SIZE + 5);
        assert_eq!(entry.key(), b"abc");
        assert_eq!(entry.value(), &[1, 2]);
        assert_eq!(entry.refs(), 1);
        assert_eq!(hash, XxHasher64::default().hash(b"abc"));
    }

    #[test]
    fn overrun_is_rejected_without_writing() {
        let mut writer = EntryWriter::begin(2, 0).unwrap();
        assert!(matches!(
            writer.write_u32(7),
            Err(Error::BufferOverrun {
                capacity: 2,
                requested: 4
            })
        ));
        writer.write_u16(7).unwrap();
        assert!(matches!(writer.write_u8(1), Err(Error::BufferOverrun { .. })));
    }

    #[test]
    fn value_cannot_spill_into_key_region_and_vice_versa() {
        let mut writer = EntryWriter::begin(1, 1).unwrap();
        assert!(writer.write_u16(1).is_err());
        writer.write_u8(1).unwrap();
        writer.finish_key(&XxHasher64::default()).unwrap();
        assert!(writer.write_u16(1).is_err());
        writer.write_u8(2).unwrap();
        let entry = writer.finish().unwrap();
        assert_eq!(entry.key(), &[1]);
        assert_eq!(entry.value(), &[2]);
    }

    #[test]
    fn short_writes_are_reported() {
        let mut writer = EntryWriter::begin(4, 0).unwrap();
        writer.write_u8(1).unwrap();
        assert!(matches!(
            writer.finish_key(&XxHasher64::default()),
            Err(Error::SizeMismatch {
                declared: 4,
                written: 1
            })
        ));
    }

    #[test]
    fn links() {
        assert_eq!(decode_link(LINK_NONE), None);
        assert_eq!(decode_link(encode_link(0)), Some(0));
        assert_eq!(decode_link(encode_link(41)), Some(41));
    }
}
