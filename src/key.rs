use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};
use crate::hasher::KeyHasher;
use crate::serde::DataOutput;

/// A serialized key held in ordinary memory, used for lookups that do not
/// need an off-heap entry.
///
/// Equality is byte equality and `Hash` feeds the cached key hash, so two
/// buffers with the same bytes are interchangeable wherever they came from.
pub struct KeyBuffer {
    bytes: Vec<u8>,
    capacity: usize,
    hash: u64,
}

impl KeyBuffer {
    /// Empty buffer accepting exactly `size` bytes.
    pub fn new(size: usize) -> Self {
        KeyBuffer {
            bytes: Vec::with_capacity(size),
            capacity: size,
            hash: 0,
        }
    }

    /// Buffer over already serialized bytes, hashed right away.
    pub fn from_bytes(bytes: &[u8], hasher: &dyn KeyHasher) -> Self {
        KeyBuffer {
            bytes: bytes.to_vec(),
            capacity: bytes.len(),
            hash: hasher.hash(bytes),
        }
    }

    /// Compute the hash once the serializer is done.
    pub fn finish(mut self, hasher: &dyn KeyHasher) -> Result<Self> {
        if self.bytes.len() != self.capacity {
            return Err(Error::SizeMismatch {
                declared: self.capacity,
                written: self.bytes.len(),
            });
        }
        self.hash = hasher.hash(&self.bytes);
        Ok(self)
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl DataOutput for KeyBuffer {
    fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        let remaining = self.capacity - self.bytes.len();
        if src.len() > remaining {
            return Err(Error::BufferOverrun {
                capacity: remaining,
                requested: src.len(),
            });
        }
        self.bytes.extend_from_slice(src);
        Ok(())
    }
}

impl Hash for KeyBuffer {
    #[inline(always)]
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl PartialEq for KeyBuffer {
    #[inline(always)]
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for KeyBuffer {}

impl std::fmt::Debug for KeyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBuffer")
            .field("len", &self.bytes.len())
            .field("hash", &self.hash)
            .finish()
    }
}
