use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;

/// Hash function applied to serialized key bytes.
///
/// The high bits of the result pick the segment and the low bits pick the
/// bucket, so both ends must be well distributed.
pub trait KeyHasher: Send + Sync + 'static {
    fn hash(&self, bytes: &[u8]) -> u64;
}

impl<F> KeyHasher for F
where
    F: Fn(&[u8]) -> u64 + Send + Sync + 'static,
{
    fn hash(&self, bytes: &[u8]) -> u64 {
        self(bytes)
    }
}

/// Built-in hash functions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// aHash with fixed seeds.
    #[default]
    AHash,
    /// XXH64 with seed 0.
    Xx,
}

impl HashAlgorithm {
    pub fn hasher(self) -> Arc<dyn KeyHasher> {
        match self {
            HashAlgorithm::AHash => Arc::new(AHasher64::default()),
            HashAlgorithm::Xx => Arc::new(XxHasher64::default()),
        }
    }
}

// Fixed so that hashes are stable across processes and runs.
const AHASH_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// aHash over the key bytes.
#[derive(Clone)]
pub struct AHasher64 {
    state: ahash::RandomState,
}

impl Default for AHasher64 {
    fn default() -> Self {
        let [k0, k1, k2, k3] = AHASH_SEEDS;
        Self {
            state: ahash::RandomState::with_seeds(k0, k1, k2, k3),
        }
    }
}

impl KeyHasher for AHasher64 {
    fn hash(&self, bytes: &[u8]) -> u64 {
        let mut hasher = self.state.build_hasher();
        hasher.write(bytes);
        hasher.finish()
    }
}

/// XXH64 over the key bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct XxHasher64 {
    seed: u64,
}

impl XxHasher64 {
    pub fn with_seed(seed: u64) -> Self {
        Self { seed }
    }
}

impl KeyHasher for XxHasher64 {
    fn hash(&self, bytes: &[u8]) -> u64 {
        twox_hash::XxHash64::oneshot(self.seed, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_hashers_are_deterministic() {
        for algorithm in [HashAlgorithm::AHash, HashAlgorithm::Xx] {
            let a = algorithm.hasher();
            let b = algorithm.hasher();
            assert_eq!(a.hash(b"hello"), b.hash(b"hello"));
            assert_ne!(a.hash(b"hello"), a.hash(b"hellp"));
        }
    }

    #[test]
    fn xx_matches_reference_vector() {
        // XXH64("", 0)
        assert_eq!(XxHasher64::default().hash(b""), 0xef46_db37_51d8_e999);
    }

    #[test]
    fn closures_are_hashers() {
        let hasher: Arc<dyn KeyHasher> = Arc::new(|bytes: &[u8]| bytes.len() as u64);
        assert_eq!(hasher.hash(b"abc"), 3);
    }
}
