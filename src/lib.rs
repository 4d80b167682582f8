//! Segmented off-heap key/value cache with lru eviction.
//!
//! Entries live in memory obtained straight from the system allocator, one
//! block per entry holding a fixed header, the serialized key and the
//! serialized value. The table is split into independently locked segments
//! picked by the high bits of the key hash; each segment keeps its own bucket
//! chains, lru list and byte budget.
//!
//! ```no_run
//! use offheap_cache::{BytesSerializer, CacheBuilder, StringSerializer};
//!
//! let cache = CacheBuilder::new(64 << 20)
//!     .build(StringSerializer, BytesSerializer)
//!     .unwrap();
//! cache.put(&"key".to_string(), &b"value".to_vec()).unwrap();
//! assert_eq!(cache.get(&"key".to_string()).unwrap(), Some(b"value".to_vec()));
//! ```

mod config;
mod entry;
mod error;
mod hasher;
mod key;
pub mod offheap;
mod serde;
mod store;

pub use config::{CacheBuilder, CacheConfig};
pub use entry::EntryRef;
pub use error::{Error, Result};
pub use hasher::{AHasher64, HashAlgorithm, KeyHasher, XxHasher64};
pub use key::KeyBuffer;
pub use offheap::memory::{total_allocated, RawBlock};
pub use offheap::segment::{PutMode, SegmentStats};
pub use serde::{
    BytesSerializer, DataInput, DataOutput, F64Serializer, I64Serializer, Serializer,
    StringSerializer, U32Serializer, U64Serializer,
};
pub use store::{CacheInfo, OffHeapCache};
