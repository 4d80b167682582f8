/// Off-heap storage backend.
///
/// Layered bottom-up: `memory` hands out untracked blocks, `layout` fixes the
/// byte image of an entry, `hashtable` and `ordering` thread entries into
/// bucket chains and an lru list, and `segment` ties them together under one
/// lock with eviction and resizing.
pub(crate) mod hashtable;
pub mod layout;
pub mod memory;
pub(crate) mod ordering;
pub mod segment;
pub(crate) mod slab;
