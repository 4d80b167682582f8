/// Untracked memory blocks.
///
/// This is the only module that touches raw pointers. Everything above it
/// sees memory as a [`RawBlock`] (owned, freed on drop) or a crate-private
/// [`BlockView`] (a borrowed window whose lifetime is guaranteed by a
/// reference count further up).
///
/// Multi-byte values are stored big-endian so the byte image of an entry is
/// identical on every host. The one exception is the atomic counter used for
/// reference counts, which must be native to be usable with `AtomicU64`.
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::error::{invariant, invariant_violation, Error, Result};

/// Bytes currently allocated through this module, process wide.
static TOTAL_ALLOCATED: AtomicI64 = AtomicI64::new(0);

/// Outstanding bytes allocated by this layer.
///
/// Negative would mean "unavailable"; the malloc backend always knows.
pub fn total_allocated() -> i64 {
    TOTAL_ALLOCATED.load(Ordering::Relaxed)
}

/// An exclusively owned block of untracked memory.
///
/// Not `Clone`. Freed exactly once, either by [`RawBlock::free`] or on drop,
/// so a double free cannot be expressed without `unsafe`.
pub struct RawBlock {
    view: BlockView,
}

/// A non-owning window onto a block.
///
/// Only ever created from a live [`RawBlock`]; the holder is responsible for
/// keeping the block alive (entries do it with their reference count).
#[derive(Clone, Copy)]
pub(crate) struct BlockView {
    ptr: NonNull<u8>,
    len: usize,
}

// Blocks are plain bytes; synchronisation is the caller's business (segment
// locks for links, atomics for the reference count).
unsafe impl Send for RawBlock {}
unsafe impl Sync for RawBlock {}
unsafe impl Send for BlockView {}
unsafe impl Sync for BlockView {}

impl RawBlock {
    /// Reserve `size` zeroed bytes.
    pub fn allocate(size: usize) -> Result<Self> {
        // malloc(0) may legally return null.
        let ptr = unsafe { libc::calloc(size.max(1), 1) } as *mut u8;
        Self::adopt(ptr, size)
    }

    /// Reserve `size` bytes without initializing them.
    ///
    /// Only for writers that cover every byte before anything reads it, see
    /// [`EntryWriter`](crate::offheap::layout::EntryWriter).
    pub(crate) fn allocate_uninit(size: usize) -> Result<Self> {
        let ptr = unsafe { libc::malloc(size.max(1)) } as *mut u8;
        Self::adopt(ptr, size)
    }

    fn adopt(ptr: *mut u8, size: usize) -> Result<Self> {
        let Some(ptr) = NonNull::new(ptr) else {
            tracing::warn!("[memory]: failed to allocate {} bytes", size);
            return Err(Error::OutOfMemory { size });
        };

        tracker::on_allocate(ptr.as_ptr() as usize, size);
        TOTAL_ALLOCATED.fetch_add(size as i64, Ordering::Relaxed);
        tracing::trace!("[memory]: allocate {:p} ({} bytes)", ptr, size);

        Ok(Self {
            view: BlockView { ptr, len: size },
        })
    }

    /// Release the block.
    pub fn free(self) {
        drop(self)
    }

    pub fn len(&self) -> usize {
        self.view.len
    }

    pub fn is_empty(&self) -> bool {
        self.view.len == 0
    }

    /// Give up ownership. The block is leaked until [`RawBlock::from_view`].
    pub(crate) fn into_view(self) -> BlockView {
        let view = self.view;
        std::mem::forget(self);
        view
    }

    /// Take ownership back.
    ///
    /// # Safety
    /// `view` must come from [`RawBlock::into_view`] and no other owner may
    /// exist for it.
    pub(crate) unsafe fn from_view(view: BlockView) -> Self {
        Self { view }
    }

    pub(crate) fn view(&self) -> BlockView {
        self.view
    }

    pub fn as_slice(&self, offset: usize, len: usize) -> &[u8] {
        // Safety: the borrow of `self` keeps the block alive.
        unsafe { self.view.slice(offset, len) }
    }

    pub fn copy_from_slice(&mut self, offset: usize, src: &[u8]) {
        unsafe { self.view.write_bytes(offset, src) }
    }

    pub fn copy_to_slice(&self, offset: usize, dst: &mut [u8]) {
        self.view.read_bytes(offset, dst)
    }

    /// Copy `len` bytes from another block into this one.
    pub fn copy_block(&mut self, dst_offset: usize, src: &RawBlock, src_offset: usize, len: usize) {
        src.view.check(src_offset, len);
        self.view.check(dst_offset, len);
        // Two distinct owned blocks never overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.view.ptr.as_ptr().add(src_offset),
                self.view.ptr.as_ptr().add(dst_offset),
                len,
            );
        }
    }

    /// Set `len` bytes starting at `offset` to `byte`.
    pub fn fill(&mut self, offset: usize, len: usize, byte: u8) {
        self.view.check(offset, len);
        unsafe { std::ptr::write_bytes(self.view.ptr.as_ptr().add(offset), byte, len) }
    }

    pub fn fetch_add_u64(&self, offset: usize, val: u64) -> u64 {
        self.view.atomic_u64(offset).fetch_add(val, Ordering::SeqCst).wrapping_add(val)
    }

    /// Atomic decrement. Going below zero is an invariant violation.
    pub fn fetch_sub_u64(&self, offset: usize, val: u64) -> u64 {
        let old = self.view.atomic_u64(offset).fetch_sub(val, Ordering::SeqCst);
        match old.checked_sub(val) {
            Some(new) => new,
            None => invariant_violation(format_args!(
                "counter at offset {offset} decremented below zero ({old} - {val})"
            )),
        }
    }
}

impl Drop for RawBlock {
    fn drop(&mut self) {
        let addr = self.view.ptr.as_ptr();
        tracker::on_free(addr as usize, self.view.len);
        TOTAL_ALLOCATED.fetch_sub(self.view.len as i64, Ordering::Relaxed);
        tracing::trace!("[memory]: free {:p} ({} bytes)", addr, self.view.len);
        unsafe { libc::free(addr as *mut libc::c_void) }
    }
}

impl std::fmt::Debug for RawBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawBlock")
            .field("ptr", &self.view.ptr)
            .field("len", &self.view.len)
            .finish()
    }
}

impl BlockView {
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) {
        invariant!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "access [{}, +{}) out of block bounds {}",
            offset,
            len,
            self.len
        );
    }

    #[inline]
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        self.check(offset, dst.len());
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len())
        }
    }

    /// # Safety
    /// No other thread may access the written range concurrently, and no
    /// shared slice over it may be alive.
    #[inline]
    pub unsafe fn write_bytes(&self, offset: usize, src: &[u8]) {
        self.check(offset, src.len());
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len()) }
    }

    /// # Safety
    /// The block must stay alive and the range unmodified for `'a`.
    #[inline]
    pub unsafe fn slice<'a>(&self, offset: usize, len: usize) -> &'a [u8] {
        self.check(offset, len);
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) }
    }

    #[inline]
    pub fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        self.check(offset, 8);
        let ptr = unsafe { self.ptr.as_ptr().add(offset) };
        invariant!(
            ptr as usize % std::mem::align_of::<AtomicU64>() == 0,
            "unaligned atomic access at {:p}",
            ptr
        );
        unsafe { &*(ptr as *const AtomicU64) }
    }
}

macro_rules! be_accessors {
    ($($read:ident, $write:ident, $ty:ty;)+) => {
        impl BlockView {
            $(
                #[inline]
                pub fn $read(&self, offset: usize) -> $ty {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    self.read_bytes(offset, &mut buf);
                    <$ty>::from_be_bytes(buf)
                }

                /// # Safety
                /// See [`BlockView::write_bytes`].
                #[inline]
                pub unsafe fn $write(&self, offset: usize, val: $ty) {
                    unsafe { self.write_bytes(offset, &val.to_be_bytes()) }
                }
            )+
        }

        impl RawBlock {
            $(
                #[inline]
                pub fn $read(&self, offset: usize) -> $ty {
                    self.view.$read(offset)
                }

                #[inline]
                pub fn $write(&mut self, offset: usize, val: $ty) {
                    unsafe { self.view.$write(offset, val) }
                }
            )+
        }
    };
}

be_accessors! {
    read_u8, write_u8, u8;
    read_u16, write_u16, u16;
    read_u32, write_u32, u32;
    read_u64, write_u64, u64;
    read_i8, write_i8, i8;
    read_i16, write_i16, i16;
    read_i32, write_i32, i32;
    read_i64, write_i64, i64;
    read_f32, write_f32, f32;
    read_f64, write_f64, f64;
}

impl RawBlock {
    pub fn read_bool(&self, offset: usize) -> bool {
        self.read_u8(offset) != 0
    }

    pub fn write_bool(&mut self, offset: usize, val: bool) {
        self.write_u8(offset, val as u8)
    }
}

/// Live-block bookkeeping that turns frees of unknown or already freed
/// blocks into loud failures.
#[cfg(any(debug_assertions, feature = "strict_assertions"))]
mod tracker {
    use hashbrown::HashMap;
    use parking_lot::Mutex;

    use crate::error::invariant;

    static LIVE: Mutex<Option<HashMap<usize, usize>>> = Mutex::new(None);

    pub fn on_allocate(addr: usize, len: usize) {
        let mut live = LIVE.lock();
        let prev = live.get_or_insert_with(HashMap::new).insert(addr, len);
        invariant!(prev.is_none(), "allocator handed out live block {:#x}", addr);
    }

    pub fn on_free(addr: usize, len: usize) {
        let mut live = LIVE.lock();
        let prev = live.get_or_insert_with(HashMap::new).remove(&addr);
        invariant!(
            prev == Some(len),
            "free of unknown block {:#x} ({} bytes, tracked {:?})",
            addr,
            len,
            prev
        );
    }

    #[cfg(test)]
    pub fn is_live(addr: usize) -> bool {
        LIVE.lock().as_ref().is_some_and(|live| live.contains_key(&addr))
    }
}

#[cfg(not(any(debug_assertions, feature = "strict_assertions")))]
mod tracker {
    #[inline(always)]
    pub fn on_allocate(_: usize, _: usize) {}

    #[inline(always)]
    pub fn on_free(_: usize, _: usize) {}
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    fn random_block(len: usize) -> (RawBlock, Vec<u8>) {
        let mut bytes = vec![0u8; len];
        rand::rng().fill(&mut bytes[..]);
        let mut block = RawBlock::allocate(len).unwrap();
        block.copy_from_slice(0, &bytes);
        (block, bytes)
    }

    #[test]
    fn allocate_and_free() {
        let block = RawBlock::allocate(100).unwrap();
        assert_eq!(block.len(), 100);
        assert!(!block.is_empty());
        block.free();
    }

    #[cfg(any(debug_assertions, feature = "strict_assertions"))]
    #[test]
    fn tracker_follows_block_lifetime() {
        let block = RawBlock::allocate(100).unwrap();
        let addr = block.view().ptr.as_ptr() as usize;
        assert!(tracker::is_live(addr));
        block.free();
        assert!(!tracker::is_live(addr));
    }

    #[test]
    fn allocate_too_much() {
        assert!(matches!(
            RawBlock::allocate(usize::MAX),
            Err(Error::OutOfMemory { size: usize::MAX })
        ));
    }

    #[test]
    fn total_allocated_counts_outstanding_blocks() {
        let block = RawBlock::allocate(128 * 1024 * 1024).unwrap();
        assert!(total_allocated() >= 128 * 1024 * 1024);
        drop(block);
    }

    #[test]
    fn multi_byte_values_are_big_endian_at_any_offset() {
        let (mut block, bytes) = random_block(128);
        for i in 0..14 {
            assert_eq!(block.read_u8(i), bytes[i]);
            assert_eq!(block.read_u16(i), u16::from_be_bytes(bytes[i..i + 2].try_into().unwrap()));
            assert_eq!(block.read_i32(i), i32::from_be_bytes(bytes[i..i + 4].try_into().unwrap()));
            assert_eq!(block.read_u64(i), u64::from_be_bytes(bytes[i..i + 8].try_into().unwrap()));
            assert_eq!(
                block.read_f64(i).to_bits(),
                u64::from_be_bytes(bytes[i..i + 8].try_into().unwrap())
            );
        }

        block.write_u32(3, 0x0102_0304);
        assert_eq!(block.as_slice(3, 4), &[1, 2, 3, 4]);
        block.write_i64(9, -2);
        assert_eq!(block.read_i64(9), -2);
        block.write_f32(20, 1.5);
        assert_eq!(block.read_f32(20), 1.5);
        block.write_bool(30, true);
        assert!(block.read_bool(30));
    }

    #[test]
    fn copy_between_blocks_and_slices() {
        let (src, bytes) = random_block(7777 + 130);
        let mut dst = RawBlock::allocate(7777 + 130).unwrap();
        dst.copy_block(13, &src, 0, 7777);
        assert_eq!(dst.as_slice(13, 7777), &bytes[..7777]);

        let mut out = vec![0u8; 7777];
        dst.copy_to_slice(13, &mut out);
        assert_eq!(out, &bytes[..7777]);
    }

    #[test]
    fn fill_sets_every_byte() {
        let mut block = RawBlock::allocate(7777 + 130).unwrap();
        for b in 0..13u8 {
            block.fill(10, 7777, b);
            assert!(block.as_slice(10, 7777).iter().all(|&x| x == b));
        }
        let zeroed = RawBlock::allocate(64).unwrap();
        assert!(zeroed.as_slice(0, 64).iter().all(|&x| x == 0));
    }

    #[test]
    fn atomic_counter() {
        let block = RawBlock::allocate(16).unwrap();
        assert_eq!(block.fetch_add_u64(8, 1), 1);
        assert_eq!(block.fetch_add_u64(8, 1), 2);
        assert_eq!(block.fetch_sub_u64(8, 2), 0);
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn counter_underflow_is_fatal() {
        let block = RawBlock::allocate(16).unwrap();
        block.fetch_sub_u64(8, 1);
    }

    #[test]
    fn fresh_blocks_read_as_zero() {
        let block = RawBlock::allocate(4096).unwrap();
        assert_eq!(block.read_u64(0), 0);
        assert_eq!(block.read_u64(4088), 0);
        assert!(block.as_slice(0, 4096).iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn out_of_bounds_read_is_fatal() {
        let block = RawBlock::allocate(8).unwrap();
        block.read_u64(1);
    }
}
