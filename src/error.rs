/// Off-heap cache error.
///
/// Only recoverable conditions live here. Broken invariants (dangling slot
/// links, reference count underflow, frees of unknown blocks) abort the
/// offending operation with a panic instead, see [`invariant_violation`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The allocator could not satisfy a request.
    #[error("out of memory: failed to allocate {size} bytes")]
    OutOfMemory { size: usize },
    /// A single entry is larger than the configured per-entry maximum.
    #[error("entry too large: {size} bytes exceeds the maximum of {max} bytes")]
    EntryTooLarge { size: usize, max: usize },
    /// A serializer wrote past the space it declared.
    #[error("buffer overrun: {requested} bytes requested with {capacity} bytes left")]
    BufferOverrun { capacity: usize, requested: usize },
    /// A serializer wrote fewer bytes than it declared.
    #[error("serialized size mismatch: declared {declared} bytes, wrote {written} bytes")]
    SizeMismatch { declared: usize, written: usize },
    /// A serializer could not decode the stored bytes.
    #[error("codec error: {0}")]
    Codec(String),
    /// Invalid construction parameters.
    #[error("config error: {0}")]
    Config(String),
}

/// Off-heap cache result.
pub type Result<T> = std::result::Result<T, Error>;

/// Log and abort on a broken internal invariant.
///
/// Off-heap corruption cannot be caught by anything further up, so there is
/// no way to continue once one of these fires.
#[cold]
#[track_caller]
pub(crate) fn invariant_violation(msg: std::fmt::Arguments<'_>) -> ! {
    tracing::error!("[offheap]: invariant violation: {}", msg);
    panic!("invariant violation: {msg}");
}

macro_rules! invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::error::invariant_violation(format_args!($($arg)+));
        }
    };
}

pub(crate) use invariant;
