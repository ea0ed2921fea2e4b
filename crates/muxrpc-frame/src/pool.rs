//! Reusable read buffers for frame envelopes.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use object_pool::Pool;

use crate::envelope::{DEFAULT_POOL_BUFFER_SIZE, DEFAULT_POOL_CAPACITY};

/// A bounded pool of envelope buffers.
///
/// Buffers go back to the pool when the [`PooledBuf`] drops. Only frames up to
/// `buffer_size` should be read into pooled buffers; the reader allocates
/// larger ones directly so cached buffers never grow past that size.
#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<Pool<Vec<u8>>>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY, DEFAULT_POOL_BUFFER_SIZE)
    }

    /// Pool holding up to `capacity` buffers of `buffer_size` bytes each.
    pub fn with_capacity(capacity: usize, buffer_size: usize) -> Self {
        let pool = Pool::new(capacity, move || Vec::with_capacity(buffer_size));
        Self {
            pool: Arc::new(pool),
            buffer_size,
        }
    }

    /// Take an empty buffer, allocating one if the pool is drained.
    pub fn get(&self) -> PooledBuf {
        let buffer_size = self.buffer_size;
        let mut reusable = self
            .pool
            .pull_owned(move || Vec::with_capacity(buffer_size));
        // Returned buffers keep whatever the last user left in them.
        reusable.clear();
        PooledBuf { inner: reusable }
    }

    /// Whether a frame of `len` bytes should come from this pool.
    pub fn fits(&self, len: usize) -> bool {
        len <= self.buffer_size
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Buffers currently idle in the pool.
    pub fn available(&self) -> usize {
        self.pool.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("available", &self.available())
            .finish()
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuf {
    inner: object_pool::ReusableOwned<Vec<u8>>,
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self.inner.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_return_cleared() {
        let pool = BufferPool::with_capacity(1, 64);
        {
            let mut buf = pool.get();
            buf.extend_from_slice(b"secret");
        }
        let buf = pool.get();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 6);
    }

    #[test]
    fn fits_respects_buffer_size() {
        let pool = BufferPool::with_capacity(2, 32 * 1024);
        assert!(pool.fits(0));
        assert!(pool.fits(32 * 1024));
        assert!(!pool.fits(32 * 1024 + 1));
    }

    #[test]
    fn buffer_goes_back_on_drop() {
        let pool = BufferPool::with_capacity(2, 16);
        assert_eq!(pool.available(), 2);
        let held = pool.get();
        assert_eq!(pool.available(), 1);
        drop(held);
        assert_eq!(pool.available(), 2);
    }
}
