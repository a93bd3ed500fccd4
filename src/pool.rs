// Reusable byte buffers for request bodies
//
// A free list of Vec<u8> storage shared by the ingress paths. Buffers are
// handed out behind an RAII guard, so every buffer has exactly one owner
// and returns to the list cleared.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, LazyLock};

use bytes::Bytes;
use parking_lot::Mutex;

/// Idle buffers kept beyond this count are released to the allocator.
const MAX_IDLE: usize = 64;

static SHARED: LazyLock<Arc<BufferPool>> = LazyLock::new(|| Arc::new(BufferPool::new()));

/// Take a buffer from the process-wide pool.
pub fn get() -> PooledBuf {
    SHARED.get()
}

#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(self: &Arc<Self>) -> PooledBuf {
        let buf = self.free.lock().pop().unwrap_or_default();
        PooledBuf {
            buf,
            pool: Arc::clone(self),
        }
    }

    fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < MAX_IDLE {
            free.push(buf);
        }
    }

    /// Number of buffers currently sitting on the free list.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

/// An exclusively owned buffer that rejoins its pool on drop.
#[derive(Debug)]
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    /// Convert the buffer into shared immutable `Bytes`. The storage returns
    /// to the pool once the last clone is dropped.
    pub fn freeze(self) -> Bytes {
        Bytes::from_owner(self)
    }
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_returns_cleared() {
        let pool = Arc::new(BufferPool::new());
        {
            let mut buf = pool.get();
            buf.extend_from_slice(b"some bytes");
        }
        assert_eq!(pool.idle(), 1);

        let buf = pool.get();
        assert!(buf.is_empty());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn freeze_returns_storage_after_last_clone() {
        let pool = Arc::new(BufferPool::new());
        let mut buf = pool.get();
        buf.extend_from_slice(b"cpu value=1 1000\n");

        let bytes = buf.freeze();
        let second = bytes.clone();
        assert_eq!(&second[..], b"cpu value=1 1000\n");

        drop(bytes);
        assert_eq!(pool.idle(), 0);
        drop(second);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn idle_list_is_bounded() {
        let pool = Arc::new(BufferPool::new());
        let bufs: Vec<_> = (0..MAX_IDLE + 8).map(|_| pool.get()).collect();
        drop(bufs);
        assert_eq!(pool.idle(), MAX_IDLE);
    }
}
