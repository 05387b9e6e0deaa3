//! Scratch-buffer pool for the response relay loop.
//!
//! Body bytes are staged through pooled 32 KiB `BytesMut` buffers before
//! being handed to the client channel, so steady-state proxying reuses a
//! small set of allocations instead of allocating per chunk.

use bytes::BytesMut;
use std::sync::Mutex;

/// Size of each pooled scratch buffer.
pub const SCRATCH_BUFFER_SIZE: usize = 32 * 1024;

const MAX_POOLED: usize = 64;

/// Process-wide pool of fixed-size scratch buffers.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a scratch buffer, allocating one if the pool is empty.
    pub fn get(&self) -> BytesMut {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.pop()
            .unwrap_or_else(|| BytesMut::with_capacity(SCRATCH_BUFFER_SIZE))
    }

    /// Return a scratch buffer. Buffers whose capacity no longer matches
    /// (split off, grown, or shared with an outstanding chunk) are dropped.
    pub fn put(&self, mut buf: BytesMut) {
        buf.clear();
        if buf.capacity() != SCRATCH_BUFFER_SIZE {
            return;
        }
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < MAX_POOLED {
            free.push(buf);
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_full_capacity_buffer() {
        let pool = BufferPool::new();
        let buf = pool.get();
        assert_eq!(buf.capacity(), SCRATCH_BUFFER_SIZE);
        assert!(buf.is_empty());
    }

    #[test]
    fn put_recycles_matching_buffers() {
        let pool = BufferPool::new();
        let mut buf = pool.get();
        buf.extend_from_slice(b"leftover");
        pool.put(buf);
        assert_eq!(pool.pooled(), 1);

        let buf = pool.get();
        assert!(buf.is_empty(), "recycled buffer must come back cleared");
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn put_drops_wrong_capacity() {
        let pool = BufferPool::new();
        pool.put(BytesMut::with_capacity(128));
        assert_eq!(pool.pooled(), 0);
    }
}
