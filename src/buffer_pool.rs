//! Reusable I/O buffers shared by the stream workers.
//!
//! TCP workers write and read through fixed-size buffers for the whole test
//! duration; pooling them keeps sequential sessions on a server from
//! reallocating per session.

use parking_lot::Mutex;

/// A thread-safe pool of fixed-size byte buffers.
pub struct BufferPool {
    pool: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_pool_size: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_pool_size: usize) -> Self {
        Self {
            pool: Mutex::new(Vec::with_capacity(max_pool_size)),
            buffer_size,
            max_pool_size,
        }
    }

    /// Pops a buffer from the pool or allocates a fresh zeroed one.
    pub fn get(&self) -> Vec<u8> {
        let mut pool = self.pool.lock();
        pool.pop().unwrap_or_else(|| vec![0u8; self.buffer_size])
    }

    /// Returns a buffer for reuse. Wrong-sized buffers and overflow beyond
    /// the pool capacity are dropped.
    pub fn put(&self, mut buffer: Vec<u8>) {
        if buffer.len() != self.buffer_size {
            return;
        }
        let mut pool = self.pool.lock();
        if pool.len() < self.max_pool_size {
            buffer.fill(0);
            pool.push(buffer);
        }
    }

    pub fn size(&self) -> usize {
        self.pool.lock().len()
    }
}
