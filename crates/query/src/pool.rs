//! Bounded pool of channel block buffers
//!
//! A read takes one buffer per requested channel for its whole lifetime,
//! so the pool size caps the number of channels being read at once.
//! Buffers are allocated on first use and kept for reuse.

use crate::QueryError;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

struct PoolInner {
    free: Mutex<PoolState>,
    buffer_size: usize,
    pool_size: usize,
}

struct PoolState {
    /// Buffers available for reuse
    spare: Vec<Vec<u8>>,
    /// Buffers not currently leased, allocated or not
    available: usize,
}

#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(pool_size: usize, buffer_size: usize) -> Self {
        info!(pool_size, buffer_size, "Read buffer pool created");
        metrics::gauge!("fa_read_pool_free").set(pool_size as f64);
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(PoolState {
                    spare: Vec::new(),
                    available: pool_size,
                }),
                buffer_size,
                pool_size,
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    pub fn available(&self) -> usize {
        self.inner.free.lock().available
    }

    /// Takes `count` buffers at once, or fails without waiting.
    pub fn acquire(&self, count: usize) -> Result<PoolLease, QueryError> {
        let mut buffers = {
            let mut state = self.inner.free.lock();
            if count > state.available {
                debug!(count, available = state.available, "Read pool exhausted");
                return Err(QueryError::Busy);
            }
            state.available -= count;
            metrics::gauge!("fa_read_pool_free").set(state.available as f64);
            let keep = state.spare.len().saturating_sub(count);
            state.spare.split_off(keep)
        };
        buffers.resize_with(count, || vec![0u8; self.inner.buffer_size]);
        Ok(PoolLease {
            buffers,
            pool: Arc::clone(&self.inner),
        })
    }
}

/// Buffers on loan from a [`BufferPool`], returned on drop
pub struct PoolLease {
    buffers: Vec<Vec<u8>>,
    pool: Arc<PoolInner>,
}

impl PoolLease {
    pub fn buffers_mut(&mut self) -> &mut [Vec<u8>] {
        &mut self.buffers
    }

    pub fn buffers(&self) -> &[Vec<u8>] {
        &self.buffers
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        let mut state = self.pool.free.lock();
        state.available += self.buffers.len();
        state.spare.append(&mut self.buffers);
        metrics::gauge!("fa_read_pool_free").set(state.available as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_returns_on_drop() {
        let pool = BufferPool::new(4, 64);
        let lease = pool.acquire(3).unwrap();
        assert_eq!(lease.buffers().len(), 3);
        assert!(lease.buffers().iter().all(|b| b.len() == 64));
        assert_eq!(pool.available(), 1);
        assert!(matches!(pool.acquire(2), Err(QueryError::Busy)));

        drop(lease);
        assert_eq!(pool.available(), 4);
        let lease = pool.acquire(4).unwrap();
        assert_eq!(lease.buffers().len(), 4);
    }

    #[test]
    fn test_buffers_are_reused() {
        let pool = BufferPool::new(2, 16);
        let mut lease = pool.acquire(1).unwrap();
        lease.buffers_mut()[0][0] = 42;
        drop(lease);
        let lease = pool.acquire(1).unwrap();
        assert_eq!(lease.buffers()[0][0], 42);
    }

    #[test]
    fn test_empty_request() {
        let pool = BufferPool::new(1, 16);
        let lease = pool.acquire(0).unwrap();
        assert!(lease.buffers().is_empty());
        assert_eq!(pool.available(), 1);
    }
}
