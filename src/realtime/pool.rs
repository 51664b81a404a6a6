use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;

/// Bounded pool of scratch buffers shared by every connection.
///
/// Buffers are cleared before they go back into the pool, so bytes from one
/// connection are never visible to the next borrower. Buffers that grew past
/// `max_retained` are dropped instead of pooled, as are returns to a full pool.
#[derive(Debug)]
pub struct BufferPool {
    queue: ArrayQueue<BytesMut>,
    buffer_size: usize,
    max_retained: usize,
}

impl BufferPool {
    /// A pool holding at most `capacity` idle buffers of `buffer_size` bytes.
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            buffer_size,
            max_retained: buffer_size.saturating_mul(16),
        }
    }

    /// Takes an empty buffer from the pool, allocating when none is idle.
    pub fn checkout(&self) -> BytesMut {
        self.queue
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size))
    }

    /// Returns `buf` to the pool.
    pub fn give_back(&self, mut buf: BytesMut) {
        if buf.capacity() > self.max_retained {
            return;
        }
        buf.clear();
        let _ = self.queue.push(buf);
    }

    /// Number of idle buffers.
    pub fn idle(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;

    #[test]
    fn buffers_come_back_empty() {
        let pool = BufferPool::new(2, 64);
        let mut buf = pool.checkout();
        buf.put_slice(b"secret from connection one");
        pool.give_back(buf);
        assert_eq!(pool.idle(), 1);

        let buf = pool.checkout();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 64);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn full_pool_and_oversize_buffers_are_dropped() {
        let pool = BufferPool::new(1, 16);
        pool.give_back(BytesMut::with_capacity(16));
        pool.give_back(BytesMut::with_capacity(16));
        assert_eq!(pool.idle(), 1);

        let pool = BufferPool::new(4, 16);
        pool.give_back(BytesMut::with_capacity(16 * 32));
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn concurrent_checkout() {
        let pool = std::sync::Arc::new(BufferPool::new(8, 32));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = std::sync::Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let mut buf = pool.checkout();
                        assert!(buf.is_empty());
                        buf.put_u8(1);
                        pool.give_back(buf);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.idle() <= 8);
    }
}
