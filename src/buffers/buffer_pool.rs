use std::sync::Mutex;
use tracing::{debug, trace};
use crate::buffers::fixed_buffer::FixedBuf;

/// Process-wide pool of datagram buffers, shared by all channels of all clients and servers
///  that were created with it. Buffers have a fixed capacity of the configured maximum datagram
///  size.
///
/// NB: A buffer must only be returned after every send operation referencing it completed
pub struct BufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<FixedBuf>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        BufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn get_from_pool(&self) -> FixedBuf {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        FixedBuf::new(self.buf_size)
    }

    pub fn return_to_pool(&self, mut buffer: FixedBuf) {
        assert_eq!(buffer.capacity(), self.buf_size,
                   "returned buffer does not have the regular capacity of {} bytes, maybe it was taken from a different pool"
                   , self.buf_size);

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    #[cfg(test)]
    pub fn num_pooled(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use bytes::BufMut;
    use super::*;

    #[test]
    fn test_clear() {
        let pool = BufferPool::new(10, 10);

        let mut buf = FixedBuf::new(10);
        buf.put_u8(1);
        buf.put_u8(2);

        pool.return_to_pool(buf);

        assert!(pool.get_from_pool().is_empty());
    }

    #[test]
    fn test_reuse() {
        let pool = BufferPool::new(10, 2);
        let a = pool.get_from_pool();
        let b = pool.get_from_pool();
        let c = pool.get_from_pool();
        assert_eq!(pool.num_pooled(), 0);

        pool.return_to_pool(a);
        pool.return_to_pool(b);
        pool.return_to_pool(c);
        assert_eq!(pool.num_pooled(), 2);

        let _ = pool.get_from_pool();
        assert_eq!(pool.num_pooled(), 1);
    }

    #[test]
    #[should_panic]
    fn test_return_foreign_buffer() {
        let pool = BufferPool::new(10, 2);
        pool.return_to_pool(FixedBuf::new(11));
    }

    #[test]
    fn test_concurrent_rent_and_return() {
        let pool = Arc::new(BufferPool::new(16, 8));

        let handles = (0..4)
            .map(|i| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut buf = pool.get_from_pool();
                        assert!(buf.is_empty());
                        buf.put_u8(i);
                        pool.return_to_pool(buf);
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }

        assert!(pool.num_pooled() <= 8);
    }
}
