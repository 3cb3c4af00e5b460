//! Bounded pool of reusable packet buffers

use parking_lot::Mutex;

use super::RawPacket;

/// A bounded concurrent pool of [`RawPacket`]s
///
/// `acquire` hands out a packet by value and `release` takes it back. Packets
/// are reset on release; when the pool is already holding `capacity` idle
/// packets the returned one is dropped instead.
#[derive(Debug)]
pub struct PacketPool {
    packets: Mutex<Vec<RawPacket>>,
    capacity: usize,
    buffer_size: usize,
}

impl PacketPool {
    /// Create a pool keeping at most `capacity` idle packets of `buffer_size` bytes
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            packets: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            buffer_size,
        }
    }

    /// Take a packet whose buffer holds at least `min_size` bytes
    pub fn acquire(&self, min_size: usize) -> RawPacket {
        let size = min_size.max(self.buffer_size);
        let pooled = self.packets.lock().pop();
        match pooled {
            Some(mut pkt) => {
                if pkt.buffer().len() < size {
                    pkt = RawPacket::with_capacity(size);
                }
                pkt
            }
            None => RawPacket::with_capacity(size),
        }
    }

    /// Take a packet holding a copy of `data`
    pub fn acquire_with(&self, data: &[u8]) -> RawPacket {
        let mut pkt = self.acquire(data.len());
        pkt.copy_from(data);
        pkt
    }

    /// Give a packet back to the pool
    pub fn release(&self, mut pkt: RawPacket) {
        pkt.reset();
        let mut packets = self.packets.lock();
        if packets.len() < self.capacity {
            packets.push(pkt);
        }
    }

    /// Number of idle packets currently held
    pub fn available(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_released_packets_are_reset_and_reused() {
        let pool = PacketPool::new(2, 64);
        let mut pkt = pool.acquire_with(&[1, 2, 3]);
        pkt.add_flags(crate::packet::FLAG_INJECTED);
        assert_eq!(pkt.data(), &[1, 2, 3]);

        pool.release(pkt);
        assert_eq!(pool.available(), 1);

        let pkt = pool.acquire(0);
        assert!(pkt.is_empty());
        assert_eq!(pkt.flags(), 0);
        assert!(pkt.buffer().len() >= 64);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_pool_never_exceeds_capacity() {
        let pool = PacketPool::new(3, 16);
        let packets: Vec<_> = (0..10).map(|_| pool.acquire(16)).collect();
        for pkt in packets {
            pool.release(pkt);
        }
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_acquire_larger_than_pooled() {
        let pool = PacketPool::new(1, 16);
        pool.release(pool.acquire(16));
        let pkt = pool.acquire(1500);
        assert!(pkt.buffer().len() >= 1500);
    }
}
