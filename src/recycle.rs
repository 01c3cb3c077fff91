//! Bounded reuse pool for receive-path packets.
//!
//! Every receive completion needs a packet to land in; recycling the ones
//! the application has consumed keeps the hot path free of steady-state
//! allocation. The pool is purely a cache — correctness never depends on
//! what it holds.

use crate::packet::Packet;

/// A bounded stack of reset packets of one nominal size.
#[derive(Debug)]
pub struct MemoryRecycle {
    pool: Vec<Packet>,
    depth: usize,
    packet_size: usize,
}

impl MemoryRecycle {
    /// A pool holding at most `depth` packets of `packet_size` bytes each.
    pub fn new(depth: usize, packet_size: usize) -> MemoryRecycle {
        MemoryRecycle {
            pool: Vec::with_capacity(depth),
            depth,
            packet_size,
        }
    }

    /// Nominal packet size handed out by [`MemoryRecycle::acquire`].
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Packets currently cached.
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Pop a recycled packet, or allocate a fresh one when the pool is dry.
    pub fn acquire(&mut self) -> Packet {
        match self.pool.pop() {
            Some(packet) => packet,
            None => Packet::with_memory(self.packet_size),
        }
    }

    /// Return a packet to the pool. Dropped instead when the pool is full
    /// or the packet grew beyond the nominal size.
    pub fn release(&mut self, mut packet: Packet) {
        if self.pool.len() < self.depth && packet.memory_size() <= self.packet_size {
            packet.clear();
            self.pool.push(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_reuses_released_packets() {
        let mut pool = MemoryRecycle::new(2, 256);
        let mut p = pool.acquire();
        assert_eq!(p.memory_size(), 256);
        p.add(42u32).unwrap();
        pool.release(p);
        assert_eq!(pool.len(), 1);

        // Recycled packets come back reset.
        let p = pool.acquire();
        assert_eq!(p.used_size(), 0);
        assert_eq!(p.cursor(), 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn cap_and_oversize_packets_are_dropped() {
        let mut pool = MemoryRecycle::new(1, 64);
        pool.release(Packet::with_memory(64));
        pool.release(Packet::with_memory(64));
        assert_eq!(pool.len(), 1, "pool must not exceed its depth");

        let mut pool = MemoryRecycle::new(4, 64);
        pool.release(Packet::with_memory(65));
        assert!(pool.is_empty(), "oversize packets are not cached");
    }

    #[test]
    fn empty_pool_allocates() {
        let mut pool = MemoryRecycle::new(0, 32);
        let p = pool.acquire();
        assert_eq!(p.memory_size(), 32);
        pool.release(p);
        assert!(pool.is_empty());
    }
}
