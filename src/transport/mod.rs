//! # Transport Layer
//!
//! Per-connection protocol engines and the pieces they share. The reliable
//! stream lives in [`stream`], the datagram endpoint in [`datagram`]; this
//! module holds what both need — delivery queues with byte accounting, the
//! in-flight send ledger, the observable status enums and the receive
//! callback contract.
//!
//! ## Delivery policy
//!
//! Both transports deliver the same way: if a receive callback is
//! installed, completed packets are handed to it inline on the worker task
//! and never enqueued; otherwise they are pushed into a byte-capped FIFO
//! the application drains with the poll-style `recv_*` calls. A packet
//! that would push the queue over its cap is dropped, counted and logged —
//! never a crash, never fatal to the connection.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{NetError, Result};
use crate::packet::Packet;

pub mod datagram;
pub mod stream;

/// Connection state as observed through the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Fully connected, both directions open.
    Connected,
    /// No connection (never connected, fully disconnected, or unknown peer).
    NotConnected,
    /// Local side has shut down sending; receiving still works.
    NoSend,
    /// Peer has shut down sending; local sends still work.
    NoRecv,
    /// Both directions shut down; teardown pending.
    NoSendRecv,
    /// A non-blocking connect is still in progress.
    StillConnecting,
    /// The connect attempt timed out.
    TimedOut,
    /// The server refused the connection (full, or version mismatch).
    Refused,
    /// The connect attempt failed with a transport error.
    ConnectionError,
}

/// Outcome of a send operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The transport accepted every byte.
    Completed,
    /// A non-blocking send is in flight.
    InProgress,
    /// The send failed; the connection is still usable.
    Failed,
    /// The send failed and killed the connection (send timeout, transport
    /// error).
    FailedKill,
}

/// Inline receive callback. Runs on the connection's worker task, so it
/// must be reentrancy-safe, must not block, and should do no more than
/// hand the packet off; anything heavier belongs on the application's own
/// threads.
pub type RecvCallback = Arc<dyn Fn(Packet) + Send + Sync + 'static>;

/// A FIFO of delivered packets bounded by total payload bytes.
#[derive(Debug)]
pub struct PacketQueue {
    inner: Mutex<QueueInner>,
    cap: usize,
    dropped: AtomicU64,
}

#[derive(Debug, Default)]
struct QueueInner {
    packets: VecDeque<Packet>,
    bytes: usize,
}

impl PacketQueue {
    pub fn new(cap: usize) -> PacketQueue {
        PacketQueue {
            inner: Mutex::new(QueueInner::default()),
            cap,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue `packet`, or drop it when the queue is at its byte cap.
    pub fn push(&self, packet: Packet) -> Result<()> {
        let mut inner = self.inner.lock();
        let queued = inner.bytes;
        if queued + packet.used_size() > self.cap {
            drop(inner);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(NetError::RecvCapExceeded {
                queued,
                cap: self.cap,
            });
        }
        inner.bytes += packet.used_size();
        inner.packets.push_back(packet);
        Ok(())
    }

    /// Whether a packet of `bytes` payload would fit under the cap.
    ///
    /// Only meaningful to the queue's single producer; consumers popping
    /// concurrently can only make more room.
    pub fn can_accept(&self, bytes: usize) -> bool {
        self.inner.lock().bytes + bytes <= self.cap
    }

    /// Count a drop decided by the producer (after `can_accept` said no),
    /// so the producer can recycle the packet instead of losing it.
    pub fn note_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Dequeue the oldest packet, if any.
    pub fn pop(&self) -> Option<Packet> {
        let mut inner = self.inner.lock();
        let packet = inner.packets.pop_front()?;
        inner.bytes -= packet.used_size();
        Some(packet)
    }

    /// Number of queued packets.
    pub fn len(&self) -> usize {
        self.inner.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().packets.is_empty()
    }

    /// Total payload bytes queued.
    pub fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    /// Byte cap this queue enforces.
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Packets dropped against the cap since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Discard everything queued, returning how many packets were removed.
    pub fn flush(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.packets.len();
        inner.packets.clear();
        inner.bytes = 0;
        count
    }
}

/// In-flight send byte accounting against a per-connection cap.
///
/// Reservation happens before the transport write is posted and is released
/// when the write completes or fails, so the cap bounds committed memory,
/// not queue depth.
#[derive(Debug)]
pub struct SendLedger {
    inflight: AtomicUsize,
    cap: usize,
}

impl SendLedger {
    pub fn new(cap: usize) -> SendLedger {
        SendLedger {
            inflight: AtomicUsize::new(0),
            cap,
        }
    }

    /// Reserve `bytes` against the cap.
    pub fn reserve(&self, bytes: usize) -> Result<()> {
        let mut current = self.inflight.load(Ordering::Relaxed);
        loop {
            if current + bytes > self.cap {
                return Err(NetError::SendCapExceeded {
                    requested: bytes,
                    inflight: current,
                    cap: self.cap,
                });
            }
            match self.inflight.compare_exchange_weak(
                current,
                current + bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Release a previous reservation.
    pub fn release(&self, bytes: usize) {
        self.inflight.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Bytes currently reserved.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    pub fn cap(&self) -> usize {
        self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_of(n: usize) -> Packet {
        Packet::from_bytes(&vec![0u8; n])
    }

    #[test]
    fn queue_enforces_byte_cap() {
        let queue = PacketQueue::new(10);
        queue.push(packet_of(6)).unwrap();
        assert!(matches!(
            queue.push(packet_of(5)),
            Err(NetError::RecvCapExceeded { queued: 6, cap: 10 })
        ));
        assert_eq!(queue.dropped(), 1);
        queue.push(packet_of(4)).unwrap();
        assert_eq!(queue.bytes(), 10);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn queue_is_fifo_and_accounts_pops() {
        let queue = PacketQueue::new(100);
        queue.push(Packet::from_bytes(b"first")).unwrap();
        queue.push(Packet::from_bytes(b"second")).unwrap();
        assert_eq!(queue.pop().unwrap().data(), b"first");
        assert_eq!(queue.bytes(), 6);
        assert_eq!(queue.pop().unwrap().data(), b"second");
        assert!(queue.pop().is_none());
        assert_eq!(queue.bytes(), 0);
    }

    #[test]
    fn flush_empties_the_queue() {
        let queue = PacketQueue::new(100);
        queue.push(packet_of(3)).unwrap();
        queue.push(packet_of(4)).unwrap();
        assert_eq!(queue.flush(), 2);
        assert_eq!(queue.bytes(), 0);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn ledger_reserve_release() {
        let ledger = SendLedger::new(100);
        ledger.reserve(60).unwrap();
        assert!(matches!(
            ledger.reserve(41),
            Err(NetError::SendCapExceeded {
                requested: 41,
                inflight: 60,
                cap: 100
            })
        ));
        ledger.reserve(40).unwrap();
        assert_eq!(ledger.inflight(), 100);
        ledger.release(60);
        ledger.reserve(1).unwrap();
        assert_eq!(ledger.inflight(), 41);
    }
}
