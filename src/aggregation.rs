//! Opportunistic batching of small outbound frames.
//!
//! Frames below the small-frame threshold that are bound for the same peer
//! are coalesced into one datagram, amortizing per-packet overhead. A batch
//! is closed when appending would exceed the size cap, or when it outlives
//! the time budget - whichever comes first. Since every frame is
//! self-delimiting (exact length prefix in its header), the receiver simply
//! parses the flushed datagram as a sequence of frames.
//!
//! This is purely an optimization over the per-packet send path: with
//! aggregation disabled every frame is transmitted immediately.

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::trace;

/// One in-flight batch: ordered raw frames bound for a single peer.
#[derive(Debug)]
pub struct AggregatedPacket {
    pub id: u32,
    pub peer: SocketAddr,
    pub created_at_ms: u64,
    frames: Vec<Bytes>,
    total_len: usize,
}

impl AggregatedPacket {
    fn new(id: u32, peer: SocketAddr, frame: Bytes, now_ms: u64) -> AggregatedPacket {
        let total_len = frame.len();
        AggregatedPacket {
            id,
            peer,
            created_at_ms: now_ms,
            frames: vec![frame],
            total_len,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// Concatenates the batched frames into the single datagram to transmit.
    pub fn into_datagram(self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.total_len);
        for frame in &self.frames {
            buf.put_slice(frame);
        }
        buf
    }
}

#[derive(Debug)]
pub struct AggregationBuffer {
    open: FxHashMap<SocketAddr, AggregatedPacket>,
    next_id: u32,
    max_batch_len: usize,
    max_batch_age_ms: u64,
}

impl AggregationBuffer {
    pub fn new(max_batch_len: usize, max_batch_age_ms: u64) -> AggregationBuffer {
        AggregationBuffer {
            open: FxHashMap::default(),
            next_id: 1,
            max_batch_len,
            max_batch_age_ms,
        }
    }

    /// Appends `frame` to the open batch for `peer`, opening one if needed.
    /// When the open batch cannot take the frame (size cap) or has exceeded
    /// its time budget, it is displaced and returned so the caller transmits
    /// it immediately - per-peer frame order is preserved that way.
    pub fn append(&mut self, peer: SocketAddr, frame: Bytes, now_ms: u64) -> Option<AggregatedPacket> {
        let mut displaced = None;

        if let Some(batch) = self.open.get_mut(&peer) {
            let expired = now_ms.saturating_sub(batch.created_at_ms) > self.max_batch_age_ms;
            let overflows = batch.total_len + frame.len() > self.max_batch_len;
            if !expired && !overflows {
                batch.total_len += frame.len();
                batch.frames.push(frame);
                trace!(
                    "appended to batch #{} for {:?} ({} frames, {} bytes)",
                    batch.id,
                    peer,
                    batch.frame_count(),
                    batch.total_len
                );
                return None;
            }
            displaced = self.open.remove(&peer);
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.open.insert(peer, AggregatedPacket::new(id, peer, frame, now_ms));
        displaced
    }

    /// Removes and returns every batch older than the time budget,
    /// regardless of how full it is.
    pub fn flush_due(&mut self, now_ms: u64) -> Vec<AggregatedPacket> {
        let due: Vec<SocketAddr> = self
            .open
            .values()
            .filter(|b| now_ms.saturating_sub(b.created_at_ms) > self.max_batch_age_ms)
            .map(|b| b.peer)
            .collect();

        due.iter().filter_map(|peer| self.open.remove(peer)).collect()
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    pub fn clear(&mut self) {
        self.open.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::str::FromStr;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from_str(&format!("127.0.0.1:{}", port)).unwrap()
    }

    fn frame(len: usize) -> Bytes {
        Bytes::from(vec![0xaa; len])
    }

    #[test]
    fn test_frames_for_same_peer_coalesce() {
        let mut buffer = AggregationBuffer::new(1000, 10);
        assert!(buffer.append(addr(1), frame(100), 0).is_none());
        assert!(buffer.append(addr(1), frame(100), 5).is_none());
        assert_eq!(buffer.len(), 1);

        let flushed = buffer.flush_due(11);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].frame_count(), 2);
        assert_eq!(flushed[0].total_len(), 200);
        assert_eq!(flushed.into_iter().next().unwrap().into_datagram().len(), 200);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_peers_get_separate_batches() {
        let mut buffer = AggregationBuffer::new(1000, 10);
        assert!(buffer.append(addr(1), frame(10), 0).is_none());
        assert!(buffer.append(addr(2), frame(10), 0).is_none());
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_size_cap_forces_new_batch() {
        let mut buffer = AggregationBuffer::new(250, 1000);
        assert!(buffer.append(addr(1), frame(100), 0).is_none());
        assert!(buffer.append(addr(1), frame(100), 0).is_none());
        // 100 more would exceed the 250 byte cap: the full batch is displaced
        let displaced = buffer.append(addr(1), frame(100), 0).unwrap();
        assert_eq!(displaced.frame_count(), 2);
        assert_eq!(displaced.total_len(), 200);
        // the new frame went into a fresh batch
        assert_eq!(buffer.len(), 1);
        let remaining = buffer.flush_due(2000);
        assert_eq!(remaining[0].frame_count(), 1);
        assert_eq!(remaining[0].total_len(), 100);
    }

    #[test]
    fn test_exact_fit_is_not_displaced() {
        let mut buffer = AggregationBuffer::new(200, 1000);
        assert!(buffer.append(addr(1), frame(100), 0).is_none());
        assert!(buffer.append(addr(1), frame(100), 0).is_none());
    }

    #[test]
    fn test_expired_batch_displaced_on_append() {
        let mut buffer = AggregationBuffer::new(1000, 10);
        assert!(buffer.append(addr(1), frame(10), 0).is_none());
        let displaced = buffer.append(addr(1), frame(10), 50).unwrap();
        assert_eq!(displaced.frame_count(), 1);
    }

    #[test]
    fn test_flush_due_respects_age() {
        let mut buffer = AggregationBuffer::new(1000, 10);
        assert!(buffer.append(addr(1), frame(10), 0).is_none());
        assert!(buffer.append(addr(2), frame(10), 8).is_none());
        let flushed = buffer.flush_due(11);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].peer, addr(1));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_datagram_preserves_frame_order() {
        let mut buffer = AggregationBuffer::new(1000, 10);
        assert!(buffer.append(addr(1), Bytes::from_static(b"first"), 0).is_none());
        assert!(buffer.append(addr(1), Bytes::from_static(b"second"), 0).is_none());
        let batch = buffer.flush_due(100).pop().unwrap();
        assert_eq!(&batch.into_datagram()[..], b"firstsecond");
    }
}
