//! The ARQ core: unacknowledged-frame tracking, acknowledgement handling and
//! the retransmission sweep.
//!
//! Reliable frames get their sequence number assigned here at send time (the
//! caller hands over a fully serialized frame; the sequence field is patched
//! in and the checksum recomputed), so the peer's acknowledgements match the
//! tracking table by construction. The sweep runs once per management tick
//! and retransmits or drops entries based on each connection's RTT-derived
//! timeout.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::packet_header::{DecodeError, PacketHeader, HEADER_LEN};
use crate::registry::ClientRegistry;
use crate::socket::DatagramSocket;
use crate::stats::TransportStats;

pub struct ReliabilityEngine {
    registry: Arc<Mutex<ClientRegistry>>,
    stats: Arc<TransportStats>,
    max_retries: u8,
    congestion_control: bool,
}

impl ReliabilityEngine {
    pub fn new(
        registry: Arc<Mutex<ClientRegistry>>,
        stats: Arc<TransportStats>,
        max_retries: u8,
        congestion_control: bool,
    ) -> ReliabilityEngine {
        ReliabilityEngine {
            registry,
            stats,
            max_retries,
            congestion_control,
        }
    }

    /// Assigns the target connection's next sequence number to `frame`,
    /// patches it in and records the frame for retransmission. Returns the
    /// assigned sequence, or `None` when the target is not a registered
    /// client - the frame then goes out untracked, since there is no
    /// connection to anchor the acknowledgement to.
    pub fn prepare_reliable(
        &self,
        target: SocketAddr,
        frame: &mut BytesMut,
        now_ms: u64,
    ) -> Result<Option<u32>, DecodeError> {
        if frame.len() < HEADER_LEN {
            return Err(DecodeError::TooShort(frame.len()));
        }

        let mut registry = self.registry.lock().unwrap();
        let Some(conn) = registry.connection_by_addr_mut(target) else {
            debug!("reliable send to unregistered {:?} goes untracked", target);
            return Ok(None);
        };

        let sequence = conn.next_sequence();
        PacketHeader::patch_sequence(frame, sequence)?;
        conn.track(sequence, Bytes::copy_from_slice(frame), now_ms);
        trace!(
            "tracking sequence {} for client #{} ({} outstanding)",
            sequence,
            conn.client_id,
            conn.unacked.len()
        );
        Ok(Some(sequence))
    }

    /// Clears the acknowledged entry, feeds the RTT sample and grows the
    /// congestion window. A duplicate ACK for an already-cleared sequence is
    /// a no-op.
    pub fn on_ack(&self, from: SocketAddr, acked_sequence: u32, now_ms: u64) {
        let mut registry = self.registry.lock().unwrap();
        let Some(conn) = registry.connection_by_addr_mut(from) else {
            trace!("ACK from unknown address {:?} - ignoring", from);
            return;
        };

        let Some(info) = conn.unacked.remove(&acked_sequence) else {
            trace!(
                "duplicate ACK for sequence {} from client #{} - ignoring",
                acked_sequence,
                conn.client_id
            );
            return;
        };

        let rtt_ms = now_ms.saturating_sub(info.sent_at_ms);
        conn.rtt.on_sample(rtt_ms);
        if self.congestion_control {
            conn.congestion.on_ack();
        }
        trace!(
            "ACK for sequence {} from client #{} after {} ms (srtt {} ms)",
            acked_sequence,
            conn.client_id,
            rtt_ms,
            conn.rtt.srtt_ms()
        );
    }

    /// The retransmission sweep, run once per management cycle. Entries older
    /// than their connection's retransmission timeout are resent unchanged
    /// until the retry budget is exhausted, then dropped and counted.
    pub fn tick(&self, now_ms: u64, socket: &dyn DatagramSocket) {
        let mut registry = self.registry.lock().unwrap();

        for conn in registry.connections_mut() {
            let rto_ms = conn.rtt.rto_ms();

            let mut resend = Vec::new();
            let mut expired = Vec::new();
            for (&sequence, info) in &conn.unacked {
                if now_ms.saturating_sub(info.sent_at_ms) <= rto_ms {
                    continue;
                }
                if info.retries >= self.max_retries {
                    expired.push(sequence);
                } else {
                    resend.push(sequence);
                }
            }

            for sequence in resend {
                let Some(info) = conn.unacked.get_mut(&sequence) else {
                    continue;
                };
                if let Err(e) = socket.send_to(&info.frame, conn.addr) {
                    warn!(
                        "retransmit of sequence {} to client #{} failed: {}",
                        sequence, conn.client_id, e
                    );
                }
                info.retries += 1;
                info.sent_at_ms = now_ms;
                self.stats.record_retransmit(info.frame.len());
                debug!(
                    "retransmitted sequence {} to client #{} (retry {} of {})",
                    sequence, conn.client_id, info.retries, self.max_retries
                );
            }

            for sequence in expired {
                conn.unacked.remove(&sequence);
                self.stats.record_dropped();
                if self.congestion_control {
                    conn.congestion.on_loss();
                }
                debug!(
                    "dropping sequence {} to client #{}: retry budget of {} exhausted",
                    sequence, conn.client_id, self.max_retries
                );
            }
        }
    }
}
