//! Per-peer connection state and the address-indexed registry that owns it.
//!
//! One [`ClientConnection`] exists per distinct transport address. It is
//! created through [`ClientRegistry::register_or_update`] (driven by a valid
//! client-info packet), never from arbitrary traffic, and carries the whole
//! reliability state of that peer: outbound sequence counter, unacknowledged
//! frame table, RTT estimate and congestion window.

use std::net::SocketAddr;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::congestion::CongestionController;
use crate::packet::ClientInfo;
use crate::rtt::RttEstimator;
use crate::sequence::{self, FIRE_AND_FORGET};

/// Bookkeeping for one reliable frame awaiting its acknowledgement.
#[derive(Debug, Clone)]
pub struct PacketAckInfo {
    pub sent_at_ms: u64,
    pub retries: u8,
    pub frame: Bytes,
}

#[derive(Debug)]
pub struct ClientConnection {
    pub client_id: u32,
    pub addr: SocketAddr,
    pub info: ClientInfo,
    pub last_active_ms: u64,
    next_send_sequence: u32,
    newest_remote_sequence: u32,
    pub unacked: FxHashMap<u32, PacketAckInfo>,
    pub rtt: RttEstimator,
    pub congestion: CongestionController,
}

impl ClientConnection {
    fn new(client_id: u32, addr: SocketAddr, info: ClientInfo, now_ms: u64, max_window: u32) -> ClientConnection {
        ClientConnection {
            client_id,
            addr,
            info,
            last_active_ms: now_ms,
            next_send_sequence: 1,
            newest_remote_sequence: FIRE_AND_FORGET,
            unacked: FxHashMap::default(),
            rtt: RttEstimator::default(),
            congestion: CongestionController::new(max_window),
        }
    }

    /// Hands out the next outbound sequence number. Wraps around, skipping
    /// the fire-and-forget marker.
    pub fn next_sequence(&mut self) -> u32 {
        let seq = self.next_send_sequence;
        self.next_send_sequence = self.next_send_sequence.wrapping_add(1);
        if self.next_send_sequence == FIRE_AND_FORGET {
            self.next_send_sequence = 1;
        }
        seq
    }

    pub fn track(&mut self, sequence: u32, frame: Bytes, now_ms: u64) {
        self.unacked.insert(
            sequence,
            PacketAckInfo {
                sent_at_ms: now_ms,
                retries: 0,
                frame,
            },
        );
    }

    /// Highest reliable sequence number seen from this peer so far.
    pub fn newest_remote_sequence(&self) -> u32 {
        self.newest_remote_sequence
    }

    fn note_remote_sequence(&mut self, sequence: u32) {
        if sequence != FIRE_AND_FORGET && sequence::is_newer(sequence, self.newest_remote_sequence) {
            self.newest_remote_sequence = sequence;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The registry is at capacity. New registrations are rejected rather
    /// than evicting an existing client.
    #[error("client registry is full ({max} clients)")]
    Full { max: usize },
}

#[derive(Debug)]
pub struct ClientRegistry {
    connections: FxHashMap<u32, ClientConnection>,
    by_addr: FxHashMap<SocketAddr, u32>,
    next_client_id: u32,
    max_clients: usize,
    max_window: u32,
}

impl ClientRegistry {
    pub fn new(max_clients: usize, max_window: u32) -> ClientRegistry {
        ClientRegistry {
            connections: FxHashMap::default(),
            by_addr: FxHashMap::default(),
            next_client_id: 1,
            max_clients,
            max_window,
        }
    }

    /// Registers the peer at `addr`, or refreshes it if it is already known.
    /// Re-registration from the same address updates metadata and liveness
    /// in place and returns the existing id - it never duplicates, and it
    /// never recycles ids of removed clients.
    pub fn register_or_update(
        &mut self,
        addr: SocketAddr,
        info: ClientInfo,
        now_ms: u64,
    ) -> Result<u32, RegistryError> {
        if let Some(&client_id) = self.by_addr.get(&addr) {
            if let Some(conn) = self.connections.get_mut(&client_id) {
                conn.info = info;
                conn.last_active_ms = now_ms;
                debug!("refreshed client #{} at {:?}", client_id, addr);
                return Ok(client_id);
            }
        }

        if self.connections.len() >= self.max_clients {
            return Err(RegistryError::Full { max: self.max_clients });
        }

        let client_id = self.next_client_id;
        self.next_client_id = self.next_client_id.wrapping_add(1).max(1);

        self.connections.insert(
            client_id,
            ClientConnection::new(client_id, addr, info, now_ms, self.max_window),
        );
        self.by_addr.insert(addr, client_id);
        info!("new client #{} at {:?} (game {})", client_id, addr, info.game_id);
        Ok(client_id)
    }

    pub fn find_by_address(&self, addr: SocketAddr) -> Option<u32> {
        self.by_addr.get(&addr).copied()
    }

    pub fn contains(&self, client_id: u32) -> bool {
        self.connections.contains_key(&client_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connection_mut(&mut self, client_id: u32) -> Option<&mut ClientConnection> {
        self.connections.get_mut(&client_id)
    }

    pub fn connection_by_addr_mut(&mut self, addr: SocketAddr) -> Option<&mut ClientConnection> {
        let client_id = *self.by_addr.get(&addr)?;
        self.connections.get_mut(&client_id)
    }

    pub fn connections_mut(&mut self) -> impl Iterator<Item = &mut ClientConnection> {
        self.connections.values_mut()
    }

    /// Attributes an inbound frame to its connection: refreshes the liveness
    /// timestamp and the newest-seen remote sequence. Returns `None` for
    /// unknown senders.
    pub fn touch(&mut self, addr: SocketAddr, now_ms: u64, remote_sequence: u32) -> Option<u32> {
        let conn = self.connection_by_addr_mut(addr)?;
        conn.last_active_ms = now_ms;
        conn.note_remote_sequence(remote_sequence);
        Some(conn.client_id)
    }

    pub fn remove(&mut self, client_id: u32) -> Option<ClientConnection> {
        let conn = self.connections.remove(&client_id)?;
        self.by_addr.remove(&conn.addr);
        info!("removed client #{} at {:?}", client_id, conn.addr);
        Some(conn)
    }

    /// Drops every connection that has been silent for longer than
    /// `timeout_ms` and returns the evicted peers so the transport can raise
    /// client-disconnected notifications.
    pub fn evict_timed_out(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<(u32, SocketAddr)> {
        let timed_out: Vec<(u32, SocketAddr)> = self
            .connections
            .values()
            .filter(|c| now_ms.saturating_sub(c.last_active_ms) > timeout_ms)
            .map(|c| (c.client_id, c.addr))
            .collect();

        for &(client_id, addr) in &timed_out {
            self.connections.remove(&client_id);
            self.by_addr.remove(&addr);
            info!("client #{} at {:?} timed out", client_id, addr);
        }
        timed_out
    }

    pub fn clear(&mut self) {
        self.connections.clear();
        self.by_addr.clear();
    }
}
