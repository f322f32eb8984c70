//! The transport server: lifecycle state machine, the two scheduling loops
//! and the send/receive entry points exposed to external collaborators.
//!
//! Two plain OS threads drive the protocol. The receive thread polls the
//! non-blocking socket, validates inbound frames, answers reliable frames
//! with ACKs and hands payloads to the registered packet handler. The
//! management thread runs on a fixed interval and, in order, evicts
//! timed-out clients, sweeps the retransmission tables and flushes due
//! aggregation batches. Shutdown is cooperative through an atomic running
//! flag that both loops check every iteration.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use anyhow::{bail, Context};
use bytes::BytesMut;
use tracing::{debug, error, info, trace, warn};

use crate::aggregation::AggregationBuffer;
use crate::config::ServerConfig;
use crate::packet::{Ack, ClientInfo, Packet};
use crate::packet_header::{PacketHeader, PacketType, HEADER_LEN, MAX_FRAME_LEN};
use crate::registry::{ClientRegistry, RegistryError};
use crate::reliability::ReliabilityEngine;
use crate::sequence::FIRE_AND_FORGET;
use crate::socket::{is_fatal_socket_error, BoundUdpSocket, DatagramSocket, SocketOptions};
use crate::stats::TransportStats;
use crate::time::epoch_millis;

/// Invoked on every validated inbound payload (the full frame bytes) except
/// ACKs, which the transport consumes itself.
pub type PacketHandler = Arc<dyn Fn(&[u8], SocketAddr) + Send + Sync>;

/// Invoked with the client id when a connection is evicted or removed.
pub type DisconnectHandler = Arc<dyn Fn(u32) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Initializing,
    Running,
    Reinitializing,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("transport is not running")]
    NotRunning,
    #[error("cannot send an empty frame")]
    Empty,
    #[error("frame of {0} bytes is smaller than the 22 byte header")]
    FrameTooSmall(usize),
    #[error("frame of {0} bytes exceeds the maximum frame size of 65536 bytes")]
    FrameTooLarge(usize),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

struct Shared {
    config: ServerConfig,
    state: Mutex<LifecycleState>,
    running: AtomicBool,
    socket: RwLock<Option<Arc<dyn DatagramSocket>>>,
    registry: Arc<Mutex<ClientRegistry>>,
    reliability: ReliabilityEngine,
    aggregation: Mutex<AggregationBuffer>,
    stats: Arc<TransportStats>,
    handler: RwLock<Option<PacketHandler>>,
    disconnect_handler: RwLock<Option<DisconnectHandler>>,
}

pub struct ReliableUdpServer {
    shared: Arc<Shared>,
    receive_thread: Option<JoinHandle<()>>,
    management_thread: Option<JoinHandle<()>>,
}

impl ReliableUdpServer {
    pub fn new(config: ServerConfig) -> anyhow::Result<ReliableUdpServer> {
        config.validate()?;

        let registry = Arc::new(Mutex::new(ClientRegistry::new(
            config.max_clients,
            config.max_packets_in_flight,
        )));
        let stats = Arc::new(TransportStats::default());
        let reliability = ReliabilityEngine::new(
            registry.clone(),
            stats.clone(),
            config.max_retries,
            config.congestion_control,
        );
        let aggregation = Mutex::new(AggregationBuffer::new(
            config.aggregation_max_len,
            config.aggregation_window.as_millis() as u64,
        ));

        Ok(ReliableUdpServer {
            shared: Arc::new(Shared {
                state: Mutex::new(LifecycleState::Stopped),
                running: AtomicBool::new(false),
                socket: RwLock::new(None),
                registry,
                reliability,
                aggregation,
                stats,
                handler: RwLock::new(None),
                disconnect_handler: RwLock::new(None),
                config,
            }),
            receive_thread: None,
            management_thread: None,
        })
    }

    /// Binds the datagram socket. Must be called on a stopped transport.
    pub fn initialize(&mut self) -> anyhow::Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if *state != LifecycleState::Stopped {
            bail!("transport cannot be initialized in state {:?}", *state);
        }
        *state = LifecycleState::Initializing;
        drop(state);

        let socket = BoundUdpSocket::bind(SocketOptions {
            port: self.shared.config.port,
            recv_buffer_size: self.shared.config.recv_buffer_size,
            send_buffer_size: self.shared.config.send_buffer_size,
        })
        .context("binding the transport socket")
        .inspect_err(|_| {
            *self.shared.state.lock().unwrap() = LifecycleState::Stopped;
        })?;

        *self.shared.socket.write().unwrap() = Some(Arc::new(socket));
        Ok(())
    }

    /// Spawns the receive and management threads.
    pub fn start(&mut self) -> anyhow::Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if *state != LifecycleState::Initializing {
            bail!("transport cannot be started in state {:?}", *state);
        }

        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        self.receive_thread = Some(
            thread::Builder::new()
                .name("rudp-receive".to_owned())
                .spawn(move || Self::receive_loop(shared))?,
        );

        let shared = self.shared.clone();
        self.management_thread = Some(
            thread::Builder::new()
                .name("rudp-management".to_owned())
                .spawn(move || Self::management_loop(shared))?,
        );

        *state = LifecycleState::Running;
        info!("transport started on port {:?}", self.local_addr().map(|a| a.port()));
        Ok(())
    }

    /// Stops both loops, closes the socket and clears all connection and
    /// aggregation state. Idempotent.
    pub fn stop(&mut self) -> anyhow::Result<()> {
        self.shared.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.receive_thread.take() {
            if handle.join().is_err() {
                warn!("receive thread panicked before shutdown");
            }
        }
        if let Some(handle) = self.management_thread.take() {
            if handle.join().is_err() {
                warn!("management thread panicked before shutdown");
            }
        }

        *self.shared.socket.write().unwrap() = None;
        self.shared.registry.lock().unwrap().clear();
        self.shared.aggregation.lock().unwrap().clear();
        *self.shared.state.lock().unwrap() = LifecycleState::Stopped;
        info!("transport stopped");
        Ok(())
    }

    pub fn state(&self) -> LifecycleState {
        *self.shared.state.lock().unwrap()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        let socket = self.shared.socket.read().unwrap().clone()?;
        socket.local_addr().ok()
    }

    pub fn set_packet_handler(&self, handler: impl Fn(&[u8], SocketAddr) + Send + Sync + 'static) {
        *self.shared.handler.write().unwrap() = Some(Arc::new(handler));
    }

    pub fn set_disconnect_handler(&self, handler: impl Fn(u32) + Send + Sync + 'static) {
        *self.shared.disconnect_handler.write().unwrap() = Some(Arc::new(handler));
    }

    /// Transmits a pre-serialized frame. With `reliable` the frame gets the
    /// destination connection's next sequence number patched in and is
    /// retransmitted until acknowledged or out of retries; without it the
    /// frame is sent once and forgotten. Small frames may be batched per
    /// destination when aggregation is enabled.
    pub fn send_packet(&self, data: &[u8], target: SocketAddr, reliable: bool) -> Result<(), SendError> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(SendError::NotRunning);
        }
        if data.is_empty() {
            return Err(SendError::Empty);
        }
        if data.len() > MAX_FRAME_LEN {
            return Err(SendError::FrameTooLarge(data.len()));
        }
        let socket = self
            .shared
            .socket
            .read()
            .unwrap()
            .clone()
            .ok_or(SendError::NotRunning)?;

        let now_ms = epoch_millis();
        let mut frame = BytesMut::from(data);

        if reliable
            && self
                .shared
                .reliability
                .prepare_reliable(target, &mut frame, now_ms)
                .is_err()
        {
            return Err(SendError::FrameTooSmall(data.len()));
        }

        let config = &self.shared.config;
        if config.aggregation
            && frame.len() < config.aggregation_frame_threshold
            && frame.len() <= config.aggregation_max_len
        {
            let frame_len = frame.len();
            let displaced = self
                .shared
                .aggregation
                .lock()
                .unwrap()
                .append(target, frame.freeze(), now_ms);
            self.shared.stats.record_sent(frame_len);
            if let Some(batch) = displaced {
                let peer = batch.peer;
                socket.send_to(&batch.into_datagram(), peer)?;
            }
            return Ok(());
        }

        socket.send_to(&frame, target)?;
        self.shared.stats.record_sent(frame.len());
        Ok(())
    }

    pub fn register_client(&self, addr: SocketAddr, info: ClientInfo) -> Result<u32, RegistryError> {
        self.shared
            .registry
            .lock()
            .unwrap()
            .register_or_update(addr, info, epoch_millis())
    }

    pub fn remove_client(&self, client_id: u32) -> anyhow::Result<()> {
        let removed = self.shared.registry.lock().unwrap().remove(client_id);
        if removed.is_none() {
            bail!("client #{} is not registered", client_id);
        }
        let handler = self.shared.disconnect_handler.read().unwrap().clone();
        if let Some(handler) = handler {
            handler(client_id);
        }
        Ok(())
    }

    pub fn find_client_by_address(&self, addr: SocketAddr) -> Option<u32> {
        self.shared.registry.lock().unwrap().find_by_address(addr)
    }

    pub fn has_client(&self, client_id: u32) -> bool {
        self.shared.registry.lock().unwrap().contains(client_id)
    }

    pub fn client_count(&self) -> usize {
        self.shared.registry.lock().unwrap().len()
    }

    pub fn status(&self) -> HashMap<String, String> {
        let stats = &self.shared.stats;
        let mut status = HashMap::new();
        status.insert(
            "running".to_owned(),
            self.shared.running.load(Ordering::SeqCst).to_string(),
        );
        status.insert("state".to_owned(), format!("{:?}", self.state()));
        status.insert(
            "port".to_owned(),
            self.local_addr().map(|a| a.port()).unwrap_or(0).to_string(),
        );
        status.insert("client_count".to_owned(), self.client_count().to_string());
        for (key, value) in [
            ("packets_sent", &stats.packets_sent),
            ("packets_received", &stats.packets_received),
            ("bytes_sent", &stats.bytes_sent),
            ("bytes_received", &stats.bytes_received),
            ("packets_retransmitted", &stats.packets_retransmitted),
            ("packets_dropped", &stats.packets_dropped),
        ] {
            status.insert(key.to_owned(), value.load(Ordering::Relaxed).to_string());
        }
        status
    }

    fn receive_loop(shared: Arc<Shared>) {
        info!("receive loop started");
        let mut buf = vec![0u8; MAX_FRAME_LEN];

        while shared.running.load(Ordering::Relaxed) {
            let Some(socket) = shared.socket.read().unwrap().clone() else {
                break;
            };

            match socket.try_recv_from(&mut buf) {
                Ok(Some((len, from))) => {
                    shared.stats.record_received(len);
                    Self::handle_datagram(&shared, socket.as_ref(), &buf[..len], from);
                }
                Ok(None) => {
                    thread::sleep(shared.config.receive_idle_sleep);
                }
                Err(e) if is_fatal_socket_error(&e) => {
                    error!("fatal socket error: {} - reinitializing socket in place", e);
                    *shared.state.lock().unwrap() = LifecycleState::Reinitializing;
                    match socket.reinitialize() {
                        Ok(()) => {
                            *shared.state.lock().unwrap() = LifecycleState::Running;
                        }
                        Err(e) => {
                            error!("socket reinitialization failed: {} - transport is failed", e);
                            *shared.state.lock().unwrap() = LifecycleState::Failed;
                            shared.running.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                }
                Err(e) => {
                    debug!("transient socket error: {}", e);
                    thread::sleep(shared.config.receive_idle_sleep);
                }
            }
        }
        info!("receive loop stopped");
    }

    /// A datagram is a sequence of one or more self-delimiting frames (more
    /// than one when the sender aggregates). The remainder is discarded on
    /// the first invalid frame since its boundaries cannot be trusted.
    fn handle_datagram(shared: &Shared, socket: &dyn DatagramSocket, datagram: &[u8], from: SocketAddr) {
        let now_ms = epoch_millis();
        let mut rest = datagram;
        while !rest.is_empty() {
            let header = match PacketHeader::validate_frame(rest) {
                Ok(header) => header,
                Err(e) => {
                    debug!("discarding invalid frame from {:?}: {}", from, e);
                    return;
                }
            };
            let (frame, tail) = rest.split_at(header.frame_len());
            rest = tail;
            Self::process_frame(shared, socket, &header, frame, from, now_ms);
        }
    }

    fn process_frame(
        shared: &Shared,
        socket: &dyn DatagramSocket,
        header: &PacketHeader,
        frame: &[u8],
        from: SocketAddr,
        now_ms: u64,
    ) {
        trace!(
            "received {:?} frame (sequence {}) from {:?}",
            header.packet_type,
            header.sequence,
            from
        );

        let known = shared
            .registry
            .lock()
            .unwrap()
            .touch(from, now_ms, header.sequence);

        if header.packet_type == PacketType::Ack {
            // ACKs are consumed here and never acknowledged themselves
            match Packet::decode_body(PacketType::Ack, &frame[HEADER_LEN..]) {
                Ok(Packet::Ack(ack)) => {
                    shared.reliability.on_ack(from, ack.acked_sequence, now_ms);
                }
                _ => debug!("discarding malformed ACK from {:?}", from),
            }
            return;
        }

        if header.sequence != FIRE_AND_FORGET {
            Self::send_ack(shared, socket, from, header.sequence);
        }

        if known.is_none()
            && !matches!(
                header.packet_type,
                PacketType::ClientInfo | PacketType::Heartbeat
            )
        {
            debug!(
                "dropping {:?} frame from unknown address {:?}",
                header.packet_type, from
            );
            return;
        }

        let handler = shared.handler.read().unwrap().clone();
        if let Some(handler) = handler {
            handler(frame, from);
        } else {
            trace!("no packet handler registered - dropping payload");
        }
    }

    fn send_ack(shared: &Shared, socket: &dyn DatagramSocket, to: SocketAddr, sequence: u32) {
        let ack = Packet::Ack(Ack { acked_sequence: sequence });
        match ack.encode(FIRE_AND_FORGET, epoch_millis()) {
            Ok(frame) => {
                if let Err(e) = socket.send_to(&frame, to) {
                    debug!("failed to send ACK for sequence {} to {:?}: {}", sequence, to, e);
                } else {
                    shared.stats.record_sent(frame.len());
                }
            }
            Err(e) => error!("failed to encode ACK frame: {}", e),
        }
    }

    fn management_loop(shared: Arc<Shared>) {
        info!("management loop started");
        let timeout_ms = shared.config.client_timeout.as_millis() as u64;

        while shared.running.load(Ordering::Relaxed) {
            let now_ms = epoch_millis();

            // order matters: eviction first, then the retransmission sweep,
            // then the aggregation flush
            let evicted = shared
                .registry
                .lock()
                .unwrap()
                .evict_timed_out(now_ms, timeout_ms);
            if !evicted.is_empty() {
                let handler = shared.disconnect_handler.read().unwrap().clone();
                for (client_id, addr) in evicted {
                    info!("client #{} at {:?} evicted after inactivity", client_id, addr);
                    if let Some(handler) = &handler {
                        handler(client_id);
                    }
                }
            }

            if let Some(socket) = shared.socket.read().unwrap().clone() {
                shared.reliability.tick(now_ms, socket.as_ref());

                let due = shared.aggregation.lock().unwrap().flush_due(now_ms);
                for batch in due {
                    let peer = batch.peer;
                    trace!(
                        "flushing batch #{} ({} frames, {} bytes) to {:?}",
                        batch.id,
                        batch.frame_count(),
                        batch.total_len(),
                        peer
                    );
                    if let Err(e) = socket.send_to(&batch.into_datagram(), peer) {
                        warn!("failed to flush aggregation batch to {:?}: {}", peer, e);
                    }
                }
            }

            thread::sleep(shared.config.management_interval);
        }
        info!("management loop stopped");
    }
}

impl Drop for ReliableUdpServer {
    fn drop(&mut self) {
        if self.shared.running.load(Ordering::SeqCst) {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut server = ReliableUdpServer::new(test_config()).unwrap();
        assert_eq!(server.state(), LifecycleState::Stopped);

        server.initialize().unwrap();
        assert_eq!(server.state(), LifecycleState::Initializing);
        assert!(server.local_addr().unwrap().port() > 0);

        server.start().unwrap();
        assert_eq!(server.state(), LifecycleState::Running);

        server.stop().unwrap();
        assert_eq!(server.state(), LifecycleState::Stopped);
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn test_start_requires_initialize() {
        let mut server = ReliableUdpServer::new(test_config()).unwrap();
        assert!(server.start().is_err());
    }

    #[test]
    fn test_double_initialize_is_rejected() {
        let mut server = ReliableUdpServer::new(test_config()).unwrap();
        server.initialize().unwrap();
        assert!(server.initialize().is_err());
        server.stop().unwrap();
    }

    #[test]
    fn test_send_before_start_is_rejected() {
        let server = ReliableUdpServer::new(test_config()).unwrap();
        let target = "127.0.0.1:9".parse().unwrap();
        assert!(matches!(
            server.send_packet(&[1, 2, 3], target, false),
            Err(SendError::NotRunning)
        ));
    }

    #[test]
    fn test_send_argument_validation() {
        let mut server = ReliableUdpServer::new(test_config()).unwrap();
        server.initialize().unwrap();
        server.start().unwrap();
        let target = "127.0.0.1:9".parse().unwrap();

        assert!(matches!(
            server.send_packet(&[], target, false),
            Err(SendError::Empty)
        ));
        assert!(matches!(
            server.send_packet(&vec![0; MAX_FRAME_LEN + 1], target, false),
            Err(SendError::FrameTooLarge(_))
        ));
        // a reliable frame must at least hold a header to patch
        let target_registered = {
            let info = ClientInfo {
                client_id: 0,
                protocol_version: 1,
                screen_width: 1,
                screen_height: 1,
                game_id: 1,
            };
            server.register_client(target, info).unwrap();
            target
        };
        assert!(matches!(
            server.send_packet(&[1, 2, 3], target_registered, true),
            Err(SendError::FrameTooSmall(3))
        ));

        server.stop().unwrap();
    }

    #[test]
    fn test_registry_api_surface() {
        let server = ReliableUdpServer::new(test_config()).unwrap();
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let info = ClientInfo {
            client_id: 0,
            protocol_version: 1,
            screen_width: 640,
            screen_height: 480,
            game_id: 2,
        };

        assert_eq!(server.client_count(), 0);
        let id = server.register_client(addr, info).unwrap();
        assert!(server.has_client(id));
        assert_eq!(server.find_client_by_address(addr), Some(id));
        assert_eq!(server.client_count(), 1);

        server.remove_client(id).unwrap();
        assert!(!server.has_client(id));
        assert!(server.remove_client(id).is_err());
    }

    #[test]
    fn test_status_map() {
        let mut server = ReliableUdpServer::new(test_config()).unwrap();
        server.initialize().unwrap();
        server.start().unwrap();

        let status = server.status();
        assert_eq!(status["running"], "true");
        assert_eq!(status["state"], "Running");
        assert_eq!(status["client_count"], "0");
        assert_ne!(status["port"], "0");
        for key in [
            "packets_sent",
            "packets_received",
            "bytes_sent",
            "bytes_received",
            "packets_retransmitted",
            "packets_dropped",
        ] {
            assert!(status.contains_key(key), "missing status key {}", key);
        }

        server.stop().unwrap();
        assert_eq!(server.status()["running"], "false");
    }
}
