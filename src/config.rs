use std::time::Duration;

use anyhow::bail;

use crate::packet_header::MAX_FRAME_LEN;

/// Tuning knobs of the transport. [`ServerConfig::default`] mirrors the
/// values the protocol was deployed with; [`validate`](ServerConfig::validate)
/// is called on construction of the server and rejects inconsistent setups
/// instead of misbehaving at runtime.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// UDP port to listen on. If it is taken, binding falls back to the next
    /// port once. 0 binds an ephemeral port.
    pub port: u16,

    /// SO_RCVBUF / SO_SNDBUF for the datagram socket. Applied best-effort;
    /// the OS may clamp them.
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,

    /// A connection with no inbound traffic for this long is evicted by the
    /// management loop.
    pub client_timeout: Duration,

    /// The interval clients are expected to send heartbeats at. Must be
    /// comfortably below `client_timeout`, otherwise healthy clients would
    /// be evicted between heartbeats.
    pub heartbeat_interval: Duration,

    /// How often an unacknowledged reliable frame is retransmitted before it
    /// is dropped and counted.
    pub max_retries: u8,

    /// Upper bound for the per-connection congestion window, i.e. for how
    /// many reliable frames may be outstanding at once.
    pub max_packets_in_flight: u32,

    /// Grow the congestion window on ACKs, cut it on retry exhaustion. When
    /// disabled the window stays at its initial size.
    pub congestion_control: bool,

    /// Batch small outbound frames per destination instead of sending each
    /// in its own datagram.
    pub aggregation: bool,

    /// Only frames smaller than this are considered for aggregation.
    pub aggregation_frame_threshold: usize,

    /// A batch is flushed before its total size would exceed this.
    pub aggregation_max_len: usize,

    /// A batch is flushed once it is older than this, full or not.
    pub aggregation_window: Duration,

    /// Registrations beyond this are rejected with a distinct error; no
    /// existing client is ever evicted to make room.
    pub max_clients: usize,

    /// Cycle time of the management loop (eviction, retransmission sweep,
    /// aggregation flush).
    pub management_interval: Duration,

    /// How long the receive loop naps when the socket has nothing pending.
    pub receive_idle_sleep: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 7788,
            recv_buffer_size: 1024 * 1024,
            send_buffer_size: 1024 * 1024,
            client_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(1),
            max_retries: 5,
            max_packets_in_flight: 32,
            congestion_control: true,
            aggregation: true,
            aggregation_frame_threshold: 1024,
            aggregation_max_len: 8192,
            aggregation_window: Duration::from_millis(10),
            max_clients: 10,
            management_interval: Duration::from_millis(100),
            receive_idle_sleep: Duration::from_micros(100),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_clients == 0 {
            bail!("max_clients must be at least 1");
        }
        if self.max_packets_in_flight == 0 {
            bail!("max_packets_in_flight must be at least 1");
        }
        if self.client_timeout <= self.heartbeat_interval {
            bail!(
                "client_timeout ({:?}) must exceed heartbeat_interval ({:?}), otherwise healthy clients get evicted",
                self.client_timeout,
                self.heartbeat_interval
            );
        }
        if self.aggregation {
            if self.aggregation_max_len > MAX_FRAME_LEN {
                bail!(
                    "aggregation_max_len ({}) exceeds the maximum datagram size ({})",
                    self.aggregation_max_len,
                    MAX_FRAME_LEN
                );
            }
            if self.aggregation_frame_threshold > self.aggregation_max_len {
                bail!(
                    "aggregation_frame_threshold ({}) exceeds aggregation_max_len ({})",
                    self.aggregation_frame_threshold,
                    self.aggregation_max_len
                );
            }
        }
        if self.management_interval.is_zero() {
            bail!("management_interval must not be zero");
        }
        Ok(())
    }
}
