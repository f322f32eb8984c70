//! A reliable datagram transport: ARQ (automatic repeat request) on top of a
//! plain, connectionless UDP socket.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *frames* (defined-length chunks
//!   of bytes), not byte streams
//! * Per-frame reliability is opt-in: callers choose fire-and-forget or
//!   tracked delivery per send
//! * A server-side registry attributes traffic to client connections by
//!   transport address; connections are created by explicit registration
//!   (driven by a client-info packet), refreshed by any valid traffic, and
//!   evicted after a configurable silence
//! * Retransmission timing adapts per connection through a smoothed-RTT
//!   estimator; a coarse AIMD congestion window provides a backoff signal
//! * Small frames bound for the same peer are opportunistically batched
//!   into one datagram to amortize per-packet overhead
//! * Two plain OS threads drive everything - a polling receive loop and a
//!   fixed-interval management loop. No async runtime
//! * Integrity, not authenticity: frames carry a CRC-16 checksum; anything
//!   that fails validation is silently discarded
//!
//! ## Wire format
//!
//! Every frame starts with a fixed 22-byte header, all integers big-endian:
//!
//! ```ascii
//!  0: magic (u32)           constant 0x59544C5A
//!  4: version (u8)          currently 1
//!  5: type (u8)             heartbeat 0, client-info 1, server-info 2,
//!                           frame-data 3, detection-result 4, error 5,
//!                           command 6, ack 7
//!  6: length (u16)          exact byte length of the body that follows
//!  8: sequence (u32)        0 marks fire-and-forget; reliable frames carry
//!                           a per-connection monotonic counter (wrapping,
//!                           compared with signed difference)
//! 12: timestamp (u64)       sender clock, milliseconds since the epoch
//! 20: checksum (u16)        CRC-16/CCITT over the whole frame with this
//!                           field zeroed during computation
//! ```
//!
//! The checksum covers header and body, so the receiver validates in one
//! pass: minimum size, magic, version, length, checksum - then dispatches on
//! the type tag. A datagram may carry several consecutive frames (the
//! aggregation path produces those); frames are self-delimiting through the
//! exact length field.
//!
//! ## Acknowledgements
//!
//! Every validated inbound frame with a nonzero sequence is answered with an
//! ACK echoing that sequence. ACK frames themselves are never acknowledged.
//! The sender keeps reliable frames in a per-connection table until the ACK
//! arrives, retransmitting on an RTO derived from the smoothed RTT, and
//! drops them (counted, window cut) once the retry budget is exhausted.

pub mod aggregation;
pub mod config;
pub mod congestion;
pub mod packet;
pub mod packet_header;
pub mod registry;
pub mod reliability;
pub mod rtt;
pub mod sequence;
pub mod server;
pub mod socket;
pub mod stats;
pub mod time;

pub use config::ServerConfig;
pub use packet::{
    Ack, ClientInfo, Command, Detection, DetectionResult, ErrorMessage, FrameData, Heartbeat,
    Packet, ServerInfo,
};
pub use packet_header::{DecodeError, PacketHeader, PacketType, HEADER_LEN, MAX_FRAME_LEN};
pub use registry::RegistryError;
pub use server::{LifecycleState, ReliableUdpServer, SendError};

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor(unsafe)]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
