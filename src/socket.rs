//! The datagram socket seam between the transport and the operating system.
//!
//! The transport talks to [`DatagramSocket`] rather than to a concrete UDP
//! socket so the reliability machinery can be driven by a mock in tests
//! (deterministic socket failures included). [`BoundUdpSocket`] is the real
//! implementation: a non-blocking `std::net::UdpSocket` with the configured
//! buffer sizes, bound with a single fallback to the next port if the
//! requested one is taken.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::RwLock;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{info, warn};

#[cfg_attr(test, mockall::automock)]
pub trait DatagramSocket: Send + Sync {
    fn send_to(&self, frame: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Non-blocking receive; `Ok(None)` when no datagram is pending.
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Rebinds the underlying socket in place after a fatal socket error.
    fn reinitialize(&self) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    pub port: u16,
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
}

#[derive(Debug)]
pub struct BoundUdpSocket {
    options: SocketOptions,
    inner: RwLock<UdpSocket>,
}

impl BoundUdpSocket {
    pub fn bind(options: SocketOptions) -> io::Result<BoundUdpSocket> {
        let socket = bind_with_fallback(&options)?;
        info!("bound datagram socket to {:?}", socket.local_addr()?);
        Ok(BoundUdpSocket {
            options,
            inner: RwLock::new(socket),
        })
    }
}

impl DatagramSocket for BoundUdpSocket {
    fn send_to(&self, frame: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.inner.read().unwrap().send_to(frame, target)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.inner.read().unwrap().recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.read().unwrap().local_addr()
    }

    fn reinitialize(&self) -> io::Result<()> {
        let fresh = bind_with_fallback(&self.options)?;
        info!("reinitialized datagram socket at {:?}", fresh.local_addr()?);
        *self.inner.write().unwrap() = fresh;
        Ok(())
    }
}

fn bind_with_fallback(options: &SocketOptions) -> io::Result<UdpSocket> {
    match bind_once(options, options.port) {
        Err(e) if e.kind() == io::ErrorKind::AddrInUse && options.port != 0 => {
            warn!(
                "port {} is already in use, falling back to {}",
                options.port,
                options.port + 1
            );
            bind_once(options, options.port + 1)
        }
        other => other,
    }
}

fn bind_once(options: &SocketOptions, port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if let Err(e) = socket.set_recv_buffer_size(options.recv_buffer_size) {
        warn!("could not set receive buffer to {} bytes: {}", options.recv_buffer_size, e);
    }
    if let Err(e) = socket.set_send_buffer_size(options.send_buffer_size) {
        warn!("could not set send buffer to {} bytes: {}", options.send_buffer_size, e);
    }
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port);
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// The small whitelist of socket errors that warrant rebinding the socket in
/// place. Everything else transient is logged and retried as-is.
pub fn is_fatal_socket_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::NetworkDown
    )
}
