//! Datagram transport abstraction for pluggable network backends

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// A connectionless transport that can send and receive whole datagrams
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Send one datagram to `target`
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram, returning its length and source address
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Local address this transport is bound to
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// UDP socket wrapper implementing DatagramTransport
#[derive(Debug)]
pub struct UdpTransport {
    inner: UdpSocket,
}

impl UdpTransport {
    pub fn new(socket: UdpSocket) -> Self {
        Self { inner: socket }
    }

    /// Bind to the given local address
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::new(socket))
    }

    /// Bind to an ephemeral port on all interfaces
    pub async fn bind_ephemeral() -> io::Result<Self> {
        Self::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(payload, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
