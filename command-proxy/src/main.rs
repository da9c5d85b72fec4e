//! TCP to UDP command proxy
//!
//! Lets tools that only speak TCP drive one drone. Each TCP client gets its
//! own UDP command channel; every chunk it sends is forwarded as one datagram
//! and the drone's reply is written back byte for byte. A timeout writes
//! nothing.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use swarm_shared::{defaults, CommandChannel, UdpTransport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, info_span, warn, Instrument};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "command-proxy", version, about = "Forward TCP commands to a drone over UDP")]
struct Cli {
    #[arg(long, default_value = "0.0.0.0:9001")]
    listen: SocketAddr,

    /// Drone to forward to
    #[arg(long)]
    drone: IpAddr,

    #[arg(long, default_value_t = defaults::COMMAND_PORT)]
    port: u16,

    /// Reply timeout per command
    #[arg(long, default_value_t = defaults::COMMAND_TIMEOUT_MS)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let target = SocketAddr::new(cli.drone, cli.port);

    let listener = TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("Failed to listen on {}", cli.listen))?;
    info!("Proxy listening on {}, drone {}", cli.listen, target);

    serve(listener, target, Duration::from_millis(cli.timeout_ms)).await
}

async fn serve(listener: TcpListener, target: SocketAddr, timeout: Duration) -> Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        info!("New TCP client from {}", peer);

        tokio::spawn(
            async move {
                if let Err(e) = handle_client(socket, target, timeout).await {
                    warn!("Client ended: {:#}", e);
                }
                info!("Client disconnected");
            }
            .instrument(info_span!("client", peer = %peer)),
        );
    }
}

async fn handle_client(mut socket: TcpStream, target: SocketAddr, timeout: Duration) -> Result<()> {
    let transport = UdpTransport::bind_ephemeral()
        .await
        .context("Failed to bind UDP socket")?;
    let channel = CommandChannel::new(Arc::new(transport), target);

    let mut buf = vec![0u8; defaults::MAX_DATAGRAM];
    loop {
        let n = socket.read(&mut buf).await.context("TCP read failed")?;
        if n == 0 {
            return Ok(());
        }

        let command = String::from_utf8_lossy(&buf[..n]);
        let command = command.trim();
        if command.is_empty() {
            continue;
        }

        match channel.send_raw(command.as_bytes(), timeout).await? {
            Some(reply) => {
                debug!("'{}' -> '{}'", command, String::from_utf8_lossy(&reply).trim());
                socket.write_all(&reply).await?;
            }
            None => warn!("'{}' timed out", command),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    /// Drone that answers `battery?` with 87, `command` with ok, `sn?` with
    /// bytes that are not UTF-8, and ignores everything else
    async fn spawn_drone() -> SocketAddr {
        let drone = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = drone.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            while let Ok((n, src)) = drone.recv_from(&mut buf).await {
                let reply: &[u8] = match &buf[..n] {
                    b"battery?" => b"87",
                    b"command" => b"ok",
                    b"sn?" => b"\xffTT\r\n",
                    _ => continue,
                };
                let _ = drone.send_to(reply, src).await;
            }
        });
        addr
    }

    async fn spawn_proxy(target: SocketAddr) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, target, Duration::from_millis(100)));
        addr
    }

    async fn read_reply(client: &mut TcpStream) -> String {
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    #[tokio::test]
    async fn test_forwards_command_and_reply() {
        let proxy = spawn_proxy(spawn_drone().await).await;
        let mut client = TcpStream::connect(proxy).await.unwrap();

        client.write_all(b"command\n").await.unwrap();
        assert_eq!(read_reply(&mut client).await, "ok");
    }

    #[tokio::test]
    async fn test_reply_bytes_forwarded_unchanged() {
        let proxy = spawn_proxy(spawn_drone().await).await;
        let mut client = TcpStream::connect(proxy).await.unwrap();

        client.write_all(b"sn?").await.unwrap();
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"\xffTT\r\n");
    }

    #[tokio::test]
    async fn test_timeout_keeps_client_open() {
        let proxy = spawn_proxy(spawn_drone().await).await;
        let mut client = TcpStream::connect(proxy).await.unwrap();

        client.write_all(b"takeoff").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        client.write_all(b"battery?").await.unwrap();
        assert_eq!(read_reply(&mut client).await, "87");
    }

    #[tokio::test]
    async fn test_clients_are_independent() {
        let proxy = spawn_proxy(spawn_drone().await).await;
        let mut first = TcpStream::connect(proxy).await.unwrap();
        let mut second = TcpStream::connect(proxy).await.unwrap();

        second.write_all(b"battery?").await.unwrap();
        first.write_all(b"command").await.unwrap();

        assert_eq!(read_reply(&mut second).await, "87");
        assert_eq!(read_reply(&mut first).await, "ok");
    }
}
