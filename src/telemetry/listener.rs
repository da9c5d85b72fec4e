//! Telemetry listener
//!
//! Receives the status strings every drone pushes to the fixed telemetry
//! port. The listener is independent of the command sockets and never feeds
//! anything back into a session; events only end up in the log.

use anyhow::{Context, Result};
use futures::stream::{self, Stream, StreamExt};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use swarm_shared::codec::parse_state_fields;
use swarm_shared::defaults::MAX_DATAGRAM;
use swarm_shared::{now_ms, DatagramTransport, UdpTransport};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause after a failed receive before trying again
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(200);

/// One status push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryEvent {
    pub source: SocketAddr,
    pub payload: String,
    pub received_at_ms: u64,
}

impl TelemetryEvent {
    /// `key:value;` fields of the payload, ordered by key
    pub fn fields(&self) -> BTreeMap<String, String> {
        parse_state_fields(&self.payload)
    }
}

pub struct TelemetryListener {
    socket: Arc<dyn DatagramTransport>,
}

impl TelemetryListener {
    pub fn new(socket: Arc<dyn DatagramTransport>) -> Self {
        Self { socket }
    }

    /// Bind the listener on all interfaces
    pub async fn bind(port: u16) -> Result<Self> {
        Self::bind_addr(SocketAddr::from(([0, 0, 0, 0], port))).await
    }

    pub async fn bind_addr(addr: SocketAddr) -> Result<Self> {
        let socket = UdpTransport::bind(addr)
            .await
            .with_context(|| format!("Failed to bind telemetry port {}", addr))?;
        Ok(Self::new(Arc::new(socket)))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Lazy, unbounded sequence of events. Ends only when `cancel` fires;
    /// receive errors are logged and retried after a short pause.
    pub fn events(&self, cancel: CancellationToken) -> impl Stream<Item = TelemetryEvent> + Send {
        let socket = self.socket.clone();

        stream::unfold((socket, cancel), |(socket, cancel)| async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    received = socket.recv_from(&mut buf) => received,
                };

                match received {
                    Ok((n, source)) => {
                        let payload = String::from_utf8_lossy(&buf[..n]).trim().to_string();
                        if payload.is_empty() {
                            continue;
                        }
                        let event = TelemetryEvent {
                            source,
                            payload,
                            received_at_ms: now_ms(),
                        };
                        return Some((event, (socket, cancel)));
                    }
                    Err(e) => {
                        warn!("Telemetry receive failed: {}", e);
                        tokio::select! {
                            _ = cancel.cancelled() => return None,
                            _ = sleep(RECV_ERROR_BACKOFF) => {}
                        }
                    }
                }
            }
        })
    }

    /// Log every event in the background until `cancel` fires
    pub fn spawn_logger(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Ok(addr) = self.local_addr() {
                info!("Telemetry listener on {}", addr);
            }

            let events = self.events(cancel);
            futures::pin_mut!(events);
            while let Some(event) = events.next().await {
                let fields = event.fields();
                match (fields.get("bat"), fields.get("h")) {
                    (Some(bat), Some(h)) => {
                        debug!("[{}] bat={}% h={}cm", event.source.ip(), bat, h)
                    }
                    _ => debug!("[{}] {}", event.source.ip(), event.payload),
                }
            }
            info!("Telemetry listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::io;
    use tokio::net::UdpSocket;

    /// Fails a fixed number of receives, then yields one status push forever
    struct FlakySocket {
        failures: Mutex<u32>,
    }

    #[async_trait]
    impl DatagramTransport for FlakySocket {
        async fn send_to(&self, payload: &[u8], _target: SocketAddr) -> io::Result<usize> {
            Ok(payload.len())
        }

        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(io::ErrorKind::ConnectionReset.into());
                }
            }
            let push = b"bat:55;h:30;";
            buf[..push.len()].copy_from_slice(push);
            Ok((push.len(), SocketAddr::from(([192, 168, 137, 7], 8889))))
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from(([0, 0, 0, 0], 8890)))
        }
    }

    async fn listener() -> TelemetryListener {
        TelemetryListener::bind_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_events_carry_source_and_fields() {
        let listener = listener().await;
        let addr = listener.local_addr().unwrap();
        let drone = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        drone
            .send_to(b"pitch:0;roll:0;bat:87;h:120;\r\n", addr)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let events = listener.events(cancel.clone());
        futures::pin_mut!(events);
        let event = tokio::time::timeout(Duration::from_secs(2), events.next())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(event.source, drone.local_addr().unwrap());
        assert_eq!(event.payload, "pitch:0;roll:0;bat:87;h:120;");
        assert_eq!(event.fields().get("h").map(String::as_str), Some("120"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_errors_do_not_end_stream() {
        let listener = TelemetryListener::new(Arc::new(FlakySocket {
            failures: Mutex::new(3),
        }));
        let events = listener.events(CancellationToken::new());
        futures::pin_mut!(events);

        let started = tokio::time::Instant::now();
        let event = events.next().await.unwrap();
        assert_eq!(event.fields().get("bat").map(String::as_str), Some("55"));
        assert_eq!(started.elapsed(), RECV_ERROR_BACKOFF * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_ends_stream() {
        let listener = TelemetryListener::new(Arc::new(FlakySocket {
            failures: Mutex::new(u32::MAX),
        }));
        let cancel = CancellationToken::new();
        let events = listener.events(cancel.clone());
        futures::pin_mut!(events);

        let stopper = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(500)).await;
            stopper.cancel();
        });
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn test_stream_ends_on_cancel() {
        let listener = listener().await;
        let cancel = CancellationToken::new();
        let events = listener.events(cancel.clone());
        futures::pin_mut!(events);

        cancel.cancel();
        let next = tokio::time::timeout(Duration::from_secs(2), events.next())
            .await
            .unwrap();
        assert_eq!(next, None);
    }

    #[tokio::test]
    async fn test_logger_stops_on_cancel() {
        let listener = listener().await;
        let cancel = CancellationToken::new();
        let handle = listener.spawn_logger(cancel.clone());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
