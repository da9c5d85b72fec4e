//! Video capability
//!
//! Decoding is not done here. A capability turns a stream source identifier
//! into a lazy sequence of frames; the session only starts and stops it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use swarm_shared::defaults::MAX_DATAGRAM;
use swarm_shared::now_ms;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One unit delivered by a video source
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Bytes,
    pub received_at_ms: u64,
}

/// Opens a stream source and yields frames until dropped
#[async_trait]
pub trait VideoCapability: Send + Sync {
    async fn open(&self, source: &str) -> Result<BoxStream<'static, VideoFrame>>;
}

/// Raw UDP stream monitor: every datagram is one frame chunk
#[derive(Debug, Default)]
pub struct UdpVideoMonitor;

/// Datagram size used for the video socket, larger than command replies
const VIDEO_DATAGRAM: usize = MAX_DATAGRAM * 2;

#[async_trait]
impl VideoCapability for UdpVideoMonitor {
    async fn open(&self, source: &str) -> Result<BoxStream<'static, VideoFrame>> {
        let addr: SocketAddr = source
            .parse()
            .with_context(|| format!("Invalid video source '{}'", source))?;
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("Failed to bind video socket {}", addr))?;
        info!("Video stream listening on {}", addr);

        let frames = stream::unfold(Arc::new(socket), |socket| async move {
            let mut buf = vec![0u8; VIDEO_DATAGRAM];
            match socket.recv_from(&mut buf).await {
                Ok((n, _)) => {
                    buf.truncate(n);
                    let frame = VideoFrame {
                        data: Bytes::from(buf),
                        received_at_ms: now_ms(),
                    };
                    Some((frame, socket))
                }
                Err(e) => {
                    warn!("Video stream ended: {}", e);
                    None
                }
            }
        });

        Ok(frames.boxed())
    }
}

/// Consume `frames` in the background until `stop` fires or the stream ends
pub fn spawn_monitor(
    mut frames: BoxStream<'static, VideoFrame>,
    stop: CancellationToken,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut count = 0u64;
        let mut bytes = 0usize;
        let mut last_frame_ms = None;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                frame = frames.next() => match frame {
                    Some(frame) => {
                        count += 1;
                        bytes += frame.data.len();
                        last_frame_ms = Some(frame.received_at_ms);
                        if count % 500 == 0 {
                            debug!("Video: {} frames, {} bytes", count, bytes);
                        }
                    }
                    None => break,
                },
            }
        }
        match last_frame_ms {
            Some(at) => info!("Video monitor stopped after {} frames, last at {} ms", count, at),
            None => info!("Video monitor stopped, no frames received"),
        }
        count
    })
}
