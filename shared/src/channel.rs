//! Command channel - send one command and await the matching reply
//!
//! The channel owns no retry logic. It transmits a single datagram and waits
//! until `timeout` for a datagram whose source equals the vehicle's command
//! address. Anything else that arrives in the meantime is cross-talk and is
//! dropped; the deadline is fixed when the command is sent and never extended.

use crate::codec::decode_reply;
use crate::defaults::MAX_DATAGRAM;
use crate::transport::DatagramTransport;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

/// Outcome of one command attempt. Every attempt yields one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// A reply from the vehicle, decoded and trimmed
    Ok(String),
    /// A reply arrived but could not be decoded
    Failed(String),
    /// No matching reply before the deadline
    TimedOut,
}

impl CommandResult {
    /// The reply text, if one was decoded
    pub fn reply(&self) -> Option<&str> {
        match self {
            CommandResult::Ok(text) => Some(text),
            _ => None,
        }
    }
}

/// Socket-level failures. These are surfaced, never retried here.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),
}

/// Anything that can deliver a command and report one result
#[async_trait]
pub trait CommandSender: Send + Sync {
    /// Send `text` and wait up to `timeout` for the reply
    async fn send(&self, text: &str, timeout: Duration) -> Result<CommandResult, ChannelError>;

    /// Address of the vehicle on the other end
    fn peer(&self) -> SocketAddr;
}

/// Send-and-await-one-reply primitive bound to one vehicle
pub struct CommandChannel {
    transport: Arc<dyn DatagramTransport>,
    endpoint: SocketAddr,
    /// Held across send and wait when the transport is shared between vehicles
    exchange_lock: Option<Arc<Mutex<()>>>,
}

impl CommandChannel {
    /// Channel over a transport owned by this vehicle alone
    pub fn new(transport: Arc<dyn DatagramTransport>, endpoint: SocketAddr) -> Self {
        Self {
            transport,
            endpoint,
            exchange_lock: None,
        }
    }

    /// Channel over a transport shared with other vehicles.
    ///
    /// All channels on the same transport must be given the same lock.
    pub fn shared(
        transport: Arc<dyn DatagramTransport>,
        endpoint: SocketAddr,
        exchange_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            transport,
            endpoint,
            exchange_lock: Some(exchange_lock),
        }
    }

    /// Whether exchanges on this channel are serialized with other vehicles
    pub fn is_shared(&self) -> bool {
        self.exchange_lock.is_some()
    }

    /// Send `payload` unchanged and return the matching reply datagram
    /// untouched, or `None` once the deadline passes.
    ///
    /// Honors the exchange lock like [`CommandSender::send`].
    pub async fn send_raw(
        &self,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, ChannelError> {
        match &self.exchange_lock {
            Some(lock) => {
                let _guard = lock.lock().await;
                self.exchange(payload, timeout).await
            }
            None => self.exchange(payload, timeout).await,
        }
    }

    async fn exchange(
        &self,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, ChannelError> {
        self.transport.send_to(payload, self.endpoint).await?;
        let deadline = Instant::now() + timeout;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, src) = match timeout_at(deadline, self.transport.recv_from(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => return Ok(None),
            };

            if src != self.endpoint {
                debug!(
                    "Discarding {} byte datagram from {} while waiting on {}",
                    n, src, self.endpoint
                );
                continue;
            }

            buf.truncate(n);
            return Ok(Some(buf));
        }
    }
}

#[async_trait]
impl CommandSender for CommandChannel {
    async fn send(&self, text: &str, timeout: Duration) -> Result<CommandResult, ChannelError> {
        let result = match self.send_raw(text.as_bytes(), timeout).await? {
            None => CommandResult::TimedOut,
            Some(reply) => match decode_reply(&reply) {
                Ok(reply) => CommandResult::Ok(reply),
                Err(e) => CommandResult::Failed(e.to_string()),
            },
        };
        Ok(result)
    }

    fn peer(&self) -> SocketAddr {
        self.endpoint
    }
}
