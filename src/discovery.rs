//! Drone discovery
//!
//! Produces the set of reachable drone addresses a flight starts with.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use swarm_shared::{defaults, CommandChannel, CommandResult, CommandSender, UdpTransport};
use tracing::{debug, info};

#[async_trait]
pub trait Discovery: Send + Sync {
    /// At most `limit` reachable addresses, in address order
    async fn discover(&self, limit: usize) -> Result<Vec<IpAddr>>;
}

/// Fixed list, e.g. from the command line
#[derive(Debug, Clone)]
pub struct StaticDiscovery {
    addresses: Vec<IpAddr>,
}

impl StaticDiscovery {
    pub fn new(addresses: Vec<IpAddr>) -> Self {
        Self { addresses }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover(&self, limit: usize) -> Result<Vec<IpAddr>> {
        Ok(self.addresses.iter().copied().take(limit).collect())
    }
}

/// Probe every host of a /24 with an SDK `command` and keep those that answer
#[derive(Debug, Clone)]
pub struct SubnetSweep {
    pub subnet: [u8; 3],
    pub hosts: RangeInclusive<u8>,
    pub port: u16,
    pub window: Duration,
    pub parallelism: usize,
}

impl Default for SubnetSweep {
    fn default() -> Self {
        Self {
            subnet: [192, 168, 137],
            hosts: 2..=254,
            port: defaults::COMMAND_PORT,
            window: Duration::from_millis(500),
            parallelism: 64,
        }
    }
}

impl SubnetSweep {
    /// Parse a dotted three-octet prefix such as `192.168.137`
    pub fn with_subnet(prefix: &str) -> Result<Self> {
        let octets = prefix
            .trim_end_matches('.')
            .split('.')
            .map(|octet| octet.parse::<u8>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Invalid subnet '{}'", prefix))?;

        let subnet: [u8; 3] = octets
            .try_into()
            .map_err(|_| anyhow::anyhow!("Subnet '{}' must have three octets", prefix))?;

        Ok(Self {
            subnet,
            ..Default::default()
        })
    }

    fn address(&self, host: u8) -> IpAddr {
        let [a, b, c] = self.subnet;
        IpAddr::V4(Ipv4Addr::new(a, b, c, host))
    }

    async fn probe(&self, address: IpAddr) -> bool {
        let transport = match UdpTransport::bind_ephemeral().await {
            Ok(transport) => transport,
            Err(e) => {
                debug!("Probe socket for {} failed: {}", address, e);
                return false;
            }
        };
        let channel = CommandChannel::new(Arc::new(transport), SocketAddr::new(address, self.port));

        match channel.send("command", self.window).await {
            Ok(CommandResult::Ok(reply)) => {
                debug!("{} answered '{}'", address, reply);
                true
            }
            Ok(_) => false,
            Err(e) => {
                debug!("{} unreachable: {}", address, e);
                false
            }
        }
    }
}

#[async_trait]
impl Discovery for SubnetSweep {
    async fn discover(&self, limit: usize) -> Result<Vec<IpAddr>> {
        let [a, b, c] = self.subnet;
        info!("Sweeping {}.{}.{}.{:?}", a, b, c, self.hosts);

        let mut found: Vec<IpAddr> = stream::iter(self.hosts.clone())
            .map(|host| {
                let address = self.address(host);
                async move { self.probe(address).await.then_some(address) }
            })
            .buffer_unordered(self.parallelism.max(1))
            .filter_map(|address| async move { address })
            .collect()
            .await;

        found.sort();
        found.truncate(limit);
        info!("Found {} drones: {:?}", found.len(), found);
        Ok(found)
    }
}
