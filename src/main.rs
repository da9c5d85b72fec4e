mod config;
mod control;
mod discovery;
mod session;
mod swarm;
mod telemetry;
mod video;

use clap::Parser;
use config::SwarmConfig;
use control::KeyLatch;
use discovery::{Discovery, StaticDiscovery, SubnetSweep};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use swarm::SwarmCoordinator;
use tokio_util::sync::CancellationToken;
use video::UdpVideoMonitor;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Fly a swarm of text-protocol drones over UDP
#[derive(Parser, Debug)]
#[command(name = "swarm-pilot", version)]
struct Cli {
    /// Number of drones to look for on the subnet
    #[arg(long, default_value_t = 1)]
    drones: usize,

    /// Drone address; repeat for several drones. Skips discovery.
    #[arg(long = "drone")]
    drone: Vec<IpAddr>,

    /// Three-octet prefix swept during discovery
    #[arg(long, default_value = "192.168.137")]
    subnet: String,

    /// Route all drones through one local socket
    #[arg(long)]
    shared_socket: bool,

    /// Skip the post-takeoff height rendezvous
    #[arg(long)]
    no_height_sync: bool,

    /// Start the video stream before takeoff
    #[arg(long)]
    video: bool,

    /// Colour the top LED by flight phase
    #[arg(long)]
    led: bool,

    /// Poll input every 50 ms instead of 100 ms
    #[arg(long)]
    fast_poll: bool,

    #[arg(long, default_value_t = 15)]
    barrier_timeout_secs: u64,

    /// Do not listen for status pushes
    #[arg(long)]
    no_telemetry: bool,
}

impl Cli {
    fn swarm_config(&self) -> SwarmConfig {
        let mut config = SwarmConfig {
            barrier_timeout: Duration::from_secs(self.barrier_timeout_secs),
            telemetry_enabled: !self.no_telemetry,
            ..Default::default()
        };

        let session = &mut config.session;
        session.shared_transport = self.shared_socket;
        session.height_sync = !self.no_height_sync;
        session.video_enabled = self.video;
        session.led_feedback = self.led;
        if self.fast_poll {
            session.poll_interval = Duration::from_millis(50);
        }
        config
    }

    fn discovery(&self) -> anyhow::Result<(Box<dyn Discovery>, usize)> {
        if self.drone.is_empty() {
            Ok((Box::new(SubnetSweep::with_subnet(&self.subnet)?), self.drones))
        } else {
            Ok((
                Box::new(StaticDiscovery::new(self.drone.clone())),
                self.drone.len(),
            ))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let config = cli.swarm_config();

    let (discovery, limit) = cli.discovery()?;
    let addresses = discovery.discover(limit).await?;
    if addresses.is_empty() {
        warn!("No drones found");
        return Ok(());
    }
    info!("Drones: {:?}", addresses);

    let cancel = CancellationToken::new();

    // A press stays visible for two polling cycles
    let input = Arc::new(KeyLatch::new(config.session.poll_interval * 2));
    let _reader = input.clone().spawn_stdin_reader(cancel.clone());

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupted, landing every airborne drone");
                interrupt.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    let mut coordinator = SwarmCoordinator::new(config, input);
    if cli.video {
        coordinator = coordinator.with_video(Arc::new(UdpVideoMonitor));
    }

    let endpoints = addresses
        .into_iter()
        .map(|address| coordinator.endpoint(address))
        .collect();
    let report = coordinator.run(endpoints, cancel.clone()).await?;
    cancel.cancel();

    for outcome in &report.outcomes {
        match &outcome.error {
            None => info!(
                "[{}] {} (battery {:?}%, height {:?}cm)",
                outcome.endpoint, outcome.state, outcome.last_battery, outcome.last_height
            ),
            Some(e) => error!("[{}] {}: {}", outcome.endpoint, outcome.state, e),
        }
    }
    Ok(())
}
