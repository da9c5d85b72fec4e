//! Swarm coordinator
//!
//! Builds the per-flight context, starts one worker per drone and joins them
//! all. Workers never take the coordinator down: a failed setup or a panic is
//! reported as an aborted outcome for that drone only, and a panicking
//! session still gets a best-effort landing on its own channel.

use super::SwarmSynchronizer;
use crate::config::SwarmConfig;
use crate::control::InputSource;
use crate::session::{land_best_effort, DroneSession, FlightContext, SessionOutcome};
use crate::telemetry::TelemetryListener;
use crate::video::VideoCapability;
use anyhow::{Context, Result};
use futures::FutureExt;
use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use swarm_shared::{AgentEndpoint, CommandChannel, CommandSender, DatagramTransport, UdpTransport};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

/// Outcomes of every session of one flight, in launch order
#[derive(Debug, Clone, Default)]
pub struct SwarmReport {
    pub outcomes: Vec<SessionOutcome>,
}

impl SwarmReport {
    pub fn landed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.landed()).count()
    }

    pub fn aborted(&self) -> usize {
        self.outcomes.len() - self.landed()
    }
}

/// One socket and exchange lock used by every session in shared mode
#[derive(Clone)]
struct SharedTransport {
    transport: Arc<dyn DatagramTransport>,
    lock: Arc<Mutex<()>>,
}

pub struct SwarmCoordinator {
    config: SwarmConfig,
    input: Arc<dyn InputSource>,
    video: Option<Arc<dyn VideoCapability>>,
    /// One barrier for the coordinator's lifetime, a new generation per flight
    sync: Arc<SwarmSynchronizer>,
}

impl SwarmCoordinator {
    pub fn new(config: SwarmConfig, input: Arc<dyn InputSource>) -> Self {
        let sync = Arc::new(SwarmSynchronizer::new(0, config.barrier_timeout));
        Self {
            config,
            input,
            video: None,
            sync,
        }
    }

    pub fn with_video(mut self, video: Arc<dyn VideoCapability>) -> Self {
        self.video = Some(video);
        self
    }

    /// Endpoint for a discovered address on the configured ports
    pub fn endpoint(&self, address: std::net::IpAddr) -> AgentEndpoint {
        AgentEndpoint {
            address,
            command_port: self.config.command_port,
            telemetry_port: self.config.telemetry_port,
        }
    }

    /// Fly one session per endpoint until all of them have finished.
    ///
    /// `cancel` lands every airborne drone and ends the flight.
    pub async fn run(
        &mut self,
        endpoints: Vec<AgentEndpoint>,
        cancel: CancellationToken,
    ) -> Result<SwarmReport> {
        if endpoints.is_empty() {
            warn!("No drones to fly");
            return Ok(SwarmReport::default());
        }

        let session_config = &self.config.session;
        let sync = session_config.height_sync.then(|| {
            self.sync.reset(endpoints.len());
            self.sync.clone()
        });

        let shared = if session_config.shared_transport {
            let addr = SocketAddr::from(([0, 0, 0, 0], self.config.local_port));
            let transport = UdpTransport::bind(addr)
                .await
                .with_context(|| format!("Failed to bind shared command socket {}", addr))?;
            info!("Shared command socket on {}", addr);
            Some(SharedTransport {
                transport: Arc::new(transport),
                lock: Arc::new(Mutex::new(())),
            })
        } else {
            None
        };

        let telemetry_stop = cancel.child_token();
        let telemetry = self.start_telemetry(telemetry_stop.clone()).await;

        let ctx = FlightContext {
            sync: sync.clone(),
            input: self.input.clone(),
            video: self.video.clone(),
            video_source: self.config.video_source.clone(),
            cancel: cancel.clone(),
        };

        info!("Launching {} sessions", endpoints.len());
        let workers: Vec<(AgentEndpoint, JoinHandle<SessionOutcome>)> = endpoints
            .into_iter()
            .enumerate()
            .map(|(idx, endpoint)| {
                let handle = self.spawn_session(idx, endpoint, shared.clone(), ctx.clone());
                (endpoint, handle)
            })
            .collect();

        let mut report = SwarmReport::default();
        for (endpoint, handle) in workers {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Worker for {} failed: {}", endpoint, e);
                    if let Some(sync) = &sync {
                        sync.withdraw(endpoint.command_addr());
                    }
                    SessionOutcome::lost(endpoint, format!("Worker failed: {}", e))
                }
            };
            report.outcomes.push(outcome);
        }

        telemetry_stop.cancel();
        if let Some(handle) = telemetry {
            if let Err(e) = handle.await {
                warn!("Telemetry listener failed: {}", e);
            }
        }

        info!(
            "Flight finished: {} landed, {} aborted",
            report.landed(),
            report.aborted()
        );
        Ok(report)
    }

    async fn start_telemetry(&self, stop: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.config.telemetry_enabled {
            return None;
        }
        match TelemetryListener::bind(self.config.telemetry_port).await {
            Ok(listener) => Some(listener.spawn_logger(stop)),
            Err(e) => {
                warn!("Telemetry disabled: {:#}", e);
                None
            }
        }
    }

    fn spawn_session(
        &self,
        idx: usize,
        endpoint: AgentEndpoint,
        shared: Option<SharedTransport>,
        ctx: FlightContext,
    ) -> JoinHandle<SessionOutcome> {
        let config = self.config.session.clone();
        let stagger = self.config.launch_stagger * idx as u32;
        let span = info_span!("session", agent = %endpoint.address);

        tokio::spawn(
            async move {
                let cancel = ctx.cancel.clone();
                let sync = ctx.sync.clone();
                let withdraw = || {
                    if let Some(sync) = &sync {
                        sync.withdraw(endpoint.command_addr());
                    }
                };

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        withdraw();
                        return SessionOutcome::lost(endpoint, "Cancelled before launch");
                    }
                    _ = sleep(stagger) => {}
                }

                let channel = match shared {
                    Some(shared) => CommandChannel::shared(
                        shared.transport,
                        endpoint.command_addr(),
                        shared.lock,
                    ),
                    None => match UdpTransport::bind_ephemeral().await {
                        Ok(transport) => {
                            CommandChannel::new(Arc::new(transport), endpoint.command_addr())
                        }
                        Err(e) => {
                            error!("Failed to bind command socket: {}", e);
                            withdraw();
                            return SessionOutcome::lost(endpoint, e.to_string());
                        }
                    },
                };

                let channel: Arc<dyn CommandSender> = Arc::new(channel);
                let session = DroneSession::new(endpoint, channel.clone(), config.clone(), ctx);
                match AssertUnwindSafe(session.run()).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        let reason = panic_reason(panic.as_ref());
                        error!("Session panicked: {}", reason);
                        withdraw();
                        land_best_effort(channel.as_ref(), &config).await;
                        SessionOutcome::lost(endpoint, format!("Session panicked: {}", reason))
                    }
                }
            }
            .instrument(span),
        )
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
