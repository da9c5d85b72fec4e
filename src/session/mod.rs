//! Per-drone control sessions
//!
//! A session owns one command channel and walks the drone through the
//! lifecycle in [`swarm_shared::state_machine`], from SDK mode to landing.
//! Sessions never share mutable state with each other; the only meeting
//! point is the height synchronizer handed in through [`FlightContext`].

mod drone;
mod retry;

pub use drone::{land_best_effort, DroneSession};

use crate::control::InputSource;
use crate::swarm::SwarmSynchronizer;
use crate::video::VideoCapability;
use std::sync::Arc;
use swarm_shared::channel::ChannelError;
use swarm_shared::{AgentEndpoint, SessionState};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Reasons a session ends in `Aborted`
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] ChannelError),

    #[error("Session cancelled")]
    Cancelled,

    #[error("SDK mode not acknowledged")]
    SdkRefused,

    #[error("Battery {level}% below minimum {min}%")]
    BatteryLow { level: u32, min: u32 },

    #[error("Battery level unreadable")]
    BatteryUnreadable,

    #[error("Takeoff not acknowledged")]
    TakeoffFailed,
}

/// Everything a session gets from the flight it belongs to
#[derive(Clone)]
pub struct FlightContext {
    /// Height rendezvous, `None` when height sync is off
    pub sync: Option<Arc<SwarmSynchronizer>>,
    pub input: Arc<dyn InputSource>,
    pub video: Option<Arc<dyn VideoCapability>>,
    pub video_source: String,
    pub cancel: CancellationToken,
}

/// What is left of a session once it has finished
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub endpoint: AgentEndpoint,
    pub state: SessionState,
    pub last_height: Option<i32>,
    pub last_battery: Option<u32>,
    pub error: Option<String>,
}

impl SessionOutcome {
    /// Outcome for a worker that died without reporting
    pub fn lost(endpoint: AgentEndpoint, error: impl Into<String>) -> Self {
        Self {
            endpoint,
            state: SessionState::Aborted,
            last_height: None,
            last_battery: None,
            error: Some(error.into()),
        }
    }

    pub fn landed(&self) -> bool {
        self.state == SessionState::Landed
    }
}
