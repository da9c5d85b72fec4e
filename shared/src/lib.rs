//! Swarm Shared Protocol Types
//!
//! This crate provides the command vocabulary, reply codec, session state
//! machine and the command channel used by the swarm pilot and the command
//! proxy to talk to text-protocol drones over UDP.

pub mod channel;
pub mod codec;
pub mod state_machine;
pub mod transport;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

pub use channel::{ChannelError, CommandChannel, CommandResult, CommandSender};
pub use codec::{Command, Direction, ProtocolError};
pub use state_machine::{SessionEvent, SessionState, SessionStateMachine, TransitionResult};
pub use transport::{DatagramTransport, UdpTransport};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Protocol defaults for the vendor SDK
pub mod defaults {
    /// UDP port the vehicle listens on for commands
    pub const COMMAND_PORT: u16 = 8889;

    /// UDP port the vehicle pushes its status string to
    pub const TELEMETRY_PORT: u16 = 8890;

    /// UDP port the vehicle streams raw video to
    pub const VIDEO_PORT: u16 = 11111;

    /// Local port for the shared command socket
    pub const LOCAL_PORT: u16 = 9000;

    /// Per-attempt reply timeout in milliseconds
    pub const COMMAND_TIMEOUT_MS: u64 = 5000;

    /// Default number of attempts for a command
    pub const COMMAND_RETRIES: u32 = 3;

    /// Default pause between failed attempts in milliseconds
    pub const RETRY_DELAY_MS: u64 = 1000;

    /// Attempts allowed for takeoff
    pub const TAKEOFF_RETRIES: u32 = 5;

    /// Pause between failed takeoff attempts in milliseconds
    pub const TAKEOFF_RETRY_DELAY_MS: u64 = 2000;

    /// Minimum battery percentage required for takeoff
    pub const MIN_BATTERY_PERCENT: u32 = 40;

    /// Minimum battery percentage required for a flip
    pub const FLIP_MIN_BATTERY_PERCENT: u32 = 60;

    /// Height difference tolerated without correction, in cm
    pub const ALTITUDE_TOLERANCE_CM: i32 = 10;

    /// Step size for a single move, in cm
    pub const MOVE_DISTANCE_CM: u32 = 50;

    /// Step size for a single rotation, in degrees
    pub const TURN_ANGLE_DEG: u32 = 60;

    /// How long the swarm waits at the height barrier, in milliseconds
    pub const BARRIER_TIMEOUT_MS: u64 = 15000;

    /// Largest datagram we expect from the vehicle
    pub const MAX_DATAGRAM: usize = 2048;
}

/// Identifies one vehicle. Immutable after discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgentEndpoint {
    pub address: IpAddr,
    pub command_port: u16,
    pub telemetry_port: u16,
}

impl AgentEndpoint {
    /// Endpoint on the vendor default ports
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            command_port: defaults::COMMAND_PORT,
            telemetry_port: defaults::TELEMETRY_PORT,
        }
    }

    /// Address command datagrams are sent to and replies are expected from
    pub fn command_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.command_port)
    }
}

impl fmt::Display for AgentEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}
