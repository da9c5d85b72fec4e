//! Session and swarm configuration
//!
//! Every knob carries the vendor default; the CLI in `main` only overrides.

use crate::control::{ControlLoop, KeyMap};
use std::time::Duration;
use swarm_shared::defaults;

/// Configuration for a single drone session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Route every session through one socket bound to `SwarmConfig::local_port`
    pub shared_transport: bool,
    /// Take part in the post-takeoff height rendezvous
    pub height_sync: bool,
    /// Start the video stream before takeoff
    pub video_enabled: bool,
    /// Colour the top LED by flight phase (vendor extension)
    pub led_feedback: bool,
    /// Battery percentage required for takeoff
    pub min_battery: u32,
    /// Battery percentage required for a flip, `None` to always allow
    pub flip_min_battery: Option<u32>,
    /// Height difference tolerated without correction (cm, exclusive)
    pub altitude_tolerance_cm: i32,
    pub move_distance_cm: u32,
    pub turn_angle_deg: u32,
    /// Climb issued right after takeoff
    pub initial_climb_cm: Option<u32>,
    /// Reply timeout for a single attempt
    pub command_timeout: Duration,
    pub command_retries: u32,
    pub retry_delay: Duration,
    pub takeoff_retries: u32,
    pub takeoff_retry_delay: Duration,
    pub battery_retries: u32,
    pub height_retries: u32,
    /// Input polling interval of the control loop
    pub poll_interval: Duration,
    /// Input bindings in priority order
    pub key_map: KeyMap,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shared_transport: false,
            height_sync: true,
            video_enabled: false,
            led_feedback: false,
            min_battery: defaults::MIN_BATTERY_PERCENT,
            flip_min_battery: Some(defaults::FLIP_MIN_BATTERY_PERCENT),
            altitude_tolerance_cm: defaults::ALTITUDE_TOLERANCE_CM,
            move_distance_cm: defaults::MOVE_DISTANCE_CM,
            turn_angle_deg: defaults::TURN_ANGLE_DEG,
            initial_climb_cm: Some(defaults::MOVE_DISTANCE_CM),
            command_timeout: Duration::from_millis(defaults::COMMAND_TIMEOUT_MS),
            command_retries: defaults::COMMAND_RETRIES,
            retry_delay: Duration::from_millis(defaults::RETRY_DELAY_MS),
            takeoff_retries: defaults::TAKEOFF_RETRIES,
            takeoff_retry_delay: Duration::from_millis(defaults::TAKEOFF_RETRY_DELAY_MS),
            battery_retries: defaults::COMMAND_RETRIES,
            height_retries: defaults::COMMAND_RETRIES,
            poll_interval: Duration::from_millis(100),
            key_map: KeyMap::default(),
        }
    }
}

impl SessionConfig {
    /// Control loop built from the polling interval and key map
    pub fn control_loop(&self) -> ControlLoop {
        ControlLoop::new(self.key_map.clone(), self.poll_interval)
    }
}

/// Configuration for one swarm flight
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub command_port: u16,
    pub telemetry_port: u16,
    /// Local bind port for the shared command socket
    pub local_port: u16,
    /// Upper bound on the height rendezvous
    pub barrier_timeout: Duration,
    /// Delay between consecutive session starts
    pub launch_stagger: Duration,
    /// Run the background status listener
    pub telemetry_enabled: bool,
    /// Source identifier handed to the video capability
    pub video_source: String,
    pub session: SessionConfig,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            command_port: defaults::COMMAND_PORT,
            telemetry_port: defaults::TELEMETRY_PORT,
            local_port: defaults::LOCAL_PORT,
            barrier_timeout: Duration::from_millis(defaults::BARRIER_TIMEOUT_MS),
            launch_stagger: Duration::from_millis(300),
            telemetry_enabled: true,
            video_source: format!("0.0.0.0:{}", defaults::VIDEO_PORT),
            session: SessionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.min_battery, 40);
        assert_eq!(config.altitude_tolerance_cm, 10);
        assert_eq!(config.takeoff_retries, 5);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert!(!config.shared_transport);
        assert!(config.height_sync);
    }

    #[test]
    fn test_swarm_defaults() {
        let config = SwarmConfig::default();
        assert_eq!(config.command_port, 8889);
        assert_eq!(config.telemetry_port, 8890);
        assert_eq!(config.local_port, 9000);
        assert_eq!(config.barrier_timeout, Duration::from_secs(15));
    }
}
