//! Swarm height synchronizer
//!
//! An N-party rendezvous used once per flight to level the cruising altitude.
//! Participants report the height they measured, then wait. The barrier opens
//! when every expected participant has arrived, or when the first waiter's
//! timeout expires; in both cases all waiters receive the same [`Release`]
//! snapshot with `target = min(reported heights)`. A timed-out release is not
//! an error, it just carries fewer heights.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;
use swarm_shared::codec::{Command, Direction};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Participants are identified by their command address
pub type AgentId = SocketAddr;

/// Immutable aggregate handed to every released participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    /// Minimum reported height, `None` if nobody reported
    pub target: Option<i32>,
    /// Number of heights that went into `target`
    pub reported: usize,
    /// Number of participants that had arrived at release time
    pub arrived: usize,
    /// Released by the timeout rather than full arrival
    pub timed_out: bool,
    pub generation: u64,
}

#[derive(Debug)]
struct BarrierState {
    expected: usize,
    generation: u64,
    heights: HashMap<AgentId, i32>,
    arrived: HashSet<AgentId>,
    outcome: Option<Release>,
}

/// Rendezvous barrier with graceful timeout release
#[derive(Debug)]
pub struct SwarmSynchronizer {
    state: Mutex<BarrierState>,
    released: watch::Sender<Option<Release>>,
    timeout: Duration,
}

impl SwarmSynchronizer {
    /// Create a barrier for `expected` participants
    pub fn new(expected: usize, timeout: Duration) -> Self {
        let (released, _) = watch::channel(None);
        Self {
            state: Mutex::new(BarrierState {
                expected,
                generation: 0,
                heights: HashMap::new(),
                arrived: HashSet::new(),
                outcome: None,
            }),
            released,
            timeout,
        }
    }

    /// Configured upper bound on the wait
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record `agent`'s height for the current generation.
    ///
    /// Returns `false` if the agent already reported or the generation has
    /// already been released.
    pub fn report_height(&self, agent: AgentId, height: i32) -> bool {
        let mut state = self.state.lock();
        if state.outcome.is_some() || state.heights.contains_key(&agent) {
            return false;
        }
        state.heights.insert(agent, height);
        true
    }

    /// Arrive at the barrier and wait for release, at most `wait`.
    pub async fn await_release(&self, agent: AgentId, wait: Duration) -> Release {
        let mut rx = self.released.subscribe();

        let generation = {
            let mut state = self.state.lock();
            if let Some(release) = &state.outcome {
                return release.clone();
            }
            state.arrived.insert(agent);
            if state.arrived.len() >= state.expected {
                return self.release(&mut state, false);
            }
            debug!(
                "Waiting at barrier: {}/{} arrived",
                state.arrived.len(),
                state.expected
            );
            state.generation
        };

        let released = match timeout(
            wait,
            rx.wait_for(|r| matches!(r, Some(r) if r.generation >= generation)),
        )
        .await
        {
            Ok(Ok(release)) => (*release).clone(),
            _ => None,
        };

        if let Some(release) = released {
            return release;
        }

        let mut state = self.state.lock();
        if state.generation != generation {
            return Release {
                target: None,
                reported: 0,
                arrived: 0,
                timed_out: true,
                generation,
            };
        }
        // Someone else released between our timeout and taking the lock
        if let Some(release) = &state.outcome {
            return release.clone();
        }
        self.release(&mut state, true)
    }

    /// Count `agent` as arrived without a height and without waiting.
    ///
    /// Used by sessions that end before reaching the barrier so the rest of
    /// the swarm is not held until the timeout.
    pub fn withdraw(&self, agent: AgentId) {
        let mut state = self.state.lock();
        if state.outcome.is_some() || !state.arrived.insert(agent) {
            return;
        }
        debug!("{} withdrew from barrier", agent);
        if state.arrived.len() >= state.expected {
            self.release(&mut state, false);
        }
    }

    /// Start a new generation for `expected` participants, forgetting all
    /// heights and arrivals
    pub fn reset(&self, expected: usize) {
        let mut state = self.state.lock();
        state.expected = expected;
        state.generation += 1;
        state.heights.clear();
        state.arrived.clear();
        state.outcome = None;
    }

    fn release(&self, state: &mut BarrierState, timed_out: bool) -> Release {
        let release = Release {
            target: state.heights.values().min().copied(),
            reported: state.heights.len(),
            arrived: state.arrived.len(),
            timed_out,
            generation: state.generation,
        };

        if timed_out {
            warn!(
                "Barrier timed out with {}/{} arrived, {} heights",
                release.arrived, state.expected, release.reported
            );
        } else {
            info!(
                "Barrier released: {} arrived, target {:?}",
                release.arrived, release.target
            );
        }

        state.outcome = Some(release.clone());
        self.released.send_replace(Some(release.clone()));
        release
    }
}

/// Correction that brings `current` to `target`, if the gap exceeds `tolerance`.
///
/// The boundary is exclusive: a gap of exactly `tolerance` is left alone.
/// The gap is computed in `i64`, so any pair of `i32` heights is valid.
pub fn height_correction(current: i32, target: i32, tolerance: i32) -> Option<Command> {
    let diff = i64::from(target) - i64::from(current);
    if diff.abs() <= i64::from(tolerance) {
        return None;
    }
    let direction = if diff > 0 { Direction::Up } else { Direction::Down };
    let distance = u32::try_from(diff.unsigned_abs()).unwrap_or(u32::MAX);
    Some(Command::Move(direction, distance))
}
