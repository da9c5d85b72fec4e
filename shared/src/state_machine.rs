//! Drone Session State Machine
//!
//! Defines the forward-only lifecycle of one agent's control session:
//!
//! ```text
//! Idle -> SdkEnabled -> BatteryOk -> Airborne -> [HeightSynced] -> Controlled -> Landed
//!   \__________\____________\___________\______________\______________\______-> Aborted
//! ```
//!
//! Landing and abort are reachable from any non-terminal state. Nothing leaves
//! `Landed` or `Aborted`.

use std::fmt;

/// Lifecycle states of a drone session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    SdkEnabled,
    BatteryOk,
    Airborne,
    HeightSynced,
    Controlled,
    Landed,
    Aborted,
}

impl SessionState {
    /// `Landed` and `Aborted` are final
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Landed | SessionState::Aborted)
    }

    /// States in which the vehicle may be in the air
    pub fn is_airborne(&self) -> bool {
        matches!(
            self,
            SessionState::Airborne | SessionState::HeightSynced | SessionState::Controlled
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// `command` acknowledged with `ok`
    SdkAcknowledged,
    /// Battery reading at or above the threshold
    BatteryPassed,
    /// `takeoff` acknowledged with `ok`
    TakeoffAcknowledged,
    /// Barrier released and correction (if any) applied
    HeightSynced,
    /// Interactive loop entered
    ControlStarted,
    /// `land` issued after a land request
    LandAcknowledged,
    /// Unrecoverable failure or external cancellation
    Abort { reason: String },
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// Transition was valid and state changed
    Success(SessionState),
    /// Transition was invalid from current state
    Invalid { from: SessionState, event: SessionEvent },
    /// Session aborted; `was_airborne` tells the caller a landing is owed
    Aborted { from: SessionState, reason: String, was_airborne: bool },
}

/// Per-session state machine plus the last readings taken by that session
#[derive(Debug)]
pub struct SessionStateMachine {
    current_state: SessionState,
    last_height_cm: Option<i32>,
    last_battery_percent: Option<u32>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    /// Create a new state machine in Idle state
    pub fn new() -> Self {
        Self {
            current_state: SessionState::Idle,
            last_height_cm: None,
            last_battery_percent: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.current_state
    }

    pub fn update_battery(&mut self, percent: u32) {
        self.last_battery_percent = Some(percent);
    }

    pub fn update_height(&mut self, cm: i32) {
        self.last_height_cm = Some(cm);
    }

    pub fn last_battery(&self) -> Option<u32> {
        self.last_battery_percent
    }

    pub fn last_height(&self) -> Option<i32> {
        self.last_height_cm
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: SessionEvent) -> TransitionResult {
        let from = self.current_state;

        if from.is_terminal() {
            return TransitionResult::Invalid { from, event };
        }

        if let SessionEvent::Abort { reason } = event {
            self.current_state = SessionState::Aborted;
            return TransitionResult::Aborted {
                from,
                reason,
                was_airborne: from.is_airborne(),
            };
        }

        match self.get_next_state(&event) {
            Some(state) => {
                self.current_state = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid { from, event },
        }
    }

    /// Get the next state for a given event, if the transition is valid
    fn get_next_state(&self, event: &SessionEvent) -> Option<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        match (self.current_state, event) {
            (S::Idle, E::SdkAcknowledged) => Some(S::SdkEnabled),
            (S::SdkEnabled, E::BatteryPassed) => Some(S::BatteryOk),
            (S::BatteryOk, E::TakeoffAcknowledged) => Some(S::Airborne),
            (S::Airborne, E::HeightSynced) => Some(S::HeightSynced),

            // Height sync is optional
            (S::Airborne | S::HeightSynced, E::ControlStarted) => Some(S::Controlled),

            (state, E::LandAcknowledged) if !state.is_terminal() => Some(S::Landed),

            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn airborne_fsm() -> SessionStateMachine {
        let mut fsm = SessionStateMachine::new();
        fsm.process_event(SessionEvent::SdkAcknowledged);
        fsm.process_event(SessionEvent::BatteryPassed);
        fsm.process_event(SessionEvent::TakeoffAcknowledged);
        fsm
    }

    #[test]
    fn test_initial_state() {
        let fsm = SessionStateMachine::new();
        assert_eq!(fsm.state(), SessionState::Idle);
        assert_eq!(fsm.last_battery(), None);
    }

    #[test]
    fn test_full_flight_with_sync() {
        let mut fsm = airborne_fsm();
        assert_eq!(fsm.state(), SessionState::Airborne);

        let result = fsm.process_event(SessionEvent::HeightSynced);
        assert!(matches!(result, TransitionResult::Success(SessionState::HeightSynced)));

        let result = fsm.process_event(SessionEvent::ControlStarted);
        assert!(matches!(result, TransitionResult::Success(SessionState::Controlled)));

        let result = fsm.process_event(SessionEvent::LandAcknowledged);
        assert!(matches!(result, TransitionResult::Success(SessionState::Landed)));
    }

    #[test]
    fn test_sync_is_optional() {
        let mut fsm = airborne_fsm();
        let result = fsm.process_event(SessionEvent::ControlStarted);
        assert!(matches!(result, TransitionResult::Success(SessionState::Controlled)));
    }

    #[test]
    fn test_cannot_skip_battery_gate() {
        let mut fsm = SessionStateMachine::new();
        fsm.process_event(SessionEvent::SdkAcknowledged);

        let result = fsm.process_event(SessionEvent::TakeoffAcknowledged);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), SessionState::SdkEnabled);
    }

    #[test]
    fn test_no_backward_transition() {
        let mut fsm = airborne_fsm();
        fsm.process_event(SessionEvent::ControlStarted);

        let result = fsm.process_event(SessionEvent::HeightSynced);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), SessionState::Controlled);
    }

    #[test]
    fn test_abort_reports_airborne() {
        let mut fsm = SessionStateMachine::new();
        let result = fsm.process_event(SessionEvent::Abort { reason: "sdk".into() });
        assert!(matches!(
            result,
            TransitionResult::Aborted { was_airborne: false, .. }
        ));

        let mut fsm = airborne_fsm();
        let result = fsm.process_event(SessionEvent::Abort { reason: "cancel".into() });
        assert!(matches!(
            result,
            TransitionResult::Aborted { was_airborne: true, from: SessionState::Airborne, .. }
        ));
        assert_eq!(fsm.state(), SessionState::Aborted);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut fsm = airborne_fsm();
        fsm.process_event(SessionEvent::LandAcknowledged);

        let result = fsm.process_event(SessionEvent::Abort { reason: "late".into() });
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), SessionState::Landed);
    }
}
