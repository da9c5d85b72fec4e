//! Fixed-interval polling loop mapping input to flight actions
//!
//! Each cycle samples the input source, picks the first active binding in
//! priority order and applies at most that one action. Everything else active
//! in the same cycle is ignored. A discrete press is applied once per loop
//! even if it is still active on later cycles. `Land` ends the loop.

use super::input::{InputSource, Key};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use swarm_shared::codec::Direction;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What one control cycle asks the vehicle to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Move(Direction),
    RotateCw,
    RotateCcw,
    Flip,
    /// Scripted triangle
    Scenario,
    BatteryReport,
    Land,
}

impl Action {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Land)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub key: Key,
    pub action: Action,
}

/// Key bindings in priority order, first active binding wins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMap {
    bindings: Vec<Binding>,
}

impl KeyMap {
    pub fn new(bindings: Vec<(Key, Action)>) -> Self {
        Self {
            bindings: bindings
                .into_iter()
                .map(|(key, action)| Binding { key, action })
                .collect(),
        }
    }

    /// First active binding whose press has not been consumed yet
    fn resolve(&self, input: &dyn InputSource, consumed: &Consumed) -> Option<(Binding, Option<u64>)> {
        self.bindings.iter().find_map(|binding| {
            if !input.is_active(binding.key) {
                return None;
            }
            let press = input.press_id(binding.key);
            match press {
                Some(id) if consumed.0.get(&binding.key) == Some(&id) => None,
                _ => Some((*binding, press)),
            }
        })
    }
}

impl Default for KeyMap {
    /// Movement, then rotation, then flip, then the extras, land last
    fn default() -> Self {
        Self::new(vec![
            (Key::Char('w'), Action::Move(Direction::Forward)),
            (Key::Char('s'), Action::Move(Direction::Back)),
            (Key::Char('a'), Action::Move(Direction::Left)),
            (Key::Char('d'), Action::Move(Direction::Right)),
            (Key::Up, Action::Move(Direction::Up)),
            (Key::Down, Action::Move(Direction::Down)),
            (Key::Char('q'), Action::RotateCcw),
            (Key::Char('e'), Action::RotateCw),
            (Key::Space, Action::Flip),
            (Key::Char('p'), Action::Scenario),
            (Key::Char('b'), Action::BatteryReport),
            (Key::Char('l'), Action::Land),
        ])
    }
}

/// Carries out actions chosen by the control loop
#[async_trait]
pub trait ActionExecutor: Send {
    type Error: Send;

    async fn execute(&mut self, action: Action) -> Result<(), Self::Error>;
}

/// Why the control loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Landed,
    Cancelled,
}

/// Press ids one control loop has already acted on, per key
#[derive(Debug, Default)]
pub struct Consumed(HashMap<Key, u64>);

#[derive(Debug, Clone)]
pub struct ControlLoop {
    key_map: KeyMap,
    poll_interval: Duration,
}

impl ControlLoop {
    pub fn new(key_map: KeyMap, poll_interval: Duration) -> Self {
        Self {
            key_map,
            poll_interval,
        }
    }

    /// Action for this cycle, marking the press behind it as consumed
    pub fn next_action(&self, input: &dyn InputSource, consumed: &mut Consumed) -> Option<Action> {
        let (binding, press) = self.key_map.resolve(input, consumed)?;
        if let Some(id) = press {
            consumed.0.insert(binding.key, id);
        }
        Some(binding.action)
    }

    /// Poll until a land action has been executed or `cancel` fires.
    ///
    /// Executor errors end the loop and are returned unchanged.
    pub async fn run<X>(
        &self,
        input: &dyn InputSource,
        cancel: &CancellationToken,
        executor: &mut X,
    ) -> Result<LoopExit, X::Error>
    where
        X: ActionExecutor + ?Sized,
    {
        let mut consumed = Consumed::default();

        loop {
            if cancel.is_cancelled() {
                return Ok(LoopExit::Cancelled);
            }

            if let Some(action) = self.next_action(input, &mut consumed) {
                debug!("Input -> {:?}", action);
                executor.execute(action).await?;
                if action.is_terminal() {
                    return Ok(LoopExit::Landed);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(LoopExit::Cancelled),
                _ = sleep(self.poll_interval) => {}
            }
        }
    }
}
