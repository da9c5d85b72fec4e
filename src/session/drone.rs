//! Drone session: one worker driving one vehicle through its lifecycle

use super::retry::RetryPolicy;
use super::{FlightContext, SessionError, SessionOutcome};
use crate::config::SessionConfig;
use crate::control::{Action, ActionExecutor, ControlLoop, LoopExit};
use crate::swarm::{height_correction, SwarmSynchronizer};
use crate::video;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use swarm_shared::channel::{ChannelError, CommandSender};
use swarm_shared::codec::{self, Command, Direction};
use swarm_shared::state_machine::{SessionEvent, SessionStateMachine, TransitionResult};
use swarm_shared::AgentEndpoint;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a battery report so a held key does not flood the link
const BATTERY_REPORT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Heading change of one leg of the scripted triangle
const SCENARIO_TURN_DEG: u32 = 120;
const SCENARIO_LEGS: usize = 3;

const LED_RED: Command = Command::Led { r: 255, g: 0, b: 0 };
const LED_GREEN: Command = Command::Led { r: 0, g: 255, b: 0 };

struct VideoTask {
    stop: CancellationToken,
    handle: JoinHandle<u64>,
}

/// Race a channel operation against cancellation
async fn guarded<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, ChannelError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        result = fut => Ok(result?),
    }
}

/// Landing that ignores cancellation; never leave a drone in the air.
///
/// Also used by the coordinator when a session worker dies mid-flight.
pub async fn land_best_effort(channel: &dyn CommandSender, config: &SessionConfig) {
    let retry = RetryPolicy::new(
        config.command_retries,
        config.retry_delay,
        config.command_timeout,
    );
    let land = Command::Land.to_string();
    match retry.send_with_retry(channel, &land).await {
        Ok(true) => warn!("Emergency landing acknowledged"),
        Ok(false) => error!("Emergency landing not acknowledged"),
        Err(e) => error!("Emergency landing failed: {}", e),
    }
}

pub struct DroneSession {
    endpoint: AgentEndpoint,
    channel: Arc<dyn CommandSender>,
    config: SessionConfig,
    fsm: SessionStateMachine,
    retry: RetryPolicy,
    control: ControlLoop,
    ctx: FlightContext,
    streaming: bool,
    video: Option<VideoTask>,
}

impl DroneSession {
    pub fn new(
        endpoint: AgentEndpoint,
        channel: Arc<dyn CommandSender>,
        config: SessionConfig,
        ctx: FlightContext,
    ) -> Self {
        let retry = RetryPolicy::new(
            config.command_retries,
            config.retry_delay,
            config.command_timeout,
        );
        let control = config.control_loop();

        Self {
            endpoint,
            channel,
            config,
            fsm: SessionStateMachine::new(),
            retry,
            control,
            ctx,
            streaming: false,
            video: None,
        }
    }

    /// Fly the whole session and report how it ended.
    ///
    /// Never fails: every error becomes an `Aborted` outcome, after a
    /// best-effort landing if the drone may be in the air.
    pub async fn run(mut self) -> SessionOutcome {
        info!("Session starting ({})", self.channel.peer());

        let error = match self.fly().await {
            Ok(()) => None,
            Err(e) => {
                self.abort(&e).await;
                Some(e.to_string())
            }
        };
        self.stop_video().await;

        let outcome = SessionOutcome {
            endpoint: self.endpoint,
            state: self.fsm.state(),
            last_height: self.fsm.last_height(),
            last_battery: self.fsm.last_battery(),
            error,
        };
        info!("Session finished in {}", outcome.state);
        outcome
    }

    async fn fly(&mut self) -> Result<(), SessionError> {
        if !self.send(&Command::Sdk).await? {
            return Err(SessionError::SdkRefused);
        }
        self.transition(SessionEvent::SdkAcknowledged);
        self.led(&LED_RED).await;

        self.check_battery().await?;
        self.transition(SessionEvent::BatteryPassed);

        if self.config.video_enabled {
            self.start_video().await?;
        }

        let takeoff = self
            .retry
            .with_retries(self.config.takeoff_retries, self.config.takeoff_retry_delay);
        if !self.send_with(&Command::Takeoff, takeoff).await? {
            return Err(SessionError::TakeoffFailed);
        }
        self.transition(SessionEvent::TakeoffAcknowledged);
        self.led(&LED_GREEN).await;

        if let Some(cm) = self.config.initial_climb_cm {
            if !self.send(&Command::Move(Direction::Up, cm)).await? {
                warn!("Initial climb not acknowledged");
            }
        }

        if self.config.height_sync {
            if let Some(sync) = self.ctx.sync.clone() {
                self.sync_height(&sync).await?;
            }
        }

        self.transition(SessionEvent::ControlStarted);
        let control = self.control.clone();
        let input = self.ctx.input.clone();
        let cancel = self.ctx.cancel.clone();

        match control.run(input.as_ref(), &cancel, self).await? {
            LoopExit::Landed => {
                self.transition(SessionEvent::LandAcknowledged);
                Ok(())
            }
            LoopExit::Cancelled => Err(SessionError::Cancelled),
        }
    }

    /// Battery gate: a readable level at or above the minimum
    async fn check_battery(&mut self) -> Result<u32, SessionError> {
        let level = self
            .read_battery()
            .await?
            .ok_or(SessionError::BatteryUnreadable)?;

        let min = self.config.min_battery;
        if level < min {
            return Err(SessionError::BatteryLow { level, min });
        }
        info!("Battery: {}%", level);
        Ok(level)
    }

    async fn read_battery(&mut self) -> Result<Option<u32>, SessionError> {
        let policy = self
            .retry
            .with_retries(self.config.battery_retries, self.config.retry_delay);
        let level = guarded(
            &self.ctx.cancel,
            policy.query(self.channel.as_ref(), &Command::Battery.to_string(), codec::parse_battery),
        )
        .await?;

        if let Some(level) = level {
            self.fsm.update_battery(level);
        }
        Ok(level)
    }

    /// Report height, wait at the barrier, then correct towards the target
    async fn sync_height(&mut self, sync: &SwarmSynchronizer) -> Result<(), SessionError> {
        let agent = self.endpoint.command_addr();
        let policy = self
            .retry
            .with_retries(self.config.height_retries, self.config.retry_delay);
        let height = guarded(
            &self.ctx.cancel,
            policy.query(self.channel.as_ref(), &Command::Height.to_string(), codec::parse_height),
        )
        .await?;

        match height {
            Some(cm) => {
                self.fsm.update_height(cm);
                sync.report_height(agent, cm);
                info!("Height: {}cm, waiting for swarm", cm);
            }
            None => warn!("Height unreadable, joining barrier without a height"),
        }

        let release = tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => return Err(SessionError::Cancelled),
            release = sync.await_release(agent, sync.timeout()) => release,
        };

        let (Some(current), Some(target)) = (height, release.target) else {
            info!("No height correction (target {:?})", release.target);
            self.transition(SessionEvent::HeightSynced);
            return Ok(());
        };

        match height_correction(current, target, self.config.altitude_tolerance_cm) {
            Some(correction) => {
                info!("Height {}cm -> target {}cm: {}", current, target, correction);
                if self.send(&correction).await? {
                    self.fsm.update_height(target);
                } else {
                    warn!("Height correction not acknowledged");
                }
            }
            None => debug!("Height {}cm within tolerance of {}cm", current, target),
        }

        self.transition(SessionEvent::HeightSynced);
        Ok(())
    }

    async fn abort(&mut self, cause: &SessionError) {
        if let Some(sync) = &self.ctx.sync {
            sync.withdraw(self.endpoint.command_addr());
        }

        match self.fsm.process_event(SessionEvent::Abort {
            reason: cause.to_string(),
        }) {
            TransitionResult::Aborted {
                from, was_airborne, ..
            } => {
                error!("Session aborted in {}: {}", from, cause);
                if was_airborne {
                    self.land_best_effort().await;
                }
            }
            other => debug!("Abort ignored: {:?}", other),
        }

        self.led(&LED_RED).await;
    }

    async fn land_best_effort(&self) {
        land_best_effort(self.channel.as_ref(), &self.config).await;
    }

    async fn land(&mut self) -> Result<(), SessionError> {
        if self.send(&Command::Land).await? {
            info!("Landed");
        } else {
            error!("Land not acknowledged, treating session as landed");
        }
        Ok(())
    }

    async fn flip(&mut self) -> Result<(), SessionError> {
        if let Some(min) = self.config.flip_min_battery {
            match self.read_battery().await? {
                Some(level) if level >= min => {}
                Some(level) => {
                    warn!("Flip refused: battery {}% below {}%", level, min);
                    return Ok(());
                }
                None => {
                    warn!("Flip refused: battery unreadable");
                    return Ok(());
                }
            }
        }
        self.send(&Command::Flip).await?;
        Ok(())
    }

    async fn scenario(&mut self) -> Result<(), SessionError> {
        info!("Running scripted triangle");
        for _ in 0..SCENARIO_LEGS {
            self.send(&Command::Move(Direction::Forward, self.config.move_distance_cm))
                .await?;
            self.send(&Command::Cw(SCENARIO_TURN_DEG)).await?;
        }
        info!("Scripted triangle finished");
        Ok(())
    }

    async fn report_battery(&mut self) -> Result<(), SessionError> {
        match self.read_battery().await? {
            Some(level) => info!("Battery now: {}%", level),
            None => warn!("Battery now: unknown"),
        }
        tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => Err(SessionError::Cancelled),
            _ = sleep(BATTERY_REPORT_DEBOUNCE) => Ok(()),
        }
    }

    async fn start_video(&mut self) -> Result<(), SessionError> {
        if !self.send(&Command::StreamOn).await? {
            warn!("streamon not acknowledged, continuing without video");
            return Ok(());
        }
        self.streaming = true;

        let Some(capability) = self.ctx.video.clone() else {
            return Ok(());
        };
        match capability.open(&self.ctx.video_source).await {
            Ok(frames) => {
                let stop = CancellationToken::new();
                let handle = video::spawn_monitor(frames, stop.clone());
                self.video = Some(VideoTask { stop, handle });
            }
            Err(e) => warn!("Video unavailable: {:#}", e),
        }
        Ok(())
    }

    async fn stop_video(&mut self) {
        if let Some(task) = self.video.take() {
            task.stop.cancel();
            if let Err(e) = task.handle.await {
                warn!("Video monitor failed: {}", e);
            }
        }

        if self.streaming {
            self.streaming = false;
            let once = self.retry.with_retries(1, Duration::ZERO);
            let text = Command::StreamOff.to_string();
            match once.send_with_retry(self.channel.as_ref(), &text).await {
                Ok(true) => {}
                Ok(false) => warn!("streamoff not acknowledged"),
                Err(e) => warn!("streamoff failed: {}", e),
            }
        }
    }

    /// Best-effort LED colour, only with LED feedback enabled
    async fn led(&self, colour: &Command) {
        if !self.config.led_feedback {
            return;
        }
        let once = self.retry.with_retries(1, Duration::ZERO);
        let text = colour.to_string();
        match once.send_with_retry(self.channel.as_ref(), &text).await {
            Ok(true) => {}
            Ok(false) => warn!("LED command not acknowledged"),
            Err(e) => warn!("LED command failed: {}", e),
        }
    }

    async fn send(&self, command: &Command) -> Result<bool, SessionError> {
        self.send_with(command, self.retry).await
    }

    async fn send_with(&self, command: &Command, policy: RetryPolicy) -> Result<bool, SessionError> {
        let text = command.to_string();
        guarded(
            &self.ctx.cancel,
            policy.send_with_retry(self.channel.as_ref(), &text),
        )
        .await
    }

    fn transition(&mut self, event: SessionEvent) {
        match self.fsm.process_event(event) {
            TransitionResult::Success(state) => info!("-> {}", state),
            TransitionResult::Invalid { from, event } => {
                warn!("Ignored {:?} in {}", event, from)
            }
            TransitionResult::Aborted { from, reason, .. } => {
                warn!("Aborted from {}: {}", from, reason)
            }
        }
    }
}

#[async_trait]
impl ActionExecutor for DroneSession {
    type Error = SessionError;

    async fn execute(&mut self, action: Action) -> Result<(), SessionError> {
        match action {
            Action::Move(direction) => {
                self.send(&Command::Move(direction, self.config.move_distance_cm))
                    .await?;
            }
            Action::RotateCw => {
                self.send(&Command::Cw(self.config.turn_angle_deg)).await?;
            }
            Action::RotateCcw => {
                self.send(&Command::Ccw(self.config.turn_angle_deg)).await?;
            }
            Action::Flip => self.flip().await?,
            Action::Scenario => self.scenario().await?,
            Action::BatteryReport => self.report_battery().await?,
            Action::Land => self.land().await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::retry::tests::ScriptedSender;
    use super::*;
    use crate::control::input::Key;
    use crate::control::InputSource;
    use std::io;
    use std::net::{IpAddr, Ipv4Addr};
    use swarm_shared::channel::CommandResult;
    use swarm_shared::SessionState;

    /// Input with a fixed set of held keys
    struct Held(Vec<Key>);

    impl InputSource for Held {
        fn is_active(&self, key: Key) -> bool {
            self.0.contains(&key)
        }
    }

    fn endpoint(n: u8) -> AgentEndpoint {
        AgentEndpoint::new(IpAddr::V4(Ipv4Addr::new(192, 168, 137, n)))
    }

    fn context(keys: Vec<Key>, sync: Option<Arc<SwarmSynchronizer>>) -> FlightContext {
        FlightContext {
            sync,
            input: Arc::new(Held(keys)),
            video: None,
            video_source: String::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            height_sync: false,
            ..Default::default()
        }
    }

    fn session(sender: &Arc<ScriptedSender>, ctx: FlightContext) -> DroneSession {
        DroneSession::new(endpoint(10), sender.clone(), config(), ctx)
    }

    fn land_key() -> Vec<Key> {
        vec![Key::Char('l')]
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_below_minimum_aborts_before_takeoff() {
        let sender = Arc::new(ScriptedSender::replies(&["ok", "39"]));
        let outcome = session(&sender, context(land_key(), None)).run().await;

        assert_eq!(outcome.state, SessionState::Aborted);
        assert_eq!(outcome.last_battery, Some(39));
        assert_eq!(sender.sent(), vec!["command", "battery?"]);
        assert!(outcome.error.unwrap().contains("39%"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_at_minimum_proceeds() {
        let sender = Arc::new(ScriptedSender::replies(&["ok", "40", "ok", "ok", "ok"]));
        let outcome = session(&sender, context(land_key(), None)).run().await;

        assert!(outcome.landed());
        assert_eq!(outcome.error, None);
        assert_eq!(
            sender.sent(),
            vec!["command", "battery?", "takeoff", "up 50", "land"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_battery_retried_then_aborts() {
        let sender = Arc::new(ScriptedSender::replies(&[
            "ok",
            "battery low",
            "battery low",
            "battery low",
        ]));
        let outcome = session(&sender, context(land_key(), None)).run().await;

        assert_eq!(outcome.state, SessionState::Aborted);
        assert_eq!(outcome.last_battery, None);
        assert_eq!(
            sender.sent(),
            vec!["command", "battery?", "battery?", "battery?"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_takeoff_sends_no_land() {
        // Takeoff attempts all time out once the script runs dry
        let sender = Arc::new(ScriptedSender::replies(&["ok", "80"]));
        let outcome = session(&sender, context(land_key(), None)).run().await;

        assert_eq!(outcome.state, SessionState::Aborted);
        let sent = sender.sent();
        assert_eq!(sent.iter().filter(|c| *c == "takeoff").count(), 5);
        assert!(!sent.iter().any(|c| c == "land"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_airborne_lands() {
        let sender = Arc::new(ScriptedSender::replies(&["ok", "80", "ok", "ok", "ok"]));
        let ctx = context(vec![], None);
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });

        let outcome = session(&sender, ctx).run().await;

        assert_eq!(outcome.state, SessionState::Aborted);
        assert_eq!(outcome.error.as_deref(), Some("Session cancelled"));
        assert_eq!(sender.sent().last().map(String::as_str), Some("land"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_aborts_without_retry() {
        let sender = Arc::new(ScriptedSender::new(vec![Err(io::ErrorKind::NetworkUnreachable)]));
        let outcome = session(&sender, context(land_key(), None)).run().await;

        assert_eq!(outcome.state, SessionState::Aborted);
        assert_eq!(sender.sent(), vec!["command"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_height_sync_applies_correction() {
        let sync = Arc::new(SwarmSynchronizer::new(2, Duration::from_secs(15)));
        let other = endpoint(11).command_addr();
        sync.report_height(other, 100);
        let waiter = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.await_release(other, sync.timeout()).await })
        };

        let sender = Arc::new(ScriptedSender::replies(&[
            "ok", "80", "ok", "ok", "140cm", "ok", "ok",
        ]));
        let config = SessionConfig::default();
        let session = DroneSession::new(
            endpoint(10),
            sender.clone(),
            config,
            context(land_key(), Some(sync.clone())),
        );
        let outcome = session.run().await;

        assert!(outcome.landed());
        assert_eq!(outcome.last_height, Some(100));
        assert_eq!(
            sender.sent(),
            vec!["command", "battery?", "takeoff", "up 50", "height?", "down 40", "land"]
        );
        assert_eq!(waiter.await.unwrap().target, Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extreme_peer_height_still_lands() {
        let sync = Arc::new(SwarmSynchronizer::new(2, Duration::from_secs(15)));
        let other = endpoint(11).command_addr();
        sync.report_height(other, i32::MIN);

        let sender = Arc::new(ScriptedSender::replies(&[
            "ok", "80", "ok", "ok", "100cm", "error", "error", "error", "ok",
        ]));
        let session = DroneSession::new(
            endpoint(10),
            sender.clone(),
            SessionConfig::default(),
            context(land_key(), Some(sync)),
        );
        let outcome = session.run().await;

        assert!(outcome.landed());
        let sent = sender.sent();
        assert_eq!(sent[4], "height?");
        assert_eq!(sent[5], "down 2147483748");
        assert_eq!(sent.last().map(String::as_str), Some("land"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_before_barrier_withdraws() {
        let sync = Arc::new(SwarmSynchronizer::new(2, Duration::from_secs(15)));
        let other = endpoint(11).command_addr();
        sync.report_height(other, 120);

        let sender = Arc::new(ScriptedSender::replies(&["ok", "12"]));
        let config = SessionConfig::default();
        let session = DroneSession::new(
            endpoint(10),
            sender,
            config,
            context(land_key(), Some(sync.clone())),
        );
        session.run().await;

        let started = tokio::time::Instant::now();
        let release = sync.await_release(other, sync.timeout()).await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(release.target, Some(120));
        assert!(!release.timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flip_gated_by_battery() {
        let sender = Arc::new(ScriptedSender::replies(&["55"]));
        let mut drone = session(&sender, context(vec![], None));
        drone.execute(Action::Flip).await.unwrap();
        assert_eq!(sender.sent(), vec!["battery?"]);

        let sender = Arc::new(ScriptedSender::replies(&["75", "ok"]));
        let mut drone = session(&sender, context(vec![], None));
        drone.execute(Action::Flip).await.unwrap();
        assert_eq!(sender.sent(), vec!["battery?", "flip f"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_flies_triangle() {
        let sender = Arc::new(ScriptedSender::new(vec![Ok(CommandResult::Ok("ok".into())); 6]));
        let mut drone = session(&sender, context(vec![], None));
        drone.execute(Action::Scenario).await.unwrap();
        assert_eq!(
            sender.sent(),
            vec!["forward 50", "cw 120", "forward 50", "cw 120", "forward 50", "cw 120"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_led_feedback_is_best_effort() {
        let sender = Arc::new(ScriptedSender::replies(&["ok", "error", "90"]));
        let config = SessionConfig {
            led_feedback: true,
            height_sync: false,
            ..Default::default()
        };
        let outcome = DroneSession::new(endpoint(10), sender.clone(), config, context(land_key(), None))
            .run()
            .await;

        // LED refused, then takeoff attempts time out
        assert_eq!(outcome.state, SessionState::Aborted);
        let sent = sender.sent();
        assert_eq!(sent[..3], ["command", "EXT led 255 0 0", "battery?"]);
        assert_eq!(sent.last().map(String::as_str), Some("EXT led 255 0 0"));
    }
}
