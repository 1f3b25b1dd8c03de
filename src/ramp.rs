//! Brightness ramps.
//!
//! A ramp turns a "fade up to brightness N over M minutes" command into an
//! initial on-command at brightness 1 followed by `N - 1` single-step
//! brightness increments spread evenly over the ramp duration. Steps go back
//! through the dispatcher queue so they share its rate limit with every other
//! producer.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::command::{Command, LightState, MAX_BRIGHTNESS, MIN_BRIGHTNESS};
use crate::dispatcher::DispatcherHandle;
use crate::{Error, Result};

/// Time budget taken off the ramp duration for the initial on-command
pub const RAMP_STARTUP_OFFSET_MS: u64 = 1_000;

pub type RampId = Uuid;

/// Step arithmetic of a ramp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampPlan {
    pub target_brightness: u8,
    pub steps: u32,
    /// Delay between steps, 0 fires every step at once
    pub step_interval_ms: u64,
}

impl RampPlan {
    pub fn for_command(command: &Command) -> Self {
        Self::compute(
            command.brightness.unwrap_or(MAX_BRIGHTNESS),
            command.ramp_minutes,
            RAMP_STARTUP_OFFSET_MS,
        )
    }

    /// Splits `ramp_minutes` (less `startup_offset_ms`) evenly over the
    /// `target_brightness - 1` steps. The division truncates, so the last step
    /// may land up to `steps` milliseconds before the nominal end.
    pub fn compute(target_brightness: u8, ramp_minutes: u32, startup_offset_ms: u64) -> Self {
        let target_brightness = target_brightness.max(MIN_BRIGHTNESS);
        let steps = (target_brightness - MIN_BRIGHTNESS) as u32;
        let budget_ms = ramp_minutes as i64 * 60_000 - startup_offset_ms as i64;
        let step_interval_ms = if steps == 0 || budget_ms <= 0 {
            0
        } else {
            (budget_ms / steps as i64) as u64
        };

        Self {
            target_brightness,
            steps,
            step_interval_ms,
        }
    }
}

/// Private per-ramp progress, owned by the ramp task
#[derive(Debug)]
struct RampState {
    remaining_steps: u32,
    step_interval: Duration,
    current_brightness: u8,
    target_brightness: u8,
    template: Command,
}

impl RampState {
    fn next_step(&mut self) -> Option<Command> {
        if self.remaining_steps == 0 || self.current_brightness >= self.target_brightness {
            return None;
        }
        self.remaining_steps -= 1;
        self.current_brightness += 1;
        Some(Command {
            state: LightState::NoChange,
            brightness: Some(self.current_brightness),
            ..self.template.clone()
        })
    }
}

/// Handle to a running ramp
#[derive(Debug)]
pub struct RampHandle {
    pub id: RampId,
    pub plan: RampPlan,
    task: JoinHandle<()>,
}

impl RampHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops queueing further steps
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Starts ramps whose steps are queued on a dispatcher
#[derive(Debug, Clone)]
pub struct RampEngine {
    commands: DispatcherHandle,
    done: mpsc::UnboundedSender<RampId>,
}

impl RampEngine {
    /// `done` receives the id of every ramp once its last step is queued
    pub fn new(commands: DispatcherHandle, done: mpsc::UnboundedSender<RampId>) -> Self {
        Self { commands, done }
    }

    /// Starts a ramp for `command` and returns its handle together with the
    /// initial on-command (brightness 1, requested color), which the caller
    /// sends right away.
    pub fn start(&self, command: Command) -> Result<(RampHandle, Command)> {
        if !command.is_ramp() {
            return Err(Error::InvalidCommand(format!(
                "not a ramp: state {:?}, ramp {} min",
                command.state, command.ramp_minutes
            )));
        }

        let plan = RampPlan::for_command(&command);
        let id = Uuid::new_v4();
        let template = Command {
            state: LightState::NoChange,
            brightness: None,
            color_temperature: None,
            brightness_delta: None,
            target_ids: command.target_ids.clone(),
            ramp_minutes: 0,
        };
        let initial = Command {
            state: LightState::On,
            brightness: Some(MIN_BRIGHTNESS),
            color_temperature: command.color_temperature,
            ..template.clone()
        };

        let state = RampState {
            remaining_steps: plan.steps,
            step_interval: Duration::from_millis(plan.step_interval_ms),
            current_brightness: MIN_BRIGHTNESS,
            target_brightness: plan.target_brightness,
            template,
        };

        info!(
            ramp = %id,
            targets = ?command.target_ids,
            minutes = command.ramp_minutes,
            steps = plan.steps,
            interval_ms = plan.step_interval_ms,
            "Starting brightness ramp to {}",
            plan.target_brightness
        );

        let task = tokio::spawn(run_steps(id, state, self.commands.clone(), self.done.clone()));
        Ok((RampHandle { id, plan, task }, initial))
    }
}

// TODO: accept a cancellation signal so an "off" command for the same
// fixtures can stop a ramp that is still running.
async fn run_steps(
    id: RampId,
    mut state: RampState,
    commands: DispatcherHandle,
    done: mpsc::UnboundedSender<RampId>,
) {
    let mut ticker = (!state.step_interval.is_zero()).then(|| {
        time::interval_at(Instant::now() + state.step_interval, state.step_interval)
    });

    while let Some(step) = state.next_step() {
        if let Some(ticker) = ticker.as_mut() {
            ticker.tick().await;
        }
        trace!(
            ramp = %id,
            brightness = state.current_brightness,
            remaining = state.remaining_steps,
            "Queueing ramp step"
        );
        if let Err(e) = commands.enqueue(step) {
            warn!(ramp = %id, "Ramp aborted, could not queue step: {}", e);
            break;
        }
    }

    debug!(ramp = %id, "Ramp finished at brightness {}", state.current_brightness);
    if done.send(id).is_err() {
        trace!(ramp = %id, "Nobody is tracking ramp completion");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::device::testing::RecordingDevice;
    use std::sync::Arc;

    #[test]
    fn ten_minute_full_ramp_arithmetic() {
        let plan = RampPlan::for_command(&Command::on(["a"]).with_brightness(254).with_ramp(10));
        assert_eq!(plan.steps, 253);
        assert_eq!(plan.step_interval_ms, (600_000 - RAMP_STARTUP_OFFSET_MS) / 253);

        let covered = plan.steps as u64 * plan.step_interval_ms;
        let budget = 10 * 60_000 - RAMP_STARTUP_OFFSET_MS;
        assert!(covered <= budget && budget - covered < plan.steps as u64);
    }

    #[test]
    fn brightness_one_has_no_steps() {
        for minutes in [1, 10, 120] {
            let plan = RampPlan::compute(1, minutes, RAMP_STARTUP_OFFSET_MS);
            assert_eq!(plan.steps, 0);
            assert_eq!(plan.step_interval_ms, 0);
        }
    }

    #[test]
    fn exhausted_budget_fires_steps_immediately() {
        let plan = RampPlan::compute(100, 1, 60_000);
        assert_eq!(plan.steps, 99);
        assert_eq!(plan.step_interval_ms, 0);
    }

    #[test]
    fn missing_brightness_ramps_to_maximum() {
        let plan = RampPlan::for_command(&Command::on(["a"]).with_ramp(5));
        assert_eq!(plan.target_brightness, MAX_BRIGHTNESS);
    }

    #[tokio::test]
    async fn rejects_commands_without_ramp() {
        let device = Arc::new(RecordingDevice::default());
        let (_dispatcher, handle) = Dispatcher::new(device, Duration::from_millis(10));
        let (done_tx, _done_rx) = mpsc::unbounded_channel();
        let engine = RampEngine::new(handle, done_tx);

        assert!(engine.start(Command::on(["a"])).is_err());
        assert!(engine.start(Command::off(["a"]).with_ramp(3)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn steps_are_queued_at_the_planned_interval() {
        let device = Arc::new(RecordingDevice::default());
        let (mut dispatcher, handle) = Dispatcher::new(device, Duration::from_millis(10));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let engine = RampEngine::new(handle.clone(), done_tx);

        let command = Command::on(["a"])
            .with_brightness(4)
            .with_color_temperature(300)
            .with_ramp(1);
        let started = Instant::now();
        let (ramp, initial) = engine.start(command).unwrap();

        assert_eq!(initial.state, LightState::On);
        assert_eq!(initial.brightness, Some(1));
        assert_eq!(initial.color_temperature, Some(300));
        assert_eq!(ramp.plan.steps, 3);
        assert_eq!(ramp.plan.step_interval_ms, 59_000 / 3);

        let finished = done_rx.recv().await.unwrap();
        assert_eq!(finished, ramp.id);
        assert_eq!(
            started.elapsed(),
            Duration::from_millis(3 * ramp.plan.step_interval_ms)
        );

        let mut steps = Vec::new();
        while let Some(step) = dispatcher.try_next() {
            steps.push(step);
        }
        let brightness: Vec<Option<u8>> = steps.iter().map(|c| c.brightness).collect();
        assert_eq!(brightness, vec![Some(2), Some(3), Some(4)]);
        assert!(steps.iter().all(|c| c.state == LightState::NoChange
            && c.ramp_minutes == 0
            && c.color_temperature.is_none()
            && c.target_ids == initial.target_ids));
    }

    #[tokio::test(start_paused = true)]
    async fn single_brightness_ramp_completes_immediately() {
        let device = Arc::new(RecordingDevice::default());
        let (mut dispatcher, handle) = Dispatcher::new(device, Duration::from_millis(10));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let engine = RampEngine::new(handle, done_tx);

        let started = Instant::now();
        let (ramp, _initial) = engine
            .start(Command::on(["a"]).with_brightness(1).with_ramp(30))
            .unwrap();

        assert_eq!(done_rx.recv().await, Some(ramp.id));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(dispatcher.try_next().is_none());
    }
}
