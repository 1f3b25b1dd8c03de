/*!
 # Rate-limited command dispatch

 Fixtures degrade or drop commands that arrive faster than their hardware
 allows, so every command (scheduled, direct, or ramp step) goes through one
 [`Dispatcher`]. Producers append through a cloneable [`DispatcherHandle`]; the
 dispatcher is the queue's only consumer and forwards at most one command per
 tick to the [`DeviceInterface`].
*/

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, instrument, trace, warn};

use crate::command::Command;
use crate::device::{DeviceInterface, DeviceRequest};
use crate::ramp::{RampEngine, RampHandle, RampId};
use crate::{Error, Result};

/// Shortest pacing the dispatcher will run at
pub const MIN_DISPATCH_INTERVAL: Duration = Duration::from_millis(1);

/// Connectivity of the device interface as reported by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Outcome of a single dispatcher tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Command forwarded to the device
    Sent(Command),
    /// Ramp started; its initial on-command was forwarded
    RampStarted(RampId),
    /// Device reported a failure; the command is dropped
    Failed(Command),
    /// Nothing queued
    Empty,
    /// Disconnected, queue left untouched
    Paused,
}

/// Producer side of the dispatch queue
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<Command>,
    queued: Arc<AtomicUsize>,
    connection: Arc<watch::Sender<ConnectionState>>,
    ramps: Arc<Mutex<HashMap<RampId, RampHandle>>>,
}

impl DispatcherHandle {
    /// Appends `command` to the queue. Never blocks; invalid commands (for
    /// example without targets) are rejected and never queued.
    pub fn enqueue(&self, command: Command) -> Result<()> {
        command.validate()?;
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(command).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::ChannelClosed("dispatch"));
        }
        trace!(queued = self.queued(), "Command queued");
        Ok(())
    }

    /// Pauses (`false`) or resumes (`true`) forwarding to the device
    pub fn set_connected(&self, connected: bool) {
        let state = if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        let previous = self.connection.send_replace(state);
        if previous != state {
            info!("Device interface {:?}", state);
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    /// Commands waiting to be dispatched
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn active_ramps(&self) -> usize {
        self.ramps.lock().len()
    }

    /// True when nothing is queued and no ramp is running
    pub fn is_idle(&self) -> bool {
        self.queued() == 0 && self.active_ramps() == 0
    }

    /// Polls until [`is_idle`](Self::is_idle)
    pub async fn wait_idle(&self, poll: Duration) {
        while !self.is_idle() {
            time::sleep(poll).await;
        }
    }
}

/// Single consumer of the dispatch queue
pub struct Dispatcher {
    device: Arc<dyn DeviceInterface>,
    interval: Duration,
    rx: mpsc::UnboundedReceiver<Command>,
    handle: DispatcherHandle,
    connection: watch::Receiver<ConnectionState>,
    ramp_engine: RampEngine,
    ramp_done: mpsc::UnboundedReceiver<RampId>,
}

impl Dispatcher {
    /// Creates a dispatcher forwarding to `device` no more often than every
    /// `interval`. It starts disconnected; call
    /// [`DispatcherHandle::set_connected`] once the device is reachable.
    pub fn new(device: Arc<dyn DeviceInterface>, interval: Duration) -> (Self, DispatcherHandle) {
        if interval < MIN_DISPATCH_INTERVAL {
            warn!(
                "Dispatch interval {:?} raised to {:?}",
                interval, MIN_DISPATCH_INTERVAL
            );
        }
        let interval = interval.max(MIN_DISPATCH_INTERVAL);
        let (tx, rx) = mpsc::unbounded_channel();
        let (connection_tx, connection) = watch::channel(ConnectionState::Disconnected);
        let (done_tx, ramp_done) = mpsc::unbounded_channel();

        let handle = DispatcherHandle {
            tx,
            queued: Arc::new(AtomicUsize::new(0)),
            connection: Arc::new(connection_tx),
            ramps: Arc::new(Mutex::new(HashMap::new())),
        };
        let dispatcher = Self {
            device,
            interval,
            rx,
            handle: handle.clone(),
            connection,
            ramp_engine: RampEngine::new(handle.clone(), done_tx),
            ramp_done,
        };
        (dispatcher, handle)
    }

    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Ticks forever, one command per `interval` at most
    #[instrument(skip(self), fields(interval_ms = self.interval.as_millis() as u64))]
    pub async fn run(mut self) {
        info!("Dispatcher started");
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// Takes the next queued command without sending it
    pub fn try_next(&mut self) -> Option<Command> {
        let command = self.rx.try_recv().ok()?;
        self.handle.queued.fetch_sub(1, Ordering::SeqCst);
        Some(command)
    }

    /// Handles one tick: reaps finished ramps, then forwards at most one
    /// command, or starts a ramp for it.
    pub async fn tick(&mut self) -> Dispatched {
        self.reap_ramps();

        if *self.connection.borrow() == ConnectionState::Disconnected {
            return Dispatched::Paused;
        }
        let Ok(command) = self.rx.try_recv() else {
            return Dispatched::Empty;
        };

        let outcome = if command.is_ramp() {
            self.start_ramp(command).await
        } else {
            self.forward(command).await
        };
        // Counted down only once the ramp is registered, so `is_idle` never
        // sees a gap between the two.
        self.handle.queued.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn start_ramp(&mut self, command: Command) -> Dispatched {
        match self.ramp_engine.start(command.clone()) {
            Ok((ramp, initial)) => {
                let id = ramp.id;
                self.handle.ramps.lock().insert(id, ramp);
                match self.forward(initial).await {
                    Dispatched::Sent(_) => Dispatched::RampStarted(id),
                    other => {
                        if let Some(ramp) = self.handle.ramps.lock().remove(&id) {
                            ramp.abort();
                        }
                        warn!(ramp = %id, "Initial command failed, ramp cancelled");
                        other
                    }
                }
            }
            Err(e) => {
                warn!("Could not start ramp: {}", e);
                Dispatched::Failed(command)
            }
        }
    }

    async fn forward(&self, command: Command) -> Dispatched {
        let request = DeviceRequest::from(&command);
        match self.device.send(&request).await {
            Ok(()) => {
                debug!(
                    targets = ?request.target_ids,
                    on = ?request.on,
                    brightness = ?request.brightness,
                    ct = ?request.color_temperature,
                    "Command sent"
                );
                Dispatched::Sent(command)
            }
            Err(e) => {
                warn!(targets = ?request.target_ids, "Device rejected command: {}", e);
                Dispatched::Failed(command)
            }
        }
    }

    fn reap_ramps(&mut self) {
        while let Ok(id) = self.ramp_done.try_recv() {
            if let Some(ramp) = self.handle.ramps.lock().remove(&id) {
                info!(ramp = %id, "Ramp to {} complete", ramp.plan.target_brightness);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::LightState;
    use crate::device::testing::RecordingDevice;
    use tokio::time::Instant;

    const INTERVAL: Duration = Duration::from_millis(250);

    fn connected(device: &Arc<RecordingDevice>) -> (Dispatcher, DispatcherHandle) {
        let (dispatcher, handle) = Dispatcher::new(device.clone(), INTERVAL);
        handle.set_connected(true);
        (dispatcher, handle)
    }

    #[tokio::test]
    async fn empty_target_commands_are_never_queued() {
        let device = Arc::new(RecordingDevice::default());
        let (mut dispatcher, handle) = connected(&device);

        let result = handle.enqueue(Command::on(Vec::<String>::new()));
        assert!(matches!(result, Err(Error::EmptyTargets)));
        assert_eq!(handle.queued(), 0);
        assert_eq!(dispatcher.tick().await, Dispatched::Empty);
    }

    #[tokio::test]
    async fn one_command_per_tick() {
        let device = Arc::new(RecordingDevice::default());
        let (mut dispatcher, handle) = connected(&device);

        handle.enqueue(Command::on(["a"])).unwrap();
        handle.enqueue(Command::off(["a"])).unwrap();
        assert_eq!(handle.queued(), 2);

        assert_eq!(dispatcher.tick().await, Dispatched::Sent(Command::on(["a"])));
        assert_eq!(device.requests().len(), 1);
        assert_eq!(dispatcher.tick().await, Dispatched::Sent(Command::off(["a"])));
        assert_eq!(dispatcher.tick().await, Dispatched::Empty);
        assert!(handle.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn fifo_across_producers_at_rate_limit() {
        let device = Arc::new(RecordingDevice::default());
        let (dispatcher, handle) = connected(&device);

        for target in ["A", "B", "C"] {
            let producer = handle.clone();
            tokio::spawn(async move { producer.enqueue(Command::on([target])) })
                .await
                .unwrap()
                .unwrap();
        }
        tokio::spawn(dispatcher.run());
        handle.wait_idle(Duration::from_millis(10)).await;

        let sent = device.sent();
        let order: Vec<&str> = sent
            .iter()
            .map(|(_, r)| r.target_ids[0].as_str())
            .collect();
        assert_eq!(order, vec!["A", "B", "C"]);
        for pair in sent.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= INTERVAL);
        }
    }

    #[tokio::test]
    async fn disconnected_dispatcher_holds_commands() {
        let device = Arc::new(RecordingDevice::default());
        let (mut dispatcher, handle) = connected(&device);

        handle.set_connected(false);
        assert_eq!(handle.connection_state(), ConnectionState::Disconnected);
        handle.enqueue(Command::on(["a"])).unwrap();
        assert_eq!(dispatcher.tick().await, Dispatched::Paused);
        assert_eq!(handle.queued(), 1);
        assert!(device.requests().is_empty());

        handle.set_connected(true);
        assert_eq!(dispatcher.tick().await, Dispatched::Sent(Command::on(["a"])));
    }

    #[tokio::test]
    async fn device_failures_do_not_stop_dispatch() {
        let device = Arc::new(RecordingDevice::default());
        device.fail_for("broken");
        let (mut dispatcher, handle) = connected(&device);

        handle.enqueue(Command::on(["broken"])).unwrap();
        handle.enqueue(Command::on(["fine"])).unwrap();

        assert_eq!(
            dispatcher.tick().await,
            Dispatched::Failed(Command::on(["broken"]))
        );
        assert_eq!(dispatcher.tick().await, Dispatched::Sent(Command::on(["fine"])));
        // no retry of the failed send
        assert_eq!(device.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_commands_are_stepped_through_the_queue() {
        let device = Arc::new(RecordingDevice::default());
        let (dispatcher, handle) = connected(&device);

        handle.enqueue(Command::on(["lamp"]).with_brightness(4).with_ramp(1)).unwrap();
        handle.enqueue(Command::on(["other"])).unwrap();

        let started = Instant::now();
        tokio::spawn(dispatcher.run());
        handle.wait_idle(Duration::from_millis(100)).await;

        let requests = device.requests();
        let summary: Vec<(&str, Option<bool>, Option<u8>)> = requests
            .iter()
            .map(|r| (r.target_ids[0].as_str(), r.on, r.brightness))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("lamp", Some(true), Some(1)),
                ("other", Some(true), None),
                ("lamp", None, Some(2)),
                ("lamp", None, Some(3)),
                ("lamp", None, Some(4)),
            ]
        );
        // three steps spread over the 59s budget
        assert!(started.elapsed() >= Duration::from_millis(58_000));
        assert_eq!(handle.active_ramps(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initial_command_cancels_ramp() {
        let device = Arc::new(RecordingDevice::default());
        device.fail_for("lamp");
        let (mut dispatcher, handle) = connected(&device);

        let ramp = Command::on(["lamp"]).with_brightness(4).with_ramp(1);
        handle.enqueue(ramp).unwrap();
        assert!(matches!(dispatcher.tick().await, Dispatched::Failed(_)));
        assert_eq!(handle.active_ramps(), 0);

        time::advance(Duration::from_secs(120)).await;
        assert_eq!(dispatcher.tick().await, Dispatched::Empty);
        assert_eq!(device.requests().len(), 1);
        assert!(handle.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_raised_to_minimum() {
        let device = Arc::new(RecordingDevice::default());
        let (dispatcher, handle) = Dispatcher::new(device.clone(), Duration::ZERO);
        assert_eq!(dispatcher.interval, MIN_DISPATCH_INTERVAL);
        handle.set_connected(true);

        handle.enqueue(Command::on(["a"])).unwrap();
        handle.enqueue(Command::off(["a"])).unwrap();
        tokio::spawn(dispatcher.run());
        handle.wait_idle(Duration::from_millis(10)).await;
        assert_eq!(device.requests().len(), 2);
    }

    #[tokio::test]
    async fn ramp_state_gate_forwards_non_on_commands_raw() {
        let device = Arc::new(RecordingDevice::default());
        let (mut dispatcher, handle) = connected(&device);

        let nudge = Command::new(LightState::NoChange, ["a"]).with_brightness_delta(10);
        handle.enqueue(nudge.clone()).unwrap();
        assert_eq!(dispatcher.tick().await, Dispatched::Sent(nudge));
        assert_eq!(device.requests()[0].brightness_delta, Some(10));
        assert_eq!(handle.active_ramps(), 0);
    }
}
