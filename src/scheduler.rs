//! The scheduler trigger loop.
//!
//! [`Scheduler`] owns the queue of the active schedule and runs a plain loop:
//! fire everything that is due, work out the delay to the next event, sleep,
//! repeat. Triggered commands go out on a single channel in the order they were
//! due. A [`SchedulerHandle`] switches the active schedule while the loop runs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, WeekTime};
use crate::command::Command;
use crate::queue::WeeklyQueue;
use crate::{Error, Result};

/// A scheduled event that has fired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub schedule: String,
    pub label: String,
    /// When the event was due (it may be delivered later after a stall)
    pub due: WeekTime,
    pub command: Command,
}

enum Control {
    Activate {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Switches the active schedule of a running [`Scheduler`]
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    control: mpsc::UnboundedSender<Control>,
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Control::Activate { name, .. } => write!(f, "Activate({name})"),
        }
    }
}

impl SchedulerHandle {
    /// Activates `name`; unknown names are rejected and leave the running
    /// schedule in place.
    pub async fn activate(&self, name: &str) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.control
            .send(Control::Activate {
                name: name.to_string(),
                reply,
            })
            .map_err(|_| Error::ChannelClosed("scheduler control"))?;
        response
            .await
            .map_err(|_| Error::ChannelClosed("scheduler control"))?
    }
}

pub struct Scheduler {
    schedules: BTreeMap<String, WeeklyQueue>,
    active: Option<WeeklyQueue>,
    clock: Arc<dyn Clock>,
    triggers: mpsc::UnboundedSender<Trigger>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl Scheduler {
    /// Creates an idle scheduler over compiled `schedules`. Triggers are sent
    /// to `triggers`; the loop stops once its receiver is dropped.
    pub fn new(
        schedules: BTreeMap<String, WeeklyQueue>,
        clock: Arc<dyn Clock>,
        triggers: mpsc::UnboundedSender<Trigger>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            schedules,
            active: None,
            clock,
            triggers,
            control_tx,
            control_rx,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            control: self.control_tx.clone(),
        }
    }

    pub fn schedule_names(&self) -> impl Iterator<Item = &str> {
        self.schedules.keys().map(String::as_str)
    }

    pub fn active_schedule(&self) -> Option<&str> {
        self.active.as_ref().map(WeeklyQueue::name)
    }

    pub fn active_queue(&self) -> Option<&WeeklyQueue> {
        self.active.as_ref()
    }

    /// Makes `name` the active schedule, replacing the previous queue with a
    /// fresh one positioned at the current time.
    #[instrument(skip(self))]
    pub fn activate(&mut self, name: &str) -> Result<()> {
        let Some(template) = self.schedules.get(name) else {
            warn!("Cannot activate unknown schedule");
            return Err(Error::UnknownSchedule(name.to_string()));
        };

        let now = self.clock.now();
        let mut queue = template.clone();
        queue.regenerate(now);
        info!(
            pending = queue.len(),
            next = ?queue.next_due().map(|due| due.to_string()),
            "Activated schedule at {}",
            now
        );
        self.active = Some(queue);
        Ok(())
    }

    /// Runs the trigger loop until the trigger receiver is dropped
    pub async fn run(mut self) {
        info!("Scheduler loop started");
        loop {
            let now = self.clock.now();
            if !self.fire_due(now) {
                break;
            }

            let delay = self
                .active
                .as_ref()
                .map(|queue| Duration::from_secs(queue.seconds_until_next_run(now)));
            if let Some(delay) = delay {
                debug!("Next scheduler wake-up in {:?}", delay);
            }
            let wait = async move {
                match delay {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = wait => {}
                Some(control) = self.control_rx.recv() => self.handle_control(control),
                _ = self.triggers.closed() => break,
            }
        }
        info!("Trigger consumer gone, scheduler loop stopped");
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Activate { name, reply } => {
                let result = self.activate(&name);
                if reply.send(result).is_err() {
                    debug!("Activation requester went away");
                }
            }
        }
    }

    /// Emits every event due at `now`, oldest first, and starts the next pass
    /// once the queue runs dry. Returns false when nobody receives triggers.
    fn fire_due(&mut self, now: WeekTime) -> bool {
        let Some(queue) = self.active.as_mut() else {
            return true;
        };

        while let Some(due) = queue.next_due().filter(|due| *due <= now) {
            let Some(event) = queue.pop() else {
                break;
            };
            let trigger = Trigger {
                schedule: queue.name().to_string(),
                label: event.label,
                due,
                command: event.command,
            };
            info!(
                schedule = %trigger.schedule,
                due = %trigger.due,
                "Schedule trigger fired: {}",
                trigger.label
            );
            if self.triggers.send(trigger).is_err() {
                return false;
            }
        }

        if queue.is_empty() {
            queue.regenerate(now);
        }
        true
    }
}
