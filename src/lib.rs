/*!
 # Weekly Light Scheduler

 A Rust library that drives scheduled state changes (on/off, brightness ramps,
 color temperature) for networked light fixtures such as ELK-BLEDOM strips.

 ## Features

 * Declarative weekly schedules with inheritance
 * Compilation into time-ordered, week-wrapping event queues
 * A perpetual trigger loop that catches up on overdue events
 * A rate-limited command dispatcher
 * Brightness ramps decomposed into timed step commands
 * Bluetooth LE and file-logging device backends

 ## Example

 ```rust,no_run
 use light_scheduler::*;
 use std::sync::Arc;

 #[tokio::main]
 async fn main() -> Result<()> {
     let config = YamlConfigFile::new("schedules.yaml").load()?;
     let compilation = compile(&config.schedules, &config.groups);

     let device = Arc::new(LogDevice::open("commands.log").await?);
     let (dispatcher, commands) = Dispatcher::new(device, config.dispatch_interval());
     commands.set_connected(true);
     tokio::spawn(dispatcher.run());

     let (triggers_tx, mut triggers) = tokio::sync::mpsc::unbounded_channel();
     let mut scheduler = Scheduler::new(compilation.queues, Arc::new(SystemClock), triggers_tx);
     scheduler.activate("weekday")?;
     tokio::spawn(scheduler.run());

     while let Some(trigger) = triggers.recv().await {
         commands.enqueue(trigger.command)?;
     }
     Ok(())
 }
 ```
*/

use thiserror::Error;

/// Configuration problems that exclude a single schedule (or the whole file)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Element references a lighting group that does not exist
    #[error("schedule '{schedule}': element '{element}' references unknown group '{group}'")]
    UnknownGroup {
        schedule: String,
        element: String,
        group: String,
    },

    /// Element has no days selected
    #[error("schedule '{schedule}': element '{element}' has no days")]
    EmptyDays { schedule: String, element: String },

    /// Element has neither an on time nor an off time
    #[error("schedule '{schedule}': element '{element}' has neither an on nor an off time")]
    MissingTimes { schedule: String, element: String },

    /// Inheritance chain loops back on itself
    #[error("schedule '{}': cyclic inheritance {}", .schedule, .chain.join(" -> "))]
    CyclicInheritance { schedule: String, chain: Vec<String> },

    /// Inheritance references a schedule that does not exist
    #[error("schedule '{schedule}': parent schedule '{parent}' not found")]
    MissingParent { schedule: String, parent: String },

    /// A numeric field is outside its allowed range
    #[error("schedule '{schedule}': element '{element}' {field} {value} out of range ({min}..={max})")]
    ValueOutOfRange {
        schedule: String,
        element: String,
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    /// Weekday number outside 0..=6
    #[error("invalid weekday {0} (expected 0..=6, 0 = Sunday)")]
    InvalidDay(u8),

    /// Unparsable time of day
    #[error("invalid time of day '{0}' (expected HH:MM or HH:MM:SS)")]
    InvalidTime(String),

    /// Unparsable day set
    #[error("invalid day set '{0}'")]
    InvalidDays(String),

    /// Element ramps but never turns on
    #[error("schedule '{schedule}': element '{element}' has a ramp but no on time")]
    RampWithoutOn { schedule: String, element: String },

    /// Commands cannot be paced at a zero interval
    #[error("dispatch_interval_ms must be greater than zero")]
    ZeroDispatchInterval,
}

/// Error types for the light scheduler library
#[derive(Error, Debug)]
pub enum Error {
    /// Schedule configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Command submitted without any target fixtures
    #[error("Command has no target fixtures")]
    EmptyTargets,

    /// Command failed validation
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Activation of a schedule name that was never compiled
    #[error("Unknown schedule '{0}'")]
    UnknownSchedule(String),

    /// Device interface reported a failure
    #[error("Device error: {0}")]
    Device(String),

    /// No Bluetooth adapters found
    #[error("No Bluetooth adapters found")]
    NoBluetoothAdapters,

    /// Not every requested fixture was found while scanning
    #[error("No compatible LED device found for: {}", .0.join(", "))]
    NoCompatibleDevice(Vec<String>),

    /// Failed to find required BLE characteristic
    #[error("Could not find required BLE characteristic: {0}")]
    CharacteristicNotFound(String),

    /// BLE communication error
    #[error("BLE communication error: {0}")]
    Ble(String),

    /// Error from btleplug
    #[error(transparent)]
    BtlePlug(#[from] btleplug::Error),

    /// Internal channel closed because its peer task is gone
    #[error("{0} channel closed")]
    ChannelClosed(&'static str),

    /// I/O error (config files, log device)
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// YAML (de)serialisation error
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod ble;
pub mod clock;
pub mod command;
pub mod compiler;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod queue;
pub mod ramp;
pub mod schedule;
pub mod scheduler;

pub use ble::BleFixtures;
pub use clock::{Clock, SystemClock, TokioClock, WeekTime, SECONDS_PER_DAY, SECONDS_PER_WEEK};
pub use command::{Command, LightState, MAX_BRIGHTNESS, MAX_MIREDS, MIN_BRIGHTNESS, MIN_MIREDS};
pub use compiler::{compile, resolve_inheritance, Compilation};
pub use config::{AppConfig, ConfigProvider, YamlConfigFile};
pub use device::{DeviceInterface, DeviceRequest, LogDevice};
pub use dispatcher::{
    ConnectionState, Dispatched, Dispatcher, DispatcherHandle, MIN_DISPATCH_INTERVAL,
};
pub use queue::{CompiledEvent, WeeklyQueue};
pub use ramp::{RampEngine, RampHandle, RampId, RampPlan, RAMP_STARTUP_OFFSET_MS};
pub use schedule::{Days, ScheduleElementSpec, ScheduleSpec};
pub use scheduler::{Scheduler, SchedulerHandle, Trigger};
