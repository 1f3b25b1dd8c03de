//! Light commands exchanged between the scheduler, the dispatcher and ramps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{Error, Result};

/// Lowest brightness a fixture accepts while on
pub const MIN_BRIGHTNESS: u8 = 1;
/// Highest brightness a fixture accepts
pub const MAX_BRIGHTNESS: u8 = 254;
/// Coolest supported color temperature in mireds (~6500K)
pub const MIN_MIREDS: u16 = 153;
/// Warmest supported color temperature in mireds (2000K)
pub const MAX_MIREDS: u16 = 500;

/// Requested power state of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightState {
    /// Leave the power state as it is
    #[default]
    NoChange,
    Off,
    On,
}

impl LightState {
    pub fn as_power(self) -> Option<bool> {
        match self {
            LightState::NoChange => None,
            LightState::Off => Some(false),
            LightState::On => Some(true),
        }
    }
}

/// A single command for one or more fixtures.
///
/// Commands are plain values: every component that hands one on passes a
/// clone, so a ramp stepping through brightness values never touches the
/// producer's copy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Command {
    pub state: LightState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
    /// Color temperature in mireds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_temperature: Option<u16>,
    /// Relative brightness change, used by direct "nudge" commands
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness_delta: Option<i16>,
    pub target_ids: BTreeSet<String>,
    /// Ramp duration in minutes, 0 = no ramp
    #[serde(default)]
    pub ramp_minutes: u32,
}

impl Command {
    pub fn new<I, S>(state: LightState, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state,
            target_ids: targets.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn on<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(LightState::On, targets)
    }

    pub fn off<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(LightState::Off, targets)
    }

    pub fn with_brightness(mut self, brightness: u8) -> Self {
        self.brightness = Some(brightness);
        self
    }

    pub fn with_color_temperature(mut self, mireds: u16) -> Self {
        self.color_temperature = Some(mireds);
        self
    }

    pub fn with_brightness_delta(mut self, delta: i16) -> Self {
        self.brightness_delta = Some(delta);
        self
    }

    pub fn with_ramp(mut self, minutes: u32) -> Self {
        self.ramp_minutes = minutes;
        self
    }

    /// Whether the dispatcher should hand this command to a ramp
    pub fn is_ramp(&self) -> bool {
        self.ramp_minutes > 0 && self.state == LightState::On
    }

    /// Checks the invariants every producer must respect before a command is
    /// queued.
    pub fn validate(&self) -> Result<()> {
        if self.target_ids.is_empty() {
            return Err(Error::EmptyTargets);
        }
        if let Some(brightness) = self.brightness {
            if !(MIN_BRIGHTNESS..=MAX_BRIGHTNESS).contains(&brightness) {
                return Err(Error::InvalidCommand(format!(
                    "brightness {brightness} out of range ({MIN_BRIGHTNESS}..={MAX_BRIGHTNESS})"
                )));
            }
        }
        if let Some(mireds) = self.color_temperature {
            if !(MIN_MIREDS..=MAX_MIREDS).contains(&mireds) {
                return Err(Error::InvalidCommand(format!(
                    "color temperature {mireds} out of range ({MIN_MIREDS}..={MAX_MIREDS})"
                )));
            }
        }
        if self.ramp_minutes > 0 && self.state != LightState::On {
            return Err(Error::InvalidCommand(format!(
                "ramp requires state On, got {:?}",
                self.state
            )));
        }
        Ok(())
    }
}
