/*!
 # Declarative weekly schedules

 This module holds the schedule definitions as they come out of configuration:
 named schedules made of elements that switch a lighting group on and/or off at
 given times on a set of weekdays. Schedules may inherit from a parent and
 override its elements by name.
*/

use chrono::NaiveTime;
use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;
use tracing::trace;

use crate::ConfigError;

/// A set of weekdays, bit 0 = Sunday through bit 6 = Saturday
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Days(u8);

impl Days {
    pub const NONE: Days = Days(0x00);
    pub const SUNDAY: Days = Days(0x01);
    pub const MONDAY: Days = Days(0x02);
    pub const TUESDAY: Days = Days(0x04);
    pub const WEDNESDAY: Days = Days(0x08);
    pub const THURSDAY: Days = Days(0x10);
    pub const FRIDAY: Days = Days(0x20);
    pub const SATURDAY: Days = Days(0x40);
    /// Monday through Friday
    pub const WEEKDAYS: Days = Days(0x02 | 0x04 | 0x08 | 0x10 | 0x20);
    /// Saturday and Sunday
    pub const WEEKEND: Days = Days(0x01 | 0x40);
    pub const ALL: Days = Days(0x7f);

    /// Builds a set from weekday numbers (0 = Sunday)
    pub fn from_numbers<I>(days: I) -> Result<Days, ConfigError>
    where
        I: IntoIterator<Item = u8>,
    {
        days.into_iter().try_fold(Days::NONE, |acc, day| {
            if day > 6 {
                Err(ConfigError::InvalidDay(day))
            } else {
                Ok(Days(acc.0 | (1 << day)))
            }
        })
    }

    pub fn contains(self, day: u8) -> bool {
        day < 7 && self.0 & (1 << day) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Weekday numbers in ascending order
    pub fn iter(self) -> impl Iterator<Item = u8> {
        (0..7u8).filter(move |day| self.contains(*day))
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Days {
    type Output = Days;

    fn bitor(self, rhs: Days) -> Days {
        Days(self.0 | rhs.0)
    }
}

impl FromStr for Days {
    type Err = ConfigError;

    /// Parses day names (`mon`, `tuesday`, ...), the sets `all`, `weekdays`
    /// and `weekend`, or a comma separated combination of those.
    fn from_str(days: &str) -> Result<Days, ConfigError> {
        let result = match days.trim().to_lowercase().as_str() {
            "sun" | "sunday" => Days::SUNDAY,
            "mon" | "monday" => Days::MONDAY,
            "tue" | "tuesday" => Days::TUESDAY,
            "wed" | "wednesday" => Days::WEDNESDAY,
            "thu" | "thursday" => Days::THURSDAY,
            "fri" | "friday" => Days::FRIDAY,
            "sat" | "saturday" => Days::SATURDAY,
            "all" | "daily" => Days::ALL,
            "weekdays" => Days::WEEKDAYS,
            "weekend" => Days::WEEKEND,
            composite if composite.contains(',') => composite
                .split(',')
                .map(str::parse::<Days>)
                .try_fold(Days::NONE, |acc, day| day.map(|day| acc | day))?,
            _ => return Err(ConfigError::InvalidDays(days.to_string())),
        };

        trace!("Days '{}' parsed to bitmask: {:#04x}", days, result.0);
        Ok(result)
    }
}

impl fmt::Display for Days {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];
        let names: Vec<&str> = self.iter().map(|day| NAMES[day as usize]).collect();
        write!(f, "{}", names.join(","))
    }
}

/// Parses a time of day written as `HH:MM` or `HH:MM:SS`
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, ConfigError> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map_err(|_| ConfigError::InvalidTime(value.to_string()))
}

/// One entry of a schedule: a group switched on and/or off on some weekdays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleElementSpec {
    /// Element name, the key used when a child schedule overrides it
    pub name: String,
    /// Lighting group the element controls
    pub group: String,
    pub days: Days,
    pub on_time: Option<NaiveTime>,
    pub off_time: Option<NaiveTime>,
    /// Length of the brightness ramp for the "on" event, 0 = switch instantly
    pub ramp_minutes: u32,
    /// Brightness for the "on" event (1-254)
    pub brightness: Option<u8>,
    /// Color temperature for the "on" event in mireds (153-500)
    pub color_temperature: Option<u16>,
}

impl ScheduleElementSpec {
    pub fn new(name: impl Into<String>, group: impl Into<String>, days: Days) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            days,
            on_time: None,
            off_time: None,
            ramp_minutes: 0,
            brightness: None,
            color_temperature: None,
        }
    }

    pub fn on_at(mut self, time: NaiveTime) -> Self {
        self.on_time = Some(time);
        self
    }

    pub fn off_at(mut self, time: NaiveTime) -> Self {
        self.off_time = Some(time);
        self
    }

    pub fn ramp(mut self, minutes: u32) -> Self {
        self.ramp_minutes = minutes;
        self
    }

    pub fn brightness(mut self, brightness: u8) -> Self {
        self.brightness = Some(brightness);
        self
    }

    pub fn color_temperature(mut self, mireds: u16) -> Self {
        self.color_temperature = Some(mireds);
        self
    }
}

/// A named schedule, optionally inheriting the elements of a parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSpec {
    pub name: String,
    pub inherits: Option<String>,
    pub elements: Vec<ScheduleElementSpec>,
}

impl ScheduleSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inherits: None,
            elements: Vec::new(),
        }
    }

    pub fn inherits(mut self, parent: impl Into<String>) -> Self {
        self.inherits = Some(parent.into());
        self
    }

    pub fn element(mut self, element: ScheduleElementSpec) -> Self {
        self.elements.push(element);
        self
    }
}
