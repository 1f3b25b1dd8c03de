//! Weekly time positions and the clocks that produce them.
//!
//! A [`WeekTime`] is a week index plus the seconds elapsed since that week's
//! Sunday 00:00:00 (the *weekly offset*). Carrying the week index lets the
//! scheduler compute delays across the week boundary without modulo
//! arithmetic.

use chrono::{Datelike, NaiveDateTime, Timelike};
use std::fmt;

pub const SECONDS_PER_DAY: u32 = 86_400;
pub const SECONDS_PER_WEEK: u32 = 7 * SECONDS_PER_DAY;

/// Absolute position in time expressed as (week, weekly offset)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WeekTime {
    /// Week index, counted in whole weeks of Sundays
    pub week: i64,
    /// Seconds since Sunday 00:00:00 of `week`, always below [`SECONDS_PER_WEEK`]
    pub offset: u32,
}

impl WeekTime {
    pub fn new(week: i64, offset: u32) -> Self {
        Self::from_seconds(week * SECONDS_PER_WEEK as i64 + offset as i64)
    }

    pub fn from_seconds(seconds: i64) -> Self {
        let week_len = SECONDS_PER_WEEK as i64;
        Self {
            week: seconds.div_euclid(week_len),
            offset: seconds.rem_euclid(week_len) as u32,
        }
    }

    pub fn as_seconds(self) -> i64 {
        self.week * SECONDS_PER_WEEK as i64 + self.offset as i64
    }

    /// Converts a wall-clock date and time
    pub fn from_naive(datetime: NaiveDateTime) -> Self {
        let date = datetime.date();
        let day = date.weekday().num_days_from_sunday();
        let sunday = (date.num_days_from_ce() - day as i32) as i64;
        Self {
            week: sunday.div_euclid(7),
            offset: day * SECONDS_PER_DAY + datetime.time().num_seconds_from_midnight(),
        }
    }

    pub fn add_seconds(self, seconds: u64) -> Self {
        Self::from_seconds(self.as_seconds() + seconds as i64)
    }

    /// Seconds left until the next week starts
    pub fn seconds_until_week_end(self) -> u64 {
        (SECONDS_PER_WEEK - self.offset) as u64
    }
}

impl fmt::Display for WeekTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const DAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
        let day = (self.offset / SECONDS_PER_DAY) as usize;
        let secs = self.offset % SECONDS_PER_DAY;
        write!(
            f,
            "week {} {} {:02}:{:02}:{:02}",
            self.week,
            DAYS[day],
            secs / 3600,
            secs % 3600 / 60,
            secs % 60
        )
    }
}

/// Source of the current [`WeekTime`]
pub trait Clock: Send + Sync {
    fn now(&self) -> WeekTime;
}

/// Local wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> WeekTime {
        WeekTime::from_naive(chrono::Local::now().naive_local())
    }
}

/// Clock that starts at a fixed position and advances with tokio's clock.
///
/// Under a paused runtime it advances only when the runtime auto-advances
/// time, which makes week-long schedules testable in milliseconds.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: WeekTime,
    started: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(origin: WeekTime) -> Self {
        Self {
            origin,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> WeekTime {
        self.origin.add_seconds(self.started.elapsed().as_secs())
    }
}
