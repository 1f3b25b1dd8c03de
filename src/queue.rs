/*!
 # Weekly event queues

 A [`WeeklyQueue`] holds the compiled events of one schedule in weekly-offset
 order and hands them out front to back. Each pass through the queue targets a
 specific week; once it is drained, [`WeeklyQueue::regenerate`] starts the next
 pass from the full event list.
*/

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

use crate::clock::WeekTime;
use crate::command::Command;

/// A command due at a fixed offset within the week
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledEvent {
    /// Seconds since Sunday 00:00:00, in `0..604800`
    pub week_offset: u32,
    pub label: String,
    pub command: Command,
}

/// Time-ordered queue of a schedule's events for the current pass
#[derive(Debug, Clone)]
pub struct WeeklyQueue {
    name: String,
    /// Full compiled event list, sorted by offset (stable)
    events: Vec<CompiledEvent>,
    /// Remaining events of the current pass
    pending: VecDeque<CompiledEvent>,
    /// Week the current pass belongs to
    week: i64,
}

impl WeeklyQueue {
    /// Creates a queue over `events`, sorting them by weekly offset while
    /// keeping declaration order for equal offsets.
    ///
    /// The initial pass holds every event for week 0; callers position the
    /// queue in real time with [`regenerate`](Self::regenerate).
    pub fn new(name: impl Into<String>, mut events: Vec<CompiledEvent>) -> Self {
        events.sort_by_key(|event| event.week_offset);
        Self {
            name: name.into(),
            pending: events.iter().cloned().collect(),
            events,
            week: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The full compiled event list
    pub fn events(&self) -> &[CompiledEvent] {
        &self.events
    }

    pub fn week(&self) -> i64 {
        self.week
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn peek(&self) -> Option<&CompiledEvent> {
        self.pending.front()
    }

    pub fn pop(&mut self) -> Option<CompiledEvent> {
        self.pending.pop_front()
    }

    /// Iterates the remaining events of the current pass
    pub fn iter(&self) -> impl Iterator<Item = &CompiledEvent> {
        self.pending.iter()
    }

    /// Absolute time at which the head event is due
    pub fn next_due(&self) -> Option<WeekTime> {
        self.peek()
            .map(|event| WeekTime::new(self.week, event.week_offset))
    }

    /// Pops the head event if it is due at or before `now`
    pub fn pop_due(&mut self, now: WeekTime) -> Option<CompiledEvent> {
        match self.next_due() {
            Some(due) if due <= now => self.pop(),
            _ => None,
        }
    }

    /// Rebuilds the current pass from the full event list.
    ///
    /// When nothing is left to run this week (the last event's offset is not
    /// after `now`), the whole list is queued for next week. Otherwise only the
    /// events strictly after `now` are kept for this week. Calling this twice
    /// at the same instant yields the same queue.
    pub fn regenerate(&mut self, now: WeekTime) {
        match self.events.last() {
            None => {
                self.pending.clear();
                self.week = now.week;
            }
            Some(last) if last.week_offset <= now.offset => {
                self.pending = self.events.iter().cloned().collect();
                self.week = now.week + 1;
            }
            Some(_) => {
                self.pending = self
                    .events
                    .iter()
                    .filter(|event| event.week_offset > now.offset)
                    .cloned()
                    .collect();
                self.week = now.week;
            }
        }

        debug!(
            schedule = %self.name,
            week = self.week,
            pending = self.pending.len(),
            "Regenerated weekly queue at {}",
            now
        );
    }

    /// Seconds from `now` until the head event is due, or until the next week
    /// boundary if the queue is empty
    pub fn seconds_until_next_run(&self, now: WeekTime) -> u64 {
        match self.next_due() {
            Some(due) => (due.as_seconds() - now.as_seconds()).max(0) as u64,
            None => now.seconds_until_week_end(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SECONDS_PER_WEEK;

    fn event(offset: u32, label: &str) -> CompiledEvent {
        CompiledEvent {
            week_offset: offset,
            label: label.to_string(),
            command: Command::on(["lamp"]),
        }
    }

    fn labels(queue: &WeeklyQueue) -> Vec<&str> {
        queue.iter().map(|event| event.label.as_str()).collect()
    }

    fn sample() -> WeeklyQueue {
        WeeklyQueue::new(
            "sample",
            vec![
                event(90_000, "mon"),
                event(3_600, "sun-b"),
                event(3_600, "sun-a"),
                event(500_000, "fri"),
            ],
        )
    }

    #[test]
    fn events_sorted_with_stable_ties() {
        let queue = sample();
        assert_eq!(labels(&queue), vec!["sun-b", "sun-a", "mon", "fri"]);
        let offsets: Vec<u32> = queue.events().iter().map(|e| e.week_offset).collect();
        assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn regenerate_keeps_only_future_events_of_this_week() {
        let mut queue = sample();
        queue.regenerate(WeekTime::new(5, 90_000));
        assert_eq!(labels(&queue), vec!["fri"]);
        assert_eq!(queue.week(), 5);
        assert_eq!(queue.seconds_until_next_run(WeekTime::new(5, 90_000)), 410_000);
    }

    #[test]
    fn regenerate_defers_everything_when_week_is_done() {
        let mut queue = sample();
        let now = WeekTime::new(5, 550_000);
        queue.regenerate(now);
        assert_eq!(labels(&queue), vec!["sun-b", "sun-a", "mon", "fri"]);
        assert_eq!(queue.week(), 6);
        assert!(queue.pop_due(now).is_none());
    }

    #[test]
    fn regenerate_is_idempotent_and_never_empty() {
        let mut queue = sample();
        for offset in [0, 3_599, 3_600, 90_001, 500_000, SECONDS_PER_WEEK - 1] {
            let now = WeekTime::new(2, offset);
            queue.regenerate(now);
            let first: Vec<CompiledEvent> = queue.iter().cloned().collect();
            let week = queue.week();
            queue.regenerate(now);
            assert_eq!(queue.iter().cloned().collect::<Vec<_>>(), first);
            assert_eq!(queue.week(), week);
            assert!(!queue.is_empty(), "empty after regenerate at {offset}");
        }
    }

    #[test]
    fn rollover_delay_lands_on_first_event_of_next_week() {
        let mut queue = sample();
        let now = WeekTime::new(7, SECONDS_PER_WEEK - 45);
        queue.regenerate(now);

        let delay = queue.seconds_until_next_run(now);
        assert_eq!(delay, 45 + 3_600);
        assert_eq!(now.add_seconds(delay), WeekTime::new(8, 3_600));
    }

    #[test]
    fn empty_schedule_waits_for_week_boundary() {
        let mut queue = WeeklyQueue::new("empty", Vec::new());
        let now = WeekTime::new(1, SECONDS_PER_WEEK - 10);
        queue.regenerate(now);
        assert!(queue.is_empty());
        assert_eq!(queue.seconds_until_next_run(now), 10);
    }

    #[test]
    fn pop_due_drains_overdue_events_in_order() {
        let mut queue = sample();
        queue.regenerate(WeekTime::new(1, 0));
        let late = WeekTime::new(1, 100_000);

        let mut fired = Vec::new();
        while let Some(event) = queue.pop_due(late) {
            fired.push(event.label);
        }
        assert_eq!(fired, vec!["sun-b", "sun-a", "mon"]);
        assert_eq!(labels(&queue), vec!["fri"]);
    }
}
