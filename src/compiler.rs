//! Schedule compilation.
//!
//! [`compile`] turns declarative [`ScheduleSpec`]s into one [`WeeklyQueue`]
//! per schedule:
//!
//! 1. resolve inheritance (child elements replace parent elements by name),
//! 2. validate every resolved element against the lighting groups,
//! 3. expand each element into one event per weekday and on/off time,
//! 4. order the events by weekly offset, keeping declaration order on ties.
//!
//! A schedule that fails any step is reported in [`Compilation::failures`]
//! and left out; the other schedules still compile.

use chrono::{NaiveTime, Timelike};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, instrument, warn};

use crate::clock::SECONDS_PER_DAY;
use crate::command::{Command, LightState, MAX_BRIGHTNESS, MAX_MIREDS, MIN_BRIGHTNESS, MIN_MIREDS};
use crate::queue::{CompiledEvent, WeeklyQueue};
use crate::schedule::{ScheduleElementSpec, ScheduleSpec};
use crate::ConfigError;

/// Result of compiling a set of schedules
#[derive(Debug, Default)]
pub struct Compilation {
    pub queues: BTreeMap<String, WeeklyQueue>,
    pub failures: BTreeMap<String, ConfigError>,
}

/// Compiles every schedule in `specs` against `groups`
#[instrument(skip_all, fields(schedules = specs.len(), groups = groups.len()))]
pub fn compile(
    specs: &HashMap<String, ScheduleSpec>,
    groups: &HashMap<String, BTreeSet<String>>,
) -> Compilation {
    let mut compilation = Compilation::default();

    for name in specs.keys() {
        match compile_schedule(name, specs, groups) {
            Ok(queue) => {
                debug!(schedule = %name, events = queue.events().len(), "Compiled schedule");
                compilation.queues.insert(name.clone(), queue);
            }
            Err(e) => {
                warn!(schedule = %name, "Schedule excluded: {}", e);
                compilation.failures.insert(name.clone(), e);
            }
        }
    }

    info!(
        compiled = compilation.queues.len(),
        failed = compilation.failures.len(),
        "Schedule compilation finished"
    );
    compilation
}

fn compile_schedule(
    name: &str,
    specs: &HashMap<String, ScheduleSpec>,
    groups: &HashMap<String, BTreeSet<String>>,
) -> Result<WeeklyQueue, ConfigError> {
    let elements = resolve_inheritance(name, specs)?;

    let mut events = Vec::new();
    for element in &elements {
        let targets = validate_element(name, element, groups)?;
        expand_element(element, targets, &mut events);
    }

    Ok(WeeklyQueue::new(name, events))
}

/// Resolves the effective element list of schedule `name`.
///
/// The parent chain is walked up to its root; elements are then applied from
/// the root down, each child element replacing the inherited element with the
/// same name in place, or appending when the name is new.
pub fn resolve_inheritance(
    name: &str,
    specs: &HashMap<String, ScheduleSpec>,
) -> Result<Vec<ScheduleElementSpec>, ConfigError> {
    let mut spec = specs.get(name).ok_or_else(|| ConfigError::MissingParent {
        schedule: name.to_string(),
        parent: name.to_string(),
    })?;

    let mut chain = vec![spec];
    let mut keys = vec![name];
    let mut visited = HashSet::from([name]);
    while let Some(parent) = &spec.inherits {
        if !visited.insert(parent.as_str()) {
            let mut names: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
            names.push(parent.clone());
            return Err(ConfigError::CyclicInheritance {
                schedule: name.to_string(),
                chain: names,
            });
        }
        spec = specs.get(parent).ok_or_else(|| ConfigError::MissingParent {
            schedule: name.to_string(),
            parent: parent.clone(),
        })?;
        chain.push(spec);
        keys.push(parent.as_str());
    }

    let mut elements: Vec<ScheduleElementSpec> = Vec::new();
    for spec in chain.iter().rev() {
        for element in &spec.elements {
            match elements.iter_mut().find(|e| e.name == element.name) {
                Some(inherited) => *inherited = element.clone(),
                None => elements.push(element.clone()),
            }
        }
    }
    Ok(elements)
}

fn validate_element<'g>(
    schedule: &str,
    element: &ScheduleElementSpec,
    groups: &'g HashMap<String, BTreeSet<String>>,
) -> Result<&'g BTreeSet<String>, ConfigError> {
    let targets = groups
        .get(&element.group)
        .ok_or_else(|| ConfigError::UnknownGroup {
            schedule: schedule.to_string(),
            element: element.name.clone(),
            group: element.group.clone(),
        })?;

    if element.days.is_empty() {
        return Err(ConfigError::EmptyDays {
            schedule: schedule.to_string(),
            element: element.name.clone(),
        });
    }
    if element.on_time.is_none() && element.off_time.is_none() {
        return Err(ConfigError::MissingTimes {
            schedule: schedule.to_string(),
            element: element.name.clone(),
        });
    }
    if element.ramp_minutes > 0 && element.on_time.is_none() {
        return Err(ConfigError::RampWithoutOn {
            schedule: schedule.to_string(),
            element: element.name.clone(),
        });
    }

    let out_of_range = |field, value: u32, min: u32, max: u32| ConfigError::ValueOutOfRange {
        schedule: schedule.to_string(),
        element: element.name.clone(),
        field,
        value,
        min,
        max,
    };
    if let Some(brightness) = element.brightness {
        if !(MIN_BRIGHTNESS..=MAX_BRIGHTNESS).contains(&brightness) {
            return Err(out_of_range(
                "brightness",
                brightness as u32,
                MIN_BRIGHTNESS as u32,
                MAX_BRIGHTNESS as u32,
            ));
        }
    }
    if let Some(mireds) = element.color_temperature {
        if !(MIN_MIREDS..=MAX_MIREDS).contains(&mireds) {
            return Err(out_of_range(
                "color temperature",
                mireds as u32,
                MIN_MIREDS as u32,
                MAX_MIREDS as u32,
            ));
        }
    }

    Ok(targets)
}

fn expand_element(
    element: &ScheduleElementSpec,
    targets: &BTreeSet<String>,
    events: &mut Vec<CompiledEvent>,
) {
    for day in element.days.iter() {
        if let Some(on_time) = element.on_time {
            let mut command = Command {
                state: LightState::On,
                brightness: element.brightness,
                color_temperature: element.color_temperature,
                target_ids: targets.clone(),
                ramp_minutes: element.ramp_minutes,
                ..Command::default()
            };
            // The ramp owns the arc from 1 up to full brightness
            if element.ramp_minutes > 0 {
                command.brightness = Some(MAX_BRIGHTNESS);
            }
            events.push(CompiledEvent {
                week_offset: week_offset(day, on_time),
                label: format!("{} on", element.name),
                command,
            });
        }

        if let Some(off_time) = element.off_time {
            events.push(CompiledEvent {
                week_offset: week_offset(day, off_time),
                label: format!("{} off", element.name),
                command: Command {
                    state: LightState::Off,
                    target_ids: targets.clone(),
                    ..Command::default()
                },
            });
        }
    }
}

fn week_offset(day: u8, time: NaiveTime) -> u32 {
    day as u32 * SECONDS_PER_DAY + time.hour() * 3600 + time.minute() * 60 + time.second()
}
