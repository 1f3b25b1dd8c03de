//! Configuration loading.
//!
//! The expected YAML structure is:
//! ```yaml
//! dispatch_interval_ms: 250
//! default_schedule: weekday
//! groups:
//!   bedroom: ["be:ef:00:00:00:01", "be:ef:00:00:00:02"]
//! schedules:
//!   weekday:
//!     elements:
//!       - name: Wake
//!         group: bedroom
//!         days: weekdays
//!         on: "06:30"
//!         off: "08:00"
//!         ramp_minutes: 15
//!   weekend:
//!     inherits: weekday
//!     elements:
//!       - name: Wake
//!         group: bedroom
//!         days: [0, 6]
//!         on: "09:00"
//! ```

use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::schedule::{parse_time_of_day, Days, ScheduleElementSpec, ScheduleSpec};
use crate::{ConfigError, Result};

const DEFAULT_DISPATCH_INTERVAL_MS: u64 = 250;

// ── YAML layout ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default = "default_dispatch_interval_ms")]
    dispatch_interval_ms: u64,
    default_schedule: Option<String>,
    #[serde(default)]
    groups: HashMap<String, Vec<String>>,
    #[serde(default)]
    schedules: HashMap<String, ScheduleEntry>,
}

fn default_dispatch_interval_ms() -> u64 {
    DEFAULT_DISPATCH_INTERVAL_MS
}

#[derive(Debug, Deserialize)]
struct ScheduleEntry {
    inherits: Option<String>,
    #[serde(default)]
    elements: Vec<ElementEntry>,
}

#[derive(Debug, Deserialize)]
struct ElementEntry {
    name: String,
    group: String,
    days: DaysEntry,
    on: Option<String>,
    off: Option<String>,
    #[serde(default)]
    ramp_minutes: u32,
    brightness: Option<u8>,
    color_temperature: Option<u16>,
}

/// Either `[1, 2, 3]` or a name such as `weekdays` / `mon,wed`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DaysEntry {
    Numbers(Vec<u8>),
    Names(String),
}

impl DaysEntry {
    fn resolve(&self) -> std::result::Result<Days, ConfigError> {
        match self {
            DaysEntry::Numbers(days) => Days::from_numbers(days.iter().copied()),
            DaysEntry::Names(names) => names.parse(),
        }
    }
}

impl ElementEntry {
    fn into_spec(self) -> std::result::Result<ScheduleElementSpec, ConfigError> {
        Ok(ScheduleElementSpec {
            days: self.days.resolve()?,
            on_time: self.on.as_deref().map(parse_time_of_day).transpose()?,
            off_time: self.off.as_deref().map(parse_time_of_day).transpose()?,
            ramp_minutes: self.ramp_minutes,
            brightness: self.brightness,
            color_temperature: self.color_temperature,
            name: self.name,
            group: self.group,
        })
    }
}

// ── Public configuration ─────────────────────────────────────────────────────

/// Everything the scheduling core needs at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub dispatch_interval_ms: u64,
    pub default_schedule: Option<String>,
    /// Group name → fixture ids
    pub groups: HashMap<String, BTreeSet<String>>,
    pub schedules: HashMap<String, ScheduleSpec>,
}

impl AppConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = serde_yaml::from_str(content)?;
        if file.dispatch_interval_ms == 0 {
            return Err(ConfigError::ZeroDispatchInterval.into());
        }

        let groups = file
            .groups
            .into_iter()
            .map(|(name, ids)| (name, ids.into_iter().collect()))
            .collect();

        let mut schedules = HashMap::with_capacity(file.schedules.len());
        for (name, entry) in file.schedules {
            let elements = entry
                .elements
                .into_iter()
                .map(ElementEntry::into_spec)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            debug!(schedule = %name, elements = elements.len(), "Parsed schedule");
            schedules.insert(
                name.clone(),
                ScheduleSpec {
                    name,
                    inherits: entry.inherits,
                    elements,
                },
            );
        }

        Ok(Self {
            dispatch_interval_ms: file.dispatch_interval_ms,
            default_schedule: file.default_schedule,
            groups,
            schedules,
        })
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    /// Every fixture id referenced by any group, sorted
    pub fn fixture_ids(&self) -> Vec<String> {
        let ids: BTreeSet<&String> = self.groups.values().flatten().collect();
        ids.into_iter().cloned().collect()
    }
}

/// Source of the startup configuration
pub trait ConfigProvider {
    fn load(&self) -> Result<AppConfig>;
}

/// Configuration read from a YAML file
#[derive(Debug, Clone)]
pub struct YamlConfigFile {
    path: PathBuf,
}

impl YamlConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigProvider for YamlConfigFile {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    fn load(&self) -> Result<AppConfig> {
        info!("Loading configuration");
        let content = std::fs::read_to_string(&self.path)?;
        let config = AppConfig::from_yaml_str(&content)?;
        info!(
            groups = config.groups.len(),
            schedules = config.schedules.len(),
            interval_ms = config.dispatch_interval_ms,
            "Configuration loaded"
        );
        Ok(config)
    }
}
