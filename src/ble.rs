/*!
 # Bluetooth LE fixtures

 [`BleFixtures`] implements [`DeviceInterface`] for ELK-BLEDOM and similar
 Bluetooth LED strips. Fixtures are addressed by their MAC address (or
 platform peripheral id), exactly as they are listed in the lighting groups.
*/

use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use chrono::{Datelike, Timelike};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::command::{MAX_BRIGHTNESS, MIN_BRIGHTNESS};
use crate::device::{DeviceInterface, DeviceRequest};
use crate::{Error, Result};

const ELK_WRITE_UUID: Uuid = Uuid::from_u128(0x0000fff3_0000_1000_8000_00805f9b34fb);
const LEDBLE_WRITE_UUID: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

const MIN_COLOR_TEMP_K: u32 = 2700;
const MAX_COLOR_TEMP_K: u32 = 6500;

const WRITE_RETRIES: u8 = 3;
/// Pause between frames of one request to the same strip
const FRAME_DELAY: Duration = Duration::from_millis(15);

/// Supported LED controller families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    ElkBle,
    LedBle,
    Melk,
    ElkBulb,
    ElkLampl,
    Unknown,
}

impl DeviceType {
    pub fn from_local_name(name: &str) -> Self {
        if name.starts_with("ELK-BLE") {
            DeviceType::ElkBle
        } else if name.starts_with("LEDBLE") {
            DeviceType::LedBle
        } else if name.starts_with("MELK") {
            DeviceType::Melk
        } else if name.starts_with("ELK-BULB") {
            DeviceType::ElkBulb
        } else if name.starts_with("ELK-LAMPL") {
            DeviceType::ElkLampl
        } else {
            DeviceType::Unknown
        }
    }

    fn write_uuid(self) -> Uuid {
        match self {
            DeviceType::LedBle => LEDBLE_WRITE_UUID,
            _ => ELK_WRITE_UUID,
        }
    }

    fn power_frame(self, on: bool) -> [u8; 9] {
        match (self, on) {
            (DeviceType::ElkBle, true) => [0x7e, 0x00, 0x04, 0xf0, 0x00, 0x01, 0xff, 0x00, 0xef],
            (_, true) => [0x7e, 0x00, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0xef],
            (_, false) => [0x7e, 0x00, 0x04, 0x00, 0x00, 0x00, 0xff, 0x00, 0xef],
        }
    }

    /// Whether the controller keeps its own clock that should be synced
    fn has_clock(self) -> bool {
        matches!(
            self,
            DeviceType::ElkBle | DeviceType::ElkBulb | DeviceType::ElkLampl
        )
    }
}

/// Brightness frame; 1-254 is mapped onto the strip's 0-100 %
fn brightness_frame(brightness: u8) -> [u8; 9] {
    let percent = ((brightness as u32 * 100 + MAX_BRIGHTNESS as u32 / 2) / MAX_BRIGHTNESS as u32) as u8;
    [0x7e, 0x00, 0x01, percent.min(100), 0x00, 0x00, 0x00, 0x00, 0xef]
}

/// White-mode frame with the warm/cold split for a color temperature in mireds
fn color_temperature_frame(mireds: u16) -> [u8; 9] {
    let kelvin = (1_000_000 / mireds.max(1) as u32).clamp(MIN_COLOR_TEMP_K, MAX_COLOR_TEMP_K);
    let percent = ((kelvin - MIN_COLOR_TEMP_K) * 100 / (MAX_COLOR_TEMP_K - MIN_COLOR_TEMP_K)) as u8;
    let warm = percent;
    let cold = 100 - percent;
    [0x7e, 0x00, 0x05, 0x02, warm, cold, 0x00, 0x00, 0xef]
}

fn time_sync_frame() -> [u8; 9] {
    let now = chrono::Local::now();
    [
        0x7e,
        0x00,
        0x83,
        now.hour() as u8,
        now.minute() as u8,
        now.second() as u8,
        now.weekday().number_from_monday() as u8,
        0x00,
        0xef,
    ]
}

fn apply_delta(current: u8, delta: i16) -> u8 {
    (current as i16 + delta).clamp(MIN_BRIGHTNESS as i16, MAX_BRIGHTNESS as i16) as u8
}

/// Gets the default Bluetooth adapter
#[instrument(skip(manager))]
async fn get_central(manager: &Manager) -> Result<Adapter> {
    debug!("Getting default Bluetooth adapter");
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| {
            error!("No Bluetooth adapters found");
            Error::NoBluetoothAdapters
        })
}

/// One connected strip
struct Fixture {
    peripheral: Peripheral,
    write_characteristic: Characteristic,
    device_type: DeviceType,
    /// Last brightness sent, base for relative changes
    brightness: Mutex<u8>,
}

impl Fixture {
    /// Writes a frame, retrying a couple of times since BLE writes are flaky
    #[instrument(skip(self, frame), fields(device = ?self.device_type))]
    async fn write(&self, frame: &[u8]) -> Result<()> {
        let write_type = if self
            .write_characteristic
            .properties
            .contains(CharPropFlags::WRITE)
        {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            trace!("Sending BLE frame (attempt {}/{})", attempt, WRITE_RETRIES);
            match self
                .peripheral
                .write(&self.write_characteristic, frame, write_type)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if attempt < WRITE_RETRIES => {
                    warn!("Write failed (attempt {}/{}): {}", attempt, WRITE_RETRIES, e);
                    time::sleep(Duration::from_millis(300)).await;
                }
                Err(e) => {
                    error!("Write failed permanently: {}", e);
                    return Err(Error::Ble(e.to_string()));
                }
            }
        }
    }

    async fn apply(&self, request: &DeviceRequest) -> Result<()> {
        let mut frames: Vec<[u8; 9]> = Vec::with_capacity(3);

        if let Some(on) = request.on {
            frames.push(self.device_type.power_frame(on));
        }

        let brightness = {
            let mut current = self.brightness.lock();
            let target = match (request.brightness, request.brightness_delta) {
                (Some(brightness), _) => Some(brightness),
                (None, Some(delta)) => Some(apply_delta(*current, delta)),
                (None, None) => None,
            };
            if let Some(target) = target {
                *current = target;
            }
            target
        };
        if let Some(brightness) = brightness {
            frames.push(brightness_frame(brightness));
        }

        if let Some(mireds) = request.color_temperature {
            frames.push(color_temperature_frame(mireds));
        }

        for (i, frame) in frames.iter().enumerate() {
            if i > 0 {
                time::sleep(FRAME_DELAY).await;
            }
            self.write(frame).await?;
        }
        Ok(())
    }
}

/// Connected Bluetooth fixtures keyed by lower-case address
pub struct BleFixtures {
    fixtures: HashMap<String, Fixture>,
}

impl BleFixtures {
    /// Scans for every address in `addresses` and connects to all of them.
    /// Fails if any of them is not seen within `discovery_timeout`.
    #[instrument(skip(addresses), fields(count = addresses.len()))]
    pub async fn connect(addresses: &[String], discovery_timeout: Duration) -> Result<Self> {
        info!("Initializing BLE fixtures");
        let manager = Manager::new().await?;
        let central = get_central(&manager).await?;

        let wanted: HashSet<String> = addresses.iter().map(|a| a.to_lowercase()).collect();
        let mut found: HashMap<String, (Peripheral, DeviceType)> = HashMap::new();

        info!("Scanning for {} BLE fixtures...", wanted.len());
        central.start_scan(ScanFilter::default()).await?;
        let start_time = std::time::Instant::now();

        while start_time.elapsed() < discovery_timeout && found.len() < wanted.len() {
            for peripheral in central.peripherals().await? {
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                let candidates = [
                    peripheral.address().to_string().to_lowercase(),
                    peripheral.id().to_string().to_lowercase(),
                ];
                let Some(key) = candidates
                    .into_iter()
                    .find(|k| wanted.contains(k) && !found.contains_key(k))
                else {
                    continue;
                };

                let name = props.local_name.unwrap_or_default();
                let device_type = DeviceType::from_local_name(&name);
                if device_type == DeviceType::Unknown {
                    warn!("Fixture {} ('{}') is not a known type, using ELK framing", key, name);
                } else {
                    info!("Found fixture {} (type: {:?})", key, device_type);
                }
                found.insert(key, (peripheral, device_type));
            }

            if found.len() < wanted.len() {
                trace!("Still scanning ({} of {} found)", found.len(), wanted.len());
                time::sleep(Duration::from_millis(500)).await;
            }
        }
        central.stop_scan().await?;

        let mut missing: Vec<String> = wanted
            .iter()
            .filter(|k| !found.contains_key(*k))
            .cloned()
            .collect();
        if !missing.is_empty() {
            missing.sort();
            error!("Fixtures not found within {:?}: {:?}", discovery_timeout, missing);
            return Err(Error::NoCompatibleDevice(missing));
        }

        let mut fixtures = HashMap::with_capacity(found.len());
        for (key, (peripheral, device_type)) in found {
            debug!("Connecting to {}", key);
            if !peripheral.is_connected().await? {
                peripheral.connect().await?;
            }
            peripheral.discover_services().await?;

            let write_uuid = device_type.write_uuid();
            let write_characteristic = peripheral
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == write_uuid)
                .ok_or_else(|| Error::CharacteristicNotFound(write_uuid.to_string()))?;

            let fixture = Fixture {
                peripheral,
                write_characteristic,
                device_type,
                brightness: Mutex::new(MAX_BRIGHTNESS),
            };
            if device_type.has_clock() {
                debug!("Synchronizing clock of {}", key);
                fixture.write(&time_sync_frame()).await?;
            }
            fixtures.insert(key, fixture);
        }

        info!("Connected to {} BLE fixtures", fixtures.len());
        Ok(Self { fixtures })
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.fixtures.keys().map(String::as_str)
    }
}

#[async_trait]
impl DeviceInterface for BleFixtures {
    async fn send(&self, request: &DeviceRequest) -> Result<()> {
        let results = join_all(request.target_ids.iter().map(|id| async move {
            match self.fixtures.get(&id.to_lowercase()) {
                Some(fixture) => fixture.apply(request).await,
                None => Err(Error::Device(format!("fixture {id} is not connected"))),
            }
        }))
        .await;

        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|result| result.err().map(|e| e.to_string()))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Device(failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_device_families() {
        assert_eq!(DeviceType::from_local_name("ELK-BLEDOM"), DeviceType::ElkBle);
        assert_eq!(DeviceType::from_local_name("LEDBLE-1234"), DeviceType::LedBle);
        assert_eq!(DeviceType::from_local_name("ELK-BULB2"), DeviceType::ElkBulb);
        assert_eq!(DeviceType::from_local_name("Speaker"), DeviceType::Unknown);
        assert_eq!(DeviceType::LedBle.write_uuid(), LEDBLE_WRITE_UUID);
        assert_eq!(DeviceType::Melk.write_uuid(), ELK_WRITE_UUID);
    }

    #[test]
    fn brightness_maps_to_percent() {
        assert_eq!(brightness_frame(254)[3], 100);
        assert_eq!(brightness_frame(127)[3], 50);
        assert_eq!(brightness_frame(1)[3], 0);
    }

    #[test]
    fn color_temperature_splits_warm_and_cold() {
        // 153 mireds ~ 6535K, clamped to the coolest end
        let cool = color_temperature_frame(153);
        assert_eq!((cool[4], cool[5]), (100, 0));
        // 500 mireds = 2000K, clamped to the warmest end
        let warm = color_temperature_frame(500);
        assert_eq!((warm[4], warm[5]), (0, 100));
    }

    #[test]
    fn deltas_stay_in_range() {
        assert_eq!(apply_delta(250, 10), MAX_BRIGHTNESS);
        assert_eq!(apply_delta(5, -10), MIN_BRIGHTNESS);
        assert_eq!(apply_delta(100, -20), 80);
    }
}
