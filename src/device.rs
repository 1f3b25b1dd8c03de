/*!
 # Device interface

 The dispatcher talks to fixtures only through [`DeviceInterface`]. The real
 Bluetooth client lives in [`crate::ble`]; [`LogDevice`] appends every request
 to a file instead, which is handy for dry runs.
*/

use async_trait::async_trait;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::command::Command;
use crate::Result;

/// Everything a device needs to apply one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    pub target_ids: Vec<String>,
    /// `Some(true)` on, `Some(false)` off, `None` leave as is
    pub on: Option<bool>,
    /// Absolute brightness (0-254)
    pub brightness: Option<u8>,
    /// Color temperature in mireds
    pub color_temperature: Option<u16>,
    /// Relative brightness change
    pub brightness_delta: Option<i16>,
}

impl From<&Command> for DeviceRequest {
    fn from(command: &Command) -> Self {
        Self {
            target_ids: command.target_ids.iter().cloned().collect(),
            on: command.state.as_power(),
            brightness: command.brightness,
            color_temperature: command.color_temperature,
            brightness_delta: command.brightness_delta,
        }
    }
}

/// Sends requests to physical (or simulated) fixtures.
///
/// Implementations need not preserve ordering between concurrent calls; the
/// dispatcher serializes requests itself.
#[async_trait]
pub trait DeviceInterface: Send + Sync {
    async fn send(&self, request: &DeviceRequest) -> Result<()>;
}

/// Device stub that appends one line per request to a log file
pub struct LogDevice {
    file: Mutex<File>,
}

impl LogDevice {
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await?;
        debug!("Opened device log");
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn format(request: &DeviceRequest) -> String {
        let mut line = format!(
            "{} targets={}",
            chrono::Local::now().to_rfc3339(),
            request.target_ids.join(",")
        );
        if let Some(on) = request.on {
            line.push_str(if on { " power=on" } else { " power=off" });
        }
        if let Some(brightness) = request.brightness {
            line.push_str(&format!(" brightness={brightness}"));
        }
        if let Some(mireds) = request.color_temperature {
            line.push_str(&format!(" ct={mireds}"));
        }
        if let Some(delta) = request.brightness_delta {
            line.push_str(&format!(" delta={delta:+}"));
        }
        line.push('\n');
        line
    }
}

#[async_trait]
impl DeviceInterface for LogDevice {
    async fn send(&self, request: &DeviceRequest) -> Result<()> {
        let line = Self::format(request);
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
