//! Client configuration

use crate::error::ObdError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Serial parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Serial line settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Baud rate (ELM327 factory default is 38400)
    pub baud_rate: u32,
    /// Data bits (5-8)
    pub data_bits: u8,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: Parity,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 38400,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

/// Bluetooth RFCOMM settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothSettings {
    /// RFCOMM channel of the adapter's serial port profile
    pub channel: u8,
}

impl Default for BluetoothSettings {
    fn default() -> Self {
        Self { channel: 1 }
    }
}

/// Configuration for [`ObdClient`](crate::ObdClient)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Transport open attempts before giving up
    pub connect_attempts: u32,
    /// Pause between open attempts in milliseconds
    pub retry_backoff_ms: u64,
    /// Upper bound for one command round trip in milliseconds
    pub timeout_ms: u64,
    /// Expected start of the `ATI` reply
    pub banner_prefix: String,
    /// Empty commands sent while waiting for monitor mode to stop
    pub monitor_stop_attempts: u32,
    /// Maximum bytes requested from the transport per read
    pub read_chunk: usize,
    /// Serial line settings
    pub serial: SerialSettings,
    /// Bluetooth settings
    pub bluetooth: BluetoothSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            retry_backoff_ms: 250,
            timeout_ms: 2000,
            banner_prefix: "ELM327".to_string(),
            monitor_stop_attempts: 10,
            read_chunk: 1024,
            serial: SerialSettings::default(),
            bluetooth: BluetoothSettings::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from an optional file, overridden by `OBD__*`
    /// environment variables (e.g. `OBD__TIMEOUT_MS=5000`,
    /// `OBD__SERIAL__BAUD_RATE=115200`).
    pub fn load(path: Option<&Path>) -> Result<Self, ObdError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("OBD")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: ClientConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the client cannot work with
    pub fn validate(&self) -> Result<(), ObdError> {
        if self.connect_attempts == 0 {
            return Err(ObdError::Config("connect_attempts must be at least 1".into()));
        }
        if self.timeout_ms == 0 {
            return Err(ObdError::Config("timeout_ms must be positive".into()));
        }
        if self.read_chunk == 0 {
            return Err(ObdError::Config("read_chunk must be positive".into()));
        }
        if !(5..=8).contains(&self.serial.data_bits) {
            return Err(ObdError::Config(format!(
                "unsupported data bits {}",
                self.serial.data_bits
            )));
        }
        if !(1..=2).contains(&self.serial.stop_bits) {
            return Err(ObdError::Config(format!(
                "unsupported stop bits {}",
                self.serial.stop_bits
            )));
        }
        Ok(())
    }

    /// Round trip timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Pause between open attempts
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
