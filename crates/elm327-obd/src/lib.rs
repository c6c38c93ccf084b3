//! ELM327 OBD-II Protocol Engine
//!
//! This crate drives ELM327-compatible OBD-II adapters over a serial port
//! or a Bluetooth RFCOMM socket: connection handshake, bus protocol
//! negotiation, reply framing, sensor decoding and trouble code reads.
//!
//! ```no_run
//! # async fn run() -> Result<(), elm327_obd::ObdError> {
//! use elm327_obd::{ClientConfig, ObdClient};
//!
//! let mut client = ObdClient::connect("/dev/ttyUSB0", ClientConfig::default()).await?;
//! if let Some(reading) = client.sensor(0x0C).await? {
//!     println!("{} = {:?}", reading.name, reading.value);
//! }
//! client.close(true).await;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod dtc;
mod error;
mod parser;
mod protocol;
mod sensor;
pub mod simulator;
pub mod transport;

pub use client::{CloseHandle, ObdClient, SessionState};
pub use config::{BluetoothSettings, ClientConfig, Parity, SerialSettings};
pub use dtc::{decode_dtc, frame_count, DtcCode, DtcStatus};
pub use error::ObdError;
pub use parser::{decode_hex_stream, encode_hex, Payload, Reply};
pub use protocol::ObdProtocol;
pub use sensor::{
    get_sensor, hex_to_bitstring, sensor_names, Decoder, MonitorStatus, Sensor, SensorReading,
    SensorValue, TestState, SENSORS,
};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Pending trouble codes
    pub const PENDING_DTC: u8 = 0x07;
}
