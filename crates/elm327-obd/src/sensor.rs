//! OBD-II Sensor Registry and Decoding
//!
//! Mode 01 sensors known to the client, their reply lengths and the pure
//! functions turning a hex payload into a value. The table is fixed at
//! compile time and never mutated.

use crate::error::ObdError;
use serde::{Deserialize, Serialize};

/// Decoding rule for a sensor payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decoder {
    /// Supported-PID bitmap: 4 bits per hex digit, MSB first
    Bitstring,
    /// PID 0x01 monitor status layout
    MonitorStatus,
    /// Raw hex text, not interpreted
    Passthrough,
    /// A * 100 / 255 (%)
    PercentScale,
    /// Engine coolant / intake air temperature in °F
    Temp,
    /// (A - 128) * 100 / 128 (%)
    FuelTrimPercent,
    /// A / 0.14504
    IntakeManifoldPressure,
    /// ((A*256)+B) / 4
    Rpm,
    /// km/h converted to MPH
    Speed,
    /// (A - 128) / 2 (degrees)
    TimingAdvance,
    /// MAF in lb/min
    Maf,
    /// A * 100 / 255 (%)
    ThrottlePosition,
    /// seconds to minutes
    SecToMin,
}

/// State of one readiness monitor reported in PID 0x01
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestState {
    /// Test not supported by the ECU
    Unsupported,
    /// Supported and completed
    Complete,
    /// Supported, not completed yet
    Incomplete,
}

impl TestState {
    fn from_code(code: u8) -> Self {
        match code {
            1 => TestState::Complete,
            3 => TestState::Incomplete,
            _ => TestState::Unsupported,
        }
    }

    /// Human readable label
    pub fn label(&self) -> &'static str {
        match self {
            TestState::Unsupported => "Unsupported",
            TestState::Complete => "Supported - Completed",
            TestState::Incomplete => "Supported - Incompleted",
        }
    }
}

/// Decoded PID 0x01 payload (monitor status since DTCs cleared)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStatus {
    /// Number of stored trouble codes (low 7 bits of byte A)
    pub dtc_count: u8,
    /// Malfunction indicator lamp on (bit 7 of byte A)
    pub mil: bool,
    /// Misfire, fuel system and component monitors (byte B)
    pub continuous: [TestState; 3],
    /// Non-continuous monitors (bytes C and D, bits 0-6)
    pub non_continuous: [TestState; 7],
    /// Bit 7 of byte D
    pub egr_system: TestState,
}

impl MonitorStatus {
    fn decode(code: &str) -> Result<Self, ObdError> {
        let byte = |i: usize| -> Result<u8, ObdError> {
            let pair = code
                .get(i * 2..i * 2 + 2)
                .ok_or_else(|| ObdError::MalformedResponse(format!("status {code:?} too short")))?;
            parse_hex(pair).map(|v| v as u8)
        };
        let (a, b, c, d) = (byte(0)?, byte(1)?, byte(2)?, byte(3)?);

        let mut continuous = [TestState::Unsupported; 3];
        for (i, state) in continuous.iter_mut().enumerate() {
            *state = TestState::from_code(((b >> i) & 0x01) + ((b >> (3 + i)) & 0x02));
        }

        let mut non_continuous = [TestState::Unsupported; 7];
        for (i, state) in non_continuous.iter_mut().enumerate() {
            *state = TestState::from_code(((c >> i) & 0x01) + (((d >> i) & 0x01) << 1));
        }

        Ok(Self {
            dtc_count: a & 0x7F,
            mil: a & 0x80 != 0,
            continuous,
            non_continuous,
            egr_system: TestState::from_code((d >> 7) & 0x01),
        })
    }

    /// Flattened text view: DTC count, MIL, then every monitor state
    pub fn summary(&self) -> Vec<String> {
        let mut out = vec![
            self.dtc_count.to_string(),
            if self.mil { "On" } else { "Off" }.to_string(),
        ];
        out.extend(
            self.continuous
                .iter()
                .chain(self.non_continuous.iter())
                .chain(std::iter::once(&self.egr_system))
                .map(|s| s.label().to_string()),
        );
        out
    }
}

/// A decoded sensor value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SensorValue {
    /// Result of a truncating integer formula
    Integer(i64),
    /// Result of a floating point formula
    Float(f64),
    /// Bitmap rendered as '0'/'1' characters
    Bits(String),
    /// PID 0x01 monitor status
    Status(MonitorStatus),
    /// Uninterpreted hex payload
    Raw(String),
    /// Vehicle does not provide this sensor
    NoData,
}

impl SensorValue {
    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SensorValue::Integer(v) => Some(*v as f64),
            SensorValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

/// A Mode 01 sensor definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sensor {
    /// Short identifier (`rpm`, `temp`, ...)
    pub short_name: &'static str,
    /// Display name
    pub name: &'static str,
    /// PID
    pub id: u8,
    /// Number of payload bytes in the reply
    pub length: usize,
    /// Decoding rule
    pub decoder: Decoder,
    /// Display unit
    pub unit: &'static str,
}

impl Sensor {
    const fn new(
        short_name: &'static str,
        name: &'static str,
        id: u8,
        length: usize,
        decoder: Decoder,
        unit: &'static str,
    ) -> Self {
        Self {
            short_name,
            name,
            id,
            length,
            decoder,
            unit,
        }
    }

    /// Mode 01 request for this sensor (`010C`)
    pub fn command(&self) -> String {
        format!("01{:02X}", self.id)
    }

    /// Decode a hex payload
    pub fn decode(&self, code: &str) -> Result<SensorValue, ObdError> {
        self.decoder.apply(code)
    }
}

fn parse_hex(code: &str) -> Result<i64, ObdError> {
    if code.is_empty() || code.len() > 15 || !code.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ObdError::MalformedResponse(format!("invalid hex value {code:?}")));
    }
    i64::from_str_radix(code, 16)
        .map_err(|_| ObdError::MalformedResponse(format!("invalid hex value {code:?}")))
}

/// Expand each hex digit into 4 '0'/'1' characters, most significant bit first
pub fn hex_to_bitstring(code: &str) -> Result<String, ObdError> {
    code.chars()
        .map(|c| {
            c.to_digit(16)
                .map(|v| format!("{v:04b}"))
                .ok_or_else(|| ObdError::MalformedResponse(format!("invalid hex digit {c:?}")))
        })
        .collect()
}

impl Decoder {
    /// Apply the rule to a hex payload
    pub fn apply(&self, code: &str) -> Result<SensorValue, ObdError> {
        let value = || parse_hex(code);

        // Integer rules use floor division.
        Ok(match self {
            Decoder::Bitstring => SensorValue::Bits(hex_to_bitstring(code)?),
            Decoder::MonitorStatus => SensorValue::Status(MonitorStatus::decode(code)?),
            Decoder::Passthrough => SensorValue::Raw(code.to_string()),
            Decoder::PercentScale | Decoder::ThrottlePosition => {
                SensorValue::Float(value()? as f64 * 100.0 / 255.0)
            }
            Decoder::Temp => SensorValue::Integer(32 + (9 * (value()? - 40)).div_euclid(5)),
            Decoder::FuelTrimPercent => {
                SensorValue::Integer(((value()? - 128) * 100).div_euclid(128))
            }
            Decoder::IntakeManifoldPressure => SensorValue::Float(value()? as f64 / 0.14504),
            Decoder::Rpm => SensorValue::Integer(value()? / 4),
            Decoder::Speed => SensorValue::Float(value()? as f64 / 1.609),
            Decoder::TimingAdvance => SensorValue::Float((value()? - 128) as f64 / 2.0),
            Decoder::Maf => SensorValue::Float(value()? as f64 * 0.00132276),
            Decoder::SecToMin => SensorValue::Integer(value()? / 60),
        })
    }
}

/// Every sensor the client knows, in PID order
pub static SENSORS: &[Sensor] = &[
    Sensor::new("pids_00", "Supported PIDs [1-32]", 0x00, 4, Decoder::Bitstring, ""),
    Sensor::new("dtc_status", "S-S DTC Cleared", 0x01, 4, Decoder::MonitorStatus, ""),
    Sensor::new("dtc_ff", "DTC C-F-F", 0x02, 2, Decoder::Passthrough, ""),
    Sensor::new("fuel_status", "Fuel System Stat", 0x03, 2, Decoder::Passthrough, ""),
    Sensor::new("load", "Calc Load Value", 0x04, 1, Decoder::PercentScale, ""),
    Sensor::new("temp", "Coolant Temp", 0x05, 1, Decoder::Temp, "F"),
    Sensor::new("short_term_fuel_trim_1", "S-T Fuel Trim", 0x06, 1, Decoder::FuelTrimPercent, "%"),
    Sensor::new("long_term_fuel_trim_1", "L-T Fuel Trim", 0x07, 1, Decoder::FuelTrimPercent, "%"),
    Sensor::new("short_term_fuel_trim_2", "S-T Fuel Trim", 0x08, 1, Decoder::FuelTrimPercent, "%"),
    Sensor::new("long_term_fuel_trim_2", "L-T Fuel Trim", 0x09, 1, Decoder::FuelTrimPercent, "%"),
    Sensor::new("fuel_pressure", "FuelRail Pressure", 0x0A, 1, Decoder::Passthrough, ""),
    Sensor::new("manifold_pressure", "Intk Manifold", 0x0B, 1, Decoder::IntakeManifoldPressure, "psi"),
    Sensor::new("rpm", "Engine RPM", 0x0C, 2, Decoder::Rpm, ""),
    Sensor::new("speed", "Vehicle Speed", 0x0D, 1, Decoder::Speed, "MPH"),
    Sensor::new("timing_advance", "Timing Advance", 0x0E, 1, Decoder::TimingAdvance, "degrees"),
    Sensor::new("intake_air_temp", "Intake Air Temp", 0x0F, 1, Decoder::Temp, "F"),
    Sensor::new("maf", "AirFlow Rate(MAF)", 0x10, 2, Decoder::Maf, "lb/min"),
    Sensor::new("throttle_pos", "Throttle Position", 0x11, 1, Decoder::ThrottlePosition, "%"),
    Sensor::new("secondary_air_status", "2nd Air Status", 0x12, 1, Decoder::Passthrough, ""),
    Sensor::new("o2_sensor_positions", "Loc of O2 sensors", 0x13, 1, Decoder::Passthrough, ""),
    Sensor::new("o211", "O2 Sensor: 1 - 1", 0x14, 2, Decoder::FuelTrimPercent, "%"),
    Sensor::new("o212", "O2 Sensor: 1 - 2", 0x15, 2, Decoder::FuelTrimPercent, "%"),
    Sensor::new("o213", "O2 Sensor: 1 - 3", 0x16, 2, Decoder::FuelTrimPercent, "%"),
    Sensor::new("o214", "O2 Sensor: 1 - 4", 0x17, 2, Decoder::FuelTrimPercent, "%"),
    Sensor::new("o221", "O2 Sensor: 2 - 1", 0x18, 2, Decoder::FuelTrimPercent, "%"),
    Sensor::new("o222", "O2 Sensor: 2 - 2", 0x19, 2, Decoder::FuelTrimPercent, "%"),
    Sensor::new("o223", "O2 Sensor: 2 - 3", 0x1A, 2, Decoder::FuelTrimPercent, "%"),
    Sensor::new("o224", "O2 Sensor: 2 - 4", 0x1B, 2, Decoder::FuelTrimPercent, "%"),
    Sensor::new("obd_standard", "OBD Designation", 0x1C, 1, Decoder::Passthrough, ""),
    Sensor::new("o2_sensor_position_b", "Loc of O2 sensor", 0x1D, 1, Decoder::Passthrough, ""),
    Sensor::new("aux_input", "Aux input status", 0x1E, 1, Decoder::Passthrough, ""),
    Sensor::new("engine_time", "Engine Start MIN", 0x1F, 2, Decoder::SecToMin, "min"),
    Sensor::new("pids_20", "Supported PIDs [33-64]", 0x20, 4, Decoder::Bitstring, ""),
    Sensor::new("fuel_level", "Fuel tank level input", 0x2F, 1, Decoder::PercentScale, "%"),
    Sensor::new("pids_40", "Supported PIDs [65-96]", 0x40, 4, Decoder::Bitstring, ""),
    Sensor::new("engine_mil_time", "Engine Run MIL", 0x4D, 2, Decoder::SecToMin, "min"),
    Sensor::new("pids_60", "Supported PIDs [97-128]", 0x60, 4, Decoder::Bitstring, ""),
    Sensor::new("pids_80", "Supported PIDs [129-160]", 0x80, 4, Decoder::Bitstring, ""),
];

/// Look up a sensor by PID
pub fn get_sensor(id: u8) -> Option<&'static Sensor> {
    SENSORS.iter().find(|sensor| sensor.id == id)
}

/// Display names of all sensors, in table order
pub fn sensor_names() -> impl Iterator<Item = &'static str> {
    SENSORS.iter().map(|sensor| sensor.name)
}

/// A decoded reading, ready for display or logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    /// PID that was queried
    pub pid: u8,
    /// Sensor display name
    pub name: String,
    /// Decoded value
    pub value: SensorValue,
    /// Display unit
    pub unit: String,
    /// Timestamp when the reply was received (Unix ms)
    pub timestamp_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn decode(id: u8, code: &str) -> SensorValue {
        get_sensor(id).unwrap().decode(code).unwrap()
    }

    #[test]
    fn test_sensor_ids_unique() {
        let ids: HashSet<u8> = SENSORS.iter().map(|s| s.id).collect();
        assert_eq!(ids.len(), SENSORS.len());
    }

    #[test]
    fn test_unknown_sensor() {
        assert!(get_sensor(0x21).is_none());
        assert!(get_sensor(0xFF).is_none());
        assert_eq!(get_sensor(0x0C).unwrap().command(), "010C");
    }

    #[test]
    fn test_temp_decode() {
        // 0x28 = 40 => 0 °C => 32 °F
        assert_eq!(decode(0x05, "28"), SensorValue::Integer(32));
        // 0x73 = 115 => 75 °C => 167 °F
        assert_eq!(decode(0x05, "73"), SensorValue::Integer(167));
        // 0x27 = 39 => -1 °C, -9/5 floors to -2
        assert_eq!(decode(0x0F, "27"), SensorValue::Integer(30));
    }

    #[test]
    fn test_rpm_decode() {
        // 0x1AF8 = 6904 => 1726 (integer division)
        assert_eq!(decode(0x0C, "1AF8"), SensorValue::Integer(1726));
        assert_eq!(decode(0x0C, "1AFB"), SensorValue::Integer(1726));
    }

    #[test]
    fn test_fuel_trim_decode() {
        assert_eq!(decode(0x06, "80"), SensorValue::Integer(0));
        // (144-128)*100/128 = 12.5 truncates to 12
        assert_eq!(decode(0x06, "90"), SensorValue::Integer(12));
        // (127-128)*100/128 floors to -1
        assert_eq!(decode(0x07, "7F"), SensorValue::Integer(-1));
    }

    #[test]
    fn test_float_decoders() {
        let speed = decode(0x0D, "55").as_f64().unwrap();
        assert!((speed - 85.0 / 1.609).abs() < 1e-9);

        let maf = decode(0x10, "0100").as_f64().unwrap();
        assert!((maf - 256.0 * 0.00132276).abs() < 1e-9);

        let load = decode(0x04, "FF").as_f64().unwrap();
        assert!((load - 100.0).abs() < 1e-9);

        assert_eq!(decode(0x0E, "81"), SensorValue::Float(0.5));

        let pressure = decode(0x0B, "64").as_f64().unwrap();
        assert!((pressure - 100.0 / 0.14504).abs() < 1e-9);
    }

    #[test]
    fn test_sec_to_min() {
        assert_eq!(decode(0x1F, "0077"), SensorValue::Integer(1));
        assert_eq!(decode(0x4D, "0E10"), SensorValue::Integer(60));
    }

    #[test]
    fn test_hex_to_bitstring() {
        assert_eq!(hex_to_bitstring("BE1F").unwrap(), "1011111000011111");
        assert_eq!(hex_to_bitstring("0").unwrap(), "0000");
        assert_eq!(hex_to_bitstring("").unwrap(), "");
        assert!(hex_to_bitstring("0X").is_err());

        let bits = hex_to_bitstring("0123456789abcdef").unwrap();
        assert_eq!(bits.len(), 64);
        assert!(bits.chars().all(|c| c == '0' || c == '1'));
        assert_eq!(&bits[60..], "1111");
    }

    #[test]
    fn test_monitor_status_decode() {
        // A=0x83: MIL on, 3 codes. B=0x07: three supported monitors, all done.
        let SensorValue::Status(status) = decode(0x01, "8307E500") else {
            panic!("expected status");
        };
        assert_eq!(status.dtc_count, 3);
        assert!(status.mil);
        assert_eq!(status.continuous, [TestState::Complete; 3]);
        assert_eq!(status.non_continuous[0], TestState::Complete);
        assert_eq!(status.non_continuous[1], TestState::Unsupported);
        assert_eq!(status.egr_system, TestState::Unsupported);

        let summary = status.summary();
        assert_eq!(summary.len(), 13);
        assert_eq!(summary[0], "3");
        assert_eq!(summary[1], "On");
    }

    #[test]
    fn test_monitor_status_incomplete() {
        // B=0x11: misfire supported (bit 0) and incomplete (bit 4)
        let SensorValue::Status(status) = decode(0x01, "00110101") else {
            panic!("expected status");
        };
        assert!(!status.mil);
        assert_eq!(status.continuous[0], TestState::Incomplete);
        assert_eq!(status.non_continuous[0], TestState::Incomplete);
    }

    #[test]
    fn test_invalid_payload() {
        assert!(matches!(
            get_sensor(0x0C).unwrap().decode("ZZZZ"),
            Err(ObdError::MalformedResponse(_))
        ));
        assert!(get_sensor(0x01).unwrap().decode("83").is_err());
    }

    #[test]
    fn test_sensor_names() {
        assert_eq!(sensor_names().count(), SENSORS.len());
        assert_eq!(sensor_names().next(), Some("Supported PIDs [1-32]"));
    }
}
