//! OBD-II Bus Protocol Definitions

use serde::{Deserialize, Serialize};

/// Bus protocols selectable on an ELM327 (`ATSP<n>` / `ATTP<n>`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObdProtocol {
    /// Automatic protocol detection
    #[default]
    Auto = 0x0,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm = 0x1,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw = 0x2,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141_2 = 0x3,
    /// ISO 14230-4 KWP (slow init, 10.4 kbaud)
    Iso14230_4Kwp = 0x4,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    Iso14230_4KwpFast = 0x5,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500 = 0x6,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500 = 0x7,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250 = 0x8,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250 = 0x9,
    /// SAE J1939 CAN (29 bit ID, 250 kbaud)
    SaeJ1939 = 0xA,
}

impl ObdProtocol {
    /// Protocols tried one by one when automatic detection fails
    pub const PROBE_ORDER: [ObdProtocol; 10] = [
        ObdProtocol::J1850Pwm,
        ObdProtocol::J1850Vpw,
        ObdProtocol::Iso9141_2,
        ObdProtocol::Iso14230_4Kwp,
        ObdProtocol::Iso14230_4KwpFast,
        ObdProtocol::Iso15765_4Can11bit500,
        ObdProtocol::Iso15765_4Can29bit500,
        ObdProtocol::Iso15765_4Can11bit250,
        ObdProtocol::Iso15765_4Can29bit250,
        ObdProtocol::SaeJ1939,
    ];

    /// Look up a protocol by its ELM327 id nibble
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x0 => Some(ObdProtocol::Auto),
            0xA => Some(ObdProtocol::SaeJ1939),
            1..=9 => Some(Self::PROBE_ORDER[(id - 1) as usize]),
            _ => None,
        }
    }

    /// ELM327 protocol id
    pub fn id(&self) -> u8 {
        *self as u8
    }

    /// `ATSP<n>`: select and persist this protocol
    pub fn select_command(&self) -> String {
        format!("ATSP{:X}", self.id())
    }

    /// `ATTP<n>`: try this protocol without persisting it
    pub fn try_command(&self) -> String {
        format!("ATTP{:X}", self.id())
    }

    /// Check if this is a CAN protocol
    pub fn is_can(&self) -> bool {
        matches!(
            self,
            ObdProtocol::Iso15765_4Can11bit500
                | ObdProtocol::Iso15765_4Can29bit500
                | ObdProtocol::Iso15765_4Can11bit250
                | ObdProtocol::Iso15765_4Can29bit250
                | ObdProtocol::SaeJ1939
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_order_is_ascending() {
        let ids: Vec<u8> = ObdProtocol::PROBE_ORDER.iter().map(|p| p.id()).collect();
        assert_eq!(ids, (1..=0xA).collect::<Vec<u8>>());
    }

    #[test]
    fn test_id_round_trip() {
        for id in 0..=0xA {
            assert_eq!(ObdProtocol::from_id(id).map(|p| p.id()), Some(id));
        }
        assert_eq!(ObdProtocol::from_id(0xB), None);
    }

    #[test]
    fn test_commands_use_hex_nibble() {
        assert_eq!(ObdProtocol::Auto.select_command(), "ATSP0");
        assert_eq!(ObdProtocol::SaeJ1939.try_command(), "ATTPA");
        assert!(ObdProtocol::Iso15765_4Can11bit500.is_can());
        assert!(!ObdProtocol::Iso9141_2.is_can());
    }
}
