//! Byte-stream transports to the adapter
//!
//! Supports:
//! - Serial ports (USB cables, `/dev/rfcomm*` bindings)
//! - Bluetooth RFCOMM sockets (Linux)

mod rfcomm;
mod serial;

pub use rfcomm::RfcommTransport;
pub use serial::SerialTransport;

use crate::config::ClientConfig;
use crate::error::ObdError;
use std::time::Duration;

/// Raw byte stream to an ELM327 adapter.
///
/// Implementations never retry; the client decides how often to call
/// [`connect`](Transport::connect).
#[allow(async_fn_in_trait)]
pub trait Transport: Send {
    /// Open the stream to `address`
    async fn connect(&mut self, address: &str) -> Result<(), ObdError>;

    /// Write all bytes
    async fn send(&mut self, data: &[u8]) -> Result<(), ObdError>;

    /// Read up to `max_len` bytes. May return fewer; an empty vector means
    /// the stream was closed by the peer.
    async fn recv(&mut self, max_len: usize) -> Result<Vec<u8>, ObdError>;

    /// Close the stream. Safe to call when already closed.
    async fn close(&mut self);

    /// Whether the stream is open
    fn is_connected(&self) -> bool;

    /// Text of the last connect or I/O failure
    fn last_error(&self) -> Option<&str>;

    /// List addresses this transport could connect to
    async fn discover(&mut self, _timeout: Duration) -> Result<Vec<String>, ObdError> {
        Ok(Vec::new())
    }
}

/// Check for a Bluetooth MAC address: six colon separated hex pairs
pub fn is_mac_address(address: &str) -> bool {
    parse_mac_address(address).is_some()
}

/// Parse `AA:BB:CC:DD:EE:FF` into bytes, most significant first
pub fn parse_mac_address(address: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = address.split(':');
    for byte in out.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    parts.next().is_none().then_some(out)
}

/// The transports the client can be built on
pub enum Link {
    /// Serial port
    Serial(SerialTransport),
    /// Bluetooth RFCOMM socket
    Bluetooth(RfcommTransport),
}

impl Link {
    /// Pick the transport matching an address: MAC addresses go over
    /// Bluetooth, anything else is treated as a serial device path.
    pub fn for_address(address: &str, config: &ClientConfig) -> Self {
        if is_mac_address(address) {
            Link::Bluetooth(RfcommTransport::new(
                config.bluetooth.channel,
                config.timeout(),
            ))
        } else {
            Link::Serial(SerialTransport::new(config.serial.clone(), config.timeout()))
        }
    }
}

impl Transport for Link {
    async fn connect(&mut self, address: &str) -> Result<(), ObdError> {
        match self {
            Link::Serial(t) => t.connect(address).await,
            Link::Bluetooth(t) => t.connect(address).await,
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ObdError> {
        match self {
            Link::Serial(t) => t.send(data).await,
            Link::Bluetooth(t) => t.send(data).await,
        }
    }

    async fn recv(&mut self, max_len: usize) -> Result<Vec<u8>, ObdError> {
        match self {
            Link::Serial(t) => t.recv(max_len).await,
            Link::Bluetooth(t) => t.recv(max_len).await,
        }
    }

    async fn close(&mut self) {
        match self {
            Link::Serial(t) => t.close().await,
            Link::Bluetooth(t) => t.close().await,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Link::Serial(t) => t.is_connected(),
            Link::Bluetooth(t) => t.is_connected(),
        }
    }

    fn last_error(&self) -> Option<&str> {
        match self {
            Link::Serial(t) => t.last_error(),
            Link::Bluetooth(t) => t.last_error(),
        }
    }

    async fn discover(&mut self, timeout: Duration) -> Result<Vec<String>, ObdError> {
        match self {
            Link::Serial(t) => t.discover(timeout).await,
            Link::Bluetooth(t) => t.discover(timeout).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_address_validation() {
        assert!(is_mac_address("00:1D:A5:68:98:8B"));
        assert!(is_mac_address("aa:bb:cc:dd:ee:ff"));
        assert!(!is_mac_address("/dev/ttyUSB0"));
        assert!(!is_mac_address("00:1D:A5:68:98"));
        assert!(!is_mac_address("00:1D:A5:68:98:8B:00"));
        assert!(!is_mac_address("00-1D-A5-68-98-8B"));
        assert!(!is_mac_address("0:1D:A5:68:98:8B"));
        assert!(!is_mac_address("00:1D:A5:68:98:8G"));
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac_address("AA:BB:CC:DD:EE:FF"),
            Some([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF])
        );
    }

    #[test]
    fn test_link_selection() {
        let config = ClientConfig::default();
        assert!(matches!(
            Link::for_address("00:1D:A5:68:98:8B", &config),
            Link::Bluetooth(_)
        ));
        assert!(matches!(
            Link::for_address("/dev/ttyUSB0", &config),
            Link::Serial(_)
        ));
    }
}
