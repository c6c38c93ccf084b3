//! Serial port transport

use super::Transport;
use crate::config::{Parity, SerialSettings};
use crate::error::ObdError;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{
    ClearBuffer, DataBits, SerialPort, SerialPortBuilderExt, SerialStream, StopBits,
};
use tracing::{debug, info, warn};

/// Serial link to an adapter (USB cable or bound `/dev/rfcomm*` device)
pub struct SerialTransport {
    settings: SerialSettings,
    timeout: Duration,
    port: Option<SerialStream>,
    port_name: Option<String>,
    error: Option<String>,
}

impl SerialTransport {
    /// Create a closed serial transport
    pub fn new(settings: SerialSettings, timeout: Duration) -> Self {
        Self {
            settings,
            timeout,
            port: None,
            port_name: None,
            error: None,
        }
    }

    /// Name of the open port
    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    fn data_bits(&self) -> DataBits {
        match self.settings.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        }
    }

    fn stop_bits(&self) -> StopBits {
        match self.settings.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        }
    }

    fn parity(&self) -> tokio_serial::Parity {
        match self.settings.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }

    fn record(&mut self, err: impl ToString) -> String {
        let msg = err.to_string();
        self.error = Some(msg.clone());
        msg
    }
}

impl Transport for SerialTransport {
    async fn connect(&mut self, address: &str) -> Result<(), ObdError> {
        debug!("Opening serial port {} at {} baud", address, self.settings.baud_rate);

        let opened = tokio_serial::new(address, self.settings.baud_rate)
            .data_bits(self.data_bits())
            .parity(self.parity())
            .stop_bits(self.stop_bits())
            .timeout(self.timeout)
            .open_native_async();

        match opened {
            Ok(port) => {
                info!("Serial port {} opened", address);
                self.port = Some(port);
                self.port_name = Some(address.to_string());
                self.error = None;
                Ok(())
            }
            Err(e) => {
                let msg = self.record(e);
                warn!("Failed to open {}: {}", address, msg);
                Err(ObdError::ConnectFailed(msg))
            }
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ObdError> {
        let port = self.port.as_mut().ok_or(ObdError::NotConnected)?;

        // Drop stale bytes in both directions before a new command
        let flushed = port.clear(ClearBuffer::All);
        if let Err(e) = flushed {
            let msg = self.record(e);
            return Err(ObdError::Transport(msg));
        }

        let written = async {
            port.write_all(data).await?;
            port.flush().await
        }
        .await;
        written.map_err(|e| ObdError::Transport(self.record(e)))
    }

    async fn recv(&mut self, max_len: usize) -> Result<Vec<u8>, ObdError> {
        let port = self.port.as_mut().ok_or(ObdError::NotConnected)?;
        let mut buf = vec![0u8; max_len];
        let read = port.read(&mut buf).await;
        match read {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) => Err(ObdError::Transport(self.record(e))),
        }
    }

    async fn close(&mut self) {
        if self.port.take().is_some() {
            info!("Closing serial port {}", self.port_name.as_deref().unwrap_or("?"));
        }
        self.port_name = None;
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    async fn discover(&mut self, _timeout: Duration) -> Result<Vec<String>, ObdError> {
        let ports = tokio_serial::available_ports().map_err(|e| ObdError::Transport(self.record(e)))?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_port_fails_to_connect() {
        let mut transport =
            SerialTransport::new(SerialSettings::default(), Duration::from_millis(100));
        let result = transport.connect("/dev/does-not-exist-obd").await;
        assert!(matches!(result, Err(ObdError::ConnectFailed(_))));
        assert!(!transport.is_connected());
        assert!(transport.last_error().is_some());
    }

    #[tokio::test]
    async fn test_io_requires_open_port() {
        let mut transport =
            SerialTransport::new(SerialSettings::default(), Duration::from_millis(100));
        assert!(matches!(transport.send(b"ATZ\r\n").await, Err(ObdError::NotConnected)));
        assert!(matches!(transport.recv(16).await, Err(ObdError::NotConnected)));
    }
}
