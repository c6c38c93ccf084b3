//! OBD-II Client for ELM327 Adapters
//!
//! Drives the adapter through its connection handshake, negotiates the bus
//! protocol and exposes sensor, trouble code and monitor operations. One
//! command is in flight at a time: every call awaits the adapter's `>`
//! prompt before returning.

use crate::config::ClientConfig;
use crate::dtc::{decode_frame, frame_count, DtcCode, DtcStatus};
use crate::error::ObdError;
use crate::mode;
use crate::parser::{compact, decode_hex_stream, encode_hex, extract_arrayed, extract_payload};
use crate::parser::{Payload, Reply, PROMPT};
use crate::protocol::ObdProtocol;
use crate::sensor::{get_sensor, MonitorStatus, Sensor, SensorReading, SensorValue};
use crate::simulator::{Elm327Simulator, SimulatedEcu};
use crate::transport::{Link, Transport};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Query used to check whether the selected bus protocol reaches the vehicle
const CANARY: &str = "0100";

/// Reply fragments meaning the canary query did not reach an ECU
const CANARY_FAILURES: [&str; 3] = ["UNABLE TO CONNECT", "ERROR", "NO DATA"];

/// Connection state of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport open
    Disconnected,
    /// Opening the transport
    Opening,
    /// Waiting for the `ATZ` banner
    Resetting,
    /// Turning command echo off
    EchoDisable,
    /// Checking the firmware banner
    VersionQuery,
    /// Searching for a bus protocol the vehicle answers on
    ProtocolProbe,
    /// Ready for diagnostic commands
    Connected,
    /// Adapter is printing raw bus traffic
    Monitoring,
    /// A fatal error ended the session
    Error,
}

/// Closes a client session from another task.
///
/// An in-flight command returns [`ObdError::ConnectionLost`] promptly; an idle
/// client fails its next command the same way.
#[derive(Debug, Clone)]
pub struct CloseHandle(Arc<watch::Sender<bool>>);

impl CloseHandle {
    /// Request the session to close
    pub fn close(&self) {
        self.0.send_replace(true);
    }
}

/// OBD-II client for communicating with ELM327-compatible adapters
pub struct ObdClient<T: Transport = Link> {
    transport: T,
    config: ClientConfig,
    state: SessionState,
    protocol: ObdProtocol,
    version: Option<String>,
    echo_enabled: bool,
    headers_enabled: bool,
    monitor_filter: Option<String>,
    last_error: Option<ObdError>,
    /// Bytes received but not yet consumed by a reply
    recv_buf: Vec<u8>,
    close_tx: Arc<watch::Sender<bool>>,
    close_rx: watch::Receiver<bool>,
}

impl ObdClient<Link> {
    /// Open `address` and run the full initialisation handshake.
    ///
    /// Bluetooth MAC addresses connect over RFCOMM, anything else is opened
    /// as a serial device.
    pub async fn connect(address: &str, config: ClientConfig) -> Result<Self, ObdError> {
        config.validate()?;
        let transport = Link::for_address(address, &config);
        let mut client = Self::new(transport, config);
        client.initialize(address).await?;
        Ok(client)
    }
}

impl ObdClient<Elm327Simulator> {
    /// Create a mock OBD client for testing (no hardware required).
    ///
    /// The client is already connected to a simulated CAN vehicle.
    pub fn mock() -> Self {
        info!("Creating mock OBD client for testing");
        let ecu = SimulatedEcu::default();
        let protocol = ecu.protocol.unwrap_or_default();
        let version = ecu.banner.clone();
        let config = ClientConfig {
            timeout_ms: 100,
            ..Default::default()
        };

        let mut client = Self::new(Elm327Simulator::ready(ecu), config);
        client.state = SessionState::Connected;
        client.protocol = protocol;
        client.version = Some(version);
        client.echo_enabled = false;
        client
    }
}

impl<T: Transport> ObdClient<T> {
    /// Wrap a transport. Nothing is sent until [`initialize`](Self::initialize).
    pub fn new(transport: T, config: ClientConfig) -> Self {
        let (close_tx, close_rx) = watch::channel(false);
        Self {
            transport,
            config,
            state: SessionState::Disconnected,
            protocol: ObdProtocol::Auto,
            version: None,
            echo_enabled: true,
            headers_enabled: false,
            monitor_filter: None,
            last_error: None,
            recv_buf: Vec::new(),
            close_tx: Arc::new(close_tx),
            close_rx,
        }
    }

    /// Connect the transport and bring the adapter into the Connected state.
    ///
    /// Any failure ends the session in [`SessionState::Error`] with the
    /// transport closed.
    pub async fn initialize(&mut self, address: &str) -> Result<(), ObdError> {
        if matches!(self.state, SessionState::Connected | SessionState::Monitoring) {
            return Err(ObdError::InvalidState("session already connected"));
        }

        self.close_tx.send_replace(false);
        self.recv_buf.clear();
        self.version = None;
        self.protocol = ObdProtocol::Auto;
        self.echo_enabled = true;
        self.headers_enabled = false;
        self.monitor_filter = None;
        self.last_error = None;

        match self.handshake(address).await {
            Ok(()) => {
                self.set_state(SessionState::Connected);
                info!(
                    "OBD adapter {} ready on {:?}",
                    self.version.as_deref().unwrap_or("?"),
                    self.protocol
                );
                Ok(())
            }
            Err(e) => Err(self.abort(e).await),
        }
    }

    async fn handshake(&mut self, address: &str) -> Result<(), ObdError> {
        self.set_state(SessionState::Opening);
        self.open(address).await?;

        self.set_state(SessionState::Resetting);
        self.exchange("ATZ").await?;

        self.set_state(SessionState::EchoDisable);
        let reply = self.exchange("ATE0").await?;
        if reply.is_ok() {
            self.echo_enabled = false;
        } else {
            warn!("Adapter kept echo on: {:?}", reply.text());
        }

        self.set_state(SessionState::VersionQuery);
        let reply = self.exchange("ATI").await?;
        let banner = reply.first_data_line().unwrap_or_default().to_string();
        if !banner.starts_with(&self.config.banner_prefix) {
            return Err(ObdError::ProtocolMismatch(banner));
        }
        debug!("Adapter banner: {}", banner);
        self.version = Some(banner);

        self.set_state(SessionState::ProtocolProbe);
        self.protocol = self.probe_protocol().await?;
        Ok(())
    }

    /// Open the transport, retrying with a fixed backoff
    async fn open(&mut self, address: &str) -> Result<(), ObdError> {
        let attempts = self.config.connect_attempts;
        for attempt in 1..=attempts {
            match self.transport.connect(address).await {
                Ok(()) => {
                    info!("Connected to {} (attempt {}/{})", address, attempt, attempts);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Connect attempt {}/{} to {} failed: {}", attempt, attempts, address, e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_backoff()).await;
                    }
                }
            }
        }

        let cause = self.transport.last_error().unwrap_or("unknown error");
        Err(ObdError::ConnectFailed(format!(
            "connection attempts exhausted: {cause}"
        )))
    }

    /// Automatic search first, then every protocol id in ascending order
    async fn probe_protocol(&mut self) -> Result<ObdProtocol, ObdError> {
        let auto = ObdProtocol::Auto.select_command();
        let reply = self.exchange(&auto).await?;
        if !reply.is_ok() {
            return Err(ObdError::CommandRejected {
                command: auto,
                reply: reply.text(),
            });
        }
        if self.canary().await? {
            return Ok(ObdProtocol::Auto);
        }

        for protocol in ObdProtocol::PROBE_ORDER {
            let attempt = protocol.try_command();
            let reply = self.exchange(&attempt).await?;
            if !reply.is_ok() {
                warn!("{} rejected ({:?}), stopping protocol search", attempt, reply.text());
                break;
            }
            if !self.canary().await? {
                debug!("No ECU answered on {:?}", protocol);
                continue;
            }

            let select = protocol.select_command();
            let reply = self.exchange(&select).await?;
            if !reply.is_ok() {
                return Err(ObdError::CommandRejected {
                    command: select,
                    reply: reply.text(),
                });
            }
            info!("Selected bus protocol {:?}", protocol);
            return Ok(protocol);
        }

        Err(ObdError::NoProtocolAvailable)
    }

    async fn canary(&mut self) -> Result<bool, ObdError> {
        let reply = self.exchange(CANARY).await?;
        let failed = reply.is_empty() || CANARY_FAILURES.iter().any(|f| reply.contains(f));
        Ok(!failed)
    }

    /// Send a raw adapter command and return its framed reply
    pub async fn send_command(&mut self, command: &str) -> Result<Reply, ObdError> {
        self.ensure_connected()?;
        self.command(command).await
    }

    /// Send bytes as space separated hex and decode the hex reply.
    ///
    /// Returns `None` when the adapter answers `NO DATA`.
    pub async fn send_binary(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>, ObdError> {
        self.ensure_connected()?;
        let reply = self.command(&encode_hex(data)).await?;
        let line = reply.first_data_line().unwrap_or_default();
        if compact(line).starts_with("NODATA") {
            return Ok(None);
        }
        decode_hex_stream(line).map(Some)
    }

    /// Query one sensor and decode its value
    pub async fn sensor_value(&mut self, sensor: &Sensor) -> Result<SensorValue, ObdError> {
        self.ensure_connected()?;
        let reply = self.command(&sensor.command()).await?;
        match extract_payload(&reply, sensor.length)? {
            Payload::Data(code) => sensor.decode(&code),
            Payload::NoData => Ok(SensorValue::NoData),
        }
    }

    /// Query a sensor answered by several ECUs, one value per responder
    pub async fn sensor_values_arrayed(
        &mut self,
        sensor: &Sensor,
    ) -> Result<Vec<SensorValue>, ObdError> {
        self.ensure_connected()?;
        let reply = self.command(&sensor.command()).await?;
        extract_arrayed(&reply, sensor.length)?
            .iter()
            .map(|code| sensor.decode(code))
            .collect()
    }

    /// Read a sensor by PID. Returns `None` for PIDs not in the registry.
    pub async fn sensor(&mut self, pid: u8) -> Result<Option<SensorReading>, ObdError> {
        let Some(sensor) = get_sensor(pid) else {
            debug!("Unknown PID {:02X}", pid);
            return Ok(None);
        };

        let value = self.sensor_value(sensor).await?;
        let timestamp_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Ok(Some(SensorReading {
            pid,
            name: sensor.name.to_string(),
            value,
            unit: sensor.unit.to_string(),
            timestamp_ms,
        }))
    }

    /// Read PID 0x01. `None` when the vehicle does not report it.
    pub async fn monitor_status(&mut self) -> Result<Option<MonitorStatus>, ObdError> {
        let sensor = get_sensor(0x01).ok_or(ObdError::InvalidState("PID 01 not registered"))?;
        match self.sensor_value(sensor).await? {
            SensorValue::Status(status) => Ok(Some(status)),
            SensorValue::NoData => Ok(None),
            other => Err(ObdError::MalformedResponse(format!(
                "unexpected monitor status {other:?}"
            ))),
        }
    }

    /// Read stored trouble codes, then pending ones on a best-effort basis.
    ///
    /// A failed pending read is logged, the session stays connected and the
    /// stored codes are still returned. Losing the bus is still fatal.
    pub async fn get_dtc(&mut self) -> Result<Vec<DtcCode>, ObdError> {
        let Some(status) = self.monitor_status().await? else {
            return Ok(Vec::new());
        };
        info!("Stored DTCs: {}, MIL {}", status.dtc_count, if status.mil { "on" } else { "off" });

        let stored = format!("{:02X}", mode::READ_DTC);
        let mut codes = Vec::new();
        for _ in 0..frame_count(status.dtc_count) {
            let reply = self.command(&stored).await?;
            codes.extend(decode_frame(&reply, DtcStatus::Active)?);
        }

        if status.dtc_count > 0 {
            match self.pending_dtc().await {
                Ok(found) => codes.extend(found),
                Err(ObdError::BusDisconnected) => {
                    return Err(self.abort(ObdError::BusDisconnected).await);
                }
                Err(e) if *self.close_rx.borrow() => return Err(self.abort(e).await),
                Err(e) => {
                    warn!("Pending DTC read failed, keeping {} stored codes: {}", codes.len(), e);
                    self.recv_buf.clear();
                }
            }
        }

        Ok(codes)
    }

    /// Mode 07 request. Failures leave the session untouched.
    async fn pending_dtc(&mut self) -> Result<Vec<DtcCode>, ObdError> {
        let pending = format!("{:02X}", mode::PENDING_DTC);
        let reply = self.exchange(&pending).await?;
        decode_frame(&reply, DtcStatus::Passive)
    }

    /// Clear trouble codes and freeze frame data
    pub async fn clear_dtc(&mut self) -> Result<(), ObdError> {
        self.ensure_connected()?;
        let command = format!("{:02X}", mode::CLEAR_DTC);
        let reply = self.command(&command).await?;
        let line = compact(reply.first_data_line().unwrap_or_default());
        if line.starts_with("44") {
            info!("Trouble codes cleared");
            Ok(())
        } else {
            Err(ObdError::CommandRejected {
                command,
                reply: reply.text(),
            })
        }
    }

    /// Enter or leave monitor mode. Does nothing when already in the
    /// requested mode.
    pub async fn enable_monitor(&mut self, enable: bool) -> Result<(), ObdError> {
        match (enable, self.state) {
            (true, SessionState::Monitoring) | (false, SessionState::Connected) => Ok(()),
            (true, SessionState::Connected) => self.start_monitor().await,
            (false, SessionState::Monitoring) => self.stop_monitor().await,
            _ => Err(ObdError::NotConnected),
        }
    }

    async fn start_monitor(&mut self) -> Result<(), ObdError> {
        self.set_headers(true).await?;
        self.command("ATAL").await?;
        self.command("ATCAF0").await?;

        // Monitor output never ends with a prompt
        self.recv_buf.clear();
        if let Err(e) = self.transport.send(b"ATMA\r\n").await {
            return Err(self.abort(lost(e)).await);
        }
        debug!("cmd: \"ATMA\"");
        self.set_state(SessionState::Monitoring);
        Ok(())
    }

    async fn stop_monitor(&mut self) -> Result<(), ObdError> {
        let mut stopped = false;
        for _ in 0..self.config.monitor_stop_attempts {
            let reply = self.command("").await?;
            if reply.contains("STOPPED") {
                stopped = true;
                break;
            }
        }
        if !stopped {
            let cause = ObdError::ConnectionLost("adapter did not leave monitor mode".into());
            return Err(self.abort(cause).await);
        }

        self.set_state(SessionState::Connected);
        self.command("ATCAF1").await?;
        self.set_headers(false).await
    }

    async fn set_headers(&mut self, enable: bool) -> Result<(), ObdError> {
        let reply = self.command(if enable { "ATH1" } else { "ATH0" }).await?;
        if reply.contains("OK") {
            self.headers_enabled = enable;
        }
        Ok(())
    }

    /// Restrict monitor output to one CAN id (`X` is a wildcard digit).
    /// `None` removes the filter.
    pub async fn set_monitor_filter(&mut self, id: Option<&str>) -> Result<(), ObdError> {
        let monitoring = self.state == SessionState::Monitoring;
        if monitoring {
            self.stop_monitor().await?;
        }
        self.ensure_connected()?;

        let command = match id {
            Some(id) => format!("ATCRA {id}"),
            None => "ATCRA".to_string(),
        };
        let reply = self.command(&command).await?;
        if reply.is_ok() {
            self.monitor_filter = id.map(str::to_string);
        } else {
            warn!("Failed to set CAN filter {:?}: {:?}", id, reply.text());
        }

        if monitoring {
            self.start_monitor().await?;
        }
        Ok(())
    }

    /// Bus lines received in monitor mode.
    ///
    /// Waits up to the command timeout for at least one complete line and
    /// returns an empty list when the bus stayed quiet.
    pub async fn read_monitor_lines(&mut self) -> Result<Vec<String>, ObdError> {
        if self.state != SessionState::Monitoring {
            return Err(ObdError::InvalidState("monitor mode is off"));
        }

        let deadline = Instant::now() + self.config.timeout();
        loop {
            if let Some(end) = self.recv_buf.iter().rposition(|&b| b == b'\r' || b == b'\n') {
                let raw: Vec<u8> = self.recv_buf.drain(..=end).collect();
                let lines: Vec<String> = String::from_utf8_lossy(&raw)
                    .split(['\r', '\n'])
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(String::from)
                    .collect();
                if !lines.is_empty() {
                    return Ok(lines);
                }
            }

            match self.fill(deadline).await {
                Ok(true) => {}
                Ok(false) => return Ok(Vec::new()),
                Err(e) => return Err(self.abort(e).await),
            }
        }
    }

    /// End the session. With `reset`, a connected adapter is sent `ATZ`
    /// first so it returns to its power-on defaults.
    pub async fn close(&mut self, reset: bool) {
        if reset && self.state == SessionState::Monitoring {
            // ATZ would only interrupt ATMA
            if let Err(e) = self.stop_monitor().await {
                debug!("Leaving monitor mode before close failed: {}", e);
            }
        }
        if reset && self.state == SessionState::Connected {
            if let Err(e) = self.exchange("ATZ").await {
                debug!("Reset before close failed: {}", e);
            }
        }

        self.transport.close().await;
        self.recv_buf.clear();
        self.version = None;
        self.protocol = ObdProtocol::Auto;
        self.echo_enabled = true;
        self.set_state(SessionState::Disconnected);
    }

    /// Handle for closing this session from another task
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle(self.close_tx.clone())
    }

    /// Session state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Check if the client is ready for diagnostic commands
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Whether the adapter is in monitor mode
    pub fn is_monitoring(&self) -> bool {
        self.state == SessionState::Monitoring
    }

    /// Negotiated bus protocol
    pub fn protocol(&self) -> ObdProtocol {
        self.protocol
    }

    /// Adapter firmware banner
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Whether the adapter echoes commands
    pub fn echo_enabled(&self) -> bool {
        self.echo_enabled
    }

    /// Whether CAN headers are printed
    pub fn headers_enabled(&self) -> bool {
        self.headers_enabled
    }

    /// Active monitor filter
    pub fn monitor_filter(&self) -> Option<&str> {
        self.monitor_filter.as_deref()
    }

    /// Cause of the last fatal error
    pub fn last_error(&self) -> Option<&ObdError> {
        self.last_error.as_ref()
    }

    /// Borrow the transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// List addresses the transport can reach
    pub async fn discover(&mut self) -> Result<Vec<String>, ObdError> {
        let timeout = self.config.timeout();
        self.transport.discover(timeout).await
    }

    fn ensure_connected(&self) -> Result<(), ObdError> {
        match self.state {
            SessionState::Connected => Ok(()),
            SessionState::Monitoring => Err(ObdError::InvalidState("adapter is in monitor mode")),
            _ => Err(ObdError::NotConnected),
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            info!("OBD session {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Command round trip; fatal errors end the session
    async fn command(&mut self, command: &str) -> Result<Reply, ObdError> {
        match self.exchange(command).await {
            Err(e) if e.is_fatal() => Err(self.abort(e).await),
            result => result,
        }
    }

    async fn exchange(&mut self, command: &str) -> Result<Reply, ObdError> {
        if *self.close_rx.borrow() {
            return Err(ObdError::ConnectionLost("transport closed".into()));
        }

        self.recv_buf.clear();
        self.transport
            .send(format!("{command}\r\n").as_bytes())
            .await
            .map_err(lost)?;

        let reply = self.read_reply(command).await?;
        debug!("cmd: {:?} -> {:?}", command, reply.text());

        if reply.contains("CAN ERROR") {
            return Err(ObdError::BusDisconnected);
        }
        Ok(reply)
    }

    /// Accumulate bytes until the prompt arrives
    async fn read_reply(&mut self, command: &str) -> Result<Reply, ObdError> {
        let deadline = Instant::now() + self.config.timeout();
        loop {
            if let Some(end) = self.recv_buf.iter().position(|&b| b == PROMPT) {
                let raw: Vec<u8> = self.recv_buf.drain(..=end).collect();
                return Ok(Reply::from_bytes(&raw[..end], command));
            }
            if !self.fill(deadline).await? {
                return Err(ObdError::ConnectionLost(format!(
                    "no reply to {:?} within {}ms",
                    command, self.config.timeout_ms
                )));
            }
        }
    }

    /// One transport read into the buffer. `Ok(false)` when the deadline
    /// passed first.
    async fn fill(&mut self, deadline: Instant) -> Result<bool, ObdError> {
        let chunk_len = self.config.read_chunk;
        let read = tokio::select! {
            biased;
            _ = self.close_rx.wait_for(|closed| *closed) => {
                return Err(ObdError::ConnectionLost("transport closed".into()));
            }
            _ = tokio::time::sleep_until(deadline) => return Ok(false),
            read = self.transport.recv(chunk_len) => read,
        };

        let chunk = read.map_err(lost)?;
        if chunk.is_empty() {
            return Err(ObdError::ConnectionLost("adapter closed the stream".into()));
        }
        self.recv_buf.extend_from_slice(&chunk);
        Ok(true)
    }

    async fn abort(&mut self, cause: ObdError) -> ObdError {
        if *self.close_rx.borrow() {
            info!("OBD session closed: {}", cause);
            self.set_state(SessionState::Disconnected);
        } else {
            error!("OBD session failed: {}", cause);
            self.set_state(SessionState::Error);
        }
        self.last_error = Some(cause.clone());
        self.transport.close().await;
        self.recv_buf.clear();
        cause
    }
}

/// A broken stream ends the session
fn lost(err: ObdError) -> ObdError {
    match err {
        ObdError::Transport(msg) => ObdError::ConnectionLost(msg),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    }

    fn test_config() -> ClientConfig {
        ClientConfig {
            retry_backoff_ms: 1,
            timeout_ms: 500,
            ..Default::default()
        }
    }

    async fn connected(ecu: SimulatedEcu) -> (ObdClient<Elm327Simulator>, crate::simulator::CommandLog) {
        init_tracing();
        let sim = Elm327Simulator::new(ecu);
        let log = sim.command_log();
        let mut client = ObdClient::new(sim, test_config());
        client.initialize("sim").await.unwrap();
        (client, log)
    }

    #[tokio::test]
    async fn test_handshake_with_automatic_protocol() {
        let (client, log) = connected(SimulatedEcu::default()).await;

        assert_eq!(client.state(), SessionState::Connected);
        assert_eq!(client.protocol(), ObdProtocol::Auto);
        assert_eq!(client.version(), Some("ELM327 v1.5"));
        assert!(!client.echo_enabled());
        assert_eq!(log.commands(), ["ATZ", "ATE0", "ATI", "ATSP0", "0100"]);
    }

    #[tokio::test]
    async fn test_probe_walks_protocols_in_order() {
        let ecu = SimulatedEcu {
            auto_detect: false,
            ..Default::default()
        };
        let (client, log) = connected(ecu).await;

        assert_eq!(client.protocol(), ObdProtocol::Iso15765_4Can11bit500);
        let tries: Vec<String> = log
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("ATTP"))
            .collect();
        assert_eq!(tries, ["ATTP1", "ATTP2", "ATTP3", "ATTP4", "ATTP5", "ATTP6"]);
        assert_eq!(log.commands().last().map(String::as_str), Some("ATSP6"));
    }

    #[tokio::test]
    async fn test_probe_stops_when_adapter_refuses_protocol() {
        init_tracing();
        let ecu = SimulatedEcu {
            auto_detect: false,
            try_limit: Some(3),
            ..Default::default()
        };
        let sim = Elm327Simulator::new(ecu);
        let log = sim.command_log();
        let mut client = ObdClient::new(sim, test_config());

        let result = client.initialize("sim").await;
        assert!(matches!(result, Err(ObdError::NoProtocolAvailable)));
        assert_eq!(client.state(), SessionState::Error);
        assert_eq!(log.count("ATTP4"), 1);
        assert_eq!(log.count("ATTP5"), 0);
        assert!(!client.transport().is_connected());
    }

    #[tokio::test]
    async fn test_engine_off_has_no_protocol() {
        init_tracing();
        let ecu = SimulatedEcu {
            protocol: None,
            ..Default::default()
        };
        let sim = Elm327Simulator::new(ecu);
        let log = sim.command_log();
        let mut client = ObdClient::new(sim, test_config());

        assert!(matches!(
            client.initialize("sim").await,
            Err(ObdError::NoProtocolAvailable)
        ));
        assert_eq!(log.count("ATTPA"), 1);
        assert!(matches!(client.last_error(), Some(ObdError::NoProtocolAvailable)));
    }

    #[tokio::test]
    async fn test_banner_mismatch() {
        init_tracing();
        let ecu = SimulatedEcu {
            banner: "STN1110 v4.0".to_string(),
            ..Default::default()
        };
        let mut client = ObdClient::new(Elm327Simulator::new(ecu), test_config());

        let result = client.initialize("sim").await;
        assert!(matches!(result, Err(ObdError::ProtocolMismatch(banner)) if banner.starts_with("STN")));
        assert_eq!(client.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn test_connect_retries() {
        let ecu = SimulatedEcu {
            refuse_connections: 2,
            ..Default::default()
        };
        let (client, _) = connected(ecu).await;
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_attempts_exhausted() {
        init_tracing();
        let ecu = SimulatedEcu {
            refuse_connections: 5,
            ..Default::default()
        };
        let mut client = ObdClient::new(Elm327Simulator::new(ecu), test_config());

        let result = client.initialize("sim").await;
        assert!(matches!(result, Err(ObdError::ConnectFailed(msg)) if msg.contains("exhausted")));
        assert_eq!(client.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn test_mock_client_reads_sensors() {
        let mut client = ObdClient::mock();
        assert!(client.is_connected());

        let rpm = client.sensor(0x0C).await.unwrap().unwrap();
        assert_eq!(rpm.value, SensorValue::Integer(1726));
        assert_eq!(rpm.unit, "");

        let coolant = client.sensor(0x05).await.unwrap().unwrap();
        assert_eq!(coolant.value, SensorValue::Integer(167));

        // Not registered
        assert!(client.sensor(0x99).await.unwrap().is_none());
        // Registered, not supported by the vehicle
        let fuel = client.sensor(0x0A).await.unwrap().unwrap();
        assert_eq!(fuel.value, SensorValue::NoData);
    }

    #[tokio::test]
    async fn test_send_binary() {
        let mut client = ObdClient::mock();
        let reply = client.send_binary(&[0x01, 0x0D]).await.unwrap();
        assert_eq!(reply, Some(vec![0x41, 0x0D, 0x55]));
        assert_eq!(client.send_binary(&[0x01, 0x21]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dtc_frames_requested() {
        let ecu = SimulatedEcu {
            stored_dtcs: vec![[0x01, 0x23], [0x41, 0x00], [0x02, 0x17], [0x81, 0x01], [0xC0, 0x73]],
            mil: true,
            ..Default::default()
        };
        let (mut client, log) = connected(ecu).await;

        let codes = client.get_dtc().await.unwrap();
        assert_eq!(log.count("03"), 2);
        assert_eq!(log.count("07"), 1);

        let stored: Vec<&str> = codes
            .iter()
            .filter(|c| c.status == DtcStatus::Active)
            .map(|c| c.code.as_str())
            .collect();
        assert_eq!(stored, ["P0123", "C0100", "P0217", "B0101", "U0073"]);
    }

    #[tokio::test]
    async fn test_no_dtc_skips_frame_requests() {
        let (mut client, log) = connected(SimulatedEcu::default()).await;
        assert!(client.get_dtc().await.unwrap().is_empty());
        assert_eq!(log.count("03"), 0);
        assert_eq!(log.count("07"), 0);
    }

    #[tokio::test]
    async fn test_pending_dtc_failure_keeps_stored_codes() {
        let ecu = SimulatedEcu {
            stored_dtcs: vec![[0x01, 0x23]],
            silent_on: Some("07".to_string()),
            ..Default::default()
        };
        let (mut client, _) = connected(ecu).await;
        client.config.timeout_ms = 50;

        let codes = client.get_dtc().await.unwrap();
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].code, "P0123");
        assert_eq!(client.state(), SessionState::Connected);
        assert!(client.last_error().is_none());

        let rpm = client.sensor(0x0C).await.unwrap().unwrap();
        assert_eq!(rpm.value, SensorValue::Integer(1726));
    }

    #[tokio::test]
    async fn test_pending_dtc_bus_loss_is_fatal() {
        let ecu = SimulatedEcu {
            stored_dtcs: vec![[0x01, 0x23]],
            can_error_on: Some("07".to_string()),
            ..Default::default()
        };
        let (mut client, _) = connected(ecu).await;

        assert!(matches!(client.get_dtc().await, Err(ObdError::BusDisconnected)));
        assert_eq!(client.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn test_pending_dtcs_are_passive() {
        let ecu = SimulatedEcu {
            stored_dtcs: vec![[0x01, 0x23]],
            pending_dtcs: vec![[0x03, 0x00]],
            ..Default::default()
        };
        let (mut client, _) = connected(ecu).await;

        let codes = client.get_dtc().await.unwrap();
        assert_eq!(codes.len(), 2);
        assert_eq!(codes[1].status, DtcStatus::Passive);
        assert_eq!(codes[1].code, "P0300");
    }

    #[tokio::test]
    async fn test_clear_dtc() {
        let ecu = SimulatedEcu {
            stored_dtcs: vec![[0x01, 0x23]],
            mil: true,
            ..Default::default()
        };
        let (mut client, _) = connected(ecu).await;

        client.clear_dtc().await.unwrap();
        let status = client.monitor_status().await.unwrap().unwrap();
        assert_eq!(status.dtc_count, 0);
        assert!(!status.mil);
    }

    #[tokio::test]
    async fn test_can_error_is_fatal() {
        let ecu = SimulatedEcu {
            can_error_on: Some("010D".to_string()),
            ..Default::default()
        };
        let (mut client, _) = connected(ecu).await;

        let result = client.send_command("010D").await;
        assert!(matches!(result, Err(ObdError::BusDisconnected)));
        assert_eq!(client.state(), SessionState::Error);
        assert!(matches!(
            client.send_command("010C").await,
            Err(ObdError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_can_error_inside_longer_reply() {
        let ecu = SimulatedEcu {
            replies: [(
                "010C".to_string(),
                "41 0C 1A F8\rBUS ERROR CAN ERROR xx".to_string(),
            )]
            .into(),
            ..Default::default()
        };
        let (mut client, _) = connected(ecu).await;

        assert!(matches!(
            client.sensor(0x0C).await,
            Err(ObdError::BusDisconnected)
        ));
        assert_eq!(client.state(), SessionState::Error);
        assert!(!client.transport().is_connected());
    }

    #[tokio::test]
    async fn test_can_error_during_protocol_search() {
        init_tracing();
        let ecu = SimulatedEcu {
            replies: [("0100".to_string(), "SEARCHING...\rCAN ERROR".to_string())].into(),
            ..Default::default()
        };
        let sim = Elm327Simulator::new(ecu);
        let log = sim.command_log();
        let mut client = ObdClient::new(sim, test_config());

        let result = client.initialize("sim").await;
        assert!(matches!(result, Err(ObdError::BusDisconnected)));
        assert_eq!(client.state(), SessionState::Error);
        assert_eq!(log.count("0100"), 1);
        assert_eq!(log.count("ATTP1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_adapter_times_out() {
        let ecu = SimulatedEcu {
            silent_on: Some("010C".to_string()),
            ..Default::default()
        };
        let (mut client, _) = connected(ecu).await;

        let result = client.send_command("010C").await;
        assert!(matches!(result, Err(ObdError::ConnectionLost(_))));
        assert_eq!(client.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn test_close_while_pending() {
        let ecu = SimulatedEcu {
            silent_on: Some("010C".to_string()),
            ..Default::default()
        };
        let (mut client, _) = connected(ecu).await;
        client.config.timeout_ms = 5000;

        let handle = client.close_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.close();
        });

        let started = std::time::Instant::now();
        let result = client.send_command("010C").await;
        assert!(matches!(result, Err(ObdError::ConnectionLost(msg)) if msg.contains("closed")));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(client.state(), SessionState::Disconnected);
        assert!(!client.transport().is_connected());
    }

    #[tokio::test]
    async fn test_echo_is_stripped_before_disable() {
        let ecu = SimulatedEcu::default();
        let mut sim = Elm327Simulator::new(ecu);
        sim.connect("sim").await.unwrap();
        let mut client = ObdClient::new(sim, test_config());

        let reply = client.exchange("ATI").await.unwrap();
        assert_eq!(reply.lines(), ["ELM327 v1.5"]);
    }

    #[tokio::test]
    async fn test_monitor_mode() {
        let (mut client, log) = connected(SimulatedEcu::default()).await;

        client.enable_monitor(true).await.unwrap();
        assert!(client.is_monitoring());
        assert!(client.headers_enabled());
        assert!(matches!(
            client.send_command("010C").await,
            Err(ObdError::InvalidState(_))
        ));

        let lines = client.read_monitor_lines().await.unwrap();
        assert_eq!(lines[0], "7E8 03 41 0D 32");

        client.enable_monitor(false).await.unwrap();
        assert!(client.is_connected());
        assert!(!client.headers_enabled());
        assert_eq!(log.count("ATCAF1"), 1);
    }

    #[tokio::test]
    async fn test_monitor_filter() {
        let (mut client, log) = connected(SimulatedEcu::default()).await;

        client.enable_monitor(true).await.unwrap();
        client.set_monitor_filter(Some("7DF")).await.unwrap();
        assert!(client.is_monitoring());
        assert_eq!(client.monitor_filter(), Some("7DF"));
        assert_eq!(log.count("ATCRA 7DF"), 1);

        let lines = client.read_monitor_lines().await.unwrap();
        assert_eq!(lines, ["7DF 02 01 0C"]);
    }

    #[tokio::test]
    async fn test_close_resets_adapter() {
        let (mut client, log) = connected(SimulatedEcu::default()).await;

        client.close(true).await;
        assert_eq!(client.state(), SessionState::Disconnected);
        assert_eq!(client.version(), None);
        assert_eq!(log.count("ATZ"), 2);
        assert!(matches!(
            client.sensor(0x0C).await,
            Err(ObdError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_close_from_monitor_mode_resets_adapter() {
        let (mut client, log) = connected(SimulatedEcu::default()).await;
        client.enable_monitor(true).await.unwrap();

        client.close(true).await;
        assert_eq!(client.state(), SessionState::Disconnected);

        let commands = log.commands();
        let tail: Vec<&str> = commands[commands.len() - 4..].iter().map(String::as_str).collect();
        assert_eq!(tail, ["", "ATCAF1", "ATH0", "ATZ"]);
    }

    #[tokio::test]
    async fn test_reinitialize_after_close() {
        let (mut client, _) = connected(SimulatedEcu::default()).await;
        client.close(false).await;
        client.initialize("sim").await.unwrap();
        assert!(client.is_connected());
    }
}
