//! In-process ELM327 simulator
//!
//! Implements [`Transport`] by answering AT and OBD commands the way an
//! adapter plugged into a vehicle would. Used by [`ObdClient::mock`] and by
//! tests that need to script bus conditions (engine off, protocol only found
//! by probing, `CAN ERROR`, a silent adapter, ...).
//!
//! [`ObdClient::mock`]: crate::ObdClient::mock

use crate::error::ObdError;
use crate::protocol::ObdProtocol;
use crate::transport::Transport;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Vehicle and adapter behaviour the simulator reproduces
#[derive(Debug, Clone)]
pub struct SimulatedEcu {
    /// Reply to `ATI`
    pub banner: String,
    /// Protocol the vehicle speaks; `None` models the engine being off
    pub protocol: Option<ObdProtocol>,
    /// Whether `ATSP0` automatic search finds the protocol
    pub auto_detect: bool,
    /// `ATTP<n>` is refused with `?` for ids above this limit
    pub try_limit: Option<u8>,
    /// Mode 01 replies by PID (PID 0x01 is derived from the DTC lists)
    pub pids: BTreeMap<u8, Vec<u8>>,
    /// Stored trouble codes served by mode 03
    pub stored_dtcs: Vec<[u8; 2]>,
    /// Pending trouble codes served by mode 07
    pub pending_dtcs: Vec<[u8; 2]>,
    /// Malfunction indicator lamp state
    pub mil: bool,
    /// Command answered with `CAN ERROR`
    pub can_error_on: Option<String>,
    /// Command the adapter never answers
    pub silent_on: Option<String>,
    /// Fixed reply bodies by command, lines separated with `\r`
    pub replies: BTreeMap<String, String>,
    /// Bus traffic printed after `ATMA`
    pub monitor_lines: Vec<String>,
    /// Number of connect attempts refused before one succeeds
    pub refuse_connections: u32,
    /// Largest chunk handed out per read
    pub chunk_size: usize,
}

impl Default for SimulatedEcu {
    fn default() -> Self {
        let pids = BTreeMap::from([
            (0x00, vec![0xBE, 0x3E, 0xB8, 0x11]),
            (0x04, vec![0x80]),
            (0x05, vec![0x73]),
            (0x06, vec![0x90]),
            (0x0B, vec![0x64]),
            (0x0C, vec![0x1A, 0xF8]),
            (0x0D, vec![0x55]),
            (0x0E, vec![0x81]),
            (0x0F, vec![0x28]),
            (0x10, vec![0x01, 0x00]),
            (0x11, vec![0x33]),
            (0x1F, vec![0x0E, 0x10]),
        ]);

        Self {
            banner: "ELM327 v1.5".to_string(),
            protocol: Some(ObdProtocol::Iso15765_4Can11bit500),
            auto_detect: true,
            try_limit: None,
            pids,
            stored_dtcs: Vec::new(),
            pending_dtcs: Vec::new(),
            mil: false,
            can_error_on: None,
            silent_on: None,
            replies: BTreeMap::new(),
            monitor_lines: vec![
                "7E8 03 41 0D 32".to_string(),
                "7E8 04 41 0C 1A F8".to_string(),
                "7DF 02 01 0C".to_string(),
            ],
            refuse_connections: 0,
            chunk_size: 7,
        }
    }
}

/// Shared record of every command the simulator received
#[derive(Debug, Clone, Default)]
pub struct CommandLog(Arc<Mutex<Vec<String>>>);

impl CommandLog {
    fn push(&self, command: &str) {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(command.to_string());
    }

    /// Commands in the order they were received
    pub fn commands(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of times `command` was received
    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| *c == command).count()
    }
}

/// Simulated adapter
pub struct Elm327Simulator {
    ecu: SimulatedEcu,
    log: CommandLog,
    connect_attempts: u32,
    connected: bool,
    error: Option<String>,
    echo: bool,
    current_protocol: u8,
    filter: Option<String>,
    monitoring: bool,
    dtc_frame: usize,
    inbound: Vec<u8>,
    outbound: VecDeque<u8>,
}

impl Elm327Simulator {
    /// Fresh adapter, powered but not connected, echo on
    pub fn new(ecu: SimulatedEcu) -> Self {
        Self {
            ecu,
            log: CommandLog::default(),
            connect_attempts: 0,
            connected: false,
            error: None,
            echo: true,
            current_protocol: 0,
            filter: None,
            monitoring: false,
            dtc_frame: 0,
            inbound: Vec::new(),
            outbound: VecDeque::new(),
        }
    }

    /// Adapter already connected and initialised: echo off, protocol selected
    pub fn ready(ecu: SimulatedEcu) -> Self {
        let protocol = ecu.protocol.map(|p| p.id()).unwrap_or(0);
        let mut sim = Self::new(ecu);
        sim.connected = true;
        sim.echo = false;
        sim.current_protocol = protocol;
        sim
    }

    /// Handle to the command log, usable after the simulator is moved
    pub fn command_log(&self) -> CommandLog {
        self.log.clone()
    }

    fn bus_ok(&self) -> bool {
        match self.ecu.protocol {
            Some(protocol) => {
                self.current_protocol == protocol.id()
                    || (self.current_protocol == 0 && self.ecu.auto_detect)
            }
            None => false,
        }
    }

    fn bus_failure(&self) -> String {
        if self.current_protocol == 0 {
            "SEARCHING...\rUNABLE TO CONNECT".to_string()
        } else if self.current_protocol % 2 == 0 {
            "NO DATA".to_string()
        } else {
            "BUS INIT: ...ERROR".to_string()
        }
    }

    fn format_bytes(mode: u8, bytes: &[u8]) -> String {
        let mut out = format!("{mode:02X}");
        for b in bytes {
            out.push_str(&format!(" {b:02X}"));
        }
        out
    }

    fn dtc_frame_text(mode: u8, codes: &[[u8; 2]]) -> String {
        let mut bytes: Vec<u8> = codes.iter().flatten().copied().collect();
        bytes.resize(6, 0);
        Self::format_bytes(mode, &bytes)
    }

    fn monitor_status(&self) -> Vec<u8> {
        let count = (self.ecu.stored_dtcs.len() as u8) & 0x7F;
        let mil = if self.ecu.mil { 0x80 } else { 0x00 };
        vec![count | mil, 0x07, 0x65, 0x00]
    }

    fn mode01(&self, pid_hex: &str) -> String {
        let Ok(pid) = u8::from_str_radix(pid_hex, 16) else {
            return "?".to_string();
        };
        let bytes = if pid == 0x01 {
            Some(self.monitor_status())
        } else {
            self.ecu.pids.get(&pid).cloned()
        };
        match bytes {
            Some(bytes) => format!("41 {:02X}{}", pid, &Self::format_bytes(0, &bytes)[2..]),
            None => "NO DATA".to_string(),
        }
    }

    /// Reply body for one command; `None` when the adapter stays silent
    fn respond(&mut self, command: &str) -> Option<String> {
        let cmd: String = command.split_whitespace().collect::<String>().to_ascii_uppercase();

        if self.ecu.silent_on.as_deref() == Some(cmd.as_str()) {
            return None;
        }
        if self.ecu.can_error_on.as_deref() == Some(cmd.as_str()) {
            return Some("CAN ERROR".to_string());
        }
        if let Some(body) = self.ecu.replies.get(&cmd) {
            return Some(body.clone());
        }

        let reply = match cmd.as_str() {
            "ATZ" => {
                self.echo = true;
                self.current_protocol = 0;
                self.filter = None;
                format!("\r{}", self.ecu.banner)
            }
            "ATI" => self.ecu.banner.clone(),
            "ATE0" | "ATE1" => {
                self.echo = cmd == "ATE1";
                "OK".to_string()
            }
            "ATH0" | "ATH1" | "ATAL" | "ATCAF0" | "ATCAF1" => "OK".to_string(),
            "ATCRA" => {
                self.filter = None;
                "OK".to_string()
            }
            "ATMA" => {
                self.monitoring = true;
                let lines: Vec<&String> = self
                    .ecu
                    .monitor_lines
                    .iter()
                    .filter(|line| match &self.filter {
                        Some(id) => line.starts_with(id.as_str()),
                        None => true,
                    })
                    .collect();
                let mut out = String::new();
                for line in lines {
                    out.push_str(line);
                    out.push('\r');
                }
                self.outbound.extend(out.bytes());
                return None;
            }
            "03" => {
                if !self.bus_ok() {
                    self.bus_failure()
                } else if self.ecu.stored_dtcs.is_empty() {
                    Self::dtc_frame_text(0x43, &[])
                } else {
                    let frames: Vec<&[[u8; 2]]> = self.ecu.stored_dtcs.chunks(3).collect();
                    let frame = frames[self.dtc_frame % frames.len()];
                    self.dtc_frame += 1;
                    Self::dtc_frame_text(0x43, frame)
                }
            }
            "07" => {
                if !self.bus_ok() {
                    self.bus_failure()
                } else if self.ecu.pending_dtcs.is_empty() {
                    "NO DATA".to_string()
                } else {
                    let frame = &self.ecu.pending_dtcs[..self.ecu.pending_dtcs.len().min(3)];
                    Self::dtc_frame_text(0x47, frame)
                }
            }
            "04" => {
                self.ecu.stored_dtcs.clear();
                self.ecu.pending_dtcs.clear();
                self.ecu.mil = false;
                self.dtc_frame = 0;
                "44".to_string()
            }
            other => {
                if let Some(id) = other.strip_prefix("ATCRA") {
                    self.filter = Some(id.to_string());
                    "OK".to_string()
                } else if let Some(n) = other.strip_prefix("ATSP") {
                    match u8::from_str_radix(n, 16) {
                        Ok(id) if id <= 0xC => {
                            self.current_protocol = id;
                            "OK".to_string()
                        }
                        _ => "?".to_string(),
                    }
                } else if let Some(n) = other.strip_prefix("ATTP") {
                    match u8::from_str_radix(n, 16) {
                        Ok(id) if self.ecu.try_limit.is_some_and(|limit| id > limit) => {
                            "?".to_string()
                        }
                        Ok(id) if id <= 0xC => {
                            self.current_protocol = id;
                            "OK".to_string()
                        }
                        _ => "?".to_string(),
                    }
                } else if let Some(pid) = other.strip_prefix("01") {
                    if self.bus_ok() {
                        self.mode01(pid)
                    } else {
                        self.bus_failure()
                    }
                } else {
                    "?".to_string()
                }
            }
        };
        Some(reply)
    }

    fn process_inbound(&mut self) {
        while let Some(pos) = self.inbound.iter().position(|&b| b == b'\r') {
            let mut line: Vec<u8> = self.inbound.drain(..=pos).collect();
            line.pop();
            if self.inbound.first() == Some(&b'\n') {
                self.inbound.remove(0);
            }
            let command = String::from_utf8_lossy(&line).trim().to_string();
            self.log.push(&command);
            debug!("simulator <- {:?}", command);

            if self.monitoring {
                // Any input stops monitor mode
                self.monitoring = false;
                self.outbound.extend(b"STOPPED\r\r>");
                continue;
            }

            let echo = self.echo;
            if let Some(body) = self.respond(&command) {
                let mut out = String::new();
                if echo {
                    out.push_str(&command);
                    out.push('\r');
                }
                out.push_str(&body);
                out.push_str("\r\r>");
                self.outbound.extend(out.bytes());
            }
        }
    }
}

impl Transport for Elm327Simulator {
    async fn connect(&mut self, address: &str) -> Result<(), ObdError> {
        self.connect_attempts += 1;
        if self.connect_attempts <= self.ecu.refuse_connections {
            let msg = format!("{address}: connection refused");
            self.error = Some(msg.clone());
            return Err(ObdError::ConnectFailed(msg));
        }
        self.connected = true;
        self.error = None;
        self.inbound.clear();
        self.outbound.clear();
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ObdError> {
        if !self.connected {
            return Err(ObdError::NotConnected);
        }
        self.inbound.extend_from_slice(data);
        self.process_inbound();
        Ok(())
    }

    async fn recv(&mut self, max_len: usize) -> Result<Vec<u8>, ObdError> {
        if !self.connected {
            return Err(ObdError::NotConnected);
        }
        if self.outbound.is_empty() {
            // A silent adapter: only the caller's timeout or shutdown ends this
            std::future::pending::<()>().await;
        }
        let n = max_len.min(self.ecu.chunk_size.max(1)).min(self.outbound.len());
        Ok(self.outbound.drain(..n).collect())
    }

    async fn close(&mut self) {
        self.connected = false;
        self.monitoring = false;
        self.outbound.clear();
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    async fn discover(&mut self, _timeout: std::time::Duration) -> Result<Vec<String>, ObdError> {
        Ok(vec!["sim:elm327".to_string()])
    }
}
