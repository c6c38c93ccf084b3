//! Bluetooth RFCOMM transport
//!
//! Talks to the adapter's serial port profile through a raw
//! `AF_BLUETOOTH` / `BTPROTO_RFCOMM` stream socket. Only available on Linux.

use super::{parse_mac_address, Transport};
use crate::error::ObdError;
use std::time::Duration;
use tracing::{debug, info, warn};

/// RFCOMM link to a Bluetooth adapter
pub struct RfcommTransport {
    channel: u8,
    timeout: Duration,
    socket: Option<sys::Socket>,
    address: Option<String>,
    error: Option<String>,
}

impl RfcommTransport {
    /// Create a closed transport for the given RFCOMM channel
    pub fn new(channel: u8, timeout: Duration) -> Self {
        Self {
            channel,
            timeout,
            socket: None,
            address: None,
            error: None,
        }
    }

    /// Address of the connected device
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    fn fail(&mut self, msg: String) -> ObdError {
        warn!("RFCOMM: {}", msg);
        self.error = Some(msg.clone());
        ObdError::ConnectFailed(msg)
    }
}

impl Transport for RfcommTransport {
    async fn connect(&mut self, address: &str) -> Result<(), ObdError> {
        let Some(mac) = parse_mac_address(address) else {
            return Err(self.fail(format!("MAC address required, got {address:?}")));
        };

        debug!("Connecting to {} on RFCOMM channel {}", address, self.channel);
        let channel = self.channel;
        let pending = tokio::task::spawn_blocking(move || sys::connect(mac, channel));

        let raw = match tokio::time::timeout(self.timeout, pending).await {
            Ok(Ok(Ok(raw))) => raw,
            Ok(Ok(Err(e))) => return Err(self.fail(e.to_string())),
            Ok(Err(join)) => return Err(self.fail(join.to_string())),
            Err(_) => {
                return Err(self.fail(format!(
                    "connect timed out after {}ms",
                    self.timeout.as_millis()
                )))
            }
        };

        let socket = match sys::register(raw) {
            Ok(socket) => socket,
            Err(e) => return Err(self.fail(e.to_string())),
        };

        info!("Connected to {} on channel {}", address, channel);
        self.socket = Some(socket);
        self.address = Some(address.to_string());
        self.error = None;
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ObdError> {
        let socket = self.socket.as_ref().ok_or(ObdError::NotConnected)?;

        // Drop a late reply to an earlier command before the new one
        let sent = match sys::discard_input(socket) {
            Ok(dropped) => {
                if dropped > 0 {
                    debug!("Discarded {} stale bytes", dropped);
                }
                sys::write_all(socket, data).await
            }
            Err(e) => Err(e),
        };
        sent.map_err(|e| {
            self.error = Some(e.to_string());
            ObdError::from(e)
        })
    }

    async fn recv(&mut self, max_len: usize) -> Result<Vec<u8>, ObdError> {
        let socket = self.socket.as_ref().ok_or(ObdError::NotConnected)?;
        let mut buf = vec![0u8; max_len];
        let read = sys::read(socket, &mut buf).await;
        match read {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) => {
                self.error = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    async fn close(&mut self) {
        // Dropping the socket closes the descriptor
        if self.socket.take().is_some() {
            info!("Disconnecting from {}", self.address.as_deref().unwrap_or("?"));
        }
        self.address = None;
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use tokio::io::unix::AsyncFd;

    const AF_BLUETOOTH: libc::c_int = 31;
    const BTPROTO_RFCOMM: libc::c_int = 3;

    pub type Raw = OwnedFd;
    pub type Socket = AsyncFd<OwnedFd>;

    /// `struct sockaddr_rc` from `<bluetooth/rfcomm.h>`
    #[repr(C)]
    struct SockaddrRc {
        rc_family: libc::sa_family_t,
        rc_bdaddr: [u8; 6],
        rc_channel: u8,
    }

    fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret)
        }
    }

    /// Blocking connect, then switch the socket to non-blocking mode
    pub fn connect(mac: [u8; 6], channel: u8) -> io::Result<Raw> {
        // SAFETY: socket(2) has no memory preconditions; the result is checked
        let fd = check(unsafe {
            libc::socket(
                AF_BLUETOOTH,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                BTPROTO_RFCOMM,
            )
        })?;
        // SAFETY: fd is a freshly created descriptor owned by nobody else
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        // bdaddr_t is stored least significant byte first
        let mut bdaddr = mac;
        bdaddr.reverse();
        let addr = SockaddrRc {
            rc_family: AF_BLUETOOTH as libc::sa_family_t,
            rc_bdaddr: bdaddr,
            rc_channel: channel,
        };

        // SAFETY: addr is a valid sockaddr_rc and the length matches it
        check(unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &addr as *const SockaddrRc as *const libc::sockaddr,
                std::mem::size_of::<SockaddrRc>() as libc::socklen_t,
            )
        })?;

        // SAFETY: fcntl on a descriptor we own
        let flags = check(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) })?;
        check(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) })?;

        Ok(fd)
    }

    /// Hand the descriptor to the tokio reactor
    pub fn register(fd: Raw) -> io::Result<Socket> {
        AsyncFd::new(fd)
    }

    pub async fn read(socket: &Socket, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = socket.readable().await?;
            let result = guard.try_io(|inner| {
                // SAFETY: buf is valid for writes of buf.len() bytes
                let n = unsafe {
                    libc::read(
                        inner.get_ref().as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(read) => return read,
                Err(_would_block) => continue,
            }
        }
    }

    /// Read and drop whatever is already queued on the socket
    pub fn discard_input(socket: &Socket) -> io::Result<usize> {
        let mut buf = [0u8; 256];
        let mut dropped = 0;
        loop {
            // SAFETY: buf is valid for writes of buf.len() bytes
            let n = unsafe {
                libc::read(
                    socket.get_ref().as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n > 0 {
                dropped += n as usize;
                continue;
            }
            if n == 0 {
                return Ok(dropped);
            }
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock => Ok(dropped),
                io::ErrorKind::Interrupted => continue,
                _ => Err(err),
            };
        }
    }

    pub async fn write_all(socket: &Socket, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let mut guard = socket.writable().await?;
            let result = guard.try_io(|inner| {
                // SAFETY: data is valid for reads of data.len() bytes
                let n = unsafe {
                    libc::write(
                        inner.get_ref().as_raw_fd(),
                        data.as_ptr() as *const libc::c_void,
                        data.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::io;

    pub type Raw = std::convert::Infallible;
    pub type Socket = std::convert::Infallible;

    pub fn connect(_mac: [u8; 6], _channel: u8) -> io::Result<Raw> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "RFCOMM sockets are only supported on Linux",
        ))
    }

    pub fn register(raw: Raw) -> io::Result<Socket> {
        match raw {}
    }

    pub async fn read(socket: &Socket, _buf: &mut [u8]) -> io::Result<usize> {
        match *socket {}
    }

    pub fn discard_input(socket: &Socket) -> io::Result<usize> {
        match *socket {}
    }

    pub async fn write_all(socket: &Socket, _data: &[u8]) -> io::Result<()> {
        match *socket {}
    }
}
