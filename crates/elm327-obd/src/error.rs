//! OBD-II Error Types

use thiserror::Error;

/// Errors that can occur while talking to an ELM327 adapter
#[derive(Debug, Clone, Error)]
pub enum ObdError {
    /// Transport could not be opened (bad address or attempts exhausted)
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// Adapter answered `ATI` with an unexpected banner
    #[error("Unexpected adapter banner: {0:?}")]
    ProtocolMismatch(String),

    /// Every bus protocol probe failed
    #[error("No protocol available (engine likely off)")]
    NoProtocolAvailable,

    /// Adapter reported `CAN ERROR`
    #[error("Disconnected from CAN bus")]
    BusDisconnected,

    /// Reply text did not have the expected shape
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Adapter produced an empty reply
    #[error("OBD adapter not responding")]
    NoResponse,

    /// Stream closed, timed out or was shut down mid-command
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Adapter refused a control command
    #[error("Command {command} rejected by adapter: {reply:?}")]
    CommandRejected { command: String, reply: String },

    /// Operation requires an open session
    #[error("Not connected to adapter")]
    NotConnected,

    /// Operation is not allowed in the current session state
    #[error("Operation not allowed while {0}")]
    InvalidState(&'static str),

    /// Low-level I/O error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ObdError {
    /// Whether the error ends the session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ObdError::ConnectFailed(_)
                | ObdError::ProtocolMismatch(_)
                | ObdError::NoProtocolAvailable
                | ObdError::BusDisconnected
                | ObdError::ConnectionLost(_)
        )
    }
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::Transport(err.to_string())
    }
}

impl From<::config::ConfigError> for ObdError {
    fn from(err: ::config::ConfigError) -> Self {
        ObdError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ObdError::BusDisconnected.is_fatal());
        assert!(ObdError::NoProtocolAvailable.is_fatal());
        assert!(ObdError::ProtocolMismatch("OBDII v1".into()).is_fatal());
        assert!(!ObdError::NoResponse.is_fatal());
        assert!(!ObdError::MalformedResponse("zz".into()).is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: ObdError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, ObdError::Transport(msg) if msg.contains("pipe")));
    }
}
