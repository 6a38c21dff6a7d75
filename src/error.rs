//! Errors surfaced by the registry, the poll manager and the service facade.
//!
//! Protocol problems (bad checksum, device status flags) and response
//! timeouts are not errors here: they come back as values from
//! `frame::validate` and `PortSession::send`.

use thiserror::Error;

use crate::port::PortError;
use crate::registry::PortId;
use crate::session::SessionError;

/// A specialized `Result` type for hub operations.
pub type HubResult<T> = Result<T, HubError>;

/// Unified error type for caller-facing operations.
#[derive(Debug, Error)]
pub enum HubError {
    /// Line settings rejected before touching the transport.
    #[error("Invalid port settings: {0}")]
    Config(String),

    /// The driver could not open the device.
    #[error("Failed to open serial port '{path}': {source}")]
    TransportOpen {
        path: String,
        #[source]
        source: PortError,
    },

    #[error("Port not found: {0}")]
    PortNotFound(PortId),

    #[error("No poll job for port {port_id}, device {device_id}")]
    PollNotFound { port_id: PortId, device_id: u8 },

    /// Write failure, closed or faulted session.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Enumerating system ports failed.
    #[error("Port enumeration failed: {0}")]
    Enumerate(#[source] PortError),
}

impl HubError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Stable, machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::TransportOpen { .. } => "TransportOpenError",
            Self::PortNotFound(_) => "PortNotFoundError",
            Self::PollNotFound { .. } => "PollNotFoundError",
            Self::Session(SessionError::Write(_)) => "WriteError",
            Self::Session(SessionError::Closed) => "PortClosedError",
            Self::Session(SessionError::Faulted(_)) => "TransportFaultError",
            Self::Session(SessionError::Transport(_)) => "TransportError",
            Self::Enumerate(_) => "EnumerateError",
        }
    }
}
