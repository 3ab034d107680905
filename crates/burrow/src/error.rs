//! Error types for the Burrow library

use crate::lifecycle::Layer;
use burrow_transport::{RawError, TransportError};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Main error type for Burrow operations
#[derive(Debug, Error)]
pub enum SessionError {
    /// A readiness wait exceeded its deadline; the remote is slow or gone
    #[error("Timed out after {0:?} waiting for the socket")]
    Timeout(Duration),

    /// Writing to the socket failed
    #[error("Send failed: {0}")]
    Send(RawError),

    /// Reading from the socket failed
    #[error("Receive failed: {0}")]
    Recv(RawError),

    /// The remote refused the request
    #[error("Rejected by remote: {0}")]
    Rejected(RawError),

    /// Any other library failure
    #[error("Transport error: {0}")]
    Transport(RawError),

    /// The layer the operation needs is not open
    #[error("{0} is not open")]
    NotOpen(Layer),

    /// The host key was refused by the session observer
    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    /// Authentication could not be completed
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was cancelled by the caller or by teardown
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Connection(msg) => Self::Connection(msg),
            TransportError::Configuration(msg) => Self::Configuration(msg),
            TransportError::Io(e) => Self::Io(e),
            TransportError::Timeout => Self::Connection("connect timed out".to_string()),
            TransportError::Library(raw) => Self::Transport(raw),
        }
    }
}

impl SessionError {
    /// True when the remote refused rather than failed
    pub fn is_rejection(&self) -> bool {
        matches!(self, SessionError::Rejected(_))
    }
}

/// Turns remote refusals into plain `false` / `None` results
pub(crate) trait RejectionExt<T> {
    /// `Ok(Some(v))`, `Ok(None)` when refused, `Err` otherwise
    fn or_refused(self) -> crate::Result<Option<T>>;
}

impl<T> RejectionExt<T> for crate::Result<T> {
    fn or_refused(self) -> crate::Result<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(SessionError::Rejected(raw)) => {
                debug!("Refused: {}", raw);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// `Ok(true)` on success, `Ok(false)` when refused
pub(crate) fn accepted(result: crate::Result<()>) -> crate::Result<bool> {
    result.or_refused().map(|r| r.is_some())
}
