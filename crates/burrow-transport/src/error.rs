//! Transport-level error types

use std::fmt;
use std::io;
use thiserror::Error;

/// Errors raised while establishing or configuring the underlying connection
#[derive(Debug, Error)]
pub enum TransportError {
    /// TCP connection could not be established
    #[error("connection error: {0}")]
    Connection(String),

    /// Invalid or unusable configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// I/O error on the socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connecting took longer than the configured limit
    #[error("connection timed out")]
    Timeout,

    /// The transport library refused to initialise a session
    #[error("transport library error: {0}")]
    Library(RawError),
}

/// Raw libssh2 error codes this crate interprets.
///
/// Only the codes the session layer needs to tell apart are listed; every other
/// code is carried through verbatim.
pub mod codes {
    /// Outgoing socket write failed
    pub const SOCKET_SEND: i32 = -7;
    /// Blocking call exceeded the library timeout
    pub const TIMEOUT: i32 = -9;
    /// Remote closed the socket
    pub const SOCKET_DISCONNECT: i32 = -13;
    /// Generic file error; also signals "no more entries" from readdir
    pub const FILE: i32 = -16;
    /// Username/password or key refused
    pub const AUTHENTICATION_FAILED: i32 = -18;
    /// Public key not accepted by the remote
    pub const PUBLICKEY_UNVERIFIED: i32 = -19;
    /// Channel open or request failed
    pub const CHANNEL_FAILURE: i32 = -21;
    /// Channel request denied by the remote
    pub const CHANNEL_REQUEST_DENIED: i32 = -22;
    /// Channel already closed
    pub const CHANNEL_CLOSED: i32 = -26;
    /// EOF was already sent on this channel
    pub const CHANNEL_EOF_SENT: i32 = -27;
    /// SFTP subsystem reported a status failure
    pub const SFTP_PROTOCOL: i32 = -31;
    /// Operation would block; retry once the socket is ready
    pub const EAGAIN: i32 = -37;
    /// Incoming socket read failed
    pub const SOCKET_RECV: i32 = -43;
}

/// Domain of a raw error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawCode {
    /// A libssh2 session-level code (negative)
    Session(i32),
    /// An SFTP status code (positive, `SSH_FX_*`)
    Sftp(i32),
}

impl fmt::Display for RawCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawCode::Session(code) => write!(f, "session {}", code),
            RawCode::Sftp(code) => write!(f, "sftp {}", code),
        }
    }
}

/// One failed raw protocol call: a library code plus its message.
///
/// Would-block is represented as [`codes::EAGAIN`] and is *not* an error for
/// callers of the session layer; it is absorbed by the retry adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{code}] {message}")]
pub struct RawError {
    code: RawCode,
    message: String,
}

/// Outcome of a single raw protocol call
pub type RawResult<T> = std::result::Result<T, RawError>;

impl RawError {
    /// Create an error from a session-level code
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: RawCode::Session(code),
            message: message.into(),
        }
    }

    /// Create an error from an SFTP status code
    pub fn sftp(status: i32, message: impl Into<String>) -> Self {
        Self {
            code: RawCode::Sftp(status),
            message: message.into(),
        }
    }

    /// The "try again later" signal
    pub fn would_block() -> Self {
        Self::new(codes::EAGAIN, "would block")
    }

    /// Error code and domain
    pub fn code(&self) -> RawCode {
        self.code
    }

    /// Human readable message reported by the library
    pub fn message(&self) -> &str {
        &self.message
    }

    /// True when the call made no progress and should be retried
    pub fn is_would_block(&self) -> bool {
        self.code == RawCode::Session(codes::EAGAIN)
    }

    /// True when the session code equals `code`
    pub fn is_session_code(&self, code: i32) -> bool {
        self.code == RawCode::Session(code)
    }

    /// Convert an `io::Error` returned by a channel or file read
    pub fn from_read(err: io::Error) -> Self {
        Self::from_io(err, codes::SOCKET_RECV)
    }

    /// Convert an `io::Error` returned by a channel or file write
    pub fn from_write(err: io::Error) -> Self {
        Self::from_io(err, codes::SOCKET_SEND)
    }

    fn from_io(err: io::Error, fallback: i32) -> Self {
        if err.kind() == io::ErrorKind::WouldBlock {
            return Self::would_block();
        }
        if let Some(inner) = err.get_ref().and_then(|e| e.downcast_ref::<ssh2::Error>()) {
            return Self::from_ssh2(inner);
        }
        Self::new(fallback, err.to_string())
    }
}

impl RawError {
    fn from_ssh2(err: &ssh2::Error) -> Self {
        let code = match err.code() {
            ssh2::ErrorCode::Session(code) => RawCode::Session(code),
            ssh2::ErrorCode::SFTP(status) => RawCode::Sftp(status),
        };
        Self {
            code,
            message: err.message().to_string(),
        }
    }
}

impl From<ssh2::Error> for RawError {
    fn from(err: ssh2::Error) -> Self {
        Self::from_ssh2(&err)
    }
}
