//! # Burrow SSH Transport
//!
//! The non-blocking transport boundary for Burrow: raw protocol traits whose
//! calls may report "would block", the libssh2 backend implementing them, and
//! the TCP socket used to wait for readiness between retries.

#![warn(missing_docs)]

/// Transport traits and protocol value types
pub mod transport;

/// TCP connection and readiness waiting
pub mod connection;

/// Block directions and the socket wait contract
pub mod readiness;

/// libssh2 backend
pub mod libssh2;

/// Transport error types and raw library codes
pub mod error;

pub use connection::Connection;
pub use error::{codes, RawCode, RawError, RawResult, TransportError};
pub use libssh2::{Ssh2Options, Ssh2Transport};
pub use readiness::{BlockDirections, Socket, WaitOutcome};
pub use transport::{
    DirEntry, FileStat, FingerprintHash, HostKeyKind, MethodKind, OpenFlags, OpenType, Prompt,
    PromptResponder, PtyDimensions, RawChannel, RawFile, RawSftp, RenameFlags, StreamTag,
    Transport,
};
