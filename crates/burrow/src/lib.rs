//! # Burrow
//!
//! Async SSH sessions over a non-blocking libssh2 transport.
//!
//! A [`Session`] owns four nested layers (connection, control session, one
//! sub-channel and an optional file-transfer session) and drives every raw
//! call through a single retry loop that waits on socket readiness instead
//! of blocking. On top of that it offers interactive shells, command
//! execution, port forwarding, SFTP and SCP.
//!
//! ```no_run
//! use burrow::{Credentials, NoopObserver, Session, SessionConfig};
//! use std::sync::Arc;
//!
//! # async fn demo() -> burrow::Result<()> {
//! let config = SessionConfig {
//!     host: "build.example.net".to_string(),
//!     username: "deploy".to_string(),
//!     ..Default::default()
//! };
//! let session = Session::connect(config, Arc::new(NoopObserver)).await?;
//! session
//!     .authenticate(&Credentials::Password("secret".to_string()))
//!     .await?;
//! if let Some(output) = session.exec("uname -a").await? {
//!     println!("{}", String::from_utf8_lossy(&output.stdout));
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use burrow_transport as transport;

/// Error types for the Burrow library
pub mod error;

/// Session configuration and credentials
pub mod config;

/// Event and callback surface
pub mod observer;

/// Process-wide session registry
pub mod registry;

/// Layer and channel lifecycle
pub mod lifecycle;

/// Channel data pump
pub mod pump;

/// Session management and connection handling
pub mod session;

/// File-transfer operations
pub mod sftp;

/// Whole-file upload and download
pub mod transfer;

mod keepalive;
mod retry;
mod shared;

#[cfg(test)]
mod test_utils;

pub use burrow_transport::{
    DirEntry, FileStat, FingerprintHash, HostKeyKind, MethodKind, Prompt, PtyDimensions,
    RenameFlags, StreamTag,
};
pub use config::{Credentials, SessionBuilder, SessionConfig};
pub use error::SessionError;
pub use lifecycle::{ChannelId, ChannelKind, ChannelState, Layer};
pub use observer::{
    ChannelEvent, ChannelObserver, NoopObserver, ObserverSink, SessionEvent, SessionObserver,
};
pub use pump::{
    BufferSink, ChannelSink, Completion, Flow, PumpHandle, PumpOutcome, PumpState,
};
pub use registry::SessionToken;
pub use session::{ExecOutput, Session};
pub use sftp::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
pub use transfer::TransferMode;

/// Result type alias for Burrow operations
pub type Result<T> = std::result::Result<T, SessionError>;
