//! Socket readiness: which way the library is blocked, and waiting for it

use async_trait::async_trait;
use std::io;
use std::time::Duration;

/// Direction(s) the transport library is blocked on after a would-block result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDirections {
    /// Not blocked
    None,
    /// Waiting for the socket to become readable
    Inbound,
    /// Waiting for the socket to become writable
    Outbound,
    /// Waiting for either direction
    Both,
}

impl BlockDirections {
    /// Directions to wait on when the library reports none.
    ///
    /// A would-block with no recorded direction still needs a real wait; inbound
    /// is where unsolicited protocol traffic arrives.
    pub fn or_inbound(self) -> Self {
        match self {
            BlockDirections::None => BlockDirections::Inbound,
            other => other,
        }
    }

    /// True if readability satisfies this wait
    pub fn wants_read(self) -> bool {
        matches!(self, BlockDirections::Inbound | BlockDirections::Both)
    }

    /// True if writability satisfies this wait
    pub fn wants_write(self) -> bool {
        matches!(self, BlockDirections::Outbound | BlockDirections::Both)
    }
}

impl From<ssh2::BlockDirections> for BlockDirections {
    fn from(dirs: ssh2::BlockDirections) -> Self {
        match dirs {
            ssh2::BlockDirections::None => BlockDirections::None,
            ssh2::BlockDirections::Inbound => BlockDirections::Inbound,
            ssh2::BlockDirections::Outbound => BlockDirections::Outbound,
            ssh2::BlockDirections::Both => BlockDirections::Both,
        }
    }
}

/// Result of one readiness wait
#[derive(Debug)]
pub enum WaitOutcome {
    /// The socket satisfied the requested direction
    Ready,
    /// The deadline elapsed first
    TimedOut,
    /// Polling the descriptor failed
    Failed(io::Error),
}

impl WaitOutcome {
    /// True for [`WaitOutcome::Ready`]
    pub fn is_ready(&self) -> bool {
        matches!(self, WaitOutcome::Ready)
    }
}

/// A connected socket that can be waited on.
///
/// Implementations wait on exactly one descriptor and hold no per-wait
/// registrations, so calling [`Socket::wait_ready`] in a loop does not leak.
#[async_trait]
pub trait Socket: Send + Sync {
    /// Suspend until the socket satisfies `directions` or `timeout` elapses.
    ///
    /// `None` waits without a deadline.
    async fn wait_ready(&self, directions: BlockDirections, timeout: Option<Duration>)
        -> WaitOutcome;

    /// Shut both halves of the socket down
    fn shutdown(&self) -> io::Result<()>;
}
