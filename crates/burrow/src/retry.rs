//! Retry-until-ready adapter.
//!
//! Wraps one raw, non-blocking call: run it under the session lock, and on
//! would-block wait for the socket in whichever direction the library is
//! blocked before trying again. Every would-block is followed by a real
//! wait, never an immediate retry.
//!
//! This is also the only place raw library codes become [`SessionError`]s.

use crate::error::SessionError;
use crate::lifecycle::{Handles, WaitTarget};
use crate::shared::Shared;
use crate::Result;
use burrow_transport::{codes, RawCode, RawError, RawResult, Transport, WaitOutcome};
use std::pin::pin;
use std::time::Duration;
use tracing::{debug, trace};

/// Outcome of one raw attempt
pub(crate) enum Attempt<R> {
    Ready(R),
    WouldBlock,
    Failed(SessionError),
}

impl<R> From<RawResult<R>> for Attempt<R> {
    fn from(result: RawResult<R>) -> Self {
        match result {
            Ok(value) => Attempt::Ready(value),
            Err(e) if e.is_would_block() => Attempt::WouldBlock,
            Err(e) => Attempt::Failed(classify(e)),
        }
    }
}

/// Map a raw library error onto the session error taxonomy
pub(crate) fn classify(err: RawError) -> SessionError {
    match err.code() {
        RawCode::Sftp(_) => SessionError::Rejected(err),
        RawCode::Session(code) => match code {
            codes::SOCKET_SEND => SessionError::Send(err),
            codes::SOCKET_RECV | codes::SOCKET_DISCONNECT => SessionError::Recv(err),
            codes::AUTHENTICATION_FAILED
            | codes::PUBLICKEY_UNVERIFIED
            | codes::CHANNEL_FAILURE
            | codes::CHANNEL_REQUEST_DENIED
            | codes::SFTP_PROTOCOL
            | codes::FILE => SessionError::Rejected(err),
            _ => SessionError::Transport(err),
        },
    }
}

impl<T: Transport> Shared<T> {
    /// Run `op` until it stops reporting would-block.
    ///
    /// `op` performs exactly one raw call. Returning `Err` from `op` itself
    /// (a closed layer, say) ends the loop without waiting.
    pub(crate) async fn call<R, F>(&self, mut op: F) -> Result<R>
    where
        F: FnMut(&mut Handles<T>) -> Result<RawResult<R>>,
    {
        let mut waits = 0usize;
        loop {
            // Registered before the attempt so progress made by another task
            // between the attempt and the wait is not missed.
            let mut progress = pin!(self.progress.notified());
            progress.as_mut().enable();

            let target = {
                let mut handles = self.lock();
                match Attempt::from(op(&mut handles)?) {
                    Attempt::Ready(value) => {
                        drop(handles);
                        if waits > 0 {
                            trace!("Ready after {} wait(s)", waits);
                        }
                        self.progress.notify_waiters();
                        return Ok(value);
                    }
                    Attempt::Failed(e) => return Err(e),
                    Attempt::WouldBlock => handles.wait_target()?,
                }
            };

            waits += 1;
            self.wait(target, progress).await?;
        }
    }

    /// Run `op` once; `Ok(None)` if it would block
    pub(crate) fn try_call<R, F>(&self, op: F) -> Result<Option<R>>
    where
        F: FnOnce(&mut Handles<T>) -> Result<RawResult<R>>,
    {
        let result = op(&mut self.lock())?;
        match Attempt::from(result) {
            Attempt::Ready(value) => {
                self.progress.notify_waiters();
                Ok(Some(value))
            }
            Attempt::WouldBlock => Ok(None),
            Attempt::Failed(e) => Err(e),
        }
    }

    async fn wait(
        &self,
        target: WaitTarget,
        progress: std::pin::Pin<&mut tokio::sync::futures::Notified<'_>>,
    ) -> Result<()> {
        let timeout: Duration = self.config.wait_timeout();
        trace!("Waiting for {:?} (timeout {:?})", target.directions, timeout);

        tokio::select! {
            biased;
            _ = target.cancel.cancelled() => Err(SessionError::Cancelled),
            outcome = target.socket.wait_ready(target.directions, Some(timeout)) => match outcome {
                WaitOutcome::Ready => Ok(()),
                WaitOutcome::TimedOut => {
                    debug!("Session {}: no readiness within {:?}", self.id, timeout);
                    Err(SessionError::Timeout(timeout))
                }
                WaitOutcome::Failed(e) => Err(SessionError::Io(e)),
            },
            _ = progress => Ok(()),
        }
    }
}
