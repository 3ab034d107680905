//! Keep-alive scheduling.
//!
//! Once a session is authenticated, a background task sends a keep-alive message
//! every interval through the non-waiting adapter. A send failure stops the
//! task; whether to close the session is left to its owner.

use crate::error::SessionError;
use crate::observer::SessionEvent;
use crate::shared::Shared;
use crate::Result;
use burrow_transport::Transport;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Keep-alive task handle
pub(crate) struct KeepaliveHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl KeepaliveHandle {
    /// Start probing every `period` until `cancel` fires
    fn spawn<T: Transport>(
        shared: Weak<Shared<T>>,
        period: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let task = tokio::spawn(run(shared, period, cancel.clone()));
        Self { cancel, task }
    }

    /// Stop the task. Safe to call repeatedly.
    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }
}

impl Drop for KeepaliveHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run<T: Transport>(shared: Weak<Shared<T>>, period: Duration, cancel: CancellationToken) {
    debug!("Keep-alive task started with interval: {:?}", period);

    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(session) = shared.upgrade() else {
            break;
        };

        // The ticker does not advance while the message is sent.
        let sent = session.try_call(|handles| {
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            Ok(handles.transport()?.keepalive_send())
        });
        let events = session.events.clone();
        drop(session);

        match sent {
            Ok(Some(next)) => trace!("Keep-alive sent, next due in {}s", next),
            Ok(None) => trace!("Keep-alive would block; retrying next tick"),
            Err(SessionError::Send(e)) => {
                warn!("Keep-alive failed: {} - stopping task", e);
                events.session(SessionEvent::Debug(format!("keep-alive stopped: {}", e)));
                cancel.cancel();
                break;
            }
            Err(SessionError::NotOpen(_)) | Err(SessionError::Cancelled) => break,
            Err(e) => warn!("Keep-alive failed: {}", e),
        }
    }

    debug!("Keep-alive task stopped");
}

impl<T: Transport> Shared<T> {
    /// Start the keep-alive task if configured. Returns whether one is running.
    pub(crate) fn start_keepalive(self: &Arc<Self>) -> Result<bool> {
        let Some(period) = self.config.keepalive_period() else {
            return Ok(false);
        };

        let weak = Arc::downgrade(self);
        let mut handles = self.lock();
        let control = handles.control()?;
        if control.keepalive.as_ref().is_some_and(KeepaliveHandle::is_running) {
            return Ok(true);
        }

        let secs = u32::try_from(period.as_secs()).unwrap_or(u32::MAX);
        control.transport.keepalive_configure(false, secs);
        let cancel = control.cancel.child_token();
        control.keepalive = Some(KeepaliveHandle::spawn(weak, period, cancel));
        Ok(true)
    }

    pub(crate) fn keepalive_running(&self) -> bool {
        self.lock()
            .control
            .open()
            .and_then(|control| control.keepalive.as_ref())
            .is_some_and(KeepaliveHandle::is_running)
    }
}
