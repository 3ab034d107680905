//! State shared between a session, its pumps and its keepalive task

use crate::config::SessionConfig;
use crate::lifecycle::{ChannelId, Handles};
use crate::observer::{ChannelObserverSlot, EventQueue};
use crate::registry::Registration;
use burrow_transport::Transport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use uuid::Uuid;

/// One session's handles and coordination primitives.
///
/// Lock order is `pump` before `handles`. Neither lock is held across an
/// `.await`.
pub(crate) struct Shared<T: Transport> {
    /// Session id, used in logs
    pub(crate) id: Uuid,
    /// Session configuration
    pub(crate) config: SessionConfig,
    /// Every protocol handle; the session-wide lock for raw calls
    handles: Mutex<Handles<T>>,
    /// Serializes a pump's drain-and-deliver step against teardown
    pump: Mutex<()>,
    /// Signalled after any raw call makes progress, since the library may
    /// have buffered data the socket no longer reports
    pub(crate) progress: Notify,
    /// Observer work queue
    pub(crate) events: EventQueue,
    /// Current channel observer
    pub(crate) channel_observer: ChannelObserverSlot,
    /// Registry entry for callbacks
    pub(crate) registration: Registration,
    next_channel: AtomicU64,
}

impl<T: Transport> Shared<T> {
    pub(crate) fn new(
        config: SessionConfig,
        handles: Handles<T>,
        events: EventQueue,
        channel_observer: ChannelObserverSlot,
        registration: Registration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            handles: Mutex::new(handles),
            pump: Mutex::new(()),
            progress: Notify::new(),
            events,
            channel_observer,
            registration,
            next_channel: AtomicU64::new(1),
        }
    }

    /// Acquire the session lock
    pub(crate) fn lock(&self) -> MutexGuard<'_, Handles<T>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the pump lock. Take it before [`Shared::lock`], never after.
    pub(crate) fn pump_lock(&self) -> MutexGuard<'_, ()> {
        self.pump.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_channel_id(&self) -> ChannelId {
        ChannelId(self.next_channel.fetch_add(1, Ordering::Relaxed))
    }
}
