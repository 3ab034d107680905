//! Session and channel observers.
//!
//! Events are queued from the protocol side without blocking and delivered
//! by a dedicated dispatcher task, so a slow observer never stalls I/O.

use crate::lifecycle::{ChannelId, ChannelKind, Layer};
use async_trait::async_trait;
use burrow_transport::{Prompt, StreamTag};
use bytes::Bytes;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Session-level notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Handshake finished
    Connected {
        /// SHA-256 host key fingerprint
        fingerprint: Option<String>,
    },
    /// Authentication succeeded
    Authenticated {
        /// Method that succeeded
        method: String,
    },
    /// One layer was torn down
    LayerClosed(Layer),
    /// The connection is gone
    Disconnected,
    /// Bytes written to a sub-channel
    Sent(usize),
    /// Bytes read from a sub-channel
    Received(usize),
    /// Free-form diagnostic
    Debug(String),
}

/// Channel-level notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel opened
    Opened(ChannelKind),
    /// Bytes from one of the channel's streams
    Data {
        /// Stream the bytes came from
        tag: StreamTag,
        /// The bytes
        bytes: Bytes,
    },
    /// The channel was torn down
    Closed,
}

/// Receives session events and answers session callbacks
#[async_trait]
pub trait SessionObserver: Send + Sync {
    /// Accept or refuse the server's host key
    fn verify_host_key(&self, _fingerprint: &str) -> bool {
        true
    }

    /// Answer one keyboard-interactive prompt
    fn keyboard_interactive(&self, _username: &str, _prompt: &Prompt) -> String {
        String::new()
    }

    /// Handle a session event
    async fn on_session_event(&self, _event: SessionEvent) {}
}

/// Receives sub-channel events
#[async_trait]
pub trait ChannelObserver: Send + Sync {
    /// Handle a channel event
    async fn on_channel_event(&self, channel: ChannelId, event: ChannelEvent);
}

/// Observer that accepts every host key and ignores events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

#[async_trait]
impl SessionObserver for NoopObserver {}

/// Slot for the current channel observer
pub(crate) type ChannelObserverSlot = Arc<Mutex<Option<Arc<dyn ChannelObserver>>>>;

enum Dispatch {
    Session(SessionEvent),
    Channel(ChannelId, ChannelEvent),
}

/// Producer side of the observer work queue
#[derive(Clone)]
pub(crate) struct EventQueue {
    tx: mpsc::UnboundedSender<Dispatch>,
}

impl EventQueue {
    /// Queue a session event
    pub(crate) fn session(&self, event: SessionEvent) {
        trace!("Session event: {:?}", event);
        if self.tx.send(Dispatch::Session(event)).is_err() {
            trace!("Dispatcher gone, event dropped");
        }
    }

    /// Queue a channel event
    pub(crate) fn channel(&self, id: ChannelId, event: ChannelEvent) {
        if self.tx.send(Dispatch::Channel(id, event)).is_err() {
            trace!("Dispatcher gone, channel event dropped");
        }
    }

    /// Spawn the dispatcher task and return its queue.
    ///
    /// The task ends once every queue handle is dropped and the backlog is
    /// delivered.
    pub(crate) fn spawn(
        observer: Arc<dyn SessionObserver>,
        channel_observer: ChannelObserverSlot,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(dispatch) = rx.recv().await {
                match dispatch {
                    Dispatch::Session(event) => observer.on_session_event(event).await,
                    Dispatch::Channel(id, event) => {
                        let current = channel_observer
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .clone();
                        if let Some(current) = current {
                            current.on_channel_event(id, event).await;
                        }
                    }
                }
            }
            debug!("Event dispatcher finished");
        });

        Self { tx }
    }
}

/// Sink that forwards stream data to the channel observer
pub struct ObserverSink {
    channel: ChannelId,
    events: EventQueue,
}

impl ObserverSink {
    pub(crate) fn new(channel: ChannelId, events: EventQueue) -> Self {
        Self { channel, events }
    }
}

impl crate::pump::ChannelSink for ObserverSink {
    fn on_data(&mut self, tag: StreamTag, data: &[u8]) -> crate::pump::Flow {
        self.events.channel(
            self.channel,
            ChannelEvent::Data {
                tag,
                bytes: Bytes::copy_from_slice(data),
            },
        );
        crate::pump::Flow::Continue
    }
}
