//! Resource lifecycle: the nested handle hierarchy and its teardown order.
//!
//! Handles nest as connection → control session → {sub-channel, file-transfer
//! session}. Each layer is a [`LayerState`] rather than a nullable handle, and
//! closing a layer always closes everything nested inside it first.

use crate::error::SessionError;
use crate::keepalive::KeepaliveHandle;
use crate::observer::{ChannelEvent, EventQueue, SessionEvent};
use crate::registry::LibraryRef;
use crate::shared::Shared;
use crate::Result;
use burrow_transport::{
    codes, BlockDirections, RawChannel, RawFile, RawResult, RawSftp, Socket, Transport,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One layer of the handle hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layer {
    /// The TCP connection
    Connection,
    /// The authenticated control session
    Control,
    /// The current sub-channel
    Channel,
    /// The file-transfer (SFTP) session
    FileTransfer,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Layer::Connection => "connection",
            Layer::Control => "control session",
            Layer::Channel => "channel",
            Layer::FileTransfer => "file-transfer session",
        })
    }
}

/// Lifecycle of one handle
#[derive(Debug)]
pub(crate) enum LayerState<H> {
    Closed,
    Opening,
    Open(H),
}

impl<H> LayerState<H> {
    pub(crate) fn open(&self) -> Option<&H> {
        match self {
            LayerState::Open(handle) => Some(handle),
            _ => None,
        }
    }

    pub(crate) fn open_mut(&mut self) -> Option<&mut H> {
        match self {
            LayerState::Open(handle) => Some(handle),
            _ => None,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        matches!(self, LayerState::Open(_))
    }

    pub(crate) fn is_opening(&self) -> bool {
        matches!(self, LayerState::Opening)
    }

    /// Mark closed, returning the handle if one was open
    pub(crate) fn take(&mut self) -> Option<H> {
        match mem::replace(self, LayerState::Closed) {
            LayerState::Open(handle) => Some(handle),
            LayerState::Opening => {
                debug!("Abandoning a layer that was still opening");
                None
            }
            LayerState::Closed => None,
        }
    }
}

/// Identifies one sub-channel over the life of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a sub-channel was opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// "session" channel: shell, exec or subsystem
    Session,
    /// Forwarded TCP connection
    DirectTcpip,
    /// Forwarded unix socket connection
    StreamLocal,
    /// SCP upload
    ScpSend,
    /// SCP download
    ScpRecv,
}

impl ChannelKind {
    /// Whether teardown sends end-of-stream before closing
    fn sends_eof_on_close(self) -> bool {
        !matches!(self, ChannelKind::ScpRecv)
    }
}

/// Observable state of the current sub-channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// No channel
    Closed,
    /// Open call in flight
    Opening,
    /// Open, remote still sending
    Open,
    /// Remote sent end-of-stream
    EofReceived,
    /// Remote reported an exit status
    ExitReceived(i32),
}

/// TCP layer
pub(crate) struct ConnectionLayer {
    pub(crate) socket: Arc<dyn Socket>,
    pub(crate) cancel: CancellationToken,
}

/// Control session layer
pub(crate) struct ControlSession<T> {
    pub(crate) transport: T,
    /// Child of the connection token; parent of keepalive and pump tokens
    pub(crate) cancel: CancellationToken,
    pub(crate) keepalive: Option<KeepaliveHandle>,
    _library: LibraryRef,
}

/// Current sub-channel
pub(crate) struct ActiveChannel<C> {
    pub(crate) id: ChannelId,
    pub(crate) kind: ChannelKind,
    pub(crate) handle: C,
    /// `Open`, `EofReceived` or `ExitReceived`
    pub(crate) phase: ChannelState,
    pub(crate) eof_sent: bool,
    pub(crate) pump: Option<CancellationToken>,
}

/// Identifies a remote file open within the file-transfer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FileId(u64);

/// File-transfer layer and the files open on it
pub(crate) struct SftpSession<S: RawSftp> {
    pub(crate) sftp: S,
    files: HashMap<FileId, S::File>,
    next_file: u64,
}

impl<S: RawSftp> SftpSession<S> {
    fn new(sftp: S) -> Self {
        Self {
            sftp,
            files: HashMap::new(),
            next_file: 1,
        }
    }

    pub(crate) fn insert(&mut self, file: S::File) -> FileId {
        let id = FileId(self.next_file);
        self.next_file += 1;
        self.files.insert(id, file);
        id
    }

    pub(crate) fn file(&mut self, id: FileId) -> Result<&mut S::File> {
        self.files
            .get_mut(&id)
            .ok_or(SessionError::NotOpen(Layer::FileTransfer))
    }

    pub(crate) fn remove(&mut self, id: FileId) -> Option<S::File> {
        self.files.remove(&id)
    }
}

/// Where and how long to wait after a would-block
pub(crate) struct WaitTarget {
    pub(crate) socket: Arc<dyn Socket>,
    pub(crate) directions: BlockDirections,
    pub(crate) cancel: CancellationToken,
}

/// Every handle a session owns
pub(crate) struct Handles<T: Transport> {
    pub(crate) connection: LayerState<ConnectionLayer>,
    pub(crate) control: LayerState<ControlSession<T>>,
    pub(crate) channel: LayerState<ActiveChannel<T::Channel>>,
    pub(crate) sftp: LayerState<SftpSession<T::Sftp>>,
}

impl<T: Transport> Handles<T> {
    /// Connection and control layers open, nothing nested yet
    pub(crate) fn new(socket: Arc<dyn Socket>, transport: T, library: LibraryRef) -> Self {
        let connection_cancel = CancellationToken::new();
        let control_cancel = connection_cancel.child_token();

        Self {
            connection: LayerState::Open(ConnectionLayer {
                socket,
                cancel: connection_cancel,
            }),
            control: LayerState::Open(ControlSession {
                transport,
                cancel: control_cancel,
                keepalive: None,
                _library: library,
            }),
            channel: LayerState::Closed,
            sftp: LayerState::Closed,
        }
    }

    pub(crate) fn control(&mut self) -> Result<&mut ControlSession<T>> {
        self.control
            .open_mut()
            .ok_or(SessionError::NotOpen(Layer::Control))
    }

    pub(crate) fn transport(&mut self) -> Result<&mut T> {
        Ok(&mut self.control()?.transport)
    }

    pub(crate) fn channel(&mut self) -> Result<&mut ActiveChannel<T::Channel>> {
        self.channel
            .open_mut()
            .ok_or(SessionError::NotOpen(Layer::Channel))
    }

    /// The current channel, if it is still `id`
    pub(crate) fn channel_with_id(&mut self, id: ChannelId) -> Option<&mut ActiveChannel<T::Channel>> {
        self.channel.open_mut().filter(|channel| channel.id == id)
    }

    pub(crate) fn sftp(&mut self) -> Result<&mut SftpSession<T::Sftp>> {
        self.sftp
            .open_mut()
            .ok_or(SessionError::NotOpen(Layer::FileTransfer))
    }

    pub(crate) fn is_open(&self, layer: Layer) -> bool {
        match layer {
            Layer::Connection => self.connection.is_open(),
            Layer::Control => self.control.is_open(),
            Layer::Channel => self.channel.is_open(),
            Layer::FileTransfer => self.sftp.is_open(),
        }
    }

    pub(crate) fn channel_state(&self) -> ChannelState {
        match &self.channel {
            LayerState::Closed => ChannelState::Closed,
            LayerState::Opening => ChannelState::Opening,
            LayerState::Open(channel) => channel.phase,
        }
    }

    /// Socket and directions for the next readiness wait
    pub(crate) fn wait_target(&self) -> Result<WaitTarget> {
        let connection = self
            .connection
            .open()
            .ok_or(SessionError::NotOpen(Layer::Connection))?;

        let (directions, cancel) = match &self.control {
            LayerState::Open(control) => (
                control.transport.block_directions(),
                control.cancel.clone(),
            ),
            _ => (BlockDirections::Both, connection.cancel.clone()),
        };

        Ok(WaitTarget {
            socket: connection.socket.clone(),
            directions: directions.or_inbound(),
            cancel,
        })
    }

    /// Close `layer` and everything nested in it, innermost first.
    ///
    /// Returns whether `layer` itself was open.
    pub(crate) fn close(&mut self, layer: Layer, events: &EventQueue) -> bool {
        match layer {
            Layer::Channel => self.close_channel(events),
            Layer::FileTransfer => self.close_sftp(events),
            Layer::Control => {
                self.close_channel(events);
                self.close_sftp(events);
                self.close_control(events)
            }
            Layer::Connection => {
                self.close(Layer::Control, events);
                self.close_connection(events)
            }
        }
    }

    fn set_nonblocking(&mut self) {
        if let Some(control) = self.control.open_mut() {
            control.transport.set_blocking(false);
        }
    }

    fn close_channel(&mut self, events: &EventQueue) -> bool {
        let Some(mut channel) = self.channel.take() else {
            return false;
        };
        debug!("Closing channel {} ({:?})", channel.id, channel.kind);

        if let Some(pump) = channel.pump.take() {
            pump.cancel();
        }
        self.set_nonblocking();

        if channel.kind.sends_eof_on_close() && !channel.eof_sent {
            if let Err(e) = channel.handle.send_eof() {
                warn!("Channel {}: end-of-stream not sent: {}", channel.id, e);
            }
        }
        if let Err(e) = channel.handle.close() {
            if !e.is_would_block() {
                warn!("Channel {}: close failed: {}", channel.id, e);
            }
        }

        events.channel(channel.id, ChannelEvent::Closed);
        events.session(SessionEvent::LayerClosed(Layer::Channel));
        drop(channel);
        true
    }

    fn close_sftp(&mut self, events: &EventQueue) -> bool {
        let Some(mut session) = self.sftp.take() else {
            return false;
        };
        debug!("Closing file-transfer session ({} open files)", session.files.len());

        // Nothing here waits for readiness. A file close that would block is
        // finished on drop in blocking mode, bounded by the transport timeout.
        // A shutdown that would block is abandoned.
        self.set_nonblocking();
        for (_, mut file) in session.files.drain() {
            if let Err(e) = file.close() {
                if !e.is_would_block() {
                    debug!("Remote file close failed: {}", e);
                }
            }
        }
        if let Err(e) = session.sftp.shutdown() {
            if !e.is_would_block() {
                debug!("File-transfer shutdown failed: {}", e);
            }
        }

        events.session(SessionEvent::LayerClosed(Layer::FileTransfer));
        drop(session);
        true
    }

    fn close_control(&mut self, events: &EventQueue) -> bool {
        let Some(mut control) = self.control.take() else {
            return false;
        };
        debug!("Closing control session");

        // Keepalive and pumps are children of this token.
        control.cancel.cancel();
        if let Some(keepalive) = control.keepalive.take() {
            keepalive.stop();
        }

        control.transport.set_blocking(false);
        if let Err(e) = control.transport.disconnect("closed by client") {
            if !e.is_would_block() && !e.is_session_code(codes::SOCKET_SEND) {
                warn!("Disconnect failed: {}", e);
            }
        }

        events.session(SessionEvent::LayerClosed(Layer::Control));
        drop(control);
        true
    }

    fn close_connection(&mut self, events: &EventQueue) -> bool {
        let Some(connection) = self.connection.take() else {
            return false;
        };
        debug!("Closing connection");

        connection.cancel.cancel();
        if let Err(e) = connection.socket.shutdown() {
            debug!("Socket shutdown failed: {}", e);
        }

        events.session(SessionEvent::LayerClosed(Layer::Connection));
        events.session(SessionEvent::Disconnected);
        true
    }
}

impl<T: Transport> Shared<T> {
    /// Close `layer` and everything nested in it under the pump and session
    /// locks. Closing an already-closed layer is a no-op.
    pub(crate) fn close(&self, layer: Layer) -> bool {
        let _pump = self.pump_lock();
        let closed = self.lock().close(layer, &self.events);
        if closed {
            info!("Session {}: {} closed", self.id, layer);
        }
        closed
    }

    /// Close the current channel only if it is still `id`
    pub(crate) fn close_channel_if(&self, id: ChannelId) -> bool {
        let _pump = self.pump_lock();
        let mut handles = self.lock();
        if handles.channel_with_id(id).is_none() {
            return false;
        }
        handles.close(Layer::Channel, &self.events)
    }

    /// Open a sub-channel, closing the current one first.
    ///
    /// Only one sub-channel is tracked per session. If the channel layer is
    /// closed while the open is in flight, the new handle is released and
    /// the open fails with [`SessionError::Cancelled`].
    pub(crate) async fn open_channel_with<X>(
        &self,
        kind: ChannelKind,
        mut opener: impl FnMut(&mut T) -> RawResult<(T::Channel, X)>,
    ) -> Result<(ChannelId, X)> {
        self.close(Layer::Channel);
        {
            let mut handles = self.lock();
            handles.control()?;
            handles.channel = LayerState::Opening;
        }

        let id = self.next_channel_id();
        let result = self
            .call(|handles| {
                let opened = match opener(handles.transport()?) {
                    Ok(opened) => opened,
                    Err(e) => return Ok(Err(e)),
                };
                let (mut handle, extra) = opened;
                if !handles.channel.is_opening() {
                    let _ = handle.close();
                    return Err(SessionError::Cancelled);
                }
                handles.channel = LayerState::Open(ActiveChannel {
                    id,
                    kind,
                    handle,
                    phase: ChannelState::Open,
                    eof_sent: false,
                    pump: None,
                });
                Ok(Ok(extra))
            })
            .await;

        match result {
            Ok(extra) => {
                debug!("Channel {} open ({:?})", id, kind);
                self.events.channel(id, ChannelEvent::Opened(kind));
                Ok((id, extra))
            }
            Err(e) => {
                let mut handles = self.lock();
                if handles.channel.is_opening() {
                    handles.channel = LayerState::Closed;
                }
                Err(e)
            }
        }
    }

    /// Start the file-transfer session, closing any previous one first
    pub(crate) async fn open_sftp_layer(&self) -> Result<()> {
        self.close(Layer::FileTransfer);
        {
            let mut handles = self.lock();
            handles.control()?;
            handles.sftp = LayerState::Opening;
        }

        let result = self
            .call(|handles| {
                let sftp = match handles.transport()?.open_sftp() {
                    Ok(sftp) => sftp,
                    Err(e) => return Ok(Err(e)),
                };
                if !handles.sftp.is_opening() {
                    return Err(SessionError::Cancelled);
                }
                handles.sftp = LayerState::Open(SftpSession::new(sftp));
                Ok(Ok(()))
            })
            .await;

        if result.is_err() {
            let mut handles = self.lock();
            if handles.sftp.is_opening() {
                handles.sftp = LayerState::Closed;
            }
        } else {
            debug!("File-transfer session open");
        }
        result
    }
}
