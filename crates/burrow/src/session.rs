//! Session management: connect, handshake, authenticate and drive the
//! current sub-channel

use crate::config::{Credentials, SessionConfig};
use crate::error::{accepted, RejectionExt, SessionError};
use crate::lifecycle::{ChannelId, ChannelKind, ChannelState, Handles, Layer};
use crate::observer::{
    ChannelObserver, ChannelObserverSlot, EventQueue, ObserverSink, SessionEvent, SessionObserver,
};
use crate::pump::{BufferSink, ChannelSink, Completion, PumpHandle, PumpState};
use crate::registry::{self, LibraryRef, Registration, RegistryPrompter, SessionToken};
use crate::retry::classify;
use crate::shared::Shared;
use crate::Result;
use burrow_transport::{
    codes, Connection, FingerprintHash, HostKeyKind, MethodKind, PtyDimensions, RawChannel,
    RawError, RawResult, Socket, Ssh2Transport, StreamTag, Transport,
};
use bytes::Bytes;
use std::any::TypeId;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Output of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Primary stream
    pub stdout: Bytes,
    /// Extended stream
    pub stderr: Bytes,
    /// Exit status, if the remote sent one
    pub exit_status: Option<i32>,
}

/// An SSH session over one connection.
///
/// Owns the whole handle hierarchy. Dropping the session closes every layer.
pub struct Session<T: Transport = Ssh2Transport> {
    shared: Arc<Shared<T>>,
}

impl Session<Ssh2Transport> {
    /// Connect over TCP and run the handshake. Does not authenticate.
    pub async fn connect(config: SessionConfig, observer: Arc<dyn SessionObserver>) -> Result<Self> {
        config.validate()?;
        info!("Connecting to {}:{}", config.host, config.port);

        let (connection, stream) =
            Connection::connect(&config.host, config.port, config.connect_timeout()).await?;
        let transport = Ssh2Transport::new(stream, &config.ssh2_options())?;

        let session = Self::with_transport(config, transport, Arc::new(connection), observer)?;
        session.handshake().await?;
        Ok(session)
    }
}

impl<T: Transport> Session<T> {
    /// Wrap a transport whose socket is already connected.
    ///
    /// Must be called from within a tokio runtime: observer events are
    /// delivered by a spawned task.
    pub fn with_transport(
        config: SessionConfig,
        transport: T,
        socket: Arc<dyn Socket>,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self> {
        let library = LibraryRef::acquire(TypeId::of::<T>(), T::library_init, T::library_shutdown)
            .map_err(classify)?;

        let channel_observer: ChannelObserverSlot = Arc::new(Mutex::new(None));
        let events = EventQueue::spawn(observer.clone(), channel_observer.clone());
        let registration = Registration::register(observer, events.clone());
        let handles = Handles::new(socket, transport, library);

        let shared = Arc::new(Shared::new(
            config,
            handles,
            events,
            channel_observer,
            registration,
        ));
        debug!("Session {} created", shared.id);
        Ok(Self { shared })
    }

    pub(crate) fn shared(&self) -> &Arc<Shared<T>> {
        &self.shared
    }

    /// Session id
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Registry token for this session
    pub fn token(&self) -> SessionToken {
        self.shared.registration.token()
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Run the key exchange and let the observer vet the host key.
    ///
    /// A refused host key tears the control session down.
    pub async fn handshake(&self) -> Result<()> {
        self.shared
            .call(|handles| Ok(handles.transport()?.handshake()))
            .await?;

        let fingerprint = self.fingerprint();
        let Some(key) = fingerprint.as_deref() else {
            warn!("Session {}: no host key after handshake", self.shared.id);
            self.close(Layer::Control);
            return Err(SessionError::HostKeyRejected("no host key".to_string()));
        };

        if !registry::verify_host_key(self.token(), key) {
            warn!("Session {}: host key {} rejected", self.shared.id, key);
            self.close(Layer::Control);
            return Err(SessionError::HostKeyRejected(key.to_string()));
        }

        info!("Session {}: handshake complete ({})", self.shared.id, key);
        self.shared
            .events
            .session(SessionEvent::Connected { fingerprint });
        Ok(())
    }

    fn query<R>(&self, f: impl FnOnce(&T) -> Option<R>) -> Option<R> {
        self.shared
            .lock()
            .control
            .open()
            .and_then(|control| f(&control.transport))
    }

    /// SHA-256 host key fingerprint
    pub fn fingerprint(&self) -> Option<String> {
        self.fingerprint_with(FingerprintHash::Sha256)
    }

    /// Host key fingerprint under `hash`
    pub fn fingerprint_with(&self, hash: FingerprintHash) -> Option<String> {
        self.query(|transport| transport.host_key_fingerprint(hash))
    }

    /// Algorithm of the presented host key
    pub fn host_key_kind(&self) -> Option<HostKeyKind> {
        self.query(T::host_key_kind)
    }

    /// Remote identification banner
    pub fn remote_banner(&self) -> Option<String> {
        self.query(T::banner)
    }

    /// Negotiated algorithm for `kind`
    pub fn negotiated_method(&self, kind: MethodKind) -> Option<String> {
        self.query(|transport| transport.negotiated_method(kind))
    }

    /// True when both directions negotiated zlib compression
    pub fn is_compressed(&self) -> bool {
        [MethodKind::CompCs, MethodKind::CompSc].into_iter().all(|kind| {
            self.negotiated_method(kind)
                .is_some_and(|method| method.starts_with("zlib"))
        })
    }

    /// Authentication methods the remote offers for the configured user
    pub async fn auth_methods(&self) -> Result<Vec<String>> {
        let username = self.shared.config.username.as_str();
        self.shared
            .call(|handles| Ok(handles.transport()?.auth_methods(username)))
            .await
    }

    /// True once the remote accepted an authentication attempt
    pub fn is_authenticated(&self) -> bool {
        self.query(|transport| Some(transport.authenticated()))
            .unwrap_or(false)
    }

    /// Authenticate with `credentials`. `Ok(false)` when refused.
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<bool> {
        match credentials {
            Credentials::None => self.authenticate_none().await,
            Credentials::Password(password) => self.authenticate_password(password).await,
            Credentials::PublicKeyFile {
                public_key,
                private_key,
                passphrase,
            } => {
                self.authenticate_pubkey_file(
                    public_key.as_deref(),
                    private_key,
                    passphrase.as_deref(),
                )
                .await
            }
            Credentials::PublicKeyMemory {
                public_key,
                private_key,
                passphrase,
            } => {
                self.authenticate_pubkey_memory(
                    public_key.as_deref(),
                    private_key,
                    passphrase.as_deref(),
                )
                .await
            }
            Credentials::HostBased {
                public_key,
                private_key,
                passphrase,
                hostname,
                local_username,
            } => {
                self.authenticate_hostbased(
                    public_key,
                    private_key,
                    passphrase.as_deref(),
                    hostname,
                    local_username.as_deref(),
                )
                .await
            }
            Credentials::KeyboardInteractive => self.authenticate_keyboard_interactive().await,
        }
    }

    /// "none" authentication: succeeds only if the remote needs nothing more
    pub async fn authenticate_none(&self) -> Result<bool> {
        if self.is_authenticated() {
            return Ok(true);
        }
        self.auth_methods().await.or_refused()?;
        if self.is_authenticated() {
            self.on_authenticated("none")
        } else {
            Ok(false)
        }
    }

    /// Password authentication
    pub async fn authenticate_password(&self, password: &str) -> Result<bool> {
        self.authenticate_with("password", |transport, username| {
            transport.userauth_password(username, password)
        })
        .await
    }

    /// Public key authentication from key files
    pub async fn authenticate_pubkey_file(
        &self,
        public_key: Option<&Path>,
        private_key: &Path,
        passphrase: Option<&str>,
    ) -> Result<bool> {
        self.authenticate_with("publickey", |transport, username| {
            transport.userauth_pubkey_file(username, public_key, private_key, passphrase)
        })
        .await
    }

    /// Public key authentication from in-memory keys
    pub async fn authenticate_pubkey_memory(
        &self,
        public_key: Option<&str>,
        private_key: &str,
        passphrase: Option<&str>,
    ) -> Result<bool> {
        self.authenticate_with("publickey", |transport, username| {
            transport.userauth_pubkey_memory(username, public_key, private_key, passphrase)
        })
        .await
    }

    /// Host-based authentication
    pub async fn authenticate_hostbased(
        &self,
        public_key: &Path,
        private_key: &Path,
        passphrase: Option<&str>,
        hostname: &str,
        local_username: Option<&str>,
    ) -> Result<bool> {
        self.authenticate_with("hostbased", |transport, username| {
            transport.userauth_hostbased_file(
                username,
                public_key,
                private_key,
                passphrase,
                hostname,
                local_username,
            )
        })
        .await
    }

    /// Keyboard-interactive authentication.
    ///
    /// Prompts are answered by [`SessionObserver::keyboard_interactive`].
    pub async fn authenticate_keyboard_interactive(&self) -> Result<bool> {
        let mut prompter = RegistryPrompter::new(self.token());
        self.authenticate_with("keyboard-interactive", |transport, username| {
            transport.userauth_keyboard_interactive(username, &mut prompter)
        })
        .await
    }

    async fn authenticate_with(
        &self,
        method: &str,
        mut attempt: impl FnMut(&mut T, &str) -> RawResult<()>,
    ) -> Result<bool> {
        if self.is_authenticated() {
            return Ok(true);
        }

        let Some(offered) = self.auth_methods().await.or_refused()? else {
            return Ok(self.is_authenticated());
        };
        if !offered.iter().any(|m| m == method) {
            debug!("Method {} not offered (offered: {:?})", method, offered);
            return Ok(false);
        }

        let username = self.shared.config.username.as_str();
        let result = self
            .shared
            .call(|handles| Ok(attempt(handles.transport()?, username)))
            .await;

        if accepted(result)? {
            self.on_authenticated(method)
        } else {
            info!("Session {}: {} authentication refused", self.shared.id, method);
            Ok(false)
        }
    }

    fn on_authenticated(&self, method: &str) -> Result<bool> {
        info!("Session {}: authenticated with {}", self.shared.id, method);
        self.shared.events.session(SessionEvent::Authenticated {
            method: method.to_string(),
        });
        if self.shared.start_keepalive()? {
            debug!("Keep-alive enabled");
        }
        Ok(true)
    }

    /// Replace the channel observer
    pub fn set_channel_observer(&self, observer: Option<Arc<dyn ChannelObserver>>) {
        *self
            .shared
            .channel_observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = observer;
    }

    /// Open a "session" sub-channel, closing the current one first.
    ///
    /// `lang` is sent as `LANG`. `Ok(None)` if the remote refused the channel.
    pub async fn open_channel(&self, lang: Option<&str>) -> Result<Option<ChannelId>> {
        let opened = self
            .shared
            .open_channel_with(ChannelKind::Session, |transport| {
                Ok((transport.open_session()?, ()))
            })
            .await
            .or_refused()?;
        let Some((id, ())) = opened else {
            return Ok(None);
        };

        if let Some(lang) = lang {
            if !self.setenv("LANG", lang).await? {
                debug!("Channel {}: LANG={} refused", id, lang);
            }
        }
        Ok(Some(id))
    }

    /// Open a forwarded TCP connection to `host:port`
    pub async fn direct_tcpip(
        &self,
        host: &str,
        port: u16,
        source: Option<(&str, u16)>,
    ) -> Result<Option<ChannelId>> {
        let opened = self
            .shared
            .open_channel_with(ChannelKind::DirectTcpip, |transport| {
                Ok((transport.open_direct_tcpip(host, port, source)?, ()))
            })
            .await
            .or_refused()?;
        Ok(opened.map(|(id, ())| id))
    }

    /// Open a forwarded connection to the remote unix socket `path`
    pub async fn direct_streamlocal(
        &self,
        path: &str,
        source: Option<(&str, u16)>,
    ) -> Result<Option<ChannelId>> {
        let opened = self
            .shared
            .open_channel_with(ChannelKind::StreamLocal, |transport| {
                Ok((transport.open_direct_streamlocal(path, source)?, ()))
            })
            .await
            .or_refused()?;
        Ok(opened.map(|(id, ())| id))
    }

    async fn channel_call<R>(
        &self,
        mut op: impl FnMut(&mut T::Channel) -> RawResult<R>,
    ) -> Result<R> {
        self.shared
            .call(|handles| Ok(op(&mut handles.channel()?.handle)))
            .await
    }

    /// Set an environment variable on the current channel
    pub async fn setenv(&self, name: &str, value: &str) -> Result<bool> {
        accepted(self.channel_call(|channel| channel.setenv(name, value)).await)
    }

    /// Request a pseudo terminal on the current channel
    pub async fn request_pty(&self, term: &str, dims: PtyDimensions) -> Result<bool> {
        accepted(self.channel_call(|channel| channel.request_pty(term, dims)).await)
    }

    /// Resize the pseudo terminal
    pub async fn request_pty_size(&self, dims: PtyDimensions) -> Result<bool> {
        accepted(self.channel_call(|channel| channel.request_pty_size(dims)).await)
    }

    /// The current channel if it is a fresh session channel, else a new one
    async fn session_channel(&self) -> Result<Option<ChannelId>> {
        {
            let mut handles = self.shared.lock();
            if let Ok(channel) = handles.channel() {
                if channel.kind == ChannelKind::Session
                    && channel.phase == ChannelState::Open
                    && channel.pump.is_none()
                {
                    return Ok(Some(channel.id));
                }
            }
        }
        self.open_channel(None).await
    }

    async fn start_process(&self, request: &str, message: Option<&str>) -> Result<bool> {
        if self.session_channel().await?.is_none() {
            return Ok(false);
        }
        debug!("Starting {} {:?}", request, message);
        accepted(
            self.channel_call(|channel| channel.process_startup(request, message))
                .await,
        )
    }

    /// Start a shell and pump its output to the channel observer.
    ///
    /// Uses the current session channel (so a pty requested earlier applies),
    /// or opens one. `Ok(None)` if the remote refused.
    pub async fn shell(&self) -> Result<Option<PumpHandle<ObserverSink>>> {
        if !self.start_process("shell", None).await? {
            return Ok(None);
        }
        let id = self.current_channel().ok_or(SessionError::NotOpen(Layer::Channel))?;
        let sink = ObserverSink::new(id, self.shared.events.clone());
        self.start_pump(sink).map(Some)
    }

    /// Run `command` to completion and collect its output
    pub async fn exec(&self, command: &str) -> Result<Option<ExecOutput>> {
        if !self.start_process("exec", Some(command)).await? {
            return Ok(None);
        }

        let outcome = self.start_pump(BufferSink::default())?.join().await?;
        match outcome.state {
            PumpState::Completed(Completion::Failed(message)) => Err(SessionError::Recv(
                RawError::new(codes::SOCKET_RECV, message),
            )),
            PumpState::Cancelled => Err(SessionError::Cancelled),
            _ => {
                let (stdout, stderr) = outcome.sink.into_parts();
                Ok(Some(ExecOutput {
                    stdout,
                    stderr,
                    exit_status: outcome.exit_status,
                }))
            }
        }
    }

    /// Start the `name` subsystem on a session channel
    pub async fn subsystem(&self, name: &str) -> Result<bool> {
        self.start_process("subsystem", Some(name)).await
    }

    /// Start pumping the current channel into `sink`
    pub fn start_pump<S: ChannelSink>(&self, sink: S) -> Result<PumpHandle<S>> {
        self.shared.start_pump(sink)
    }

    /// Write all of `data` to one stream of the current channel
    pub async fn write(&self, tag: StreamTag, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            let n = self
                .channel_call(|channel| channel.write(tag, &data[written..]))
                .await?;
            if n == 0 {
                return Err(SessionError::Send(RawError::new(
                    codes::SOCKET_SEND,
                    "channel accepted no data",
                )));
            }
            written += n;
        }
        if written > 0 {
            self.shared.events.session(SessionEvent::Sent(written));
        }
        Ok(())
    }

    /// Read whatever one stream of the current channel has, waiting for data.
    ///
    /// Empty once that stream reached end-of-stream.
    pub async fn read(&self, tag: StreamTag) -> Result<Bytes> {
        let mut buf = vec![0; self.shared.config.buffer_size.max(1)];
        let n = self.channel_call(|channel| channel.read(tag, &mut buf)).await?;
        if n > 0 {
            self.shared.events.session(SessionEvent::Received(n));
        }
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    /// Send end-of-stream on the current channel
    pub async fn send_eof(&self) -> Result<()> {
        self.shared
            .call(|handles| {
                let channel = handles.channel()?;
                let result = channel.handle.send_eof();
                if result.is_ok() {
                    channel.eof_sent = true;
                }
                Ok(result)
            })
            .await
    }

    /// State of the current channel
    pub fn channel_state(&self) -> ChannelState {
        self.shared.lock().channel_state()
    }

    /// Id of the current channel, if one is open
    pub fn current_channel(&self) -> Option<ChannelId> {
        self.shared.lock().channel.open().map(|channel| channel.id)
    }

    /// Close `layer` and everything nested in it.
    ///
    /// Returns whether `layer` was open; closing twice is a no-op.
    pub fn close(&self, layer: Layer) -> bool {
        self.shared.close(layer)
    }

    /// Close every layer, innermost first
    pub fn close_all(&self) {
        self.shared.close(Layer::Connection);
    }

    /// Whether `layer` is open
    pub fn is_open(&self, layer: Layer) -> bool {
        self.shared.lock().is_open(layer)
    }

    /// Whether the keep-alive task is running
    pub fn keepalive_running(&self) -> bool {
        self.shared.keepalive_running()
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        self.close_all();
    }
}
