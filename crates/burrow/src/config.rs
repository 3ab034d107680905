//! Session configuration and builder

use crate::observer::{NoopObserver, SessionObserver};
use crate::session::Session;
use crate::{Result, SessionError};
use burrow_transport::{MethodKind, Ssh2Options, Ssh2Transport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Username
    pub username: String,
    /// Seconds to wait for socket readiness on each retry
    pub timeout: u64,
    /// Seconds allowed for the TCP connect
    pub connect_timeout: u64,
    /// Request compression
    pub compress: bool,
    /// Client identification banner
    pub banner: Option<String>,
    /// Algorithm preferences, most preferred first
    pub methods: HashMap<MethodKind, Vec<String>>,
    /// Send keep-alive messages once authenticated
    pub keepalive: bool,
    /// Seconds between keep-alive messages
    pub keepalive_interval: u64,
    /// Read buffer size for channel and file I/O
    pub buffer_size: usize,
    /// Directory entries dropped from listings
    pub ignored_files: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 22,
            username: "root".to_string(),
            timeout: 15,
            connect_timeout: 30,
            compress: true,
            banner: Some("SSH-2.0-burrow".to_string()),
            methods: HashMap::new(),
            keepalive: false,
            keepalive_interval: 60,
            buffer_size: 0x4000,
            ignored_files: vec![".".to_string(), "..".to_string()],
        }
    }
}

impl SessionConfig {
    /// Per-wait readiness timeout
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// TCP connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Keepalive period, if keepalive is enabled
    pub fn keepalive_period(&self) -> Option<Duration> {
        (self.keepalive && self.keepalive_interval > 0)
            .then(|| Duration::from_secs(self.keepalive_interval))
    }

    /// Check values that would otherwise fail deep inside the transport
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(SessionError::Configuration("host is empty".to_string()));
        }
        if self.timeout == 0 {
            return Err(SessionError::Configuration("timeout must be non-zero".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(SessionError::Configuration("buffer_size must be non-zero".to_string()));
        }
        if self.keepalive_interval > u64::from(u32::MAX) {
            return Err(SessionError::Configuration(
                "keepalive_interval is too large".to_string(),
            ));
        }
        Ok(())
    }

    /// Options for the libssh2 backend
    pub fn ssh2_options(&self) -> Ssh2Options {
        Ssh2Options {
            compress: self.compress,
            banner: self.banner.clone(),
            methods: self.methods.clone(),
            timeout_ms: u32::try_from(self.wait_timeout().as_millis()).unwrap_or(u32::MAX),
        }
    }
}

/// How to authenticate after the handshake
#[derive(Clone, Default)]
pub enum Credentials {
    /// "none" authentication
    #[default]
    None,
    /// Password
    Password(String),
    /// Key pair on disk
    PublicKeyFile {
        /// Public key path, derived from the private key when absent
        public_key: Option<PathBuf>,
        /// Private key path
        private_key: PathBuf,
        /// Key passphrase
        passphrase: Option<String>,
    },
    /// Key pair in memory
    PublicKeyMemory {
        /// Public key data
        public_key: Option<String>,
        /// Private key data
        private_key: String,
        /// Key passphrase
        passphrase: Option<String>,
    },
    /// Host-based
    HostBased {
        /// Host public key path
        public_key: PathBuf,
        /// Host private key path
        private_key: PathBuf,
        /// Key passphrase
        passphrase: Option<String>,
        /// Local hostname presented to the remote
        hostname: String,
        /// Local username, defaults to the remote username
        local_username: Option<String>,
    },
    /// Keyboard-interactive, answered by the session observer
    KeyboardInteractive,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::None => f.write_str("None"),
            Credentials::Password(_) => f.write_str("Password(..)"),
            Credentials::PublicKeyFile { private_key, .. } => f
                .debug_struct("PublicKeyFile")
                .field("private_key", private_key)
                .finish_non_exhaustive(),
            Credentials::PublicKeyMemory { .. } => f.write_str("PublicKeyMemory(..)"),
            Credentials::HostBased { hostname, .. } => f
                .debug_struct("HostBased")
                .field("hostname", hostname)
                .finish_non_exhaustive(),
            Credentials::KeyboardInteractive => f.write_str("KeyboardInteractive"),
        }
    }
}

/// Session builder for configuring connections
pub struct SessionBuilder {
    /// Target connection string
    target: String,
    /// Session configuration
    config: SessionConfig,
    /// Authentication to attempt after the handshake
    credentials: Credentials,
    /// Receives session events and answers callbacks
    observer: Arc<dyn SessionObserver>,
}

impl SessionBuilder {
    /// Create a new session builder
    pub fn new(target: impl Into<String>) -> Self {
        let target = target.into();
        let (username, host, port) = Self::parse_target(&target);

        let config = SessionConfig {
            host,
            port,
            username,
            ..Default::default()
        };

        Self {
            target,
            config,
            credentials: Credentials::None,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Start from an existing configuration
    pub fn from_config(config: SessionConfig) -> Self {
        Self {
            target: format!("{}@{}:{}", config.username, config.host, config.port),
            config,
            credentials: Credentials::None,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Parse target string into components
    fn parse_target(target: &str) -> (String, String, u16) {
        // Format: [user@]host[:port]
        let mut username = "root".to_string();
        let mut host = target.to_string();
        let mut port = 22;

        if let Some(at_pos) = target.find('@') {
            username = target[..at_pos].to_string();
            host = target[at_pos + 1..].to_string();
        }

        if let Some(colon_pos) = host.rfind(':') {
            if let Ok(parsed_port) = host[colon_pos + 1..].parse::<u16>() {
                port = parsed_port;
                host = host[..colon_pos].to_string();
            }
        }

        (username, host, port)
    }

    /// Target this builder was created for
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Authenticate with a password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.credentials = Credentials::Password(password.into());
        self
    }

    /// Authenticate with a private key file
    pub fn with_key(mut self, private_key: PathBuf) -> Self {
        self.credentials = Credentials::PublicKeyFile {
            public_key: None,
            private_key,
            passphrase: None,
        };
        self
    }

    /// Set any credentials
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the per-wait readiness timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout.as_secs();
        self
    }

    /// Set the TCP connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout.as_secs();
        self
    }

    /// Enable or disable compression
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.config.compress = compress;
        self
    }

    /// Set the client banner
    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.config.banner = Some(banner.into());
        self
    }

    /// Set algorithm preferences for one method class
    pub fn with_method(mut self, kind: MethodKind, prefs: Vec<String>) -> Self {
        self.config.methods.insert(kind, prefs);
        self
    }

    /// Send keep-alive messages every `interval`
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.config.keepalive = true;
        self.config.keepalive_interval = interval.as_secs();
        self
    }

    /// Set the I/O buffer size
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    /// Set the session observer
    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Build the session configuration
    pub fn build_config(self) -> SessionConfig {
        self.config
    }

    /// Connect, run the handshake and authenticate
    pub async fn connect(self) -> Result<Session<Ssh2Transport>> {
        info!("Connecting to target: {}", self.target);
        let session = Session::connect(self.config, self.observer).await?;

        debug!("Authenticating with {:?}", self.credentials);
        if !session.authenticate(&self.credentials).await? {
            session.close_all();
            return Err(SessionError::Authentication(format!(
                "{} refused {:?}",
                self.target, self.credentials
            )));
        }

        Ok(session)
    }
}
