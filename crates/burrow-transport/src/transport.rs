//! The transport library boundary.
//!
//! Every method performs exactly one raw, non-blocking protocol call and
//! reports `{success, would-block, error}` through [`RawResult`]. None of
//! these methods wait; retrying is the caller's job.

use crate::error::RawResult;
use crate::readiness::BlockDirections;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use ssh2::{FileStat, OpenFlags, OpenType, RenameFlags};

/// Which of a sub-channel's two byte streams a read or write targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamTag {
    /// Primary stream (stdout)
    Primary,
    /// Extended stream (stderr)
    Extended,
}

impl StreamTag {
    /// Protocol stream id
    pub fn stream_id(self) -> i32 {
        match self {
            StreamTag::Primary => 0,
            StreamTag::Extended => 1,
        }
    }
}

/// Negotiable algorithm classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    /// Key exchange
    Kex,
    /// Host key algorithm
    HostKey,
    /// Cipher, client to server
    CryptCs,
    /// Cipher, server to client
    CryptSc,
    /// MAC, client to server
    MacCs,
    /// MAC, server to client
    MacSc,
    /// Compression, client to server
    CompCs,
    /// Compression, server to client
    CompSc,
    /// Language, client to server
    LangCs,
    /// Language, server to client
    LangSc,
}

/// Digest used to fingerprint the host key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintHash {
    /// MD5, as printed by older clients
    Md5,
    /// SHA-1
    Sha1,
    /// SHA-256
    #[default]
    Sha256,
}

/// Host key algorithm family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyKind {
    /// ssh-rsa
    Rsa,
    /// ssh-dss
    Dss,
    /// ecdsa-sha2-nistp256
    Ecdsa256,
    /// ecdsa-sha2-nistp384
    Ecdsa384,
    /// ecdsa-sha2-nistp521
    Ecdsa521,
    /// ssh-ed25519
    Ed25519,
    /// Anything the library does not name
    Unknown,
}

/// Terminal size for pty requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyDimensions {
    /// Columns
    pub width: u32,
    /// Rows
    pub height: u32,
    /// Width in pixels
    pub width_px: u32,
    /// Height in pixels
    pub height_px: u32,
}

impl Default for PtyDimensions {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
            width_px: 0,
            height_px: 0,
        }
    }
}

/// One keyboard-interactive prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Prompt text shown to the user
    pub text: String,
    /// Whether the answer may be echoed
    pub echo: bool,
}

/// Answers keyboard-interactive challenges
pub trait PromptResponder: Send {
    /// Return one answer per prompt, in order
    fn respond(&mut self, username: &str, instructions: &str, prompts: &[Prompt]) -> Vec<String>;
}

/// One directory entry returned by [`RawFile::readdir`]
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Entry path as reported by the server
    pub path: PathBuf,
    /// Entry attributes
    pub stat: FileStat,
}

/// Control session over one connection
pub trait Transport: Send + 'static {
    /// Sub-channel handle type
    type Channel: RawChannel;
    /// File-transfer session handle type
    type Sftp: RawSftp;

    /// Process-wide library initialisation
    fn library_init() -> RawResult<()>
    where
        Self: Sized;

    /// Process-wide library shutdown, after the last session closes
    fn library_shutdown()
    where
        Self: Sized;

    /// Direction the last would-block was waiting on
    fn block_directions(&self) -> BlockDirections;

    /// Switch between blocking and non-blocking mode
    fn set_blocking(&mut self, blocking: bool);

    /// Run (one step of) the key exchange
    fn handshake(&mut self) -> RawResult<()>;

    /// Host key fingerprint under `hash`, colon-separated hex
    fn host_key_fingerprint(&self, hash: FingerprintHash) -> Option<String>;

    /// Algorithm of the host key the server presented
    fn host_key_kind(&self) -> Option<HostKeyKind>;

    /// Remote identification banner
    fn banner(&self) -> Option<String>;

    /// Negotiated algorithm for `kind`
    fn negotiated_method(&self, kind: MethodKind) -> Option<String>;

    /// Authentication methods offered for `username`
    fn auth_methods(&mut self, username: &str) -> RawResult<Vec<String>>;

    /// True once the remote accepted an authentication attempt
    fn authenticated(&self) -> bool;

    /// Password authentication
    fn userauth_password(&mut self, username: &str, password: &str) -> RawResult<()>;

    /// Public key authentication from key files
    fn userauth_pubkey_file(
        &mut self,
        username: &str,
        public_key: Option<&Path>,
        private_key: &Path,
        passphrase: Option<&str>,
    ) -> RawResult<()>;

    /// Public key authentication from in-memory key material
    fn userauth_pubkey_memory(
        &mut self,
        username: &str,
        public_key: Option<&str>,
        private_key: &str,
        passphrase: Option<&str>,
    ) -> RawResult<()>;

    /// Host-based authentication
    #[allow(clippy::too_many_arguments)]
    fn userauth_hostbased_file(
        &mut self,
        username: &str,
        public_key: &Path,
        private_key: &Path,
        passphrase: Option<&str>,
        hostname: &str,
        local_username: Option<&str>,
    ) -> RawResult<()>;

    /// Keyboard-interactive authentication
    fn userauth_keyboard_interactive(
        &mut self,
        username: &str,
        responder: &mut dyn PromptResponder,
    ) -> RawResult<()>;

    /// Configure keep-alive messages
    fn keepalive_configure(&mut self, want_reply: bool, interval_secs: u32);

    /// Send one keep-alive message; returns seconds until the next is due
    fn keepalive_send(&mut self) -> RawResult<u32>;

    /// Open a "session" sub-channel
    fn open_session(&mut self) -> RawResult<Self::Channel>;

    /// Open a direct-tcpip sub-channel
    fn open_direct_tcpip(
        &mut self,
        host: &str,
        port: u16,
        source: Option<(&str, u16)>,
    ) -> RawResult<Self::Channel>;

    /// Open a direct-streamlocal (unix socket) sub-channel
    fn open_direct_streamlocal(
        &mut self,
        socket_path: &str,
        source: Option<(&str, u16)>,
    ) -> RawResult<Self::Channel>;

    /// Start an SCP upload of `size` bytes to `path`
    fn scp_send(&mut self, path: &Path, mode: i32, size: u64) -> RawResult<Self::Channel>;

    /// Start an SCP download of `path`; returns the channel and file size
    fn scp_recv(&mut self, path: &Path) -> RawResult<(Self::Channel, u64)>;

    /// Start the SFTP subsystem
    fn open_sftp(&mut self) -> RawResult<Self::Sftp>;

    /// Send a graceful disconnect
    fn disconnect(&mut self, description: &str) -> RawResult<()>;
}

/// One logical duplex stream within a control session
pub trait RawChannel: Send + 'static {
    /// Set an environment variable for the remote process
    fn setenv(&mut self, name: &str, value: &str) -> RawResult<()>;

    /// Request a pseudo terminal
    fn request_pty(&mut self, term: &str, dims: PtyDimensions) -> RawResult<()>;

    /// Resize the pseudo terminal
    fn request_pty_size(&mut self, dims: PtyDimensions) -> RawResult<()>;

    /// Start `shell`, `exec` or `subsystem`
    fn process_startup(&mut self, request: &str, message: Option<&str>) -> RawResult<()>;

    /// Read from one stream. `Ok(0)` means that stream is exhausted.
    fn read(&mut self, tag: StreamTag, buf: &mut [u8]) -> RawResult<usize>;

    /// Write to one stream
    fn write(&mut self, tag: StreamTag, buf: &[u8]) -> RawResult<usize>;

    /// True once the remote sent end-of-stream
    fn eof(&self) -> bool;

    /// Exit status, once one was received.
    ///
    /// `None` while the status is still unknown, even after end-of-stream.
    fn exit_status(&mut self) -> Option<i32>;

    /// Send end-of-stream
    fn send_eof(&mut self) -> RawResult<()>;

    /// Close the channel
    fn close(&mut self) -> RawResult<()>;
}

/// File-transfer session
pub trait RawSftp: Send + 'static {
    /// Remote file handle type
    type File: RawFile;

    /// Open a file or directory
    fn open(
        &mut self,
        path: &Path,
        flags: OpenFlags,
        mode: i32,
        kind: OpenType,
    ) -> RawResult<Self::File>;

    /// Attributes, following symlinks
    fn stat(&mut self, path: &Path) -> RawResult<FileStat>;

    /// Attributes, not following symlinks
    fn lstat(&mut self, path: &Path) -> RawResult<FileStat>;

    /// Change attributes
    fn setstat(&mut self, path: &Path, stat: FileStat) -> RawResult<()>;

    /// Create a directory
    fn mkdir(&mut self, path: &Path, mode: i32) -> RawResult<()>;

    /// Remove a directory
    fn rmdir(&mut self, path: &Path) -> RawResult<()>;

    /// Remove a file
    fn unlink(&mut self, path: &Path) -> RawResult<()>;

    /// Rename `src` to `dst`
    fn rename(&mut self, src: &Path, dst: &Path, flags: Option<RenameFlags>) -> RawResult<()>;

    /// Create `path` pointing at `target`
    fn symlink(&mut self, path: &Path, target: &Path) -> RawResult<()>;

    /// Symlink target
    fn readlink(&mut self, path: &Path) -> RawResult<PathBuf>;

    /// Canonical absolute path
    fn realpath(&mut self, path: &Path) -> RawResult<PathBuf>;

    /// End the subsystem. A would-block result leaves the rest to drop.
    fn shutdown(&mut self) -> RawResult<()>;
}

/// Open remote file or directory
pub trait RawFile: Send + 'static {
    /// Read bytes; `Ok(0)` at end of file
    fn read(&mut self, buf: &mut [u8]) -> RawResult<usize>;

    /// Write bytes
    fn write(&mut self, buf: &[u8]) -> RawResult<usize>;

    /// Next directory entry, `None` when exhausted
    fn readdir(&mut self) -> RawResult<Option<DirEntry>>;

    /// Close the handle
    fn close(&mut self) -> RawResult<()>;
}
