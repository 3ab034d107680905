//! libssh2 backend built on the `ssh2` crate

use crate::error::{codes, RawCode, RawError, RawResult};
use crate::readiness::BlockDirections;
use crate::transport::{
    DirEntry, FileStat, FingerprintHash, HostKeyKind, MethodKind, OpenFlags, OpenType, Prompt,
    PromptResponder, PtyDimensions, RawChannel, RawFile, RawSftp, RenameFlags, StreamTag,
    Transport,
};
use crate::TransportError;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Receive window for session channels
const SESSION_WINDOW_SIZE: u32 = 2 * 1024 * 1024;
/// Maximum packet size for session channels
const SESSION_PACKET_SIZE: u32 = 32768;

/// Settings applied to a fresh session before the handshake
#[derive(Debug, Clone, Default)]
pub struct Ssh2Options {
    /// Request compression
    pub compress: bool,
    /// Client identification banner
    pub banner: Option<String>,
    /// Algorithm preferences, most preferred first
    pub methods: HashMap<MethodKind, Vec<String>>,
    /// Upper bound in milliseconds on calls made in blocking mode, 0 for none
    pub timeout_ms: u32,
}

/// [`Transport`] over a libssh2 session in non-blocking mode
pub struct Ssh2Transport {
    session: ssh2::Session,
}

impl std::fmt::Debug for Ssh2Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ssh2Transport")
            .field("authenticated", &self.session.authenticated())
            .finish()
    }
}

impl Ssh2Transport {
    /// Create a session over `stream` and apply `options`
    pub fn new(stream: TcpStream, options: &Ssh2Options) -> Result<Self, TransportError> {
        let mut session =
            ssh2::Session::new().map_err(|e| TransportError::Library(RawError::from(e)))?;
        session.set_tcp_stream(stream);
        session.set_blocking(false);
        session.set_compress(options.compress);
        // Dropped channels and SFTP handles finish their close in blocking mode.
        session.set_timeout(options.timeout_ms);

        if let Some(banner) = &options.banner {
            session
                .set_banner(banner)
                .map_err(|e| TransportError::Configuration(format!("banner: {}", e)))?;
        }

        for (kind, prefs) in &options.methods {
            if prefs.is_empty() {
                continue;
            }
            let prefs = prefs.join(",");
            trace!("Method preference {:?} = {}", kind, prefs);
            session
                .method_pref((*kind).into(), &prefs)
                .map_err(|e| TransportError::Configuration(format!("{:?}: {}", kind, e)))?;
        }

        Ok(Self { session })
    }
}

impl From<MethodKind> for ssh2::MethodType {
    fn from(kind: MethodKind) -> Self {
        match kind {
            MethodKind::Kex => ssh2::MethodType::Kex,
            MethodKind::HostKey => ssh2::MethodType::HostKey,
            MethodKind::CryptCs => ssh2::MethodType::CryptCs,
            MethodKind::CryptSc => ssh2::MethodType::CryptSc,
            MethodKind::MacCs => ssh2::MethodType::MacCs,
            MethodKind::MacSc => ssh2::MethodType::MacSc,
            MethodKind::CompCs => ssh2::MethodType::CompCs,
            MethodKind::CompSc => ssh2::MethodType::CompSc,
            MethodKind::LangCs => ssh2::MethodType::LangCs,
            MethodKind::LangSc => ssh2::MethodType::LangSc,
        }
    }
}

impl From<FingerprintHash> for ssh2::HashType {
    fn from(hash: FingerprintHash) -> Self {
        match hash {
            FingerprintHash::Md5 => ssh2::HashType::Md5,
            FingerprintHash::Sha1 => ssh2::HashType::Sha1,
            FingerprintHash::Sha256 => ssh2::HashType::Sha256,
        }
    }
}

impl From<ssh2::HostKeyType> for HostKeyKind {
    fn from(kind: ssh2::HostKeyType) -> Self {
        match kind {
            ssh2::HostKeyType::Rsa => HostKeyKind::Rsa,
            ssh2::HostKeyType::Dss => HostKeyKind::Dss,
            ssh2::HostKeyType::Ecdsa256 => HostKeyKind::Ecdsa256,
            ssh2::HostKeyType::Ecdsa384 => HostKeyKind::Ecdsa384,
            ssh2::HostKeyType::Ecdsa521 => HostKeyKind::Ecdsa521,
            ssh2::HostKeyType::Ed25519 => HostKeyKind::Ed25519,
            ssh2::HostKeyType::Unknown => HostKeyKind::Unknown,
        }
    }
}

/// Colon-separated lowercase hex
pub fn hex_fingerprint(hash: &[u8]) -> String {
    hash.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

struct Responder<'a>(&'a mut dyn PromptResponder);

impl ssh2::KeyboardInteractivePrompt for Responder<'_> {
    fn prompt<'b>(
        &mut self,
        username: &str,
        instructions: &str,
        prompts: &[ssh2::Prompt<'b>],
    ) -> Vec<String> {
        let prompts: Vec<Prompt> = prompts
            .iter()
            .map(|p| Prompt {
                text: p.text.to_string(),
                echo: p.echo,
            })
            .collect();
        self.0.respond(username, instructions, &prompts)
    }
}

impl Transport for Ssh2Transport {
    type Channel = ssh2::Channel;
    type Sftp = ssh2::Sftp;

    fn library_init() -> RawResult<()> {
        ssh2::init();
        debug!("libssh2 initialised");
        Ok(())
    }

    fn library_shutdown() {
        // libssh2 global state is released at process exit
        debug!("Last session closed");
    }

    fn block_directions(&self) -> BlockDirections {
        self.session.block_directions().into()
    }

    fn set_blocking(&mut self, blocking: bool) {
        self.session.set_blocking(blocking);
    }

    fn handshake(&mut self) -> RawResult<()> {
        Ok(self.session.handshake()?)
    }

    fn host_key_fingerprint(&self, hash: FingerprintHash) -> Option<String> {
        self.session.host_key_hash(hash.into()).map(hex_fingerprint)
    }

    fn host_key_kind(&self) -> Option<HostKeyKind> {
        self.session.host_key().map(|(_, kind)| kind.into())
    }

    fn banner(&self) -> Option<String> {
        self.session.banner().map(str::to_string)
    }

    fn negotiated_method(&self, kind: MethodKind) -> Option<String> {
        self.session.methods(kind.into()).map(str::to_string)
    }

    fn auth_methods(&mut self, username: &str) -> RawResult<Vec<String>> {
        let methods = self.session.auth_methods(username)?;
        Ok(methods
            .split(',')
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn authenticated(&self) -> bool {
        self.session.authenticated()
    }

    fn userauth_password(&mut self, username: &str, password: &str) -> RawResult<()> {
        Ok(self.session.userauth_password(username, password)?)
    }

    fn userauth_pubkey_file(
        &mut self,
        username: &str,
        public_key: Option<&Path>,
        private_key: &Path,
        passphrase: Option<&str>,
    ) -> RawResult<()> {
        Ok(self
            .session
            .userauth_pubkey_file(username, public_key, private_key, passphrase)?)
    }

    #[cfg(unix)]
    fn userauth_pubkey_memory(
        &mut self,
        username: &str,
        public_key: Option<&str>,
        private_key: &str,
        passphrase: Option<&str>,
    ) -> RawResult<()> {
        Ok(self
            .session
            .userauth_pubkey_memory(username, public_key, private_key, passphrase)?)
    }

    #[cfg(not(unix))]
    fn userauth_pubkey_memory(
        &mut self,
        _username: &str,
        _public_key: Option<&str>,
        _private_key: &str,
        _passphrase: Option<&str>,
    ) -> RawResult<()> {
        Err(RawError::new(
            codes::AUTHENTICATION_FAILED,
            "in-memory keys are not supported on this platform",
        ))
    }

    fn userauth_hostbased_file(
        &mut self,
        username: &str,
        public_key: &Path,
        private_key: &Path,
        passphrase: Option<&str>,
        hostname: &str,
        local_username: Option<&str>,
    ) -> RawResult<()> {
        Ok(self.session.userauth_hostbased_file(
            username,
            public_key,
            private_key,
            passphrase,
            hostname,
            local_username,
        )?)
    }

    fn userauth_keyboard_interactive(
        &mut self,
        username: &str,
        responder: &mut dyn PromptResponder,
    ) -> RawResult<()> {
        let mut responder = Responder(responder);
        Ok(self
            .session
            .userauth_keyboard_interactive(username, &mut responder)?)
    }

    fn keepalive_configure(&mut self, want_reply: bool, interval_secs: u32) {
        self.session.set_keepalive(want_reply, interval_secs);
    }

    fn keepalive_send(&mut self) -> RawResult<u32> {
        Ok(self.session.keepalive_send()?)
    }

    fn open_session(&mut self) -> RawResult<Self::Channel> {
        Ok(self
            .session
            .channel_open("session", SESSION_WINDOW_SIZE, SESSION_PACKET_SIZE, None)?)
    }

    fn open_direct_tcpip(
        &mut self,
        host: &str,
        port: u16,
        source: Option<(&str, u16)>,
    ) -> RawResult<Self::Channel> {
        Ok(self.session.channel_direct_tcpip(host, port, source)?)
    }

    fn open_direct_streamlocal(
        &mut self,
        socket_path: &str,
        source: Option<(&str, u16)>,
    ) -> RawResult<Self::Channel> {
        Ok(self
            .session
            .channel_direct_streamlocal(socket_path, source)?)
    }

    fn scp_send(&mut self, path: &Path, mode: i32, size: u64) -> RawResult<Self::Channel> {
        Ok(self.session.scp_send(path, mode, size, None)?)
    }

    fn scp_recv(&mut self, path: &Path) -> RawResult<(Self::Channel, u64)> {
        let (channel, stat) = self.session.scp_recv(path)?;
        Ok((channel, stat.size()))
    }

    fn open_sftp(&mut self) -> RawResult<Self::Sftp> {
        Ok(self.session.sftp()?)
    }

    fn disconnect(&mut self, description: &str) -> RawResult<()> {
        Ok(self.session.disconnect(
            Some(ssh2::DisconnectCode::ByApplication),
            description,
            None,
        )?)
    }
}

impl RawChannel for ssh2::Channel {
    fn setenv(&mut self, name: &str, value: &str) -> RawResult<()> {
        Ok(ssh2::Channel::setenv(self, name, value)?)
    }

    fn request_pty(&mut self, term: &str, dims: PtyDimensions) -> RawResult<()> {
        let dims = (dims.width, dims.height, dims.width_px, dims.height_px);
        Ok(ssh2::Channel::request_pty(self, term, None, Some(dims))?)
    }

    fn request_pty_size(&mut self, dims: PtyDimensions) -> RawResult<()> {
        Ok(ssh2::Channel::request_pty_size(
            self,
            dims.width,
            dims.height,
            Some(dims.width_px),
            Some(dims.height_px),
        )?)
    }

    fn process_startup(&mut self, request: &str, message: Option<&str>) -> RawResult<()> {
        Ok(ssh2::Channel::process_startup(self, request, message)?)
    }

    fn read(&mut self, tag: StreamTag, buf: &mut [u8]) -> RawResult<usize> {
        self.stream(tag.stream_id())
            .read(buf)
            .map_err(RawError::from_read)
    }

    fn write(&mut self, tag: StreamTag, buf: &[u8]) -> RawResult<usize> {
        self.stream(tag.stream_id())
            .write(buf)
            .map_err(RawError::from_write)
    }

    fn eof(&self) -> bool {
        ssh2::Channel::eof(self)
    }

    fn exit_status(&mut self) -> Option<i32> {
        // libssh2 reports 0 until an exit-status message arrives. The remote
        // sends it before its close, so a zero counts only once the close
        // was seen. In non-blocking mode an unseen close is just EAGAIN.
        match ssh2::Channel::exit_status(self) {
            Ok(0) => (ssh2::Channel::eof(self) && ssh2::Channel::wait_close(self).is_ok())
                .then_some(0),
            Ok(status) => Some(status),
            Err(_) => None,
        }
    }

    fn send_eof(&mut self) -> RawResult<()> {
        Ok(ssh2::Channel::send_eof(self)?)
    }

    fn close(&mut self) -> RawResult<()> {
        Ok(ssh2::Channel::close(self)?)
    }
}

impl RawSftp for ssh2::Sftp {
    type File = ssh2::File;

    fn open(
        &mut self,
        path: &Path,
        flags: OpenFlags,
        mode: i32,
        kind: OpenType,
    ) -> RawResult<Self::File> {
        Ok(self.open_mode(path, flags, mode, kind)?)
    }

    fn stat(&mut self, path: &Path) -> RawResult<FileStat> {
        Ok(ssh2::Sftp::stat(self, path)?)
    }

    fn lstat(&mut self, path: &Path) -> RawResult<FileStat> {
        Ok(ssh2::Sftp::lstat(self, path)?)
    }

    fn setstat(&mut self, path: &Path, stat: FileStat) -> RawResult<()> {
        Ok(ssh2::Sftp::setstat(self, path, stat)?)
    }

    fn mkdir(&mut self, path: &Path, mode: i32) -> RawResult<()> {
        Ok(ssh2::Sftp::mkdir(self, path, mode)?)
    }

    fn rmdir(&mut self, path: &Path) -> RawResult<()> {
        Ok(ssh2::Sftp::rmdir(self, path)?)
    }

    fn unlink(&mut self, path: &Path) -> RawResult<()> {
        Ok(ssh2::Sftp::unlink(self, path)?)
    }

    fn rename(&mut self, src: &Path, dst: &Path, flags: Option<RenameFlags>) -> RawResult<()> {
        Ok(ssh2::Sftp::rename(self, src, dst, flags)?)
    }

    fn symlink(&mut self, path: &Path, target: &Path) -> RawResult<()> {
        Ok(ssh2::Sftp::symlink(self, path, target)?)
    }

    fn readlink(&mut self, path: &Path) -> RawResult<PathBuf> {
        Ok(ssh2::Sftp::readlink(self, path)?)
    }

    fn realpath(&mut self, path: &Path) -> RawResult<PathBuf> {
        Ok(ssh2::Sftp::realpath(self, path)?)
    }

    fn shutdown(&mut self) -> RawResult<()> {
        Ok(ssh2::Sftp::shutdown(self)?)
    }
}

impl RawFile for ssh2::File {
    fn read(&mut self, buf: &mut [u8]) -> RawResult<usize> {
        Read::read(self, buf).map_err(RawError::from_read)
    }

    fn write(&mut self, buf: &[u8]) -> RawResult<usize> {
        Write::write(self, buf).map_err(RawError::from_write)
    }

    fn readdir(&mut self) -> RawResult<Option<DirEntry>> {
        match ssh2::File::readdir(self) {
            Ok((path, stat)) => Ok(Some(DirEntry { path, stat })),
            Err(e) => {
                let err = RawError::from(e);
                if err.code() == RawCode::Session(codes::FILE) {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    fn close(&mut self) -> RawResult<()> {
        Ok(ssh2::File::close(self)?)
    }
}
