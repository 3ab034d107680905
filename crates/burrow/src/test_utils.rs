//! Scripted transport, socket and observer for unit tests

use crate::config::SessionConfig;
use crate::lifecycle::ChannelId;
use crate::observer::{ChannelEvent, ChannelObserver, SessionEvent, SessionObserver};
use crate::session::Session;
use async_trait::async_trait;
use burrow_transport::{
    codes, BlockDirections, DirEntry, FileStat, FingerprintHash, HostKeyKind, MethodKind,
    OpenFlags, OpenType, Prompt, PromptResponder, PtyDimensions, RawChannel, RawError, RawFile,
    RawResult, RawSftp, RenameFlags, Socket, StreamTag, Transport, WaitOutcome,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Password the mock accepts
pub(crate) const PASSWORD: &str = "hunter2";

/// Host key fingerprint the mock reports
pub(crate) const FINGERPRINT: &str = "aa:bb:cc:dd";

/// What one mock channel will report
#[derive(Default)]
pub(crate) struct ChannelScript {
    pub(crate) primary: VecDeque<RawResult<Vec<u8>>>,
    pub(crate) extended: VecDeque<RawResult<Vec<u8>>>,
    pub(crate) eof: bool,
    pub(crate) exit_status: Option<i32>,
    pub(crate) refuse_requests: bool,
    pub(crate) writes: Vec<(StreamTag, Vec<u8>)>,
    /// `send_eof` fails with a socket error
    pub(crate) fail_eof: bool,
    /// `close` fails with a socket error
    pub(crate) fail_close: bool,
}

impl ChannelScript {
    pub(crate) fn push(&mut self, tag: StreamTag, data: &[u8]) {
        self.queue(tag).push_back(Ok(data.to_vec()));
    }

    fn queue(&mut self, tag: StreamTag) -> &mut VecDeque<RawResult<Vec<u8>>> {
        match tag {
            StreamTag::Primary => &mut self.primary,
            StreamTag::Extended => &mut self.extended,
        }
    }

    fn drained(&self) -> bool {
        self.primary.is_empty() && self.extended.is_empty()
    }
}

/// In-memory remote filesystem
#[derive(Default)]
pub(crate) struct MockFs {
    pub(crate) files: BTreeMap<PathBuf, Vec<u8>>,
    pub(crate) dirs: BTreeSet<PathBuf>,
    pub(crate) links: BTreeMap<PathBuf, PathBuf>,
    pub(crate) attrs: HashMap<PathBuf, FileStat>,
}

impl MockFs {
    fn stat(&self, path: &Path) -> RawResult<FileStat> {
        let (size, perm) = if let Some(data) = self.files.get(path) {
            (Some(data.len() as u64), 0o100644)
        } else if self.dirs.contains(path) {
            (None, 0o040755)
        } else {
            return Err(RawError::sftp(2, "no such file"));
        };
        let extra = self.attrs.get(path);
        Ok(FileStat {
            size: extra.and_then(|a| a.size).or(size),
            uid: extra.and_then(|a| a.uid).or(Some(1000)),
            gid: extra.and_then(|a| a.gid).or(Some(1000)),
            perm: extra.and_then(|a| a.perm).or(Some(perm)),
            atime: None,
            mtime: None,
        })
    }

    fn children(&self, dir: &Path) -> Vec<(PathBuf, FileStat)> {
        let mut names = vec![
            (PathBuf::from("."), self.stat(dir).ok()),
            (PathBuf::from(".."), None),
        ];
        for path in self.dirs.iter().chain(self.files.keys()) {
            if path.parent() == Some(dir) {
                if let Some(name) = path.file_name() {
                    names.push((PathBuf::from(name), self.stat(path).ok()));
                }
            }
        }
        names
            .into_iter()
            .map(|(name, stat)| (name, stat.unwrap_or_else(empty_stat)))
            .collect()
    }
}

fn empty_stat() -> FileStat {
    FileStat {
        size: None,
        uid: None,
        gid: None,
        perm: None,
        atime: None,
        mtime: None,
    }
}

/// Everything the mocks share and record
pub(crate) struct MockState {
    pub(crate) trace: Vec<String>,
    pub(crate) block_directions: BlockDirections,
    pub(crate) handshake_script: VecDeque<RawResult<()>>,
    pub(crate) fingerprint: Option<String>,
    pub(crate) host_key_kind: Option<HostKeyKind>,
    pub(crate) banner: Option<String>,
    pub(crate) negotiated: HashMap<MethodKind, String>,
    pub(crate) auth_methods: Vec<String>,
    pub(crate) accept_none: bool,
    pub(crate) accept_keys: bool,
    pub(crate) authenticated: bool,
    pub(crate) prompts_answered: Vec<String>,
    pub(crate) keepalive_calls: usize,
    pub(crate) keepalive_interval: Option<u32>,
    pub(crate) keepalive_script: VecDeque<RawResult<u32>>,
    pub(crate) open_failures: VecDeque<RawError>,
    pub(crate) opened_channels: usize,
    pub(crate) channels: Vec<ChannelScript>,
    pub(crate) refuse_sftp: bool,
    pub(crate) fs: MockFs,
    /// Size `scp_recv` announces instead of the real one
    pub(crate) scp_declared_size: Option<u64>,
    /// Remote file closes report would-block
    pub(crate) file_close_would_block: bool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            trace: Vec::new(),
            block_directions: BlockDirections::Inbound,
            handshake_script: VecDeque::new(),
            fingerprint: Some(FINGERPRINT.to_string()),
            host_key_kind: Some(HostKeyKind::Ed25519),
            banner: Some("SSH-2.0-OpenSSH_9.6".to_string()),
            negotiated: HashMap::new(),
            auth_methods: vec![
                "publickey".to_string(),
                "password".to_string(),
                "keyboard-interactive".to_string(),
            ],
            accept_none: false,
            accept_keys: false,
            authenticated: false,
            prompts_answered: Vec::new(),
            keepalive_calls: 0,
            keepalive_interval: None,
            keepalive_script: VecDeque::new(),
            open_failures: VecDeque::new(),
            opened_channels: 0,
            channels: Vec::new(),
            refuse_sftp: false,
            fs: MockFs::default(),
            scp_declared_size: None,
            file_close_would_block: false,
        }
    }
}

impl MockState {
    /// Script for the `index`th channel opened (1-based)
    pub(crate) fn script(&mut self, index: usize) -> &mut ChannelScript {
        while self.channels.len() < index {
            self.channels.push(ChannelScript::default());
        }
        &mut self.channels[index - 1]
    }

    /// Primary-stream bytes written to the `index`th channel
    pub(crate) fn written(&mut self, index: usize) -> Vec<u8> {
        self.script(index)
            .writes
            .iter()
            .filter(|(tag, _)| *tag == StreamTag::Primary)
            .flat_map(|(_, data)| data.iter().copied())
            .collect()
    }

    /// First trace index of `entry`
    pub(crate) fn position(&self, entry: &str) -> Option<usize> {
        self.trace.iter().position(|e| e == entry)
    }

    pub(crate) fn count(&self, entry: &str) -> usize {
        self.trace.iter().filter(|e| *e == entry).count()
    }

    fn log(&mut self, entry: impl Into<String>) {
        self.trace.push(entry.into());
    }

    fn open_channel(&mut self, what: String) -> RawResult<usize> {
        if let Some(err) = self.open_failures.pop_front() {
            return Err(err);
        }
        self.opened_channels += 1;
        let index = self.opened_channels;
        self.script(index);
        self.log(format!("channel{}.open {}", index, what));
        Ok(index)
    }
}

pub(crate) type SharedState = Arc<Mutex<MockState>>;

fn lock(state: &SharedState) -> std::sync::MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Transport backed by [`MockState`]
pub(crate) struct MockTransport {
    state: SharedState,
}

impl MockTransport {
    fn channel(&self, what: String) -> RawResult<MockChannel> {
        let index = lock(&self.state).open_channel(what)?;
        Ok(MockChannel {
            index,
            state: self.state.clone(),
        })
    }

    fn authenticate(&mut self, method: &str, ok: bool) -> RawResult<()> {
        let mut state = lock(&self.state);
        state.log(format!("auth {}", method));
        if ok {
            state.authenticated = true;
            Ok(())
        } else {
            Err(RawError::new(codes::AUTHENTICATION_FAILED, "authentication failed"))
        }
    }

    fn accept_keys(&self) -> bool {
        lock(&self.state).accept_keys
    }
}

impl Transport for MockTransport {
    type Channel = MockChannel;
    type Sftp = MockSftp;

    fn library_init() -> RawResult<()> {
        Ok(())
    }

    fn library_shutdown() {}

    fn block_directions(&self) -> BlockDirections {
        lock(&self.state).block_directions
    }

    fn set_blocking(&mut self, _blocking: bool) {}

    fn handshake(&mut self) -> RawResult<()> {
        let mut state = lock(&self.state);
        state.log("handshake");
        state.handshake_script.pop_front().unwrap_or(Ok(()))
    }

    fn host_key_fingerprint(&self, hash: FingerprintHash) -> Option<String> {
        let state = lock(&self.state);
        match hash {
            FingerprintHash::Sha256 => state.fingerprint.clone(),
            other => state
                .fingerprint
                .as_ref()
                .map(|f| format!("{}/{:?}", f, other).to_lowercase()),
        }
    }

    fn host_key_kind(&self) -> Option<HostKeyKind> {
        lock(&self.state).host_key_kind
    }

    fn banner(&self) -> Option<String> {
        lock(&self.state).banner.clone()
    }

    fn negotiated_method(&self, kind: MethodKind) -> Option<String> {
        lock(&self.state).negotiated.get(&kind).cloned()
    }

    fn auth_methods(&mut self, _username: &str) -> RawResult<Vec<String>> {
        let mut state = lock(&self.state);
        if state.accept_none {
            state.authenticated = true;
        }
        Ok(state.auth_methods.clone())
    }

    fn authenticated(&self) -> bool {
        lock(&self.state).authenticated
    }

    fn userauth_password(&mut self, _username: &str, password: &str) -> RawResult<()> {
        self.authenticate("password", password == PASSWORD)
    }

    fn userauth_pubkey_file(
        &mut self,
        _username: &str,
        _public_key: Option<&Path>,
        _private_key: &Path,
        _passphrase: Option<&str>,
    ) -> RawResult<()> {
        let ok = self.accept_keys();
        self.authenticate("publickey", ok)
    }

    fn userauth_pubkey_memory(
        &mut self,
        _username: &str,
        _public_key: Option<&str>,
        _private_key: &str,
        _passphrase: Option<&str>,
    ) -> RawResult<()> {
        let ok = self.accept_keys();
        self.authenticate("publickey", ok)
    }

    fn userauth_hostbased_file(
        &mut self,
        _username: &str,
        _public_key: &Path,
        _private_key: &Path,
        _passphrase: Option<&str>,
        _hostname: &str,
        _local_username: Option<&str>,
    ) -> RawResult<()> {
        let ok = self.accept_keys();
        self.authenticate("hostbased", ok)
    }

    fn userauth_keyboard_interactive(
        &mut self,
        username: &str,
        responder: &mut dyn PromptResponder,
    ) -> RawResult<()> {
        let prompt = Prompt {
            text: "Password: ".to_string(),
            echo: false,
        };
        let answers = responder.respond(username, "", std::slice::from_ref(&prompt));
        let ok = answers.first().is_some_and(|answer| answer == PASSWORD);
        lock(&self.state).prompts_answered.extend(answers);
        self.authenticate("keyboard-interactive", ok)
    }

    fn keepalive_configure(&mut self, _want_reply: bool, interval_secs: u32) {
        lock(&self.state).keepalive_interval = Some(interval_secs);
    }

    fn keepalive_send(&mut self) -> RawResult<u32> {
        let mut state = lock(&self.state);
        state.keepalive_calls += 1;
        state.keepalive_script.pop_front().unwrap_or(Ok(60))
    }

    fn open_session(&mut self) -> RawResult<MockChannel> {
        self.channel("session".to_string())
    }

    fn open_direct_tcpip(
        &mut self,
        host: &str,
        port: u16,
        _source: Option<(&str, u16)>,
    ) -> RawResult<MockChannel> {
        self.channel(format!("direct-tcpip {}:{}", host, port))
    }

    fn open_direct_streamlocal(
        &mut self,
        socket_path: &str,
        _source: Option<(&str, u16)>,
    ) -> RawResult<MockChannel> {
        self.channel(format!("direct-streamlocal {}", socket_path))
    }

    fn scp_send(&mut self, path: &Path, _mode: i32, _size: u64) -> RawResult<MockChannel> {
        self.channel(format!("scp-send {}", path.display()))
    }

    fn scp_recv(&mut self, path: &Path) -> RawResult<(MockChannel, u64)> {
        let content = lock(&self.state).fs.files.get(path).cloned();
        let Some(content) = content else {
            return Err(RawError::new(codes::CHANNEL_FAILURE, "scp: no such file"));
        };
        let channel = self.channel(format!("scp-recv {}", path.display()))?;
        let mut state = lock(&self.state);
        let declared = state.scp_declared_size.unwrap_or(content.len() as u64);
        let script = state.script(channel.index);
        script.push(StreamTag::Primary, &content);
        script.eof = true;
        Ok((channel, declared))
    }

    fn open_sftp(&mut self) -> RawResult<MockSftp> {
        let mut state = lock(&self.state);
        if state.refuse_sftp {
            return Err(RawError::new(codes::CHANNEL_FAILURE, "subsystem refused"));
        }
        state.log("sftp.open");
        Ok(MockSftp {
            state: self.state.clone(),
        })
    }

    fn disconnect(&mut self, _description: &str) -> RawResult<()> {
        lock(&self.state).log("control.disconnect");
        Ok(())
    }
}

/// Channel backed by one [`ChannelScript`]
pub(crate) struct MockChannel {
    index: usize,
    state: SharedState,
}

impl MockChannel {
    fn request(&mut self, what: String) -> RawResult<()> {
        let mut state = lock(&self.state);
        state.log(format!("channel{}.{}", self.index, what));
        if state.script(self.index).refuse_requests {
            Err(RawError::new(codes::CHANNEL_REQUEST_DENIED, "request denied"))
        } else {
            Ok(())
        }
    }
}

impl RawChannel for MockChannel {
    fn setenv(&mut self, name: &str, value: &str) -> RawResult<()> {
        self.request(format!("setenv {}={}", name, value))
    }

    fn request_pty(&mut self, term: &str, dims: PtyDimensions) -> RawResult<()> {
        self.request(format!("pty {} {}x{}", term, dims.width, dims.height))
    }

    fn request_pty_size(&mut self, dims: PtyDimensions) -> RawResult<()> {
        self.request(format!("pty-size {}x{}", dims.width, dims.height))
    }

    fn process_startup(&mut self, request: &str, message: Option<&str>) -> RawResult<()> {
        match message {
            Some(message) => self.request(format!("{} {}", request, message)),
            None => self.request(request.to_string()),
        }
    }

    fn read(&mut self, tag: StreamTag, buf: &mut [u8]) -> RawResult<usize> {
        let mut state = lock(&self.state);
        let script = state.script(self.index);
        let eof = script.eof;
        let queue = script.queue(tag);

        if matches!(queue.front(), Some(Err(_))) {
            return match queue.pop_front() {
                Some(Err(err)) => Err(err),
                _ => Ok(0),
            };
        }
        let Some(Ok(chunk)) = queue.front_mut() else {
            return if eof { Ok(0) } else { Err(RawError::would_block()) };
        };

        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        chunk.drain(..n);
        if chunk.is_empty() {
            queue.pop_front();
        }
        Ok(n)
    }

    fn write(&mut self, tag: StreamTag, buf: &[u8]) -> RawResult<usize> {
        let mut state = lock(&self.state);
        state.log(format!("channel{}.write {}", self.index, buf.len()));
        state.script(self.index).writes.push((tag, buf.to_vec()));
        Ok(buf.len())
    }

    fn eof(&self) -> bool {
        let mut state = lock(&self.state);
        let script = state.script(self.index);
        script.eof && script.drained()
    }

    fn exit_status(&mut self) -> Option<i32> {
        let mut state = lock(&self.state);
        let script = state.script(self.index);
        script.exit_status.filter(|_| script.drained())
    }

    fn send_eof(&mut self) -> RawResult<()> {
        let mut state = lock(&self.state);
        state.log(format!("channel{}.send_eof", self.index));
        if state.script(self.index).fail_eof {
            return Err(RawError::new(codes::SOCKET_SEND, "unable to send EOF"));
        }
        Ok(())
    }

    fn close(&mut self) -> RawResult<()> {
        let mut state = lock(&self.state);
        state.log(format!("channel{}.close", self.index));
        if state.script(self.index).fail_close {
            return Err(RawError::new(codes::SOCKET_SEND, "unable to send close"));
        }
        Ok(())
    }
}

/// File-transfer session over [`MockFs`]
pub(crate) struct MockSftp {
    state: SharedState,
}

impl Drop for MockSftp {
    fn drop(&mut self) {
        lock(&self.state).log("sftp.close");
    }
}

fn failure(message: &str) -> RawError {
    RawError::sftp(4, message)
}

impl RawSftp for MockSftp {
    type File = MockFile;

    fn open(
        &mut self,
        path: &Path,
        flags: OpenFlags,
        _mode: i32,
        kind: OpenType,
    ) -> RawResult<MockFile> {
        let mut state = lock(&self.state);
        let fs = &mut state.fs;
        let entries = match kind {
            OpenType::Dir => {
                if !fs.dirs.contains(path) {
                    return Err(RawError::sftp(2, "no such directory"));
                }
                fs.children(path).into()
            }
            OpenType::File => {
                if flags.contains(OpenFlags::CREATE) {
                    let file = fs.files.entry(path.to_path_buf()).or_default();
                    if flags.contains(OpenFlags::TRUNCATE) {
                        file.clear();
                    }
                } else if !fs.files.contains_key(path) {
                    return Err(RawError::sftp(2, "no such file"));
                }
                VecDeque::new()
            }
        };
        state.log(format!("file.open {}", path.display()));
        Ok(MockFile {
            path: path.to_path_buf(),
            pos: 0,
            entries,
            state: self.state.clone(),
        })
    }

    fn stat(&mut self, path: &Path) -> RawResult<FileStat> {
        let state = lock(&self.state);
        let target = state.fs.links.get(path).cloned();
        state.fs.stat(target.as_deref().unwrap_or(path))
    }

    fn lstat(&mut self, path: &Path) -> RawResult<FileStat> {
        let state = lock(&self.state);
        if state.fs.links.contains_key(path) {
            return Ok(FileStat {
                perm: Some(0o120777),
                ..empty_stat()
            });
        }
        state.fs.stat(path)
    }

    fn setstat(&mut self, path: &Path, stat: FileStat) -> RawResult<()> {
        let mut state = lock(&self.state);
        state.fs.stat(path)?;
        let attrs = state
            .fs
            .attrs
            .entry(path.to_path_buf())
            .or_insert_with(empty_stat);
        attrs.perm = stat.perm.or(attrs.perm);
        attrs.uid = stat.uid.or(attrs.uid);
        attrs.gid = stat.gid.or(attrs.gid);
        Ok(())
    }

    fn mkdir(&mut self, path: &Path, _mode: i32) -> RawResult<()> {
        let mut state = lock(&self.state);
        if state.fs.stat(path).is_ok() {
            return Err(failure("already exists"));
        }
        state.fs.dirs.insert(path.to_path_buf());
        Ok(())
    }

    fn rmdir(&mut self, path: &Path) -> RawResult<()> {
        let mut state = lock(&self.state);
        if state.fs.dirs.remove(path) {
            Ok(())
        } else {
            Err(RawError::sftp(2, "no such directory"))
        }
    }

    fn unlink(&mut self, path: &Path) -> RawResult<()> {
        let mut state = lock(&self.state);
        if state.fs.files.remove(path).is_some() || state.fs.links.remove(path).is_some() {
            Ok(())
        } else {
            Err(RawError::sftp(2, "no such file"))
        }
    }

    fn rename(&mut self, src: &Path, dst: &Path, flags: Option<RenameFlags>) -> RawResult<()> {
        let mut state = lock(&self.state);
        let overwrite = flags.map_or(true, |f| f.contains(RenameFlags::OVERWRITE));
        if !overwrite && state.fs.files.contains_key(dst) {
            return Err(failure("destination exists"));
        }
        let Some(data) = state.fs.files.remove(src) else {
            return Err(RawError::sftp(2, "no such file"));
        };
        state.fs.files.insert(dst.to_path_buf(), data);
        Ok(())
    }

    fn symlink(&mut self, path: &Path, target: &Path) -> RawResult<()> {
        let mut state = lock(&self.state);
        state.fs.links.insert(path.to_path_buf(), target.to_path_buf());
        Ok(())
    }

    fn readlink(&mut self, path: &Path) -> RawResult<PathBuf> {
        let state = lock(&self.state);
        state
            .fs
            .links
            .get(path)
            .cloned()
            .ok_or_else(|| RawError::sftp(2, "not a link"))
    }

    fn realpath(&mut self, path: &Path) -> RawResult<PathBuf> {
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(Path::new("/home/user").join(path))
        }
    }

    fn shutdown(&mut self) -> RawResult<()> {
        lock(&self.state).log("sftp.shutdown");
        Ok(())
    }
}

/// Open file or directory on [`MockFs`]
pub(crate) struct MockFile {
    path: PathBuf,
    pos: usize,
    entries: VecDeque<(PathBuf, FileStat)>,
    state: SharedState,
}

impl RawFile for MockFile {
    fn read(&mut self, buf: &mut [u8]) -> RawResult<usize> {
        let state = lock(&self.state);
        let Some(data) = state.fs.files.get(&self.path) else {
            return Err(RawError::sftp(2, "no such file"));
        };
        let rest = &data[self.pos.min(data.len())..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> RawResult<usize> {
        let mut state = lock(&self.state);
        let Some(data) = state.fs.files.get_mut(&self.path) else {
            return Err(RawError::sftp(2, "no such file"));
        };
        data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn readdir(&mut self) -> RawResult<Option<DirEntry>> {
        Ok(self
            .entries
            .pop_front()
            .map(|(path, stat)| DirEntry { path, stat }))
    }

    fn close(&mut self) -> RawResult<()> {
        let mut state = lock(&self.state);
        state.log(format!("file.close {}", self.path.display()));
        if state.file_close_would_block {
            return Err(RawError::would_block());
        }
        Ok(())
    }
}

#[derive(Default)]
struct SocketInner {
    outcomes: VecDeque<WaitOutcome>,
    waits: usize,
    parked: usize,
    directions: Vec<BlockDirections>,
}

/// Socket whose readiness is pushed by the test.
///
/// A wait with nothing queued stays pending until an outcome is pushed.
pub(crate) struct MockSocket {
    inner: Mutex<SocketInner>,
    changed: Notify,
    parked: Notify,
    state: SharedState,
}

impl MockSocket {
    fn new(state: SharedState) -> Self {
        Self {
            inner: Mutex::new(SocketInner::default()),
            changed: Notify::new(),
            parked: Notify::new(),
            state,
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, SocketInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn push(&self, outcome: WaitOutcome) {
        self.inner().outcomes.push_back(outcome);
        self.changed.notify_waiters();
    }

    pub(crate) fn push_ready(&self, n: usize) {
        for _ in 0..n {
            self.push(WaitOutcome::Ready);
        }
    }

    /// Waits that completed
    pub(crate) fn waits(&self) -> usize {
        self.inner().waits
    }

    pub(crate) fn directions(&self) -> Vec<BlockDirections> {
        self.inner().directions.clone()
    }

    /// Wait until `n` waits have parked with nothing queued
    pub(crate) async fn wait_for_waiters(&self, n: usize) {
        loop {
            let mut parked = pin!(self.parked.notified());
            parked.as_mut().enable();
            if self.inner().parked >= n {
                return;
            }
            parked.await;
        }
    }
}

#[async_trait]
impl Socket for MockSocket {
    async fn wait_ready(&self, directions: BlockDirections, _timeout: Option<Duration>) -> WaitOutcome {
        let mut parked = false;
        loop {
            let mut changed = pin!(self.changed.notified());
            changed.as_mut().enable();
            {
                let mut inner = self.inner();
                if let Some(outcome) = inner.outcomes.pop_front() {
                    inner.waits += 1;
                    inner.directions.push(directions);
                    return outcome;
                }
                if !parked {
                    parked = true;
                    inner.parked += 1;
                }
            }
            self.parked.notify_waiters();
            changed.await;
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        lock(&self.state).log("socket.shutdown");
        Ok(())
    }
}

/// Everything an observer saw, in delivery order
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Recorded {
    Session(SessionEvent),
    Channel(ChannelId, ChannelEvent),
}

const FLUSH: &str = "test-flush";

/// Records events and answers callbacks with fixed replies
pub(crate) struct RecordingObserver {
    tx: mpsc::UnboundedSender<Recorded>,
    accept_host_key: bool,
}

#[async_trait]
impl SessionObserver for RecordingObserver {
    fn verify_host_key(&self, _fingerprint: &str) -> bool {
        self.accept_host_key
    }

    fn keyboard_interactive(&self, _username: &str, _prompt: &Prompt) -> String {
        PASSWORD.to_string()
    }

    async fn on_session_event(&self, event: SessionEvent) {
        let _ = self.tx.send(Recorded::Session(event));
    }
}

#[async_trait]
impl ChannelObserver for RecordingObserver {
    async fn on_channel_event(&self, channel: ChannelId, event: ChannelEvent) {
        let _ = self.tx.send(Recorded::Channel(channel, event));
    }
}

pub(crate) struct Fixture {
    pub(crate) session: Session<MockTransport>,
    pub(crate) state: SharedState,
    pub(crate) socket: Arc<MockSocket>,
    pub(crate) events: mpsc::UnboundedReceiver<Recorded>,
}

impl Fixture {
    pub(crate) fn build(config: SessionConfig, accept_host_key: bool) -> Self {
        let state: SharedState = Arc::new(Mutex::new(MockState::default()));
        let socket = Arc::new(MockSocket::new(state.clone()));
        let (tx, events) = mpsc::unbounded_channel();
        let observer = Arc::new(RecordingObserver {
            tx,
            accept_host_key,
        });

        let transport = MockTransport {
            state: state.clone(),
        };
        let session = Session::with_transport(config, transport, socket.clone(), observer.clone())
            .expect("mock session");
        session.set_channel_observer(Some(observer));

        Self {
            session,
            state,
            socket,
            events,
        }
    }

    /// Every event queued so far, in delivery order
    pub(crate) async fn flush_events(&mut self) -> Vec<Recorded> {
        self.session
            .shared()
            .events
            .session(SessionEvent::Debug(FLUSH.to_string()));

        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("event dispatcher stalled")
                .expect("event dispatcher gone");
            if event == Recorded::Session(SessionEvent::Debug(FLUSH.to_string())) {
                return seen;
            }
            seen.push(event);
        }
    }

    pub(crate) fn trace(&self) -> Vec<String> {
        lock(&self.state).trace.clone()
    }
}

pub(crate) fn fixture() -> Fixture {
    fixture_with(SessionConfig::default())
}

pub(crate) fn fixture_with(config: SessionConfig) -> Fixture {
    Fixture::build(config, true)
}
