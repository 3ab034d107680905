//! File-transfer (SFTP) operations.
//!
//! All of them run on the session's file-transfer layer, opening it on first
//! use. Remote refusals (missing file, permission denied) come back as
//! `Ok(false)` / `Ok(None)`.

use crate::error::{accepted, RejectionExt, SessionError};
use crate::lifecycle::{FileId, Layer};
use crate::session::Session;
use crate::Result;
use burrow_transport::{
    codes, DirEntry, FileStat, OpenFlags, OpenType, RawError, RawFile, RawResult, RawSftp,
    RenameFlags, Transport,
};
use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Mode for files created without an explicit one
pub const DEFAULT_FILE_MODE: i32 = 0o644;

/// Mode for directories created without an explicit one
pub const DEFAULT_DIR_MODE: i32 = 0o755;

/// Buffers preallocated for a download never exceed this many read buffers
const MAX_PREALLOCATED_BUFFERS: u64 = 16;

/// Initial capacity for a download the remote claims is `total` bytes long
pub(crate) fn initial_capacity(total: u64, buffer_size: usize) -> usize {
    let cap = (buffer_size as u64).saturating_mul(MAX_PREALLOCATED_BUFFERS);
    usize::try_from(total.min(cap)).unwrap_or(0)
}

impl<T: Transport> Session<T> {
    /// Start the file-transfer session, replacing any previous one.
    ///
    /// `Ok(false)` if the remote refused the subsystem.
    pub async fn open_sftp(&self) -> Result<bool> {
        accepted(self.shared().open_sftp_layer().await)
    }

    async fn ensure_sftp(&self) -> Result<()> {
        if !self.is_open(Layer::FileTransfer) {
            self.shared().open_sftp_layer().await?;
        }
        Ok(())
    }

    async fn sftp_call<R>(&self, mut op: impl FnMut(&mut T::Sftp) -> RawResult<R>) -> Result<R> {
        self.ensure_sftp().await?;
        self.shared()
            .call(|handles| Ok(op(&mut handles.sftp()?.sftp)))
            .await
    }

    async fn open_remote(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: i32,
        kind: OpenType,
    ) -> Result<FileId> {
        self.ensure_sftp().await?;
        self.shared()
            .call(|handles| {
                let session = handles.sftp()?;
                Ok(session
                    .sftp
                    .open(path, flags, mode, kind)
                    .map(|file| session.insert(file)))
            })
            .await
    }

    async fn file_call<R>(
        &self,
        id: FileId,
        mut op: impl FnMut(&mut <T::Sftp as RawSftp>::File) -> RawResult<R>,
    ) -> Result<R> {
        self.shared()
            .call(|handles| Ok(op(handles.sftp()?.file(id)?)))
            .await
    }

    async fn close_remote(&self, id: FileId) {
        let result = self.file_call(id, |file| file.close()).await;
        if let Ok(session) = self.shared().lock().sftp() {
            session.remove(id);
        }
        if let Err(e) = result {
            debug!("Remote file close failed: {}", e);
        }
    }

    /// List `path`, skipping the configured ignored names.
    ///
    /// Entry paths are joined onto `path`.
    pub async fn read_dir(&self, path: impl AsRef<Path>) -> Result<Option<Vec<DirEntry>>> {
        let path = path.as_ref();
        let Some(dir) = self
            .open_remote(path, OpenFlags::READ, 0, OpenType::Dir)
            .await
            .or_refused()?
        else {
            return Ok(None);
        };

        let ignored = &self.config().ignored_files;
        let mut entries = Vec::new();
        let listed = loop {
            let result = self.file_call(dir, |file| file.readdir()).await;
            match result {
                Ok(Some(entry)) => {
                    if ignored.iter().any(|name| entry.path.as_os_str() == name.as_str()) {
                        continue;
                    }
                    entries.push(DirEntry {
                        path: path.join(&entry.path),
                        stat: entry.stat,
                    });
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.close_remote(dir).await;

        debug!("Listed {} entries in {}", entries.len(), path.display());
        Ok(listed.or_refused()?.map(|()| entries))
    }

    /// Attributes of `path`, following symlinks
    pub async fn stat(&self, path: impl AsRef<Path>) -> Result<Option<FileStat>> {
        let path = path.as_ref();
        self.sftp_call(|sftp| sftp.stat(path)).await.or_refused()
    }

    /// Attributes of `path` itself
    pub async fn lstat(&self, path: impl AsRef<Path>) -> Result<Option<FileStat>> {
        let path = path.as_ref();
        self.sftp_call(|sftp| sftp.lstat(path)).await.or_refused()
    }

    /// Target of the symlink at `path`
    pub async fn readlink(&self, path: impl AsRef<Path>) -> Result<Option<PathBuf>> {
        let path = path.as_ref();
        self.sftp_call(|sftp| sftp.readlink(path)).await.or_refused()
    }

    /// Canonical absolute form of `path`
    pub async fn realpath(&self, path: impl AsRef<Path>) -> Result<Option<PathBuf>> {
        let path = path.as_ref();
        self.sftp_call(|sftp| sftp.realpath(path)).await.or_refused()
    }

    /// Create a directory
    pub async fn mkdir(&self, path: impl AsRef<Path>, mode: Option<i32>) -> Result<bool> {
        let path = path.as_ref();
        let mode = mode.unwrap_or(DEFAULT_DIR_MODE);
        accepted(self.sftp_call(|sftp| sftp.mkdir(path, mode)).await)
    }

    /// Create an empty file, truncating any existing one
    pub async fn mkfile(&self, path: impl AsRef<Path>, mode: Option<i32>) -> Result<bool> {
        let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE;
        let mode = mode.unwrap_or(DEFAULT_FILE_MODE);
        match self
            .open_remote(path.as_ref(), flags, mode, OpenType::File)
            .await
            .or_refused()?
        {
            Some(file) => {
                self.close_remote(file).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Rename `src` to `dst`. `None` flags use the server default.
    pub async fn rename(
        &self,
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
        flags: Option<RenameFlags>,
    ) -> Result<bool> {
        let (src, dst) = (src.as_ref(), dst.as_ref());
        accepted(self.sftp_call(|sftp| sftp.rename(src, dst, flags)).await)
    }

    /// Remove an empty directory
    pub async fn rmdir(&self, path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        accepted(self.sftp_call(|sftp| sftp.rmdir(path)).await)
    }

    /// Remove a file
    pub async fn unlink(&self, path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        accepted(self.sftp_call(|sftp| sftp.unlink(path)).await)
    }

    /// Create a symlink at `path` pointing to `target`
    pub async fn symlink(&self, path: impl AsRef<Path>, target: impl AsRef<Path>) -> Result<bool> {
        let (path, target) = (path.as_ref(), target.as_ref());
        accepted(self.sftp_call(|sftp| sftp.symlink(path, target)).await)
    }

    /// Change permission bits
    pub async fn chmod(&self, path: impl AsRef<Path>, mode: u32) -> Result<bool> {
        self.setstat(
            path.as_ref(),
            FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: Some(mode),
                atime: None,
                mtime: None,
            },
        )
        .await
    }

    /// Change owner and group
    pub async fn chown(&self, path: impl AsRef<Path>, uid: u32, gid: u32) -> Result<bool> {
        self.setstat(
            path.as_ref(),
            FileStat {
                size: None,
                uid: Some(uid),
                gid: Some(gid),
                perm: None,
                atime: None,
                mtime: None,
            },
        )
        .await
    }

    async fn setstat(&self, path: &Path, stat: FileStat) -> Result<bool> {
        accepted(self.sftp_call(|sftp| sftp.setstat(path, stat.clone())).await)
    }

    /// Read a whole remote file.
    ///
    /// `progress(done, total)` runs after every chunk; returning `false`
    /// aborts with [`SessionError::Cancelled`].
    pub async fn read_file(
        &self,
        path: impl AsRef<Path>,
        mut progress: impl FnMut(u64, u64) -> bool,
    ) -> Result<Option<Bytes>> {
        let path = path.as_ref();
        let Some(stat) = self.stat(path).await? else {
            return Ok(None);
        };
        let total = stat.size.unwrap_or(0);

        let Some(file) = self
            .open_remote(path, OpenFlags::READ, 0, OpenType::File)
            .await
            .or_refused()?
        else {
            return Ok(None);
        };

        let mut data = BytesMut::with_capacity(initial_capacity(total, self.config().buffer_size));
        let mut buf = vec![0; self.config().buffer_size.max(1)];
        let read = loop {
            let result = self.file_call(file, |remote| remote.read(&mut buf)).await;
            let n = match result {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e),
            };
            data.extend_from_slice(&buf[..n]);
            if !progress(data.len() as u64, total) {
                break Err(SessionError::Cancelled);
            }
        };
        self.close_remote(file).await;

        debug!("Read {} bytes from {}", data.len(), path.display());
        Ok(read.or_refused()?.map(|()| data.freeze()))
    }

    /// Write `data` to a remote file, creating or truncating it.
    ///
    /// `progress(done, total)` runs after every chunk; returning `false`
    /// aborts with [`SessionError::Cancelled`].
    pub async fn write_file(
        &self,
        path: impl AsRef<Path>,
        data: &[u8],
        mode: Option<i32>,
        mut progress: impl FnMut(u64, u64) -> bool,
    ) -> Result<bool> {
        let path = path.as_ref();
        let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE;
        let mode = mode.unwrap_or(DEFAULT_FILE_MODE);
        let Some(file) = self
            .open_remote(path, flags, mode, OpenType::File)
            .await
            .or_refused()?
        else {
            return Ok(false);
        };

        let total = data.len() as u64;
        let chunk_size = self.config().buffer_size.max(1);
        let mut written = 0;
        let wrote = loop {
            if written == data.len() {
                break Ok(());
            }
            let end = (written + chunk_size).min(data.len());
            let result = self
                .file_call(file, |remote| remote.write(&data[written..end]))
                .await;
            match result {
                Ok(0) => {
                    break Err(SessionError::Send(RawError::new(
                        codes::SOCKET_SEND,
                        "remote file accepted no data",
                    )))
                }
                Ok(n) => written += n,
                Err(e) => break Err(e),
            }
            if !progress(written as u64, total) {
                break Err(SessionError::Cancelled);
            }
        };
        self.close_remote(file).await;

        debug!("Wrote {} bytes to {}", written, path.display());
        accepted(wrote)
    }
}
