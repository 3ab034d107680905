//! Whole-file upload and download over SCP or SFTP

use crate::error::{RejectionExt, SessionError};
use crate::lifecycle::ChannelKind;
use crate::session::Session;
use crate::sftp::{initial_capacity, DEFAULT_FILE_MODE};
use crate::Result;
use burrow_transport::{codes, RawError, StreamTag, Transport};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Protocol used for whole-file transfers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// SCP over a dedicated sub-channel
    Scp,
    /// The file-transfer session
    #[default]
    Sftp,
}

impl<T: Transport> Session<T> {
    /// Upload `data` to `remote`.
    ///
    /// `progress(done, total)` runs after every chunk and may abort the
    /// transfer by returning `false`. `Ok(false)` if the remote refused.
    pub async fn upload(
        &self,
        data: &[u8],
        remote: impl AsRef<Path>,
        mode: TransferMode,
        progress: impl FnMut(u64, u64) -> bool,
    ) -> Result<bool> {
        let remote = remote.as_ref();
        info!("Uploading {} bytes to {} over {:?}", data.len(), remote.display(), mode);
        match mode {
            TransferMode::Sftp => self.write_file(remote, data, None, progress).await,
            TransferMode::Scp => self.scp_upload(data, remote, progress).await,
        }
    }

    /// Download `remote` into memory. `Ok(None)` if the remote refused.
    pub async fn download(
        &self,
        remote: impl AsRef<Path>,
        mode: TransferMode,
        progress: impl FnMut(u64, u64) -> bool,
    ) -> Result<Option<Bytes>> {
        let remote = remote.as_ref();
        info!("Downloading {} over {:?}", remote.display(), mode);
        match mode {
            TransferMode::Sftp => self.read_file(remote, progress).await,
            TransferMode::Scp => self.scp_download(remote, progress).await,
        }
    }

    /// Upload the local file at `local`
    pub async fn upload_file(
        &self,
        local: impl AsRef<Path>,
        remote: impl AsRef<Path>,
        mode: TransferMode,
        progress: impl FnMut(u64, u64) -> bool,
    ) -> Result<bool> {
        let data = tokio::fs::read(local.as_ref()).await?;
        self.upload(&data, remote, mode, progress).await
    }

    /// Download `remote` into the local file at `local`
    pub async fn download_file(
        &self,
        remote: impl AsRef<Path>,
        local: impl AsRef<Path>,
        mode: TransferMode,
        progress: impl FnMut(u64, u64) -> bool,
    ) -> Result<bool> {
        let Some(data) = self.download(remote, mode, progress).await? else {
            return Ok(false);
        };
        tokio::fs::write(local.as_ref(), &data).await?;
        Ok(true)
    }

    async fn scp_upload(
        &self,
        data: &[u8],
        remote: &Path,
        mut progress: impl FnMut(u64, u64) -> bool,
    ) -> Result<bool> {
        let total = data.len() as u64;
        let opened = self
            .shared()
            .open_channel_with(ChannelKind::ScpSend, |transport| {
                Ok((transport.scp_send(remote, DEFAULT_FILE_MODE, total)?, ()))
            })
            .await
            .or_refused()?;
        let Some((id, ())) = opened else {
            return Ok(false);
        };

        let sent = async {
            let mut done = 0u64;
            for chunk in data.chunks(self.config().buffer_size.max(1)) {
                self.write(StreamTag::Primary, chunk).await?;
                done += chunk.len() as u64;
                if !progress(done, total) {
                    return Err(SessionError::Cancelled);
                }
            }
            self.send_eof().await?;
            // The remote acknowledges with its own end-of-stream.
            while !self.read(StreamTag::Primary).await?.is_empty() {}
            Ok(())
        }
        .await;

        self.shared().close_channel_if(id);
        sent?;
        debug!("SCP upload of {} bytes to {} done", total, remote.display());
        Ok(true)
    }

    async fn scp_download(
        &self,
        remote: &Path,
        mut progress: impl FnMut(u64, u64) -> bool,
    ) -> Result<Option<Bytes>> {
        let opened = self
            .shared()
            .open_channel_with(ChannelKind::ScpRecv, |transport| transport.scp_recv(remote))
            .await
            .or_refused()?;
        let Some((id, total)) = opened else {
            return Ok(None);
        };

        let received = async {
            let mut data =
                BytesMut::with_capacity(initial_capacity(total, self.config().buffer_size));
            while (data.len() as u64) < total {
                let chunk = self.read(StreamTag::Primary).await?;
                if chunk.is_empty() {
                    return Err(SessionError::Recv(RawError::new(
                        codes::SOCKET_RECV,
                        format!("stream ended after {} of {} bytes", data.len(), total),
                    )));
                }
                let wanted = usize::try_from(total - data.len() as u64).unwrap_or(usize::MAX);
                data.extend_from_slice(&chunk[..chunk.len().min(wanted)]);
                if !progress(data.len() as u64, total) {
                    return Err(SessionError::Cancelled);
                }
            }
            Ok(data.freeze())
        }
        .await;

        self.shared().close_channel_if(id);
        let data = received?;
        debug!("SCP download of {} bytes from {} done", data.len(), remote.display());
        Ok(Some(data))
    }
}
