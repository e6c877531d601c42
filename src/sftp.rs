//! Remote backend over an established SFTP session.
//!
//! The caller connects and authenticates the SSH transport, starts the
//! SFTP subsystem, and hands the [`SftpSession`] over together with the
//! remote path. [`SessionOwnership`] decides whether closing the
//! response also closes the session or leaves it with the caller for
//! reuse across later (sequential) responses.

use std::io::SeekFrom;
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::fs::File as SftpFile;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{OpenFlags, StatusCode};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

use crate::backend::{
    BackendError, BackendErrorKind, ResourceDescriptor, SessionOwnership, StorageBackend,
};

/// [`StorageBackend`] over a remote file reached through SFTP.
///
/// The remote file handle is opened lazily on the first read. `stat` and
/// `read_at` suspend the calling task; they never block the runtime.
pub struct SftpBackend {
    sftp: Option<SftpSession>,
    path: String,
    ownership: SessionOwnership,
    file: Option<SftpFile>,
}

impl SftpBackend {
    pub fn new(sftp: SftpSession, path: impl Into<String>, ownership: SessionOwnership) -> Self {
        SftpBackend { sftp: Some(sftp), path: path.into(), ownership, file: None }
    }

    /// Final path component, usable as a download filename.
    pub fn file_name(&self) -> Option<&str> {
        self.path.rsplit('/').next().filter(|name| !name.is_empty())
    }

    fn session(&self) -> Result<&SftpSession, BackendError> {
        self.sftp
            .as_ref()
            .ok_or_else(|| BackendError::other("sftp session already released"))
    }

    async fn file(&mut self) -> Result<&mut SftpFile, BackendError> {
        if self.file.is_none() {
            let file = self
                .session()?
                .open_with_flags(&self.path, OpenFlags::READ)
                .await
                .map_err(sftp_error)?;
            self.file = Some(file);
        }
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(BackendError::other("remote file handle missing")),
        }
    }
}

#[async_trait]
impl StorageBackend for SftpBackend {
    async fn stat(&mut self) -> Result<ResourceDescriptor, BackendError> {
        let attrs = self.session()?.metadata(&self.path).await.map_err(sftp_error)?;
        if attrs.is_dir() {
            return Err(BackendError::other(format!("{} is a directory", self.path)));
        }
        let size = attrs.size.ok_or_else(|| {
            BackendError::other(format!("server reported no size for {}", self.path))
        })?;
        let last_modified = attrs
            .mtime
            .map(|secs| UNIX_EPOCH + Duration::from_secs(u64::from(secs)));
        Ok(ResourceDescriptor::new(size, last_modified))
    }

    async fn read_at(&mut self, offset: u64, length: u64) -> Result<Bytes, BackendError> {
        let file = self.file().await?;
        file.seek(SeekFrom::Start(offset)).await?;

        // SFTP servers cap the transfer unit per read request, so a
        // single read may come back short mid-file. Loop until the
        // requested length is filled or the file ends.
        let mut buf = vec![0u8; usize::try_from(length).unwrap_or(usize::MAX)];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        if let Some(mut file) = self.file.take() {
            if let Err(err) = file.shutdown().await {
                warn!(path = %self.path, error = %err, "failed to close remote file handle");
            }
        }
        if self.ownership == SessionOwnership::Owned {
            if let Some(sftp) = self.sftp.take() {
                sftp.close().await.map_err(sftp_error)?;
            }
        }
        Ok(())
    }
}

fn sftp_error(err: SftpError) -> BackendError {
    let kind = match &err {
        SftpError::Status(status) => status_kind(&status.status_code),
        _ => BackendErrorKind::Other,
    };
    BackendError::new(kind, err.to_string())
}

fn status_kind(code: &StatusCode) -> BackendErrorKind {
    match code {
        StatusCode::NoSuchFile => BackendErrorKind::NotFound,
        StatusCode::PermissionDenied => BackendErrorKind::PermissionDenied,
        StatusCode::NoConnection | StatusCode::ConnectionLost => BackendErrorKind::ConnectionLost,
        _ => BackendErrorKind::Other,
    }
}
