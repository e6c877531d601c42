//! Local filesystem backend.
//!
//! Disk I/O goes through [`tokio::fs`], which runs the blocking syscalls
//! on the runtime's blocking thread pool, so a slow disk never stalls
//! other request tasks.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::backend::{BackendError, ResourceDescriptor, StorageBackend};

/// [`StorageBackend`] over a filesystem path.
///
/// The file is opened lazily on the first read and dropped on `close`.
#[derive(Debug)]
pub struct LocalBackend {
    path: PathBuf,
    file: Option<File>,
}

impl LocalBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LocalBackend { path: path.into(), file: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final path component, usable as a download filename.
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }

    async fn file(&mut self) -> Result<&mut File, BackendError> {
        if self.file.is_none() {
            self.file = Some(File::open(&self.path).await?);
        }
        // the handle was just populated above
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(BackendError::other("local file handle missing")),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn stat(&mut self) -> Result<ResourceDescriptor, BackendError> {
        let metadata = tokio::fs::metadata(&self.path).await?;
        if metadata.is_dir() {
            return Err(BackendError::other(format!(
                "{} is a directory",
                self.path.display()
            )));
        }
        Ok(ResourceDescriptor::new(metadata.len(), metadata.modified().ok()))
    }

    async fn read_at(&mut self, offset: u64, length: u64) -> Result<Bytes, BackendError> {
        let file = self.file().await?;
        file.seek(SeekFrom::Start(offset)).await?;

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
        self.file.take();
        Ok(())
    }
}
