//! In-memory instrumented backend for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;

use crate::backend::{
    BackendError, BackendErrorKind, ResourceDescriptor, StorageBackend,
};

/// [`StorageBackend`] over an in-memory buffer, counting `close` calls
/// and optionally misbehaving on demand.
pub(crate) struct MemoryBackend {
    data: Bytes,
    reported_size: u64,
    fail_at: Option<u64>,
    stat_error: Option<BackendErrorKind>,
    closes: Arc<AtomicUsize>,
}

impl MemoryBackend {
    pub(crate) fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let reported_size = data.len() as u64;
        MemoryBackend {
            data,
            reported_size,
            fail_at: None,
            stat_error: None,
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Report a size different from the actual buffer, simulating a
    /// resource that mutated between `stat` and `read_at`.
    pub(crate) fn with_reported_size(mut self, size: u64) -> Self {
        self.reported_size = size;
        self
    }

    /// Fail reads at or beyond `offset` with a lost connection.
    pub(crate) fn failing_at(mut self, offset: u64) -> Self {
        self.fail_at = Some(offset);
        self
    }

    /// Fail `stat` with the given error kind.
    pub(crate) fn failing_stat(mut self, kind: BackendErrorKind) -> Self {
        self.stat_error = Some(kind);
        self
    }

    /// Shared handle to the `close` call counter.
    pub(crate) fn close_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn stat(&mut self) -> Result<ResourceDescriptor, BackendError> {
        if let Some(kind) = self.stat_error {
            return Err(BackendError::new(kind, "injected stat failure"));
        }
        Ok(ResourceDescriptor::new(
            self.reported_size,
            Some(UNIX_EPOCH + Duration::from_secs(1_416_039_151)),
        ))
    }

    async fn read_at(&mut self, offset: u64, length: u64) -> Result<Bytes, BackendError> {
        if let Some(fail_at) = self.fail_at {
            if offset >= fail_at {
                return Err(BackendError::new(
                    BackendErrorKind::ConnectionLost,
                    "injected connection loss",
                ));
            }
        }
        let start = (offset as usize).min(self.data.len());
        let end = (start + length as usize).min(self.data.len());
        Ok(self.data.slice(start..end))
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
