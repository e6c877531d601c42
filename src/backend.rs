//! The storage capability set shared by all backends.
//!
//! A backend exposes exactly three operations: `stat`, `read_at`, and
//! `close`. Each in-flight response owns exactly one backend handle and
//! releases it exactly once, on success, error, or client disconnect.

use std::io;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::http::HeaderValue;
use axum_extra::headers::{ETag, Header, IfRange, LastModified};
use bytes::Bytes;
use thiserror::Error;

/// Consistent snapshot of a resource, taken once per request.
///
/// Headers and `Content-Range` values are derived from this snapshot
/// only; the resource is never re-stat'ed mid-stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    /// Total size in bytes.
    pub size: u64,
    /// Modification time, when the backend reports one.
    pub last_modified: Option<SystemTime>,
    /// Opaque entity tag derived from the `(mtime, size)` fingerprint.
    pub etag: String,
}

impl ResourceDescriptor {
    pub fn new(size: u64, last_modified: Option<SystemTime>) -> Self {
        let mtime_secs = last_modified
            .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |since_epoch| since_epoch.as_secs());
        let etag = format!("\"{mtime_secs:x}-{size:x}\"");
        ResourceDescriptor { size, last_modified, etag }
    }

    /// True when a caller-supplied `If-Range` validator still matches
    /// this snapshot, meaning the range request may be honoured.
    ///
    /// The response builder never consults `If-Range` itself; this is a
    /// convenience for callers that filter range requests before handing
    /// the header over.
    pub fn validates_if_range(&self, value: &str) -> bool {
        let Ok(value) = HeaderValue::from_str(value) else {
            return false;
        };
        let Ok(if_range) = IfRange::decode(&mut [value].iter()) else {
            return false;
        };
        let etag = ETag::from_str(&self.etag).ok();
        let last_modified = self.last_modified.map(LastModified::from);
        !if_range.is_modified(etag.as_ref(), last_modified.as_ref())
    }
}

/// Failure classification for backend operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// The resource does not exist; surfaces as a 404.
    NotFound,
    /// The resource exists but may not be read; surfaces as a 500.
    PermissionDenied,
    /// The transport to the storage dropped; fatal mid-stream.
    ConnectionLost,
    /// Anything else.
    Other,
}

/// Error raised by [`StorageBackend`] operations.
#[derive(Debug, Error)]
#[error("storage backend error: {detail}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub detail: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, detail: impl Into<String>) -> Self {
        BackendError { kind, detail: detail.into() }
    }

    pub fn other(detail: impl Into<String>) -> Self {
        BackendError::new(BackendErrorKind::Other, detail)
    }
}

impl From<io::Error> for BackendError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => BackendErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => BackendErrorKind::PermissionDenied,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => BackendErrorKind::ConnectionLost,
            _ => BackendErrorKind::Other,
        };
        BackendError::new(kind, err.to_string())
    }
}

impl From<BackendError> for io::Error {
    fn from(err: BackendError) -> Self {
        let kind = match err.kind {
            BackendErrorKind::NotFound => io::ErrorKind::NotFound,
            BackendErrorKind::PermissionDenied => io::ErrorKind::PermissionDenied,
            BackendErrorKind::ConnectionLost => io::ErrorKind::ConnectionReset,
            BackendErrorKind::Other => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Ownership of the transport session underneath a remote backend.
///
/// `Owned` signals an ownership transfer: the response closes the parent
/// session itself once it finishes. `Borrowed` leaves the session to the
/// caller and only closes the per-response file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOwnership {
    Borrowed,
    Owned,
}

/// Seekable, byte-addressable data source of known total length.
///
/// `read_at` returns exactly `length` bytes except at end of file, where
/// it may return fewer. Implementations that read from transports with
/// smaller transfer units must loop internally until the requested
/// length is filled.
#[async_trait]
pub trait StorageBackend: Send {
    /// Take a consistent snapshot of the resource.
    async fn stat(&mut self) -> Result<ResourceDescriptor, BackendError>;

    /// Read up to `length` bytes starting at `offset`, short only at EOF.
    async fn read_at(&mut self, offset: u64, length: u64) -> Result<Bytes, BackendError>;

    /// Release the handle. Called exactly once per response.
    async fn close(&mut self) -> Result<(), BackendError>;
}
