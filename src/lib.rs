//! # axum-ranged
//!
//! HTTP range responses for [`axum`][1], served out of pluggable storage
//! backends.
//!
//! A [`StorageBackend`] is any seekable, byte-addressable source of known
//! length: [`LocalBackend`] reads files on disk, [`SftpBackend`] reads
//! remote files over an established SFTP session. Given a raw `Range`
//! header and a backend, [`Ranged`] produces the right response: 200 with
//! the full body, 206 with a single range, 206 with a
//! `multipart/byteranges` body for several ranges, or 416 when nothing
//! can be satisfied. Bodies are streamed in bounded chunks and the
//! backend handle is released exactly once, even when the client
//! disconnects mid-transfer.
//!
//! ```
//! use axum::Router;
//! use axum::http::HeaderMap;
//! use axum::http::header::RANGE;
//! use axum::routing::get;
//!
//! use axum_ranged::{LocalBackend, Ranged, RangeResponseError, RangedResponse};
//!
//! async fn file(headers: HeaderMap) -> Result<RangedResponse, RangeResponseError> {
//!     let range = headers
//!         .get(RANGE)
//!         .and_then(|value| value.to_str().ok())
//!         .map(str::to_owned);
//!     let backend = LocalBackend::new("test/fixture.txt");
//!     Ranged::new(range, backend)
//!         .with_filename("fixture.txt")
//!         .try_respond()
//!         .await
//! }
//!
//! let _app = Router::<()>::new().route("/", get(file));
//! ```
//!
//! [1]: https://docs.rs/axum

pub mod backend;
pub mod header;
pub mod local;
pub mod resolve;
pub mod sftp;
pub mod stream;

#[cfg(test)]
mod testutil;

use axum::http::header::{
    ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG,
    LAST_MODIFIED,
};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::headers::{Header, LastModified};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use thiserror::Error;
use tracing::{debug, warn};

pub use backend::{
    BackendError, BackendErrorKind, ResourceDescriptor, SessionOwnership, StorageBackend,
};
pub use header::ParsedRangeRequest;
pub use local::LocalBackend;
pub use resolve::{ByteRange, NotSatisfiable, ResolvedPlan};
pub use sftp::SftpBackend;
pub use stream::{MultipartStream, RangedStream};

const OCTET_STREAM: &str = "application/octet-stream";

// attr-char from RFC 5987: ALPHA / DIGIT / !#$&+-.^_`|~
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// The main responder type: a storage backend plus the request's raw
/// `Range` header value.
pub struct Ranged<B: StorageBackend + 'static> {
    range: Option<String>,
    backend: B,
    media_type: Option<String>,
    filename: Option<String>,
}

impl<B: StorageBackend + 'static> Ranged<B> {
    /// Construct a ranged response over any [`StorageBackend`] and the
    /// raw `Range` header value, if the request carried one.
    pub fn new(range: Option<String>, backend: B) -> Self {
        Ranged { range, backend, media_type: None, filename: None }
    }

    /// Set the response media type. When absent it is guessed from the
    /// download filename, falling back to `application/octet-stream`.
    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    /// Set a download filename, emitted as a `Content-Disposition`
    /// attachment header.
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Stat the resource, resolve the requested ranges, and build the
    /// response headers and body stream.
    ///
    /// The backend handle is consumed either way: on success it is owned
    /// by the returned body stream and released when the stream
    /// terminates; on error it is closed before returning.
    pub async fn try_respond(self) -> Result<RangedResponse, RangeResponseError> {
        let Ranged { range, mut backend, media_type, filename } = self;

        let descriptor = match backend.stat().await {
            Ok(descriptor) => descriptor,
            Err(err) => {
                close_quietly(&mut backend).await;
                return Err(RangeResponseError::Backend(err));
            }
        };

        let parsed = header::parse(range.as_deref(), descriptor.size);
        let plan = match resolve::resolve(parsed, &descriptor) {
            Ok(plan) => plan,
            Err(unsatisfiable) => {
                close_quietly(&mut backend).await;
                return Err(RangeResponseError::NotSatisfiable(unsatisfiable));
            }
        };
        debug!(size = descriptor.size, ?plan, "resolved range request");

        let media_type = media_type.unwrap_or_else(|| guess_media_type(filename.as_deref()));
        let mut headers = common_headers(&descriptor, filename.as_deref());

        match plan {
            ResolvedPlan::Full => {
                insert_str(&mut headers, CONTENT_TYPE, &media_type);
                headers.insert(CONTENT_LENGTH, HeaderValue::from(descriptor.size));
                let stream = RangedStream::new(backend, 0, descriptor.size);
                Ok(RangedResponse::Full { headers, stream })
            }
            ResolvedPlan::Single(range) => {
                insert_str(&mut headers, CONTENT_TYPE, &media_type);
                insert_str(
                    &mut headers,
                    CONTENT_RANGE,
                    &format!("bytes {}-{}/{}", range.start, range.end, descriptor.size),
                );
                headers.insert(CONTENT_LENGTH, HeaderValue::from(range.len()));
                let stream = RangedStream::new(backend, range.start, range.len());
                Ok(RangedResponse::Single { headers, stream })
            }
            ResolvedPlan::Multi(ranges) => {
                let boundary = stream::generate_boundary();
                insert_str(
                    &mut headers,
                    CONTENT_TYPE,
                    &format!("multipart/byteranges; boundary={boundary}"),
                );
                let stream = MultipartStream::new(
                    backend,
                    ranges,
                    descriptor.size,
                    boundary,
                    media_type,
                );
                headers.insert(CONTENT_LENGTH, HeaderValue::from(stream.length()));
                Ok(RangedResponse::Multi { headers, stream })
            }
        }
    }
}

/// Computed headers and body for a range response.
/// Implements [`IntoResponse`].
pub enum RangedResponse {
    /// 200, whole resource.
    Full { headers: HeaderMap, stream: RangedStream },
    /// 206 with a `Content-Range` header.
    Single { headers: HeaderMap, stream: RangedStream },
    /// 206 with a `multipart/byteranges` body.
    Multi { headers: HeaderMap, stream: MultipartStream },
}

impl IntoResponse for RangedResponse {
    fn into_response(self) -> Response {
        match self {
            RangedResponse::Full { headers, stream } => {
                (StatusCode::OK, headers, stream).into_response()
            }
            RangedResponse::Single { headers, stream } => {
                (StatusCode::PARTIAL_CONTENT, headers, stream).into_response()
            }
            RangedResponse::Multi { headers, stream } => {
                (StatusCode::PARTIAL_CONTENT, headers, stream).into_response()
            }
        }
    }
}

/// Failure to build a range response. Implements [`IntoResponse`].
///
/// These errors are always resolved before the first body byte is
/// written, so they map to clean status codes: 416 for an unsatisfiable
/// range, 404 for a missing resource, 500 for any other backend failure.
#[derive(Debug, Error)]
pub enum RangeResponseError {
    #[error(transparent)]
    NotSatisfiable(#[from] NotSatisfiable),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl IntoResponse for RangeResponseError {
    fn into_response(self) -> Response {
        match self {
            RangeResponseError::NotSatisfiable(NotSatisfiable { size }) => {
                let mut headers = HeaderMap::new();
                headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
                insert_str(&mut headers, CONTENT_RANGE, &format!("bytes */{size}"));
                (StatusCode::RANGE_NOT_SATISFIABLE, headers).into_response()
            }
            RangeResponseError::Backend(err) => {
                let status = match err.kind {
                    BackendErrorKind::NotFound => StatusCode::NOT_FOUND,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    warn!(error = %err, "storage backend failed before streaming");
                }
                status.into_response()
            }
        }
    }
}

async fn close_quietly<B: StorageBackend>(backend: &mut B) {
    if let Err(err) = backend.close().await {
        warn!(error = %err, "failed to close storage handle");
    }
}

fn guess_media_type(filename: Option<&str>) -> String {
    filename
        .and_then(|name| mime_guess::from_path(name).first_raw())
        .unwrap_or(OCTET_STREAM)
        .to_string()
}

fn common_headers(descriptor: &ResourceDescriptor, filename: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    insert_str(&mut headers, ETAG, &descriptor.etag);
    if let Some(mtime) = descriptor.last_modified {
        if let Some(value) = encode_typed(&LastModified::from(mtime)) {
            headers.insert(LAST_MODIFIED, value);
        }
    }
    if let Some(name) = filename {
        let name: String = name.chars().filter(|c| !c.is_control() && *c != '"').collect();
        let value = if name.is_ascii() {
            format!("attachment; filename=\"{name}\"")
        } else {
            // RFC 5987 extended form for names outside ASCII
            format!(
                "attachment; filename*=utf-8''{}",
                utf8_percent_encode(&name, ATTR_CHAR),
            )
        };
        insert_str(&mut headers, CONTENT_DISPOSITION, &value);
    }
    headers
}

fn insert_str(headers: &mut HeaderMap, name: axum::http::header::HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!(header = %name, "dropping header with invalid value"),
    }
}

fn encode_typed<H: Header>(header: &H) -> Option<HeaderValue> {
    let mut values = Vec::new();
    header.encode(&mut values);
    values.into_iter().next()
}
