//! Response body streamers.
//!
//! [`RangedStream`] carries full-body and single-range responses,
//! [`MultipartStream`] encodes `multipart/byteranges` bodies. Both pull
//! from the storage backend in bounded chunks and guarantee the handle
//! is released exactly once, whether the stream runs to completion,
//! fails mid-transfer, or is dropped when the client disconnects.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use async_stream::try_stream;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::Stream;
use http_body::{Body, Frame, SizeHint};
use tracing::warn;

use crate::backend::StorageBackend;
use crate::resolve::ByteRange;

const IO_CHUNK_SIZE: u64 = 64 * 1024;

/// Ensures the storage handle is closed exactly once on every exit path.
///
/// The happy path and in-stream error paths call [`finish`] inline; if
/// the stream is dropped early the `Drop` impl spawns the close onto the
/// runtime instead, since destructors cannot await.
///
/// [`finish`]: StorageGuard::finish
struct StorageGuard<B: StorageBackend + 'static> {
    backend: Option<B>,
}

impl<B: StorageBackend + 'static> StorageGuard<B> {
    fn new(backend: B) -> Self {
        StorageGuard { backend: Some(backend) }
    }

    /// Read exactly `want` bytes at `offset`. A short read means the
    /// resource changed between `stat` and now; the transfer cannot be
    /// completed truthfully and is aborted.
    async fn read_exact_at(&mut self, offset: u64, want: u64) -> io::Result<Bytes> {
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| io::Error::other("storage handle already released"))?;
        let chunk = backend.read_at(offset, want).await.map_err(io::Error::from)?;
        if (chunk.len() as u64) < want {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "short read at offset {offset}: got {} of {want} bytes, resource changed mid-response",
                    chunk.len(),
                ),
            ));
        }
        Ok(chunk)
    }

    async fn finish(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            if let Err(err) = backend.close().await {
                warn!(error = %err, "failed to close storage handle");
            }
        }
    }
}

impl<B: StorageBackend + 'static> Drop for StorageGuard<B> {
    fn drop(&mut self) {
        let Some(mut backend) = self.backend.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = backend.close().await {
                        warn!(error = %err, "failed to close storage handle after cancelled stream");
                    }
                });
            }
            Err(_) => warn!("storage handle dropped outside a runtime; close skipped"),
        }
    }
}

type BoxByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Body stream for full and single-range responses.
/// Implements [`Stream`], [`Body`], and [`IntoResponse`].
pub struct RangedStream {
    length: u64,
    inner: BoxByteStream,
}

impl RangedStream {
    pub(crate) fn new<B: StorageBackend + 'static>(backend: B, start: u64, length: u64) -> Self {
        RangedStream {
            length,
            inner: Box::pin(stream_slice(backend, start, length)),
        }
    }

    /// Exact body length in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }
}

fn stream_slice<B: StorageBackend + 'static>(
    backend: B,
    start: u64,
    length: u64,
) -> impl Stream<Item = io::Result<Bytes>> + Send {
    // the guard must exist before the generator runs: a stream dropped
    // without ever being polled still has to release the handle
    let mut guard = StorageGuard::new(backend);
    try_stream! {
        let mut offset = start;
        let end = start + length;
        while offset < end {
            let want = (end - offset).min(IO_CHUNK_SIZE);
            let chunk = guard.read_exact_at(offset, want).await;
            if let Err(err) = &chunk {
                warn!(error = %err, "terminating response stream, transfer truncated");
                guard.finish().await;
            }
            let chunk = chunk?;
            offset += chunk.len() as u64;
            yield chunk;
        }
        guard.finish().await;
    }
}

impl Stream for RangedStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

impl Body for RangedStream {
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.length)
    }

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<io::Result<Frame<Bytes>>>> {
        self.poll_next(cx).map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl IntoResponse for RangedStream {
    fn into_response(self) -> Response {
        Response::new(axum::body::Body::new(self))
    }
}

/// Body stream encoding a `multipart/byteranges` response.
/// Implements [`Stream`], [`Body`], and [`IntoResponse`].
pub struct MultipartStream {
    length: u64,
    inner: BoxByteStream,
}

impl MultipartStream {
    pub(crate) fn new<B: StorageBackend + 'static>(
        backend: B,
        ranges: Vec<ByteRange>,
        total_size: u64,
        boundary: String,
        media_type: String,
    ) -> Self {
        let length = multipart_content_length(&ranges, &boundary, &media_type, total_size);
        MultipartStream {
            length,
            inner: Box::pin(stream_multipart(backend, ranges, total_size, boundary, media_type)),
        }
    }

    /// Exact body length in bytes, including all boundary and per-part
    /// header overhead.
    pub fn length(&self) -> u64 {
        self.length
    }
}

fn stream_multipart<B: StorageBackend + 'static>(
    backend: B,
    ranges: Vec<ByteRange>,
    total_size: u64,
    boundary: String,
    media_type: String,
) -> impl Stream<Item = io::Result<Bytes>> + Send {
    // see stream_slice: eager guard so an unpolled drop still closes
    let mut guard = StorageGuard::new(backend);
    try_stream! {
        for (index, range) in ranges.iter().enumerate() {
            yield Bytes::from(part_delimiter(&boundary, index == 0));
            yield Bytes::from(part_headers(&media_type, range, total_size));

            let mut offset = range.start;
            let end = range.end + 1;
            while offset < end {
                let want = (end - offset).min(IO_CHUNK_SIZE);
                let chunk = guard.read_exact_at(offset, want).await;
                if let Err(err) = &chunk {
                    warn!(error = %err, "terminating multipart stream, transfer truncated");
                    guard.finish().await;
                }
                let chunk = chunk?;
                offset += chunk.len() as u64;
                yield chunk;
            }
        }
        yield Bytes::from(closing_delimiter(&boundary));
        guard.finish().await;
    }
}

impl Stream for MultipartStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

impl Body for MultipartStream {
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.length)
    }

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<io::Result<Frame<Bytes>>>> {
        self.poll_next(cx).map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl IntoResponse for MultipartStream {
    fn into_response(self) -> Response {
        Response::new(axum::body::Body::new(self))
    }
}

fn part_delimiter(boundary: &str, first: bool) -> String {
    if first {
        format!("--{boundary}\r\n")
    } else {
        format!("\r\n--{boundary}\r\n")
    }
}

fn part_headers(media_type: &str, range: &ByteRange, total_size: u64) -> String {
    format!(
        "Content-Type: {media_type}\r\nContent-Range: bytes {}-{}/{total_size}\r\n\r\n",
        range.start, range.end,
    )
}

fn closing_delimiter(boundary: &str) -> String {
    format!("\r\n--{boundary}--\r\n")
}

/// Exact byte count of a `multipart/byteranges` body, computed before
/// streaming begins so `Content-Length` can be emitted up front.
pub(crate) fn multipart_content_length(
    ranges: &[ByteRange],
    boundary: &str,
    media_type: &str,
    total_size: u64,
) -> u64 {
    let mut length = 0u64;
    for (index, range) in ranges.iter().enumerate() {
        length += part_delimiter(boundary, index == 0).len() as u64;
        length += part_headers(media_type, range, total_size).len() as u64;
        length += range.len();
    }
    length + closing_delimiter(boundary).len() as u64
}

/// Generate a boundary token for one response.
///
/// Nanosecond timestamp plus a process-wide counter keeps concurrent
/// responses distinct; the leading marker makes an accidental collision
/// with payload bytes unlikely.
pub(crate) fn generate_boundary() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since_epoch| since_epoch.as_nanos())
        .unwrap_or_default();
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("range-boundary-{nanos:024x}{count:04x}")
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use bytes::Bytes;
    use futures::{pin_mut, StreamExt};

    use crate::resolve::ByteRange;
    use crate::testutil::MemoryBackend;

    use super::{
        generate_boundary, multipart_content_length, MultipartStream, RangedStream,
    };

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn collect(stream: impl futures::Stream<Item = io::Result<Bytes>>) -> Vec<u8> {
        let mut out = Vec::new();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await.transpose().unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn streams_exact_slice_across_chunks() {
        let data = pattern(200_000);
        let backend = MemoryBackend::new(data.clone());
        let stream = RangedStream::new(backend, 1_000, 150_000);
        assert_eq!(150_000, stream.length());

        let body = collect(stream).await;
        assert_eq!(&data[1_000..151_000], &body[..]);
    }

    #[tokio::test]
    async fn closes_backend_once_on_completion() {
        let backend = MemoryBackend::new(pattern(100));
        let closes = backend.close_count();
        let body = collect(RangedStream::new(backend, 0, 100)).await;
        assert_eq!(100, body.len());
        assert_eq!(1, closes.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn closes_backend_once_when_dropped_mid_stream() {
        let backend = MemoryBackend::new(pattern(200_000));
        let closes = backend.close_count();

        {
            let mut stream = RangedStream::new(backend, 0, 200_000);
            let first = stream.next().await.unwrap().unwrap();
            assert!(!first.is_empty());
        }

        // the close is spawned from the drop hook
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(1, closes.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn closes_backend_when_dropped_before_first_poll() {
        // client disconnects right after the headers: the body is
        // discarded without a single poll
        let backend = MemoryBackend::new(pattern(100));
        let closes = backend.close_count();

        drop(RangedStream::new(backend, 0, 100));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(1, closes.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn multipart_closes_backend_when_dropped_before_first_poll() {
        let backend = MemoryBackend::new(pattern(100));
        let closes = backend.close_count();

        drop(MultipartStream::new(
            backend,
            vec![ByteRange { start: 0, end: 9 }],
            100,
            generate_boundary(),
            "text/plain".to_string(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(1, closes.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn short_read_aborts_the_stream() {
        // stat said 100 bytes but only 50 are left: the resource mutated
        let backend = MemoryBackend::new(pattern(50)).with_reported_size(100);
        let closes = backend.close_count();

        let stream = RangedStream::new(backend, 0, 100);
        pin_mut!(stream);
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(io::ErrorKind::UnexpectedEof, err.kind());
        assert!(stream.next().await.is_none());
        assert_eq!(1, closes.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn mid_stream_failure_closes_backend_once() {
        let backend = MemoryBackend::new(pattern(200_000)).failing_at(100_000);
        let closes = backend.close_count();

        let stream = RangedStream::new(backend, 0, 200_000);
        pin_mut!(stream);
        let mut saw_error = false;
        while let Some(item) = stream.next().await {
            if item.is_err() {
                saw_error = true;
                break;
            }
        }
        assert!(saw_error);
        assert_eq!(1, closes.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn multipart_framing_is_exact() {
        let data: Vec<u8> = (b'0'..=b'9').cycle().take(100).collect();
        let backend = MemoryBackend::new(data.clone());
        let ranges = vec![ByteRange { start: 0, end: 9 }, ByteRange { start: 20, end: 29 }];

        let stream = MultipartStream::new(
            backend,
            ranges.clone(),
            100,
            "testboundary".to_string(),
            "text/plain".to_string(),
        );
        let advertised = stream.length();
        let body = collect(stream).await;

        let expected = "--testboundary\r\n\
             Content-Type: text/plain\r\nContent-Range: bytes 0-9/100\r\n\r\n\
             0123456789\
             \r\n--testboundary\r\n\
             Content-Type: text/plain\r\nContent-Range: bytes 20-29/100\r\n\r\n\
             0123456789\
             \r\n--testboundary--\r\n";
        assert_eq!(expected.as_bytes(), &body[..]);
        assert_eq!(advertised, body.len() as u64);
        assert_eq!(
            advertised,
            multipart_content_length(&ranges, "testboundary", "text/plain", 100),
        );
    }

    #[tokio::test]
    async fn multipart_closes_backend_once() {
        let backend = MemoryBackend::new(pattern(100));
        let closes = backend.close_count();
        let stream = MultipartStream::new(
            backend,
            vec![ByteRange { start: 0, end: 0 }, ByteRange { start: 99, end: 99 }],
            100,
            generate_boundary(),
            "application/octet-stream".to_string(),
        );
        let _ = collect(stream).await;
        assert_eq!(1, closes.load(Ordering::SeqCst));
    }

    #[test]
    fn boundaries_are_unique_per_response() {
        let a = generate_boundary();
        let b = generate_boundary();
        assert_ne!(a, b);
        assert_matches!(a.strip_prefix("range-boundary-"), Some(_));
    }
}
