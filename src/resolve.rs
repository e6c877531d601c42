//! Resolution of parsed range intervals against a resource snapshot.
//!
//! The resolver is the sole authority on resource size semantics: it
//! clamps interval ends, drops intervals that cannot be satisfied, and
//! decides whether the response is full-body, single-range, or
//! `multipart/byteranges`.

use thiserror::Error;

use crate::backend::ResourceDescriptor;
use crate::header::ParsedRangeRequest;

/// A validated byte interval. Both bounds are inclusive and
/// `start <= end < resource size` holds for every range produced by
/// [`resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered by the range.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false: resolved ranges cover at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Response mode decided for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedPlan {
    /// Stream the whole resource with a 200.
    Full,
    /// Stream one range with a 206 and a `Content-Range` header.
    Single(ByteRange),
    /// Stream several ranges, in client order, as `multipart/byteranges`.
    /// Overlapping ranges are served independently, never merged.
    Multi(Vec<ByteRange>),
}

/// No requested interval can be satisfied; the response is a 416 with
/// `Content-Range: bytes */<size>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("requested range not satisfiable for resource of {size} bytes")]
pub struct NotSatisfiable {
    pub size: u64,
}

/// Clamp and validate parsed intervals against the resource snapshot.
pub fn resolve(
    parsed: ParsedRangeRequest,
    descriptor: &ResourceDescriptor,
) -> Result<ResolvedPlan, NotSatisfiable> {
    let size = descriptor.size;

    let raw = match parsed {
        ParsedRangeRequest::NoHeader => return Ok(ResolvedPlan::Full),
        ParsedRangeRequest::Unsatisfiable => return Err(NotSatisfiable { size }),
        ParsedRangeRequest::Ranges(raw) => raw,
    };

    if size == 0 {
        return Err(NotSatisfiable { size });
    }

    let mut ranges = Vec::with_capacity(raw.len());
    for range in raw {
        if range.start >= size {
            continue;
        }
        let end = range.end.map_or(size - 1, |end| end.min(size - 1));
        if range.start > end {
            continue;
        }
        ranges.push(ByteRange { start: range.start, end });
    }

    match ranges.len() {
        0 => Err(NotSatisfiable { size }),
        1 => Ok(ResolvedPlan::Single(ranges[0])),
        _ => Ok(ResolvedPlan::Multi(ranges)),
    }
}
