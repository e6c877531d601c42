//! Parsing of the `Range` request header.
//!
//! The parser is deliberately lenient: a header that does not match the
//! `bytes=a-b[,c-d,...]` grammar is treated the same as no header at all,
//! so the caller falls back to a full 200 response. Only a well-formed
//! header whose every interval lies past the end of the resource is
//! reported as unsatisfiable.

use tracing::debug;

/// Outcome of parsing a raw `Range` header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedRangeRequest {
    /// No header was present, or it was malformed and is ignored.
    NoHeader,
    /// A range was requested but no interval can ever be satisfied.
    Unsatisfiable,
    /// Raw intervals in client order, before clamping by the resolver.
    Ranges(Vec<RawRange>),
}

/// A single pre-clamp interval. `end` is inclusive; `None` means
/// open-ended, running to the last byte of the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRange {
    pub start: u64,
    pub end: Option<u64>,
}

/// Parse a `Range` header value against a resource of `size` bytes.
///
/// The resource size is consulted only for suffix-form (`-n`) arithmetic
/// and for whole-set satisfiability; clamping individual intervals is the
/// resolver's job.
pub fn parse(header: Option<&str>, size: u64) -> ParsedRangeRequest {
    let Some(header) = header else {
        return ParsedRangeRequest::NoHeader;
    };

    let Some(specs) = header.trim().strip_prefix("bytes=") else {
        debug!(header, "ignoring Range header with unsupported unit");
        return ParsedRangeRequest::NoHeader;
    };

    let mut ranges = Vec::new();

    for spec in specs.split(',') {
        let spec = spec.trim();
        let Some((start, end)) = spec.split_once('-') else {
            debug!(header, "ignoring malformed Range header");
            return ParsedRangeRequest::NoHeader;
        };

        if start.is_empty() {
            // suffix form: last n bytes
            let Ok(suffix) = end.parse::<u64>() else {
                debug!(header, "ignoring malformed Range header");
                return ParsedRangeRequest::NoHeader;
            };
            if suffix == 0 {
                // `-0` requests zero bytes and never satisfies
                continue;
            }
            ranges.push(RawRange { start: size.saturating_sub(suffix), end: None });
            continue;
        }

        let Ok(start) = start.parse::<u64>() else {
            debug!(header, "ignoring malformed Range header");
            return ParsedRangeRequest::NoHeader;
        };

        let end = if end.is_empty() {
            None
        } else {
            match end.parse::<u64>() {
                Ok(end) => Some(end),
                Err(_) => {
                    debug!(header, "ignoring malformed Range header");
                    return ParsedRangeRequest::NoHeader;
                }
            }
        };

        ranges.push(RawRange { start, end });
    }

    if size == 0 || ranges.is_empty() || ranges.iter().all(|range| range.start >= size) {
        return ParsedRangeRequest::Unsatisfiable;
    }

    ParsedRangeRequest::Ranges(ranges)
}
