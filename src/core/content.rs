//! Serves an in-memory payload with conditional request and byte-range support.
use std::{
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use axum::body::Body as AxumBody;
use hyper::{
    HeaderMap, Method, Response, StatusCode,
    header::{self, HeaderValue},
};

use crate::core::static_cache::{CacheEntry, Encoding};

/// A satisfiable byte range, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RangeRequest {
    /// No usable `Range` header: send the whole payload
    Full,
    Single(ByteRange),
    Unsatisfiable,
}

/// Parse a `Range` header for a payload of `len` bytes. Multiple ranges are served whole.
pub fn parse_range(value: &str, len: u64) -> RangeRequest {
    let Some(spec) = value.trim().strip_prefix("bytes=") else {
        return RangeRequest::Full;
    };
    if spec.contains(',') {
        return RangeRequest::Full;
    }
    let Some((start, end)) = spec.trim().split_once('-') else {
        return RangeRequest::Full;
    };
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        // suffix range: the last `n` bytes
        let Ok(suffix) = end.parse::<u64>() else {
            return RangeRequest::Full;
        };
        if suffix == 0 || len == 0 {
            return RangeRequest::Unsatisfiable;
        }
        let suffix = suffix.min(len);
        return RangeRequest::Single(ByteRange {
            start: len - suffix,
            end: len - 1,
        });
    }

    let Ok(start) = start.parse::<u64>() else {
        return RangeRequest::Full;
    };
    if start >= len {
        return RangeRequest::Unsatisfiable;
    }
    let end = if end.is_empty() {
        len - 1
    } else {
        match end.parse::<u64>() {
            Ok(end) if end >= start => end.min(len - 1),
            _ => return RangeRequest::Full,
        }
    };
    RangeRequest::Single(ByteRange { start, end })
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Weak validator derived from the source size and modification time
pub fn etag(entry: &CacheEntry) -> String {
    let suffix = match entry.encoding {
        Encoding::Identity => "",
        Encoding::Gzip => "-gz",
    };
    format!(
        "W/\"{:x}-{:x}{suffix}\"",
        entry.original_size,
        unix_secs(entry.modified)
    )
}

fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let opaque = |tag: &str| tag.trim().trim_start_matches("W/").to_string();
    let ours = opaque(etag);
    if_none_match
        .split(',')
        .any(|candidate| candidate.trim() == "*" || opaque(candidate) == ours)
}

fn not_modified(headers: &HeaderMap, etag: &str, modified: SystemTime) -> bool {
    if let Some(inm) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        return etag_matches(inm, etag);
    }
    headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
        .is_some_and(|since| unix_secs(modified) <= unix_secs(since))
}

fn if_range_allows(headers: &HeaderMap, etag: &str, last_modified: &str) -> bool {
    match headers.get(header::IF_RANGE).and_then(|v| v.to_str().ok()) {
        None => true,
        Some(value) => value.trim() == last_modified || value.trim() == etag,
    }
}

/// `Content-Type` for a file name, with a UTF-8 charset on text types
pub fn content_type_for(name: &Path) -> String {
    let mime = mime_guess::from_path(name).first_or_octet_stream();
    let essence = mime.essence_str();
    if mime.type_() == mime_guess::mime::TEXT || essence == "application/javascript" {
        format!("{essence}; charset=utf-8")
    } else {
        essence.to_string()
    }
}

fn insert(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Build the response for `entry` as requested by `method` and `request_headers`
pub fn serve_content(
    method: &Method,
    request_headers: &HeaderMap,
    name: &Path,
    entry: &CacheEntry,
) -> Response<AxumBody> {
    let etag = etag(entry);
    // HTTP dates carry whole seconds
    let modified = UNIX_EPOCH + Duration::from_secs(unix_secs(entry.modified));
    let last_modified = httpdate::fmt_http_date(modified);

    let mut response = Response::new(AxumBody::empty());
    let headers = response.headers_mut();
    insert(headers, header::ETAG, &etag);
    insert(headers, header::LAST_MODIFIED, &last_modified);
    insert(headers, header::ACCEPT_RANGES, "bytes");
    if entry.encoding == Encoding::Gzip {
        insert(headers, header::CONTENT_ENCODING, "gzip");
    }
    insert(headers, header::VARY, "Accept-Encoding");

    if not_modified(request_headers, &etag, modified) {
        *response.status_mut() = StatusCode::NOT_MODIFIED;
        return response;
    }

    insert(headers, header::CONTENT_TYPE, &content_type_for(name));

    let len = entry.data.len() as u64;
    let range = match request_headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(value) if if_range_allows(request_headers, &etag, &last_modified) => {
            parse_range(value, len)
        }
        _ => RangeRequest::Full,
    };

    let (status, body) = match range {
        RangeRequest::Full => (StatusCode::OK, entry.data.clone()),
        RangeRequest::Single(ByteRange { start, end }) => {
            insert(
                headers,
                header::CONTENT_RANGE,
                &format!("bytes {start}-{end}/{len}"),
            );
            (
                StatusCode::PARTIAL_CONTENT,
                entry.data.slice(start as usize..=end as usize),
            )
        }
        RangeRequest::Unsatisfiable => {
            insert(headers, header::CONTENT_RANGE, &format!("bytes */{len}"));
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            return response;
        }
    };

    insert(headers, header::CONTENT_LENGTH, &body.len().to_string());
    *response.status_mut() = status;
    if method != Method::HEAD {
        *response.body_mut() = AxumBody::from(body);
    }
    response
}
