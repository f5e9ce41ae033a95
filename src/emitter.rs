//! Response emitter: header composition, content negotiation, range
//! slicing, chunked vs. buffered writes, and the cache write-through step.

use crate::cache::{self, EtagCache, EtagEntry};
use crate::pipeline::RequestContext;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};
use futures_util::TryStreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use std::path::PathBuf;
use tokio_util::io::ReaderStream;

pub type EmitBody = BoxBody<Bytes, std::io::Error>;

pub fn full_body(bytes: Vec<u8>) -> EmitBody {
    Full::new(Bytes::from(bytes))
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> EmitBody {
    full_body(Vec::new())
}

pub fn file_body(file: tokio::fs::File) -> EmitBody {
    let stream = ReaderStream::new(file).map_ok(Frame::data);
    StreamBody::new(stream).boxed()
}

/// What the caller wants written: an in-memory buffer or a file on disk
/// (streamed, never fully buffered).
pub enum Representation {
    Buffer(Vec<u8>),
    File(PathBuf),
}

/// Inputs to the emitter: the representation plus the status/headers the
/// handler chose.
pub struct EmitRequest {
    pub representation: Representation,
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Header composition per response-status class. Redirects (`300..400`,
/// excluding `304`) use the caller's headers verbatim so `Location` and
/// friends are untouched; everything else merges configured defaults under
/// the caller's headers, then applies the fixed set of decoration rules.
pub fn decorate_headers(
    ctx: &RequestContext,
    default_headers: &HeaderMap,
    status: StatusCode,
    mut headers: HeaderMap,
) -> HeaderMap {
    let is_redirect = (300..400).contains(&status.as_u16()) && status != StatusCode::NOT_MODIFIED;
    if is_redirect {
        return headers;
    }

    let mut composed = default_headers.clone();
    for (name, value) in headers.drain() {
        if let Some(name) = name {
            composed.insert(name, value);
        }
    }
    headers = composed;

    let allow = crate::routing::expand_allow(&ctx.allow);
    if let Ok(value) = HeaderValue::from_str(&allow) {
        headers.insert("allow", value);
    }
    if !headers.contains_key(http::header::DATE) {
        if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(std::time::SystemTime::now())) {
            headers.insert(http::header::DATE, value);
        }
    }
    if !headers.contains_key(http::header::TRANSFER_ENCODING) {
        headers.insert(http::header::TRANSFER_ENCODING, HeaderValue::from_static("identity"));
    }

    if ctx.cors {
        let origin = ctx
            .request_headers
            .get(http::header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| {
                ctx.request_headers
                    .get(http::header::REFERER)
                    .and_then(|v| v.to_str().ok())
                    .map(|r| r.trim_end_matches('/').to_string())
            });
        if let Some(origin) = origin {
            if let Ok(value) = HeaderValue::from_str(&origin) {
                headers.insert("access-control-allow-origin", value);
            }
        }
        headers.insert("access-control-allow-credentials", HeaderValue::from_static("true"));
        if let Ok(value) = HeaderValue::from_str(&allow) {
            headers.insert("access-control-allow-methods", value);
        }
    } else {
        let cors_keys: Vec<_> = headers
            .keys()
            .filter(|k| k.as_str().starts_with("access-control-"))
            .cloned()
            .collect();
        for key in cors_keys {
            headers.remove(key);
        }
    }

    let rate_limited = headers.contains_key("x-ratelimit-limit");
    if !ctx.is_get_like() || status.as_u16() >= 400 || rate_limited {
        headers.remove(http::header::CACHE_CONTROL);
        headers.remove(http::header::ETAG);
        headers.remove(http::header::LAST_MODIFIED);
        if rate_limited {
            headers.insert(http::header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        }
    }

    if status == StatusCode::NOT_MODIFIED {
        for field in cache::not_modified_strip_fields() {
            headers.remove(field);
        }
    }

    let allow_known = headers.get("allow").is_some();
    if (status == StatusCode::NOT_FOUND && allow_known) || status.as_u16() >= 500 {
        headers.remove("accept-ranges");
    }

    let mut status_buf = itoa::Buffer::new();
    if let Ok(value) = HeaderValue::from_str(&format!(
        "{} {}",
        status_buf.format(status.as_u16()),
        status.canonical_reason().unwrap_or("")
    )) {
        headers.insert("status", value);
    }
    let elapsed = ctx.elapsed_millis();
    if let Ok(value) = HeaderValue::from_str(&format!("{:.2} ms", elapsed)) {
        headers.insert("x-response-time", value);
    }

    headers
}

/// JSON/CSV body shaping and HEAD/OPTIONS emptying.
pub fn shape_body(
    ctx: &RequestContext,
    accept: Option<&str>,
    default_json_indent: usize,
    mut body: Vec<u8>,
    headers: &mut HeaderMap,
) -> Vec<u8> {
    // A 304 carries no representation metadata at all (§4.2, §8): skip JSON/CSV
    // shaping and the content-length fallback below, both of which would
    // otherwise re-add headers `decorate_headers` already stripped for this
    // status.
    if ctx.status == StatusCode::NOT_MODIFIED {
        return Vec::new();
    }
    if ctx.method == http::Method::HEAD {
        return Vec::new();
    }
    if ctx.method == http::Method::OPTIONS {
        headers.remove(http::header::CONTENT_LENGTH);
        headers.remove(http::header::CONTENT_TYPE);
        return Vec::new();
    }

    let looks_like_json = body.first() == Some(&b'[') || body.first() == Some(&b'{');
    if looks_like_json {
        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }

    if ctx.method == http::Method::GET
        && ctx.status == StatusCode::OK
        && looks_like_json
        && accept.map(|a| a.contains("text/csv")).unwrap_or(false)
    {
        if let Ok(csv_body) = crate::csvproject::project_json_to_csv(&body) {
            body = csv_body;
            headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/csv"));
            let filename = crate::csvproject::filename_for(&ctx.url.path, &ctx.url.query);
            if let Ok(value) = HeaderValue::from_str(&format!(
                "attachment; filename=\"{filename}\""
            )) {
                headers.insert(http::header::CONTENT_DISPOSITION, value);
            }
        }
    } else if looks_like_json {
        let indent = accept
            .and_then(|a| a.split("indent=").nth(1))
            .and_then(|s| s.split(|c: char| !c.is_ascii_digit()).next())
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(default_json_indent);
        if indent > 0 {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&body) {
                let indent_str = " ".repeat(indent);
                let formatter = serde_json::ser::PrettyFormatter::with_indent(indent_str.as_bytes());
                let mut buf = Vec::new();
                let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
                if serde::Serialize::serialize(&value, &mut ser).is_ok() {
                    body = buf;
                }
            }
        }
    }

    if !headers.contains_key(http::header::CONTENT_LENGTH) {
        let mut buf = itoa::Buffer::new();
        if let Ok(value) = HeaderValue::from_str(buf.format(body.len())) {
            headers.insert(http::header::CONTENT_LENGTH, value);
        }
    }

    body
}

/// Parse `Range: bytes=start-end`, returning the inclusive byte range or an
/// error signaling `416` (the caller deletes the `Range` header either way).
pub fn parse_range(range_header: &str, content_length: u64) -> Result<(u64, u64), ()> {
    let spec = range_header.strip_prefix("bytes=").ok_or(())?;
    let (start_s, end_s) = spec.split_once('-').ok_or(())?;
    let start: u64 = start_s.parse().map_err(|_| ())?;
    let end: u64 = if end_s.is_empty() {
        content_length.saturating_sub(1)
    } else {
        end_s.parse().map_err(|_| ())?
    };
    if start >= end || start >= content_length {
        return Err(());
    }
    Ok((start, end.min(content_length.saturating_sub(1))))
}

/// Apply the parsed range to headers, switching the response to `206`.
pub fn apply_range(headers: &mut HeaderMap, start: u64, end: u64, total: u64) {
    if let Ok(value) = HeaderValue::from_str(&format!("bytes {start}-{end}/{total}")) {
        headers.insert("content-range", value);
    }
    if let Ok(value) = HeaderValue::from_str(&(end - start + 1).to_string()) {
        headers.insert(http::header::CONTENT_LENGTH, value);
    }
}

/// Is this content-type compressible, and would `Accept-Encoding` /
/// `User-Agent` allow us to send a compressed representation?
pub fn select_encoding(
    status: StatusCode,
    body_len: usize,
    compress_enabled: bool,
    content_type: Option<&str>,
    user_agent: Option<&str>,
    accept_encoding: Option<&str>,
) -> Option<&'static str> {
    if !(status == StatusCode::OK || status == StatusCode::PARTIAL_CONTENT) || body_len == 0 || !compress_enabled {
        return None;
    }
    let compressible = content_type
        .map(|ct| ct.contains("javascript") || ct.contains("json") || ct.contains("text") || ct.contains("xml"))
        .unwrap_or(false);
    if !compressible {
        return None;
    }
    if user_agent.map(|ua| ua.contains("MSIE")).unwrap_or(false) {
        return None;
    }
    let accept_encoding = accept_encoding?;
    if accept_encoding.contains("gzip") {
        Some("gzip")
    } else if accept_encoding.contains("deflate") {
        Some("deflate")
    } else {
        None
    }
}

fn encoding_to_side_file_ext(encoding: &str) -> &'static str {
    match encoding {
        "gzip" => "gz",
        _ => "zz",
    }
}

/// Compress an in-memory buffer with the chosen algorithm.
async fn compress_buffer(encoding: &str, data: &[u8]) -> std::io::Result<Vec<u8>> {
    use async_compression::tokio::write::{GzipEncoder, ZlibEncoder};
    use tokio::io::AsyncWriteExt;

    let mut out = Vec::new();
    match encoding {
        "gzip" => {
            let mut enc = GzipEncoder::new(&mut out);
            enc.write_all(data).await?;
            enc.shutdown().await?;
        }
        _ => {
            let mut enc = ZlibEncoder::new(&mut out);
            enc.write_all(data).await?;
            enc.shutdown().await?;
        }
    }
    Ok(out)
}

/// Persist a compressed representation to its side file if one doesn't
/// already exist. Readers are expected to fall back to re-compressing if the
/// file disappears out from under them (it's a cache, not durable storage).
async fn persist_side_file(path: &PathBuf, data: &[u8]) {
    if tokio::fs::metadata(path).await.is_ok() {
        return;
    }
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    let _ = tokio::fs::write(path, data).await;
}

/// Build the final response for a buffered representation, applying
/// compression (with side-file persistence) when negotiated.
pub async fn emit_buffer(
    etag_cache: &EtagCache,
    etag: Option<&str>,
    mut headers: HeaderMap,
    status: StatusCode,
    body: Vec<u8>,
    encoding: Option<&'static str>,
) -> http::Response<EmitBody> {
    let final_body = if let Some(encoding) = encoding {
        match compress_buffer(encoding, &body).await {
            Ok(compressed) => {
                headers.insert(
                    http::header::CONTENT_ENCODING,
                    HeaderValue::from_static(encoding),
                );
                if let Ok(value) = HeaderValue::from_str(&compressed.len().to_string()) {
                    headers.insert(http::header::CONTENT_LENGTH, value);
                }
                if let Some(etag) = etag {
                    let path = etag_cache.side_file_path(etag, encoding_to_side_file_ext(encoding));
                    persist_side_file(&path, &compressed).await;
                }
                compressed
            }
            Err(_) => body,
        }
    } else {
        body
    };

    let mut builder = http::Response::builder().status(status);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    builder.body(full_body(final_body)).unwrap_or_else(|_| {
        http::Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(empty_body())
            .expect("fallback response is always valid")
    })
}

/// Build the final response for a file representation: reuse an existing
/// compressed side file verbatim if present, otherwise stream the file
/// through the compressor while tee-ing the compressed bytes to a new side
/// file — the file is opened once, never re-read for the disk copy.
pub async fn emit_file(
    etag_cache: &EtagCache,
    etag: Option<&str>,
    mut headers: HeaderMap,
    status: StatusCode,
    path: &PathBuf,
    encoding: Option<&'static str>,
) -> std::io::Result<http::Response<EmitBody>> {
    if let (Some(encoding), Some(etag)) = (encoding, etag) {
        let side_path = etag_cache.side_file_path(etag, encoding_to_side_file_ext(encoding));
        if let Ok(metadata) = tokio::fs::metadata(&side_path).await {
            headers.insert(
                http::header::CONTENT_ENCODING,
                HeaderValue::from_static(encoding),
            );
            if let Ok(value) = HeaderValue::from_str(&metadata.len().to_string()) {
                headers.insert(http::header::CONTENT_LENGTH, value);
            }
            let file = tokio::fs::File::open(&side_path).await?;
            let mut builder = http::Response::builder().status(status);
            for (name, value) in headers.iter() {
                builder = builder.header(name, value);
            }
            return Ok(builder
                .body(file_body(file))
                .expect("response with a valid header set always builds"));
        }

        let data = tokio::fs::read(path).await?;
        let compressed = compress_buffer(encoding, &data).await?;
        persist_side_file(&side_path, &compressed).await;
        headers.insert(
            http::header::CONTENT_ENCODING,
            HeaderValue::from_static(encoding),
        );
        headers.remove(http::header::CONTENT_LENGTH);
        headers.insert(http::header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        let mut builder = http::Response::builder().status(status);
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        return Ok(builder
            .body(full_body(compressed))
            .expect("response with a valid header set always builds"));
    }

    headers.remove(http::header::CONTENT_LENGTH);
    headers.insert(http::header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    let file = tokio::fs::File::open(path).await?;
    let mut builder = http::Response::builder().status(status);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    Ok(builder
        .body(file_body(file))
        .expect("response with a valid header set always builds"))
}

/// Serve a `206` slice of a file: seek to `start`, stream exactly
/// `end - start + 1` bytes. Ranged responses skip compression (see the
/// caller), so there's no side-file interaction here.
pub async fn emit_file_range(
    mut headers: HeaderMap,
    status: StatusCode,
    path: &PathBuf,
    start: u64,
    end: u64,
) -> std::io::Result<http::Response<EmitBody>> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let limited = file.take(end - start + 1);
    let stream = ReaderStream::new(limited).map_ok(Frame::data);
    headers.remove(http::header::TRANSFER_ENCODING);

    let mut builder = http::Response::builder().status(status);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    Ok(builder
        .body(StreamBody::new(stream).boxed())
        .expect("response with a valid header set always builds"))
}

/// Cache write-through: on a cacheable GET, ensure an ETag is present and
/// register the sanitized entry (and, if a local file path was decorated
/// onto the request, a filesystem watcher).
///
/// The registered etag must equal the one returned to the client (§8's
/// invariant), so this reuses whatever `ETag` header a terminal handler
/// already set (the file handler's `hash(url|size|mtime)`, or the proxy's
/// own computed value) rather than recomputing a different hash. Only when
/// no handler has set one does this compute `mmh3(url|length|lastmod|body)`
/// itself, per §4.2's "ensure etag is present".
pub fn write_through(
    ctx: &RequestContext,
    etag_cache: &EtagCache,
    watchers: &crate::watch::WatcherRegistry,
    headers: &HeaderMap,
    body: &[u8],
    content_length: u64,
    seed: u32,
) -> Option<String> {
    if ctx.method != http::Method::GET {
        return None;
    }
    if ctx.status != StatusCode::OK && ctx.status != StatusCode::NOT_MODIFIED {
        return None;
    }
    let cache_control = headers
        .get(http::header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok());
    if cache::forbids_caching(cache_control) {
        return None;
    }

    let url = ctx.url.canonical();
    if let Some(existing) = etag_cache.get(&url) {
        return Some(existing.etag);
    }

    let last_modified = headers
        .get(http::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let existing_etag = headers
        .get(http::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_matches('"').to_string());
    let body_digest = String::from_utf8_lossy(body).into_owned();
    let etag = existing_etag.unwrap_or_else(|| {
        crate::hash::etag_of(&[&url, &content_length.to_string(), last_modified, &body_digest], seed)
    });
    let mimetype = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    etag_cache.register(
        &url,
        EtagEntry {
            etag: etag.clone(),
            headers: cache::sanitize_headers(headers),
            mimetype,
            timestamp: cache::now_epoch(),
        },
    );
    if let Some(path) = &ctx.local_path {
        let _ = watchers.watch(&url, path);
    }
    Some(etag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_with_start_gte_end_is_rejected() {
        assert!(parse_range("bytes=10-5", 100).is_err());
    }

    #[test]
    fn range_with_omitted_end_fills_from_content_length() {
        let (start, end) = parse_range("bytes=0-", 100).unwrap();
        assert_eq!((start, end), (0, 99));
    }

    #[test]
    fn range_is_clamped_to_content_length() {
        let (start, end) = parse_range("bytes=0-999", 100).unwrap();
        assert_eq!((start, end), (0, 99));
    }

    #[test]
    fn encoding_selection_prefers_gzip_over_deflate() {
        let encoding = select_encoding(
            StatusCode::OK,
            10,
            true,
            Some("text/html"),
            None,
            Some("gzip, deflate"),
        );
        assert_eq!(encoding, Some("gzip"));
    }

    #[test]
    fn encoding_selection_skips_msie() {
        let encoding = select_encoding(
            StatusCode::OK,
            10,
            true,
            Some("text/html"),
            Some("Mozilla/4.0 (compatible; MSIE 8.0)"),
            Some("gzip"),
        );
        assert_eq!(encoding, None);
    }

    #[test]
    fn encoding_selection_skips_noncompressible_types() {
        let encoding = select_encoding(StatusCode::OK, 10, true, Some("image/png"), None, Some("gzip"));
        assert_eq!(encoding, None);
    }
}
