//! Built-in middleware: the conditional-request gate that short-circuits a
//! matching `If-None-Match` to `304` before the terminal handler runs.

use crate::cache::EtagCache;
use crate::error::GatewayError;
use crate::metrics::Metrics;
use crate::middleware::{BoxFuture, RegisteredMiddleware};
use crate::pipeline::RequestContext;
use crate::routing::Blacklist;
use http::StatusCode;
use std::sync::Arc;

const ETAG_GATE_SITE: &str = "middleware_builtin::etag_gate";

/// Blacklist the gate's handler hash so permission computation doesn't
/// treat its mere presence as granting GET; the handler itself is
/// registered separately via [`etag_gate_handler`] once the ETag cache
/// exists.
pub fn register_etag_gate(blacklist: &mut Blacklist) {
    blacklist.add(ETAG_GATE_SITE);
}

/// Build the registered handler once the ETag cache is available (state
/// composition happens in `server::state::GatewayState::new`, which
/// constructs the cache after the route table).
pub fn etag_gate_handler(cache: Arc<EtagCache>, metrics: Arc<Metrics>) -> RegisteredMiddleware {
    RegisteredMiddleware::handler(ETAG_GATE_SITE, move |ctx: &mut RequestContext| {
        let cache = Arc::clone(&cache);
        let metrics = Arc::clone(&metrics);
        Box::pin(async move { run(&cache, &metrics, ctx).await }) as BoxFuture<'_, Result<(), GatewayError>>
    })
}

async fn run(cache: &EtagCache, metrics: &Metrics, ctx: &mut RequestContext) -> Result<(), GatewayError> {
    if ctx.method != http::Method::GET {
        return Ok(());
    }
    if ctx.request_headers.contains_key(http::header::RANGE) {
        return Ok(());
    }
    let Some(if_none_match) = ctx
        .request_headers
        .get(http::header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_matches('"').to_string())
    else {
        return Ok(());
    };

    let url = ctx.url.canonical();
    match cache.get(&url) {
        Some(entry) if entry.etag == if_none_match => {
            for (name, value) in entry.headers.iter() {
                ctx.response_headers.insert(name.clone(), value.clone());
            }
            let age = crate::cache::age_seconds(entry.timestamp);
            if let Ok(value) = http::HeaderValue::from_str(&age.to_string()) {
                ctx.response_headers.insert("age", value);
            }
            ctx.status = StatusCode::NOT_MODIFIED;
            metrics.record_etag_hit();
        }
        _ => metrics.record_etag_miss(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EtagEntry;

    #[tokio::test]
    async fn matching_if_none_match_short_circuits_to_304() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EtagCache::new(8, dir.path().to_path_buf());
        let mut ctx = RequestContext::for_test();
        let url = ctx.url.canonical();
        cache.register(
            &url,
            EtagEntry {
                etag: "abc123".to_string(),
                headers: http::HeaderMap::new(),
                mimetype: "text/plain".to_string(),
                timestamp: crate::cache::now_epoch(),
            },
        );
        ctx.request_headers.insert(
            http::header::IF_NONE_MATCH,
            http::HeaderValue::from_static("\"abc123\""),
        );
        run(&cache, &Metrics::for_test(), &mut ctx).await.unwrap();
        assert_eq!(ctx.status, StatusCode::NOT_MODIFIED);
        assert!(ctx.response_headers.contains_key("age"));
    }

    #[tokio::test]
    async fn mismatched_etag_continues_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EtagCache::new(8, dir.path().to_path_buf());
        let mut ctx = RequestContext::for_test();
        let url = ctx.url.canonical();
        cache.register(
            &url,
            EtagEntry {
                etag: "abc123".to_string(),
                headers: http::HeaderMap::new(),
                mimetype: "text/plain".to_string(),
                timestamp: crate::cache::now_epoch(),
            },
        );
        ctx.request_headers.insert(
            http::header::IF_NONE_MATCH,
            http::HeaderValue::from_static("\"different\""),
        );
        run(&cache, &Metrics::for_test(), &mut ctx).await.unwrap();
        assert_eq!(ctx.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn range_present_skips_the_gate() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EtagCache::new(8, dir.path().to_path_buf());
        let mut ctx = RequestContext::for_test();
        ctx.request_headers.insert(http::header::RANGE, http::HeaderValue::from_static("bytes=0-1"));
        ctx.request_headers.insert(
            http::header::IF_NONE_MATCH,
            http::HeaderValue::from_static("\"abc123\""),
        );
        run(&cache, &Metrics::for_test(), &mut ctx).await.unwrap();
        assert_eq!(ctx.status, StatusCode::OK);
    }
}
