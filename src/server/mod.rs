pub mod bootstrap;
pub mod state;
pub mod tls;

use crate::emitter::{self, EmitBody};
use crate::error::GatewayError;
use crate::filehandler;
use crate::metrics::status_class;
use crate::middleware;
use crate::pipeline::{decode_basic_auth, ParsedUrl, RequestContext};
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use state::GatewayState;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;

const MAX_BODY_METHODS: &[Method] = &[Method::PUT, Method::POST, Method::PATCH];

/// Run the plaintext HTTP listener until `shutdown` fires, draining
/// in-flight connections before returning. The listener is bound by the
/// caller (`bootstrap::run`) so privileges can be dropped after every
/// privileged port is bound but before any connection is accepted.
pub async fn run_http(
    listener: TcpListener,
    state: Arc<GatewayState>,
    shutdown: Arc<Notify>,
) -> anyhow::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "http listener bound");
    let in_flight = Arc::new(AtomicI64::new(0));

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let state = Arc::clone(&state);
                let in_flight = Arc::clone(&in_flight);
                in_flight.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    serve_connection(TokioIo::new(stream), peer, state, "http").await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                });
            }
        }
    }

    while in_flight.load(Ordering::SeqCst) > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    Ok(())
}

/// Run the HTTPS listener using the configured certificate/key pair.
pub async fn run_https(
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    state: Arc<GatewayState>,
    shutdown: Arc<Notify>,
) -> anyhow::Result<()> {
    let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);
    tracing::info!(addr = %listener.local_addr()?, "https listener bound");
    let in_flight = Arc::new(AtomicI64::new(0));

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let acceptor = acceptor.clone();
                let state = Arc::clone(&state);
                let in_flight = Arc::clone(&in_flight);
                in_flight.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            serve_connection(TokioIo::new(tls_stream), peer, state, "https").await;
                        }
                        Err(err) => tracing::warn!(%err, "tls handshake failed"),
                    }
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                });
            }
        }
    }

    while in_flight.load(Ordering::SeqCst) > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    Ok(())
}

async fn serve_connection<I>(io: TokioIo<I>, peer: SocketAddr, state: Arc<GatewayState>, scheme: &'static str)
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, peer, scheme, state).await }
    });

    if let Err(err) = auto::Builder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
    {
        tracing::debug!(%err, "connection closed with error");
    }
}

async fn handle_request(
    req: Request<Incoming>,
    peer: SocketAddr,
    scheme: &'static str,
    state: Arc<GatewayState>,
) -> Result<Response<EmitBody>, std::convert::Infallible> {
    let (parts, body) = req.into_parts();
    let method = parts.method.clone();

    let max_bytes = state.config.max_bytes;
    let body_bytes = if MAX_BODY_METHODS.contains(&method) {
        match collect_bounded_body(body, max_bytes).await {
            Ok(bytes) => bytes,
            Err(()) => return Ok(error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body exceeds maxBytes")),
        }
    } else {
        Bytes::new()
    };

    if parts.headers.get(http::header::EXPECT).is_some() {
        return Ok(error_response(StatusCode::EXPECTATION_FAILED, "Expect is not supported"));
    }

    let host_header = parts
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .split(':')
        .next()
        .unwrap_or("")
        .to_string();

    let vhost_label = state
        .pipeline
        .vhosts
        .select(&host_header)
        .map(|v| v.label.clone())
        .unwrap_or_else(|| state.pipeline.vhosts.default_label().to_string());

    let client_ip = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').last())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| peer.ip().to_string());

    let auth = decode_basic_auth(&parts.headers);
    let url = ParsedUrl {
        scheme: scheme.to_string(),
        auth,
        host: host_header.clone(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().unwrap_or("").to_string(),
    };

    let mut ctx = RequestContext::new(method.clone(), url, vhost_label.clone(), client_ip);
    ctx.request_headers = parts.headers.clone();
    ctx.cors = parts.headers.contains_key(http::header::ORIGIN);
    ctx.body = body_bytes.to_vec();

    let allow = state.pipeline.allow_for(&vhost_label, &ctx.url.path);
    for method_name in allow.split(", ") {
        ctx.allow.insert(method_name.to_string());
    }

    let chain = state
        .pipeline
        .routes
        .routes(&ctx.url.path, &vhost_label, method.as_str());

    let chain_result = middleware::run_chain(&chain, &mut ctx).await;

    let final_result = match chain_result {
        Ok(()) if ctx.status != StatusCode::NOT_MODIFIED => terminal_route(&state, &mut ctx).await,
        other => other,
    };

    let response = match final_result {
        Ok(()) if ctx.proxy_response.is_some() => ctx.proxy_response.take().expect("checked above"),
        Ok(()) => build_response(&state, &mut ctx).await,
        Err(err) => {
            // Terminal faults still go through the full header-decoration
            // and body-shaping path (Allow, Date, CORS, Transfer-Encoding)
            // rather than a bare status line.
            let (status, message) = crate::pipeline::map_terminal_error(&err);
            ctx.status = status;
            ctx.response_body = message.as_bytes().to_vec();
            build_response(&state, &mut ctx).await
        }
    };

    let status = response.status();
    let bytes = ctx.response_body.len() as u64;
    state.metrics.record_request(
        &vhost_label,
        method.as_str(),
        status_class(status.as_u16()),
        ctx.elapsed_millis() / 1000.0,
        bytes,
    );
    log_access(&state, &ctx, &method, status, bytes);

    Ok(response)
}

/// Emit one access-log line per request: Apache common-log format when
/// configured, otherwise a structured event carrying the same fields
/// (rendered as JSON by the installed subscriber per `logs.format`).
fn log_access(state: &GatewayState, ctx: &RequestContext, method: &Method, status: StatusCode, bytes: u64) {
    let referer = ctx
        .request_headers
        .get(http::header::REFERER)
        .and_then(|v| v.to_str().ok());
    let user_agent = ctx
        .request_headers
        .get(http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok());

    if state.config.logs.format == "apache" {
        let fields = crate::logging::AccessLogFields {
            vhost: &ctx.vhost,
            remote_host: &ctx.client_ip,
            remote_user: None,
            method: method.as_str(),
            uri: &ctx.url.path,
            version: "HTTP/1.1",
            status: status.as_u16(),
            bytes,
            referer,
            user_agent,
        };
        tracing::info!(target: "access", "{}", crate::logging::format_apache_line(&fields));
    } else {
        tracing::info!(
            target: "access",
            vhost = %ctx.vhost,
            client_ip = %ctx.client_ip,
            method = %method.as_str(),
            path = %ctx.url.path,
            status = %status.as_u16(),
            bytes,
            duration_ms = ctx.elapsed_millis(),
            referer = referer.unwrap_or("-"),
            user_agent = user_agent.unwrap_or("-"),
            "request handled",
        );
    }
}

async fn collect_bounded_body(body: Incoming, max_bytes: u64) -> Result<Bytes, ()> {
    use http_body_util::Limited;
    if max_bytes == 0 {
        return body.collect().await.map(|c| c.to_bytes()).map_err(|_| ());
    }
    let limited = Limited::new(body, max_bytes as usize);
    limited.collect().await.map(|c| c.to_bytes()).map_err(|_| ())
}

/// After the chain drains without error: GET-like methods reach the file
/// handler; otherwise, 405 if GET would be allowed, else 404.
async fn terminal_route(state: &GatewayState, ctx: &mut RequestContext) -> Result<(), GatewayError> {
    if ctx.status == StatusCode::NOT_MODIFIED {
        return Ok(());
    }
    if let Some(route) = state.match_proxy(&ctx.vhost, &ctx.url.path) {
        let our_origin = format!("{}://{}", ctx.url.scheme, ctx.url.host);
        return crate::proxy::dispatch(
            &state.proxy_client,
            route,
            ctx,
            &state.etag_cache,
            &state.config.proxy.rewrite,
            &our_origin,
            state.config.seed,
            &state.metrics,
        )
        .await;
    }
    if ctx.is_get_like() {
        return dispatch_file_handler(state, ctx).await;
    }
    let allows_get = state
        .pipeline
        .routes
        .allows_get(&ctx.url.path, &ctx.vhost, &state.pipeline.blacklist);
    if allows_get {
        Err(GatewayError::MethodNotAllowed("method not allowed".to_string()))
    } else {
        Err(GatewayError::NotFound("not found".to_string()))
    }
}

async fn dispatch_file_handler(state: &GatewayState, ctx: &mut RequestContext) -> Result<(), GatewayError> {
    let vhost = state
        .pipeline
        .vhosts
        .select(&ctx.vhost)
        .ok_or_else(|| GatewayError::Internal("no vhost resolved".to_string()))?;

    let Some(resolved) = filehandler::resolve(&vhost.root, &ctx.url.path) else {
        return Err(GatewayError::NotFound("path traversal rejected".to_string()));
    };

    if filehandler::is_directory(&resolved).await {
        if ctx.is_get_like() {
            if !ctx.url.path.ends_with('/') {
                let query = if ctx.url.query.is_empty() {
                    String::new()
                } else {
                    format!("?{}", ctx.url.query)
                };
                ctx.redirect(&format!("{}/{}", ctx.url.path, query));
                return Ok(());
            }
            return match filehandler::resolve_index(&resolved, &state.config.index).await {
                Some(meta) => serve_file(state, ctx, meta).await,
                None => Err(GatewayError::NotFound("no index file".to_string())),
            };
        }
        return non_get_on_directory(state, ctx, &resolved).await;
    }

    match filehandler::stat(&resolved).await {
        Some(meta) => serve_file(state, ctx, meta).await,
        None => {
            if ctx.method == Method::PUT || ctx.method == Method::POST {
                write_file(state, ctx, &resolved).await
            } else {
                Err(GatewayError::NotFound("not found".to_string()))
            }
        }
    }
}

async fn non_get_on_directory(
    state: &GatewayState,
    ctx: &mut RequestContext,
    dir: &std::path::Path,
) -> Result<(), GatewayError> {
    let target = filehandler::directory_write_target(dir, &ctx.method)?;
    match (ctx.method.clone(), target) {
        (Method::DELETE, Some(path)) => delete_file(state, ctx, &path).await,
        (_, Some(path)) => write_file(state, ctx, &path).await,
        _ => Err(GatewayError::NotFound("not found".to_string())),
    }
}

async fn serve_file(
    state: &GatewayState,
    ctx: &mut RequestContext,
    meta: filehandler::FileMeta,
) -> Result<(), GatewayError> {
    let url = ctx.url.canonical();
    let etag = filehandler::file_etag(&url, &meta, state.config.seed);

    let if_none_match = ctx
        .request_headers
        .get(http::header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_matches('"').to_string());
    let if_modified_since = ctx
        .request_headers
        .get(http::header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok());

    let not_modified = if_none_match.as_deref() == Some(etag.as_str())
        || if_modified_since
            .map(|since| {
                let mtime = std::time::UNIX_EPOCH + std::time::Duration::from_secs(meta.mtime_epoch);
                mtime <= since
            })
            .unwrap_or(false);

    ctx.response_headers.insert(
        http::header::CONTENT_TYPE,
        meta.mime_type.parse().expect("mime_guess output is always a valid header value"),
    );
    ctx.response_headers.insert(
        http::header::LAST_MODIFIED,
        meta.mtime_http_date.parse().expect("httpdate output is always a valid header value"),
    );
    ctx.response_headers.insert(
        http::header::ETAG,
        etag.parse().expect("hex-formatted etag is always a valid header value"),
    );
    ctx.response_headers.insert(
        http::header::CONTENT_LENGTH,
        meta.size.to_string().parse().expect("decimal size is always a valid header value"),
    );
    ctx.local_path = Some(meta.path.clone());

    if filehandler::is_writable(&meta.path).await {
        for method in filehandler::writable_methods(true) {
            ctx.allow.insert(method.to_string());
        }
    }

    if not_modified {
        ctx.status = StatusCode::NOT_MODIFIED;
    } else {
        ctx.status = StatusCode::OK;
        // HEAD/OPTIONS carry the same headers but an empty body (§4.4); only
        // a GET actually streams the file, so only GET decorates the request
        // with a file representation for `build_response` to emit.
        if ctx.method == Method::GET {
            ctx.response_is_file = Some(meta.path.clone());
        }
    }
    Ok(())
}

async fn write_file(state: &GatewayState, ctx: &mut RequestContext, path: &std::path::Path) -> Result<(), GatewayError> {
    let url = ctx.url.canonical();
    let client_etag = ctx
        .request_headers
        .get(http::header::IF_MATCH)
        .or_else(|| ctx.request_headers.get(http::header::ETAG))
        .and_then(|v| v.to_str().ok());
    filehandler::check_write_precondition(&url, path, client_etag, state.config.seed).await?;

    let outcome = filehandler::write_file(path, &ctx.body)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    state.etag_cache.unregister(&url);

    ctx.status = match outcome {
        filehandler::WriteOutcome::Created => StatusCode::CREATED,
        filehandler::WriteOutcome::Replaced => StatusCode::NO_CONTENT,
    };
    Ok(())
}

async fn delete_file(state: &GatewayState, ctx: &mut RequestContext, path: &std::path::Path) -> Result<(), GatewayError> {
    let url = ctx.url.canonical();
    filehandler::delete_file(&url, path, &state.etag_cache)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    ctx.status = StatusCode::NO_CONTENT;
    Ok(())
}

async fn build_response(state: &GatewayState, ctx: &mut RequestContext) -> Response<EmitBody> {
    if let Some(location) = &ctx.redirected_to {
        return Response::builder()
            .status(StatusCode::TEMPORARY_REDIRECT)
            .header(http::header::LOCATION, location.as_str())
            .body(emitter::empty_body())
            .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "redirect build failed"));
    }

    let headers = emitter::decorate_headers(ctx, &build_default_headers(state), ctx.status, ctx.response_headers.clone());

    let accept = ctx
        .request_headers
        .get(http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let mut headers = headers;
    let shaped = emitter::shape_body(ctx, accept.as_deref(), state.config.json, ctx.response_body.clone(), &mut headers);

    let content_length = shaped.len() as u64;
    if ctx.status == StatusCode::OK || ctx.status == StatusCode::NOT_MODIFIED {
        let _ = emitter::write_through(
            ctx,
            &state.etag_cache,
            &state.watchers,
            &headers,
            &shaped,
            content_length,
            state.config.seed,
        );
    }

    // Range slicing happens after the cache write-through (which always
    // registers the full representation) and before compression, which is
    // skipped for ranged responses to avoid compressing a byte slice against
    // a side file keyed by the full body's etag.
    let mut status = ctx.status;
    let mut range: Option<(u64, u64)> = None;
    if ctx.method == Method::GET && status == StatusCode::OK {
        if let Some(range_header) = ctx
            .request_headers
            .get(http::header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        {
            match emitter::parse_range(&range_header, content_length) {
                Ok((start, end)) => {
                    emitter::apply_range(&mut headers, start, end, content_length);
                    status = StatusCode::PARTIAL_CONTENT;
                    range = Some((start, end));
                }
                Err(()) => {
                    headers.remove(http::header::RANGE);
                    headers.remove(http::header::CONTENT_LENGTH);
                    headers.remove(http::header::CONTENT_TYPE);
                    let body = b"range not satisfiable".to_vec();
                    if let Ok(value) = http::HeaderValue::from_str(&body.len().to_string()) {
                        headers.insert(http::header::CONTENT_LENGTH, value);
                    }
                    headers.insert(http::header::CONTENT_TYPE, http::HeaderValue::from_static("text/plain"));
                    let mut builder = http::Response::builder().status(StatusCode::RANGE_NOT_SATISFIABLE);
                    for (name, value) in headers.iter() {
                        builder = builder.header(name, value);
                    }
                    return builder
                        .body(emitter::full_body(body))
                        .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "range build failed"));
                }
            }
        }
    }

    let user_agent = ctx.request_headers.get(http::header::USER_AGENT).and_then(|v| v.to_str().ok());
    let accept_encoding = ctx.request_headers.get(http::header::ACCEPT_ENCODING).and_then(|v| v.to_str().ok());
    let content_type = headers.get(http::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(str::to_string);
    let encoding = if range.is_some() {
        None
    } else {
        emitter::select_encoding(
            status,
            shaped.len(),
            state.config.compress,
            content_type.as_deref(),
            user_agent,
            accept_encoding,
        )
    };

    if let Some(path) = &ctx.response_is_file {
        let result = match range {
            Some((start, end)) => emitter::emit_file_range(headers.clone(), status, path, start, end).await,
            None => {
                emitter::emit_file(
                    &state.etag_cache,
                    headers.get(http::header::ETAG).and_then(|v| v.to_str().ok()),
                    headers.clone(),
                    status,
                    path,
                    encoding,
                )
                .await
            }
        };
        return match result {
            Ok(response) => response,
            Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "file read failed"),
        };
    }

    let body_for_emit = match range {
        Some((start, end)) => shaped
            .get(start as usize..=end as usize)
            .map(<[u8]>::to_vec)
            .unwrap_or_default(),
        None => shaped,
    };

    emitter::emit_buffer(
        &state.etag_cache,
        headers.get(http::header::ETAG).and_then(|v| v.to_str().ok()),
        headers,
        status,
        body_for_emit,
        encoding,
    )
    .await
}

fn build_default_headers(state: &GatewayState) -> http::HeaderMap {
    let mut headers = http::HeaderMap::new();
    for (key, value) in &state.config.headers {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::from_bytes(key.as_bytes()),
            http::HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    headers
}

fn error_response(status: StatusCode, message: &str) -> Response<EmitBody> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(emitter::full_body(message.as_bytes().to_vec()))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(emitter::empty_body())
                .expect("fallback response is always valid")
        })
}
