//! Reverse proxy: upstream dispatch, streaming pass-through, and buffered
//! rewriting of relocated textual content.

use crate::cache::EtagCache;
use crate::emitter::EmitBody;
use crate::error::GatewayError;
use crate::pipeline::RequestContext;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use regex::Regex;
use std::sync::Arc;

pub type ProxyClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Accepts any upstream certificate without validation. A permissive default
/// for upstream TLS: internal/mesh traffic where encryption, not identity
/// verification, is the goal.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Build the shared upstream HTTP client: plain `http://` via a bare
/// `HttpConnector`, `https://` terminated with rustls over the same
/// connector, self-signed chains accepted by default.
pub fn build_http_client(max_idle_per_host: usize) -> ProxyClient {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);

    let tls_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(max_idle_per_host)
        .build(https)
}

/// A registered proxy mount: incoming requests under `route` (and
/// `route + "/.*"`, or bare `/.*"` when `route == "/"`) are forwarded to
/// `origin`.
pub struct ProxyRoute {
    pub route: String,
    pub origin: String,
    pub host: Option<String>,
    pub force_stream: bool,
}

impl ProxyRoute {
    pub fn new(route: &str, origin: &str, host: Option<&str>, stream: bool) -> Self {
        Self {
            route: route.to_string(),
            origin: origin.trim_end_matches('/').to_string(),
            host: host.map(str::to_string),
            force_stream: stream,
        }
    }

    /// The two patterns this mount installs handlers for.
    pub fn patterns(&self) -> Vec<String> {
        if self.route == "/" {
            vec!["/.*".to_string()]
        } else {
            vec![
                regex::escape(&self.route),
                format!("{}/.*", regex::escape(&self.route)),
            ]
        }
    }

    /// Whether this mount answers `path` under its installed patterns
    /// (`route` itself, or anything nested under `route/`; bare root mounts
    /// answer everything).
    pub fn matches_path(&self, path: &str) -> bool {
        if self.route == "/" {
            return true;
        }
        path == self.route || path.starts_with(&format!("{}/", self.route))
    }

    /// Upstream URL for an incoming request path: `origin + tail`, where
    /// `tail` is the incoming path with `route` stripped (for non-root
    /// routes).
    pub fn upstream_url(&self, request_path_and_query: &str) -> String {
        let tail = if self.route == "/" {
            request_path_and_query.to_string()
        } else {
            request_path_and_query
                .strip_prefix(self.route.as_str())
                .unwrap_or(request_path_and_query)
                .to_string()
        };
        format!("{}{}", self.origin, tail)
    }
}

/// Inject the forwarding headers (`X-Host`, `X-Forwarded-*`, `X-Real-Ip`)
/// onto the upstream request.
pub fn inject_forwarded_headers(
    headers: &mut HeaderMap,
    proxy_host: Option<&str>,
    client_ip: &str,
    request_scheme: &str,
    server_name: &str,
) {
    if let Some(host) = proxy_host {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert("x-host", value);
        }
    }
    let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }
    if let Ok(value) = HeaderValue::from_str(request_scheme) {
        headers.insert("x-forwarded-proto", value);
    }
    if let Ok(value) = HeaderValue::from_str(server_name) {
        headers.insert("x-forwarded-server", value);
    }
    if let Ok(value) = HeaderValue::from_str(client_ip) {
        headers.insert("x-real-ip", value);
    }
}

/// Mime-type families that imply streaming pass-through unless the body is
/// actually JSON (which still goes through the rewriting path).
const STREAMING_FAMILIES: &[&str] = &[
    "application", "audio", "chemical", "conference", "font", "image", "message", "model", "xml",
    "video",
];

pub fn is_streaming_mode(force_stream: bool, upstream_path: &str) -> bool {
    if force_stream {
        return true;
    }
    let guess = mime_guess::from_path(upstream_path).first();
    match guess {
        Some(mime) if mime.essence_str() == "application/json" => false,
        Some(mime) => STREAMING_FAMILIES.contains(&mime.type_().as_str()),
        None => false,
    }
}

/// Map an upstream dispatch failure to a status: connection-refused faults
/// become `503`, everything else `500`.
pub fn map_upstream_error(kind: UpstreamErrorKind) -> GatewayError {
    match kind {
        UpstreamErrorKind::ConnectionRefused => {
            GatewayError::ServiceUnavailable("upstream refused the connection".to_string())
        }
        UpstreamErrorKind::Other => GatewayError::Internal("upstream request failed".to_string()),
    }
}

pub enum UpstreamErrorKind {
    ConnectionRefused,
    Other,
}

/// Map the upstream response status: `< 100` is malformed (502), `>= 500`
/// passes through verbatim, everything else continues to the
/// rewriting/emission step.
pub fn map_upstream_status(upstream_status: StatusCode) -> Option<StatusCode> {
    if upstream_status.as_u16() < 100 {
        Some(StatusCode::BAD_GATEWAY)
    } else if upstream_status.as_u16() >= 500 {
        Some(upstream_status)
    } else {
        None
    }
}

/// Compose the `Via` header: append the upstream `Server` value, then the
/// caller overwrites `Server` with its own banner.
pub fn compose_via(existing_via: Option<&str>, upstream_server: &str) -> String {
    match existing_via {
        Some(existing) if !existing.is_empty() => format!("{existing}, {upstream_server}"),
        _ => upstream_server.to_string(),
    }
}

/// Rewrite absolute references to the upstream origin and route-relative
/// internal references in a textual body: replace `origin` substrings with
/// `our_origin + route`, and for non-root routes prefix absolute internal
/// paths and `href=`/`src=` relative-path attributes with `route`.
pub fn rewrite_body(body: &str, upstream_origin: &str, our_origin: &str, route: &str) -> String {
    let mut rewritten = body.replace(upstream_origin, &format!("{our_origin}{route}"));
    if route != "/" {
        // `regex` has no lookaround, so the "not a protocol-relative `//`"
        // exclusion is expressed by capturing (and replaying) the character
        // right after the leading slash instead of asserting past it.
        if let Ok(attr_re) = Regex::new(r#"(href|src)=(["'])/([^/])"#) {
            rewritten = attr_re
                .replace_all(&rewritten, |caps: &regex::Captures| {
                    format!("{}={}{}/{}", &caps[1], &caps[2], route, &caps[3])
                })
                .to_string();
        }
    }
    rewritten
}

/// Whether a response's content-type is in the configured rewrite list.
pub fn should_rewrite(content_type: &str, rewrite_patterns: &[String]) -> bool {
    if rewrite_patterns.is_empty() {
        return false;
    }
    let joined = rewrite_patterns.join("|");
    Regex::new(&joined)
        .map(|re| re.is_match(content_type))
        .unwrap_or(false)
}

/// Schedule delay (seconds) before an upstream-derived cache entry should be
/// unregistered: `max-age` from `Cache-Control`, or `Expires - now` as a
/// fallback.
pub fn cache_expiry_seconds(cache_control: Option<&str>, expires_in_seconds: Option<i64>) -> Option<u64> {
    if let Some(cc) = cache_control {
        for directive in cc.split(',') {
            let directive = directive.trim();
            if let Some(value) = directive.strip_prefix("max-age=") {
                if let Ok(seconds) = value.parse::<u64>() {
                    return Some(seconds);
                }
            }
        }
    }
    expires_in_seconds.and_then(|s| if s > 0 { Some(s as u64) } else { None })
}

pub fn default_port_for_scheme(scheme: &str) -> u16 {
    if scheme.eq_ignore_ascii_case("https") {
        443
    } else {
        80
    }
}

pub const PROXIED_METHODS: &[Method] = &[Method::GET, Method::HEAD, Method::POST, Method::PUT, Method::DELETE];

/// Dispatch one proxied request: build and send the upstream request, then
/// either pipe the response straight through (streaming mode) or buffer and
/// rewrite it (RESTful mode). On return, either `ctx.proxy_response` is set
/// (streaming mode; the caller returns it verbatim) or
/// `ctx.status`/`ctx.response_headers`/`ctx.response_body` carry the emitted
/// representation for the normal emission path to finish.
pub async fn dispatch(
    client: &ProxyClient,
    route: &ProxyRoute,
    ctx: &mut RequestContext,
    etag_cache: &Arc<EtagCache>,
    rewrite_patterns: &[String],
    our_origin: &str,
    seed: u32,
    metrics: &crate::metrics::Metrics,
) -> Result<(), GatewayError> {
    let path_and_query = if ctx.url.query.is_empty() {
        ctx.url.path.clone()
    } else {
        format!("{}?{}", ctx.url.path, ctx.url.query)
    };
    let upstream_url = route.upstream_url(&path_and_query);
    let upstream_origin = upstream_origin_of(&upstream_url);

    let mut request_headers = ctx.request_headers.clone();
    inject_forwarded_headers(
        &mut request_headers,
        route.host.as_deref(),
        &ctx.client_ip,
        &ctx.url.scheme,
        our_origin,
    );

    let streaming = is_streaming_mode(route.force_stream, &ctx.url.path);
    if !streaming {
        request_headers.remove(http::header::ACCEPT_ENCODING);
    }

    let mut builder = http::Request::builder().method(ctx.method.clone()).uri(&upstream_url);
    for (name, value) in request_headers.iter() {
        builder = builder.header(name, value);
    }
    let request = builder
        .body(Full::new(Bytes::from(ctx.body.clone())))
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

    let started = std::time::Instant::now();
    let upstream_response = client.request(request).await.map_err(|err| {
        map_upstream_error(if err.is_connect() {
            UpstreamErrorKind::ConnectionRefused
        } else {
            UpstreamErrorKind::Other
        })
    })?;

    let (parts, body) = upstream_response.into_parts();
    metrics.record_proxy_request(
        &upstream_origin,
        crate::metrics::status_class(parts.status.as_u16()),
        started.elapsed().as_secs_f64(),
    );

    if streaming {
        let stream = body
            .into_data_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let piped: EmitBody = http_body_util::StreamBody::new(
            futures_util::TryStreamExt::map_ok(stream, hyper::body::Frame::data),
        )
        .boxed();

        let mut response_builder = Response::builder().status(parts.status);
        if let Some(headers) = response_builder.headers_mut() {
            *headers = parts.headers;
        }
        ctx.proxy_response = response_builder.body(piped).ok();
        return Ok(());
    }

    let body_bytes = body
        .collect()
        .await
        .map_err(|_| GatewayError::Internal("upstream response read failed".to_string()))?
        .to_bytes();

    if let Some(status) = map_upstream_status(parts.status) {
        ctx.status = status;
        ctx.response_body = body_bytes.to_vec();
        return Ok(());
    }

    let upstream_server = parts
        .headers
        .get(http::header::SERVER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let existing_via = parts.headers.get("via").and_then(|v| v.to_str().ok());
    let via = compose_via(existing_via, upstream_server);

    let content_type = parts
        .headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let mut response_body = body_bytes.to_vec();
    if parts.status != StatusCode::NOT_MODIFIED && should_rewrite(&content_type, rewrite_patterns) {
        if let Ok(text) = String::from_utf8(response_body.clone()) {
            response_body = rewrite_body(&text, &upstream_origin, our_origin, &route.route).into_bytes();
            metrics.record_proxy_rewrite();
        }
    }

    let cache_control = parts
        .headers
        .get(http::header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let last_modified = parts
        .headers
        .get(http::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let url = ctx.url.canonical();
    let etag = crate::hash::etag_of(&[&url, &response_body.len().to_string(), &last_modified], seed);
    let if_none_match = ctx
        .request_headers
        .get(http::header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_matches('"').to_string());

    let mut headers = HeaderMap::new();
    for (name, value) in parts.headers.iter() {
        let lower = name.as_str();
        if matches!(
            lower,
            "server" | "content-length" | "content-encoding" | "transfer-encoding" | "via"
        ) {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }
    if let Ok(value) = HeaderValue::from_str(&via) {
        headers.insert("via", value);
    }
    if let Ok(value) = HeaderValue::from_str(&etag) {
        headers.insert(http::header::ETAG, value);
    }

    if ctx.method == Method::GET
        && (parts.status == StatusCode::OK || parts.status == StatusCode::NOT_MODIFIED)
        && !crate::cache::forbids_caching(cache_control.as_deref())
    {
        let expires_in = parts
            .headers
            .get(http::header::EXPIRES)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok())
            .and_then(|t| t.duration_since(std::time::SystemTime::now()).ok())
            .map(|d| d.as_secs() as i64);
        if let Some(seconds) = cache_expiry_seconds(cache_control.as_deref(), expires_in) {
            let etag_cache = Arc::clone(etag_cache);
            let url = url.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(seconds)).await;
                etag_cache.unregister(&url);
            });
        }
    }

    if if_none_match.as_deref() == Some(etag.as_str()) {
        if let Some(entry) = etag_cache.get(&url) {
            let age = crate::cache::age_seconds(entry.timestamp);
            if let Ok(value) = HeaderValue::from_str(&age.to_string()) {
                headers.insert("age", value);
            }
        }
        ctx.status = StatusCode::NOT_MODIFIED;
        response_body.clear();
    } else {
        ctx.status = parts.status;
    }

    if ctx.method == Method::HEAD {
        response_body.clear();
    }

    ctx.response_headers = headers;
    ctx.response_body = response_body;
    Ok(())
}

fn upstream_origin_of(upstream_url: &str) -> String {
    if let Some(rest) = upstream_url.strip_prefix("https://") {
        format!("https://{}", rest.split('/').next().unwrap_or(""))
    } else if let Some(rest) = upstream_url.strip_prefix("http://") {
        format!("http://{}", rest.split('/').next().unwrap_or(""))
    } else {
        upstream_url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_url_strips_non_root_route() {
        let route = ProxyRoute::new("/app", "http://up:8080", None, false);
        assert_eq!(route.upstream_url("/app/a?b=1"), "http://up:8080/a?b=1");
    }

    #[test]
    fn upstream_url_preserves_tail_for_root_route() {
        let route = ProxyRoute::new("/", "http://up:8080", None, false);
        assert_eq!(route.upstream_url("/a/b"), "http://up:8080/a/b");
    }

    #[test]
    fn streaming_mode_detects_image_but_not_json() {
        assert!(is_streaming_mode(false, "/logo.png"));
        assert!(!is_streaming_mode(false, "/data.json"));
    }

    #[test]
    fn status_below_100_maps_to_bad_gateway() {
        assert_eq!(
            map_upstream_status(StatusCode::from_u16(99).unwrap()),
            Some(StatusCode::BAD_GATEWAY)
        );
    }

    #[test]
    fn status_5xx_passes_through() {
        assert_eq!(
            map_upstream_status(StatusCode::SERVICE_UNAVAILABLE),
            Some(StatusCode::SERVICE_UNAVAILABLE)
        );
    }

    #[test]
    fn status_2xx_continues_to_rewriting() {
        assert_eq!(map_upstream_status(StatusCode::OK), None);
    }

    #[test]
    fn rewrite_replaces_origin_and_prefixes_relative_href() {
        let rewritten = rewrite_body(
            r#"<a href="/logo.png">http://up</a>"#,
            "http://up",
            "http://gw",
            "/app",
        );
        assert_eq!(rewritten, r#"<a href="/app/logo.png">http://gw/app</a>"#);
    }

    #[test]
    fn cache_expiry_reads_max_age() {
        assert_eq!(cache_expiry_seconds(Some("public, max-age=30"), None), Some(30));
    }

    #[test]
    fn default_port_follows_upstream_scheme() {
        assert_eq!(default_port_for_scheme("https"), 443);
        assert_eq!(default_port_for_scheme("http"), 80);
    }
}
