//! Prometheus-style instrumentation, installed once at bootstrap.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];
const SIZE_BUCKETS: &[f64] = &[
    256.0, 1024.0, 8192.0, 65536.0, 524288.0, 4_194_304.0, 33_554_432.0,
];

pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    pub fn install() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Full("gateway_request_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )?
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Full("gateway_response_bytes".to_string()),
                SIZE_BUCKETS,
            )?
            .install_recorder()?;

        describe_counter!("gateway_requests_total", "Total requests handled, labeled by vhost, method and status class");
        describe_histogram!("gateway_request_duration_seconds", "End-to-end request latency");
        describe_histogram!("gateway_response_bytes", "Response body size after content negotiation");
        describe_counter!("gateway_etag_cache_hits_total", "Conditional-request gate hits (304s served from cache)");
        describe_counter!("gateway_etag_cache_misses_total", "ETag cache misses forwarded to the terminal handler");
        describe_gauge!("gateway_etag_cache_entries", "Current ETag cache population");
        describe_gauge!("gateway_route_cache_entries", "Current route-lookup cache population");
        describe_counter!("gateway_route_cache_hits_total", "Route-lookup cache hits");
        describe_gauge!("gateway_watchers_active", "Active filesystem watchers");
        describe_counter!("gateway_proxy_requests_total", "Proxied requests, labeled by upstream and status class");
        describe_histogram!("gateway_proxy_upstream_duration_seconds", "Upstream round-trip latency");
        describe_counter!("gateway_proxy_rewrites_total", "Upstream bodies rewritten for relocated content");

        Ok(Self { handle })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// A standalone handle for unit tests, built without installing a
    /// global recorder (so it's safe to construct more than once per
    /// process).
    #[cfg(test)]
    pub fn for_test() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self { handle: recorder.handle() }
    }

    pub fn record_request(&self, vhost: &str, method: &str, status_class: &str, duration_secs: f64, body_bytes: u64) {
        counter!("gateway_requests_total", "vhost" => vhost.to_string(), "method" => method.to_string(), "status_class" => status_class.to_string()).increment(1);
        histogram!("gateway_request_duration_seconds").record(duration_secs);
        histogram!("gateway_response_bytes").record(body_bytes as f64);
    }

    pub fn record_etag_hit(&self) {
        counter!("gateway_etag_cache_hits_total").increment(1);
    }

    pub fn record_etag_miss(&self) {
        counter!("gateway_etag_cache_misses_total").increment(1);
    }

    pub fn record_proxy_request(&self, upstream: &str, status_class: &str, duration_secs: f64) {
        counter!("gateway_proxy_requests_total", "upstream" => upstream.to_string(), "status_class" => status_class.to_string()).increment(1);
        histogram!("gateway_proxy_upstream_duration_seconds").record(duration_secs);
    }

    pub fn record_proxy_rewrite(&self) {
        counter!("gateway_proxy_rewrites_total").increment(1);
    }
}

pub fn status_class(status: u16) -> &'static str {
    match status / 100 {
        2 => "2xx",
        3 => "3xx",
        4 => "4xx",
        5 => "5xx",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_class_buckets_by_hundreds() {
        assert_eq!(status_class(204), "2xx");
        assert_eq!(status_class(307), "3xx");
        assert_eq!(status_class(404), "4xx");
        assert_eq!(status_class(503), "5xx");
    }
}
