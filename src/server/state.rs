//! Shared, process-wide gateway state: the vhost table, route index, ETag
//! cache, watcher registry, blacklist, and permissions cache. One instance
//! lives for the process lifetime; `stop()`/`start()` recreate it in place
//! rather than tearing down the process.

use crate::cache::EtagCache;
use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::pipeline::PipelineState;
use crate::proxy::{ProxyClient, ProxyRoute};
use crate::routing::{Blacklist, PermissionsCache, RouteTable};
use crate::vhost::{VhostTable, VirtualHost};
use crate::watch::WatcherRegistry;
use std::sync::Arc;

const ROUTE_CACHE_CAPACITY: usize = 4096;
const ETAG_CACHE_CAPACITY: usize = 4096;

pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub pipeline: PipelineState,
    pub etag_cache: Arc<EtagCache>,
    pub watchers: Arc<WatcherRegistry>,
    pub proxy_routes: Vec<ProxyRoute>,
    pub proxy_client: ProxyClient,
    pub metrics: Arc<Metrics>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, metrics: Arc<Metrics>) -> Self {
        let config = Arc::new(config);

        let mut vhosts = Vec::new();
        for (label, relative_root) in &config.vhosts {
            vhosts.push(VirtualHost::new(label, config.root.join(relative_root)));
        }
        if !config.vhosts.contains_key(&config.default) {
            vhosts.push(VirtualHost::new(&config.default, config.root.clone()));
        }
        let vhost_table = VhostTable::new(vhosts, config.default.clone());

        let etag_cache = Arc::new(EtagCache::new(ETAG_CACHE_CAPACITY, config.tmp_dir()));
        let watchers = Arc::new(WatcherRegistry::new(Arc::clone(&etag_cache), config.seed));
        let proxy_client = crate::proxy::build_http_client(config.proxy.max_connections);

        let mut routes = RouteTable::new(ROUTE_CACHE_CAPACITY);
        let mut blacklist = Blacklist::new();
        crate::middleware_builtin::register_etag_gate(&mut blacklist);
        routes
            .register(
                "all",
                "GET",
                ".*",
                vec![crate::middleware_builtin::etag_gate_handler(
                    Arc::clone(&etag_cache),
                    Arc::clone(&metrics),
                )],
            )
            .expect("the `.*` pattern always compiles");

        Self {
            pipeline: PipelineState {
                config: Arc::clone(&config),
                vhosts: vhost_table,
                routes,
                blacklist,
                permissions: PermissionsCache::new(),
            },
            config,
            etag_cache,
            watchers,
            proxy_routes: Vec::new(),
            proxy_client,
            metrics,
        }
    }

    pub fn register_proxy(&mut self, proxy_route: ProxyRoute) -> anyhow::Result<()> {
        for pattern in proxy_route.patterns() {
            for method in crate::proxy::PROXIED_METHODS {
                self.pipeline.routes.register(
                    proxy_route.host.as_deref().unwrap_or("all"),
                    method.as_str(),
                    &pattern,
                    Vec::new(),
                )?;
            }
        }
        self.proxy_routes.push(proxy_route);
        Ok(())
    }

    /// The first registered proxy mount that answers `path` under `host`,
    /// honoring the per-mount host filter (`None` answers any vhost).
    pub fn match_proxy(&self, host: &str, path: &str) -> Option<&ProxyRoute> {
        self.proxy_routes.iter().find(|route| {
            route.matches_path(path) && route.host.as_deref().map(|h| h == host).unwrap_or(true)
        })
    }
}
