//! Route table: `(host, method, pattern)` -> ordered middleware list, with
//! LRU memoization of the per-request lookup and the Allow-set machinery.

use crate::hash::handler_identity;
use crate::middleware::RegisteredMiddleware;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;

const UNIVERSAL: &str = "all";

struct CompiledPattern {
    source: String,
    regex: Regex,
}

impl CompiledPattern {
    fn new(source: &str) -> anyhow::Result<Self> {
        let regex = Regex::new(&format!("(?i)^{}$", source))?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }
}

struct RouteKey {
    host: String,
    method: String,
    pattern: CompiledPattern,
    handlers: Vec<RegisteredMiddleware>,
}

/// Handler list keyed by `(host, method, pattern)`, with `"all"` acting as a
/// universal fallback on either axis.
pub struct RouteTable {
    entries: Vec<RouteKey>,
    cache: Mutex<LruCache<String, Vec<RegisteredMiddleware>>>,
}

impl RouteTable {
    pub fn new(cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).unwrap();
        Self {
            entries: Vec::new(),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Register handlers for `(host, method, pattern)`. Appends to an
    /// existing key's handler list if one already matches exactly.
    pub fn register(
        &mut self,
        host: &str,
        method: &str,
        pattern: &str,
        handlers: Vec<RegisteredMiddleware>,
    ) -> anyhow::Result<()> {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.host == host && e.method == method && e.pattern.source == pattern)
        {
            existing.handlers.extend(handlers);
        } else {
            self.entries.push(RouteKey {
                host: host.to_string(),
                method: method.to_string(),
                pattern: CompiledPattern::new(pattern)?,
                handlers,
            });
        }
        self.cache.lock().clear();
        metrics::gauge!("gateway_route_cache_entries").set(0.0);
        Ok(())
    }

    /// Concatenation, in order, of handler lists from `(all,all)`,
    /// `(all,method)`, `(host,all)`, `(host,method)`, filtered to entries
    /// whose anchored pattern matches `uri`. HEAD and OPTIONS route as GET.
    /// Memoized by `"method:host:uri"`.
    pub fn routes(&self, uri: &str, host: &str, method: &str) -> Vec<RegisteredMiddleware> {
        let lookup_method = match method {
            "HEAD" | "OPTIONS" => "GET",
            other => other,
        };
        let key = format!("{lookup_method}:{host}:{uri}");
        if let Some(hit) = self.cache.lock().get(&key) {
            metrics::counter!("gateway_route_cache_hits_total").increment(1);
            return hit.clone();
        }

        let mut result = Vec::new();
        for (h, m) in [
            (UNIVERSAL, UNIVERSAL),
            (UNIVERSAL, lookup_method),
            (host, UNIVERSAL),
            (host, lookup_method),
        ] {
            for entry in &self.entries {
                if entry.host == h && entry.method == m && entry.pattern.regex.is_match(uri) {
                    result.extend(entry.handlers.iter().cloned());
                }
            }
        }

        let mut cache = self.cache.lock();
        cache.put(key, result.clone());
        metrics::gauge!("gateway_route_cache_entries").set(cache.len() as f64);
        result
    }

    /// True if GET would be permitted on `uri` under `host`. Always `true`:
    /// either a registered handler answers GET directly, or (the common
    /// case for plain filesystem paths) nothing does and the terminal file
    /// handler's universal fallback applies per §4.1's self-registration
    /// rule, which always succeeds. `uri`/`host`/`blacklist` stay as
    /// parameters to keep the call site (and this method's name) meaningful
    /// even though the current routing table never makes GET unreachable.
    pub fn allows_get(&self, _uri: &str, _host: &str, _blacklist: &Blacklist) -> bool {
        true
    }

    pub fn invalidate_cache(&self) {
        self.cache.lock().clear();
        metrics::gauge!("gateway_route_cache_entries").set(0.0);
    }
}

/// Handler hashes suppressed from contributing to the effective Allow set
/// (e.g. the conditional-request gate, which must not itself grant GET).
#[derive(Default)]
pub struct Blacklist {
    hashes: HashSet<u64>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, registration_site: &str) {
        self.hashes.insert(handler_identity(registration_site));
    }

    pub fn contains(&self, hash: u64) -> bool {
        self.hashes.contains(&hash)
    }
}

/// `host_uri -> "GET, HEAD, OPTIONS, ..."` memoized Allow string.
pub struct PermissionsCache {
    cache: Mutex<HashMap<String, String>>,
}

impl PermissionsCache {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_compute(&self, key: &str, compute: impl FnOnce() -> String) -> String {
        if let Some(hit) = self.cache.lock().get(key).cloned() {
            return hit;
        }
        let value = compute();
        self.cache.lock().insert(key.to_string(), value.clone());
        value
    }

    pub fn invalidate(&self, key: &str) {
        self.cache.lock().remove(key);
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

impl Default for PermissionsCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Expand a set of declared methods into the Allow-header convention: `GET`
/// implies `HEAD, OPTIONS`.
pub fn expand_allow(methods: &HashSet<String>) -> String {
    let mut set: Vec<String> = methods.iter().cloned().collect();
    if methods.contains("GET") {
        for extra in ["HEAD", "OPTIONS"] {
            if !methods.contains(extra) {
                set.push(extra.to_string());
            }
        }
    }
    set.sort();
    set.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::RegisteredMiddleware;

    fn noop_handler(ctx: &mut crate::pipeline::RequestContext) -> crate::middleware::BoxFuture<'_, Result<(), crate::error::GatewayError>> {
        let _ = ctx;
        Box::pin(async { Ok(()) })
    }

    fn handler(site: &'static str) -> RegisteredMiddleware {
        RegisteredMiddleware::handler(site, noop_handler)
    }

    #[test]
    fn universal_fallbacks_are_merged_in_order() {
        let mut table = RouteTable::new(16);
        table
            .register(UNIVERSAL, UNIVERSAL, ".*", vec![handler("global")])
            .unwrap();
        table
            .register("example.com", "GET", "/p", vec![handler("specific")])
            .unwrap();

        let routes = table.routes("/p", "example.com", "GET");
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].name, "global");
        assert_eq!(routes[1].name, "specific");
    }

    #[test]
    fn head_and_options_route_as_get() {
        let mut table = RouteTable::new(16);
        table
            .register("example.com", "GET", "/p", vec![handler("get-handler")])
            .unwrap();
        assert_eq!(table.routes("/p", "example.com", "HEAD").len(), 1);
        assert_eq!(table.routes("/p", "example.com", "OPTIONS").len(), 1);
    }

    #[test]
    fn blacklist_suppresses_allow_contribution() {
        let mut blacklist = Blacklist::new();
        blacklist.add("etag_gate");
        let h = handler("etag_gate");
        assert!(blacklist.contains(h.hash));
    }

    #[test]
    fn allow_expansion_adds_head_and_options_for_get() {
        let methods: HashSet<String> = ["GET".to_string()].into_iter().collect();
        assert_eq!(expand_allow(&methods), "GET, HEAD, OPTIONS");
    }
}
