//! Representation cache: an LRU of ETag-stamped response states with
//! on-disk compressed side files.

use http::HeaderMap;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Header fields stripped before a response's headers are cached: hop-by-hop
/// and dynamic fields that must be recomputed per response rather than
/// replayed from a stored entry.
const STRIPPED_FIELDS: &[&str] = &[
    "content-encoding",
    "server",
    "status",
    "transfer-encoding",
    "x-powered-by",
    "x-response-time",
];

fn is_stripped(name: &str) -> bool {
    STRIPPED_FIELDS.contains(&name) || name.starts_with("access-control-")
}

/// Sanitize a header map for storage: drop hop-by-hop and dynamic fields.
pub fn sanitize_headers(headers: &HeaderMap) -> HeaderMap {
    let mut sanitized = HeaderMap::new();
    for (name, value) in headers.iter() {
        if !is_stripped(name.as_str()) {
            sanitized.insert(name.clone(), value.clone());
        }
    }
    sanitized
}

#[derive(Clone)]
pub struct EtagEntry {
    pub etag: String,
    pub headers: HeaderMap,
    pub mimetype: String,
    pub timestamp: u64,
}

pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `url -> {etag, headers, mimetype, timestamp}`, capacity-bounded, plus the
/// on-disk `<tmp>/<etag>.gz` / `<tmp>/<etag>.zz` side files it fronts.
pub struct EtagCache {
    entries: Mutex<LruCache<String, EtagEntry>>,
    tmp_dir: PathBuf,
}

impl EtagCache {
    pub fn new(capacity: usize, tmp_dir: PathBuf) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            tmp_dir,
        }
    }

    pub fn get(&self, url: &str) -> Option<EtagEntry> {
        self.entries.lock().get(url).cloned()
    }

    /// Register (or replace) the entry for `url`. At most one entry per URL;
    /// replacing an entry whose etag changed invalidates the old side files
    /// since they're addressed by the old etag and would never be read
    /// again under the new one.
    pub fn register(&self, url: &str, entry: EtagEntry) {
        let previous = self.entries.lock().put(url.to_string(), entry.clone());
        if let Some(previous) = previous {
            if previous.etag != entry.etag {
                self.delete_side_files(&previous.etag);
            }
        }
        metrics::gauge!("gateway_etag_cache_entries").set(self.len() as f64);
    }

    /// Remove the entry for `url` and best-effort clean up its side files.
    pub fn unregister(&self, url: &str) {
        if let Some(entry) = self.entries.lock().pop(url) {
            self.delete_side_files(&entry.etag);
        }
        metrics::gauge!("gateway_etag_cache_entries").set(self.len() as f64);
    }

    pub fn side_file_path(&self, etag: &str, ext: &str) -> PathBuf {
        self.tmp_dir.join(format!("{etag}.{ext}"))
    }

    fn delete_side_files(&self, etag: &str) {
        for ext in ["gz", "zz"] {
            let path = self.side_file_path(etag, ext);
            let _ = std::fs::remove_file(path);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Compact view of which content-types hit the rewrite/cacheability rules
/// the cache write-through step needs (`no-cache|no-store|private`).
pub fn forbids_caching(cache_control: Option<&str>) -> bool {
    match cache_control {
        None => false,
        Some(value) => {
            let lowered = value.to_ascii_lowercase();
            ["no-cache", "no-store", "private"]
                .iter()
                .any(|needle| lowered.contains(needle))
        }
    }
}

/// Fields excluded from a `304` response: a Not Modified response carries
/// no representation metadata.
pub fn not_modified_strip_fields() -> HashSet<&'static str> {
    [
        "accept-ranges",
        "content-encoding",
        "content-length",
        "content-type",
        "date",
        "transfer-encoding",
        "last-modified",
    ]
    .into_iter()
    .collect()
}

pub fn age_seconds(timestamp: u64) -> u64 {
    now_epoch().saturating_sub(timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn sanitize_strips_hop_by_hop_and_cors_fields() {
        let mut headers = HeaderMap::new();
        headers.insert("content-encoding", HeaderValue::from_static("gzip"));
        headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
        headers.insert("content-type", HeaderValue::from_static("text/html"));
        let sanitized = sanitize_headers(&headers);
        assert!(sanitized.get("content-encoding").is_none());
        assert!(sanitized.get("access-control-allow-origin").is_none());
        assert!(sanitized.get("content-type").is_some());
    }

    #[test]
    fn register_replacing_a_changed_etag_deletes_old_side_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EtagCache::new(4, dir.path().to_path_buf());
        let old_path = cache.side_file_path("old", "gz");
        std::fs::write(&old_path, b"x").unwrap();

        cache.register(
            "http://h/p",
            EtagEntry {
                etag: "old".to_string(),
                headers: HeaderMap::new(),
                mimetype: "text/plain".to_string(),
                timestamp: 0,
            },
        );
        cache.register(
            "http://h/p",
            EtagEntry {
                etag: "new".to_string(),
                headers: HeaderMap::new(),
                mimetype: "text/plain".to_string(),
                timestamp: 1,
            },
        );
        assert!(!old_path.exists());
    }

    #[test]
    fn unregister_removes_entry_and_side_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EtagCache::new(4, dir.path().to_path_buf());
        let path = cache.side_file_path("abc", "zz");
        std::fs::write(&path, b"x").unwrap();
        cache.register(
            "http://h/p",
            EtagEntry {
                etag: "abc".to_string(),
                headers: HeaderMap::new(),
                mimetype: "text/plain".to_string(),
                timestamp: 0,
            },
        );
        cache.unregister("http://h/p");
        assert!(cache.get("http://h/p").is_none());
        assert!(!path.exists());
    }

    #[test]
    fn forbids_caching_matches_no_cache_no_store_private() {
        assert!(forbids_caching(Some("no-cache")));
        assert!(forbids_caching(Some("private, max-age=0")));
        assert!(!forbids_caching(Some("public, max-age=60")));
        assert!(!forbids_caching(None));
    }
}
