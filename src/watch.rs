//! Filesystem watcher registry: one watcher per served local path,
//! invalidating ETag cache entries on rename or modify.

use crate::cache::EtagCache;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;

struct WatchedPath {
    url: String,
    refcount: usize,
    _watcher: RecommendedWatcher,
}

type WatchedMap = Mutex<HashMap<PathBuf, WatchedPath>>;

/// `path -> refcount(1) + watch handle`. Idempotent `watch()` per path;
/// events re-stat the path and either update the associated cache entry in
/// place or tear the watch down.
pub struct WatcherRegistry {
    watched: Arc<WatchedMap>,
    cache: Arc<EtagCache>,
    seed: u32,
}

impl WatcherRegistry {
    pub fn new(cache: Arc<EtagCache>, seed: u32) -> Self {
        Self {
            watched: Arc::new(Mutex::new(HashMap::new())),
            cache,
            seed,
        }
    }

    /// Register a watch on `path` for `url`, if one doesn't already exist.
    /// Created on first successful GET of `path` (the file handler's GET
    /// path decorates the request's `local_path` for the cache
    /// write-through step to call this).
    pub fn watch(&self, url: &str, path: &Path) -> notify::Result<()> {
        let mut watched = self.watched.lock();
        if watched.contains_key(path) {
            return Ok(());
        }

        let (tx, rx) = channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(tx)?;
        watcher.watch(path, RecursiveMode::NonRecursive)?;

        let cache = Arc::clone(&self.cache);
        let registry = Arc::clone(&self.watched);
        let watched_path = path.to_path_buf();
        let watched_url = url.to_string();
        let seed = self.seed;
        thread::spawn(move || {
            for event in rx {
                let Ok(event) = event else { continue };
                handle_event(&cache, &registry, &watched_path, &watched_url, &event, seed);
            }
        });

        watched.insert(
            path.to_path_buf(),
            WatchedPath {
                url: url.to_string(),
                refcount: 1,
                _watcher: watcher,
            },
        );
        metrics::gauge!("gateway_watchers_active").set(watched.len() as f64);
        Ok(())
    }

    pub fn refcount(&self, path: &Path) -> usize {
        self.watched.lock().get(path).map(|w| w.refcount).unwrap_or(0)
    }

    /// Close the watcher and unregister the cache entry for its URL.
    pub fn cleanup(&self, path: &Path) {
        cleanup_watched(&self.watched, &self.cache, path);
    }
}

/// Shared by the event thread (on rename) and the public `cleanup`: drop the
/// watch entry (closing the underlying OS handle when it's dropped) and
/// unregister the cache entry for its URL.
fn cleanup_watched(watched: &WatchedMap, cache: &EtagCache, path: &Path) {
    let mut map = watched.lock();
    let removed = map.remove(path);
    metrics::gauge!("gateway_watchers_active").set(map.len() as f64);
    drop(map);
    if let Some(entry) = removed {
        cache.unregister(&entry.url);
    }
}

fn handle_event(cache: &EtagCache, watched: &WatchedMap, path: &Path, url: &str, event: &Event, seed: u32) {
    match event.kind {
        EventKind::Remove(_) => cleanup_watched(watched, cache, path),
        EventKind::Modify(ModifyKind::Name(_)) => cleanup_watched(watched, cache, path),
        EventKind::Modify(_) => {
            if let Ok(metadata) = std::fs::metadata(path) {
                if let Some(mut entry) = cache.get(url) {
                    let mtime = metadata
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    entry.timestamp = mtime;
                    entry.etag = crate::hash::etag_of(
                        &[url, &metadata.len().to_string(), &mtime.to_string()],
                        seed,
                    );
                    cache.register(url, entry);
                }
            } else {
                cleanup_watched(watched, cache, path);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_is_idempotent_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, b"hello").unwrap();
        let cache = Arc::new(EtagCache::new(8, dir.path().to_path_buf()));
        let registry = WatcherRegistry::new(cache, 0);

        registry.watch("http://h/f.txt", &file).unwrap();
        registry.watch("http://h/f.txt", &file).unwrap();
        assert_eq!(registry.refcount(&file), 1);
    }

    #[test]
    fn cleanup_removes_cache_entry() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, b"hello").unwrap();
        let cache = Arc::new(EtagCache::new(8, dir.path().to_path_buf()));
        registry_cleanup_case(&cache, &file);
    }

    fn registry_cleanup_case(cache: &Arc<EtagCache>, file: &Path) {
        cache.register(
            "http://h/f.txt",
            crate::cache::EtagEntry {
                etag: "abc".to_string(),
                headers: http::HeaderMap::new(),
                mimetype: "text/plain".to_string(),
                timestamp: 0,
            },
        );
        let registry = WatcherRegistry::new(Arc::clone(cache), 0);
        registry.watch("http://h/f.txt", file).unwrap();
        registry.cleanup(file);
        assert!(cache.get("http://h/f.txt").is_none());
        assert_eq!(registry.refcount(file), 0);
    }
}
