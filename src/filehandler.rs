//! File-backed resource handler: safe path resolution under a vhost root,
//! directory index resolution, and RESTful CRUD on files.

use crate::cache::EtagCache;
use crate::error::GatewayError;
use http::Method;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Reject traversal outside the vhost root: the relative path (after
/// stripping the leading slash) must not start with `..`, nor contain at
/// least as many `../` segments as named segments.
pub fn is_safe_path(request_path: &str) -> bool {
    let relative = request_path.trim_start_matches('/');
    if relative.starts_with("..") {
        return false;
    }
    let mut up = 0usize;
    let mut named = 0usize;
    for segment in relative.split('/') {
        match segment {
            ".." => up += 1,
            "" | "." => {}
            _ => named += 1,
        }
    }
    up == 0 || up < named
}

/// Resolve the vhost-relative request path onto the filesystem, refusing to
/// escape `root`.
pub fn resolve(root: &Path, request_path: &str) -> Option<PathBuf> {
    if !is_safe_path(request_path) {
        return None;
    }
    let relative = request_path.trim_start_matches('/');
    Some(root.join(relative))
}

pub struct FileMeta {
    pub path: PathBuf,
    pub size: u64,
    pub mtime_epoch: u64,
    pub mtime_http_date: String,
    pub mime_type: String,
}

pub async fn stat(path: &Path) -> Option<FileMeta> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    if !metadata.is_file() {
        return None;
    }
    let mtime = metadata.modified().ok()?;
    let mtime_epoch = mtime
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Some(FileMeta {
        path: path.to_path_buf(),
        size: metadata.len(),
        mtime_epoch,
        mtime_http_date: httpdate::fmt_http_date(mtime),
        mime_type: mime_guess::from_path(path).first_or_octet_stream().to_string(),
    })
}

/// Whether the file's parent directory accepts writes, used to decide if
/// `PUT`/`POST`/`DELETE` should be granted in the `Allow` header for a file
/// that already exists.
pub async fn is_writable(path: &Path) -> bool {
    let Some(parent) = path.parent() else {
        return false;
    };
    let Ok(metadata) = tokio::fs::metadata(parent).await else {
        return false;
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o200 != 0
    }
    #[cfg(not(unix))]
    {
        !metadata.permissions().readonly()
    }
}

pub async fn is_directory(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Try each configured index filename in order; the first one that stats
/// successfully wins.
pub async fn resolve_index(dir: &Path, index_names: &[String]) -> Option<FileMeta> {
    for name in index_names {
        if let Some(meta) = stat(&dir.join(name)).await {
            return Some(meta);
        }
    }
    None
}

/// ETag for a GET on a plain file: `hash(url|size|mtime)`, no body digest.
pub fn file_etag(url: &str, meta: &FileMeta, seed: u32) -> String {
    crate::hash::etag_of(&[url, &meta.size.to_string(), &meta.mtime_epoch.to_string()], seed)
}

/// Outcome of a PUT/POST write: `Created` maps to 201, `Replaced` to 204.
pub enum WriteOutcome {
    Created,
    Replaced,
}

/// Recompute the ETag from the file's current stat (if any) and compare
/// against a client-sent `If-Match`/`ETag` value; mismatch is a precondition
/// failure (412).
pub async fn check_write_precondition(
    url: &str,
    path: &Path,
    client_etag: Option<&str>,
    seed: u32,
) -> Result<(), GatewayError> {
    let Some(client_etag) = client_etag else {
        return Ok(());
    };
    let client_etag = client_etag.trim_matches('"');
    if let Some(meta) = stat(path).await {
        let current = file_etag(url, &meta, seed);
        if current != client_etag {
            return Err(GatewayError::PreconditionFailed(
                "If-Match does not match the current representation".to_string(),
            ));
        }
    }
    Ok(())
}

pub async fn write_file(path: &Path, body: &[u8]) -> std::io::Result<WriteOutcome> {
    let existed = tokio::fs::metadata(path).await.is_ok();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(body).await?;
    file.flush().await?;
    Ok(if existed {
        WriteOutcome::Replaced
    } else {
        WriteOutcome::Created
    })
}

pub async fn delete_file(url: &str, path: &Path, etag_cache: &EtagCache) -> std::io::Result<()> {
    etag_cache.unregister(url);
    tokio::fs::remove_file(path).await
}

/// Methods the file handler grants once a concrete file exists under the
/// resolved path: always GET/HEAD/OPTIONS, plus PUT/POST/DELETE when the
/// parent directory is writable.
pub fn writable_methods(parent_writable: bool) -> &'static [&'static str] {
    if parent_writable {
        &["GET", "HEAD", "OPTIONS", "PUT", "POST", "DELETE"]
    } else {
        &["GET", "HEAD", "OPTIONS"]
    }
}

/// Map a non-GET method against a directory (not a file): PUT/POST write
/// into it, DELETE unlinks it, everything else is `405`.
pub fn directory_write_target(dir: &Path, method: &Method) -> Result<Option<PathBuf>, GatewayError> {
    match *method {
        Method::PUT | Method::POST | Method::DELETE => Ok(Some(dir.to_path_buf())),
        _ => Err(GatewayError::MethodNotAllowed(
            "method not allowed on a directory".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_leading_traversal() {
        assert!(!is_safe_path("/../etc/passwd"));
    }

    #[test]
    fn rejects_traversal_outweighing_named_segments() {
        assert!(!is_safe_path("/a/../../../etc/passwd"));
    }

    #[test]
    fn allows_traversal_bounded_by_named_segments() {
        assert!(is_safe_path("/a/b/../c"));
    }

    #[test]
    fn allows_plain_paths_with_no_traversal() {
        assert!(is_safe_path("/"));
        assert!(is_safe_path("/index.html"));
    }

    #[tokio::test]
    async fn resolve_joins_under_root_for_safe_paths() {
        let root = PathBuf::from("/srv/site");
        let resolved = resolve(&root, "/a/b.txt").unwrap();
        assert_eq!(resolved, PathBuf::from("/srv/site/a/b.txt"));
    }

    #[tokio::test]
    async fn resolve_rejects_unsafe_paths() {
        let root = PathBuf::from("/srv/site");
        assert!(resolve(&root, "/../../etc/passwd").is_none());
    }

    #[tokio::test]
    async fn stat_returns_none_for_missing_file() {
        let meta = stat(Path::new("/nonexistent/path/should/not/exist")).await;
        assert!(meta.is_none());
    }

    #[tokio::test]
    async fn write_then_stat_roundtrips_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        write_file(&path, b"hello").await.unwrap();
        let meta = stat(&path).await.unwrap();
        assert_eq!(meta.size, 5);
    }
}
