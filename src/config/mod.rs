#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub port: u16,
    pub address: String,
    /// Server identifier, used in the `Server` banner default and logs.
    pub id: String,
    /// Label of the vhost used when no configured host pattern matches.
    pub default: String,
    /// Global document-root directory; vhost roots are relative to it.
    pub root: PathBuf,
    /// label -> relative root under `root`. The label doubles as the vhost's
    /// host-matching glob pattern.
    pub vhosts: HashMap<String, String>,
    /// Side-file directory; defaults to the OS temp dir.
    pub tmp: Option<PathBuf>,
    /// Ordered list of directory-index filenames.
    pub index: Vec<String>,
    /// Default response headers; keys are lowercased at load.
    pub headers: HashMap<String, String>,
    pub compress: bool,
    /// Default JSON indent width.
    pub json: usize,
    /// Max request body size in bytes; 0 disables the check.
    #[serde(rename = "maxBytes")]
    pub max_bytes: u64,
    pub ssl: Option<SslConfig>,
    pub proxy: ProxyConfig,
    pub logs: LogsConfig,
    /// Seed for the mmh3 ETag hash.
    pub seed: u32,
    /// Drop privileges to this uid after binding, if running privileged.
    pub uid: Option<u32>,
    /// If true, an uncaught route failure always emits a terminal error
    /// response even when no headers had been sent yet.
    pub catch_all: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Content-type regex sources, joined with `|` into the rewrite test
    /// that decides whether a proxied body is buffered and rewritten.
    pub rewrite: Vec<String>,
    pub max_connections: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            rewrite: vec![
                "text/".to_string(),
                "application/json".to_string(),
                "application/javascript".to_string(),
            ],
            max_connections: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    pub level: String,
    pub stdout: bool,
    pub dtrace: bool,
    /// "json" (default) or "apache".
    pub format: String,
    pub time: bool,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            stdout: true,
            dtrace: false,
            format: "json".to_string(),
            time: true,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            address: "0.0.0.0".to_string(),
            id: String::new(),
            default: String::new(),
            root: PathBuf::from("."),
            vhosts: HashMap::new(),
            tmp: None,
            index: vec!["index.html".to_string()],
            headers: HashMap::new(),
            compress: true,
            json: 0,
            max_bytes: 0,
            ssl: None,
            proxy: ProxyConfig::default(),
            logs: LogsConfig::default(),
            seed: 0,
            uid: None,
            catch_all: false,
        }
    }
}

impl GatewayConfig {
    /// Load from a TOML or JSON file, falling back to defaults with every
    /// header lowercased and the `Server` default applied.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            GatewayConfig::default()
        };

        config.apply_env_overrides();
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TURTLE_PORT") {
            if let Ok(p) = v.parse() {
                self.port = p;
            }
        }
        if let Ok(v) = std::env::var("TURTLE_ADDRESS") {
            self.address = v;
        }
        if let Ok(v) = std::env::var("TURTLE_ROOT") {
            self.root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TURTLE_UID") {
            self.uid = v.parse().ok();
        }
    }

    /// Lowercase header keys and apply the `Server` default.
    fn normalize(&mut self) {
        let mut lowered = HashMap::with_capacity(self.headers.len());
        for (k, v) in self.headers.drain() {
            lowered.insert(k.to_ascii_lowercase(), v);
        }
        self.headers = lowered;
        self.headers
            .entry("server".to_string())
            .or_insert_with(|| format!("turtle.io/{}", env!("CARGO_PKG_VERSION")));
        self.headers
            .entry("x-powered-by".to_string())
            .or_insert_with(|| "turtle.io".to_string());
        if self.tmp.is_none() {
            self.tmp = Some(std::env::temp_dir());
        }
    }

    /// A missing `default` vhost is a fatal configuration error; the process
    /// should exit with status 1 rather than start half-configured.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default.is_empty() {
            anyhow::bail!("config: `default` vhost label is required");
        }
        Ok(())
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.tmp.clone().unwrap_or_else(std::env::temp_dir)
    }
}
