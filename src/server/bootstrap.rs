//! Process bootstrap: config loading, tracing setup, listener startup, and
//! graceful shutdown on SIGTERM/ctrl-c.

use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::server::state::GatewayState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;

pub struct BootstrapArgs {
    pub config_path: PathBuf,
    pub admin_listen: String,
}

pub async fn run(args: BootstrapArgs) -> anyhow::Result<()> {
    let config = GatewayConfig::load(&args.config_path)?;
    init_tracing(&config.logs);

    // rustls 0.23 has no implicit default crypto backend; both the proxy
    // client and the HTTPS listener's `ServerConfig::builder()` need one
    // installed process-wide before they're built.
    let _ = rustls::crypto::ring::default_provider()
        .install_default()
        .inspect_err(|_| tracing::warn!("rustls crypto provider already installed"));

    let metrics = Arc::new(Metrics::install()?);
    let mut state = GatewayState::new(config, Arc::clone(&metrics));

    for route in load_proxy_routes(&args.config_path)? {
        state.register_proxy(route)?;
    }

    let state = Arc::new(state);
    let shutdown = Arc::new(Notify::new());

    // Bind every listener, including the privileged HTTPS port, before
    // dropping to the configured `uid`.
    let addr: SocketAddr = format!("{}:{}", state.config.address, state.config.port).parse()?;
    let http_listener = tokio::net::TcpListener::bind(addr).await?;

    let https_listener = if state.config.ssl.is_some() {
        let https_addr: SocketAddr = format!("{}:{}", state.config.address, 443).parse()?;
        Some(tokio::net::TcpListener::bind(https_addr).await?)
    } else {
        None
    };

    let admin_addr: SocketAddr = args.admin_listen.parse()?;
    let admin_listener = tokio::net::TcpListener::bind(admin_addr).await?;

    // Load the certificate/key pair while still privileged, in case they're
    // only readable by root, then drop down to the configured `uid`.
    let tls_config = match &state.config.ssl {
        Some(ssl) => Some(crate::server::tls::load_server_config(ssl)?),
        None => None,
    };
    if let Some(uid) = state.config.uid {
        drop_privileges(uid)?;
    }

    let http_task = tokio::spawn(crate::server::run_http(http_listener, Arc::clone(&state), Arc::clone(&shutdown)));

    let https_task = if let (Some(listener), Some(tls_config)) = (https_listener, tls_config) {
        Some(tokio::spawn(crate::server::run_https(
            listener,
            tls_config,
            Arc::clone(&state),
            Arc::clone(&shutdown),
        )))
    } else {
        None
    };

    let admin_task = tokio::spawn(run_admin_server(admin_listener, Arc::clone(&metrics), Arc::clone(&shutdown)));

    wait_for_shutdown().await;
    tracing::info!("shutdown signal received, draining connections");
    shutdown.notify_waiters();

    http_task.await??;
    if let Some(task) = https_task {
        task.await??;
    }
    admin_task.await??;
    Ok(())
}

/// Load `proxy()` mount declarations from the config file's `proxies` list,
/// if present; this keeps `proxy(route, origin, host, stream)` expressible
/// as plain configuration rather than requiring embedder code.
fn load_proxy_routes(config_path: &PathBuf) -> anyhow::Result<Vec<crate::proxy::ProxyRoute>> {
    #[derive(serde::Deserialize, Default)]
    struct ProxiesFile {
        #[serde(default)]
        proxies: Vec<ProxyEntry>,
    }
    #[derive(serde::Deserialize)]
    struct ProxyEntry {
        route: String,
        origin: String,
        host: Option<String>,
        #[serde(default)]
        stream: bool,
    }

    if !config_path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(config_path)?;
    let parsed: ProxiesFile = match config_path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content).unwrap_or_default(),
        Some("json") => serde_json::from_str(&content).unwrap_or_default(),
        _ => ProxiesFile::default(),
    };
    Ok(parsed
        .proxies
        .into_iter()
        .map(|p| crate::proxy::ProxyRoute::new(&p.route, &p.origin, p.host.as_deref(), p.stream))
        .collect())
}

async fn run_admin_server(listener: tokio::net::TcpListener, metrics: Arc<Metrics>, shutdown: Arc<Notify>) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::service::service_fn;
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use hyper_util::server::conn::auto;

    tracing::info!(addr = %listener.local_addr()?, "admin listener bound");

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let metrics = Arc::clone(&metrics);
                tokio::spawn(async move {
                    let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                        let metrics = Arc::clone(&metrics);
                        async move {
                            let body = match req.uri().path() {
                                "/metrics" => metrics.render(),
                                _ => "ok".to_string(),
                            };
                            Ok::<_, std::convert::Infallible>(hyper::Response::new(Full::new(bytes::Bytes::from(body))))
                        }
                    });
                    if let Err(err) = auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        tracing::debug!(%err, "admin connection closed with error");
                    }
                });
            }
        }
    }
    Ok(())
}

/// Drop root privileges to the configured `uid` once every privileged port
/// is bound. `setuid(2)` is irreversible for an unprivileged caller; every
/// connection handled after this call runs as that unprivileged user.
#[cfg(unix)]
fn drop_privileges(uid: u32) -> anyhow::Result<()> {
    let result = unsafe { libc::setuid(uid) };
    if result != 0 {
        anyhow::bail!("setuid({uid}) failed: {}", std::io::Error::last_os_error());
    }
    tracing::info!(uid, "dropped privileges");
    Ok(())
}

#[cfg(not(unix))]
fn drop_privileges(_uid: u32) -> anyhow::Result<()> {
    anyhow::bail!("privilege drop via `uid` is only supported on unix targets");
}

fn init_tracing(logs: &crate::config::LogsConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&logs.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .lossy(true)
        .finish(std::io::stdout());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking);

    if logs.format == "json" {
        let _ = subscriber.json().with_target(false).try_init();
    } else {
        let _ = subscriber.try_init();
    }

    // Non-blocking writer flushes on drop; the process owns the subscriber
    // for its entire lifetime so there's no later point to drop the guard.
    std::mem::forget(guard);
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
