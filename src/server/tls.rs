//! Downstream HTTPS listener setup: load the configured certificate/key
//! pair into a `rustls::ServerConfig`. SSLv2/SSLv3 are unreachable by
//! construction — `rustls` only ever negotiates TLS 1.2+.

use crate::config::SslConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

pub fn load_server_config(ssl: &SslConfig) -> anyhow::Result<Arc<ServerConfig>> {
    let cert_file = File::open(&ssl.cert)?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_file)).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", ssl.cert.display());
    }

    let key_file = File::open(&ssl.key)?;
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(key_file))?
            .ok_or_else(|| anyhow::anyhow!("no private key found in {}", ssl.key.display()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}
