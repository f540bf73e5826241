//! TLS acceptor for the optional HTTPS listener

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::config::TlsConfig;
use crate::error::{RelayError, Result};

/// Build a TLS acceptor from the PEM certificate chain and key on disk
pub fn load_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let server_config = load_server_config(&config.cert_path, &config.key_path)?;
    info!(
        cert = %config.cert_path.display(),
        "Loaded TLS certificate"
    );
    Ok(TlsAcceptor::from(server_config))
}

fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let mut cert_reader = BufReader::new(File::open(cert_path)?);
    let cert_chain = certs(&mut cert_reader).collect::<std::result::Result<Vec<_>, _>>()?;
    if cert_chain.is_empty() {
        return Err(RelayError::Tls(format!(
            "No certificates found in {}",
            cert_path.display()
        )));
    }

    let mut key_reader = BufReader::new(File::open(key_path)?);
    let key = private_key(&mut key_reader)?.ok_or_else(|| {
        RelayError::Tls(format!("No private key found in {}", key_path.display()))
    })?;

    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}
