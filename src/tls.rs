//! TLS material for both legs of the proxy
//!
//! Inbound: an optional certificate/key pair read from PEM files.
//! Outbound: a client config trusting the webpki root set.

use anyhow::{anyhow, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

/// Connector used for `https` targets
pub fn client_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

/// Build a server config from PEM encoded certificate chain and private key
pub fn load_server_config<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<ServerConfig> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Certificate and key do not form a usable pair")?;

    info!("Loaded TLS certificate from {}", cert_path.display());

    Ok(config)
}

/// Acceptor for the listening socket, if both files exist
pub fn acceptor_from_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Option<TlsAcceptor>> {
    if !cert_path.as_ref().exists() || !key_path.as_ref().exists() {
        return Ok(None);
    }

    let config = load_server_config(cert_path, key_path)?;
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open certificate file {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Invalid PEM in {}", path.display()))?;

    if certs.is_empty() {
        return Err(anyhow!("No certificates found in {}", path.display()));
    }

    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open key file {}", path.display()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("Invalid PEM in {}", path.display()))?
        .ok_or_else(|| anyhow!("No private key found in {}", path.display()))
}
