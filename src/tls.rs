//! TLS acceptor construction from PEM certificate material.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;
use crate::server::ServerError;

/// Loads the certificate chain and private key and builds an acceptor.
/// Runs synchronously; called once at bind time.
pub(crate) fn build_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, ServerError> {
    let mut cert_reader = BufReader::new(File::open(&config.cert_path)?);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;

    let mut key_reader = BufReader::new(File::open(&config.key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or_else(|| {
        ServerError::NoPrivateKey {
            path: config.key_path.display().to_string(),
        }
    })?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}
