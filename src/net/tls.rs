//! TLS termination for the client-facing listener.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::error::ProxyError;

/// Build an acceptor from PEM certificate chain and private key files.
///
/// Missing or unreadable material is an error; the caller treats it as fatal.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ProxyError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(e.to_string()))?;

    tracing::info!(cert_path = ?cert_path, "TLS termination enabled");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let file = File::open(path).map_err(|e| ProxyError::Tls(format!("certificate {:?}: {}", path, e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("certificate {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls(format!("no certificates found in {:?}", path)));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let file = File::open(path).map_err(|e| ProxyError::Tls(format!("private key {:?}: {}", path, e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ProxyError::Tls(format!("private key {:?}: {}", path, e)))?
        .ok_or_else(|| ProxyError::Tls(format!("no private key found in {:?}", path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_material_is_an_error() {
        let err = load_tls_acceptor(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"))
            .err()
            .unwrap();
        assert!(matches!(err, ProxyError::Tls(_)));
    }
}
