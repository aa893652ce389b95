//! TLS certificate material (ambient, shared by C3 and C4). Loads a
//! cert/key pair from configured PEM file paths when present, falling
//! back to a generated self-signed certificate for local development —
//! used identically by the QUIC mesh transport and by the client-facing
//! TLS/WSS listeners so a node needs only one certificate configuration
//! surface.

use std::io::Cursor;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::error::{NodeError, Result};

/// A loaded certificate chain plus private key, ready to hand to either
/// `quinn::ServerConfig::with_single_cert` or `rustls::ServerConfig`.
#[derive(Clone)]
pub struct TlsMaterial {
    cert_chain: Vec<CertificateDer<'static>>,
    key: Arc<PrivateKeyDer<'static>>,
}

impl TlsMaterial {
    /// Loads PEM-encoded material from `cert_path`/`key_path` when both are
    /// present; otherwise generates a throwaway self-signed certificate
    /// covering `localhost`/`127.0.0.1`.
    pub fn load(cert_path: Option<&str>, key_path: Option<&str>) -> Result<Self> {
        match (cert_path, key_path) {
            (Some(cert_path), Some(key_path)) => Self::from_files(cert_path, key_path),
            _ => Self::self_signed(),
        }
    }

    fn from_files(cert_path: &str, key_path: &str) -> Result<Self> {
        let cert_bytes = std::fs::read(cert_path).map_err(NodeError::Io)?;
        let key_bytes = std::fs::read(key_path).map_err(NodeError::Io)?;

        let mut cert_reader = Cursor::new(cert_bytes);
        let cert_chain = rustls_pemfile::certs(&mut cert_reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| NodeError::Config(format!("failed to parse certificate chain: {e}")))?;
        if cert_chain.is_empty() {
            return Err(NodeError::Config(format!("certificate chain in {cert_path} is empty")));
        }

        let mut key_reader = Cursor::new(key_bytes);
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| NodeError::Config(format!("failed to parse private key: {e}")))?
            .ok_or_else(|| NodeError::Config(format!("no private key found in {key_path}")))?;

        Ok(Self { cert_chain, key: Arc::new(key) })
    }

    fn self_signed() -> Result<Self> {
        let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        let certified = rcgen::generate_simple_self_signed(subject_alt_names)
            .map_err(|e| NodeError::Config(format!("failed to generate self-signed certificate: {e}")))?;

        let cert_der = certified.cert.der().clone();
        let key_der = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

        Ok(Self {
            cert_chain: vec![cert_der],
            key: Arc::new(PrivateKeyDer::Pkcs8(key_der)),
        })
    }

    #[must_use]
    pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        self.cert_chain.clone()
    }

    #[must_use]
    pub fn key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }

    /// Builds a `rustls::ServerConfig` for terminating client-facing
    /// TLS/WSS connections (C3), independent of the QUIC mesh's own
    /// `quinn::ServerConfig`.
    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>> {
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.cert_chain(), self.key())
            .map_err(|e| NodeError::Config(e.to_string()))?;
        Ok(Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_self_signed_material_when_no_paths_given() {
        let tls = TlsMaterial::load(None, None).unwrap();
        assert!(!tls.cert_chain().is_empty());
    }

    #[test]
    fn server_config_builds_from_self_signed_material() {
        let tls = TlsMaterial::load(None, None).unwrap();
        assert!(tls.server_config().is_ok());
    }

    #[test]
    fn missing_cert_path_falls_back_to_self_signed() {
        let tls = TlsMaterial::load(Some("/nonexistent/cert.pem"), None).unwrap();
        assert!(!tls.cert_chain().is_empty());
    }
}
