//! TLS connector configuration for LWP client connections.
//!
//! The transport consumes a [`TlsClientConfig`] and wraps the TCP stream if
//! one is present; certificate policy stays out of the transport core.
//!
//! ```rust,ignore
//! use lwp_wire::TlsClientConfig;
//!
//! let tls = TlsClientConfig::new()
//!     .with_ca_cert("/etc/lance/ca.pem")
//!     .with_client_cert("/etc/lance/client.pem", "/etc/lance/client-key.pem");
//! let connector = tls.connector()?;
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use tokio_rustls::TlsConnector;

/// Error type for TLS configuration and handshakes.
#[derive(Debug)]
pub enum TlsError {
    CertificateError(String),
    KeyError(String),
    HandshakeError(String),
    ConfigError(String),
    IoError(std::io::Error),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::CertificateError(msg) => write!(f, "Certificate error: {}", msg),
            TlsError::KeyError(msg) => write!(f, "Key error: {}", msg),
            TlsError::HandshakeError(msg) => write!(f, "Handshake error: {}", msg),
            TlsError::ConfigError(msg) => write!(f, "Config error: {}", msg),
            TlsError::IoError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<std::io::Error> for TlsError {
    fn from(e: std::io::Error) -> Self {
        TlsError::IoError(e)
    }
}

pub type TlsResult<T> = std::result::Result<T, TlsError>;

/// TLS configuration for client connections.
#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    /// CA certificate for server verification (None = webpki roots).
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate for mTLS.
    pub client_cert_path: Option<PathBuf>,
    /// Client private key for mTLS.
    pub client_key_path: Option<PathBuf>,
    /// Server name for SNI (defaults to the connection hostname).
    pub server_name: Option<String>,
}

impl TlsClientConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the CA certificate used to verify the server.
    #[must_use]
    pub fn with_ca_cert(mut self, path: impl AsRef<Path>) -> Self {
        self.ca_cert_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set client certificate and key for mTLS authentication.
    #[must_use]
    pub fn with_client_cert(
        mut self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.as_ref().to_path_buf());
        self.client_key_path = Some(key_path.as_ref().to_path_buf());
        self
    }

    /// Set the server name presented for SNI.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Check if mTLS is configured.
    #[must_use]
    pub fn is_mtls(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }

    /// Resolve the SNI name for a connection to `host`.
    pub fn sni_for(&self, host: &str) -> TlsResult<ServerName<'static>> {
        let name = self.server_name.clone().unwrap_or_else(|| host.to_string());
        ServerName::try_from(name)
            .map_err(|e| TlsError::ConfigError(format!("invalid server name: {}", e)))
    }

    /// Build a `tokio_rustls::TlsConnector` from this configuration.
    pub fn connector(&self) -> TlsResult<TlsConnector> {
        let mut roots = RootCertStore::empty();
        if let Some(ref ca_path) = self.ca_cert_path {
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| TlsError::CertificateError(e.to_string()))?;
            }
        } else {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);

        let config = if self.is_mtls() {
            let cert_path = self
                .client_cert_path
                .as_ref()
                .ok_or_else(|| TlsError::ConfigError("missing client certificate".into()))?;
            let key_path = self
                .client_key_path
                .as_ref()
                .ok_or_else(|| TlsError::ConfigError("missing client key".into()))?;
            let certs = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TlsError::KeyError(e.to_string()))?
        } else {
            builder.with_no_client_auth()
        };

        Ok(TlsConnector::from(Arc::new(config)))
    }
}

fn load_certs(path: &Path) -> TlsResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TlsError::CertificateError(format!("{}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateError(format!("{}: {}", path.display(), e)))
}

fn load_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
    let file =
        File::open(path).map_err(|e| TlsError::KeyError(format!("{}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::KeyError(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| TlsError::KeyError(format!("{}: no private key found", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_plain() {
        let config = TlsClientConfig::new();
        assert!(config.ca_cert_path.is_none());
        assert!(!config.is_mtls());
    }

    #[test]
    fn mtls_requires_both_cert_and_key() {
        let config = TlsClientConfig::new().with_client_cert("client.pem", "client-key.pem");
        assert!(config.is_mtls());
    }

    #[test]
    fn sni_prefers_explicit_server_name() {
        let config = TlsClientConfig::new().with_server_name("lance.internal");
        let name = config.sni_for("10.0.10.11").ok();
        assert!(name.is_some());
    }
}
