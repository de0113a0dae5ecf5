//! TLS termination material.
//!
//! Builds one rustls `ServerConfig` per TLS options name from the snapshot:
//! certificates are loaded from PEM files, the default store's certificate
//! wins for unmatched names, and ALPN/min-version follow the options entry.

use crate::config::dynamic::{TlsConfiguration, TlsOptions, DEFAULT_TLS_OPTIONS_NAME};
use crate::error::{Error, NetworkErrorKind, Result};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{error, warn};

/// Serves the same certificate chain for every handshake.
struct StaticCertResolver {
    key: Arc<CertifiedKey>,
}

impl ResolvesServerCert for StaticCertResolver {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        Some(self.key.clone())
    }
}

pub struct TlsManager {
    acceptors: HashMap<String, TlsAcceptor>,
}

impl TlsManager {
    /// Build acceptors for every options entry that has usable material.
    pub fn new(tls: &TlsConfiguration) -> Self {
        let mut acceptors = HashMap::new();

        let certified = tls
            .certificates
            .iter()
            .filter_map(|cert| {
                match load_certified_key(&cert.cert_file, &cert.key_file) {
                    Ok(key) => Some(Arc::new(key)),
                    Err(e) => {
                        error!(cert = cert.cert_file.as_str(), "Unable to load certificate: {}", e);
                        None
                    }
                }
            })
            .collect::<Vec<_>>();

        let Some(default_key) = certified.first().cloned() else {
            if !tls.options.is_empty() && !tls.certificates.is_empty() {
                warn!("No usable certificate, TLS termination disabled");
            }
            return Self { acceptors };
        };

        for (name, options) in &tls.options {
            match build_server_config(options, default_key.clone()) {
                Ok(config) => {
                    acceptors.insert(name.clone(), TlsAcceptor::from(Arc::new(config)));
                }
                Err(e) => {
                    error!(options = name.as_str(), "Invalid TLS options: {}", e);
                }
            }
        }

        Self { acceptors }
    }

    /// Acceptor for the given options name; empty falls back to `default`.
    pub fn acceptor(&self, options_name: &str) -> Option<TlsAcceptor> {
        let name = if options_name.is_empty() {
            DEFAULT_TLS_OPTIONS_NAME
        } else {
            options_name
        };
        self.acceptors.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.acceptors.is_empty()
    }
}

fn build_server_config(options: &TlsOptions, key: Arc<CertifiedKey>) -> Result<ServerConfig> {
    let versions: Vec<&'static rustls::SupportedProtocolVersion> =
        match options.min_version.as_deref() {
            None | Some("VersionTLS12") => vec![&rustls::version::TLS12, &rustls::version::TLS13],
            Some("VersionTLS13") => vec![&rustls::version::TLS13],
            Some(other) => {
                return Err(Error::network(
                    format!("unsupported TLS version '{}'", other),
                    NetworkErrorKind::Tls,
                ))
            }
        };

    let mut config = ServerConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&versions)
        .map_err(|e| Error::network(e.to_string(), NetworkErrorKind::Tls))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(StaticCertResolver { key }));

    config.alpn_protocols = options
        .alpn_protocols
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();

    Ok(config)
}

fn load_certified_key(cert_path: &str, key_path: &str) -> Result<CertifiedKey> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))?
        .into_iter()
        .map(rustls::Certificate)
        .collect::<Vec<_>>();
    if certs.is_empty() {
        return Err(Error::network(
            format!("no certificate found in '{}'", cert_path),
            NetworkErrorKind::Tls,
        ));
    }

    let mut key_reader = BufReader::new(File::open(key_path)?);
    let key = rustls_pemfile::read_one(&mut key_reader)?
        .and_then(|item| match item {
            rustls_pemfile::Item::RSAKey(der)
            | rustls_pemfile::Item::PKCS8Key(der)
            | rustls_pemfile::Item::ECKey(der) => Some(rustls::PrivateKey(der)),
            _ => None,
        })
        .ok_or_else(|| {
            Error::network(
                format!("no private key found in '{}'", key_path),
                NetworkErrorKind::Tls,
            )
        })?;

    let signing_key = rustls::sign::any_supported_type(&key)
        .map_err(|e| Error::network(e.to_string(), NetworkErrorKind::Tls))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dynamic::CertificateConfig;

    #[test]
    fn test_manager_without_certificates_has_no_acceptors() {
        let manager = TlsManager::new(&TlsConfiguration::default());
        assert!(manager.is_empty());
        assert!(manager.acceptor("default").is_none());
    }

    #[test]
    fn test_unreadable_certificate_is_skipped() {
        let mut tls = TlsConfiguration::default();
        tls.certificates.push(CertificateConfig {
            cert_file: "/nonexistent/cert.pem".to_string(),
            key_file: "/nonexistent/key.pem".to_string(),
            stores: vec![],
        });
        tls.options
            .insert("default".to_string(), TlsOptions::default());

        let manager = TlsManager::new(&tls);
        assert!(manager.is_empty());
    }
}
