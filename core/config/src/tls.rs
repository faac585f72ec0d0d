// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod provider;

use std::path::Path;
use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("invalid pem format: {0}")]
    InvalidPem(#[from] rustls_pki_types::pem::Error),
    #[error("missing server cert and key. cert_file and key_file must be set")]
    MissingServerCertAndKey,
    #[error("missing ca_file for client tls")]
    MissingCa,
    #[error("no certificate found in {0}")]
    EmptyCertFile(String),
    #[error("invalid server name: {0}")]
    InvalidServerName(String),
    #[error("root store error: {0}")]
    RootStore(rustls::Error),
    #[error("config builder error: {0}")]
    ConfigBuilder(rustls::Error),
}

/// TLS settings shared by the listening and dialing side of an endpoint.
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// Path to the PEM certificate chain presented by the listener
    #[serde(default)]
    pub cert_file: Option<String>,
    /// Path to the PEM private key of the listener
    #[serde(default)]
    pub key_file: Option<String>,
    /// Path to the PEM CA bundle used to verify the remote listener
    #[serde(default)]
    pub ca_file: Option<String>,
    /// Name checked against the remote certificate when dialing
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

fn default_server_name() -> String {
    "localhost".to_string()
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            cert_file: None,
            key_file: None,
            ca_file: None,
            server_name: default_server_name(),
        }
    }
}

impl TlsConfig {
    pub fn with_server_identity(mut self, cert_file: &str, key_file: &str) -> Self {
        self.cert_file = Some(cert_file.to_string());
        self.key_file = Some(key_file.to_string());
        self
    }

    pub fn with_ca_file(mut self, ca_file: &str) -> Self {
        self.ca_file = Some(ca_file.to_string());
        self
    }

    pub fn with_server_name(mut self, server_name: &str) -> Self {
        self.server_name = server_name.to_string();
        self
    }

    pub fn has_server_identity(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }

    pub fn load_server_config(&self) -> Result<Arc<ServerConfig>, TlsError> {
        let (cert_file, key_file) = match (&self.cert_file, &self.key_file) {
            (Some(c), Some(k)) => (c, k),
            _ => return Err(TlsError::MissingServerCertAndKey),
        };

        let certs = load_certs(cert_file)?;
        let key = PrivateKeyDer::from_pem_file(Path::new(key_file))?;

        let config = ServerConfig::builder_with_provider(provider::crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(TlsError::ConfigBuilder)?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(TlsError::ConfigBuilder)?;

        Ok(Arc::new(config))
    }

    pub fn load_client_config(&self) -> Result<Arc<ClientConfig>, TlsError> {
        let ca_file = self.ca_file.as_ref().ok_or(TlsError::MissingCa)?;

        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_file)? {
            roots.add(cert).map_err(TlsError::RootStore)?;
        }

        let config = ClientConfig::builder_with_provider(provider::crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(TlsError::ConfigBuilder)?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Arc::new(config))
    }

    pub fn server_name(&self) -> Result<ServerName<'static>, TlsError> {
        ServerName::try_from(self.server_name.clone())
            .map_err(|_| TlsError::InvalidServerName(self.server_name.clone()))
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = CertificateDer::pem_file_iter(Path::new(path))?.collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::EmptyCertFile(path.to_string()));
    }
    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;

    static TEST_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/tls");

    fn path(name: &str) -> String {
        format!("{}/{}", TEST_PATH, name)
    }

    #[test]
    fn test_server_config_requires_identity() {
        let err = TlsConfig::default().load_server_config().unwrap_err();
        assert!(matches!(err, TlsError::MissingServerCertAndKey));
    }

    #[test]
    fn test_client_config_requires_ca() {
        let err = TlsConfig::default().load_client_config().unwrap_err();
        assert!(matches!(err, TlsError::MissingCa));
    }

    #[test]
    fn test_load_server_and_client() {
        let cfg = TlsConfig::default()
            .with_server_identity(&path("server.crt"), &path("server.key"))
            .with_ca_file(&path("ca.pem"));
        assert!(cfg.has_server_identity());
        assert!(cfg.load_server_config().is_ok());
        assert!(cfg.load_client_config().is_ok());
        assert!(cfg.server_name().is_ok());
    }

    #[test]
    fn test_missing_file() {
        let cfg = TlsConfig::default().with_ca_file(&path("does-not-exist.pem"));
        assert!(matches!(
            cfg.load_client_config().unwrap_err(),
            TlsError::InvalidPem(_)
        ));
    }
}
