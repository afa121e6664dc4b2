//! mTLS configuration for the ingestion connection
//!
//! The relay presents the client certificate from the mounted secret and
//! verifies the ingestion endpoint against the mounted CA.

use std::path::Path;

use tonic::transport::{Certificate, ClientTlsConfig, Identity};

use crate::config::IngestionConfig;
use crate::Error;

/// Client-side mTLS configuration
#[derive(Clone, Debug)]
pub struct ClientMtlsConfig {
    /// Client certificate PEM
    pub client_cert_pem: String,
    /// Client private key PEM
    pub client_key_pem: String,
    /// CA certificate PEM for verifying the server
    pub ca_cert_pem: String,
    /// Server domain name for verification
    pub server_domain: String,
}

impl ClientMtlsConfig {
    /// Create a new client mTLS config
    pub fn new(
        client_cert_pem: String,
        client_key_pem: String,
        ca_cert_pem: String,
        server_domain: String,
    ) -> Self {
        Self {
            client_cert_pem,
            client_key_pem,
            ca_cert_pem,
            server_domain,
        }
    }

    /// Load the three PEM files named by `config`
    pub async fn load(config: &IngestionConfig) -> Result<Self, Error> {
        Ok(Self::new(
            read_pem(&config.cert_path, "client certificate").await?,
            read_pem(&config.key_path, "client key").await?,
            read_pem(&config.ca_path, "CA certificate").await?,
            config.server_name.clone(),
        ))
    }

    /// Build a tonic ClientTlsConfig
    pub fn to_tonic_config(&self) -> ClientTlsConfig {
        let identity = Identity::from_pem(&self.client_cert_pem, &self.client_key_pem);
        let ca_cert = Certificate::from_pem(&self.ca_cert_pem);

        ClientTlsConfig::new()
            .identity(identity)
            .ca_certificate(ca_cert)
            .domain_name(&self.server_domain)
    }
}

async fn read_pem(path: &Path, what: &str) -> Result<String, Error> {
    let pem = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::tls(format!("failed to read {what} {}: {e}", path.display())))?;
    if !pem.contains("-----BEGIN") {
        return Err(Error::tls(format!(
            "{what} {} is not PEM encoded",
            path.display()
        )));
    }
    Ok(pem)
}
