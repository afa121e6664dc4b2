//! Process configuration
//!
//! Every value the injector and the relay need is gathered here once at
//! startup (see `main.rs`) and passed into component constructors. Nothing
//! below the binary reads the process environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::Error;

/// Image used for the sidecar when no override is configured
pub const DEFAULT_SIDECAR_IMAGE: &str = "ghcr.io/loglet/loglet:latest";

/// Service account bound to the pod-scoped role when none is configured
pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";

/// Port the admission webhook listens on by default
pub const DEFAULT_WEBHOOK_PORT: u16 = 3000;

/// TLS server name expected on the ingestion endpoint's certificate
pub const DEFAULT_INGESTION_SERVER_NAME: &str = "metron";

/// Configuration for the admission-time injection path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InjectorConfig {
    /// Image for the injected sidecar container
    pub sidecar_image: String,
    /// Ingestion endpoint (`host:port`) written into the sidecar environment
    pub ingestion_endpoint: String,
    /// Name of the secret holding the ingestion CA, certificate and key.
    /// May be empty, in which case the secret volume names no secret.
    pub cert_secret_name: String,
    /// Service account the pod-scoped role is bound to
    pub service_account_name: String,
    /// Whether to resolve and mount the service account's token secret
    pub mount_service_account_token: bool,
    /// Cluster name placed in every forwarded record's tags
    pub cluster_name: String,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            sidecar_image: DEFAULT_SIDECAR_IMAGE.to_string(),
            ingestion_endpoint: String::new(),
            cert_secret_name: String::new(),
            service_account_name: DEFAULT_SERVICE_ACCOUNT.to_string(),
            mount_service_account_token: false,
            cluster_name: String::new(),
        }
    }
}

impl InjectorConfig {
    /// Use `image` as the sidecar image, falling back to the default when empty
    pub fn with_sidecar_image(mut self, image: Option<String>) -> Self {
        self.sidecar_image = image
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| DEFAULT_SIDECAR_IMAGE.to_string());
        self
    }
}

/// Configuration for the webhook server process
#[derive(Clone, Debug)]
pub struct WebhookServerConfig {
    /// Namespace whose pods receive the sidecar
    pub namespace: String,
    /// Address the HTTPS server binds to
    pub listen_addr: SocketAddr,
    /// PEM certificate served by the webhook
    pub tls_cert_path: PathBuf,
    /// PEM private key for `tls_cert_path`
    pub tls_key_path: PathBuf,
    /// Registration of the MutatingWebhookConfiguration, if enabled
    pub registration: Option<WebhookRegistration>,
}

/// How the webhook registers itself with the API server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookRegistration {
    /// Name of the Service fronting the webhook
    pub service_name: String,
    /// Namespace of that Service
    pub service_namespace: String,
    /// Service port
    pub service_port: i32,
    /// CA bundle that signed the webhook's serving certificate
    pub ca_bundle_path: PathBuf,
}

/// Configuration for one relay run inside the sidecar
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayConfig {
    /// Namespace of the followed pod
    pub namespace: String,
    /// Followed pod
    pub pod_name: String,
    /// Followed container
    pub container: String,
    /// Source identifier for records (the pod's `guid` label)
    pub source_id: String,
    /// Instance identifier for records
    pub instance_id: String,
    /// Normalized `source_type` tag
    pub source_type: String,
    /// Cluster tag
    pub cluster: String,
    /// Explicit kubeconfig; in-cluster config when absent
    pub kubeconfig: Option<PathBuf>,
    /// Ingestion transport settings
    pub ingestion: IngestionConfig,
}

impl RelayConfig {
    /// Reject configurations that cannot name a log stream
    pub fn validate(&self) -> Result<(), Error> {
        for (field, value) in [
            ("namespace", &self.namespace),
            ("pod name", &self.pod_name),
            ("container", &self.container),
        ] {
            if value.is_empty() {
                return Err(Error::config(format!("relay {field} must not be empty")));
            }
        }
        self.ingestion.validate()
    }
}

/// Ingestion client settings: one endpoint and three PEM file paths
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngestionConfig {
    /// Endpoint address (`host:port`)
    pub endpoint: String,
    /// CA certificate used to verify the endpoint
    pub ca_path: PathBuf,
    /// Client certificate
    pub cert_path: PathBuf,
    /// Client private key
    pub key_path: PathBuf,
    /// Expected server name on the endpoint certificate
    pub server_name: String,
    /// How often buffered records are flushed
    pub flush_interval: Duration,
    /// Records per batch before an early flush
    pub batch_size: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            ca_path: PathBuf::new(),
            cert_path: PathBuf::new(),
            key_path: PathBuf::new(),
            server_name: DEFAULT_INGESTION_SERVER_NAME.to_string(),
            flush_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

impl IngestionConfig {
    fn validate(&self) -> Result<(), Error> {
        if self.endpoint.is_empty() {
            return Err(Error::config("ingestion endpoint must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(Error::config("ingestion batch size must be at least 1"));
        }
        Ok(())
    }
}
