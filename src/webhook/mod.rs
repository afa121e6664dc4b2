//! Mutating admission webhook
//!
//! A thin HTTPS adapter in front of a [`PodMutator`]: the API server posts
//! AdmissionReviews for pod creation in the watched namespace to
//! `/mutate-pods` and receives either a denial or a JSON patch adding the
//! log-forwarding sidecar.

pub mod pod;
pub mod registration;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

use crate::config::WebhookServerConfig;
use crate::mutation::PodMutator;
use crate::Error;

/// Path the API server posts pod AdmissionReviews to
pub const MUTATE_PODS_PATH: &str = "/mutate-pods";

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    /// Mutation applied to every admitted pod
    pub mutator: Arc<dyn PodMutator>,
}

impl WebhookState {
    /// Create a new webhook state around `mutator`
    pub fn new(mutator: Arc<dyn PodMutator>) -> Self {
        Self { mutator }
    }
}

/// Create the webhook router
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(MUTATE_PODS_PATH, post(pod::mutate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Serve the webhook over TLS until the server stops
pub async fn serve(config: &WebhookServerConfig, state: Arc<WebhookState>) -> Result<(), Error> {
    let tls_config = RustlsConfig::from_pem_file(&config.tls_cert_path, &config.tls_key_path)
        .await
        .map_err(|e| Error::tls(format!("failed to load webhook certificate: {e}")))?;

    info!(addr = %config.listen_addr, namespace = %config.namespace, "starting admission webhook");

    axum_server::bind_rustls(config.listen_addr, tls_config)
        .serve(webhook_router(state).into_make_service())
        .await
        .map_err(|e| Error::config(format!("webhook server error: {e}")))
}
