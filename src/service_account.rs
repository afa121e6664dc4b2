//! Service-account token volumes
//!
//! Finds the token secret behind a service account and turns it into a
//! secret volume exposing `token`, `ca.crt` and `namespace` as files.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{KeyToPath, Secret, SecretVolumeSource, Volume};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Secret type of service-account token secrets
pub const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

/// Annotation naming the service account a token secret belongs to
pub const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";

/// Name of the volume carrying the token secret
pub const SERVICE_ACCOUNT_VOLUME_NAME: &str = "serviceaccounttoken";

/// Keys projected from the token secret
pub const SERVICE_ACCOUNT_TOKEN_KEYS: [&str; 3] = ["token", "ca.crt", "namespace"];

/// Trait abstracting the secret listing the resolver needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretClient: Send + Sync {
    /// List all secrets of `secret_type` in `namespace`
    async fn list_secrets_of_type(
        &self,
        namespace: &str,
        secret_type: &str,
    ) -> Result<Vec<Secret>, Error>;
}

/// Real Kubernetes client implementation
pub struct SecretClientImpl {
    client: Client,
}

impl SecretClientImpl {
    /// Create a new SecretClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretClient for SecretClientImpl {
    async fn list_secrets_of_type(
        &self,
        namespace: &str,
        secret_type: &str,
    ) -> Result<Vec<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().fields(&format!("type={secret_type}"));
        Ok(api.list(&lp).await?.items)
    }
}

/// Build the volume projecting a token secret's three keys
pub fn token_volume(secret_name: &str) -> Volume {
    Volume {
        name: SERVICE_ACCOUNT_VOLUME_NAME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            items: Some(
                SERVICE_ACCOUNT_TOKEN_KEYS
                    .iter()
                    .map(|key| KeyToPath {
                        key: key.to_string(),
                        path: key.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Resolves service accounts to mountable token volumes
#[derive(Clone)]
pub struct ServiceAccountVolumeResolver {
    client: Arc<dyn SecretClient>,
}

impl ServiceAccountVolumeResolver {
    /// Create a resolver listing secrets through `client`
    pub fn new(client: Arc<dyn SecretClient>) -> Self {
        Self { client }
    }

    /// Volume for the token secret of `service_account` in `namespace`
    ///
    /// Scans the namespace on every call. `Ok(None)` means no token secret
    /// is annotated for the account; only a failing list call is an error.
    pub async fn volume_for_service_account(
        &self,
        service_account: &str,
        namespace: &str,
    ) -> Result<Option<Volume>, Error> {
        let secrets = self
            .client
            .list_secrets_of_type(namespace, SERVICE_ACCOUNT_TOKEN_TYPE)
            .await
            .map_err(|e| {
                Error::lookup(format!(
                    "failed listing token secrets for service account {service_account} in {namespace}: {e}"
                ))
            })?;

        let secret = secrets.iter().find(|s| {
            s.annotations()
                .get(SERVICE_ACCOUNT_NAME_ANNOTATION)
                .is_some_and(|sa| sa == service_account)
        });

        match secret {
            Some(secret) => {
                let name = secret.name_any();
                debug!(namespace, service_account, secret = %name, "resolved token secret");
                Ok(Some(token_volume(&name)))
            }
            None => {
                debug!(namespace, service_account, "no token secret for service account");
                Ok(None)
            }
        }
    }
}
