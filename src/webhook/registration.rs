//! MutatingWebhookConfiguration for pod injection
//!
//! Registers the webhook with the API server so pod creation in the watched
//! namespace is routed to [`MUTATE_PODS_PATH`].
//!
//! The webhook fails closed: every pod created in the namespace, including
//! controller-created pods that only carry `generateName`, must pass through
//! the injector. Those pods are named by the injector (see
//! [`PodMutator`](crate::mutation::PodMutator)), so an unreachable webhook or
//! a failed RBAC create blocks pod creation rather than admitting a pod
//! without its forwarder.

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::Client;
use tracing::info;

use super::MUTATE_PODS_PATH;
use crate::config::WebhookRegistration;
use crate::Error;

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "loglet-webhook";

/// Name of the MutatingWebhookConfiguration object
pub const WEBHOOK_CONFIG_NAME: &str = "loglet-pod-injector";

/// Name of the webhook inside the configuration
pub const WEBHOOK_NAME: &str = "pods.loglet.dev";

/// Label every namespace carries with its own name
pub const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

/// Build the MutatingWebhookConfiguration routing pod creation in
/// `namespace` to the webhook service
pub fn build_webhook_config(
    registration: &WebhookRegistration,
    namespace: &str,
    ca_bundle: Vec<u8>,
) -> MutatingWebhookConfiguration {
    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(WEBHOOK_CONFIG_NAME.to_string()),
            ..Default::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: WEBHOOK_NAME.to_string(),
            admission_review_versions: vec!["v1".to_string()],
            // Dry-run requests never create RBAC objects
            side_effects: "NoneOnDryRun".to_string(),
            failure_policy: Some("Fail".to_string()),
            match_policy: Some("Equivalent".to_string()),
            reinvocation_policy: Some("Never".to_string()),
            rules: Some(vec![RuleWithOperations {
                operations: Some(vec!["CREATE".to_string()]),
                api_groups: Some(vec![String::new()]),
                api_versions: Some(vec!["v1".to_string()]),
                resources: Some(vec!["pods".to_string()]),
                scope: Some("Namespaced".to_string()),
            }]),
            client_config: WebhookClientConfig {
                service: Some(ServiceReference {
                    name: registration.service_name.clone(),
                    namespace: registration.service_namespace.clone(),
                    path: Some(MUTATE_PODS_PATH.to_string()),
                    port: Some(registration.service_port),
                }),
                ca_bundle: Some(k8s_openapi::ByteString(ca_bundle)),
                ..Default::default()
            },
            namespace_selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    NAMESPACE_NAME_LABEL.to_string(),
                    namespace.to_string(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }]),
    }
}

/// Ensure the MutatingWebhookConfiguration for pod injection is installed
pub async fn ensure_webhook_config(
    client: &Client,
    registration: &WebhookRegistration,
    namespace: &str,
) -> Result<(), Error> {
    let ca_bundle = tokio::fs::read(&registration.ca_bundle_path)
        .await
        .map_err(|e| {
            Error::config(format!(
                "failed to read webhook CA bundle {}: {e}",
                registration.ca_bundle_path.display()
            ))
        })?;

    let webhook_config = build_webhook_config(registration, namespace, ca_bundle);
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let webhooks: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    webhooks
        .patch(WEBHOOK_CONFIG_NAME, &params, &Patch::Apply(&webhook_config))
        .await?;

    info!(
        name = WEBHOOK_CONFIG_NAME,
        namespace,
        service = %registration.service_name,
        "Webhook configuration installed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn registration() -> WebhookRegistration {
        WebhookRegistration {
            service_name: "loglet-webhook".to_string(),
            service_namespace: "loglet-system".to_string(),
            service_port: 443,
            ca_bundle_path: PathBuf::from("/etc/loglet/ca.crt"),
        }
    }

    /// Story: only pod creation in the watched namespace reaches the webhook
    #[test]
    fn story_webhook_scoped_to_pod_creation_in_namespace() {
        let config = build_webhook_config(&registration(), "apps", b"CA".to_vec());
        let webhook = &config.webhooks.unwrap()[0];

        let rule = &webhook.rules.as_ref().unwrap()[0];
        assert_eq!(rule.operations, Some(vec!["CREATE".to_string()]));
        assert_eq!(rule.api_groups, Some(vec![String::new()]));
        assert_eq!(rule.resources, Some(vec!["pods".to_string()]));

        let selector = webhook.namespace_selector.as_ref().unwrap();
        assert_eq!(
            selector.match_labels.as_ref().unwrap().get(NAMESPACE_NAME_LABEL),
            Some(&"apps".to_string())
        );
    }

    /// Story: the API server reaches the service at the mutate path with our CA
    #[test]
    fn story_webhook_points_at_service() {
        let config = build_webhook_config(&registration(), "apps", b"CA".to_vec());
        let webhook = &config.webhooks.unwrap()[0];

        let service = webhook.client_config.service.as_ref().unwrap();
        assert_eq!(service.name, "loglet-webhook");
        assert_eq!(service.namespace, "loglet-system");
        assert_eq!(service.path.as_deref(), Some(MUTATE_PODS_PATH));
        assert_eq!(service.port, Some(443));
        assert_eq!(
            webhook.client_config.ca_bundle.as_ref().unwrap().0,
            b"CA".to_vec()
        );
    }

    #[test]
    fn test_side_effects_allow_dry_run() {
        let config = build_webhook_config(&registration(), "apps", vec![]);
        let webhook = &config.webhooks.unwrap()[0];
        assert_eq!(webhook.side_effects, "NoneOnDryRun");
        assert_eq!(webhook.failure_policy.as_deref(), Some("Fail"));
        assert_eq!(webhook.admission_review_versions, vec!["v1".to_string()]);
    }
}
