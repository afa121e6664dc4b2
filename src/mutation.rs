//! Pod mutation
//!
//! [`PodMutator`] is the transport-independent contract of the admission
//! path: a candidate pod goes in, the pod that should be scheduled comes
//! out. [`PodMutationHandler`] implements it by provisioning the pod's
//! credentials, resolving the optional token volume and composing the
//! sidecar. [`review`] adapts a mutator to Kubernetes admission requests.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::InjectorConfig;
use crate::rbac::{CredentialProvisioner, PodCredentials};
use crate::service_account::ServiceAccountVolumeResolver;
use crate::sidecar::SidecarComposer;
use crate::Error;

/// What the mutator knows about the admission request besides the pod
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdmissionContext {
    /// Request uid, for log correlation
    pub uid: String,
    /// Namespace the pod is being created in
    pub namespace: String,
    /// Dry-run requests must not touch cluster state
    pub dry_run: bool,
}

impl AdmissionContext {
    /// Context for `request`, taking the namespace from the request and
    /// falling back to the pod's own metadata
    pub fn from_request(request: &AdmissionRequest<Pod>) -> Self {
        let namespace = request
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .or_else(|| {
                request
                    .object
                    .as_ref()
                    .and_then(|pod| pod.metadata.namespace.clone())
            })
            .unwrap_or_default();
        Self {
            uid: request.uid.clone(),
            namespace,
            dry_run: request.dry_run,
        }
    }
}

/// Mutates candidate pods at admission time
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodMutator: Send + Sync {
    /// Return the pod that should be admitted in place of `pod`
    async fn mutate(&self, context: &AdmissionContext, pod: &Pod) -> Result<Pod, Error>;
}

/// Injects the log-forwarding sidecar and provisions what it needs
pub struct PodMutationHandler {
    provisioner: CredentialProvisioner,
    resolver: ServiceAccountVolumeResolver,
    composer: SidecarComposer,
    config: InjectorConfig,
}

impl PodMutationHandler {
    /// Create a handler from its collaborators and the injector configuration
    pub fn new(
        provisioner: CredentialProvisioner,
        resolver: ServiceAccountVolumeResolver,
        config: InjectorConfig,
    ) -> Self {
        Self {
            provisioner,
            resolver,
            composer: SidecarComposer::new(config.clone()),
            config,
        }
    }
}

#[async_trait]
impl PodMutator for PodMutationHandler {
    #[instrument(skip(self, pod), fields(uid = %context.uid, namespace = %context.namespace))]
    async fn mutate(&self, context: &AdmissionContext, pod: &Pod) -> Result<Pod, Error> {
        let pod = named_pod(context, pod)?;
        let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
        if context.namespace.is_empty() {
            return Err(Error::invalid_request(format!(
                "no namespace for pod {pod_name}"
            )));
        }

        let credentials = if context.dry_run {
            debug!(pod = %pod_name, "dry run, skipping credential provisioning");
            PodCredentials::for_pod(&context.namespace, pod_name)
        } else {
            self.provisioner
                .provision(&context.namespace, pod_name)
                .await?
        };

        let token_volume = if self.config.mount_service_account_token {
            match self
                .resolver
                .volume_for_service_account(&self.config.service_account_name, &context.namespace)
                .await
            {
                Ok(Some(volume)) => Some(volume),
                Ok(None) => {
                    warn!(
                        pod = %pod_name,
                        service_account = %self.config.service_account_name,
                        "no token secret found, sidecar will run without a mounted token"
                    );
                    None
                }
                Err(e) => {
                    if !context.dry_run {
                        self.provisioner.revoke(&credentials).await;
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        let mutated = self
            .composer
            .compose(&pod, &context.namespace, &credentials, token_volume);
        info!(pod = %pod_name, "composed sidecar");
        Ok(mutated)
    }
}

/// Alphanumerics of the request uid used to complete a generated pod name
const GENERATED_SUFFIX_LEN: usize = 8;

/// `pod` with its final name set
///
/// Controller-created pods carry only `generateName` at admission time. The
/// name is completed here from the request uid so the pod-scoped Role and
/// RoleBinding can be named after the pod; the API server keeps a name that
/// is already set.
fn named_pod(context: &AdmissionContext, pod: &Pod) -> Result<Pod, Error> {
    if pod.metadata.name.as_deref().is_some_and(|n| !n.is_empty()) {
        return Ok(pod.clone());
    }

    let prefix = pod
        .metadata
        .generate_name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::invalid_request("pod has neither name nor generateName"))?;
    let suffix = generated_suffix(&context.uid).ok_or_else(|| {
        Error::invalid_request(format!(
            "request uid {:?} is too short to name pod {prefix}*",
            context.uid
        ))
    })?;

    let mut named = pod.clone();
    named.metadata.name = Some(format!("{prefix}{suffix}"));
    debug!(uid = %context.uid, pod = ?named.metadata.name, "named generated pod");
    Ok(named)
}

/// Last [`GENERATED_SUFFIX_LEN`] alphanumerics of `uid`, lowercased
fn generated_suffix(uid: &str) -> Option<String> {
    let chars: Vec<char> = uid
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let start = chars.len().checked_sub(GENERATED_SUFFIX_LEN)?;
    Some(chars[start..].iter().collect())
}

/// Answer an admission request using `mutator`
///
/// A request without a pod is denied with a client error. A failing
/// mutation is denied with the error's message and code. Otherwise the
/// response carries a JSON patch from the submitted pod to the mutated one.
pub async fn review(mutator: &dyn PodMutator, request: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let context = AdmissionContext::from_request(request);

    let Some(pod) = request.object.as_ref() else {
        return deny(
            request,
            &Error::invalid_request("no pod could be decoded from the request"),
        );
    };

    let mutated = match mutator.mutate(&context, pod).await {
        Ok(mutated) => mutated,
        Err(e) => {
            error!(uid = %context.uid, error = %e, "pod mutation failed");
            return deny(request, &e);
        }
    };

    let patch = match (serde_json::to_value(pod), serde_json::to_value(&mutated)) {
        (Ok(original), Ok(mutated)) => json_patch::diff(&original, &mutated),
        (Err(e), _) | (_, Err(e)) => {
            return deny(request, &Error::serialization(e.to_string()));
        }
    };

    debug!(uid = %context.uid, ops = patch.0.len(), "returning pod patch");
    match AdmissionResponse::from(request).with_patch(patch) {
        Ok(response) => response,
        Err(e) => deny(request, &Error::serialization(e.to_string())),
    }
}

fn deny(request: &AdmissionRequest<Pod>, err: &Error) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(request).deny(err.to_string());
    response.result.code = err.status_code();
    response
}
