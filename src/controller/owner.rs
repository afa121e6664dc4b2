//! Owner-reference reconciler for injected pods

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument};

use crate::rbac::{CredentialProvisioner, PodCredentials};
use crate::Error;

/// Controller context
pub struct Context {
    /// Provisioner used to hand the pod's credentials to the pod
    pub provisioner: CredentialProvisioner,
}

impl Context {
    /// Create a context around `provisioner`
    pub fn new(provisioner: CredentialProvisioner) -> Self {
        Self { provisioner }
    }
}

/// Owner reference pointing at `pod`, or None when the pod has no uid yet
pub fn owner_reference(pod: &Pod) -> Option<OwnerReference> {
    let uid = pod.metadata.uid.clone()?;
    Some(OwnerReference {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        name: pod.name_any(),
        uid,
        controller: Some(false),
        block_owner_deletion: Some(false),
    })
}

/// Reconcile an injected pod by making it the owner of its credentials
#[instrument(skip(pod, ctx), fields(pod = %pod.name_any()))]
pub async fn reconcile(pod: Arc<Pod>, ctx: Arc<Context>) -> Result<Action, Error> {
    if pod.metadata.deletion_timestamp.is_some() {
        debug!("pod is terminating, skipping");
        return Ok(Action::await_change());
    }
    let Some(owner) = owner_reference(&pod) else {
        debug!("pod has no uid yet");
        return Ok(Action::await_change());
    };
    let namespace = pod.namespace().unwrap_or_default();
    let credentials = PodCredentials::for_pod(&namespace, &pod.name_any());

    ctx.provisioner.adopt(&credentials, &owner).await?;
    info!(namespace = %namespace, role = %credentials.role_name, "credentials owned by pod");
    Ok(Action::await_change())
}

/// Error policy for the owner controller
pub fn error_policy(pod: Arc<Pod>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        pod = %pod.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}
