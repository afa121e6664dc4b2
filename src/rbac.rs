//! Pod-scoped RBAC credentials
//!
//! Every injected pod gets its own Role and RoleBinding so its sidecar can
//! read exactly one pod's logs and delete exactly these two objects. Names
//! are derived from the pod name, which the API server keeps unique within a
//! namespace.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// API group of Role and RoleBinding
pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Role name for a pod
pub fn role_name(pod_name: &str) -> String {
    format!("role-{pod_name}")
}

/// RoleBinding name for a pod
pub fn role_binding_name(pod_name: &str) -> String {
    format!("role-binding-{pod_name}")
}

/// Build the Role letting a sidecar read its own pod's logs and delete its
/// own RBAC objects
pub fn build_role(namespace: &str, pod_name: &str) -> Role {
    let role = role_name(pod_name);
    let binding = role_binding_name(pod_name);

    Role {
        metadata: ObjectMeta {
            name: Some(role.clone()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["pods".to_string(), "pods/log".to_string()]),
                resource_names: Some(vec![pod_name.to_string()]),
                verbs: vec!["get".to_string()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec![RBAC_API_GROUP.to_string()]),
                resources: Some(vec!["roles".to_string()]),
                resource_names: Some(vec![role]),
                verbs: vec!["delete".to_string()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec![RBAC_API_GROUP.to_string()]),
                resources: Some(vec!["rolebindings".to_string()]),
                resource_names: Some(vec![binding]),
                verbs: vec!["delete".to_string()],
                ..Default::default()
            },
        ]),
    }
}

/// Build the RoleBinding granting the pod's Role to `service_account`
pub fn build_role_binding(namespace: &str, pod_name: &str, service_account: &str) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(role_binding_name(pod_name)),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "Role".to_string(),
            name: role_name(pod_name),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

/// Trait abstracting the RBAC API calls the provisioner makes
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RbacClient: Send + Sync {
    /// Create a Role; an existing Role of the same name is an error
    async fn create_role(&self, namespace: &str, role: &Role) -> Result<(), Error>;

    /// Create a RoleBinding; an existing binding of the same name is an error
    async fn create_role_binding(&self, namespace: &str, binding: &RoleBinding)
        -> Result<(), Error>;

    /// Delete a Role by name
    async fn delete_role(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Delete a RoleBinding by name
    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Set `owner` as the single owner reference of a Role
    async fn set_role_owner(
        &self,
        namespace: &str,
        name: &str,
        owner: &OwnerReference,
    ) -> Result<(), Error>;

    /// Set `owner` as the single owner reference of a RoleBinding
    async fn set_role_binding_owner(
        &self,
        namespace: &str,
        name: &str,
        owner: &OwnerReference,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct RbacClientImpl {
    client: Client,
}

impl RbacClientImpl {
    /// Create a new RbacClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn owner_patch(owner: &OwnerReference) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "ownerReferences": [owner]
        }
    })
}

#[async_trait]
impl RbacClient for RbacClientImpl {
    async fn create_role(&self, namespace: &str, role: &Role) -> Result<(), Error> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), role).await?;
        Ok(())
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), Error> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), binding).await?;
        Ok(())
    }

    async fn delete_role(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn set_role_owner(
        &self,
        namespace: &str,
        name: &str,
        owner: &OwnerReference,
    ) -> Result<(), Error> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(&owner_patch(owner)))
            .await?;
        Ok(())
    }

    async fn set_role_binding_owner(
        &self,
        namespace: &str,
        name: &str,
        owner: &OwnerReference,
    ) -> Result<(), Error> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(&owner_patch(owner)))
            .await?;
        Ok(())
    }
}

/// The RBAC objects created for one pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodCredentials {
    /// Namespace holding both objects
    pub namespace: String,
    /// Name of the Role
    pub role_name: String,
    /// Name of the RoleBinding
    pub role_binding_name: String,
}

impl PodCredentials {
    /// Credentials naming the objects for `pod_name` in `namespace`
    pub fn for_pod(namespace: &str, pod_name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            role_name: role_name(pod_name),
            role_binding_name: role_binding_name(pod_name),
        }
    }
}

/// Issues, revokes and hands ownership of pod-scoped RBAC credentials
#[derive(Clone)]
pub struct CredentialProvisioner {
    client: Arc<dyn RbacClient>,
    service_account: String,
}

impl CredentialProvisioner {
    /// Create a provisioner binding roles to `service_account`
    pub fn new(client: Arc<dyn RbacClient>, service_account: impl Into<String>) -> Self {
        Self {
            client,
            service_account: service_account.into(),
        }
    }

    /// Create the Role, then the RoleBinding, for a pod
    ///
    /// No binding is attempted when the Role cannot be created. When the
    /// binding fails, the freshly created Role is deleted again before the
    /// error is returned.
    pub async fn provision(&self, namespace: &str, pod_name: &str) -> Result<PodCredentials, Error> {
        let credentials = PodCredentials::for_pod(namespace, pod_name);

        let role = build_role(namespace, pod_name);
        self.client
            .create_role(namespace, &role)
            .await
            .map_err(|e| {
                Error::provisioning_caused_by(
                    format!("failed creating RBAC role {}: {}", credentials.role_name, e),
                    e,
                )
            })?;
        debug!(namespace, role = %credentials.role_name, "created role");

        let binding = build_role_binding(namespace, pod_name, &self.service_account);
        if let Err(e) = self.client.create_role_binding(namespace, &binding).await {
            if let Err(cleanup) = self
                .client
                .delete_role(namespace, &credentials.role_name)
                .await
            {
                warn!(
                    namespace,
                    role = %credentials.role_name,
                    error = %cleanup,
                    "failed to delete role after role binding creation failed"
                );
            }
            return Err(Error::provisioning_caused_by(
                format!(
                    "failed creating RBAC role binding {}: {}",
                    credentials.role_binding_name, e
                ),
                e,
            ));
        }

        info!(
            namespace,
            role = %credentials.role_name,
            role_binding = %credentials.role_binding_name,
            service_account = %self.service_account,
            "provisioned pod credentials"
        );
        Ok(credentials)
    }

    /// Delete a pod's RoleBinding and Role
    ///
    /// Best-effort: both deletes are attempted and failures are logged.
    /// Returns true when both objects are gone.
    pub async fn revoke(&self, credentials: &PodCredentials) -> bool {
        let ns = credentials.namespace.as_str();
        let mut clean = true;

        match self
            .client
            .delete_role_binding(ns, &credentials.role_binding_name)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                clean = false;
                warn!(namespace = ns, role_binding = %credentials.role_binding_name, error = %e, "failed to revoke role binding");
            }
        }

        match self.client.delete_role(ns, &credentials.role_name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                clean = false;
                warn!(namespace = ns, role = %credentials.role_name, error = %e, "failed to revoke role");
            }
        }

        if clean {
            info!(namespace = ns, role = %credentials.role_name, "revoked pod credentials");
        }
        clean
    }

    /// Make `owner` the owner of a pod's Role and RoleBinding so garbage
    /// collection removes them with the pod
    ///
    /// Objects that no longer exist are skipped.
    pub async fn adopt(
        &self,
        credentials: &PodCredentials,
        owner: &OwnerReference,
    ) -> Result<(), Error> {
        let ns = credentials.namespace.as_str();

        match self
            .client
            .set_role_owner(ns, &credentials.role_name, owner)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(namespace = ns, role = %credentials.role_name, "role already gone");
            }
            Err(e) => return Err(e),
        }

        match self
            .client
            .set_role_binding_owner(ns, &credentials.role_binding_name, owner)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(namespace = ns, role_binding = %credentials.role_binding_name, "role binding already gone");
            }
            Err(e) => return Err(e),
        }

        Ok(())
    }
}
