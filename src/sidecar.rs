//! Sidecar composition
//!
//! Turns a candidate pod into the pod that should actually be scheduled: the
//! certificate secret volume (and optionally a service-account token volume)
//! appended to its volumes, and the log-forwarding sidecar appended to its
//! containers. Composition is pure data transformation and cannot fail.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, ExecAction, KeyToPath, Lifecycle, LifecycleHandler, Pod, SecretVolumeSource,
    Volume, VolumeMount,
};

use crate::config::InjectorConfig;
use crate::rbac::PodCredentials;

/// Name of the injected container
pub const SIDECAR_CONTAINER_NAME: &str = "loglet-forwarder";

/// Argument selecting the relay mode of the loglet binary
pub const RELAY_SUBCOMMAND: &str = "relay";

/// Name of the certificate secret volume
pub const CERT_VOLUME_NAME: &str = "loglet-secrets";

/// Mount path of the certificate secret volume
pub const CERT_MOUNT_PATH: &str = "/secrets";

/// Secret key holding the ingestion CA certificate
pub const CA_CERT_KEY: &str = "internal-ca-cert";

/// Secret key holding the client certificate
pub const FORWARD_CERT_KEY: &str = "forward-cert";

/// Secret key holding the client private key
pub const FORWARD_CERT_KEY_KEY: &str = "forward-cert-key";

/// Mount path of the service-account token volume. In-cluster config reads
/// the token and CA from here.
pub const SERVICE_ACCOUNT_MOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Label marking pods that carry the sidecar
pub const INJECTED_LABEL: &str = "loglet.dev/injected";

/// Pod label carrying the application's source type
pub const SOURCE_TYPE_LABEL: &str = "source_type";

/// Pod label carrying the application's guid
pub const GUID_LABEL: &str = "guid";

/// Environment variables the composer writes and the relay reads
pub mod env {
    /// Namespace of the followed pod
    pub const NAMESPACE: &str = "LOGLET_NAMESPACE";
    /// Followed pod
    pub const POD_NAME: &str = "LOGLET_POD_NAME";
    /// Followed container
    pub const CONTAINER: &str = "LOGLET_CONTAINER";
    /// Ingestion CA certificate path
    pub const CA_PATH: &str = "LOGLET_CA_PATH";
    /// Ingestion client certificate path
    pub const CERT_PATH: &str = "LOGLET_CERT_PATH";
    /// Ingestion client key path
    pub const KEY_PATH: &str = "LOGLET_CERT_KEY_PATH";
    /// Ingestion endpoint
    pub const ENDPOINT: &str = "LOGLET_ENDPOINT";
    /// Record source id
    pub const SOURCE_ID: &str = "LOGLET_SOURCE_ID";
    /// Record instance id
    pub const INSTANCE_ID: &str = "LOGLET_INSTANCE_ID";
    /// Record source type tag
    pub const SOURCE_TYPE: &str = "LOGLET_SOURCE_TYPE";
    /// Record cluster tag
    pub const CLUSTER: &str = "LOGLET_CLUSTER";
}

/// Map a pod's `source_type` label to the tag value the ingestion side
/// expects. Only `APP` is rewritten.
pub fn normalize_source_type(source_type: &str) -> String {
    match source_type {
        "APP" => "APP/PROC/WEB".to_string(),
        other => other.to_string(),
    }
}

/// Secret volume exposing the ingestion CA, certificate and key
///
/// An empty `secret_name` still yields the three keys, backed by no secret.
pub fn cert_volume(secret_name: &str) -> Volume {
    Volume {
        name: CERT_VOLUME_NAME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            items: Some(
                [CA_CERT_KEY, FORWARD_CERT_KEY, FORWARD_CERT_KEY_KEY]
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

/// Shell command that deletes a pod's role and then its role binding
pub fn cleanup_command(credentials: &PodCredentials) -> Vec<String> {
    let ns = &credentials.namespace;
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!(
            "kubectl delete role {} -n {ns} && kubectl delete rolebinding {} -n {ns}",
            credentials.role_name, credentials.role_binding_name
        ),
    ]
}

fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn cert_file(key: &str) -> String {
    format!("{CERT_MOUNT_PATH}/{key}")
}

/// Builds the sidecar and the mutated pod
#[derive(Clone, Debug)]
pub struct SidecarComposer {
    config: InjectorConfig,
}

impl SidecarComposer {
    /// Create a composer from the injector configuration
    pub fn new(config: InjectorConfig) -> Self {
        Self { config }
    }

    /// The sidecar container for `pod`
    ///
    /// The first container of `pod` is taken to be the application whose
    /// logs are followed.
    pub fn sidecar_container(
        &self,
        pod: &Pod,
        namespace: &str,
        credentials: &PodCredentials,
        token_volume: Option<&Volume>,
    ) -> Container {
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let primary = pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .map(|c| c.name.clone())
            .unwrap_or_default();
        let labels = pod.metadata.labels.as_ref();

        let mut env = vec![
            env_var(env::NAMESPACE, namespace),
            env_var(env::POD_NAME, pod_name.clone()),
            env_var(env::CONTAINER, primary),
            env_var(env::CA_PATH, cert_file(CA_CERT_KEY)),
            env_var(env::CERT_PATH, cert_file(FORWARD_CERT_KEY)),
            env_var(env::KEY_PATH, cert_file(FORWARD_CERT_KEY_KEY)),
            env_var(env::ENDPOINT, self.config.ingestion_endpoint.clone()),
            env_var(env::INSTANCE_ID, pod_name),
            env_var(env::CLUSTER, self.config.cluster_name.clone()),
        ];
        if let Some(guid) = labels.and_then(|l| l.get(GUID_LABEL)) {
            env.push(env_var(env::SOURCE_ID, guid.clone()));
        }
        if let Some(source_type) = labels.and_then(|l| l.get(SOURCE_TYPE_LABEL)) {
            env.push(env_var(env::SOURCE_TYPE, normalize_source_type(source_type)));
        }

        let mut volume_mounts = vec![VolumeMount {
            name: CERT_VOLUME_NAME.to_string(),
            mount_path: CERT_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }];
        if let Some(volume) = token_volume {
            volume_mounts.push(VolumeMount {
                name: volume.name.clone(),
                mount_path: SERVICE_ACCOUNT_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }

        Container {
            name: SIDECAR_CONTAINER_NAME.to_string(),
            image: Some(self.config.sidecar_image.clone()),
            args: Some(vec![RELAY_SUBCOMMAND.to_string()]),
            env: Some(env),
            volume_mounts: Some(volume_mounts),
            lifecycle: Some(Lifecycle {
                pre_stop: Some(LifecycleHandler {
                    exec: Some(ExecAction {
                        command: Some(cleanup_command(credentials)),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// A copy of `pod` carrying the sidecar, its volumes and the injected label
    ///
    /// The original containers keep their order and content; the sidecar is
    /// appended after them.
    pub fn compose(
        &self,
        pod: &Pod,
        namespace: &str,
        credentials: &PodCredentials,
        token_volume: Option<Volume>,
    ) -> Pod {
        let sidecar = self.sidecar_container(pod, namespace, credentials, token_volume.as_ref());

        let mut mutated = pod.clone();
        mutated
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(INJECTED_LABEL.to_string(), "true".to_string());

        let spec = mutated.spec.get_or_insert_with(Default::default);
        let volumes = spec.volumes.get_or_insert_with(Vec::new);
        volumes.push(cert_volume(&self.config.cert_secret_name));
        if let Some(volume) = token_volume {
            volumes.push(volume);
        }
        spec.containers.push(sidecar);

        mutated
    }
}
