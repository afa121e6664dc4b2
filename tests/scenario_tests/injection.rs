//! Stories about admitting pods
//!
//! A pod is created in a watched namespace; the webhook provisions its
//! credentials and patches in the log-forwarding sidecar.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::admission::{AdmissionRequest, AdmissionReview};
use serde_json::json;

use loglet::config::InjectorConfig;
use loglet::controller::{self, Context};
use loglet::mutation::{review, PodMutationHandler};
use loglet::rbac::CredentialProvisioner;
use loglet::service_account::{
    ServiceAccountVolumeResolver, SERVICE_ACCOUNT_NAME_ANNOTATION, SERVICE_ACCOUNT_TOKEN_TYPE,
};
use loglet::sidecar::{env, CERT_VOLUME_NAME, INJECTED_LABEL, SIDECAR_CONTAINER_NAME};

use super::fakes::FakeCluster;

// =============================================================================
// Test Fixtures
// =============================================================================

fn app_pod() -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": "app-1",
            "namespace": "ns1",
            "labels": {"source_type": "APP", "guid": "3f2a-app"}
        },
        "spec": {"containers": [{"name": "web", "image": "registry.local/web:1.4"}]}
    })
}

fn admission_request(pod: &serde_json::Value) -> AdmissionRequest<Pod> {
    let review: AdmissionReview<Pod> = serde_json::from_value(json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "0b6d6a55-2c4b-4b1c-9d8a-6f3f0f1d2e01",
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "name": "app-1",
            "namespace": "ns1",
            "operation": "CREATE",
            "userInfo": {"username": "system:serviceaccount:kube-system:replicaset-controller"},
            "object": pod,
            "dryRun": false
        }
    }))
    .expect("valid review");
    review.try_into().expect("review carries a request")
}

fn injector_config(mount_token: bool) -> InjectorConfig {
    InjectorConfig {
        ingestion_endpoint: "metron.logging:3458".to_string(),
        cert_secret_name: "loglet-ingestion-certs".to_string(),
        cluster_name: "eu-west".to_string(),
        mount_service_account_token: mount_token,
        ..Default::default()
    }
}

fn handler(cluster: &Arc<FakeCluster>, mount_token: bool) -> PodMutationHandler {
    PodMutationHandler::new(
        CredentialProvisioner::new(cluster.clone(), "default"),
        ServiceAccountVolumeResolver::new(cluster.clone()),
        injector_config(mount_token),
    )
}

fn patched(pod: &serde_json::Value, patch: &[u8]) -> Pod {
    let patch: json_patch::Patch = serde_json::from_slice(patch).expect("patch is JSON");
    let mut doc = pod.clone();
    json_patch::patch(&mut doc, &patch).expect("patch applies");
    serde_json::from_value(doc).expect("patched document is a pod")
}

// =============================================================================
// Stories
// =============================================================================

/// Story: a fresh pod gets its credentials and exactly one sidecar
#[tokio::test]
async fn story_fresh_pod_is_injected() {
    let cluster = Arc::new(FakeCluster::default());
    let handler = handler(&cluster, false);

    let response = review(&handler, &admission_request(&app_pod())).await;

    assert!(response.allowed, "denied: {}", response.result.message);
    assert_eq!(cluster.role_names("ns1"), vec!["role-app-1"]);
    assert_eq!(cluster.binding_names("ns1"), vec!["role-binding-app-1"]);

    let pod = patched(&app_pod(), response.patch.as_deref().expect("patch"));
    let spec = pod.spec.expect("spec");
    assert_eq!(spec.containers.len(), 2);
    assert_eq!(spec.containers[0].name, "web");
    let sidecar = &spec.containers[1];
    assert_eq!(sidecar.name, SIDECAR_CONTAINER_NAME);

    let mounts = sidecar.volume_mounts.as_ref().expect("mounts");
    assert_eq!(mounts.len(), 1);
    assert_eq!(mounts[0].name, CERT_VOLUME_NAME);
    let cert_volume = spec
        .volumes
        .expect("volumes")
        .into_iter()
        .find(|v| v.name == CERT_VOLUME_NAME)
        .expect("cert volume declared");
    assert_eq!(
        cert_volume.secret.and_then(|s| s.secret_name).as_deref(),
        Some("loglet-ingestion-certs")
    );

    let env: BTreeMap<String, String> = sidecar
        .env
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(|e| (e.name, e.value.unwrap_or_default()))
        .collect();
    assert_eq!(env[env::NAMESPACE], "ns1");
    assert_eq!(env[env::POD_NAME], "app-1");
    assert_eq!(env[env::CONTAINER], "web");
    assert_eq!(env[env::SOURCE_TYPE], "APP/PROC/WEB");
    assert_eq!(env[env::SOURCE_ID], "3f2a-app");
    assert_eq!(env[env::ENDPOINT], "metron.logging:3458");
    assert_eq!(
        pod.metadata.labels.unwrap().get(INJECTED_LABEL).map(String::as_str),
        Some("true")
    );
}

/// Story: a second admission for the same pod name conflicts and creates no binding
#[tokio::test]
async fn story_same_pod_name_conflicts() {
    let cluster = Arc::new(FakeCluster::default());
    let handler = handler(&cluster, false);

    let first = review(&handler, &admission_request(&app_pod())).await;
    assert!(first.allowed);
    assert_eq!(*cluster.binding_creates.lock().unwrap(), 1);

    let second = review(&handler, &admission_request(&app_pod())).await;

    assert!(!second.allowed);
    assert!(second.patch.is_none());
    assert!(second.result.message.contains("role-app-1"));
    assert_eq!(second.result.code, 409);
    assert_eq!(*cluster.binding_creates.lock().unwrap(), 1);
}

/// Story: a failing binding create leaves no orphaned role behind
#[tokio::test]
async fn story_binding_failure_leaves_cluster_clean() {
    let cluster = Arc::new(FakeCluster {
        fail_binding_create: true,
        ..Default::default()
    });
    let handler = handler(&cluster, false);

    let response = review(&handler, &admission_request(&app_pod())).await;

    assert!(!response.allowed);
    assert!(response.result.message.contains("role-binding-app-1"));
    assert!(cluster.role_names("ns1").is_empty());
    assert!(cluster.binding_names("ns1").is_empty());
}

/// Story: with token mounting on, the account's token secret reaches the sidecar
#[tokio::test]
async fn story_token_secret_is_mounted() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.secrets.lock().unwrap().push((
        "ns1".to_string(),
        Secret {
            metadata: ObjectMeta {
                name: Some("default-token-x7k2p".to_string()),
                annotations: Some(BTreeMap::from([(
                    SERVICE_ACCOUNT_NAME_ANNOTATION.to_string(),
                    "default".to_string(),
                )])),
                ..Default::default()
            },
            type_: Some(SERVICE_ACCOUNT_TOKEN_TYPE.to_string()),
            ..Default::default()
        },
    ));
    let handler = handler(&cluster, true);

    let response = review(&handler, &admission_request(&app_pod())).await;

    assert!(response.allowed);
    let pod = patched(&app_pod(), response.patch.as_deref().expect("patch"));
    let spec = pod.spec.expect("spec");
    let sidecar = spec.containers.last().expect("sidecar");
    assert_eq!(sidecar.volume_mounts.as_ref().expect("mounts").len(), 2);
    assert!(spec.volumes.expect("volumes").iter().any(|v| v
        .secret
        .as_ref()
        .and_then(|s| s.secret_name.as_deref())
        == Some("default-token-x7k2p")));
}

/// Story: once the pod runs, it owns its role and binding
#[tokio::test]
async fn story_running_pod_adopts_its_credentials() {
    let cluster = Arc::new(FakeCluster::default());
    let handler = handler(&cluster, false);
    let response = review(&handler, &admission_request(&app_pod())).await;
    let mut pod = patched(&app_pod(), response.patch.as_deref().expect("patch"));
    pod.metadata.uid = Some("5d1c8a2e-uid".to_string());

    let ctx = Arc::new(Context::new(CredentialProvisioner::new(
        cluster.clone(),
        "default",
    )));
    controller::reconcile(Arc::new(pod), ctx)
        .await
        .expect("reconcile succeeds");

    let roles = cluster.roles.lock().unwrap();
    let role = roles
        .get(&("ns1".to_string(), "role-app-1".to_string()))
        .expect("role exists");
    let owners = role.metadata.owner_references.as_ref().expect("owned");
    assert_eq!(owners[0].kind, "Pod");
    assert_eq!(owners[0].uid, "5d1c8a2e-uid");
}
