//! In-memory stand-ins for the cluster and the ingestion service

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::error::ErrorResponse;

use loglet::rbac::RbacClient;
use loglet::relay::{IngestionClient, LogRecord, LogSource, LogStream, LogTarget};
use loglet::service_account::SecretClient;
use loglet::Error;

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

/// Namespaced store of the RBAC objects and secrets the injector touches
#[derive(Default)]
pub struct FakeCluster {
    pub roles: Mutex<BTreeMap<(String, String), Role>>,
    pub bindings: Mutex<BTreeMap<(String, String), RoleBinding>>,
    pub secrets: Mutex<Vec<(String, Secret)>>,
    pub binding_creates: Mutex<u32>,
    pub fail_binding_create: bool,
}

impl FakeCluster {
    pub fn role_names(&self, namespace: &str) -> Vec<String> {
        self.roles
            .lock()
            .unwrap()
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn binding_names(&self, namespace: &str) -> Vec<String> {
        self.bindings
            .lock()
            .unwrap()
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }
}

#[async_trait]
impl RbacClient for FakeCluster {
    async fn create_role(&self, namespace: &str, role: &Role) -> Result<(), Error> {
        let name = role.metadata.name.clone().unwrap_or_default();
        let mut roles = self.roles.lock().unwrap();
        let key = (namespace.to_string(), name.clone());
        if roles.contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("roles.rbac.authorization.k8s.io \"{name}\" already exists"),
            ));
        }
        roles.insert(key, role.clone());
        Ok(())
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), Error> {
        *self.binding_creates.lock().unwrap() += 1;
        if self.fail_binding_create {
            return Err(api_error(500, "InternalError", "etcdserver: timeout".to_string()));
        }
        let name = binding.metadata.name.clone().unwrap_or_default();
        self.bindings
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name), binding.clone());
        Ok(())
    }

    async fn delete_role(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.roles
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| api_error(404, "NotFound", format!("role {name} not found")))
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.bindings
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| api_error(404, "NotFound", format!("rolebinding {name} not found")))
    }

    async fn set_role_owner(
        &self,
        namespace: &str,
        name: &str,
        owner: &OwnerReference,
    ) -> Result<(), Error> {
        let mut roles = self.roles.lock().unwrap();
        let role = roles
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| api_error(404, "NotFound", format!("role {name} not found")))?;
        role.metadata.owner_references = Some(vec![owner.clone()]);
        Ok(())
    }

    async fn set_role_binding_owner(
        &self,
        namespace: &str,
        name: &str,
        owner: &OwnerReference,
    ) -> Result<(), Error> {
        let mut bindings = self.bindings.lock().unwrap();
        let binding = bindings
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| api_error(404, "NotFound", format!("rolebinding {name} not found")))?;
        binding.metadata.owner_references = Some(vec![owner.clone()]);
        Ok(())
    }
}

#[async_trait]
impl SecretClient for FakeCluster {
    async fn list_secrets_of_type(
        &self,
        namespace: &str,
        secret_type: &str,
    ) -> Result<Vec<Secret>, Error> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .iter()
            .filter(|(ns, s)| ns == namespace && s.type_.as_deref() == Some(secret_type))
            .map(|(_, s)| s.clone())
            .collect())
    }
}

/// Log source replaying a fixed list of chunks, then closing
pub struct ScriptedLogSource {
    pub chunks: Vec<&'static str>,
    pub opened: Mutex<Vec<LogTarget>>,
}

impl ScriptedLogSource {
    pub fn new(chunks: Vec<&'static str>) -> Self {
        Self {
            chunks,
            opened: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LogSource for ScriptedLogSource {
    async fn open(&self, target: &LogTarget) -> Result<LogStream, Error> {
        self.opened.lock().unwrap().push(target.clone());
        let chunks: Vec<std::io::Result<Bytes>> = self
            .chunks
            .iter()
            .map(|c| Ok(Bytes::from_static(c.as_bytes())))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

/// Ingestion client keeping every record it is handed
#[derive(Default)]
pub struct RecordingIngestion {
    pub records: Mutex<Vec<LogRecord>>,
    pub closes: Mutex<u32>,
}

impl RecordingIngestion {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl IngestionClient for RecordingIngestion {
    fn emit(&self, record: LogRecord) -> Result<(), Error> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        *self.closes.lock().unwrap() += 1;
        Ok(())
    }
}
