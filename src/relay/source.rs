//! Container log streams

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, LogParams};
use kube::Client;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::config::RelayConfig;
use crate::Error;

/// Raw chunks of container output, in arrival order
pub type LogStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// The container whose output is followed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogTarget {
    /// Namespace of the pod
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Container name
    pub container: String,
}

impl LogTarget {
    /// Target named by a relay configuration
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            pod: config.pod_name.clone(),
            container: config.container.clone(),
        }
    }
}

impl std::fmt::Display for LogTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

/// Opens followed log streams
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Follow `target` from the start of its current output
    async fn open(&self, target: &LogTarget) -> Result<LogStream, Error>;
}

/// Log source reading `pods/{name}/log` from the API server
pub struct KubeLogSource {
    client: Client,
}

impl KubeLogSource {
    /// Create a new KubeLogSource wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Parameters for a live, untimestamped stream of the current container
pub fn follow_params(container: &str) -> LogParams {
    LogParams {
        container: Some(container.to_string()),
        follow: true,
        previous: false,
        timestamps: false,
        ..Default::default()
    }
}

#[async_trait]
impl LogSource for KubeLogSource {
    async fn open(&self, target: &LogTarget) -> Result<LogStream, Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let stream = pods
            .log_stream(&target.pod, &follow_params(&target.container))
            .await
            .map_err(|e| Error::stream(format!("failed to open log stream for {target}: {e}")))?;
        info!(stream = %target, "following container logs");

        Ok(Box::pin(tokio_util::io::ReaderStream::new(stream.compat())))
    }
}
