//! Ingestion client
//!
//! Records are handed over with a fire-and-forget [`IngestionClient::emit`]
//! and shipped in batches by a background task, either when a batch fills
//! up or when the flush interval elapses. [`IngestionClient::close`] flushes
//! whatever is still buffered and stops the task.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use super::envelope::envelope::Message;
use super::envelope::{Envelope, EnvelopeBatch, Log, LogType, SendResponse, INGRESS_SEND_PATH};
use super::tls::ClientMtlsConfig;
use crate::config::{IngestionConfig, RelayConfig};
use crate::Error;

/// Records buffered between the relay and the flush task
const EMIT_BUFFER: usize = 1024;

/// Identity and tags stamped on every record of one relay run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordMetadata {
    /// Source identifier
    pub source_id: String,
    /// Instance identifier
    pub instance_id: String,
    /// `source_type`, `pod_name`, `namespace`, `container` and `cluster`
    pub tags: BTreeMap<String, String>,
}

impl RecordMetadata {
    /// Metadata describing the stream `config` follows
    pub fn from_config(config: &RelayConfig) -> Self {
        let tags = BTreeMap::from([
            ("source_type".to_string(), config.source_type.clone()),
            ("pod_name".to_string(), config.pod_name.clone()),
            ("namespace".to_string(), config.namespace.clone()),
            ("container".to_string(), config.container.clone()),
            ("cluster".to_string(), config.cluster.clone()),
        ]);
        Self {
            source_id: config.source_id.clone(),
            instance_id: config.instance_id.clone(),
            tags,
        }
    }
}

/// One chunk of container output on its way to ingestion
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    /// Raw chunk bytes
    pub payload: Bytes,
    /// Emission time in nanoseconds since the epoch
    pub timestamp: i64,
    /// Identity and tags
    pub metadata: RecordMetadata,
}

impl LogRecord {
    /// Wire envelope for this record, always of stdout type
    pub fn to_envelope(&self) -> Envelope {
        Envelope {
            timestamp: self.timestamp,
            source_id: self.metadata.source_id.clone(),
            instance_id: self.metadata.instance_id.clone(),
            tags: self
                .metadata
                .tags
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
            message: Some(Message::Log(Log {
                payload: self.payload.to_vec(),
                r#type: LogType::Out as i32,
            })),
        }
    }
}

/// Client forwarding records to the ingestion service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IngestionClient: Send + Sync {
    /// Queue a record for delivery. Never waits on the network.
    fn emit(&self, record: LogRecord) -> Result<(), Error>;

    /// Flush buffered records and release the connection
    async fn close(&self) -> Result<(), Error>;
}

/// Destination of flushed batches
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Deliver one batch
    async fn send(&self, batch: EnvelopeBatch) -> Result<(), Error>;
}

/// Batch sink calling `loggregator.v2.Ingress/Send` over a gRPC channel
#[derive(Clone)]
pub struct GrpcBatchSink {
    channel: Channel,
}

impl GrpcBatchSink {
    /// Create a sink over an established channel
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Lazily connected mTLS channel to `config.endpoint`
    pub async fn connect(config: &IngestionConfig) -> Result<Self, Error> {
        let tls_config = ClientMtlsConfig::load(config).await?.to_tonic_config();
        let endpoint = Endpoint::from_shared(endpoint_uri(&config.endpoint))
            .map_err(|e| Error::config(format!("invalid ingestion endpoint: {e}")))?
            .tls_config(tls_config)
            .map_err(|e| Error::tls(e.to_string()))?;
        Ok(Self::new(endpoint.connect_lazy()))
    }
}

#[async_trait]
impl BatchSink for GrpcBatchSink {
    async fn send(&self, batch: EnvelopeBatch) -> Result<(), Error> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Error::ingestion(format!("ingestion endpoint not ready: {e}")))?;
        grpc.unary::<EnvelopeBatch, SendResponse, _>(
            tonic::Request::new(batch),
            PathAndQuery::from_static(INGRESS_SEND_PATH),
            ProstCodec::default(),
        )
        .await
        .map_err(|status| Error::ingestion(status.message().to_string()))?;
        Ok(())
    }
}

/// Endpoints are configured as `host:port`; tonic needs a URI
fn endpoint_uri(endpoint: &str) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    }
}

/// [`IngestionClient`] batching records into a [`BatchSink`]
pub struct BatchingIngestionClient {
    tx: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchingIngestionClient {
    /// Connect to the ingestion endpoint described by `config`
    pub async fn connect(config: &IngestionConfig) -> Result<Self, Error> {
        let sink = GrpcBatchSink::connect(config).await?;
        info!(endpoint = %config.endpoint, "ingestion client ready");
        Ok(Self::with_sink(
            Arc::new(sink),
            config.flush_interval,
            config.batch_size,
        ))
    }

    /// Start a client flushing into `sink`
    pub fn with_sink(sink: Arc<dyn BatchSink>, flush_interval: Duration, batch_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(EMIT_BUFFER);
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(flush_loop(
            sink,
            rx,
            shutdown.clone(),
            flush_interval,
            batch_size.max(1),
        ));
        Self {
            tx,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }
}

#[async_trait]
impl IngestionClient for BatchingIngestionClient {
    fn emit(&self, record: LogRecord) -> Result<(), Error> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ingestion("client is closed"));
        }
        match self.tx.try_send(record.to_envelope()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("ingestion buffer full, dropping record");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::ingestion("flush task has stopped"))
            }
        }
    }

    async fn close(&self) -> Result<(), Error> {
        self.shutdown.cancel();
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker
                .await
                .map_err(|e| Error::ingestion(format!("flush task failed: {e}")))?;
        }
        Ok(())
    }
}

async fn flush_loop(
    sink: Arc<dyn BatchSink>,
    mut rx: mpsc::Receiver<Envelope>,
    shutdown: CancellationToken,
    flush_interval: Duration,
    batch_size: usize,
) {
    let mut buffer: Vec<Envelope> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                while let Ok(envelope) = rx.try_recv() {
                    buffer.push(envelope);
                }
                flush(sink.as_ref(), &mut buffer).await;
                debug!("ingestion flush task stopped");
                return;
            }
            received = rx.recv() => match received {
                Some(envelope) => {
                    buffer.push(envelope);
                    if buffer.len() >= batch_size {
                        flush(sink.as_ref(), &mut buffer).await;
                    }
                }
                None => {
                    flush(sink.as_ref(), &mut buffer).await;
                    return;
                }
            },
            _ = ticker.tick() => flush(sink.as_ref(), &mut buffer).await,
        }
    }
}

async fn flush(sink: &dyn BatchSink, buffer: &mut Vec<Envelope>) {
    if buffer.is_empty() {
        return;
    }
    let batch = EnvelopeBatch {
        batch: std::mem::take(buffer),
    };
    let count = batch.batch.len();
    match sink.send(batch).await {
        Ok(()) => debug!(count, "flushed envelopes"),
        Err(e) => warn!(count, error = %e, "dropping envelope batch"),
    }
}
