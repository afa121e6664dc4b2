//! Log relay
//!
//! Runs inside the injected sidecar: follows one container's log stream and
//! forwards every chunk to the ingestion service as a tagged record. A run
//! is a single stream attempt. It ends when the stream ends, and that end is
//! always reported as an error so the sidecar's supervisor sees the relay
//! stop.

pub mod envelope;
pub mod ingestion;
pub mod source;
pub mod tls;

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, error, info, instrument};

use crate::config::RelayConfig;
use crate::Error;

pub use ingestion::{
    BatchSink, BatchingIngestionClient, GrpcBatchSink, IngestionClient, LogRecord, RecordMetadata,
};
pub use source::{KubeLogSource, LogSource, LogStream, LogTarget};

/// Wraps chunks as records and hands them to the ingestion client
pub struct ForwardingWriter {
    client: Arc<dyn IngestionClient>,
    metadata: RecordMetadata,
    last_timestamp: i64,
}

impl ForwardingWriter {
    /// Create a writer stamping `metadata` on every record
    pub fn new(client: Arc<dyn IngestionClient>, metadata: RecordMetadata) -> Self {
        Self {
            client,
            metadata,
            last_timestamp: i64::MIN,
        }
    }

    /// Forward one chunk; returns the number of bytes accepted
    ///
    /// Timestamps strictly increase within one writer, even if the wall
    /// clock stalls or goes backwards.
    pub fn write(&mut self, chunk: Bytes) -> Result<usize, Error> {
        let now = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX);
        self.last_timestamp = now.max(self.last_timestamp.saturating_add(1));

        let len = chunk.len();
        debug!(output = %String::from_utf8_lossy(&chunk), "pod output");
        self.client.emit(LogRecord {
            payload: chunk,
            timestamp: self.last_timestamp,
            metadata: self.metadata.clone(),
        })?;
        Ok(len)
    }
}

/// One relay run over a log source and an ingestion client
pub struct LogRelay {
    source: Arc<dyn LogSource>,
    client: Arc<dyn IngestionClient>,
    target: LogTarget,
    metadata: RecordMetadata,
}

impl LogRelay {
    /// Create a relay for the stream and identity described by `config`
    pub fn new(
        config: &RelayConfig,
        source: Arc<dyn LogSource>,
        client: Arc<dyn IngestionClient>,
    ) -> Self {
        Self {
            source,
            client,
            target: LogTarget::from_config(config),
            metadata: RecordMetadata::from_config(config),
        }
    }

    /// Follow the target stream until it ends
    ///
    /// Never returns `Ok`: a clean end of stream is [`Error::StreamEnded`],
    /// a transport failure is [`Error::Stream`]. The ingestion client is
    /// closed exactly once before returning, whichever way the run ends.
    #[instrument(skip(self), fields(stream = %self.target))]
    pub async fn run(&self) -> Result<(), Error> {
        let outcome = self.forward().await;
        if let Err(e) = self.client.close().await {
            error!(error = %e, "failed to close ingestion client");
        }
        match &outcome {
            Err(Error::StreamEnded) => info!("log stream ended"),
            Err(e) => error!(error = %e, "relay failed"),
            Ok(()) => {}
        }
        outcome
    }

    async fn forward(&self) -> Result<(), Error> {
        let mut stream = self.source.open(&self.target).await?;
        let mut writer = ForwardingWriter::new(self.client.clone(), self.metadata.clone());
        let mut forwarded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::stream(e.to_string()))?;
            forwarded += writer.write(chunk)? as u64;
        }

        debug!(bytes = forwarded, "stream closed");
        Err(Error::StreamEnded)
    }
}
