//! Stories about the sidecar relaying container output

use std::path::PathBuf;
use std::sync::Arc;

use loglet::config::{IngestionConfig, RelayConfig};
use loglet::relay::LogRelay;
use loglet::Error;

use super::fakes::{RecordingIngestion, ScriptedLogSource};

fn relay_config() -> RelayConfig {
    RelayConfig {
        namespace: "ns1".to_string(),
        pod_name: "app-1".to_string(),
        container: "web".to_string(),
        source_id: "3f2a-app".to_string(),
        instance_id: "app-1".to_string(),
        source_type: "APP/PROC/WEB".to_string(),
        cluster: "eu-west".to_string(),
        kubeconfig: None,
        ingestion: IngestionConfig {
            endpoint: "metron.logging:3458".to_string(),
            ca_path: PathBuf::from("/secrets/internal-ca-cert"),
            cert_path: PathBuf::from("/secrets/forward-cert"),
            key_path: PathBuf::from("/secrets/forward-cert-key"),
            ..Default::default()
        },
    }
}

/// Story: two chunks then a clean close give two records and a failed run
#[tokio::test]
async fn story_two_chunks_then_close() {
    let source = Arc::new(ScriptedLogSource::new(vec![
        "2024/05/01 server starting\n",
        "2024/05/01 listening on :8080\n",
    ]));
    let ingestion = RecordingIngestion::shared();
    let relay = LogRelay::new(&relay_config(), source.clone(), ingestion.clone());

    let result = relay.run().await;

    assert!(matches!(result, Err(Error::StreamEnded)));

    let opened = source.opened.lock().unwrap();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].to_string(), "ns1/app-1/web");

    let records = ingestion.records.lock().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(&records[0].payload[..], b"2024/05/01 server starting\n");
    assert_eq!(&records[1].payload[..], b"2024/05/01 listening on :8080\n");
    assert_eq!(records[0].metadata, records[1].metadata);
    assert!(records[0].timestamp < records[1].timestamp);

    let meta = &records[0].metadata;
    assert_eq!(meta.source_id, "3f2a-app");
    assert_eq!(meta.instance_id, "app-1");
    assert_eq!(meta.tags["source_type"], "APP/PROC/WEB");
    assert_eq!(meta.tags["pod_name"], "app-1");
    assert_eq!(meta.tags["namespace"], "ns1");
    assert_eq!(meta.tags["container"], "web");
    assert_eq!(meta.tags["cluster"], "eu-west");

    assert_eq!(*ingestion.closes.lock().unwrap(), 1);
}

/// Story: a container that has printed nothing still ends the run as a failure
#[tokio::test]
async fn story_silent_container_ends_in_failure() {
    let ingestion = RecordingIngestion::shared();
    let relay = LogRelay::new(
        &relay_config(),
        Arc::new(ScriptedLogSource::new(vec![])),
        ingestion.clone(),
    );

    assert!(matches!(relay.run().await, Err(Error::StreamEnded)));
    assert!(ingestion.records.lock().unwrap().is_empty());
    assert_eq!(*ingestion.closes.lock().unwrap(), 1);
}
