//! Signature check, storage and fan-out wired together the way the relay
//! does it, without the HTTP layer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lib_common::connections::{EventStore, SqliteEventStore, StoreError};
use lib_common::core::{BroadcastFrame, BroadcastRegistry, SendFailure, SubscriberSink};
use lib_common::models::{BroadcastPayload, ControlMessage, EventRecord, IngestBatch, NewEvent};
use lib_common::security::{AuthError, SignatureSettings, SignatureValidator};
use lib_common::utils::clock::ManualClock;
use tokio::sync::mpsc;

const NOW: i64 = 1_700_000_000;

struct ChannelSink(mpsc::UnboundedSender<Arc<BroadcastFrame>>);

#[async_trait]
impl SubscriberSink for ChannelSink {
    async fn send(&self, frame: Arc<BroadcastFrame>) -> Result<(), SendFailure> {
        self.0.send(frame).map_err(|_| SendFailure)
    }
}

/// Refuses every write.
struct ReadOnlyStore;

#[async_trait]
impl EventStore for ReadOnlyStore {
    async fn init(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert(&self, _rows: Vec<NewEvent>) -> Result<Vec<EventRecord>, StoreError> {
        Err(StoreError::Corrupt {
            id: 0,
            reason: "read-only".into(),
        })
    }

    async fn fetch(&self, _agent_id: Option<&str>, _limit: u32) -> Result<Vec<EventRecord>, StoreError> {
        Ok(Vec::new())
    }

    async fn remove(&self, _agent_id: Option<&str>) -> Result<u64, StoreError> {
        Ok(0)
    }
}

#[derive(Debug, PartialEq)]
enum Refused {
    Auth(AuthError),
    Store,
}

fn validator() -> SignatureValidator {
    let settings = SignatureSettings {
        secret: b"pipeline-secret".to_vec(),
        ..SignatureSettings::default()
    };
    SignatureValidator::with_clock(settings, Arc::new(ManualClock::new(NOW)))
}

fn body(agent: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "agent_id": agent,
        "ts": "2024-05-01T12:00:00Z",
        "platform": "linux",
        "events": [{"type": "metric", "cpu": 0.5}, {"type": "proc", "pid": 7, "name": "init"}]
    }))
    .unwrap()
}

async fn ingest(
    validator: &SignatureValidator,
    store: &dyn EventStore,
    registry: &BroadcastRegistry,
    timestamp: &str,
    signature: &str,
    body: &[u8],
) -> Result<usize, Refused> {
    validator
        .validate(timestamp, signature, body)
        .map_err(Refused::Auth)?;
    let batch = IngestBatch::from_slice(body).unwrap();
    let records = store
        .insert(batch.into_rows())
        .await
        .map_err(|_| Refused::Store)?;
    for record in &records {
        registry.broadcast(record.clone()).await;
    }
    Ok(records.len())
}

#[tokio::test]
async fn test_accepted_batch_is_stored_then_broadcast_in_order() {
    let validator = validator();
    let store = SqliteEventStore::in_memory().await.unwrap();
    let registry = BroadcastRegistry::new(Duration::from_secs(1));

    let (tx_all, mut rx_all) = mpsc::unbounded_channel();
    let (tx_other, mut rx_other) = mpsc::unbounded_channel();
    registry.connect(Arc::new(ChannelSink(tx_all)), None);
    registry.connect(Arc::new(ChannelSink(tx_other)), Some("agent-other".into()));

    let ts = NOW.to_string();
    let payload = body("agent-1");
    let signature = validator.sign(&ts, &payload);

    let stored = ingest(&validator, &store, &registry, &ts, &signature, &payload).await;
    assert_eq!(stored, Ok(2));

    let first = rx_all.recv().await.unwrap();
    let second = rx_all.recv().await.unwrap();
    match (first.payload(), second.payload()) {
        (BroadcastPayload::Event(a), BroadcastPayload::Event(b)) => {
            assert_eq!(a.event_type, "metric");
            assert_eq!(b.event_type, "proc");
            assert!(a.id < b.id);
        }
        other => panic!("unexpected payloads: {other:?}"),
    }
    assert!(rx_other.try_recv().is_err());

    // The same request a second time is refused before anything is stored.
    let replayed = ingest(&validator, &store, &registry, &ts, &signature, &payload).await;
    assert_eq!(replayed, Err(Refused::Auth(AuthError::ReplayedSignature)));
    assert_eq!(store.fetch(None, 50).await.unwrap().len(), 2);
    assert!(rx_all.try_recv().is_err());

    let cleared = store.remove(Some("agent-1")).await.unwrap();
    assert_eq!(cleared, 2);
    registry
        .broadcast(ControlMessage::Clear {
            agent_id: Some("agent-1".into()),
        })
        .await;
    let notice = rx_all.recv().await.unwrap();
    assert_eq!(
        *notice.payload(),
        BroadcastPayload::Control(ControlMessage::Clear {
            agent_id: Some("agent-1".into())
        })
    );
    assert_eq!(notice.text().as_ref(), r#"{"type":"clear","agent_id":"agent-1"}"#);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_requests_store_once() {
    const N: usize = 32;
    let validator = Arc::new(validator());
    let store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::in_memory().await.unwrap());
    let registry = Arc::new(BroadcastRegistry::new(Duration::from_secs(1)));

    let ts = NOW.to_string();
    let payload = Arc::new(body("agent-race"));
    let signature = Arc::new(validator.sign(&ts, &payload));

    let tasks: Vec<_> = (0..N)
        .map(|_| {
            let (validator, store, registry) = (validator.clone(), store.clone(), registry.clone());
            let (ts, payload, signature) = (ts.clone(), payload.clone(), signature.clone());
            tokio::spawn(async move {
                ingest(&validator, store.as_ref(), &registry, &ts, &signature, &payload).await
            })
        })
        .collect();

    let mut accepted = 0;
    let mut replayed = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(Refused::Auth(AuthError::ReplayedSignature)) => replayed += 1,
            Err(other) => panic!("unexpected rejection: {other:?}"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(replayed, N - 1);
    assert_eq!(store.fetch(Some("agent-race"), 500).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_distinct_agents_are_independent() {
    let validator = validator();
    let store = SqliteEventStore::in_memory().await.unwrap();
    let registry = BroadcastRegistry::new(Duration::from_secs(1));
    let ts = NOW.to_string();

    for agent in ["agent-a", "agent-b", "agent-c"] {
        let payload = body(agent);
        let signature = validator.sign(&ts, &payload);
        assert_eq!(
            ingest(&validator, &store, &registry, &ts, &signature, &payload).await,
            Ok(2)
        );
    }

    assert_eq!(store.fetch(None, 500).await.unwrap().len(), 6);
    assert_eq!(store.fetch(Some("agent-b"), 500).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_insert_broadcasts_nothing() {
    let validator = validator();
    let registry = BroadcastRegistry::new(Duration::from_secs(1));
    let (tx, mut rx) = mpsc::unbounded_channel();
    registry.connect(Arc::new(ChannelSink(tx)), None);

    let ts = NOW.to_string();
    let payload = body("agent-1");
    let signature = validator.sign(&ts, &payload);

    let outcome = ingest(&validator, &ReadOnlyStore, &registry, &ts, &signature, &payload).await;
    assert_eq!(outcome, Err(Refused::Store));
    assert!(rx.try_recv().is_err());
    assert_eq!(registry.len(), 1, "the viewer is untouched");
}
