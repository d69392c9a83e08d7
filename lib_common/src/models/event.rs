//! Telemetry batch, record and broadcast types.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why an ingest body was refused after it authenticated.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The body is not a well-formed batch document.
    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),

    /// A required string field is empty.
    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),

    /// The batch carries no events.
    #[error("events must not be empty")]
    NoEvents,
}

/// One observation reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryEvent {
    /// Event kind, e.g. `metric` or `proc`. Normalized to lowercase.
    #[serde(rename = "type")]
    pub event_type: String,
    /// CPU load, as a fraction or percentage depending on the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    /// Free memory in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_free: Option<i64>,
    /// Process id for `proc` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i64>,
    /// Process name for `proc` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Resident set size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rss: Option<i64>,
}

/// A batch of events pushed by one agent in one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestBatch {
    /// Reporting agent.
    pub agent_id: String,
    /// When the agent collected the batch.
    pub ts: DateTime<FixedOffset>,
    /// Agent platform, normalized to lowercase.
    pub platform: String,
    /// At least one event.
    pub events: Vec<TelemetryEvent>,
}

impl IngestBatch {
    /// Parses and normalizes an ingest body.
    ///
    /// Call this only on bytes that already passed signature validation; the
    /// parsed form is never used to recompute a signature.
    pub fn from_slice(body: &[u8]) -> Result<Self, ValidationError> {
        let batch: IngestBatch = serde_json::from_slice(body)?;
        batch.normalized()
    }

    fn normalized(mut self) -> Result<Self, ValidationError> {
        if self.agent_id.is_empty() {
            return Err(ValidationError::EmptyField("agent_id"));
        }
        if self.platform.is_empty() {
            return Err(ValidationError::EmptyField("platform"));
        }
        if self.events.is_empty() {
            return Err(ValidationError::NoEvents);
        }
        self.platform = self.platform.to_lowercase();
        for event in &mut self.events {
            if event.event_type.is_empty() {
                return Err(ValidationError::EmptyField("type"));
            }
            event.event_type = event.event_type.to_lowercase();
        }
        Ok(self)
    }

    /// Flattens the batch into one storage row per event.
    pub fn into_rows(self) -> Vec<NewEvent> {
        let IngestBatch {
            agent_id,
            ts,
            platform,
            events,
        } = self;
        events
            .into_iter()
            .map(|event| NewEvent {
                agent_id: agent_id.clone(),
                ts,
                platform: platform.clone(),
                event_type: event.event_type,
                cpu: event.cpu,
                mem_free: event.mem_free,
                pid: event.pid,
                proc_name: event.name,
                rss: event.rss,
            })
            .collect()
    }
}

/// An event ready to be inserted, before the store assigns an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Reporting agent.
    pub agent_id: String,
    /// Batch collection time.
    pub ts: DateTime<FixedOffset>,
    /// Agent platform.
    pub platform: String,
    /// Event kind.
    pub event_type: String,
    /// CPU load.
    pub cpu: Option<f64>,
    /// Free memory in bytes.
    pub mem_free: Option<i64>,
    /// Process id.
    pub pid: Option<i64>,
    /// Process name.
    pub proc_name: Option<String>,
    /// Resident set size in bytes.
    pub rss: Option<i64>,
}

/// A persisted event as returned by the store and pushed to viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Store-assigned identifier.
    pub id: i64,
    /// Reporting agent.
    pub agent_id: String,
    /// Batch collection time.
    pub ts: DateTime<FixedOffset>,
    /// Agent platform.
    pub platform: String,
    /// Event kind.
    pub event_type: String,
    /// CPU load.
    pub cpu: Option<f64>,
    /// Free memory in bytes.
    pub mem_free: Option<i64>,
    /// Process id.
    pub pid: Option<i64>,
    /// Process name.
    pub proc_name: Option<String>,
    /// Resident set size in bytes.
    pub rss: Option<i64>,
    /// When the relay stored the event.
    pub ingested_at: DateTime<Utc>,
}

/// Body of a clear request. No agent means "clear everything".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearRequest {
    /// Agent whose events should be removed.
    #[serde(default)]
    pub agent_id: Option<String>,
}

/// Out-of-band notices pushed to viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Stored events were removed, for one agent or for all of them.
    Clear {
        /// The agent whose events were removed, `None` for all agents.
        agent_id: Option<String>,
    },
}

/// A message fanned out to live viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BroadcastPayload {
    /// A newly persisted event.
    Event(EventRecord),
    /// A control notice.
    Control(ControlMessage),
}

impl BroadcastPayload {
    /// The agent this payload concerns, used for subscriber filtering.
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::Event(record) => Some(record.agent_id.as_str()),
            Self::Control(ControlMessage::Clear { agent_id }) => agent_id.as_deref(),
        }
    }

    /// Whether a subscriber with `filter` should receive this payload.
    ///
    /// No filter receives everything; a filter receives only payloads whose
    /// agent id equals it.
    pub fn matches(&self, filter: Option<&str>) -> bool {
        match filter {
            None => true,
            Some(agent) => self.agent_id() == Some(agent),
        }
    }
}

impl From<EventRecord> for BroadcastPayload {
    fn from(record: EventRecord) -> Self {
        Self::Event(record)
    }
}

impl From<ControlMessage> for BroadcastPayload {
    fn from(message: ControlMessage) -> Self {
        Self::Control(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch_body() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "agent_id": "agent-test",
            "ts": "2024-05-01T12:00:00+00:00",
            "platform": "Windows",
            "events": [
                {"type": "Metric", "cpu": 0.25, "mem_free": 123456789},
                {"type": "proc", "pid": 1000, "name": "demo", "cpu": 0.12, "rss": 2048}
            ]
        }))
        .unwrap()
    }

    fn sample_record(id: i64, agent: &str) -> EventRecord {
        EventRecord {
            id,
            agent_id: agent.to_string(),
            ts: DateTime::parse_from_rfc3339("2024-05-01T12:00:00+00:00").unwrap(),
            platform: "linux".into(),
            event_type: "metric".into(),
            cpu: Some(0.5),
            mem_free: None,
            pid: None,
            proc_name: None,
            rss: None,
            ingested_at: Utc::now(),
        }
    }

    #[test]
    fn test_batch_is_normalized() {
        let batch = IngestBatch::from_slice(&batch_body()).unwrap();
        assert_eq!(batch.platform, "windows");
        assert_eq!(batch.events[0].event_type, "metric");

        let rows = batch.into_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].proc_name.as_deref(), Some("demo"));
        assert_eq!(rows[1].agent_id, "agent-test");
    }

    #[test]
    fn test_batch_rejections() {
        let empty_events = br#"{"agent_id":"a","ts":"2024-05-01T12:00:00Z","platform":"p","events":[]}"#;
        assert!(matches!(IngestBatch::from_slice(empty_events), Err(ValidationError::NoEvents)));

        let empty_agent = br#"{"agent_id":"","ts":"2024-05-01T12:00:00Z","platform":"p","events":[{"type":"m"}]}"#;
        assert!(matches!(
            IngestBatch::from_slice(empty_agent),
            Err(ValidationError::EmptyField("agent_id"))
        ));

        let extra = br#"{"agent_id":"a","ts":"2024-05-01T12:00:00Z","platform":"p","events":[{"type":"m"}],"x":1}"#;
        assert!(matches!(IngestBatch::from_slice(extra), Err(ValidationError::Json(_))));

        let extra_event_field = br#"{"agent_id":"a","ts":"2024-05-01T12:00:00Z","platform":"p","events":[{"type":"m","gpu":1}]}"#;
        assert!(matches!(IngestBatch::from_slice(extra_event_field), Err(ValidationError::Json(_))));

        let empty_type = br#"{"agent_id":"a","ts":"2024-05-01T12:00:00Z","platform":"p","events":[{"type":""}]}"#;
        assert!(matches!(
            IngestBatch::from_slice(empty_type),
            Err(ValidationError::EmptyField("type"))
        ));
    }

    #[test]
    fn test_clear_message_wire_format() {
        let payload = BroadcastPayload::from(ControlMessage::Clear {
            agent_id: Some("agent-7".into()),
        });
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"type": "clear", "agent_id": "agent-7"})
        );

        let all = BroadcastPayload::from(ControlMessage::Clear { agent_id: None });
        assert_eq!(serde_json::to_value(&all).unwrap(), json!({"type": "clear", "agent_id": null}));
    }

    #[test]
    fn test_payload_round_trips_through_untagged_enum() {
        let record = sample_record(3, "agent-1");
        let text = serde_json::to_string(&BroadcastPayload::from(record.clone())).unwrap();
        let back: BroadcastPayload = serde_json::from_str(&text).unwrap();
        assert_eq!(back, BroadcastPayload::Event(record));

        let back: BroadcastPayload = serde_json::from_str(r#"{"type":"clear","agent_id":null}"#).unwrap();
        assert_eq!(back, BroadcastPayload::Control(ControlMessage::Clear { agent_id: None }));
    }

    #[test]
    fn test_filter_matching() {
        let event = BroadcastPayload::from(sample_record(1, "agent-7"));
        assert!(event.matches(None));
        assert!(event.matches(Some("agent-7")));
        assert!(!event.matches(Some("agent-8")));

        let clear_all = BroadcastPayload::from(ControlMessage::Clear { agent_id: None });
        assert!(clear_all.matches(None));
        assert!(!clear_all.matches(Some("agent-7")));
    }
}
