use crate::broker::reader::read_subject;
use crate::broker::{Broker, BrokerMessage};
use crate::config::RetryPolicy;
use crate::error::{RelayError, StorageError};
use crate::models::{EventEnvelope, EventType};
use serde_json::{json, Value};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Storage collaborator for classified events. Queries return newest first.
pub trait EventStore: Send + Sync {
    fn save(&self, event: &EventEnvelope) -> Result<(), StorageError>;

    fn events_by_type(&self, event_type: EventType, limit: usize)
        -> Result<Vec<EventEnvelope>, StorageError>;

    fn events_by_device(&self, device_id: &str, limit: usize)
        -> Result<Vec<EventEnvelope>, StorageError>;

    fn events_by_date_range(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, StorageError>;

    fn count_by_type(&self, event_type: EventType) -> Result<u64, StorageError>;
}

/// Turns device and telemetry lifecycle messages into [`EventEnvelope`]s.
pub struct EventClassifier {
    /// `Some` only when event storage is enabled.
    store: Option<Arc<dyn EventStore>>,
}

impl EventClassifier {
    pub fn new(store: Option<Arc<dyn EventStore>>) -> Self {
        Self { store }
    }

    pub fn storage_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Builds the envelope for a message. Unknown subjects yield `Ok(None)`.
    pub fn classify(&self, subject: &str, payload: &[u8]) -> Result<Option<EventEnvelope>, RelayError> {
        let Some(event_type) = EventType::from_subject(subject) else {
            return Ok(None);
        };
        let payload: Value = serde_json::from_slice(payload)?;

        let device_id = match event_type {
            EventType::DeviceCreated | EventType::DeviceUpdated => {
                string_field(&payload, "deviceId").or_else(|| string_field(&payload, "_id"))
            }
            EventType::TelemetryReceived => string_field(&payload, "deviceId"),
        };
        let timestamp = OffsetDateTime::now_utc();

        Ok(Some(EventEnvelope {
            id: Uuid::new_v4(),
            event_type,
            source: event_type.source().to_string(),
            payload,
            device_id,
            timestamp,
            metadata: json!({
                "timestamp": timestamp.format(&Rfc3339).ok(),
                "processed": true,
            }),
        }))
    }

    /// Runs the whole pipeline for one message. Never fails: every error is logged here.
    pub fn process(&self, message: &BrokerMessage) {
        let envelope = match self.classify(&message.subject, &message.payload) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                info!("Unknown event type: {}", message.subject);
                return;
            }
            Err(e) => {
                warn!("Failed to parse event on '{}': {}", message.subject, e);
                return;
            }
        };

        info!(
            "Processing event: {} from {} (device: {:?})",
            envelope.event_type, envelope.source, envelope.device_id
        );

        if let Some(store) = &self.store {
            match store.save(&envelope) {
                Ok(()) => debug!("Event saved to database: {}", envelope.id),
                Err(e) => error!("Failed to save event {}: {}", envelope.event_type, e),
            }
        }

        apply_side_effect(&envelope);
    }

    /// One reader per classified subject, each independent of the others.
    pub fn spawn_readers(
        self: &Arc<Self>,
        broker: Arc<dyn Broker>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        info!(
            "Subscribing to event channels: {} (event storage {})",
            EventType::ALL.map(|t| t.subject()).join(", "),
            if self.storage_enabled() { "enabled" } else { "disabled" }
        );
        EventType::ALL
            .into_iter()
            .map(|event_type| {
                let classifier = self.clone();
                tokio::spawn(read_subject(
                    broker.clone(),
                    event_type.subject(),
                    policy,
                    cancel.clone(),
                    move |message| classifier.process(&message),
                ))
            })
            .collect()
    }
}

fn apply_side_effect(envelope: &EventEnvelope) {
    let device = envelope.device_id.as_deref().unwrap_or("<unknown>");
    match envelope.event_type {
        EventType::DeviceCreated => info!("New device created: {}", device),
        EventType::DeviceUpdated => info!("Device updated: {}", device),
        EventType::TelemetryReceived => info!("Telemetry received for device: {}", device),
    }
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::loopback::LoopbackBroker;
    use crate::db::DatabaseService;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn message(subject: &str, body: &str) -> BrokerMessage {
        BrokerMessage {
            subject: subject.to_string(),
            payload: body.as_bytes().to_vec(),
        }
    }

    fn database() -> Arc<DatabaseService> {
        let db = DatabaseService::in_memory(10).unwrap();
        db.initialize_db().unwrap();
        Arc::new(db)
    }

    #[test]
    fn test_classify_extracts_device_id() {
        let classifier = EventClassifier::new(None);

        let created = classifier
            .classify("device.created", br#"{"_id":"abc","name":"sensor"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(created.event_type, EventType::DeviceCreated);
        assert_eq!(created.source, "device-service");
        assert_eq!(created.device_id.as_deref(), Some("abc"));
        assert_eq!(created.payload["name"], "sensor");
        assert_eq!(created.metadata["processed"], true);
        let stamped = created.metadata["timestamp"].as_str().unwrap();
        assert_eq!(OffsetDateTime::parse(stamped, &Rfc3339).unwrap(), created.timestamp);

        let telemetry = classifier
            .classify("telemetry.received", br#"{"deviceId":"d1","_id":"x"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(telemetry.source, "telemetry-service");
        assert_eq!(telemetry.device_id.as_deref(), Some("d1"));

        let anonymous = classifier
            .classify("telemetry.received", br#"{"_id":"x"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(anonymous.device_id, None);
    }

    #[test]
    fn test_classify_unknown_and_malformed() {
        let classifier = EventClassifier::new(None);

        assert!(classifier.classify("device.deleted", b"{}").unwrap().is_none());
        assert!(matches!(
            classifier.classify("device.updated", b"{oops"),
            Err(RelayError::Parse(_))
        ));
    }

    #[test]
    fn test_process_persists_only_when_enabled() {
        let db = database();
        let enabled = EventClassifier::new(Some(db.clone() as Arc<dyn EventStore>));
        let disabled = EventClassifier::new(None);

        enabled.process(&message("device.updated", r#"{"deviceId":"d1"}"#));
        disabled.process(&message("device.updated", r#"{"deviceId":"d2"}"#));
        enabled.process(&message("device.updated", "not json"));
        enabled.process(&message("device.removed", r#"{"deviceId":"d1"}"#));

        let stored = db.events_by_type(EventType::DeviceUpdated, DEFAULT_QUERY_LIMIT).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].device_id.as_deref(), Some("d1"));
        assert!(!disabled.storage_enabled());
    }

    #[tokio::test]
    async fn test_readers_are_isolated_per_subject() {
        let db = database();
        let broker: Arc<dyn Broker> = Arc::new(LoopbackBroker::new(64));
        broker.connect().await.unwrap();
        let cancel = CancellationToken::new();
        let classifier = Arc::new(EventClassifier::new(Some(db.clone() as Arc<dyn EventStore>)));
        let policy = RetryPolicy {
            base_delay_ms: 10,
            max_delay_ms: 10,
            max_attempts: None,
        };
        let readers = classifier.spawn_readers(broker.clone(), policy, cancel.clone());
        assert_eq!(readers.len(), 3);
        sleep(Duration::from_millis(50)).await;

        broker
            .publish("device.created", b"garbage".to_vec())
            .await
            .unwrap();
        broker
            .publish("device.created", br#"{"deviceId":"d1"}"#.to_vec())
            .await
            .unwrap();
        broker
            .publish("telemetry.received", br#"{"deviceId":"d1"}"#.to_vec())
            .await
            .unwrap();

        let mut stored = 0;
        for _ in 0..50 {
            stored = db.events_by_device("d1", DEFAULT_QUERY_LIMIT).unwrap().len();
            if stored == 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stored, 2);

        cancel.cancel();
        for reader in readers {
            timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        }
    }
}
