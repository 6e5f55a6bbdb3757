use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// One telemetry submission as stored and broadcast by the relay.
///
/// The payload is kept as the producer sent it; the relay never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub id: Uuid,
    pub device_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub payload: String,
}

impl TelemetryRecord {
    /// Creates a record with a fresh id, stamped with the current time.
    pub fn new(device_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            timestamp: OffsetDateTime::now_utc(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "device.created")]
    DeviceCreated,
    #[serde(rename = "device.updated")]
    DeviceUpdated,
    #[serde(rename = "telemetry.received")]
    TelemetryReceived,
}

impl EventType {
    pub const ALL: [EventType; 3] = [
        EventType::DeviceCreated,
        EventType::DeviceUpdated,
        EventType::TelemetryReceived,
    ];

    /// The broker subject carrying this event type.
    pub fn subject(&self) -> &'static str {
        match self {
            EventType::DeviceCreated => "device.created",
            EventType::DeviceUpdated => "device.updated",
            EventType::TelemetryReceived => "telemetry.received",
        }
    }

    /// Name of the service that emits this event type.
    pub fn source(&self) -> &'static str {
        match self {
            EventType::DeviceCreated | EventType::DeviceUpdated => "device-service",
            EventType::TelemetryReceived => "telemetry-service",
        }
    }

    pub fn from_subject(subject: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.subject() == subject)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subject())
    }
}

/// Normalized form of a classified broker event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub id: Uuid,
    pub event_type: EventType,
    pub source: String,
    pub payload: Value,
    pub device_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub metadata: Value,
}
