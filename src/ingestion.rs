use crate::broker::{Broker, TELEMETRY_SUBJECT};
use crate::error::RelayError;
use crate::models::TelemetryRecord;
use crate::retention::RetentionStore;
use std::sync::Arc;
use tracing::{debug, warn};

/// Write side of the relay: persist first, then broadcast best-effort.
pub struct IngestionService {
    store: Arc<dyn RetentionStore>,
    broker: Arc<dyn Broker>,
}

impl IngestionService {
    pub fn new(store: Arc<dyn RetentionStore>, broker: Arc<dyn Broker>) -> Self {
        Self { store, broker }
    }

    /// Stores a new record for `device_id` and publishes it on `telemetry`.
    ///
    /// Only a storage failure fails the call. A failed publish is logged and
    /// the stored record is still returned.
    pub async fn ingest(
        &self,
        device_id: &str,
        payload: impl Into<String>,
    ) -> Result<TelemetryRecord, RelayError> {
        if device_id.trim().is_empty() {
            return Err(RelayError::InvalidRequest("deviceId must not be empty".to_string()));
        }

        let record = TelemetryRecord::new(device_id, payload);
        self.store.append(record.clone())?;

        match serde_json::to_vec(&record) {
            Ok(body) => match self.broker.publish(TELEMETRY_SUBJECT, body).await {
                Ok(()) => debug!("Published telemetry {} for device '{}'.", record.id, device_id),
                Err(e) => warn!(
                    "Telemetry {} for device '{}' stored but not broadcast: {}",
                    record.id, device_id, e
                ),
            },
            Err(e) => warn!("Failed to serialize telemetry {}: {}", record.id, e),
        }

        Ok(record)
    }

    /// Most recent records for `device_id`, newest first. `None` means the retention bound.
    pub fn read_recent(
        &self,
        device_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<TelemetryRecord>, RelayError> {
        let limit = limit.unwrap_or_else(|| self.store.max_records_per_device());
        Ok(self.store.read_recent(device_id, limit)?)
    }
}
