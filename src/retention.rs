use crate::error::StorageError;
use crate::models::TelemetryRecord;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

/// Bounded, per-device storage of the most recent telemetry records.
pub trait RetentionStore: Send + Sync {
    /// Stores `record` under its device and evicts the oldest records beyond the bound.
    fn append(&self, record: TelemetryRecord) -> Result<(), StorageError>;

    /// Up to `limit` records for `device_id`, newest first. Unknown devices yield an empty list.
    fn read_recent(&self, device_id: &str, limit: usize)
        -> Result<Vec<TelemetryRecord>, StorageError>;

    fn max_records_per_device(&self) -> usize;
}

type Bucket = Arc<Mutex<VecDeque<TelemetryRecord>>>;

/// In-memory retention store. Each device has its own bucket lock, so appends
/// for different devices never contend.
pub struct MemoryRetentionStore {
    buckets: RwLock<HashMap<String, Bucket>>,
    max_records_per_device: usize,
}

impl MemoryRetentionStore {
    pub fn new(max_records_per_device: usize) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            max_records_per_device: max_records_per_device.max(1),
        }
    }

    fn bucket(&self, device_id: &str) -> Option<Bucket> {
        self.buckets
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(device_id)
            .cloned()
    }

    fn bucket_or_create(&self, device_id: &str) -> Bucket {
        if let Some(bucket) = self.bucket(device_id) {
            return bucket;
        }
        self.buckets
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }
}

impl RetentionStore for MemoryRetentionStore {
    fn append(&self, record: TelemetryRecord) -> Result<(), StorageError> {
        let bucket = self.bucket_or_create(&record.device_id);
        let mut records = bucket.lock().unwrap_or_else(|p| p.into_inner());

        // Oldest at the front. Records normally arrive in timestamp order, so
        // the insertion point is almost always the back.
        let position = records
            .iter()
            .rposition(|existing| existing.timestamp <= record.timestamp)
            .map_or(0, |i| i + 1);
        records.insert(position, record);

        let evicted = records.len().saturating_sub(self.max_records_per_device);
        records.drain(..evicted);
        Ok(())
    }

    fn read_recent(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<TelemetryRecord>, StorageError> {
        let Some(bucket) = self.bucket(device_id) else {
            return Ok(Vec::new());
        };
        let records = bucket.lock().unwrap_or_else(|p| p.into_inner());
        Ok(records.iter().rev().take(limit).cloned().collect())
    }

    fn max_records_per_device(&self) -> usize {
        self.max_records_per_device
    }
}
