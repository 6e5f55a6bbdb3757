use crate::classifier::EventStore;
use crate::error::StorageError;
use crate::models::{EventEnvelope, EventType, TelemetryRecord};
use crate::retention::RetentionStore;
use log::{debug, error, info};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row, TransactionBehavior};
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

pub struct DatabaseService {
    pool: Pool<SqliteConnectionManager>,
    max_records_per_device: usize,
}

impl DatabaseService {
    /// Creates a new `DatabaseService` backed by the SQLite file at `db_path`.
    /// `:memory:` opens a private in-memory database instead.
    pub fn new(db_path: &str, max_records_per_device: usize) -> Result<Self, StorageError> {
        if db_path == ":memory:" {
            return Self::in_memory(max_records_per_device);
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|conn| conn.busy_timeout(Duration::from_secs(5)));
        let pool = Pool::builder().build(manager)?;
        Ok(Self {
            pool,
            max_records_per_device: max_records_per_device.max(1),
        })
    }

    /// An in-memory database. The pool holds a single connection that is never
    /// recycled, so every caller sees the same database for the pool's lifetime.
    pub fn in_memory(max_records_per_device: usize) -> Result<Self, StorageError> {
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(SqliteConnectionManager::memory())?;
        Ok(Self {
            pool,
            max_records_per_device: max_records_per_device.max(1),
        })
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<(), StorageError> {
        let conn = self.pool.get()?;

        info!("Initializing database schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS telemetry_records (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            device_id TEXT NOT NULL,
            timestamp_ns INTEGER NOT NULL,
            payload TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_telemetry_device_time
            ON telemetry_records (device_id, timestamp_ns DESC);

        CREATE TABLE IF NOT EXISTS events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            event_type TEXT NOT NULL,
            source TEXT NOT NULL,
            device_id TEXT,
            timestamp_ns INTEGER NOT NULL,
            payload TEXT NOT NULL,
            metadata TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_type_time ON events (event_type, timestamp_ns DESC);
        CREATE INDEX IF NOT EXISTS idx_events_device_time ON events (device_id, timestamp_ns DESC);
        "#,
        ) {
            Ok(_) => {
                info!("Database schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize database schema: {:?}", e);
                Err(e.into())
            }
        }
    }

    fn query_events(
        &self,
        filter: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<EventEnvelope>, StorageError> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT id, event_type, source, device_id, timestamp_ns, payload, metadata
             FROM events WHERE {}
             ORDER BY timestamp_ns DESC, seq DESC
             LIMIT ?",
            filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args, RawEvent::from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?.decode()?);
        }
        Ok(results)
    }
}

impl RetentionStore for DatabaseService {
    /// Inserts the record and trims the device's rows beyond the bound in one transaction.
    fn append(&self, record: TelemetryRecord) -> Result<(), StorageError> {
        let mut conn = self.pool.get()?;
        // Immediate: concurrent appends for one device must not interleave insert and trim.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO telemetry_records (id, device_id, timestamp_ns, payload)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.id.to_string(),
                record.device_id,
                to_nanos(record.timestamp)?,
                record.payload
            ],
        )?;

        let evicted = tx.execute(
            "DELETE FROM telemetry_records
             WHERE device_id = ?1 AND seq NOT IN (
                 SELECT seq
                 FROM telemetry_records
                 WHERE device_id = ?1
                 ORDER BY timestamp_ns DESC, seq DESC
                 LIMIT ?2
             )",
            params![record.device_id, self.max_records_per_device as i64],
        )?;
        tx.commit()?;

        if evicted > 0 {
            debug!("Evicted {} record(s) for device '{}'.", evicted, record.device_id);
        }
        Ok(())
    }

    fn read_recent(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<TelemetryRecord>, StorageError> {
        let conn = self.pool.get()?;

        let mut stmt = conn.prepare(
            "SELECT id, device_id, timestamp_ns, payload
             FROM telemetry_records
             WHERE device_id = ?1
             ORDER BY timestamp_ns DESC, seq DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![device_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (id, device_id, timestamp_ns, payload) = row?;
            results.push(TelemetryRecord {
                id: parse_uuid(&id)?,
                device_id,
                timestamp: from_nanos(timestamp_ns)?,
                payload,
            });
        }
        Ok(results)
    }

    fn max_records_per_device(&self) -> usize {
        self.max_records_per_device
    }
}

impl EventStore for DatabaseService {
    fn save(&self, event: &EventEnvelope) -> Result<(), StorageError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO events (id, event_type, source, device_id, timestamp_ns, payload, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.id.to_string(),
                event.event_type.subject(),
                event.source,
                event.device_id,
                to_nanos(event.timestamp)?,
                event.payload.to_string(),
                event.metadata.to_string()
            ],
        )?;
        Ok(())
    }

    fn events_by_type(
        &self,
        event_type: EventType,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, StorageError> {
        self.query_events(
            "event_type = ?",
            params![event_type.subject(), limit as i64],
        )
    }

    fn events_by_device(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, StorageError> {
        self.query_events("device_id = ?", params![device_id, limit as i64])
    }

    fn events_by_date_range(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, StorageError> {
        self.query_events(
            "timestamp_ns >= ? AND timestamp_ns <= ?",
            params![clamp_nanos(start), clamp_nanos(end), limit as i64],
        )
    }

    fn count_by_type(&self, event_type: EventType) -> Result<u64, StorageError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE event_type = ?1",
            params![event_type.subject()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

/// Columns of an `events` row before JSON and enum decoding.
struct RawEvent {
    id: String,
    event_type: String,
    source: String,
    device_id: Option<String>,
    timestamp_ns: i64,
    payload: String,
    metadata: String,
}

impl RawEvent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            event_type: row.get(1)?,
            source: row.get(2)?,
            device_id: row.get(3)?,
            timestamp_ns: row.get(4)?,
            payload: row.get(5)?,
            metadata: row.get(6)?,
        })
    }

    fn decode(self) -> Result<EventEnvelope, StorageError> {
        let event_type = EventType::from_subject(&self.event_type).ok_or_else(|| {
            StorageError::Encoding(format!("unknown event type '{}'", self.event_type))
        })?;
        Ok(EventEnvelope {
            id: parse_uuid(&self.id)?,
            event_type,
            source: self.source,
            payload: serde_json::from_str(&self.payload)
                .map_err(|e| StorageError::Encoding(e.to_string()))?,
            device_id: self.device_id,
            timestamp: from_nanos(self.timestamp_ns)?,
            metadata: serde_json::from_str(&self.metadata)
                .map_err(|e| StorageError::Encoding(e.to_string()))?,
        })
    }
}

fn to_nanos(timestamp: OffsetDateTime) -> Result<i64, StorageError> {
    i64::try_from(timestamp.unix_timestamp_nanos())
        .map_err(|_| StorageError::Encoding(format!("timestamp {} out of range", timestamp)))
}

/// Query bounds outside the storable range saturate instead of failing.
fn clamp_nanos(timestamp: OffsetDateTime) -> i64 {
    let nanos = timestamp.unix_timestamp_nanos();
    i64::try_from(nanos).unwrap_or(if nanos < 0 { i64::MIN } else { i64::MAX })
}

fn from_nanos(nanos: i64) -> Result<OffsetDateTime, StorageError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
        .map_err(|e| StorageError::Encoding(e.to_string()))
}

fn parse_uuid(value: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(value).map_err(|e| StorageError::Encoding(e.to_string()))
}
