//! Live subscriber registry for relayed telemetry.
//!
//! One reader drains the broker's `telemetry` subject and hands each record
//! to [`FanOutRegistry::dispatch`]. Every subscription owns a bounded queue
//! and a delivery task, so a slow sink only ever delays itself.

use crate::broker::reader::read_subject;
use crate::broker::{Broker, BrokerMessage, TELEMETRY_SUBJECT};
use crate::config::RetryPolicy;
use crate::error::{RelayError, SinkError};
use crate::models::TelemetryRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type SubscriptionId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionFilter {
    Device(String),
    All,
}

impl SubscriptionFilter {
    pub fn matches(&self, device_id: &str) -> bool {
        match self {
            SubscriptionFilter::Device(wanted) => wanted == device_id,
            SubscriptionFilter::All => true,
        }
    }
}

/// Destination of a subscription's records.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Returning [`SinkError::Closed`] removes the subscription; any other error is logged.
    async fn deliver(&self, record: &TelemetryRecord) -> Result<(), SinkError>;
}

/// Sink feeding a channel, backing [`LiveSubscription`].
pub struct ChannelSink {
    sender: mpsc::Sender<TelemetryRecord>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<TelemetryRecord>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl TelemetrySink for ChannelSink {
    async fn deliver(&self, record: &TelemetryRecord) -> Result<(), SinkError> {
        self.sender
            .send(record.clone())
            .await
            .map_err(|_| SinkError::Closed)
    }
}

struct SubscriptionEntry {
    filter: SubscriptionFilter,
    queue: mpsc::Sender<TelemetryRecord>,
    active: Arc<AtomicBool>,
}

pub struct FanOutRegistry {
    entries: RwLock<HashMap<SubscriptionId, Arc<SubscriptionEntry>>>,
    queue_capacity: usize,
    shutdown: CancellationToken,
}

impl FanOutRegistry {
    pub fn new(queue_capacity: usize, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            shutdown,
        })
    }

    /// Registers `sink` for every record dispatched from now on that passes `filter`.
    ///
    /// Must be called from within a tokio runtime: the delivery task is spawned here.
    pub fn subscribe(
        self: &Arc<Self>,
        filter: SubscriptionFilter,
        sink: Arc<dyn TelemetrySink>,
    ) -> SubscriptionId {
        let id = Uuid::new_v4();
        let (queue, pending) = mpsc::channel(self.queue_capacity);
        let active = Arc::new(AtomicBool::new(true));

        tokio::spawn(deliver(
            Arc::downgrade(self),
            id,
            pending,
            sink,
            active.clone(),
            self.shutdown.clone(),
        ));

        info!("Subscription {} registered ({:?}).", id, filter);
        self.write_entries().insert(
            id,
            Arc::new(SubscriptionEntry {
                filter,
                queue,
                active,
            }),
        );
        id
    }

    /// Opens a subscription whose records are read from the returned handle.
    pub fn open(self: &Arc<Self>, filter: SubscriptionFilter) -> LiveSubscription {
        let (sender, records) = mpsc::channel(self.queue_capacity);
        let id = self.subscribe(filter, Arc::new(ChannelSink::new(sender)));
        LiveSubscription {
            id,
            records,
            registry: Arc::downgrade(self),
        }
    }

    /// Removes a subscription. Records already handed to its sink may still land.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), RelayError> {
        let entry = self
            .write_entries()
            .remove(&id)
            .ok_or(RelayError::NotFound(id))?;
        entry.active.store(false, Ordering::SeqCst);
        info!("Subscription {} removed.", id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues `record` for every matching subscription and returns how many accepted it.
    pub fn dispatch(&self, record: &TelemetryRecord) -> usize {
        // Snapshot so subscribe/unsubscribe never wait on delivery.
        let targets: Vec<(SubscriptionId, Arc<SubscriptionEntry>)> = self
            .entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|(_, entry)| entry.filter.matches(&record.device_id))
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();

        let mut accepted = 0;
        for (id, entry) in targets {
            match entry.queue.try_send(record.clone()) {
                Ok(()) => accepted += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("Subscription {} is lagging, dropped record {}.", id, record.id)
                }
                Err(TrySendError::Closed(_)) => {
                    let _ = self.unsubscribe(id);
                }
            }
        }
        accepted
    }

    /// Decodes one broker message and dispatches it. Malformed payloads are logged and skipped.
    pub fn handle_message(&self, message: BrokerMessage) {
        match serde_json::from_slice::<TelemetryRecord>(&message.payload) {
            Ok(record) => {
                let accepted = self.dispatch(&record);
                debug!(
                    "Telemetry {} for device '{}' dispatched to {} subscriber(s).",
                    record.id, record.device_id, accepted
                );
            }
            Err(e) => warn!(
                "Dropping malformed message on '{}': {}",
                message.subject,
                RelayError::Parse(e)
            ),
        }
    }

    /// The dispatch loop: reads the `telemetry` subject until `cancel` fires.
    pub async fn run(self: Arc<Self>, broker: Arc<dyn Broker>, policy: RetryPolicy, cancel: CancellationToken) {
        read_subject(broker, TELEMETRY_SUBJECT, policy, cancel, move |message| {
            self.handle_message(message)
        })
        .await;
    }

    fn write_entries(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<SubscriptionId, Arc<SubscriptionEntry>>> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }
}

/// Delivery task of one subscription; ends when the subscription is gone.
async fn deliver(
    registry: Weak<FanOutRegistry>,
    id: SubscriptionId,
    mut pending: mpsc::Receiver<TelemetryRecord>,
    sink: Arc<dyn TelemetrySink>,
    active: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            _ = shutdown.cancelled() => break,
            record = pending.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };
        if !active.load(Ordering::SeqCst) {
            break;
        }

        match sink.deliver(&record).await {
            Ok(()) => {}
            Err(SinkError::Closed) => {
                info!("Sink of subscription {} closed.", id);
                if let Some(registry) = registry.upgrade() {
                    let _ = registry.unsubscribe(id);
                }
                break;
            }
            Err(e) => warn!("Subscription {} failed to take record {}: {}", id, record.id, e),
        }
    }
    debug!("Delivery task for subscription {} finished.", id);
}

/// Handle returned to live consumers. Dropping it unsubscribes.
pub struct LiveSubscription {
    id: SubscriptionId,
    records: mpsc::Receiver<TelemetryRecord>,
    registry: Weak<FanOutRegistry>,
}

impl LiveSubscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next matching record; `None` once the relay shuts down.
    pub async fn recv(&mut self) -> Option<TelemetryRecord> {
        self.records.recv().await
    }

    pub fn close(self) {}
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let _ = registry.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::loopback::LoopbackBroker;
    use crate::ingestion::IngestionService;
    use crate::retention::MemoryRetentionStore;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_millis(500);
    const QUIET: Duration = Duration::from_millis(100);

    fn registry() -> Arc<FanOutRegistry> {
        FanOutRegistry::new(16, CancellationToken::new())
    }

    async fn expect_record(live: &mut LiveSubscription) -> TelemetryRecord {
        timeout(WAIT, live.recv()).await.unwrap().unwrap()
    }

    async fn expect_nothing(live: &mut LiveSubscription) {
        assert!(timeout(QUIET, live.recv()).await.is_err());
    }

    #[derive(Default)]
    struct RecordingSink {
        records: Mutex<Vec<TelemetryRecord>>,
        error: Option<SinkError>,
        notify: Notify,
    }

    #[async_trait]
    impl TelemetrySink for RecordingSink {
        async fn deliver(&self, record: &TelemetryRecord) -> Result<(), SinkError> {
            self.records.lock().unwrap().push(record.clone());
            self.notify.notify_one();
            match &self.error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }
    }

    struct StuckSink;

    #[async_trait]
    impl TelemetrySink for StuckSink {
        async fn deliver(&self, _record: &TelemetryRecord) -> Result<(), SinkError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_device_filter_only_sees_its_device() {
        let registry = registry();
        let mut live = registry.open(SubscriptionFilter::Device("d1".to_string()));

        registry.dispatch(&TelemetryRecord::new("d2", "{}"));
        let wanted = TelemetryRecord::new("d1", "{}");
        registry.dispatch(&wanted);

        assert_eq!(expect_record(&mut live).await, wanted);
        expect_nothing(&mut live).await;
    }

    #[tokio::test]
    async fn test_device_and_match_all_each_receive_once() {
        let registry = registry();
        let mut device = registry.open(SubscriptionFilter::Device("d1".to_string()));
        let mut all = registry.open(SubscriptionFilter::All);

        let record = TelemetryRecord::new("d1", "{}");
        assert_eq!(registry.dispatch(&record), 2);

        assert_eq!(expect_record(&mut device).await, record);
        assert_eq!(expect_record(&mut all).await, record);
        expect_nothing(&mut device).await;
        expect_nothing(&mut all).await;
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let registry = registry();
        let sink = Arc::new(RecordingSink::default());
        let id = registry.subscribe(SubscriptionFilter::All, sink.clone());

        registry.unsubscribe(id).unwrap();
        assert_eq!(registry.dispatch(&TelemetryRecord::new("d1", "{}")), 0);
        sleep(QUIET).await;

        assert!(sink.records.lock().unwrap().is_empty());
        assert!(matches!(registry.unsubscribe(id), Err(RelayError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failing_sink_stays_active_and_closed_sink_is_removed() {
        let registry = registry();
        let failing = Arc::new(RecordingSink {
            error: Some(SinkError::Failed("boom".to_string())),
            ..Default::default()
        });
        let closed = Arc::new(RecordingSink {
            error: Some(SinkError::Closed),
            ..Default::default()
        });
        registry.subscribe(SubscriptionFilter::All, failing.clone());
        registry.subscribe(SubscriptionFilter::All, closed.clone());

        registry.dispatch(&TelemetryRecord::new("d1", "{}"));
        timeout(WAIT, failing.notify.notified()).await.unwrap();
        timeout(WAIT, closed.notify.notified()).await.unwrap();
        sleep(QUIET).await;

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.dispatch(&TelemetryRecord::new("d1", "{}")), 1);
        timeout(WAIT, failing.notify.notified()).await.unwrap();
        assert_eq!(failing.records.lock().unwrap().len(), 2);
        assert_eq!(closed.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stuck_sink_does_not_stall_others() {
        let registry = registry();
        registry.subscribe(SubscriptionFilter::All, Arc::new(StuckSink));
        let mut live = registry.open(SubscriptionFilter::All);

        for n in 0..40 {
            registry.dispatch(&TelemetryRecord::new("d1", n.to_string()));
            let record = expect_record(&mut live).await;
            assert_eq!(record.payload, n.to_string());
        }
    }

    #[tokio::test]
    async fn test_preserves_order_per_subscriber() {
        let registry = registry();
        let mut live = registry.open(SubscriptionFilter::Device("d1".to_string()));

        for n in 0..10 {
            registry.dispatch(&TelemetryRecord::new("d1", n.to_string()));
        }
        for n in 0..10 {
            assert_eq!(expect_record(&mut live).await.payload, n.to_string());
        }
    }

    #[tokio::test]
    async fn test_dropping_live_handle_unsubscribes() {
        let registry = registry();
        let live = registry.open(SubscriptionFilter::All);
        assert_eq!(registry.len(), 1);

        live.close();
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_malformed_message_is_skipped() {
        let registry = registry();
        let mut live = registry.open(SubscriptionFilter::All);

        registry.handle_message(BrokerMessage {
            subject: TELEMETRY_SUBJECT.to_string(),
            payload: b"not json".to_vec(),
        });
        let record = TelemetryRecord::new("d1", "{}");
        registry.handle_message(BrokerMessage {
            subject: TELEMETRY_SUBJECT.to_string(),
            payload: serde_json::to_vec(&record).unwrap(),
        });

        assert_eq!(expect_record(&mut live).await, record);
    }

    #[tokio::test]
    async fn test_ingest_reaches_subscribers_through_broker() {
        let broker: Arc<dyn Broker> = Arc::new(LoopbackBroker::new(64));
        broker.connect().await.unwrap();
        let cancel = CancellationToken::new();
        let registry = FanOutRegistry::new(16, cancel.clone());
        let policy = RetryPolicy {
            base_delay_ms: 10,
            max_delay_ms: 10,
            max_attempts: None,
        };
        let reader = tokio::spawn(registry.clone().run(broker.clone(), policy, cancel.clone()));
        let ingestion = IngestionService::new(Arc::new(MemoryRetentionStore::new(10)), broker.clone());

        let mut live = registry.open(SubscriptionFilter::Device("d1".to_string()));
        // The reader subscribes asynchronously; ingest until it is in place.
        let mut ingested = Vec::new();
        let mut received = None;
        for _ in 0..50 {
            ingestion.ingest("d2", "{}").await.unwrap();
            ingested.push(ingestion.ingest("d1", "{}").await.unwrap());
            if let Ok(Some(record)) = timeout(Duration::from_millis(20), live.recv()).await {
                received = Some(record);
                break;
            }
        }
        let received = received.unwrap();
        assert_eq!(received.device_id, "d1");
        assert!(ingested.contains(&received));

        live.close();
        ingestion.ingest("d1", "{}").await.unwrap();
        cancel.cancel();
        timeout(WAIT, reader).await.unwrap().unwrap();
    }
}
