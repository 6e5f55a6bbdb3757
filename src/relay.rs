use crate::broker::loopback::LoopbackBroker;
use crate::broker::mqtt::{BrokerConnectionManager, MqttSettings};
use crate::broker::Broker;
use crate::classifier::{EventClassifier, EventStore};
use crate::commands::CommandPublisher;
use crate::config::{BrokerEndpoint, Config, RetentionBackend, RetryPolicy};
use crate::db::DatabaseService;
use crate::error::StorageError;
use crate::fanout::FanOutRegistry;
use crate::ingestion::IngestionService;
use crate::retention::{MemoryRetentionStore, RetentionStore};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const LOOPBACK_STREAM_CAPACITY: usize = 1024;

/// Owns the broker connection and every long-lived reader of the process.
///
/// Built once at startup; `start` connects and spawns the readers, `shutdown`
/// cancels them and closes the connection.
pub struct TelemetryRelay {
    broker: Arc<dyn Broker>,
    registry: Arc<FanOutRegistry>,
    ingestion: IngestionService,
    commands: CommandPublisher,
    classifier: Arc<EventClassifier>,
    events: Option<Arc<dyn EventStore>>,
    reader_policy: RetryPolicy,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TelemetryRelay {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn RetentionStore>,
        events: Option<Arc<dyn EventStore>>,
        subscriber_queue_capacity: usize,
        reader_policy: RetryPolicy,
    ) -> Self {
        let cancel = CancellationToken::new();
        Self {
            registry: FanOutRegistry::new(subscriber_queue_capacity, cancel.child_token()),
            ingestion: IngestionService::new(store, broker.clone()),
            commands: CommandPublisher::new(broker.clone()),
            classifier: Arc::new(EventClassifier::new(events.clone())),
            events,
            broker,
            reader_policy,
            cancel,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, StorageError> {
        let broker: Arc<dyn Broker> = match &config.broker_endpoint {
            BrokerEndpoint::Mqtt { host, port } => Arc::new(BrokerConnectionManager::new(
                MqttSettings::new(config, host, *port),
            )),
            BrokerEndpoint::Loopback => Arc::new(LoopbackBroker::new(LOOPBACK_STREAM_CAPACITY)),
        };

        let database = if config.retention_backend == RetentionBackend::Sqlite
            || config.enable_event_storage
        {
            let db = Arc::new(DatabaseService::new(
                &config.database_path,
                config.max_records_per_device,
            )?);
            db.initialize_db()?;
            Some(db)
        } else {
            None
        };

        let store: Arc<dyn RetentionStore> = match (&database, config.retention_backend) {
            (Some(db), RetentionBackend::Sqlite) => db.clone(),
            _ => Arc::new(MemoryRetentionStore::new(config.max_records_per_device)),
        };
        let events = match database {
            Some(db) if config.enable_event_storage => Some(db as Arc<dyn EventStore>),
            _ => None,
        };
        info!(
            "Relay configured: retention {:?} (max {} per device), event storage {}.",
            config.retention_backend,
            config.max_records_per_device,
            if events.is_some() { "enabled" } else { "disabled" }
        );

        Ok(Self::new(
            broker,
            store,
            events,
            config.subscriber_queue_capacity,
            config.reader_policy(),
        ))
    }

    /// Connects to the broker and spawns the dispatch and classifier readers.
    ///
    /// A failed connect is logged only. While the connection manager keeps
    /// retrying, the readers retry with it; once it gives up they end.
    pub async fn start(&self) {
        if let Err(e) = self.broker.connect().await {
            error!("Failed to connect to broker: {}", e);
        }

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(self.registry.clone().run(
            self.broker.clone(),
            self.reader_policy,
            self.cancel.child_token(),
        )));
        tasks.extend(self.classifier.spawn_readers(
            self.broker.clone(),
            self.reader_policy,
            self.cancel.child_token(),
        ));
        info!("Relay started with {} reader(s).", tasks.len());
    }

    /// Stops every reader and delivery task, then disconnects from the broker.
    pub async fn shutdown(&self) {
        info!("Relay is shutting down...");
        if !self.registry.is_empty() {
            info!("Closing {} live subscription(s).", self.registry.len());
        }
        self.cancel.cancel();

        if let Err(e) = self.broker.disconnect().await {
            warn!("Broker disconnect failed: {}", e);
        }

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Reader task ended abnormally: {}", e);
            }
        }
        info!("Relay stopped.");
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn registry(&self) -> &Arc<FanOutRegistry> {
        &self.registry
    }

    pub fn ingestion(&self) -> &IngestionService {
        &self.ingestion
    }

    pub fn commands(&self) -> &CommandPublisher {
        &self.commands
    }

    pub fn events(&self) -> Option<&Arc<dyn EventStore>> {
        self.events.as_ref()
    }
}

/// Waits for Ctrl-C.
pub async fn handle_shutdown() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Termination signal received."),
        Err(e) => error!("Failed to handle termination signal: {:?}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ConnectionState;
    use crate::fanout::SubscriptionFilter;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::time::timeout;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let mut vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        vars.entry("BROKER_URL".to_string())
            .or_insert_with(|| "memory://".to_string());
        vars.insert("BROKER_RECONNECT_DELAY_MS".to_string(), "100".to_string());
        vars.insert("BROKER_MAX_RECONNECT_DELAY_MS".to_string(), "100".to_string());
        Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_over_loopback() {
        let relay = TelemetryRelay::from_config(&config(&[("MAX_TELEMETRY_RECORDS_PER_DEVICE", "2")])).unwrap();
        relay.start().await;
        assert!(relay.broker().is_connected());

        let mut live = relay.registry().open(SubscriptionFilter::Device("d1".to_string()));
        let mut received = None;
        for _ in 0..50 {
            let record = relay.ingestion().ingest("d1", "{}").await.unwrap();
            if let Ok(Some(got)) = timeout(Duration::from_millis(20), live.recv()).await {
                received = Some((record, got));
                break;
            }
        }
        let (_, got) = received.unwrap();
        assert_eq!(got.device_id, "d1");
        assert_eq!(relay.ingestion().read_recent("d1", None).unwrap().len(), 2);

        timeout(Duration::from_secs(2), relay.shutdown()).await.unwrap();
        assert_eq!(relay.broker().state(), ConnectionState::Disconnected);
        assert_eq!(timeout(Duration::from_secs(1), live.recv()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_start_survives_unreachable_broker() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("mqtt://127.0.0.1:{}", port);
        let relay = TelemetryRelay::from_config(&config(&[
            ("BROKER_URL", url.as_str()),
            ("BROKER_MAX_RECONNECT_ATTEMPTS", "0"),
        ]))
        .unwrap();

        relay.start().await;
        assert!(!relay.broker().is_connected());
        for task in relay.tasks.lock().await.iter() {
            for _ in 0..100 {
                if task.is_finished() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(task.is_finished());
        }

        let record = relay.ingestion().ingest("d1", "{}").await.unwrap();
        assert_eq!(relay.ingestion().read_recent("d1", None).unwrap(), vec![record]);

        timeout(Duration::from_secs(2), relay.shutdown()).await.unwrap();
    }

    #[tokio::test]
    async fn test_event_storage_follows_flag() {
        let disabled = TelemetryRelay::from_config(&config(&[])).unwrap();
        assert!(disabled.events().is_none());

        let enabled = TelemetryRelay::from_config(&config(&[
            ("ENABLE_EVENT_STORAGE", "true"),
            ("DATABASE_PATH", ":memory:"),
        ]))
        .unwrap();
        assert!(enabled.events().is_some());
    }
}
