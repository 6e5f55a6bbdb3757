use super::router::SubjectRouter;
use super::{Broker, ConnectionState, MessageStream};
use crate::config::{Config, RetryPolicy};
use crate::error::RelayError;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

/// Relay traffic is fire-and-forget: no acknowledgements are requested.
const RELAY_QOS: QoS = QoS::AtMostOnce;

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub reconnect: RetryPolicy,
    pub connect_timeout: Duration,
    pub drain_timeout: Duration,
    pub request_capacity: usize,
    pub stream_capacity: usize,
}

impl MqttSettings {
    pub fn new(config: &Config, host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            client_id: config.broker_client_id.clone(),
            username: config.broker_username.clone(),
            password: config.broker_password.clone(),
            reconnect: config.reconnect_policy(),
            connect_timeout: config.connect_timeout(),
            drain_timeout: config.drain_timeout(),
            request_capacity: 64,
            stream_capacity: 1024,
        }
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(&self.client_id, &self.host, self.port);
        mqtt_options.set_keep_alive(Duration::from_secs(10));
        mqtt_options.set_clean_session(true);

        if !self.username.is_empty() && !self.password.is_empty() {
            mqtt_options.set_credentials(&self.username, &self.password);
        }
        mqtt_options
    }
}

/// State reachable from both the manager and its event loop driver.
struct Shared {
    state: watch::Sender<ConnectionState>,
    client: Mutex<Option<AsyncClient>>,
    router: SubjectRouter,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("MQTT connection state {:?} -> {:?}", previous, state);
        }
    }

    /// Re-issues SUBSCRIBE for every subject with open streams after a reconnect.
    async fn resubscribe(&self) {
        let client = self.client.lock().await.clone();
        let Some(client) = client else {
            return;
        };
        for subject in self.router.subjects() {
            match client.try_subscribe(subject.as_str(), RELAY_QOS) {
                Ok(()) => debug!("Resubscribed to subject '{}'.", subject),
                Err(e) => {
                    error!("Failed to resubscribe to '{}', closing its streams: {}", subject, e);
                    self.router.close(&subject);
                }
            }
        }
    }
}

struct Driver {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Owns the single MQTT connection of the process.
///
/// Reconnection is delegated to the event loop driver task, which re-polls
/// the rumqttc event loop after an exponential backoff until the configured
/// attempts run out. Once they do, every open stream ends and the state
/// settles on `Disconnected` until `connect()` is called again.
pub struct BrokerConnectionManager {
    settings: MqttSettings,
    shared: Arc<Shared>,
    driver: Mutex<Option<Driver>>,
}

impl BrokerConnectionManager {
    pub fn new(settings: MqttSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let router = SubjectRouter::new(settings.stream_capacity);
        Self {
            settings,
            shared: Arc::new(Shared {
                state,
                client: Mutex::new(None),
                router,
            }),
            driver: Mutex::new(None),
        }
    }

    async fn await_handshake(&self) -> Result<(), RelayError> {
        let mut state = self.watch_state();
        let outcome = timeout(
            self.settings.connect_timeout,
            state.wait_for(|s| {
                matches!(s, ConnectionState::Connected | ConnectionState::Disconnected)
            }),
        )
        .await;

        match outcome {
            Ok(Ok(reached)) if *reached == ConnectionState::Connected => Ok(()),
            Ok(_) => Err(RelayError::Broker(format!(
                "could not connect to {}:{}, reconnect attempts exhausted",
                self.settings.host, self.settings.port
            ))),
            Err(_) => Err(RelayError::Broker(format!(
                "no handshake with {}:{} within {:?}, still retrying in the background",
                self.settings.host, self.settings.port, self.settings.connect_timeout
            ))),
        }
    }
}

#[async_trait]
impl Broker for BrokerConnectionManager {
    async fn connect(&self) -> Result<(), RelayError> {
        if self.is_connected() {
            return Ok(());
        }

        {
            let mut driver = self.driver.lock().await;
            let running = driver.as_ref().is_some_and(|d| !d.handle.is_finished());
            if !running {
                info!(
                    "Connecting to MQTT broker at {}:{}...",
                    self.settings.host, self.settings.port
                );
                let (client, eventloop) =
                    AsyncClient::new(self.settings.mqtt_options(), self.settings.request_capacity);
                *self.shared.client.lock().await = Some(client);
                self.shared.set_state(ConnectionState::Connecting);

                let cancel = CancellationToken::new();
                let handle = tokio::spawn(drive(
                    self.shared.clone(),
                    eventloop,
                    self.settings.reconnect,
                    cancel.clone(),
                ));
                *driver = Some(Driver { handle, cancel });
            }
        }

        self.await_handshake().await
    }

    async fn disconnect(&self) -> Result<(), RelayError> {
        let Some(mut driver) = self.driver.lock().await.take() else {
            return Ok(());
        };

        let was_connected = self.is_connected();
        self.shared.set_state(ConnectionState::Draining);
        info!("Draining MQTT connection...");

        let mut drained = false;
        if was_connected {
            let client = self.shared.client.lock().await.clone();
            if let Some(client) = client {
                match client.try_disconnect() {
                    Ok(()) => {
                        drained = timeout(self.settings.drain_timeout, &mut driver.handle)
                            .await
                            .is_ok();
                    }
                    Err(e) => warn!("Failed to request MQTT disconnect: {}", e),
                }
            }
        }

        if !drained {
            driver.cancel.cancel();
            if let Err(e) = driver.handle.await {
                error!("MQTT event loop task failed: {}", e);
            }
        }

        self.shared.router.close_all();
        *self.shared.client.lock().await = None;
        self.shared.set_state(ConnectionState::Disconnected);
        info!("Disconnected from MQTT broker.");
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), RelayError> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        let client = self
            .shared
            .client
            .lock()
            .await
            .clone()
            .ok_or(RelayError::NotConnected)?;

        client
            .try_publish(subject, RELAY_QOS, false, payload)
            .map_err(|e| RelayError::Broker(e.to_string()))
    }

    async fn subscribe(&self, subject: &str) -> Result<MessageStream, RelayError> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        let client = self
            .shared
            .client
            .lock()
            .await
            .clone()
            .ok_or(RelayError::NotConnected)?;

        let (stream, first) = self.shared.router.open(subject);
        if first {
            if let Err(e) = client.subscribe(subject, RELAY_QOS).await {
                error!("Failed to subscribe to topic '{}': {}", subject, e);
                self.shared.router.close(subject);
                return Err(RelayError::Broker(e.to_string()));
            }
            info!("Successfully subscribed to topic '{}'.", subject);
        }
        Ok(stream)
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }
}

/// Polls the rumqttc event loop until cancelled, disconnected or out of retries.
async fn drive(
    shared: Arc<Shared>,
    mut eventloop: EventLoop,
    policy: RetryPolicy,
    cancel: CancellationToken,
) {
    let mut delays = policy.delays();
    let mut sessions: u64 = 0;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                sessions += 1;
                if sessions > 1 {
                    info!("Reconnected to MQTT broker.");
                    shared.resubscribe().await;
                } else {
                    info!("Connected to MQTT broker.");
                }
                delays = policy.delays();
                shared.set_state(ConnectionState::Connected);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                shared.router.route(&publish.topic, publish.payload.to_vec());
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent, stopping MQTT event loop.");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if shared.state() == ConnectionState::Draining {
                    debug!("MQTT event loop closed while draining: {:?}", e);
                    break;
                }
                error!("Error in MQTT event loop: {:?}", e);
                shared.set_state(ConnectionState::Connecting);

                match delays.next() {
                    Some(delay) => {
                        warn!("Lost connection to MQTT broker. Retrying in {:?}...", delay);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = sleep(delay) => {}
                        }
                    }
                    None => {
                        error!("Maximum number of reconnect attempts reached. Giving up.");
                        break;
                    }
                }
            }
        }
    }

    shared.router.close_all();
    *shared.client.lock().await = None;
    shared.set_state(ConnectionState::Disconnected);
}
