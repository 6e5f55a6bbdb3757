use super::{closed, Broker, BrokerMessage};
use crate::config::RetryPolicy;
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives `handler` with every message on `subject` until `cancel` fires or
/// the broker is closed.
///
/// When the stream ends or the broker refuses the subscription while still
/// connecting, the reader backs off and subscribes again, so a reader
/// outlives reconnects. Once the broker reports `Disconnected` (explicit
/// disconnect or exhausted reconnects) the reader returns.
pub async fn read_subject<F>(
    broker: Arc<dyn Broker>,
    subject: &str,
    policy: RetryPolicy,
    cancel: CancellationToken,
    mut handler: F,
) where
    F: FnMut(BrokerMessage) + Send,
{
    let mut state = broker.watch_state();
    let mut delays = policy.delays();

    loop {
        let subscribed = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = closed(&mut state) => {
                info!("Broker closed, no subscription for '{}'.", subject);
                break;
            }
            result = broker.subscribe(subject) => result,
        };

        match subscribed {
            Ok(mut stream) => {
                info!("Reading subject '{}'.", stream.subject());
                delays = policy.delays();
                loop {
                    let message = tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("Reader for subject '{}' stopped.", subject);
                            return;
                        }
                        message = stream.recv() => message,
                    };
                    match message {
                        Some(message) => handler(message),
                        None => {
                            warn!("Stream for subject '{}' terminated.", subject);
                            break;
                        }
                    }
                }
            }
            Err(e) => debug!("Cannot subscribe to '{}' yet: {}", subject, e),
        }

        let Some(delay) = delays.next() else {
            warn!("Giving up on subject '{}'.", subject);
            break;
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = closed(&mut state) => break,
            _ = sleep(delay) => {}
        }
    }

    info!("Reader for subject '{}' stopped.", subject);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::loopback::LoopbackBroker;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: 20,
            max_delay_ms: 20,
            max_attempts: None,
        }
    }

    fn spawn_reader(
        broker: Arc<dyn Broker>,
        cancel: CancellationToken,
    ) -> (tokio::task::JoinHandle<()>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_subject(
            broker,
            "telemetry",
            fast_policy(),
            cancel,
            move |message| {
                let _ = tx.send(message.payload);
            },
        ));
        (reader, rx)
    }

    /// Publishes `payload` until the reader hands it over.
    async fn publish_until_read(
        broker: &Arc<dyn Broker>,
        rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
        payload: &[u8],
    ) -> bool {
        for _ in 0..50 {
            broker.publish("telemetry", payload.to_vec()).await.unwrap();
            if let Ok(Some(received)) = timeout(Duration::from_millis(20), rx.recv()).await {
                if received == payload {
                    return true;
                }
            }
        }
        false
    }

    #[tokio::test]
    async fn test_reader_resubscribes_after_lost_stream() {
        let loopback = Arc::new(LoopbackBroker::new(8));
        let broker: Arc<dyn Broker> = loopback.clone();
        broker.connect().await.unwrap();
        let cancel = CancellationToken::new();
        let (reader, mut rx) = spawn_reader(broker.clone(), cancel.clone());

        assert!(publish_until_read(&broker, &mut rx, b"first").await);

        loopback.interrupt("telemetry");
        assert!(publish_until_read(&broker, &mut rx, b"second").await);

        cancel.cancel();
        timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reader_ends_when_broker_disconnects() {
        let broker: Arc<dyn Broker> = Arc::new(LoopbackBroker::new(8));
        broker.connect().await.unwrap();
        let (reader, mut rx) = spawn_reader(broker.clone(), CancellationToken::new());
        assert!(publish_until_read(&broker, &mut rx, b"x").await);

        broker.disconnect().await.unwrap();

        timeout(Duration::from_secs(2), reader).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reader_on_closed_broker_returns_at_once() {
        let broker: Arc<dyn Broker> = Arc::new(LoopbackBroker::new(8));
        let (reader, _rx) = spawn_reader(broker, CancellationToken::new());

        timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reader_stops_promptly_on_cancel() {
        let broker: Arc<dyn Broker> = Arc::new(LoopbackBroker::new(8));
        broker.connect().await.unwrap();
        let cancel = CancellationToken::new();
        let (reader, _rx) = spawn_reader(broker, cancel.clone());

        cancel.cancel();

        assert!(timeout(Duration::from_secs(1), reader).await.is_ok());
    }
}
