use super::router::SubjectRouter;
use super::{Broker, ConnectionState, MessageStream};
use crate::error::RelayError;
use async_trait::async_trait;
use log::info;
use tokio::sync::watch;

/// In-process broker: publishes are routed straight to local subscribers.
///
/// Selected with `BROKER_URL=memory://` for single-process deployments, and
/// used wherever a real broker is not wanted.
pub struct LoopbackBroker {
    state: watch::Sender<ConnectionState>,
    router: SubjectRouter,
}

impl LoopbackBroker {
    pub fn new(stream_capacity: usize) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            router: SubjectRouter::new(stream_capacity),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Ends every stream on `subject` while staying connected, as a lost
    /// subscription on a real broker would.
    #[cfg(test)]
    pub(crate) fn interrupt(&self, subject: &str) {
        self.router.close(subject);
    }
}

#[async_trait]
impl Broker for LoopbackBroker {
    async fn connect(&self) -> Result<(), RelayError> {
        if !self.is_connected() {
            self.set_state(ConnectionState::Connected);
            info!("Loopback broker connected.");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RelayError> {
        if self.state() == ConnectionState::Disconnected {
            return Ok(());
        }
        self.set_state(ConnectionState::Draining);
        self.router.close_all();
        self.set_state(ConnectionState::Disconnected);
        info!("Loopback broker disconnected.");
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), RelayError> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        self.router.route(subject, payload);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<MessageStream, RelayError> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        Ok(self.router.open(subject).0)
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}
