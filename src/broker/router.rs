use super::{BrokerMessage, MessageStream};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Routes inbound broker messages to the raw streams opened per subject.
///
/// Sends never wait: a stream whose buffer is full misses the message, a
/// stream whose receiver was dropped is pruned.
pub struct SubjectRouter {
    routes: Mutex<HashMap<String, Vec<mpsc::Sender<BrokerMessage>>>>,
    capacity: usize,
}

impl SubjectRouter {
    pub fn new(capacity: usize) -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Opens a stream on `subject`. The flag is true when no other stream
    /// was open on it, i.e. the broker subscription still has to be made.
    pub fn open(&self, subject: &str) -> (MessageStream, bool) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut routes = self.lock();
        let senders = routes.entry(subject.to_string()).or_default();
        senders.retain(|s| !s.is_closed());
        let first = senders.is_empty();
        senders.push(tx);
        (MessageStream::new(subject.to_string(), rx), first)
    }

    /// Delivers a message to every open stream on `subject`, returning how many accepted it.
    pub fn route(&self, subject: &str, payload: Vec<u8>) -> usize {
        let mut routes = self.lock();
        let Some(senders) = routes.get_mut(subject) else {
            debug!("No stream open for subject '{}', dropping message.", subject);
            return 0;
        };

        let mut delivered = 0;
        senders.retain(|sender| {
            let message = BrokerMessage {
                subject: subject.to_string(),
                payload: payload.clone(),
            };
            match sender.try_send(message) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!("Stream on subject '{}' is lagging, message dropped.", subject);
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        if senders.is_empty() {
            routes.remove(subject);
        }
        delivered
    }

    pub fn subjects(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Terminates every stream on `subject`.
    pub fn close(&self, subject: &str) {
        self.lock().remove(subject);
    }

    /// Terminates every open stream.
    pub fn close_all(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<mpsc::Sender<BrokerMessage>>>> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
