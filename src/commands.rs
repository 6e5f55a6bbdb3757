use crate::broker::{Broker, DEVICE_COMMAND_SUBJECT};
use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCommand {
    pub device_id: String,
    pub command: String,
}

/// Publishes device commands. Unlike telemetry, a command that cannot be
/// published is reported to the caller.
pub struct CommandPublisher {
    broker: Arc<dyn Broker>,
}

impl CommandPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    pub async fn send_command(&self, device_id: &str, command: &str) -> Result<DeviceCommand, RelayError> {
        if device_id.trim().is_empty() || command.trim().is_empty() {
            return Err(RelayError::InvalidRequest(
                "deviceId and command must not be empty".to_string(),
            ));
        }

        let message = DeviceCommand {
            device_id: device_id.to_string(),
            command: command.to_string(),
        };
        self.broker
            .publish(DEVICE_COMMAND_SUBJECT, serde_json::to_vec(&message)?)
            .await?;
        info!("Command sent to device {}: {}", device_id, command);
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::loopback::LoopbackBroker;

    #[tokio::test]
    async fn test_send_command_publishes_wire_shape() {
        let broker = Arc::new(LoopbackBroker::new(8));
        broker.connect().await.unwrap();
        let mut stream = broker.subscribe(DEVICE_COMMAND_SUBJECT).await.unwrap();
        let publisher = CommandPublisher::new(broker);

        publisher.send_command("d1", "reboot").await.unwrap();

        let message = stream.recv().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(body, serde_json::json!({ "deviceId": "d1", "command": "reboot" }));
    }

    #[tokio::test]
    async fn test_send_command_surfaces_not_connected() {
        let publisher = CommandPublisher::new(Arc::new(LoopbackBroker::new(8)));

        assert!(matches!(
            publisher.send_command("d1", "reboot").await,
            Err(RelayError::NotConnected)
        ));
    }
}
