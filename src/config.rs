use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::ExponentialBackoff;
use uuid::Uuid;

const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEndpoint {
    Mqtt { host: String, port: u16 },
    /// In-process broker, selected with `memory://`.
    Loopback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionBackend {
    Memory,
    Sqlite,
}

/// Reconnect/resubscribe pacing shared by the broker driver and the subject readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// `None` retries forever.
    pub max_attempts: Option<usize>,
}

impl RetryPolicy {
    /// Delays of `base, 2*base, 4*base, ...` capped at `max_delay_ms`.
    pub fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        // The strategy yields 2^n * factor; halving gives base * 2^(n-1) exactly.
        let backoff = ExponentialBackoff::from_millis(2)
            .factor(self.base_delay_ms.max(1))
            .max_delay(Duration::from_millis(self.max_delay_ms.saturating_mul(2)))
            .map(|delay| delay / 2);
        match self.max_attempts {
            Some(attempts) => Box::new(backoff.take(attempts)),
            None => Box::new(backoff),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub broker_endpoint: BrokerEndpoint,
    pub broker_username: String,
    pub broker_password: String,
    pub broker_client_id: String,
    pub broker_max_reconnect_attempts: i32,
    pub broker_reconnect_delay_ms: u64,
    pub broker_max_reconnect_delay_ms: u64,
    pub broker_connect_timeout_ms: u64,
    pub broker_drain_timeout_ms: u64,

    pub max_records_per_device: usize,
    pub enable_event_storage: bool,
    pub retention_backend: RetentionBackend,
    pub database_path: String,
    pub subscriber_queue_capacity: usize,

    pub http_port: u16,
    pub cors_origin: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        for (name, value) in [
            ("BROKER_RECONNECT_DELAY_MS", self.broker_reconnect_delay_ms),
            ("BROKER_MAX_RECONNECT_DELAY_MS", self.broker_max_reconnect_delay_ms),
            ("BROKER_CONNECT_TIMEOUT_MS", self.broker_connect_timeout_ms),
            ("BROKER_DRAIN_TIMEOUT_MS", self.broker_drain_timeout_ms),
        ] {
            if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&value) {
                return Err(ConfigError::ParsingError(format!(
                    "{} must be between {} and {} ms",
                    name, MIN_TIMEOUT, MAX_TIMEOUT
                )));
            }
        }

        if self.broker_max_reconnect_delay_ms < self.broker_reconnect_delay_ms {
            return Err(ConfigError::ParsingError(
                "BROKER_MAX_RECONNECT_DELAY_MS must not be lower than BROKER_RECONNECT_DELAY_MS"
                    .to_string(),
            ));
        }

        if self.max_records_per_device == 0 {
            return Err(ConfigError::MissingOrInvalid(
                "MAX_TELEMETRY_RECORDS_PER_DEVICE".to_string(),
            ));
        }

        if self.subscriber_queue_capacity == 0 {
            return Err(ConfigError::MissingOrInvalid(
                "SUBSCRIBER_QUEUE_CAPACITY".to_string(),
            ));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = Self {
            // Broker
            broker_endpoint: parse_broker_url(&var_or("BROKER_URL", "mqtt://localhost:1883"))?,
            broker_username: var_or("BROKER_USERNAME", ""),
            broker_password: var_or("BROKER_PASSWORD", ""),
            broker_client_id: lookup("BROKER_CLIENT_ID")
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| format!("telemetry-relay-{}", Uuid::new_v4())),
            broker_max_reconnect_attempts: var_or("BROKER_MAX_RECONNECT_ATTEMPTS", "10")
                .parse::<i32>()
                .map_err(|_| {
                    ConfigError::ParsingError(
                        "BROKER_MAX_RECONNECT_ATTEMPTS must be an integer".to_string(),
                    )
                })?,
            broker_reconnect_delay_ms: parse_number(&var_or("BROKER_RECONNECT_DELAY_MS", "1000"), "BROKER_RECONNECT_DELAY_MS")?,
            broker_max_reconnect_delay_ms: parse_number(
                &var_or("BROKER_MAX_RECONNECT_DELAY_MS", "60000"),
                "BROKER_MAX_RECONNECT_DELAY_MS",
            )?,
            broker_connect_timeout_ms: parse_number(&var_or("BROKER_CONNECT_TIMEOUT_MS", "5000"), "BROKER_CONNECT_TIMEOUT_MS")?,
            broker_drain_timeout_ms: parse_number(&var_or("BROKER_DRAIN_TIMEOUT_MS", "2000"), "BROKER_DRAIN_TIMEOUT_MS")?,

            // Retention and storage
            max_records_per_device: parse_number(
                &var_or("MAX_TELEMETRY_RECORDS_PER_DEVICE", "100"),
                "MAX_TELEMETRY_RECORDS_PER_DEVICE",
            )?,
            enable_event_storage: parse_flag(&var_or("ENABLE_EVENT_STORAGE", "false")),
            retention_backend: match var_or("RETENTION_BACKEND", "memory").to_lowercase().as_str() {
                "memory" => RetentionBackend::Memory,
                "sqlite" => RetentionBackend::Sqlite,
                other => {
                    return Err(ConfigError::ParsingError(format!(
                        "RETENTION_BACKEND must be 'memory' or 'sqlite', got '{}'",
                        other
                    )))
                }
            },
            database_path: var_or("DATABASE_PATH", "telemetry_relay.db"),
            subscriber_queue_capacity: parse_number(&var_or("SUBSCRIBER_QUEUE_CAPACITY", "64"), "SUBSCRIBER_QUEUE_CAPACITY")?,

            // HTTP
            http_port: parse_number(&var_or("PORT", "3003"), "PORT")?,
            cors_origin: var_or("CORS_ORIGIN", "*"),
        };

        // Validate timeouts after constructing the configuration
        config.validate_timeouts()?;

        Ok(config)
    }

    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: self.broker_reconnect_delay_ms,
            max_delay_ms: self.broker_max_reconnect_delay_ms,
            max_attempts: usize::try_from(self.broker_max_reconnect_attempts).ok(),
        }
    }

    /// Subject readers keep retrying until shutdown, whatever the broker's own policy is.
    pub fn reader_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: None,
            ..self.reconnect_policy()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_connect_timeout_ms)
    }

    /// How long `disconnect()` waits for outstanding publishes to flush.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_drain_timeout_ms)
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, name: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::ParsingError(format!("{} must be a valid number", name)))
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}

fn parse_broker_url(url: &str) -> Result<BrokerEndpoint, ConfigError> {
    let url = url.trim();
    if url == "memory://" || url == "memory" {
        return Ok(BrokerEndpoint::Loopback);
    }

    let address = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url)
        .trim_end_matches('/');
    if address.is_empty() || address.contains("://") {
        return Err(ConfigError::MissingOrInvalid("BROKER_URL".to_string()));
    }

    match address.rsplit_once(':') {
        Some((host, port)) => Ok(BrokerEndpoint::Mqtt {
            host: host.to_string(),
            port: port.parse::<u16>().map_err(|_| {
                ConfigError::ParsingError("BROKER_URL port must be a valid number".to_string())
            })?,
        }),
        None => Ok(BrokerEndpoint::Mqtt {
            host: address.to_string(),
            port: DEFAULT_MQTT_PORT,
        }),
    }
}
