use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use tokio::sync::Semaphore;

/// Top-level configuration settings for the relay.
///
/// Includes settings for the listening server, the broker and logging.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub logging: LoggingSettings,
}

/// Configuration settings for the server.
///
/// Defines the host and port the server will bind to.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl ServerSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration settings for the broker.
///
/// Queue sizes and per-connection deadlines. A `ping_interval_secs` of zero
/// turns keep-alive pings off.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub max_connections: usize,
    pub mailbox_capacity: usize,
    pub topic_queue_capacity: usize,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub ping_interval_secs: u64,
}

impl BrokerSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 || self.max_connections > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Message(format!(
                "broker.max_connections must be between 1 and {}, got {}",
                Semaphore::MAX_PERMITS,
                self.max_connections
            )));
        }
        let non_zero = [
            ("broker.mailbox_capacity", self.mailbox_capacity as u64),
            ("broker.topic_queue_capacity", self.topic_queue_capacity as u64),
            ("broker.read_timeout_secs", self.read_timeout_secs),
            ("broker.write_timeout_secs", self.write_timeout_secs),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Message(format!("{key} must be greater than 0")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub max_connections: Option<usize>,
    pub mailbox_capacity: Option<usize>,
    pub topic_queue_capacity: Option<usize>,
    pub read_timeout_secs: Option<u64>,
    pub write_timeout_secs: Option<u64>,
    pub ping_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Fill every missing value from `default`.
    pub fn merge_onto(self, default: Settings) -> Settings {
        let server = self.server.as_ref();
        let broker = self.broker.as_ref();
        let logging = self.logging.as_ref();

        Settings {
            server: ServerSettings {
                host: server
                    .and_then(|s| s.host.clone())
                    .unwrap_or(default.server.host),
                port: server
                    .and_then(|s| s.port)
                    .unwrap_or(default.server.port),
            },
            broker: BrokerSettings {
                max_connections: broker
                    .and_then(|b| b.max_connections)
                    .unwrap_or(default.broker.max_connections),
                mailbox_capacity: broker
                    .and_then(|b| b.mailbox_capacity)
                    .unwrap_or(default.broker.mailbox_capacity),
                topic_queue_capacity: broker
                    .and_then(|b| b.topic_queue_capacity)
                    .unwrap_or(default.broker.topic_queue_capacity),
                read_timeout_secs: broker
                    .and_then(|b| b.read_timeout_secs)
                    .unwrap_or(default.broker.read_timeout_secs),
                write_timeout_secs: broker
                    .and_then(|b| b.write_timeout_secs)
                    .unwrap_or(default.broker.write_timeout_secs),
                ping_interval_secs: broker
                    .and_then(|b| b.ping_interval_secs)
                    .unwrap_or(default.broker.ping_interval_secs),
            },
            logging: LoggingSettings {
                level: logging
                    .and_then(|l| l.level.clone())
                    .unwrap_or(default.logging.level),
            },
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            broker: BrokerSettings::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            mailbox_capacity: 256,
            topic_queue_capacity: 1024,
            read_timeout_secs: 60,
            write_timeout_secs: 60,
            ping_interval_secs: 30,
        }
    }
}
