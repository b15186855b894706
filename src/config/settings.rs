use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the websocket server, the broker core and logging.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub log: LogSettings,
}

/// Configuration settings for the server.
///
/// Defines the host and port the websocket server will bind to.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Configuration settings for the broker.
///
/// `0` means "no limit" for every field.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Prefetch applied when a consumer does not ask for one.
    pub default_prefetch: u16,
    /// Redelivery cap for queues declared without their own.
    pub max_redeliveries: u32,
    /// Pending-length cap for queues declared without their own.
    pub max_queue_length: usize,
}

impl BrokerSettings {
    pub fn redelivery_limit(&self) -> Option<u32> {
        (self.max_redeliveries > 0).then_some(self.max_redeliveries)
    }

    pub fn queue_length_limit(&self) -> Option<usize> {
        (self.max_queue_length > 0).then_some(self.max_queue_length)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
}

/// What the sources actually provided. Every key is optional; `resolve`
/// fills the gaps.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialBrokerSettings {
    pub default_prefetch: Option<u16>,
    pub max_redeliveries: Option<u32>,
    pub max_queue_length: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    pub fn resolve(self) -> Settings {
        let Settings {
            server: default_server,
            broker: default_broker,
            log: default_log,
        } = Settings::default();

        let server = self.server.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let log = self.log.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default_server.host),
                port: server.port.unwrap_or(default_server.port),
            },
            broker: BrokerSettings {
                default_prefetch: broker
                    .default_prefetch
                    .unwrap_or(default_broker.default_prefetch),
                max_redeliveries: broker
                    .max_redeliveries
                    .unwrap_or(default_broker.max_redeliveries),
                max_queue_length: broker
                    .max_queue_length
                    .unwrap_or(default_broker.max_queue_length),
            },
            log: LogSettings {
                level: log.level.unwrap_or(default_log.level),
            },
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            default_prefetch: 1,
            max_redeliveries: 0,
            max_queue_length: 0,
        }
    }
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            broker: BrokerSettings::default(),
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}
