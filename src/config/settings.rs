use serde::Deserialize;

/// Top-level configuration settings for the process.
///
/// Holds the logging configuration and the list of inbound endpoints, each of
/// which gets its own consumer engine.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub endpoints: Vec<EndpointSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Raw settings of one inbound endpoint as they appear in the configuration
/// file. Everything except the name is optional; defaults and validation are
/// applied by [`crate::config::InboundEndpoint::from_settings`].
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EndpointSettings {
    pub name: String,
    /// Comma-separated broker host names, paired positionally with `ports`.
    pub hosts: Option<String>,
    /// Comma-separated broker ports.
    pub ports: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub virtual_host: Option<String>,
    pub heartbeat_secs: Option<u16>,
    pub connection_timeout_ms: Option<u64>,
    pub network_recovery_interval_ms: Option<u64>,
    pub retry_interval_ms: Option<i64>,
    /// `-1` retries forever, `0` never retries.
    pub retry_count: Option<i64>,
    pub tls: Option<TlsSection>,
    pub queue: Option<QueueSection>,
    pub exchange: Option<ExchangeSection>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TlsSection {
    pub enabled: Option<bool>,
    pub keystore_path: Option<String>,
    pub keystore_type: Option<String>,
    pub keystore_password: Option<String>,
    pub truststore_path: Option<String>,
    pub truststore_type: Option<String>,
    pub truststore_password: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct QueueSection {
    pub name: Option<String>,
    pub routing_key: Option<String>,
    pub durable: Option<bool>,
    pub exclusive: Option<bool>,
    pub auto_delete: Option<bool>,
    pub auto_ack: Option<bool>,
    pub consumer_tag: Option<String>,
    pub prefetch_count: Option<u16>,
    /// Used when a delivered message carries no content type of its own.
    pub content_type: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ExchangeSection {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub durable: Option<bool>,
    pub auto_delete: Option<bool>,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub logging: Option<PartialLoggingSettings>,
    pub endpoints: Option<Vec<EndpointSettings>>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            logging: LoggingSettings {
                level: "info".to_string(),
            },
            endpoints: Vec::new(),
        }
    }
}
