mod endpoint;
mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use endpoint::{
    BrokerAddress, ConnectionConfig, Credentials, DEFAULT_EXCHANGE_TYPE, DEFAULT_RETRY_COUNT,
    DEFAULT_RETRY_INTERVAL_MS, ExchangeSpec, InboundEndpoint, QueueFlags, StoreSettings,
    TlsSettings, Topology, parse_addresses,
};
pub use settings::{
    EndpointSettings, ExchangeSection, LoggingSettings, QueueSection, Settings, TlsSection,
};

use crate::utils::error::Result;

/// Default configuration file, without extension.
pub const DEFAULT_CONFIG_FILE: &str = "config/default";

/// Prefix of environment variables overriding file values, e.g.
/// `INBOUND__LOGGING__LEVEL=debug`.
pub const ENV_PREFIX: &str = "INBOUND";

/// Loads the configuration from `path` (optional, any format the `config`
/// crate understands) and environment variables, merged with defaults.
pub fn load_config_from(path: &str) -> std::result::Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();

    Ok(Settings {
        logging: LoggingSettings {
            level: partial
                .logging
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.logging.level),
        },
        endpoints: partial.endpoints.unwrap_or(default.endpoints),
    })
}

impl Settings {
    /// Validates every configured endpoint, failing on the first invalid one.
    pub fn inbound_endpoints(&self) -> Result<Vec<InboundEndpoint>> {
        self.endpoints
            .iter()
            .map(InboundEndpoint::from_settings)
            .collect()
    }
}
