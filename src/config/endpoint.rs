//! Validated, immutable view of one inbound endpoint: how to reach the broker
//! ([`ConnectionConfig`]) and what to consume from it ([`Topology`]).

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use crate::config::settings::{EndpointSettings, ExchangeSection, QueueSection, TlsSection};
use crate::utils::backoff::RetryPolicy;
use crate::utils::error::{InboundError, Result};

pub const DEFAULT_RETRY_INTERVAL_MS: i64 = 30_000;
pub const DEFAULT_RETRY_COUNT: i64 = 3;
pub const DEFAULT_EXCHANGE_TYPE: &str = "direct";
pub const DEFAULT_USERNAME: &str = "guest";
pub const DEFAULT_PASSWORD: &str = "guest";
pub const DEFAULT_VIRTUAL_HOST: &str = "/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// A key or trust store on disk.
#[derive(Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub path: PathBuf,
    pub kind: String,
    pub password: String,
}

impl fmt::Debug for StoreSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSettings")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    pub enabled: bool,
    /// `None` when any of path, type or password was left out.
    pub keystore: Option<StoreSettings>,
    pub truststore: Option<StoreSettings>,
    pub version: Option<String>,
}

/// Everything needed to open a connection to the broker.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Name of the owning inbound endpoint, used as log prefix.
    pub name: String,
    pub addresses: Vec<BrokerAddress>,
    pub credentials: Credentials,
    pub virtual_host: String,
    pub tls: TlsSettings,
    pub heartbeat_secs: Option<u16>,
    pub connection_timeout: Option<Duration>,
    pub network_recovery_interval: Option<Duration>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFlags {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: String,
    pub durable: bool,
    pub auto_delete: bool,
}

/// What the engine declares, binds and subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub queue: String,
    pub routing_key: String,
    pub queue_flags: QueueFlags,
    pub exchange: Option<ExchangeSpec>,
    pub prefetch_count: Option<u16>,
    /// Broker-assigned when `None`.
    pub consumer_tag: Option<String>,
    pub auto_ack: bool,
    pub content_type: Option<String>,
}

impl Topology {
    /// Topology of an endpoint that configured nothing: a plain queue named
    /// after the endpoint, no exchange, manual acknowledgement.
    pub fn for_endpoint(name: &str) -> Self {
        Self {
            queue: name.to_string(),
            routing_key: name.to_string(),
            queue_flags: QueueFlags::default(),
            exchange: None,
            prefetch_count: None,
            consumer_tag: None,
            auto_ack: false,
            content_type: None,
        }
    }

    fn from_sections(
        endpoint: &str,
        queue: Option<&QueueSection>,
        exchange: Option<&ExchangeSection>,
    ) -> Self {
        let queue = queue.cloned().unwrap_or_default();

        let queue_name = match queue.name.filter(|q| !q.trim().is_empty()) {
            Some(q) => q,
            None => {
                info!(
                    inbound = %endpoint,
                    "No queue name is specified, the inbound name will be used as queue name"
                );
                endpoint.to_string()
            }
        };

        let routing_key = match queue.routing_key {
            Some(rk) => rk,
            None => {
                info!(inbound = %endpoint, "No routing key specified, using queue name as the routing key");
                queue_name.clone()
            }
        };

        let exchange = exchange.and_then(|e| {
            let name = e.name.clone().filter(|n| !n.trim().is_empty())?;
            Some(ExchangeSpec {
                name,
                kind: e
                    .kind
                    .clone()
                    .filter(|k| !k.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_EXCHANGE_TYPE.to_string()),
                durable: e.durable.unwrap_or(false),
                auto_delete: e.auto_delete.unwrap_or(false),
            })
        });

        Self {
            queue: queue_name,
            routing_key,
            queue_flags: QueueFlags {
                durable: queue.durable.unwrap_or(false),
                exclusive: queue.exclusive.unwrap_or(false),
                auto_delete: queue.auto_delete.unwrap_or(false),
            },
            exchange,
            prefetch_count: queue.prefetch_count,
            consumer_tag: queue.consumer_tag.filter(|t| !t.is_empty()),
            auto_ack: queue.auto_ack.unwrap_or(false),
            content_type: queue.content_type,
        }
    }
}

/// A fully validated inbound endpoint.
#[derive(Debug, Clone)]
pub struct InboundEndpoint {
    pub name: String,
    pub connection: ConnectionConfig,
    pub topology: Topology,
}

impl InboundEndpoint {
    pub fn from_settings(settings: &EndpointSettings) -> Result<Self> {
        let name = settings.name.trim();
        if name.is_empty() {
            return Err(InboundError::configuration("inbound endpoint name is empty"));
        }

        let addresses = parse_addresses(
            settings.hosts.as_deref().unwrap_or_default(),
            settings.ports.as_deref().unwrap_or_default(),
        )
        .map_err(|e| InboundError::configuration(format!("[{name}] {e}")))?;

        let retry = RetryPolicy::from_config(
            settings.retry_interval_ms.unwrap_or(DEFAULT_RETRY_INTERVAL_MS),
            settings.retry_count.unwrap_or(DEFAULT_RETRY_COUNT),
        )?;

        let connection = ConnectionConfig {
            name: name.to_string(),
            addresses,
            credentials: Credentials {
                username: non_empty(settings.username.as_deref(), DEFAULT_USERNAME),
                password: non_empty(settings.password.as_deref(), DEFAULT_PASSWORD),
            },
            virtual_host: non_empty(settings.virtual_host.as_deref(), DEFAULT_VIRTUAL_HOST),
            tls: tls_settings(settings.tls.as_ref()),
            heartbeat_secs: settings.heartbeat_secs,
            connection_timeout: settings.connection_timeout_ms.map(Duration::from_millis),
            network_recovery_interval: settings
                .network_recovery_interval_ms
                .map(Duration::from_millis),
            retry,
        };

        let topology =
            Topology::from_sections(name, settings.queue.as_ref(), settings.exchange.as_ref());

        Ok(Self {
            name: name.to_string(),
            connection,
            topology,
        })
    }
}

/// Pairs comma-separated host and port lists positionally.
pub fn parse_addresses(hosts: &str, ports: &str) -> Result<Vec<BrokerAddress>> {
    if hosts.trim().is_empty() || ports.trim().is_empty() {
        return Err(InboundError::configuration(
            "host name(s) and port(s) are not correctly defined",
        ));
    }

    let hosts: Vec<&str> = hosts.split(',').map(str::trim).collect();
    let ports: Vec<&str> = ports.split(',').map(str::trim).collect();
    if hosts.len() != ports.len() {
        return Err(InboundError::configuration(format!(
            "{} host(s) but {} port(s) configured",
            hosts.len(),
            ports.len()
        )));
    }

    hosts
        .into_iter()
        .zip(ports)
        .enumerate()
        .map(|(i, (host, port))| {
            if host.is_empty() || port.is_empty() {
                return Err(InboundError::configuration(format!(
                    "empty host or port at position {i}"
                )));
            }
            let port = port.parse::<u16>().map_err(|e| {
                InboundError::configuration(format!("number format error in port '{port}': {e}"))
            })?;
            Ok(BrokerAddress {
                host: host.to_string(),
                port,
            })
        })
        .collect()
}

fn tls_settings(section: Option<&TlsSection>) -> TlsSettings {
    let Some(tls) = section else {
        return TlsSettings::default();
    };
    TlsSettings {
        enabled: tls.enabled.unwrap_or(false),
        keystore: store(
            tls.keystore_path.as_deref(),
            tls.keystore_type.as_deref(),
            tls.keystore_password.as_deref(),
        ),
        truststore: store(
            tls.truststore_path.as_deref(),
            tls.truststore_type.as_deref(),
            tls.truststore_password.as_deref(),
        ),
        version: tls.version.clone().filter(|v| !v.is_empty()),
    }
}

fn store(path: Option<&str>, kind: Option<&str>, password: Option<&str>) -> Option<StoreSettings> {
    match (path, kind, password) {
        (Some(path), Some(kind), Some(password))
            if !path.is_empty() && !kind.is_empty() && !password.is_empty() =>
        {
            Some(StoreSettings {
                path: PathBuf::from(path),
                kind: kind.to_string(),
                password: password.to_string(),
            })
        }
        _ => None,
    }
}

fn non_empty(value: Option<&str>, default: &str) -> String {
    value
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
        .to_string()
}
