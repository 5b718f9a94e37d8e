//! `lapin` implementation of the connector traits.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRecoverOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{BrokerAddress, ConnectionConfig, ExchangeSpec, QueueFlags};
use crate::connector::tls::{self, TlsMode};
use crate::connector::{
    BrokerChannel, BrokerConnection, Connector, MessageProperties, Pull, RawDelivery,
};
use crate::utils::error::{InboundError, Result};

const REPLY_SUCCESS: u16 = 200;

/// Opens `lapin` connections to the first reachable configured address.
pub struct AmqpConnector {
    name: String,
    uris: Vec<AMQPUri>,
    tls: TlsMode,
}

impl AmqpConnector {
    pub fn new(config: &ConnectionConfig) -> Result<Self> {
        if config.addresses.is_empty() {
            return Err(InboundError::configuration(format!(
                "[{}] no broker address configured",
                config.name
            )));
        }

        let tls = tls::resolve(&config.tls, &config.name);
        let uris = config
            .addresses
            .iter()
            .map(|address| uri_for(config, address, tls.is_enabled()))
            .collect();

        if let Some(interval) = config.network_recovery_interval {
            debug!(
                inbound = %config.name,
                "Network recovery interval of {} ms noted; reconnection follows the retry policy",
                interval.as_millis()
            );
        }

        Ok(Self {
            name: config.name.clone(),
            uris,
            tls,
        })
    }

    fn tls_config(&self) -> OwnedTLSConfig {
        match &self.tls {
            TlsMode::Custom(material) => OwnedTLSConfig {
                identity: Some(OwnedIdentity {
                    der: material.identity_der.clone(),
                    password: material.identity_password.clone(),
                }),
                cert_chain: Some(material.cert_chain.clone()),
            },
            TlsMode::SystemDefault | TlsMode::Disabled => OwnedTLSConfig::default(),
        }
    }

    async fn connect_uri(&self, uri: AMQPUri) -> lapin::Result<Connection> {
        let properties =
            ConnectionProperties::default().with_connection_name(self.name.clone().into());
        if self.tls.is_enabled() {
            Connection::connect_uri_with_config(uri, properties, self.tls_config()).await
        } else {
            Connection::connect_uri(uri, properties).await
        }
    }
}

fn uri_for(config: &ConnectionConfig, address: &BrokerAddress, secure: bool) -> AMQPUri {
    AMQPUri {
        scheme: if secure {
            AMQPScheme::AMQPS
        } else {
            AMQPScheme::AMQP
        },
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.credentials.username.clone(),
                password: config.credentials.password.clone(),
            },
            host: address.host.clone(),
            port: address.port,
        },
        vhost: config.virtual_host.clone(),
        query: AMQPQueryString {
            heartbeat: config.heartbeat_secs,
            connection_timeout: config
                .connection_timeout
                .map(|timeout| timeout.as_millis() as u64),
            ..Default::default()
        },
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Connection = AmqpConnection;

    async fn open(&self) -> Result<AmqpConnection> {
        let mut failures = Vec::with_capacity(self.uris.len());
        for uri in &self.uris {
            let target = format!("{}:{}", uri.authority.host, uri.authority.port);
            match self.connect_uri(uri.clone()).await {
                Ok(connection) => {
                    debug!(inbound = %self.name, broker = %target, "RabbitMQ connection created");
                    return Ok(AmqpConnection { connection });
                }
                Err(e) => {
                    debug!(inbound = %self.name, broker = %target, error = %e, "Broker address refused connection");
                    failures.push(format!("{target}: {e}"));
                }
            }
        }
        Err(InboundError::connection(failures.join("; ")))
    }
}

pub struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    type Channel = AmqpChannel;

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> Result<AmqpChannel> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| InboundError::topology(e.to_string()))?;
        Ok(AmqpChannel {
            channel,
            consumer: None,
        })
    }

    async fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| InboundError::connection(e.to_string()))
    }
}

pub struct AmqpChannel {
    channel: Channel,
    consumer: Option<Consumer>,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn queue_declare(&self, queue: &str, flags: QueueFlags, passive: bool) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive,
                    durable: flags.durable,
                    exclusive: flags.exclusive,
                    auto_delete: flags.auto_delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| InboundError::topology(e.to_string()))
    }

    async fn exchange_declare(&self, exchange: &ExchangeSpec, passive: bool) -> Result<()> {
        self.channel
            .exchange_declare(
                &exchange.name,
                exchange_kind(&exchange.kind),
                ExchangeDeclareOptions {
                    passive,
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| InboundError::topology(e.to_string()))
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|e| InboundError::topology(e.to_string()))
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|e| InboundError::topology(e.to_string()))
    }

    async fn basic_consume(
        &mut self,
        queue: &str,
        consumer_tag: Option<&str>,
        auto_ack: bool,
    ) -> Result<String> {
        // an empty tag lets the broker generate one
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag.unwrap_or_default(),
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| InboundError::topology(e.to_string()))?;
        let tag = consumer.tag().as_str().to_string();
        self.consumer = Some(consumer);
        Ok(tag)
    }

    async fn next_delivery(&mut self) -> Pull {
        let Some(consumer) = self.consumer.as_mut() else {
            return Pull::Cancelled;
        };
        match consumer.next().await {
            Some(Ok(delivery)) => Pull::Delivery(raw_delivery(delivery)),
            Some(Err(e)) => Pull::Disconnected(e.to_string()),
            None => {
                self.consumer = None;
                if self.channel.status().connected() {
                    Pull::Cancelled
                } else {
                    Pull::Disconnected("consumer stream closed with its channel".to_string())
                }
            }
        }
    }

    async fn tx_select(&self) -> Result<()> {
        self.channel
            .tx_select()
            .await
            .map_err(|e| InboundError::channel(e.to_string()))
    }

    async fn tx_commit(&self) -> Result<()> {
        self.channel
            .tx_commit()
            .await
            .map_err(|e| InboundError::channel(e.to_string()))
    }

    async fn tx_rollback(&self) -> Result<()> {
        self.channel
            .tx_rollback()
            .await
            .map_err(|e| InboundError::channel(e.to_string()))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|e| InboundError::channel(e.to_string()))
    }

    async fn basic_recover(&self) -> Result<()> {
        self.channel
            .basic_recover(BasicRecoverOptions { requeue: true })
            .await
            .map_err(|e| InboundError::channel(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| InboundError::channel(e.to_string()))
    }
}

fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind.to_ascii_lowercase().as_str() {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        _ => ExchangeKind::Custom(kind.to_string()),
    }
}

fn raw_delivery(delivery: Delivery) -> RawDelivery {
    let props = &delivery.properties;
    let properties = MessageProperties {
        correlation_id: short(props.correlation_id()),
        reply_to: short(props.reply_to()),
        message_id: short(props.message_id()),
        content_type: short(props.content_type()),
        content_encoding: short(props.content_encoding()),
        expiration: short(props.expiration()),
        headers: props
            .headers()
            .as_ref()
            .map(table_to_map)
            .unwrap_or_default(),
    };
    RawDelivery {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        body: delivery.data,
        properties,
    }
}

fn short(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|v| v.as_str().to_string())
}

fn table_to_map(table: &FieldTable) -> HashMap<String, Value> {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), amqp_to_json(value)))
        .collect()
}

fn amqp_to_json(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(v) => Value::Bool(*v),
        AMQPValue::ShortShortInt(v) => Value::from(*v),
        AMQPValue::ShortShortUInt(v) => Value::from(*v),
        AMQPValue::ShortInt(v) => Value::from(*v),
        AMQPValue::ShortUInt(v) => Value::from(*v),
        AMQPValue::LongInt(v) => Value::from(*v),
        AMQPValue::LongUInt(v) => Value::from(*v),
        AMQPValue::LongLongInt(v) => Value::from(*v),
        AMQPValue::Float(v) => Value::from(*v),
        AMQPValue::Double(v) => Value::from(*v),
        AMQPValue::Timestamp(v) => Value::from(*v),
        AMQPValue::ShortString(v) => Value::String(v.as_str().to_string()),
        AMQPValue::LongString(v) => Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::FieldArray(values) => {
            Value::Array(values.as_slice().iter().map(amqp_to_json).collect())
        }
        AMQPValue::FieldTable(table) => Value::Object(
            table
                .inner()
                .iter()
                .map(|(key, value)| (key.as_str().to_string(), amqp_to_json(value)))
                .collect(),
        ),
        AMQPValue::ByteArray(bytes) => {
            Value::Array(bytes.as_slice().iter().map(|b| Value::from(*b)).collect())
        }
        AMQPValue::Void => Value::Null,
        other => {
            warn!("Unsupported AMQP header value {other:?}, passing it on as text");
            Value::String(format!("{other:?}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, TlsSettings};
    use crate::utils::backoff::RetryPolicy;
    use std::time::Duration;

    fn config(addresses: Vec<BrokerAddress>) -> ConnectionConfig {
        ConnectionConfig {
            name: "orders".into(),
            addresses,
            credentials: Credentials {
                username: "app".into(),
                password: "s3cret".into(),
            },
            virtual_host: "tenant-a".into(),
            tls: TlsSettings::default(),
            heartbeat_secs: Some(20),
            connection_timeout: Some(Duration::from_millis(1500)),
            network_recovery_interval: None,
            retry: RetryPolicy::from_config(100, 1).unwrap(),
        }
    }

    #[test]
    fn builds_one_uri_per_address_in_order() {
        let connector = AmqpConnector::new(&config(vec![
            BrokerAddress {
                host: "a".into(),
                port: 5672,
            },
            BrokerAddress {
                host: "b".into(),
                port: 5673,
            },
        ]))
        .unwrap();

        let hosts: Vec<_> = connector
            .uris
            .iter()
            .map(|u| (u.authority.host.as_str(), u.authority.port))
            .collect();
        assert_eq!(hosts, vec![("a", 5672), ("b", 5673)]);

        let first = &connector.uris[0];
        assert_eq!(first.scheme, AMQPScheme::AMQP);
        assert_eq!(first.vhost, "tenant-a");
        assert_eq!(first.authority.userinfo.username, "app");
        assert_eq!(first.query.heartbeat, Some(20));
        assert_eq!(first.query.connection_timeout, Some(1500));
    }

    #[test]
    fn tls_without_stores_uses_amqps_with_default_context() {
        let mut cfg = config(vec![BrokerAddress {
            host: "a".into(),
            port: 5671,
        }]);
        cfg.tls.enabled = true;
        let connector = AmqpConnector::new(&cfg).unwrap();
        assert_eq!(connector.tls, TlsMode::SystemDefault);
        assert_eq!(connector.uris[0].scheme, AMQPScheme::AMQPS);
    }

    #[test]
    fn custom_tls_material_becomes_pkcs12_identity() {
        let connector = AmqpConnector {
            name: "orders".into(),
            uris: Vec::new(),
            tls: TlsMode::Custom(tls::TlsMaterial {
                identity_der: vec![0x30, 0x82],
                identity_password: "changeit".into(),
                cert_chain: "-----BEGIN CERTIFICATE-----".into(),
            }),
        };

        let config = connector.tls_config();
        let identity = config.identity.expect("identity is set");
        assert_eq!(identity.der, vec![0x30, 0x82]);
        assert_eq!(identity.password, "changeit");
        assert_eq!(config.cert_chain.as_deref(), Some("-----BEGIN CERTIFICATE-----"));
        assert!(AmqpConnector::new(&config_for_tls()).unwrap().tls_config().identity.is_none());
    }

    fn config_for_tls() -> ConnectionConfig {
        let mut cfg = config(vec![BrokerAddress {
            host: "a".into(),
            port: 5671,
        }]);
        cfg.tls.enabled = true;
        cfg
    }

    #[test]
    fn empty_address_list_is_a_configuration_error() {
        assert!(matches!(
            AmqpConnector::new(&config(Vec::new())),
            Err(InboundError::Configuration(_))
        ));
    }

    #[test]
    fn exchange_kinds_map_to_lapin_kinds() {
        assert!(matches!(exchange_kind("direct"), ExchangeKind::Direct));
        assert!(matches!(exchange_kind("TOPIC"), ExchangeKind::Topic));
        assert!(matches!(exchange_kind("fanout"), ExchangeKind::Fanout));
        assert!(matches!(exchange_kind("headers"), ExchangeKind::Headers));
        assert!(matches!(
            exchange_kind("x-delayed-message"),
            ExchangeKind::Custom(kind) if kind == "x-delayed-message"
        ));
    }

    #[test]
    fn header_tables_become_json() {
        let mut nested = FieldTable::default();
        nested.insert("depth".into(), AMQPValue::LongInt(2));

        let mut headers = FieldTable::default();
        headers.insert("SOAP_ACTION".into(), AMQPValue::LongString("urn:getQuote".into()));
        headers.insert("retries".into(), AMQPValue::LongLongInt(3));
        headers.insert("urgent".into(), AMQPValue::Boolean(true));
        headers.insert("meta".into(), AMQPValue::FieldTable(nested));

        let map = table_to_map(&headers);
        assert_eq!(map["SOAP_ACTION"], Value::from("urn:getQuote"));
        assert_eq!(map["retries"], Value::from(3));
        assert_eq!(map["urgent"], Value::Bool(true));
        assert_eq!(map["meta"]["depth"], Value::from(2));
    }
}
