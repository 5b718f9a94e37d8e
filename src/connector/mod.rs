//! The `connector` module owns everything that talks to the broker.
//!
//! The consumer engine only sees the three traits defined here, which keeps
//! the state machine and delivery loop testable against an in-memory broker.
//! [`amqp`] implements them on top of `lapin`; [`BrokerConnector`] adds the
//! retry policy around a single connection attempt.

pub mod amqp;
pub mod tls;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{error, info};

use crate::config::{ExchangeSpec, QueueFlags};
use crate::utils::backoff::RetryPolicy;
use crate::utils::error::{InboundError, Result};

pub use amqp::AmqpConnector;

/// Properties of a delivered message, independent of the client library.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub expiration: Option<String>,
    pub headers: HashMap<String, serde_json::Value>,
}

/// One message as handed over by the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Outcome of waiting for the next delivery.
#[derive(Debug)]
pub enum Pull {
    Delivery(RawDelivery),
    /// The subscription ended while the channel itself is still usable.
    Cancelled,
    /// The channel or connection went away underneath the consumer.
    Disconnected(String),
}

/// Opens broker connections. One call is one attempt; retrying is the job of
/// [`BrokerConnector`].
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: BrokerConnection;

    async fn open(&self) -> Result<Self::Connection>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    type Channel: BrokerChannel;

    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Self::Channel>;

    async fn close(&self) -> Result<()>;
}

/// The subset of AMQP channel operations the consumer engine uses.
///
/// With `passive` set, the declare calls only check for existence and fail
/// when the entity is missing. A failed passive declare closes the channel.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn queue_declare(&self, queue: &str, flags: QueueFlags, passive: bool) -> Result<()>;

    async fn exchange_declare(&self, exchange: &ExchangeSpec, passive: bool) -> Result<()>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()>;

    /// Starts the subscription and returns the effective consumer tag.
    async fn basic_consume(
        &mut self,
        queue: &str,
        consumer_tag: Option<&str>,
        auto_ack: bool,
    ) -> Result<String>;

    /// Waits without timeout for the next delivery of the subscription.
    async fn next_delivery(&mut self) -> Pull;

    async fn tx_select(&self) -> Result<()>;

    async fn tx_commit(&self) -> Result<()>;

    async fn tx_rollback(&self) -> Result<()>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()>;

    /// Asks the broker to redeliver every unacknowledged message.
    async fn basic_recover(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// A [`Connector`] plus the retry policy of its endpoint.
#[derive(Debug, Clone)]
pub struct BrokerConnector<C> {
    name: String,
    connector: C,
    policy: RetryPolicy,
}

impl<C: Connector> BrokerConnector<C> {
    pub fn new(name: impl Into<String>, connector: C, policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            connector,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A single attempt, no retry.
    pub async fn open_once(&self) -> Result<C::Connection> {
        self.connector.open().await
    }

    /// Opens a connection, retrying per policy after the first failure.
    ///
    /// Configuration errors are returned immediately. Exhausting a bounded
    /// budget yields [`InboundError::Connection`].
    pub async fn connect(&self) -> Result<C::Connection> {
        let first = match self.connector.open().await {
            Ok(connection) => {
                info!(inbound = %self.name, "Successfully connected to RabbitMQ broker");
                return Ok(connection);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };
        error!(
            inbound = %self.name,
            error = %first,
            "Error creating connection to RabbitMQ broker, reattempting to connect"
        );

        let mut backoff = self.policy.backoff();
        let mut last = first;
        while let Some(delay) = backoff.next_delay() {
            info!(
                inbound = %self.name,
                attempt = backoff.attempts(),
                "Attempting to create connection to RabbitMQ broker in {} ms",
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
            match self.connector.open().await {
                Ok(connection) => {
                    info!(inbound = %self.name, "Successfully connected to RabbitMQ broker");
                    return Ok(connection);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    error!(
                        inbound = %self.name,
                        attempt = backoff.attempts(),
                        error = %e,
                        "Error while trying to reconnect to RabbitMQ broker"
                    );
                    last = e;
                }
            }
        }

        Err(InboundError::connection(format!(
            "[{}] could not connect to RabbitMQ broker after {} retries: {last}",
            self.name,
            backoff.attempts()
        )))
    }
}
