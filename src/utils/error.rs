//! The `error` module defines the error type shared by every layer of the
//! inbound consumer.
//!
//! Variants follow the fault classes the engine distinguishes: configuration
//! problems are never retried, connection failures are retried by the
//! connector, disconnects drive the reconnection path and mediation failures
//! are absorbed by the delivery loop.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, InboundError>;

#[derive(Debug, Error)]
pub enum InboundError {
    /// Malformed host/port lists, invalid numbers, bad TLS material.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The broker could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// Queue/exchange declaration, binding, QoS or subscription failed.
    #[error("topology error: {0}")]
    Topology(String),

    /// Unsolicited shutdown or I/O failure while consuming.
    #[error("broker disconnected: {0}")]
    Disconnected(String),

    /// The injection handler failed while processing a delivery.
    #[error("mediation error: {0}")]
    Mediation(String),

    /// The injection handler rejected the payload.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A transaction, ack or recover call failed on the channel.
    #[error("channel error: {0}")]
    Channel(String),

    #[error("inbound {name} is faulty: could not reconnect after {attempts} attempt(s)")]
    Faulty { name: String, attempts: u32 },

    #[error("inbound {0} is already running")]
    AlreadyRunning(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings error: {0}")]
    Settings(#[from] config::ConfigError),
}

impl InboundError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn topology(msg: impl Into<String>) -> Self {
        Self::Topology(msg.into())
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::Disconnected(msg.into())
    }

    pub fn mediation(msg: impl Into<String>) -> Self {
        Self::Mediation(msg.into())
    }

    pub fn invalid_message(msg: impl Into<String>) -> Self {
        Self::InvalidMessage(msg.into())
    }

    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }

    /// Whether a connect attempt that failed with this error may be retried.
    ///
    /// Configuration problems will fail identically on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Configuration(_) | Self::Settings(_))
    }
}
