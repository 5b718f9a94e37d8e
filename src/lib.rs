//! # rabbit-inbound
//!
//! `rabbit-inbound` consumes RabbitMQ queues on behalf of inbound endpoints.
//! Every endpoint gets its own long-lived consumer that owns one broker
//! connection, processes deliveries one at a time inside channel
//! transactions and survives broker outages by reconnecting within a
//! configured retry budget. Delivery is at-least-once: a message the handler
//! does not accept is rolled back and redelivered, never dropped.
//!
//! ## Core Modules
//!
//! - `config`: Loads settings and turns each endpoint section into a validated connection and topology.
//! - `connector`: Broker-facing traits, the retrying connector, TLS material and the lapin adapter.
//! - `consumer`: The consumer engine, its state machine, delivery envelopes and the injection handler seam.
//! - `utils`: Shared error type, logging bootstrap and the retry policy.

pub mod config;
pub mod connector;
pub mod consumer;
pub mod utils;
