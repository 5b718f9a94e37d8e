//! The `consumer` module drives one inbound endpoint end to end.
//!
//! [`ConsumerEngine`] owns the connection and subscription of its endpoint
//! and hands every delivery, wrapped in a [`DeliveryEnvelope`], to an
//! [`InjectHandler`]. The handler's verdict decides between acknowledge and
//! commit or rollback and redelivery. Engines share nothing, so one process
//! can run any number of them side by side.

pub mod engine;
pub mod envelope;
pub mod handler;
pub mod state;
pub mod topology;

pub use engine::{ConsumerEngine, DEFAULT_MEDIATION_BACKOFF};
pub use envelope::{DeliveryEnvelope, ROUTING_HINT_HEADER};
pub use handler::{InjectHandler, JsonLinesHandler};
pub use state::WorkerState;
