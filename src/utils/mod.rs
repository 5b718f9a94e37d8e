//! Shared building blocks used by the configuration, connector and consumer
//! modules: the crate error type, logging bootstrap and the retry policy.

pub mod backoff;
pub mod error;
pub mod logging;

pub use backoff::{Backoff, RetryLimit, RetryPolicy};
pub use error::{InboundError, Result};
