use std::io::Write;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::consumer::envelope::DeliveryEnvelope;
use crate::utils::error::{InboundError, Result};

/// Business processing of one delivery.
///
/// `Ok(true)` commits the delivery. `Ok(false)` and any error roll it back
/// and ask the broker to redeliver; an error also pauses the consumer.
#[async_trait]
pub trait InjectHandler: Send + Sync {
    async fn invoke(&self, envelope: &DeliveryEnvelope, worker_name: &str) -> Result<bool>;
}

pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Serialize)]
struct Record<'a> {
    inbound: &'a str,
    #[serde(flatten)]
    envelope: &'a DeliveryEnvelope,
    body: Value,
}

/// Writes every delivery as one JSON object per line.
///
/// JSON payloads (by content type) are embedded as parsed values and must be
/// well formed. Other payloads are written as text when they are UTF-8 and
/// as a byte array otherwise.
pub struct JsonLinesHandler<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesHandler<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> Result<W> {
        self.out
            .into_inner()
            .map_err(|_| InboundError::mediation("output writer lock poisoned"))
    }
}

fn is_json(media_type: Option<&str>) -> bool {
    media_type.is_some_and(|mt| {
        mt.eq_ignore_ascii_case(JSON_CONTENT_TYPE) || mt.to_ascii_lowercase().ends_with("+json")
    })
}

fn body_value(envelope: &DeliveryEnvelope) -> Result<Value> {
    if is_json(envelope.media_type()) {
        return serde_json::from_slice(&envelope.body).map_err(|e| {
            InboundError::invalid_message(format!(
                "delivery {} is not valid JSON: {e}",
                envelope.delivery_tag
            ))
        });
    }
    Ok(match std::str::from_utf8(&envelope.body) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => Value::from(envelope.body.clone()),
    })
}

#[async_trait]
impl<W: Write + Send> InjectHandler for JsonLinesHandler<W> {
    async fn invoke(&self, envelope: &DeliveryEnvelope, worker_name: &str) -> Result<bool> {
        let record = Record {
            inbound: worker_name,
            envelope,
            body: body_value(envelope)?,
        };
        let line = serde_json::to_string(&record)
            .map_err(|e| InboundError::mediation(format!("cannot encode delivery: {e}")))?;

        let mut out = self
            .out
            .lock()
            .map_err(|_| InboundError::mediation("output writer lock poisoned"))?;
        writeln!(out, "{line}")?;
        out.flush()?;
        debug!(inbound = %worker_name, delivery_tag = envelope.delivery_tag, "Wrote delivery");
        Ok(true)
    }
}
