use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::connector::RawDelivery;

/// Header whose value, when present, is copied into
/// [`DeliveryEnvelope::routing_hint`].
pub const ROUTING_HINT_HEADER: &str = "SOAP_ACTION";

pub const CORRELATION_ID: &str = "rabbitmq.correlation.id";
pub const MESSAGE_ID: &str = "rabbitmq.message.id";
pub const REPLY_TO: &str = "rabbitmq.replyto.name";
pub const EXPIRATION: &str = "rabbitmq.message.expiration";

/// One received message, handed to the injection handler exactly once.
///
/// The body is passed through untouched; validating it is the handler's job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryEnvelope {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    #[serde(skip)]
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub expiration: Option<String>,
    pub headers: HashMap<String, Value>,
    pub routing_hint: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl DeliveryEnvelope {
    /// Builds the envelope for a delivery, using `default_content_type` when
    /// the message carries none.
    pub fn from_delivery(raw: RawDelivery, default_content_type: Option<&str>) -> Self {
        let properties = raw.properties;
        let routing_hint = properties.headers.get(ROUTING_HINT_HEADER).map(header_text);
        let content_type = properties
            .content_type
            .or_else(|| default_content_type.map(str::to_string));

        Self {
            delivery_tag: raw.delivery_tag,
            redelivered: raw.redelivered,
            exchange: raw.exchange,
            routing_key: raw.routing_key,
            body: raw.body,
            correlation_id: properties.correlation_id,
            reply_to: properties.reply_to,
            message_id: properties.message_id,
            content_type,
            content_encoding: properties.content_encoding,
            expiration: properties.expiration,
            headers: properties.headers,
            routing_hint,
            received_at: Utc::now(),
        }
    }

    /// Content type without parameters such as `; charset=utf-8`.
    pub fn media_type(&self) -> Option<&str> {
        self.content_type
            .as_deref()
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
    }

    /// Message properties and headers flattened to strings, the way they are
    /// exposed to downstream dispatch.
    pub fn transport_headers(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        let fixed = [
            (CORRELATION_ID, &self.correlation_id),
            (MESSAGE_ID, &self.message_id),
            (REPLY_TO, &self.reply_to),
            (EXPIRATION, &self.expiration),
        ];
        for (key, value) in fixed {
            if let Some(value) = value {
                map.insert(key.to_string(), value.clone());
            }
        }
        for (name, value) in &self.headers {
            map.insert(name.clone(), header_text(value));
        }
        map
    }
}

fn header_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
