// simplequeue-core/src/types.rs
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const CONTENT_TYPE_TEXT: &str = "text/plain";
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// AMQP delivery mode. Persistent messages survive a broker restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    Transient,
    Persistent,
}

impl DeliveryMode {
    pub fn as_u8(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }

    pub fn from_u8(mode: u8) -> Option<Self> {
        match mode {
            1 => Some(DeliveryMode::Transient),
            2 => Some(DeliveryMode::Persistent),
            _ => None,
        }
    }
}

/// Message property set. Unset fields are left for the broker's defaults or
/// for [`MessageProperties::or`] to fill in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub delivery_mode: Option<DeliveryMode>,
    /// Per-message TTL in milliseconds, string-encoded as on the wire.
    pub expiration: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    pub fn with_content_type(mut self, value: impl Into<String>) -> Self {
        self.content_type = Some(value.into());
        self
    }

    pub fn with_delivery_mode(mut self, value: DeliveryMode) -> Self {
        self.delivery_mode = Some(value);
        self
    }

    pub fn with_expiration_ms(mut self, millis: u64) -> Self {
        self.expiration = Some(millis.to_string());
        self
    }

    pub fn with_reply_to(mut self, value: impl Into<String>) -> Self {
        self.reply_to = Some(value.into());
        self
    }

    pub fn with_correlation_id(mut self, value: impl Into<String>) -> Self {
        self.correlation_id = Some(value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Fills every unset field of `self` from `defaults`. Fields already set on
    /// `self` win, header keys included.
    pub fn or(mut self, defaults: MessageProperties) -> Self {
        self.content_type = self.content_type.or(defaults.content_type);
        self.delivery_mode = self.delivery_mode.or(defaults.delivery_mode);
        self.expiration = self.expiration.or(defaults.expiration);
        self.reply_to = self.reply_to.or(defaults.reply_to);
        self.correlation_id = self.correlation_id.or(defaults.correlation_id);
        for (k, v) in defaults.headers {
            self.headers.entry(k).or_insert(v);
        }
        self
    }

    pub fn expiration_ms(&self) -> Option<u64> {
        self.expiration.as_deref().and_then(|e| e.parse().ok())
    }
}

/// A message about to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl OutboundMessage {
    pub fn new(body: impl Into<Vec<u8>>, properties: MessageProperties) -> Self {
        Self {
            body: body.into(),
            properties,
        }
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeKind {
    Direct,
    Fanout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    /// Private reply queue: owned by the declaring connection, removed with
    /// its last consumer.
    pub fn exclusive_auto_delete() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
}

impl QueueArguments {
    pub fn dead_letter_to(exchange: impl Into<String>) -> Self {
        Self {
            dead_letter_exchange: Some(exchange.into()),
        }
    }
}

/// Result of a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    /// Broker-generated when declared with an empty name.
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumeOptions {
    /// Deliveries are considered acknowledged as soon as they are sent.
    pub no_ack: bool,
    pub exclusive: bool,
}
