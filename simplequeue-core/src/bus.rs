// simplequeue-core/src/bus.rs
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::types::{
    ConsumeOptions, Delivery, ExchangeKind, ExchangeOptions, OutboundMessage, QueueArguments,
    QueueInfo, QueueOptions,
};
use crate::MessagingError;

/// Deliveries for one consumer. The stream ends once the consumer is
/// cancelled or the channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, MessagingError>>;

/// A connection to a broker, able to hand out channels.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, MessagingError>;
}

/// One broker channel: the transport primitives the queues are built on.
///
/// Delivery tags are scoped to the channel that produced the delivery; ack and
/// reject must go through that same channel.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), MessagingError>;

    /// Declares `name`, or a broker-named queue when `name` is empty.
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: QueueArguments,
    ) -> Result<QueueInfo, MessagingError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError>;

    /// Per-consumer prefetch for consumers created afterwards on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), MessagingError>;

    /// Publishes to `exchange`; the empty name is the default exchange, which
    /// routes straight to the queue named by `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), MessagingError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, MessagingError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), MessagingError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError>;

    /// False once the channel or its connection has been closed; every
    /// operation on it fails from then on.
    fn is_open(&self) -> bool;
}
