use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Connection, ConnectionProperties,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::options::RabbitMqOptions;
use simplequeue_core::{
    Broker, Channel, ConsumeOptions, Delivery, DeliveryMode, DeliveryStream, ExchangeKind,
    ExchangeOptions, MessageProperties, MessagingError, OutboundMessage, QueueArguments,
    QueueInfo, QueueOptions,
};

const ARG_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";

/// `lapin` connection handing out [`RabbitChannel`]s. Reconnects on the next
/// `open_channel` if the connection was lost.
pub struct RabbitBroker {
    opts: RabbitMqOptions,
    conn: RwLock<Option<Connection>>,
}

impl RabbitBroker {
    pub async fn connect(opts: RabbitMqOptions) -> Result<Self, MessagingError> {
        let broker = Self {
            opts,
            conn: RwLock::new(None),
        };
        broker.connect_once().await?;
        Ok(broker)
    }

    async fn connect_once(&self) -> Result<(), MessagingError> {
        let mut props = ConnectionProperties::default();
        if let Some(name) = &self.opts.connection_name {
            props = props.with_connection_name(name.clone().into());
        }
        let conn = Connection::connect(&self.opts.uri, props)
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))?;

        *self.conn.write().await = Some(conn);
        info!(confirms = self.opts.confirms, "RabbitMQ connected");
        Ok(())
    }

    async fn create_channel(&self) -> Result<Option<lapin::Channel>, MessagingError> {
        let guard = self.conn.read().await;
        match guard.as_ref() {
            Some(conn) if conn.status().connected() => conn
                .create_channel()
                .await
                .map(Some)
                .map_err(|e| MessagingError::Connection(e.to_string())),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl Broker for RabbitBroker {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, MessagingError> {
        let ch = match self.create_channel().await? {
            Some(ch) => ch,
            None => {
                warn!("RabbitMQ connection lost, reconnecting");
                self.connect_once().await?;
                self.create_channel().await?.ok_or_else(|| {
                    MessagingError::Connection("no connection after reconnect".into())
                })?
            }
        };

        if self.opts.confirms {
            ch.confirm_select(ConfirmSelectOptions { nowait: false })
                .await
                .map_err(|e| MessagingError::Connection(e.to_string()))?;
        }
        debug!(channel_id = ch.id(), "channel opened");
        Ok(Arc::new(RabbitChannel { ch }))
    }
}

pub struct RabbitChannel {
    ch: lapin::Channel,
}

#[async_trait]
impl Channel for RabbitChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), MessagingError> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        self.ch
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: QueueArguments,
    ) -> Result<QueueInfo, MessagingError> {
        let mut args = FieldTable::default();
        if let Some(dlx) = arguments.dead_letter_exchange {
            args.insert(
                ARG_DEAD_LETTER_EXCHANGE.into(),
                AMQPValue::LongString(dlx.into()),
            );
        }

        let queue = self
            .ch
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    exclusive: options.exclusive,
                    nowait: false,
                    passive: false,
                },
                args,
            )
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        self.ch
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), MessagingError> {
        self.ch
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|e| MessagingError::Channel(e.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), MessagingError> {
        let confirm = self
            .ch
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                &message.body,
                to_basic_properties(message.properties),
            )
            .await
            .map_err(|e| MessagingError::Publish(e.to_string()))?
            .await
            .map_err(|e| MessagingError::Publish(e.to_string()))?;

        if confirm.is_nack() {
            return Err(MessagingError::Publish("publisher confirm NACK".to_string()));
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, MessagingError> {
        let consumer = self
            .ch
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Subscribe(e.to_string()))?;

        let stream = consumer.map(|delivery| {
            delivery
                .map(from_lapin_delivery)
                .map_err(|e| MessagingError::Subscribe(e.to_string()))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), MessagingError> {
        self.ch
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|e| MessagingError::Channel(e.to_string()))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        self.ch
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|e| MessagingError::Channel(e.to_string()))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        self.ch
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| MessagingError::Channel(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.ch.status().connected()
    }
}

fn to_basic_properties(props: MessageProperties) -> BasicProperties {
    let mut out = BasicProperties::default();
    if let Some(v) = props.content_type {
        out = out.with_content_type(v.into());
    }
    if let Some(v) = props.delivery_mode {
        out = out.with_delivery_mode(v.as_u8());
    }
    if let Some(v) = props.expiration {
        out = out.with_expiration(v.into());
    }
    if let Some(v) = props.reply_to {
        out = out.with_reply_to(v.into());
    }
    if let Some(v) = props.correlation_id {
        out = out.with_correlation_id(v.into());
    }
    if !props.headers.is_empty() {
        let mut headers = FieldTable::default();
        for (k, v) in props.headers {
            headers.insert(k.into(), AMQPValue::LongString(v.into()));
        }
        out = out.with_headers(headers);
    }
    out
}

fn from_basic_properties(props: &BasicProperties) -> MessageProperties {
    let text = |v: &Option<ShortString>| v.as_ref().map(|s| s.as_str().to_string());
    MessageProperties {
        content_type: text(props.content_type()),
        delivery_mode: (*props.delivery_mode()).and_then(DeliveryMode::from_u8),
        expiration: text(props.expiration()),
        reply_to: text(props.reply_to()),
        correlation_id: text(props.correlation_id()),
        headers: props
            .headers()
            .as_ref()
            .map(headers_from_table)
            .unwrap_or_default(),
    }
}

// Non-scalar header values are skipped.
fn headers_from_table(table: &FieldTable) -> BTreeMap<String, String> {
    table
        .inner()
        .iter()
        .filter_map(|(k, v)| {
            let value = match v {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                AMQPValue::Boolean(b) => b.to_string(),
                AMQPValue::ShortShortInt(n) => n.to_string(),
                AMQPValue::ShortShortUInt(n) => n.to_string(),
                AMQPValue::ShortInt(n) => n.to_string(),
                AMQPValue::ShortUInt(n) => n.to_string(),
                AMQPValue::LongInt(n) => n.to_string(),
                AMQPValue::LongUInt(n) => n.to_string(),
                AMQPValue::LongLongInt(n) => n.to_string(),
                _ => return None,
            };
            Some((k.as_str().to_string(), value))
        })
        .collect()
}

fn from_lapin_delivery(d: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: d.delivery_tag,
        redelivered: d.redelivered,
        exchange: d.exchange.as_str().to_string(),
        routing_key: d.routing_key.as_str().to_string(),
        properties: from_basic_properties(&d.properties),
        body: d.data,
    }
}
