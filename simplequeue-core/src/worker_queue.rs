// simplequeue-core/src/worker_queue.rs
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::bus::{Channel, DeliveryStream};
use crate::config::{RetryPolicy, WorkOptions};
use crate::handler::JobHandler;
use crate::identity::consumer_tag;
use crate::names::QueueNames;
use crate::registry::ChannelRegistry;
use crate::types::{
    ConsumeOptions, Delivery, DeliveryMode, ExchangeKind, ExchangeOptions, MessageProperties,
    OutboundMessage, QueueArguments, QueueOptions, CONTENT_TYPE_JSON, CONTENT_TYPE_TEXT,
};
use crate::MessagingError;

/// Delays at or above this (100 days) are refused to stay inside the broker's
/// message TTL limits.
pub const MAX_DELAY: Duration = Duration::from_secs(8_640_000);

/// Header carrying how many times a job has been attempted.
pub const ATTEMPTS_HEADER: &str = "x-attempts";

/// How long to keep reading a cancelled consumer for deliveries that were
/// already in flight.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Why a consumer session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxMessages,
    IdleTimeout,
    ConsumerClosed,
}

/// Bookkeeping for one `work` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkReport {
    pub processed: u32,
    pub acknowledged: u32,
    pub requeued: u32,
    pub dropped: u32,
    pub stop: StopReason,
}

impl WorkReport {
    fn new() -> Self {
        Self {
            processed: 0,
            acknowledged: 0,
            requeued: 0,
            dropped: 0,
            stop: StopReason::ConsumerClosed,
        }
    }
}

/// Expiration in milliseconds for a delayed job.
pub fn delay_expiration_ms(delay: Duration) -> Result<u64, MessagingError> {
    if delay >= MAX_DELAY {
        return Err(MessagingError::InvalidArgument(format!(
            "delay of {}s exceeds the 100 day limit",
            delay.as_secs()
        )));
    }
    // below MAX_DELAY the millis always fit a u64
    Ok((delay.as_millis() as u64).max(1))
}

/// A durable, at-least-once job queue backed by `exchange:<name>` and
/// `queue:<name>`, with delayed delivery through a TTL'd pending pair.
pub struct WorkerQueue<H> {
    names: QueueNames,
    registry: ChannelRegistry,
    pending_declared: OnceCell<()>,
    handler: H,
    retry: RetryPolicy,
}

impl<H: JobHandler> WorkerQueue<H> {
    /// Opens the queue named after `H`.
    pub async fn open(registry: &ChannelRegistry, handler: H) -> Result<Self, MessagingError> {
        Self::open_named(registry, QueueNames::from_cow(H::queue_name()), handler).await
    }

    pub async fn open_named(
        registry: &ChannelRegistry,
        names: QueueNames,
        handler: H,
    ) -> Result<Self, MessagingError> {
        let channel = registry.channel(names.logical()).await?;
        let exchange = names.exchange();
        let queue = names.queue();

        channel
            .declare_exchange(&exchange, ExchangeKind::Direct, ExchangeOptions::durable())
            .await?;
        channel
            .declare_queue(&queue, QueueOptions::durable(), QueueArguments::default())
            .await?;
        channel.bind_queue(&queue, &exchange, "").await?;
        channel.set_prefetch(1).await?;

        debug!(queue = %queue, exchange = %exchange, "worker queue declared");

        Ok(Self {
            names,
            registry: registry.clone(),
            pending_declared: OnceCell::new(),
            handler,
            retry: RetryPolicy::default(),
        })
    }

    /// Fails with `InvalidArgument` when the backoff is not a valid delay.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Result<Self, MessagingError> {
        if let Some(backoff) = retry.backoff() {
            delay_expiration_ms(backoff)?;
        }
        self.retry = retry;
        Ok(self)
    }

    pub fn names(&self) -> &QueueNames {
        &self.names
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Publishes a job. Caller properties win over the `text/plain` and
    /// persistent defaults.
    pub async fn enqueue(
        &self,
        payload: impl Into<Vec<u8>>,
        properties: MessageProperties,
    ) -> Result<(), MessagingError> {
        let message = wrap_message(payload.into(), properties);
        self.channel()
            .await?
            .publish(&self.names.exchange(), "", message)
            .await
    }

    pub async fn enqueue_json<T: Serialize + ?Sized>(&self, job: &T) -> Result<(), MessagingError> {
        let body =
            serde_json::to_vec(job).map_err(|e| MessagingError::Serialization(e.to_string()))?;
        self.enqueue(
            body,
            MessageProperties::default().with_content_type(CONTENT_TYPE_JSON),
        )
        .await
    }

    /// Publishes a job that becomes visible on the primary queue after
    /// `delay`, once the broker dead-letters it out of the pending queue.
    pub async fn delayed_enqueue(
        &self,
        payload: impl Into<Vec<u8>>,
        delay: Duration,
        properties: MessageProperties,
    ) -> Result<(), MessagingError> {
        let expiration = delay_expiration_ms(delay)?;
        let properties = MessageProperties::default()
            .with_expiration_ms(expiration)
            .or(properties);
        self.publish_pending(wrap_message(payload.into(), properties))
            .await
    }

    /// Runs one consumer session. Returns when `max_messages` deliveries were
    /// handled, when nothing arrived for the idle timeout, or when the broker
    /// closed the consumer.
    ///
    /// The consumer is cancelled on every way out, errors included, so the
    /// queue can be worked again afterwards.
    pub async fn work(&self, options: &WorkOptions) -> Result<WorkReport, MessagingError> {
        let mut report = WorkReport::new();
        if options.max_messages == 0 {
            report.stop = StopReason::MaxMessages;
            return Ok(report);
        }

        let channel = self.channel().await?;
        channel.set_prefetch(1).await?;
        let queue = self.names.queue();
        let tag = consumer_tag(self.names.logical());
        let mut stream = channel
            .consume(&queue, &tag, ConsumeOptions::default())
            .await?;
        info!(queue = %queue, consumer_tag = %tag, "consuming");

        let outcome = self
            .run_session(channel.as_ref(), &mut stream, options, &mut report)
            .await;
        report.stop = end_session(channel.as_ref(), &queue, &tag, &mut stream, outcome).await?;

        info!(
            queue = %queue,
            processed = report.processed,
            requeued = report.requeued,
            dropped = report.dropped,
            stop = ?report.stop,
            "consumer session ended"
        );
        Ok(report)
    }

    async fn run_session(
        &self,
        channel: &dyn Channel,
        stream: &mut DeliveryStream,
        options: &WorkOptions,
        report: &mut WorkReport,
    ) -> Result<StopReason, MessagingError> {
        loop {
            let next = match options.idle_timeout() {
                Some(idle) => match tokio::time::timeout(idle, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => return Ok(StopReason::IdleTimeout),
                },
                None => stream.next().await,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!(queue = %self.names.queue(), error = %e, "delivery error");
                    return Err(e);
                }
                None => return Ok(StopReason::ConsumerClosed),
            };

            let delivery_tag = delivery.delivery_tag;
            if let Err(e) = self.handle_delivery(channel, delivery, report).await {
                return_delivery(channel, delivery_tag).await;
                return Err(e);
            }
            report.processed += 1;
            if report.processed >= options.max_messages {
                return Ok(StopReason::MaxMessages);
            }
        }
    }

    async fn handle_delivery(
        &self,
        channel: &dyn Channel,
        delivery: Delivery,
        report: &mut WorkReport,
    ) -> Result<(), MessagingError> {
        match self.handler.consume(&delivery.body).await {
            Ok(()) => {
                channel.ack(delivery.delivery_tag).await?;
                report.acknowledged += 1;
            }
            Err(err) => {
                error!(
                    queue = %self.names.queue(),
                    handler = std::any::type_name::<H>(),
                    payload = %String::from_utf8_lossy(&delivery.body),
                    retryable = err.is_retryable(),
                    error = ?err,
                    "{} {}",
                    err,
                    std::any::type_name::<H>()
                );
                if err.is_retryable() {
                    self.retry(channel, delivery, report).await?;
                } else {
                    channel.ack(delivery.delivery_tag).await?;
                    report.dropped += 1;
                }
            }
        }
        Ok(())
    }

    async fn retry(
        &self,
        channel: &dyn Channel,
        delivery: Delivery,
        report: &mut WorkReport,
    ) -> Result<(), MessagingError> {
        if self.retry.uses_requeue() {
            channel.reject(delivery.delivery_tag, true).await?;
            report.requeued += 1;
            return Ok(());
        }

        let attempts = attempts_of(&delivery);
        if self.retry.max_attempts.is_some_and(|max| attempts >= max) {
            warn!(
                queue = %self.names.queue(),
                attempts,
                payload = %String::from_utf8_lossy(&delivery.body),
                "retry budget exhausted, dropping job"
            );
            channel.ack(delivery.delivery_tag).await?;
            report.dropped += 1;
            return Ok(());
        }

        let mut properties = delivery.properties.clone();
        properties.expiration = None;
        properties
            .headers
            .insert(ATTEMPTS_HEADER.to_string(), (attempts + 1).to_string());

        match self.retry.backoff() {
            Some(backoff) => {
                let expiration = delay_expiration_ms(backoff)?;
                let properties = properties.with_expiration_ms(expiration);
                self.publish_pending(OutboundMessage::new(delivery.body.clone(), properties))
                    .await?;
            }
            None => {
                channel
                    .publish(
                        &self.names.exchange(),
                        "",
                        OutboundMessage::new(delivery.body.clone(), properties),
                    )
                    .await?;
            }
        }
        // the copy is on the broker before the original goes away
        channel.ack(delivery.delivery_tag).await?;
        report.requeued += 1;
        Ok(())
    }

    async fn channel(&self) -> Result<Arc<dyn Channel>, MessagingError> {
        self.registry.channel(self.names.logical()).await
    }

    /// The pending pair lives on its own channel and is declared on first use.
    async fn publish_pending(&self, message: OutboundMessage) -> Result<(), MessagingError> {
        let channel = self
            .registry
            .channel(&self.names.pending_channel_key())
            .await?;
        self.pending_declared
            .get_or_try_init(|| self.declare_pending(channel.as_ref()))
            .await?;
        channel
            .publish(&self.names.pending_exchange(), "", message)
            .await
    }

    async fn declare_pending(&self, channel: &dyn Channel) -> Result<(), MessagingError> {
        let pending_exchange = self.names.pending_exchange();
        let pending_queue = self.names.pending_queue();

        channel
            .declare_exchange(
                &pending_exchange,
                ExchangeKind::Direct,
                ExchangeOptions::durable(),
            )
            .await?;
        channel
            .declare_queue(
                &pending_queue,
                QueueOptions::durable(),
                QueueArguments::dead_letter_to(self.names.exchange()),
            )
            .await?;
        channel
            .bind_queue(&pending_queue, &pending_exchange, "")
            .await?;
        debug!(queue = %pending_queue, "pending queue declared");
        Ok(())
    }
}

fn wrap_message(body: Vec<u8>, properties: MessageProperties) -> OutboundMessage {
    let defaults = MessageProperties::default()
        .with_content_type(CONTENT_TYPE_TEXT)
        .with_delivery_mode(DeliveryMode::Persistent);
    OutboundMessage::new(body, properties.or(defaults))
}

fn attempts_of(delivery: &Delivery) -> u32 {
    delivery
        .properties
        .headers
        .get(ATTEMPTS_HEADER)
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
}

/// Closes a consumer session whatever its outcome. Unless the broker already
/// ended the consumer, it is cancelled and whatever it still held goes back
/// to the queue. A failed session still reports its original error.
pub(crate) async fn end_session(
    channel: &dyn Channel,
    queue: &str,
    tag: &str,
    stream: &mut DeliveryStream,
    outcome: Result<StopReason, MessagingError>,
) -> Result<StopReason, MessagingError> {
    match outcome {
        Ok(StopReason::ConsumerClosed) => Ok(StopReason::ConsumerClosed),
        Ok(stop) => {
            cancel_and_drain(channel, tag, stream).await?;
            Ok(stop)
        }
        Err(err) => {
            if let Err(e) = cancel_and_drain(channel, tag, stream).await {
                warn!(
                    queue,
                    consumer_tag = tag,
                    error = %e,
                    "could not cancel consumer after failure"
                );
            }
            Err(err)
        }
    }
}

async fn cancel_and_drain(
    channel: &dyn Channel,
    tag: &str,
    stream: &mut DeliveryStream,
) -> Result<(), MessagingError> {
    channel.cancel(tag).await?;
    drain_cancelled(channel, stream).await
}

/// Puts back a delivery whose handling broke off half-way.
pub(crate) async fn return_delivery(channel: &dyn Channel, delivery_tag: u64) {
    if let Err(e) = channel.reject(delivery_tag, true).await {
        debug!(delivery_tag, error = %e, "could not return delivery");
    }
}

/// Rejects, with requeue, whatever the transport pushed to a consumer before
/// its cancel took effect, so nothing sits unacknowledged on the channel.
async fn drain_cancelled(
    channel: &dyn Channel,
    stream: &mut DeliveryStream,
) -> Result<(), MessagingError> {
    while let Ok(Some(next)) = tokio::time::timeout(DRAIN_GRACE, stream.next()).await {
        if let Ok(delivery) = next {
            debug!(delivery_tag = delivery.delivery_tag, "returning undelivered message");
            channel.reject(delivery.delivery_tag, true).await?;
        }
    }
    Ok(())
}
