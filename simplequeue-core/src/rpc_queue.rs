// simplequeue-core/src/rpc_queue.rs
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus::{Channel, DeliveryStream};
use crate::config::{RpcOptions, WorkOptions};
use crate::handler::RpcHandler;
use crate::identity::{consumer_tag, correlation_token};
use crate::names::QueueNames;
use crate::registry::ChannelRegistry;
use crate::types::{
    ConsumeOptions, Delivery, MessageProperties, OutboundMessage, QueueArguments, QueueOptions,
};
use crate::worker_queue::{end_session, return_delivery, StopReason, WorkReport};
use crate::MessagingError;

/// First byte of a reply whose remaining bytes are the result.
pub const STATUS_OK: u8 = b'o';
/// Whole body of a reply whose handler failed.
pub const STATUS_FAILED: u8 = b'x';

/// Outcome of an RPC call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcReply {
    Ok(Vec<u8>),
    /// The responder ran the request and reported a failure.
    Failed,
    /// Nothing came back before the timeout.
    NoResponse,
}

impl RpcReply {
    /// Parses a reply body; `None` means no reply was received.
    pub fn decode(body: Option<&[u8]>) -> Self {
        match body {
            None => RpcReply::NoResponse,
            Some([STATUS_OK, rest @ ..]) => RpcReply::Ok(rest.to_vec()),
            Some(_) => RpcReply::Failed,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RpcReply::Ok(_))
    }

    /// Collapses both failure outcomes into `None`.
    pub fn into_option(self) -> Option<Vec<u8>> {
        match self {
            RpcReply::Ok(body) => Some(body),
            RpcReply::Failed | RpcReply::NoResponse => None,
        }
    }
}

fn encode_ok(result: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(result.len() + 1);
    body.push(STATUS_OK);
    body.extend_from_slice(result);
    body
}

/// Caller side of an RPC queue.
pub struct RpcClient {
    names: QueueNames,
    registry: ChannelRegistry,
    options: RpcOptions,
}

impl RpcClient {
    pub async fn open(
        registry: &ChannelRegistry,
        name: impl Into<String>,
    ) -> Result<Self, MessagingError> {
        let names = QueueNames::new(name);
        registry.channel(&names.rpc_queue()).await?;
        Ok(Self {
            names,
            registry: registry.clone(),
            options: RpcOptions::default(),
        })
    }

    /// Client for the queue served by `H`.
    pub async fn for_handler<H: RpcHandler>(
        registry: &ChannelRegistry,
    ) -> Result<Self, MessagingError> {
        Self::open(registry, H::queue_name().into_owned()).await
    }

    pub fn with_options(mut self, options: RpcOptions) -> Self {
        self.options = options;
        self
    }

    pub fn names(&self) -> &QueueNames {
        &self.names
    }

    /// Sends a request and waits for its reply, up to the configured timeout.
    ///
    /// Transport failures are errors; a missing reply or a failure reported
    /// by the responder is a regular [`RpcReply`]. Dropping the returned
    /// future still releases the reply queue.
    pub async fn call(
        &self,
        payload: impl Into<Vec<u8>>,
        properties: MessageProperties,
    ) -> Result<RpcReply, MessagingError> {
        let deadline = Instant::now() + self.options.timeout();
        let rpc_queue = self.names.rpc_queue();
        let correlation_id = correlation_token(self.names.logical());
        let channel = self.registry.channel(&rpc_queue).await?;

        let backlog = channel
            .declare_queue(&rpc_queue, QueueOptions::default(), QueueArguments::default())
            .await?;
        if backlog.message_count > self.options.backlog_warn_threshold {
            warn!(
                queue = %rpc_queue,
                count = backlog.message_count,
                consumers = backlog.consumer_count,
                "rpc backlog above threshold"
            );
        }

        let reply_queue = channel
            .declare_queue(
                "",
                QueueOptions::exclusive_auto_delete(),
                QueueArguments::default(),
            )
            .await?
            .name;
        let reply_tag = format!("rpc-{correlation_id}");
        let mut replies = channel
            .consume(
                &reply_queue,
                &reply_tag,
                ConsumeOptions {
                    no_ack: true,
                    exclusive: true,
                },
            )
            .await?;
        let subscription = ReplySubscription::new(Arc::clone(&channel), reply_tag);

        let properties = MessageProperties::default()
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(reply_queue.clone())
            .or(properties);
        if let Err(e) = channel
            .publish("", &rpc_queue, OutboundMessage::new(payload, properties))
            .await
        {
            if let Err(cancel) = subscription.close().await {
                debug!(
                    queue = %reply_queue,
                    error = %cancel,
                    "could not cancel reply consumer"
                );
            }
            return Err(e);
        }

        let waited = loop {
            match tokio::time::timeout_at(deadline, replies.next()).await {
                Err(_) | Ok(None) => break Ok(None),
                Ok(Some(Err(e))) => break Err(e),
                Ok(Some(Ok(reply))) => {
                    if reply.properties.correlation_id.as_deref() == Some(correlation_id.as_str()) {
                        break Ok(Some(reply.body));
                    }
                    debug!(
                        queue = %reply_queue,
                        correlation_id = ?reply.properties.correlation_id,
                        "ignoring reply for another call"
                    );
                }
            }
        };

        subscription.close().await?;
        let body = waited?;
        if body.is_none() {
            debug!(queue = %rpc_queue, %correlation_id, "rpc call timed out");
        }
        Ok(RpcReply::decode(body.as_deref()))
    }
}

/// The reply consumer of one call. If the call is abandoned before `close`,
/// dropping this cancels the consumer in the background so the auto-delete
/// reply queue goes away.
struct ReplySubscription {
    channel: Arc<dyn Channel>,
    tag: String,
    open: bool,
}

impl ReplySubscription {
    fn new(channel: Arc<dyn Channel>, tag: String) -> Self {
        Self {
            channel,
            tag,
            open: true,
        }
    }

    async fn close(mut self) -> Result<(), MessagingError> {
        let cancelled = self.channel.cancel(&self.tag).await;
        self.open = false;
        cancelled
    }
}

impl Drop for ReplySubscription {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let channel = Arc::clone(&self.channel);
        let tag = std::mem::take(&mut self.tag);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = channel.cancel(&tag).await {
                        debug!(
                            consumer_tag = %tag,
                            error = %e,
                            "could not cancel abandoned reply consumer"
                        );
                    }
                });
            }
            Err(_) => warn!(consumer_tag = %tag, "reply consumer abandoned outside a runtime"),
        }
    }
}

/// Responder side of an RPC queue.
pub struct RpcServer<H> {
    names: QueueNames,
    registry: ChannelRegistry,
    handler: H,
}

impl<H: RpcHandler> RpcServer<H> {
    pub async fn open(registry: &ChannelRegistry, handler: H) -> Result<Self, MessagingError> {
        Self::open_named(registry, QueueNames::from_cow(H::queue_name()), handler).await
    }

    pub async fn open_named(
        registry: &ChannelRegistry,
        names: QueueNames,
        handler: H,
    ) -> Result<Self, MessagingError> {
        registry.channel(&names.rpc_queue()).await?;
        Ok(Self {
            names,
            registry: registry.clone(),
            handler,
        })
    }

    pub fn names(&self) -> &QueueNames {
        &self.names
    }

    /// Serves requests until `max_messages` were answered, the idle timeout
    /// elapses, or the broker closes the consumer. Every request is answered
    /// once and acknowledged; nothing is requeued.
    pub async fn work(&self, options: &WorkOptions) -> Result<WorkReport, MessagingError> {
        let queue = self.names.rpc_queue();
        let channel = self.registry.channel(&queue).await?;
        channel
            .declare_queue(&queue, QueueOptions::default(), QueueArguments::default())
            .await?;
        channel.set_prefetch(1).await?;

        let mut report = WorkReport {
            processed: 0,
            acknowledged: 0,
            requeued: 0,
            dropped: 0,
            stop: StopReason::MaxMessages,
        };
        if options.max_messages == 0 {
            return Ok(report);
        }

        let tag = consumer_tag(self.names.logical());
        let mut stream = channel
            .consume(&queue, &tag, ConsumeOptions::default())
            .await?;
        info!(queue = %queue, consumer_tag = %tag, "serving rpc");

        let outcome = self
            .run_session(channel.as_ref(), &mut stream, options, &mut report)
            .await;
        report.stop = end_session(channel.as_ref(), &queue, &tag, &mut stream, outcome).await?;

        info!(
            queue = %queue,
            processed = report.processed,
            failed = report.dropped,
            stop = ?report.stop,
            "rpc session ended"
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
            let request = match next {
                Some(Ok(request)) => request,
                Some(Err(e)) => {
                    error!(queue = %self.names.rpc_queue(), error = %e, "delivery error");
                    return Err(e);
                }
                None => return Ok(StopReason::ConsumerClosed),
            };

            let delivery_tag = request.delivery_tag;
            let failed = match self.answer(channel, request).await {
                Ok(failed) => failed,
                Err(e) => {
                    return_delivery(channel, delivery_tag).await;
                    return Err(e);
                }
            };
            if failed {
                report.dropped += 1;
            }
            report.acknowledged += 1;
            report.processed += 1;
            if report.processed >= options.max_messages {
                return Ok(StopReason::MaxMessages);
            }
        }
    }

    /// Runs the handler, replies and acks. Returns whether the handler failed.
    async fn answer(
        &self,
        channel: &dyn Channel,
        request: Delivery,
    ) -> Result<bool, MessagingError> {
        let (body, failed) = match self.handler.process(&request.body).await {
            Ok(result) => (encode_ok(&result), false),
            Err(err) => {
                warn!(
                    queue = %self.names.rpc_queue(),
                    handler = std::any::type_name::<H>(),
                    payload = %String::from_utf8_lossy(&request.body),
                    error = ?err,
                    "rpc handler failed"
                );
                (vec![STATUS_FAILED], true)
            }
        };

        match request.properties.reply_to.as_deref() {
            Some(reply_to) if !reply_to.is_empty() => {
                let mut properties = MessageProperties::default();
                properties.correlation_id = request.properties.correlation_id.clone();
                channel
                    .publish("", reply_to, OutboundMessage::new(body, properties))
                    .await?;
            }
            _ => {
                warn!(
                    queue = %self.names.rpc_queue(),
                    payload = %String::from_utf8_lossy(&request.body),
                    "rpc request without reply-to, no reply sent"
                );
            }
        }

        channel.ack(request.delivery_tag).await?;
        Ok(failed)
    }
}
