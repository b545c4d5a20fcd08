// simplequeue-core/src/memory.rs
//! In-process broker implementing [`Broker`] and [`Channel`].
//!
//! Covers what the queues rely on: direct and fanout exchanges, the default
//! exchange, per-consumer prefetch, ack/reject/requeue, per-message TTL with
//! dead-lettering and broker-named exclusive auto-delete queues. Useful for
//! tests and for running locally without RabbitMQ.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::bus::{Broker, Channel, DeliveryStream};
use crate::types::{
    ConsumeOptions, Delivery, ExchangeKind, ExchangeOptions, OutboundMessage, QueueArguments,
    QueueInfo, QueueOptions,
};
use crate::MessagingError;

type Shared = Arc<Mutex<BrokerState>>;
type ConsumerKey = (u64, String);
type DeliverySender = mpsc::UnboundedSender<Result<Delivery, MessagingError>>;

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Shared,
    next_channel: Arc<AtomicU64>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ready messages in `queue`, or `None` if it does not exist.
    pub fn message_count(&self, queue: &str) -> Option<usize> {
        self.state.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// Delivered but not yet acknowledged messages taken from `queue`.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unacked
            .values()
            .filter(|u| u.queue == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    pub fn is_bound(&self, queue: &str, exchange: &str) -> bool {
        self.state
            .lock()
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange)
    }

    pub fn dead_letter_exchange(&self, queue: &str) -> Option<String> {
        self.state
            .lock()
            .queues
            .get(queue)
            .and_then(|q| q.dead_letter_exchange.clone())
    }

    /// Removes an exchange and its bindings; publishing to it fails afterwards.
    pub fn delete_exchange(&self, name: &str) {
        let mut st = self.state.lock();
        st.exchanges.remove(name);
        st.bindings.retain(|b| b.exchange != name);
    }

    /// Closes every channel opened so far, as a lost connection would. Their
    /// consumers end and unacknowledged deliveries go back to their queues.
    pub fn close_channels(&self) {
        let opened = self.next_channel.load(Ordering::Relaxed);
        let mut st = self.state.lock();
        for id in 1..=opened {
            st.close_channel(id);
            st.closed_channels.insert(id);
        }
    }

    /// Copies of the ready messages in `queue`, head first.
    pub fn ready_messages(&self, queue: &str) -> Vec<OutboundMessage> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|m| OutboundMessage::new(m.body.clone(), m.properties.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, MessagingError> {
        let id = self.next_channel.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Arc::new(InMemoryChannel {
            id,
            state: Arc::clone(&self.state),
            prefetch: AtomicU16::new(0),
        }))
    }
}

pub struct InMemoryChannel {
    id: u64,
    state: Shared,
    prefetch: AtomicU16,
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _options: ExchangeOptions,
    ) -> Result<(), MessagingError> {
        if name.is_empty() {
            return Err(MessagingError::Connection(
                "ACCESS_REFUSED - the default exchange cannot be declared".into(),
            ));
        }
        let mut st = self.lock_open()?;
        match st.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(MessagingError::Connection(format!(
                "PRECONDITION_FAILED - exchange '{name}' declared as {existing:?}"
            ))),
            Some(_) => Ok(()),
            None => {
                st.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: QueueArguments,
    ) -> Result<QueueInfo, MessagingError> {
        let mut st = self.lock_open()?;
        let name = if name.is_empty() {
            st.next_queue_seq += 1;
            format!("amq.gen-{}-{}", self.id, st.next_queue_seq)
        } else {
            name.to_string()
        };

        let queue = st.queues.entry(name.clone()).or_insert_with(|| QueueState {
            ready: VecDeque::new(),
            dead_letter_exchange: arguments.dead_letter_exchange.clone(),
            auto_delete: options.auto_delete,
            consumers: Vec::new(),
            cursor: 0,
        });
        if queue.dead_letter_exchange != arguments.dead_letter_exchange {
            return Err(MessagingError::Connection(format!(
                "PRECONDITION_FAILED - inequivalent arg 'x-dead-letter-exchange' for queue '{name}'"
            )));
        }

        Ok(QueueInfo {
            message_count: queue.ready.len() as u32,
            consumer_count: queue.consumers.len() as u32,
            name,
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        let mut st = self.lock_open()?;
        if !st.queues.contains_key(queue) {
            return Err(MessagingError::Connection(format!(
                "NOT_FOUND - no queue '{queue}'"
            )));
        }
        if !st.exchanges.contains_key(exchange) {
            return Err(MessagingError::Connection(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !st.bindings.contains(&binding) {
            st.bindings.push(binding);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), MessagingError> {
        drop(self.lock_open()?);
        self.prefetch.store(count, Ordering::Relaxed);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), MessagingError> {
        let expiries = {
            let mut st = self.lock_open()?;
            if !exchange.is_empty() && !st.exchanges.contains_key(exchange) {
                return Err(MessagingError::Publish(format!(
                    "NOT_FOUND - no exchange '{exchange}'"
                )));
            }
            st.route(exchange, routing_key, message)
        };
        schedule_expiries(&self.state, expiries);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, MessagingError> {
        let key: ConsumerKey = (self.id, consumer_tag.to_string());
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut st = self.lock_open()?;
            if st.consumers.contains_key(&key) {
                return Err(MessagingError::Subscribe(format!(
                    "NOT_ALLOWED - attempt to reuse consumer tag '{consumer_tag}'"
                )));
            }
            let Some(q) = st.queues.get_mut(queue) else {
                return Err(MessagingError::Subscribe(format!(
                    "NOT_FOUND - no queue '{queue}'"
                )));
            };
            if options.exclusive && !q.consumers.is_empty() {
                return Err(MessagingError::Subscribe(format!(
                    "ACCESS_REFUSED - queue '{queue}' in use, exclusive consume refused"
                )));
            }
            q.consumers.push(key.clone());
            st.consumers.insert(
                key,
                ConsumerState {
                    queue: queue.to_string(),
                    sender: tx,
                    prefetch: self.prefetch.load(Ordering::Relaxed),
                    no_ack: options.no_ack,
                    in_flight: 0,
                },
            );
            st.dispatch(queue);
        }
        debug!(queue, consumer_tag, "consumer registered");

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), MessagingError> {
        let mut st = self.lock_open()?;
        st.remove_consumer(&(self.id, consumer_tag.to_string()));
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        let mut st = self.lock_open()?;
        let unacked = st.take_unacked(self.id, delivery_tag)?;
        st.dispatch(&unacked.queue);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        let expiries = {
            let mut st = self.lock_open()?;
            let unacked = st.take_unacked(self.id, delivery_tag)?;
            let queue = unacked.queue.clone();
            let expiries = if requeue {
                st.requeue(unacked);
                Vec::new()
            } else {
                st.dead_letter(&queue, unacked.message)
            };
            st.dispatch(&queue);
            expiries
        };
        schedule_expiries(&self.state, expiries);
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.state.lock().closed_channels.contains(&self.id)
    }
}

impl InMemoryChannel {
    fn lock_open(&self) -> Result<MutexGuard<'_, BrokerState>, MessagingError> {
        let st = self.state.lock();
        if st.closed_channels.contains(&self.id) {
            return Err(MessagingError::Channel(format!(
                "channel {} is closed",
                self.id
            )));
        }
        Ok(st)
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        let mut st = self.state.lock();
        st.close_channel(self.id);
        st.closed_channels.remove(&self.id);
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    consumers: HashMap<ConsumerKey, ConsumerState>,
    unacked: HashMap<u64, Unacked>,
    next_delivery_tag: u64,
    next_message_id: u64,
    next_queue_seq: u64,
    closed_channels: HashSet<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

struct QueueState {
    ready: VecDeque<StoredMessage>,
    dead_letter_exchange: Option<String>,
    auto_delete: bool,
    consumers: Vec<ConsumerKey>,
    cursor: usize,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    properties: crate::types::MessageProperties,
    redelivered: bool,
}

struct ConsumerState {
    queue: String,
    sender: DeliverySender,
    prefetch: u16,
    no_ack: bool,
    in_flight: usize,
}

impl ConsumerState {
    fn has_capacity(&self) -> bool {
        self.no_ack || self.prefetch == 0 || self.in_flight < self.prefetch as usize
    }
}

struct Unacked {
    channel: u64,
    consumer: ConsumerKey,
    queue: String,
    message: StoredMessage,
}

struct Expiry {
    queue: String,
    message_id: u64,
    after: Duration,
}

impl BrokerState {
    // Cancels the channel's consumers and requeues what they held.
    fn close_channel(&mut self, channel: u64) {
        let keys: Vec<ConsumerKey> = self
            .consumers
            .keys()
            .filter(|(id, _)| *id == channel)
            .cloned()
            .collect();
        for key in keys {
            self.remove_consumer(&key);
        }
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                let queue = unacked.queue.clone();
                self.requeue(unacked);
                self.dispatch(&queue);
            }
        }
    }

    fn route(&mut self, exchange: &str, routing_key: &str, message: OutboundMessage) -> Vec<Expiry> {
        let targets: Vec<String> = if exchange.is_empty() {
            self.queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default()
        } else {
            let kind = self.exchanges.get(exchange).copied();
            let mut targets: Vec<String> = self
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange)
                .filter(|b| kind == Some(ExchangeKind::Fanout) || b.routing_key == routing_key)
                .map(|b| b.queue.clone())
                .collect();
            targets.dedup();
            targets
        };

        if targets.is_empty() {
            trace!(exchange, routing_key, "unroutable message dropped");
        }

        let mut expiries = Vec::new();
        for target in targets {
            self.next_message_id += 1;
            let stored = StoredMessage {
                id: self.next_message_id,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: message.body.clone(),
                properties: message.properties.clone(),
                redelivered: false,
            };
            if let Some(ttl) = stored.properties.expiration_ms() {
                expiries.push(Expiry {
                    queue: target.clone(),
                    message_id: stored.id,
                    after: Duration::from_millis(ttl),
                });
            }
            if let Some(q) = self.queues.get_mut(&target) {
                q.ready.push_back(stored);
            }
            self.dispatch(&target);
        }
        expiries
    }

    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(q) = self.queues.get_mut(queue) else {
                return;
            };
            if q.ready.is_empty() || q.consumers.is_empty() {
                return;
            }

            let n = q.consumers.len();
            let mut picked = None;
            for i in 0..n {
                let idx = (q.cursor + i) % n;
                let key = &q.consumers[idx];
                if self.consumers.get(key).is_some_and(ConsumerState::has_capacity) {
                    picked = Some(idx);
                    break;
                }
            }
            let Some(idx) = picked else {
                return;
            };
            q.cursor = (idx + 1) % n;
            let key = q.consumers[idx].clone();
            let Some(message) = q.ready.pop_front() else {
                return;
            };

            self.next_delivery_tag += 1;
            let delivery_tag = self.next_delivery_tag;
            let delivery = Delivery {
                delivery_tag,
                redelivered: message.redelivered,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                body: message.body.clone(),
                properties: message.properties.clone(),
            };

            let Some(consumer) = self.consumers.get_mut(&key) else {
                return;
            };
            if consumer.sender.send(Ok(delivery)).is_err() {
                // receiver dropped without a cancel
                if let Some(q) = self.queues.get_mut(queue) {
                    q.ready.push_front(message);
                }
                self.remove_consumer(&key);
                continue;
            }
            if !consumer.no_ack {
                consumer.in_flight += 1;
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        channel: key.0,
                        consumer: key,
                        queue: queue.to_string(),
                        message,
                    },
                );
            }
        }
    }

    fn take_unacked(&mut self, channel: u64, delivery_tag: u64) -> Result<Unacked, MessagingError> {
        match self.unacked.get(&delivery_tag) {
            Some(u) if u.channel == channel => {}
            _ => {
                return Err(MessagingError::Channel(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
                )))
            }
        }
        let unacked = self
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| MessagingError::Channel(format!("unknown delivery tag {delivery_tag}")))?;
        if let Some(consumer) = self.consumers.get_mut(&unacked.consumer) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
        Ok(unacked)
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(q) = self.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            q.ready.push_front(message);
        }
    }

    fn dead_letter(&mut self, queue: &str, message: StoredMessage) -> Vec<Expiry> {
        let Some(dlx) = self
            .queues
            .get(queue)
            .and_then(|q| q.dead_letter_exchange.clone())
        else {
            trace!(queue, "message dropped, no dead-letter exchange");
            return Vec::new();
        };
        if !self.exchanges.contains_key(&dlx) {
            return Vec::new();
        }
        let mut properties = message.properties;
        properties.expiration = None;
        self.route(
            &dlx,
            &message.routing_key,
            OutboundMessage::new(message.body, properties),
        )
    }

    fn expire(&mut self, queue: &str, message_id: u64) -> Vec<Expiry> {
        let Some(q) = self.queues.get_mut(queue) else {
            return Vec::new();
        };
        let Some(pos) = q.ready.iter().position(|m| m.id == message_id) else {
            return Vec::new();
        };
        let Some(message) = q.ready.remove(pos) else {
            return Vec::new();
        };
        trace!(queue, message_id, "message expired");
        self.dead_letter(queue, message)
    }

    fn remove_consumer(&mut self, key: &ConsumerKey) {
        let Some(consumer) = self.consumers.remove(key) else {
            return;
        };
        let queue = consumer.queue;
        let delete = match self.queues.get_mut(&queue) {
            Some(q) => {
                q.consumers.retain(|k| k != key);
                q.cursor = 0;
                q.auto_delete && q.consumers.is_empty()
            }
            None => false,
        };
        if delete {
            self.queues.remove(&queue);
            self.bindings.retain(|b| b.queue != queue);
            debug!(queue = %queue, "auto-deleted queue");
        }
    }
}

fn schedule_expiries(state: &Shared, expiries: Vec<Expiry>) {
    for expiry in expiries {
        let state = Arc::clone(state);
        tokio::spawn(async move {
            tokio::time::sleep(expiry.after).await;
            let more = {
                let mut st = state.lock();
                st.expire(&expiry.queue, expiry.message_id)
            };
            schedule_expiries(&state, more);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageProperties;

    async fn setup(broker: &InMemoryBroker) -> Arc<dyn Channel> {
        let ch = broker.open_channel().await.unwrap();
        ch.declare_exchange("ex", ExchangeKind::Direct, ExchangeOptions::durable())
            .await
            .unwrap();
        ch.declare_queue("q", QueueOptions::durable(), QueueArguments::default())
            .await
            .unwrap();
        ch.bind_queue("q", "ex", "").await.unwrap();
        ch
    }

    fn msg(body: &str) -> OutboundMessage {
        OutboundMessage::new(body.as_bytes(), MessageProperties::default())
    }

    #[tokio::test]
    async fn direct_routing_matches_binding_key() {
        let broker = InMemoryBroker::new();
        let ch = setup(&broker).await;

        ch.publish("ex", "", msg("a")).await.unwrap();
        ch.publish("ex", "other", msg("b")).await.unwrap();

        assert_eq!(broker.message_count("q"), Some(1));
    }

    #[tokio::test]
    async fn publish_to_missing_exchange_fails() {
        let broker = InMemoryBroker::new();
        let ch = broker.open_channel().await.unwrap();
        let err = ch.publish("nope", "", msg("a")).await.unwrap_err();
        assert!(matches!(err, MessagingError::Publish(_)));
    }

    #[tokio::test]
    async fn prefetch_limits_in_flight_deliveries() {
        let broker = InMemoryBroker::new();
        let ch = setup(&broker).await;
        ch.set_prefetch(1).await.unwrap();
        for body in ["a", "b", "c"] {
            ch.publish("ex", "", msg(body)).await.unwrap();
        }

        let mut stream = ch.consume("q", "c1", ConsumeOptions::default()).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.body, b"a");
        assert_eq!(broker.unacked_count("q"), 1);
        assert_eq!(broker.message_count("q"), Some(2));

        ch.ack(first.delivery_tag).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.body, b"b");
    }

    #[tokio::test]
    async fn reject_with_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        let ch = setup(&broker).await;
        ch.set_prefetch(1).await.unwrap();
        ch.publish("ex", "", msg("a")).await.unwrap();

        let mut stream = ch.consume("q", "c1", ConsumeOptions::default()).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        ch.reject(first.delivery_tag, true).await.unwrap();

        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.body, b"a");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn double_ack_is_a_channel_error() {
        let broker = InMemoryBroker::new();
        let ch = setup(&broker).await;
        ch.publish("ex", "", msg("a")).await.unwrap();
        let mut stream = ch.consume("q", "c1", ConsumeOptions::default()).await.unwrap();
        let d = stream.next().await.unwrap().unwrap();

        ch.ack(d.delivery_tag).await.unwrap();
        assert!(matches!(
            ch.ack(d.delivery_tag).await,
            Err(MessagingError::Channel(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_messages_are_dead_lettered() {
        let broker = InMemoryBroker::new();
        let ch = setup(&broker).await;
        ch.declare_exchange("ex:pending", ExchangeKind::Direct, ExchangeOptions::durable())
            .await
            .unwrap();
        ch.declare_queue(
            "q:pending",
            QueueOptions::durable(),
            QueueArguments::dead_letter_to("ex"),
        )
        .await
        .unwrap();
        ch.bind_queue("q:pending", "ex:pending", "").await.unwrap();

        let props = MessageProperties::default().with_expiration_ms(2000);
        ch.publish("ex:pending", "", OutboundMessage::new("later", props))
            .await
            .unwrap();
        assert_eq!(broker.message_count("q"), Some(0));
        assert_eq!(broker.message_count("q:pending"), Some(1));

        tokio::time::sleep(Duration::from_millis(2100)).await;

        assert_eq!(broker.message_count("q:pending"), Some(0));
        let moved = broker.ready_messages("q");
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].body, b"later");
        assert_eq!(moved[0].properties.expiration, None);
    }

    #[tokio::test]
    async fn server_named_auto_delete_queue_goes_with_last_consumer() {
        let broker = InMemoryBroker::new();
        let ch = broker.open_channel().await.unwrap();
        let info = ch
            .declare_queue("", QueueOptions::exclusive_auto_delete(), QueueArguments::default())
            .await
            .unwrap();
        assert!(info.name.starts_with("amq.gen-"));

        let _stream = ch
            .consume(&info.name, "reply", ConsumeOptions { no_ack: true, exclusive: true })
            .await
            .unwrap();
        assert!(broker.has_queue(&info.name));

        ch.cancel("reply").await.unwrap();
        assert!(!broker.has_queue(&info.name));
    }

    #[tokio::test]
    async fn cancel_ends_the_stream() {
        let broker = InMemoryBroker::new();
        let ch = setup(&broker).await;
        let mut stream = ch.consume("q", "c1", ConsumeOptions::default()).await.unwrap();
        ch.cancel("c1").await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_a_channel_requeues_its_unacked() {
        let broker = InMemoryBroker::new();
        let ch = setup(&broker).await;
        ch.publish("ex", "", msg("a")).await.unwrap();
        let mut stream = ch.consume("q", "c1", ConsumeOptions::default()).await.unwrap();
        let _held = stream.next().await.unwrap().unwrap();
        assert_eq!(broker.unacked_count("q"), 1);

        drop(stream);
        drop(ch);

        assert_eq!(broker.unacked_count("q"), 0);
        assert_eq!(broker.message_count("q"), Some(1));
    }

    #[tokio::test]
    async fn closed_channels_refuse_work_and_give_messages_back() {
        let broker = InMemoryBroker::new();
        let ch = setup(&broker).await;
        ch.publish("ex", "", msg("a")).await.unwrap();
        let mut stream = ch.consume("q", "c1", ConsumeOptions::default()).await.unwrap();
        let held = stream.next().await.unwrap().unwrap();

        broker.close_channels();

        assert!(!ch.is_open());
        assert!(stream.next().await.is_none());
        assert_eq!(broker.message_count("q"), Some(1));
        assert!(matches!(
            ch.ack(held.delivery_tag).await,
            Err(MessagingError::Channel(_))
        ));
        assert!(ch.publish("ex", "", msg("b")).await.is_err());

        let fresh = broker.open_channel().await.unwrap();
        assert!(fresh.is_open());
        fresh.publish("ex", "", msg("b")).await.unwrap();
        assert_eq!(broker.message_count("q"), Some(2));
    }
}
