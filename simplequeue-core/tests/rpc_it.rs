use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use simplequeue_core::{
    Broker, ChannelRegistry, ConsumeOptions, HandlerError, InMemoryBroker, MessageProperties,
    MessagingError, OutboundMessage, QueueArguments, QueueOptions, RpcClient, RpcHandler,
    RpcOptions, RpcReply, RpcServer, StopReason, WorkOptions,
};
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

fn setup() -> (InMemoryBroker, ChannelRegistry) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let broker = InMemoryBroker::new();
    let registry = ChannelRegistry::new(Arc::new(broker.clone()));
    (broker, registry)
}

fn serve(max_messages: u32) -> WorkOptions {
    WorkOptions::new(max_messages, Duration::from_secs(10))
}

struct Pong;

#[async_trait::async_trait]
impl RpcHandler for Pong {
    fn queue_name() -> Cow<'static, str> {
        Cow::Borrowed("ping")
    }

    async fn process(&self, _payload: &[u8]) -> Result<Vec<u8>, HandlerError> {
        Ok(b"pong".to_vec())
    }
}

struct Broken;

#[async_trait::async_trait]
impl RpcHandler for Broken {
    fn queue_name() -> Cow<'static, str> {
        Cow::Borrowed("broken")
    }

    async fn process(&self, _payload: &[u8]) -> Result<Vec<u8>, HandlerError> {
        Err(HandlerError::terminal("cannot compute"))
    }
}

struct Echo;

#[async_trait::async_trait]
impl RpcHandler for Echo {
    fn queue_name() -> Cow<'static, str> {
        Cow::Borrowed("echo")
    }

    async fn process(&self, payload: &[u8]) -> Result<Vec<u8>, HandlerError> {
        Ok(payload.to_vec())
    }
}

/// Loses the connection while answering its first request.
struct Flaky {
    broker: InMemoryBroker,
    tripped: AtomicBool,
}

#[async_trait::async_trait]
impl RpcHandler for Flaky {
    fn queue_name() -> Cow<'static, str> {
        Cow::Borrowed("flaky")
    }

    async fn process(&self, payload: &[u8]) -> Result<Vec<u8>, HandlerError> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            self.broker.close_channels();
        }
        Ok(payload.to_vec())
    }
}

#[tokio::test(start_paused = true)]
async fn ping_returns_pong() {
    let (broker, registry) = setup();
    let server = RpcServer::open(&registry, Pong).await.unwrap();
    let client = RpcClient::for_handler::<Pong>(&registry).await.unwrap();

    let options = serve(1);
    let (report, reply) = tokio::join!(
        server.work(&options),
        client.call("ping", MessageProperties::default())
    );

    assert_eq!(reply.unwrap(), RpcReply::Ok(b"pong".to_vec()));
    let report = report.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.stop, StopReason::MaxMessages);
    assert_eq!(broker.message_count("rpc:ping"), Some(0));
    assert_eq!(broker.unacked_count("rpc:ping"), 0);
}

#[tokio::test(start_paused = true)]
async fn failing_responder_yields_failed_and_still_acks() {
    let (broker, registry) = setup();
    let server = RpcServer::open(&registry, Broken).await.unwrap();
    let client = RpcClient::open(&registry, "broken").await.unwrap();

    let options = serve(1);
    let (report, reply) = tokio::join!(
        server.work(&options),
        client.call("ping", MessageProperties::default())
    );

    assert_eq!(reply.unwrap(), RpcReply::Failed);
    let report = report.unwrap();
    assert_eq!(report.acknowledged, 1);
    assert_eq!(report.dropped, 1);
    assert_eq!(report.requeued, 0);
    assert_eq!(broker.message_count("rpc:broken"), Some(0));
    assert_eq!(broker.unacked_count("rpc:broken"), 0);
}

#[tokio::test(start_paused = true)]
async fn no_responder_times_out() {
    let (broker, registry) = setup();
    let client = RpcClient::open(&registry, "nobody")
        .await
        .unwrap()
        .with_options(RpcOptions::default().with_timeout(Duration::from_secs(2)));

    let started = Instant::now();
    let reply = client
        .call("ping", MessageProperties::default())
        .await
        .unwrap();

    assert_eq!(reply, RpcReply::NoResponse);
    assert!(started.elapsed() >= Duration::from_secs(2));
    // the request is still waiting for a responder
    assert_eq!(broker.message_count("rpc:nobody"), Some(1));
}

#[tokio::test(start_paused = true)]
async fn deep_backlog_only_warns() {
    let (broker, registry) = setup();
    let ch = broker.open_channel().await.unwrap();
    ch.declare_queue("rpc:busy", QueueOptions::default(), QueueArguments::default())
        .await
        .unwrap();
    for i in 0..30 {
        ch.publish(
            "",
            "rpc:busy",
            OutboundMessage::new(format!("old-{i}"), MessageProperties::default()),
        )
        .await
        .unwrap();
    }

    let client = RpcClient::open(&registry, "busy")
        .await
        .unwrap()
        .with_options(RpcOptions::default().with_timeout(Duration::from_secs(1)));
    let reply = client
        .call("ping", MessageProperties::default())
        .await
        .unwrap();

    assert_eq!(reply, RpcReply::NoResponse);
    assert_eq!(broker.message_count("rpc:busy"), Some(31));
}

#[tokio::test(start_paused = true)]
async fn concurrent_calls_get_their_own_replies() {
    let (_broker, registry) = setup();
    let server = RpcServer::open(&registry, Echo).await.unwrap();
    let client = RpcClient::for_handler::<Echo>(&registry).await.unwrap();

    let options = serve(2);
    let (report, a, b) = tokio::join!(
        server.work(&options),
        client.call("a", MessageProperties::default()),
        client.call("b", MessageProperties::default())
    );

    assert_eq!(report.unwrap().processed, 2);
    assert_eq!(a.unwrap(), RpcReply::Ok(b"a".to_vec()));
    assert_eq!(b.unwrap(), RpcReply::Ok(b"b".to_vec()));
}

#[tokio::test(start_paused = true)]
async fn replies_for_other_calls_are_ignored() {
    let (broker, registry) = setup();
    let client = RpcClient::open(&registry, "stray").await.unwrap();

    // a hand-rolled responder that answers with a foreign correlation id first
    let responder = async {
        let ch = broker.open_channel().await.unwrap();
        ch.declare_queue("rpc:stray", QueueOptions::default(), QueueArguments::default())
            .await
            .unwrap();
        let mut requests = ch
            .consume("rpc:stray", "fake", ConsumeOptions::default())
            .await
            .unwrap();
        let request = requests.next().await.unwrap().unwrap();
        let reply_to = request.properties.reply_to.clone().unwrap();
        let correlation_id = request.properties.correlation_id.clone().unwrap();

        let decoy = MessageProperties::default().with_correlation_id("someone-else");
        ch.publish("", &reply_to, OutboundMessage::new("owrong", decoy))
            .await
            .unwrap();
        let real = MessageProperties::default().with_correlation_id(correlation_id);
        ch.publish("", &reply_to, OutboundMessage::new("oright", real))
            .await
            .unwrap();
        ch.ack(request.delivery_tag).await.unwrap();
    };

    let (_, reply) = tokio::join!(
        responder,
        client.call("ping", MessageProperties::default())
    );
    assert_eq!(reply.unwrap(), RpcReply::Ok(b"right".to_vec()));
}

#[tokio::test(start_paused = true)]
async fn caller_cannot_override_reply_routing() {
    let (broker, registry) = setup();
    let client = RpcClient::open(&registry, "props")
        .await
        .unwrap()
        .with_options(RpcOptions::default().with_timeout(Duration::from_secs(1)));

    let props = MessageProperties::default()
        .with_correlation_id("mine")
        .with_reply_to("elsewhere")
        .with_content_type("application/json");
    client.call("{}", props).await.unwrap();

    let queued = broker.ready_messages("rpc:props");
    assert_eq!(queued.len(), 1);
    let sent = &queued[0].properties;
    assert_ne!(sent.correlation_id.as_deref(), Some("mine"));
    assert_ne!(sent.reply_to.as_deref(), Some("elsewhere"));
    assert!(sent.reply_to.as_deref().unwrap().starts_with("amq.gen-"));
    assert_eq!(sent.content_type.as_deref(), Some("application/json"));
    // the reply queue went away with its consumer
    assert!(!broker.has_queue(sent.reply_to.as_deref().unwrap()));
}

#[tokio::test(start_paused = true)]
async fn request_without_reply_to_is_acked() {
    let (broker, registry) = setup();
    let server = RpcServer::open(&registry, Pong).await.unwrap();
    let ch = broker.open_channel().await.unwrap();
    ch.declare_queue("rpc:ping", QueueOptions::default(), QueueArguments::default())
        .await
        .unwrap();
    ch.publish(
        "",
        "rpc:ping",
        OutboundMessage::new("ping", MessageProperties::default()),
    )
    .await
    .unwrap();

    let report = server.work(&serve(1)).await.unwrap();
    assert_eq!(report.acknowledged, 1);
    assert_eq!(broker.message_count("rpc:ping"), Some(0));
    assert_eq!(broker.unacked_count("rpc:ping"), 0);
}

#[tokio::test(start_paused = true)]
async fn idle_server_returns() {
    let (_broker, registry) = setup();
    let server = RpcServer::open(&registry, Pong).await.unwrap();

    let report = server
        .work(&WorkOptions::new(500, Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(report.stop, StopReason::IdleTimeout);
}

#[tokio::test(start_paused = true)]
async fn abandoned_call_releases_its_reply_queue() {
    let (broker, registry) = setup();
    let client = RpcClient::open(&registry, "slow").await.unwrap();

    let gave_up = tokio::time::timeout(
        Duration::from_secs(1),
        client.call("ping", MessageProperties::default()),
    )
    .await;
    assert!(gave_up.is_err());
    tokio::time::sleep(Duration::from_millis(10)).await;

    let queued = broker.ready_messages("rpc:slow");
    assert_eq!(queued.len(), 1);
    let reply_to = queued[0].properties.reply_to.clone().unwrap();
    assert!(!broker.has_queue(&reply_to));
}

#[tokio::test(start_paused = true)]
async fn server_recovers_after_a_failed_session() {
    let (broker, registry) = setup();
    let server = RpcServer::open(
        &registry,
        Flaky {
            broker: broker.clone(),
            tripped: AtomicBool::new(false),
        },
    )
    .await
    .unwrap();
    let ch = broker.open_channel().await.unwrap();
    ch.declare_queue("rpc:flaky", QueueOptions::default(), QueueArguments::default())
        .await
        .unwrap();
    ch.publish(
        "",
        "rpc:flaky",
        OutboundMessage::new("ping", MessageProperties::default()),
    )
    .await
    .unwrap();

    let err = server.work(&serve(1)).await.unwrap_err();
    assert!(matches!(err, MessagingError::Channel(_)));
    assert_eq!(broker.message_count("rpc:flaky"), Some(1));
    assert_eq!(broker.consumer_count("rpc:flaky"), 0);

    let report = server.work(&serve(1)).await.unwrap();
    assert_eq!(report.acknowledged, 1);
    assert_eq!(report.stop, StopReason::MaxMessages);
    assert_eq!(broker.message_count("rpc:flaky"), Some(0));
    assert_eq!(broker.unacked_count("rpc:flaky"), 0);
}
