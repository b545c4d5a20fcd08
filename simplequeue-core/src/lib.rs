pub mod bus;
pub mod config;
pub mod error;
pub mod handler;
pub mod identity;
pub mod memory;
pub mod names;
pub mod registry;
pub mod rpc_queue;
pub mod types;
pub mod worker_queue;

pub use bus::{Broker, Channel, DeliveryStream};
pub use config::{RetryPolicy, RpcOptions, WorkOptions};
pub use error::{Classify, FailureKind, HandlerError, MessagingError};
pub use handler::{JobHandler, RpcHandler};
pub use memory::InMemoryBroker;
pub use names::QueueNames;
pub use registry::ChannelRegistry;
pub use rpc_queue::{RpcClient, RpcReply, RpcServer};
pub use types::{
    ConsumeOptions, Delivery, DeliveryMode, ExchangeKind, ExchangeOptions, MessageProperties,
    OutboundMessage, QueueArguments, QueueInfo, QueueOptions,
};
pub use worker_queue::{StopReason, WorkReport, WorkerQueue, MAX_DELAY};
