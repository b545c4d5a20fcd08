// simplequeue-core/src/handler.rs
use std::borrow::Cow;

use async_trait::async_trait;

use crate::HandlerError;

/// Processes jobs taken off a worker queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Logical queue name. Defaults to the implementing type's name.
    fn queue_name() -> Cow<'static, str>
    where
        Self: Sized,
    {
        Cow::Borrowed(std::any::type_name::<Self>())
    }

    /// Handles exactly one message body.
    async fn consume(&self, payload: &[u8]) -> Result<(), HandlerError>;
}

/// Computes replies for an RPC queue.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    fn queue_name() -> Cow<'static, str>
    where
        Self: Sized,
    {
        Cow::Borrowed(std::any::type_name::<Self>())
    }

    async fn process(&self, payload: &[u8]) -> Result<Vec<u8>, HandlerError>;
}
