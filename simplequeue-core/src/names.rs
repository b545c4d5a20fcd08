// simplequeue-core/src/names.rs
use std::borrow::Cow;

/// Broker object names derived from a queue's logical name.
///
/// These are part of the wire contract with existing deployments and must not
/// change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    logical: String,
}

impl QueueNames {
    pub fn new(logical: impl Into<String>) -> Self {
        Self {
            logical: logical.into(),
        }
    }

    pub fn from_cow(logical: Cow<'static, str>) -> Self {
        Self::new(logical.into_owned())
    }

    pub fn logical(&self) -> &str {
        &self.logical
    }

    pub fn exchange(&self) -> String {
        format!("exchange:{}", self.logical)
    }

    pub fn queue(&self) -> String {
        format!("queue:{}", self.logical)
    }

    pub fn pending_exchange(&self) -> String {
        format!("{}:pending", self.exchange())
    }

    pub fn pending_queue(&self) -> String {
        format!("{}:pending", self.queue())
    }

    pub fn rpc_queue(&self) -> String {
        format!("rpc:{}", self.logical)
    }

    /// Registry key for the channel that owns the pending pair.
    pub(crate) fn pending_channel_key(&self) -> String {
        format!("{}:pending", self.logical)
    }
}
