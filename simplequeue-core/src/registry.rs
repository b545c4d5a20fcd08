// simplequeue-core/src/registry.rs
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::bus::{Broker, Channel};
use crate::MessagingError;

/// Owns one long-lived channel per logical queue name.
///
/// Build it once at startup and clone it into every producer and consumer.
/// Clones share the same channels.
#[derive(Clone)]
pub struct ChannelRegistry {
    broker: Arc<dyn Broker>,
    channels: Arc<Mutex<HashMap<String, Arc<dyn Channel>>>>,
}

impl ChannelRegistry {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the channel for `key`, opening it on first use and again after
    /// the previous one was closed.
    pub async fn channel(&self, key: &str) -> Result<Arc<dyn Channel>, MessagingError> {
        // held across open_channel so two callers cannot open the same key twice
        let mut channels = self.channels.lock().await;
        match channels.get(key) {
            Some(ch) if ch.is_open() => return Ok(Arc::clone(ch)),
            Some(_) => {
                warn!(key, "channel closed, reopening");
                channels.remove(key);
            }
            None => {}
        }
        let ch = self.broker.open_channel().await?;
        debug!(key, "opened channel");
        channels.insert(key.to_string(), Arc::clone(&ch));
        Ok(ch)
    }

    pub async fn len(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry").finish_non_exhaustive()
    }
}
