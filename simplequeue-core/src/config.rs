// simplequeue-core/src/config.rs
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_MESSAGES: u32 = 500;
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_BACKLOG_WARN_THRESHOLD: u32 = 25;

/// Bounds for one consumer session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkOptions {
    /// The session cancels itself after this many deliveries.
    pub max_messages: u32,
    /// Return after this many milliseconds without a delivery. `0` waits
    /// forever.
    pub idle_timeout_ms: u64,
}

impl Default for WorkOptions {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            idle_timeout_ms: 0,
        }
    }
}

impl WorkOptions {
    pub fn new(max_messages: u32, idle_timeout: Duration) -> Self {
        Self {
            max_messages,
            idle_timeout_ms: millis(idle_timeout),
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcOptions {
    /// Milliseconds `call` waits for a reply, measured from the start of the
    /// call.
    pub timeout_ms: u64,
    /// Request backlog above which `call` logs a warning.
    pub backlog_warn_threshold: u32,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            backlog_warn_threshold: DEFAULT_BACKLOG_WARN_THRESHOLD,
        }
    }
}

impl RpcOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = millis(timeout);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// What the worker loop does with a retryable failure.
///
/// The default requeues through the broker with no limit. Setting
/// `max_attempts` or a `backoff` switches to republishing a copy that carries
/// an attempt counter header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            backoff_ms: 0,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff_ms = millis(backoff);
        self
    }

    pub fn backoff(&self) -> Option<Duration> {
        (self.backoff_ms > 0).then(|| Duration::from_millis(self.backoff_ms))
    }

    /// True when retries go through the broker's own requeue.
    pub fn uses_requeue(&self) -> bool {
        self.max_attempts.is_none() && self.backoff_ms == 0
    }
}

// Sub-millisecond remainders round up so a short timeout never becomes `0`.
fn millis(d: Duration) -> u64 {
    let ms = d.as_millis() + u128::from(d.subsec_nanos() % 1_000_000 != 0);
    u64::try_from(ms).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_legacy_behaviour() {
        let work = WorkOptions::default();
        assert_eq!(work.max_messages, 500);
        assert_eq!(work.idle_timeout(), None);

        let rpc = RpcOptions::default();
        assert_eq!(rpc.timeout(), Duration::from_secs(5));
        assert_eq!(rpc.backlog_warn_threshold, 25);

        assert!(RetryPolicy::default().uses_requeue());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let work: WorkOptions = serde_json::from_str(r#"{"idle_timeout_ms": 3000}"#).unwrap();
        assert_eq!(work.max_messages, 500);
        assert_eq!(work.idle_timeout(), Some(Duration::from_secs(3)));

        let retry: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 4}"#).unwrap();
        assert_eq!(retry, RetryPolicy::bounded(4));
        assert!(!retry.uses_requeue());
    }

    #[test]
    fn sub_second_timeouts_are_kept() {
        let work = WorkOptions::new(10, Duration::from_millis(500));
        assert_eq!(work.idle_timeout(), Some(Duration::from_millis(500)));

        let work = WorkOptions::new(10, Duration::from_micros(10));
        assert_eq!(work.idle_timeout(), Some(Duration::from_millis(1)));
        assert_eq!(WorkOptions::new(10, Duration::ZERO).idle_timeout(), None);

        let rpc = RpcOptions::default().with_timeout(Duration::from_millis(250));
        assert_eq!(rpc.timeout(), Duration::from_millis(250));
    }
}
