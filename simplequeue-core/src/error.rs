// simplequeue-core/src/error.rs
use std::error::Error as StdError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// What the consume loop should do with a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Reject with requeue so the broker redelivers it.
    Retryable,
    /// Log and acknowledge; the message is dropped.
    Terminal,
}

/// Error returned by job and RPC handlers.
///
/// The retry intent travels with the error value, so two handlers can fail on
/// the same underlying cause and still ask for different treatment.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    kind: FailureKind,
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl HandlerError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Retryable, message)
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Terminal, message)
    }

    pub fn with_source(mut self, source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Retryable
    }
}

// Unclassified errors are terminal.
impl From<MessagingError> for HandlerError {
    fn from(err: MessagingError) -> Self {
        HandlerError::terminal(err.to_string()).with_source(err)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::terminal(err.to_string()).with_source(err)
    }
}

/// Tags a fallible result with a [`FailureKind`] at the call site.
///
/// ```ignore
/// let row = db.fetch(id).await.retryable()?;
/// let job: Job = serde_json::from_slice(payload).terminal()?;
/// ```
pub trait Classify<T> {
    fn classify(self, kind: FailureKind) -> Result<T, HandlerError>;

    fn retryable(self) -> Result<T, HandlerError>
    where
        Self: Sized,
    {
        self.classify(FailureKind::Retryable)
    }

    fn terminal(self) -> Result<T, HandlerError>
    where
        Self: Sized,
    {
        self.classify(FailureKind::Terminal)
    }
}

impl<T, E> Classify<T> for Result<T, E>
where
    E: StdError + Send + Sync + 'static,
{
    fn classify(self, kind: FailureKind) -> Result<T, HandlerError> {
        self.map_err(|e| HandlerError::new(kind, e.to_string()).with_source(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unclassified_errors_are_terminal() {
        let err: HandlerError = MessagingError::Handler("boom".into()).into();
        assert_eq!(err.kind(), FailureKind::Terminal);
        assert!(!err.is_retryable());
    }

    #[test]
    fn classify_keeps_source_and_message() {
        let res: Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "peer went away",
        ));
        let err = res.retryable().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "peer went away");
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn same_cause_different_intent() {
        let a: Result<u8, std::num::ParseIntError> = "x".parse::<u8>();
        let b: Result<u8, std::num::ParseIntError> = "x".parse::<u8>();
        assert_eq!(a.retryable().unwrap_err().kind(), FailureKind::Retryable);
        assert_eq!(b.terminal().unwrap_err().kind(), FailureKind::Terminal);
    }
}
