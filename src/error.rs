//! Error types for queue-engine operations.
//!
//! `QueueError` is the crate-wide taxonomy: domain errors raised by the
//! manager, connectors and workers, plus broker/cache/serialization
//! failures converted via `#[from]`. Handler business errors stay
//! `anyhow::Error` and are treated opaquely by the worker.

use thiserror::Error;

use crate::cache::CacheError;

/// Errors that can occur while pushing, consuming or managing jobs.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Not connected to the queue broker")]
    NotConnected,

    #[error("Queue connection already closed")]
    AlreadyClosed,

    #[error("Unknown job: '{0}'")]
    UnknownJob(String),

    #[error("Unknown queue: '{0}'")]
    UnknownQueue(String),

    #[error("Job execution canceled")]
    Canceled,

    #[error("Panic recovered in job handler: {0}")]
    HandlerPanic(String),

    #[error("Once jobs require a dedup cache, none is configured")]
    CacheRequired,

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Job body is not valid UTF-8: {0}")]
    InvalidBody(#[from] std::string::FromUtf8Error),
}

/// Whether an opaque handler error carries a cancellation anywhere in its
/// chain. The worker uses this to tell canceled executions apart from
/// ordinary failures; middlewares that wrap errors keep it detectable.
pub fn is_canceled(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<QueueError>(), Some(QueueError::Canceled)))
}
