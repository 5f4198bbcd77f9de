//! jobforge: Asynchronous job queue engine over RabbitMQ.
//!
//! This library provides durable background job processing: typed jobs are
//! published to AMQP queues and consumed by per-queue worker pools, with
//! delayed delivery, retry with attempt limits, deduplicated pushes and
//! follow-up job chains.

// Core modules
pub mod amqp;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod job;
pub mod metrics;

// Re-export the types most applications touch
pub use amqp::{QueueManager, QueueSpec};
pub use cache::{DedupCache, MemoryCache, RedisCache};
pub use config::QueueConfig;
pub use error::QueueError;
pub use events::{EventSink, JobEvent};
pub use handler::{FnHandler, FnMiddleware, Handler, Middleware};
pub use job::{chain, Interaction, Job, JobOptions, WithOptionsJob};
