//! AMQP transport: queue manager, per-queue connectors and worker loops.
//!
//! This module provides the broker-facing half of the engine:
//!
//! - **QueueManager**: registry of queues, handlers and middlewares; routes pushes
//! - **Connector**: one AMQP connection + channel per queue, with reconnect supervision
//! - **Worker**: competing consumers that execute handlers and apply the retry policy
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │ QueueManager │
//!                      │ (push/route) │
//!                      └──────┬───────┘
//!                             │
//!              ┌──────────────┼──────────────┐
//!              ▼              ▼              ▼
//!        ┌───────────┐  ┌───────────┐  ┌───────────┐
//!        │ Connector │  │ Connector │  │ Connector │   one per queue
//!        └─────┬─────┘  └─────┬─────┘  └─────┬─────┘
//!              │              │              │
//!              ▼              ▼              ▼
//!         ┌─────────┐    ┌─────────┐    ┌─────────┐
//!         │RabbitMQ │    │RabbitMQ │    │RabbitMQ │   durable queues
//!         └────┬────┘    └────┬────┘    └────┬────┘
//!              │              │              │
//!         ┌────▼────┐    ┌────▼────┐    ┌────▼────┐
//!         │ Workers │    │ Workers │    │ Workers │   prefetch-1 consumers
//!         └─────────┘    └─────────┘    └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use jobforge::amqp::{QueueManager, QueueSpec};
//! use jobforge::config::QueueConfig;
//! use jobforge::handler::FnHandler;
//! use std::sync::Arc;
//!
//! let manager = QueueManager::new(QueueConfig::default());
//! manager.register_queue(QueueSpec::new("emails", 4));
//! manager.register_handler(Arc::new(FnHandler::new(
//!     "send-welcome",
//!     "emails",
//!     |_token, job| async move {
//!         let payload: WelcomeEmail = job.unmarshal()?;
//!         send(payload).await
//!     },
//! )));
//!
//! manager.start();
//! manager.push(&WelcomeJob { user_id: 42 }).await?;
//!
//! // Graceful shutdown: drains in-flight jobs first
//! manager.stop().await;
//! ```
//!
//! # Reliability Features
//!
//! - **Publisher confirms**: every publish waits for broker acknowledgement
//! - **Reconnect supervision**: lost connections are re-established with backoff
//! - **Delayed redelivery**: retries go through dead-letter holding queues, not broker requeue
//! - **Graceful shutdown**: workers finish current jobs before stopping

pub mod connector;
pub mod manager;
pub(crate) mod worker;

// Re-export main types for convenience
pub use connector::Connector;
pub use manager::{QueueManager, QueueSpec};
