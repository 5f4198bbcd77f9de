//! Wire envelope carried through the broker.
//!
//! Every published message is a JSON `Envelope`. The envelope owns the
//! attempt counter (retries are new publishes, so broker redelivery counts
//! are useless), the resolved options including pre-wrapped continuation
//! chains, and the result map propagated from job to chained job.
//!
//! Field names are stable; messages written by one version of the engine
//! must decode in the next.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

use super::{Job, JobOptions};

/// A job as it travels through the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Target queue name.
    pub queue: String,
    /// Job name, the handler routing key.
    pub name: String,
    /// String-encoded job payload.
    #[serde(default)]
    pub body: String,
    /// Number of handler executions so far.
    #[serde(default)]
    pub attempts: u32,
    /// Resolved options, chains pre-wrapped at enqueue time.
    #[serde(default)]
    pub options: EnvelopeOptions,
    /// Result data propagated from the previous job in a chain.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub result: HashMap<String, String>,
}

/// Resolved job options on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EnvelopeOptions {
    /// Dedup hash; empty means no dedup.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    /// Retry cap; zero means unlimited.
    #[serde(default)]
    pub max_attempts: u32,
    /// Delivery delay in milliseconds.
    #[serde(rename = "delay_time", default, skip_serializing_if = "is_zero")]
    pub delay_ms: u64,
    /// Jobs pushed after a successful execution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<Envelope>,
    /// Jobs pushed after a terminal failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fails: Vec<Envelope>,
    /// Jobs pushed after any terminal outcome.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub always: Vec<Envelope>,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl EnvelopeOptions {
    /// Delivery delay as a duration; zero means immediate.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Envelope {
    /// Wraps a job using only its own declared options.
    ///
    /// # Errors
    ///
    /// Fails when the job body cannot be produced or is not valid UTF-8, or
    /// when a chained job fails to wrap.
    pub fn wrap(job: &dyn Job) -> Result<Self, QueueError> {
        Self::wrap_with(job, JobOptions::default())
    }

    /// Wraps a job, merging `extra` options over the job's own.
    ///
    /// Merge order, later winning: the job's `hash()` capability, the job's
    /// `options()`, then `extra`. Chain members are wrapped recursively here
    /// (each resolving its own hash and options) and never re-resolved at
    /// delivery time.
    pub fn wrap_with(job: &dyn Job, extra: JobOptions) -> Result<Self, QueueError> {
        let mut options = JobOptions::default();
        if let Some(hash) = job.hash() {
            options = options.with_hash(hash);
        }
        options.merge(job.options());
        options.merge(extra);

        let body = String::from_utf8(job.body()?)?;

        Ok(Self {
            queue: job.queue().to_string(),
            name: job.name().to_string(),
            body,
            attempts: 0,
            options: resolve(options)?,
            result: HashMap::new(),
        })
    }

    /// Serializes the envelope for publishing.
    pub fn to_bytes(&self) -> Result<Vec<u8>, QueueError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a delivery payload.
    pub fn from_bytes(payload: &[u8]) -> Result<Self, QueueError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Copies staged handler results over the envelope's result map. Staged
    /// values win per key; untouched keys survive.
    pub fn merge_result(&mut self, staged: HashMap<String, String>) {
        self.result.extend(staged);
    }
}

fn resolve(options: JobOptions) -> Result<EnvelopeOptions, QueueError> {
    Ok(EnvelopeOptions {
        hash: options.hash.unwrap_or_default(),
        max_attempts: options.max_attempts.unwrap_or(0),
        delay_ms: options
            .delay
            .map(|delay| delay.as_millis() as u64)
            .unwrap_or(0),
        after: wrap_all(&options.after)?,
        fails: wrap_all(&options.fails)?,
        always: wrap_all(&options.always)?,
    })
}

fn wrap_all(jobs: &[Arc<dyn Job>]) -> Result<Vec<Envelope>, QueueError> {
    jobs.iter().map(|job| Envelope::wrap(job.as_ref())).collect()
}
