//! Per-delivery control surface handed to handlers.
//!
//! An `Interaction` gives the handler (and every middleware around it) typed
//! access to the delivery and a way to steer the outcome: stage result data
//! for chained jobs, release the job back with a delay, mark it failed
//! terminally, or delete it regardless of the returned error.
//!
//! It is cheap to clone; all clones share the same outcome state, so flags
//! set inside the handler are visible to the worker afterwards even across
//! the fault boundary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::error::QueueError;

use super::Envelope;

/// Handler-facing view of one delivery.
#[derive(Clone)]
pub struct Interaction {
    body: Arc<str>,
    attempts: u32,
    prior: Arc<HashMap<String, String>>,
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    staged: HashMap<String, String>,
    release_delay: Option<Duration>,
    delete: bool,
    failure: Option<String>,
}

/// Outcome flags read by the worker once the handler returns.
pub(crate) struct InteractionOutcome {
    pub staged: HashMap<String, String>,
    pub release_delay: Option<Duration>,
    pub delete: bool,
    pub failure: Option<String>,
}

impl Interaction {
    /// Creates the interaction for a decoded delivery. The envelope's
    /// attempt counter must already be incremented for this execution.
    pub fn new(envelope: &Envelope) -> Self {
        Self {
            body: Arc::from(envelope.body.as_str()),
            attempts: envelope.attempts,
            prior: Arc::new(envelope.result.clone()),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Decodes the job body into a typed value.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Json` when the body does not match `T`.
    pub fn unmarshal<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// Raw string body of the delivery.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Attempt number of this execution, starting at 1.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reads a value propagated from the previous job in a chain.
    pub fn get_result(&self, key: &str) -> Option<&str> {
        self.prior.get(key).map(String::as_str)
    }

    /// Full result map propagated from the previous job in a chain.
    pub fn results(&self) -> &HashMap<String, String> {
        &self.prior
    }

    /// Stages result data to carry forward into chained jobs, replacing any
    /// previously staged map. Staged values merge over the propagated ones,
    /// winning per key.
    pub fn with_result(&self, result: HashMap<String, String>) {
        self.lock().staged = result;
    }

    /// Requeues the job after `delay_secs` seconds, regardless of the
    /// handler's return value.
    pub fn release(&self, delay_secs: u64) {
        self.lock().release_delay = Some(Duration::from_secs(delay_secs));
    }

    /// Marks the job failed terminally: no retry, the failure chain runs.
    /// Returns the error so handlers can `return Err(job.fail(err))`.
    pub fn fail(&self, err: anyhow::Error) -> anyhow::Error {
        let mut state = self.lock();
        state.delete = true;
        state.failure = Some(format!("{err:#}"));
        err
    }

    /// Drops the job after this attempt even if the handler errors.
    pub fn delete(&self) {
        self.lock().delete = true;
    }

    /// Whether `fail` was called during this execution.
    pub fn is_failed(&self) -> bool {
        self.lock().failure.is_some()
    }

    pub(crate) fn take_outcome(&self) -> InteractionOutcome {
        let mut state = self.lock();
        InteractionOutcome {
            staged: std::mem::take(&mut state.staged),
            release_delay: state.release_delay.take(),
            delete: state.delete,
            failure: state.failure.take(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
