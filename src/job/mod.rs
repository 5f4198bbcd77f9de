//! Job model: the trait producers implement, options, the wire envelope and
//! the per-delivery interaction surface.
//!
//! A job is anything with a name, a target queue and a serializable body.
//! Two optional capabilities extend it: a dedup hash (making it a once job)
//! and declared options (retry cap, delay, continuation chains). At enqueue
//! time the job is resolved into an [`Envelope`], the JSON message that
//! actually travels through the broker.
//!
//! ```text
//!   Job (+ JobOptions)  --wrap-->  Envelope  --publish-->  broker
//!                                     |                      |
//!   handler <-- Interaction <--decode-+----- delivery <------+
//! ```

pub mod envelope;
pub mod interaction;
pub mod options;

use std::sync::Arc;

use crate::error::QueueError;

pub use envelope::{Envelope, EnvelopeOptions};
pub use interaction::Interaction;
pub use options::JobOptions;

/// A unit of work to enqueue.
///
/// `hash` and `options` are optional capabilities with no-op defaults: a
/// plain job overrides the first three methods only.
pub trait Job: Send + Sync {
    /// Job type name; routes the delivery to a handler.
    fn name(&self) -> &str;

    /// Logical queue the job is pushed to.
    fn queue(&self) -> &str;

    /// Serialized payload, typically `serde_json::to_vec` output.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Json` when payload serialization fails.
    fn body(&self) -> Result<Vec<u8>, QueueError>;

    /// Dedup hash. Returning `Some` makes this a once job: within the dedup
    /// window, repeated pushes of the same name and hash publish once.
    fn hash(&self) -> Option<String> {
        None
    }

    /// Options declared by the job itself; merged under push-site options.
    fn options(&self) -> JobOptions {
        JobOptions::default()
    }
}

/// A job bundled with extra options.
///
/// Wraps an inner job without touching it: name, queue, body and dedup hash
/// pass through, while `options()` merges the extras over the inner job's
/// own (extras win on scalars, chains append).
pub struct WithOptionsJob {
    inner: Arc<dyn Job>,
    options: JobOptions,
}

impl WithOptionsJob {
    /// Bundles `job` with `options`.
    pub fn new(job: impl Job + 'static, options: JobOptions) -> Self {
        Self {
            inner: Arc::new(job),
            options,
        }
    }

    /// Bundles an already shared job with `options`.
    pub fn from_arc(job: Arc<dyn Job>, options: JobOptions) -> Self {
        Self {
            inner: job,
            options,
        }
    }
}

impl Job for WithOptionsJob {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn queue(&self) -> &str {
        self.inner.queue()
    }

    fn body(&self) -> Result<Vec<u8>, QueueError> {
        self.inner.body()
    }

    fn hash(&self) -> Option<String> {
        self.inner.hash()
    }

    fn options(&self) -> JobOptions {
        let mut options = self.inner.options();
        options.merge(self.options.clone());
        options
    }
}

/// Links jobs into a sequential chain: each job is pushed `after` the one
/// before it succeeds. Returns the head job, or `None` for an empty input.
pub fn chain(jobs: Vec<Arc<dyn Job>>) -> Option<Arc<dyn Job>> {
    let mut head: Option<Arc<dyn Job>> = None;
    for job in jobs.into_iter().rev() {
        head = Some(match head {
            None => job,
            Some(next) => {
                let mut options = JobOptions::default();
                options.after.push(next);
                Arc::new(WithOptionsJob::from_arc(job, options))
            }
        });
    }
    head
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct StepJob {
        step: &'static str,
    }

    impl Job for StepJob {
        fn name(&self) -> &str {
            self.step
        }

        fn queue(&self) -> &str {
            "pipeline"
        }

        fn body(&self) -> Result<Vec<u8>, QueueError> {
            Ok(b"{}".to_vec())
        }
    }

    struct HashedJob;

    impl Job for HashedJob {
        fn name(&self) -> &str {
            "hashed"
        }

        fn queue(&self) -> &str {
            "pipeline"
        }

        fn body(&self) -> Result<Vec<u8>, QueueError> {
            Ok(b"{}".to_vec())
        }

        fn hash(&self) -> Option<String> {
            Some("h-inner".to_string())
        }

        fn options(&self) -> JobOptions {
            JobOptions::new().with_max_attempts(4)
        }
    }

    #[test]
    fn test_with_options_job_inherits_hash() {
        let job = WithOptionsJob::new(HashedJob, JobOptions::new().with_delay_secs(1));
        assert_eq!(job.hash().as_deref(), Some("h-inner"));

        let options = job.options();
        assert_eq!(options.max_attempts(), 4);
        assert_eq!(options.delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_with_options_job_extras_override_scalars() {
        let job = WithOptionsJob::new(HashedJob, JobOptions::new().with_max_attempts(1));
        assert_eq!(job.options().max_attempts(), 1);
    }

    #[test]
    fn test_chain_nests_after_links() {
        let head = chain(vec![
            Arc::new(StepJob { step: "extract" }),
            Arc::new(StepJob { step: "transform" }),
            Arc::new(StepJob { step: "load" }),
        ])
        .unwrap();

        let envelope = Envelope::wrap(head.as_ref()).unwrap();
        assert_eq!(envelope.name, "extract");
        assert_eq!(envelope.options.after.len(), 1);

        let second = &envelope.options.after[0];
        assert_eq!(second.name, "transform");
        assert_eq!(second.options.after.len(), 1);

        let third = &second.options.after[0];
        assert_eq!(third.name, "load");
        assert!(third.options.after.is_empty());
    }

    #[test]
    fn test_chain_single_job_is_untouched() {
        let head = chain(vec![Arc::new(StepJob { step: "only" })]).unwrap();
        let envelope = Envelope::wrap(head.as_ref()).unwrap();
        assert!(envelope.options.after.is_empty());
    }

    #[test]
    fn test_chain_empty_is_none() {
        assert!(chain(Vec::new()).is_none());
    }
}
