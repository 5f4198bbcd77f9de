//! Job options: dedup hash, retry cap, delay and continuation chains.
//!
//! Options come from three places and merge in order, later sources winning
//! on scalar conflicts while chains append:
//!
//! 1. the job's own `hash()` capability,
//! 2. the job's declared `options()`,
//! 3. options supplied at the push site (`push_with`).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::Job;

/// Options attached to a job at enqueue time.
///
/// All fields are optional; an empty `JobOptions` leaves the job exactly as
/// declared. Chain builders append and may be called repeatedly.
#[derive(Clone, Default)]
pub struct JobOptions {
    pub(crate) hash: Option<String>,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) delay: Option<Duration>,
    pub(crate) after: Vec<Arc<dyn Job>>,
    pub(crate) fails: Vec<Arc<dyn Job>>,
    pub(crate) always: Vec<Arc<dyn Job>>,
}

impl JobOptions {
    /// Creates empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the dedup hash, making this a once job.
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    /// Sets the retry cap. Zero means unlimited attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Sets the initial delivery delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sets the initial delivery delay in whole seconds.
    pub fn with_delay_secs(mut self, secs: u64) -> Self {
        self.delay = Some(Duration::from_secs(secs));
        self
    }

    /// Appends a job to push after this one succeeds.
    pub fn with_after(mut self, job: impl Job + 'static) -> Self {
        self.after.push(Arc::new(job));
        self
    }

    /// Appends a job to push after this one fails terminally.
    pub fn with_fails(mut self, job: impl Job + 'static) -> Self {
        self.fails.push(Arc::new(job));
        self
    }

    /// Appends a job to push after this one finishes, either way.
    pub fn with_always(mut self, job: impl Job + 'static) -> Self {
        self.always.push(Arc::new(job));
        self
    }

    /// Dedup hash, if set.
    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    /// Resolved retry cap; zero means unlimited.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(0)
    }

    /// Resolved delivery delay; zero means immediate.
    pub fn delay(&self) -> Duration {
        self.delay.unwrap_or(Duration::ZERO)
    }

    /// Folds `other` into `self`. Set scalars in `other` win; chains append
    /// in order.
    pub(crate) fn merge(&mut self, other: JobOptions) {
        if other.hash.is_some() {
            self.hash = other.hash;
        }
        if other.max_attempts.is_some() {
            self.max_attempts = other.max_attempts;
        }
        if other.delay.is_some() {
            self.delay = other.delay;
        }
        self.after.extend(other.after);
        self.fails.extend(other.fails);
        self.always.extend(other.always);
    }
}

impl fmt::Debug for JobOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOptions")
            .field("hash", &self.hash)
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .field("after", &self.after.len())
            .field("fails", &self.fails.len())
            .field("always", &self.always.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;

    struct NoopJob;

    impl Job for NoopJob {
        fn name(&self) -> &str {
            "noop"
        }

        fn queue(&self) -> &str {
            "default"
        }

        fn body(&self) -> Result<Vec<u8>, QueueError> {
            Ok(b"{}".to_vec())
        }
    }

    #[test]
    fn test_defaults_resolve_to_zero_values() {
        let options = JobOptions::new();
        assert_eq!(options.hash(), None);
        assert_eq!(options.max_attempts(), 0);
        assert_eq!(options.delay(), Duration::ZERO);
    }

    #[test]
    fn test_builders_set_fields() {
        let options = JobOptions::new()
            .with_hash("abc")
            .with_max_attempts(3)
            .with_delay_secs(5)
            .with_after(NoopJob)
            .with_always(NoopJob);

        assert_eq!(options.hash(), Some("abc"));
        assert_eq!(options.max_attempts(), 3);
        assert_eq!(options.delay(), Duration::from_secs(5));
        assert_eq!(options.after.len(), 1);
        assert_eq!(options.fails.len(), 0);
        assert_eq!(options.always.len(), 1);
    }

    #[test]
    fn test_merge_later_scalars_win() {
        let mut base = JobOptions::new().with_hash("base").with_max_attempts(3);
        base.merge(JobOptions::new().with_hash("override").with_delay_secs(1));

        assert_eq!(base.hash(), Some("override"));
        assert_eq!(base.max_attempts(), 3);
        assert_eq!(base.delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_merge_keeps_unset_scalars() {
        let mut base = JobOptions::new().with_max_attempts(5);
        base.merge(JobOptions::new());
        assert_eq!(base.max_attempts(), 5);
    }

    #[test]
    fn test_merge_explicit_zero_attempts_wins() {
        let mut base = JobOptions::new().with_max_attempts(5);
        base.merge(JobOptions::new().with_max_attempts(0));
        assert_eq!(base.max_attempts(), 0);
    }

    #[test]
    fn test_merge_appends_chains() {
        let mut base = JobOptions::new().with_after(NoopJob);
        base.merge(JobOptions::new().with_after(NoopJob).with_fails(NoopJob));

        assert_eq!(base.after.len(), 2);
        assert_eq!(base.fails.len(), 1);
    }
}
