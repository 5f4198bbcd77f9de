//! Queue worker loop.
//!
//! Each worker owns one consume stream and processes one delivery at a time.
//! The delivery is acked exactly once, after the handler and any chained
//! pushes have run, so a crashed process leaves the message unacked for
//! redelivery. Retries never rely on broker requeue: a retried job is a new
//! publish through the deferred path.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt};
use lapin::message::Delivery;
use lapin::options::BasicAckOptions;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::amqp::connector::Connector;
use crate::error::{is_canceled, QueueError};
use crate::events::JobEvent;
use crate::handler::{with_middlewares, Handler};
use crate::job::{Envelope, Interaction};
use crate::metrics::MetricsCollector;

/// How often a stopping worker re-checks whether its job finished.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) struct Worker {
    name: String,
    connector: Weak<Connector>,
    busy: AtomicBool,
    active: Mutex<Option<CancellationToken>>,
    metrics: MetricsCollector,
}

impl Worker {
    pub(crate) fn new(name: String, connector: Weak<Connector>) -> Self {
        Self {
            name,
            connector,
            busy: AtomicBool::new(false),
            active: Mutex::new(None),
            metrics: MetricsCollector,
        }
    }

    /// Main worker loop.
    ///
    /// Consumes deliveries until the connector stops. A broken stream is
    /// reacquired; while the broker is down the worker waits and retries.
    pub(crate) async fn run(self: Arc<Self>) {
        let Some(connector) = self.connector.upgrade() else {
            return;
        };
        info!(worker = %self.name, "Worker started");
        self.metrics.worker_started();

        'consume: loop {
            let mut stream = match connector.stream().await {
                Ok(stream) => stream,
                Err(QueueError::AlreadyClosed) => break,
                Err(e) => {
                    warn!(worker = %self.name, error = %e, "Queue not consumable, retrying");
                    tokio::select! {
                        _ = connector.stop_token().cancelled() => break,
                        _ = tokio::time::sleep(connector.config().consume_retry_delay) => {}
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    biased;
                    _ = connector.stop_token().cancelled() => break 'consume,
                    delivery = stream.next() => match delivery {
                        Some(Ok(delivery)) => {
                            let _ = self.process(&connector, delivery).await;
                        }
                        Some(Err(e)) => {
                            warn!(worker = %self.name, error = %e, "Consume stream failed, reacquiring");
                            break;
                        }
                        None => {
                            warn!(worker = %self.name, "Consume stream closed, reacquiring");
                            break;
                        }
                    }
                }
            }
        }

        self.metrics.worker_stopped();
        info!(worker = %self.name, "Worker stopped");
    }

    /// Processes one delivery and acks it, no matter how processing went.
    async fn process(&self, connector: &Arc<Connector>, delivery: Delivery) -> Result<(), QueueError> {
        self.busy.store(true, Ordering::SeqCst);
        let result = self.handle_delivery(connector, &delivery).await;

        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            error!(worker = %self.name, error = %e, "Failed to ack delivery");
        }
        self.busy.store(false, Ordering::SeqCst);
        result
    }

    async fn handle_delivery(
        &self,
        connector: &Arc<Connector>,
        delivery: &Delivery,
    ) -> Result<(), QueueError> {
        let mut envelope = match Envelope::from_bytes(&delivery.data) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(worker = %self.name, error = %e, "Undecodable message dropped");
                self.metrics.record_job(connector.name(), "dropped", 0.0);
                return Err(e);
            }
        };

        let Some(handler) = connector.handler_for(&envelope.name) else {
            error!(worker = %self.name, job = %envelope.name, "No handler registered, message dropped");
            self.metrics.record_job(connector.name(), "dropped", 0.0);
            return Err(QueueError::UnknownJob(envelope.name));
        };

        envelope.attempts += 1;

        let span = tracing::debug_span!(
            "job",
            worker = %self.name,
            job = %envelope.name,
            attempt = envelope.attempts,
        );
        self.execute(connector, handler, envelope)
            .instrument(span)
            .await
    }

    /// Runs the handler and applies the outcome policy: requeue, terminal
    /// failure or success, then the chained jobs.
    async fn execute(
        &self,
        connector: &Arc<Connector>,
        handler: Arc<dyn Handler>,
        mut envelope: Envelope,
    ) -> Result<(), QueueError> {
        let started_at = Instant::now();
        debug!("Job started");
        self.metrics.job_started();
        connector.events().fire(JobEvent::Started {
            queue: envelope.queue.clone(),
            name: envelope.name.clone(),
            attempts: envelope.attempts,
        });

        let interaction = Interaction::new(&envelope);
        let chain = with_middlewares(handler, &connector.middlewares());

        let token = CancellationToken::new();
        *self.lock_active() = Some(token.clone());
        let handler_result = {
            let call =
                AssertUnwindSafe(chain.handle(token.clone(), interaction.clone())).catch_unwind();
            tokio::select! {
                biased;
                outcome = call => match outcome {
                    Ok(result) => result,
                    Err(panic) => Err(anyhow::Error::new(QueueError::HandlerPanic(
                        panic_message(panic),
                    ))),
                },
                _ = token.cancelled() => Err(anyhow::Error::new(QueueError::Canceled)),
            }
        };
        *self.lock_active() = None;
        self.metrics.job_finished();

        let outcome = interaction.take_outcome();
        let error = match handler_result {
            Ok(()) => outcome.failure.clone().map(|message| anyhow::anyhow!(message)),
            Err(e) => Some(e),
        };
        envelope.merge_result(outcome.staged);

        let errored = error.is_some();
        let canceled = error.as_ref().is_some_and(is_canceled);
        let decision = decide_outcome(
            errored,
            canceled,
            outcome.release_delay.is_some(),
            outcome.delete,
            envelope.attempts,
            envelope.options.max_attempts,
        );

        if let Some(err) = &error {
            if decision.max_attempts_reached {
                warn!(
                    error = %err,
                    attempts = envelope.attempts,
                    max_attempts = envelope.options.max_attempts,
                    "Job failed, no attempts left"
                );
            } else if canceled {
                warn!("Job canceled, requeueing");
            } else {
                error!(error = %err, requeue = decision.requeue, "Job handler failed");
            }
            if !decision.requeue {
                connector.events().fire(JobEvent::Failed {
                    queue: envelope.queue.clone(),
                    name: envelope.name.clone(),
                    attempts: envelope.attempts,
                    error: format!("{err:#}"),
                });
            }
        }

        let completion = if decision.requeue {
            self.requeue(connector, &envelope, outcome.release_delay).await
        } else {
            self.run_chains(connector, &envelope, errored).await
        };

        let status = if decision.requeue {
            "requeued"
        } else if errored {
            "failed"
        } else {
            "success"
        };
        self.metrics
            .record_job(connector.name(), status, started_at.elapsed().as_secs_f64());
        connector.events().fire(JobEvent::Finished {
            queue: envelope.queue.clone(),
            name: envelope.name.clone(),
            attempts: envelope.attempts,
        });
        debug!(status, "Job finished");

        completion
    }

    /// Re-publishes through the delay path. An explicit release delay is
    /// honored as given, zero included; otherwise the configured default
    /// applies.
    async fn requeue(
        &self,
        connector: &Arc<Connector>,
        envelope: &Envelope,
        release_delay: Option<Duration>,
    ) -> Result<(), QueueError> {
        let delay = release_delay.unwrap_or(connector.config().release_delay);
        if let Err(e) = connector.delay(envelope.clone(), delay).await {
            error!(worker = %self.name, error = %e, "Failed to requeue job");
            return Err(e);
        }
        Ok(())
    }

    /// Pushes the follow-up jobs: `fails` after an error, `after` on success,
    /// `always` in both cases. A push failure aborts the remaining chain.
    async fn run_chains(
        &self,
        connector: &Arc<Connector>,
        envelope: &Envelope,
        errored: bool,
    ) -> Result<(), QueueError> {
        let primary = if errored {
            &envelope.options.fails
        } else {
            &envelope.options.after
        };
        for chained in primary.iter().chain(envelope.options.always.iter()) {
            self.push_chained(connector, chained.clone(), envelope).await?;
        }
        Ok(())
    }

    /// Chained jobs inherit the parent's accumulated result and are routed
    /// through the manager, since they may target a different queue.
    async fn push_chained(
        &self,
        connector: &Arc<Connector>,
        mut chained: Envelope,
        parent: &Envelope,
    ) -> Result<(), QueueError> {
        chained.result = parent.result.clone();
        let job = chained.name.clone();
        let queue = chained.queue.clone();

        let Some(manager) = connector.manager() else {
            error!(worker = %self.name, job = %job, queue = %queue, "Queue manager gone, chained job dropped");
            return Err(QueueError::UnknownQueue(queue));
        };
        if let Err(e) = manager.push_envelope(chained).await {
            error!(worker = %self.name, job = %job, queue = %queue, error = %e, "Failed to push chained job");
            return Err(e);
        }
        Ok(())
    }

    /// Waits for the current job to finish; once `stopping_timeout` expires
    /// the job's cancellation token is triggered and the wait resumes
    /// unbounded, so the requeue of the canceled job can still complete.
    pub(crate) async fn stop(&self, stopping_timeout: Duration) {
        if tokio::time::timeout(stopping_timeout, self.wait_idle())
            .await
            .is_err()
        {
            warn!(worker = %self.name, "Stopping timeout exceeded, canceling current job");
            if let Some(token) = self.lock_active().take() {
                token.cancel();
            }
            self.wait_idle().await;
        }
    }

    async fn wait_idle(&self) {
        while self.busy.load(Ordering::SeqCst) {
            debug!(worker = %self.name, "Waiting for current job to finish");
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct OutcomeDecision {
    pub requeue: bool,
    pub max_attempts_reached: bool,
}

/// Decides what happens to a processed job.
///
/// Release and plain errors requeue; `delete` suppresses the error requeue.
/// A job at its attempt limit is never requeued for an error, but a
/// cancellation requeues regardless, so a shutdown never turns into a
/// terminal failure.
pub(crate) fn decide_outcome(
    errored: bool,
    canceled: bool,
    released: bool,
    deleted: bool,
    attempts: u32,
    max_attempts: u32,
) -> OutcomeDecision {
    let mut requeue = canceled || released || (errored && !deleted);
    let mut max_attempts_reached = false;
    if errored && !canceled && max_attempts > 0 && attempts >= max_attempts {
        requeue = false;
        max_attempts_reached = true;
    }
    OutcomeDecision {
        requeue,
        max_attempts_reached,
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(requeue: bool, max_attempts_reached: bool) -> OutcomeDecision {
        OutcomeDecision {
            requeue,
            max_attempts_reached,
        }
    }

    #[test]
    fn test_success_is_not_requeued() {
        assert_eq!(
            decide_outcome(false, false, false, false, 1, 0),
            decision(false, false)
        );
    }

    #[test]
    fn test_release_requeues_successful_job() {
        assert_eq!(
            decide_outcome(false, false, true, false, 1, 3),
            decision(true, false)
        );
    }

    #[test]
    fn test_error_requeues_by_default() {
        assert_eq!(
            decide_outcome(true, false, false, false, 1, 0),
            decision(true, false)
        );
        assert_eq!(
            decide_outcome(true, false, false, false, 2, 3),
            decision(true, false)
        );
    }

    #[test]
    fn test_delete_suppresses_error_requeue() {
        assert_eq!(
            decide_outcome(true, false, false, true, 1, 0),
            decision(false, false)
        );
    }

    #[test]
    fn test_max_attempts_stops_error_requeue() {
        assert_eq!(
            decide_outcome(true, false, false, false, 3, 3),
            decision(false, true)
        );
        assert_eq!(
            decide_outcome(true, false, false, false, 4, 3),
            decision(false, true)
        );
    }

    #[test]
    fn test_max_attempts_overrides_release() {
        assert_eq!(
            decide_outcome(true, false, true, false, 3, 3),
            decision(false, true)
        );
    }

    #[test]
    fn test_cancellation_requeues_even_at_max_attempts() {
        assert_eq!(
            decide_outcome(true, true, false, false, 3, 3),
            decision(true, false)
        );
    }

    #[test]
    fn test_zero_max_attempts_means_unlimited() {
        assert_eq!(
            decide_outcome(true, false, false, false, 100, 0),
            decision(true, false)
        );
    }

    #[test]
    fn test_panic_message_formats() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("boom".to_string())), "boom");
        assert_eq!(panic_message(Box::new(42_u8)), "unknown panic");
    }
}
