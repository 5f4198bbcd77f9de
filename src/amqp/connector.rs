//! Per-queue AMQP connector.
//!
//! A `Connector` owns one connection and one channel to the broker, declares
//! its durable queue on connect and keeps the session alive through a
//! supervisor task that reconnects with backoff. All publishes go through the
//! default exchange with publisher confirms enabled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::amqp::manager::{QueueManager, QueueSpec};
use crate::amqp::worker::Worker;
use crate::cache::DedupCache;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::events::{EventSink, JobEvent};
use crate::handler::{Handler, Middleware};
use crate::job::{Envelope, Job, JobOptions};
use crate::metrics::MetricsCollector;

/// Cache key prefix for deduplicated pushes.
const ONCE_CACHE_PREFIX: &str = "once-job-";

/// Every worker holds at most one unacknowledged delivery.
const PREFETCH_COUNT: u16 = 1;

/// How often blocked pushers re-check the connection state.
const WAIT_CONNECTION_INTERVAL: Duration = Duration::from_millis(100);

/// Holding queues outlive their longest message by this margin, then
/// auto-expire on the broker.
const QUEUE_EXPIRES_MARGIN: Duration = Duration::from_secs(3);

/// Direct routing by queue name goes through the default exchange.
const DEFAULT_EXCHANGE: &str = "";

const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// AMQP reply-success code used on deliberate close.
const REPLY_SUCCESS: u16 = 200;

/// Live broker session. Replaced wholesale on every reconnect.
struct Session {
    connection: Connection,
    channel: Channel,
}

/// One queue's connection, publishers and workers.
///
/// The connector is lazy: nothing talks to the broker until the first push,
/// inspect or start call, which spawns the reconnect supervisor and blocks
/// until a session is established or the connector is stopped.
pub struct Connector {
    name: String,
    config: QueueConfig,
    cache: Option<Arc<dyn DedupCache>>,
    events: Arc<dyn EventSink>,
    manager: Weak<QueueManager>,
    handlers: Mutex<HashMap<String, Arc<dyn Handler>>>,
    session: TokioMutex<Option<Session>>,
    connected: AtomicBool,
    stopped: AtomicBool,
    init_started: AtomicBool,
    stop: CancellationToken,
    workers: Vec<Arc<Worker>>,
    worker_tasks: TokioMutex<Vec<JoinHandle<()>>>,
    metrics: MetricsCollector,
}

impl Connector {
    pub(crate) fn new(
        spec: &QueueSpec,
        config: QueueConfig,
        cache: Option<Arc<dyn DedupCache>>,
        events: Arc<dyn EventSink>,
        manager: Weak<QueueManager>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Connector>| {
            let workers = (0..spec.workers)
                .map(|i| {
                    Arc::new(Worker::new(
                        format!("{}-worker-{}", spec.name, i + 1),
                        Weak::clone(me),
                    ))
                })
                .collect();

            Self {
                name: spec.name.clone(),
                config,
                cache,
                events,
                manager,
                handlers: Mutex::new(HashMap::new()),
                session: TokioMutex::new(None),
                connected: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                init_started: AtomicBool::new(false),
                stop: CancellationToken::new(),
                workers,
                worker_tasks: TokioMutex::new(Vec::new()),
                metrics: MetricsCollector,
            }
        })
    }

    /// Queue name this connector serves.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a broker session is currently established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub(crate) fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub(crate) fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub(crate) fn manager(&self) -> Option<Arc<QueueManager>> {
        self.manager.upgrade()
    }

    pub(crate) fn middlewares(&self) -> Vec<Arc<dyn Middleware>> {
        self.manager
            .upgrade()
            .map(|manager| manager.middlewares())
            .unwrap_or_default()
    }

    pub(crate) fn register_handler(&self, handler: Arc<dyn Handler>) {
        let mut handlers = self.lock_handlers();
        if handlers
            .insert(handler.name().to_string(), handler)
            .is_some()
        {
            warn!(queue = %self.name, "Handler replaced an earlier registration");
        }
    }

    pub(crate) fn handler_for(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.lock_handlers().get(name).cloned()
    }

    fn lock_handlers(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn Handler>>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawns the reconnect supervisor on first use, then blocks until the
    /// connector is either connected (true) or stopped (false).
    async fn init_connection(self: &Arc<Self>) -> bool {
        if self
            .init_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let connector = Arc::clone(self);
            tokio::spawn(async move { connector.supervise().await });
        }
        self.wait_connection().await
    }

    async fn wait_connection(&self) -> bool {
        let mut poll = tokio::time::interval(WAIT_CONNECTION_INTERVAL);
        loop {
            poll.tick().await;
            // Connected wins over stopping so in-flight work can still
            // publish while workers drain.
            if self.connected.load(Ordering::SeqCst) {
                return true;
            }
            if self.is_stopped() || self.stop.is_cancelled() {
                return false;
            }
        }
    }

    /// Keeps a session alive until the connector is stopped. Runs as a
    /// detached task; there is exactly one per connector.
    async fn supervise(self: Arc<Self>) {
        loop {
            if self.stop.is_cancelled() {
                self.stopped.store(true, Ordering::SeqCst);
                return;
            }
            self.connected.store(false, Ordering::SeqCst);

            let mut close_rx = loop {
                info!(queue = %self.name, "Connecting to broker");
                match self.connect().await {
                    Ok(close_rx) => break close_rx,
                    Err(e) => {
                        if self.stop.is_cancelled() {
                            self.stopped.store(true, Ordering::SeqCst);
                            return;
                        }
                        warn!(queue = %self.name, error = %e, "Broker connection failed, retrying");
                        tokio::select! {
                            _ = self.stop.cancelled() => {
                                self.stopped.store(true, Ordering::SeqCst);
                                return;
                            }
                            _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                        }
                    }
                }
            };

            tokio::select! {
                _ = self.stop.cancelled() => {
                    self.stopped.store(true, Ordering::SeqCst);
                    return;
                }
                reason = close_rx.recv() => match reason {
                    Some(e) => {
                        warn!(queue = %self.name, error = %e, "Broker connection lost, reconnecting")
                    }
                    None => warn!(queue = %self.name, "Broker connection lost, reconnecting"),
                }
            }
        }
    }

    /// Establishes a fresh session: connection, confirm-mode channel, durable
    /// queue declaration and prefetch. Returns the channel that reports the
    /// connection's death.
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<lapin::Error>, QueueError> {
        let connection =
            Connection::connect(&self.config.amqp_url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        channel
            .queue_declare(
                &self.name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await?;

        let (close_tx, close_rx) = mpsc::unbounded_channel();
        connection.on_error(move |err| {
            let _ = close_tx.send(err);
        });

        {
            let mut slot = self.session.lock().await;
            // A stop that raced this connect has already taken and closed the
            // previous session; close the fresh one instead of stranding it
            // in the slot.
            if self.stop.is_cancelled() {
                drop(slot);
                let _ = connection.close(REPLY_SUCCESS, "shutdown").await;
                return Err(QueueError::AlreadyClosed);
            }
            *slot = Some(Session {
                connection,
                channel,
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        info!(queue = %self.name, "Connected to broker");
        Ok(close_rx)
    }

    /// Pushes a job with its declared options.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::AlreadyClosed` if the connector was stopped before
    /// the call, `QueueError::NotConnected` if it stopped while waiting for a
    /// session, and broker or serialization errors otherwise.
    pub async fn push(self: &Arc<Self>, job: &dyn Job) -> Result<(), QueueError> {
        self.push_with(job, JobOptions::new()).await
    }

    /// Pushes a job, merging `options` over the job's declared options.
    pub async fn push_with(
        self: &Arc<Self>,
        job: &dyn Job,
        options: JobOptions,
    ) -> Result<(), QueueError> {
        if self.is_stopped() || self.stop.is_cancelled() {
            return Err(QueueError::AlreadyClosed);
        }
        if !self.init_connection().await {
            return Err(QueueError::NotConnected);
        }
        let envelope = Envelope::wrap_with(job, options)?;
        self.dispatch(envelope).await
    }

    /// Pushes an already-wrapped envelope. Used by workers to re-publish
    /// chained jobs; deliberately skips the stopped check so chains can
    /// complete while the connector drains.
    pub(crate) async fn push_envelope(self: &Arc<Self>, envelope: Envelope) -> Result<(), QueueError> {
        if !self.init_connection().await {
            return Err(QueueError::NotConnected);
        }
        self.dispatch(envelope).await
    }

    async fn dispatch(&self, envelope: Envelope) -> Result<(), QueueError> {
        if !envelope.options.hash.is_empty() {
            return self.once(envelope).await;
        }
        let delay = envelope.options.delay();
        if !delay.is_zero() {
            self.delay(envelope, delay).await
        } else {
            self.publish(envelope).await
        }
    }

    /// Deduplicated push. The hash is recorded in the cache for as long as
    /// the job sits in its holding queue; an identical push inside that
    /// window is dropped silently.
    async fn once(&self, envelope: Envelope) -> Result<(), QueueError> {
        let Some(cache) = self.cache.as_ref() else {
            return Err(QueueError::CacheRequired);
        };
        let hash = envelope.options.hash.clone();
        let key = once_cache_key(&envelope.name, &hash);

        if let Some(existing) = cache.get(&key).await? {
            if !existing.is_empty() {
                debug!(queue = %self.name, job = %envelope.name, hash = %hash, "Duplicate push dropped");
                self.metrics.record_publish(&self.name, "deduplicated");
                return Ok(());
            }
        }

        let delay = resolve_once_delay(envelope.options.delay(), &self.config);
        cache.set(&key, &hash, delay).await?;
        self.delay(envelope, delay).await
    }

    /// Publishes into a dead-lettering holding queue so the broker delivers
    /// the job back onto this queue after `delay`.
    pub(crate) async fn delay(&self, envelope: Envelope, delay: Duration) -> Result<(), QueueError> {
        if delay.is_zero() {
            return self.publish(envelope).await;
        }

        let holding_queue = deferred_queue_name(&self.name, delay);
        let payload = envelope.to_bytes()?;
        {
            let guard = self.session.lock().await;
            let session = guard.as_ref().ok_or(QueueError::NotConnected)?;
            session
                .channel
                .queue_declare(
                    &holding_queue,
                    QueueDeclareOptions {
                        durable: true,
                        auto_delete: true,
                        ..Default::default()
                    },
                    deferred_queue_args(&self.name, delay),
                )
                .await?;
            session
                .channel
                .basic_publish(
                    DEFAULT_EXCHANGE,
                    &holding_queue,
                    BasicPublishOptions::default(),
                    &payload,
                    BasicProperties::default()
                        .with_content_type("application/json".into())
                        .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
                        .with_expiration(delay.as_millis().to_string().into())
                        .with_timestamp(Utc::now().timestamp() as u64),
                )
                .await?
                .await?;
        }

        debug!(
            queue = %self.name,
            job = %envelope.name,
            delay_ms = delay.as_millis() as u64,
            "Job deferred"
        );
        self.metrics.record_publish(&self.name, "delayed");
        self.events.fire(JobEvent::Delayed {
            queue: envelope.queue,
            name: envelope.name,
            delay,
        });
        Ok(())
    }

    /// Direct publish onto the queue, confirmed by the broker.
    async fn publish(&self, envelope: Envelope) -> Result<(), QueueError> {
        let payload = envelope.to_bytes()?;
        {
            let guard = self.session.lock().await;
            let session = guard.as_ref().ok_or(QueueError::NotConnected)?;
            session
                .channel
                .basic_publish(
                    DEFAULT_EXCHANGE,
                    &self.name,
                    BasicPublishOptions::default(),
                    &payload,
                    BasicProperties::default()
                        .with_content_type("application/json".into())
                        .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
                        .with_timestamp(Utc::now().timestamp() as u64),
                )
                .await?
                .await?;
        }

        debug!(queue = %self.name, job = %envelope.name, "Job pushed");
        self.metrics.record_publish(&self.name, "direct");
        self.events.fire(JobEvent::Pushed {
            queue: envelope.queue,
            name: envelope.name,
        });
        Ok(())
    }

    /// Opens a consume stream on the current session.
    pub(crate) async fn stream(&self) -> Result<Consumer, QueueError> {
        if self.is_stopped() || self.stop.is_cancelled() {
            return Err(QueueError::AlreadyClosed);
        }
        if !self.is_connected() {
            return Err(QueueError::NotConnected);
        }
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(QueueError::NotConnected)?;
        let consumer = session
            .channel
            .basic_consume(
                &self.name,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(consumer)
    }

    /// Number of ready messages sitting in the queue.
    ///
    /// Declared passively, so the count reflects the broker's view and does
    /// not include unacknowledged deliveries.
    pub(crate) async fn inspect(self: &Arc<Self>) -> Result<u32, QueueError> {
        if !self.init_connection().await {
            return Err(QueueError::NotConnected);
        }
        let count = {
            let guard = self.session.lock().await;
            let session = guard.as_ref().ok_or(QueueError::NotConnected)?;
            let queue = session
                .channel
                .queue_declare(
                    &self.name,
                    QueueDeclareOptions {
                        passive: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            queue.message_count()
        };
        self.metrics.set_queue_depth(&self.name, count);
        Ok(count)
    }

    /// Connects and spawns one consuming task per worker.
    pub(crate) async fn start(self: &Arc<Self>) {
        if !self.init_connection().await {
            warn!(queue = %self.name, "Connector stopped before it could connect");
            return;
        }
        let mut tasks = self.worker_tasks.lock().await;
        for worker in &self.workers {
            let worker = Arc::clone(worker);
            tasks.push(tokio::spawn(async move { worker.run().await }));
        }
        info!(queue = %self.name, workers = self.workers.len(), "Queue consuming started");
    }

    /// Stops the connector: signals workers, waits for in-flight jobs to
    /// drain (canceling them after the stopping timeout), then closes the
    /// broker session.
    pub(crate) async fn stop(&self) {
        self.stop.cancel();
        self.stopped.store(true, Ordering::SeqCst);

        futures::future::join_all(
            self.workers
                .iter()
                .map(|worker| worker.stop(self.config.stopping_timeout)),
        )
        .await;

        let tasks: Vec<JoinHandle<()>> = self.worker_tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(queue = %self.name, error = %e, "Worker task terminated abnormally");
            }
        }

        let session = self.session.lock().await.take();
        if let Some(session) = session {
            if let Err(e) = session.channel.close(REPLY_SUCCESS, "shutdown").await {
                error!(queue = %self.name, error = %e, "Failed to close channel");
            } else if let Err(e) = session.connection.close(REPLY_SUCCESS, "shutdown").await {
                error!(queue = %self.name, error = %e, "Failed to close connection");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        info!(queue = %self.name, "Queue stopped");
    }
}

fn once_cache_key(job_name: &str, hash: &str) -> String {
    format!("{ONCE_CACHE_PREFIX}{job_name}-{hash}")
}

/// A deduplicated push with no delay gets the default window; an explicit
/// delay is honored but floored so the cache entry cannot outlive a zero-TTL.
fn resolve_once_delay(declared: Duration, config: &QueueConfig) -> Duration {
    if declared.is_zero() {
        config.once_default_delay
    } else if declared < config.once_min_delay {
        config.once_min_delay
    } else {
        declared
    }
}

fn deferred_queue_name(queue: &str, delay: Duration) -> String {
    format!("deferred {queue} for {}ms", delay.as_millis())
}

fn deferred_queue_args(target_queue: &str, delay: Duration) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-expires".into(),
        AMQPValue::LongLongInt((delay + QUEUE_EXPIRES_MARGIN).as_millis() as i64),
    );
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(DEFAULT_EXCHANGE.into()),
    );
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(target_queue.into()),
    );
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::events::NullEventSink;

    struct ProbeJob;

    impl Job for ProbeJob {
        fn name(&self) -> &str {
            "probe"
        }

        fn queue(&self) -> &str {
            "probes"
        }

        fn body(&self) -> Result<Vec<u8>, QueueError> {
            Ok(b"{}".to_vec())
        }
    }

    fn test_connector() -> Arc<Connector> {
        Connector::new(
            &QueueSpec::new("probes", 0),
            QueueConfig::default(),
            None,
            Arc::new(NullEventSink),
            Weak::new(),
        )
    }

    #[test]
    fn test_deferred_queue_name_format() {
        let name = deferred_queue_name("emails", Duration::from_secs(90));
        assert_eq!(name, "deferred emails for 90000ms");

        let name = deferred_queue_name("emails", Duration::from_millis(1));
        assert_eq!(name, "deferred emails for 1ms");
    }

    #[test]
    fn test_deferred_queue_args() {
        let args = deferred_queue_args("emails", Duration::from_secs(10));
        let table = args.inner();

        assert_eq!(
            table.get("x-expires"),
            Some(&AMQPValue::LongLongInt(13_000))
        );
        assert_eq!(
            table.get("x-dead-letter-exchange"),
            Some(&AMQPValue::LongString("".into()))
        );
        assert_eq!(
            table.get("x-dead-letter-routing-key"),
            Some(&AMQPValue::LongString("emails".into()))
        );
    }

    #[test]
    fn test_once_cache_key_format() {
        assert_eq!(once_cache_key("send-email", "user-42"), "once-job-send-email-user-42");
    }

    #[test]
    fn test_resolve_once_delay_defaults_when_zero() {
        let config = QueueConfig::default();
        assert_eq!(
            resolve_once_delay(Duration::ZERO, &config),
            config.once_default_delay
        );
    }

    #[test]
    fn test_resolve_once_delay_floors_tiny_delays() {
        let config = QueueConfig::default()
            .with_once_min_delay(Duration::from_millis(50));
        assert_eq!(
            resolve_once_delay(Duration::from_millis(3), &config),
            Duration::from_millis(50)
        );
    }

    #[test]
    fn test_resolve_once_delay_keeps_explicit_delay() {
        let config = QueueConfig::default();
        assert_eq!(
            resolve_once_delay(Duration::from_secs(7), &config),
            Duration::from_secs(7)
        );
    }

    #[tokio::test]
    async fn test_push_after_stop_is_rejected() {
        let connector = test_connector();
        connector.stop().await;

        let err = connector.push(&ProbeJob).await.unwrap_err();
        assert!(matches!(err, QueueError::AlreadyClosed));
    }

    #[tokio::test]
    async fn test_stop_while_connecting_releases_waiters() {
        // Nothing listens on port 1, so the supervisor stays in its retry
        // loop until the stop lands.
        let connector = Connector::new(
            &QueueSpec::new("probes", 0),
            QueueConfig::new("amqp://127.0.0.1:1/%2f")
                .with_reconnect_delay(Duration::from_millis(50)),
            None,
            Arc::new(NullEventSink),
            Weak::new(),
        );

        let pusher = {
            let connector = Arc::clone(&connector);
            tokio::spawn(async move { connector.push(&ProbeJob).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        connector.stop().await;

        let err = pusher.await.unwrap().unwrap_err();
        assert!(matches!(err, QueueError::NotConnected));
        assert!(!connector.is_connected());
    }

    #[tokio::test]
    async fn test_stream_requires_connection() {
        let connector = test_connector();
        let err = connector.stream().await.unwrap_err();
        assert!(matches!(err, QueueError::NotConnected));
    }

    #[tokio::test]
    async fn test_once_requires_cache() {
        let connector = test_connector();
        let envelope = Envelope::wrap_with(
            &ProbeJob,
            JobOptions::new().with_hash("h-1"),
        )
        .unwrap();

        let err = connector.once(envelope).await.unwrap_err();
        assert!(matches!(err, QueueError::CacheRequired));
    }

    #[tokio::test]
    async fn test_once_drops_duplicate_within_window() {
        let cache = Arc::new(MemoryCache::new());
        let connector = Connector::new(
            &QueueSpec::new("probes", 0),
            QueueConfig::default(),
            Some(Arc::clone(&cache) as Arc<dyn DedupCache>),
            Arc::new(NullEventSink),
            Weak::new(),
        );
        let envelope = Envelope::wrap_with(
            &ProbeJob,
            JobOptions::new().with_hash("h-1"),
        )
        .unwrap();

        // The first push records its hash before failing on the missing
        // session.
        let err = connector.once(envelope.clone()).await.unwrap_err();
        assert!(matches!(err, QueueError::NotConnected));
        assert_eq!(
            cache.get("once-job-probe-h-1").await.unwrap(),
            Some("h-1".to_string())
        );

        // The second push lands inside the window and is dropped without
        // touching the broker.
        connector.once(envelope).await.unwrap();
    }

    #[test]
    fn test_handler_registry_lookup() {
        use crate::handler::FnHandler;

        let connector = test_connector();
        connector.register_handler(Arc::new(FnHandler::new(
            "probe",
            "probes",
            |_token, _job| async move { Ok(()) },
        )));

        assert!(connector.handler_for("probe").is_some());
        assert!(connector.handler_for("other").is_none());
    }
}
