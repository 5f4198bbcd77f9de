//! Queue manager: the single entry point applications talk to.
//!
//! The manager owns one `Connector` per registered queue and routes pushes,
//! handler registrations and chained re-publishes to the right one by queue
//! name. Middlewares are global and wrap every handler on every queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info, warn};

use crate::amqp::connector::Connector;
use crate::cache::DedupCache;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::events::{EventSink, NullEventSink};
use crate::handler::{Handler, Middleware};
use crate::job::{Envelope, Job, JobOptions};

/// Declaration of a queue and its consumer count.
///
/// A queue with zero workers is valid: it can be pushed to, while another
/// process does the consuming.
#[derive(Debug, Clone)]
pub struct QueueSpec {
    pub name: String,
    pub workers: usize,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        Self {
            name: name.into(),
            workers,
        }
    }
}

/// Registry of queues, handlers and middlewares.
pub struct QueueManager {
    config: QueueConfig,
    cache: Option<Arc<dyn DedupCache>>,
    events: Arc<dyn EventSink>,
    connectors: Mutex<HashMap<String, Arc<Connector>>>,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl QueueManager {
    /// Creates a manager with no dedup cache and no event sink. Deduplicated
    /// pushes will fail until a cache is provided.
    pub fn new(config: QueueConfig) -> Arc<Self> {
        Self::with_collaborators(config, None, Arc::new(NullEventSink))
    }

    /// Creates a manager with an explicit dedup cache and event sink.
    pub fn with_collaborators(
        config: QueueConfig,
        cache: Option<Arc<dyn DedupCache>>,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            cache,
            events,
            connectors: Mutex::new(HashMap::new()),
            middlewares: RwLock::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Registers a queue. The first registration of a name wins; repeated
    /// names are ignored with a warning.
    pub fn register_queue(self: &Arc<Self>, spec: QueueSpec) {
        let mut connectors = self.lock_connectors();
        if connectors.contains_key(&spec.name) {
            warn!(queue = %spec.name, "Queue already registered, ignoring");
            return;
        }
        let connector = Connector::new(
            &spec,
            self.config.clone(),
            self.cache.clone(),
            Arc::clone(&self.events),
            Arc::downgrade(self),
        );
        debug!(queue = %spec.name, workers = spec.workers, "Queue registered");
        connectors.insert(spec.name, connector);
    }

    pub fn register_queues(self: &Arc<Self>, specs: impl IntoIterator<Item = QueueSpec>) {
        for spec in specs {
            self.register_queue(spec);
        }
    }

    /// Binds a handler to its queue's connector. A handler naming an
    /// unregistered queue is dropped with a warning.
    pub fn register_handler(&self, handler: Arc<dyn Handler>) {
        let connectors = self.lock_connectors();
        match connectors.get(handler.queue()) {
            Some(connector) => {
                debug!(queue = %handler.queue(), job = %handler.name(), "Handler registered");
                connector.register_handler(handler);
            }
            None => {
                warn!(
                    queue = %handler.queue(),
                    job = %handler.name(),
                    "Handler targets an unregistered queue, ignoring"
                );
            }
        }
    }

    pub fn register_handlers(&self, handlers: impl IntoIterator<Item = Arc<dyn Handler>>) {
        for handler in handlers {
            self.register_handler(handler);
        }
    }

    /// Appends a middleware. Registration order is invocation order: the
    /// first registered middleware is the outermost wrapper.
    pub fn register_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middlewares
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(middleware);
    }

    pub(crate) fn middlewares(&self) -> Vec<Arc<dyn Middleware>> {
        self.middlewares
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Pushes a job to its queue with its declared options.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::UnknownQueue` if the job's queue was never
    /// registered, plus any connector-level push error.
    pub async fn push(&self, job: &dyn Job) -> Result<(), QueueError> {
        self.push_with(job, JobOptions::new()).await
    }

    /// Pushes a job with extra options merged over its declared ones.
    pub async fn push_with(&self, job: &dyn Job, options: JobOptions) -> Result<(), QueueError> {
        let connector = self.connector_for(job.queue())?;
        connector.push_with(job, options).await
    }

    /// Re-publishes an already-wrapped envelope on behalf of a worker.
    pub(crate) async fn push_envelope(&self, envelope: Envelope) -> Result<(), QueueError> {
        let connector = self.connector_for(&envelope.queue)?;
        connector.push_envelope(envelope).await
    }

    /// Number of ready messages in `queue`, straight from the broker.
    pub async fn messages_count(&self, queue: &str) -> Result<u32, QueueError> {
        let connector = self.connector_for(queue)?;
        connector.inspect().await
    }

    /// Whether every registered queue currently holds a broker session.
    /// A manager with no queues is healthy.
    pub fn healthy(&self) -> bool {
        self.lock_connectors()
            .values()
            .all(|connector| connector.is_connected())
    }

    /// Registered queue names, sorted.
    pub fn queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_connectors().keys().cloned().collect();
        names.sort();
        names
    }

    /// Starts consuming on every registered queue. Connectors connect and
    /// spawn their workers concurrently; readiness is visible through
    /// [`healthy`](Self::healthy).
    pub fn start(self: &Arc<Self>) {
        let connectors: Vec<Arc<Connector>> =
            self.lock_connectors().values().cloned().collect();
        info!(queues = connectors.len(), "Queue manager starting");
        for connector in connectors {
            tokio::spawn(async move { connector.start().await });
        }
    }

    /// Stops all queues and blocks until their workers have drained and the
    /// broker sessions are closed.
    pub async fn stop(&self) {
        let connectors: Vec<Arc<Connector>> =
            self.lock_connectors().values().cloned().collect();
        info!(queues = connectors.len(), "Queue manager stopping");
        futures::future::join_all(connectors.iter().map(|connector| connector.stop())).await;
        info!("Queue manager stopped");
    }

    fn connector_for(&self, queue: &str) -> Result<Arc<Connector>, QueueError> {
        self.lock_connectors()
            .get(queue)
            .cloned()
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))
    }

    fn lock_connectors(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Connector>>> {
        self.connectors.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{FnHandler, FnMiddleware};

    struct ReportJob;

    impl Job for ReportJob {
        fn name(&self) -> &str {
            "build-report"
        }

        fn queue(&self) -> &str {
            "reports"
        }

        fn body(&self) -> Result<Vec<u8>, QueueError> {
            Ok(b"{}".to_vec())
        }
    }

    #[tokio::test]
    async fn test_push_to_unknown_queue_fails() {
        let manager = QueueManager::new(QueueConfig::default());
        let err = manager.push(&ReportJob).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownQueue(queue) if queue == "reports"));
    }

    #[tokio::test]
    async fn test_push_after_stop_is_rejected() {
        let manager = QueueManager::new(QueueConfig::default());
        manager.register_queue(QueueSpec::new("reports", 0));
        manager.stop().await;

        let err = manager.push(&ReportJob).await.unwrap_err();
        assert!(matches!(err, QueueError::AlreadyClosed));
    }

    #[test]
    fn test_first_queue_registration_wins() {
        let manager = QueueManager::new(QueueConfig::default());
        manager.register_queue(QueueSpec::new("reports", 2));
        manager.register_queue(QueueSpec::new("reports", 8));

        assert_eq!(manager.queues(), vec!["reports".to_string()]);
    }

    #[test]
    fn test_queues_are_sorted() {
        let manager = QueueManager::new(QueueConfig::default());
        manager.register_queues([
            QueueSpec::new("mail", 1),
            QueueSpec::new("billing", 1),
            QueueSpec::new("reports", 1),
        ]);

        assert_eq!(manager.queues(), vec!["billing", "mail", "reports"]);
    }

    #[test]
    fn test_handler_routing_to_connector() {
        let manager = QueueManager::new(QueueConfig::default());
        manager.register_queue(QueueSpec::new("reports", 0));
        manager.register_handler(Arc::new(FnHandler::new(
            "build-report",
            "reports",
            |_token, _job| async move { Ok(()) },
        )));
        // Targets a queue nobody registered; dropped with a warning.
        manager.register_handler(Arc::new(FnHandler::new(
            "send-email",
            "mail",
            |_token, _job| async move { Ok(()) },
        )));

        let connector = manager.connector_for("reports").unwrap();
        assert!(connector.handler_for("build-report").is_some());
        assert!(connector.handler_for("send-email").is_none());
    }

    #[test]
    fn test_unconnected_queue_reports_unhealthy() {
        let manager = QueueManager::new(QueueConfig::default());
        assert!(manager.healthy());

        manager.register_queue(QueueSpec::new("reports", 1));
        assert!(!manager.healthy());
    }

    #[test]
    fn test_middleware_registration_order() {
        let manager = QueueManager::new(QueueConfig::default());
        manager.register_middleware(Arc::new(FnMiddleware::new(|token, job, next| async move {
            next.handle(token, job).await
        })));
        manager.register_middleware(Arc::new(FnMiddleware::new(|token, job, next| async move {
            next.handle(token, job).await
        })));

        assert_eq!(manager.middlewares().len(), 2);
    }
}
