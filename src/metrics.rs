//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by the queue engine and
//! provides functions for initializing, registering, and exporting them.
//! Recording goes through [`MetricsCollector`], whose methods are no-ops
//! until `init_metrics()` has run, so the engine never requires metrics to
//! be set up.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all queue-engine metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total jobs processed, labeled by queue and outcome status.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Handler execution duration in seconds, labeled by queue.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Total publishes, labeled by queue and publish mode.
pub static PUBLISHES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Broker-reported queue depth, labeled by queue.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of jobs currently being processed.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of running worker tasks.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at application startup; repeated calls leave the first
/// registration in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due
/// to duplicate metric names.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let jobs_total = CounterVec::new(
        Opts::new("jobforge_jobs_total", "Total jobs processed"),
        &["queue", "status"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "jobforge_job_duration_seconds",
            "Handler execution duration in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["queue"],
    )?;

    let publishes_total = CounterVec::new(
        Opts::new("jobforge_publishes_total", "Total publishes"),
        &["queue", "mode"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("jobforge_queue_depth", "Broker-reported queue depth"),
        &["queue"],
    )?;

    let jobs_in_progress = Gauge::new(
        "jobforge_jobs_in_progress",
        "Number of jobs currently being processed",
    )?;

    let active_workers = Gauge::new("jobforge_active_workers", "Number of running worker tasks")?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(publishes_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // Store metrics in static variables
    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = PUBLISHES_TOTAL.set(publishes_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// # Returns
///
/// A string containing all metrics in Prometheus text format, or an
/// informative comment line when the registry is not initialized.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Recording facade used by workers and connectors.
///
/// Every method silently no-ops while `init_metrics()` has not been called.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a processed job.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue the job was consumed from
    /// * `status` - Outcome: "success", "failed", "requeued" or "dropped"
    /// * `duration_secs` - Handler execution duration in seconds
    pub fn record_job(&self, queue: &str, status: &str, duration_secs: f64) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[queue, status]).inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[queue])
                .observe(duration_secs);
        }

        tracing::trace!(
            queue = queue,
            status = status,
            duration_secs = duration_secs,
            "Recorded job metric"
        );
    }

    /// Record a publish.
    ///
    /// # Arguments
    ///
    /// * `queue` - Target queue
    /// * `mode` - "direct", "delayed" or "deduplicated"
    pub fn record_publish(&self, queue: &str, mode: &str) {
        if let Some(publishes_total) = PUBLISHES_TOTAL.get() {
            publishes_total.with_label_values(&[queue, mode]).inc();
        }
    }

    /// Update the broker-reported depth for a queue.
    pub fn set_queue_depth(&self, queue: &str, depth: u32) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue])
                .set(f64::from(depth));
        }
    }

    /// Record a worker task starting.
    pub fn worker_started(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.inc();
        }
    }

    /// Record a worker task returning.
    pub fn worker_stopped(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.dec();
        }
    }

    /// Record a job execution starting.
    pub fn job_started(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    /// Record a job execution finishing.
    pub fn job_finished(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}
