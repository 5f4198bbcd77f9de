//! Job lifecycle events.
//!
//! The engine reports what happens to jobs through an [`EventSink`]; the
//! dispatch bus behind the sink belongs to the embedding application. Events
//! are plain data so sinks can forward, buffer or drop them freely.
//!
//! Firing points:
//!
//! - `Pushed`: a direct publish succeeded
//! - `Delayed`: a deferred publish succeeded (initial delay or requeue)
//! - `Started`: a worker is about to run the handler
//! - `Finished`: a worker finished processing a delivery, any outcome
//! - `Failed`: the engine gave up on a job (terminal failure)

use std::sync::Mutex;
use std::time::Duration;

/// A job lifecycle notification.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Pushed {
        queue: String,
        name: String,
    },
    Delayed {
        queue: String,
        name: String,
        delay: Duration,
    },
    Started {
        queue: String,
        name: String,
        attempts: u32,
    },
    Finished {
        queue: String,
        name: String,
        attempts: u32,
    },
    Failed {
        queue: String,
        name: String,
        attempts: u32,
        error: String,
    },
}

impl JobEvent {
    /// Queue the event belongs to.
    pub fn queue(&self) -> &str {
        match self {
            Self::Pushed { queue, .. }
            | Self::Delayed { queue, .. }
            | Self::Started { queue, .. }
            | Self::Finished { queue, .. }
            | Self::Failed { queue, .. } => queue,
        }
    }

    /// Job name the event belongs to.
    pub fn name(&self) -> &str {
        match self {
            Self::Pushed { name, .. }
            | Self::Delayed { name, .. }
            | Self::Started { name, .. }
            | Self::Finished { name, .. }
            | Self::Failed { name, .. } => name,
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pushed { .. } => "pushed",
            Self::Delayed { .. } => "delayed",
            Self::Started { .. } => "started",
            Self::Finished { .. } => "finished",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Receiver for job lifecycle events.
///
/// `fire` must not block; the engine calls it inline on push and worker
/// paths.
pub trait EventSink: Send + Sync {
    fn fire(&self, event: JobEvent);
}

/// Sink that drops every event. The default when no sink is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn fire(&self, _event: JobEvent) {}
}

/// Sink that records events in memory.
///
/// Intended for tests and small embeddings that poll instead of subscribe.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<JobEvent>>,
}

impl MemoryEventSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every recorded event, in firing order.
    pub fn events(&self) -> Vec<JobEvent> {
        self.lock().clone()
    }

    /// Removes and returns every recorded event.
    pub fn take(&self) -> Vec<JobEvent> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<JobEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EventSink for MemoryEventSink {
    fn fire(&self, event: JobEvent) {
        self.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemoryEventSink::new();
        sink.fire(JobEvent::Pushed {
            queue: "mail".into(),
            name: "send-email".into(),
        });
        sink.fire(JobEvent::Started {
            queue: "mail".into(),
            name: "send-email".into(),
            attempts: 1,
        });

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), "pushed");
        assert_eq!(events[1].kind(), "started");
        assert_eq!(events[1].queue(), "mail");
        assert_eq!(events[1].name(), "send-email");
    }

    #[test]
    fn test_memory_sink_take_drains() {
        let sink = MemoryEventSink::new();
        sink.fire(JobEvent::Failed {
            queue: "mail".into(),
            name: "send-email".into(),
            attempts: 3,
            error: "smtp unreachable".into(),
        });

        assert_eq!(sink.take().len(), 1);
        assert!(sink.events().is_empty());
    }
}
