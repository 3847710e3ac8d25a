//! Critical-error sink called from every catch boundary.

use std::sync::Mutex;

use serde::Serialize;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    Job,
    Fetch,
    Record,
    Chunk,
    Row,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureEvent {
    pub boundary: Boundary,
    /// What failed: a job name, a dedup key, a row id.
    pub subject: String,
    pub message: String,
    /// The next scheduled pass is expected to fix it without intervention.
    pub recoverable: bool,
}

impl FailureEvent {
    pub fn new(
        boundary: Boundary,
        subject: impl Into<String>,
        message: impl Into<String>,
        recoverable: bool,
    ) -> Self {
        Self {
            boundary,
            subject: subject.into(),
            message: message.into(),
            recoverable,
        }
    }
}

/// Must never panic or block for long; callers keep going after reporting.
pub trait ErrorSink: Send + Sync {
    fn critical(&self, event: &FailureEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn critical(&self, event: &FailureEvent) {
        error!(
            critical = true,
            boundary = ?event.boundary,
            subject = %event.subject,
            recoverable = event.recoverable,
            "{}",
            event.message
        );
    }
}

/// Keeps every event in memory and forwards it to tracing as well.
#[derive(Debug, Default)]
pub struct CollectingErrorSink {
    events: Mutex<Vec<FailureEvent>>,
}

impl CollectingErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FailureEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, boundary: Boundary) -> usize {
        self.events()
            .iter()
            .filter(|e| e.boundary == boundary)
            .count()
    }
}

impl ErrorSink for CollectingErrorSink {
    fn critical(&self, event: &FailureEvent) {
        TracingErrorSink.critical(event);
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
