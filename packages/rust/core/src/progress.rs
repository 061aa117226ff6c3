//! Progress events for an observing process.
//!
//! The orchestrator reports through a [`ProgressSink`]. [`LineEmitter`] writes
//! one `PROGRESS:{json}` line per event; emission never fails the pipeline.

use std::io::Write;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Kinds of progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventType {
    StageStart,
    StageProgress,
    StageComplete,
    ThreatStart,
    ThreatComplete,
    Error,
    Warning,
}

/// One progress notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: ProgressEventType,
    pub timestamp: DateTime<Utc>,
    pub stage: String,
    /// Overall completion, 0 to 100.
    pub percentage: f32,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ProgressEvent {
    /// Create an event. `percentage` is clamped to `0..=100`.
    pub fn new(
        kind: ProgressEventType,
        stage: impl Into<String>,
        percentage: f32,
        message: impl Into<String>,
    ) -> Self {
        let percentage = if percentage.is_nan() {
            0.0
        } else {
            percentage.clamp(0.0, 100.0)
        };
        Self {
            kind,
            timestamp: Utc::now(),
            stage: stage.into(),
            percentage,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Receives progress events. Implementations must not fail the caller.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// Discards every event.
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn emit(&self, _event: &ProgressEvent) {}
}

/// Writes `PROGRESS:{json}` lines, one per event, under a lock.
pub struct LineEmitter<W: Write + Send> {
    out: Mutex<W>,
}

impl LineEmitter<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> LineEmitter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> ProgressSink for LineEmitter<W> {
    fn emit(&self, event: &ProgressEvent) {
        let Ok(json) = serde_json::to_string(event) else {
            return;
        };
        let Ok(mut out) = self.out.lock() else {
            return;
        };
        let _ = writeln!(out, "PROGRESS:{json}");
        let _ = out.flush();
    }
}
