//! Error capture for external observability
//!
//! Capture is synchronous and must never block or fail the run.

use schemaflow_core::FlowError;
use std::sync::Mutex;
use tracing::error;

pub trait ErrorReporter: Send + Sync {
    fn capture(&self, thread_id: &str, error: &FlowError);
}

/// Reports through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn capture(&self, thread_id: &str, err: &FlowError) {
        error!(thread_id, "Captured error: {}", err);
    }
}

/// Keeps captured errors in memory
#[derive(Debug, Default)]
pub struct RecordingErrorReporter {
    captured: Mutex<Vec<(String, String)>>,
}

impl RecordingErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(thread_id, message)` pairs in capture order
    pub fn captured(&self) -> Vec<(String, String)> {
        self.captured
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

impl ErrorReporter for RecordingErrorReporter {
    fn capture(&self, thread_id: &str, err: &FlowError) {
        if let Ok(mut captured) = self.captured.lock() {
            captured.push((thread_id.to_string(), err.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_reporter_keeps_thread_id() {
        let reporter = RecordingErrorReporter::new();
        reporter.capture("t1", &FlowError::Agent("down".to_string()));
        TracingErrorReporter.capture("t1", &FlowError::Agent("down".to_string()));

        let captured = reporter.captured();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].0, "t1");
        assert!(captured[0].1.contains("down"));
    }
}
