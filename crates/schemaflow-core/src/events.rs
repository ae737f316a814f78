//! Progress events emitted by a run

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// End-of-stream marker (payload `null`)
pub const EVENT_END: &str = "end";
/// Error marker (payload `{message}`)
pub const EVENT_ERROR: &str = "error";
/// Stage progress line
pub const EVENT_LOG: &str = "log";
/// Transcript entry
pub const EVENT_MESSAGES: &str = "messages";
/// Requirements analysis result
pub const EVENT_REQUIREMENTS: &str = "analyzedRequirements";
/// Generated testcases (with attached DML)
pub const EVENT_TESTCASES: &str = "testcases";
/// New schema version
pub const EVENT_SCHEMA: &str = "schema";
/// QA validation report
pub const EVENT_VALIDATION: &str = "validation";
/// Tool call progress
pub const EVENT_TOOL: &str = "tool";

/// A unit of the outward-facing event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub event: String,
    pub data: Value,
}

impl ProgressEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn end() -> Self {
        Self::new(EVENT_END, Value::Null)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EVENT_ERROR, json!({ "message": message.into() }))
    }

    pub fn log(stage: impl std::fmt::Display, message: impl Into<String>) -> Self {
        Self::new(
            EVENT_LOG,
            json!({ "stage": stage.to_string(), "message": message.into() }),
        )
    }

    pub fn is_end(&self) -> bool {
        self.event == EVENT_END
    }

    pub fn is_error(&self) -> bool {
        self.event == EVENT_ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_constructors() {
        let end = ProgressEvent::end();
        assert!(end.is_end());
        assert_eq!(end.data, Value::Null);

        let err = ProgressEvent::error("No checkpoint found for replay");
        assert!(err.is_error());
        assert_eq!(err.data["message"], "No checkpoint found for replay");
    }

    #[test]
    fn test_log_event_shape() {
        let ev = ProgressEvent::log("analyzeRequirementsNode", "Analyzing requirements...");
        assert_eq!(ev.event, EVENT_LOG);
        assert_eq!(ev.data["stage"], "analyzeRequirementsNode");
    }
}
