//! Progress side channel between stages and the event stream

use schemaflow_core::{
    ProgressEvent, RunState, EVENT_MESSAGES, EVENT_REQUIREMENTS, EVENT_SCHEMA, EVENT_TESTCASES,
    EVENT_VALIDATION,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

/// Sender half handed to stages for emitting progress events
///
/// Emitting never fails: once the consumer is gone, events are dropped.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    /// Create a sink together with the receiver that consumes it
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Sink that discards everything
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                trace!("Progress receiver closed, dropping event");
            }
        }
    }

    pub fn emit_all(&self, events: impl IntoIterator<Item = ProgressEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

fn payload<T: Serialize>(name: &str, value: &T) -> Option<ProgressEvent> {
    serde_json::to_value(value)
        .ok()
        .map(|data| ProgressEvent::new(name, data))
}

/// Events describing what changed between two run states
///
/// With `prev = None` every populated field is reported, which is how replay
/// re-derives a stream from a stored checkpoint.
pub fn state_events(prev: Option<&RunState>, next: &RunState) -> Vec<ProgressEvent> {
    let mut events = Vec::new();

    let seen = prev.map(|p| p.messages.len()).unwrap_or(0);
    events.extend(
        next.messages
            .iter()
            .skip(seen)
            .filter_map(|entry| payload(EVENT_MESSAGES, entry)),
    );

    if let Some(requirements) = &next.analyzed_requirements {
        if prev.map_or(true, |p| p.analyzed_requirements.as_ref() != Some(requirements)) {
            events.extend(payload(EVENT_REQUIREMENTS, requirements));
        }
    }

    if let Some(testcases) = &next.generated_testcases {
        if prev.map_or(true, |p| p.generated_testcases.as_ref() != Some(testcases)) {
            events.extend(payload(EVENT_TESTCASES, testcases));
        }
    }

    if !next.schema.is_null() && prev.map_or(true, |p| p.schema != next.schema) {
        events.push(ProgressEvent::new(EVENT_SCHEMA, next.schema.clone()));
    }

    if let Some(report) = &next.validation_report {
        if prev.map_or(true, |p| p.validation_report.as_ref() != Some(report)) {
            events.extend(payload(EVENT_VALIDATION, report));
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemaflow_core::{AnalyzedRequirements, RunRequest, StateUpdate, TranscriptEntry};
    use serde_json::json;

    fn state() -> RunState {
        RunState::new(
            &RunRequest {
                thread_id: "t".to_string(),
                organization_id: "o".to_string(),
                user_id: "u".to_string(),
                message: "orders".to_string(),
            },
            serde_json::Value::Null,
        )
    }

    #[test]
    fn test_full_derivation_includes_transcript() {
        let events = state_events(None, &state());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, EVENT_MESSAGES);
        assert_eq!(events[0].data["content"], "orders");
    }

    #[test]
    fn test_diff_reports_only_changes() {
        let prev = state();
        let next = prev.apply(
            StateUpdate::new()
                .with_requirements(AnalyzedRequirements {
                    business_requirement: "Track orders".to_string(),
                    ..Default::default()
                })
                .with_message(TranscriptEntry::assistant("analyst", "done")),
        );

        let names: Vec<_> = state_events(Some(&prev), &next)
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(names, vec![EVENT_MESSAGES, EVENT_REQUIREMENTS]);

        assert!(state_events(Some(&next), &next).is_empty());
    }

    #[test]
    fn test_schema_change_reported() {
        let prev = state();
        let next = prev.apply(StateUpdate::new().with_schema(json!({"tables": {}})));
        let events = state_events(Some(&prev), &next);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, EVENT_SCHEMA);
    }

    #[tokio::test]
    async fn test_sink_survives_closed_receiver() {
        let (sink, rx) = ProgressSink::channel();
        drop(rx);
        sink.emit(ProgressEvent::end());
        ProgressSink::discard().emit(ProgressEvent::end());
    }
}
