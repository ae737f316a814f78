//! Text event-stream framing
//!
//! Each event becomes `event:<name>\ndata:<payload>\n\n`. String payloads
//! are written raw (one `data:` line per line of text); everything else is
//! compact JSON.

use schemaflow_core::ProgressEvent;
use serde_json::Value;

/// Encode one event as a wire frame
pub fn encode_event(event: &ProgressEvent) -> String {
    let mut frame = String::with_capacity(event.event.len() + 16);
    frame.push_str("event:");
    frame.push_str(&event.event);
    frame.push('\n');

    match &event.data {
        Value::String(text) => {
            for line in text.split('\n') {
                frame.push_str("data:");
                frame.push_str(line.strip_suffix('\r').unwrap_or(line));
                frame.push('\n');
            }
        }
        other => {
            frame.push_str("data:");
            frame.push_str(&other.to_string());
            frame.push('\n');
        }
    }

    frame.push('\n');
    frame
}

/// Split a wire body back into `(event, data)` pairs
///
/// Multi-line data is rejoined with `\n`. Used by clients and tests.
pub fn decode_frames(body: &str) -> Vec<(String, String)> {
    body.split("\n\n")
        .filter(|block| !block.trim().is_empty())
        .map(|block| {
            let mut name = String::new();
            let mut data: Vec<&str> = Vec::new();
            for line in block.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    name = rest.to_string();
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data.push(rest);
                }
            }
            (name, data.join("\n"))
        })
        .collect()
}
