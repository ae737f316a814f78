//! Typed parse-or-fail boundary for agent output
//!
//! Agents may answer with a JSON value or with text that wraps JSON in a
//! markdown fence or prose. Everything funnels through [`parse_structured`],
//! so stages never see unvalidated data: any mismatch becomes a
//! `FlowError::StructuredOutput`, which stages treat as a retryable failure.

use crate::agent::{Agent, PromptVariables};
use regex::Regex;
use schemaflow_core::{FlowError, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

/// Longest slice of raw output quoted back in error messages
const ERROR_PREVIEW_CHARS: usize = 120;

fn fenced_block() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"```(?:json)?\s*\n?([\s\S]*?)\n?```").ok())
        .as_ref()
}

/// Invoke an agent and parse its output as `T`
pub async fn invoke_structured<T: DeserializeOwned>(
    agent: &dyn Agent,
    variables: &PromptVariables,
) -> Result<T> {
    let raw = agent.invoke(variables).await?;
    parse_structured(raw)
}

/// Validate an agent's raw output against `T`
pub fn parse_structured<T: DeserializeOwned>(raw: Value) -> Result<T> {
    let value = match raw {
        Value::String(text) => {
            let json = extract_json(&text).ok_or_else(|| {
                FlowError::StructuredOutput(format!(
                    "no JSON found in agent output: {}",
                    preview(&text)
                ))
            })?;
            serde_json::from_str::<Value>(json).map_err(|e| {
                FlowError::StructuredOutput(format!("malformed JSON in agent output: {}", e))
            })?
        }
        other => other,
    };

    serde_json::from_value(value)
        .map_err(|e| FlowError::StructuredOutput(format!("unexpected output shape: {}", e)))
}

/// Locate the JSON document inside free-form agent text
///
/// Tries, in order: the whole text, a fenced code block, the first
/// balanced `{...}` object.
pub fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if (trimmed.starts_with('{') || trimmed.starts_with('['))
        && serde_json::from_str::<Value>(trimmed).is_ok()
    {
        return Some(trimmed);
    }

    if let Some(block) = fenced_block()
        .and_then(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
    {
        if block.starts_with('{') || block.starts_with('[') {
            debug!("Extracted JSON from fenced block");
            return Some(block);
        }
    }

    let start = text.find('{')?;
    let end = find_matching_brace(&text[start..])?;
    Some(&text[start..=start + end])
}

/// Index of the `}` closing the object that opens at `s[0]`
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

fn preview(text: &str) -> String {
    text.chars().take(ERROR_PREVIEW_CHARS).collect()
}
