//! Tool commands invoked by stages
//!
//! A tool never touches the run state it is given: it returns a [`Command`]
//! describing the patch, and the orchestrator applies it.

use schemaflow_core::{DmlOperation, RunState, StateUpdate, TranscriptEntry};
use serde_json::Value;
use tracing::{debug, warn};

/// Result of a tool invocation
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Patch to merge into the run state, plus the tool's transcript entry
    Update {
        update: StateUpdate,
        message: TranscriptEntry,
    },
    /// Unrecoverable contract violation; ends the run
    Fatal { tool: String, error: String },
}

impl Command {
    fn fatal(tool: &str, error: impl Into<String>) -> Self {
        let error = error.into();
        warn!("Tool {} terminated the run: {}", tool, error);
        Self::Fatal {
            tool: tool.to_string(),
            error,
        }
    }
}

/// Side-effecting action a stage's agent asks for
pub trait ToolCommand: Send + Sync {
    fn name(&self) -> &'static str;

    fn invoke(&self, input: Value, tool_call_id: &str, state: &RunState) -> Command;
}

/// Replaces the schema snapshot
#[derive(Debug, Default, Clone, Copy)]
pub struct SaveSchemaTool;

impl SaveSchemaTool {
    pub const NAME: &'static str = "saveSchemaTool";
}

impl ToolCommand for SaveSchemaTool {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn invoke(&self, input: Value, tool_call_id: &str, _state: &RunState) -> Command {
        let schema = match input.get("schema") {
            Some(schema @ Value::Object(_)) => schema.clone(),
            _ => return Command::fatal(Self::NAME, "No schema provided to save"),
        };

        let tables = schema
            .get("tables")
            .and_then(Value::as_object)
            .map(|t| t.len())
            .unwrap_or(0);
        debug!("Saving schema with {} tables", tables);

        Command::Update {
            update: StateUpdate::new().with_schema(schema),
            message: TranscriptEntry::tool(
                Self::NAME,
                tool_call_id,
                "Schema saved successfully",
            ),
        }
    }
}

/// Attaches DML operations to testcases by id
#[derive(Debug, Default, Clone, Copy)]
pub struct SaveTestcaseDmlTool;

impl SaveTestcaseDmlTool {
    pub const NAME: &'static str = "saveTestcaseDmlTool";
}

impl ToolCommand for SaveTestcaseDmlTool {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn invoke(&self, input: Value, tool_call_id: &str, state: &RunState) -> Command {
        let raw = input.get("operations").cloned().unwrap_or(Value::Null);
        let operations: Vec<DmlOperation> = match raw {
            Value::Null => Vec::new(),
            other => match serde_json::from_value(other) {
                Ok(ops) => ops,
                Err(e) => {
                    return Command::fatal(Self::NAME, format!("Invalid DML operations: {}", e))
                }
            },
        };

        if operations.is_empty() {
            return Command::fatal(Self::NAME, "No DML operations provided to save");
        }

        let Some(testcases) = state.generated_testcases.as_ref() else {
            return Command::fatal(Self::NAME, "No testcases available to attach DML to");
        };

        let mut testcases = testcases.clone();
        let mut attached = 0usize;
        let mut dropped = 0usize;

        for op in operations {
            match testcases.iter_mut().find(|tc| tc.id == op.test_case_id) {
                Some(tc) => {
                    tc.dml_operations.push(op);
                    attached += 1;
                }
                None => {
                    debug!("Dropping DML operation for unknown testcase {}", op.test_case_id);
                    dropped += 1;
                }
            }
        }

        let mut content = format!("Saved {} DML operations", attached);
        if dropped > 0 {
            content.push_str(&format!(" ({} unmatched dropped)", dropped));
        }

        Command::Update {
            update: StateUpdate::new().with_testcases(testcases),
            message: TranscriptEntry::tool(Self::NAME, tool_call_id, content),
        }
    }
}
