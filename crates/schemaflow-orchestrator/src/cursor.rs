//! Pure stage-cursor state machine
//!
//! No async, no I/O: `transition(cursor, event, policy) -> (cursor, actions)`.
//! The orchestrator performs the returned actions. Invalid transitions go to
//! `Failed` (never panic).

use schemaflow_core::{RetryPolicy, StageCursor, StageName};

/// Outcome of one stage attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEvent {
    /// Stage contribution was applied
    Succeeded,
    /// Stage failed with a retryable error; `failures` is the updated count
    Failed { error: String, failures: u32 },
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Persist a checkpoint for the new cursor
    WriteCheckpoint,
    /// Run (or re-run) a stage
    RunStage(StageName),
    /// Log activity
    LogActivity { message: String },
    /// The run is over
    Terminate,
}

/// Pure cursor transition function
pub fn transition(
    cursor: StageCursor,
    event: StageEvent,
    policy: &RetryPolicy,
) -> (StageCursor, Vec<Action>) {
    match (cursor, event) {
        (StageCursor::Pending { stage }, StageEvent::Succeeded) => match stage.next() {
            Some(next) => (
                StageCursor::Pending { stage: next },
                vec![
                    Action::LogActivity {
                        message: format!("{} complete, next {}", stage, next),
                    },
                    Action::WriteCheckpoint,
                    Action::RunStage(next),
                ],
            ),
            None => (
                StageCursor::Completed,
                vec![
                    Action::LogActivity {
                        message: "All stages complete".to_string(),
                    },
                    Action::WriteCheckpoint,
                    Action::Terminate,
                ],
            ),
        },

        (StageCursor::Pending { stage }, StageEvent::Failed { error, failures }) => {
            if policy.allows_retry(failures) {
                // Cursor unchanged, so nothing to checkpoint
                (
                    StageCursor::Pending { stage },
                    vec![
                        Action::LogActivity {
                            message: format!(
                                "{} failed ({}/{}), retrying: {}",
                                stage, failures, policy.max_retries, error
                            ),
                        },
                        Action::RunStage(stage),
                    ],
                )
            } else {
                (
                    StageCursor::Failed {
                        stage,
                        error: error.clone(),
                    },
                    vec![
                        Action::LogActivity {
                            message: format!(
                                "{} exhausted its retry budget after {} failures",
                                stage, failures
                            ),
                        },
                        Action::WriteCheckpoint,
                        Action::Terminate,
                    ],
                )
            }
        }

        // Terminal cursors reject every event
        (terminal, event) => {
            let (stage, error) = match &terminal {
                StageCursor::Failed { stage, error } => {
                    (*stage, format!("{} after terminal failure: {}", describe(&event), error))
                }
                _ => (
                    StageName::ALL[StageName::ALL.len() - 1],
                    format!("{} after completion", describe(&event)),
                ),
            };
            (
                StageCursor::Failed {
                    stage,
                    error: format!("Invalid transition: {}", error),
                },
                vec![Action::LogActivity {
                    message: format!("Invalid transition from {:?}", terminal),
                }],
            )
        }
    }
}

fn describe(event: &StageEvent) -> &'static str {
    match event {
        StageEvent::Succeeded => "success",
        StageEvent::Failed { .. } => "failure",
    }
}
