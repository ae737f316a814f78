//! Unified error types for SchemaFlow

use thiserror::Error;

/// Unified error type for all SchemaFlow operations
#[derive(Error, Debug)]
pub enum FlowError {
    // Agent errors (retryable at the stage level)
    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Agent rate limited: {0}")]
    AgentLimit(String),

    #[error("Invalid structured output: {0}")]
    StructuredOutput(String),

    // Pipeline errors
    #[error("Precondition failed for {stage}: {message}")]
    Precondition { stage: String, message: String },

    #[error("Tool {tool} terminated the run: {message}")]
    ToolTermination { tool: String, message: String },

    #[error("Stage {stage} attempt {attempt} failed: {message}")]
    StageAttempt {
        stage: String,
        attempt: u32,
        message: String,
    },

    #[error("Stage {stage} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        stage: String,
        attempts: u32,
        message: String,
    },

    #[error("Stage not registered: {0}")]
    StageNotRegistered(String),

    #[error("Run aborted: {0}")]
    Aborted(String),

    // Persistence errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Checkpoint {attempted} for thread {thread_id} is older than latest {latest}")]
    CheckpointOutOfOrder {
        thread_id: String,
        latest: u64,
        attempted: u64,
    },

    #[error("Checkpoint not found for thread {0}")]
    CheckpointNotFound(String),

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl FlowError {
    /// Whether a stage may be re-attempted after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Agent(_)
                | Self::AgentLimit(_)
                | Self::StructuredOutput(_)
                | Self::StageAttempt { .. }
        )
    }

    /// Whether this error ends the run regardless of the retry budget
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ToolTermination { .. })
    }

    /// Message safe to show to an end user (no internals)
    pub fn user_message(&self) -> String {
        match self {
            Self::ToolTermination { message, .. } => message.clone(),
            Self::RetriesExhausted { stage, message, .. } => {
                format!("{} failed: {}", stage, message)
            }
            Self::Precondition { stage, message } => {
                format!("{} could not run: {}", stage, message)
            }
            Self::Aborted(reason) => reason.clone(),
            Self::Io(_) | Self::Serialization(_) | Self::Checkpoint(_) => {
                "Internal storage error".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Result type alias using FlowError
pub type Result<T> = std::result::Result<T, FlowError>;
