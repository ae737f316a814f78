//! # schemaflow-core
//!
//! Core types for the SchemaFlow agent workflow engine.
//!
//! A run threads one [`RunState`] through a fixed pipeline of stages
//! (requirements analysis, testcase generation, schema design, DML
//! generation, QA validation). Every stage transition is captured as a
//! [`Checkpoint`], and progress is reported to clients as a stream of
//! [`ProgressEvent`]s.

mod config;
mod error;
mod events;
pub mod fail_open;
mod types;

pub use config::{
    AgentEndpointConfig, RetryPolicy, ServerConfig, StorageConfig, StreamConfig, WorkflowConfig,
};
pub use error::{FlowError, Result};
pub use events::*;
pub use types::*;
