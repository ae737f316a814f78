//! # schemaflow-orchestrator
//!
//! Sequencing engine for SchemaFlow runs.
//!
//! - [`stages`]: the five pipeline stages behind the [`Stage`] trait
//! - [`tools`]: tool commands returning patches the orchestrator applies
//! - [`cursor`]: pure stage-cursor state machine (retry policy lives here)
//! - [`checkpoint`]: monotonic per-thread checkpoint logs
//! - [`Orchestrator`]: drives a run and streams its progress
//! - [`replay()`]: re-derives a stream from the latest checkpoint
//! - [`guard()`]: cancellation plus wall-clock deadline

pub mod checkpoint;
pub mod cursor;
pub mod guard;
mod orchestrator;
pub mod progress;
pub mod replay;
pub mod reporter;
pub mod repository;
pub mod stages;
pub mod tools;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use guard::{guard, PRE_ABORT_MESSAGE};
pub use orchestrator::{Orchestrator, PreparedRun, RunOutcome, RunStart, ABORT_MESSAGE};
pub use progress::{state_events, ProgressSink};
pub use replay::{replay, NO_CHECKPOINT_MESSAGE};
pub use reporter::{ErrorReporter, RecordingErrorReporter, TracingErrorReporter};
pub use repository::{MemoryRepository, Repository};
pub use stages::{run_stage, AgentSet, Stage, StageContext, StageOutput};
pub use tools::{Command, SaveSchemaTool, SaveTestcaseDmlTool, ToolCommand};
