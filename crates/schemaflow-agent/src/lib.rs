//! # schemaflow-agent
//!
//! Agent collaborators for the SchemaFlow pipeline.
//!
//! An agent is an opaque, slow and fallible worker that turns prompt
//! variables into a JSON value. This crate provides:
//! - The [`Agent`] trait every stage depends on
//! - [`invoke_structured`], the parse-or-fail boundary for agent output
//! - [`HttpAgent`], a remote agent guarded by a [`CircuitBreaker`]
//! - [`ScriptedAgent`], a deterministic stand-in for tests and demos

mod agent;
mod circuit_breaker;
mod client;
mod scripted;
mod structured;

pub use agent::{prompt_variables, Agent, PromptVariables};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use client::HttpAgent;
pub use scripted::ScriptedAgent;
pub use structured::{extract_json, invoke_structured, parse_structured};
