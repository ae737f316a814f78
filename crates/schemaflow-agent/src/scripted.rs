//! Scripted agent for tests and offline demos
//!
//! Replays a queue of canned responses in order and records every call, so
//! tests can assert how often (and with what) an agent was invoked.

use crate::agent::{Agent, PromptVariables};
use async_trait::async_trait;
use schemaflow_core::{FlowError, Result};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
enum Scripted {
    Respond(Value),
    Fail(String),
}

/// Agent that answers from a fixed script
#[derive(Clone)]
pub struct ScriptedAgent {
    name: String,
    script: Arc<Mutex<VecDeque<Scripted>>>,
    calls: Arc<Mutex<Vec<PromptVariables>>>,
}

impl ScriptedAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a successful response
    pub fn with_response(self, value: Value) -> Self {
        self.push(Scripted::Respond(value));
        self
    }

    /// Queue a failing invocation
    pub fn with_failure(self, message: impl Into<String>) -> Self {
        self.push(Scripted::Fail(message.into()));
        self
    }

    /// Queue `count` consecutive failures
    pub fn with_failures(self, count: usize, message: &str) -> Self {
        for _ in 0..count {
            self.push(Scripted::Fail(message.to_string()));
        }
        self
    }

    /// Number of times the agent was invoked
    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Variables passed on each invocation, in order
    pub fn calls(&self) -> Vec<PromptVariables> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn push(&self, entry: Scripted) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(entry);
        }
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, variables: &PromptVariables) -> Result<Value> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(variables.clone());
        }

        let next = self
            .script
            .lock()
            .map_err(|_| FlowError::Agent(format!("{}: script lock poisoned", self.name)))?
            .pop_front();

        match next {
            Some(Scripted::Respond(value)) => Ok(value),
            Some(Scripted::Fail(message)) => Err(FlowError::Agent(message)),
            None => Err(FlowError::Agent(format!(
                "{}: no scripted response left",
                self.name
            ))),
        }
    }
}
