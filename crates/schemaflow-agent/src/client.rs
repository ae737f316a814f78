//! HTTP agent client
//!
//! Each agent lives behind `POST {base_url}/agents/{name}`. The request body
//! carries the prompt variables; the response body is the agent's structured
//! output (optionally wrapped as `{"output": ...}`).

use crate::agent::{Agent, PromptVariables};
use crate::circuit_breaker::CircuitBreaker;
use async_trait::async_trait;
use schemaflow_core::{AgentEndpointConfig, FlowError, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

// Rate limit retry configuration
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_BACKOFF_SECS: u64 = 30;

#[derive(Debug, Serialize)]
struct AgentRequest<'a> {
    agent: &'a str,
    variables: &'a PromptVariables,
}

/// Agent reached over HTTP
#[derive(Clone)]
pub struct HttpAgent {
    name: String,
    endpoint: String,
    token: Option<String>,
    http: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
}

impl HttpAgent {
    /// Create a client for the named agent using endpoint settings
    ///
    /// The bearer token is read from `config.api_key_env` when set.
    pub fn new(name: impl Into<String>, config: &AgentEndpointConfig) -> Result<Self> {
        let name = name.into();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| FlowError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let token = std::env::var(&config.api_key_env).ok();
        if token.is_none() {
            tracing::debug!(
                "{} not set, calling agent {} without authorization",
                config.api_key_env,
                name
            );
        }

        Ok(Self {
            endpoint: format!("{}/agents/{}", config.base_url.trim_end_matches('/'), name),
            name,
            token,
            http,
            breaker: Arc::new(CircuitBreaker::default()),
        })
    }

    /// Share a circuit breaker with other agents on the same endpoint
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Agent for HttpAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, variables: &PromptVariables) -> Result<Value> {
        if let Err(wait) = self.breaker.admit() {
            return Err(FlowError::AgentLimit(format!(
                "Circuit breaker is open for {} - wait {} seconds before retry",
                self.name,
                wait.as_secs()
            )));
        }

        let body = AgentRequest {
            agent: &self.name,
            variables,
        };

        let mut retries = 0;
        let mut backoff_secs = INITIAL_BACKOFF_SECS;

        loop {
            tracing::debug!("Invoking agent {} (attempt {})", self.name, retries + 1);

            let mut request = self.http.post(&self.endpoint).json(&body);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    self.breaker.record_failure();
                    return Err(FlowError::Agent(format!(
                        "Failed to reach agent {}: {}",
                        self.name, e
                    )));
                }
            };

            let status = response.status();

            // Handle rate limit (429) with retry
            if status.as_u16() == 429 {
                retries += 1;
                if retries > MAX_RETRIES {
                    self.breaker.record_failure();
                    return Err(FlowError::AgentLimit(format!(
                        "Agent {} rate limited after {} retries",
                        self.name, MAX_RETRIES
                    )));
                }

                let wait_secs = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(backoff_secs);

                tracing::warn!(
                    "Agent {} rate limited (429). Waiting {}s before retry {}/{}",
                    self.name,
                    wait_secs,
                    retries,
                    MAX_RETRIES
                );
                tokio::time::sleep(Duration::from_secs(wait_secs)).await;
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                continue;
            }

            if !status.is_success() {
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown".to_string());

                if status.is_server_error() && retries < MAX_RETRIES {
                    retries += 1;
                    tracing::warn!(
                        "Agent {} server error ({}). Waiting {}s before retry {}/{}",
                        self.name,
                        status,
                        backoff_secs,
                        retries,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                    continue;
                }

                self.breaker.record_failure();
                tracing::error!(
                    "Agent {} failed with {} (breaker failures: {})",
                    self.name,
                    status,
                    self.breaker.failure_count()
                );
                return Err(FlowError::Agent(format!(
                    "Agent {} returned {}: {}",
                    self.name, status, error_text
                )));
            }

            let payload: Value = match response.json().await {
                Ok(payload) => payload,
                Err(e) => {
                    self.breaker.record_failure();
                    return Err(FlowError::StructuredOutput(format!(
                        "Agent {} returned a non-JSON body: {}",
                        self.name, e
                    )));
                }
            };

            self.breaker.record_success();
            tracing::info!("Agent {} responded", self.name);

            return Ok(unwrap_output(payload));
        }
    }
}

/// Accept both `{"output": X}` envelopes and bare outputs
fn unwrap_output(payload: Value) -> Value {
    match payload {
        Value::Object(mut map) if map.len() == 1 && map.contains_key("output") => {
            map.remove("output").unwrap_or(Value::Null)
        }
        other => other,
    }
}
