//! Agent collaborator interface

use async_trait::async_trait;
use schemaflow_core::Result;
use serde_json::Value;

/// Named inputs handed to an agent's prompt template
pub type PromptVariables = serde_json::Map<String, Value>;

/// An LLM-backed worker invoked by a stage
///
/// Implementations are slow and may fail; callers treat them as a black box
/// and validate the output through [`crate::invoke_structured`].
#[async_trait]
pub trait Agent: Send + Sync {
    /// Name used in transcripts and logs
    fn name(&self) -> &str;

    /// Run the agent once with the given prompt variables
    async fn invoke(&self, variables: &PromptVariables) -> Result<Value>;
}

/// Build prompt variables from `(name, value)` pairs
pub fn prompt_variables<I, K>(pairs: I) -> PromptVariables
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
