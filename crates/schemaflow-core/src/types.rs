//! Core type definitions for SchemaFlow runs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StageName {
    #[serde(rename = "analyzeRequirementsNode")]
    AnalyzeRequirements,
    #[serde(rename = "generateTestcasesNode")]
    GenerateTestcases,
    #[serde(rename = "buildSchemaNode")]
    BuildSchema,
    #[serde(rename = "generateDmlNode")]
    GenerateDml,
    #[serde(rename = "validateSchemaNode")]
    ValidateSchema,
}

impl StageName {
    /// Every stage in pipeline order
    pub const ALL: [StageName; 5] = [
        StageName::AnalyzeRequirements,
        StageName::GenerateTestcases,
        StageName::BuildSchema,
        StageName::GenerateDml,
        StageName::ValidateSchema,
    ];

    /// First stage of the pipeline
    pub fn first() -> Self {
        Self::ALL[0]
    }

    /// Stage that follows this one, or None for the last stage
    pub fn next(&self) -> Option<Self> {
        let idx = Self::ALL.iter().position(|s| s == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    /// Wire name of the stage
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnalyzeRequirements => "analyzeRequirementsNode",
            Self::GenerateTestcases => "generateTestcasesNode",
            Self::BuildSchema => "buildSchemaNode",
            Self::GenerateDml => "generateDmlNode",
            Self::ValidateSchema => "validateSchemaNode",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|stage| stage.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Invalid stage name: {}", s))
    }
}

/// Output of the requirements analysis stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedRequirements {
    pub business_requirement: String,
    /// Category -> requirement statements
    #[serde(default)]
    pub functional_requirements: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub non_functional_requirements: BTreeMap<String, Vec<String>>,
}

impl AnalyzedRequirements {
    /// Total number of requirement statements across all categories
    pub fn requirement_count(&self) -> usize {
        self.functional_requirements
            .values()
            .chain(self.non_functional_requirements.values())
            .map(Vec::len)
            .sum()
    }
}

/// Whether a testcase verifies a functional or non-functional requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementType {
    Functional,
    NonFunctional,
}

/// Data-manipulation statement kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    Select,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert => write!(f, "INSERT"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
            Self::Select => write!(f, "SELECT"),
        }
    }
}

/// A single DML statement tied to a testcase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DmlOperation {
    pub test_case_id: String,
    pub operation_type: OperationKind,
    pub sql: String,
    pub description: String,
}

/// One verifiable scenario derived from a requirement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Testcase {
    pub id: String,
    pub requirement_type: RequirementType,
    pub requirement_category: String,
    pub requirement: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub dml_operations: Vec<DmlOperation>,
}

/// Result of the QA validation stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub passed: bool,
    pub summary: String,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Speaker of a transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Assistant,
    Tool,
}

/// One turn of the run transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    /// Agent or tool that produced the entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl TranscriptEntry {
    pub fn human(content: impl Into<String>) -> Self {
        Self {
            role: Role::Human,
            content: content.into(),
            name: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            name: Some(name.into()),
            tool_call_id: None,
        }
    }

    pub fn tool(
        name: impl Into<String>,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            name: Some(name.into()),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Position of a run within the stage pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageCursor {
    /// The named stage runs next
    Pending { stage: StageName },
    /// Every stage finished
    Completed,
    /// The named stage exhausted its retry budget
    Failed { stage: StageName, error: String },
}

impl StageCursor {
    /// Cursor for a fresh run
    pub fn start() -> Self {
        Self::Pending {
            stage: StageName::first(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending { .. })
    }
}

/// Caller request that starts a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub thread_id: String,
    pub organization_id: String,
    pub user_id: String,
    pub message: String,
}

/// State threaded through every stage of one run
///
/// Stages never mutate a state in place: `apply`, `record_failure` and
/// friends all return a new value and leave `self` untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub thread_id: String,
    pub organization_id: String,
    pub user_id: String,
    pub request: String,
    /// Current schema snapshot (opaque)
    #[serde(default)]
    pub schema: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzed_requirements: Option<AnalyzedRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_testcases: Option<Vec<Testcase>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_report: Option<ValidationReport>,
    #[serde(default)]
    pub messages: Vec<TranscriptEntry>,
    #[serde(default)]
    pub retry_count: BTreeMap<StageName, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub signal: CancellationToken,
}

impl RunState {
    /// Build the initial state for a request against the given schema
    pub fn new(request: &RunRequest, schema: serde_json::Value) -> Self {
        Self {
            thread_id: request.thread_id.clone(),
            organization_id: request.organization_id.clone(),
            user_id: request.user_id.clone(),
            request: request.message.clone(),
            schema,
            analyzed_requirements: None,
            generated_testcases: None,
            validation_report: None,
            messages: vec![TranscriptEntry::human(&request.message)],
            retry_count: StageName::ALL.iter().map(|s| (*s, 0)).collect(),
            error: None,
            signal: CancellationToken::new(),
        }
    }

    /// Attach a cancellation token (shared, not copied)
    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = signal;
        self
    }

    /// Consecutive failures recorded for a stage
    pub fn retries(&self, stage: StageName) -> u32 {
        self.retry_count.get(&stage).copied().unwrap_or(0)
    }

    /// Merge a successful stage contribution into a new state
    ///
    /// Clears `error`. Transcript entries are appended, never replaced.
    pub fn apply(&self, update: StateUpdate) -> Self {
        let mut next = self.clone();
        if let Some(schema) = update.schema {
            next.schema = schema;
        }
        if let Some(requirements) = update.analyzed_requirements {
            next.analyzed_requirements = Some(requirements);
        }
        if let Some(testcases) = update.generated_testcases {
            next.generated_testcases = Some(testcases);
        }
        if let Some(report) = update.validation_report {
            next.validation_report = Some(report);
        }
        next.messages.extend(update.messages);
        next.error = None;
        next
    }

    /// New state recording one more failure of `stage`
    pub fn record_failure(&self, stage: StageName, error: impl Into<String>) -> Self {
        let mut next = self.clone();
        *next.retry_count.entry(stage).or_insert(0) += 1;
        next.error = Some(error.into());
        next
    }

    /// New state with the failure history of `stage` cleared (used on resume)
    pub fn reset_failures(&self, stage: StageName) -> Self {
        let mut next = self.clone();
        next.retry_count.insert(stage, 0);
        next.error = None;
        next
    }

    /// Look up a testcase by id
    pub fn testcase(&self, id: &str) -> Option<&Testcase> {
        self.generated_testcases
            .as_ref()
            .and_then(|cases| cases.iter().find(|tc| tc.id == id))
    }
}

/// Partial run state produced by a stage or tool
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub schema: Option<serde_json::Value>,
    pub analyzed_requirements: Option<AnalyzedRequirements>,
    pub generated_testcases: Option<Vec<Testcase>>,
    pub validation_report: Option<ValidationReport>,
    pub messages: Vec<TranscriptEntry>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_requirements(mut self, requirements: AnalyzedRequirements) -> Self {
        self.analyzed_requirements = Some(requirements);
        self
    }

    pub fn with_testcases(mut self, testcases: Vec<Testcase>) -> Self {
        self.generated_testcases = Some(testcases);
        self
    }

    pub fn with_validation(mut self, report: ValidationReport) -> Self {
        self.validation_report = Some(report);
        self
    }

    pub fn with_message(mut self, entry: TranscriptEntry) -> Self {
        self.messages.push(entry);
        self
    }

    /// Fold another update on top of this one (later fields win, messages append)
    pub fn merge(mut self, other: StateUpdate) -> Self {
        if other.schema.is_some() {
            self.schema = other.schema;
        }
        if other.analyzed_requirements.is_some() {
            self.analyzed_requirements = other.analyzed_requirements;
        }
        if other.generated_testcases.is_some() {
            self.generated_testcases = other.generated_testcases;
        }
        if other.validation_report.is_some() {
            self.validation_report = other.validation_report;
        }
        self.messages.extend(other.messages);
        self
    }
}

/// Immutable, thread-scoped snapshot of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub thread_id: String,
    pub checkpoint_id: u64,
    pub stage_cursor: StageCursor,
    pub run_state: RunState,
}

impl Checkpoint {
    pub fn new(checkpoint_id: u64, stage_cursor: StageCursor, run_state: RunState) -> Self {
        Self {
            thread_id: run_state.thread_id.clone(),
            checkpoint_id,
            stage_cursor,
            run_state,
        }
    }
}
