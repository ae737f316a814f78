//! Pipeline stages
//!
//! Every stage reads the run state, calls its agent through the structured
//! parse boundary, and returns a [`StageOutput`]. Stages never mutate the
//! state they are given; [`run_stage`] applies their output copy-on-write.
//!
//! Error classes returned by [`Stage::execute`]:
//! - retryable (`FlowError::is_retryable`): recorded in `retry_count`
//! - `FlowError::Precondition`: upstream data missing, surfaced immediately
//!
//! Fatal tool signals travel as [`Command::Fatal`] inside the output.

use crate::progress::ProgressSink;
use crate::tools::{Command, SaveSchemaTool, SaveTestcaseDmlTool, ToolCommand};
use async_trait::async_trait;
use schemaflow_agent::{invoke_structured, prompt_variables, Agent};
use schemaflow_core::{
    AnalyzedRequirements, DmlOperation, FlowError, ProgressEvent, RequirementType, Result,
    RunState, StageName, StateUpdate, Testcase, TranscriptEntry, ValidationReport, EVENT_TOOL,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Per-run context shared with stages
#[derive(Debug, Clone)]
pub struct StageContext {
    pub thread_id: String,
    pub sink: ProgressSink,
    pub signal: CancellationToken,
}

impl StageContext {
    pub fn new(thread_id: impl Into<String>, sink: ProgressSink, signal: CancellationToken) -> Self {
        Self {
            thread_id: thread_id.into(),
            sink,
            signal,
        }
    }

    fn log(&self, stage: StageName, message: impl Into<String>) {
        self.sink.emit(ProgressEvent::log(stage, message));
    }

    fn tool_call(&self, stage: StageName, tool: &str, tool_call_id: &str) {
        self.sink.emit(ProgressEvent::new(
            EVENT_TOOL,
            json!({ "stage": stage.as_str(), "tool": tool, "toolCallId": tool_call_id }),
        ));
    }
}

/// Successful stage contribution
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub update: StateUpdate,
    pub commands: Vec<Command>,
}

impl StageOutput {
    pub fn new(update: StateUpdate) -> Self {
        Self {
            update,
            commands: Vec::new(),
        }
    }

    pub fn with_command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }
}

/// One step of the pipeline
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    async fn execute(&self, state: &RunState, ctx: &StageContext) -> Result<StageOutput>;
}

/// Run a stage and fold its result into a new state
///
/// Retryable failures come back as `Ok` with `error` set and the stage's
/// retry count incremented. Precondition failures and fatal tool commands
/// come back as `Err`.
pub async fn run_stage(stage: &dyn Stage, state: &RunState, ctx: &StageContext) -> Result<RunState> {
    let name = stage.name();
    match stage.execute(state, ctx).await {
        Ok(output) => {
            let mut next = state.apply(output.update);
            for command in output.commands {
                match command {
                    Command::Update { update, message } => {
                        next = next.apply(update.with_message(message));
                    }
                    Command::Fatal { tool, error } => {
                        return Err(FlowError::ToolTermination {
                            tool,
                            message: error,
                        });
                    }
                }
            }
            Ok(next)
        }
        Err(e) if e.is_retryable() => {
            debug!("{} failed with retryable error: {}", name, e);
            ctx.log(name, format!("Failed: {}", e));
            Ok(state.record_failure(name, e.to_string()))
        }
        Err(e) => Err(e),
    }
}

fn precondition(stage: StageName, message: &str) -> FlowError {
    FlowError::Precondition {
        stage: stage.to_string(),
        message: message.to_string(),
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn require_testcases(stage: StageName, state: &RunState) -> Result<&Vec<Testcase>> {
    state
        .generated_testcases
        .as_ref()
        .ok_or_else(|| precondition(stage, "generated testcases are missing"))
}

/// Agents injected per stage
#[derive(Clone)]
pub struct AgentSet {
    pub analyst: Arc<dyn Agent>,
    pub testcase_generator: Arc<dyn Agent>,
    pub schema_designer: Arc<dyn Agent>,
    pub dml_generator: Arc<dyn Agent>,
    pub qa_validator: Arc<dyn Agent>,
}

impl AgentSet {
    /// Default stage catalog in pipeline order
    pub fn into_stages(self) -> Vec<Arc<dyn Stage>> {
        vec![
            Arc::new(AnalyzeRequirementsStage::new(self.analyst)),
            Arc::new(GenerateTestcasesStage::new(self.testcase_generator)),
            Arc::new(BuildSchemaStage::new(self.schema_designer)),
            Arc::new(GenerateDmlStage::new(self.dml_generator)),
            Arc::new(ValidateSchemaStage::new(self.qa_validator)),
        ]
    }
}

/// Turns the request into categorized requirements
pub struct AnalyzeRequirementsStage {
    agent: Arc<dyn Agent>,
}

impl AnalyzeRequirementsStage {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Stage for AnalyzeRequirementsStage {
    fn name(&self) -> StageName {
        StageName::AnalyzeRequirements
    }

    #[instrument(skip_all, fields(thread = %ctx.thread_id))]
    async fn execute(&self, state: &RunState, ctx: &StageContext) -> Result<StageOutput> {
        let stage = self.name();
        if state.request.trim().is_empty() {
            return Err(precondition(stage, "request text is empty"));
        }

        ctx.log(stage, "Analyzing requirements");
        let vars = prompt_variables([
            ("request", Value::String(state.request.clone())),
            ("schema", state.schema.clone()),
        ]);
        let requirements: AnalyzedRequirements =
            invoke_structured(self.agent.as_ref(), &vars).await?;

        ctx.log(
            stage,
            format!(
                "Identified {} requirements",
                requirements.requirement_count()
            ),
        );

        let summary = TranscriptEntry::assistant(
            self.agent.name(),
            requirements.business_requirement.clone(),
        );
        Ok(StageOutput::new(
            StateUpdate::new()
                .with_requirements(requirements)
                .with_message(summary),
        ))
    }
}

/// Testcase as produced by the generator, before ids are assigned
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestcaseDraft {
    pub requirement_type: RequirementType,
    pub requirement_category: String,
    pub requirement: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
struct TestcaseBatch {
    testcases: Vec<TestcaseDraft>,
}

/// Derives one batch of testcases from the requirements
pub struct GenerateTestcasesStage {
    agent: Arc<dyn Agent>,
}

impl GenerateTestcasesStage {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Stage for GenerateTestcasesStage {
    fn name(&self) -> StageName {
        StageName::GenerateTestcases
    }

    #[instrument(skip_all, fields(thread = %ctx.thread_id))]
    async fn execute(&self, state: &RunState, ctx: &StageContext) -> Result<StageOutput> {
        let stage = self.name();
        let requirements = state
            .analyzed_requirements
            .as_ref()
            .ok_or_else(|| precondition(stage, "analyzed requirements are missing"))?;

        ctx.log(stage, "Generating testcases");
        let vars = prompt_variables([
            ("analyzedRequirements", to_value(requirements)?),
            ("schema", state.schema.clone()),
        ]);
        let batch: TestcaseBatch = invoke_structured(self.agent.as_ref(), &vars).await?;

        let testcases: Vec<Testcase> = batch
            .testcases
            .into_iter()
            .enumerate()
            .map(|(i, draft)| Testcase {
                id: format!("tc-{}", i + 1),
                requirement_type: draft.requirement_type,
                requirement_category: draft.requirement_category,
                requirement: draft.requirement,
                title: draft.title,
                description: draft.description,
                dml_operations: Vec::new(),
            })
            .collect();

        let mut per_category: BTreeMap<&str, usize> = BTreeMap::new();
        for tc in &testcases {
            *per_category.entry(tc.requirement_category.as_str()).or_default() += 1;
        }
        debug!("Testcases per category: {:?}", per_category);

        let message = format!("Generated {} testcases", testcases.len());
        ctx.log(stage, &message);

        Ok(StageOutput::new(
            StateUpdate::new()
                .with_testcases(testcases)
                .with_message(TranscriptEntry::assistant(self.agent.name(), message)),
        ))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaDesign {
    #[serde(default)]
    tool_call_id: Option<String>,
    #[serde(default)]
    schema: Value,
    #[serde(default)]
    summary: String,
}

/// Designs or updates the schema and saves it through `saveSchemaTool`
pub struct BuildSchemaStage {
    agent: Arc<dyn Agent>,
    tool: SaveSchemaTool,
}

impl BuildSchemaStage {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self {
            agent,
            tool: SaveSchemaTool,
        }
    }
}

#[async_trait]
impl Stage for BuildSchemaStage {
    fn name(&self) -> StageName {
        StageName::BuildSchema
    }

    #[instrument(skip_all, fields(thread = %ctx.thread_id))]
    async fn execute(&self, state: &RunState, ctx: &StageContext) -> Result<StageOutput> {
        let stage = self.name();
        let testcases = require_testcases(stage, state)?;

        ctx.log(stage, "Designing schema");
        let vars = prompt_variables([
            ("request", Value::String(state.request.clone())),
            (
                "analyzedRequirements",
                state
                    .analyzed_requirements
                    .as_ref()
                    .map(to_value)
                    .transpose()?
                    .unwrap_or(Value::Null),
            ),
            ("testcases", to_value(testcases)?),
            ("schema", state.schema.clone()),
        ]);
        let design: SchemaDesign = invoke_structured(self.agent.as_ref(), &vars).await?;

        let call_id = design
            .tool_call_id
            .unwrap_or_else(|| format!("{}:{}", stage, self.tool.name()));
        ctx.tool_call(stage, self.tool.name(), &call_id);
        let command = self
            .tool
            .invoke(json!({ "schema": design.schema }), &call_id, state);

        ctx.log(stage, "Schema design finished");
        let mut update = StateUpdate::new();
        if !design.summary.is_empty() {
            update = update.with_message(TranscriptEntry::assistant(
                self.agent.name(),
                design.summary,
            ));
        }
        Ok(StageOutput::new(update).with_command(command))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DmlBatch {
    #[serde(default)]
    tool_call_id: Option<String>,
    #[serde(default)]
    operations: Vec<DmlOperation>,
}

/// Produces sample DML per testcase and attaches it through `saveTestcaseDmlTool`
pub struct GenerateDmlStage {
    agent: Arc<dyn Agent>,
    tool: SaveTestcaseDmlTool,
}

impl GenerateDmlStage {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self {
            agent,
            tool: SaveTestcaseDmlTool,
        }
    }
}

#[async_trait]
impl Stage for GenerateDmlStage {
    fn name(&self) -> StageName {
        StageName::GenerateDml
    }

    #[instrument(skip_all, fields(thread = %ctx.thread_id))]
    async fn execute(&self, state: &RunState, ctx: &StageContext) -> Result<StageOutput> {
        let stage = self.name();
        let testcases = require_testcases(stage, state)?;
        if state.schema.is_null() {
            return Err(precondition(stage, "schema snapshot is missing"));
        }

        ctx.log(stage, "Generating DML for testcases");
        let vars = prompt_variables([
            ("schema", state.schema.clone()),
            ("testcases", to_value(testcases)?),
        ]);
        let batch: DmlBatch = invoke_structured(self.agent.as_ref(), &vars).await?;

        let call_id = batch
            .tool_call_id
            .unwrap_or_else(|| format!("{}:{}", stage, self.tool.name()));
        ctx.tool_call(stage, self.tool.name(), &call_id);
        let count = batch.operations.len();
        let command = self
            .tool
            .invoke(json!({ "operations": batch.operations }), &call_id, state);

        ctx.log(stage, format!("Received {} DML operations", count));
        Ok(StageOutput::new(StateUpdate::new()).with_command(command))
    }
}

/// Reviews schema and testcases and reports issues
pub struct ValidateSchemaStage {
    agent: Arc<dyn Agent>,
}

impl ValidateSchemaStage {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Stage for ValidateSchemaStage {
    fn name(&self) -> StageName {
        StageName::ValidateSchema
    }

    #[instrument(skip_all, fields(thread = %ctx.thread_id))]
    async fn execute(&self, state: &RunState, ctx: &StageContext) -> Result<StageOutput> {
        let stage = self.name();
        let testcases = require_testcases(stage, state)?;

        ctx.log(stage, "Validating schema against testcases");
        let vars = prompt_variables([
            ("schema", state.schema.clone()),
            ("testcases", to_value(testcases)?),
        ]);
        let report: ValidationReport = invoke_structured(self.agent.as_ref(), &vars).await?;

        ctx.log(
            stage,
            format!(
                "Validation {} with {} issues",
                if report.passed { "passed" } else { "failed" },
                report.issues.len()
            ),
        );

        let message = TranscriptEntry::assistant(self.agent.name(), report.summary.clone());
        Ok(StageOutput::new(
            StateUpdate::new()
                .with_validation(report)
                .with_message(message),
        ))
    }
}
