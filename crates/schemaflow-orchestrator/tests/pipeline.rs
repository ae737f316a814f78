//! End-to-end pipeline tests driven by scripted agents

use async_trait::async_trait;
use futures::StreamExt;
use schemaflow_agent::{Agent, PromptVariables, ScriptedAgent};
use schemaflow_core::{
    FlowError, ProgressEvent, Result, RetryPolicy, RunRequest, StageCursor, StageName, EVENT_END,
    EVENT_ERROR, EVENT_SCHEMA, EVENT_TESTCASES, EVENT_TOOL, EVENT_VALIDATION,
};
use schemaflow_orchestrator::{
    replay, AgentSet, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
    MemoryRepository, Orchestrator, RecordingErrorReporter, RunOutcome, RunStart, ABORT_MESSAGE,
    NO_CHECKPOINT_MESSAGE,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn requirements() -> Value {
    json!({
        "businessRequirement": "Users sign up and place orders",
        "functionalRequirements": {
            "accounts": ["Users can sign up with an email"],
            "orders": ["Users can place orders"]
        },
        "nonFunctionalRequirements": {"integrity": ["Orders reference existing users"]}
    })
}

fn testcases() -> Value {
    json!({
        "testcases": [
            {
                "requirementType": "functional",
                "requirementCategory": "accounts",
                "requirement": "Users can sign up with an email",
                "title": "Sign up",
                "description": "Insert a user"
            },
            {
                "requirementType": "functional",
                "requirementCategory": "orders",
                "requirement": "Users can place orders",
                "title": "Place order"
            }
        ]
    })
}

fn schema_design() -> Value {
    json!({
        "toolCallId": "call-schema",
        "schema": {"tables": {"users": {"columns": {"id": "uuid", "email": "text"}}}},
        "summary": "Added users table"
    })
}

fn dml() -> Value {
    json!({
        "toolCallId": "call-dml",
        "operations": [
            {
                "testCaseId": "tc-1",
                "operationType": "INSERT",
                "sql": "INSERT INTO users (id, email) VALUES ('1', 'a@example.com')",
                "description": "seed user"
            }
        ]
    })
}

fn report() -> Value {
    json!({"passed": true, "summary": "Schema covers all testcases", "issues": []})
}

fn request(thread: &str) -> RunRequest {
    RunRequest {
        thread_id: thread.to_string(),
        organization_id: "org-1".to_string(),
        user_id: "user-1".to_string(),
        message: "Design a schema for users and orders".to_string(),
    }
}

/// Scripted agents for every stage, shared with the orchestrator
struct Agents {
    analyst: ScriptedAgent,
    generator: ScriptedAgent,
    designer: ScriptedAgent,
    dml: ScriptedAgent,
    qa: ScriptedAgent,
}

impl Agents {
    fn empty() -> Self {
        Self {
            analyst: ScriptedAgent::new("analyst"),
            generator: ScriptedAgent::new("testcase-generator"),
            designer: ScriptedAgent::new("schema-designer"),
            dml: ScriptedAgent::new("dml-generator"),
            qa: ScriptedAgent::new("qa-validator"),
        }
    }

    fn happy() -> Self {
        let agents = Self::empty();
        Self {
            analyst: agents.analyst.with_response(requirements()),
            generator: agents.generator.with_response(testcases()),
            designer: agents.designer.with_response(schema_design()),
            dml: agents.dml.with_response(dml()),
            qa: agents.qa.with_response(report()),
        }
    }

    fn by_stage(&self, stage: StageName) -> &ScriptedAgent {
        match stage {
            StageName::AnalyzeRequirements => &self.analyst,
            StageName::GenerateTestcases => &self.generator,
            StageName::BuildSchema => &self.designer,
            StageName::GenerateDml => &self.dml,
            StageName::ValidateSchema => &self.qa,
        }
    }

    fn set(&self) -> AgentSet {
        AgentSet {
            analyst: Arc::new(self.analyst.clone()),
            testcase_generator: Arc::new(self.generator.clone()),
            schema_designer: Arc::new(self.designer.clone()),
            dml_generator: Arc::new(self.dml.clone()),
            qa_validator: Arc::new(self.qa.clone()),
        }
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn CheckpointStore>,
    repository: Arc<MemoryRepository>,
    reporter: Arc<RecordingErrorReporter>,
}

fn harness(agents: AgentSet, max_retries: u32) -> Harness {
    harness_with_store(agents, max_retries, Arc::new(MemoryCheckpointStore::new()))
}

fn harness_with_store(
    agents: AgentSet,
    max_retries: u32,
    store: Arc<dyn CheckpointStore>,
) -> Harness {
    let repository = Arc::new(MemoryRepository::new());
    let reporter = Arc::new(RecordingErrorReporter::new());
    let orchestrator = Orchestrator::new(agents, store.clone(), repository.clone())
        .with_policy(RetryPolicy::new(max_retries))
        .with_reporter(reporter.clone());
    Harness {
        orchestrator: Arc::new(orchestrator),
        store,
        repository,
        reporter,
    }
}

async fn collect(stream: impl futures::Stream<Item = ProgressEvent>) -> Vec<ProgressEvent> {
    stream.collect().await
}

fn names(events: &[ProgressEvent]) -> Vec<&str> {
    events.iter().map(|e| e.event.as_str()).collect()
}

/// Agent that cancels the run while its call is in flight, then answers
struct CancellingAgent {
    signal: CancellationToken,
    response: Value,
}

#[async_trait]
impl Agent for CancellingAgent {
    fn name(&self) -> &str {
        "dml-generator"
    }

    async fn invoke(&self, _variables: &PromptVariables) -> Result<Value> {
        self.signal.cancel();
        Ok(self.response.clone())
    }
}

#[tokio::test]
async fn test_full_run_completes() {
    let agents = Agents::happy();
    let h = harness(agents.set(), 3);

    let outcome = h
        .orchestrator
        .run(RunStart::New(request("t1")), CancellationToken::new())
        .await
        .unwrap();

    let RunOutcome::Completed(state) = outcome else {
        panic!("expected completion");
    };
    assert!(state.error.is_none());
    assert!(state.validation_report.as_ref().unwrap().passed);
    assert_eq!(state.schema["tables"]["users"]["columns"]["id"], "uuid");

    // DML attached to tc-1 only
    assert_eq!(state.testcase("tc-1").unwrap().dml_operations.len(), 1);
    assert_eq!(state.testcase("tc-2").unwrap().dml_operations.len(), 0);

    // One checkpoint per stage, ending at Completed
    assert_eq!(h.store.checkpoint_ids("t1").await.unwrap(), vec![1, 2, 3, 4, 5]);
    let latest = h.store.load_latest_checkpoint("t1").await.unwrap().unwrap();
    assert_eq!(latest.stage_cursor, StageCursor::Completed);

    // Transcript persisted alongside the state
    let transcript = h.repository.transcript("t1").await;
    assert_eq!(transcript, state.messages);
    assert!(h.reporter.captured().is_empty());
}

#[tokio::test]
async fn test_scenario_a_two_failures_then_success() {
    let agents = Agents::happy();
    let agents = Agents {
        analyst: ScriptedAgent::new("analyst")
            .with_failures(2, "model overloaded")
            .with_response(requirements()),
        ..agents
    };
    let h = harness(agents.set(), 3);

    let outcome = h
        .orchestrator
        .run(RunStart::New(request("t-a")), CancellationToken::new())
        .await
        .unwrap();

    let state = outcome.state();
    assert!(matches!(outcome, RunOutcome::Completed(_)));
    assert_eq!(state.retries(StageName::AnalyzeRequirements), 2);
    assert!(state.error.is_none());
    assert!(state.analyzed_requirements.is_some());
    assert_eq!(agents.analyst.call_count(), 3);

    // Retries do not move the cursor, so no extra checkpoints
    assert_eq!(h.store.checkpoint_ids("t-a").await.unwrap().len(), 5);

    // Each failed attempt reaches error tracking with its thread id
    let captured = h.reporter.captured();
    assert_eq!(captured.len(), 2);
    assert!(captured.iter().all(|(thread, _)| thread == "t-a"));
    assert!(captured[0].1.contains("attempt 1"));
    assert!(captured[1].1.contains("attempt 2"));
    assert!(captured[1].1.contains("model overloaded"));
}

#[tokio::test]
async fn test_retry_accounting_for_every_stage() {
    for stage in StageName::ALL {
        for k in 0..=3u32 {
            let agents = Agents::happy();
            let flaky = ScriptedAgent::new(agents.by_stage(stage).name().to_string())
                .with_failures(k as usize, "transient");
            // Move the happy response behind the failures
            let response = match stage {
                StageName::AnalyzeRequirements => requirements(),
                StageName::GenerateTestcases => testcases(),
                StageName::BuildSchema => schema_design(),
                StageName::GenerateDml => dml(),
                StageName::ValidateSchema => report(),
            };
            let flaky = flaky.with_response(response);
            let agents = match stage {
                StageName::AnalyzeRequirements => Agents { analyst: flaky, ..agents },
                StageName::GenerateTestcases => Agents { generator: flaky, ..agents },
                StageName::BuildSchema => Agents { designer: flaky, ..agents },
                StageName::GenerateDml => Agents { dml: flaky, ..agents },
                StageName::ValidateSchema => Agents { qa: flaky, ..agents },
            };

            let h = harness(agents.set(), 3);
            let thread = format!("p1-{}-{}", stage, k);
            let outcome = h
                .orchestrator
                .run(RunStart::New(request(&thread)), CancellationToken::new())
                .await
                .unwrap();

            let state = outcome.state();
            assert!(
                matches!(outcome, RunOutcome::Completed(_)),
                "{} with {} failures did not complete",
                stage,
                k
            );
            assert_eq!(state.retries(stage), k);
            assert!(state.error.is_none());
            for other in StageName::ALL.iter().filter(|s| **s != stage) {
                assert_eq!(state.retries(*other), 0);
            }
        }
    }
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_run() {
    let agents = Agents {
        analyst: ScriptedAgent::new("analyst").with_failures(2, "model overloaded"),
        ..Agents::happy()
    };
    let h = harness(agents.set(), 1);

    let outcome = h
        .orchestrator
        .run(RunStart::New(request("t-x")), CancellationToken::new())
        .await
        .unwrap();

    match &outcome {
        RunOutcome::Failed {
            error: FlowError::RetriesExhausted { attempts, .. },
            state,
        } => {
            assert_eq!(*attempts, 2);
            assert_eq!(state.retries(StageName::AnalyzeRequirements), 2);
        }
        other => panic!("expected exhausted retries, got {:?}", other),
    }

    let latest = h.store.load_latest_checkpoint("t-x").await.unwrap().unwrap();
    assert_eq!(latest.checkpoint_id, 1);
    assert!(matches!(
        latest.stage_cursor,
        StageCursor::Failed {
            stage: StageName::AnalyzeRequirements,
            ..
        }
    ));
    // Two failed attempts, then the exhausted run
    let captured = h.reporter.captured();
    assert_eq!(captured.len(), 3);
    assert!(captured.iter().all(|(thread, _)| thread == "t-x"));
    assert!(captured[2].1.contains("failed after 2 attempts"));
}

#[tokio::test]
async fn test_fatal_tool_bypasses_retry_budget() {
    let agents = Agents {
        designer: ScriptedAgent::new("schema-designer")
            .with_response(json!({"summary": "forgot the schema"})),
        ..Agents::happy()
    };
    let h = harness(agents.set(), 3);

    let outcome = h
        .orchestrator
        .run(RunStart::New(request("t-f")), CancellationToken::new())
        .await
        .unwrap();

    let RunOutcome::Failed { state, error } = outcome else {
        panic!("expected fatal failure");
    };
    assert!(error.is_fatal());
    assert_eq!(error.user_message(), "No schema provided to save");
    for stage in StageName::ALL {
        assert_eq!(state.retries(stage), 0);
    }
    assert_eq!(agents.designer.call_count(), 1);
    assert_eq!(agents.dml.call_count(), 0);

    // Last good checkpoint is the one after testcase generation
    let latest = h.store.load_latest_checkpoint("t-f").await.unwrap().unwrap();
    assert_eq!(latest.checkpoint_id, 2);
    assert_eq!(
        latest.stage_cursor,
        StageCursor::Pending {
            stage: StageName::BuildSchema
        }
    );
}

#[tokio::test]
async fn test_empty_dml_batch_is_fatal() {
    let agents = Agents {
        dml: ScriptedAgent::new("dml-generator").with_response(json!({"operations": []})),
        ..Agents::happy()
    };
    let h = harness(agents.set(), 3);

    let events = collect(
        h.orchestrator
            .clone()
            .stream(RunStart::New(request("t-d")), CancellationToken::new()),
    )
    .await;

    let tail = &events[events.len() - 2..];
    assert_eq!(tail[0], ProgressEvent::error("No DML operations provided to save"));
    assert_eq!(tail[1], ProgressEvent::end());
}

#[tokio::test]
async fn test_precondition_failure_is_immediate() {
    let agents = Agents::happy();
    let h = harness(agents.set(), 3);
    let mut req = request("t-p");
    req.message = "  ".to_string();

    let outcome = h
        .orchestrator
        .run(RunStart::New(req), CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        RunOutcome::Failed {
            error: FlowError::Precondition { .. },
            ..
        }
    ));
    assert_eq!(agents.analyst.call_count(), 0);
    assert!(h.store.checkpoint_ids("t-p").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_resume_retries_failed_stage() {
    let agents = Agents {
        analyst: ScriptedAgent::new("analyst")
            .with_failure("model overloaded")
            .with_response(requirements()),
        ..Agents::happy()
    };
    let h = harness(agents.set(), 0);

    let first = h
        .orchestrator
        .run(RunStart::New(request("t-r")), CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(first, RunOutcome::Failed { .. }));

    let resumed = h
        .orchestrator
        .run(
            RunStart::Resume {
                thread_id: "t-r".to_string(),
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let RunOutcome::Completed(state) = resumed else {
        panic!("resume did not complete");
    };
    assert_eq!(state.retries(StageName::AnalyzeRequirements), 0);
    // Transcript keeps the original request exactly once
    assert_eq!(
        state
            .messages
            .iter()
            .filter(|m| m.content == "Design a schema for users and orders")
            .count(),
        1
    );
    assert_eq!(
        h.store.checkpoint_ids("t-r").await.unwrap(),
        vec![1, 2, 3, 4, 5, 6]
    );
}

#[tokio::test]
async fn test_checkpoint_ids_strictly_increase_with_file_store() {
    let dir = tempfile::TempDir::new().unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(dir.path()));
    let h = harness_with_store(Agents::happy().set(), 3, store.clone());

    h.orchestrator
        .run(RunStart::New(request("t-file")), CancellationToken::new())
        .await
        .unwrap();

    let ids = store.checkpoint_ids("t-file").await.unwrap();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    let latest = store.load_latest_checkpoint("t-file").await.unwrap().unwrap();
    assert_eq!(Some(&latest.checkpoint_id), ids.last());

    // A second run on the same thread continues the id sequence
    let h = harness_with_store(Agents::happy().set(), 3, store.clone());
    h.orchestrator
        .run(RunStart::New(request("t-file")), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        store.checkpoint_ids("t-file").await.unwrap(),
        (1..=10).collect::<Vec<u64>>()
    );
}

#[tokio::test]
async fn test_identical_inputs_reproduce_identical_checkpoints() {
    let a = harness(Agents::happy().set(), 3);
    let b = harness(Agents::happy().set(), 3);

    for h in [&a, &b] {
        h.orchestrator
            .run(RunStart::New(request("t-same")), CancellationToken::new())
            .await
            .unwrap();
    }

    let left = a.store.load_latest_checkpoint("t-same").await.unwrap().unwrap();
    let right = b.store.load_latest_checkpoint("t-same").await.unwrap().unwrap();
    assert_eq!(
        serde_json::to_value(&left).unwrap(),
        serde_json::to_value(&right).unwrap()
    );
}

#[tokio::test]
async fn test_stream_success_has_single_trailing_end() {
    let h = harness(Agents::happy().set(), 3);
    let events = collect(
        h.orchestrator
            .clone()
            .stream(RunStart::New(request("t-s")), CancellationToken::new()),
    )
    .await;

    let kinds = names(&events);
    assert_eq!(kinds.last(), Some(&EVENT_END));
    assert_eq!(kinds.iter().filter(|k| **k == EVENT_END).count(), 1);
    assert!(!kinds.contains(&EVENT_ERROR));
    for expected in [EVENT_TESTCASES, EVENT_SCHEMA, EVENT_VALIDATION, EVENT_TOOL] {
        assert!(kinds.contains(&expected), "missing {} event", expected);
    }

    let tool_calls: Vec<_> = events
        .iter()
        .filter(|e| e.event == EVENT_TOOL)
        .map(|e| e.data["toolCallId"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(tool_calls, vec!["call-schema", "call-dml"]);
}

#[tokio::test]
async fn test_scenario_c_cancel_during_dml() {
    let signal = CancellationToken::new();
    let agents = Agents::happy();
    let set = AgentSet {
        dml_generator: Arc::new(CancellingAgent {
            signal: signal.clone(),
            response: dml(),
        }),
        ..agents.set()
    };
    let h = harness(set, 3);

    let events = collect(
        h.orchestrator
            .clone()
            .stream(RunStart::New(request("t-c")), signal.clone()),
    )
    .await;

    let tail = &events[events.len() - 2..];
    assert_eq!(tail[0], ProgressEvent::error(ABORT_MESSAGE));
    assert_eq!(tail[1], ProgressEvent::end());
    assert_eq!(agents.qa.call_count(), 0);

    // Post-schema checkpoint is still the latest and loadable
    let latest = h.store.load_latest_checkpoint("t-c").await.unwrap().unwrap();
    assert_eq!(latest.checkpoint_id, 3);
    assert_eq!(
        latest.stage_cursor,
        StageCursor::Pending {
            stage: StageName::GenerateDml
        }
    );
    assert!(!latest.run_state.schema.is_null());
    assert!(latest
        .run_state
        .generated_testcases
        .unwrap()
        .iter()
        .all(|tc| tc.dml_operations.is_empty()));
}

#[tokio::test]
async fn test_pre_cancelled_stream_runs_no_stage() {
    let agents = Agents::happy();
    let h = harness(agents.set(), 3);
    let signal = CancellationToken::new();
    signal.cancel();

    let events = collect(h.orchestrator.clone().stream(RunStart::New(request("t-0")), signal)).await;
    assert_eq!(
        events,
        vec![ProgressEvent::error(ABORT_MESSAGE), ProgressEvent::end()]
    );
    assert_eq!(agents.analyst.call_count(), 0);
}

#[tokio::test]
async fn test_scenario_b_replay_without_checkpoint() {
    let h = harness(Agents::empty().set(), 3);
    let events = collect(replay(h.store.clone(), "never-ran".to_string())).await;
    assert_eq!(
        events,
        vec![
            ProgressEvent::error(NO_CHECKPOINT_MESSAGE),
            ProgressEvent::end()
        ]
    );
}

#[tokio::test]
async fn test_replay_rederives_completed_run() {
    let agents = Agents::happy();
    let h = harness(agents.set(), 3);
    h.orchestrator
        .run(RunStart::New(request("t-rp")), CancellationToken::new())
        .await
        .unwrap();
    let calls_before = agents.analyst.call_count();

    let events = collect(replay(h.store.clone(), "t-rp".to_string())).await;
    let kinds = names(&events);
    assert_eq!(kinds.last(), Some(&EVENT_END));
    assert!(!kinds.contains(&EVENT_ERROR));
    assert!(kinds.contains(&EVENT_SCHEMA));
    assert!(kinds.contains(&EVENT_VALIDATION));
    assert_eq!(agents.analyst.call_count(), calls_before);
}

#[tokio::test]
async fn test_resume_unknown_thread_streams_error_then_end() {
    let h = harness(Agents::empty().set(), 3);
    let events = collect(h.orchestrator.clone().stream(
        RunStart::Resume {
            thread_id: "ghost".to_string(),
        },
        CancellationToken::new(),
    ))
    .await;

    assert_eq!(names(&events), vec![EVENT_ERROR, EVENT_END]);
}
