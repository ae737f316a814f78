//! Run orchestrator
//!
//! Drives the stages in order over one run state, applying the retry
//! policy, writing checkpoints after every cursor change, and reporting
//! progress as a lazy event stream that always ends with `end`.

use crate::checkpoint::CheckpointStore;
use crate::cursor::{transition, Action, StageEvent};
use crate::progress::{state_events, ProgressSink};
use crate::reporter::{ErrorReporter, TracingErrorReporter};
use crate::repository::Repository;
use crate::stages::{run_stage, AgentSet, Stage, StageContext};
use async_stream::stream;
use futures::Stream;
use schemaflow_core::fail_open::fail_open;
use schemaflow_core::{
    Checkpoint, FlowError, ProgressEvent, Result, RetryPolicy, RunRequest, RunState, StageCursor,
    StageName, TranscriptEntry,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Message of the error event emitted when a run is cancelled
pub const ABORT_MESSAGE: &str = "Request aborted";

/// How a streamed run begins
#[derive(Debug, Clone)]
pub enum RunStart {
    /// Fresh run for a request
    New(RunRequest),
    /// Continue from the latest checkpoint of a thread
    Resume { thread_id: String },
}

impl RunStart {
    pub fn thread_id(&self) -> &str {
        match self {
            Self::New(request) => &request.thread_id,
            Self::Resume { thread_id } => thread_id,
        }
    }
}

/// Final result of driving a run
#[derive(Debug)]
pub enum RunOutcome {
    Completed(RunState),
    Failed { state: RunState, error: FlowError },
    Cancelled(RunState),
}

impl RunOutcome {
    pub fn state(&self) -> &RunState {
        match self {
            Self::Completed(state) | Self::Cancelled(state) => state,
            Self::Failed { state, .. } => state,
        }
    }

    /// Error event the stream emits before `end`, if any
    pub fn terminal_event(&self) -> Option<ProgressEvent> {
        match self {
            Self::Completed(_) => None,
            Self::Failed { error, .. } => Some(ProgressEvent::error(error.user_message())),
            Self::Cancelled(_) => Some(ProgressEvent::error(ABORT_MESSAGE)),
        }
    }
}

/// Run state and cursor ready to be driven
#[derive(Debug)]
pub struct PreparedRun {
    pub state: RunState,
    pub cursor: StageCursor,
    /// Whether the state came from a checkpoint
    pub resumed: bool,
}

enum Step {
    Event(Option<ProgressEvent>),
    Done(RunOutcome),
}

pub struct Orchestrator {
    stages: BTreeMap<StageName, Arc<dyn Stage>>,
    checkpoints: Arc<dyn CheckpointStore>,
    repository: Arc<dyn Repository>,
    reporter: Arc<dyn ErrorReporter>,
    policy: RetryPolicy,
}

impl Orchestrator {
    /// Orchestrator over the default stage catalog
    pub fn new(
        agents: AgentSet,
        checkpoints: Arc<dyn CheckpointStore>,
        repository: Arc<dyn Repository>,
    ) -> Self {
        Self::with_stages(agents.into_stages(), checkpoints, repository)
    }

    /// Orchestrator over custom stage implementations
    pub fn with_stages(
        stages: Vec<Arc<dyn Stage>>,
        checkpoints: Arc<dyn CheckpointStore>,
        repository: Arc<dyn Repository>,
    ) -> Self {
        Self {
            stages: stages.into_iter().map(|s| (s.name(), s)).collect(),
            checkpoints,
            repository,
            reporter: Arc::new(TracingErrorReporter),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn checkpoints(&self) -> Arc<dyn CheckpointStore> {
        self.checkpoints.clone()
    }

    pub fn reporter(&self) -> Arc<dyn ErrorReporter> {
        self.reporter.clone()
    }

    /// Build the state and cursor a run starts from
    ///
    /// Resuming a failed cursor clears that stage's failures and retries it.
    pub async fn prepare(&self, start: RunStart, signal: CancellationToken) -> Result<PreparedRun> {
        match start {
            RunStart::New(request) => {
                let schema = self.repository.load_schema(&request.thread_id).await?;
                let state = RunState::new(&request, schema).with_signal(signal);
                self.persist_transcript(&state.thread_id, &state.messages)
                    .await;
                info!("Starting run for thread {}", state.thread_id);
                Ok(PreparedRun {
                    state,
                    cursor: StageCursor::start(),
                    resumed: false,
                })
            }
            RunStart::Resume { thread_id } => {
                let checkpoint = self
                    .checkpoints
                    .load_latest_checkpoint(&thread_id)
                    .await?
                    .ok_or_else(|| FlowError::CheckpointNotFound(thread_id.clone()))?;

                info!(
                    "Resuming thread {} from checkpoint {} ({:?})",
                    thread_id, checkpoint.checkpoint_id, checkpoint.stage_cursor
                );

                let state = checkpoint.run_state.with_signal(signal);
                let (state, cursor) = match checkpoint.stage_cursor {
                    StageCursor::Failed { stage, .. } => {
                        (state.reset_failures(stage), StageCursor::Pending { stage })
                    }
                    cursor => (state, cursor),
                };
                Ok(PreparedRun {
                    state,
                    cursor,
                    resumed: true,
                })
            }
        }
    }

    /// Prepare and drive a run without streaming its progress
    pub async fn run(&self, start: RunStart, signal: CancellationToken) -> Result<RunOutcome> {
        let prepared = self.prepare(start, signal).await?;
        Ok(self
            .execute(prepared.state, prepared.cursor, ProgressSink::discard())
            .await)
    }

    /// Drive stages from `cursor` until the run completes, fails or is cancelled
    ///
    /// Cancellation is observed before each stage and again when a stage
    /// returns; a stage result that arrives after cancellation is discarded
    /// unapplied and uncheckpointed.
    #[instrument(skip_all, fields(thread = %state.thread_id))]
    pub async fn execute(
        &self,
        mut state: RunState,
        mut cursor: StageCursor,
        sink: ProgressSink,
    ) -> RunOutcome {
        let thread_id = state.thread_id.clone();
        let signal = state.signal.clone();
        let ctx = StageContext::new(thread_id.clone(), sink.clone(), signal.clone());

        let mut next_id = match self.checkpoints.checkpoint_ids(&thread_id).await {
            Ok(ids) => ids.last().map_or(1, |id| id + 1),
            Err(e) => return self.fail(state, e),
        };

        loop {
            let stage_name = match &cursor {
                StageCursor::Pending { stage } => *stage,
                StageCursor::Completed => {
                    info!("Run complete");
                    return RunOutcome::Completed(state);
                }
                StageCursor::Failed { stage, error } => {
                    let err = FlowError::RetriesExhausted {
                        stage: stage.to_string(),
                        attempts: state.retries(*stage),
                        message: error.clone(),
                    };
                    return self.fail(state, err);
                }
            };

            if signal.is_cancelled() {
                info!("Cancelled before {}", stage_name);
                return RunOutcome::Cancelled(state);
            }

            let Some(stage) = self.stages.get(&stage_name) else {
                return self.fail(state, FlowError::StageNotRegistered(stage_name.to_string()));
            };

            debug!(
                "Running {} (failures so far: {})",
                stage_name,
                state.retries(stage_name)
            );
            let result = run_stage(stage.as_ref(), &state, &ctx).await;

            if signal.is_cancelled() {
                info!("Cancelled during {}, discarding its result", stage_name);
                return RunOutcome::Cancelled(state);
            }

            let next = match result {
                Ok(next) => next,
                Err(e) => return self.fail(state, e),
            };

            let event = match &next.error {
                None => StageEvent::Succeeded,
                Some(error) => {
                    let failures = next.retries(stage_name);
                    self.reporter.capture(
                        &thread_id,
                        &FlowError::StageAttempt {
                            stage: stage_name.to_string(),
                            attempt: failures,
                            message: error.clone(),
                        },
                    );
                    StageEvent::Failed {
                        error: error.clone(),
                        failures,
                    }
                }
            };

            sink.emit_all(state_events(Some(&state), &next));
            self.persist_transcript(&thread_id, &next.messages[state.messages.len()..])
                .await;
            state = next;

            let (new_cursor, actions) = transition(cursor, event, &self.policy);
            cursor = new_cursor;

            for action in actions {
                match action {
                    Action::LogActivity { message } => {
                        info!("{}", message);
                        sink.emit(ProgressEvent::log(stage_name, message));
                    }
                    Action::WriteCheckpoint => {
                        let checkpoint = Checkpoint::new(next_id, cursor.clone(), state.clone());
                        if let Err(e) = self
                            .checkpoints
                            .save_checkpoint(&thread_id, &checkpoint)
                            .await
                        {
                            return self.fail(state, e);
                        }
                        debug!("Wrote checkpoint {} ({:?})", next_id, cursor);
                        next_id += 1;
                    }
                    Action::RunStage(_) | Action::Terminate => {}
                }
            }
        }
    }

    /// Lazily drive a run, yielding its progress events in production order
    ///
    /// The sequence always ends with exactly one `end` event. A failed or
    /// cancelled run emits one `error` event right before it.
    pub fn stream(
        self: Arc<Self>,
        start: RunStart,
        signal: CancellationToken,
    ) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        stream! {
            let thread_id = start.thread_id().to_string();
            let prepared = match self.prepare(start, signal).await {
                Ok(prepared) => prepared,
                Err(e) => {
                    self.reporter.capture(&thread_id, &e);
                    yield ProgressEvent::error(e.user_message());
                    yield ProgressEvent::end();
                    return;
                }
            };

            if prepared.resumed {
                for event in state_events(None, &prepared.state) {
                    yield event;
                }
            }

            let (sink, mut rx) = ProgressSink::channel();
            let drive = self.execute(prepared.state, prepared.cursor, sink);
            tokio::pin!(drive);

            let mut outcome = None;
            loop {
                let step = tokio::select! {
                    biased;
                    event = rx.recv() => Step::Event(event),
                    done = &mut drive, if outcome.is_none() => Step::Done(done),
                };
                match step {
                    Step::Event(Some(event)) => yield event,
                    Step::Event(None) => break,
                    Step::Done(done) => outcome = Some(done),
                }
            }

            let outcome = match outcome {
                Some(outcome) => outcome,
                None => drive.await,
            };
            if let Some(event) = outcome.terminal_event() {
                yield event;
            }
            yield ProgressEvent::end();
        }
    }

    fn fail(&self, state: RunState, error: FlowError) -> RunOutcome {
        warn!("Run {} failed: {}", state.thread_id, error);
        self.reporter.capture(&state.thread_id, &error);
        RunOutcome::Failed { state, error }
    }

    async fn persist_transcript(&self, thread_id: &str, entries: &[TranscriptEntry]) {
        for entry in entries {
            fail_open(
                "append transcript",
                thread_id,
                self.repository.append_transcript(thread_id, entry),
            )
            .await;
        }
    }
}
