//! Pipeline executor.
//!
//! Walks a plan strictly in order. For each step it resolves upstream
//! outputs, dispatches the step's work, stages oversized results and records
//! the outcome before moving on. Per-step state machine:
//! `pending -> running -> {succeeded | failed | skipped | cancelled}`.
//!
//! Every transition is appended to the run's event log; the plan itself is
//! recorded in full before the first step starts.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::analysis::{AnalysisError, AnalysisRunner, AnalysisScriptSpec, InlineInput};
use super::dispatcher::{DispatchError, ToolArgs, ToolCallSpec, ToolDispatcher};
use super::event_store::EventStore;
use super::payload_store::{should_stage, PayloadStore};
use super::plan::{Plan, PlanStep, RetryPolicy, StepAction, SynthesisFormat};
use super::safety::{SafetyLimits, SafetyTracker};
use crate::adapters::{CompletionOptions, InferenceClient, InferenceError, ToolOutput};
use crate::domain::{
    AnalysisResult, CallRecord, ErrorKind, Event, EventType, FinalSynthesis, ManifestEntry,
    PayloadRef, Run, RunResult, RunState, StepError, StepInput, StepOutcome, StepStatus,
    ToolCallResult,
};

/// Default inline threshold: results above 10KB are staged
pub const DEFAULT_INLINE_THRESHOLD: u64 = 10 * 1024;

/// Call id used for the output of a synthesis step
pub const SYNTHESIS_CALL_ID: &str = "synthesis";

/// Call id used when an analysis result is passed downstream
pub const ANALYSIS_CALL_ID: &str = "analysis";

const SYNTHESIS_SYSTEM: &str = "You are the synthesis editor of a research pipeline. \
Write only from the upstream results you are given. Staged payloads are referenced \
by key and size; do not invent their contents.";

const FINAL_REPORT_FORMAT: &str = r#"Respond with ONLY a JSON object, no markdown, with exactly these fields:
- "hypothesis": the finalized, testable hypothesis
- "protocol_summary": brief summary of the proposed experimental steps
- "analysis_findings": core metrics and conclusions from the analysis results
- "prior_art_reference_links": array of URLs or staged payload keys of key prior art
- "next_steps": recommended next steps for human researchers
"#;

/// What happens downstream of a step that did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Dependent steps are skipped
    Strict,

    /// Dependent steps run with `MissingUpstream` holes in their inputs
    Lenient,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Strict
    }
}

/// Executor settings
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub mode: ExecutionMode,

    /// Results larger than this many bytes are staged
    pub inline_threshold_bytes: u64,

    /// Default retry policy (steps may override)
    pub retry: RetryPolicy,

    pub limits: SafetyLimits,

    /// Where run logs are written
    pub runs_dir: PathBuf,
}

impl ExecutorOptions {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode: ExecutionMode::Strict,
            inline_threshold_bytes: DEFAULT_INLINE_THRESHOLD,
            retry: RetryPolicy::default(),
            limits: SafetyLimits::default(),
            runs_dir: runs_dir.into(),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_inline_threshold(mut self, bytes: u64) -> Self {
        self.inline_threshold_bytes = bytes;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_limits(mut self, limits: SafetyLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Result of running one step's action
#[derive(Debug, Default)]
struct StepExecution {
    status: Option<StepStatus>,
    calls: Vec<CallRecord>,
    analysis: Option<AnalysisResult>,
    synthesis: Option<FinalSynthesis>,
    error: Option<StepError>,
    staged: Vec<ManifestEntry>,
    output_bytes: u64,
}

impl StepExecution {
    fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: Some(StepStatus::Failed),
            error: Some(StepError::new(kind, message)),
            ..Default::default()
        }
    }

    fn cancelled() -> Self {
        Self {
            status: Some(StepStatus::Cancelled),
            error: Some(StepError::new(ErrorKind::Cancelled, "run cancelled")),
            ..Default::default()
        }
    }

    fn staged_bytes(&self) -> u64 {
        self.staged.iter().map(|e| e.payload.size_bytes).sum()
    }
}

/// Main plan executor
pub struct Executor {
    dispatcher: ToolDispatcher,
    store: Arc<PayloadStore>,
    analysis: AnalysisRunner,
    inference: Option<(Arc<dyn InferenceClient>, CompletionOptions)>,
    options: ExecutorOptions,
    cancel: CancellationToken,
}

impl Executor {
    /// Create a new executor
    pub fn new(
        dispatcher: ToolDispatcher,
        store: Arc<PayloadStore>,
        analysis: AnalysisRunner,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            dispatcher,
            store,
            analysis,
            inference: None,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Enable synthesis steps
    pub fn with_inference(
        mut self,
        client: Arc<dyn InferenceClient>,
        options: CompletionOptions,
    ) -> Self {
        let options = CompletionOptions {
            system: options.system.or_else(|| Some(SYNTHESIS_SYSTEM.to_string())),
            ..options
        };
        self.inference = Some((client, options));
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels the run when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Execute a plan to completion (or cancellation)
    #[instrument(skip(self, plan), fields(plan_id = %plan.id, steps = plan.len()))]
    pub async fn run(&self, plan: Plan) -> Result<RunResult> {
        plan.validate()?;
        self.options.limits.check_plan(&plan)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, mode = ?self.options.mode, "Starting run");

        let log = EventStore::open(&self.options.runs_dir, run_id).await?;

        log.append(&Event::new(
            run_id,
            None,
            EventType::RunStarted,
            format!("Run started for goal: {}", plan.goal),
            StepStatus::Running,
        ))
        .await?;

        let recorded = serde_json::to_value(&plan).context("Failed to serialize plan")?;
        log.append(
            &Event::new(
                run_id,
                None,
                EventType::PlanRecorded,
                format!("Plan {} with {} steps", plan.id, plan.len()),
                StepStatus::Pending,
            )
            .with_data(recorded),
        )
        .await?;

        let mut plan = plan;
        let mut outcomes: Vec<StepOutcome> = plan
            .steps()
            .iter()
            .map(|s| StepOutcome::pending(s.ordinal, s.intent.clone()))
            .collect();
        let mut manifest: Vec<ManifestEntry> = Vec::new();
        let mut tracker = SafetyTracker::new();
        let mut halted: Option<RunState> = None;

        for idx in 0..plan.len() {
            let step = plan.steps()[idx].clone();
            let ordinal = step.ordinal;

            if self.cancel.is_cancelled() {
                info!(step = ordinal, "Cancellation requested, not starting further steps");
                halted = Some(RunState::Cancelled);
                break;
            }

            if let Err(violation) = self.options.limits.check(&tracker) {
                let message = violation.to_string();
                error!(%message, "Safety limit reached");
                log.append(
                    &Event::new(
                        run_id,
                        Some(ordinal),
                        EventType::SafetyLimitReached,
                        format!("Safety limit reached before step {}", ordinal),
                        StepStatus::Pending,
                    )
                    .with_error(message.clone()),
                )
                .await?;
                halted = Some(RunState::SafetyLimitReached { limit: message });
                break;
            }

            let inputs = match self.resolve_inputs(&step, &outcomes) {
                Ok(inputs) => inputs,
                Err(blocking) => {
                    let listed: Vec<String> = blocking.iter().map(|b| b.to_string()).collect();
                    let message = format!("upstream step(s) {} did not succeed", listed.join(", "));
                    warn!(step = ordinal, %message, "Skipping step");

                    plan.set_status(ordinal, StepStatus::Skipped);
                    let outcome = &mut outcomes[idx];
                    outcome.status = StepStatus::Skipped;
                    outcome.error = Some(StepError::new(ErrorKind::UpstreamFailed, message.clone()));

                    log.append(
                        &Event::new(
                            run_id,
                            Some(ordinal),
                            EventType::StepSkipped,
                            format!("Step {} skipped", ordinal),
                            StepStatus::Skipped,
                        )
                        .with_error(message),
                    )
                    .await?;
                    continue;
                }
            };

            plan.set_status(ordinal, StepStatus::Running);
            outcomes[idx].status = StepStatus::Running;
            outcomes[idx].inputs = inputs.clone();

            log.append(&Event::new(
                run_id,
                Some(ordinal),
                EventType::StepStarted,
                format!("Step {} ({}): {}", ordinal, step.action.label(), step.intent),
                StepStatus::Running,
            ))
            .await?;

            let step_start = Instant::now();
            let execution = match &step.action {
                StepAction::Tools { calls } => {
                    let report = upstream_report(&step, &outcomes);
                    let calls = with_report_bodies(calls, report);
                    self.run_tool_step(&log, run_id, &step, &calls, &inputs).await?
                }
                StepAction::Analysis { script } => self.run_analysis_step(script, &inputs).await,
                StepAction::Synthesis {
                    instruction,
                    format,
                } => {
                    self.run_synthesis_step(
                        &log,
                        run_id,
                        &plan.goal,
                        &step,
                        instruction,
                        *format,
                        &inputs,
                    )
                    .await?
                }
            };
            let duration_ms = step_start.elapsed().as_millis() as u64;

            tracker.record_step(execution.output_bytes, execution.staged_bytes());
            let status = execution.status.unwrap_or(StepStatus::Failed);
            plan.set_status(ordinal, status);

            let event_type = match status {
                StepStatus::Succeeded => EventType::StepSucceeded,
                StepStatus::Cancelled => EventType::StepCancelled,
                _ => EventType::StepFailed,
            };
            let mut event = Event::new(
                run_id,
                Some(ordinal),
                event_type,
                format!("Step {} {} in {}ms", ordinal, status, duration_ms),
                status,
            )
            .with_duration(duration_ms);
            if let Some(ref err) = execution.error {
                event = event.with_error(format!("{}: {}", err.kind, err.message));
            }
            log.append(&event).await?;

            match status {
                StepStatus::Succeeded => info!(step = ordinal, duration_ms, "Step succeeded"),
                _ => warn!(
                    step = ordinal,
                    %status,
                    error = ?execution.error.as_ref().map(|e| &e.message),
                    "Step did not succeed"
                ),
            }

            manifest.extend(execution.staged);
            let outcome = &mut outcomes[idx];
            outcome.status = status;
            outcome.calls = execution.calls;
            outcome.analysis = execution.analysis;
            outcome.synthesis = execution.synthesis;
            outcome.error = execution.error;
            outcome.duration_ms = Some(duration_ms);

            if status == StepStatus::Cancelled {
                halted = Some(RunState::Cancelled);
                break;
            }
        }

        let unsuccessful = outcomes
            .iter()
            .filter(|o| matches!(o.status, StepStatus::Failed | StepStatus::Skipped))
            .count();

        let state = halted.unwrap_or(if unsuccessful == 0 {
            RunState::Completed
        } else {
            RunState::CompletedWithFailures {
                failed: unsuccessful,
            }
        });

        let (event_type, status) = match state {
            RunState::Cancelled => (EventType::RunCancelled, StepStatus::Cancelled),
            _ => (EventType::RunCompleted, StepStatus::Succeeded),
        };
        log.append(&Event::new(
            run_id,
            None,
            event_type,
            format!("Run finished: {}", state),
            status,
        ))
        .await?;

        info!(%run_id, %state, staged = manifest.len(), "Run finished");

        let analyses: BTreeMap<usize, AnalysisResult> = outcomes
            .iter()
            .filter_map(|o| o.analysis.clone().map(|a| (o.ordinal, a)))
            .collect();

        Ok(RunResult {
            run_id,
            plan_id: plan.id,
            goal: plan.goal.clone(),
            state,
            started_at,
            completed_at: Utc::now(),
            steps: outcomes,
            analyses,
            payloads: manifest,
        })
    }

    /// Reconstruct a run's state from its event log
    pub async fn get_run_status(runs_dir: &Path, run_id: Uuid) -> Result<Run> {
        let Some(store) = EventStore::open_existing(runs_dir, run_id) else {
            anyhow::bail!("Run {} not found", run_id);
        };
        let events = store.replay().await?;

        if events.is_empty() {
            anyhow::bail!("Run {} not found", run_id);
        }

        Run::from_events(&events).context("Failed to reconstruct run state")
    }

    /// List recent runs, most recent first
    pub async fn list_runs(runs_dir: &Path, limit: usize) -> Result<Vec<Run>> {
        let run_ids = EventStore::list_runs(runs_dir).await?;
        let mut runs = Vec::new();

        for run_id in run_ids {
            match Self::get_run_status(runs_dir, run_id).await {
                Ok(run) => runs.push(run),
                Err(e) => warn!(%run_id, error = %e, "Skipping unreadable run"),
            }
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);

        Ok(runs)
    }

    /// Collect upstream outputs, or the upstream ordinals that block the step
    fn resolve_inputs(
        &self,
        step: &PlanStep,
        outcomes: &[StepOutcome],
    ) -> std::result::Result<Vec<StepInput>, Vec<usize>> {
        let mut inputs = Vec::new();
        let mut blocking = Vec::new();

        for &upstream in &step.depends_on {
            let Some(outcome) = upstream.checked_sub(1).and_then(|i| outcomes.get(i)) else {
                blocking.push(upstream);
                continue;
            };

            match outcome.status {
                StepStatus::Succeeded => inputs.extend(outputs_of(outcome)),
                status if status.is_terminal() && self.options.mode == ExecutionMode::Lenient => {
                    inputs.push(StepInput::MissingUpstream { step: upstream });
                }
                _ => blocking.push(upstream),
            }
        }

        if blocking.is_empty() {
            Ok(inputs)
        } else {
            Err(blocking)
        }
    }

    /// Dispatch a step's calls, retrying transient failures
    async fn run_tool_step(
        &self,
        log: &EventStore,
        run_id: Uuid,
        step: &PlanStep,
        calls: &[ToolCallSpec],
        inputs: &[StepInput],
    ) -> Result<StepExecution> {
        let policy = step
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.options.retry.clone());

        let mut attempts: HashMap<String, u32> = HashMap::new();
        let mut finished: HashMap<String, std::result::Result<ToolOutput, DispatchError>> =
            HashMap::new();
        let mut pending: Vec<ToolCallSpec> = calls.to_vec();
        let mut attempt = 0u32;

        while !pending.is_empty() {
            attempt += 1;
            let mut results = self.dispatcher.invoke(&pending, inputs, &self.cancel).await;
            let mut retry = Vec::new();

            for call in std::mem::take(&mut pending) {
                let result = results.remove(&call.id).unwrap_or_else(|| {
                    Err(DispatchError::RemoteFailure("call produced no result".to_string()))
                });
                attempts.insert(call.id.clone(), attempt);

                match result {
                    Err(e)
                        if e.is_retryable()
                            && policy.should_retry(attempt)
                            && !self.cancel.is_cancelled() =>
                    {
                        let delay = policy.delay_for_attempt(attempt);
                        warn!(
                            step = step.ordinal,
                            call = %call.id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Tool call failed, retrying"
                        );
                        log.append(
                            &Event::new(
                                run_id,
                                Some(step.ordinal),
                                EventType::CallRetrying,
                                format!(
                                    "Call '{}' failed on attempt {}, retrying in {:?}",
                                    call.id, attempt, delay
                                ),
                                StepStatus::Running,
                            )
                            .with_call(call.id.clone())
                            .with_error(e.to_string()),
                        )
                        .await?;
                        retry.push(call);
                    }
                    other => {
                        finished.insert(call.id.clone(), other);
                    }
                }
            }

            if retry.is_empty() {
                break;
            }

            let delay = policy.delay_for_attempt(attempt);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    for call in retry {
                        finished.insert(call.id, Err(DispatchError::Cancelled));
                    }
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            pending = retry;
        }

        let mut execution = StepExecution::default();
        for call in calls {
            let result = match finished.remove(&call.id) {
                Some(Ok(output)) => {
                    execution.output_bytes += output.content.len() as u64;
                    self.stage_output(
                        log,
                        run_id,
                        step.ordinal,
                        &call.id,
                        output.content,
                        &mut execution,
                    )
                    .await?
                }
                Some(Err(e)) => ToolCallResult::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                },
                None => ToolCallResult::Failed {
                    kind: ErrorKind::RemoteFailure,
                    message: "call produced no result".to_string(),
                },
            };

            execution.calls.push(CallRecord {
                call_id: call.id.clone(),
                tool_id: call.args.tool_id().to_string(),
                required: call.required,
                attempts: attempts.get(&call.id).copied().unwrap_or(0),
                result,
            });
        }

        let (status, error) = settle(&execution.calls);
        execution.status = Some(status);
        execution.error = error;
        Ok(execution)
    }

    async fn run_analysis_step(
        &self,
        script: &AnalysisScriptSpec,
        inputs: &[StepInput],
    ) -> StepExecution {
        let mut payloads: Vec<PayloadRef> = Vec::new();
        let mut inline: Vec<InlineInput> = Vec::new();

        for input in inputs {
            match input {
                StepInput::Staged { payload, .. } => payloads.push(payload.clone()),
                StepInput::Inline {
                    step,
                    call_id,
                    text,
                } => inline.push(InlineInput {
                    step: *step,
                    call_id: call_id.clone(),
                    text: text.clone(),
                }),
                StepInput::MissingUpstream { .. } => {}
            }
        }

        match self
            .analysis
            .analyze_with_context(&payloads, &inline, script, &self.cancel)
            .await
        {
            Ok(result) => StepExecution {
                status: Some(StepStatus::Succeeded),
                analysis: Some(result),
                ..Default::default()
            },
            Err(AnalysisError::Cancelled) => StepExecution::cancelled(),
            Err(e) => {
                let message = match e.diagnostics() {
                    Some(diag) if !diag.trim().is_empty() => {
                        format!("{}; diagnostics: {}", e, diag.trim())
                    }
                    _ => e.to_string(),
                };
                StepExecution::failed(e.kind(), message)
            }
        }
    }

    async fn run_synthesis_step(
        &self,
        log: &EventStore,
        run_id: Uuid,
        goal: &str,
        step: &PlanStep,
        instruction: &str,
        format: SynthesisFormat,
        inputs: &[StepInput],
    ) -> Result<StepExecution> {
        let Some((ref client, ref options)) = self.inference else {
            return Ok(StepExecution::failed(
                ErrorKind::Configuration,
                "no inference endpoint configured for synthesis",
            ));
        };

        let mut prompt = build_synthesis_prompt(goal, instruction, inputs);
        if format == SynthesisFormat::Structured {
            prompt.push('\n');
            prompt.push_str(FINAL_REPORT_FORMAT);
        }
        if let Err(violation) = self.options.limits.validate_prompt(&prompt) {
            return Ok(StepExecution::failed(ErrorKind::SafetyLimit, violation.to_string()));
        }

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(StepExecution::cancelled()),
            res = client.complete(&prompt, options) => res,
        };

        let mut text = match response {
            Ok(text) => text,
            Err(e) => return Ok(StepExecution::failed(ErrorKind::Inference, e.to_string())),
        };

        let mut execution = StepExecution {
            output_bytes: text.len() as u64,
            ..Default::default()
        };

        if format == SynthesisFormat::Structured {
            let report = match parse_final_report(&text) {
                Ok(report) => report,
                Err(e) => {
                    warn!(step = step.ordinal, error = %e, "Final report failed validation");
                    return Ok(StepExecution::failed(ErrorKind::Inference, e.to_string()));
                }
            };
            text = serde_json::to_string_pretty(&report)?;
            execution.synthesis = Some(report);
        }

        let result = self
            .stage_output(log, run_id, step.ordinal, SYNTHESIS_CALL_ID, text, &mut execution)
            .await?;
        execution.calls.push(CallRecord {
            call_id: SYNTHESIS_CALL_ID.to_string(),
            tool_id: client.name().to_string(),
            required: true,
            attempts: 1,
            result,
        });

        let (status, error) = settle(&execution.calls);
        execution.status = Some(status);
        execution.error = error;
        Ok(execution)
    }

    /// Keep small output inline, move oversized output into the payload store
    async fn stage_output(
        &self,
        log: &EventStore,
        run_id: Uuid,
        ordinal: usize,
        call_id: &str,
        content: String,
        execution: &mut StepExecution,
    ) -> Result<ToolCallResult> {
        let size = content.len() as u64;
        if !should_stage(size, self.options.inline_threshold_bytes) {
            return Ok(ToolCallResult::Inline { text: content });
        }

        match self.store.put(content.as_bytes()).await {
            Ok(record) => {
                let reference = record.reference;
                log.append(
                    &Event::new(
                        run_id,
                        Some(ordinal),
                        EventType::PayloadStaged,
                        format!("Staged {} from call '{}'", reference, call_id),
                        StepStatus::Running,
                    )
                    .with_call(call_id)
                    .with_data(serde_json::to_value(&reference)?),
                )
                .await?;

                execution.staged.push(ManifestEntry {
                    step: ordinal,
                    call_id: call_id.to_string(),
                    payload: reference.clone(),
                });
                Ok(ToolCallResult::Staged { payload: reference })
            }
            Err(e) => {
                error!(step = ordinal, call = %call_id, error = %e, "Failed to stage payload");
                Ok(ToolCallResult::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                })
            }
        }
    }
}

/// Parse and check a structured synthesis response
pub fn parse_final_report(content: &str) -> Result<FinalSynthesis, InferenceError> {
    let trimmed = content.trim();
    let json_str = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => {
            return Err(InferenceError::Malformed(
                "no JSON object in final report".to_string(),
            ))
        }
    };

    let report: FinalSynthesis = serde_json::from_str(json_str)
        .map_err(|e| InferenceError::Malformed(format!("final report: {}", e)))?;
    report
        .validate()
        .map_err(|e| InferenceError::Malformed(format!("final report: {}", e)))?;
    Ok(report)
}

/// Most recent structured report among a step's upstream steps
fn upstream_report<'a>(
    step: &PlanStep,
    outcomes: &'a [StepOutcome],
) -> Option<&'a FinalSynthesis> {
    step.depends_on
        .iter()
        .rev()
        .filter_map(|&upstream| outcomes.get(upstream.checked_sub(1)?))
        .find_map(|outcome| outcome.synthesis.as_ref())
}

/// Fill report bodies left empty by the plan from an upstream final report
fn with_report_bodies(
    calls: &[ToolCallSpec],
    report: Option<&FinalSynthesis>,
) -> Vec<ToolCallSpec> {
    let mut calls = calls.to_vec();
    let Some(report) = report else {
        return calls;
    };
    for call in &mut calls {
        if let ToolArgs::PublishReport { body, .. } = &mut call.args {
            if body.is_none() {
                *body = Some(report.to_markdown());
            }
        }
    }
    calls
}

/// Outputs a succeeded step hands downstream
fn outputs_of(outcome: &StepOutcome) -> Vec<StepInput> {
    let mut inputs: Vec<StepInput> = outcome
        .calls
        .iter()
        .filter_map(|call| match &call.result {
            ToolCallResult::Inline { text } => Some(StepInput::Inline {
                step: outcome.ordinal,
                call_id: call.call_id.clone(),
                text: text.clone(),
            }),
            ToolCallResult::Staged { payload } => Some(StepInput::Staged {
                step: outcome.ordinal,
                call_id: call.call_id.clone(),
                payload: payload.clone(),
            }),
            ToolCallResult::Failed { .. } => None,
        })
        .collect();

    if let Some(ref analysis) = outcome.analysis {
        inputs.push(StepInput::Inline {
            step: outcome.ordinal,
            call_id: ANALYSIS_CALL_ID.to_string(),
            text: serde_json::to_string(analysis).unwrap_or_default(),
        });
    }

    inputs
}

/// Step status from its call records
fn settle(calls: &[CallRecord]) -> (StepStatus, Option<StepError>) {
    let failures: Vec<(&CallRecord, ErrorKind, &str)> = calls
        .iter()
        .filter_map(|call| match &call.result {
            ToolCallResult::Failed { kind, message } => Some((call, *kind, message.as_str())),
            _ => None,
        })
        .collect();

    let as_error = |(call, kind, message): &(&CallRecord, ErrorKind, &str)| {
        StepError::new(*kind, format!("call '{}': {}", call.call_id, message))
    };

    if let Some(cancelled) = failures.iter().find(|(_, kind, _)| *kind == ErrorKind::Cancelled) {
        return (StepStatus::Cancelled, Some(as_error(cancelled)));
    }

    if let Some(required) = failures.iter().find(|(call, _, _)| call.required) {
        return (StepStatus::Failed, Some(as_error(required)));
    }

    (StepStatus::Succeeded, None)
}

/// Build the synthesis prompt. Staged inputs appear by reference only.
pub fn build_synthesis_prompt(goal: &str, instruction: &str, inputs: &[StepInput]) -> String {
    let mut prompt = format!(
        "Research goal: {}\n\nTask: {}\n\nUpstream results:\n",
        goal, instruction
    );

    if inputs.is_empty() {
        prompt.push_str("(none)\n");
    }

    for input in inputs {
        match input {
            StepInput::Inline {
                step,
                call_id,
                text,
            } => {
                prompt.push_str(&format!("\n[step {} / {}]\n{}\n", step, call_id, text.trim()));
            }
            StepInput::Staged {
                step,
                call_id,
                payload,
            } => {
                prompt.push_str(&format!(
                    "\n[step {} / {}] staged payload {} ({} bytes), available by reference only\n",
                    step, call_id, payload.key, payload.size_bytes
                ));
            }
            StepInput::MissingUpstream { step } => {
                prompt.push_str(&format!(
                    "\n[step {}] missing: upstream step did not succeed\n",
                    step
                ));
            }
        }
    }

    prompt
}
