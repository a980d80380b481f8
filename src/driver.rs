//! Task execution driver: runs one feature through its full phase sequence.
//!
//! `Planning -> (WaitingApproval)? -> Action -> Verification -> Done`, with
//! `Error`/`Cancelled` reachable from any state. Transitions out of planning
//! happen only on an explicit recognized marker; a stream that ends without
//! one is a hard phase failure, never a silent pass-through. The driver never
//! touches the admission table — its caller owns slot release, which happens
//! exactly once regardless of how the run ends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::approval::{ApprovalDecision, ApprovalGate};
use crate::errors::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::feature::{Feature, FeatureStatus, FeatureStore, RunPhase, RunningTask, Scope};
use crate::markers::{
    self, PlannedTask, TaskMarker, extract_phase_complete_markers, extract_task_markers,
};
use crate::prompts;
use crate::provider::{AgentEvent, AgentProvider, QueryRequest};

/// Default wall-clock ceiling per phase call.
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(1800);

/// Caller-supplied execution settings shared by all drivers in a scope.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Project (or worktree) path handed to the provider as cwd.
    pub project_path: String,
    /// Skip the verification pass entirely.
    pub skip_verification: bool,
    pub implementation_instructions: Option<String>,
    pub verification_instructions: Option<String>,
    /// Hard ceiling per phase call; the token is cancelled when it elapses.
    pub phase_timeout: Duration,
}

impl DriverConfig {
    pub fn new(project_path: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            skip_verification: false,
            implementation_instructions: None,
            verification_instructions: None,
            phase_timeout: DEFAULT_PHASE_TIMEOUT,
        }
    }
}

/// Live registry of in-flight runs, shared between drivers (writers) and the
/// orchestrator's status surface (readers).
#[derive(Clone, Default)]
pub struct RunRegistry {
    inner: Arc<Mutex<HashMap<String, RunningTask>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, task: RunningTask) {
        self.inner.lock().await.insert(task.feature_id.clone(), task);
    }

    pub async fn remove(&self, feature_id: &str) {
        self.inner.lock().await.remove(feature_id);
    }

    pub async fn get(&self, feature_id: &str) -> Option<RunningTask> {
        self.inner.lock().await.get(feature_id).cloned()
    }

    pub async fn set_phase(&self, feature_id: &str, phase: RunPhase) {
        if let Some(task) = self.inner.lock().await.get_mut(feature_id) {
            task.phase = phase;
        }
    }

    pub async fn set_tasks_total(&self, feature_id: &str, total: u32) {
        if let Some(task) = self.inner.lock().await.get_mut(feature_id) {
            task.tasks_total = Some(total);
        }
    }

    /// Bump the completed-task counter; returns `(completed, total)`.
    pub async fn record_task_complete(&self, feature_id: &str) -> (u32, u32) {
        let mut inner = self.inner.lock().await;
        match inner.get_mut(feature_id) {
            Some(task) => {
                task.tasks_completed += 1;
                (task.tasks_completed, task.tasks_total.unwrap_or(0))
            }
            None => (0, 0),
        }
    }
}

/// Outcome of a completed (non-error) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    /// Verification verdict; `true` when verification was skipped.
    pub passes: bool,
}

/// Drives one admitted feature to completion.
pub struct TaskDriver {
    feature: Feature,
    scope: Scope,
    token: CancellationToken,
    provider: Arc<dyn AgentProvider>,
    store: Arc<dyn FeatureStore>,
    gate: Arc<ApprovalGate>,
    bus: EventBus,
    runs: RunRegistry,
    config: DriverConfig,
}

impl TaskDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        feature: Feature,
        scope: Scope,
        token: CancellationToken,
        provider: Arc<dyn AgentProvider>,
        store: Arc<dyn FeatureStore>,
        gate: Arc<ApprovalGate>,
        bus: EventBus,
        runs: RunRegistry,
        config: DriverConfig,
    ) -> Self {
        Self {
            feature,
            scope,
            token,
            provider,
            store,
            gate,
            bus,
            runs,
            config,
        }
    }

    /// Run the feature's full phase sequence.
    ///
    /// The registry entry is removed on every exit path; the admission slot
    /// belongs to the caller.
    pub async fn run(mut self) -> Result<RunOutcome, EngineError> {
        let feature_id = self.feature.id.clone();
        self.runs
            .insert(RunningTask::new(&feature_id, self.scope.clone()))
            .await;

        let result = self.run_phases().await;
        self.runs.remove(&feature_id).await;
        result
    }

    async fn run_phases(&mut self) -> Result<RunOutcome, EngineError> {
        let feature_id = self.feature.id.clone();
        info!(feature_id, scope = %self.scope, "feature run starting");

        self.bus.emit(EngineEvent::AutoModeFeatureStart {
            feature_id: feature_id.clone(),
        });
        self.store
            .update_status(&feature_id, FeatureStatus::InProgress)
            .await?;

        // Planning (and approval, when required)
        let plan = self.planning_phase().await?;
        let tasks = plan
            .as_deref()
            .map(markers::parse_task_list)
            .unwrap_or_default();
        if !tasks.is_empty() {
            self.runs
                .set_tasks_total(&feature_id, tasks.len() as u32)
                .await;
        }

        // Action
        self.action_phase(plan.as_deref(), &tasks).await?;

        // Verification
        let passes = if self.config.skip_verification {
            true
        } else {
            self.verification_phase().await?
        };

        let final_status = if passes {
            FeatureStatus::Verified
        } else {
            FeatureStatus::Done
        };
        self.store.update_status(&feature_id, final_status).await?;
        self.bus.emit(EngineEvent::AutoModeFeatureComplete {
            feature_id: feature_id.clone(),
            passes,
        });
        info!(feature_id, passes, "feature run complete");
        Ok(RunOutcome { passes })
    }

    /// Planning phase, looping through approval/revision cycles until a plan
    /// is approved (or auto-approved). Skip mode returns `None`.
    async fn planning_phase(&mut self) -> Result<Option<String>, EngineError> {
        let feature_id = self.feature.id.clone();
        let mode = self.feature.planning_mode;
        let require_approval = self.feature.require_plan_approval;
        if markers::parser::expected_plan_marker(mode, require_approval).is_none() {
            return Ok(None);
        }

        let mut previous_plan: Option<String> = None;
        let mut feedback: Option<String> = None;

        loop {
            self.runs.set_phase(&feature_id, RunPhase::Planning).await;
            self.bus.emit(EngineEvent::PlanningStarted {
                feature_id: feature_id.clone(),
                mode: mode.as_str().to_string(),
                message: format!("Generating plan ({} mode)", mode.as_str()),
            });

            let prompt = prompts::build_planning_prompt(
                &self.feature,
                previous_plan.as_deref(),
                feedback.as_deref(),
            );
            let text = self.stream_phase(RunPhase::Planning, prompt, None).await?;

            // Transition requires the mode's completion marker
            if markers::extract_plan_marker(&text, mode, require_approval).is_none() {
                return Err(EngineError::PhaseParse {
                    phase: "planning".to_string(),
                });
            }

            if !require_approval {
                self.bus.emit(EngineEvent::PlanAutoApproved {
                    feature_id: feature_id.clone(),
                });
                self.store.save_plan(&feature_id, &text).await?;
                return Ok(Some(text));
            }

            match self.await_approval(&text).await? {
                ApprovalDecision::Approved {
                    plan,
                    has_edits,
                    model,
                } => {
                    debug!(feature_id, has_edits, "plan approved");
                    if let Some(model) = model {
                        self.feature.model = Some(model);
                    }
                    self.store.save_plan(&feature_id, &plan).await?;
                    self.store
                        .update_status(&feature_id, FeatureStatus::InProgress)
                        .await?;
                    return Ok(Some(plan));
                }
                ApprovalDecision::Revise {
                    feedback: fb,
                    model,
                } => {
                    if let Some(model) = model {
                        self.feature.model = Some(model);
                    }
                    previous_plan = Some(text);
                    feedback = fb;
                    self.store
                        .update_status(&feature_id, FeatureStatus::InProgress)
                        .await?;
                }
            }
        }
    }

    /// Suspend until the gate resolves the plan. The concurrency slot stays
    /// held; only this task parks.
    async fn await_approval(&self, plan: &str) -> Result<ApprovalDecision, EngineError> {
        let feature = &self.feature;
        self.runs
            .set_phase(&feature.id, RunPhase::WaitingApproval)
            .await;
        self.store
            .update_status(&feature.id, FeatureStatus::WaitingApproval)
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.gate
            .request_approval(
                &feature.id,
                &self.config.project_path,
                plan,
                feature.planning_mode,
                tx,
            )
            .await;

        tokio::select! {
            _ = self.token.cancelled() => {
                self.gate.cancel(&feature.id).await;
                Err(EngineError::Cancelled)
            }
            decision = rx.recv() => {
                decision.ok_or_else(|| EngineError::Provider("approval channel closed".to_string()))
            }
        }
    }

    async fn action_phase(
        &self,
        plan: Option<&str>,
        tasks: &[PlannedTask],
    ) -> Result<(), EngineError> {
        let feature = &self.feature;
        self.runs.set_phase(&feature.id, RunPhase::Action).await;
        self.bus.emit(EngineEvent::AutoModePhase {
            feature_id: feature.id.clone(),
            phase: RunPhase::Action.as_str().to_string(),
            message: "Implementing feature".to_string(),
        });

        let prompt = prompts::build_action_prompt(
            feature,
            plan,
            tasks,
            self.config.implementation_instructions.as_deref(),
        );

        let mut progress = TaskProgress::from_tasks(tasks);
        self.stream_phase(RunPhase::Action, prompt, Some(&mut progress))
            .await?;

        // With a structured task list, completion of every task is the
        // action phase's marker; falling short is a parse failure, not
        // success. Unstructured runs complete on clean stream end.
        if let Some(total) = progress.total
            && progress.completed < total
        {
            return Err(EngineError::PhaseParse {
                phase: "action".to_string(),
            });
        }
        Ok(())
    }

    async fn verification_phase(&self) -> Result<bool, EngineError> {
        let feature = &self.feature;
        self.runs
            .set_phase(&feature.id, RunPhase::Verification)
            .await;
        self.bus.emit(EngineEvent::AutoModePhase {
            feature_id: feature.id.clone(),
            phase: RunPhase::Verification.as_str().to_string(),
            message: "Verifying feature".to_string(),
        });

        let prompt = prompts::build_verification_prompt(
            feature,
            self.config.verification_instructions.as_deref(),
        );
        let text = self
            .stream_phase(RunPhase::Verification, prompt, None)
            .await?;
        Ok(text.contains("VERIFICATION_PASSED"))
    }

    /// Open one provider stream and drain it, accumulating text.
    ///
    /// Suspends on the channel; unwinds on cancellation, and cancels the call
    /// token on the per-phase timeout. A provider-reported error terminates
    /// the phase with a classified `EngineError`.
    async fn stream_phase(
        &self,
        phase: RunPhase,
        prompt: String,
        mut progress: Option<&mut TaskProgress>,
    ) -> Result<String, EngineError> {
        let feature = &self.feature;
        let request = QueryRequest {
            prompt,
            model: feature.model.clone(),
            thinking_effort: feature.thinking_effort.clone(),
            cwd: self.config.project_path.clone(),
        };

        let call_token = self.token.child_token();
        let mut rx = self
            .provider
            .execute_query(request, call_token.clone())
            .await?;

        let mut accumulated = String::new();
        let drain = async {
            while let Some(event) = rx.recv().await {
                match event {
                    AgentEvent::Text { text } => {
                        accumulated.push_str(&text);
                        accumulated.push('\n');
                        self.bus.emit(EngineEvent::AutoModeProgress {
                            feature_id: feature.id.clone(),
                            content: text.clone(),
                        });
                        if let Some(progress) = progress.as_deref_mut() {
                            self.observe_action_markers(&text, progress).await;
                        }
                    }
                    AgentEvent::ToolUse { name } => {
                        self.bus.emit(EngineEvent::AutoModeTool {
                            feature_id: feature.id.clone(),
                            tool: name,
                        });
                    }
                    AgentEvent::Done { is_error, message } => {
                        if is_error {
                            let message =
                                message.unwrap_or_else(|| "provider reported an error".to_string());
                            return Err(EngineError::from_provider_message(&message));
                        }
                        break;
                    }
                }
            }
            Ok(())
        };

        tokio::select! {
            _ = self.token.cancelled() => {
                debug!(feature_id = feature.id, phase = phase.as_str(), "phase cancelled");
                Err(EngineError::Cancelled)
            }
            result = tokio::time::timeout(self.config.phase_timeout, drain) => match result {
                Err(_elapsed) => {
                    call_token.cancel();
                    Err(EngineError::PhaseTimeout {
                        phase: phase.as_str().to_string(),
                        secs: self.config.phase_timeout.as_secs(),
                    })
                }
                Ok(Err(err)) => Err(err),
                Ok(Ok(())) => Ok(accumulated),
            },
        }
    }

    /// Scan one action-phase chunk for task/phase markers and emit progress
    /// events. Markers arrive whole within a text block.
    async fn observe_action_markers(&self, chunk: &str, progress: &mut TaskProgress) {
        let feature_id = &self.feature.id;
        for marker in extract_task_markers(chunk) {
            match marker {
                TaskMarker::Start(task_id) => {
                    let description = progress
                        .descriptions
                        .get(&task_id)
                        .cloned()
                        .unwrap_or_default();
                    self.bus.emit(EngineEvent::AutoModeTaskStarted {
                        feature_id: feature_id.clone(),
                        task_id,
                        task_description: description,
                    });
                }
                TaskMarker::Complete(task_id) => {
                    if !progress.completed_ids.insert(task_id.clone()) {
                        continue;
                    }
                    progress.completed += 1;
                    let (completed, total) = self.runs.record_task_complete(feature_id).await;
                    self.bus.emit(EngineEvent::AutoModeTaskComplete {
                        feature_id: feature_id.clone(),
                        task_id,
                        tasks_completed: completed,
                        tasks_total: total,
                    });
                }
            }
        }
        for phase_number in extract_phase_complete_markers(chunk) {
            self.bus.emit(EngineEvent::AutoModePhaseComplete {
                feature_id: feature_id.clone(),
                phase_number,
            });
        }
    }
}

/// Action-phase progress bookkeeping.
struct TaskProgress {
    /// Expected task count; `None` for unstructured execution.
    total: Option<u32>,
    completed: u32,
    completed_ids: std::collections::HashSet<String>,
    descriptions: HashMap<String, String>,
}

impl TaskProgress {
    fn from_tasks(tasks: &[PlannedTask]) -> Self {
        Self {
            total: (!tasks.is_empty()).then_some(tasks.len() as u32),
            completed: 0,
            completed_ids: std::collections::HashSet::new(),
            descriptions: tasks
                .iter()
                .map(|t| (t.id.clone(), t.description.clone()))
                .collect(),
        }
    }
}
