//! Auto-mode orchestrator: the engine's single entry point.
//!
//! Wires the admission controller, approval gate, run registry, event bus,
//! and state file together. Each started scope gets a supervisory loop that
//! polls the board for eligible features and spawns one driver per admission
//! grant. The spawn wrapper owns slot release: it runs on every exit path,
//! exactly once, whether the driver completed, failed, or was cancelled.

pub mod state;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionController, ScopeStatus};
use crate::approval::{ApprovalGate, PendingPlanApproval};
use crate::driver::{DriverConfig, RunRegistry, TaskDriver};
use crate::errors::ResolveOutcome;
use crate::events::{ActivityEvent, EngineEvent, EventBus};
use crate::feature::{Feature, FeatureStatus, FeatureStore, RunningTask, Scope};
use crate::provider::AgentProvider;

use state::{PersistedScope, PersistedState, ScopeSettings, StateFile};

/// Default board poll interval for the supervisory loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Engine façade. Cheap to clone via `Arc`; all public operations take
/// `&self` and are safe to call concurrently.
pub struct AutoOrchestrator {
    provider: Arc<dyn AgentProvider>,
    store: Arc<dyn FeatureStore>,
    bus: EventBus,
    gate: Arc<ApprovalGate>,
    admission: AdmissionController,
    runs: RunRegistry,
    state: StateFile,
    settings: Mutex<HashMap<Scope, ScopeSettings>>,
    poll_interval: Duration,
}

impl AutoOrchestrator {
    pub fn new(
        provider: Arc<dyn AgentProvider>,
        store: Arc<dyn FeatureStore>,
        state: StateFile,
    ) -> Arc<Self> {
        let bus = EventBus::new();
        Arc::new(Self {
            provider,
            store,
            gate: Arc::new(ApprovalGate::new(bus.clone())),
            bus,
            admission: AdmissionController::new(),
            runs: RunRegistry::new(),
            state,
            settings: Mutex::new(HashMap::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(
        provider: Arc<dyn AgentProvider>,
        store: Arc<dyn FeatureStore>,
        state: StateFile,
        poll_interval: Duration,
    ) -> Arc<Self> {
        let bus = EventBus::new();
        Arc::new(Self {
            provider,
            store,
            gate: Arc::new(ApprovalGate::new(bus.clone())),
            bus,
            admission: AdmissionController::new(),
            runs: RunRegistry::new(),
            state,
            settings: Mutex::new(HashMap::new()),
            poll_interval,
        })
    }

    /// Event stream for UI and logging subscribers.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ActivityEvent> {
        self.bus.subscribe()
    }

    /// Start auto mode for a scope. Returns immediately; admission happens in
    /// the spawned supervisory loop. Starting an already-running scope only
    /// updates its settings.
    pub async fn start(self: &Arc<Self>, scope: Scope, settings: ScopeSettings) -> Result<()> {
        let max_concurrency = settings.max_concurrency;
        let already_running = self.admission.status(&scope).await.is_running;

        self.settings
            .lock()
            .await
            .insert(scope.clone(), settings);
        self.admission
            .set_max_concurrency(&scope, max_concurrency)
            .await;
        self.admission.set_running(&scope, true).await;
        self.persist().await;

        self.bus.emit(EngineEvent::AutoModeStarted {
            scope: scope.clone(),
            max_concurrency,
        });
        info!(%scope, max_concurrency, "auto mode started");

        if !already_running {
            self.spawn_scope_loop(scope);
        }
        Ok(())
    }

    /// Stop future admission for a scope. Features already running keep
    /// their slots and finish; returns how many are still in flight.
    pub async fn stop(&self, scope: &Scope) -> usize {
        self.admission.set_running(scope, false).await;
        self.persist().await;

        let running_count = self
            .admission
            .status(scope)
            .await
            .running_feature_ids
            .len();
        self.bus.emit(EngineEvent::AutoModeStopped {
            scope: scope.clone(),
            running_count,
        });
        info!(%scope, running_count, "auto mode stopped");
        running_count
    }

    /// Cancel one running feature's token. The driver unwinds cooperatively
    /// and releases its slot on the way out. Returns false when the feature
    /// is not running.
    pub async fn stop_feature(&self, feature_id: &str) -> bool {
        let cancelled = self.admission.cancel_feature(feature_id).await;
        if cancelled {
            info!(feature_id, "feature stop requested");
        }
        cancelled
    }

    /// Update a scope's concurrency limit without preempting running features.
    pub async fn set_max_concurrency(&self, scope: &Scope, max_concurrency: usize) {
        self.admission
            .set_max_concurrency(scope, max_concurrency)
            .await;
        if let Some(settings) = self.settings.lock().await.get_mut(scope) {
            settings.max_concurrency = max_concurrency.max(1);
        }
        self.persist().await;
    }

    pub async fn status(&self, scope: &Scope) -> ScopeStatus {
        self.admission.status(scope).await
    }

    /// Snapshot of one in-flight run, if any.
    pub async fn running_task(&self, feature_id: &str) -> Option<RunningTask> {
        self.runs.get(feature_id).await
    }

    pub async fn resolve_plan_approval(
        &self,
        feature_id: &str,
        approve: bool,
        edited_plan: Option<String>,
        feedback: Option<String>,
        model: Option<String>,
    ) -> ResolveOutcome {
        self.gate
            .resolve(feature_id, approve, edited_plan, feedback, model)
            .await
    }

    pub async fn has_pending_approval(&self, feature_id: &str) -> bool {
        self.gate.has_pending(feature_id).await
    }

    pub async fn pending_approval(&self, feature_id: &str) -> Option<PendingPlanApproval> {
        self.gate.get_pending(feature_id).await
    }

    pub async fn cancel_plan_approval(&self, feature_id: &str) {
        self.gate.cancel(feature_id).await;
    }

    /// Restore scopes persisted as running and restart their loops.
    ///
    /// Features that held slots at shutdown restart from the planning phase;
    /// no mid-phase state survives a restart.
    pub async fn resume(self: &Arc<Self>) -> Result<()> {
        let persisted = self.state.load().await?;

        for record in persisted.scopes {
            {
                let mut settings = self.settings.lock().await;
                settings.insert(record.scope.clone(), record.settings.clone());
            }
            self.admission
                .set_max_concurrency(&record.scope, record.settings.max_concurrency)
                .await;

            if !record.is_running {
                continue;
            }
            self.admission.set_running(&record.scope, true).await;

            // A feature interrupted while its plan waited for approval was
            // left in WaitingApproval on the board, which the eligibility
            // scan skips. Move it back so the loop can re-admit it.
            for feature_id in &record.running_feature_ids {
                match self.store.get(feature_id).await {
                    Ok(Some(feature)) if feature.status == FeatureStatus::WaitingApproval => {
                        if let Err(err) = self
                            .store
                            .update_status(feature_id, FeatureStatus::InProgress)
                            .await
                        {
                            warn!(feature_id, error = %err, "failed to reset interrupted feature");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(feature_id, error = %err, "failed to load interrupted feature");
                    }
                }
            }

            if !record.running_feature_ids.is_empty() {
                info!(
                    scope = %record.scope,
                    features = record.running_feature_ids.len(),
                    "resuming interrupted features"
                );
                self.bus.emit(EngineEvent::AutoModeResumingFeatures {
                    scope: record.scope.clone(),
                    feature_ids: record.running_feature_ids.clone(),
                });
            }
            self.spawn_scope_loop(record.scope);
        }
        Ok(())
    }

    fn spawn_scope_loop(self: &Arc<Self>, scope: Scope) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(%scope, "supervisory loop started");

            loop {
                ticker.tick().await;
                if !this.admission.status(&scope).await.is_running {
                    break;
                }
                if let Err(err) = this.admit_eligible(&scope).await {
                    warn!(%scope, error = %err, "board poll failed");
                }
            }
            debug!(%scope, "supervisory loop exited");
        });
    }

    /// One poll: admit eligible features in board order until the scope's
    /// slots are exhausted.
    async fn admit_eligible(self: &Arc<Self>, scope: &Scope) -> Result<()> {
        let eligible = self.store.list_eligible(scope).await?;
        for feature in eligible {
            let Some(token) = self.admission.try_admit(scope, &feature.id).await else {
                continue;
            };
            self.persist().await;
            self.spawn_feature(feature, scope.clone(), token);
        }
        Ok(())
    }

    fn spawn_feature(self: &Arc<Self>, feature: Feature, scope: Scope, token: CancellationToken) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let feature_id = feature.id.clone();
            let config = this.driver_config(&scope).await;
            let driver = TaskDriver::new(
                feature,
                scope.clone(),
                token,
                Arc::clone(&this.provider),
                Arc::clone(&this.store),
                Arc::clone(&this.gate),
                this.bus.clone(),
                this.runs.clone(),
                config,
            );

            let result = driver.run().await;

            // Release exactly once, on every exit path.
            this.admission.release(&scope, &feature_id).await;
            this.persist().await;

            if let Err(err) = result {
                if err.is_user_visible() {
                    this.bus.emit(EngineEvent::AutoModeError {
                        feature_id: feature_id.clone(),
                        error: err.to_string(),
                        error_type: err.kind().to_string(),
                    });
                    warn!(feature_id, error = %err, "feature run failed");
                    if let Err(store_err) = this
                        .store
                        .update_status(&feature_id, FeatureStatus::Failed)
                        .await
                    {
                        warn!(feature_id, error = %store_err, "failed to mark feature failed");
                    }
                } else {
                    // Stopped by user: the feature stays where the board had
                    // it. The stop is reported to the activity stream, not as
                    // an error.
                    this.bus.emit(EngineEvent::AutoModePhase {
                        feature_id: feature_id.clone(),
                        phase: "stopped".to_string(),
                        message: "Stopped by user".to_string(),
                    });
                    info!(feature_id, "feature run stopped");
                }
            }
        });
    }

    async fn driver_config(&self, scope: &Scope) -> DriverConfig {
        let settings = self.settings.lock().await;
        match settings.get(scope) {
            Some(s) => {
                let mut config = DriverConfig::new(s.project_path.clone());
                config.skip_verification = s.skip_verification;
                config.implementation_instructions = s.implementation_instructions.clone();
                config.verification_instructions = s.verification_instructions.clone();
                config
            }
            None => DriverConfig::new("."),
        }
    }

    /// Persist the current scope snapshot. Write failures are logged and
    /// never fail the engine.
    async fn persist(&self) {
        let snapshot = self.admission.snapshot().await;
        let settings = self.settings.lock().await;

        let scopes = snapshot
            .into_iter()
            .filter_map(|(scope, status)| {
                let settings = settings.get(&scope)?.clone();
                Some(PersistedScope {
                    scope,
                    is_running: status.is_running,
                    settings,
                    running_feature_ids: status.running_feature_ids,
                })
            })
            .collect();
        drop(settings);

        if let Err(err) = self.state.save(&PersistedState { scopes }).await {
            warn!(error = %err, "failed to persist engine state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::PlanningMode;
    use crate::provider::AgentEvent;
    use crate::testing::{ScriptedProvider, TestStore, feature_with};

    fn settings(max_concurrency: usize) -> ScopeSettings {
        ScopeSettings {
            project_path: "/tmp/proj".to_string(),
            max_concurrency,
            skip_verification: true,
            implementation_instructions: None,
            verification_instructions: None,
        }
    }

    fn text(s: &str) -> AgentEvent {
        AgentEvent::Text {
            text: s.to_string(),
        }
    }

    fn done() -> AgentEvent {
        AgentEvent::Done {
            is_error: false,
            message: None,
        }
    }

    fn orchestrator(
        features: Vec<crate::feature::Feature>,
        provider: ScriptedProvider,
        state_path: std::path::PathBuf,
    ) -> (Arc<AutoOrchestrator>, Arc<TestStore>) {
        let store = Arc::new(TestStore::new(features));
        let orchestrator = AutoOrchestrator::with_poll_interval(
            Arc::new(provider),
            store.clone(),
            StateFile::new(state_path),
            Duration::from_millis(10),
        );
        (orchestrator, store)
    }

    async fn wait_status(store: &TestStore, feature_id: &str, expected: FeatureStatus) {
        for _ in 0..200 {
            if store.last_status(feature_id).await == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("feature {feature_id} never reached {expected:?}");
    }

    async fn wait_running_count(orchestrator: &AutoOrchestrator, scope: &Scope, count: usize) {
        for _ in 0..200 {
            if orchestrator.status(scope).await.running_feature_ids.len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("scope {scope} never reached {count} running features");
    }

    async fn wait_task_presence(orchestrator: &AutoOrchestrator, feature_id: &str, present: bool) {
        for _ in 0..200 {
            if orchestrator.running_task(feature_id).await.is_some() == present {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run registry never reached presence={present} for {feature_id}");
    }

    #[tokio::test]
    async fn start_runs_backlog_feature_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let feature = feature_with("f1", PlanningMode::Skip, false);
        let provider = ScriptedProvider::new(vec![vec![text("implementing"), done()]]);
        let (orchestrator, store) =
            orchestrator(vec![feature], provider, dir.path().join("state.json"));

        let scope = Scope::primary("proj");
        orchestrator.start(scope.clone(), settings(1)).await.unwrap();

        wait_status(&store, "f1", FeatureStatus::Verified).await;
        wait_running_count(&orchestrator, &scope, 0).await;
    }

    #[tokio::test]
    async fn stop_prevents_new_admission() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![]);
        let (orchestrator, store) = orchestrator(
            Vec::new(),
            provider,
            dir.path().join("state.json"),
        );

        let scope = Scope::primary("proj");
        orchestrator.start(scope.clone(), settings(1)).await.unwrap();
        let still_running = orchestrator.stop(&scope).await;
        assert_eq!(still_running, 0);
        assert!(!orchestrator.status(&scope).await.is_running);

        // Nothing gets picked up after stop
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.status_log("f1").await.is_empty());
    }

    #[tokio::test]
    async fn failed_feature_is_marked_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let feature = feature_with("f1", PlanningMode::Lite, false);
        // Planning stream without a marker: hard phase failure
        let provider = ScriptedProvider::new(vec![vec![text("no marker here"), done()]]);
        let (orchestrator, store) =
            orchestrator(vec![feature], provider, dir.path().join("state.json"));
        let mut events = orchestrator.subscribe();

        let scope = Scope::primary("proj");
        orchestrator.start(scope.clone(), settings(1)).await.unwrap();

        wait_status(&store, "f1", FeatureStatus::Failed).await;

        let mut saw_error = false;
        while let Ok(activity) = events.try_recv() {
            if let EngineEvent::AutoModeError { error_type, .. } = activity.event {
                assert_eq!(error_type, "execution");
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn stop_feature_cancels_without_failing_it() {
        let dir = tempfile::tempdir().unwrap();
        let feature = feature_with("f1", PlanningMode::Skip, false);
        let provider = ScriptedProvider::hanging();
        let (orchestrator, store) =
            orchestrator(vec![feature], provider, dir.path().join("state.json"));
        let mut events = orchestrator.subscribe();

        let scope = Scope::primary("proj");
        orchestrator.start(scope.clone(), settings(1)).await.unwrap();

        wait_task_presence(&orchestrator, "f1", true).await;
        assert!(orchestrator.stop_feature("f1").await);
        wait_task_presence(&orchestrator, "f1", false).await;

        // The board still shows InProgress, but the poll loop must not pick
        // the feature up again while the stop stands.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.last_status("f1").await, Some(FeatureStatus::InProgress));
        assert!(orchestrator.running_task("f1").await.is_none());
        assert!(
            orchestrator
                .status(&scope)
                .await
                .running_feature_ids
                .is_empty()
        );
        assert!(!orchestrator.stop_feature("f1").await);

        // The stop surfaces on the activity stream, never as an error
        let mut saw_stopped = false;
        while let Ok(activity) = events.try_recv() {
            match activity.event {
                EngineEvent::AutoModePhase { feature_id, phase, .. } => {
                    if feature_id == "f1" && phase == "stopped" {
                        saw_stopped = true;
                    }
                }
                EngineEvent::AutoModeError { error, .. } => {
                    panic!("user stop reported as error: {error}");
                }
                _ => {}
            }
        }
        assert!(saw_stopped);

        // Starting the scope again lifts the stop
        orchestrator.start(scope.clone(), settings(1)).await.unwrap();
        wait_task_presence(&orchestrator, "f1", true).await;
        orchestrator.stop(&scope).await;
        orchestrator.stop_feature("f1").await;
    }

    #[tokio::test]
    async fn resume_restores_running_scope() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");

        // Seed a state file describing a scope that was running with one
        // feature in flight when the process died.
        let seeded = PersistedState {
            scopes: vec![PersistedScope {
                scope: Scope::primary("proj"),
                is_running: true,
                settings: settings(2),
                running_feature_ids: vec!["f1".to_string()],
            }],
        };
        StateFile::new(&state_path).save(&seeded).await.unwrap();

        let mut feature = feature_with("f1", PlanningMode::Skip, false);
        feature.status = FeatureStatus::InProgress;
        let provider = ScriptedProvider::new(vec![vec![text("implementing"), done()]]);
        let (orchestrator, store) = orchestrator(vec![feature], provider, state_path);
        let mut events = orchestrator.subscribe();

        orchestrator.resume().await.unwrap();

        wait_status(&store, "f1", FeatureStatus::Verified).await;

        let mut resumed_ids = None;
        while let Ok(activity) = events.try_recv() {
            if let EngineEvent::AutoModeResumingFeatures { feature_ids, .. } = activity.event {
                resumed_ids = Some(feature_ids);
                break;
            }
        }
        assert_eq!(resumed_ids, Some(vec!["f1".to_string()]));
    }

    /// A feature interrupted mid-approval is persisted as running but its
    /// board status is WaitingApproval, which the eligibility scan skips.
    /// Resume must move it back so it gets re-admitted.
    #[tokio::test]
    async fn resume_restarts_feature_stranded_in_waiting_approval() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        let seeded = PersistedState {
            scopes: vec![PersistedScope {
                scope: Scope::primary("proj"),
                is_running: true,
                settings: settings(1),
                running_feature_ids: vec!["f1".to_string()],
            }],
        };
        StateFile::new(&state_path).save(&seeded).await.unwrap();

        let mut feature = feature_with("f1", PlanningMode::Spec, true);
        feature.status = FeatureStatus::WaitingApproval;
        let provider = ScriptedProvider::new(vec![
            vec![text("plan\n[SPEC_GENERATED]"), done()],
            vec![text("implementing"), done()],
        ]);
        let (orchestrator, store) = orchestrator(vec![feature], provider, state_path);

        orchestrator.resume().await.unwrap();

        // The restarted run plans again and parks on a fresh approval
        for _ in 0..200 {
            if orchestrator.has_pending_approval("f1").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(orchestrator.has_pending_approval("f1").await);

        let outcome = orchestrator
            .resolve_plan_approval("f1", true, None, None, None)
            .await;
        assert!(outcome.success);
        wait_status(&store, "f1", FeatureStatus::Verified).await;
    }

    #[tokio::test]
    async fn resume_skips_scopes_persisted_as_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        let seeded = PersistedState {
            scopes: vec![PersistedScope {
                scope: Scope::primary("proj"),
                is_running: false,
                settings: settings(3),
                running_feature_ids: Vec::new(),
            }],
        };
        StateFile::new(&state_path).save(&seeded).await.unwrap();

        let provider = ScriptedProvider::new(vec![]);
        let (orchestrator, _store) = orchestrator(Vec::new(), provider, state_path);
        orchestrator.resume().await.unwrap();

        let scope = Scope::primary("proj");
        let status = orchestrator.status(&scope).await;
        assert!(!status.is_running);
        // Settings survive: concurrency restored even though the scope stays stopped
        assert_eq!(status.max_concurrency, 3);
    }

    #[tokio::test]
    async fn approval_delegation_reports_unknown_feature() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![]);
        let (orchestrator, _store) = orchestrator(
            Vec::new(),
            provider,
            dir.path().join("state.json"),
        );

        let outcome = orchestrator
            .resolve_plan_approval("ghost", true, None, None, None)
            .await;
        assert!(!outcome.success);
        assert!(!orchestrator.has_pending_approval("ghost").await);
    }

    #[tokio::test]
    async fn concurrency_limit_is_honored_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        // Two features, one slot, each hangs until cancelled
        let features = vec![
            feature_with("f1", PlanningMode::Skip, false),
            feature_with("f2", PlanningMode::Skip, false),
        ];
        let provider = ScriptedProvider::hanging();
        let (orchestrator, _store) =
            orchestrator(features, provider, dir.path().join("state.json"));

        let scope = Scope::primary("proj");
        orchestrator.start(scope.clone(), settings(1)).await.unwrap();

        wait_running_count(&orchestrator, &scope, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            orchestrator.status(&scope).await.running_feature_ids.len(),
            1
        );

        // Stop the scope, cancel the held feature, and observe the slot free
        let first = orchestrator
            .status(&scope)
            .await
            .running_feature_ids
            .remove(0);
        orchestrator.stop(&scope).await;
        orchestrator.stop_feature(&first).await;
        wait_running_count(&orchestrator, &scope, 0).await;

        // Restarting admits again into the freed slot
        orchestrator.start(scope.clone(), settings(1)).await.unwrap();
        wait_running_count(&orchestrator, &scope, 1).await;
        orchestrator.stop(&scope).await;
    }
}
