//! Per-scope bounded admission of feature runs.
//!
//! One mutex guards both the per-scope running-sets and the
//! `feature_id -> CancellationToken` registry, so admission, release, and
//! stop-feature requests can never race a slot being reused. Admission denial
//! is normal control flow (`None`), not an error.

use std::collections::{HashMap, HashSet};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::feature::Scope;

/// Default concurrency for a scope that was never configured.
pub const DEFAULT_MAX_CONCURRENCY: usize = 1;

/// Read-only snapshot of one scope's admission state.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ScopeStatus {
    pub is_running: bool,
    pub running_feature_ids: Vec<String>,
    pub max_concurrency: usize,
}

#[derive(Debug)]
struct ScopeState {
    max_concurrency: usize,
    is_running: bool,
    running: HashSet<String>,
}

impl ScopeState {
    fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            is_running: false,
            running: HashSet::new(),
        }
    }
}

#[derive(Default)]
struct AdmissionState {
    scopes: HashMap<Scope, ScopeState>,
    /// Cancellation token per running feature. A feature id is present here
    /// iff it is present in exactly one scope's running-set.
    tokens: HashMap<String, CancellationToken>,
    /// Features stopped by the user, keyed to the scope they were running in.
    /// A stopped feature is denied re-admission until its scope is started
    /// again; releasing its slot does not lift the stop.
    stopped: HashMap<String, Scope>,
}

/// Gate for feature execution, one slot pool per scope.
pub struct AdmissionController {
    state: Mutex<AdmissionState>,
}

impl AdmissionController {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AdmissionState::default()),
        }
    }

    /// Mark a scope running/not-running. Creates the scope on first use.
    /// Stopping never cancels already-admitted features; starting lifts any
    /// per-feature stops recorded for the scope.
    pub async fn set_running(&self, scope: &Scope, is_running: bool) {
        let mut state = self.state.lock().await;
        state
            .scopes
            .entry(scope.clone())
            .or_insert_with(|| ScopeState::new(DEFAULT_MAX_CONCURRENCY))
            .is_running = is_running;
        if is_running {
            state.stopped.retain(|_, s| s != scope);
        }
    }

    /// Update a scope's concurrency limit. A lower limit never preempts
    /// running features; it only throttles future admission.
    pub async fn set_max_concurrency(&self, scope: &Scope, max_concurrency: usize) {
        let mut state = self.state.lock().await;
        state
            .scopes
            .entry(scope.clone())
            .or_insert_with(|| ScopeState::new(max_concurrency))
            .max_concurrency = max_concurrency.max(1);
    }

    /// Atomically admit a feature into a scope's slot pool.
    ///
    /// Succeeds only when the scope has a free slot and the feature is not
    /// running in any scope; returns the feature's fresh cancellation token.
    pub async fn try_admit(&self, scope: &Scope, feature_id: &str) -> Option<CancellationToken> {
        let mut state = self.state.lock().await;

        // Single-run invariant, checked across all scopes.
        if state.tokens.contains_key(feature_id) {
            return None;
        }
        // A user-stopped feature stays out until its scope restarts.
        if state.stopped.contains_key(feature_id) {
            return None;
        }

        let scope_state = state
            .scopes
            .entry(scope.clone())
            .or_insert_with(|| ScopeState::new(DEFAULT_MAX_CONCURRENCY));
        if scope_state.running.len() >= scope_state.max_concurrency {
            return None;
        }

        scope_state.running.insert(feature_id.to_string());
        let token = CancellationToken::new();
        state.tokens.insert(feature_id.to_string(), token.clone());

        debug!(%scope, feature_id, "feature admitted");
        Some(token)
    }

    /// Release a feature's slot. Idempotent: unknown features are a no-op.
    pub async fn release(&self, scope: &Scope, feature_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(scope_state) = state.scopes.get_mut(scope)
            && scope_state.running.remove(feature_id)
        {
            debug!(%scope, feature_id, "feature released");
        }
        state.tokens.remove(feature_id);
    }

    /// Cancel one running feature's token and mark it stopped, so the
    /// admission loop does not pick it up again before its scope restarts.
    /// Returns false when the feature is not running. The slot itself is
    /// released by the driver's unwind path.
    pub async fn cancel_feature(&self, feature_id: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.tokens.get(feature_id) {
            Some(token) => token.cancel(),
            None => return false,
        }
        let owner = state
            .scopes
            .iter()
            .find(|(_, scope_state)| scope_state.running.contains(feature_id))
            .map(|(scope, _)| scope.clone());
        if let Some(scope) = owner {
            state.stopped.insert(feature_id.to_string(), scope);
        }
        true
    }

    /// Whether a feature currently holds a slot in any scope.
    pub async fn is_feature_running(&self, feature_id: &str) -> bool {
        self.state.lock().await.tokens.contains_key(feature_id)
    }

    /// Read-only snapshot for one scope.
    pub async fn status(&self, scope: &Scope) -> ScopeStatus {
        let state = self.state.lock().await;
        match state.scopes.get(scope) {
            Some(scope_state) => {
                let mut ids: Vec<String> = scope_state.running.iter().cloned().collect();
                ids.sort();
                ScopeStatus {
                    is_running: scope_state.is_running,
                    running_feature_ids: ids,
                    max_concurrency: scope_state.max_concurrency,
                }
            }
            None => ScopeStatus {
                is_running: false,
                running_feature_ids: Vec::new(),
                max_concurrency: DEFAULT_MAX_CONCURRENCY,
            },
        }
    }

    /// Snapshot of every known scope, for persistence.
    pub async fn snapshot(&self) -> Vec<(Scope, ScopeStatus)> {
        let state = self.state.lock().await;
        let mut scopes: Vec<(Scope, ScopeStatus)> = state
            .scopes
            .iter()
            .map(|(scope, scope_state)| {
                let mut ids: Vec<String> = scope_state.running.iter().cloned().collect();
                ids.sort();
                (
                    scope.clone(),
                    ScopeStatus {
                        is_running: scope_state.is_running,
                        running_feature_ids: ids,
                        max_concurrency: scope_state.max_concurrency,
                    },
                )
            })
            .collect();
        scopes.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
        scopes
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new()
    }
}
