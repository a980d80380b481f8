//! Plan approval gate: the human-in-the-loop checkpoint between planning and
//! action.
//!
//! Each pending entry holds the decision channel of the driver suspended in
//! its approval wait. Approval removes the entry and releases the driver into
//! the action phase; rejection keeps the entry, bumps the plan version, and
//! sends the driver back to planning with the reviewer's feedback.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::errors::ResolveOutcome;
use crate::events::{EngineEvent, EventBus};
use crate::feature::PlanningMode;

/// Decision delivered to the driver waiting on the gate.
///
/// Either form may carry a model override, switching the model for the
/// feature's remaining provider calls.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalDecision {
    /// Proceed to the action phase with this plan (possibly user-edited).
    Approved {
        plan: String,
        has_edits: bool,
        model: Option<String>,
    },
    /// Re-run the planning phase, folding the feedback into the prompt.
    Revise {
        feedback: Option<String>,
        model: Option<String>,
    },
}

/// A plan awaiting human approval. At most one exists per feature id.
#[derive(Debug, Clone)]
pub struct PendingPlanApproval {
    pub feature_id: String,
    pub project_path: String,
    pub plan_content: String,
    pub planning_mode: PlanningMode,
    /// Starts at 1; incremented on each revision request.
    pub plan_version: u32,
    pub created_at: DateTime<Utc>,
}

struct PendingEntry {
    approval: PendingPlanApproval,
    decision_tx: mpsc::UnboundedSender<ApprovalDecision>,
}

/// Registry of features awaiting plan approval.
pub struct ApprovalGate {
    pending: Mutex<HashMap<String, PendingEntry>>,
    bus: EventBus,
}

impl ApprovalGate {
    pub fn new(bus: EventBus) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            bus,
        }
    }

    /// Register a plan for approval and emit `plan_approval_required`.
    ///
    /// On a revision cycle the existing entry keeps its (already bumped)
    /// version; only the plan content and decision channel are replaced.
    pub async fn request_approval(
        &self,
        feature_id: &str,
        project_path: &str,
        plan_content: &str,
        planning_mode: PlanningMode,
        decision_tx: mpsc::UnboundedSender<ApprovalDecision>,
    ) {
        let mut pending = self.pending.lock().await;
        match pending.get_mut(feature_id) {
            Some(entry) => {
                entry.approval.plan_content = plan_content.to_string();
                entry.approval.created_at = Utc::now();
                entry.decision_tx = decision_tx;
            }
            None => {
                pending.insert(
                    feature_id.to_string(),
                    PendingEntry {
                        approval: PendingPlanApproval {
                            feature_id: feature_id.to_string(),
                            project_path: project_path.to_string(),
                            plan_content: plan_content.to_string(),
                            planning_mode,
                            plan_version: 1,
                            created_at: Utc::now(),
                        },
                        decision_tx,
                    },
                );
            }
        }
        drop(pending);

        debug!(feature_id, "plan approval requested");
        self.bus.emit(EngineEvent::PlanApprovalRequired {
            feature_id: feature_id.to_string(),
            plan_content: plan_content.to_string(),
            planning_mode: planning_mode.as_str().to_string(),
        });
    }

    /// Resolve a pending approval. Never returns `Err`: an unknown feature id
    /// is a structured `{ success: false }` outcome.
    pub async fn resolve(
        &self,
        feature_id: &str,
        approve: bool,
        edited_plan: Option<String>,
        feedback: Option<String>,
        model: Option<String>,
    ) -> ResolveOutcome {
        let mut pending = self.pending.lock().await;

        if approve {
            let Some(entry) = pending.remove(feature_id) else {
                return ResolveOutcome::not_found(feature_id);
            };
            let has_edits = edited_plan
                .as_deref()
                .is_some_and(|edited| edited != entry.approval.plan_content);
            let plan = edited_plan.unwrap_or(entry.approval.plan_content);
            drop(pending);

            if entry
                .decision_tx
                .send(ApprovalDecision::Approved {
                    plan,
                    has_edits,
                    model,
                })
                .is_err()
            {
                warn!(feature_id, "approved plan had no waiting driver");
            }
            self.bus.emit(EngineEvent::PlanApproved {
                feature_id: feature_id.to_string(),
                has_edits,
            });
            ResolveOutcome::ok()
        } else {
            let Some(entry) = pending.get_mut(feature_id) else {
                return ResolveOutcome::not_found(feature_id);
            };
            entry.approval.plan_version += 1;
            let plan_version = entry.approval.plan_version;
            let tx = entry.decision_tx.clone();
            drop(pending);

            if tx
                .send(ApprovalDecision::Revise {
                    feedback: feedback.clone(),
                    model,
                })
                .is_err()
            {
                warn!(feature_id, "revision request had no waiting driver");
            }
            self.bus.emit(EngineEvent::PlanRevisionRequested {
                feature_id: feature_id.to_string(),
                plan_version,
            });
            ResolveOutcome::ok()
        }
    }

    pub async fn has_pending(&self, feature_id: &str) -> bool {
        self.pending.lock().await.contains_key(feature_id)
    }

    /// Snapshot of a pending approval, for status queries.
    pub async fn get_pending(&self, feature_id: &str) -> Option<PendingPlanApproval> {
        self.pending
            .lock()
            .await
            .get(feature_id)
            .map(|e| e.approval.clone())
    }

    /// Drop a pending approval. No-op when none exists; used when a feature
    /// is stopped while awaiting approval.
    pub async fn cancel(&self, feature_id: &str) {
        if self.pending.lock().await.remove(feature_id).is_some() {
            debug!(feature_id, "pending plan approval cancelled");
        }
    }
}
