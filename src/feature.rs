//! Domain types shared across the engine, plus the board store seam.
//!
//! Features are owned by the external board; the engine reads them through
//! `FeatureStore` and writes back only orchestration-relevant fields
//! (status and the approved plan).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An independent concurrency domain: one project × branch pair.
///
/// `branch: None` means the primary worktree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl Scope {
    pub fn new(project_id: impl Into<String>, branch: Option<String>) -> Self {
        Self {
            project_id: project_id.into(),
            branch,
        }
    }

    /// Primary-worktree scope for a project.
    pub fn primary(project_id: impl Into<String>) -> Self {
        Self::new(project_id, None)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.branch {
            Some(branch) => write!(f, "{}#{}", self.project_id, branch),
            None => write!(f, "{}", self.project_id),
        }
    }
}

/// How much planning the agent does before touching code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanningMode {
    /// Go straight to implementation.
    Skip,
    /// Short goal/approach/tasks plan.
    #[default]
    Lite,
    /// Full specification with GIVEN-WHEN-THEN criteria and a task list.
    Spec,
    /// Numbered spec sections plus a three-phase execution plan.
    Full,
}

impl PlanningMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Lite => "lite",
            Self::Spec => "spec",
            Self::Full => "full",
        }
    }
}

/// Board-side status of a feature. The authoritative status machine lives in
/// the board; the engine only signals transitions through the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Backlog,
    InProgress,
    WaitingApproval,
    Verified,
    Done,
    Failed,
}

impl FeatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::InProgress => "in_progress",
            Self::WaitingApproval => "waiting_approval",
            Self::Verified => "verified",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// A board feature, as read from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Pre-written spec text, if the feature already has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    #[serde(default)]
    pub planning_mode: PlanningMode,
    #[serde(default)]
    pub require_plan_approval: bool,
    /// Model selection, forwarded to the provider untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_effort: Option<String>,
    /// Branch this feature is pinned to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    pub status: FeatureStatus,
}

impl Feature {
    /// Whether this feature is eligible for admission in the given scope.
    ///
    /// Branch-pinned features only run in their branch's scope; unpinned
    /// features only run in the primary-worktree scope.
    pub fn matches_scope(&self, scope: &Scope) -> bool {
        self.branch_name == scope.branch
    }
}

/// Phase a running feature is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Planning,
    WaitingApproval,
    Action,
    Verification,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::WaitingApproval => "waiting_approval",
            Self::Action => "action",
            Self::Verification => "verification",
        }
    }
}

/// Ephemeral, engine-owned record of one in-flight feature run.
///
/// At most one exists per feature id system-wide; the per-scope count never
/// exceeds the scope's max concurrency.
#[derive(Debug, Clone, Serialize)]
pub struct RunningTask {
    pub feature_id: String,
    pub scope: Scope,
    pub phase: RunPhase,
    pub started_at: DateTime<Utc>,
    pub tasks_completed: u32,
    /// Total tasks when a spec-mode task list was parsed; `None` means
    /// unstructured execution.
    pub tasks_total: Option<u32>,
}

impl RunningTask {
    pub fn new(feature_id: impl Into<String>, scope: Scope) -> Self {
        Self {
            feature_id: feature_id.into(),
            scope,
            phase: RunPhase::Planning,
            started_at: Utc::now(),
            tasks_completed: 0,
            tasks_total: None,
        }
    }
}

/// Seam to the external board/feature store.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Backlog and in-progress features eligible for the scope, in board order.
    async fn list_eligible(&self, scope: &Scope) -> Result<Vec<Feature>>;

    /// Fetch one feature by id. `None` if it no longer exists.
    async fn get(&self, feature_id: &str) -> Result<Option<Feature>>;

    /// Signal a status transition back to the board.
    async fn update_status(&self, feature_id: &str, status: FeatureStatus) -> Result<()>;

    /// Persist the approved plan text on the feature.
    async fn save_plan(&self, feature_id: &str, plan: &str) -> Result<()>;
}
