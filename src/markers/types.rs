//! Marker and task-list types extracted from agent output.

use serde::{Deserialize, Serialize};

/// Completion marker ending a planning-phase stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMarker {
    /// `[PLAN_GENERATED]` — lite mode without approval.
    PlanGenerated,
    /// `[SPEC_GENERATED]` — lite-with-approval, spec, and full modes.
    SpecGenerated,
}

impl PlanMarker {
    pub fn token(&self) -> &'static str {
        match self {
            Self::PlanGenerated => "[PLAN_GENERATED]",
            Self::SpecGenerated => "[SPEC_GENERATED]",
        }
    }
}

/// A task start/complete token observed in the action-phase stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskMarker {
    Start(String),
    Complete(String),
}

impl TaskMarker {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Start(id) | Self::Complete(id) => id,
        }
    }
}

/// One entry from a spec's fenced task list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    /// Task id, e.g. `T001`.
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// `## Phase N:` group the task appeared under, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_number: Option<u32>,
}
