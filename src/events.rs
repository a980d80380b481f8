//! Typed lifecycle events and the broadcast bus they fan out on.
//!
//! The UI and logging collaborators subscribe; the engine only emits. A send
//! with no live subscribers is not an error, and a lagging subscriber loses
//! oldest events rather than blocking the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::feature::Scope;

/// Default broadcast capacity. Slow subscribers past this lag drop events.
const BUS_CAPACITY: usize = 256;

/// Engine lifecycle events, tagged for the wire exactly as the UI expects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    AutoModeStarted {
        scope: Scope,
        max_concurrency: usize,
    },
    AutoModeStopped {
        scope: Scope,
        running_count: usize,
    },
    AutoModeResumingFeatures {
        scope: Scope,
        feature_ids: Vec<String>,
    },
    AutoModeFeatureStart {
        feature_id: String,
    },
    AutoModeFeatureComplete {
        feature_id: String,
        passes: bool,
    },
    AutoModeError {
        feature_id: String,
        error: String,
        error_type: String,
    },
    AutoModeProgress {
        feature_id: String,
        content: String,
    },
    AutoModeTool {
        feature_id: String,
        tool: String,
    },
    AutoModePhase {
        feature_id: String,
        phase: String,
        message: String,
    },
    PlanningStarted {
        feature_id: String,
        mode: String,
        message: String,
    },
    PlanApprovalRequired {
        feature_id: String,
        plan_content: String,
        planning_mode: String,
    },
    PlanApproved {
        feature_id: String,
        has_edits: bool,
    },
    PlanAutoApproved {
        feature_id: String,
    },
    PlanRevisionRequested {
        feature_id: String,
        plan_version: u32,
    },
    AutoModeTaskStarted {
        feature_id: String,
        task_id: String,
        task_description: String,
    },
    AutoModeTaskComplete {
        feature_id: String,
        task_id: String,
        tasks_completed: u32,
        tasks_total: u32,
    },
    AutoModePhaseComplete {
        feature_id: String,
        phase_number: u32,
    },
}

impl EngineEvent {
    /// Feature id this event concerns, if any.
    pub fn feature_id(&self) -> Option<&str> {
        match self {
            Self::AutoModeStarted { .. }
            | Self::AutoModeStopped { .. }
            | Self::AutoModeResumingFeatures { .. } => None,
            Self::AutoModeFeatureStart { feature_id }
            | Self::AutoModeFeatureComplete { feature_id, .. }
            | Self::AutoModeError { feature_id, .. }
            | Self::AutoModeProgress { feature_id, .. }
            | Self::AutoModeTool { feature_id, .. }
            | Self::AutoModePhase { feature_id, .. }
            | Self::PlanningStarted { feature_id, .. }
            | Self::PlanApprovalRequired { feature_id, .. }
            | Self::PlanApproved { feature_id, .. }
            | Self::PlanAutoApproved { feature_id }
            | Self::PlanRevisionRequested { feature_id, .. }
            | Self::AutoModeTaskStarted { feature_id, .. }
            | Self::AutoModeTaskComplete { feature_id, .. }
            | Self::AutoModePhaseComplete { feature_id, .. } => Some(feature_id),
        }
    }
}

/// An emitted event with its emission timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: EngineEvent,
}

/// Publish side of the engine's event stream.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ActivityEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActivityEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. No subscribers is fine; the send result is ignored.
    pub fn emit(&self, event: EngineEvent) {
        let activity = ActivityEvent {
            timestamp: Utc::now(),
            event,
        };
        let _ = self.tx.send(activity);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
