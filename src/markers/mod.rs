//! Marker extraction from streamed agent text.
//!
//! Phase transitions in the driver are marker-driven: planning completes only
//! when the agent emits its mode's completion marker, and action-phase
//! progress is tracked through task start/complete tokens.

pub mod parser;
pub mod types;

pub use parser::{
    extract_phase_complete_markers, extract_plan_marker, extract_task_markers, parse_task_list,
};
pub use types::{PlanMarker, PlannedTask, TaskMarker};
