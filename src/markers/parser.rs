//! Regex extraction of plan/task markers and fenced task lists.
//!
//! Patterns recognized:
//! - `[PLAN_GENERATED]` / `[SPEC_GENERATED]` planning completion markers
//! - `[TASK_START:T001]` / `[TASK_COMPLETE:T001]` progress tokens
//! - ```` ```tasks ```` fenced blocks of `- [ ] T001: desc | File: path` lines,
//!   optionally grouped under `## Phase N:` headers

use super::types::{PlanMarker, PlannedTask, TaskMarker};
use crate::feature::PlanningMode;
use regex::Regex;
use std::sync::LazyLock;

// Compile regexes once using LazyLock
static TASK_MARKER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[TASK_(START|COMPLETE):([A-Za-z]\d+)\]").unwrap());

static TASKS_BLOCK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```tasks\s*\n(.*?)```").unwrap());

static TASK_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*-\s*\[\s?\]\s*([A-Za-z]\d+):\s*(.+?)(?:\s*\|\s*File:\s*(.+?))?\s*$").unwrap()
});

static PHASE_HEADER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^##\s*Phase\s+(\d+)\b").unwrap());

static PHASE_COMPLETE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[PHASE_COMPLETE:(\d+)\]").unwrap());

/// The completion marker a planning stream must produce for the given mode.
///
/// Skip mode has no planning phase and therefore no marker. Lite mode alone
/// ends with `[PLAN_GENERATED]`; once approval is involved, or in spec/full
/// mode, the output is a full spec and ends with `[SPEC_GENERATED]`.
pub fn expected_plan_marker(mode: PlanningMode, require_approval: bool) -> Option<PlanMarker> {
    match mode {
        PlanningMode::Skip => None,
        PlanningMode::Lite if !require_approval => Some(PlanMarker::PlanGenerated),
        PlanningMode::Lite | PlanningMode::Spec | PlanningMode::Full => {
            Some(PlanMarker::SpecGenerated)
        }
    }
}

/// Look for the mode's planning completion marker in accumulated text.
pub fn extract_plan_marker(
    text: &str,
    mode: PlanningMode,
    require_approval: bool,
) -> Option<PlanMarker> {
    let expected = expected_plan_marker(mode, require_approval)?;
    text.contains(expected.token()).then_some(expected)
}

/// Extract task start/complete markers from streamed text, in text order.
pub fn extract_task_markers(text: &str) -> Vec<TaskMarker> {
    TASK_MARKER_REGEX
        .captures_iter(text)
        .filter_map(|cap| {
            let id = cap.get(2)?.as_str().to_string();
            match cap.get(1)?.as_str() {
                "START" => Some(TaskMarker::Start(id)),
                "COMPLETE" => Some(TaskMarker::Complete(id)),
                _ => None,
            }
        })
        .collect()
}

/// Extract `[PHASE_COMPLETE:n]` markers (full planning mode), in text order.
pub fn extract_phase_complete_markers(text: &str) -> Vec<u32> {
    PHASE_COMPLETE_REGEX
        .captures_iter(text)
        .filter_map(|cap| cap.get(1)?.as_str().parse().ok())
        .collect()
}

/// Parse the fenced task list out of a generated spec.
///
/// Missing or unparseable blocks yield an empty list; the driver then falls
/// back to unstructured execution.
pub fn parse_task_list(spec_text: &str) -> Vec<PlannedTask> {
    let Some(block) = TASKS_BLOCK_REGEX
        .captures(spec_text)
        .and_then(|cap| cap.get(1))
    else {
        return Vec::new();
    };

    let mut tasks = Vec::new();
    let mut current_phase: Option<u32> = None;

    for line in block.as_str().lines() {
        if let Some(cap) = PHASE_HEADER_REGEX.captures(line) {
            current_phase = cap.get(1).and_then(|m| m.as_str().parse().ok());
            continue;
        }
        if let Some(cap) = TASK_LINE_REGEX.captures(line) {
            let (Some(id), Some(description)) = (cap.get(1), cap.get(2)) else {
                continue;
            };
            tasks.push(PlannedTask {
                id: id.as_str().to_string(),
                description: description.as_str().trim().to_string(),
                file_path: cap.get(3).map(|m| m.as_str().trim().to_string()),
                phase_number: current_phase,
            });
        }
    }

    tasks
}
