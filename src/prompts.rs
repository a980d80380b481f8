//! Prompt assembly for the driver's phases.
//!
//! The planning-phase prefix depends on the feature's planning mode; every
//! non-empty prefix tells the agent to produce the structured output directly
//! instead of narrating its exploration first. Prompt *content quality* is
//! not this crate's concern; the templates only carry the control contract
//! (markers, section shape) the driver depends on.

use crate::feature::{Feature, PlanningMode};
use crate::markers::PlannedTask;

/// Title shown on the board for an untitled feature.
const UNTITLED: &str = "Untitled Feature";

/// Maximum title length, ellipsis included.
const TITLE_MAX: usize = 60;

const NO_NARRATION: &str =
    "Do not narrate your exploration of the codebase. Output the structured plan directly.";

/// Build the planning-phase prompt prefix for a mode.
///
/// Skip mode has no planning phase and yields an empty prefix.
pub fn planning_prefix(mode: PlanningMode, require_approval: bool) -> String {
    match mode {
        PlanningMode::Skip => String::new(),
        PlanningMode::Lite => lite_prefix(require_approval),
        PlanningMode::Spec => spec_prefix(),
        PlanningMode::Full => full_prefix(),
    }
}

fn lite_prefix(require_approval: bool) -> String {
    // With approval in the loop the plan must be a reviewable spec, so the
    // completion marker switches to [SPEC_GENERATED].
    let marker = if require_approval {
        "[SPEC_GENERATED]"
    } else {
        "[PLAN_GENERATED]"
    };
    format!(
        "# Planning (Lite Mode)\n\n\
         Before implementing, produce a short plan with these sections:\n\n\
         - **Goal**: what this feature accomplishes\n\
         - **Approach**: how you will implement it\n\
         - **Files**: files you expect to create or modify\n\
         - **Tasks**: ordered list of implementation steps\n\
         - **Risks**: anything that could go wrong\n\n\
         {}\n\n\
         End the plan with the marker {} on its own line.\n",
        NO_NARRATION, marker
    )
}

fn spec_prefix() -> String {
    format!(
        "# Planning (Spec Mode)\n\n\
         Before implementing, produce a specification with these sections:\n\n\
         - **Problem**: what is being solved and why\n\
         - **Solution**: the chosen approach\n\
         - **Acceptance Criteria**: GIVEN-WHEN-THEN scenarios covering the \
         feature's behavior\n\
         - **Implementation Tasks**: a fenced ```tasks block of checklist \
         lines in the form `- [ ] T001: <description> | File: <path>`\n\
         - **Verification**: how completion will be checked\n\n\
         During implementation, announce each task with [TASK_START:<id>] \
         before working on it and [TASK_COMPLETE:<id>] when it is done.\n\n\
         {}\n\n\
         End the specification with the marker [SPEC_GENERATED] on its own line.\n",
        NO_NARRATION
    )
}

fn full_prefix() -> String {
    format!(
        "# Planning (Full Mode)\n\n\
         Before implementing, produce a complete specification with numbered \
         sections:\n\n\
         1. Problem Statement\n\
         2. Proposed Solution\n\
         3. Acceptance Criteria (GIVEN-WHEN-THEN)\n\
         4. Implementation Tasks (fenced ```tasks block, \
         `- [ ] T001: <description> | File: <path>` lines, grouped under \
         `## Phase N:` headers)\n\
         5. Verification Strategy\n\n\
         Structure the implementation tasks into three execution phases:\n\n\
         ## Phase 1: Foundation\n\
         Types, data structures, and scaffolding.\n\n\
         ## Phase 2: Core Implementation\n\
         The feature's behavior.\n\n\
         ## Phase 3: Integration & Verification\n\
         Wiring, tests, and cleanup.\n\n\
         During implementation, announce each task with [TASK_START:<id>] and \
         [TASK_COMPLETE:<id>], and emit [PHASE_COMPLETE:<n>] after finishing \
         each phase.\n\n\
         {}\n\n\
         End the specification with the marker [SPEC_GENERATED] on its own line.\n",
        NO_NARRATION
    )
}

/// Derive a display title from a feature description.
///
/// Empty input yields a placeholder. A first line longer than 60 characters
/// is cut to exactly 60, the last three being an ellipsis marker.
pub fn extract_title(description: &str) -> String {
    let first_line = description.lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        return UNTITLED.to_string();
    }
    if first_line.chars().count() <= TITLE_MAX {
        return first_line.to_string();
    }
    let head: String = first_line.chars().take(TITLE_MAX - 3).collect();
    format!("{}...", head)
}

/// Assemble the planning-phase prompt for a feature.
///
/// Revision cycles fold the reviewer's feedback and the rejected plan into
/// the prompt so the next version addresses it.
pub fn build_planning_prompt(
    feature: &Feature,
    previous_plan: Option<&str>,
    feedback: Option<&str>,
) -> String {
    let mut prompt = planning_prefix(feature.planning_mode, feature.require_plan_approval);

    prompt.push_str(&format!("\n## Feature\n\n{}\n", feature.description));
    if let Some(spec) = &feature.spec {
        prompt.push_str(&format!("\n## Existing Spec\n\n{}\n", spec));
    }
    if let Some(previous) = previous_plan {
        prompt.push_str(&format!(
            "\n## Previous Plan (rejected)\n\n{}\n",
            previous
        ));
    }
    if let Some(feedback) = feedback {
        prompt.push_str(&format!(
            "\n## Reviewer Feedback\n\nRevise the plan to address the following:\n\n{}\n",
            feedback
        ));
    }

    prompt
}

/// Assemble the action-phase (implementation) prompt.
pub fn build_action_prompt(
    feature: &Feature,
    plan: Option<&str>,
    tasks: &[PlannedTask],
    implementation_instructions: Option<&str>,
) -> String {
    let mut prompt = format!("# Implement Feature\n\n{}\n", feature.description);

    if let Some(plan) = plan {
        prompt.push_str(&format!("\n## Approved Plan\n\n{}\n", plan));
    }
    if !tasks.is_empty() {
        prompt.push_str("\n## Tasks\n\n");
        for task in tasks {
            match &task.file_path {
                Some(path) => prompt.push_str(&format!(
                    "- {}: {} | File: {}\n",
                    task.id, task.description, path
                )),
                None => prompt.push_str(&format!("- {}: {}\n", task.id, task.description)),
            }
        }
        prompt.push_str(
            "\nAnnounce each task with [TASK_START:<id>] before working on it and \
             [TASK_COMPLETE:<id>] when done.\n",
        );
    }
    if let Some(instructions) = implementation_instructions {
        prompt.push_str(&format!("\n## Instructions\n\n{}\n", instructions));
    }

    prompt
}

/// Assemble the verification-phase prompt.
pub fn build_verification_prompt(
    feature: &Feature,
    verification_instructions: Option<&str>,
) -> String {
    let mut prompt = format!(
        "# Verify Feature\n\n\
         Verify that the following feature is fully implemented and working:\n\n{}\n",
        feature.description
    );
    if let Some(instructions) = verification_instructions {
        prompt.push_str(&format!("\n## Verification Steps\n\n{}\n", instructions));
    }
    prompt.push_str(
        "\nReport the outcome as VERIFICATION_PASSED or VERIFICATION_FAILED \
         with an explanation.\n",
    );
    prompt
}
