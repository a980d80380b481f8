//! Autonomous task orchestration for AI coding agents.
//!
//! The engine drains a kanban-style feature board by driving each feature
//! through a planning, approval, action, and verification pipeline against an
//! agent provider. Concurrency is bounded per project-and-branch scope, plan
//! approval is an explicit human checkpoint, and every lifecycle transition is
//! published on a broadcast event bus. Scope state is persisted so interrupted
//! features restart from planning after a process restart.
//!
//! [`orchestrator::AutoOrchestrator`] is the entry point; everything else is
//! wiring it exposes for embedding.

pub mod admission;
pub mod approval;
pub mod driver;
pub mod errors;
pub mod events;
pub mod feature;
pub mod markers;
pub mod orchestrator;
pub mod prompts;
pub mod provider;

#[cfg(test)]
mod testing;

pub use admission::{AdmissionController, ScopeStatus};
pub use approval::{ApprovalDecision, ApprovalGate, PendingPlanApproval};
pub use driver::{DriverConfig, RunRegistry, TaskDriver};
pub use errors::{EngineError, ResolveOutcome};
pub use events::{ActivityEvent, EngineEvent, EventBus};
pub use feature::{Feature, FeatureStatus, FeatureStore, PlanningMode, RunPhase, RunningTask, Scope};
pub use orchestrator::AutoOrchestrator;
pub use orchestrator::state::{ScopeSettings, StateFile};
pub use provider::{AgentEvent, AgentProvider, QueryRequest};
