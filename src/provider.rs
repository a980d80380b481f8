//! Seam to the AI provider abstraction.
//!
//! The engine treats the provider as a black-box async generator: it hands
//! over a prompt and drains a channel of `AgentEvent`s until `Done`. Building
//! provider-specific request formats happens on the other side of this trait.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One streamed event from an in-flight provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A chunk of assistant text.
    Text { text: String },
    /// The agent invoked a tool.
    ToolUse { name: String },
    /// Terminal event. `is_error` carries provider-reported failure; the
    /// message is the provider's final result or error text.
    Done {
        is_error: bool,
        #[serde(default)]
        message: Option<String>,
    },
}

/// A single streaming query against the provider.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub thinking_effort: Option<String>,
    /// Working directory for the agent (project path or worktree path).
    pub cwd: String,
}

/// Black-box async provider of agent output.
///
/// Implementations must observe the cancellation token at their current await
/// point and close the channel promptly when it fires.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    async fn execute_query(
        &self,
        request: QueryRequest,
        token: CancellationToken,
    ) -> Result<mpsc::Receiver<AgentEvent>>;
}
