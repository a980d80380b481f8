//! On-disk engine state, for resume-on-restart.
//!
//! A single JSON file records, per scope, whether auto mode was running, its
//! execution settings, and the features that held slots when the process went
//! down. Saves are atomic (temp file + rename) so a crash mid-write leaves
//! the previous snapshot intact.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::feature::Scope;

/// Execution settings supplied when a scope is started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeSettings {
    pub project_path: String,
    pub max_concurrency: usize,
    #[serde(default)]
    pub skip_verification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation_instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_instructions: Option<String>,
}

/// One scope's persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedScope {
    pub scope: Scope,
    pub is_running: bool,
    pub settings: ScopeSettings,
    /// Features that held slots at save time. On resume they restart from
    /// planning; no mid-phase state is carried across a restart.
    #[serde(default)]
    pub running_feature_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub scopes: Vec<PersistedScope>,
}

/// JSON state file with atomic saves.
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the persisted state. A missing file is an empty state, not an
    /// error; a corrupt file is an error the caller decides how to handle.
    pub async fn load(&self) -> Result<PersistedState> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("corrupt state file at {}", self.path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(PersistedState::default())
            }
            Err(err) => Err(err).with_context(|| {
                format!("failed to read state file at {}", self.path.display())
            }),
        }
    }

    /// Atomically replace the state file with the given snapshot.
    pub async fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await.with_context(|| {
                format!("failed to create state directory {}", parent.display())
            })?;
        }

        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;

        debug!(path = %self.path.display(), scopes = state.scopes.len(), "state saved");
        Ok(())
    }
}
