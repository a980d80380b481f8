//! Shared unit-test doubles: a scripted provider and an in-memory store.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::feature::{Feature, FeatureStatus, FeatureStore, PlanningMode, Scope};
use crate::provider::{AgentEvent, AgentProvider, QueryRequest};

/// Provider that replays one pre-scripted event stream per `execute_query`
/// call, in order. A hanging provider opens streams that never finish.
pub struct ScriptedProvider {
    scripts: StdMutex<VecDeque<Vec<AgentEvent>>>,
    requests: StdMutex<Vec<QueryRequest>>,
    hanging: bool,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<AgentEvent>>) -> Self {
        Self {
            scripts: StdMutex::new(scripts.into()),
            requests: StdMutex::new(Vec::new()),
            hanging: false,
        }
    }

    /// Every stream stays open until the call token is cancelled.
    pub fn hanging() -> Self {
        Self {
            scripts: StdMutex::new(VecDeque::new()),
            requests: StdMutex::new(Vec::new()),
            hanging: true,
        }
    }

    /// Requests received so far, in call order.
    pub fn recorded_requests(&self) -> Vec<QueryRequest> {
        self.requests
            .lock()
            .map(|reqs| reqs.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AgentProvider for ScriptedProvider {
    async fn execute_query(
        &self,
        request: QueryRequest,
        token: CancellationToken,
    ) -> Result<mpsc::Receiver<AgentEvent>> {
        if let Ok(mut reqs) = self.requests.lock() {
            reqs.push(request);
        }
        let (tx, rx) = mpsc::channel(64);

        if self.hanging {
            tokio::spawn(async move {
                token.cancelled().await;
                drop(tx);
            });
            return Ok(rx);
        }

        let script = self
            .scripts
            .lock()
            .map_err(|_| anyhow::anyhow!("script lock poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no script left for this call"))?;
        tokio::spawn(async move {
            for event in script {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// In-memory board store that records status transitions and saved plans.
pub struct TestStore {
    features: Mutex<Vec<Feature>>,
    status_log: Mutex<HashMap<String, Vec<FeatureStatus>>>,
    plans: Mutex<HashMap<String, String>>,
}

impl TestStore {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            features: Mutex::new(features),
            status_log: Mutex::new(HashMap::new()),
            plans: Mutex::new(HashMap::new()),
        }
    }

    pub async fn last_status(&self, feature_id: &str) -> Option<FeatureStatus> {
        self.status_log
            .lock()
            .await
            .get(feature_id)
            .and_then(|log| log.last().copied())
    }

    pub async fn status_log(&self, feature_id: &str) -> Vec<FeatureStatus> {
        self.status_log
            .lock()
            .await
            .get(feature_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn saved_plan(&self, feature_id: &str) -> Option<String> {
        self.plans.lock().await.get(feature_id).cloned()
    }
}

#[async_trait]
impl FeatureStore for TestStore {
    async fn list_eligible(&self, scope: &Scope) -> Result<Vec<Feature>> {
        Ok(self
            .features
            .lock()
            .await
            .iter()
            .filter(|f| {
                f.matches_scope(scope)
                    && matches!(f.status, FeatureStatus::Backlog | FeatureStatus::InProgress)
            })
            .cloned()
            .collect())
    }

    async fn get(&self, feature_id: &str) -> Result<Option<Feature>> {
        Ok(self
            .features
            .lock()
            .await
            .iter()
            .find(|f| f.id == feature_id)
            .cloned())
    }

    async fn update_status(&self, feature_id: &str, status: FeatureStatus) -> Result<()> {
        if let Some(feature) = self
            .features
            .lock()
            .await
            .iter_mut()
            .find(|f| f.id == feature_id)
        {
            feature.status = status;
        }
        self.status_log
            .lock()
            .await
            .entry(feature_id.to_string())
            .or_default()
            .push(status);
        Ok(())
    }

    async fn save_plan(&self, feature_id: &str, plan: &str) -> Result<()> {
        self.plans
            .lock()
            .await
            .insert(feature_id.to_string(), plan.to_string());
        Ok(())
    }
}

/// Backlog feature with the given planning configuration.
pub fn feature_with(id: &str, mode: PlanningMode, require_approval: bool) -> Feature {
    Feature {
        id: id.to_string(),
        title: format!("Feature {id}"),
        description: "Test feature".to_string(),
        spec: None,
        planning_mode: mode,
        require_plan_approval: require_approval,
        model: None,
        thinking_effort: None,
        branch_name: None,
        status: FeatureStatus::Backlog,
    }
}
