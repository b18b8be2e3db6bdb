use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::RunnerError;

pub type SessionId = String;

/// Split a `KEY=VALUE` entry. Entries without `=` or with an empty key are
/// rejected.
pub fn parse_env(entry: &str) -> Option<(&str, &str)> {
    let (key, value) = entry.split_once('=')?;
    (!key.is_empty()).then_some((key, value))
}

/// A reusable bag of environment variables shared by executions.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    envs: StdRwLock<BTreeMap<String, String>>,
    metadata: HashMap<String, String>,
}

impl Session {
    pub fn new(envs: &[String], metadata: HashMap<String, String>) -> Self {
        let session = Self {
            id: uuid::Uuid::new_v4().to_string(),
            envs: StdRwLock::new(BTreeMap::new()),
            metadata,
        };
        session.add_envs(envs);
        session
    }

    /// A session that only lives for one execution and is never registered.
    pub fn anonymous() -> Self {
        Self::new(&[], HashMap::new())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Merge `KEY=VALUE` entries, later values overriding earlier ones.
    pub fn add_envs(&self, entries: &[String]) {
        if entries.is_empty() {
            return;
        }
        let mut envs = self.envs.write().unwrap_or_else(PoisonError::into_inner);
        for entry in entries {
            match parse_env(entry) {
                Some((key, value)) => {
                    envs.insert(key.to_string(), value.to_string());
                }
                None => debug!(session_id = %self.id, entry = %entry, "skipping malformed env entry"),
            }
        }
    }

    /// Environment as `KEY=VALUE` strings, sorted by key.
    pub fn envs(&self) -> Vec<String> {
        self.env_snapshot()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect()
    }

    pub fn env_snapshot(&self) -> Vec<(String, String)> {
        self.envs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Registered sessions, in creation order.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<Vec<Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, envs: &[String], metadata: HashMap<String, String>) -> Arc<Session> {
        let session = Arc::new(Session::new(envs, metadata));
        self.sessions.write().await.push(Arc::clone(&session));
        info!(session_id = %session.id, "session created");
        session
    }

    pub async fn get(&self, id: &str) -> Result<Arc<Session>, RunnerError> {
        self.sessions
            .read()
            .await
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| RunnerError::SessionNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.clone()
    }

    pub async fn delete(&self, id: &str) -> Result<(), RunnerError> {
        let mut sessions = self.sessions.write().await;
        let idx = sessions
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| RunnerError::SessionNotFound(id.to_string()))?;
        sessions.remove(idx);
        info!(session_id = %id, "session deleted");
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
