//! Snapshot persistence for the flow.
//!
//! Two aggregates with independent lifecycles, stored under three keys:
//! the flow snapshot (cleared by reset/expiry) and the rate-limiting state
//! (attempt counter + lockout deadline, which survive both). Keeping them
//! separate prevents a flow reset from accidentally wiping the lockout.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{FlowError, Result};
use crate::session::is_session_valid;
use crate::state::FlowState;

pub const FLOW_KEY: &str = "flow_state_v1";
pub const ATTEMPT_KEY: &str = "attempt_count";
pub const LOCK_KEY: &str = "lock_until";

/// Trait for reading/writing the persisted snapshot keys
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save_flow(&self, state: &FlowState) -> Result<()>;
    async fn load_flow(&self) -> Result<Option<FlowState>>;
    async fn save_attempt_count(&self, count: u32) -> Result<()>;
    async fn load_attempt_count(&self) -> Result<Option<u32>>;
    /// `None` removes the key; an absent key means "not locked"
    async fn save_lock_until(&self, lock_until: Option<i64>) -> Result<()>;
    async fn load_lock_until(&self) -> Result<Option<i64>>;
}

/// Write all three keys from the current state
pub async fn persist_state(store: &dyn SnapshotStore, state: &FlowState) -> Result<()> {
    store.save_flow(state).await?;
    store.save_attempt_count(state.attempt_count).await?;
    store.save_lock_until(state.lock_until).await?;
    Ok(())
}

/// Restore state from the store, revalidating session freshness.
///
/// A stored snapshot whose session is no longer valid is discarded down to
/// the step-1 defaults; the independently stored attempt counter and lockout
/// deadline are overlaid either way.
pub async fn load_state(store: &dyn SnapshotStore) -> Result<FlowState> {
    let stored = store.load_flow().await?.unwrap_or_default();
    let attempt_count = store
        .load_attempt_count()
        .await?
        .unwrap_or(stored.attempt_count);
    let lock_until = store.load_lock_until().await?.or(stored.lock_until);

    let session_ok = is_session_valid(stored.session_token.as_deref(), stored.session_expires_at);

    let mut state = if session_ok {
        stored
    } else {
        FlowState::default()
    };
    state.attempt_count = attempt_count;
    state.lock_until = lock_until;
    Ok(state)
}

/// In-memory implementation of [`SnapshotStore`]
pub struct InMemorySnapshotStore {
    entries: Arc<DashMap<String, serde_json::Value>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }
}

impl Default for InMemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save_flow(&self, state: &FlowState) -> Result<()> {
        let value = serde_json::to_value(state).map_err(|e| FlowError::Storage(e.to_string()))?;
        self.entries.insert(FLOW_KEY.to_string(), value);
        Ok(())
    }

    async fn load_flow(&self) -> Result<Option<FlowState>> {
        match self.entries.get(FLOW_KEY) {
            Some(entry) => serde_json::from_value(entry.clone())
                .map(Some)
                .map_err(|e| FlowError::Storage(e.to_string())),
            None => Ok(None),
        }
    }

    async fn save_attempt_count(&self, count: u32) -> Result<()> {
        self.entries
            .insert(ATTEMPT_KEY.to_string(), serde_json::json!(count));
        Ok(())
    }

    async fn load_attempt_count(&self) -> Result<Option<u32>> {
        Ok(self
            .entries
            .get(ATTEMPT_KEY)
            .and_then(|entry| entry.as_u64())
            .map(|count| count as u32))
    }

    async fn save_lock_until(&self, lock_until: Option<i64>) -> Result<()> {
        match lock_until {
            Some(until) => {
                self.entries
                    .insert(LOCK_KEY.to_string(), serde_json::json!(until));
            }
            None => {
                self.entries.remove(LOCK_KEY);
            }
        }
        Ok(())
    }

    async fn load_lock_until(&self) -> Result<Option<i64>> {
        Ok(self.entries.get(LOCK_KEY).and_then(|entry| entry.as_i64()))
    }
}

/// File-backed implementation of [`SnapshotStore`]: one JSON file per key
/// under a directory, standing in for the device-local profile storage.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    async fn write_key(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| FlowError::Storage(e.to_string()))?;
        let bytes =
            serde_json::to_vec_pretty(value).map_err(|e| FlowError::Storage(e.to_string()))?;
        tokio::fs::write(self.path_for(key), bytes)
            .await
            .map_err(|e| FlowError::Storage(e.to_string()))
    }

    async fn read_key(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(key);
        if !Path::new(&path).exists() {
            return Ok(None);
        }
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| FlowError::Storage(e.to_string()))?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| FlowError::Storage(e.to_string()))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save_flow(&self, state: &FlowState) -> Result<()> {
        let value = serde_json::to_value(state).map_err(|e| FlowError::Storage(e.to_string()))?;
        self.write_key(FLOW_KEY, &value).await
    }

    async fn load_flow(&self) -> Result<Option<FlowState>> {
        match self.read_key(FLOW_KEY).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| FlowError::Storage(e.to_string())),
            None => Ok(None),
        }
    }

    async fn save_attempt_count(&self, count: u32) -> Result<()> {
        self.write_key(ATTEMPT_KEY, &serde_json::json!(count)).await
    }

    async fn load_attempt_count(&self) -> Result<Option<u32>> {
        Ok(self
            .read_key(ATTEMPT_KEY)
            .await?
            .and_then(|value| value.as_u64())
            .map(|count| count as u32))
    }

    async fn save_lock_until(&self, lock_until: Option<i64>) -> Result<()> {
        match lock_until {
            Some(until) => self.write_key(LOCK_KEY, &serde_json::json!(until)).await,
            None => {
                let path = self.path_for(LOCK_KEY);
                if Path::new(&path).exists() {
                    tokio::fs::remove_file(&path)
                        .await
                        .map_err(|e| FlowError::Storage(e.to_string()))?;
                }
                Ok(())
            }
        }
    }

    async fn load_lock_until(&self) -> Result<Option<i64>> {
        Ok(self
            .read_key(LOCK_KEY)
            .await?
            .and_then(|value| value.as_i64()))
    }
}
