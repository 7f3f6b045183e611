/// Source registry: enabled flag, free-form config and sync bookkeeping
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::types::SourceState;

/// Result of one sync attempt, as recorded against the source
#[derive(Debug, Clone, PartialEq)]
pub enum SyncAttempt {
    Succeeded,
    Partial(String),
    Failed(String),
}

/// Registry of known sources with thread-safe access
pub struct SourceRegistry {
    states: Arc<RwLock<BTreeMap<String, SourceState>>>,
    file_path: Option<PathBuf>,
}

impl SourceRegistry {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        SourceRegistry {
            states: Arc::new(RwLock::new(BTreeMap::new())),
            file_path: Some(file_path.into()),
        }
    }

    pub fn in_memory() -> Self {
        SourceRegistry {
            states: Arc::new(RwLock::new(BTreeMap::new())),
            file_path: None,
        }
    }

    /// Load persisted states; a missing file is an empty registry
    pub async fn load_from_file(&self) -> Result<()> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };
        if !path.exists() {
            debug!("No source state file at {}", path.display());
            return Ok(());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let loaded: Vec<SourceState> = serde_json::from_str(&content)?;

        let mut states = self.states.write().await;
        for state in loaded {
            states.insert(state.name.clone(), state);
        }

        debug!("Loaded {} source states", states.len());
        Ok(())
    }

    /// Create a source, or refresh enabled/config of an existing one.
    /// Sync bookkeeping of an existing source is kept.
    pub async fn provision(&self, name: &str, enabled: bool, config: serde_json::Value) -> Result<SourceState> {
        let mut states = self.states.write().await;
        let state = states
            .entry(name.to_string())
            .or_insert_with(|| SourceState::new(name));
        state.enabled = enabled;
        state.config = config;
        let provisioned = state.clone();

        self.save_to_file(&states).await?;
        Ok(provisioned)
    }

    pub async fn get(&self, name: &str) -> Option<SourceState> {
        let states = self.states.read().await;
        states.get(name).cloned()
    }

    pub async fn all(&self) -> Vec<SourceState> {
        let states = self.states.read().await;
        states.values().cloned().collect()
    }

    pub async fn enabled(&self) -> Vec<SourceState> {
        let states = self.states.read().await;
        states.values().filter(|s| s.enabled).cloned().collect()
    }

    /// Unknown sources are never enabled
    pub async fn is_enabled(&self, name: &str) -> bool {
        let states = self.states.read().await;
        states.get(name).map_or(false, |s| s.enabled)
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut states = self.states.write().await;
        let state = states
            .get_mut(name)
            .ok_or_else(|| SyncError::InvalidRequest(format!("Unknown source: {}", name)))?;
        state.enabled = enabled;

        self.save_to_file(&states).await
    }

    /// Record the outcome of a sync attempt. `last_sync` only moves on
    /// success or partial success.
    pub async fn record_attempt(&self, name: &str, at: DateTime<Utc>, attempt: SyncAttempt) -> Result<()> {
        let mut states = self.states.write().await;
        let Some(state) = states.get_mut(name) else {
            warn!("Sync attempt recorded for unprovisioned source {}", name);
            return Ok(());
        };

        state.last_attempt = Some(at);
        match attempt {
            SyncAttempt::Succeeded => {
                state.last_sync = Some(at);
                state.last_error = None;
            }
            SyncAttempt::Partial(cause) => {
                state.last_sync = Some(at);
                state.last_error = Some(cause);
            }
            SyncAttempt::Failed(cause) => {
                state.last_error = Some(cause);
            }
        }

        self.save_to_file(&states).await
    }

    /// Callers hold the write guard, so writes are serialized and the file
    /// always holds the latest in-memory state. The rename keeps a reader
    /// from ever seeing a half-written file.
    async fn save_to_file(&self, states: &BTreeMap<String, SourceState>) -> Result<()> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };

        let snapshot: Vec<&SourceState> = states.values().collect();
        let json = serde_json::to_string_pretty(&snapshot)?;

        let tmp_path = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}
