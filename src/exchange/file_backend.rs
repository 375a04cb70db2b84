//! JSON file backend
//!
//! Reads open positions from a JSON array on disk on every fetch. Used by the
//! `tradeguard monitor` command when positions are exported by another process.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

use super::ExecutionBackend;
use crate::domain::BackendPosition;
use crate::error::{GuardError, Result};

pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ExecutionBackend for JsonFileBackend {
    async fn fetch_open_positions(&self) -> Result<Vec<BackendPosition>> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            GuardError::Transport(format!("failed to read {}: {}", self.path.display(), e))
        })?;

        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }

        let positions: Vec<BackendPosition> = serde_json::from_str(&raw)
            .map_err(|e| GuardError::Backend(format!("malformed positions file: {}", e)))?;
        debug!("Read {} positions from {}", positions.len(), self.path.display());
        Ok(positions)
    }
}
