//! Filesystem execution-state repository.
//!
//! Stores one pretty-printed JSON document per execution under a root
//! directory (`<root>/<execution_id>.json`). Writes go through a temp file
//! and an atomic rename so readers never observe a torn record.

use crate::error::Result;
use crate::repository::{ExecutionFilter, ExecutionStateRepository, ExecutionSummary};
use crate::state::ExecutionState;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Repository persisting each execution as a JSON file.
pub struct FsStateRepository {
    root: PathBuf,
}

impl FsStateRepository {
    /// Create a repository rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, execution_id: &str) -> PathBuf {
        self.root.join(format!("{execution_id}.json"))
    }
}

#[async_trait]
impl ExecutionStateRepository for FsStateRepository {
    async fn get(&self, execution_id: &str) -> Result<Option<ExecutionState>> {
        let path = self.path_for(execution_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn upsert(&self, state: &ExecutionState) -> Result<()> {
        let path = self.path_for(&state.id);
        let tmp = self.root.join(format!(".{}.tmp", state.id));
        let contents = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&tmp, &contents).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionSummary>> {
        let mut rows = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(_) => continue,
            };
            let state: ExecutionState = match serde_json::from_str(&contents) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable state file");
                    continue;
                }
            };
            if filter.matches(&state) {
                rows.push(ExecutionSummary::from(&state));
            }
        }
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(a.id.cmp(&b.id)));
        Ok(rows
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.max(1))
            .collect())
    }

    async fn delete(&self, execution_id: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.path_for(execution_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
