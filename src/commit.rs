//! Serialized commit recording.
//!
//! Many tasks may settle at once but they share one working tree, so every
//! commit goes through a single async mutex. The ordered commit log lives
//! inside that mutex, which makes log order equal lock-acquisition order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::task::TaskId;
use crate::Result;

/// One commit produced for a successful task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub sha: String,
    pub short_sha: String,
    pub message: String,
    pub author: String,
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    pub files_changed: usize,
}

/// Version-control adapter consumed by the engine.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Stage everything and commit. `Ok(None)` when there was nothing to commit.
    async fn commit(
        &self,
        workspace: &Path,
        message: &str,
        author: &str,
        task_id: &TaskId,
    ) -> Result<Option<CommitRecord>>;

    /// Uncommitted changes since the last commit, if any can be produced.
    async fn workspace_diff(&self, workspace: &Path) -> Result<Option<String>>;
}

/// Mutual-exclusion wrapper around a [`VersionControl`] adapter.
pub struct CommitSerializer {
    vcs: Arc<dyn VersionControl>,
    log: Mutex<Vec<CommitRecord>>,
}

impl CommitSerializer {
    pub fn new(vcs: Arc<dyn VersionControl>) -> Self {
        Self {
            vcs,
            log: Mutex::new(Vec::new()),
        }
    }

    /// Run `f` while holding the commit lock.
    ///
    /// A record returned by `f` is appended to the log before the lock is
    /// released.
    pub async fn with_lock<F, Fut>(&self, f: F) -> Result<Option<CommitRecord>>
    where
        F: FnOnce(Arc<dyn VersionControl>) -> Fut,
        Fut: Future<Output = Result<Option<CommitRecord>>>,
    {
        let mut log = self.log.lock().await;
        let record = f(Arc::clone(&self.vcs)).await?;
        if let Some(ref record) = record {
            tracing::debug!(sha = %record.short_sha, task_id = %record.task_id, "commit recorded");
            log.push(record.clone());
        }
        Ok(record)
    }

    /// Commit the workspace on behalf of a task.
    pub async fn commit(
        &self,
        workspace: &Path,
        message: &str,
        author: &str,
        task_id: &TaskId,
    ) -> Result<Option<CommitRecord>> {
        let workspace: PathBuf = workspace.to_path_buf();
        let message = message.to_string();
        let author = author.to_string();
        let task_id = task_id.clone();
        self.with_lock(|vcs| async move {
            vcs.commit(&workspace, &message, &author, &task_id).await
        })
        .await
    }

    /// Workspace diff, read under the lock so it never observes a half-made commit.
    pub async fn workspace_diff(&self, workspace: &Path) -> Result<Option<String>> {
        let _log = self.log.lock().await;
        self.vcs.workspace_diff(workspace).await
    }

    /// Commits recorded so far, in commit order.
    pub async fn commits(&self) -> Vec<CommitRecord> {
        self.log.lock().await.clone()
    }
}
