use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use git2::{DiffFormat, DiffOptions, ErrorCode, IndexAddOption, Repository, Signature};

use crate::commit::{CommitRecord, VersionControl};
use crate::core::task::TaskId;
use crate::util::blocking;
use crate::Result;

const DEFAULT_AUTHOR: &str = "kiln";
const AUTHOR_EMAIL: &str = "kiln@localhost";

/// `git2`-backed version control for a run workspace.
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        tracing::debug!(path = %repo_path.display(), "GitOps::new");
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    /// Initialise a repository with a README naming the goal, then open it.
    pub fn init_repo(path: &Path, goal: &str) -> Result<Self> {
        tracing::debug!(path = %path.display(), "GitOps::init_repo");
        Repository::init(path)?;
        std::fs::write(
            path.join("README.md"),
            format!("# {}\n\nBuilt with kiln.\n", goal),
        )?;
        let ops = Self {
            repo_path: path.to_path_buf(),
        };
        ops.commit_all(path, "Project started!", DEFAULT_AUTHOR, &TaskId::from("init"))?;
        Ok(ops)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Stage every change (including deletions) and commit it.
    ///
    /// Returns `Ok(None)` when the staged tree equals HEAD.
    pub fn commit_all(
        &self,
        worktree_path: &Path,
        message: &str,
        author: &str,
        task_id: &TaskId,
    ) -> Result<Option<CommitRecord>> {
        tracing::debug!(path = %worktree_path.display(), message, "GitOps::commit_all");
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["."].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };

        if let Some(ref parent) = parent {
            if parent.tree_id() == tree_id {
                tracing::debug!("nothing to commit");
                return Ok(None);
            }
        }

        let name = if author.is_empty() { DEFAULT_AUTHOR } else { author };
        let sig = Signature::now(name, AUTHOR_EMAIL)?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;

        let parent_tree = match parent {
            Some(ref p) => Some(p.tree()?),
            None => None,
        };
        let diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)?;
        let files_changed = diff.deltas().len();

        let sha = commit_id.to_string();
        tracing::debug!(%sha, files_changed, "commit created");
        Ok(Some(CommitRecord {
            short_sha: sha.chars().take(7).collect(),
            sha,
            message: message.to_string(),
            author: name.to_string(),
            task_id: task_id.clone(),
            timestamp: Utc::now(),
            files_changed,
        }))
    }

    /// Patch text of everything changed since HEAD, untracked files included.
    pub fn diff_since_head(&self, worktree_path: &Path) -> Result<Option<String>> {
        let repo = Repository::open(worktree_path)?;
        let head_tree = match repo.head() {
            Ok(head) => head.peel_to_tree()?,
            Err(e) if e.code() == ErrorCode::UnbornBranch => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut opts = DiffOptions::new();
        opts.include_untracked(true).show_untracked_content(true);
        let diff = repo.diff_tree_to_workdir_with_index(Some(&head_tree), Some(&mut opts))?;

        let mut patch = String::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            if matches!(line.origin(), '+' | '-' | ' ') {
                patch.push(line.origin());
            }
            patch.push_str(&String::from_utf8_lossy(line.content()));
            true
        })?;

        if patch.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(patch))
        }
    }

    pub fn head_commit(&self) -> Result<String> {
        let repo = Repository::discover(&self.repo_path)?;
        let head = repo.head()?;
        let commit = head.peel_to_commit()?;
        Ok(commit.id().to_string())
    }
}

#[async_trait]
impl VersionControl for GitOps {
    async fn commit(
        &self,
        workspace: &Path,
        message: &str,
        author: &str,
        task_id: &TaskId,
    ) -> Result<Option<CommitRecord>> {
        let ops = GitOps {
            repo_path: self.repo_path.clone(),
        };
        let workspace = workspace.to_path_buf();
        let message = message.to_string();
        let author = author.to_string();
        let task_id = task_id.clone();
        blocking(move || ops.commit_all(&workspace, &message, &author, &task_id)).await
    }

    async fn workspace_diff(&self, workspace: &Path) -> Result<Option<String>> {
        let ops = GitOps {
            repo_path: self.repo_path.clone(),
        };
        let workspace = workspace.to_path_buf();
        blocking(move || ops.diff_since_head(&workspace)).await
    }
}
