//! Workspace filesystem layout and the artifacts a run reads and writes.
//!
//! ```text
//! <root>/
//!   .kiln/comms/<task>_summary.md   agent-written summary override
//!   .kiln/comms/reviews/
//!   .kiln/context/project_context.md
//!   .kiln/status/current_state.json
//!   .kiln/status/test_output.txt    latest test run output
//!   src/  tests/
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use crate::core::task::{Task, TaskId, Worker, WorkerStatus};
use crate::git::GitOps;
use crate::util::blocking;
use crate::Result;

const KILN_DIR: &str = ".kiln";

/// Most files listed in a workspace manifest.
pub const MANIFEST_LIMIT: usize = 200;
const MANIFEST_HINT_CHARS: usize = 80;
const MANIFEST_SKIP_DIRS: &[&str] = &[KILN_DIR, ".git", "__pycache__"];

/// Per-task entry of the state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub name: String,
    pub status: String,
    pub agent_name: String,
}

/// Per-worker entry of the state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub role: String,
    pub status: WorkerStatus,
}

/// Structured snapshot of a run, keyed by task id and worker name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub tasks: BTreeMap<TaskId, TaskState>,
    pub agents: BTreeMap<String, WorkerState>,
}

impl StateSnapshot {
    pub fn build<'a>(
        tasks: impl IntoIterator<Item = &'a Task>,
        workers: impl IntoIterator<Item = &'a Worker>,
    ) -> Self {
        Self {
            tasks: tasks
                .into_iter()
                .map(|t| {
                    let state = TaskState {
                        name: t.name.clone(),
                        status: t.status.label().to_string(),
                        agent_name: t.worker.clone(),
                    };
                    (t.id.clone(), state)
                })
                .collect(),
            agents: workers
                .into_iter()
                .map(|w| {
                    let state = WorkerState {
                        role: w.role.clone(),
                        status: w.status,
                    };
                    (w.name.clone(), state)
                })
                .collect(),
        }
    }
}

/// Cumulative context log of every completed task's summary.
pub fn build_project_context(summaries: &BTreeMap<TaskId, String>) -> String {
    let mut lines = vec!["# Project Context".to_string(), String::new()];
    for (task_id, summary) in summaries {
        if summary.is_empty() {
            continue;
        }
        lines.push(format!("## {}", task_id));
        lines.push(summary.clone());
        lines.push(String::new());
    }
    lines.join("\n")
}

/// Listing of workspace files for prompts.
///
/// One relative path per line, followed by the file's first line as a hint
/// when it has one. Tool directories are skipped. At most `limit` files
/// are listed; the rest are counted on a final line.
pub fn build_file_manifest(root: &Path, limit: usize) -> Result<String> {
    let files = collect_files(root)?;
    let mut lines: Vec<String> = files
        .iter()
        .take(limit)
        .map(|rel| {
            let display = rel.to_string_lossy().replace('\\', "/");
            match first_line_hint(&root.join(rel)) {
                Some(hint) => format!("{}  # {}", display, hint),
                None => display,
            }
        })
        .collect();
    if files.len() > limit {
        lines.push(format!("(and {} more...)", files.len() - limit));
    }
    Ok(lines.join("\n"))
}

/// Relative file paths under `root`, depth first, each directory's files
/// before its subdirectories, names sorted.
fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![PathBuf::new()];
    while let Some(rel) = stack.pop() {
        let mut entries = std::fs::read_dir(root.join(&rel))?.collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        let mut subdirs = Vec::new();
        for entry in entries {
            let name = entry.file_name();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                let skipped = name
                    .to_str()
                    .map_or(false, |n| MANIFEST_SKIP_DIRS.contains(&n));
                if !skipped {
                    subdirs.push(rel.join(&name));
                }
            } else if file_type.is_file() {
                files.push(rel.join(&name));
            }
        }
        stack.extend(subdirs.into_iter().rev());
    }
    Ok(files)
}

fn first_line_hint(path: &Path) -> Option<String> {
    let file = std::fs::File::open(path).ok()?;
    let mut line = Vec::new();
    BufReader::new(file)
        .take(4096)
        .read_until(b'\n', &mut line)
        .ok()?;
    let text = String::from_utf8_lossy(&line);
    let text = text.trim();
    if text.is_empty() || text.contains('\0') {
        return None;
    }
    Some(text.chars().take(MANIFEST_HINT_CHARS).collect())
}

/// A run's working directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn kiln_dir(&self) -> PathBuf {
        self.root.join(KILN_DIR)
    }

    pub fn comms_summary_path(&self, task_id: &TaskId) -> PathBuf {
        self.kiln_dir()
            .join("comms")
            .join(format!("{}_summary.md", task_id))
    }

    pub fn test_output_path(&self) -> PathBuf {
        self.kiln_dir().join("status").join("test_output.txt")
    }

    pub fn context_path(&self) -> PathBuf {
        self.kiln_dir().join("context").join("project_context.md")
    }

    pub fn state_path(&self) -> PathBuf {
        self.kiln_dir().join("status").join("current_state.json")
    }

    /// Create the directory layout.
    pub async fn setup(&self) -> Result<()> {
        let kiln = self.kiln_dir();
        for dir in [
            kiln.join("comms"),
            kiln.join("comms").join("reviews"),
            kiln.join("context"),
            kiln.join("status"),
            self.root.join("src"),
            self.root.join("tests"),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        tracing::debug!(root = %self.root.display(), "workspace ready");
        Ok(())
    }

    /// Open the workspace repository, initialising one when absent.
    ///
    /// Returns `None` when git is unusable; the run continues without
    /// version control.
    pub fn open_or_init_git(&self, goal: &str) -> Option<GitOps> {
        let result = if self.root.join(".git").exists() {
            GitOps::new(&self.root)
        } else {
            GitOps::init_repo(&self.root, goal)
        };
        match result {
            Ok(git) => Some(git),
            Err(e) => {
                tracing::warn!(error = %e, "git unavailable, continuing without version control");
                None
            }
        }
    }

    /// Summary the agent wrote for `task_id`, if any.
    pub async fn read_comms_summary(&self, task_id: &TaskId) -> Option<String> {
        read_optional(&self.comms_summary_path(task_id)).await
    }

    /// Output of the last test run, if any.
    pub async fn read_test_output(&self) -> Option<String> {
        read_optional(&self.test_output_path()).await
    }

    /// Manifest of the workspace's files, see [`build_file_manifest`].
    pub async fn file_manifest(&self) -> Result<String> {
        let root = self.root.clone();
        blocking(move || build_file_manifest(&root, MANIFEST_LIMIT)).await
    }

    pub async fn write_project_context(&self, summaries: &BTreeMap<TaskId, String>) -> Result<()> {
        write_creating(&self.context_path(), build_project_context(summaries).as_bytes()).await
    }

    pub async fn write_state_snapshot(&self, snapshot: &StateSnapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        write_creating(&self.state_path(), &json).await
    }
}

async fn read_optional(path: &Path) -> Option<String> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not read workspace artifact");
            None
        }
    }
}

async fn write_creating(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;
    Ok(())
}
