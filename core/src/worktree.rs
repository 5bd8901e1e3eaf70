//! Git worktree management for parallel agent execution.
//!
//! Each in-flight task gets an isolated checkout under
//! `<project>/.worktrees/<agent>/` on its own branch
//! `parallel/<change_id>/<agent>`, so agents can write concurrently
//! without stepping on each other. Merging the branches back and
//! cleaning the checkouts up also lives here.
//!
//! Git operations are serialized behind a lock; the in-memory table of
//! active worktrees is kept consistent with the on-disk set.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::ParallelConfig;
use crate::error::OrchestratorError;
use crate::error::Result;

/// Lifecycle of an isolated checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorktreeStatus {
    Created,
    Active,
    Completed,
    Failed,
    Cleaned,
}

/// An isolated checkout, owned exclusively by one in-flight task.
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
    pub agent: String,
    pub status: WorktreeStatus,
}

/// Result of merging one agent branch back.
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub success: bool,
    /// Source branch that was merged.
    pub branch: String,
    /// Conflicted paths when the merge was refused.
    pub conflicts: Vec<String>,
    pub message: String,
}

/// Predicted overlap between two parallel branches.
#[derive(Debug, Clone)]
pub struct BranchConflict {
    pub file: String,
    pub branches: (String, String),
}

struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Manager for per-agent git worktrees.
pub struct WorktreeManager {
    project_dir: PathBuf,
    worktrees_dir: PathBuf,
    max_worktrees: usize,
    active: Mutex<HashMap<String, WorktreeInfo>>,
    /// Serializes all git invocations on the shared repository.
    git_lock: Mutex<()>,
}

impl WorktreeManager {
    pub fn new(project_dir: &Path, config: &ParallelConfig) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            worktrees_dir: project_dir.join(&config.worktree_dir),
            max_worktrees: config.max_worktrees,
            active: Mutex::new(HashMap::new()),
            git_lock: Mutex::new(()),
        }
    }

    async fn run_git(&self, args: &[&str], cwd: Option<&Path>) -> Result<GitOutput> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd.unwrap_or(&self.project_dir))
            .output()
            .await
            .map_err(|e| OrchestratorError::git(args.join(" "), e.to_string()))?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Make sure the worktrees directory exists and is excluded from
    /// version control.
    fn ensure_worktrees_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.worktrees_dir)?;

        let dir_name = self
            .worktrees_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".worktrees".to_string());
        let gitignore = self.project_dir.join(".gitignore");
        if gitignore.exists() {
            let content = fs::read_to_string(&gitignore)?;
            if !content.contains(&dir_name) {
                let mut updated = content;
                if !updated.ends_with('\n') {
                    updated.push('\n');
                }
                updated.push_str(&format!("\n# Parallel agent worktrees\n{dir_name}/\n"));
                fs::write(&gitignore, updated)?;
            }
        }

        Ok(())
    }

    /// Create a new worktree for an agent on `parallel/<change_id>/<agent>`.
    ///
    /// Fails on capacity (MAX_WORKTREES) or a git error. Re-creating an
    /// existing `(change_id, agent)` pair deletes the previous checkout
    /// first.
    pub async fn create(
        &self,
        agent: &str,
        change_id: &str,
        base_branch: &str,
    ) -> Result<WorktreeInfo> {
        let branch = format!("parallel/{change_id}/{agent}");
        let path = self.worktrees_dir.join(agent);

        if path.exists() {
            self.delete(agent, true).await;
        }

        self.ensure_worktrees_dir()?;

        {
            let mut active = self.active.lock().await;
            if active.len() >= self.max_worktrees {
                warn!("maximum worktrees ({}) reached", self.max_worktrees);
                return Err(OrchestratorError::WorktreeCapacity {
                    max: self.max_worktrees,
                });
            }
            // Reserve the slot before the git call so a concurrent create
            // cannot blow past the cap.
            active.insert(
                agent.to_string(),
                WorktreeInfo {
                    path: path.clone(),
                    branch: branch.clone(),
                    agent: agent.to_string(),
                    status: WorktreeStatus::Created,
                },
            );
        }

        let result = {
            let _git = self.git_lock.lock().await;
            let path_str = path.to_string_lossy().into_owned();
            self.run_git(
                &["worktree", "add", &path_str, "-b", &branch, base_branch],
                None,
            )
            .await
        };

        match result {
            Ok(output) if output.success => {
                info!("created worktree for {agent} at {}", path.display());
                Ok(WorktreeInfo {
                    path,
                    branch,
                    agent: agent.to_string(),
                    status: WorktreeStatus::Created,
                })
            }
            Ok(output) => {
                self.active.lock().await.remove(agent);
                Err(OrchestratorError::git(
                    "worktree add",
                    output.stderr.trim().to_string(),
                ))
            }
            Err(e) => {
                self.active.lock().await.remove(agent);
                Err(e)
            }
        }
    }

    /// Delete an agent's worktree. Idempotent: a missing checkout counts
    /// as success. A plain removal that fails is retried with `--force`,
    /// then falls back to raw filesystem removal plus `git worktree
    /// prune`.
    pub async fn delete(&self, agent: &str, force: bool) -> bool {
        let path = {
            let active = self.active.lock().await;
            active
                .get(agent)
                .map(|info| info.path.clone())
                .unwrap_or_else(|| self.worktrees_dir.join(agent))
        };

        if !path.exists() {
            self.active.lock().await.remove(agent);
            return true;
        }

        let path_str = path.to_string_lossy().into_owned();
        let mut args = vec!["worktree", "remove", path_str.as_str()];
        if force {
            args.push("--force");
        }

        let removed = {
            let _git = self.git_lock.lock().await;
            match self.run_git(&args, None).await {
                Ok(output) if output.success => true,
                Ok(output) => {
                    warn!("worktree remove failed for {agent}: {}", output.stderr.trim());
                    false
                }
                Err(e) => {
                    warn!("worktree remove failed for {agent}: {e}");
                    false
                }
            }
        };

        if !removed {
            if !force {
                return Box::pin(self.delete(agent, true)).await;
            }
            // Last resort: raw removal and prune of stale bookkeeping.
            if let Err(e) = fs::remove_dir_all(&path) {
                warn!("failed to clean up worktree {agent}: {e}");
                return false;
            }
            let _git = self.git_lock.lock().await;
            let _ = self.run_git(&["worktree", "prune"], None).await;
        }

        self.active.lock().await.remove(agent);
        debug!("deleted worktree for {agent}");
        true
    }

    /// Merge `source_branch` into `target_branch` with a merge commit.
    ///
    /// On refusal the conflicted paths are enumerated, the merge is
    /// aborted (no partial state), and the branch is left intact for
    /// inspection.
    pub async fn merge_to_branch(
        &self,
        source_branch: &str,
        target_branch: &str,
        no_ff: bool,
    ) -> MergeResult {
        let _git = self.git_lock.lock().await;

        let failure = |message: String, conflicts: Vec<String>| MergeResult {
            success: false,
            branch: source_branch.to_string(),
            conflicts,
            message,
        };

        match self.run_git(&["checkout", target_branch], None).await {
            Ok(output) if output.success => {}
            Ok(output) => {
                return failure(
                    format!(
                        "Failed to checkout {target_branch}: {}",
                        output.stderr.trim()
                    ),
                    Vec::new(),
                );
            }
            Err(e) => return failure(e.to_string(), Vec::new()),
        }

        let message = format!("Merge {source_branch} into {target_branch}");
        let mut args = vec!["merge", source_branch];
        if no_ff {
            args.push("--no-ff");
        }
        args.extend(["-m", message.as_str()]);

        match self.run_git(&args, None).await {
            Ok(output) if output.success => {
                info!("merged {source_branch} into {target_branch}");
                MergeResult {
                    success: true,
                    branch: source_branch.to_string(),
                    conflicts: Vec::new(),
                    message: "Merge successful".to_string(),
                }
            }
            Ok(output) => {
                let conflicts = self.conflicted_files().await;
                if conflicts.is_empty() {
                    failure(
                        format!("Merge failed: {}", output.stderr.trim()),
                        Vec::new(),
                    )
                } else {
                    let _ = self.run_git(&["merge", "--abort"], None).await;
                    warn!(
                        "merge of {source_branch} hit conflicts in {} file(s)",
                        conflicts.len()
                    );
                    failure("Merge conflicts detected".to_string(), conflicts)
                }
            }
            Err(e) => failure(e.to_string(), Vec::new()),
        }
    }

    async fn conflicted_files(&self) -> Vec<String> {
        match self
            .run_git(&["diff", "--name-only", "--diff-filter=U"], None)
            .await
        {
            Ok(output) if output.success => output
                .stdout
                .lines()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Predict overlaps between parallel branches by diffing each against
    /// HEAD and intersecting the touched files. Diagnostics only.
    pub async fn detect_branch_conflicts(&self, branches: &[String]) -> Vec<BranchConflict> {
        let mut branch_files: Vec<(String, BTreeSet<String>)> = Vec::new();

        for branch in branches {
            let spec = format!("HEAD...{branch}");
            if let Ok(output) = self.run_git(&["diff", "--name-only", &spec], None).await
                && output.success
            {
                let files = output
                    .stdout
                    .lines()
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty())
                    .collect();
                branch_files.push((branch.clone(), files));
            }
        }

        let mut conflicts = Vec::new();
        for (i, (first, first_files)) in branch_files.iter().enumerate() {
            for (second, second_files) in &branch_files[i + 1..] {
                for file in first_files.intersection(second_files) {
                    conflicts.push(BranchConflict {
                        file: file.clone(),
                        branches: (first.clone(), second.clone()),
                    });
                }
            }
        }
        conflicts
    }

    /// Delete every `parallel/<change_id>/*` branch. Returns the count.
    pub async fn cleanup_parallel_branches(&self, change_id: &str) -> usize {
        let pattern = format!("parallel/{change_id}/*");
        let branches = match self.run_git(&["branch", "--list", &pattern], None).await {
            Ok(output) if output.success => output
                .stdout
                .lines()
                .map(|l| l.trim().trim_start_matches("* ").to_string())
                .filter(|l| !l.is_empty())
                .collect::<Vec<_>>(),
            _ => return 0,
        };

        let mut deleted = 0;
        for branch in branches {
            if let Ok(output) = self.run_git(&["branch", "-D", &branch], None).await
                && output.success
            {
                info!("deleted branch {branch}");
                deleted += 1;
            }
        }
        deleted
    }

    /// Force-delete every active worktree and prune. Returns the count.
    pub async fn cleanup_all(&self) -> usize {
        let agents: Vec<String> = self.active.lock().await.keys().cloned().collect();

        let mut cleaned = 0;
        for agent in agents {
            if self.delete(&agent, true).await {
                cleaned += 1;
            }
        }

        let _git = self.git_lock.lock().await;
        let _ = self.run_git(&["worktree", "prune"], None).await;
        cleaned
    }

    /// Snapshot of the active worktree table.
    pub async fn active_worktrees(&self) -> HashMap<String, WorktreeInfo> {
        self.active.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn git(repo: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(repo)
            .output()
            .await
            .unwrap();
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    async fn setup_repo() -> (TempDir, WorktreeManager) {
        let temp = TempDir::new().unwrap();
        let repo = temp.path();

        git(repo, &["init", "-b", "main"]).await;
        git(repo, &["config", "user.email", "test@example.com"]).await;
        git(repo, &["config", "user.name", "Test User"]).await;
        fs::write(repo.join("README.md"), "# Test Repo\n").unwrap();
        fs::write(repo.join(".gitignore"), "target/\n").unwrap();
        git(repo, &["add", "."]).await;
        git(repo, &["commit", "-m", "initial commit"]).await;

        let manager = WorktreeManager::new(repo, &ParallelConfig::default());
        (temp, manager)
    }

    #[tokio::test]
    async fn create_and_delete_roundtrip() {
        let (temp, manager) = setup_repo().await;

        let info = manager.create("code-writer", "00042", "HEAD").await.unwrap();
        assert_eq!(info.branch, "parallel/00042/code-writer");
        assert!(info.path.exists());
        assert_eq!(manager.active_worktrees().await.len(), 1);

        assert!(manager.delete("code-writer", false).await);
        assert!(!info.path.exists());
        assert!(manager.active_worktrees().await.is_empty());

        drop(temp);
    }

    #[tokio::test]
    async fn delete_of_missing_worktree_is_success() {
        let (_temp, manager) = setup_repo().await;
        assert!(manager.delete("never-created", false).await);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let (temp, _) = setup_repo().await;
        let config = ParallelConfig {
            max_worktrees: 2,
            ..ParallelConfig::default()
        };
        let manager = WorktreeManager::new(temp.path(), &config);

        manager.create("a", "c1", "HEAD").await.unwrap();
        manager.create("b", "c1", "HEAD").await.unwrap();
        let err = manager.create("c", "c1", "HEAD").await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::WorktreeCapacity { max: 2 }
        ));

        assert_eq!(manager.cleanup_all().await, 2);
    }

    #[tokio::test]
    async fn recreating_same_pair_replaces_the_worktree() {
        let (_temp, manager) = setup_repo().await;

        let first = manager.create("tester", "c1", "HEAD").await.unwrap();
        // Branch still exists from the first create; drop it so the same
        // name can be taken again.
        manager.delete("tester", true).await;
        manager.cleanup_parallel_branches("c1").await;

        let second = manager.create("tester", "c1", "HEAD").await.unwrap();
        assert_eq!(first.branch, second.branch);
        assert_eq!(manager.active_worktrees().await.len(), 1);
        manager.cleanup_all().await;
    }

    #[tokio::test]
    async fn worktrees_dir_is_gitignored() {
        let (temp, manager) = setup_repo().await;
        manager.create("code-writer", "c1", "HEAD").await.unwrap();

        let gitignore = fs::read_to_string(temp.path().join(".gitignore")).unwrap();
        assert!(gitignore.contains(".worktrees/"));
        manager.cleanup_all().await;
    }

    #[tokio::test]
    async fn clean_merge_succeeds() {
        let (temp, manager) = setup_repo().await;

        let info = manager.create("code-writer", "c1", "HEAD").await.unwrap();
        fs::write(info.path.join("feature.txt"), "new feature\n").unwrap();
        git(&info.path, &["add", "."]).await;
        git(&info.path, &["commit", "-m", "add feature"]).await;

        let result = manager.merge_to_branch(&info.branch, "main", true).await;
        assert!(result.success, "{}", result.message);
        assert!(result.conflicts.is_empty());
        assert!(temp.path().join("feature.txt").exists());

        manager.cleanup_all().await;
        assert_eq!(manager.cleanup_parallel_branches("c1").await, 1);
    }

    #[tokio::test]
    async fn conflicting_merge_is_aborted_with_paths() {
        let (temp, manager) = setup_repo().await;

        let a = manager.create("writer-a", "c1", "HEAD").await.unwrap();
        let b = manager.create("writer-b", "c1", "HEAD").await.unwrap();

        fs::write(a.path.join("z.c"), "int a;\n").unwrap();
        git(&a.path, &["add", "."]).await;
        git(&a.path, &["commit", "-m", "a writes z.c"]).await;

        fs::write(b.path.join("z.c"), "int b;\n").unwrap();
        git(&b.path, &["add", "."]).await;
        git(&b.path, &["commit", "-m", "b writes z.c"]).await;

        let first = manager.merge_to_branch(&a.branch, "main", true).await;
        assert!(first.success);

        let second = manager.merge_to_branch(&b.branch, "main", true).await;
        assert!(!second.success);
        assert_eq!(second.conflicts, vec!["z.c".to_string()]);

        // The merge was aborted: the tree is clean and the branch intact.
        let status = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(temp.path())
            .output()
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&status.stdout).trim().is_empty());

        manager.cleanup_all().await;
    }

    #[tokio::test]
    async fn branch_conflict_prediction_reports_overlap() {
        let (_temp, manager) = setup_repo().await;

        let a = manager.create("writer-a", "c1", "HEAD").await.unwrap();
        let b = manager.create("writer-b", "c1", "HEAD").await.unwrap();

        fs::write(a.path.join("shared.c"), "int a;\n").unwrap();
        git(&a.path, &["add", "."]).await;
        git(&a.path, &["commit", "-m", "a"]).await;

        fs::write(b.path.join("shared.c"), "int b;\n").unwrap();
        git(&b.path, &["add", "."]).await;
        git(&b.path, &["commit", "-m", "b"]).await;

        let conflicts = manager
            .detect_branch_conflicts(&[a.branch.clone(), b.branch.clone()])
            .await;
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].file, "shared.c");

        manager.cleanup_all().await;
    }
}
