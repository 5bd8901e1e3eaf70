//! Parallel agent execution over isolated worktrees.
//!
//! A flat task list runs under a semaphore bound; every task gets its own
//! worktree, the agent prompt is enriched with the checkout path and
//! branch, and succeeded branches are merged back one by one after the
//! whole group finished. Worktrees are always deleted on the way out,
//! success and failure alike.
//!
//! Graph execution chains parallel groups: a group completes (all tasks
//! terminal, all merges attempted) before the next begins, and a failed
//! group marks everything after it as skipped.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::Result;
use crate::graph::DependencyGraph;
use crate::graph::TaskNode;
use crate::graph::TaskStatus;
use crate::runner::AgentRunner;
use crate::worktree::MergeResult;
use crate::worktree::WorktreeManager;

/// One agent execution inside a parallel group.
#[derive(Debug, Clone)]
pub struct AgentTask {
    pub id: String,
    pub agent: String,
    pub prompt: String,
    pub change_id: String,
}

impl AgentTask {
    pub fn from_node(node: &TaskNode, change_id: &str) -> Self {
        Self {
            id: node.id.clone(),
            agent: node.agent.clone(),
            prompt: node.prompt.clone(),
            change_id: change_id.to_string(),
        }
    }
}

/// Outcome of one agent execution.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub task_id: String,
    pub agent: String,
    pub success: bool,
    pub output: String,
    pub duration_seconds: f64,
    /// Branch the task worked on, when a worktree was created.
    pub branch: Option<String>,
    pub error: Option<String>,
}

impl AgentResult {
    fn failure(task: &AgentTask, error: impl Into<String>, duration_seconds: f64) -> Self {
        Self {
            task_id: task.id.clone(),
            agent: task.agent.clone(),
            success: false,
            output: String::new(),
            duration_seconds,
            branch: None,
            error: Some(error.into()),
        }
    }
}

/// Aggregate outcome of a parallel run.
#[derive(Debug, Clone, Default)]
pub struct ParallelExecutionResult {
    pub success: bool,
    pub results: Vec<AgentResult>,
    pub merge_results: Vec<MergeResult>,
    /// All conflicting file paths across failed merges.
    pub conflicts: Vec<String>,
    pub total_duration_seconds: f64,
}

/// Execute agent tasks concurrently inside isolated worktrees.
pub struct ParallelRunner {
    runner: Arc<dyn AgentRunner>,
    worktrees: Arc<WorktreeManager>,
    max_parallel: usize,
    cancel: CancellationToken,
}

impl ParallelRunner {
    pub fn new(
        runner: Arc<dyn AgentRunner>,
        worktrees: Arc<WorktreeManager>,
        max_parallel: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            worktrees,
            max_parallel: max_parallel.max(1),
            cancel,
        }
    }

    /// Run a flat task list with worktree isolation.
    ///
    /// Concurrency is bounded by the semaphore; merges run serialized on
    /// this driver after every task finished, in task submission order.
    /// Every worktree created here is deleted before returning.
    pub async fn run_parallel(
        &self,
        tasks: &[AgentTask],
        base_branch: &str,
    ) -> ParallelExecutionResult {
        if tasks.is_empty() {
            return ParallelExecutionResult {
                success: true,
                ..ParallelExecutionResult::default()
            };
        }

        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut join_set: JoinSet<(usize, AgentResult)> = JoinSet::new();

        for (index, task) in tasks.iter().cloned().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let runner = Arc::clone(&self.runner);
            let worktrees = Arc::clone(&self.worktrees);
            let cancel = self.cancel.clone();
            let base = base_branch.to_string();

            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, AgentResult::failure(&task, "semaphore closed", 0.0));
                };
                let result = tokio::select! {
                    _ = cancel.cancelled() => {
                        AgentResult::failure(&task, "cancelled", 0.0)
                    }
                    result = execute_task(runner, worktrees, &task, &base) => result,
                };
                (index, result)
            });
        }

        let mut slots: Vec<Option<AgentResult>> = vec![None; tasks.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => error!("parallel task join error: {e}"),
            }
        }

        let mut results: Vec<AgentResult> = Vec::with_capacity(tasks.len());
        for (index, slot) in slots.into_iter().enumerate() {
            results.push(slot.unwrap_or_else(|| {
                AgentResult::failure(&tasks[index], "task join error", 0.0)
            }));
        }

        // Merge phase: serialized, in submission order, only after every
        // task reached a terminal state.
        let mut merge_results = Vec::new();
        let mut conflicts = Vec::new();
        for result in &results {
            let Some(branch) = result.branch.as_ref().filter(|_| result.success) else {
                continue;
            };
            let merge = self.worktrees.merge_to_branch(branch, base_branch, true).await;
            if !merge.success {
                conflicts.extend(merge.conflicts.iter().cloned());
            }
            merge_results.push(merge);
        }

        // Cleanup runs on every exit path, cancelled and failed included.
        for task in tasks {
            self.worktrees.delete(&task.agent, true).await;
        }

        let success = results.iter().all(|r| r.success) && conflicts.is_empty();
        ParallelExecutionResult {
            success,
            results,
            merge_results,
            conflicts,
            total_duration_seconds: started.elapsed().as_secs_f64(),
        }
    }

    /// Execute a dependency graph group by group.
    ///
    /// Task statuses are written back into the graph; when a group fails
    /// (task failure or merge conflict) all tasks of later groups are
    /// marked skipped and execution stops.
    pub async fn run_graph(
        &self,
        graph: &mut DependencyGraph,
        change_id: &str,
        base_branch: &str,
    ) -> Result<ParallelExecutionResult> {
        let started = Instant::now();
        let groups = graph.parallel_groups()?;

        let mut aggregate = ParallelExecutionResult {
            success: true,
            ..ParallelExecutionResult::default()
        };

        for (index, group) in groups.iter().enumerate() {
            info!(
                "executing parallel group {}/{}: {:?}",
                index + 1,
                groups.len(),
                group.iter().map(|t| t.agent.as_str()).collect::<Vec<_>>()
            );

            for task in group {
                graph.set_status(&task.id, TaskStatus::Running);
            }

            let tasks: Vec<AgentTask> = group
                .iter()
                .map(|node| AgentTask::from_node(node, change_id))
                .collect();
            let result = self.run_parallel(&tasks, base_branch).await;

            for agent_result in &result.results {
                let status = if agent_result.success {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                };
                graph.set_status(&agent_result.task_id, status);
            }

            let group_failed = !result.success;
            aggregate.results.extend(result.results);
            aggregate.merge_results.extend(result.merge_results);
            aggregate.conflicts.extend(result.conflicts);

            if group_failed {
                warn!(
                    "group {}/{} had failures; skipping remaining groups",
                    index + 1,
                    groups.len()
                );
                for later in &groups[index + 1..] {
                    for task in later {
                        graph.set_status(&task.id, TaskStatus::Skipped);
                    }
                }
                break;
            }
        }

        aggregate.success =
            aggregate.results.iter().all(|r| r.success) && aggregate.conflicts.is_empty();
        aggregate.total_duration_seconds = started.elapsed().as_secs_f64();
        Ok(aggregate)
    }
}

/// Run one task in its own worktree. Worktree creation failure is a task
/// failure, not an error: the group may still merge succeeded siblings.
async fn execute_task(
    runner: Arc<dyn AgentRunner>,
    worktrees: Arc<WorktreeManager>,
    task: &AgentTask,
    base_branch: &str,
) -> AgentResult {
    let started = Instant::now();

    let worktree = match worktrees.create(&task.agent, &task.change_id, base_branch).await {
        Ok(worktree) => worktree,
        Err(e) => {
            warn!("worktree creation failed for {}: {e}", task.id);
            return AgentResult::failure(
                task,
                format!("Failed to create worktree: {e}"),
                started.elapsed().as_secs_f64(),
            );
        }
    };

    let prompt = worktree_prompt(task, &worktree.path.display().to_string(), &worktree.branch);
    let output = runner.run(&task.agent, &prompt).await;
    let duration = started.elapsed().as_secs_f64();
    let success = output_indicates_success(&output);

    info!(
        "task {} ({}) finished in {duration:.1}s, success={success}",
        task.id, task.agent
    );

    AgentResult {
        task_id: task.id.clone(),
        agent: task.agent.clone(),
        success,
        output,
        duration_seconds: duration,
        branch: Some(worktree.branch),
        error: None,
    }
}

/// Fixed header announcing parallel mode. Downstream merges depend on
/// the commit instruction, so this is a contract, not cosmetics.
fn worktree_prompt(task: &AgentTask, path: &str, branch: &str) -> String {
    format!(
        "[PARALLEL EXECUTION MODE]\n\
         \n\
         Working Directory: {path}\n\
         Branch: {branch}\n\
         \n\
         IMPORTANT:\n\
         - You are running in an isolated worktree\n\
         - Make all changes within this directory\n\
         - Commit your changes before completing\n\
         \n\
         ---\n\
         \n\
         {}",
        task.prompt
    )
}

/// Conservative success classification: only an explicit BLOCKED or
/// FAILED marker counts as failure; no marker counts as success.
fn output_indicates_success(output: &str) -> bool {
    if output.contains("[WORKFLOW_STATUS]") {
        if output.contains("status: READY") {
            return true;
        }
        if output.contains("status: BLOCKED") || output.contains("status: FAILED") {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn task(id: &str) -> AgentTask {
        AgentTask {
            id: id.to_string(),
            agent: format!("agent-{id}"),
            prompt: format!("work on {id}"),
            change_id: "c1".to_string(),
        }
    }

    #[test]
    fn success_classification_is_conservative() {
        assert!(output_indicates_success("no marker at all"));
        assert!(output_indicates_success(
            "[WORKFLOW_STATUS]\nstatus: READY\ncontext: done"
        ));
        assert!(!output_indicates_success(
            "[WORKFLOW_STATUS]\nstatus: BLOCKED\ncontext: stuck"
        ));
        assert!(!output_indicates_success(
            "[WORKFLOW_STATUS]\nstatus: FAILED\ncontext: broke"
        ));
        // Marker present but no recognizable status line: success.
        assert!(output_indicates_success("[WORKFLOW_STATUS]\nstatus: ???"));
    }

    #[test]
    fn worktree_prompt_carries_the_contract() {
        let prompt = worktree_prompt(&task("t1"), "/tmp/wt/agent-t1", "parallel/c1/agent-t1");
        assert!(prompt.starts_with("[PARALLEL EXECUTION MODE]"));
        assert!(prompt.contains("Working Directory: /tmp/wt/agent-t1"));
        assert!(prompt.contains("Branch: parallel/c1/agent-t1"));
        assert!(prompt.contains("Commit your changes"));
        assert!(prompt.ends_with("work on t1"));
    }

    #[test]
    fn agent_task_from_node_copies_identity() {
        let node = TaskNode::new("Phase 1/1.1", "code-writer", "implement x");
        let task = AgentTask::from_node(&node, "00042");
        assert_eq!(task.id, "Phase 1/1.1");
        assert_eq!(task.agent, "code-writer");
        assert_eq!(task.change_id, "00042");
    }
}
