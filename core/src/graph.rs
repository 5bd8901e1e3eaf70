//! Task dependency graph for parallel execution planning.
//!
//! Handles:
//! - Parsing task-list documents into [`TaskNode`]s
//! - Agent and expected-file inference from task descriptions
//! - Partitioning tasks into file-conflict-free parallel groups
//! - Cycle detection and diagnostics
//!
//! The triple (id, dependencies, file set) is the graph's entire semantic
//! input; grouping is deterministic given insertion order.

use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use tracing::debug;
use tracing::info;

use crate::config::ParallelConfig;
use crate::error::OrchestratorError;
use crate::error::Result;

/// Lifecycle of a task inside the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Unit of parallel work.
#[derive(Debug, Clone)]
pub struct TaskNode {
    /// Unique id, `<phase>/<short>` for parsed task lists.
    pub id: String,
    pub agent: String,
    pub prompt: String,
    /// Expected write set, inferred from the task description.
    pub files: BTreeSet<String>,
    /// Parent task ids that must complete first.
    pub depends_on: Vec<String>,
    pub status: TaskStatus,
}

impl TaskNode {
    pub fn new(id: impl Into<String>, agent: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent: agent.into(),
            prompt: prompt.into(),
            files: BTreeSet::new(),
            depends_on: Vec::new(),
            status: TaskStatus::Pending,
        }
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// Pairwise file overlap between two tasks, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileConflict {
    pub first: String,
    pub second: String,
    pub files: BTreeSet<String>,
}

/// Mapping id → task plus id → parents, insertion-ordered.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: HashMap<String, TaskNode>,
    order: Vec<String>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from tasks, preserving their order.
    pub fn from_tasks(tasks: Vec<TaskNode>) -> Self {
        let mut graph = Self::new();
        for task in tasks {
            graph.add_task(task);
        }
        graph
    }

    pub fn add_task(&mut self, task: TaskNode) {
        if !self.nodes.contains_key(&task.id) {
            self.order.push(task.id.clone());
        }
        self.nodes.insert(task.id.clone(), task);
    }

    pub fn remove_task(&mut self, id: &str) {
        self.nodes.remove(id);
        self.order.retain(|o| o != id);
        for task in self.nodes.values_mut() {
            task.depends_on.retain(|d| d != id);
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    pub fn set_status(&mut self, id: &str, status: TaskStatus) {
        if let Some(task) = self.nodes.get_mut(id) {
            task.status = status;
        }
    }

    /// Tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Pending tasks whose dependencies have all completed.
    pub fn ready_tasks(&self) -> Vec<&TaskNode> {
        self.tasks()
            .filter(|task| task.status == TaskStatus::Pending)
            .filter(|task| {
                task.depends_on.iter().all(|dep| {
                    self.nodes
                        .get(dep)
                        .is_some_and(|d| d.status == TaskStatus::Completed)
                })
            })
            .collect()
    }

    /// Partition all tasks into an ordered sequence of parallel groups.
    ///
    /// Repeatedly takes the tasks whose dependencies are already planned,
    /// then greedily keeps only those with pairwise-disjoint file sets;
    /// tasks excluded by an overlap are deferred to a later group. An
    /// empty ready set with tasks remaining is a dependency cycle.
    pub fn parallel_groups(&self) -> Result<Vec<Vec<TaskNode>>> {
        let mut groups: Vec<Vec<TaskNode>> = Vec::new();
        let mut remaining: Vec<String> = self.order.clone();
        let mut planned: HashSet<String> = HashSet::new();

        while !remaining.is_empty() {
            let ready: Vec<&TaskNode> = remaining
                .iter()
                .filter_map(|id| self.nodes.get(id))
                .filter(|task| task.depends_on.iter().all(|dep| planned.contains(dep)))
                .collect();

            if ready.is_empty() {
                return Err(OrchestratorError::DependencyCycle {
                    remaining: remaining.clone(),
                });
            }

            let group = Self::disjoint_prefix(&ready);
            debug!(
                "parallel group {}: {:?}",
                groups.len() + 1,
                group.iter().map(|t| t.id.as_str()).collect::<Vec<_>>()
            );

            for task in &group {
                planned.insert(task.id.clone());
            }
            remaining.retain(|id| !planned.contains(id));
            groups.push(group);
        }

        Ok(groups)
    }

    /// Greedy disjoint-file selection over a ready set: keep the first
    /// task, then every later task whose files do not overlap the union
    /// of files already in the group.
    fn disjoint_prefix(ready: &[&TaskNode]) -> Vec<TaskNode> {
        let mut group: Vec<TaskNode> = Vec::new();
        let mut used_files: BTreeSet<&str> = BTreeSet::new();

        for task in ready {
            let overlap: Vec<&str> = task
                .files
                .iter()
                .map(String::as_str)
                .filter(|f| used_files.contains(*f))
                .collect();
            if group.is_empty() || overlap.is_empty() {
                used_files.extend(task.files.iter().map(String::as_str));
                group.push((*task).clone());
            } else {
                info!(
                    "file conflict: {} deferred to a later group (overlap: {overlap:?})",
                    task.id
                );
            }
        }

        group
    }

    /// Enumerate all pairwise file overlaps among the graph's tasks.
    pub fn file_conflicts(&self) -> Vec<FileConflict> {
        let tasks: Vec<&TaskNode> = self.tasks().collect();
        let mut conflicts = Vec::new();

        for (i, first) in tasks.iter().enumerate() {
            for second in &tasks[i + 1..] {
                let overlap: BTreeSet<String> =
                    first.files.intersection(&second.files).cloned().collect();
                if !overlap.is_empty() {
                    conflicts.push(FileConflict {
                        first: first.id.clone(),
                        second: second.id.clone(),
                        files: overlap,
                    });
                }
            }
        }

        conflicts
    }

    /// Tasks in topological order. Detects cycles defensively even though
    /// parsed task lists only contain backward references.
    pub fn topological_sort(&self) -> Result<Vec<&TaskNode>> {
        let mut sorted = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut in_progress: HashSet<&str> = HashSet::new();

        // Iterative DFS; `false` marks entry, `true` marks exit.
        for root in &self.order {
            if visited.contains(root.as_str()) {
                continue;
            }
            let mut stack: Vec<(&str, bool)> = vec![(root.as_str(), false)];
            while let Some((id, done)) = stack.pop() {
                if done {
                    in_progress.remove(id);
                    visited.insert(id);
                    if let Some(task) = self.nodes.get(id) {
                        sorted.push(task);
                    }
                    continue;
                }
                if visited.contains(id) {
                    continue;
                }
                if !in_progress.insert(id) {
                    return Err(OrchestratorError::DependencyCycle {
                        remaining: vec![id.to_string()],
                    });
                }
                stack.push((id, true));
                if let Some(task) = self.nodes.get(id) {
                    for dep in &task.depends_on {
                        if in_progress.contains(dep.as_str()) {
                            return Err(OrchestratorError::DependencyCycle {
                                remaining: vec![dep.clone()],
                            });
                        }
                        if self.nodes.contains_key(dep) && !visited.contains(dep.as_str()) {
                            stack.push((dep.as_str(), false));
                        }
                    }
                }
            }
        }

        Ok(sorted)
    }
}

/// Parse a task-list document into a dependency graph.
///
/// Recognizes `## Phase ...` headers and unchecked `- [ ]` items. Each
/// task depends on the previous task of its phase; inferred agent-chain
/// dependencies (for example `code-writer` → `code-reviewer`) come from
/// the configured chain table and always serialize the chained pair.
pub fn parse_tasks(content: &str, config: &ParallelConfig) -> Result<DependencyGraph> {
    let file_patterns: Vec<Regex> = config
        .file_patterns
        .iter()
        .map(|p| Regex::new(p))
        .collect::<std::result::Result<_, _>>()?;

    let mut tasks: Vec<TaskNode> = Vec::new();
    let mut current_phase = String::new();
    let mut last_in_phase: HashMap<String, String> = HashMap::new();

    for line in content.lines() {
        let line = line.trim();

        if line.starts_with("## Phase") {
            let name = line.trim_start_matches('#').trim();
            current_phase = name.split(':').next().unwrap_or(name).trim().to_string();
            continue;
        }

        if let Some(item) = line.strip_prefix("- [ ]") {
            let text = item.trim();
            let short = text.split_whitespace().next().unwrap_or("task");
            let id = format!("{current_phase}/{short}");

            let mut task = TaskNode::new(id.clone(), infer_agent(text, config), text)
                .with_files(infer_files(text, &file_patterns));

            if let Some(previous) = last_in_phase.get(&current_phase) {
                task.depends_on.push(previous.clone());
            }
            last_in_phase.insert(current_phase.clone(), id);
            tasks.push(task);
        }
    }

    apply_agent_chains(&mut tasks, config);
    Ok(DependencyGraph::from_tasks(tasks))
}

/// Infer the agent from the keyword table; first matching row wins.
fn infer_agent(text: &str, config: &ParallelConfig) -> String {
    let lower = text.to_lowercase();
    for row in &config.agent_keywords {
        if row.keywords.iter().any(|k| lower.contains(&k.to_lowercase())) {
            return row.agent.clone();
        }
    }
    config.default_agent.clone()
}

/// Extract file-name-like tokens approximating the task's write set.
fn infer_files(text: &str, patterns: &[Regex]) -> BTreeSet<String> {
    let mut files = BTreeSet::new();
    for pattern in patterns {
        for captures in pattern.captures_iter(text) {
            if let Some(m) = captures.get(1).or_else(|| captures.get(0)) {
                files.insert(m.as_str().to_string());
            }
        }
    }
    files
}

/// Wire configured agent chains as explicit dependencies: every task of
/// a follower agent depends on the closest preceding task of its chain
/// leader, so chained pairs never run in the same group.
fn apply_agent_chains(tasks: &mut [TaskNode], config: &ParallelConfig) {
    let leaders_of = |agent: &str| -> Vec<&str> {
        config
            .agent_chains
            .iter()
            .filter(|(_, followers)| followers.iter().any(|f| f == agent))
            .map(|(leader, _)| leader.as_str())
            .collect()
    };

    for i in 0..tasks.len() {
        let leaders = leaders_of(&tasks[i].agent);
        if leaders.is_empty() {
            continue;
        }
        let dependency = tasks[..i]
            .iter()
            .rev()
            .find(|t| leaders.contains(&t.agent.as_str()))
            .map(|t| t.id.clone());
        if let Some(dep) = dependency
            && !tasks[i].depends_on.contains(&dep)
        {
            debug!("agent chain: {} depends on {dep}", tasks[i].id);
            tasks[i].depends_on.push(dep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn task(id: &str, files: &[&str], deps: &[&str]) -> TaskNode {
        TaskNode::new(id, "code-writer", format!("work on {id}"))
            .with_files(files.iter().copied())
            .with_dependencies(deps.iter().copied())
    }

    #[test]
    fn empty_graph_has_no_groups() {
        let graph = DependencyGraph::new();
        assert!(graph.is_empty());
        assert!(graph.parallel_groups().unwrap().is_empty());
        assert!(graph.ready_tasks().is_empty());
    }

    #[test]
    fn independent_disjoint_tasks_form_one_group() {
        let graph = DependencyGraph::from_tasks(vec![
            task("a", &["x.c"], &[]),
            task("b", &["y.c"], &[]),
        ]);
        let groups = graph.parallel_groups().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }

    #[test]
    fn file_overlap_splits_the_group() {
        let graph = DependencyGraph::from_tasks(vec![
            task("a", &["m.c"], &[]),
            task("b", &["m.c"], &[]),
        ]);
        let groups = graph.parallel_groups().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0][0].id, "a");
        assert_eq!(groups[1][0].id, "b");
    }

    #[test]
    fn dependencies_order_the_groups() {
        let graph = DependencyGraph::from_tasks(vec![
            task("a", &["a.c"], &[]),
            task("b", &["b.c"], &["a"]),
            task("c", &["c.c"], &["a"]),
            task("d", &["d.c"], &["b", "c"]),
        ]);
        let groups = graph.parallel_groups().unwrap();
        let ids: Vec<Vec<&str>> = groups
            .iter()
            .map(|g| g.iter().map(|t| t.id.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn partition_is_complete_and_disjoint() {
        let graph = DependencyGraph::from_tasks(vec![
            task("a", &["1.c"], &[]),
            task("b", &["2.c"], &[]),
            task("c", &["1.c"], &["a"]),
            task("d", &["3.c"], &[]),
        ]);
        let groups = graph.parallel_groups().unwrap();

        let mut seen: Vec<String> = groups
            .iter()
            .flatten()
            .map(|t| t.id.clone())
            .collect();
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c", "d"]);

        for group in &groups {
            let mut files: BTreeSet<&String> = BTreeSet::new();
            for t in group {
                for f in &t.files {
                    assert!(files.insert(f), "file {f} duplicated inside a group");
                }
            }
        }
    }

    #[test]
    fn unique_files_group_count_equals_longest_path() {
        // Chain of 3 plus an independent task: longest path length is 3.
        let graph = DependencyGraph::from_tasks(vec![
            task("a", &["a.c"], &[]),
            task("b", &["b.c"], &["a"]),
            task("c", &["c.c"], &["b"]),
            task("d", &["d.c"], &[]),
        ]);
        assert_eq!(graph.parallel_groups().unwrap().len(), 3);
    }

    #[test]
    fn cycle_is_a_hard_error() {
        let graph = DependencyGraph::from_tasks(vec![
            task("a", &["a.c"], &["b"]),
            task("b", &["b.c"], &["a"]),
        ]);
        let err = graph.parallel_groups().unwrap_err();
        assert!(matches!(err, OrchestratorError::DependencyCycle { .. }));
        assert!(graph.topological_sort().is_err());
    }

    #[test]
    fn ready_tasks_respect_runtime_status() {
        let mut graph = DependencyGraph::from_tasks(vec![
            task("a", &[], &[]),
            task("b", &[], &["a"]),
        ]);
        assert_eq!(graph.ready_tasks().len(), 1);
        graph.set_status("a", TaskStatus::Completed);
        let ready = graph.ready_tasks();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "b");
    }

    #[test]
    fn removing_a_task_also_drops_it_from_dependencies() {
        let mut graph = DependencyGraph::from_tasks(vec![
            task("a", &[], &[]),
            task("b", &[], &["a"]),
        ]);
        graph.remove_task("a");
        assert_eq!(graph.len(), 1);
        assert!(graph.get("b").unwrap().depends_on.is_empty());
        assert_eq!(graph.ready_tasks().len(), 1);
    }

    #[test]
    fn conflict_report_lists_pairwise_overlaps() {
        let graph = DependencyGraph::from_tasks(vec![
            task("a", &["src/a.cpp", "src/b.cpp"], &[]),
            task("b", &["src/b.cpp"], &[]),
            task("c", &["src/c.cpp"], &[]),
        ]);
        let conflicts = graph.file_conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].first, "a");
        assert_eq!(conflicts[0].second, "b");
        assert!(conflicts[0].files.contains("src/b.cpp"));
    }

    #[test]
    fn topological_sort_puts_dependencies_first() {
        let graph = DependencyGraph::from_tasks(vec![
            task("c", &[], &["b"]),
            task("b", &[], &["a"]),
            task("a", &[], &[]),
        ]);
        let order: Vec<&str> = graph
            .topological_sort()
            .unwrap()
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        let pos = |id: &str| order.iter().position(|o| *o == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    const TASKS_MD: &str = "\
# Tasks

## Phase 1: Core
- [ ] 1.1 implement UserService.cpp and UserService.h
- [ ] 1.2 review the new service code

## Phase 2: UI
- [ ] 2.1 create LoginPage.qml ui layout
";

    #[test]
    fn parses_phases_and_items() {
        let graph = parse_tasks(TASKS_MD, &ParallelConfig::default()).unwrap();
        assert_eq!(graph.len(), 3);

        let first = graph.get("Phase 1/1.1").unwrap();
        assert_eq!(first.agent, "code-writer");
        assert!(first.files.contains("UserService.cpp"));
        assert!(first.files.contains("UserService.h"));
        assert!(first.depends_on.is_empty());

        let second = graph.get("Phase 1/1.2").unwrap();
        assert_eq!(second.agent, "code-reviewer");
        assert_eq!(second.depends_on, vec!["Phase 1/1.1".to_string()]);
    }

    #[test]
    fn phase_boundaries_reset_the_chain() {
        let graph = parse_tasks(TASKS_MD, &ParallelConfig::default()).unwrap();
        let ui = graph.get("Phase 2/2.1").unwrap();
        assert_eq!(ui.agent, "code-writer");
        assert!(ui.depends_on.is_empty());
    }

    #[test]
    fn keyword_inference_handles_korean() {
        let config = ParallelConfig::default();
        assert_eq!(infer_agent("서비스 설계 작업", &config), "architect");
        assert_eq!(infer_agent("코드 리뷰 진행", &config), "code-reviewer");
        assert_eq!(infer_agent("plain unmatched text", &config), "task-manager");
    }

    #[test]
    fn agent_chains_serialize_writer_then_reviewer() {
        let content = "\
## Phase 1: A
- [ ] 1.1 implement module alpha in alpha.cpp

## Phase 2: B
- [ ] 2.1 review module alpha
";
        let graph = parse_tasks(content, &ParallelConfig::default()).unwrap();
        let review = graph.get("Phase 2/2.1").unwrap();
        assert!(review.depends_on.contains(&"Phase 1/1.1".to_string()));
    }
}
