//! Parallel executor scenarios against real git repositories.
//!
//! The scripted runner behaves like a well-behaved agent in parallel
//! mode: it reads its working directory from the prompt header, writes
//! the files it was told to, commits, and reports READY.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use orchex_core::config::ParallelConfig;
use orchex_core::graph::DependencyGraph;
use orchex_core::graph::TaskNode;
use orchex_core::graph::TaskStatus;
use orchex_core::parallel::AgentTask;
use orchex_core::parallel::ParallelRunner;
use orchex_core::runner::AgentRunner;
use orchex_core::worktree::WorktreeManager;

/// What the scripted agent does inside its worktree.
#[derive(Clone)]
enum Behavior {
    /// Write the given files (name, content), commit, report READY.
    Commit(Vec<(String, String)>),
    /// Report FAILED without touching anything.
    Fail,
}

struct ScriptedRunner {
    behaviors: HashMap<String, Behavior>,
}

impl ScriptedRunner {
    fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
        }
    }

    fn agent(mut self, agent: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(agent.to_string(), behavior);
        self
    }
}

/// Extract the worktree path from the parallel-mode prompt header.
fn working_directory(prompt: &str) -> Option<PathBuf> {
    prompt
        .lines()
        .find_map(|line| line.strip_prefix("Working Directory: "))
        .map(|path| PathBuf::from(path.trim()))
}

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

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn run(&self, agent: &str, prompt: &str) -> String {
        let behavior = self
            .behaviors
            .get(agent)
            .cloned()
            .unwrap_or(Behavior::Commit(Vec::new()));

        match behavior {
            Behavior::Fail => {
                "[WORKFLOW_STATUS]\nstatus: FAILED\ncontext: scripted failure".to_string()
            }
            Behavior::Commit(files) => {
                if !files.is_empty() {
                    let Some(dir) = working_directory(prompt) else {
                        return "[WORKFLOW_STATUS]\nstatus: FAILED\ncontext: no worktree header"
                            .to_string();
                    };
                    for (name, content) in &files {
                        std::fs::write(dir.join(name), content).unwrap();
                    }
                    git(&dir, &["add", "."]).await;
                    git(&dir, &["commit", "-m", &format!("{agent} changes")]).await;
                }
                format!(
                    "# {agent} report\n\n[WORKFLOW_STATUS]\nstatus: READY\ncontext: {agent} done"
                )
            }
        }
    }
}

async fn setup_repo() -> (TempDir, Arc<WorktreeManager>) {
    let temp = TempDir::new().unwrap();
    let repo = temp.path();

    git(repo, &["init", "-b", "main"]).await;
    git(repo, &["config", "user.email", "test@example.com"]).await;
    git(repo, &["config", "user.name", "Test User"]).await;
    std::fs::write(repo.join("README.md"), "# Test Repo\n").unwrap();
    git(repo, &["add", "."]).await;
    git(repo, &["commit", "-m", "initial commit"]).await;

    let manager = Arc::new(WorktreeManager::new(repo, &ParallelConfig::default()));
    (temp, manager)
}

fn parallel_runner(runner: Arc<dyn AgentRunner>, worktrees: Arc<WorktreeManager>) -> ParallelRunner {
    ParallelRunner::new(runner, worktrees, 4, CancellationToken::new())
}

fn node(id: &str, agent: &str, files: &[&str], deps: &[&str]) -> TaskNode {
    TaskNode::new(id, agent, format!("work on {id}"))
        .with_files(files.iter().copied())
        .with_dependencies(deps.iter().copied())
}

#[tokio::test]
async fn disjoint_tasks_run_as_one_group_and_merge() {
    let (temp, worktrees) = setup_repo().await;
    let runner = Arc::new(
        ScriptedRunner::new()
            .agent(
                "writer-a",
                Behavior::Commit(vec![("x.c".to_string(), "int x;\n".to_string())]),
            )
            .agent(
                "writer-b",
                Behavior::Commit(vec![("y.c".to_string(), "int y;\n".to_string())]),
            ),
    );

    let mut graph = DependencyGraph::from_tasks(vec![
        node("a", "writer-a", &["x.c"], &[]),
        node("b", "writer-b", &["y.c"], &[]),
    ]);
    assert_eq!(graph.parallel_groups().unwrap().len(), 1);

    let executor = parallel_runner(runner, Arc::clone(&worktrees));
    let result = executor.run_graph(&mut graph, "c1", "HEAD").await.unwrap();

    assert!(result.success);
    assert_eq!(result.results.len(), 2);
    assert_eq!(result.merge_results.len(), 2);
    assert!(result.merge_results.iter().all(|m| m.success));
    assert!(result.conflicts.is_empty());

    // Both agents' work was merged back into the repository.
    assert!(temp.path().join("x.c").exists());
    assert!(temp.path().join("y.c").exists());

    // Every worktree was deleted on the way out.
    assert!(worktrees.active_worktrees().await.is_empty());
    assert_eq!(graph.get("a").unwrap().status, TaskStatus::Completed);
    assert_eq!(graph.get("b").unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn overlapping_files_serialize_into_two_groups() {
    let (_temp, worktrees) = setup_repo().await;
    let runner = Arc::new(
        ScriptedRunner::new()
            .agent(
                "writer-a",
                Behavior::Commit(vec![("m.c".to_string(), "int a;\n".to_string())]),
            )
            .agent(
                "writer-b",
                Behavior::Commit(vec![("n.c".to_string(), "int b;\n".to_string())]),
            ),
    );

    // Both tasks declare m.c, so they must not share a group.
    let mut graph = DependencyGraph::from_tasks(vec![
        node("a", "writer-a", &["m.c"], &[]),
        node("b", "writer-b", &["m.c"], &[]),
    ]);
    let groups = graph.parallel_groups().unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].len(), 1);
    assert_eq!(groups[1].len(), 1);

    let executor = parallel_runner(runner, Arc::clone(&worktrees));
    let result = executor.run_graph(&mut graph, "c2", "HEAD").await.unwrap();

    assert!(result.success);
    assert_eq!(result.results.len(), 2);
    assert_eq!(result.merge_results.len(), 2);
    assert!(worktrees.active_worktrees().await.is_empty());
}

#[tokio::test]
async fn conflicting_merges_flag_the_run_and_keep_cleanup() {
    let (_temp, worktrees) = setup_repo().await;
    // Declared file sets are disjoint (bypassing inference), but both
    // agents actually write z.c, so the second merge must conflict.
    let runner = Arc::new(
        ScriptedRunner::new()
            .agent(
                "writer-a",
                Behavior::Commit(vec![("z.c".to_string(), "int a;\n".to_string())]),
            )
            .agent(
                "writer-b",
                Behavior::Commit(vec![("z.c".to_string(), "int b;\n".to_string())]),
            ),
    );

    let tasks = vec![
        AgentTask {
            id: "a".to_string(),
            agent: "writer-a".to_string(),
            prompt: "write z".to_string(),
            change_id: "c3".to_string(),
        },
        AgentTask {
            id: "b".to_string(),
            agent: "writer-b".to_string(),
            prompt: "write z too".to_string(),
            change_id: "c3".to_string(),
        },
    ];

    let executor = parallel_runner(runner, Arc::clone(&worktrees));
    let result = executor.run_parallel(&tasks, "HEAD").await;

    assert!(!result.success);
    assert_eq!(result.results.len(), 2);
    assert!(result.results.iter().all(|r| r.success));
    assert_eq!(result.merge_results.len(), 2);
    assert!(result.merge_results[0].success);
    assert!(!result.merge_results[1].success);
    assert_eq!(result.conflicts, vec!["z.c".to_string()]);

    assert!(worktrees.active_worktrees().await.is_empty());
}

#[tokio::test]
async fn failed_task_skips_all_later_groups() {
    let (_temp, worktrees) = setup_repo().await;
    let runner = Arc::new(
        ScriptedRunner::new()
            .agent("failing-writer", Behavior::Fail)
            .agent(
                "writer-b",
                Behavior::Commit(vec![("b.c".to_string(), "int b;\n".to_string())]),
            ),
    );

    let mut graph = DependencyGraph::from_tasks(vec![
        node("a", "failing-writer", &["a.c"], &[]),
        node("b", "writer-b", &["b.c"], &["a"]),
        node("c", "writer-c", &["c.c"], &["b"]),
    ]);

    let executor = parallel_runner(runner, Arc::clone(&worktrees));
    let result = executor.run_graph(&mut graph, "c4", "HEAD").await.unwrap();

    assert!(!result.success);
    // Only the first group ran.
    assert_eq!(result.results.len(), 1);
    assert!(!result.results[0].success);
    assert!(result.merge_results.is_empty());

    assert_eq!(graph.get("a").unwrap().status, TaskStatus::Failed);
    assert_eq!(graph.get("b").unwrap().status, TaskStatus::Skipped);
    assert_eq!(graph.get("c").unwrap().status, TaskStatus::Skipped);
    assert!(worktrees.active_worktrees().await.is_empty());
}

#[tokio::test]
async fn worktree_failure_is_a_task_failure_not_a_crash() {
    let (temp, _) = setup_repo().await;
    // Capacity of one: the second create is refused, but the run still
    // completes and the first task still merges.
    let config = ParallelConfig {
        max_worktrees: 1,
        max_concurrent_agents: 1,
        ..ParallelConfig::default()
    };
    let worktrees = Arc::new(WorktreeManager::new(temp.path(), &config));
    let runner = Arc::new(
        ScriptedRunner::new()
            .agent(
                "writer-a",
                Behavior::Commit(vec![("a.c".to_string(), "int a;\n".to_string())]),
            )
            .agent(
                "writer-b",
                Behavior::Commit(vec![("b.c".to_string(), "int b;\n".to_string())]),
            ),
    );

    let tasks = vec![
        AgentTask {
            id: "a".to_string(),
            agent: "writer-a".to_string(),
            prompt: "a".to_string(),
            change_id: "c5".to_string(),
        },
        AgentTask {
            id: "b".to_string(),
            agent: "writer-b".to_string(),
            prompt: "b".to_string(),
            change_id: "c5".to_string(),
        },
    ];

    let executor = ParallelRunner::new(runner, Arc::clone(&worktrees), 1, CancellationToken::new());
    let result = executor.run_parallel(&tasks, "HEAD").await;

    assert!(!result.success);
    // Whichever task won the race got the only worktree; the other was
    // refused and reported failed, not crashed.
    let succeeded = result.results.iter().filter(|r| r.success).count();
    assert_eq!(succeeded, 1);
    let refused = result
        .results
        .iter()
        .find(|r| !r.success)
        .and_then(|r| r.error.as_deref())
        .unwrap_or_default();
    assert!(refused.contains("Failed to create worktree"));
    // The succeeded sibling still merged.
    assert_eq!(result.merge_results.len(), 1);
    assert!(result.merge_results[0].success);
    assert!(worktrees.active_worktrees().await.is_empty());
}

/// Silent UI for driver-level runs that need no interaction.
struct SilentUi;

impl orchex_core::ui::WorkflowUi for SilentUi {
    fn header(&self, _title: &str) {}
    fn info(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
    fn iteration_started(&self, _iteration: usize, _agent: &str, _mock: bool) {}
    fn status_parsed(&self, _status: &orchex_core::protocol::WorkflowStatus) {}
    fn rule_matched(&self, _rule_id: &str, _description: &str) {}
    fn no_rule_matched(&self) {}
    fn workflow_complete(&self, _message: &str) {}
    fn output_preview(&self, _output: &str) {}
    fn summary(&self, _text: &str) {}
    fn confirm_continue(&self, _reason: &str) -> bool {
        false
    }
    fn choose_decision(
        &self,
        _message: &str,
        _options: &[orchex_core::rules::DecisionOption],
    ) -> Option<usize> {
        None
    }
    fn choose_fallback(&self, _agents: &[String]) -> Option<orchex_core::ui::FallbackChoice> {
        None
    }
    fn merge_reported(&self, _result: &orchex_core::worktree::MergeResult) {}
    fn parallel_summary(&self, _result: &orchex_core::parallel::ParallelExecutionResult) {}
}

fn parallel_pipeline_rules(tasks_file: &str) -> Vec<orchex_core::rules::Rule> {
    use orchex_core::protocol::StatusTag;
    use orchex_core::rules::ActionKind;
    use orchex_core::rules::AgentFilter;
    use orchex_core::rules::Rule;
    use orchex_core::rules::RuleAction;
    use orchex_core::rules::Trigger;
    use orchex_core::rules::TriggerKind;

    let action = |kind, agent: Option<&str>, prompt: Option<&str>| RuleAction {
        kind,
        agent: agent.map(str::to_string),
        prompt_template: prompt.map(str::to_string),
        message: None,
        options: Vec::new(),
        tasks_file: None,
        change_id: None,
    };

    vec![
        Rule {
            id: "initial".to_string(),
            description: None,
            trigger: Trigger {
                kind: Some(TriggerKind::Start),
                ..Trigger::default()
            },
            action: action(ActionKind::Dispatch, Some("task-manager"), Some("{context}")),
            retry: None,
        },
        Rule {
            id: "fan-out".to_string(),
            description: None,
            trigger: Trigger {
                agent: Some(AgentFilter::One("task-manager".to_string())),
                status: Some(StatusTag::Ready),
                ..Trigger::default()
            },
            action: RuleAction {
                kind: ActionKind::Parallel,
                agent: None,
                prompt_template: None,
                message: None,
                options: Vec::new(),
                tasks_file: Some(tasks_file.to_string()),
                change_id: Some("00042".to_string()),
            },
            retry: None,
        },
        Rule {
            id: "fan-in".to_string(),
            description: None,
            trigger: Trigger {
                agent: Some(AgentFilter::One("parallel-executor".to_string())),
                status: Some(StatusTag::Ready),
                ..Trigger::default()
            },
            action: action(ActionKind::Complete, None, None),
            retry: None,
        },
    ]
}

#[tokio::test]
async fn driver_fans_out_to_parallel_groups_and_completes() {
    use orchex_core::config::WorkflowConfig;
    use orchex_core::WorkflowDriver;

    let (temp, _) = setup_repo().await;
    std::fs::write(
        temp.path().join("tasks.md"),
        "\
## Phase 1: Writer
- [ ] 1.1 implement module one in one.cpp

## Phase 2: Editor
- [ ] 2.1 fix module two in two.cpp
",
    )
    .unwrap();
    git(temp.path(), &["add", "."]).await;
    git(temp.path(), &["commit", "-m", "add tasks"]).await;

    let runner = Arc::new(
        ScriptedRunner::new()
            .agent(
                "code-writer",
                Behavior::Commit(vec![("one.cpp".to_string(), "int one;\n".to_string())]),
            )
            .agent(
                "code-editor",
                Behavior::Commit(vec![("two.cpp".to_string(), "int two;\n".to_string())]),
            ),
    );

    let config = WorkflowConfig {
        rules: parallel_pipeline_rules("tasks.md"),
        ..WorkflowConfig::default()
    };
    let mut driver = WorkflowDriver::new(
        config,
        temp.path(),
        runner,
        Arc::new(SilentUi),
        CancellationToken::new(),
        false,
    )
    .unwrap();

    let completed = driver.run("ship the feature").await.unwrap();
    assert!(completed);

    let agents: Vec<_> = driver
        .state()
        .history()
        .iter()
        .map(|r| r.agent.clone())
        .collect();
    assert_eq!(agents, vec!["task-manager", "parallel-executor"]);

    // Both parallel branches were merged into the repository.
    assert!(temp.path().join("one.cpp").exists());
    assert!(temp.path().join("two.cpp").exists());
}

#[tokio::test]
async fn driver_parallel_action_with_missing_tasks_file_fails() {
    use orchex_core::config::WorkflowConfig;
    use orchex_core::protocol::StatusTag;
    use orchex_core::WorkflowDriver;

    let (temp, _) = setup_repo().await;
    let config = WorkflowConfig {
        rules: parallel_pipeline_rules("does-not-exist.md"),
        ..WorkflowConfig::default()
    };
    let mut driver = WorkflowDriver::new(
        config,
        temp.path(),
        Arc::new(ScriptedRunner::new()),
        Arc::new(SilentUi),
        CancellationToken::new(),
        false,
    )
    .unwrap();

    let completed = driver.run("ship it").await.unwrap();
    assert!(!completed);
    assert!(driver.state().failed);
    assert_eq!(driver.state().last_status(), Some(StatusTag::Failed));
}

#[tokio::test]
async fn empty_task_list_is_a_successful_noop() {
    let (_temp, worktrees) = setup_repo().await;
    let executor = parallel_runner(Arc::new(ScriptedRunner::new()), worktrees);
    let result = executor.run_parallel(&[], "HEAD").await;

    assert!(result.success);
    assert!(result.results.is_empty());
    assert!(result.merge_results.is_empty());
}
