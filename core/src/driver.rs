//! Sequential driver: the parse → match → dispatch → record loop.
//!
//! The driver owns the execution state and the current (agent, prompt,
//! rule) triple. Each iteration it injects the protocol block, invokes
//! the runner, parses the reply, records the step, and asks the rule
//! engine what to do next. No agent fault ever crosses this boundary as
//! an error: FAILED terminates via the rule path, UNKNOWN and rule-match
//! misses fall back to the interactive picker.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::WorkflowConfig;
use crate::error::OrchestratorError;
use crate::error::Result;
use crate::graph;
use crate::parallel::ParallelRunner;
use crate::protocol::PromptInjector;
use crate::protocol::StatusParser;
use crate::protocol::StatusSource;
use crate::protocol::StatusTag;
use crate::protocol::WorkflowStatus;
use crate::rules::ActionKind;
use crate::rules::OnExhaustedKind;
use crate::rules::RuleEngine;
use crate::runner::AgentRunner;
use crate::state::WorkflowState;
use crate::ui::WorkflowUi;
use crate::worktree::WorktreeManager;

/// Presence of this file selects the session-resume entry rules. Its
/// contents are owned elsewhere; only existence matters here.
const SESSION_STATE_FILE: &str = ".claude/session-state.json";

/// Execution logs land here, one JSON file per run.
const LOG_DIR: &str = ".claude/logs";

/// Agent name recorded for parallel fan-out steps.
const PARALLEL_AGENT: &str = "parallel-executor";

/// The next thing the loop will execute.
enum Step {
    Agent {
        agent: String,
        prompt: String,
        rule_id: String,
    },
    Parallel {
        tasks_file: String,
        change_id: String,
        rule_id: String,
    },
}

/// Drives a workflow from the initial prompt to completion or failure.
pub struct WorkflowDriver {
    config: WorkflowConfig,
    project_dir: PathBuf,
    parser: StatusParser,
    injector: PromptInjector,
    engine: RuleEngine,
    state: WorkflowState,
    runner: Arc<dyn AgentRunner>,
    worktrees: Arc<WorktreeManager>,
    ui: Arc<dyn WorkflowUi>,
    cancel: CancellationToken,
    mock: bool,
}

impl WorkflowDriver {
    pub fn new(
        config: WorkflowConfig,
        project_dir: &Path,
        runner: Arc<dyn AgentRunner>,
        ui: Arc<dyn WorkflowUi>,
        cancel: CancellationToken,
        mock: bool,
    ) -> Result<Self> {
        let parser = StatusParser::new(&config.protocol)?;
        let injector = PromptInjector::new(config.prompt_injection.enabled);
        let engine = RuleEngine::new(config.rules.clone())?;
        let state = WorkflowState::new(config.limits.clone());
        let worktrees = Arc::new(WorktreeManager::new(project_dir, &config.parallel));

        Ok(Self {
            config,
            project_dir: project_dir.to_path_buf(),
            parser,
            injector,
            engine,
            state,
            runner,
            worktrees,
            ui,
            cancel,
            mock,
        })
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Run the workflow. Returns `Ok(true)` when a `complete` action was
    /// reached; the summary and execution log are emitted on every exit
    /// path.
    pub async fn run(&mut self, initial_prompt: &str) -> Result<bool> {
        let mode = if self.mock { "MOCK MODE" } else { "AGENT MODE" };
        self.ui.header(&format!("WORKFLOW ORCHESTRATOR ({mode})"));

        let session_file_exists = self.project_dir.join(SESSION_STATE_FILE).exists();
        if session_file_exists {
            self.ui
                .info("Session state detected - checking for restore...");
        }

        let Some(initial_rule) = self
            .engine
            .find_initial(initial_prompt, session_file_exists)
        else {
            self.ui.error("No initial rule found in workflow config");
            return Err(OrchestratorError::NoInitialRule);
        };
        info!("initial rule: {}", initial_rule.id);

        let mut step = Step::Agent {
            agent: initial_rule
                .action
                .agent
                .clone()
                .unwrap_or_else(|| "task-manager".to_string()),
            prompt: initial_prompt.to_string(),
            rule_id: initial_rule.id.clone(),
        };

        loop {
            if self.cancel.is_cancelled() {
                self.ui.error("Interrupted by user");
                self.state.failed = true;
                break;
            }

            if self.state.is_at_limit() && !self.confirm("Max iterations reached") {
                self.state.failed = true;
                break;
            }
            if self.state.is_in_loop() && !self.confirm("Loop detected") {
                self.state.failed = true;
                break;
            }

            let (agent, status) = match &step {
                Step::Agent {
                    agent,
                    prompt,
                    rule_id,
                } => {
                    let agent = agent.clone();
                    let prompt = prompt.clone();
                    let rule_id = rule_id.clone();

                    self.ui
                        .iteration_started(self.state.iteration() + 1, &agent, self.mock);

                    let full_prompt = self.injector.inject(&prompt);
                    let started = Instant::now();
                    let output = tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.ui.error("Interrupted by user");
                            self.state.failed = true;
                            break;
                        }
                        output = self.runner.run(&agent, &full_prompt) => output,
                    };
                    let duration = started.elapsed().as_secs_f64();

                    self.ui.output_preview(&output);

                    let status = self.parser.parse(&output);
                    self.ui.status_parsed(&status);
                    self.state
                        .record(&agent, &prompt, &status, duration, Some(&rule_id));
                    (agent, status)
                }
                Step::Parallel {
                    tasks_file,
                    change_id,
                    rule_id,
                } => {
                    let tasks_file = tasks_file.clone();
                    let change_id = change_id.clone();
                    let rule_id = rule_id.clone();

                    self.ui.iteration_started(
                        self.state.iteration() + 1,
                        PARALLEL_AGENT,
                        self.mock,
                    );

                    let started = Instant::now();
                    let status = self.execute_parallel(&tasks_file, &change_id).await;
                    let duration = started.elapsed().as_secs_f64();

                    self.ui.status_parsed(&status);
                    self.state
                        .record(PARALLEL_AGENT, &tasks_file, &status, duration, Some(&rule_id));
                    (PARALLEL_AGENT.to_string(), status)
                }
            };

            if status.tag == StatusTag::Failed {
                self.ui.error(&format!("Agent failed: {}", status.context));
                self.state.failed = true;
                break;
            }

            if status.tag == StatusTag::Unknown {
                match self.ask_fallback() {
                    Some(next) => {
                        step = next;
                        continue;
                    }
                    None => break,
                }
            }

            let Some(matched) = self.engine.match_rule(&agent, &status) else {
                self.ui.no_rule_matched();
                match self.ask_fallback() {
                    Some(next) => {
                        step = next;
                        continue;
                    }
                    None => break,
                }
            };
            let rule_id = matched.rule.id.clone();
            let action = matched.rule.action.clone();
            let retry = matched.rule.retry.clone();
            self.ui.rule_matched(&rule_id, matched.rule.description());
            debug!("matched rule {rule_id} with {} captures", matched.captures.len());

            match action.kind {
                ActionKind::Complete => {
                    let message = action
                        .message
                        .as_deref()
                        .unwrap_or("Workflow complete!");
                    self.ui.workflow_complete(message);
                    self.state.complete = true;
                    break;
                }

                ActionKind::Decision => {
                    let message = action.message.as_deref().unwrap_or("Choose next action:");
                    let Some(choice) = self.ui.choose_decision(message, &action.options) else {
                        break;
                    };
                    let Some(option) = action.options.get(choice) else {
                        warn!("decision option {choice} out of range");
                        break;
                    };
                    let template = action.prompt_template.as_deref().unwrap_or("{context}");
                    step = Step::Agent {
                        agent: option.agent.clone(),
                        prompt: expand(template, &status.context),
                        rule_id: format!("{rule_id}_decision"),
                    };
                }

                ActionKind::Parallel => {
                    // Validated at config load: tasks_file is present.
                    let Some(tasks_file) = action.tasks_file.as_deref() else {
                        self.state.failed = true;
                        break;
                    };
                    step = Step::Parallel {
                        tasks_file: expand(tasks_file, &status.context),
                        change_id: action
                            .change_id
                            .clone()
                            .unwrap_or_else(|| "workflow".to_string()),
                        rule_id: rule_id.clone(),
                    };
                }

                ActionKind::Dispatch => {
                    if let Some(policy) = &retry {
                        if !self.state.can_retry(&rule_id, policy.max) {
                            match policy.on_exhausted.kind {
                                OnExhaustedKind::AskUser => {
                                    let message = policy
                                        .on_exhausted
                                        .message
                                        .as_deref()
                                        .unwrap_or("Retry limit reached");
                                    self.ui.error(message);
                                    match self.ask_fallback() {
                                        Some(next) => {
                                            step = next;
                                            continue;
                                        }
                                        None => break,
                                    }
                                }
                                OnExhaustedKind::Fail => {
                                    self.state.failed = true;
                                    break;
                                }
                            }
                        }
                        self.state.increment_retry(&rule_id);
                    }

                    let next_agent = action.agent.clone().unwrap_or_else(|| agent.clone());
                    let template = action
                        .prompt_template
                        .as_deref()
                        .unwrap_or("Continue workflow");
                    step = Step::Agent {
                        agent: next_agent,
                        prompt: expand(template, &status.context),
                        rule_id,
                    };
                }
            }
        }

        self.finish()
    }

    /// Emit the summary and persist the execution log.
    fn finish(&self) -> Result<bool> {
        self.ui.summary(&self.state.summary());

        let log_dir = self.project_dir.join(LOG_DIR);
        match self.state.save_log(&log_dir) {
            Ok(log_file) => {
                self.ui
                    .info(&format!("Log saved to: {}", log_file.display()));
            }
            Err(e) => warn!("failed to save execution log: {e}"),
        }

        Ok(self.state.complete)
    }

    fn confirm(&self, reason: &str) -> bool {
        self.ui.confirm_continue(reason)
    }

    /// No rule (or no status) to go on: ask the user for an agent and an
    /// ad-hoc prompt. `None` stops the run without marking it failed.
    fn ask_fallback(&self) -> Option<Step> {
        let choice = self
            .ui
            .choose_fallback(&self.config.runner.available_agents)?;
        Some(Step::Agent {
            agent: choice.agent,
            prompt: choice.prompt,
            rule_id: "manual".to_string(),
        })
    }

    /// Run a parallel fan-out and reify its outcome as a status, so the
    /// rule table stays in control of what happens next.
    async fn execute_parallel(&self, tasks_file: &str, change_id: &str) -> WorkflowStatus {
        let path = self.project_dir.join(tasks_file);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                return WorkflowStatus::new(
                    StatusTag::Failed,
                    format!("Task file not readable: {} ({e})", path.display()),
                    StatusSource::Fallback,
                );
            }
        };

        let mut graph = match graph::parse_tasks(&content, &self.config.parallel) {
            Ok(graph) => graph,
            Err(e) => {
                return WorkflowStatus::new(
                    StatusTag::Failed,
                    format!("Task file parse error: {e}"),
                    StatusSource::Fallback,
                );
            }
        };

        if graph.is_empty() {
            return WorkflowStatus::new(
                StatusTag::Ready,
                "Parallel execution: no open tasks",
                StatusSource::Fallback,
            );
        }

        let runner = ParallelRunner::new(
            Arc::clone(&self.runner),
            Arc::clone(&self.worktrees),
            self.config.parallel.max_concurrent_agents,
            self.cancel.clone(),
        );

        match runner.run_graph(&mut graph, change_id, "HEAD").await {
            Ok(result) => {
                for merge in &result.merge_results {
                    self.ui.merge_reported(merge);
                }
                self.ui.parallel_summary(&result);

                let succeeded = result.results.iter().filter(|r| r.success).count();
                let context = if result.success {
                    format!(
                        "Parallel execution complete: {succeeded}/{} tasks, {} merges",
                        result.results.len(),
                        result.merge_results.len()
                    )
                } else if result.conflicts.is_empty() {
                    format!(
                        "Parallel execution failed: {succeeded}/{} tasks succeeded",
                        result.results.len()
                    )
                } else {
                    format!(
                        "Parallel execution failed: merge conflicts in {}",
                        result.conflicts.join(", ")
                    )
                };

                let tag = if result.success {
                    StatusTag::Ready
                } else {
                    StatusTag::Failed
                };
                WorkflowStatus::new(tag, context, StatusSource::Fallback)
            }
            Err(e) => WorkflowStatus::new(
                StatusTag::Failed,
                format!("Parallel execution error: {e}"),
                StatusSource::Fallback,
            ),
        }
    }
}

fn expand(template: &str, context: &str) -> String {
    template.replace("{context}", context)
}
