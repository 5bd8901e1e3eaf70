//! Orchestration engine for rule-driven multi-agent workflows.
//!
//! The engine drives a succession of specialized coding agents
//! (task-manager, architect, code-writer, ...) by matching each agent's
//! self-reported status against a declarative rule table, and can fan
//! independent sub-tasks out to isolated git worktrees for parallel
//! execution.
//!
//! ## Components
//! - **Status protocol** ([`protocol`]): inject the response template into
//!   prompts and parse agent replies into a tagged status.
//! - **Rule engine** ([`rules`]): pick the next rule from the previous
//!   agent, its status, and its context.
//! - **Execution state** ([`state`]): history, retry accounting, loop
//!   detection, summary, and log persistence.
//! - **Agent runner** ([`runner`]): one agent invocation, real or mock,
//!   with a wall-clock timeout.
//! - **Sequential driver** ([`driver`]): the main parse → match →
//!   dispatch → record loop.
//! - **Dependency graph** ([`graph`]): file-conflict-aware topological
//!   partition of tasks into parallel groups.
//! - **Worktree manager** ([`worktree`]): isolated per-agent git
//!   checkouts and the merge pipeline.
//! - **Parallel executor** ([`parallel`]): bounded concurrent execution
//!   of a group, then serialized merges.
//!
//! Agent output is untrusted input: every fault on the agent side is
//! reified as a `FAILED` or `UNKNOWN` status so that rule logic remains
//! the sole controller.

pub mod config;
pub mod driver;
pub mod error;
pub mod graph;
pub mod parallel;
pub mod protocol;
pub mod rules;
pub mod runner;
pub mod state;
pub mod ui;
pub mod worktree;

// Re-export main types for convenience
pub use config::LimitsConfig;
pub use config::ParallelConfig;
pub use config::PromptInjectionConfig;
pub use config::ProtocolConfig;
pub use config::RunnerConfig;
pub use config::WorkflowConfig;
pub use driver::WorkflowDriver;
pub use error::OrchestratorError;
pub use error::Result;
pub use graph::DependencyGraph;
pub use graph::FileConflict;
pub use graph::TaskNode;
pub use graph::TaskStatus;
pub use graph::parse_tasks;
pub use parallel::AgentResult;
pub use parallel::AgentTask;
pub use parallel::ParallelExecutionResult;
pub use parallel::ParallelRunner;
pub use protocol::PromptInjector;
pub use protocol::StatusParser;
pub use protocol::StatusSource;
pub use protocol::StatusTag;
pub use protocol::WorkflowStatus;
pub use rules::DecisionOption;
pub use rules::Rule;
pub use rules::RuleEngine;
pub use rules::RuleMatch;
pub use runner::AgentRunner;
pub use runner::CommandRunner;
pub use runner::MockRunner;
pub use state::ExecutionRecord;
pub use state::WorkflowState;
pub use ui::FallbackChoice;
pub use ui::WorkflowUi;
pub use worktree::MergeResult;
pub use worktree::WorktreeInfo;
pub use worktree::WorktreeManager;
