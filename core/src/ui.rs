//! UI sink seam between the engine and its presentation layer.
//!
//! The driver emits formatted events and asks for decisions through this
//! trait; the CLI provides the terminal implementation. Tests plug in
//! scripted implementations.

use crate::parallel::ParallelExecutionResult;
use crate::protocol::WorkflowStatus;
use crate::rules::DecisionOption;
use crate::worktree::MergeResult;

/// An agent plus an ad-hoc prompt, picked interactively when the rule
/// table has no answer.
#[derive(Debug, Clone)]
pub struct FallbackChoice {
    pub agent: String,
    pub prompt: String,
}

/// Event sink and interaction surface of a workflow run.
pub trait WorkflowUi: Send + Sync {
    fn header(&self, title: &str);
    fn info(&self, message: &str);
    fn error(&self, message: &str);

    /// An iteration is starting for `agent`.
    fn iteration_started(&self, iteration: usize, agent: &str, mock: bool);

    /// The agent's output was parsed into a status.
    fn status_parsed(&self, status: &WorkflowStatus);

    /// A rule matched.
    fn rule_matched(&self, rule_id: &str, description: &str);

    /// No rule matched the current agent/status.
    fn no_rule_matched(&self);

    /// The workflow reached a `complete` action.
    fn workflow_complete(&self, message: &str);

    /// Raw agent output preview (verbose mode).
    fn output_preview(&self, output: &str);

    /// Final run summary table.
    fn summary(&self, text: &str);

    /// The iteration limit was hit or a loop was detected; `true`
    /// continues, `false` aborts the run.
    fn confirm_continue(&self, reason: &str) -> bool;

    /// Present decision options; returns the chosen index, or `None` to
    /// cancel the run.
    fn choose_decision(&self, message: &str, options: &[DecisionOption]) -> Option<usize>;

    /// Ask for an agent and prompt when no rule matched or the status was
    /// UNKNOWN; `None` cancels the run.
    fn choose_fallback(&self, agents: &[String]) -> Option<FallbackChoice>;

    /// One branch merge finished.
    fn merge_reported(&self, result: &MergeResult);

    /// A parallel fan-out finished.
    fn parallel_summary(&self, result: &ParallelExecutionResult);
}
