//! Declarative rule table and the matching engine.
//!
//! Rules are data, not code: new agent transitions are expressible
//! without touching the engine. Every rule carries a trigger (filter on
//! the previous agent, its status, and its context) and an action
//! (dispatch the next agent, ask the user for a decision, fan out a
//! parallel task set, or complete the workflow).
//!
//! Matching walks rules in declaration order; the first match wins.

use regex::Regex;
use regex::RegexBuilder;
use serde::Deserialize;
use serde::Serialize;

use crate::error::OrchestratorError;
use crate::error::Result;
use crate::protocol::StatusTag;
use crate::protocol::WorkflowStatus;

/// Trigger type for workflow-start rules. Absent on steady-state rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Unconditional workflow start
    Start,
    /// Start of a resumed or pattern-selected session
    #[serde(alias = "session")]
    SessionStart,
}

/// Agent filter: a single agent name or a list of names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentFilter {
    One(String),
    Many(Vec<String>),
}

impl AgentFilter {
    pub fn matches(&self, agent: &str) -> bool {
        match self {
            AgentFilter::One(name) => name == agent,
            AgentFilter::Many(names) => names.iter().any(|n| n == agent),
        }
    }
}

/// Filter deciding whether a rule applies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trigger {
    /// `start` / `session_start` for initial rules, absent otherwise.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TriggerKind>,

    /// Previous agent, or any if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentFilter>,

    /// Previous status tag, or any if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusTag>,

    /// Case-insensitive regex that must match the status context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_contains: Option<String>,

    /// Case-insensitive regex that must NOT match the status context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_excludes: Option<String>,

    /// For `session_start` without a resume file: substring that must be
    /// present in the user's initial prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// For `session_start`: only accept when the resume file exists.
    #[serde(default)]
    pub requires_session_file: bool,

    /// Initial-rule selection order (higher first).
    #[serde(default)]
    pub priority: i64,
}

/// What a matched rule does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Run the named agent next
    Dispatch,
    /// Present options and let the user pick the next agent
    Decision,
    /// Hand a task set to the parallel executor
    Parallel,
    /// Terminate the workflow successfully
    Complete,
}

/// One selectable option of a `decision` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOption {
    pub label: String,
    pub agent: String,
}

/// Action block of a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleAction {
    #[serde(rename = "type")]
    pub kind: ActionKind,

    /// Next agent for `dispatch`; absent keeps the current agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,

    /// Prompt template for the next step. `{context}` is replaced with
    /// the previous status context.
    #[serde(default, alias = "prompt", skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,

    /// Message shown for `decision` and `complete` actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Options for `decision` actions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<DecisionOption>,

    /// Task-list file for `parallel` actions. `{context}` is substituted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks_file: Option<String>,

    /// Change id used for branch naming in `parallel` actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_id: Option<String>,
}

/// Policy applied when a rule's retry budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnExhaustedKind {
    /// Fall back to the interactive agent picker
    AskUser,
    /// Terminate the workflow as failed
    #[default]
    Fail,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OnExhausted {
    #[serde(rename = "type", default)]
    pub kind: OnExhaustedKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Retry block of a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max: u32,
    #[serde(default)]
    pub on_exhausted: OnExhausted,
}

const fn default_max_retries() -> u32 {
    3
}

/// A declarative workflow rule. Loaded once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub trigger: Trigger,
    pub action: RuleAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl Rule {
    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }
}

/// Result of matching a rule, with any captured context groups.
#[derive(Debug, Clone)]
pub struct RuleMatch<'a> {
    pub rule: &'a Rule,
    /// Groups captured by `context_contains`, in order.
    pub captures: Vec<String>,
}

#[derive(Debug)]
struct CompiledTrigger {
    contains: Option<Regex>,
    excludes: Option<Regex>,
}

/// Match rules against agent output and status.
#[derive(Debug)]
pub struct RuleEngine {
    rules: Vec<Rule>,
    compiled: Vec<CompiledTrigger>,
}

impl RuleEngine {
    /// Build an engine, compiling every context regex up front. A rule
    /// with a regex that does not compile is rejected here rather than at
    /// match time.
    pub fn new(rules: Vec<Rule>) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in &rules {
            compiled.push(CompiledTrigger {
                contains: compile_context(rule, rule.trigger.context_contains.as_deref())?,
                excludes: compile_context(rule, rule.trigger.context_excludes.as_deref())?,
            });
        }
        Ok(Self { rules, compiled })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn rule_by_id(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Find the initial rule to start the workflow.
    ///
    /// Only `start` / `session_start` triggers are considered, ordered by
    /// declared priority (descending; declaration order breaks ties). A
    /// `session_start` rule that requires the resume file is accepted when
    /// the file exists; one that does not is accepted when its pattern
    /// substring occurs in the user prompt. A `start` rule is accepted
    /// unconditionally.
    pub fn find_initial(&self, user_prompt: &str, session_file_exists: bool) -> Option<&Rule> {
        let mut candidates: Vec<&Rule> = self
            .rules
            .iter()
            .filter(|r| r.trigger.kind.is_some())
            .collect();
        candidates.sort_by_key(|r| std::cmp::Reverse(r.trigger.priority));

        for rule in candidates {
            match rule.trigger.kind {
                Some(TriggerKind::SessionStart) => {
                    if rule.trigger.requires_session_file {
                        if session_file_exists {
                            return Some(rule);
                        }
                    } else if let Some(pattern) = &rule.trigger.pattern
                        && !pattern.is_empty()
                        && user_prompt.contains(pattern.as_str())
                    {
                        return Some(rule);
                    }
                }
                Some(TriggerKind::Start) => return Some(rule),
                None => {}
            }
        }

        None
    }

    /// Find the first steady-state rule matching the given agent and
    /// status. Declaration order is the tie-break. `None` is a legitimate
    /// outcome handled by the driver via the fallback UI.
    pub fn match_rule(&self, agent: &str, status: &WorkflowStatus) -> Option<RuleMatch<'_>> {
        for (rule, compiled) in self.rules.iter().zip(&self.compiled) {
            // Initial rules are handled by find_initial.
            if rule.trigger.kind.is_some() {
                continue;
            }

            if let Some(filter) = &rule.trigger.agent
                && !filter.matches(agent)
            {
                continue;
            }

            if let Some(required) = rule.trigger.status
                && required != status.tag
            {
                continue;
            }

            // Exclusion dominates inclusion.
            if let Some(excludes) = &compiled.excludes
                && excludes.is_match(&status.context)
            {
                continue;
            }

            let mut captures = Vec::new();
            if let Some(contains) = &compiled.contains {
                let Some(found) = contains.captures(&status.context) else {
                    continue;
                };
                captures.extend(
                    found
                        .iter()
                        .skip(1)
                        .flatten()
                        .map(|m| m.as_str().to_string()),
                );
            }

            return Some(RuleMatch { rule, captures });
        }

        None
    }
}

fn compile_context(rule: &Rule, pattern: Option<&str>) -> Result<Option<Regex>> {
    let Some(pattern) = pattern else {
        return Ok(None);
    };
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map(Some)
        .map_err(|e| OrchestratorError::InvalidRule {
            id: rule.id.clone(),
            message: format!("context pattern does not compile: {e}"),
        })
}
