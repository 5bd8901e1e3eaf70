//! Workflow configuration: typed model of the JSON document.
//!
//! The document lives at `<project>/.claude/workflow.json` by default and
//! may either be the bare `workflow` object or wrap it under a top-level
//! `workflow` key. Everything is validated at load time — unknown action
//! types, unknown statuses, and regexes that do not compile are rejected
//! rather than deferred to match time.

use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::error::OrchestratorError;
use crate::error::Result;
use crate::protocol::StatusTag;
use crate::rules::ActionKind;
use crate::rules::Rule;

/// Protocol section: status envelope and fallback parsing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub status_block_marker: String,
    pub valid_statuses: Vec<StatusTag>,
    /// Tag → regex scanned over the output tail when no envelope exists.
    pub fallback_patterns: HashMap<StatusTag, String>,
    /// Order in which fallback patterns are tried. The default is
    /// pessimistic: FAILED before BLOCKED before READY.
    pub pattern_priority: Vec<StatusTag>,
    pub fallback_search_lines: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            status_block_marker: "[WORKFLOW_STATUS]".to_string(),
            valid_statuses: vec![
                StatusTag::Ready,
                StatusTag::Blocked,
                StatusTag::Failed,
                StatusTag::DecisionNeeded,
            ],
            fallback_patterns: HashMap::new(),
            pattern_priority: vec![StatusTag::Failed, StatusTag::Blocked, StatusTag::Ready],
            fallback_search_lines: 10,
        }
    }
}

/// Whether the protocol block is appended to outgoing prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptInjectionConfig {
    pub enabled: bool,
}

impl Default for PromptInjectionConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Iteration and timeout limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_workflow_iterations: usize,
    pub agent_timeout_seconds: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_workflow_iterations: 20,
            agent_timeout_seconds: 300,
        }
    }
}

/// Agent backend configuration for the real (non-mock) runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Command line for one agent invocation. `{agent}` is substituted
    /// with the agent name; the prompt is written to stdin.
    pub agent_command: String,
    /// Agents offered by the interactive fallback picker.
    pub available_agents: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            agent_command: "claude --print --agent {agent}".to_string(),
            available_agents: vec![
                "task-manager".to_string(),
                "architect".to_string(),
                "designer".to_string(),
                "code-writer".to_string(),
                "code-editor".to_string(),
                "code-reviewer".to_string(),
                "tester".to_string(),
                "devops".to_string(),
            ],
        }
    }
}

/// One row of the agent-inference keyword table. Checked in declaration
/// order; keywords may come from any language, the table is data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentKeywords {
    pub agent: String,
    pub keywords: Vec<String>,
}

/// Parallel-execution section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub max_concurrent_agents: usize,
    pub worktree_dir: String,
    pub max_worktrees: usize,
    /// Agents that may run inside a parallel group at all.
    pub parallel_capable_agents: Vec<String>,
    /// Agent pairs that must never run concurrently.
    pub always_sequential: Vec<Vec<String>>,
    /// Keyword table mapping task descriptions to agents.
    pub agent_keywords: Vec<AgentKeywords>,
    /// Inferred dependency chains: a task of the key agent is always
    /// followed sequentially by tasks of the listed agents.
    pub agent_chains: HashMap<String, Vec<String>>,
    /// Regexes extracting the expected write set from a task description.
    pub file_patterns: Vec<String>,
    /// Agent assigned when no keyword matches.
    pub default_agent: String,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        let keywords = |agent: &str, words: &[&str]| AgentKeywords {
            agent: agent.to_string(),
            keywords: words.iter().map(|w| (*w).to_string()).collect(),
        };
        Self {
            max_concurrent_agents: 4,
            worktree_dir: ".worktrees".to_string(),
            max_worktrees: 4,
            parallel_capable_agents: vec![
                "code-writer".to_string(),
                "code-editor".to_string(),
                "designer".to_string(),
                "tester".to_string(),
            ],
            always_sequential: vec![
                vec!["code-writer".to_string(), "code-reviewer".to_string()],
                vec!["cpp-builder".to_string(), "tester".to_string()],
            ],
            // The original table tolerated several human languages; keep
            // the Korean keywords alongside the English ones.
            agent_keywords: vec![
                keywords("architect", &["design", "architecture", "설계", "아키텍처"]),
                keywords("code-writer", &["implement", "create", "구현", "작성", "생성"]),
                keywords("code-editor", &["fix", "refactor", "수정", "변경"]),
                keywords("code-reviewer", &["review", "리뷰", "검토"]),
                keywords("cpp-builder", &["build", "cmake", "빌드"]),
                keywords("tester", &["test", "테스트", "검증"]),
                keywords("designer", &["ui", "ux", "화면"]),
                keywords("devops", &["ci", "cd", "pipeline", "deploy"]),
            ],
            agent_chains: HashMap::from([
                (
                    "code-writer".to_string(),
                    vec!["code-reviewer".to_string()],
                ),
                ("cpp-builder".to_string(), vec!["tester".to_string()]),
            ]),
            file_patterns: vec![
                r"(\w+\.(?:cpp|h|hpp|qml|rs|py|json|md|yml|yaml))".to_string(),
                r"(src/\S+)".to_string(),
                r"(\.claude/\S+)".to_string(),
            ],
            default_agent: "task-manager".to_string(),
        }
    }
}

/// The whole `workflow` configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub protocol: ProtocolConfig,
    pub rules: Vec<Rule>,
    /// Agent name → keyword strings, consumed by the external pre-prompt
    /// hook. Parsed and kept for compatibility; the engine itself does
    /// not read it.
    pub triggers: HashMap<String, Vec<String>>,
    pub prompt_injection: PromptInjectionConfig,
    pub limits: LimitsConfig,
    pub runner: RunnerConfig,
    pub parallel: ParallelConfig,
}

/// Wrapper accepted at the top level of the JSON document.
#[derive(Deserialize)]
struct ConfigDocument {
    workflow: WorkflowConfig,
}

impl WorkflowConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(OrchestratorError::InvalidConfig(format!(
                "workflow config not found: {}",
                path.display()
            )));
        }
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Parse and validate a configuration document. Accepts either the
    /// bare `workflow` object or `{"workflow": {...}}`.
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| OrchestratorError::InvalidConfig(format!("parse error: {e}")))?;
        let config = if value.get("workflow").is_some() {
            serde_json::from_value::<ConfigDocument>(value)
                .map_err(|e| OrchestratorError::InvalidConfig(format!("parse error: {e}")))?
                .workflow
        } else {
            serde_json::from_value::<WorkflowConfig>(value)
                .map_err(|e| OrchestratorError::InvalidConfig(format!("parse error: {e}")))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject structurally valid but semantically broken configuration.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.id.is_empty() {
                return Err(OrchestratorError::InvalidConfig(
                    "rule with empty id".to_string(),
                ));
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(OrchestratorError::InvalidRule {
                    id: rule.id.clone(),
                    message: "duplicate rule id".to_string(),
                });
            }

            let invalid = |message: &str| OrchestratorError::InvalidRule {
                id: rule.id.clone(),
                message: message.to_string(),
            };

            match rule.action.kind {
                ActionKind::Decision => {
                    if rule.action.options.is_empty() {
                        return Err(invalid("decision action without options"));
                    }
                }
                ActionKind::Parallel => {
                    if rule.action.tasks_file.is_none() {
                        return Err(invalid("parallel action without tasks_file"));
                    }
                }
                ActionKind::Dispatch | ActionKind::Complete => {}
            }

            for pattern in [
                rule.trigger.context_contains.as_deref(),
                rule.trigger.context_excludes.as_deref(),
            ]
            .into_iter()
            .flatten()
            {
                Regex::new(pattern).map_err(|e| OrchestratorError::InvalidRule {
                    id: rule.id.clone(),
                    message: format!("context pattern does not compile: {e}"),
                })?;
            }
        }

        for (tag, pattern) in &self.protocol.fallback_patterns {
            Regex::new(pattern).map_err(|e| {
                OrchestratorError::InvalidConfig(format!(
                    "fallback pattern for {tag} does not compile: {e}"
                ))
            })?;
        }

        for pattern in &self.parallel.file_patterns {
            Regex::new(pattern).map_err(|e| {
                OrchestratorError::InvalidConfig(format!(
                    "file pattern '{pattern}' does not compile: {e}"
                ))
            })?;
        }

        if self.parallel.max_concurrent_agents == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "parallel.max_concurrent_agents must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
