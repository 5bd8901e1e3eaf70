//! Status protocol: prompt injection and agent-output parsing.
//!
//! Handles:
//! - Parsing `[WORKFLOW_STATUS]` blocks from agent output
//! - Fallback pattern matching when no explicit status is found
//! - Injecting the workflow protocol instructions into prompts
//!
//! The envelope is a convention, not a guarantee. The parser therefore
//! tolerates malformed, partial, or absent blocks: explicit block first,
//! then fallback regexes over the output tail, then `UNKNOWN`.

use regex::Regex;
use regex::RegexBuilder;
use regex::escape;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;

use crate::config::ProtocolConfig;
use crate::error::OrchestratorError;
use crate::error::Result;

/// Status tag reported by an agent at the end of its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusTag {
    /// Task completed successfully
    Ready,
    /// Issue found, needs fixing
    Blocked,
    /// Critical error, cannot proceed
    Failed,
    /// Multiple paths, user must choose
    DecisionNeeded,
    /// No status, or an unrecognized one
    Unknown,
}

impl StatusTag {
    pub const fn as_str(&self) -> &'static str {
        match self {
            StatusTag::Ready => "READY",
            StatusTag::Blocked => "BLOCKED",
            StatusTag::Failed => "FAILED",
            StatusTag::DecisionNeeded => "DECISION_NEEDED",
            StatusTag::Unknown => "UNKNOWN",
        }
    }

    /// Parse a tag from agent output. Case-insensitive; `None` for any
    /// word that is not a known tag.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "READY" => Some(StatusTag::Ready),
            "BLOCKED" => Some(StatusTag::Blocked),
            "FAILED" => Some(StatusTag::Failed),
            "DECISION_NEEDED" => Some(StatusTag::DecisionNeeded),
            "UNKNOWN" => Some(StatusTag::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for StatusTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a status was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusSource {
    /// Explicit `[WORKFLOW_STATUS]` block
    Explicit,
    /// Regex match over the output tail, or nothing found
    Fallback,
    /// Supplied interactively by the user
    User,
}

impl fmt::Display for StatusSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusSource::Explicit => "explicit",
            StatusSource::Fallback => "fallback",
            StatusSource::User => "user",
        };
        f.write_str(s)
    }
}

/// Parsed status from an agent's output. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub tag: StatusTag,
    pub context: String,
    pub next_hint: String,
    pub source: StatusSource,
}

impl WorkflowStatus {
    pub fn new(tag: StatusTag, context: impl Into<String>, source: StatusSource) -> Self {
        Self {
            tag,
            context: context.into(),
            next_hint: String::new(),
            source,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview: String = self.context.chars().take(50).collect();
        write!(
            f,
            "WorkflowStatus({}, context='{preview}...', source={})",
            self.tag, self.source
        )
    }
}

/// Parse agent output to extract a workflow status.
///
/// Pure: the same input always yields the same status, and parsing never
/// fails.
pub struct StatusParser {
    valid_statuses: Vec<StatusTag>,
    /// Fallback regexes with their source text, in priority order.
    fallback_patterns: Vec<(StatusTag, Regex, String)>,
    search_lines: usize,
    block_re: Regex,
    context_re: Regex,
    hint_re: Regex,
}

impl StatusParser {
    /// Build a parser from the protocol configuration. Fails only on a
    /// fallback pattern that does not compile.
    pub fn new(config: &ProtocolConfig) -> Result<Self> {
        let marker = escape(&config.status_block_marker);

        let block_re = build_insensitive(&format!(r"{marker}[\s\S]*?status:[ \t]*(\w+)"))?;
        let context_re = build_insensitive(&format!(r"{marker}[\s\S]*?context:[ \t]*([^\r\n]+)"))?;
        let hint_re = build_insensitive(&format!(r"{marker}[\s\S]*?next_hint:[ \t]*([^\r\n]+)"))?;

        let mut fallback_patterns = Vec::new();
        for tag in &config.pattern_priority {
            if let Some(pattern) = config.fallback_patterns.get(tag) {
                let re = build_insensitive(pattern).map_err(|e| {
                    OrchestratorError::InvalidConfig(format!(
                        "fallback pattern for {tag} does not compile: {e}"
                    ))
                })?;
                fallback_patterns.push((*tag, re, pattern.clone()));
            }
        }

        Ok(Self {
            valid_statuses: config.valid_statuses.clone(),
            fallback_patterns,
            search_lines: config.fallback_search_lines,
            block_re,
            context_re,
            hint_re,
        })
    }

    /// Parse agent output.
    ///
    /// Strategy, in order:
    /// 1. Explicit status block
    /// 2. Fallback patterns over the last N lines, in priority order
    /// 3. `UNKNOWN`
    pub fn parse(&self, output: &str) -> WorkflowStatus {
        if let Some(explicit) = self.parse_explicit_block(output) {
            if self.valid_statuses.contains(&explicit.tag) {
                return explicit;
            }
            return WorkflowStatus::new(
                StatusTag::Unknown,
                format!("Invalid status '{}' in output", explicit.tag),
                StatusSource::Explicit,
            );
        }

        if let Some(fallback) = self.parse_fallback_patterns(output) {
            return fallback;
        }

        WorkflowStatus::new(
            StatusTag::Unknown,
            "No status found in output",
            StatusSource::Fallback,
        )
    }

    /// Parse the explicit status block, if any.
    ///
    /// Expected shape:
    /// ```text
    /// [WORKFLOW_STATUS]
    /// status: READY
    /// context: Some context
    /// next_hint: Some hint
    /// ```
    fn parse_explicit_block(&self, output: &str) -> Option<WorkflowStatus> {
        let captures = self.block_re.captures(output)?;
        let word = captures.get(1)?.as_str();

        // An unrecognized word still counts as an explicit (invalid) tag.
        let Some(tag) = StatusTag::parse(word) else {
            return Some(WorkflowStatus {
                tag: StatusTag::Unknown,
                context: format!("Invalid status '{}' in output", word.to_uppercase()),
                next_hint: String::new(),
                source: StatusSource::Explicit,
            });
        };

        let context = self
            .context_re
            .captures(output)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();

        let next_hint = self
            .hint_re
            .captures(output)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();

        Some(WorkflowStatus {
            tag,
            context,
            next_hint,
            source: StatusSource::Explicit,
        })
    }

    /// Search for status patterns in the last N lines of output.
    ///
    /// Patterns are checked in the configured priority order (default
    /// FAILED > BLOCKED > READY): ambiguity fails closed.
    fn parse_fallback_patterns(&self, output: &str) -> Option<WorkflowStatus> {
        let lines: Vec<&str> = output.trim().lines().collect();
        let start = lines.len().saturating_sub(self.search_lines);
        let tail = lines[start..].join("\n");

        for (tag, re, pattern) in &self.fallback_patterns {
            if re.is_match(&tail) {
                return Some(WorkflowStatus::new(
                    *tag,
                    format!("Detected via fallback pattern: {pattern}"),
                    StatusSource::Fallback,
                ));
            }
        }

        None
    }
}

fn build_insensitive(pattern: &str) -> Result<Regex> {
    Ok(RegexBuilder::new(pattern).case_insensitive(true).build()?)
}

/// Instruction block appended to every outgoing prompt.
const PROTOCOL_TEMPLATE: &str = r"

---------------------------------------------------------------
[WORKFLOW_PROTOCOL]

When you complete your task, END your response with this block:

===============================================================
[WORKFLOW_STATUS]
status: <STATUS>
context: <brief outcome description>
next_hint: <suggested next step>
===============================================================

Valid STATUS values:
- READY           - Task completed successfully
- BLOCKED         - Issue found, needs fixing (describe in context)
- FAILED          - Critical error, cannot proceed
- DECISION_NEEDED - Multiple paths, user must choose

Example:
===============================================================
[WORKFLOW_STATUS]
status: READY
context: Change #00028 created successfully
next_hint: architect should design solution
===============================================================
---------------------------------------------------------------
";

/// Inject the workflow protocol instructions into agent prompts.
#[derive(Debug, Clone, Copy)]
pub struct PromptInjector {
    enabled: bool,
}

impl PromptInjector {
    pub const fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Append the protocol block, unless injection is disabled.
    pub fn inject(&self, prompt: &str) -> String {
        if !self.enabled {
            return prompt.to_string();
        }
        format!("{prompt}{PROTOCOL_TEMPLATE}")
    }
}
