//! Workflow execution state: history, retries, loops, limits, and the
//! persisted execution log.
//!
//! Invariant: `iteration == history.len()` after every recorded step.
//! Recording is the only place the counter moves, so the driver never
//! has to pre-increment and revert.

use chrono::Local;
use chrono::SecondsFormat;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use crate::config::LimitsConfig;
use crate::error::Result;
use crate::protocol::StatusSource;
use crate::protocol::StatusTag;
use crate::protocol::WorkflowStatus;

/// Number of trailing agents inspected by the loop detector.
const LOOP_LOOKBACK: usize = 6;

/// Prompts longer than this are trimmed before they enter the history.
const PROMPT_PREVIEW_CHARS: usize = 200;

/// Record of a single agent invocation. Append-only.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub agent: String,
    pub prompt: String,
    pub status: StatusTag,
    pub context: String,
    pub source: StatusSource,
    pub timestamp: String,
    pub duration_seconds: f64,
    pub rule_id: Option<String>,
}

/// Serialized shape of the persisted execution log.
#[derive(Serialize)]
struct ExecutionLog<'a> {
    start_time: String,
    end_time: String,
    iterations: usize,
    complete: bool,
    failed: bool,
    agents_used: Vec<String>,
    total_duration_seconds: f64,
    retry_counts: &'a HashMap<String, u32>,
    history: &'a [ExecutionRecord],
}

/// Mutable per-run execution state. Owned exclusively by the sequential
/// driver; never shared across concurrent tasks.
#[derive(Debug)]
pub struct WorkflowState {
    limits: LimitsConfig,
    history: Vec<ExecutionRecord>,
    retry_counts: HashMap<String, u32>,
    pub complete: bool,
    pub failed: bool,
    last_context: String,
    start_time: chrono::DateTime<Local>,
}

impl WorkflowState {
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            limits,
            history: Vec::new(),
            retry_counts: HashMap::new(),
            complete: false,
            failed: false,
            last_context: String::new(),
            start_time: Local::now(),
        }
    }

    /// Executed iterations so far. Always equal to `history().len()`.
    pub fn iteration(&self) -> usize {
        self.history.len()
    }

    pub fn history(&self) -> &[ExecutionRecord] {
        &self.history
    }

    pub fn last_context(&self) -> &str {
        &self.last_context
    }

    /// Record an agent execution. Increments the iteration counter by
    /// appending to the history.
    pub fn record(
        &mut self,
        agent: &str,
        prompt: &str,
        status: &WorkflowStatus,
        duration_seconds: f64,
        rule_id: Option<&str>,
    ) {
        let prompt = if prompt.chars().count() > PROMPT_PREVIEW_CHARS {
            let preview: String = prompt.chars().take(PROMPT_PREVIEW_CHARS).collect();
            format!("{preview}...")
        } else {
            prompt.to_string()
        };

        self.history.push(ExecutionRecord {
            agent: agent.to_string(),
            prompt,
            status: status.tag,
            context: status.context.clone(),
            source: status.source,
            timestamp: Local::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            duration_seconds,
            rule_id: rule_id.map(str::to_string),
        });
        self.last_context = status.context.clone();
    }

    pub fn increment_retry(&mut self, rule_id: &str) {
        *self.retry_counts.entry(rule_id.to_string()).or_insert(0) += 1;
    }

    pub fn retry_count(&self, rule_id: &str) -> u32 {
        self.retry_counts.get(rule_id).copied().unwrap_or(0)
    }

    /// Whether another retry of `rule_id` fits inside `max_retries`.
    pub fn can_retry(&self, rule_id: &str, max_retries: u32) -> bool {
        self.retry_count(rule_id) < max_retries
    }

    /// Whether the configured iteration ceiling has been reached.
    pub fn is_at_limit(&self) -> bool {
        self.iteration() >= self.limits.max_workflow_iterations
    }

    /// Detect agent ping-pong over the last [`LOOP_LOOKBACK`] records:
    /// the same agent three times in a row (`A-A-A`), or two agents
    /// alternating (`A-B-A-B` with `A != B`).
    pub fn is_in_loop(&self) -> bool {
        if self.history.len() < 3 {
            return false;
        }

        let start = self.history.len().saturating_sub(LOOP_LOOKBACK);
        let recent: Vec<&str> = self.history[start..]
            .iter()
            .map(|r| r.agent.as_str())
            .collect();
        let n = recent.len();

        if n >= 4
            && recent[n - 1] == recent[n - 3]
            && recent[n - 2] == recent[n - 4]
            && recent[n - 1] != recent[n - 2]
        {
            return true;
        }

        n >= 3 && recent[n - 1] == recent[n - 2] && recent[n - 2] == recent[n - 3]
    }

    /// Unique agents in order of first use.
    pub fn agents_used(&self) -> Vec<String> {
        let mut agents: Vec<String> = Vec::new();
        for record in &self.history {
            if !agents.contains(&record.agent) {
                agents.push(record.agent.clone());
            }
        }
        agents
    }

    pub fn total_duration(&self) -> f64 {
        self.history.iter().map(|r| r.duration_seconds).sum()
    }

    pub fn last_status(&self) -> Option<StatusTag> {
        self.history.last().map(|r| r.status)
    }

    /// Human-readable run summary with the execution trace.
    pub fn summary(&self) -> String {
        let agents = self.agents_used();
        let last_status = self
            .last_status()
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| "N/A".to_string());
        let (icon, verdict) = if self.complete {
            ("[OK]", "COMPLETE")
        } else if self.failed {
            ("[XX]", "FAILED")
        } else {
            ("[..]", "STOPPED")
        };

        let border = "=".repeat(65);
        let mut out = String::new();
        let _ = writeln!(out);
        let _ = writeln!(out, "{border}");
        let _ = writeln!(out, "                    WORKFLOW SUMMARY");
        let _ = writeln!(out, "{border}");
        let _ = writeln!(out, "  Status:      {icon} {verdict}");
        let _ = writeln!(out, "  Iterations:  {}", self.iteration());
        let _ = writeln!(
            out,
            "  Agents used: {}",
            if agents.is_empty() {
                "None".to_string()
            } else {
                agents.join(", ")
            }
        );
        let _ = writeln!(out, "  Total time:  {:.1}s", self.total_duration());
        let _ = writeln!(out, "  Last status: {last_status}");
        let _ = writeln!(out);
        let _ = writeln!(out, "  Execution trace:");

        for (i, record) in self.history.iter().enumerate() {
            let glyph = match record.status {
                StatusTag::Ready => '+',
                StatusTag::Blocked => '!',
                StatusTag::Failed => 'X',
                StatusTag::DecisionNeeded => '?',
                StatusTag::Unknown => '.',
            };
            let _ = writeln!(
                out,
                "    {}. [{glyph}] {} -> {} ({:.1}s)",
                i + 1,
                record.agent,
                record.status,
                record.duration_seconds
            );
        }

        let _ = writeln!(out, "{border}");
        out
    }

    /// Persist the execution log as JSON. Returns the log file path.
    ///
    /// The filename carries a second-granularity timestamp; two runs
    /// starting in the same second get a numeric suffix instead of
    /// clobbering each other.
    pub fn save_log(&self, log_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(log_dir)?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let mut log_file = log_dir.join(format!("workflow-{stamp}.json"));
        let mut suffix = 0;
        while log_file.exists() {
            suffix += 1;
            log_file = log_dir.join(format!("workflow-{stamp}-{suffix}.json"));
        }

        let log = ExecutionLog {
            start_time: self.start_time.to_rfc3339_opts(SecondsFormat::Secs, true),
            end_time: Local::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            iterations: self.iteration(),
            complete: self.complete,
            failed: self.failed,
            agents_used: self.agents_used(),
            total_duration_seconds: self.total_duration(),
            retry_counts: &self.retry_counts,
            history: &self.history,
        };

        fs::write(&log_file, serde_json::to_string_pretty(&log)?)?;
        Ok(log_file)
    }
}
