//! Agent execution: the real command-backed runner and the mock.
//!
//! The backend is opaque: agent × prompt → text. Faults never escape as
//! errors — a timeout or a broken backend is reified as an output that
//! itself carries a `status: FAILED` envelope, so the parser/engine
//! pipeline handles it like any other agent reply.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::config::RunnerConfig;
use crate::error::OrchestratorError;
use crate::error::Result;

/// One agent invocation. May suspend; must respect the caller's
/// cancellation token; never fails.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, agent: &str, prompt: &str) -> String;
}

/// Synthesize an output that the status parser will classify as FAILED.
fn failed_envelope(context: &str, next_hint: &str) -> String {
    format!(
        "\n===============================================================\n\
         [WORKFLOW_STATUS]\n\
         status: FAILED\n\
         context: {context}\n\
         next_hint: {next_hint}\n\
         ===============================================================\n"
    )
}

/// Runner that delegates to an external agent command.
///
/// The configured command line is split once at construction; `{agent}`
/// placeholders are substituted per invocation and the prompt is written
/// to the child's stdin.
pub struct CommandRunner {
    argv: Vec<String>,
    project_dir: PathBuf,
    timeout: Duration,
    cancel: CancellationToken,
}

impl CommandRunner {
    pub fn new(
        config: &RunnerConfig,
        project_dir: &Path,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let argv = shlex::split(&config.agent_command).ok_or_else(|| {
            OrchestratorError::InvalidConfig(format!(
                "runner.agent_command is not a valid command line: {}",
                config.agent_command
            ))
        })?;
        if argv.is_empty() {
            return Err(OrchestratorError::InvalidConfig(
                "runner.agent_command is empty".to_string(),
            ));
        }
        Ok(Self {
            argv,
            project_dir: project_dir.to_path_buf(),
            timeout,
            cancel,
        })
    }

    async fn run_command(&self, agent: &str, prompt: &str) -> std::io::Result<(bool, String)> {
        let argv: Vec<String> = self
            .argv
            .iter()
            .map(|part| part.replace("{agent}", agent))
            .collect();
        debug!("spawning agent backend: {argv:?}");

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&self.project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok((output.status.success(), stdout))
    }
}

#[async_trait]
impl AgentRunner for CommandRunner {
    async fn run(&self, agent: &str, prompt: &str) -> String {
        let invocation = self.run_command(agent, prompt);

        let result = tokio::select! {
            _ = self.cancel.cancelled() => {
                warn!("agent '{agent}' interrupted");
                return failed_envelope("Interrupted before completion", "none");
            }
            result = timeout(self.timeout, invocation) => result,
        };

        match result {
            Ok(Ok((true, stdout))) => stdout,
            Ok(Ok((false, _))) => {
                warn!("agent backend exited with failure for '{agent}'");
                failed_envelope(
                    &format!("Agent backend exited with failure for {agent}"),
                    "check agent configuration",
                )
            }
            Ok(Err(e)) => {
                warn!("agent backend error for '{agent}': {e}");
                failed_envelope(
                    &format!("Agent backend error - {e}"),
                    "check backend installation and configuration",
                )
            }
            Err(_) => {
                warn!(
                    "agent '{agent}' timed out after {} seconds",
                    self.timeout.as_secs()
                );
                failed_envelope(
                    &format!("Agent timeout after {} seconds", self.timeout.as_secs()),
                    "check agent configuration",
                )
            }
        }
    }
}

/// Canned response for agents without a dedicated mock below.
fn generic_mock_response(agent: &str) -> String {
    format!(
        "# {agent} Response\n\nExecuted task.\n\n\
         ===============================================================\n\
         [WORKFLOW_STATUS]\n\
         status: READY\n\
         context: {agent} completed\n\
         next_hint: continue workflow\n\
         ===============================================================\n"
    )
}

const MOCK_TASK_MANAGER: &str = "\
# Task Manager Report

Analyzing request...

Created new task based on requirements.

===============================================================
[WORKFLOW_STATUS]
status: READY
context: Change created successfully
next_hint: architect should design solution
===============================================================
";

const MOCK_TASK_MANAGER_CLOSE: &str = "\
# Task Manager - Closing Task

Verified:
- [x] All tasks complete
- [x] CHANGELOG.md updated
- [x] Tests passed

Status changed to: DEPLOYED

===============================================================
[WORKFLOW_STATUS]
status: READY
context: Task closed - DEPLOYED
next_hint: workflow complete
===============================================================
";

const MOCK_ARCHITECT: &str = "\
# Architect Analysis

## Design

### Files to Modify
- src/core/main.cpp - add service registration

### New Files
- src/core/new_service.h
- src/core/new_service.cpp

===============================================================
[WORKFLOW_STATUS]
status: READY
context: Design complete
next_hint: implementation needed
===============================================================
";

const MOCK_DESIGNER: &str = "\
# Designer Report

## UI Design

### Component Structure
- NewPage.qml
  - HeaderBar (existing)
  - ContentArea (new)

===============================================================
[WORKFLOW_STATUS]
status: READY
context: UI design complete
next_hint: code-writer should implement
===============================================================
";

const MOCK_CODE_WRITER: &str = "\
# Code Writer Report

Created new files:
- src/core/new_service.h
- src/core/new_service.cpp

Build: PASS

===============================================================
[WORKFLOW_STATUS]
status: READY
context: New files created, build successful
next_hint: code review needed
===============================================================
";

const MOCK_CODE_EDITOR: &str = "\
# Code Editor Report

Modified files:
- src/core/main.cpp - added service registration

Build: PASS

===============================================================
[WORKFLOW_STATUS]
status: READY
context: Files modified, build successful
next_hint: code review needed
===============================================================
";

const MOCK_CODE_REVIEWER: &str = "\
# Code Review Report

Files reviewed: 3

## Checks
- [x] Naming conventions OK
- [x] No hardcoded values
- [x] Error handling present

Decision: APPROVE

===============================================================
[WORKFLOW_STATUS]
status: READY
context: Code review APPROVED
next_hint: run tests
===============================================================
";

const MOCK_TESTER: &str = "\
# Test Report

Build: PASS
Tests: 24/24 passed
Duration: 2.1s

===============================================================
[WORKFLOW_STATUS]
status: READY
context: All tests PASS
next_hint: ready to close task
===============================================================
";

const MOCK_DEVOPS: &str = "\
# DevOps Report

CI/CD Analysis complete.

Workflow: ci-windows.yml
Status: Healthy

===============================================================
[WORKFLOW_STATUS]
status: READY
context: CI/CD check complete
next_hint: no issues found
===============================================================
";

/// Default synthetic delay per mock invocation.
const MOCK_DELAY: Duration = Duration::from_millis(500);

/// Mock runner returning canned per-agent responses.
///
/// Tracks a per-agent call count so that repeated invocations can
/// differ: the task-manager returns its closing report from the second
/// call on, which lets the happy-path workflow terminate.
pub struct MockRunner {
    call_counts: Mutex<HashMap<String, u32>>,
    overrides: HashMap<String, String>,
    delay: Duration,
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRunner {
    pub fn new() -> Self {
        Self {
            call_counts: Mutex::new(HashMap::new()),
            overrides: HashMap::new(),
            delay: MOCK_DELAY,
        }
    }

    /// Shorten (or lengthen) the synthetic delay. Tests use zero.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Replace the canned response for one agent.
    pub fn with_response(mut self, agent: &str, response: &str) -> Self {
        self.overrides
            .insert(agent.to_string(), response.to_string());
        self
    }

    /// How many times an agent has been invoked so far.
    pub fn call_count(&self, agent: &str) -> u32 {
        self.call_counts
            .lock()
            .map(|counts| counts.get(agent).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn canned_response(agent: &str, call: u32) -> String {
        match agent {
            "task-manager" if call > 1 => MOCK_TASK_MANAGER_CLOSE.to_string(),
            "task-manager" => MOCK_TASK_MANAGER.to_string(),
            "architect" => MOCK_ARCHITECT.to_string(),
            "designer" => MOCK_DESIGNER.to_string(),
            "code-writer" => MOCK_CODE_WRITER.to_string(),
            "code-editor" => MOCK_CODE_EDITOR.to_string(),
            "code-reviewer" => MOCK_CODE_REVIEWER.to_string(),
            "tester" => MOCK_TESTER.to_string(),
            "devops" => MOCK_DEVOPS.to_string(),
            other => generic_mock_response(other),
        }
    }
}

#[async_trait]
impl AgentRunner for MockRunner {
    async fn run(&self, agent: &str, _prompt: &str) -> String {
        sleep(self.delay).await;

        let call = {
            let mut counts = match self.call_counts.lock() {
                Ok(counts) => counts,
                Err(poisoned) => poisoned.into_inner(),
            };
            let entry = counts.entry(agent.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        debug!("mock agent '{agent}' call #{call}");

        if let Some(response) = self.overrides.get(agent) {
            return response.clone();
        }
        Self::canned_response(agent, call)
    }
}
