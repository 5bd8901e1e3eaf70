//! `orchex` — rule-driven workflow orchestrator CLI.
//!
//! ```text
//! orchex "new task - user service"
//! orchex --mock "test task"
//! orchex --verbose --mock "test"
//! ```
//!
//! Exit code 0 when the workflow completes, 1 otherwise.

use anyhow::Context;
use clap::Parser;
use std::io::BufRead;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use orchex_cli::ConsoleUi;
use orchex_common::ColorModeCliArg;
use orchex_core::AgentRunner;
use orchex_core::CommandRunner;
use orchex_core::MockRunner;
use orchex_core::WorkflowConfig;
use orchex_core::WorkflowDriver;

#[derive(Parser, Debug)]
#[command(name = "orchex", version, about = "Rule-driven multi-agent workflow orchestrator")]
struct Cli {
    /// Initial task description; prompted for interactively when omitted.
    prompt: Option<String>,

    /// Use canned agent responses instead of the real backend.
    #[arg(long)]
    mock: bool,

    /// Verbose output (agent output previews, debug logging).
    #[arg(short, long)]
    verbose: bool,

    /// Path to the workflow config (default: <project>/.claude/workflow.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Project root directory (default: discovered from the working directory).
    #[arg(long)]
    project_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "auto")]
    color: ColorModeCliArg,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(cli: Cli) -> anyhow::Result<bool> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "debug" } else { "warn" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let project_dir = resolve_project_dir(cli.project_dir.clone());
    debug!("project directory: {}", project_dir.display());

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| project_dir.join(".claude").join("workflow.json"));
    let config = WorkflowConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let prompt = match cli.prompt.clone() {
        Some(prompt) => prompt,
        None => ask_for_prompt()?,
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let runner: Arc<dyn AgentRunner> = if cli.mock {
        Arc::new(MockRunner::new())
    } else {
        Arc::new(CommandRunner::new(
            &config.runner,
            &project_dir,
            Duration::from_secs(config.limits.agent_timeout_seconds),
            cancel.clone(),
        )?)
    };

    let ui = Arc::new(ConsoleUi::new(cli.color.colors_enabled(), cli.verbose));

    let mut driver = WorkflowDriver::new(config, &project_dir, runner, ui, cancel, cli.mock)?;
    Ok(driver.run(&prompt).await?)
}

/// Use `--project-dir` when given; otherwise the first of the working
/// directory and its parent that contains a `.claude` directory, falling
/// back to the working directory.
fn resolve_project_dir(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir;
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    if cwd.join(".claude").exists() {
        return cwd;
    }
    if let Some(parent) = cwd.parent()
        && parent.join(".claude").exists()
    {
        return parent.to_path_buf();
    }
    cwd
}

fn ask_for_prompt() -> anyhow::Result<String> {
    print!("Task description: ");
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let prompt = line.trim().to_string();
    if prompt.is_empty() {
        anyhow::bail!("no task description provided");
    }
    Ok(prompt)
}
