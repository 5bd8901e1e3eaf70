//! Terminal implementation of the workflow UI sink.
//!
//! Formatting mirrors a plain 65-column ASCII layout: status icons like
//! `[OK]` / `[XX]`, `=` and `-` rules, numbered pickers. Colors are
//! optional and off when stdout is not a terminal.

use owo_colors::OwoColorize;
use std::io::BufRead;
use std::io::Write;

use orchex_common::elapsed::format_seconds;
use orchex_core::parallel::ParallelExecutionResult;
use orchex_core::protocol::StatusTag;
use orchex_core::protocol::WorkflowStatus;
use orchex_core::rules::DecisionOption;
use orchex_core::ui::FallbackChoice;
use orchex_core::ui::WorkflowUi;
use orchex_core::worktree::MergeResult;

const WIDTH: usize = 65;
const PREVIEW_LINES: usize = 10;

#[derive(Clone, Copy)]
enum Tone {
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    Bold,
    Dim,
}

/// Console event sink with interactive prompts on stdin.
pub struct ConsoleUi {
    use_colors: bool,
    verbose: bool,
}

impl ConsoleUi {
    pub const fn new(use_colors: bool, verbose: bool) -> Self {
        Self { use_colors, verbose }
    }

    fn paint(&self, text: &str, tone: Tone) -> String {
        if !self.use_colors {
            return text.to_string();
        }
        match tone {
            Tone::Red => text.red().to_string(),
            Tone::Green => text.green().to_string(),
            Tone::Yellow => text.yellow().to_string(),
            Tone::Blue => text.blue().to_string(),
            Tone::Magenta => text.magenta().to_string(),
            Tone::Cyan => text.cyan().to_string(),
            Tone::Bold => text.bold().to_string(),
            Tone::Dim => text.dimmed().to_string(),
        }
    }

    fn rule_line(&self, ch: char, tone: Tone) -> String {
        self.paint(&ch.to_string().repeat(WIDTH), tone)
    }

    /// Prompt on stdout, read one trimmed line from stdin. `None` on EOF.
    fn read_line(&self, prompt: &str) -> Option<String> {
        print!("{}", self.paint(prompt, Tone::Cyan));
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => {
                println!();
                None
            }
            Ok(_) => Some(line.trim().to_string()),
        }
    }
}

impl WorkflowUi for ConsoleUi {
    fn header(&self, title: &str) {
        println!();
        println!("{}", self.rule_line('=', Tone::Cyan));
        println!("{}", self.paint(&format!("  {title}"), Tone::Cyan));
        println!("{}", self.rule_line('=', Tone::Cyan));
        println!();
    }

    fn info(&self, message: &str) {
        println!("{}", self.paint(&format!("  [i] {message}"), Tone::Cyan));
    }

    fn error(&self, message: &str) {
        println!();
        println!("{}", self.paint(&format!("  [X] Error: {message}"), Tone::Red));
    }

    fn iteration_started(&self, iteration: usize, agent: &str, mock: bool) {
        let mode = if mock {
            self.paint("[MOCK]", Tone::Dim)
        } else {
            String::new()
        };
        println!();
        println!("{}", self.rule_line('-', Tone::Blue));
        println!(
            "{}{} {mode}",
            self.paint(&format!("[>] Iteration {iteration}: "), Tone::Bold),
            self.paint(agent, Tone::Cyan)
        );
        println!("{}", self.rule_line('-', Tone::Blue));
    }

    fn status_parsed(&self, status: &WorkflowStatus) {
        let (icon, tone) = match status.tag {
            StatusTag::Ready => ("[OK]", Tone::Green),
            StatusTag::Blocked => ("[!!]", Tone::Yellow),
            StatusTag::Failed => ("[XX]", Tone::Red),
            StatusTag::DecisionNeeded => ("[??]", Tone::Magenta),
            StatusTag::Unknown => ("[..]", Tone::Dim),
        };

        println!();
        println!(
            "  {icon} {} (via {})",
            self.paint(&format!("Status: {}", status.tag), tone),
            status.source
        );
        if !status.context.is_empty() {
            let mut context: String = status.context.chars().take(80).collect();
            if status.context.chars().count() > 80 {
                context.push_str("...");
            }
            println!("     Context: {context}");
        }
    }

    fn rule_matched(&self, rule_id: &str, description: &str) {
        println!();
        println!(
            "{}{}",
            self.paint("  [+] Matched rule: ", Tone::Green),
            self.paint(rule_id, Tone::Bold)
        );
        if !description.is_empty() {
            println!("    {description}");
        }
    }

    fn no_rule_matched(&self) {
        println!();
        println!("{}", self.paint("  [!] No matching rule found", Tone::Yellow));
    }

    fn workflow_complete(&self, message: &str) {
        println!();
        println!("{}", self.rule_line('=', Tone::Green));
        println!("{}", self.paint(&format!("  [OK] {message}"), Tone::Green));
        println!("{}", self.rule_line('=', Tone::Green));
    }

    fn output_preview(&self, output: &str) {
        if !self.verbose {
            return;
        }

        let lines: Vec<&str> = output.trim().lines().collect();
        println!();
        println!("{}", self.paint("  Output preview:", Tone::Dim));
        for line in lines.iter().take(PREVIEW_LINES) {
            let mut shown: String = line.chars().take(67).collect();
            if line.chars().count() > 70 {
                shown.push_str("...");
            }
            println!("{}", self.paint(&format!("    | {shown}"), Tone::Dim));
        }
        if lines.len() > PREVIEW_LINES {
            println!(
                "{}",
                self.paint(
                    &format!("    | ... ({} more lines)", lines.len() - PREVIEW_LINES),
                    Tone::Dim
                )
            );
        }
    }

    fn summary(&self, text: &str) {
        println!("{text}");
    }

    fn confirm_continue(&self, reason: &str) -> bool {
        println!();
        println!("{}", self.rule_line('=', Tone::Yellow));
        println!(
            "{}",
            self.paint(&format!("  [!] Limit reached: {reason}"), Tone::Bold)
        );
        println!("{}", self.rule_line('=', Tone::Yellow));
        println!();

        match self.read_line("  Continue anyway? [y/N]: ") {
            Some(answer) => matches!(answer.to_lowercase().as_str(), "y" | "yes"),
            None => false,
        }
    }

    fn choose_decision(&self, message: &str, options: &[DecisionOption]) -> Option<usize> {
        println!();
        println!("{}", self.rule_line('=', Tone::Magenta));
        println!("{}", self.paint(&format!("  [?] {message}"), Tone::Bold));
        println!("{}", self.rule_line('-', Tone::Magenta));

        for (i, option) in options.iter().enumerate() {
            println!("    [{}] {}", i + 1, option.label);
            println!("{}", self.paint(&format!("        -> {}", option.agent), Tone::Dim));
        }

        println!();
        println!("{}", self.paint("    [q] Quit workflow", Tone::Dim));
        println!("{}", self.rule_line('=', Tone::Magenta));
        println!();

        loop {
            let choice = self.read_line("  Your choice: ")?;
            let choice = choice.to_lowercase();
            if choice == "q" {
                return None;
            }
            if let Ok(index) = choice.parse::<usize>()
                && index >= 1
                && index <= options.len()
            {
                return Some(index - 1);
            }
            println!(
                "{}",
                self.paint(&format!("  Invalid choice: {choice}"), Tone::Yellow)
            );
        }
    }

    fn choose_fallback(&self, agents: &[String]) -> Option<FallbackChoice> {
        println!();
        println!("{}", self.rule_line('=', Tone::Yellow));
        println!(
            "{}",
            self.paint("  [?] No matching rule. Choose action:", Tone::Bold)
        );
        println!("{}", self.rule_line('-', Tone::Yellow));

        for (i, agent) in agents.iter().enumerate() {
            println!("    [{}] Run {agent}", i + 1);
        }

        println!();
        println!("{}", self.paint("    [q] Quit workflow", Tone::Dim));
        println!("{}", self.rule_line('=', Tone::Yellow));
        println!();

        loop {
            let choice = self.read_line("  Your choice: ")?;
            let choice = choice.to_lowercase();
            if choice == "q" {
                return None;
            }

            if let Ok(index) = choice.parse::<usize>()
                && index >= 1
                && index <= agents.len()
            {
                let agent = agents[index - 1].clone();
                let prompt = self.read_line(&format!("  Prompt for {agent}: "))?;
                if prompt.is_empty() {
                    println!("{}", self.paint("  Prompt cannot be empty", Tone::Yellow));
                    continue;
                }
                return Some(FallbackChoice { agent, prompt });
            }

            println!(
                "{}",
                self.paint(&format!("  Invalid choice: {choice}"), Tone::Yellow)
            );
        }
    }

    fn merge_reported(&self, result: &MergeResult) {
        if result.success {
            println!(
                "  {} {}",
                self.paint("[OK]", Tone::Green),
                format_args!("Merged {}", result.branch)
            );
        } else {
            println!(
                "  {} {}",
                self.paint("[XX]", Tone::Red),
                format_args!("Merge failed for {}: {}", result.branch, result.message)
            );
            for file in &result.conflicts {
                println!("{}", self.paint(&format!("       conflict: {file}"), Tone::Yellow));
            }
        }
    }

    fn parallel_summary(&self, result: &ParallelExecutionResult) {
        let succeeded = result.results.iter().filter(|r| r.success).count();
        let tone = if result.success { Tone::Green } else { Tone::Red };

        println!();
        println!("{}", self.rule_line('=', tone));
        println!(
            "{}",
            self.paint(
                &format!(
                    "  Parallel execution: {succeeded}/{} tasks succeeded in {}",
                    result.results.len(),
                    format_seconds(result.total_duration_seconds)
                ),
                Tone::Bold
            )
        );

        for task in &result.results {
            let icon = if task.success {
                self.paint("[OK]", Tone::Green)
            } else {
                self.paint("[XX]", Tone::Red)
            };
            println!(
                "    {icon} {} ({}) - {}",
                task.task_id,
                task.agent,
                format_seconds(task.duration_seconds)
            );
            if let Some(error) = &task.error {
                println!("{}", self.paint(&format!("         {error}"), Tone::Dim));
            }
        }

        if !result.conflicts.is_empty() {
            println!(
                "{}",
                self.paint(
                    &format!("  Conflicting files: {}", result.conflicts.join(", ")),
                    Tone::Yellow
                )
            );
        }
        println!("{}", self.rule_line('=', tone));
    }
}
