//! Pipeline agent plumbing: logging commands, task result and run context.

use crate::error::{Result, TaskError};
use crate::ports::TaskInputs;
use std::fmt::{self, Write as _};
use std::path::PathBuf;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Oldest agent able to run the PowerShell wrapper.
pub const MIN_POWERSHELL_AGENT: &str = "2.115.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    Succeeded,
    Failed,
}

impl fmt::Display for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskResult::Succeeded => f.write_str("Succeeded"),
            TaskResult::Failed => f.write_str("Failed"),
        }
    }
}

/// Terminal result of a task run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub result: TaskResult,
    pub message: String,
}

impl TaskOutcome {
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            result: TaskResult::Succeeded,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            result: TaskResult::Failed,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == TaskResult::Succeeded
    }

    pub fn logging_command(&self) -> String {
        format!(
            "##vso[task.complete result={};]{}",
            self.result,
            escape_data(&self.message)
        )
    }
}

/// Where the agent wants us to put things.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentContext {
    pub work_folder: PathBuf,
    pub temp_dir: PathBuf,
    pub version: Option<String>,
}

impl AgentContext {
    pub fn from_inputs(inputs: &dyn TaskInputs) -> Self {
        let work_folder = inputs
            .variable("Agent.WorkFolder")
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        let temp_dir = inputs
            .variable("Agent.TempDirectory")
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        Self {
            work_folder,
            temp_dir,
            version: inputs
                .variable("Agent.Version")
                .filter(|value| !value.trim().is_empty()),
        }
    }

    /// Per-run directory the CLI gets installed into.
    pub fn install_dir(&self) -> PathBuf {
        self.work_folder.join("_pbicli")
    }

    /// Fails when the hosting agent is older than `minimum`. Outside an agent
    /// (no version known) the check passes.
    pub fn assert_agent(&self, minimum: &str) -> Result<()> {
        let Some(actual) = &self.version else {
            return Ok(());
        };
        if version_parts(actual) < version_parts(minimum) {
            return Err(TaskError::AgentTooOld {
                required: minimum.to_string(),
                actual: actual.clone(),
            });
        }
        Ok(())
    }
}

fn version_parts(version: &str) -> Vec<u64> {
    let mut parts: Vec<u64> = version
        .trim()
        .trim_start_matches('v')
        .split('.')
        .map(|part| {
            part.chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>()
                .parse()
                .unwrap_or(0)
        })
        .collect();
    while parts.len() < 3 {
        parts.push(0);
    }
    parts
}

/// Tells the agent to mask `value` in every log line.
pub fn set_secret(value: &str) {
    if !value.is_empty() {
        println!("##vso[task.setsecret]{}", escape_data(value));
    }
}

pub fn escape_data(value: &str) -> String {
    value
        .replace('%', "%AZP25")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

/// Renders `tracing` events as agent logging commands.
pub struct AgentFormat;

impl<S, N> FormatEvent<S, N> for AgentFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut message = String::new();
        ctx.format_fields(Writer::new(&mut message), event)?;
        let level = *event.metadata().level();
        writeln!(writer, "{}", render_line(level, &message))
    }
}

fn render_line(level: Level, message: &str) -> String {
    match level {
        Level::ERROR => format!(
            "##vso[task.logissue type=error;]{}",
            escape_data(message)
        ),
        Level::WARN => format!(
            "##vso[task.logissue type=warning;]{}",
            escape_data(message)
        ),
        Level::INFO => message.to_string(),
        _ => format!("##vso[task.debug]{}", escape_data(message)),
    }
}

/// `RUST_LOG` wins; otherwise the agent debug switch picks the level.
pub fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout)
        .event_format(AgentFormat)
        .try_init();
}
