use crate::domain::parse_bool;
use crate::error::{ConfigError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Read access to everything the pipeline agent hands to a task.
pub trait TaskInputs {
    fn input(&self, name: &str) -> Option<String>;
    fn variable(&self, name: &str) -> Option<String>;
    fn endpoint_url(&self, id: &str) -> Option<String>;
    fn endpoint_auth_scheme(&self, id: &str) -> Option<String>;
    fn endpoint_auth_parameter(&self, id: &str, key: &str) -> Option<String>;
    fn endpoint_data_parameter(&self, id: &str, key: &str) -> Option<String>;

    /// Trimmed input value, `None` when unset or blank.
    fn optional_input(&self, name: &str) -> Option<String> {
        non_blank(self.input(name))
    }

    fn required_input(&self, name: &str) -> Result<String, ConfigError> {
        self.optional_input(name).ok_or_else(|| ConfigError::MissingInput {
            name: name.to_string(),
        })
    }

    fn bool_input(&self, name: &str) -> Result<bool, ConfigError> {
        match self.optional_input(name) {
            None => Ok(false),
            Some(value) => parse_bool(&value).ok_or(ConfigError::InvalidValue {
                name: name.to_string(),
                value,
            }),
        }
    }
}

pub(crate) fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Program plus ordered arguments, handed to a [`ProcessRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    secret_args: Vec<usize>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            secret_args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Like [`ToolCommand::arg`], but masked whenever the command is echoed.
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.secret_args.push(self.args.len());
        self.args.push(arg.into());
        self
    }

    /// Appends a raw argument line. Spaces separate arguments outside double
    /// quotes; `"` toggles quoting and is dropped. Inside quotes `\"` is a
    /// literal quote and every other backslash is kept. Single quotes are
    /// plain text.
    pub fn line(mut self, line: &str) -> Self {
        self.args.extend(split_argument_line(line));
        self
    }

    pub fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// `[command]` echo line, with secret arguments replaced by `***`.
    pub fn display(&self) -> String {
        let mut out = format!("[command]{}", self.program.display());
        for (index, arg) in self.args.iter().enumerate() {
            out.push(' ');
            if self.secret_args.contains(&index) {
                out.push_str("***");
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

fn split_argument_line(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ' ' if !in_quotes => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            '"' => {
                in_quotes = !in_quotes;
                in_arg = true;
            }
            '\\' if in_quotes && chars.peek() == Some(&'"') => {
                current.extend(chars.next());
                in_arg = true;
            }
            _ => {
                current.push(c);
                in_arg = true;
            }
        }
    }
    if in_arg {
        args.push(current.trim().to_string());
    }
    args
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    /// Variables set on top of the inherited process environment.
    pub env: BTreeMap<String, String>,
}

impl ExecOptions {
    pub fn with_cwd(&self, cwd: Option<&Path>) -> Self {
        Self {
            cwd: cwd.map(Path::to_path_buf),
            env: self.env.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub program: String,
    pub code: i32,
}

pub trait ProcessRunner {
    /// Resolves `tool` on the `PATH` the child processes will see.
    fn which(&self, tool: &str, options: &ExecOptions) -> Option<PathBuf>;

    /// Runs `command` to completion. Non-zero exit codes are returned, not raised.
    /// `on_stderr_line` sees every stderr line while the child is running.
    fn exec(
        &self,
        command: &ToolCommand,
        options: &ExecOptions,
        on_stderr_line: &mut dyn FnMut(&str),
    ) -> Result<ExecResult>;
}
