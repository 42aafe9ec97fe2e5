use crate::error::{Result, TaskError};
use crate::ports::{ExecOptions, ExecResult, ProcessRunner, ToolCommand};
use std::env;
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

/// How long stderr may stay open after the child has exited.
const OUTPUT_DRAIN: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs commands as child processes. Stdout is inherited, stderr is
/// forwarded line by line so it can be inspected.
pub struct SystemProcessRunner {
    output_drain: Duration,
}

impl SystemProcessRunner {
    pub fn new() -> Self {
        Self {
            output_drain: OUTPUT_DRAIN,
        }
    }

    fn resolve(&self, command: &ToolCommand, options: &ExecOptions) -> Result<PathBuf> {
        // Explicit paths (a batch file, say) run as given.
        if command.program.components().count() > 1 {
            return Ok(command.program.clone());
        }
        let name = command.program_name();
        self.which(&name, options)
            .ok_or(TaskError::ToolNotFound { name })
    }
}

fn forward_lines(stream: impl Read, sender: Sender<String>) {
    let mut reader = BufReader::new(stream);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buffer);
                let line = line.trim_end_matches(['\r', '\n']).to_string();
                if sender.send(line).is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::debug!("stopped reading stderr: {}", err);
                break;
            }
        }
    }
}

impl Default for SystemProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner for SystemProcessRunner {
    fn which(&self, tool: &str, options: &ExecOptions) -> Option<PathBuf> {
        let path = options
            .env
            .get("PATH")
            .map(OsString::from)
            .or_else(|| env::var_os("PATH"));
        let cwd = match &options.cwd {
            Some(cwd) => cwd.clone(),
            None => env::current_dir().ok()?,
        };
        which::which_in(tool, path, cwd).ok()
    }

    fn exec(
        &self,
        command: &ToolCommand,
        options: &ExecOptions,
        on_stderr_line: &mut dyn FnMut(&str),
    ) -> Result<ExecResult> {
        let program = self.resolve(command, options)?;
        println!("{}", command.display());

        let mut process = Command::new(&program);
        process
            .args(&command.args)
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped());
        if let Some(cwd) = &options.cwd {
            process.current_dir(cwd);
        }

        let spawn_error = |source| TaskError::Spawn {
            program: program.display().to_string(),
            source,
        };
        let mut child = process.spawn().map_err(spawn_error)?;

        let (sender, lines) = mpsc::channel();
        match child.stderr.take() {
            Some(stderr) => {
                thread::spawn(move || forward_lines(stderr, sender));
            }
            None => drop(sender),
        }

        // Background processes can hold stderr open after the child exits,
        // so stop listening once the drain window has passed.
        let mut exited: Option<(ExitStatus, Instant)> = None;
        loop {
            match lines.recv_timeout(POLL_INTERVAL) {
                Ok(line) => {
                    eprintln!("{}", line);
                    on_stderr_line(&line);
                }
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            if exited.is_none() {
                exited = child
                    .try_wait()
                    .map_err(spawn_error)?
                    .map(|status| (status, Instant::now()));
            }
            if let Some((_, at)) = exited {
                if at.elapsed() >= self.output_drain {
                    tracing::debug!(
                        "{} exited but stderr is still open, not waiting for more output",
                        program.display()
                    );
                    break;
                }
            }
        }

        let status = match exited {
            Some((status, _)) => status,
            None => child.wait().map_err(spawn_error)?,
        };
        // Killed by a signal: no code, report a failure.
        let code = status.code().unwrap_or(-1);
        tracing::debug!("{} exited with code {}", program.display(), code);

        Ok(ExecResult {
            program: command.program_name(),
            code,
        })
    }
}
