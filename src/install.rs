use crate::agent::AgentContext;
use crate::error::{Result, TaskError};
use crate::ports::{ExecOptions, ProcessRunner, ToolCommand};
use crate::util::throw_if_error;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const TOOL: &str = "pbicli";
const PACKAGE: &str = "@powerbi-cli/powerbi-cli";
pub const LOG_LEVEL_VAR: &str = "npm_config_loglevel";

pub fn log_level(debug: bool) -> &'static str {
    if debug {
        "verbose"
    } else {
        "silent"
    }
}

pub fn install_command(version: &str, install_dir: &Path) -> ToolCommand {
    ToolCommand::new("npm")
        .arg("i")
        .arg(format!("{}@{}", PACKAGE, version))
        .arg("--prefix")
        .arg(install_dir.display().to_string())
}

pub fn bin_dir(install_dir: &Path) -> PathBuf {
    install_dir.join("node_modules").join(".bin")
}

/// Puts `dir` in front of the `PATH` every later child process sees.
pub fn prepend_path(options: &mut ExecOptions, dir: &Path) -> Result<()> {
    let current = options
        .env
        .get("PATH")
        .map(Into::into)
        .or_else(|| env::var_os("PATH"))
        .unwrap_or_default();
    let paths = std::iter::once(dir.to_path_buf()).chain(env::split_paths(&current));
    let joined = env::join_paths(paths).map_err(|err| TaskError::InstallFailed(err.to_string()))?;
    options
        .env
        .insert("PATH".to_string(), joined.to_string_lossy().into_owned());
    Ok(())
}

/// Installs the CLI with npm unless it is already reachable.
pub fn ensure_installed(
    runner: &dyn ProcessRunner,
    version: &str,
    context: &AgentContext,
    options: &mut ExecOptions,
) -> Result<()> {
    if let Some(found) = runner.which(TOOL, options) {
        tracing::debug!("using {} at {}", TOOL, found.display());
        return Ok(());
    }

    let install_dir = context.install_dir();
    tracing::info!(
        "{} not found, installing {}@{} into {}",
        TOOL,
        PACKAGE,
        version,
        install_dir.display()
    );
    fs::create_dir_all(&install_dir).map_err(|err| TaskError::io(&install_dir, err))?;

    let command = install_command(version, &install_dir);
    let result = runner
        .exec(&command, options, &mut |_| {})
        .map_err(|err| TaskError::InstallFailed(err.to_string()))?;
    let result = throw_if_error(result, Some("npm install"))
        .map_err(|err| TaskError::InstallFailed(err.to_string()))?;
    tracing::info!("npm returned code {}", result.code);

    prepend_path(options, &bin_dir(&install_dir))
}
