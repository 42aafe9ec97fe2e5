use crate::agent::{AgentContext, MIN_POWERSHELL_AGENT};
use crate::domain::{ScriptLocation, TaskParameters};
use crate::error::{Result, TaskError};
use crate::ports::ExecResult;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const TEMP_PREFIX: &str = "pbiclitaskscript";
const UTF8_BOM: char = '\u{feff}';

#[cfg(windows)]
const EOL: &str = "\r\n";
#[cfg(not(windows))]
const EOL: &str = "\n";

/// A synthesized PowerShell wrapper and, for inline scripts, the user
/// script file it dot-sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperScript {
    pub path: PathBuf,
    pub inline_script: Option<PathBuf>,
}

/// Returns the user's script file, writing inline scripts to the agent temp
/// directory first.
pub fn get_script_path(
    params: &TaskParameters,
    context: &AgentContext,
    extensions: &[&str],
) -> Result<PathBuf> {
    if params.script_location == ScriptLocation::ScriptPath {
        return existing_script(params, extensions);
    }
    let path = temp_script_path(context, "", extensions);
    create_file(&path, params.inline_script.as_deref().unwrap_or_default())?;
    Ok(path)
}

/// Writes a wrapper that sets the error preferences, dot-sources the user
/// script and forwards `$LASTEXITCODE`.
pub fn get_powershell_script_path(
    params: &TaskParameters,
    context: &AgentContext,
    extensions: &[&str],
) -> Result<WrapperScript> {
    context.assert_agent(MIN_POWERSHELL_AGENT)?;

    let mut lines = vec![
        format!(
            "$ErrorActionPreference = '{}'",
            params.powershell_error_action_preference
        ),
        "$ErrorView = 'NormalView'".to_string(),
    ];

    let (user_script, inline_script) = match params.script_location {
        ScriptLocation::ScriptPath => (existing_script(params, extensions)?, None),
        ScriptLocation::InlineScript => {
            let path = temp_script_path(context, "_inlinescript", extensions);
            create_file(&path, params.inline_script.as_deref().unwrap_or_default())?;
            (path.clone(), Some(path))
        }
    };

    let invocation = format!(
        "{} {}",
        dot_source(&user_script),
        params.script_arguments
    );
    lines.push(invocation.trim().to_string());

    if !params.powershell_ignore_last_exit_code {
        lines.extend(
            [
                "if (!(Test-Path -LiteralPath variable:LASTEXITCODE)) {",
                "    Write-Host '##vso[task.debug]$LASTEXITCODE is not set.'",
                "} else {",
                "    Write-Host ('##vso[task.debug]$LASTEXITCODE: {0}' -f $LASTEXITCODE)",
                "    exit $LASTEXITCODE",
                "}",
            ]
            .map(str::to_string),
        );
    }

    let path = temp_script_path(context, "", extensions);
    let contents = format!("{}{}", UTF8_BOM, lines.join(EOL));
    if let Err(err) = create_file(&path, &contents) {
        if let Some(inline) = &inline_script {
            delete_file(inline);
        }
        return Err(err);
    }
    Ok(WrapperScript {
        path,
        inline_script,
    })
}

fn existing_script(params: &TaskParameters, extensions: &[&str]) -> Result<PathBuf> {
    let path = params.script_path.clone().unwrap_or_default();
    if check_if_file_exists(&path, extensions) {
        Ok(path)
    } else {
        Err(TaskError::InvalidFilePath(path))
    }
}

fn temp_script_path(context: &AgentContext, suffix: &str, extensions: &[&str]) -> PathBuf {
    let extension = extensions.first().copied().unwrap_or("txt");
    context.temp_dir.join(format!(
        "{}{}{}.{}",
        TEMP_PREFIX,
        timestamp_ms(),
        suffix,
        extension
    ))
}

/// Quote a string for use in PowerShell commands.
pub fn ps_quote(input: &str) -> String {
    format!("'{}'", input.replace('\'', "''"))
}

/// `. '<path>'`, the PowerShell dot-source form of a script path.
pub fn dot_source(path: &Path) -> String {
    format!(". {}", ps_quote(&path.display().to_string()))
}

/// True when `path` is a regular file ending in one of `extensions`,
/// compared case-insensitively.
pub fn check_if_file_exists(path: &Path, extensions: &[&str]) -> bool {
    if !path.is_file() {
        return false;
    }
    let name = path.to_string_lossy().to_uppercase();
    extensions
        .iter()
        .any(|extension| name.ends_with(&format!(".{}", extension.to_uppercase())))
}

/// Writes `contents` to `path`, removing any partial file on failure.
pub fn create_file(path: &Path, contents: &str) -> Result<()> {
    if let Err(err) = fs::write(path, contents) {
        delete_file(path);
        return Err(TaskError::io(path, err));
    }
    tracing::debug!("wrote script file {}", path.display());
    Ok(())
}

/// Best-effort removal. Errors are logged and never returned.
pub fn delete_file(path: &Path) {
    if path.as_os_str().is_empty() || !path.exists() {
        return;
    }
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!("deleted {}", path.display()),
        Err(err) => tracing::warn!("unable to delete {}: {}", path.display(), err),
    }
}

/// Turns a non-zero exit code into an error carrying the result itself.
pub fn throw_if_error(result: ExecResult, message: Option<&str>) -> Result<ExecResult> {
    if result.code == 0 {
        return Ok(result);
    }
    tracing::error!("{}: Error Code: [{}]", result.program, result.code);
    if let Some(message) = message {
        tracing::error!("Error: {}", message);
    }
    Err(TaskError::NonZeroExit(result))
}

/// Deletes the guarded file when dropped.
#[derive(Debug)]
pub struct TempFileGuard {
    path: PathBuf,
}

impl TempFileGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        delete_file(&self.path);
    }
}

fn timestamp_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
