use crate::agent::AgentContext;
use crate::domain::{ScriptLocation, ScriptType, TaskParameters};
use crate::error::Result;
use crate::ports::ToolCommand;
use crate::util::{dot_source, get_powershell_script_path, get_script_path, TempFileGuard};
use std::path::PathBuf;

const POWERSHELL_FLAGS: [&str; 6] = [
    "-NoLogo",
    "-NoProfile",
    "-NonInteractive",
    "-ExecutionPolicy",
    "Unrestricted",
    "-Command",
];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScriptKind {
    WindowsPowerShell,
    PowerShellCore,
    Bash,
    Batch,
}

impl From<ScriptType> for ScriptKind {
    fn from(script_type: ScriptType) -> Self {
        match script_type {
            ScriptType::Ps => ScriptKind::WindowsPowerShell,
            ScriptType::PsCore => ScriptKind::PowerShellCore,
            ScriptType::Bash => ScriptKind::Bash,
            ScriptType::Batch => ScriptKind::Batch,
        }
    }
}

/// A runnable command plus the temp files it owns. Dropping it deletes them.
#[derive(Debug)]
pub struct PreparedScript {
    pub command: ToolCommand,
    /// The script the command runs; empty until a script was materialized.
    pub script_path: PathBuf,
    temp_files: Vec<TempFileGuard>,
}

impl PreparedScript {
    pub fn owns_temp_files(&self) -> bool {
        !self.temp_files.is_empty()
    }

    pub fn clean_up(self) {
        drop(self.temp_files);
    }
}

impl ScriptKind {
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            ScriptKind::WindowsPowerShell | ScriptKind::PowerShellCore => &["ps1"],
            ScriptKind::Bash => &["sh"],
            ScriptKind::Batch => &["bat", "cmd"],
        }
    }

    fn powershell_program(self) -> Option<&'static str> {
        match self {
            ScriptKind::WindowsPowerShell => Some("powershell"),
            ScriptKind::PowerShellCore => Some("pwsh"),
            ScriptKind::Bash | ScriptKind::Batch => None,
        }
    }

    /// Materializes the script and builds the command that runs it.
    pub fn prepare(self, params: &TaskParameters, context: &AgentContext) -> Result<PreparedScript> {
        if let Some(program) = self.powershell_program() {
            let wrapper = get_powershell_script_path(params, context, self.extensions())?;
            let mut temp_files = vec![TempFileGuard::new(wrapper.path.clone())];
            if let Some(inline) = wrapper.inline_script {
                temp_files.push(TempFileGuard::new(inline));
            }
            let command = POWERSHELL_FLAGS
                .iter()
                .fold(ToolCommand::new(program), |command, flag| command.arg(*flag))
                .arg(dot_source(&wrapper.path));
            return Ok(PreparedScript {
                command,
                script_path: wrapper.path,
                temp_files,
            });
        }

        let script_path = get_script_path(params, context, self.extensions())?;
        // Only scripts this run wrote are ours to delete.
        let temp_files = match params.script_location {
            ScriptLocation::InlineScript => vec![TempFileGuard::new(script_path.clone())],
            ScriptLocation::ScriptPath => Vec::new(),
        };
        let command = match self {
            ScriptKind::Bash => ToolCommand::new("bash").arg(script_path.display().to_string()),
            _ => ToolCommand::new(script_path.clone()),
        };
        let command = command.line(&params.script_arguments);

        Ok(PreparedScript {
            command,
            script_path,
            temp_files,
        })
    }
}
