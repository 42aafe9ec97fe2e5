pub mod azure;

use crate::error::ConfigError;
use crate::ports::TaskInputs;
use std::fmt;
use std::path::PathBuf;

pub use azure::AzureModels;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cloud {
    Public,
    Gcc,
    GccHigh,
    DoD,
    Germany,
    China,
}

impl Cloud {
    /// Unknown or empty values fall back to the public cloud.
    pub fn parse(input: &str) -> Self {
        match input.trim().to_lowercase().as_str() {
            "china" => Cloud::China,
            "dod" => Cloud::DoD,
            "gcc" => Cloud::Gcc,
            "gcchigh" => Cloud::GccHigh,
            "germany" => Cloud::Germany,
            _ => Cloud::Public,
        }
    }

    /// Name passed to `pbicli cloud set --name`.
    pub fn cli_name(self) -> &'static str {
        match self {
            Cloud::Public => "public",
            Cloud::Gcc => "gcc",
            Cloud::GccHigh => "gcchigh",
            Cloud::DoD => "dod",
            Cloud::Germany => "germany",
            Cloud::China => "china",
        }
    }
}

impl fmt::Display for Cloud {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cli_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptType {
    Ps,
    PsCore,
    Bash,
    Batch,
}

impl ScriptType {
    pub fn parse(input: &str) -> Self {
        match input.trim().to_lowercase().as_str() {
            "ps" => ScriptType::Ps,
            "pscore" => ScriptType::PsCore,
            "bash" => ScriptType::Bash,
            _ => ScriptType::Batch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptLocation {
    ScriptPath,
    InlineScript,
}

impl ScriptLocation {
    pub fn parse(input: &str) -> Self {
        match input.trim().to_lowercase().as_str() {
            "scriptpath" => ScriptLocation::ScriptPath,
            _ => ScriptLocation::InlineScript,
        }
    }
}

/// Task configuration, read once from the agent inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskParameters {
    pub cloud: Cloud,
    pub script_type: ScriptType,
    pub script_location: ScriptLocation,
    pub script_arguments: String,
    pub script_path: Option<PathBuf>,
    pub inline_script: Option<String>,
    pub cwd: Option<PathBuf>,
    pub powershell_error_action_preference: String,
    pub powershell_ignore_last_exit_code: bool,
    pub fail_on_stderr: bool,
    pub version: String,
    pub debug: bool,
}

impl TaskParameters {
    pub fn from_inputs(inputs: &dyn TaskInputs) -> Result<Self, ConfigError> {
        let cloud = Cloud::parse(&inputs.optional_input("cloud").unwrap_or_default());
        let script_type = ScriptType::parse(&inputs.required_input("scriptType")?);
        let script_location = ScriptLocation::parse(&inputs.required_input("scriptLocation")?);

        let script_path = inputs.optional_input("scriptPath").map(PathBuf::from);
        // Inline scripts are taken verbatim; only blank ones count as missing.
        let inline_script = inputs
            .input("inlineScript")
            .filter(|script| !script.trim().is_empty());

        match script_location {
            ScriptLocation::ScriptPath if script_path.is_none() => {
                return Err(ConfigError::MissingInput {
                    name: "scriptPath".to_string(),
                });
            }
            ScriptLocation::InlineScript if inline_script.is_none() => {
                return Err(ConfigError::MissingInput {
                    name: "inlineScript".to_string(),
                });
            }
            _ => {}
        }

        let debug = match inputs.variable("System.Debug") {
            Some(value) if value.trim().eq_ignore_ascii_case("true") => true,
            _ => inputs.bool_input("verbose")?,
        };

        Ok(Self {
            cloud,
            script_type,
            script_location,
            script_arguments: inputs.optional_input("scriptArguments").unwrap_or_default(),
            script_path,
            inline_script,
            cwd: inputs.optional_input("cwd").map(PathBuf::from),
            powershell_error_action_preference: inputs
                .optional_input("powerShellErrorActionPreference")
                .unwrap_or_else(|| "Stop".to_string()),
            powershell_ignore_last_exit_code: inputs.bool_input("powerShellIgnoreLASTEXITCODE")?,
            fail_on_stderr: inputs.bool_input("failOnStandardError")?,
            version: inputs
                .optional_input("version")
                .unwrap_or_else(|| "latest".to_string()),
            debug,
        })
    }
}

pub fn parse_bool(input: &str) -> Option<bool> {
    match input.trim().to_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}
