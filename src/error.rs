use std::path::PathBuf;

use crate::ports::ExecResult;

/// Problems with the task inputs. Raised before any subprocess runs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Input required: {name}")]
    MissingInput { name: String },

    #[error("invalid value '{value}' for input '{name}'")]
    InvalidValue { name: String, value: String },

    #[error("input '{name}' is not a valid URL: {value}")]
    InvalidUrl { name: String, value: String },

    #[error("endpoint '{id}' is malformed: {message}")]
    MalformedEndpoint { id: String, message: String },

    #[error("failed to read inputs file '{}': {message}", .path.display())]
    InputsFile { path: PathBuf, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid file path '{}'. A path to a script file is required.", .0.display())]
    InvalidFilePath(PathBuf),

    #[error("Agent version {required} or higher is required (found {actual})")]
    AgentTooOld { required: String, actual: String },

    #[error("file operation failed for '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to locate executable file: '{name}'")]
    ToolNotFound { name: String },

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process exited with code {}", .0.code)]
    NonZeroExit(ExecResult),

    #[error("Unsupported authentication scheme '{0}' for endpoint.")]
    UnsupportedAuthScheme(String),

    #[error("npm install failed: {0}")]
    InstallFailed(String),

    #[error("pbicli failed: {0}")]
    ToolFailed(String),
}

impl TaskError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TaskError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = TaskError> = std::result::Result<T, E>;
