mod adapters;
mod agent;
mod config;
mod domain;
mod error;
mod install;
mod ports;
mod runtime;
mod task;
mod util;

use adapters::agent_inputs::{AgentEnvInputs, InputsFile, LayeredInputs};
use adapters::process_runner::SystemProcessRunner;
use agent::TaskOutcome;
use clap::{Parser, Subcommand};
use ports::TaskInputs;
use std::path::PathBuf;
use std::process::ExitCode;

/// Installs the Power BI CLI, signs it in with a service principal and runs
/// a user script with it on the PATH.
#[derive(Debug, Parser)]
#[command(name = "pbicli-task", version, about)]
struct Cli {
    /// TOML file with inputs, variables and endpoints; overrides the agent environment
    #[arg(long, global = true, value_name = "FILE")]
    inputs: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the task (default)
    Run,
    /// Print the resolved task configuration
    Config,
}

fn load_inputs(path: Option<PathBuf>) -> Result<Box<dyn TaskInputs>, error::ConfigError> {
    let agent = AgentEnvInputs::from_env();
    match path {
        Some(path) => {
            let file = InputsFile::load(&path)?;
            Ok(Box::new(LayeredInputs::new(file, agent)))
        }
        None => Ok(Box::new(agent)),
    }
}

fn debug_requested(inputs: &dyn TaskInputs) -> bool {
    inputs
        .variable("System.Debug")
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("true"))
        || inputs.bool_input("verbose").unwrap_or(false)
}

fn finish(outcome: TaskOutcome) -> ExitCode {
    println!("{}", outcome.logging_command());
    if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let inputs = match load_inputs(cli.inputs) {
        Ok(inputs) => inputs,
        Err(err) => {
            agent::init_logging(false);
            tracing::error!("{}", err);
            return finish(TaskOutcome::failed(err.to_string()));
        }
    };
    agent::init_logging(debug_requested(inputs.as_ref()));

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let runner = SystemProcessRunner::new();
            finish(task::execute_task(inputs.as_ref(), &runner))
        }
        Command::Config => match config::run_config(inputs.as_ref()) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("{}", err);
                ExitCode::FAILURE
            }
        },
    }
}
