use crate::agent::{set_secret, AgentContext, TaskOutcome};
use crate::domain::{AzureModels, Cloud, ScriptLocation, TaskParameters};
use crate::error::{Result, TaskError};
use crate::install::{self, LOG_LEVEL_VAR, TOOL};
use crate::ports::{ExecOptions, ProcessRunner, TaskInputs, ToolCommand};
use crate::runtime::{PreparedScript, ScriptKind};
use crate::util::throw_if_error;
use std::fs;
use std::path::PathBuf;

const MAX_STDERR_LINES: usize = 10;
const SERVICE_PRINCIPAL: &str = "serviceprincipal";

/// Keeps the first few stderr lines of a run.
#[derive(Debug, Default)]
pub struct StderrCollector {
    lines: Vec<String>,
    seen: usize,
}

impl StderrCollector {
    pub fn push(&mut self, line: &str) {
        if self.seen < MAX_STDERR_LINES {
            self.lines.push(line.to_string());
        }
        self.seen += 1;
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn seen(&self) -> usize {
        self.seen
    }
}

/// Install, authenticate, run the user script, clean up. Always yields a
/// terminal outcome; nothing escapes as an error.
pub fn execute_task(inputs: &dyn TaskInputs, runner: &dyn ProcessRunner) -> TaskOutcome {
    let (params, azure) = match load_configuration(inputs) {
        Ok(loaded) => loaded,
        Err(err) => return fail(err),
    };
    let context = AgentContext::from_inputs(inputs);
    set_secret(&azure.service_principal_key);

    let mut options = ExecOptions::default();
    options.env.insert(
        LOG_LEVEL_VAR.to_string(),
        install::log_level(params.debug).to_string(),
    );

    let prepared = install::ensure_installed(runner, &params.version, &context, &mut options)
        .and_then(|()| check_version(runner, &options))
        .and_then(|()| authenticate(runner, &azure, &params, &options));
    if let Err(err) = prepared {
        return fail(err);
    }

    execute_script(runner, &params, &context, &options)
}

pub fn load_configuration(inputs: &dyn TaskInputs) -> Result<(TaskParameters, AzureModels)> {
    let params = TaskParameters::from_inputs(inputs)?;
    let azure = AzureModels::from_inputs(inputs)?;
    Ok((params, azure))
}

fn fail(err: TaskError) -> TaskOutcome {
    tracing::error!("{}", err);
    TaskOutcome::failed(err.to_string())
}

fn run_tool(runner: &dyn ProcessRunner, command: ToolCommand, options: &ExecOptions) -> Result<()> {
    let result = runner
        .exec(&command, options, &mut |_| {})
        .map_err(|err| TaskError::ToolFailed(err.to_string()))?;
    let result =
        throw_if_error(result, None).map_err(|err| TaskError::ToolFailed(err.to_string()))?;
    tracing::debug!("{} returned code {}", TOOL, result.code);
    Ok(())
}

pub fn check_version(runner: &dyn ProcessRunner, options: &ExecOptions) -> Result<()> {
    run_tool(runner, ToolCommand::new(TOOL).arg("version"), options)
}

pub fn authenticate(
    runner: &dyn ProcessRunner,
    azure: &AzureModels,
    params: &TaskParameters,
    options: &ExecOptions,
) -> Result<()> {
    if params.cloud != Cloud::Public {
        let command = ToolCommand::new(TOOL)
            .arg("cloud")
            .arg("set")
            .arg("--name")
            .arg(params.cloud.cli_name());
        run_tool(runner, command, options)?;
    }

    if !azure.auth_scheme().eq_ignore_ascii_case(SERVICE_PRINCIPAL) {
        return Err(TaskError::UnsupportedAuthScheme(
            azure.auth_scheme().to_string(),
        ));
    }
    let command = ToolCommand::new(TOOL)
        .arg("login")
        .arg("--service-principal")
        .arg("--principal")
        .arg(&azure.service_principal_client_id)
        .arg("--secret")
        .secret_arg(&azure.service_principal_key)
        .arg("--tenant")
        .arg(&azure.tenant_id);
    run_tool(runner, command, options)
}

struct ScriptRun {
    exit_code: i32,
    stderr: StderrCollector,
}

/// Runs the user script and maps what happened to a task outcome. The
/// generated script files are removed on every path.
pub fn execute_script(
    runner: &dyn ProcessRunner,
    params: &TaskParameters,
    context: &AgentContext,
    options: &ExecOptions,
) -> TaskOutcome {
    let kind = ScriptKind::from(params.script_type);
    let mut prepared = None;
    let run = run_script(runner, kind, params, context, options, &mut prepared);

    if let Some(prepared) = prepared {
        prepared.clean_up();
    }

    match run {
        Err(err) => {
            tracing::error!("{}", err);
            TaskOutcome::failed(format!("Script failed with error: {}", err))
        }
        Ok(run) if params.fail_on_stderr && !run.stderr.lines().is_empty() => {
            tracing::error!("{}", run.stderr.lines().join("\n"));
            let omitted = run.stderr.seen() - run.stderr.lines().len();
            if omitted > 0 {
                tracing::error!("... {} more stderr lines", omitted);
            }
            TaskOutcome::failed(
                "Script has output to stderr. Failing as failOnStdErr is set to true.",
            )
        }
        Ok(run) if run.exit_code != 0 => {
            TaskOutcome::failed(format!("Script failed with exit code: {}", run.exit_code))
        }
        Ok(_) => TaskOutcome::succeeded("Script returned code 0"),
    }
}

fn run_script(
    runner: &dyn ProcessRunner,
    kind: ScriptKind,
    params: &TaskParameters,
    context: &AgentContext,
    options: &ExecOptions,
    slot: &mut Option<PreparedScript>,
) -> Result<ScriptRun> {
    let prepared = slot.insert(kind.prepare(params, context)?);

    let cwd = working_directory(params);
    if let Some(cwd) = &cwd {
        fs::create_dir_all(cwd).map_err(|err| TaskError::io(cwd, err))?;
    }
    tracing::debug!(
        "running {:?} script {} (generated: {})",
        kind,
        prepared.script_path.display(),
        prepared.owns_temp_files()
    );

    let mut stderr = StderrCollector::default();
    let result = runner.exec(
        &prepared.command,
        &options.with_cwd(cwd.as_deref()),
        &mut |line| stderr.push(line),
    )?;

    Ok(ScriptRun {
        exit_code: result.code,
        stderr,
    })
}

/// Explicit `cwd`, else the folder holding a user-supplied script.
fn working_directory(params: &TaskParameters) -> Option<PathBuf> {
    if params.cwd.is_some() {
        return params.cwd.clone();
    }
    if params.script_location != ScriptLocation::ScriptPath {
        return None;
    }
    params
        .script_path
        .as_deref()
        .and_then(|path| path.parent())
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(|parent| parent.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::agent_inputs::InputsFile;
    use crate::agent::TaskResult;
    use crate::ports::ExecResult;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::path::Path;
    use tempfile::TempDir;

    #[derive(Debug, Clone)]
    struct Recorded {
        command: ToolCommand,
        options: ExecOptions,
        script_contents: Option<String>,
    }

    /// Pretends to be the machine: `npm` and `pbicli` answer from `codes`,
    /// anything else is the user script.
    #[derive(Default)]
    struct FakeRunner {
        pbicli_installed: bool,
        codes: HashMap<String, i32>,
        script_code: i32,
        script_stderr: Vec<String>,
        recorded: RefCell<Vec<Recorded>>,
    }

    impl FakeRunner {
        fn installed() -> Self {
            Self {
                pbicli_installed: true,
                ..Self::default()
            }
        }

        fn commands(&self) -> Vec<String> {
            self.recorded
                .borrow()
                .iter()
                .map(|recorded| {
                    std::iter::once(recorded.command.program_name())
                        .chain(recorded.command.args.iter().cloned())
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect()
        }

        fn script_runs(&self) -> Vec<Recorded> {
            self.recorded
                .borrow()
                .iter()
                .filter(|recorded| !is_tool(&recorded.command))
                .cloned()
                .collect()
        }
    }

    fn is_tool(command: &ToolCommand) -> bool {
        let name = command.program_name();
        name == "npm" || name == TOOL
    }

    impl ProcessRunner for FakeRunner {
        fn which(&self, tool: &str, _options: &ExecOptions) -> Option<PathBuf> {
            (tool == TOOL && self.pbicli_installed).then(|| PathBuf::from("/usr/bin/pbicli"))
        }

        fn exec(
            &self,
            command: &ToolCommand,
            options: &ExecOptions,
            on_stderr_line: &mut dyn FnMut(&str),
        ) -> Result<ExecResult> {
            let name = command.program_name();
            let script_file = if name == "bash" {
                command.args.first().map(PathBuf::from)
            } else {
                Some(command.program.clone())
            };
            self.recorded.borrow_mut().push(Recorded {
                command: command.clone(),
                options: options.clone(),
                script_contents: script_file.and_then(|path| fs::read_to_string(path).ok()),
            });

            let code = if is_tool(command) {
                self.codes
                    .get(command.args.first().map(String::as_str).unwrap_or_default())
                    .or_else(|| self.codes.get(&name))
                    .copied()
                    .unwrap_or(0)
            } else {
                for line in &self.script_stderr {
                    on_stderr_line(line.as_str());
                }
                self.script_code
            };
            Ok(ExecResult {
                program: name,
                code,
            })
        }
    }

    fn base_inputs(dir: &TempDir) -> InputsFile {
        InputsFile::default()
            .with_variable("Agent.TempDirectory", &dir.path().display().to_string())
            .with_variable("Agent.WorkFolder", &dir.path().display().to_string())
            .with_input("connectedServiceNameARM", "local")
            .with_input("subscriptionid", "sub")
            .with_input("subscriptionname", "Dev")
            .with_input("serviceprincipalid", "client-id")
            .with_input("serviceprincipalkey", "client-secret")
            .with_input("environmentUrl", "https://api.powerbi.com")
            .with_input("environmentAuthorityUrl", "https://login.microsoftonline.com/")
            .with_input("tenantid", "tenant-id")
            .with_input("connectedServiceNameUrl", "https://management.azure.com/")
    }

    fn batch_inline(dir: &TempDir) -> InputsFile {
        base_inputs(dir)
            .with_input("scriptType", "batch")
            .with_input("scriptLocation", "inlinescript")
            .with_input("inlineScript", "echo hi")
    }

    fn leftover_scripts(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.to_string_lossy().contains("pbiclitaskscript"))
            .collect()
    }

    #[test]
    fn batch_inline_script_runs_and_is_removed() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::installed();

        let outcome = execute_task(&batch_inline(&dir), &runner);

        assert_eq!(outcome.result, TaskResult::Succeeded);
        assert_eq!(outcome.message, "Script returned code 0");
        let runs = runner.script_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].script_contents.as_deref(), Some("echo hi"));
        assert_eq!(
            runs[0].command.program.extension().and_then(|ext| ext.to_str()),
            Some("bat")
        );
        assert!(leftover_scripts(dir.path()).is_empty());
    }

    #[test]
    fn missing_bash_script_fails_before_running() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::installed();
        let inputs = base_inputs(&dir)
            .with_input("scriptType", "bash")
            .with_input("scriptLocation", "scriptpath")
            .with_input("scriptPath", "/does/not/exist.sh");

        let outcome = execute_task(&inputs, &runner);

        assert_eq!(outcome.result, TaskResult::Failed);
        assert!(outcome.message.contains("/does/not/exist.sh"));
        assert!(runner.script_runs().is_empty());
        assert!(leftover_scripts(dir.path()).is_empty());
    }

    #[test]
    fn stderr_output_fails_when_requested() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner {
            script_stderr: vec!["warning: something".to_string()],
            ..FakeRunner::installed()
        };
        let inputs = batch_inline(&dir).with_input("failOnStandardError", "true");

        let outcome = execute_task(&inputs, &runner);

        assert_eq!(
            outcome,
            TaskOutcome::failed(
                "Script has output to stderr. Failing as failOnStdErr is set to true."
            )
        );
        assert!(leftover_scripts(dir.path()).is_empty());
    }

    #[test]
    fn stderr_output_is_ignored_by_default() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner {
            script_stderr: vec!["warning: something".to_string()],
            ..FakeRunner::installed()
        };

        let outcome = execute_task(&batch_inline(&dir), &runner);
        assert!(outcome.is_success());
    }

    #[test]
    fn non_zero_exit_code_fails() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner {
            script_code: 4,
            ..FakeRunner::installed()
        };

        let outcome = execute_task(&batch_inline(&dir), &runner);
        assert_eq!(outcome, TaskOutcome::failed("Script failed with exit code: 4"));
        assert!(leftover_scripts(dir.path()).is_empty());
    }

    #[test]
    fn china_cloud_is_selected_before_login() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::installed();
        let inputs = batch_inline(&dir).with_input("cloud", "china");

        execute_task(&inputs, &runner);

        let commands = runner.commands();
        assert_eq!(commands[0], "pbicli version");
        assert_eq!(commands[1], "pbicli cloud set --name china");
        assert_eq!(
            commands[2],
            "pbicli login --service-principal --principal client-id --secret client-secret --tenant tenant-id"
        );
    }

    #[test]
    fn public_cloud_skips_cloud_switch() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::installed();
        let inputs = batch_inline(&dir).with_input("cloud", "public");

        execute_task(&inputs, &runner);

        assert!(!runner
            .commands()
            .iter()
            .any(|command| command.starts_with("pbicli cloud")));
    }

    #[test]
    fn login_secret_is_masked_when_echoed() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::installed();

        execute_task(&batch_inline(&dir), &runner);

        let recorded = runner.recorded.borrow();
        let login = recorded
            .iter()
            .find(|recorded| recorded.command.args.first().map(String::as_str) == Some("login"))
            .unwrap();
        assert!(!login.command.display().contains("client-secret"));
    }

    #[test]
    fn unsupported_auth_scheme_fails_without_running_script() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::installed();
        let inputs = InputsFile::default()
            .with_variable("Agent.TempDirectory", &dir.path().display().to_string())
            .with_input("scriptType", "bash")
            .with_input("scriptLocation", "inlineScript")
            .with_input("inlineScript", "echo hi")
            .with_input("connectedServiceNameARM", "arm")
            .with_endpoint_url("arm", "https://management.azure.com/")
            .with_endpoint_scheme("arm", "ManagedServiceIdentity")
            .with_endpoint_data("arm", "subscriptionid", "sub")
            .with_endpoint_data("arm", "subscriptionname", "Prod")
            .with_endpoint_data("arm", "environmentUrl", "https://api.powerbi.com")
            .with_endpoint_data("arm", "environmentAuthorityUrl", "https://login.windows.net/")
            .with_endpoint_auth("arm", "serviceprincipalid", "id")
            .with_endpoint_auth("arm", "serviceprincipalkey", "key");

        let outcome = execute_task(&inputs, &runner);

        assert_eq!(
            outcome,
            TaskOutcome::failed(
                "Unsupported authentication scheme 'ManagedServiceIdentity' for endpoint."
            )
        );
        assert!(runner.script_runs().is_empty());
    }

    #[test]
    fn missing_inputs_fail_before_any_process() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::installed();
        let inputs = base_inputs(&dir).with_input("scriptLocation", "inlineScript");

        let outcome = execute_task(&inputs, &runner);

        assert_eq!(outcome, TaskOutcome::failed("Input required: scriptType"));
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn missing_cli_is_installed_and_put_on_path() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::default();
        let inputs = batch_inline(&dir).with_input("version", "1.4.0");

        let outcome = execute_task(&inputs, &runner);
        assert!(outcome.is_success());

        let install_dir = dir.path().join("_pbicli");
        let commands = runner.commands();
        assert_eq!(
            commands[0],
            format!(
                "npm i @powerbi-cli/powerbi-cli@1.4.0 --prefix {}",
                install_dir.display()
            )
        );
        assert!(install_dir.is_dir());

        let recorded = runner.recorded.borrow();
        assert_eq!(
            recorded[0].options.env.get(LOG_LEVEL_VAR).map(String::as_str),
            Some("silent")
        );
        let path = recorded[1].options.env.get("PATH").unwrap();
        let first = std::env::split_paths(path).next().unwrap();
        assert_eq!(first, install::bin_dir(&install_dir));
    }

    #[test]
    fn failed_install_stops_the_task() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner {
            codes: HashMap::from([("npm".to_string(), 1)]),
            ..FakeRunner::default()
        };

        let outcome = execute_task(&batch_inline(&dir), &runner);

        assert_eq!(outcome.result, TaskResult::Failed);
        assert!(outcome.message.starts_with("npm install failed"));
        assert_eq!(runner.commands().len(), 1);
    }

    #[test]
    fn failed_login_stops_the_task() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner {
            codes: HashMap::from([("login".to_string(), 2)]),
            ..FakeRunner::installed()
        };

        let outcome = execute_task(&batch_inline(&dir), &runner);

        assert_eq!(outcome.result, TaskResult::Failed);
        assert!(outcome.message.starts_with("pbicli failed"));
        assert!(runner.script_runs().is_empty());
    }

    #[test]
    fn script_path_directory_becomes_working_directory() {
        let dir = TempDir::new().unwrap();
        let scripts = dir.path().join("scripts");
        fs::create_dir(&scripts).unwrap();
        let script = scripts.join("deploy.sh");
        fs::write(&script, "echo deploy").unwrap();
        let runner = FakeRunner::installed();
        let inputs = base_inputs(&dir)
            .with_input("scriptType", "bash")
            .with_input("scriptLocation", "scriptPath")
            .with_input("scriptPath", &script.display().to_string());

        let outcome = execute_task(&inputs, &runner);

        assert!(outcome.is_success());
        let runs = runner.script_runs();
        assert_eq!(runs[0].options.cwd.as_deref(), Some(scripts.as_path()));
        assert_eq!(runs[0].script_contents.as_deref(), Some("echo deploy"));
        assert!(script.exists());
    }

    #[test]
    fn explicit_working_directory_is_created() {
        let dir = TempDir::new().unwrap();
        let cwd = dir.path().join("work").join("here");
        let runner = FakeRunner::installed();
        let inputs = batch_inline(&dir).with_input("cwd", &cwd.display().to_string());

        execute_task(&inputs, &runner);

        assert!(cwd.is_dir());
        assert_eq!(runner.script_runs()[0].options.cwd.as_deref(), Some(cwd.as_path()));
    }

    #[test]
    fn stderr_collector_keeps_first_ten_lines() {
        let mut collector = StderrCollector::default();
        for index in 0..25 {
            collector.push(&format!("line {}", index));
        }
        assert_eq!(collector.lines().len(), 10);
        assert_eq!(collector.lines()[9], "line 9");
        assert_eq!(collector.seen(), 25);
    }
}
