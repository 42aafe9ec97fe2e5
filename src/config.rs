use crate::agent::AgentContext;
use crate::domain::{AzureModels, ScriptLocation, TaskParameters};
use crate::error::Result;
use crate::ports::TaskInputs;
use crate::task::load_configuration;

const MASK: &str = "***";

/// Prints the resolved task configuration without running anything.
pub fn run_config(inputs: &dyn TaskInputs) -> Result<()> {
    let (params, azure) = load_configuration(inputs)?;
    let context = AgentContext::from_inputs(inputs);
    print!("{}", render(&params, &azure, &context));
    Ok(())
}

fn render(params: &TaskParameters, azure: &AzureModels, context: &AgentContext) -> String {
    let mut lines = vec![
        format!("Version: {}", env!("CARGO_PKG_VERSION")),
        format!("Cloud: {}", params.cloud),
        format!("Script type: {:?}", params.script_type),
        format!("Script location: {:?}", params.script_location),
    ];
    match params.script_location {
        ScriptLocation::ScriptPath => {
            if let Some(path) = &params.script_path {
                lines.push(format!("Script path: {}", path.display()));
            }
        }
        ScriptLocation::InlineScript => {
            let size = params.inline_script.as_deref().map(str::len).unwrap_or(0);
            lines.push(format!("Inline script: {} bytes", size));
        }
    }
    if !params.script_arguments.is_empty() {
        lines.push(format!("Script arguments: {}", params.script_arguments));
    }
    if let Some(cwd) = &params.cwd {
        lines.push(format!("Working directory: {}", cwd.display()));
    }
    lines.extend([
        format!(
            "PowerShell error action: {}",
            params.powershell_error_action_preference
        ),
        format!(
            "Ignore $LASTEXITCODE: {}",
            params.powershell_ignore_last_exit_code
        ),
        format!("Fail on stderr: {}", params.fail_on_stderr),
        format!("pbicli version: {}", params.version),
        format!("Debug: {}", params.debug),
        format!("Connected service: {}", azure.connected_service_name),
        format!("Auth scheme: {}", azure.auth_scheme()),
        format!(
            "Subscription: {} ({})",
            azure.subscription_name.as_deref().unwrap_or_default(),
            azure.subscription_id.as_deref().unwrap_or_default()
        ),
        format!("Client id: {}", azure.service_principal_client_id),
        format!("Client secret: {}", MASK),
        format!("Tenant id: {}", azure.tenant_id),
        format!("Environment: {}", azure.environment_url),
        format!(
            "Authority: {}",
            azure.environment_authority_url.as_deref().unwrap_or_default()
        ),
        format!("Endpoint url: {}", azure.url.as_deref().unwrap_or_default()),
        format!("Audience: {}", azure.audience()),
        format!("Work folder: {}", context.work_folder.display()),
        format!("Temp directory: {}", context.temp_dir.display()),
        format!("Install directory: {}", context.install_dir().display()),
    ]);
    if let Some(version) = &context.version {
        lines.push(format!("Agent version: {}", version));
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}
