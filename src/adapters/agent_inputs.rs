use crate::error::ConfigError;
use crate::ports::TaskInputs;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;

/// Inputs exposed by the pipeline agent through environment variables.
pub struct AgentEnvInputs {
    vars: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct EndpointAuthorization {
    #[serde(default)]
    parameters: HashMap<String, String>,
}

impl AgentEnvInputs {
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            vars: vars.into_iter().collect(),
        }
    }

    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }

    /// Falls back to the JSON blob in `ENDPOINT_AUTH_<id>`.
    fn auth_blob_parameter(&self, id: &str, key: &str) -> Option<String> {
        let raw = self.var(&format!("ENDPOINT_AUTH_{}", id))?;
        let auth: EndpointAuthorization = match serde_json::from_str(&raw) {
            Ok(auth) => auth,
            Err(err) => {
                tracing::debug!("ignoring unreadable authorization for endpoint {}: {}", id, err);
                return None;
            }
        };
        auth.parameters
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value)
    }
}

impl TaskInputs for AgentEnvInputs {
    fn input(&self, name: &str) -> Option<String> {
        self.var(&format!("INPUT_{}", name.replace(' ', "_").to_uppercase()))
    }

    fn variable(&self, name: &str) -> Option<String> {
        self.var(&name.replace(['.', ' '], "_").to_uppercase())
    }

    fn endpoint_url(&self, id: &str) -> Option<String> {
        self.var(&format!("ENDPOINT_URL_{}", id))
    }

    fn endpoint_auth_scheme(&self, id: &str) -> Option<String> {
        self.var(&format!("ENDPOINT_AUTH_SCHEME_{}", id))
    }

    fn endpoint_auth_parameter(&self, id: &str, key: &str) -> Option<String> {
        self.var(&format!(
            "ENDPOINT_AUTH_PARAMETER_{}_{}",
            id,
            key.to_uppercase()
        ))
        .or_else(|| self.auth_blob_parameter(id, key))
    }

    fn endpoint_data_parameter(&self, id: &str, key: &str) -> Option<String> {
        self.var(&format!("ENDPOINT_DATA_{}_{}", id, key.to_uppercase()))
    }
}

/// Scalar value in an inputs file; agents only ever deliver strings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    Text(String),
    Flag(bool),
    Number(i64),
}

impl fmt::Display for InputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputValue::Text(text) => f.write_str(text),
            InputValue::Flag(flag) => write!(f, "{}", flag),
            InputValue::Number(number) => write!(f, "{}", number),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointRecord {
    pub url: Option<String>,
    pub scheme: Option<String>,
    #[serde(default)]
    pub auth: BTreeMap<String, String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// TOML description of a task invocation, used for runs outside an agent.
///
/// ```toml
/// [inputs]
/// scriptType = "bash"
/// scriptLocation = "inlineScript"
/// inlineScript = "pbicli workspace list"
///
/// [variables]
/// "System.Debug" = "true"
///
/// [endpoints.my-arm]
/// url = "https://management.azure.com/"
/// scheme = "ServicePrincipal"
/// auth = { serviceprincipalid = "...", serviceprincipalkey = "...", tenantid = "..." }
/// data = { environmentUrl = "https://api.powerbi.com" }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InputsFile {
    #[serde(default)]
    pub inputs: BTreeMap<String, InputValue>,
    #[serde(default)]
    pub variables: BTreeMap<String, InputValue>,
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointRecord>,
}

impl InputsFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|err| ConfigError::InputsFile {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        toml::from_str(&contents).map_err(|err| ConfigError::InputsFile {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    pub fn with_input(mut self, name: &str, value: &str) -> Self {
        self.inputs
            .insert(name.to_string(), InputValue::Text(value.to_string()));
        self
    }

    pub fn with_variable(mut self, name: &str, value: &str) -> Self {
        self.variables
            .insert(name.to_string(), InputValue::Text(value.to_string()));
        self
    }

    pub fn with_endpoint_url(mut self, id: &str, url: &str) -> Self {
        self.endpoint_mut(id).url = Some(url.to_string());
        self
    }

    pub fn with_endpoint_scheme(mut self, id: &str, scheme: &str) -> Self {
        self.endpoint_mut(id).scheme = Some(scheme.to_string());
        self
    }

    pub fn with_endpoint_auth(mut self, id: &str, key: &str, value: &str) -> Self {
        self.endpoint_mut(id)
            .auth
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_endpoint_data(mut self, id: &str, key: &str, value: &str) -> Self {
        self.endpoint_mut(id)
            .data
            .insert(key.to_string(), value.to_string());
        self
    }

    fn endpoint_mut(&mut self, id: &str) -> &mut EndpointRecord {
        self.endpoints.entry(id.to_string()).or_default()
    }

    fn endpoint(&self, id: &str) -> Option<&EndpointRecord> {
        self.endpoints.get(id)
    }
}

fn lookup<V: ToString>(map: &BTreeMap<String, V>, name: &str) -> Option<String> {
    map.iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.to_string())
}

impl TaskInputs for InputsFile {
    fn input(&self, name: &str) -> Option<String> {
        lookup(&self.inputs, name)
    }

    fn variable(&self, name: &str) -> Option<String> {
        lookup(&self.variables, name)
    }

    fn endpoint_url(&self, id: &str) -> Option<String> {
        self.endpoint(id)?.url.clone()
    }

    fn endpoint_auth_scheme(&self, id: &str) -> Option<String> {
        self.endpoint(id)?.scheme.clone()
    }

    fn endpoint_auth_parameter(&self, id: &str, key: &str) -> Option<String> {
        lookup(&self.endpoint(id)?.auth, key)
    }

    fn endpoint_data_parameter(&self, id: &str, key: &str) -> Option<String> {
        lookup(&self.endpoint(id)?.data, key)
    }
}

/// Consults `primary` first and `fallback` for anything it does not define.
pub struct LayeredInputs<P, F> {
    primary: P,
    fallback: F,
}

impl<P: TaskInputs, F: TaskInputs> LayeredInputs<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

impl<P: TaskInputs, F: TaskInputs> TaskInputs for LayeredInputs<P, F> {
    fn input(&self, name: &str) -> Option<String> {
        self.primary
            .input(name)
            .or_else(|| self.fallback.input(name))
    }

    fn variable(&self, name: &str) -> Option<String> {
        self.primary
            .variable(name)
            .or_else(|| self.fallback.variable(name))
    }

    fn endpoint_url(&self, id: &str) -> Option<String> {
        self.primary
            .endpoint_url(id)
            .or_else(|| self.fallback.endpoint_url(id))
    }

    fn endpoint_auth_scheme(&self, id: &str) -> Option<String> {
        self.primary
            .endpoint_auth_scheme(id)
            .or_else(|| self.fallback.endpoint_auth_scheme(id))
    }

    fn endpoint_auth_parameter(&self, id: &str, key: &str) -> Option<String> {
        self.primary
            .endpoint_auth_parameter(id, key)
            .or_else(|| self.fallback.endpoint_auth_parameter(id, key))
    }

    fn endpoint_data_parameter(&self, id: &str, key: &str) -> Option<String> {
        self.primary
            .endpoint_data_parameter(id, key)
            .or_else(|| self.fallback.endpoint_data_parameter(id, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(vars: &[(&str, &str)]) -> AgentEnvInputs {
        AgentEnvInputs::from_vars(
            vars.iter()
                .map(|(key, value)| (key.to_string(), value.to_string())),
        )
    }

    #[test]
    fn agent_input_names_are_upper_cased() {
        let inputs = agent(&[("INPUT_SCRIPTTYPE", "bash"), ("INPUT_MY_INPUT", "x")]);
        assert_eq!(inputs.input("scriptType").as_deref(), Some("bash"));
        assert_eq!(inputs.input("my input").as_deref(), Some("x"));
    }

    #[test]
    fn agent_variables_replace_dots() {
        let inputs = agent(&[("SYSTEM_DEBUG", "true"), ("AGENT_TEMPDIRECTORY", "/tmp/a")]);
        assert_eq!(inputs.variable("System.Debug").as_deref(), Some("true"));
        assert_eq!(
            inputs.variable("Agent.TempDirectory").as_deref(),
            Some("/tmp/a")
        );
    }

    #[test]
    fn agent_endpoint_lookups() {
        let inputs = agent(&[
            ("ENDPOINT_URL_arm", "https://management.azure.com/"),
            ("ENDPOINT_AUTH_SCHEME_arm", "ServicePrincipal"),
            ("ENDPOINT_AUTH_PARAMETER_arm_SERVICEPRINCIPALID", "client"),
            ("ENDPOINT_DATA_arm_ENVIRONMENTURL", "https://api.powerbi.com"),
        ]);
        assert_eq!(
            inputs.endpoint_url("arm").as_deref(),
            Some("https://management.azure.com/")
        );
        assert_eq!(
            inputs.endpoint_auth_scheme("arm").as_deref(),
            Some("ServicePrincipal")
        );
        assert_eq!(
            inputs
                .endpoint_auth_parameter("arm", "serviceprincipalid")
                .as_deref(),
            Some("client")
        );
        assert_eq!(
            inputs
                .endpoint_data_parameter("arm", "environmentUrl")
                .as_deref(),
            Some("https://api.powerbi.com")
        );
    }

    #[test]
    fn agent_auth_parameter_falls_back_to_json_blob() {
        let inputs = agent(&[(
            "ENDPOINT_AUTH_arm",
            r#"{"scheme":"ServicePrincipal","parameters":{"serviceprincipalkey":"k3y","tenantid":"t"}}"#,
        )]);
        assert_eq!(
            inputs
                .endpoint_auth_parameter("arm", "serviceprincipalkey")
                .as_deref(),
            Some("k3y")
        );
        assert_eq!(inputs.endpoint_auth_parameter("arm", "missing"), None);
    }

    #[test]
    fn inputs_file_parses_toml() {
        let file: InputsFile = toml::from_str(
            r#"
            [inputs]
            scriptType = "bash"
            failOnStandardError = true

            [variables]
            "System.Debug" = "true"

            [endpoints.arm]
            url = "https://management.azure.com/"
            auth = { serviceprincipalid = "client" }
            data = { environmentUrl = "https://api.powerbi.com" }
            "#,
        )
        .unwrap();
        assert_eq!(file.input("scripttype").as_deref(), Some("bash"));
        assert_eq!(file.input("failOnStandardError").as_deref(), Some("true"));
        assert_eq!(file.variable("system.debug").as_deref(), Some("true"));
        assert_eq!(
            file.endpoint_auth_parameter("arm", "serviceprincipalid")
                .as_deref(),
            Some("client")
        );
        assert_eq!(file.endpoint_auth_scheme("arm"), None);
    }

    #[test]
    fn layered_inputs_prefer_primary() {
        let file = InputsFile::default().with_input("scriptType", "pscore");
        let env = agent(&[("INPUT_SCRIPTTYPE", "bash"), ("INPUT_VERSION", "1.2.0")]);
        let layered = LayeredInputs::new(file, env);
        assert_eq!(layered.input("scriptType").as_deref(), Some("pscore"));
        assert_eq!(layered.input("version").as_deref(), Some("1.2.0"));
    }

    #[test]
    fn missing_inputs_file_is_reported() {
        let err = InputsFile::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::InputsFile { .. }));
    }
}
