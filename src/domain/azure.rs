use crate::error::ConfigError;
use crate::ports::{non_blank, TaskInputs};
use url::Url;

/// Connected service name that switches to the local-debug inputs.
const LOCAL_SERVICE: &str = "local";
const DEFAULT_AUTH_SCHEME: &str = "ServicePrincipal";

/// Service principal credentials and environment endpoints.
///
/// Either resolved entirely from a connected service record, or entirely
/// from the local-debug inputs when the service is named `local`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureModels {
    pub connected_service_name: String,
    pub auth_scheme: Option<String>,
    pub subscription_id: Option<String>,
    pub subscription_name: Option<String>,
    pub service_principal_client_id: String,
    pub service_principal_key: String,
    pub tenant_id: String,
    pub environment_url: Url,
    pub environment_authority_url: Option<String>,
    pub url: Option<String>,
}

impl AzureModels {
    pub fn from_inputs(inputs: &dyn TaskInputs) -> Result<Self, ConfigError> {
        let name = inputs.required_input("connectedServiceNameARM")?;
        if name == LOCAL_SERVICE {
            Self::from_local_inputs(inputs, name)
        } else {
            Self::from_endpoint(inputs, name)
        }
    }

    fn from_local_inputs(inputs: &dyn TaskInputs, name: String) -> Result<Self, ConfigError> {
        Ok(Self {
            auth_scheme: None,
            subscription_id: Some(inputs.required_input("subscriptionid")?),
            subscription_name: Some(inputs.required_input("subscriptionname")?),
            service_principal_client_id: inputs.required_input("serviceprincipalid")?,
            service_principal_key: inputs.required_input("serviceprincipalkey")?,
            environment_url: parse_url(
                "environmentUrl",
                &inputs.required_input("environmentUrl")?,
            )?,
            environment_authority_url: Some(inputs.required_input("environmentAuthorityUrl")?),
            tenant_id: inputs.required_input("tenantid")?,
            url: Some(inputs.required_input("connectedServiceNameUrl")?),
            connected_service_name: name,
        })
    }

    fn from_endpoint(inputs: &dyn TaskInputs, name: String) -> Result<Self, ConfigError> {
        let data = |key: &str| {
            non_blank(inputs.endpoint_data_parameter(&name, key))
                .ok_or_else(|| missing_endpoint_value(&name, "data", key))
        };
        let auth = |key: &str| {
            non_blank(inputs.endpoint_auth_parameter(&name, key))
                .ok_or_else(|| missing_endpoint_value(&name, "authorization", key))
        };

        let environment_url = data("environmentUrl")?;
        Ok(Self {
            auth_scheme: non_blank(inputs.endpoint_auth_scheme(&name)),
            subscription_id: Some(data("subscriptionid")?),
            subscription_name: Some(data("subscriptionname")?),
            service_principal_client_id: auth("serviceprincipalid")?,
            service_principal_key: auth("serviceprincipalkey")?,
            environment_url: parse_url("environmentUrl", &environment_url)?,
            environment_authority_url: Some(data("environmentAuthorityUrl")?),
            tenant_id: non_blank(inputs.endpoint_auth_parameter(&name, "tenantid"))
                .unwrap_or_default(),
            url: Some(
                non_blank(inputs.endpoint_url(&name))
                    .ok_or_else(|| missing_endpoint_value(&name, "url", "url"))?,
            ),
            connected_service_name: name,
        })
    }

    pub fn auth_scheme(&self) -> &str {
        self.auth_scheme.as_deref().unwrap_or(DEFAULT_AUTH_SCHEME)
    }

    pub fn environment_host(&self) -> &str {
        self.environment_url.host_str().unwrap_or_default()
    }

    pub fn audience(&self) -> String {
        format!("https://{}/.default", self.environment_host())
    }
}

fn parse_url(name: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|_| ConfigError::InvalidUrl {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn missing_endpoint_value(id: &str, kind: &str, key: &str) -> ConfigError {
    ConfigError::MalformedEndpoint {
        id: id.to_string(),
        message: format!("missing {} value '{}'", kind, key),
    }
}
