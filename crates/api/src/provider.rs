//! Selection of the upstream completion provider.

use std::fmt;

use chatvision_llm::{CompletionClient, Credential, UpstreamError};

use crate::config::ConfigError;

/// Base URL of the GitHub Models inference endpoint.
pub const GITHUB_MODELS_ENDPOINT: &str = "https://models.github.ai/inference";

/// Where chat completions are sent and how requests authenticate.
///
/// Chosen by `OPENAI_HOST`:
///
/// | `OPENAI_HOST` | Condition                          | Variant                |
/// |---------------|------------------------------------|------------------------|
/// | `local`       |                                    | `Local`                |
/// | `github`      |                                    | `Github`               |
/// | other         | `AZURE_OPENAI_KEY_FOR_CHATVISION`  | `AzureKey`             |
/// | other         | `RUNNING_IN_PRODUCTION`            | `AzureManagedIdentity` |
/// | other         | neither                            | `AzureDeveloperCli`    |
#[derive(Clone, PartialEq, Eq)]
pub enum UpstreamProvider {
    /// OpenAI-compatible server at `LOCAL_OPENAI_ENDPOINT`, unauthenticated.
    Local { endpoint: String },
    /// GitHub Models with `GITHUB_TOKEN`.
    Github { token: String },
    /// Azure OpenAI at `AZURE_OPENAI_ENDPOINT` with a static key.
    AzureKey { endpoint: String, key: String },
    /// Azure OpenAI with the managed identity `AZURE_CLIENT_ID`.
    AzureManagedIdentity { endpoint: String, client_id: String },
    /// Azure OpenAI with an `azd` login for `AZURE_TENANT_ID`.
    AzureDeveloperCli { endpoint: String, tenant_id: String },
}

impl fmt::Debug for UpstreamProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamProvider::Local { endpoint } => {
                f.debug_struct("Local").field("endpoint", endpoint).finish()
            }
            UpstreamProvider::Github { .. } => f.debug_struct("Github").finish_non_exhaustive(),
            UpstreamProvider::AzureKey { endpoint, .. } => f
                .debug_struct("AzureKey")
                .field("endpoint", endpoint)
                .finish_non_exhaustive(),
            UpstreamProvider::AzureManagedIdentity {
                endpoint,
                client_id,
            } => f
                .debug_struct("AzureManagedIdentity")
                .field("endpoint", endpoint)
                .field("client_id", client_id)
                .finish(),
            UpstreamProvider::AzureDeveloperCli {
                endpoint,
                tenant_id,
            } => f
                .debug_struct("AzureDeveloperCli")
                .field("endpoint", endpoint)
                .field("tenant_id", tenant_id)
                .finish(),
        }
    }
}

impl UpstreamProvider {
    pub fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |var: &'static str| {
            lookup(var)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(var))
        };

        let host = lookup("OPENAI_HOST").unwrap_or_else(|| "github".into());
        let provider = match host.as_str() {
            "local" => UpstreamProvider::Local {
                endpoint: required("LOCAL_OPENAI_ENDPOINT")?,
            },
            "github" => UpstreamProvider::Github {
                token: required("GITHUB_TOKEN")?,
            },
            _ => {
                if let Some(key) = lookup("AZURE_OPENAI_KEY_FOR_CHATVISION").filter(|k| !k.is_empty()) {
                    UpstreamProvider::AzureKey {
                        endpoint: required("AZURE_OPENAI_ENDPOINT")?,
                        key,
                    }
                } else if lookup("RUNNING_IN_PRODUCTION").is_some_and(|v| !v.is_empty()) {
                    UpstreamProvider::AzureManagedIdentity {
                        endpoint: required("AZURE_OPENAI_ENDPOINT")?,
                        client_id: required("AZURE_CLIENT_ID")?,
                    }
                } else {
                    UpstreamProvider::AzureDeveloperCli {
                        endpoint: required("AZURE_OPENAI_ENDPOINT")?,
                        tenant_id: required("AZURE_TENANT_ID")?,
                    }
                }
            }
        };
        Ok(provider)
    }

    /// API root that `/chat/completions` is appended to.
    pub fn base_url(&self) -> String {
        match self {
            UpstreamProvider::Local { endpoint } => endpoint.clone(),
            UpstreamProvider::Github { .. } => GITHUB_MODELS_ENDPOINT.to_string(),
            UpstreamProvider::AzureKey { endpoint, .. } => endpoint.clone(),
            UpstreamProvider::AzureManagedIdentity { endpoint, .. }
            | UpstreamProvider::AzureDeveloperCli { endpoint, .. } => {
                format!("{}/openai/v1", endpoint.trim_end_matches('/'))
            }
        }
    }

    /// Model id as the provider expects it. GitHub Models namespaces
    /// OpenAI models under `openai/`.
    pub fn model_id(&self, model: &str) -> String {
        match self {
            UpstreamProvider::Github { .. } => format!("openai/{model}"),
            _ => model.to_string(),
        }
    }

    pub fn credential(&self) -> Credential {
        match self {
            UpstreamProvider::Local { .. } => Credential::None,
            UpstreamProvider::Github { token } => Credential::ApiKey(token.clone()),
            UpstreamProvider::AzureKey { key, .. } => Credential::ApiKey(key.clone()),
            UpstreamProvider::AzureManagedIdentity { client_id, .. } => {
                Credential::managed_identity(Some(client_id.clone()))
            }
            UpstreamProvider::AzureDeveloperCli { tenant_id, .. } => {
                Credential::developer_cli(Some(tenant_id.clone()))
            }
        }
    }

    /// Build the completion client for `model`.
    pub fn build_client(&self, model: &str) -> Result<CompletionClient, UpstreamError> {
        let client = CompletionClient::new(self.base_url(), self.model_id(model), self.credential())?;
        tracing::info!(
            base_url = %client.base_url(),
            model = %client.model(),
            credential = client.credential().kind(),
            "Configured completion provider",
        );
        Ok(client)
    }
}
