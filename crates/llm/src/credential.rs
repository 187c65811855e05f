//! Bearer credentials for the completion endpoint.
//!
//! A [`Credential`] is chosen once at startup and asked for a token before
//! every request. Token-based variants cache the token they fetched and
//! only go back to the identity provider when it is close to expiring.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Mutex;

/// OAuth scope requested for Azure OpenAI tokens.
pub const COGNITIVE_SERVICES_SCOPE: &str = "https://cognitiveservices.azure.com/.default";

/// Instance metadata token endpoint used when no identity endpoint is set.
const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const IDENTITY_ENDPOINT_API_VERSION: &str = "2019-08-01";

/// Tokens are refreshed this long before they expire.
const REFRESH_MARGIN_SECS: i64 = 300;

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Token request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Identity endpoint returned {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("Developer CLI token command failed: {0}")]
    Cli(String),

    #[error("Malformed token response: {0}")]
    Malformed(String),
}

/// A bearer token and the instant it stops being valid.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_on - chrono::Duration::seconds(REFRESH_MARGIN_SECS) > now
    }
}

/// Last token fetched by a token credential.
#[derive(Debug, Default)]
pub struct TokenCache {
    current: Mutex<Option<AccessToken>>,
}

/// How requests to the completion endpoint are authenticated.
pub enum Credential {
    /// No `Authorization` header (local OpenAI-compatible servers).
    None,
    /// Static API key sent as the bearer token.
    ApiKey(String),
    /// Azure managed identity, optionally user-assigned.
    ManagedIdentity {
        client_id: Option<String>,
        cache: TokenCache,
    },
    /// Token from the Azure Developer CLI (`azd auth token`).
    DeveloperCli {
        tenant_id: Option<String>,
        cache: TokenCache,
    },
}

impl Credential {
    pub fn managed_identity(client_id: Option<String>) -> Self {
        Credential::ManagedIdentity {
            client_id,
            cache: TokenCache::default(),
        }
    }

    pub fn developer_cli(tenant_id: Option<String>) -> Self {
        Credential::DeveloperCli {
            tenant_id,
            cache: TokenCache::default(),
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Credential::None => "none",
            Credential::ApiKey(_) => "api_key",
            Credential::ManagedIdentity { .. } => "managed_identity",
            Credential::DeveloperCli { .. } => "developer_cli",
        }
    }

    /// Token for the `Authorization: Bearer` header, or `None` when the
    /// endpoint is unauthenticated.
    pub async fn bearer_token(
        &self,
        http: &reqwest::Client,
    ) -> Result<Option<String>, CredentialError> {
        match self {
            Credential::None => Ok(None),
            Credential::ApiKey(key) => Ok(Some(key.clone())),
            Credential::ManagedIdentity { client_id, cache } => {
                let token = cache
                    .get_or_refresh(|| managed_identity_token(http, client_id.as_deref()))
                    .await?;
                Ok(Some(token))
            }
            Credential::DeveloperCli { tenant_id, cache } => {
                let token = cache
                    .get_or_refresh(|| developer_cli_token(tenant_id.as_deref()))
                    .await?;
                Ok(Some(token))
            }
        }
    }
}

impl TokenCache {
    /// Return the cached token, fetching a new one with `fetch` when there
    /// is none or it expires within the refresh margin.
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<String, CredentialError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<AccessToken, CredentialError>>,
    {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref().filter(|t| t.is_fresh(Utc::now())) {
            return Ok(token.token.clone());
        }

        let token = fetch().await?;
        tracing::debug!(expires_on = %token.expires_on, "Fetched new access token");
        let value = token.token.clone();
        *current = Some(token);
        Ok(value)
    }
}

/// Resource URI for a `/.default` scope.
fn scope_resource(scope: &str) -> &str {
    scope.strip_suffix("/.default").unwrap_or(scope)
}

#[derive(Debug, Deserialize)]
struct IdentityTokenResponse {
    access_token: String,
    expires_on: serde_json::Value,
}

async fn managed_identity_token(
    http: &reqwest::Client,
    client_id: Option<&str>,
) -> Result<AccessToken, CredentialError> {
    let resource = scope_resource(COGNITIVE_SERVICES_SCOPE);

    let identity_endpoint = std::env::var("IDENTITY_ENDPOINT").ok();
    let identity_header = std::env::var("IDENTITY_HEADER").ok();

    let mut request = match (identity_endpoint, identity_header) {
        (Some(endpoint), Some(header)) => http
            .get(endpoint)
            .query(&[("api-version", IDENTITY_ENDPOINT_API_VERSION), ("resource", resource)])
            .header("X-IDENTITY-HEADER", header),
        _ => http
            .get(IMDS_TOKEN_URL)
            .query(&[("api-version", IMDS_API_VERSION), ("resource", resource)])
            .header("Metadata", "true"),
    };
    if let Some(client_id) = client_id {
        request = request.query(&[("client_id", client_id)]);
    }

    let response = request.timeout(PROVIDER_TIMEOUT).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(CredentialError::Provider {
            status: status.as_u16(),
            body,
        });
    }

    let body: IdentityTokenResponse = response.json().await?;
    Ok(AccessToken {
        token: body.access_token,
        expires_on: parse_epoch_seconds(&body.expires_on)?,
    })
}

/// Identity endpoints report `expires_on` as epoch seconds, sometimes as a
/// JSON string and sometimes as a number.
fn parse_epoch_seconds(value: &serde_json::Value) -> Result<DateTime<Utc>, CredentialError> {
    let seconds = match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| CredentialError::Malformed(format!("expires_on: {value}")))?;

    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| CredentialError::Malformed(format!("expires_on out of range: {seconds}")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliTokenResponse {
    token: String,
    expires_on: String,
}

async fn developer_cli_token(tenant_id: Option<&str>) -> Result<AccessToken, CredentialError> {
    let mut command = Command::new("azd");
    command.args([
        "auth",
        "token",
        "--output",
        "json",
        "--scope",
        COGNITIVE_SERVICES_SCOPE,
    ]);
    if let Some(tenant_id) = tenant_id {
        command.args(["--tenant-id", tenant_id]);
    }

    let output = run_cli(command, PROVIDER_TIMEOUT).await?;
    if !output.status.success() {
        return Err(CredentialError::Cli(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    parse_cli_token(&output.stdout)
}

/// Run `command` to completion, killing it if it outlives `limit`.
async fn run_cli(
    mut command: Command,
    limit: Duration,
) -> Result<std::process::Output, CredentialError> {
    command.kill_on_drop(true);
    tokio::time::timeout(limit, command.output())
        .await
        .map_err(|_| CredentialError::Cli(format!("azd auth token timed out after {limit:?}")))?
        .map_err(|e| CredentialError::Cli(format!("could not run azd: {e}")))
}

fn parse_cli_token(stdout: &[u8]) -> Result<AccessToken, CredentialError> {
    let body: CliTokenResponse =
        serde_json::from_slice(stdout).map_err(|e| CredentialError::Malformed(e.to_string()))?;
    let expires_on = DateTime::parse_from_rfc3339(&body.expires_on)
        .map_err(|e| CredentialError::Malformed(format!("expiresOn: {e}")))?
        .with_timezone(&Utc);
    Ok(AccessToken {
        token: body.token,
        expires_on,
    })
}
