// src/http.rs

use crate::config::ValidationDetails;
use crate::error::NilaRpError;
use serde::de::DeserializeOwned;
use serde::Deserialize;

const USER_AGENT: &str = concat!("nila-oidc-rp/", env!("CARGO_PKG_VERSION"));

/// Builds the shared HTTP client. Every request inherits the configured timeout.
pub(crate) fn build_client(details: &ValidationDetails) -> Result<reqwest::Client, NilaRpError> {
    Ok(reqwest::Client::builder()
        .timeout(details.http_timeout)
        .user_agent(USER_AGENT)
        .build()?)
}

/// An OAuth 2.0 error body (`{"error": ..., "error_description": ...}`).
#[derive(Debug, Deserialize)]
pub(crate) struct OAuthErrorBody {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Reads a JSON body, turning a non-2xx status into `NilaRpError::InvalidResponse`
/// (or the OAuth error it carries).
pub(crate) async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, NilaRpError> {
    let status = response.status();
    let url = response.url().to_string();
    let body = response.text().await?;
    if !status.is_success() {
        if let Ok(err) = serde_json::from_str::<OAuthErrorBody>(&body) {
            return Err(NilaRpError::TokenEndpoint {
                error: err.error,
                description: err.error_description,
            });
        }
        return Err(NilaRpError::InvalidResponse(format!(
            "unexpected HTTP status {} from {}",
            status.as_u16(),
            url
        )));
    }
    Ok(serde_json::from_str(&body)?)
}

/// Extracts the `error` attribute from a `WWW-Authenticate: Bearer ...` challenge.
pub(crate) fn bearer_error(header: &str) -> Option<String> {
    let params = header.trim().strip_prefix("Bearer")?;
    params.split(',').find_map(|part| {
        let (name, value) = part.trim().split_once('=')?;
        (name.trim() == "error").then(|| value.trim().trim_matches('"').to_string())
    })
}
