// src/config.rs

use crate::error::NilaRpError;
use crate::jose::SigningAlgorithm;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// How the client authenticates at the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEndpointAuthMethod {
    #[default]
    ClientSecretBasic,
    ClientSecretPost,
    ClientSecretJwt,
    PrivateKeyJwt,
    None,
}

impl TokenEndpointAuthMethod {
    /// Whether this method needs a `client_secret`.
    pub fn uses_secret(&self) -> bool {
        matches!(
            self,
            TokenEndpointAuthMethod::ClientSecretBasic
                | TokenEndpointAuthMethod::ClientSecretPost
                | TokenEndpointAuthMethod::ClientSecretJwt
        )
    }
}

/// The registered client, as returned by dynamic registration or configured statically.
///
/// Immutable once the relying party is built.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default = "default_response_types")]
    pub response_types: Vec<String>,
    #[serde(default = "default_grant_types")]
    pub grant_types: Vec<String>,
    #[serde(default)]
    pub token_endpoint_auth_method: TokenEndpointAuthMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_signing_alg: Option<SigningAlgorithm>,
    #[serde(default)]
    pub id_token_signed_response_alg: SigningAlgorithm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token_encrypted_response_alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token_encrypted_response_enc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_signed_response_alg: Option<SigningAlgorithm>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_encrypted_response_alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_encrypted_response_enc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_object_signing_alg: Option<SigningAlgorithm>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_object_encryption_alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_object_encryption_enc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_max_age: Option<u64>,
    #[serde(default)]
    pub require_auth_time: bool,
    #[serde(flatten)]
    pub other: HashMap<String, Value>,
}

fn default_response_types() -> Vec<String> {
    vec!["code".to_string()]
}

fn default_grant_types() -> Vec<String> {
    vec!["authorization_code".to_string()]
}

impl ClientConfig {
    /// A minimal client with registration defaults.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            redirect_uris: Vec::new(),
            response_types: default_response_types(),
            grant_types: default_grant_types(),
            token_endpoint_auth_method: TokenEndpointAuthMethod::default(),
            token_endpoint_auth_signing_alg: None,
            id_token_signed_response_alg: SigningAlgorithm::default(),
            id_token_encrypted_response_alg: None,
            id_token_encrypted_response_enc: None,
            userinfo_signed_response_alg: None,
            userinfo_encrypted_response_alg: None,
            userinfo_encrypted_response_enc: None,
            request_object_signing_alg: None,
            request_object_encryption_alg: None,
            request_object_encryption_enc: None,
            jwks: None,
            jwks_uri: None,
            default_max_age: None,
            require_auth_time: false,
            other: HashMap::new(),
        }
    }

    /// The client secret, or a configuration error naming what needed it.
    pub(crate) fn secret_for(&self, purpose: &str) -> Result<&str, NilaRpError> {
        self.client_secret.as_deref().ok_or_else(|| {
            NilaRpError::Configuration(format!("client_secret is required for {purpose}"))
        })
    }
}

/// Contains the validation settings applied to ID Tokens and key sets.
#[derive(Debug, Clone)]
pub struct ValidationDetails {
    /// The tolerance for clock skew when validating `exp`, `iat` and `auth_time`.
    /// Defaults to 60 seconds.
    pub leeway: Duration,
    /// A cached key set older than this is eligible for one forced refresh when
    /// a signature check finds no matching key. Defaults to 60 seconds.
    pub jwks_stale_after: Duration,
    /// The duration for which a fetched JWKS is cached if no `Cache-Control` header is present.
    pub cache_ttl: Duration,
    /// Timeout applied to every outbound HTTP request.
    pub http_timeout: Duration,
}

impl Default for ValidationDetails {
    fn default() -> Self {
        Self {
            leeway: Duration::from_secs(60),
            jwks_stale_after: Duration::from_secs(60),
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            http_timeout: Duration::from_secs(5),
        }
    }
}

/// The main configuration for a relying party: the registered client plus validation settings.
///
/// It should be constructed using the `ConfigBuilder`.
#[derive(Debug, Clone)]
pub struct Config {
    pub client: ClientConfig,
    pub validation: ValidationDetails,
}

/// A builder for creating a `Config` instance.
///
/// This builder provides a fluent API to ensure that the configuration is
/// constructed correctly and with all required fields.
#[derive(Default)]
pub struct ConfigBuilder {
    client_id: Option<String>,
    client: Option<ClientConfig>,
    client_secret: Option<String>,
    redirect_uris: Vec<String>,
    response_types: Option<Vec<String>>,
    auth_method: Option<TokenEndpointAuthMethod>,
    id_token_alg: Option<SigningAlgorithm>,
    validation: ValidationDetails,
}

impl ConfigBuilder {
    /// Creates a new `ConfigBuilder`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a client obtained through dynamic registration.
    pub fn from_client(client: ClientConfig) -> Self {
        Self {
            client: Some(client),
            ..Self::default()
        }
    }

    /// Sets the client ID of the application. Required unless built `from_client`.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    /// Adds a redirect URI. The value must be an absolute URL.
    pub fn redirect_uri(mut self, uri: &str) -> Result<Self, NilaRpError> {
        Url::parse(uri)?;
        self.redirect_uris.push(uri.to_string());
        Ok(self)
    }

    pub fn response_types(mut self, response_types: Vec<String>) -> Self {
        self.response_types = Some(response_types);
        self
    }

    pub fn token_endpoint_auth_method(mut self, method: TokenEndpointAuthMethod) -> Self {
        self.auth_method = Some(method);
        self
    }

    /// Sets the expected ID Token signing algorithm. Defaults to `RS256`.
    pub fn id_token_signed_response_alg(mut self, alg: SigningAlgorithm) -> Self {
        self.id_token_alg = Some(alg);
        self
    }

    /// Sets the clock skew tolerance. Defaults to 60 seconds.
    pub fn leeway(mut self, leeway: Duration) -> Self {
        self.validation.leeway = leeway;
        self
    }

    /// Sets the JWKS staleness threshold used by the key rotation retry.
    pub fn jwks_stale_after(mut self, stale_after: Duration) -> Self {
        self.validation.jwks_stale_after = stale_after;
        self
    }

    /// Sets the fallback cache TTL for the JWKS.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.validation.cache_ttl = ttl;
        self
    }

    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.validation.http_timeout = timeout;
        self
    }

    /// Consumes the builder and returns a `Config` object.
    ///
    /// # Errors
    ///
    /// Returns an error if `client_id` is missing, or if the chosen token endpoint
    /// authentication method or an HMAC ID Token algorithm needs a `client_secret`
    /// that was not provided.
    pub fn build(self) -> Result<Config, NilaRpError> {
        let mut client = match (self.client, self.client_id) {
            (Some(client), _) => client,
            (None, Some(client_id)) => ClientConfig::new(client_id),
            (None, None) => {
                return Err(NilaRpError::Configuration(
                    "A required configuration field is missing: client_id".to_string(),
                ))
            }
        };

        if let Some(secret) = self.client_secret {
            client.client_secret = Some(secret);
        }
        if !self.redirect_uris.is_empty() {
            client.redirect_uris = self.redirect_uris;
        }
        if let Some(response_types) = self.response_types {
            client.response_types = response_types;
        }
        if let Some(method) = self.auth_method {
            client.token_endpoint_auth_method = method;
        }
        if let Some(alg) = self.id_token_alg {
            client.id_token_signed_response_alg = alg;
        }

        if client.token_endpoint_auth_method.uses_secret() && client.client_secret.is_none() {
            return Err(NilaRpError::Configuration(format!(
                "client_secret is required for token_endpoint_auth_method {:?}",
                client.token_endpoint_auth_method
            )));
        }
        if client.id_token_signed_response_alg.is_symmetric() && client.client_secret.is_none() {
            return Err(NilaRpError::Configuration(
                "client_secret is required for HMAC signed ID Tokens".to_string(),
            ));
        }

        Ok(Config {
            client,
            validation: self.validation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::Algorithm;

    #[test]
    fn builder_requires_client_id() {
        let err = ConfigBuilder::new().build().unwrap_err();
        assert!(err.to_string().contains("client_id"));
    }

    #[test]
    fn builder_requires_secret_for_basic_auth() {
        let err = ConfigBuilder::new().client_id("rp").build().unwrap_err();
        assert!(err.to_string().contains("client_secret"));

        let config = ConfigBuilder::new()
            .client_id("rp")
            .token_endpoint_auth_method(TokenEndpointAuthMethod::None)
            .build()
            .unwrap();
        assert_eq!(config.client.id_token_signed_response_alg, SigningAlgorithm::Signed(Algorithm::RS256));
        assert_eq!(config.validation.jwks_stale_after, Duration::from_secs(60));
    }

    #[test]
    fn builder_rejects_relative_redirect_uri() {
        assert!(ConfigBuilder::new().redirect_uri("/cb").is_err());
    }

    #[test]
    fn client_config_deserializes_registration_response() {
        let client: ClientConfig = serde_json::from_value(serde_json::json!({
            "client_id": "abc",
            "client_secret": "s3cret",
            "redirect_uris": ["https://rp.example/cb"],
            "token_endpoint_auth_method": "private_key_jwt",
            "id_token_signed_response_alg": "none",
            "userinfo_signed_response_alg": "HS256",
            "client_secret_expires_at": 0
        }))
        .unwrap();
        assert_eq!(client.token_endpoint_auth_method, TokenEndpointAuthMethod::PrivateKeyJwt);
        assert_eq!(client.id_token_signed_response_alg, SigningAlgorithm::None);
        assert_eq!(client.userinfo_signed_response_alg, Some(SigningAlgorithm::Signed(Algorithm::HS256)));
        assert_eq!(client.response_types, vec!["code".to_string()]);
        assert!(client.other.contains_key("client_secret_expires_at"));
    }
}
