// src/request.rs

use crate::config::ClientConfig;
use crate::error::NilaRpError;
use crate::jose::{self, SigningAlgorithm};
use crate::keys::ClientKeys;
use crate::validator::unix_now;
use jsonwebtoken::EncodingKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;
use uuid::Uuid;

/// Lifetime of a request object.
const REQUEST_OBJECT_TTL_SECS: i64 = 300;

/// Whether `response_type` returns tokens from the authorization endpoint
/// (implicit and hybrid flows), which makes the `nonce` mandatory.
pub fn requires_nonce(response_type: &str) -> bool {
    response_type
        .split_whitespace()
        .any(|t| t == "id_token" || t == "token")
}

/// What the callback needs to know about the request it answers.
///
/// Created by [`AuthorizationRequest::build`] and consumed by the matching callback;
/// it is deliberately not `Clone`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthorizationRequestState {
    pub response_type: String,
    pub redirect_uri: String,
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mode: Option<String>,
}

/// A builder for the authorization request sent through the user agent.
///
/// A random `state` is generated up front so the URL and any request object
/// built from the same builder agree on it.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    response_type: String,
    scope: String,
    state: Option<String>,
    nonce: Option<String>,
    redirect_uri: Option<String>,
    response_mode: Option<String>,
    prompt: Option<String>,
    max_age: Option<u64>,
    login_hint: Option<String>,
    ui_locales: Option<String>,
    acr_values: Option<String>,
    claims: Option<Value>,
    request: Option<String>,
    request_uri: Option<String>,
    extra: Vec<(String, String)>,
}

impl Default for AuthorizationRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthorizationRequest {
    /// A `code` flow request for the `openid` scope.
    pub fn new() -> Self {
        Self {
            response_type: "code".to_string(),
            scope: "openid".to_string(),
            state: Some(Uuid::new_v4().simple().to_string()),
            nonce: None,
            redirect_uri: None,
            response_mode: None,
            prompt: None,
            max_age: None,
            login_hint: None,
            ui_locales: None,
            acr_values: None,
            claims: None,
            request: None,
            request_uri: None,
            extra: Vec::new(),
        }
    }

    pub fn response_type(mut self, response_type: impl Into<String>) -> Self {
        self.response_type = response_type.into();
        self
    }

    /// Sets the scope. `openid` is prepended when missing.
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Sends no `state` at all.
    pub fn without_state(mut self) -> Self {
        self.state = None;
        self
    }

    pub fn nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    /// Generates a random nonce.
    pub fn random_nonce(self) -> Self {
        self.nonce(Uuid::new_v4().simple().to_string())
    }

    pub fn redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(redirect_uri.into());
        self
    }

    /// e.g. `form_post` or `fragment`.
    pub fn response_mode(mut self, response_mode: impl Into<String>) -> Self {
        self.response_mode = Some(response_mode.into());
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn max_age(mut self, max_age: u64) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn login_hint(mut self, login_hint: impl Into<String>) -> Self {
        self.login_hint = Some(login_hint.into());
        self
    }

    pub fn ui_locales(mut self, ui_locales: impl Into<String>) -> Self {
        self.ui_locales = Some(ui_locales.into());
        self
    }

    pub fn acr_values(mut self, acr_values: impl Into<String>) -> Self {
        self.acr_values = Some(acr_values.into());
        self
    }

    /// The `claims` request parameter, sent as JSON exactly as given.
    pub fn claims(mut self, claims: Value) -> Self {
        self.claims = Some(claims);
        self
    }

    /// Passes a request object by value.
    pub fn request(mut self, request: impl Into<String>) -> Self {
        self.request = Some(request.into());
        self
    }

    /// Passes a request object by reference.
    pub fn request_uri(mut self, request_uri: impl Into<String>) -> Self {
        self.request_uri = Some(request_uri.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((name.into(), value.into()));
        self
    }

    /// Builds the authorization URL and the state the callback will need.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error, before any network I/O, when an implicit or
    /// hybrid `response_type` is requested without a nonce, or when no `redirect_uri`
    /// was given and the client does not have exactly one registered.
    pub fn build(
        &self,
        authorization_endpoint: &Url,
        client: &ClientConfig,
    ) -> Result<(Url, AuthorizationRequestState), NilaRpError> {
        let (params, state) = self.resolve(client)?;

        let mut url = authorization_endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            for (name, value) in &params {
                match value {
                    Value::String(s) => query.append_pair(name, s),
                    other => query.append_pair(name, &other.to_string()),
                };
            }
            if let Some(request) = &self.request {
                query.append_pair("request", request);
            }
            if let Some(request_uri) = &self.request_uri {
                query.append_pair("request_uri", request_uri);
            }
        }
        debug!(response_type = %state.response_type, "Built authorization request");
        Ok((url, state))
    }

    /// The claims of a request object carrying this request: every authorization
    /// parameter plus `iss`, `aud`, `client_id`, `jti`, `iat` and `exp`.
    pub fn request_object_claims(&self, client: &ClientConfig, issuer: &str) -> Result<Map<String, Value>, NilaRpError> {
        let (params, _) = self.resolve(client)?;
        let mut claims: Map<String, Value> = params.into_iter().collect();
        let iat = unix_now();
        claims.insert("iss".to_string(), Value::from(client.client_id.clone()));
        claims.insert("aud".to_string(), Value::from(issuer));
        claims.insert("jti".to_string(), Value::from(Uuid::new_v4().to_string()));
        claims.insert("iat".to_string(), Value::from(iat));
        claims.insert("exp".to_string(), Value::from(iat + REQUEST_OBJECT_TTL_SECS));
        Ok(claims)
    }

    fn resolve(&self, client: &ClientConfig) -> Result<(Vec<(String, Value)>, AuthorizationRequestState), NilaRpError> {
        if requires_nonce(&self.response_type) && self.nonce.is_none() {
            return Err(NilaRpError::Configuration(
                "nonce MUST be provided for implicit and hybrid flows".to_string(),
            ));
        }

        let redirect_uri = match (&self.redirect_uri, client.redirect_uris.as_slice()) {
            (Some(uri), _) => uri.clone(),
            (None, [only]) => only.clone(),
            (None, _) => {
                return Err(NilaRpError::Configuration(
                    "redirect_uri must be provided when the client does not have exactly one registered"
                        .to_string(),
                ))
            }
        };

        if !client.response_types.iter().any(|t| t == &self.response_type) {
            debug!(response_type = %self.response_type, "response_type is not among the registered ones");
        }

        let scope = if self.scope.split_whitespace().any(|s| s == "openid") {
            self.scope.clone()
        } else {
            format!("openid {}", self.scope).trim_end().to_string()
        };

        let mut params: Vec<(String, Value)> = vec![
            ("client_id".to_string(), Value::from(client.client_id.clone())),
            ("response_type".to_string(), Value::from(self.response_type.clone())),
            ("scope".to_string(), Value::from(scope.clone())),
            ("redirect_uri".to_string(), Value::from(redirect_uri.clone())),
        ];
        let optional = [
            ("state", &self.state),
            ("nonce", &self.nonce),
            ("response_mode", &self.response_mode),
            ("prompt", &self.prompt),
            ("login_hint", &self.login_hint),
            ("ui_locales", &self.ui_locales),
            ("acr_values", &self.acr_values),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                params.push((name.to_string(), Value::from(value.clone())));
            }
        }
        if let Some(max_age) = self.max_age {
            params.push(("max_age".to_string(), Value::from(max_age)));
        }
        if let Some(claims) = &self.claims {
            params.push(("claims".to_string(), claims.clone()));
        }
        for (name, value) in &self.extra {
            params.push((name.clone(), Value::from(value.clone())));
        }

        let state = AuthorizationRequestState {
            response_type: self.response_type.clone(),
            redirect_uri,
            scope,
            state: self.state.clone(),
            nonce: self.nonce.clone(),
            max_age: self.max_age,
            response_mode: self.response_mode.clone(),
        };
        Ok((params, state))
    }
}

/// Signs request object claims with the client's `request_object_signing_alg`
/// (`none` when unset). HMAC uses the client secret; asymmetric algorithms need `keys`.
pub fn sign_request_object(
    claims: &Map<String, Value>,
    client: &ClientConfig,
    keys: Option<&ClientKeys>,
) -> Result<String, NilaRpError> {
    let payload = Value::Object(claims.clone());
    let alg = client.request_object_signing_alg.unwrap_or(SigningAlgorithm::None);
    let Some(algorithm) = alg.algorithm() else {
        return jose::encode_unsigned(&payload);
    };

    if alg.is_symmetric() {
        let key = EncodingKey::from_secret(client.secret_for("HMAC signed request objects")?.as_bytes());
        return jose::sign(&payload, algorithm, &key, None, Some("oauth-authz-req+jwt"));
    }

    let keys = keys.ok_or_else(|| {
        NilaRpError::Configuration(format!("client keys are required to sign request objects with {alg}"))
    })?;
    jose::sign(
        &payload,
        algorithm,
        keys.encoding_key(algorithm)?,
        Some(keys.kid()),
        Some("oauth-authz-req+jwt"),
    )
}
