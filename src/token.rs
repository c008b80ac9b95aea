// src/token.rs

use crate::config::{ClientConfig, TokenEndpointAuthMethod};
use crate::error::NilaRpError;
use crate::http::read_json;
use crate::jose::{self, SigningAlgorithm};
use crate::keys::ClientKeys;
use crate::validator::{unix_now, IdTokenClaims, ValidatedIdToken};
use base64::engine::{general_purpose::STANDARD, Engine};
use jsonwebtoken::{Algorithm, EncodingKey};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, instrument};
use url::form_urlencoded::byte_serialize;
use url::Url;
use uuid::Uuid;

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
const CLIENT_ASSERTION_TTL_SECS: i64 = 60;

/// The raw token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub session_state: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Tokens obtained by a completed flow. Only produced once every ID Token in it validated.
#[derive(Debug, Clone, Default)]
pub struct TokenSet {
    pub access_token: Option<String>,
    pub token_type: Option<String>,
    pub id_token: Option<ValidatedIdToken>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
    pub scope: Option<String>,
    pub session_state: Option<String>,
}

impl TokenSet {
    pub(crate) fn from_response(response: TokenResponse, id_token: Option<ValidatedIdToken>) -> Self {
        Self {
            access_token: response.access_token,
            token_type: response.token_type,
            id_token,
            refresh_token: response.refresh_token,
            expires_at: response.expires_in.map(expiry_from_now),
            scope: response.scope,
            session_state: response.session_state,
        }
    }

    /// Seconds until the access token expires (negative once it has).
    pub fn expires_in(&self) -> Option<i64> {
        self.expires_at.map(|at| at.saturating_sub(unix_now()))
    }

    pub fn is_expired(&self) -> bool {
        self.expires_in().is_some_and(|secs| secs <= 0)
    }

    pub fn claims(&self) -> Option<&IdTokenClaims> {
        self.id_token.as_ref().map(ValidatedIdToken::claims)
    }
}

/// Absolute expiry for a relative `expires_in`, clamped instead of overflowing.
pub(crate) fn expiry_from_now(expires_in: i64) -> i64 {
    unix_now().saturating_add(expires_in)
}

/// Performs a token endpoint grant, authenticating the client with its registered method.
#[instrument(skip(http, client, keys, params), fields(client_id = %client.client_id), err)]
pub(crate) async fn request_tokens(
    http: &reqwest::Client,
    token_endpoint: &Url,
    client: &ClientConfig,
    keys: Option<&ClientKeys>,
    mut params: Vec<(String, String)>,
) -> Result<TokenResponse, NilaRpError> {
    let mut request = http.post(token_endpoint.clone());
    let method = client.token_endpoint_auth_method;
    debug!(?method, "Authenticating at the token endpoint");

    match method {
        TokenEndpointAuthMethod::ClientSecretBasic => {
            let secret = client.secret_for("client_secret_basic")?;
            request = request.header(reqwest::header::AUTHORIZATION, basic_auth(&client.client_id, secret));
        }
        TokenEndpointAuthMethod::ClientSecretPost => {
            params.push(("client_id".to_string(), client.client_id.clone()));
            params.push(("client_secret".to_string(), client.secret_for("client_secret_post")?.to_string()));
        }
        TokenEndpointAuthMethod::ClientSecretJwt | TokenEndpointAuthMethod::PrivateKeyJwt => {
            let assertion = client_assertion(client, keys, token_endpoint.as_str())?;
            params.push(("client_id".to_string(), client.client_id.clone()));
            params.push(("client_assertion_type".to_string(), CLIENT_ASSERTION_TYPE.to_string()));
            params.push(("client_assertion".to_string(), assertion));
        }
        TokenEndpointAuthMethod::None => {
            params.push(("client_id".to_string(), client.client_id.clone()));
        }
    }

    let response = request
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&params)
        .send()
        .await?;
    read_json(response).await
}

/// `Basic` credentials with both halves form-urlencoded first, as RFC 6749 section 2.3.1 requires.
fn basic_auth(client_id: &str, secret: &str) -> String {
    let id: String = byte_serialize(client_id.as_bytes()).collect();
    let secret: String = byte_serialize(secret.as_bytes()).collect();
    format!("Basic {}", STANDARD.encode(format!("{id}:{secret}")))
}

/// Builds the `client_assertion` JWT for `client_secret_jwt` / `private_key_jwt`.
pub(crate) fn client_assertion(
    client: &ClientConfig,
    keys: Option<&ClientKeys>,
    audience: &str,
) -> Result<String, NilaRpError> {
    let iat = unix_now();
    let claims = json!({
        "iss": client.client_id,
        "sub": client.client_id,
        "aud": audience,
        "jti": Uuid::new_v4().to_string(),
        "iat": iat,
        "exp": iat + CLIENT_ASSERTION_TTL_SECS,
    });

    match client.token_endpoint_auth_method {
        TokenEndpointAuthMethod::ClientSecretJwt => {
            let alg = signing_alg(client, Algorithm::HS256)?;
            let key = EncodingKey::from_secret(client.secret_for("client_secret_jwt")?.as_bytes());
            jose::sign(&claims, alg, &key, None, None)
        }
        TokenEndpointAuthMethod::PrivateKeyJwt => {
            let keys = keys.ok_or_else(|| {
                NilaRpError::Configuration("client keys are required for private_key_jwt".to_string())
            })?;
            let alg = signing_alg(client, keys.default_algorithm())?;
            jose::sign(&claims, alg, keys.encoding_key(alg)?, Some(keys.kid()), None)
        }
        other => Err(NilaRpError::Configuration(format!(
            "{other:?} does not use a client assertion"
        ))),
    }
}

fn signing_alg(client: &ClientConfig, default: Algorithm) -> Result<Algorithm, NilaRpError> {
    match client.token_endpoint_auth_signing_alg {
        None => Ok(default),
        Some(SigningAlgorithm::Signed(alg)) => Ok(alg),
        Some(SigningAlgorithm::None) => Err(NilaRpError::Configuration(
            "client assertions cannot be unsigned".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(method: TokenEndpointAuthMethod) -> ClientConfig {
        let mut client = ClientConfig::new("client:1");
        client.client_secret = Some("p@ss word".to_string());
        client.token_endpoint_auth_method = method;
        client
    }

    #[test]
    fn basic_credentials_are_form_encoded() {
        let expected = format!("Basic {}", STANDARD.encode("client%3A1:p%40ss+word"));
        assert_eq!(basic_auth("client:1", "p@ss word"), expected);
    }

    #[test]
    fn client_secret_jwt_assertion_claims() {
        let assertion = client_assertion(
            &client(TokenEndpointAuthMethod::ClientSecretJwt),
            None,
            "https://op.example.com/token",
        )
        .unwrap();
        assert_eq!(jose::decode_header(&assertion).unwrap().alg, "HS256");
        let claims = jose::insecure_payload(&assertion).unwrap();
        assert_eq!(claims["iss"], "client:1");
        assert_eq!(claims["sub"], "client:1");
        assert_eq!(claims["aud"], "https://op.example.com/token");
        assert_eq!(
            claims["exp"].as_i64().unwrap() - claims["iat"].as_i64().unwrap(),
            CLIENT_ASSERTION_TTL_SECS
        );
    }

    #[test]
    fn private_key_jwt_needs_keys() {
        let client = client(TokenEndpointAuthMethod::PrivateKeyJwt);
        assert!(client_assertion(&client, None, "aud").is_err());

        let keys = ClientKeys::from_rsa_pem(include_str!("../tests/fixtures/rsa_primary.pem")).unwrap();
        let assertion = client_assertion(&client, Some(&keys), "aud").unwrap();
        let header = jose::decode_header(&assertion).unwrap();
        assert_eq!(header.alg, "RS256");
        assert_eq!(header.kid.as_deref(), Some(keys.kid()));
    }

    #[test]
    fn private_key_jwt_signs_es256_with_ec_keys() {
        let client = client(TokenEndpointAuthMethod::PrivateKeyJwt);
        let keys = ClientKeys::from_ec_pem(include_str!("../tests/fixtures/ec_p256.pem")).unwrap();
        let assertion = client_assertion(&client, Some(&keys), "https://op.example.com/token").unwrap();

        let header = jose::decode_header(&assertion).unwrap();
        assert_eq!(header.alg, "ES256");
        assert_eq!(header.kid.as_deref(), Some(keys.kid()));

        let jwk = keys.public_jwk();
        let decoding_key = jsonwebtoken::DecodingKey::from_ec_components(
            jwk.x.as_deref().unwrap(),
            jwk.y.as_deref().unwrap(),
        )
        .unwrap();
        let (message, signature) = assertion.rsplit_once('.').unwrap();
        assert!(jsonwebtoken::crypto::verify(signature, message.as_bytes(), &decoding_key, Algorithm::ES256).unwrap());

        let mut rsa_client = client.clone();
        rsa_client.token_endpoint_auth_signing_alg = Some(SigningAlgorithm::Signed(Algorithm::RS256));
        assert!(client_assertion(&rsa_client, Some(&keys), "aud").is_err());
    }

    #[test]
    fn huge_expires_in_saturates() {
        let response = |expires_in: i64| TokenResponse {
            access_token: Some("at".to_string()),
            token_type: None,
            id_token: None,
            refresh_token: None,
            expires_in: Some(expires_in),
            scope: None,
            session_state: None,
            extra: HashMap::new(),
        };

        let far = TokenSet::from_response(response(i64::MAX), None);
        assert_eq!(far.expires_at, Some(i64::MAX));
        assert!(!far.is_expired());

        let past = TokenSet::from_response(response(i64::MIN), None);
        assert!(past.is_expired());
        assert!(past.expires_in().is_some_and(|secs| secs < 0));
    }

    #[tokio::test]
    async fn client_secret_post_sends_credentials_in_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("client_secret=p%40ss+word"))
            .and(body_string_contains("grant_type=authorization_code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let endpoint = Url::parse(&format!("{}/token", server.uri())).unwrap();
        let response = request_tokens(
            &reqwest::Client::new(),
            &endpoint,
            &client(TokenEndpointAuthMethod::ClientSecretPost),
            None,
            vec![("grant_type".to_string(), "authorization_code".to_string())],
        )
        .await
        .unwrap();
        let tokens = TokenSet::from_response(response, None);
        assert_eq!(tokens.access_token.as_deref(), Some("at"));
        assert!(!tokens.is_expired());
    }

    #[tokio::test]
    async fn oauth_error_body_becomes_token_endpoint_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(header("authorization", basic_auth("client:1", "p@ss word").as_str()))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "code already used"
            })))
            .mount(&server)
            .await;

        let endpoint = Url::parse(&format!("{}/token", server.uri())).unwrap();
        let err = request_tokens(
            &reqwest::Client::new(),
            &endpoint,
            &client(TokenEndpointAuthMethod::ClientSecretBasic),
            None,
            vec![("grant_type".to_string(), "authorization_code".to_string())],
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "invalid_grant (code already used)");
    }
}
