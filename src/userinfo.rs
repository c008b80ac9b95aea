// src/userinfo.rs

use crate::error::{NilaRpError, TokenValidationError, UserInfoError};
use crate::http::bearer_error;
use crate::issuer::Issuer;
use crate::jose::{self, SigningAlgorithm};
use crate::token::TokenSet;
use crate::validator::Validator;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, instrument, warn};

/// UserInfo claims as returned by the OP.
pub type UserInfo = Map<String, Value>;

/// Where the access token travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserInfoVia {
    /// `Authorization: Bearer ...`
    #[default]
    Header,
    /// `access_token` form parameter; needs `POST`.
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpVerb {
    #[default]
    Get,
    Post,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UserInfoOptions {
    pub via: UserInfoVia,
    pub verb: HttpVerb,
}

/// Calls the UserInfo endpoint and checks the response against the token set.
#[instrument(skip_all, fields(issuer = %issuer.issuer()), err)]
pub(crate) async fn fetch_userinfo(
    issuer: &Issuer,
    validator: &Validator,
    tokens: &TokenSet,
    options: UserInfoOptions,
) -> Result<UserInfo, NilaRpError> {
    let access_token = tokens
        .access_token
        .as_deref()
        .ok_or(UserInfoError::MissingAccessToken)?;
    let endpoint = issuer.userinfo_endpoint()?;
    let client = validator.client();
    let expects_jwt = client.userinfo_signed_response_alg.is_some() || client.userinfo_encrypted_response_alg.is_some();

    let http = issuer.http_client();
    let mut request = match (options.via, options.verb) {
        (UserInfoVia::Body, HttpVerb::Get) => {
            return Err(NilaRpError::Configuration(
                "access_token can only be sent in the body of a POST request".to_string(),
            ))
        }
        (UserInfoVia::Body, HttpVerb::Post) => http.post(endpoint).form(&[("access_token", access_token)]),
        (UserInfoVia::Header, HttpVerb::Post) => http.post(endpoint).bearer_auth(access_token),
        (UserInfoVia::Header, HttpVerb::Get) => http.get(endpoint).bearer_auth(access_token),
    };
    request = request.header(
        reqwest::header::ACCEPT,
        if expects_jwt { "application/jwt" } else { "application/json" },
    );

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let error = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_error);
        return Err(UserInfoError::Fetch {
            status: status.as_u16(),
            error,
        }
        .into());
    }

    let is_jwt = is_jwt_content(&response);
    let body = response.text().await?;
    let userinfo = if is_jwt {
        let payload = validator
            .open_jwt(
                body.trim(),
                client.userinfo_signed_response_alg,
                client.userinfo_encrypted_response_alg.as_deref(),
                client.userinfo_encrypted_response_enc.as_deref(),
                "UserInfo response",
            )
            .await?;
        if client.userinfo_signed_response_alg.is_some() {
            validator.check_issued_for_client(&payload)?;
        }
        payload
    } else {
        if expects_jwt {
            return Err(NilaRpError::InvalidResponse(
                "expected an application/jwt UserInfo response".to_string(),
            ));
        }
        match serde_json::from_str(&body)? {
            Value::Object(map) => map,
            _ => {
                return Err(NilaRpError::InvalidResponse(
                    "UserInfo response is not a JSON object".to_string(),
                ))
            }
        }
    };

    let sub = userinfo
        .get("sub")
        .and_then(Value::as_str)
        .ok_or_else(|| NilaRpError::InvalidResponse("UserInfo response is missing sub".to_string()))?;
    if let Some(claims) = tokens.claims() {
        if claims.sub != sub {
            return Err(UserInfoError::SubjectMismatch {
                expected: claims.sub.clone(),
                got: sub.to_string(),
            }
            .into());
        }
    }
    debug!(claims = userinfo.len(), "UserInfo received");
    Ok(userinfo)
}

fn is_jwt_content(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.trim_start().starts_with("application/jwt"))
}

/// Replaces aggregated claim references with the claims their inline JWTs carry.
///
/// JWTs issued by our own OP are verified against its keys; others are accepted
/// unverified since their issuer's keys are unknown here.
#[instrument(skip_all, err)]
pub(crate) async fn unpack_aggregated_claims(validator: &Validator, claims: &mut UserInfo) -> Result<(), NilaRpError> {
    for (source, definition) in claim_sources(claims) {
        let Some(jwt) = definition.get("JWT").and_then(Value::as_str) else {
            continue;
        };
        let payload = decode_claims_jwt(validator, jwt, &source).await?;
        merge_source(claims, &source, &payload);
    }
    Ok(())
}

/// Fetches distributed claims from their endpoints and merges them in.
///
/// `access_tokens` overrides the per-source `access_token` the OP provided.
#[instrument(skip_all, err)]
pub(crate) async fn fetch_distributed_claims(
    http: &reqwest::Client,
    validator: &Validator,
    claims: &mut UserInfo,
    access_tokens: &HashMap<String, String>,
) -> Result<(), NilaRpError> {
    for (source, definition) in claim_sources(claims) {
        let Some(endpoint) = definition.get("endpoint").and_then(Value::as_str) else {
            continue;
        };
        let token = access_tokens
            .get(&source)
            .map(String::as_str)
            .or_else(|| definition.get("access_token").and_then(Value::as_str));

        let mut request = http
            .get(endpoint)
            .header(reqwest::header::ACCEPT, "application/jwt, application/json");
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UserInfoError::Fetch {
                status: status.as_u16(),
                error: response
                    .headers()
                    .get(reqwest::header::WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(bearer_error),
            }
            .into());
        }

        let is_jwt = is_jwt_content(&response);
        let body = response.text().await?;
        let payload = if is_jwt {
            decode_claims_jwt(validator, body.trim(), &source).await?
        } else {
            match serde_json::from_str(&body)? {
                Value::Object(map) => map,
                _ => {
                    return Err(NilaRpError::InvalidResponse(format!(
                        "distributed claims from {source} are not a JSON object"
                    )))
                }
            }
        };
        debug!(%source, "Fetched distributed claims");
        merge_source(claims, &source, &payload);
    }
    Ok(())
}

fn claim_sources(claims: &UserInfo) -> Vec<(String, Map<String, Value>)> {
    claims
        .get("_claim_sources")
        .and_then(Value::as_object)
        .map(|sources| {
            sources
                .iter()
                .filter_map(|(name, def)| def.as_object().map(|def| (name.clone(), def.clone())))
                .collect()
        })
        .unwrap_or_default()
}

async fn decode_claims_jwt(validator: &Validator, jwt: &str, source: &str) -> Result<Map<String, Value>, NilaRpError> {
    let unverified = jose::insecure_payload(jwt)?;
    if unverified.get("iss").and_then(Value::as_str) != Some(validator.issuer()) {
        warn!(%source, "Claims JWT from a foreign issuer accepted without signature verification");
        return Ok(unverified);
    }

    // Our own OP signs claims with its published keys, never with the client secret.
    let header = jose::decode_header(jwt)?;
    let alg = header
        .alg
        .parse::<SigningAlgorithm>()
        .map_err(|_| TokenValidationError::InvalidSignature)?;
    if alg == SigningAlgorithm::None || alg.is_symmetric() {
        return Err(TokenValidationError::InvalidSignature.into());
    }
    validator.open_jwt(jwt, Some(alg), None, None, "claims JWT").await
}

/// Copies the claims `source` provides and drops the references to it.
fn merge_source(claims: &mut UserInfo, source: &str, payload: &Map<String, Value>) {
    let names: Vec<String> = claims
        .get("_claim_names")
        .and_then(Value::as_object)
        .map(|names| {
            names
                .iter()
                .filter(|(_, s)| s.as_str() == Some(source))
                .map(|(name, _)| name.clone())
                .collect()
        })
        .unwrap_or_default();

    for name in &names {
        match payload.get(name) {
            Some(value) => {
                claims.insert(name.clone(), value.clone());
            }
            None => warn!(%source, claim = %name, "Claim source does not provide the referenced claim"),
        }
    }

    for (key, entry) in [("_claim_names", None), ("_claim_sources", Some(source))] {
        let Some(map) = claims.get_mut(key).and_then(Value::as_object_mut) else {
            continue;
        };
        match entry {
            Some(source) => {
                map.remove(source);
            }
            None => names.iter().for_each(|name| {
                map.remove(name);
            }),
        }
        if map.is_empty() {
            claims.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, ValidationDetails};
    use crate::error::ErrorKind;
    use crate::model::IssuerMetadata;
    use crate::validator::{IdTokenChecks, TokenSource};
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &str = "a-shared-secret-long-enough-for-hs256";

    fn issuer(server: &MockServer) -> Issuer {
        let metadata: IssuerMetadata = serde_json::from_value(json!({
            "issuer": server.uri(),
            "userinfo_endpoint": format!("{}/userinfo", server.uri()),
        }))
        .unwrap();
        Issuer::from_metadata(metadata, &ValidationDetails::default()).unwrap()
    }

    fn validator(issuer: &Issuer, signed: Option<SigningAlgorithm>) -> Validator {
        let mut client = ClientConfig::new("client-1");
        client.client_secret = Some(SECRET.to_string());
        client.id_token_signed_response_alg = SigningAlgorithm::Signed(Algorithm::HS256);
        client.userinfo_signed_response_alg = signed;
        Validator::new(issuer.issuer(), Arc::new(client), ValidationDetails::default(), None)
    }

    async fn tokens(validator: &Validator, sub: &str) -> TokenSet {
        let now = crate::validator::unix_now();
        let id_token = encode(
            &Header::new(Algorithm::HS256),
            &json!({ "iss": validator.issuer(), "sub": sub, "aud": "client-1", "exp": now + 60, "iat": now }),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        let validated = validator
            .validate_id_token(&id_token, &IdTokenChecks::new(TokenSource::TokenEndpoint))
            .await
            .unwrap();
        TokenSet {
            access_token: Some("at-123".to_string()),
            id_token: Some(validated),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn bearer_header_userinfo_is_bound_to_id_token_subject() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .and(header("authorization", "Bearer at-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sub": "alice", "email": "alice@example.com" })))
            .mount(&server)
            .await;

        let issuer = issuer(&server);
        let validator = validator(&issuer, None);
        let userinfo = fetch_userinfo(&issuer, &validator, &tokens(&validator, "alice").await, UserInfoOptions::default())
            .await
            .unwrap();
        assert_eq!(userinfo["email"], "alice@example.com");

        let err = fetch_userinfo(&issuer, &validator, &tokens(&validator, "bob").await, UserInfoOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserInfoSubjectMismatch);
        assert!(err.to_string().starts_with("userinfo sub mismatch"));
    }

    #[tokio::test]
    async fn body_delivery_requires_post() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/userinfo"))
            .and(body_string_contains("access_token=at-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sub": "alice" })))
            .expect(1)
            .mount(&server)
            .await;

        let issuer = issuer(&server);
        let validator = validator(&issuer, None);
        let tokens = tokens(&validator, "alice").await;
        let body_get = UserInfoOptions {
            via: UserInfoVia::Body,
            verb: HttpVerb::Get,
        };
        let err = fetch_userinfo(&issuer, &validator, &tokens, body_get).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let body_post = UserInfoOptions {
            via: UserInfoVia::Body,
            verb: HttpVerb::Post,
        };
        assert!(fetch_userinfo(&issuer, &validator, &tokens, body_post).await.is_ok());
    }

    #[tokio::test]
    async fn bearer_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(
                ResponseTemplate::new(401).insert_header("www-authenticate", r#"Bearer error="invalid_token""#),
            )
            .mount(&server)
            .await;

        let issuer = issuer(&server);
        let validator = validator(&issuer, None);
        let err = fetch_userinfo(&issuer, &validator, &tokens(&validator, "alice").await, UserInfoOptions::default())
            .await
            .unwrap_err();
        match err {
            NilaRpError::UserInfo(UserInfoError::Fetch { status, error }) => {
                assert_eq!(status, 401);
                assert_eq!(error.as_deref(), Some("invalid_token"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn signed_userinfo_is_verified() {
        let server = MockServer::start().await;
        let jwt = encode(
            &Header::new(Algorithm::HS256),
            &json!({ "sub": "alice", "iss": server.uri(), "aud": "client-1", "name": "Alice" }),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(jwt, "application/jwt"))
            .mount(&server)
            .await;

        let issuer = issuer(&server);
        let validator = validator(&issuer, Some(SigningAlgorithm::Signed(Algorithm::HS256)));
        let userinfo = fetch_userinfo(&issuer, &validator, &tokens(&validator, "alice").await, UserInfoOptions::default())
            .await
            .unwrap();
        assert_eq!(userinfo["name"], "Alice");
    }

    #[tokio::test]
    async fn aggregated_and_distributed_claims_are_merged() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/claims"))
            .and(header("authorization", "Bearer ksj3n283dke"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "age": 42 })))
            .expect(1)
            .mount(&server)
            .await;

        let issuer = issuer(&server);
        let validator = validator(&issuer, None);
        let aggregated = jose::encode_unsigned(&json!({
            "iss": "https://claims.example.org",
            "shoe_size": 8,
            "eye_color": "blue"
        }))
        .unwrap();
        let mut claims: UserInfo = serde_json::from_value(json!({
            "sub": "alice",
            "_claim_names": { "shoe_size": "src1", "eye_color": "src1", "age": "src2" },
            "_claim_sources": {
                "src1": { "JWT": aggregated },
                "src2": { "endpoint": format!("{}/claims", server.uri()), "access_token": "ksj3n283dke" }
            }
        }))
        .unwrap();

        unpack_aggregated_claims(&validator, &mut claims).await.unwrap();
        assert_eq!(claims["shoe_size"], 8);
        assert_eq!(claims["eye_color"], "blue");
        assert_eq!(claims["_claim_names"], json!({ "age": "src2" }));

        fetch_distributed_claims(issuer.http_client(), &validator, &mut claims, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(claims["age"], 42);
        assert!(!claims.contains_key("_claim_names"));
        assert!(!claims.contains_key("_claim_sources"));
    }

    #[tokio::test]
    async fn encrypted_unsigned_userinfo_is_decrypted() {
        let server = MockServer::start().await;
        let unsigned = jose::encode_unsigned(&json!({ "sub": "alice", "iss": server.uri(), "aud": "client-1", "name": "Alice" }))
            .unwrap();
        let jwe = jose::PlainJwe::seal(&unsigned, "RSA-OAEP", "A128CBC-HS256");
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .and(header("accept", "application/jwt"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(jwe, "application/jwt"))
            .mount(&server)
            .await;

        let issuer = issuer(&server);
        let mut client = ClientConfig::new("client-1");
        client.client_secret = Some(SECRET.to_string());
        client.id_token_signed_response_alg = SigningAlgorithm::Signed(Algorithm::HS256);
        client.userinfo_signed_response_alg = Some(SigningAlgorithm::None);
        client.userinfo_encrypted_response_alg = Some("RSA-OAEP".to_string());
        let validator = Validator::new(issuer.issuer(), Arc::new(client), ValidationDetails::default(), None)
            .with_decrypter(Arc::new(jose::PlainJwe));

        let userinfo = fetch_userinfo(&issuer, &validator, &tokens(&validator, "alice").await, UserInfoOptions::default())
            .await
            .unwrap();
        assert_eq!(userinfo["name"], "Alice");
    }
}
