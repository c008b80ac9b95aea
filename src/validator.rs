// src/validator.rs

mod hash;

pub use hash::token_hash;

use crate::config::{ClientConfig, ValidationDetails};
use crate::error::{NilaRpError, TokenValidationError};
use crate::jose::{self, CompactJws, JweDecrypter, SigningAlgorithm};
use crate::jwks::KeyStore;
use jsonwebtoken::DecodingKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

/// Claims every ID Token must carry, checked before anything else.
const REQUIRED_CLAIMS: [&str; 5] = ["iss", "sub", "aud", "exp", "iat"];

/// Where an ID Token came from. Decides which hash bindings are mandatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// Returned in the authorization response (implicit and hybrid flows).
    AuthorizationEndpoint,
    /// Returned by the token endpoint for an authorization code.
    TokenEndpoint,
    /// Returned by the token endpoint for a refresh token.
    Refresh,
}

/// Progress of one ID Token through the validation pipeline.
///
/// A rejection leaves the token at the last stage it completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    SignatureChecked,
    ClaimsChecked,
    BindingChecked,
    Valid,
}

/// The per-flow inputs an ID Token is checked against.
#[derive(Debug, Clone, Copy)]
pub struct IdTokenChecks<'a> {
    pub source: TokenSource,
    pub nonce: Option<&'a str>,
    pub max_age: Option<u64>,
    pub code: Option<&'a str>,
    pub access_token: Option<&'a str>,
}

impl<'a> IdTokenChecks<'a> {
    pub fn new(source: TokenSource) -> Self {
        Self {
            source,
            nonce: None,
            max_age: None,
            code: None,
            access_token: None,
        }
    }

    pub fn nonce(mut self, nonce: Option<&'a str>) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn max_age(mut self, max_age: Option<u64>) -> Self {
        self.max_age = max_age;
        self
    }

    /// The `code` returned next to the ID Token; its `c_hash` is then checked.
    pub fn code(mut self, code: Option<&'a str>) -> Self {
        self.code = code;
        self
    }

    /// The `access_token` returned next to the ID Token; its `at_hash` is then checked.
    pub fn access_token(mut self, access_token: Option<&'a str>) -> Self {
        self.access_token = access_token;
        self
    }
}

/// The `aud` claim, which OPs send either as a string or as an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    pub fn values(&self) -> Vec<&str> {
        match self {
            Audience::Single(aud) => vec![aud.as_str()],
            Audience::Multiple(auds) => auds.iter().map(String::as_str).collect(),
        }
    }

    pub fn contains(&self, value: &str) -> bool {
        self.values().contains(&value)
    }

    pub fn len(&self) -> usize {
        match self {
            Audience::Single(_) => 1,
            Audience::Multiple(auds) => auds.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The claims of a validated ID Token. Anything not modelled here lands in `additional`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: Audience,
    pub exp: i64,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c_hash: Option<String>,
    #[serde(flatten)]
    pub additional: Map<String, Value>,
}

/// An ID Token that passed every check. Only the [`Validator`] creates these.
#[derive(Debug, Clone)]
pub struct ValidatedIdToken {
    claims: IdTokenClaims,
    alg: SigningAlgorithm,
    kid: Option<String>,
    raw: String,
}

impl ValidatedIdToken {
    pub fn claims(&self) -> &IdTokenClaims {
        &self.claims
    }

    pub fn alg(&self) -> SigningAlgorithm {
        self.alg
    }

    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    /// The compact JWS as it was verified (after decryption, if the token was a JWE).
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// Validates ID Tokens (and other JWTs signed by the issuer) for one client.
///
/// This struct should be created once per issuer/client pair and reused; it is
/// cheap to clone and shares the issuer's key cache.
#[derive(Clone)]
pub struct Validator {
    issuer: String,
    client: Arc<ClientConfig>,
    details: ValidationDetails,
    keys: Option<KeyStore>,
    decrypter: Option<Arc<dyn JweDecrypter>>,
}

impl Validator {
    /// Creates a new `Validator`. `keys` may be `None` for issuers without a `jwks_uri`,
    /// in which case only HMAC and unsigned tokens can be validated.
    pub fn new(
        issuer: impl Into<String>,
        client: Arc<ClientConfig>,
        details: ValidationDetails,
        keys: Option<KeyStore>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            client,
            details,
            keys,
            decrypter: None,
        }
    }

    /// Installs the decrypter used for encrypted ID Tokens and UserInfo responses.
    pub fn with_decrypter(mut self, decrypter: Arc<dyn JweDecrypter>) -> Self {
        self.decrypter = Some(decrypter);
        self
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn client(&self) -> &ClientConfig {
        &self.client
    }

    pub fn keys(&self) -> Option<&KeyStore> {
        self.keys.as_ref()
    }

    /// Validates an OIDC ID Token.
    ///
    /// Checks run in a fixed order and stop at the first failure:
    /// 1. Structure and required claims (`iss`, `sub`, `aud`, `exp`, `iat`).
    /// 2. Signature, with the registered `id_token_signed_response_alg` only.
    /// 3. `iss`, `aud` and `azp`.
    /// 4. `exp`, `iat` and `auth_time` against `max_age`.
    /// 5. `nonce`.
    /// 6. `c_hash` / `at_hash` bindings to the values returned alongside the token.
    #[instrument(skip(self, token, checks), fields(source = ?checks.source), err)]
    pub async fn validate_id_token(
        &self,
        token: &str,
        checks: &IdTokenChecks<'_>,
    ) -> Result<ValidatedIdToken, NilaRpError> {
        let mut stage = Stage::Received;
        let result = self.run_pipeline(token, checks, &mut stage).await;
        match &result {
            Ok(_) => debug!(?stage, "ID Token accepted"),
            Err(e) => debug!(?stage, error = %e, "ID Token rejected"),
        }
        result
    }

    async fn run_pipeline(
        &self,
        token: &str,
        checks: &IdTokenChecks<'_>,
        stage: &mut Stage,
    ) -> Result<ValidatedIdToken, NilaRpError> {
        let token = self.decrypt(
            token,
            self.client.id_token_encrypted_response_alg.as_deref(),
            self.client.id_token_encrypted_response_enc.as_deref(),
            "ID Token",
        )?;
        let jws = CompactJws::parse(&token)?;
        for name in REQUIRED_CLAIMS {
            if jws.payload.get(name).map_or(true, Value::is_null) {
                return Err(TokenValidationError::missing(name).into());
            }
        }

        let alg = self.client.id_token_signed_response_alg;
        self.verify_signature(&jws, alg).await?;
        *stage = Stage::SignatureChecked;

        let claims: IdTokenClaims = serde_json::from_value(Value::Object(jws.payload.clone()))
            .map_err(|e| TokenValidationError::Malformed(e.to_string()))?;
        self.check_issuer(&claims.iss)?;
        self.check_audience(&claims)?;
        self.check_freshness(&claims, checks)?;
        check_nonce(&claims, checks)?;
        *stage = Stage::ClaimsChecked;

        check_bindings(&claims, alg, checks)?;
        *stage = Stage::BindingChecked;

        let kid = jws.header.kid.clone();
        *stage = Stage::Valid;
        Ok(ValidatedIdToken {
            claims,
            alg,
            kid,
            raw: token.into_owned(),
        })
    }

    /// Decrypts (when `enc_alg` is registered) and verifies a JWT from the issuer,
    /// returning its payload. No claim checks are applied.
    ///
    /// An encrypted response without a registered signing algorithm may carry plain JSON.
    pub(crate) async fn open_jwt(
        &self,
        token: &str,
        alg: Option<SigningAlgorithm>,
        enc_alg: Option<&str>,
        enc: Option<&str>,
        what: &str,
    ) -> Result<Map<String, Value>, NilaRpError> {
        let token = self.decrypt(token, enc_alg, enc, what)?;
        if enc_alg.is_some() && alg.is_none() && token.trim_start().starts_with('{') {
            return match serde_json::from_str(&token)? {
                Value::Object(map) => Ok(map),
                _ => Err(TokenValidationError::Malformed(format!("{what} is not a JSON object")).into()),
            };
        }
        let alg = alg.ok_or_else(|| {
            NilaRpError::Configuration(format!("no signing algorithm is registered for the {what}"))
        })?;
        let jws = CompactJws::parse(&token)?;
        self.verify_signature(&jws, alg).await?;
        Ok(jws.payload)
    }

    /// Checks `iss` and `aud` of a signed response, each only when present.
    pub(crate) fn check_issued_for_client(&self, payload: &Map<String, Value>) -> Result<(), TokenValidationError> {
        if let Some(iss) = payload.get("iss").and_then(Value::as_str) {
            self.check_issuer(iss)?;
        }
        if let Some(aud) = payload.get("aud") {
            let aud: Audience = serde_json::from_value(aud.clone())
                .map_err(|e| TokenValidationError::Malformed(e.to_string()))?;
            if !aud.contains(&self.client.client_id) {
                return Err(audience_mismatch(&self.client.client_id, &aud));
            }
        }
        Ok(())
    }

    fn decrypt<'t>(
        &self,
        token: &'t str,
        enc_alg: Option<&str>,
        enc: Option<&str>,
        what: &str,
    ) -> Result<Cow<'t, str>, NilaRpError> {
        let Some(enc_alg) = enc_alg else {
            return Ok(Cow::Borrowed(token));
        };
        if jose::segment_count(token) != 5 {
            return Err(TokenValidationError::Malformed(format!("encrypted {what} expected")).into());
        }
        let header = jose::decode_header(token)?;
        if header.alg != enc_alg || enc.is_some_and(|enc| header.enc.as_deref() != Some(enc)) {
            return Err(TokenValidationError::Malformed(format!(
                "unexpected JWE alg/enc {}/{} for {what}",
                header.alg,
                header.enc.as_deref().unwrap_or("<none>")
            ))
            .into());
        }
        let decrypter = self.decrypter.as_ref().ok_or_else(|| {
            NilaRpError::Configuration(format!("a JWE decrypter is required to decrypt the {what}"))
        })?;
        Ok(Cow::Owned(decrypter.decrypt(token, &header)?))
    }

    /// Verifies the JWS signature with the registered algorithm.
    ///
    /// A header `alg` other than `alg` is rejected outright, so a token signed with a
    /// different algorithm (or key type) never reaches key resolution.
    async fn verify_signature(&self, jws: &CompactJws<'_>, alg: SigningAlgorithm) -> Result<(), NilaRpError> {
        if jws.header.alg != alg.to_string() {
            debug!(header_alg = %jws.header.alg, expected = %alg, "JWS alg is not the registered one");
            return Err(TokenValidationError::InvalidSignature.into());
        }
        let Some(algorithm) = alg.algorithm() else {
            // Unsigned JWTs must come with an empty signature segment.
            return if jws.signature.is_empty() {
                Ok(())
            } else {
                Err(TokenValidationError::InvalidSignature.into())
            };
        };

        let key = if alg.is_symmetric() {
            DecodingKey::from_secret(self.client.secret_for("HMAC signature verification")?.as_bytes())
        } else {
            let keys = self.keys.as_ref().ok_or_else(|| {
                NilaRpError::Configuration("issuer metadata has no jwks_uri".to_string())
            })?;
            keys.signing_key(algorithm, jws.header.kid.as_deref()).await?
        };

        match jsonwebtoken::crypto::verify(jws.signature, jws.signing_input.as_bytes(), &key, algorithm) {
            Ok(true) => Ok(()),
            Ok(false) => Err(TokenValidationError::InvalidSignature.into()),
            Err(e) => {
                debug!(error = %e, "Signature verification failed");
                Err(TokenValidationError::InvalidSignature.into())
            }
        }
    }

    fn check_issuer(&self, iss: &str) -> Result<(), TokenValidationError> {
        if iss != self.issuer {
            return Err(TokenValidationError::IssuerMismatch {
                expected: self.issuer.clone(),
                got: iss.to_string(),
            });
        }
        Ok(())
    }

    fn check_audience(&self, claims: &IdTokenClaims) -> Result<(), TokenValidationError> {
        let client_id = &self.client.client_id;
        if !claims.aud.contains(client_id) {
            return Err(audience_mismatch(client_id, &claims.aud));
        }
        match &claims.azp {
            Some(azp) if azp != client_id => Err(TokenValidationError::AuthorizedPartyMismatch {
                expected: client_id.clone(),
                got: Some(azp.clone()),
            }),
            None if claims.aud.len() > 1 => Err(TokenValidationError::AuthorizedPartyMismatch {
                expected: client_id.clone(),
                got: None,
            }),
            _ => Ok(()),
        }
    }

    fn check_freshness(&self, claims: &IdTokenClaims, checks: &IdTokenChecks<'_>) -> Result<(), TokenValidationError> {
        let now = unix_now();
        let leeway = self.details.leeway.as_secs() as i64;

        if claims.exp < now - leeway {
            return Err(TokenValidationError::Expired { exp: claims.exp, now });
        }
        if claims.iat > now + leeway {
            return Err(TokenValidationError::IssuedInFuture { iat: claims.iat, now });
        }

        let max_age = checks.max_age.or(self.client.default_max_age);
        if max_age.is_none() && !self.client.require_auth_time {
            return Ok(());
        }
        let auth_time = claims
            .auth_time
            .ok_or_else(|| TokenValidationError::missing("auth_time"))?;
        if let Some(max_age) = max_age {
            let fresh_until = auth_time
                .saturating_add(i64::try_from(max_age).unwrap_or(i64::MAX))
                .saturating_add(leeway);
            if fresh_until < now {
                return Err(TokenValidationError::AuthTimeTooOld { auth_time, max_age, now });
            }
        }
        Ok(())
    }
}

fn audience_mismatch(client_id: &str, aud: &Audience) -> TokenValidationError {
    TokenValidationError::AudienceMismatch {
        client_id: client_id.to_string(),
        aud: aud.values().into_iter().map(str::to_string).collect(),
    }
}

fn check_nonce(claims: &IdTokenClaims, checks: &IdTokenChecks<'_>) -> Result<(), TokenValidationError> {
    // Refreshed ID Tokens may repeat the original nonce, which is no longer known.
    if checks.source == TokenSource::Refresh && checks.nonce.is_none() {
        return Ok(());
    }
    if checks.nonce != claims.nonce.as_deref() {
        return Err(TokenValidationError::NonceMismatch {
            expected: checks.nonce.map(str::to_string),
            got: claims.nonce.clone(),
        });
    }
    Ok(())
}

fn check_bindings(
    claims: &IdTokenClaims,
    alg: SigningAlgorithm,
    checks: &IdTokenChecks<'_>,
) -> Result<(), TokenValidationError> {
    let required = checks.source == TokenSource::AuthorizationEndpoint;

    if let Some(code) = checks.code {
        match &claims.c_hash {
            Some(c_hash) => {
                let expected = token_hash(code, alg);
                if &expected != c_hash {
                    return Err(TokenValidationError::CHashMismatch {
                        expected,
                        got: c_hash.clone(),
                    });
                }
            }
            None if required => return Err(TokenValidationError::missing("c_hash")),
            None => {}
        }
    }

    if let Some(access_token) = checks.access_token {
        match &claims.at_hash {
            Some(at_hash) => {
                let expected = token_hash(access_token, alg);
                if &expected != at_hash {
                    return Err(TokenValidationError::AtHashMismatch {
                        expected,
                        got: at_hash.clone(),
                    });
                }
            }
            None if required => return Err(TokenValidationError::missing("at_hash")),
            None => {}
        }
    }
    Ok(())
}

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
