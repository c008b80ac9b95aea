// src/jose.rs

//! Compact JWS/JWE plumbing shared by the validators and the request builder.
//!
//! Signature primitives come from `jsonwebtoken`; JWE is delegated to the
//! [`JweDecrypter`] / [`JweEncrypter`] seams so callers can plug in whatever JOSE
//! library they already use.

use crate::error::{NilaRpError, TokenValidationError};
use crate::model::JsonWebKey;
use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{Algorithm, EncodingKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A JWS `alg` value as negotiated at registration: either `none` or a real algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SigningAlgorithm {
    None,
    Signed(Algorithm),
}

impl SigningAlgorithm {
    /// Returns the underlying algorithm, or `None` for unsigned JWTs.
    pub fn algorithm(&self) -> Option<Algorithm> {
        match self {
            SigningAlgorithm::None => None,
            SigningAlgorithm::Signed(alg) => Some(*alg),
        }
    }

    /// Whether the algorithm is an HMAC keyed by the client secret.
    pub fn is_symmetric(&self) -> bool {
        matches!(
            self,
            SigningAlgorithm::Signed(Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
        )
    }
}

impl Default for SigningAlgorithm {
    fn default() -> Self {
        SigningAlgorithm::Signed(Algorithm::RS256)
    }
}

impl FromStr for SigningAlgorithm {
    type Err = NilaRpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "none" {
            return Ok(SigningAlgorithm::None);
        }
        Algorithm::from_str(s)
            .map(SigningAlgorithm::Signed)
            .map_err(|_| NilaRpError::Configuration(format!("unsupported JWS algorithm: {s}")))
    }
}

impl TryFrom<String> for SigningAlgorithm {
    type Error = NilaRpError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SigningAlgorithm> for String {
    fn from(value: SigningAlgorithm) -> Self {
        value.to_string()
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigningAlgorithm::None => f.write_str("none"),
            SigningAlgorithm::Signed(alg) => write!(f, "{alg:?}"),
        }
    }
}

/// A JOSE header. `alg` stays a string because `none` and JWE algorithms
/// have no `jsonwebtoken::Algorithm` counterpart.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JoseHeader {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enc: Option<String>,
    #[serde(flatten)]
    pub other: HashMap<String, Value>,
}

/// Decrypts a compact JWE addressed to this relying party.
///
/// Implementations hold the RP's private encryption keys; the header is
/// already decoded so `alg`/`enc`/`kid` can drive key selection.
pub trait JweDecrypter: Send + Sync {
    fn decrypt(&self, jwe: &str, header: &JoseHeader) -> Result<String, NilaRpError>;
}

/// Encrypts a payload (a request object) to one of the OP's published keys.
pub trait JweEncrypter: Send + Sync {
    fn encrypt(
        &self,
        plaintext: &str,
        alg: &str,
        enc: &str,
        recipient: &JsonWebKey,
    ) -> Result<String, NilaRpError>;
}

/// A compact JWS split into its parts, with header and payload decoded.
#[derive(Debug)]
pub(crate) struct CompactJws<'a> {
    pub header: JoseHeader,
    pub payload: Map<String, Value>,
    pub signing_input: &'a str,
    pub signature: &'a str,
}

impl<'a> CompactJws<'a> {
    pub fn parse(token: &'a str) -> Result<Self, TokenValidationError> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(TokenValidationError::Malformed(format!(
                "expected 3 segments, found {}",
                parts.len()
            )));
        }
        let header: JoseHeader = decode_segment(parts[0])?;
        let payload = match decode_segment::<Value>(parts[1])? {
            Value::Object(map) => map,
            _ => {
                return Err(TokenValidationError::Malformed(
                    "JWT payload is not a JSON object".to_string(),
                ))
            }
        };
        let signing_input_len = parts[0].len() + 1 + parts[1].len();
        Ok(Self {
            header,
            payload,
            signing_input: &token[..signing_input_len],
            signature: parts[2],
        })
    }
}

/// Number of dot-separated segments; 5 means JWE.
pub(crate) fn segment_count(token: &str) -> usize {
    token.split('.').count()
}

/// Decodes the protected header of a compact JWS or JWE.
pub(crate) fn decode_header(token: &str) -> Result<JoseHeader, TokenValidationError> {
    let first = token
        .split('.')
        .next()
        .ok_or_else(|| TokenValidationError::Malformed("empty token".to_string()))?;
    decode_segment(first)
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T, TokenValidationError> {
    let bytes = base64_url::decode(segment)
        .map_err(|e| TokenValidationError::Malformed(format!("invalid base64url segment: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| TokenValidationError::Malformed(format!("invalid JSON segment: {e}")))
}

/// Produces a JWT with `alg: none` and an empty signature segment.
pub(crate) fn encode_unsigned(payload: &Value) -> Result<String, NilaRpError> {
    let header = serde_json::json!({ "alg": "none" });
    Ok(format!(
        "{}.{}.",
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload)?)
    ))
}

/// Signs `payload` with `alg`. `typ` is set when given (e.g. `oauth-authz-req+jwt`).
pub(crate) fn sign(
    payload: &Value,
    alg: Algorithm,
    key: &EncodingKey,
    kid: Option<&str>,
    typ: Option<&str>,
) -> Result<String, NilaRpError> {
    let mut header = jsonwebtoken::Header::new(alg);
    header.kid = kid.map(str::to_string);
    if let Some(typ) = typ {
        header.typ = Some(typ.to_string());
    }
    jsonwebtoken::encode(&header, payload, key)
        .map_err(|e| NilaRpError::Configuration(format!("failed to sign JWT: {e}")))
}

/// Decodes the payload of a compact JWT without verifying anything.
pub(crate) fn insecure_payload(token: &str) -> Result<Map<String, Value>, TokenValidationError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| TokenValidationError::Malformed("missing payload segment".to_string()))?;
    match decode_segment::<Value>(payload)? {
        Value::Object(map) => Ok(map),
        _ => Err(TokenValidationError::Malformed(
            "JWT payload is not a JSON object".to_string(),
        )),
    }
}

/// Test JWE codec that carries the plaintext base64url-encoded in the ciphertext segment.
#[cfg(test)]
pub(crate) struct PlainJwe;

#[cfg(test)]
impl PlainJwe {
    pub(crate) fn seal(plaintext: &str, alg: &str, enc: &str) -> String {
        let header = serde_json::json!({ "alg": alg, "enc": enc }).to_string();
        format!(
            "{}.key.iv.{}.tag",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(plaintext)
        )
    }
}

#[cfg(test)]
impl JweDecrypter for PlainJwe {
    fn decrypt(&self, jwe: &str, _header: &JoseHeader) -> Result<String, NilaRpError> {
        let ciphertext = jwe
            .split('.')
            .nth(3)
            .ok_or_else(|| TokenValidationError::Malformed("missing ciphertext".to_string()))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(ciphertext)
            .map_err(|e| TokenValidationError::Malformed(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| TokenValidationError::Malformed(e.to_string()).into())
    }
}
