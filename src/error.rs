// src/error.rs

use thiserror::Error;

/// Machine-readable classification of every failure the relying party can surface.
///
/// Message text is a rendering detail; callers that need to branch on a failure
/// should match on [`NilaRpError::kind`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Network,
    Discovery,
    MissingClaim,
    InvalidSignature,
    AmbiguousKey,
    NoMatchingKey,
    InvalidKey,
    IssuerMismatch,
    AudienceMismatch,
    AuthorizedPartyMismatch,
    Expired,
    IssuedInFuture,
    AuthTimeTooOld,
    NonceMismatch,
    CHashMismatch,
    AtHashMismatch,
    SubjectMismatch,
    MalformedToken,
    UserInfoSubjectMismatch,
    UserInfoFetch,
    Authorization,
    StateMismatch,
    TokenEndpoint,
    InvalidResponse,
}

/// The primary error type for the `nila-oidc-rp` library.
#[derive(Debug, Error)]
pub enum NilaRpError {
    /// Caller misuse, raised before any network I/O.
    #[error("{0}")]
    Configuration(String),

    /// A provided URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Transport failure or timeout. Retrying is up to the caller.
    #[error("HTTP request error: {0}")]
    Network(#[from] reqwest::Error),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    TokenValidation(#[from] TokenValidationError),

    #[error(transparent)]
    UserInfo(#[from] UserInfoError),

    /// The authorization endpoint redirected back with an `error` parameter.
    #[error("{error}{}", describe(.description))]
    Authorization {
        error: String,
        description: Option<String>,
        state: Option<String>,
    },

    /// The `state` echoed by the OP is not the one this flow sent.
    #[error("state mismatch, expected {}, got: {}", show(.expected), show(.got))]
    StateMismatch {
        expected: Option<String>,
        got: Option<String>,
    },

    /// The token endpoint answered with an OAuth 2.0 error response.
    #[error("{error}{}", describe(.description))]
    TokenEndpoint {
        error: String,
        description: Option<String>,
    },

    /// A response could not be understood (bad JSON, missing parameters, unexpected content type).
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl NilaRpError {
    /// Returns the machine-readable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NilaRpError::Configuration(_) | NilaRpError::InvalidUrl(_) => ErrorKind::Configuration,
            NilaRpError::Network(_) => ErrorKind::Network,
            NilaRpError::Discovery(_) => ErrorKind::Discovery,
            NilaRpError::TokenValidation(e) => e.kind(),
            NilaRpError::UserInfo(e) => e.kind(),
            NilaRpError::Authorization { .. } => ErrorKind::Authorization,
            NilaRpError::StateMismatch { .. } => ErrorKind::StateMismatch,
            NilaRpError::TokenEndpoint { .. } => ErrorKind::TokenEndpoint,
            NilaRpError::InvalidResponse(_) | NilaRpError::Json(_) => ErrorKind::InvalidResponse,
        }
    }
}

/// Failures while discovering an issuer or registering a client.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovered issuer mismatch, expected {expected}, got: {got}")]
    IssuerMismatch { expected: String, got: String },

    #[error("no issuer found in webfinger response")]
    MissingIssuerLink,

    #[error("invalid webfinger resource: {0}")]
    InvalidResource(String),

    #[error("invalid issuer metadata: {0}")]
    InvalidMetadata(String),

    #[error("unexpected HTTP status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },
}

/// Every way an ID Token (or a signed UserInfo / claims JWT) can be rejected.
#[derive(Debug, Error)]
pub enum TokenValidationError {
    #[error("missing required JWT property {name}")]
    MissingClaim { name: String },

    #[error("invalid signature")]
    InvalidSignature,

    #[error("multiple matching keys, kid must be provided")]
    AmbiguousKey,

    #[error("no valid key found in issuer's jwks_uri for key parameters kid: {}, alg: {alg}", show(.kid))]
    NoMatchingKey { alg: String, kid: Option<String> },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("unexpected iss value, expected {expected}, got: {got}")]
    IssuerMismatch { expected: String, got: String },

    #[error("aud is missing the client_id, expected {client_id} to be included in {aud:?}")]
    AudienceMismatch { client_id: String, aud: Vec<String> },

    #[error("azp must be the client_id, expected {expected}, got: {}", show(.got))]
    AuthorizedPartyMismatch { expected: String, got: Option<String> },

    #[error("JWT expired, now {now}, exp {exp}")]
    Expired { exp: i64, now: i64 },

    #[error("JWT issued in the future, now {now}, iat {iat}")]
    IssuedInFuture { iat: i64, now: i64 },

    #[error("too much time has elapsed since the last End-User authentication, max_age {max_age}, auth_time: {auth_time}, now {now}")]
    AuthTimeTooOld { auth_time: i64, max_age: u64, now: i64 },

    #[error("nonce mismatch, expected {}, got: {}", show(.expected), show(.got))]
    NonceMismatch {
        expected: Option<String>,
        got: Option<String>,
    },

    #[error("c_hash mismatch, expected {expected}, got: {got}")]
    CHashMismatch { expected: String, got: String },

    #[error("at_hash mismatch, expected {expected}, got: {got}")]
    AtHashMismatch { expected: String, got: String },

    #[error("sub mismatch between ID Tokens, expected {expected}, got: {got}")]
    SubjectMismatch { expected: String, got: String },

    #[error("failed to decode JWT ({0})")]
    Malformed(String),
}

impl TokenValidationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TokenValidationError::MissingClaim { .. } => ErrorKind::MissingClaim,
            TokenValidationError::InvalidSignature => ErrorKind::InvalidSignature,
            TokenValidationError::AmbiguousKey => ErrorKind::AmbiguousKey,
            TokenValidationError::NoMatchingKey { .. } => ErrorKind::NoMatchingKey,
            TokenValidationError::InvalidKey(_) => ErrorKind::InvalidKey,
            TokenValidationError::IssuerMismatch { .. } => ErrorKind::IssuerMismatch,
            TokenValidationError::AudienceMismatch { .. } => ErrorKind::AudienceMismatch,
            TokenValidationError::AuthorizedPartyMismatch { .. } => ErrorKind::AuthorizedPartyMismatch,
            TokenValidationError::Expired { .. } => ErrorKind::Expired,
            TokenValidationError::IssuedInFuture { .. } => ErrorKind::IssuedInFuture,
            TokenValidationError::AuthTimeTooOld { .. } => ErrorKind::AuthTimeTooOld,
            TokenValidationError::NonceMismatch { .. } => ErrorKind::NonceMismatch,
            TokenValidationError::CHashMismatch { .. } => ErrorKind::CHashMismatch,
            TokenValidationError::AtHashMismatch { .. } => ErrorKind::AtHashMismatch,
            TokenValidationError::SubjectMismatch { .. } => ErrorKind::SubjectMismatch,
            TokenValidationError::Malformed(_) => ErrorKind::MalformedToken,
        }
    }

    pub(crate) fn missing(name: &str) -> Self {
        TokenValidationError::MissingClaim { name: name.to_string() }
    }
}

/// Failures specific to the UserInfo endpoint.
#[derive(Debug, Error)]
pub enum UserInfoError {
    #[error("userinfo sub mismatch, expected {expected}, got: {got}")]
    SubjectMismatch { expected: String, got: String },

    #[error("access_token not present in TokenSet")]
    MissingAccessToken,

    #[error("userinfo request failed with status {status}{}", describe(.error))]
    Fetch { status: u16, error: Option<String> },
}

impl UserInfoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UserInfoError::SubjectMismatch { .. } => ErrorKind::UserInfoSubjectMismatch,
            UserInfoError::MissingAccessToken | UserInfoError::Fetch { .. } => ErrorKind::UserInfoFetch,
        }
    }
}

fn show(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("<none>")
}

fn describe(value: &Option<String>) -> String {
    value.as_deref().map(|d| format!(" ({d})")).unwrap_or_default()
}
