// src/lib.rs

pub mod config;
pub mod error;
mod http;
pub mod issuer;
pub mod jose;
pub mod jwks;
pub mod keys;
pub mod model;
pub mod request;
pub mod response;
pub mod rp;
pub mod token;
pub mod userinfo;
pub mod validator;

/// The public prelude for the `nila-oidc-rp` crate.
///
/// This module re-exports the most commonly used types for convenience.
pub mod prelude {
    pub use crate::config::{ClientConfig, Config, ConfigBuilder, TokenEndpointAuthMethod, ValidationDetails};
    pub use crate::error::{ErrorKind, NilaRpError};
    pub use crate::issuer::Issuer;
    pub use crate::jose::{JweDecrypter, JweEncrypter, SigningAlgorithm};
    pub use crate::keys::ClientKeys;
    pub use crate::request::{AuthorizationRequest, AuthorizationRequestState};
    pub use crate::response::{AuthorizationResponse, CallbackParams};
    pub use crate::rp::RelyingParty;
    pub use crate::token::TokenSet;
    pub use crate::userinfo::{HttpVerb, UserInfo, UserInfoOptions, UserInfoVia};
    pub use crate::validator::{IdTokenChecks, IdTokenClaims, TokenSource, ValidatedIdToken, Validator};
    pub use jsonwebtoken::Algorithm;
}
