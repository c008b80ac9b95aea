// src/validator/hash.rs

//! `at_hash` / `c_hash` computation.

use crate::jose::SigningAlgorithm;
use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::Algorithm;
use sha2::{Digest, Sha256, Sha384, Sha512};

/// Left half of the hash of `value`, base64url encoded without padding.
///
/// The hash function follows the JWS algorithm of the ID Token: the SHA-2 variant
/// named by its bit suffix, SHA-512 for EdDSA, SHA-256 for unsigned tokens.
pub fn token_hash(value: &str, alg: SigningAlgorithm) -> String {
    let digest = match alg.algorithm() {
        Some(Algorithm::HS384 | Algorithm::RS384 | Algorithm::PS384 | Algorithm::ES384) => {
            Sha384::digest(value.as_bytes()).to_vec()
        }
        Some(Algorithm::HS512 | Algorithm::RS512 | Algorithm::PS512 | Algorithm::EdDSA) => {
            Sha512::digest(value.as_bytes()).to_vec()
        }
        _ => Sha256::digest(value.as_bytes()).to_vec(),
    };
    URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2])
}
