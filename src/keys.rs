// src/keys.rs

use crate::error::NilaRpError;
use crate::model::{JsonWebKey, JsonWebKeySet};
use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{Algorithm, EncodingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// The key type behind a set of client keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKeyType {
    Rsa,
    EcP256,
}

/// The relying party's own signing key (RSA or EC P-256), used for
/// `private_key_jwt` client authentication and for signed request objects.
///
/// The public half is published (at registration, or from a `jwks_uri` the RP
/// serves) via [`ClientKeys::public_jwks`].
#[derive(Clone)]
pub struct ClientKeys {
    key_type: ClientKeyType,
    encoding_key: EncodingKey,
    public_jwk: JsonWebKey,
}

impl fmt::Debug for ClientKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientKeys")
            .field("key_type", &self.key_type)
            .field("kid", &self.kid())
            .finish_non_exhaustive()
    }
}

impl ClientKeys {
    /// Loads a PKCS#8 PEM encoded RSA private key.
    pub fn from_rsa_pem(pem: &str) -> Result<Self, NilaRpError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| {
            NilaRpError::Configuration(format!("Failed to parse RSA private key from PKCS#8 PEM: {e}"))
        })?;

        // jsonwebtoken is handed PKCS#1 DER, which it accepts without the PEM feature quirks.
        let pkcs1_der = private_key.to_pkcs1_der().map_err(|e| {
            NilaRpError::Configuration(format!("Failed to convert RSA key to PKCS#1 DER: {e}"))
        })?;
        let encoding_key = EncodingKey::from_rsa_der(pkcs1_der.as_bytes());

        let public_key = private_key.to_public_key();
        let n = URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be());
        let e = URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be());
        let kid = thumbprint(&json!({ "e": e, "kty": "RSA", "n": n }))?;

        let public_jwk = JsonWebKey {
            kid: Some(kid),
            kty: "RSA".to_string(),
            use_purpose: Some("sig".to_string()),
            alg: None,
            crv: None,
            n: Some(n),
            e: Some(e),
            x: None,
            y: None,
            k: None,
            other: HashMap::new(),
        };
        Ok(Self {
            key_type: ClientKeyType::Rsa,
            encoding_key,
            public_jwk,
        })
    }

    /// Loads a PKCS#8 PEM encoded EC P-256 private key, for `ES256`.
    pub fn from_ec_pem(pem: &str) -> Result<Self, NilaRpError> {
        let secret_key = <p256::SecretKey as p256::pkcs8::DecodePrivateKey>::from_pkcs8_pem(pem).map_err(|e| {
            NilaRpError::Configuration(format!("Failed to parse EC P-256 private key from PKCS#8 PEM: {e}"))
        })?;
        let encoding_key = EncodingKey::from_ec_pem(pem.as_bytes()).map_err(|e| {
            NilaRpError::Configuration(format!("Failed to load EC P-256 signing key: {e}"))
        })?;

        let point = secret_key.public_key().to_encoded_point(false);
        let (Some(x), Some(y)) = (point.x(), point.y()) else {
            return Err(NilaRpError::Configuration(
                "EC P-256 public key has no affine coordinates".to_string(),
            ));
        };
        let x = URL_SAFE_NO_PAD.encode(x);
        let y = URL_SAFE_NO_PAD.encode(y);
        let kid = thumbprint(&json!({ "crv": "P-256", "kty": "EC", "x": x, "y": y }))?;

        let public_jwk = JsonWebKey {
            kid: Some(kid),
            kty: "EC".to_string(),
            use_purpose: Some("sig".to_string()),
            alg: None,
            crv: Some("P-256".to_string()),
            n: None,
            e: None,
            x: Some(x),
            y: Some(y),
            k: None,
            other: HashMap::new(),
        };
        Ok(Self {
            key_type: ClientKeyType::EcP256,
            encoding_key,
            public_jwk,
        })
    }

    /// Reads an RSA key from a PEM file.
    pub fn from_rsa_pem_file(path: impl AsRef<Path>) -> Result<Self, NilaRpError> {
        Self::from_rsa_pem(&read_pem(path.as_ref())?)
    }

    /// Reads an EC P-256 key from a PEM file.
    pub fn from_ec_pem_file(path: impl AsRef<Path>) -> Result<Self, NilaRpError> {
        Self::from_ec_pem(&read_pem(path.as_ref())?)
    }

    pub fn key_type(&self) -> ClientKeyType {
        self.key_type
    }

    /// The RFC 7638 thumbprint of the public key.
    pub fn kid(&self) -> &str {
        self.public_jwk.kid.as_deref().unwrap_or_default()
    }

    pub fn public_jwk(&self) -> &JsonWebKey {
        &self.public_jwk
    }

    pub fn public_jwks(&self) -> JsonWebKeySet {
        JsonWebKeySet {
            keys: vec![self.public_jwk.clone()],
        }
    }

    /// The algorithm used when none is registered: `RS256` or `ES256`.
    pub fn default_algorithm(&self) -> Algorithm {
        match self.key_type {
            ClientKeyType::Rsa => Algorithm::RS256,
            ClientKeyType::EcP256 => Algorithm::ES256,
        }
    }

    /// The signing key for `alg`, which must suit the key type.
    pub fn encoding_key(&self, alg: Algorithm) -> Result<&EncodingKey, NilaRpError> {
        let supported = match self.key_type {
            ClientKeyType::Rsa => matches!(
                alg,
                Algorithm::RS256
                    | Algorithm::RS384
                    | Algorithm::RS512
                    | Algorithm::PS256
                    | Algorithm::PS384
                    | Algorithm::PS512
            ),
            ClientKeyType::EcP256 => alg == Algorithm::ES256,
        };
        if !supported {
            return Err(NilaRpError::Configuration(format!(
                "client keys hold a {:?} key and cannot sign {alg:?}",
                self.key_type
            )));
        }
        Ok(&self.encoding_key)
    }
}

fn read_pem(path: &Path) -> Result<String, NilaRpError> {
    std::fs::read_to_string(path).map_err(|e| {
        NilaRpError::Configuration(format!("Failed to read private key file from {path:?}: {e}"))
    })
}

/// JWK thumbprint (RFC 7638): SHA-256 over the required members in lexicographic order.
fn thumbprint(required_members: &serde_json::Value) -> Result<String, NilaRpError> {
    // serde_json's default map is ordered, which gives the canonical member order.
    let canonical = serde_json::to_string(required_members)?;
    Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PEM: &str = include_str!("../tests/fixtures/rsa_primary.pem");
    const EC_PEM: &str = include_str!("../tests/fixtures/ec_p256.pem");

    #[test]
    fn derives_public_jwk_with_thumbprint_kid() {
        let keys = ClientKeys::from_rsa_pem(PEM).unwrap();
        let jwk = keys.public_jwk();
        assert_eq!(jwk.kty, "RSA");
        assert_eq!(jwk.e.as_deref(), Some("AQAB"));
        assert_eq!(keys.kid().len(), 43);
        assert_eq!(keys.public_jwks().keys.len(), 1);
        assert!(keys.encoding_key(Algorithm::PS256).is_ok());
        assert!(keys.encoding_key(Algorithm::ES256).is_err());
        assert_eq!(keys.default_algorithm(), Algorithm::RS256);
    }

    #[test]
    fn ec_key_publishes_p256_jwk() {
        let keys = ClientKeys::from_ec_pem(EC_PEM).unwrap();
        let published: JsonWebKey = serde_json::from_str(include_str!("../tests/fixtures/ec_p256.jwk.json")).unwrap();
        let jwk = keys.public_jwk();
        assert_eq!(keys.key_type(), ClientKeyType::EcP256);
        assert_eq!(jwk.kty, "EC");
        assert_eq!(jwk.crv.as_deref(), Some("P-256"));
        assert_eq!(jwk.x, published.x);
        assert_eq!(jwk.y, published.y);
        assert_eq!(keys.kid().len(), 43);
        assert_eq!(keys.default_algorithm(), Algorithm::ES256);
        assert!(keys.encoding_key(Algorithm::ES256).is_ok());
        assert!(keys.encoding_key(Algorithm::RS256).is_err());

        assert!(ClientKeys::from_ec_pem(PEM).is_err());
    }

    #[test]
    fn loads_key_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(PEM.as_bytes()).unwrap();
        let from_file = ClientKeys::from_rsa_pem_file(file.path()).unwrap();
        assert_eq!(from_file.kid(), ClientKeys::from_rsa_pem(PEM).unwrap().kid());

        assert!(ClientKeys::from_rsa_pem("not a key").is_err());
    }
}
