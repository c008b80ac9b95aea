// src/jwks.rs

use crate::error::{NilaRpError, TokenValidationError};
use crate::model::{JsonWebKey, JsonWebKeySet};
use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{Algorithm, DecodingKey};
use moka::future::Cache;
use moka::Expiry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// What a key is published for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUse {
    Signature,
    Encryption,
}

impl KeyUse {
    fn as_str(&self) -> &'static str {
        match self {
            KeyUse::Signature => "sig",
            KeyUse::Encryption => "enc",
        }
    }
}

/// Outcome of looking a key up in one key set.
#[derive(Debug, PartialEq)]
pub enum Resolution<'a> {
    Found(&'a JsonWebKey),
    Ambiguous,
    NotFound,
}

/// One fetched JWK set. Never mutated: a refresh produces a new `KeySet` with a higher epoch.
#[derive(Debug)]
pub struct KeySet {
    keys: Vec<JsonWebKey>,
    epoch: u64,
    fetched_at: Instant,
    max_age: Duration,
}

impl KeySet {
    pub fn new(keys: Vec<JsonWebKey>, epoch: u64, max_age: Duration) -> Self {
        Self {
            keys,
            epoch,
            fetched_at: Instant::now(),
            max_age,
        }
    }

    pub fn keys(&self) -> &[JsonWebKey] {
        &self.keys
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.age() >= threshold
    }

    /// Finds the verification key for `alg`, narrowed by `kid` when the JWT header carries one.
    ///
    /// Without a `kid` a single compatible key is accepted by uniqueness; several are ambiguous.
    /// With a `kid` the first compatible key carrying it wins.
    pub fn resolve(&self, alg: Algorithm, kid: Option<&str>) -> Resolution<'_> {
        let mut candidates = self
            .keys
            .iter()
            .filter(|jwk| usable_for(jwk, KeyUse::Signature) && supports_algorithm(jwk, alg));

        match kid {
            Some(kid) => candidates
                .find(|jwk| jwk.kid.as_deref() == Some(kid))
                .map_or(Resolution::NotFound, Resolution::Found),
            None => match (candidates.next(), candidates.next()) {
                (Some(jwk), None) => Resolution::Found(jwk),
                (Some(_), Some(_)) => Resolution::Ambiguous,
                (None, _) => Resolution::NotFound,
            },
        }
    }

    /// Finds the OP key a request object should be encrypted to.
    pub fn resolve_for_encryption(&self, alg: &str) -> Option<&JsonWebKey> {
        self.keys.iter().find(|jwk| {
            usable_for(jwk, KeyUse::Encryption)
                && jwk.alg.as_deref().map_or(true, |a| a == alg)
                && (jwk.kty == "RSA" && alg.starts_with("RSA") || jwk.kty == "EC" && alg.starts_with("ECDH"))
        })
    }
}

fn usable_for(jwk: &JsonWebKey, key_use: KeyUse) -> bool {
    jwk.use_purpose.as_deref().map_or(true, |u| u == key_use.as_str())
}

fn supports_algorithm(jwk: &JsonWebKey, alg: Algorithm) -> bool {
    if let Some(declared) = jwk.alg.as_deref() {
        if declared != format!("{alg:?}") {
            return false;
        }
    }
    match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => jwk.kty == "RSA",
        Algorithm::ES256 => jwk.kty == "EC" && jwk.crv.as_deref().map_or(true, |c| c == "P-256"),
        Algorithm::ES384 => jwk.kty == "EC" && jwk.crv.as_deref().map_or(true, |c| c == "P-384"),
        Algorithm::EdDSA => jwk.kty == "OKP",
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => jwk.kty == "oct",
    }
}

impl JsonWebKey {
    /// Builds a `jsonwebtoken` verification key from the JWK's public material.
    pub fn decoding_key(&self) -> Result<DecodingKey, TokenValidationError> {
        let missing = |member: &str| {
            TokenValidationError::InvalidKey(format!("{} key missing '{member}' component", self.kty))
        };
        let key = match self.kty.as_str() {
            "RSA" => DecodingKey::from_rsa_components(
                self.n.as_deref().ok_or_else(|| missing("n"))?,
                self.e.as_deref().ok_or_else(|| missing("e"))?,
            ),
            "EC" => DecodingKey::from_ec_components(
                self.x.as_deref().ok_or_else(|| missing("x"))?,
                self.y.as_deref().ok_or_else(|| missing("y"))?,
            ),
            "OKP" => DecodingKey::from_ed_components(self.x.as_deref().ok_or_else(|| missing("x"))?),
            "oct" => {
                let secret = URL_SAFE_NO_PAD
                    .decode(self.k.as_deref().ok_or_else(|| missing("k"))?)
                    .map_err(|e| TokenValidationError::InvalidKey(e.to_string()))?;
                Ok(DecodingKey::from_secret(&secret))
            }
            other => {
                return Err(TokenValidationError::InvalidKey(format!(
                    "unsupported key type: {other}"
                )))
            }
        };
        key.map_err(|e| TokenValidationError::InvalidKey(e.to_string()))
    }
}

/// Expires each cached key set after the TTL it was fetched with.
struct KeySetExpiry;

impl Expiry<String, Arc<KeySet>> for KeySetExpiry {
    fn expire_after_create(&self, _key: &String, value: &Arc<KeySet>, _created_at: Instant) -> Option<Duration> {
        Some(value.max_age)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Arc<KeySet>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.max_age)
    }
}

/// A per-issuer cache of the issuer's JWK set.
///
/// Readers always get a whole `Arc<KeySet>`; a refresh swaps in a new set, so a
/// verification already holding the old set finishes against it undisturbed.
#[derive(Clone)]
pub struct KeyStore {
    // The store is internally ref-counted to allow for cheap cloning.
    inner: Arc<Inner>,
}

struct Inner {
    http_client: reqwest::Client,
    jwks_uri: Url,
    default_cache_ttl: Duration,
    stale_after: Duration,
    cache: Cache<String, Arc<KeySet>>,
    refresh_lock: Mutex<()>,
    epoch: AtomicU64,
}

impl KeyStore {
    /// Creates a new `KeyStore` for the given `jwks_uri`. Nothing is fetched until first use.
    pub fn new(
        http_client: reqwest::Client,
        jwks_uri: Url,
        default_cache_ttl: Duration,
        stale_after: Duration,
    ) -> Self {
        let inner = Arc::new(Inner {
            http_client,
            jwks_uri,
            default_cache_ttl,
            stale_after,
            cache: Cache::builder().max_capacity(1).expire_after(KeySetExpiry).build(),
            refresh_lock: Mutex::new(()),
            epoch: AtomicU64::new(0),
        });
        Self { inner }
    }

    pub fn jwks_uri(&self) -> &Url {
        &self.inner.jwks_uri
    }

    /// Returns the cached key set, fetching it if nothing (or only an expired entry) is cached.
    pub async fn current(&self) -> Result<Arc<KeySet>, NilaRpError> {
        if let Some(set) = self.inner.cache.get(self.cache_key()).await {
            debug!(epoch = set.epoch, "JWKS cache hit");
            return Ok(set);
        }
        debug!("JWKS cache miss. Fetching from provider.");
        self.refresh(false).await
    }

    /// Re-fetches the JWK set and swaps it in.
    ///
    /// Without `force`, a set that is already cached is returned as is. Concurrent
    /// callers are serialized so only one fetch is in flight per store.
    #[instrument(skip(self), fields(jwks_uri = %self.inner.jwks_uri), err)]
    pub async fn refresh(&self, force: bool) -> Result<Arc<KeySet>, NilaRpError> {
        let observed = self.inner.cache.get(self.cache_key()).await.map(|set| set.epoch);
        self.refresh_from(observed, force).await
    }

    /// Like [`KeyStore::refresh`], where `observed` is the epoch the caller last saw.
    /// A forced refresh is skipped when the cache already moved past it.
    async fn refresh_from(&self, observed: Option<u64>, force: bool) -> Result<Arc<KeySet>, NilaRpError> {
        let _guard = self.inner.refresh_lock.lock().await;

        if let Some(set) = self.inner.cache.get(self.cache_key()).await {
            // Someone else swapped in a newer set while we waited for the lock.
            if !force || Some(set.epoch) != observed {
                return Ok(set);
            }
        }

        let set = Arc::new(self.fetch().await?);
        self.inner.cache.insert(self.cache_key().to_string(), set.clone()).await;
        Ok(set)
    }

    /// Resolves the verification key for `alg`/`kid`, applying the rotation rule:
    /// when no key matches and the cached set is stale, exactly one forced refresh
    /// happens before giving up.
    #[instrument(skip(self), err)]
    pub async fn signing_key(&self, alg: Algorithm, kid: Option<&str>) -> Result<DecodingKey, NilaRpError> {
        let set = self.current().await?;
        match set.resolve(alg, kid) {
            Resolution::Found(jwk) => return Ok(jwk.decoding_key()?),
            Resolution::Ambiguous => return Err(TokenValidationError::AmbiguousKey.into()),
            Resolution::NotFound => {}
        }

        let not_found = || TokenValidationError::NoMatchingKey {
            alg: format!("{alg:?}"),
            kid: kid.map(str::to_string),
        };

        if !set.is_stale(self.inner.stale_after) {
            debug!(age = ?set.age(), "No matching key and key set is fresh; not refreshing");
            return Err(not_found().into());
        }

        info!(age = ?set.age(), "No matching key in stale key set; forcing one refresh");
        let refreshed = self.refresh_from(Some(set.epoch), true).await?;
        match refreshed.resolve(alg, kid) {
            Resolution::Found(jwk) => Ok(jwk.decoding_key()?),
            Resolution::Ambiguous => Err(TokenValidationError::AmbiguousKey.into()),
            Resolution::NotFound => Err(not_found().into()),
        }
    }

    fn cache_key(&self) -> &str {
        self.inner.jwks_uri.as_str()
    }

    /// Fetches the JWKS from the OIDC provider.
    async fn fetch(&self) -> Result<KeySet, NilaRpError> {
        let response = self
            .inner
            .http_client
            .get(self.inner.jwks_uri.clone())
            .header(reqwest::header::ACCEPT, "application/json,application/jwk-set+json")
            .send()
            .await?
            .error_for_status()?;

        let cache_ttl = parse_cache_control(&response).unwrap_or(self.inner.default_cache_ttl);
        let jwks: JsonWebKeySet = response.json().await?;
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        if jwks.keys.is_empty() {
            warn!("JWKS at {} contains no keys", self.inner.jwks_uri);
        }
        info!(epoch, keys = jwks.keys.len(), ttl = ?cache_ttl, "Fetched JWKS");

        Ok(KeySet::new(jwks.keys, epoch, cache_ttl))
    }
}

/// Parses the `Cache-Control` header to determine the TTL.
fn parse_cache_control(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::CACHE_CONTROL)?
        .to_str()
        .ok()?
        .split(',')
        .find_map(|part| {
            part.trim()
                .strip_prefix("max-age=")?
                .parse::<u64>()
                .ok()
                .map(Duration::from_secs)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsa(kid: Option<&str>, alg: Option<&str>, key_use: Option<&str>) -> JsonWebKey {
        JsonWebKey {
            kid: kid.map(str::to_string),
            kty: "RSA".to_string(),
            use_purpose: key_use.map(str::to_string),
            alg: alg.map(str::to_string),
            crv: None,
            n: Some("sXchDaQebHnPiGvyDOAT4saGEUetSyo9MKLOoWFsueri23bOdgWp4Dy1WlUzewbgBHod5pcM9H95GQRV3JDXboIRROSBigeC5yjU1hGzHHyXss8UDprecbAYxknTcQkhslANGRUZmdTOQ5qTRsLAt6BTYuyvVRdhS8exSZEy_c4gs_7svlJJQ4H9_NxsiIoLwAEk7-Q3UXERGYw_75IDrGA84-lA_-Ct4eTlXHBIY2EaV7t7LjJaynVJCpkv4LKjTTAumiGUIuQhrNhZLuF_RJLqHpM2kgWFLU7-VTdL1VbC2tejvcI2BlMkEpk1BzBZI0KQB0GaDWFLN-aEAw3vRw".to_string()),
            e: Some("AQAB".to_string()),
            x: None,
            y: None,
            k: None,
            other: Default::default(),
        }
    }

    #[test]
    fn single_key_resolves_without_kid() {
        let set = KeySet::new(vec![rsa(Some("a"), Some("RS256"), Some("sig"))], 1, Duration::from_secs(60));
        assert!(matches!(set.resolve(Algorithm::RS256, None), Resolution::Found(_)));
    }

    #[test]
    fn multiple_keys_without_kid_are_ambiguous() {
        let set = KeySet::new(
            vec![rsa(Some("a"), Some("RS256"), Some("sig")), rsa(Some("b"), None, None)],
            1,
            Duration::from_secs(60),
        );
        assert_eq!(set.resolve(Algorithm::RS256, None), Resolution::Ambiguous);
        match set.resolve(Algorithm::RS256, Some("b")) {
            Resolution::Found(jwk) => assert_eq!(jwk.kid.as_deref(), Some("b")),
            other => panic!("expected key b, got {other:?}"),
        }
    }

    #[test]
    fn resolution_filters_by_use_and_algorithm() {
        let set = KeySet::new(
            vec![
                rsa(Some("enc"), None, Some("enc")),
                rsa(Some("ps"), Some("PS256"), Some("sig")),
                rsa(Some("sig"), Some("RS256"), Some("sig")),
            ],
            1,
            Duration::from_secs(60),
        );
        match set.resolve(Algorithm::RS256, None) {
            Resolution::Found(jwk) => assert_eq!(jwk.kid.as_deref(), Some("sig")),
            other => panic!("expected the RS256 signing key, got {other:?}"),
        }
        assert_eq!(set.resolve(Algorithm::ES256, None), Resolution::NotFound);
        assert_eq!(set.resolve(Algorithm::RS256, Some("enc")), Resolution::NotFound);
        assert!(set.resolve_for_encryption("RSA1_5").is_some());
    }

    #[test]
    fn resolving_twice_returns_the_same_key() {
        let set = KeySet::new(
            vec![rsa(Some("a"), None, None), rsa(Some("a"), None, None)],
            1,
            Duration::from_secs(60),
        );
        let first = set.resolve(Algorithm::RS256, Some("a"));
        let second = set.resolve(Algorithm::RS256, Some("a"));
        match (first, second) {
            (Resolution::Found(a), Resolution::Found(b)) => assert!(std::ptr::eq(a, b)),
            other => panic!("expected two hits, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forced_refresh_is_skipped_once_the_set_moved_on() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "keys": [] })))
            .expect(2)
            .mount(&server)
            .await;

        let store = KeyStore::new(
            reqwest::Client::new(),
            Url::parse(&format!("{}/jwks", server.uri())).unwrap(),
            Duration::from_secs(3600),
            Duration::ZERO,
        );
        let first = store.current().await.unwrap();
        let second = store.refresh(true).await.unwrap();
        assert!(second.epoch() > first.epoch());

        // A caller that resolved against the first set arrives after the swap.
        let late = store.refresh_from(Some(first.epoch()), true).await.unwrap();
        assert_eq!(late.epoch(), second.epoch());
    }

    #[test]
    fn staleness_follows_threshold() {
        let set = KeySet::new(vec![], 1, Duration::from_secs(60));
        assert!(set.is_stale(Duration::ZERO));
        assert!(!set.is_stale(Duration::from_secs(60)));
    }

    #[test]
    fn rsa_jwk_converts_to_decoding_key() {
        assert!(rsa(None, None, None).decoding_key().is_ok());
        let mut broken = rsa(None, None, None);
        broken.e = None;
        assert!(matches!(broken.decoding_key(), Err(TokenValidationError::InvalidKey(_))));
    }
}
