// src/issuer.rs

use crate::config::{ClientConfig, ValidationDetails};
use crate::error::{DiscoveryError, NilaRpError};
use crate::http::{build_client, read_json};
use crate::jwks::KeyStore;
use crate::model::{IssuerMetadata, WebFingerResponse};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use url::Url;

const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";
const WEBFINGER_PATH: &str = "/.well-known/webfinger";
const ISSUER_REL: &str = "http://openid.net/specs/connect/1.0/issuer";

/// A discovered OpenID Provider: its metadata plus the key cache for its `jwks_uri`.
///
/// Cheap to clone; clones share the key cache.
#[derive(Clone)]
pub struct Issuer {
    metadata: Arc<IssuerMetadata>,
    http_client: reqwest::Client,
    keys: Option<KeyStore>,
    details: ValidationDetails,
}

impl std::fmt::Debug for Issuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Issuer").field("issuer", &self.metadata.issuer).finish_non_exhaustive()
    }
}

impl Issuer {
    /// Fetches `{issuer}/.well-known/openid-configuration`.
    ///
    /// A URL that already points at a `.well-known` document is used as is.
    #[instrument(skip(details), err)]
    pub async fn discover(issuer: &str, details: &ValidationDetails) -> Result<Self, NilaRpError> {
        let http_client = build_client(details)?;
        let url = if issuer.contains("/.well-known/") {
            Url::parse(issuer)?
        } else {
            Url::parse(&format!("{}{DISCOVERY_PATH}", issuer.trim_end_matches('/')))?
        };

        let response = http_client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DiscoveryError::UnexpectedStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            }
            .into());
        }
        let body = response.text().await?;
        let metadata: IssuerMetadata =
            serde_json::from_str(&body).map_err(|e| DiscoveryError::InvalidMetadata(e.to_string()))?;
        info!(issuer = %metadata.issuer, "Discovered issuer metadata");

        Self::with_client(metadata, http_client, details.clone())
    }

    /// Resolves the issuer responsible for a user identifier (`acct:joe@example.com`,
    /// `joe@example.com`) or URL through WebFinger, then discovers it.
    ///
    /// The discovered `issuer` must equal the WebFinger `href` exactly.
    #[instrument(skip(details), err)]
    pub async fn webfinger(input: &str, details: &ValidationDetails) -> Result<Self, NilaRpError> {
        let (url, resource) = webfinger_target(input)?;
        debug!(%url, %resource, "Querying WebFinger");

        let http_client = build_client(details)?;
        let response = http_client
            .get(url.clone())
            .query(&[("resource", resource.as_str()), ("rel", ISSUER_REL)])
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DiscoveryError::UnexpectedStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            }
            .into());
        }
        let jrd: WebFingerResponse = response.json().await?;
        let href = jrd
            .links
            .into_iter()
            .find(|link| link.rel == ISSUER_REL)
            .and_then(|link| link.href)
            .ok_or(DiscoveryError::MissingIssuerLink)?;

        let issuer = Self::discover(&href, details).await?;
        if issuer.metadata.issuer != href {
            return Err(DiscoveryError::IssuerMismatch {
                expected: href,
                got: issuer.metadata.issuer.clone(),
            }
            .into());
        }
        Ok(issuer)
    }

    /// Builds an issuer from metadata obtained elsewhere (e.g. static configuration).
    pub fn from_metadata(metadata: IssuerMetadata, details: &ValidationDetails) -> Result<Self, NilaRpError> {
        Self::with_client(metadata, build_client(details)?, details.clone())
    }

    fn with_client(
        metadata: IssuerMetadata,
        http_client: reqwest::Client,
        details: ValidationDetails,
    ) -> Result<Self, NilaRpError> {
        let keys = match &metadata.jwks_uri {
            Some(jwks_uri) => Some(KeyStore::new(
                http_client.clone(),
                Url::parse(jwks_uri)?,
                details.cache_ttl,
                details.jwks_stale_after,
            )),
            None => None,
        };
        Ok(Self {
            metadata: Arc::new(metadata),
            http_client,
            keys,
            details,
        })
    }

    /// Registers a client dynamically. `metadata` is the registration request body.
    #[instrument(skip(self, metadata, initial_access_token), fields(issuer = %self.metadata.issuer), err)]
    pub async fn register(
        &self,
        metadata: &Value,
        initial_access_token: Option<&str>,
    ) -> Result<ClientConfig, NilaRpError> {
        let endpoint = self.endpoint("registration_endpoint", &self.metadata.registration_endpoint)?;
        let mut request = self
            .http_client
            .post(endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(metadata);
        if let Some(token) = initial_access_token {
            request = request.bearer_auth(token);
        }
        let client: ClientConfig = read_json(request.send().await?).await?;
        info!(client_id = %client.client_id, "Registered client");
        Ok(client)
    }

    pub fn issuer(&self) -> &str {
        &self.metadata.issuer
    }

    pub fn metadata(&self) -> &IssuerMetadata {
        &self.metadata
    }

    pub fn keys(&self) -> Option<&KeyStore> {
        self.keys.as_ref()
    }

    pub fn details(&self) -> &ValidationDetails {
        &self.details
    }

    pub(crate) fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    pub(crate) fn authorization_endpoint(&self) -> Result<Url, NilaRpError> {
        self.endpoint("authorization_endpoint", &self.metadata.authorization_endpoint)
    }

    pub(crate) fn token_endpoint(&self) -> Result<Url, NilaRpError> {
        self.endpoint("token_endpoint", &self.metadata.token_endpoint)
    }

    pub(crate) fn userinfo_endpoint(&self) -> Result<Url, NilaRpError> {
        self.endpoint("userinfo_endpoint", &self.metadata.userinfo_endpoint)
    }

    fn endpoint(&self, name: &str, value: &Option<String>) -> Result<Url, NilaRpError> {
        let value = value
            .as_deref()
            .ok_or_else(|| NilaRpError::Configuration(format!("{name} must be configured on the issuer")))?;
        Ok(Url::parse(value)?)
    }
}

/// Normalizes WebFinger input into the query URL and the `resource` parameter.
///
/// `acct:` and e-mail style identifiers are queried over https at the domain after
/// the last `@`; URLs keep their own scheme, host and port.
fn webfinger_target(input: &str) -> Result<(Url, String), NilaRpError> {
    let input = input.trim();
    let invalid = || DiscoveryError::InvalidResource(input.to_string());

    let is_acct = input.starts_with("acct:") || (input.contains('@') && !input.contains("://"));
    if is_acct {
        let resource = if input.starts_with("acct:") {
            input.to_string()
        } else {
            format!("acct:{input}")
        };
        let host = resource.rsplit_once('@').map(|(_, host)| host).ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid().into());
        }
        let url = Url::parse(&format!("https://{host}{WEBFINGER_PATH}")).map_err(|_| invalid())?;
        return Ok((url, resource));
    }

    let with_scheme = if input.contains("://") {
        input.to_string()
    } else {
        format!("https://{input}")
    };
    let mut resource = Url::parse(&with_scheme).map_err(|_| invalid())?;
    resource.set_fragment(None);
    let mut url = resource.clone();
    url.set_path(WEBFINGER_PATH);
    url.set_query(None);
    Ok((url, resource.to_string()))
}
