// src/rp.rs

use crate::config::{ClientConfig, Config};
use crate::error::{NilaRpError, TokenValidationError};
use crate::issuer::Issuer;
use crate::jose::{JweDecrypter, JweEncrypter};
use crate::keys::ClientKeys;
use crate::request::{sign_request_object, AuthorizationRequest, AuthorizationRequestState};
use crate::response::AuthorizationResponse;
use crate::token::{expiry_from_now, request_tokens, TokenSet};
use crate::userinfo::{self, UserInfo, UserInfoOptions};
use crate::validator::{IdTokenChecks, TokenSource, ValidatedIdToken, Validator};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use url::Url;

/// Default content encryption for request objects when only the key algorithm is registered.
const DEFAULT_REQUEST_OBJECT_ENC: &str = "A128CBC-HS256";

/// An OpenID Connect relying party: one registered client at one issuer.
///
/// This struct should be created once and reused for every login. It is cheap
/// to clone and all clones share the issuer's key cache.
#[derive(Clone)]
pub struct RelyingParty {
    issuer: Issuer,
    validator: Validator,
    keys: Option<Arc<ClientKeys>>,
    encrypter: Option<Arc<dyn JweEncrypter>>,
}

impl RelyingParty {
    pub fn new(issuer: Issuer, config: Config) -> Self {
        let validator = Validator::new(
            issuer.issuer(),
            Arc::new(config.client),
            config.validation,
            issuer.keys().cloned(),
        );
        Self {
            issuer,
            validator,
            keys: None,
            encrypter: None,
        }
    }

    /// The RP's own signing key, for `private_key_jwt` and signed request objects.
    pub fn with_client_keys(mut self, keys: ClientKeys) -> Self {
        self.keys = Some(Arc::new(keys));
        self
    }

    /// Decrypts encrypted ID Tokens and UserInfo responses.
    pub fn with_decrypter(mut self, decrypter: Arc<dyn JweDecrypter>) -> Self {
        self.validator = self.validator.with_decrypter(decrypter);
        self
    }

    /// Encrypts request objects to the OP.
    pub fn with_encrypter(mut self, encrypter: Arc<dyn JweEncrypter>) -> Self {
        self.encrypter = Some(encrypter);
        self
    }

    pub fn issuer(&self) -> &Issuer {
        &self.issuer
    }

    pub fn client(&self) -> &ClientConfig {
        self.validator.client()
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Builds the URL to send the user agent to, plus the state the callback needs.
    pub fn authorization_url(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<(Url, AuthorizationRequestState), NilaRpError> {
        request.build(&self.issuer.authorization_endpoint()?, self.client())
    }

    /// Builds a request object for `request`: signed per `request_object_signing_alg`
    /// and, when `request_object_encryption_alg` is registered, encrypted to the OP.
    #[instrument(skip(self, request), err)]
    pub async fn request_object(&self, request: &AuthorizationRequest) -> Result<String, NilaRpError> {
        let client = self.client();
        let claims = request.request_object_claims(client, self.issuer.issuer())?;
        let signed = sign_request_object(&claims, client, self.keys.as_deref())?;

        let Some(alg) = client.request_object_encryption_alg.as_deref() else {
            return Ok(signed);
        };
        let enc = client
            .request_object_encryption_enc
            .as_deref()
            .unwrap_or(DEFAULT_REQUEST_OBJECT_ENC);
        let encrypter = self.encrypter.as_ref().ok_or_else(|| {
            NilaRpError::Configuration("a JWE encrypter is required for encrypted request objects".to_string())
        })?;
        let keys = self
            .issuer
            .keys()
            .ok_or_else(|| NilaRpError::Configuration("issuer metadata has no jwks_uri".to_string()))?;
        let key_set = keys.current().await?;
        let recipient = key_set.resolve_for_encryption(alg).ok_or_else(|| TokenValidationError::NoMatchingKey {
            alg: alg.to_string(),
            kid: None,
        })?;
        debug!(alg, enc, kid = ?recipient.kid, "Encrypting request object");
        encrypter.encrypt(&signed, alg, enc, recipient)
    }

    /// Completes a login: checks `state`, surfaces error responses, validates every
    /// ID Token in the response and exchanges the code when there is one.
    ///
    /// `state` is consumed; a request state answers exactly one callback.
    #[instrument(skip_all, fields(response_type = %state.response_type), err)]
    pub async fn authorization_callback(
        &self,
        response: AuthorizationResponse,
        state: AuthorizationRequestState,
    ) -> Result<TokenSet, NilaRpError> {
        if response.state() != state.state.as_deref() {
            return Err(NilaRpError::StateMismatch {
                expected: state.state,
                got: response.state().map(str::to_string),
            });
        }
        let success = response.into_result()?;
        success.check_response_type(&state.response_type)?;

        let front_channel = match success.id_token.as_deref() {
            Some(id_token) => {
                let checks = IdTokenChecks::new(TokenSource::AuthorizationEndpoint)
                    .nonce(state.nonce.as_deref())
                    .max_age(state.max_age)
                    .code(success.code.as_deref())
                    .access_token(success.access_token.as_deref());
                Some(self.validator.validate_id_token(id_token, &checks).await?)
            }
            None => None,
        };

        let Some(code) = success.code.as_deref() else {
            info!("Implicit flow completed");
            return Ok(TokenSet {
                access_token: success.access_token,
                token_type: success.token_type,
                id_token: front_channel,
                refresh_token: None,
                expires_at: success
                    .expires_in
                    .map(|secs| expiry_from_now(i64::try_from(secs).unwrap_or(i64::MAX))),
                scope: success.scope,
                session_state: success.session_state,
            });
        };

        let params = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_string()),
            ("redirect_uri".to_string(), state.redirect_uri.clone()),
        ];
        let mut response = request_tokens(
            self.issuer.http_client(),
            &self.issuer.token_endpoint()?,
            self.client(),
            self.keys.as_deref(),
            params,
        )
        .await?;

        let id_token = response
            .id_token
            .take()
            .ok_or_else(|| NilaRpError::InvalidResponse("id_token not present in TokenSet".to_string()))?;
        let checks = IdTokenChecks::new(TokenSource::TokenEndpoint)
            .nonce(state.nonce.as_deref())
            .max_age(state.max_age)
            .access_token(response.access_token.as_deref());
        let back_channel = self.validator.validate_id_token(&id_token, &checks).await?;

        if let Some(front_channel) = &front_channel {
            ensure_same_subject(front_channel, &back_channel)?;
        }

        if response.access_token.is_none() {
            response.access_token = success.access_token;
        }
        info!(sub = %back_channel.claims().sub, "Authorization code flow completed");
        Ok(TokenSet::from_response(response, Some(back_channel)))
    }

    /// Uses the refresh token of `tokens` for a new token set.
    ///
    /// A refreshed ID Token must name the same subject as the one it replaces.
    #[instrument(skip_all, err)]
    pub async fn refresh(&self, tokens: &TokenSet) -> Result<TokenSet, NilaRpError> {
        let refresh_token = tokens.refresh_token.as_deref().ok_or_else(|| {
            NilaRpError::Configuration("refresh_token not present in TokenSet".to_string())
        })?;
        let params = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_string()),
        ];
        let mut response = request_tokens(
            self.issuer.http_client(),
            &self.issuer.token_endpoint()?,
            self.client(),
            self.keys.as_deref(),
            params,
        )
        .await?;

        let id_token = match response.id_token.take() {
            Some(id_token) => {
                let checks = IdTokenChecks::new(TokenSource::Refresh).access_token(response.access_token.as_deref());
                let validated = self.validator.validate_id_token(&id_token, &checks).await?;
                if let Some(previous) = &tokens.id_token {
                    ensure_same_subject(previous, &validated)?;
                }
                Some(validated)
            }
            None => None,
        };

        if response.refresh_token.is_none() {
            response.refresh_token = tokens.refresh_token.clone();
        }
        Ok(TokenSet::from_response(response, id_token))
    }

    /// Calls the UserInfo endpoint with the access token of `tokens`.
    pub async fn userinfo(&self, tokens: &TokenSet, options: UserInfoOptions) -> Result<UserInfo, NilaRpError> {
        userinfo::fetch_userinfo(&self.issuer, &self.validator, tokens, options).await
    }

    pub async fn unpack_aggregated_claims(&self, claims: &mut UserInfo) -> Result<(), NilaRpError> {
        userinfo::unpack_aggregated_claims(&self.validator, claims).await
    }

    pub async fn fetch_distributed_claims(
        &self,
        claims: &mut UserInfo,
        access_tokens: &HashMap<String, String>,
    ) -> Result<(), NilaRpError> {
        userinfo::fetch_distributed_claims(self.issuer.http_client(), &self.validator, claims, access_tokens).await
    }

    /// Validates an ID Token obtained outside [`RelyingParty::authorization_callback`].
    pub async fn validate_id_token(
        &self,
        token: &str,
        checks: &IdTokenChecks<'_>,
    ) -> Result<ValidatedIdToken, NilaRpError> {
        self.validator.validate_id_token(token, checks).await
    }
}

fn ensure_same_subject(expected: &ValidatedIdToken, got: &ValidatedIdToken) -> Result<(), TokenValidationError> {
    if expected.claims().sub != got.claims().sub {
        return Err(TokenValidationError::SubjectMismatch {
            expected: expected.claims().sub.clone(),
            got: got.claims().sub.clone(),
        });
    }
    Ok(())
}
