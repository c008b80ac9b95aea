// src/response.rs

use crate::error::NilaRpError;
use std::collections::BTreeMap;
use tracing::{debug, warn};
use url::Url;

/// The parameters each `response_type` returns from the authorization endpoint.
pub const RESPONSE_TYPE_PARAMS: [(&str, &[&str]); 7] = [
    ("code", &["code"]),
    ("id_token", &["id_token"]),
    ("id_token token", &["id_token", "access_token"]),
    ("code id_token", &["code", "id_token"]),
    ("code token", &["code", "access_token"]),
    ("code id_token token", &["code", "id_token", "access_token"]),
    ("none", &[]),
];

/// Parameters of `RESPONSE_TYPE_PARAMS` that a response may carry.
const RESPONSE_ARTIFACTS: [&str; 3] = ["code", "id_token", "access_token"];

/// Looks up the parameters `response_type` must return. Word order does not matter.
pub fn expected_params(response_type: &str) -> Option<&'static [&'static str]> {
    let wanted = normalize(response_type);
    RESPONSE_TYPE_PARAMS
        .iter()
        .find(|(rt, _)| normalize(rt) == wanted)
        .map(|(_, params)| *params)
}

fn normalize(response_type: &str) -> Vec<&str> {
    let mut words: Vec<&str> = response_type.split_whitespace().collect();
    words.sort_unstable();
    words
}

/// Raw parameters delivered to the redirect URI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams(BTreeMap<String, String>);

impl CallbackParams {
    /// Parses the redirect the user agent followed.
    ///
    /// Parameters come from the fragment when there is one (implicit and hybrid
    /// flows), otherwise from the query string. Relative URLs are accepted.
    pub fn from_url(redirect: &str) -> Result<Self, NilaRpError> {
        let url = match Url::parse(redirect) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse("http://localhost/")?.join(redirect)?,
            Err(e) => return Err(e.into()),
        };
        let source = match url.fragment() {
            Some(fragment) if !fragment.is_empty() => fragment,
            _ => url.query().unwrap_or_default(),
        };
        Ok(Self(
            url::form_urlencoded::parse(source.as_bytes())
                .into_owned()
                .collect(),
        ))
    }

    /// Parses an `application/x-www-form-urlencoded` body (`response_mode=form_post`).
    pub fn from_form_body(body: &str) -> Result<Self, NilaRpError> {
        let params: Vec<(String, String)> = serde_urlencoded::from_str(body)
            .map_err(|e| NilaRpError::InvalidResponse(format!("invalid form body: {e}")))?;
        Ok(Self(params.into_iter().collect()))
    }

    /// Extracts the hidden inputs of an OP's auto-submitting `form_post` page.
    pub fn from_form_post_html(html: &str) -> Self {
        let mut params = BTreeMap::new();
        for tag in html.split('<').skip(1) {
            let Some(tag) = tag.strip_prefix("input").or_else(|| tag.strip_prefix("INPUT")) else {
                continue;
            };
            let tag = tag.split('>').next().unwrap_or_default();
            if let (Some(name), Some(value)) = (attribute(tag, "name"), attribute(tag, "value")) {
                params.insert(decode_entities(&name), decode_entities(&value));
            }
        }
        debug!(count = params.len(), "Parsed form_post inputs");
        Self(params)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl FromIterator<(String, String)> for CallbackParams {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Value of `name="..."` (or single-quoted) inside a tag body.
fn attribute(tag: &str, name: &str) -> Option<String> {
    let mut rest = tag;
    while let Some(pos) = rest.find(name) {
        let preceded_by_space = rest[..pos].chars().last().map_or(true, char::is_whitespace);
        let after = rest[pos + name.len()..].trim_start();
        if let (true, Some(after)) = (preceded_by_space, after.strip_prefix('=')) {
            let after = after.trim_start();
            let quote = after.chars().next()?;
            if quote == '"' || quote == '\'' {
                let value = &after[1..];
                return value.find(quote).map(|end| value[..end].to_string());
            }
            return Some(after.split_whitespace().next().unwrap_or_default().to_string());
        }
        rest = &rest[pos + name.len()..];
    }
    None
}

fn decode_entities(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        rest = &rest[start..];
        let Some(end) = rest.find(';') else { break };
        let entity = &rest[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// A successful authorization response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationSuccess {
    pub code: Option<String>,
    pub id_token: Option<String>,
    pub access_token: Option<String>,
    pub token_type: Option<String>,
    pub expires_in: Option<u64>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub session_state: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl AuthorizationSuccess {
    /// Checks that exactly the artifacts `response_type` promises are present.
    pub fn check_response_type(&self, response_type: &str) -> Result<(), NilaRpError> {
        let expected = expected_params(response_type).ok_or_else(|| {
            NilaRpError::Configuration(format!("unsupported response_type: {response_type}"))
        })?;
        for name in RESPONSE_ARTIFACTS {
            let present = self.artifact(name).is_some();
            match (expected.contains(&name), present) {
                (true, false) => {
                    return Err(NilaRpError::InvalidResponse(format!(
                        "{name} missing from response"
                    )))
                }
                (false, true) => {
                    return Err(NilaRpError::InvalidResponse(format!(
                        "unexpected {name} present in response"
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn artifact(&self, name: &str) -> Option<&str> {
        match name {
            "code" => self.code.as_deref(),
            "id_token" => self.id_token.as_deref(),
            "access_token" => self.access_token.as_deref(),
            _ => None,
        }
    }
}

/// An authorization error response (`error=login_required` and friends).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationErrorResponse {
    pub error: String,
    pub error_description: Option<String>,
    pub error_uri: Option<String>,
    pub state: Option<String>,
}

/// What the OP sent back to the redirect URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationResponse {
    Success(AuthorizationSuccess),
    Error(AuthorizationErrorResponse),
}

impl AuthorizationResponse {
    pub fn state(&self) -> Option<&str> {
        match self {
            AuthorizationResponse::Success(s) => s.state.as_deref(),
            AuthorizationResponse::Error(e) => e.state.as_deref(),
        }
    }

    /// Surfaces an error response as `NilaRpError::Authorization`, and an
    /// unparseable `expires_in` as `NilaRpError::InvalidResponse`.
    pub fn into_result(self) -> Result<AuthorizationSuccess, NilaRpError> {
        match self {
            AuthorizationResponse::Success(success) => match success.extra.get("expires_in") {
                Some(raw) => Err(NilaRpError::InvalidResponse(format!("invalid expires_in: {raw}"))),
                None => Ok(success),
            },
            AuthorizationResponse::Error(e) => Err(NilaRpError::Authorization {
                error: e.error,
                description: e.error_description,
                state: e.state,
            }),
        }
    }
}

impl From<CallbackParams> for AuthorizationResponse {
    fn from(params: CallbackParams) -> Self {
        let mut params = params.into_inner();
        if let Some(error) = params.remove("error") {
            return AuthorizationResponse::Error(AuthorizationErrorResponse {
                error,
                error_description: params.remove("error_description"),
                error_uri: params.remove("error_uri"),
                state: params.remove("state"),
            });
        }
        let expires_in = params.remove("expires_in").and_then(|raw| match raw.parse() {
            Ok(secs) => Some(secs),
            Err(_) => {
                warn!(expires_in = %raw, "expires_in is not a non-negative integer");
                // Kept aside so into_result can reject the response.
                params.insert("expires_in".to_string(), raw);
                None
            }
        });
        AuthorizationResponse::Success(AuthorizationSuccess {
            code: params.remove("code"),
            id_token: params.remove("id_token"),
            access_token: params.remove("access_token"),
            token_type: params.remove("token_type"),
            expires_in,
            scope: params.remove("scope"),
            state: params.remove("state"),
            session_state: params.remove("session_state"),
            extra: params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn code_is_read_from_query() {
        let params = CallbackParams::from_url("https://rp.example.com/cb?code=abc123&state=xyz").unwrap();
        assert_eq!(params.get("code"), Some("abc123"));

        let AuthorizationResponse::Success(success) = AuthorizationResponse::from(params) else {
            panic!("expected a success response");
        };
        assert_eq!(success.code.as_deref(), Some("abc123"));
        assert_eq!(success.id_token, None);
        assert!(success.check_response_type("code").is_ok());
    }

    #[test]
    fn fragment_takes_precedence_over_query() {
        let params =
            CallbackParams::from_url("/cb?ignored=1#id_token=eyJ.x.y&access_token=at&token_type=Bearer&expires_in=3600")
                .unwrap();
        assert!(!params.contains("ignored"));
        let success = AuthorizationResponse::from(params).into_result().unwrap();
        assert_eq!(success.expires_in, Some(3600));
        assert!(success.check_response_type("token id_token").is_ok());
        assert!(success.check_response_type("code id_token token").is_err());
    }

    #[test]
    fn error_response_surfaces_as_authorization_error() {
        let params = CallbackParams::from_url(
            "https://rp.example.com/cb?error=login_required&error_description=End-User+is+not+logged+in&state=s1",
        )
        .unwrap();
        let response = AuthorizationResponse::from(params);
        assert_eq!(response.state(), Some("s1"));
        let err = response.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
        assert_eq!(err.to_string(), "login_required (End-User is not logged in)");
    }

    #[test]
    fn unexpected_artifacts_are_rejected() {
        let success = AuthorizationSuccess {
            code: Some("abc".to_string()),
            id_token: Some("eyJ".to_string()),
            ..Default::default()
        };
        let err = success.check_response_type("code").unwrap_err();
        assert_eq!(err.to_string(), "Invalid response: unexpected id_token present in response");
        assert!(success.check_response_type("id_token code").is_ok());
    }

    #[test]
    fn form_post_page_and_body_are_parsed() {
        let html = r#"<html><body onload="document.forms[0].submit()">
            <form method="post" action="https://rp.example.com/cb">
              <input type="hidden" name="code" value="Spl&amp;x"/>
              <input type="hidden" name='state' value='a&#x2F;b'/>
            </form></body></html>"#;
        let params = CallbackParams::from_form_post_html(html);
        assert_eq!(params.get("code"), Some("Spl&x"));
        assert_eq!(params.get("state"), Some("a/b"));

        let body = CallbackParams::from_form_body("code=Spl%26x&state=a%2Fb").unwrap();
        assert_eq!(body, params);
    }

    #[test]
    fn every_profile_is_known() {
        for (response_type, params) in RESPONSE_TYPE_PARAMS {
            assert_eq!(expected_params(response_type), Some(params));
        }
        assert_eq!(expected_params("token id_token"), Some(&["id_token", "access_token"][..]));
        assert_eq!(expected_params("token"), None);
    }

    #[test]
    fn unparseable_expires_in_is_rejected() {
        let params = CallbackParams::from_url("https://rp.example.com/cb?code=abc&expires_in=soon").unwrap();
        let response = AuthorizationResponse::from(params);
        let err = response.clone().into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidResponse);
        assert_eq!(err.to_string(), "Invalid response: invalid expires_in: soon");

        let params = CallbackParams::from_url("https://rp.example.com/cb?code=abc&expires_in=3600").unwrap();
        let success = AuthorizationResponse::from(params).into_result().unwrap();
        assert_eq!(success.expires_in, Some(3600));
        assert!(success.extra.is_empty());
    }
}
