//! OpenID Connect identity provider client.
//!
//! Resolves the provider endpoints from its discovery document and maps the
//! userinfo claims onto a [`UserProfile`]. The token exchange itself is left
//! to the caller; this client only needs the resulting access token.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::{ArchCiError, Result};

/// Scope requested on the authorization redirect.
pub const OPENID_SCOPE: &str = "openid";

/// Endpoints advertised by an OpenID discovery document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenIdDiscovery {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
}

/// Identity of a signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub email: String,
    pub full_name: String,
    pub username: String,
}

/// Map userinfo claims to a profile. `email`, `name` and `username` are all
/// required.
pub fn profile_from_claims(claims: &Value) -> Result<UserProfile> {
    let claim = |key: &str| {
        claims
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ArchCiError::Identity(format!("userinfo response lacks `{key}`")))
    };
    Ok(UserProfile {
        email: claim("email")?,
        full_name: claim("name")?,
        username: claim("username")?,
    })
}

/// Client bound to one provider.
#[derive(Debug, Clone)]
pub struct OpenIdClient {
    http: reqwest::Client,
    endpoints: OpenIdDiscovery,
}

impl OpenIdClient {
    /// Fetch the discovery document at `configuration_uri`.
    pub async fn discover(configuration_uri: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("archci/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ArchCiError::Identity(format!("failed to create HTTP client: {e}")))?;

        let endpoints = http
            .get(configuration_uri)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ArchCiError::Identity(format!("discovery request failed: {e}")))?
            .json::<OpenIdDiscovery>()
            .await
            .map_err(|e| ArchCiError::Identity(format!("bad discovery document: {e}")))?;
        debug!(userinfo = %endpoints.userinfo_endpoint, "openid endpoints discovered");

        Ok(Self { http, endpoints })
    }

    /// Client for already-known endpoints.
    pub fn with_endpoints(endpoints: OpenIdDiscovery) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoints,
        }
    }

    pub fn endpoints(&self) -> &OpenIdDiscovery {
        &self.endpoints
    }

    /// Authorization redirect for the code flow.
    pub fn authorization_url(&self, client_id: &str, redirect_uri: &str) -> Result<Url> {
        Url::parse_with_params(
            &self.endpoints.authorization_endpoint,
            &[
                ("client_id", client_id),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", OPENID_SCOPE),
            ],
        )
        .map_err(|e| ArchCiError::Identity(format!("bad authorization endpoint: {e}")))
    }

    /// Query the userinfo endpoint with a bearer `access_token`.
    pub async fn user_info(&self, access_token: &str) -> Result<UserProfile> {
        let claims = self
            .http
            .get(&self.endpoints.userinfo_endpoint)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ArchCiError::Identity(format!("userinfo request failed: {e}")))?
            .json::<Value>()
            .await
            .map_err(|e| ArchCiError::Identity(format!("bad userinfo response: {e}")))?;
        profile_from_claims(&claims)
    }
}
