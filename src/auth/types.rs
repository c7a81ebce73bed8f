// Authentication types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::store::SecretStore;

/// Scheme prefix Anaplan expects in the Authorization header
pub const AUTH_SCHEME: &str = "AnaplanAuthToken";

pub const DEFAULT_AUTH_URL: &str = "https://auth.anaplan.com";
pub const DEFAULT_OAUTH_URL: &str = "https://us1a.app.anaplan.com";

/// Base URLs for the authentication services
#[derive(Debug, Clone)]
pub struct AuthEndpoints {
    /// Token service (`/token/authenticate`, `/token/validate`, `/token/refresh`)
    pub auth_url: String,
    /// OAuth service (`/oauth/token`, `/oauth/device/code`)
    pub oauth_url: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            auth_url: DEFAULT_AUTH_URL.to_string(),
            oauth_url: DEFAULT_OAUTH_URL.to_string(),
        }
    }
}

impl AuthEndpoints {
    pub(crate) fn auth(&self, path: &str) -> String {
        format!("{}{}", self.auth_url.trim_end_matches('/'), path)
    }

    pub(crate) fn oauth(&self, path: &str) -> String {
        format!("{}{}", self.oauth_url.trim_end_matches('/'), path)
    }
}

/// Type of authentication mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Username and password
    Basic,

    /// CA certificate plus private key signature
    Certificate,

    /// OAuth device client with rotating refresh token
    OAuth,
}

impl std::str::FromStr for AuthMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "basic" => Ok(AuthMethod::Basic),
            "certificate" | "cert" => Ok(AuthMethod::Certificate),
            "oauth" | "oauth_refresh" => Ok(AuthMethod::OAuth),
            other => Err(format!(
                "unknown auth method '{}' (expected basic, certificate or oauth)",
                other
            )),
        }
    }
}

/// Raw, long-lived credential material
#[derive(Clone)]
pub enum Credential {
    Basic {
        username: String,
        password: String,
    },

    Certificate {
        /// PEM encoded public certificate
        certificate_pem: String,
        /// PEM encoded RSA private key (PKCS#8 or PKCS#1)
        private_key_pem: String,
    },

    /// The refresh secret itself lives in `store`; it is replaced on every exchange
    RotatingRefreshSecret {
        client_id: String,
        store: Arc<dyn SecretStore>,
    },
}

impl Credential {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn method(&self) -> AuthMethod {
        match self {
            Credential::Basic { .. } => AuthMethod::Basic,
            Credential::Certificate { .. } => AuthMethod::Certificate,
            Credential::RotatingRefreshSecret { .. } => AuthMethod::OAuth,
        }
    }

    /// Whether a still-valid token can be refreshed via `/token/refresh`
    pub fn supports_refresh(&self) -> bool {
        !matches!(self, Credential::RotatingRefreshSecret { .. })
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credential::Certificate { .. } => f
                .debug_struct("Certificate")
                .field("private_key_pem", &"<redacted>")
                .finish_non_exhaustive(),
            Credential::RotatingRefreshSecret { client_id, .. } => f
                .debug_struct("RotatingRefreshSecret")
                .field("client_id", client_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Bearer token with its absolute expiry
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    value: String,
    expires_at: DateTime<Utc>,
}

impl Token {
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    /// Raw token value, without the scheme prefix
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Full Authorization header value
    pub fn authorization(&self) -> String {
        format!("{} {}", AUTH_SCHEME, self.value)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// True when the token stays valid for at least `margin` from now
    pub fn is_valid_for(&self, margin: Duration) -> bool {
        Utc::now() + margin < self.expires_at
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview: String = self.value.chars().take(6).collect();
        f.debug_struct("Token")
            .field("value", &format!("{}...", preview))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// `tokenInfo` block of the token service responses
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    pub token_value: String,
    /// Epoch milliseconds
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl TokenInfo {
    /// Whole seconds between `now` and `expiresAt`; None when absent or already past
    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> Option<u64> {
        let remaining_ms = self.expires_at?.checked_sub(now.timestamp_millis())?;
        u64::try_from(remaining_ms / 1000).ok().filter(|secs| *secs > 0)
    }
}

/// Response of `/token/authenticate` and `/token/refresh`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub token_info: Option<TokenInfo>,
}

/// Response of `/token/validate`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub status_message: Option<String>,
}

/// Certificate authentication body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateAuthRequest {
    pub encoded_data: String,
    pub encoded_signed_data: String,
}

/// OAuth refresh-token grant
#[derive(Debug, Serialize)]
pub struct OAuthRefreshRequest<'a> {
    pub grant_type: &'a str,
    pub client_id: &'a str,
    pub refresh_token: &'a str,
}

/// OAuth token response (refresh and device grants)
#[derive(Debug, Deserialize)]
pub struct OAuthTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// OAuth error body
#[derive(Debug, Deserialize)]
pub struct OAuthErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}
