use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use std::fmt;
use tokio::sync::Mutex;

use super::exchange::{self, Grant};
use super::store::{self, SecretStore, REFRESH_TOKEN_KEY};
use super::types::{AuthEndpoints, Credential, Token};
use crate::error::{ClientError, Result};

/// Timeout for every auth-class call
pub const AUTH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Token lifetime and refresh margin
#[derive(Debug, Clone, Copy)]
pub struct TokenSettings {
    /// Forward validity assigned at issuance (default 35 minutes)
    pub lifetime: Duration,
    /// Tokens closer than this to expiry are renewed before use (default 5 minutes)
    pub refresh_margin: Duration,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            lifetime: Duration::minutes(35),
            refresh_margin: Duration::minutes(5),
        }
    }
}

/// Token lifecycle manager
/// Owns the live token; every read-or-renew runs under one lock so two
/// callers can never race a refresh or a refresh-secret rotation.
pub struct TokenManager {
    /// Long-lived credential material
    credential: Credential,

    /// Current token, if any
    state: Mutex<Option<Token>>,

    /// HTTP client for auth requests
    client: Client,

    endpoints: AuthEndpoints,

    settings: TokenSettings,
}

impl TokenManager {
    /// Create a new TokenManager; no network traffic until the first token request
    pub fn new(
        credential: Credential,
        endpoints: AuthEndpoints,
        settings: TokenSettings,
    ) -> Result<Self> {
        if settings.refresh_margin >= settings.lifetime {
            return Err(ClientError::Config(format!(
                "token refresh margin ({}s) must be shorter than token lifetime ({}s)",
                settings.refresh_margin.num_seconds(),
                settings.lifetime.num_seconds()
            )));
        }

        let client = Client::builder()
            .timeout(AUTH_TIMEOUT)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            credential,
            state: Mutex::new(None),
            client,
            endpoints,
            settings,
        })
    }

    /// Create a TokenManager holding a ready token (no auth endpoints reachable)
    #[cfg(any(test, feature = "test-utils"))]
    pub fn new_for_testing(token_value: &str) -> Self {
        let token = Token::new(token_value, Utc::now() + Duration::hours(1));
        Self {
            credential: Credential::basic("test-user", "test-password"),
            state: Mutex::new(Some(token)),
            client: Client::new(),
            endpoints: AuthEndpoints {
                auth_url: "http://127.0.0.1:9".to_string(),
                oauth_url: "http://127.0.0.1:9".to_string(),
            },
            settings: TokenSettings::default(),
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Get a token valid for at least the refresh margin, renewing if necessary
    pub async fn current_token(&self) -> Result<Token> {
        let mut state = self.state.lock().await;

        if let Some(token) = state.as_ref() {
            if token.is_valid_for(self.settings.refresh_margin) {
                return Ok(token.clone());
            }
        }

        // The old token stays cached until a replacement is issued
        let renewed = match state.as_ref() {
            Some(token) if !token.is_expired() && self.credential.supports_refresh() => {
                self.refresh_or_exchange(token).await?
            }
            _ => self.exchange().await?,
        };

        *state = Some(renewed.clone());
        Ok(renewed)
    }

    /// Authorization header value for the current token
    pub async fn authorization(&self) -> Result<String> {
        Ok(self.current_token().await?.authorization())
    }

    /// Renew now, regardless of remaining validity
    pub async fn refresh(&self) -> Result<Token> {
        let mut state = self.state.lock().await;

        let renewed = match state.as_ref() {
            Some(token) if !token.is_expired() && self.credential.supports_refresh() => {
                self.refresh_or_exchange(token).await?
            }
            _ => self.exchange().await?,
        };

        *state = Some(renewed.clone());
        Ok(renewed)
    }

    /// Drop the cached token; the next request performs a full exchange
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        *state = None;
    }

    /// Expiry of the cached token
    pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.as_ref().map(Token::expires_at)
    }

    async fn refresh_or_exchange(&self, token: &Token) -> Result<Token> {
        let issued_at = Utc::now();
        match exchange::refresh_token(&self.client, &self.endpoints, token.value()).await {
            Ok(grant) => {
                let renewed = self.issue(grant, issued_at);
                tracing::info!(
                    "Token refreshed, expires: {}",
                    renewed.expires_at().to_rfc3339()
                );
                Ok(renewed)
            }
            Err(e) => {
                tracing::warn!("Token refresh failed ({}), re-authenticating", e);
                self.exchange().await
            }
        }
    }

    /// Full exchange with the configured credential, then validation
    async fn exchange(&self) -> Result<Token> {
        let issued_at = Utc::now();

        let grant = match &self.credential {
            Credential::Basic { username, password } => {
                exchange::exchange_basic(&self.client, &self.endpoints, username, password).await?
            }
            Credential::Certificate {
                certificate_pem,
                private_key_pem,
            } => {
                exchange::exchange_certificate(
                    &self.client,
                    &self.endpoints,
                    certificate_pem,
                    private_key_pem,
                )
                .await?
            }
            Credential::RotatingRefreshSecret { client_id, store } => {
                self.rotate(client_id, store.as_ref()).await?
            }
        };

        exchange::validate(&self.client, &self.endpoints, &grant.value).await?;

        let token = self.issue(grant, issued_at);
        tracing::info!(
            method = ?self.credential.method(),
            "Authenticated, token expires: {}",
            token.expires_at().to_rfc3339()
        );
        Ok(token)
    }

    /// Redeem the refresh secret and persist its successor before anything
    /// else happens with the new access token
    async fn rotate(
        &self,
        client_id: &str,
        store: &dyn SecretStore,
    ) -> Result<Grant> {
        let secret = store::load_refresh_secret(store)?;

        let data =
            exchange::exchange_refresh_secret(&self.client, &self.endpoints, client_id, &secret)
                .await?;

        match data.refresh_token.as_deref() {
            Some(next) if !next.is_empty() => {
                store.set(REFRESH_TOKEN_KEY, next).map_err(|e| {
                    tracing::error!(
                        "Rotated refresh token could not be persisted: {}",
                        e
                    );
                    e
                })?;
                tracing::debug!("Rotated refresh token persisted");
            }
            _ => tracing::warn!("OAuth response carried no new refresh token; keeping the stored one"),
        }

        Ok(Grant {
            value: data.access_token,
            expires_in: data.expires_in,
        })
    }

    /// Wrap a validated grant with its forward expiry
    fn issue(&self, grant: Grant, issued_at: DateTime<Utc>) -> Token {
        Token::new(grant.value, issued_at + self.lifetime_for(grant.expires_in))
    }

    /// A server-stated lifetime only shortens the configured one, and only
    /// while it still leaves room beyond the refresh margin
    fn lifetime_for(&self, server_secs: Option<u64>) -> Duration {
        let Some(secs) = server_secs else {
            return self.settings.lifetime;
        };

        match i64::try_from(secs).ok().and_then(Duration::try_seconds) {
            Some(lifetime) if lifetime >= self.settings.lifetime => self.settings.lifetime,
            Some(lifetime) if lifetime > self.settings.refresh_margin => lifetime,
            _ => {
                tracing::warn!(
                    expires_in = secs,
                    refresh_margin = self.settings.refresh_margin.num_seconds(),
                    "Ignoring server token lifetime outside the refresh window"
                );
                self.settings.lifetime
            }
        }
    }
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("credential", &self.credential)
            .field("endpoints", &self.endpoints)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
