// OAuth device-code flow
// Obtains the first refresh token for the rotating refresh secret credential

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::exchange::{oauth_error, read_body};
use super::store::{SecretStore, CLIENT_ID_KEY, REFRESH_TOKEN_KEY};
use super::types::{AuthEndpoints, OAuthErrorResponse, OAuthTokenResponse};
use crate::error::{ClientError, Result};

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEVICE_SCOPE: &str = "openid profile email offline_access";

/// Fallbacks when the server omits them
const DEFAULT_INTERVAL_SECS: u64 = 5;
const DEFAULT_EXPIRES_IN_SECS: u64 = 60;

#[derive(Serialize)]
struct DeviceCodeRequest<'a> {
    client_id: &'a str,
    scope: &'a str,
}

#[derive(Serialize)]
struct DeviceTokenRequest<'a> {
    grant_type: &'a str,
    client_id: &'a str,
    device_code: &'a str,
}

/// Device authorization issued by the server
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub interval: Option<u64>,
}

/// Start the device flow for `client_id`
pub async fn request_device_code(
    client: &Client,
    endpoints: &AuthEndpoints,
    client_id: &str,
) -> Result<DeviceCode> {
    let response = client
        .post(endpoints.oauth("/oauth/device/code"))
        .header("Content-Type", "application/json")
        .json(&DeviceCodeRequest {
            client_id,
            scope: DEVICE_SCOPE,
        })
        .send()
        .await
        .map_err(|e| ClientError::from_reqwest(&e))?;

    let status = response.status();
    let text = read_body(response).await?;
    if !status.is_success() {
        return Err(oauth_error(status.as_u16(), &text));
    }

    serde_json::from_str(&text)
        .map_err(|e| ClientError::Authentication(format!("unreadable device code response: {}", e)))
}

/// Wait for the user to approve `code`, then store `client_id` and the
/// issued refresh token
pub async fn poll_device_token(
    client: &Client,
    endpoints: &AuthEndpoints,
    client_id: &str,
    code: &DeviceCode,
    store: &dyn SecretStore,
) -> Result<()> {
    let mut interval = Duration::from_secs(code.interval.unwrap_or(DEFAULT_INTERVAL_SECS));
    let expires_in = Duration::from_secs(code.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS));
    let deadline = tokio::time::Instant::now() + expires_in;

    let request = DeviceTokenRequest {
        grant_type: DEVICE_CODE_GRANT,
        client_id,
        device_code: &code.device_code,
    };

    loop {
        let response = client
            .post(endpoints.oauth("/oauth/token"))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(&e))?;

        let status = response.status();
        let text = read_body(response).await?;

        if status.is_success() {
            let data: OAuthTokenResponse = serde_json::from_str(&text).map_err(|e| {
                ClientError::Authentication(format!("unreadable OAuth response: {}", e))
            })?;
            let refresh_token = data.refresh_token.filter(|t| !t.is_empty()).ok_or_else(|| {
                ClientError::Authentication(
                    "device grant returned no refresh token (is offline_access enabled?)"
                        .to_string(),
                )
            })?;

            store.set(CLIENT_ID_KEY, client_id)?;
            store.set(REFRESH_TOKEN_KEY, &refresh_token)?;
            tracing::info!("Device authorized, refresh token stored");
            return Ok(());
        }

        let pending = serde_json::from_str::<OAuthErrorResponse>(&text)
            .map(|e| e.error)
            .unwrap_or_default();

        match pending.as_str() {
            "authorization_pending" => {}
            "slow_down" => interval += Duration::from_secs(DEFAULT_INTERVAL_SECS),
            _ => return Err(oauth_error(status.as_u16(), &text)),
        }

        if tokio::time::Instant::now() + interval >= deadline {
            return Err(ClientError::Authentication(
                "device code expired before it was authorized".to_string(),
            ));
        }

        tracing::debug!("Authorization pending, polling again in {:?}", interval);
        tokio::time::sleep(interval).await;
    }
}
