// Token exchange, validation and refresh against the Anaplan auth services

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use reqwest::{Client, Response};

use super::credentials::{canonicalize_certificate, certificate_auth_body};
use super::types::{
    AuthEndpoints, AuthenticateResponse, OAuthErrorResponse, OAuthRefreshRequest,
    OAuthTokenResponse, ValidateResponse, AUTH_SCHEME,
};
use crate::error::{ClientError, Result};

const SUCCESS: &str = "SUCCESS";
const TOKEN_VALIDATED: &str = "Token validated";

/// Raw token value issued by the token service
#[derive(Debug)]
pub struct Grant {
    pub value: String,
    /// Seconds until the server expires the token, when it says so
    pub expires_in: Option<u64>,
}

/// Exchange a username/password pair for a token
pub async fn exchange_basic(
    client: &Client,
    endpoints: &AuthEndpoints,
    username: &str,
    password: &str,
) -> Result<Grant> {
    tracing::info!("Authenticating with basic credentials...");

    let encoded = BASE64.encode(format!("{}:{}", username, password));
    let response = client
        .post(endpoints.auth("/token/authenticate"))
        .header("Authorization", format!("Basic {}", encoded))
        .send()
        .await
        .map_err(|e| ClientError::from_reqwest(&e))?;

    grant_from(response, "authenticate").await
}

/// Exchange a certificate plus signed nonce for a token
pub async fn exchange_certificate(
    client: &Client,
    endpoints: &AuthEndpoints,
    certificate_pem: &str,
    private_key_pem: &str,
) -> Result<Grant> {
    tracing::info!("Authenticating with CA certificate...");

    let body = certificate_auth_body(private_key_pem)?;
    let certificate = canonicalize_certificate(certificate_pem);

    let response = client
        .post(endpoints.auth("/token/authenticate"))
        .header("Authorization", format!("CACertificate {}", certificate))
        .json(&body)
        .send()
        .await
        .map_err(|e| ClientError::from_reqwest(&e))?;

    grant_from(response, "authenticate").await
}

/// Exchange a still-valid token for a new one
pub async fn refresh_token(
    client: &Client,
    endpoints: &AuthEndpoints,
    token_value: &str,
) -> Result<Grant> {
    tracing::debug!("Refreshing Anaplan token...");

    let response = client
        .post(endpoints.auth("/token/refresh"))
        .header("Authorization", format!("{} {}", AUTH_SCHEME, token_value))
        .send()
        .await
        .map_err(|e| ClientError::from_reqwest(&e))?;

    grant_from(response, "refresh").await
}

/// Check a raw token against the validation service
pub async fn validate(client: &Client, endpoints: &AuthEndpoints, token_value: &str) -> Result<()> {
    let response = client
        .get(endpoints.auth("/token/validate"))
        .header("Authorization", format!("{} {}", AUTH_SCHEME, token_value))
        .send()
        .await
        .map_err(|e| ClientError::from_reqwest(&e))?;

    let status = response.status();
    let text = read_body(response).await?;

    if !status.is_success() {
        tracing::error!(status = status.as_u16(), "Token validation rejected");
        return Err(ClientError::Authentication(format!(
            "token validation failed: {} - {}",
            status, text
        )));
    }

    let body: ValidateResponse = serde_json::from_str(&text).map_err(|e| {
        ClientError::Authentication(format!("unreadable validation response: {}", e))
    })?;

    if validation_passed(&body) {
        Ok(())
    } else {
        tracing::error!(
            status = ?body.status,
            status_message = ?body.status_message,
            "Token validation rejected"
        );
        Err(ClientError::Authentication(format!(
            "token validation failed: {}",
            body.status_message
                .or(body.status)
                .unwrap_or_else(|| "unknown status".to_string())
        )))
    }
}

/// Redeem the rotating refresh secret. The response carries the next secret.
pub async fn exchange_refresh_secret(
    client: &Client,
    endpoints: &AuthEndpoints,
    client_id: &str,
    refresh_secret: &str,
) -> Result<OAuthTokenResponse> {
    tracing::info!("Exchanging OAuth refresh token...");

    let request = OAuthRefreshRequest {
        grant_type: "refresh_token",
        client_id,
        refresh_token: refresh_secret,
    };

    let response = client
        .post(endpoints.oauth("/oauth/token"))
        .header("Content-Type", "application/json")
        .json(&request)
        .send()
        .await
        .map_err(|e| ClientError::from_reqwest(&e))?;

    let status = response.status();
    let text = read_body(response).await?;

    if !status.is_success() {
        return Err(oauth_error(status.as_u16(), &text));
    }

    let data: OAuthTokenResponse = serde_json::from_str(&text)
        .map_err(|e| ClientError::Authentication(format!("unreadable OAuth response: {}", e)))?;

    if data.access_token.is_empty() {
        return Err(ClientError::Authentication(
            "OAuth response does not contain access_token".to_string(),
        ));
    }

    Ok(data)
}

/// Map an OAuth error body to the error taxonomy
pub(crate) fn oauth_error(status: u16, text: &str) -> ClientError {
    match serde_json::from_str::<OAuthErrorResponse>(text) {
        Ok(err) if status == 400 || status == 401 || status == 403 => {
            tracing::error!(
                error = %err.error,
                description = ?err.error_description,
                "OAuth grant rejected"
            );
            ClientError::Authentication(format!(
                "{}{}",
                err.error,
                err.error_description
                    .map(|d| format!(": {}", d))
                    .unwrap_or_default()
            ))
        }
        _ if status == 401 || status == 403 => {
            ClientError::Authentication(format!("{} - {}", status, text))
        }
        _ => ClientError::Api {
            status,
            message: text.to_string(),
        },
    }
}

/// A validation body passes when every field it carries reports success
fn validation_passed(body: &ValidateResponse) -> bool {
    if body.status.is_none() && body.status_message.is_none() {
        return false;
    }
    let status_ok = body.status.as_deref().map_or(true, |s| s == SUCCESS);
    let message_ok = body
        .status_message
        .as_deref()
        .map_or(true, |m| m == TOKEN_VALIDATED || body.status.as_deref() == Some(SUCCESS));
    status_ok && message_ok
}

/// Body text; a failed read is a transport failure, never a credential rejection
pub(crate) async fn read_body(response: Response) -> Result<String> {
    response.text().await.map_err(|e| ClientError::from_reqwest(&e))
}

/// Extract `tokenInfo`, rejecting non-SUCCESS statuses
async fn grant_from(response: Response, step: &str) -> Result<Grant> {
    let status = response.status();
    let text = read_body(response).await?;
    let body = serde_json::from_str::<AuthenticateResponse>(&text).ok();

    if let Some(ref body) = body {
        if let Some(ref auth_status) = body.status {
            if auth_status != SUCCESS {
                tracing::error!(step = step, status = %auth_status, "Credential rejected");
                return Err(ClientError::Authentication(format!(
                    "{} rejected: {}{}",
                    step,
                    auth_status,
                    body.status_message
                        .as_ref()
                        .map(|m| format!(" ({})", m))
                        .unwrap_or_default()
                )));
            }
        }
    }

    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(ClientError::Authentication(format!(
            "{} rejected: {} - {}",
            step, status, text
        )));
    }

    if !status.is_success() {
        return Err(ClientError::Api {
            status: status.as_u16(),
            message: text,
        });
    }

    body.and_then(|b| b.token_info)
        .filter(|info| !info.token_value.is_empty())
        .map(|info| Grant {
            expires_in: info.seconds_remaining(Utc::now()),
            value: info.token_value,
        })
        .ok_or_else(|| {
            ClientError::Authentication(format!("{} response does not contain tokenInfo", step))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use std::time::Duration;

    fn endpoints(url: &str) -> AuthEndpoints {
        AuthEndpoints {
            auth_url: url.to_string(),
            oauth_url: url.to_string(),
        }
    }

    fn client() -> Client {
        Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap()
    }

    #[test]
    fn test_validation_rules() {
        let ok = ValidateResponse {
            status: Some("SUCCESS".to_string()),
            status_message: None,
        };
        assert!(validation_passed(&ok));

        let ok = ValidateResponse {
            status: None,
            status_message: Some("Token validated".to_string()),
        };
        assert!(validation_passed(&ok));

        let bad = ValidateResponse {
            status: Some("FAILURE_BAD_CREDENTIAL".to_string()),
            status_message: Some("Token validated".to_string()),
        };
        assert!(!validation_passed(&bad));

        let bad = ValidateResponse {
            status: None,
            status_message: Some("Token expired".to_string()),
        };
        assert!(!validation_passed(&bad));

        let empty = ValidateResponse {
            status: None,
            status_message: None,
        };
        assert!(!validation_passed(&empty));
    }

    #[tokio::test]
    async fn test_exchange_basic_sends_basic_header() {
        let mut server = mockito::Server::new_async().await;
        // base64("user:pw")
        let mock = server
            .mock("POST", "/token/authenticate")
            .match_header("authorization", "Basic dXNlcjpwdw==")
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"SUCCESS","tokenInfo":{"tokenValue":"tok-1"}}"#)
            .create_async()
            .await;

        let grant = exchange_basic(&client(), &endpoints(&server.url()), "user", "pw")
            .await
            .unwrap();

        assert_eq!(grant.value, "tok-1");
        assert_eq!(grant.expires_in, None);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_grant_carries_server_expiry() {
        let mut server = mockito::Server::new_async().await;
        let expires_at = Utc::now().timestamp_millis() + 1_200_000;
        server
            .mock("POST", "/token/authenticate")
            .with_status(201)
            .with_body(
                serde_json::json!({
                    "status": "SUCCESS",
                    "tokenInfo": {"tokenValue": "tok-1", "expiresAt": expires_at}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let grant = exchange_basic(&client(), &endpoints(&server.url()), "user", "pw")
            .await
            .unwrap();

        let secs = grant.expires_in.unwrap();
        assert!((1190..=1200).contains(&secs), "got {}", secs);
    }

    #[tokio::test]
    async fn test_exchange_bad_credential() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token/authenticate")
            .with_status(401)
            .with_body(r#"{"status":"FAILURE_BAD_CREDENTIAL","statusMessage":"Bad credentials"}"#)
            .create_async()
            .await;

        let err = exchange_basic(&client(), &endpoints(&server.url()), "user", "bad")
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Authentication(_)));
        assert!(err.to_string().contains("FAILURE_BAD_CREDENTIAL"));
    }

    #[tokio::test]
    async fn test_exchange_server_error_is_api_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token/authenticate")
            .with_status(503)
            .with_body("unavailable")
            .create_async()
            .await;

        let err = exchange_basic(&client(), &endpoints(&server.url()), "user", "pw")
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Api { status: 503, .. }));
        assert!(err.is_retryable());
    }

    /// Serve one 200 response whose body stops short of its Content-Length
    async fn truncated_body_server(partial: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n",
                partial.len() + 64
            );
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(partial.as_bytes()).await;
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_validate_body_cut_short_is_transport_error() {
        let url = truncated_body_server(r#"{"status":"SUCC"#).await;

        let err = validate(&client(), &endpoints(&url), "tok-1").await.unwrap_err();

        assert!(matches!(err, ClientError::Transport { .. }), "got {:?}", err);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_authenticate_body_cut_short_is_transport_error() {
        let url = truncated_body_server(r#"{"status":"SUCCESS","tokenInfo":"#).await;

        let err = exchange_basic(&client(), &endpoints(&url), "user", "pw")
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Transport { .. }), "got {:?}", err);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_validate_rejects_non_success_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/token/validate")
            .match_header("authorization", "AnaplanAuthToken tok-1")
            .with_status(401)
            .create_async()
            .await;

        let err = validate(&client(), &endpoints(&server.url()), "tok-1")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_refresh_token_uses_existing_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token/refresh")
            .match_header("authorization", "AnaplanAuthToken old")
            .with_status(201)
            .with_body(r#"{"status":"SUCCESS","tokenInfo":{"tokenValue":"new"}}"#)
            .create_async()
            .await;

        let grant = refresh_token(&client(), &endpoints(&server.url()), "old")
            .await
            .unwrap();
        assert_eq!(grant.value, "new");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_exchange_refresh_secret_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .match_body(Matcher::Json(serde_json::json!({
                "grant_type": "refresh_token",
                "client_id": "client-1",
                "refresh_token": "secret-1"
            })))
            .with_status(200)
            .with_body(r#"{"access_token":"access-1","refresh_token":"secret-2","expires_in":2100}"#)
            .create_async()
            .await;

        let data = exchange_refresh_secret(&client(), &endpoints(&server.url()), "client-1", "secret-1")
            .await
            .unwrap();

        assert_eq!(data.access_token, "access-1");
        assert_eq!(data.refresh_token.as_deref(), Some("secret-2"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_exchange_refresh_secret_invalid_grant() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"refresh token reused"}"#)
            .create_async()
            .await;

        let err = exchange_refresh_secret(&client(), &endpoints(&server.url()), "client-1", "stale")
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Authentication(_)));
        assert!(err.to_string().contains("invalid_grant"));
    }
}
