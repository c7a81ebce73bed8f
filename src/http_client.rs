use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::TokenManager;
use crate::error::{transport_kind, ClientError, Result};

pub const DEFAULT_API_URL: &str = "https://api.anaplan.com/2/0";

/// Upper bound for a single retry delay (milliseconds)
const MAX_BACKOFF_MS: u64 = 60_000;

/// Connection settings for the model API
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub api_url: String,
    pub workspace_id: String,
    pub model_id: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Retries for idempotent reads (429, 5xx, network errors)
    pub max_retries: u32,
}

/// HTTP client for one Anaplan model
pub struct AnaplanHttpClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Token accessor, consulted for every request
    token_manager: Arc<TokenManager>,

    /// `{api}/workspaces/{ws}/models/{model}/`
    model_url: String,

    /// Maximum number of retries
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

impl AnaplanHttpClient {
    /// Create a new HTTP client
    pub fn new(token_manager: Arc<TokenManager>, settings: &HttpSettings) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to create HTTP client: {}", e)))?;

        let model_url = format!(
            "{}/workspaces/{}/models/{}/",
            settings.api_url.trim_end_matches('/'),
            settings.workspace_id,
            settings.model_id
        );

        Ok(Self {
            client,
            token_manager,
            model_url,
            max_retries: settings.max_retries,
            base_delay_ms: 1000, // 1 second base delay
        })
    }

    pub fn model_url(&self) -> &str {
        &self.model_url
    }

    pub fn token_manager(&self) -> &Arc<TokenManager> {
        &self.token_manager
    }

    /// Absolute URL for a model-relative path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.model_url, path.trim_start_matches('/'))
    }

    /// Start a request with a freshly fetched Authorization header
    pub async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let authorization = self.token_manager.authorization().await?;
        Ok(self
            .client
            .request(method, self.url(path))
            .header("Authorization", authorization))
    }

    /// GET a model-relative path and parse JSON, retrying transient failures
    pub async fn get_json(&self, path: &str) -> Result<Value> {
        let builder = self
            .request(Method::GET, path)
            .await?
            .header("Accept", "application/json");
        let response = self.request_with_retry(builder).await?;
        read_json(response).await
    }

    /// Execute a request with retry logic
    /// Automatically handles:
    /// - 429: exponential backoff
    /// - 5xx: exponential backoff
    /// - network errors: exponential backoff
    pub async fn request_with_retry(&self, builder: RequestBuilder) -> Result<Response> {
        self.execute(builder, self.max_retries).await
    }

    /// Execute a request exactly once; for non-idempotent calls and polls
    pub async fn request_no_retry(&self, builder: RequestBuilder) -> Result<Response> {
        self.execute(builder, 0).await
    }

    async fn execute(&self, builder: RequestBuilder, max_retries: u32) -> Result<Response> {
        let request = builder.build().map_err(|e| ClientError::from_reqwest(&e))?;
        let method = request.method().clone();
        let url = request.url().clone();
        let mut attempt = 0;

        tracing::debug!(method = %method, url = %url, "Sending HTTP request");

        loop {
            let req = request.try_clone().ok_or_else(|| {
                ClientError::Internal(anyhow::anyhow!("Request body is not cloneable"))
            })?;

            match self.client.execute(req).await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        tracing::debug!(status = %status, "Request successful");
                        return Ok(response);
                    }

                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    if retryable && attempt < max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            "Received {}, retrying after {}ms (attempt {}/{})",
                            status,
                            delay,
                            attempt + 1,
                            max_retries
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    let error_text = response.text().await.unwrap_or_default();
                    tracing::error!(
                        status = status.as_u16(),
                        method = %method,
                        url = %url,
                        response_body = %error_text,
                        attempt = attempt + 1,
                        "HTTP request failed with error response"
                    );
                    return Err(ClientError::Api {
                        status: status.as_u16(),
                        message: error_text,
                    });
                }

                Err(e) => {
                    tracing::warn!(
                        error_kind = transport_kind(&e),
                        error = %e,
                        url = %url,
                        attempt = attempt + 1,
                        "HTTP request error"
                    );

                    if attempt < max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(ClientError::from_reqwest(&e));
                }
            }
        }
    }

    /// Calculate exponential backoff delay
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        // base_delay * 2^attempt capped at MAX_BACKOFF_MS, plus up to 10% jitter
        let delay = 2_u64
            .checked_pow(attempt)
            .map_or(MAX_BACKOFF_MS, |factor| self.base_delay_ms.saturating_mul(factor))
            .min(MAX_BACKOFF_MS);
        let jitter = (delay as f64 * 0.1 * rand::random::<f64>()) as u64;
        delay + jitter
    }

    #[cfg(test)]
    pub(crate) fn with_base_delay(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }
}

/// Parse a JSON body; an empty body reads as `null`
pub async fn read_json(response: Response) -> Result<Value> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ClientError::from_reqwest(&e))?;
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| ClientError::Api {
        status: 200,
        message: format!("invalid JSON in response: {}", e),
    })
}
