//! Streaming-avatar session tokens.
//!
//! The avatar provider's API key never reaches the browser: the client asks
//! the relay for a short-lived token and the relay asks the provider.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

const TOKEN_TTL_MS: i64 = 60 * 60 * 1000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarToken {
    pub token: String,
    /// Unix epoch milliseconds.
    pub expires_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum AvatarError {
    #[error("HEYGEN_API_KEY is not configured")]
    NotConfigured,
    #[error("HeyGen API error: {status} - {body}")]
    Upstream { status: u16, body: String },
    #[error("Invalid response from HeyGen API: missing token")]
    MissingToken,
    #[error("HeyGen request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Deserialize)]
struct TokenResponse {
    data: Option<TokenData>,
}

#[derive(Deserialize)]
struct TokenData {
    token: Option<String>,
}

pub struct AvatarBroker {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<SecretString>,
}

impl AvatarBroker {
    pub fn new(api_url: impl Into<String>, api_key: Option<SecretString>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_url: api_url.into(),
            api_key,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    #[instrument(skip(self))]
    pub async fn create_token(&self) -> Result<AvatarToken, AvatarError> {
        let api_key = self.api_key.as_ref().ok_or(AvatarError::NotConfigured)?;

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", api_key.expose_secret())
            .json(&serde_json::json!({}))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "avatar token request rejected");
            return Err(AvatarError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse = response.json().await.map_err(|_| AvatarError::MissingToken)?;
        let token = parsed
            .data
            .and_then(|d| d.token)
            .filter(|t| !t.is_empty())
            .ok_or(AvatarError::MissingToken)?;

        info!("avatar token issued");
        Ok(AvatarToken {
            token,
            expires_at: chrono::Utc::now().timestamp_millis() + TOKEN_TTL_MS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};

    async fn fake_provider(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/v1/streaming.create_token")
    }

    #[tokio::test]
    async fn missing_key_is_not_configured() {
        let broker = AvatarBroker::new("http://127.0.0.1:9/unused", None);
        assert!(!broker.is_enabled());
        let err = broker.create_token().await.unwrap_err();
        assert_eq!(err.to_string(), "HEYGEN_API_KEY is not configured");
    }

    #[tokio::test]
    async fn token_is_issued_with_one_hour_expiry() {
        let router = Router::new().route(
            "/v1/streaming.create_token",
            post(|headers: HeaderMap| async move {
                let key = headers.get("x-api-key").and_then(|v| v.to_str().ok()).unwrap_or("");
                if key == "secret-key" {
                    (StatusCode::OK, Json(serde_json::json!({"data": {"token": "tok-123"}})))
                } else {
                    (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "bad key"})))
                }
            }),
        );
        let url = fake_provider(router).await;
        let broker = AvatarBroker::new(url, Some(SecretString::from("secret-key")));

        let before = chrono::Utc::now().timestamp_millis();
        let token = broker.create_token().await.unwrap();
        assert_eq!(token.token, "tok-123");
        assert!(token.expires_at >= before + TOKEN_TTL_MS);
        assert!(token.expires_at <= chrono::Utc::now().timestamp_millis() + TOKEN_TTL_MS);
    }

    #[tokio::test]
    async fn provider_error_carries_status_and_body() {
        let router = Router::new().route(
            "/v1/streaming.create_token",
            post(|| async { (StatusCode::UNAUTHORIZED, "invalid key") }),
        );
        let url = fake_provider(router).await;
        let broker = AvatarBroker::new(url, Some(SecretString::from("wrong")));

        let err = broker.create_token().await.unwrap_err();
        assert_eq!(err.to_string(), "HeyGen API error: 401 - invalid key");
    }

    #[tokio::test]
    async fn response_without_token_is_invalid() {
        let router = Router::new().route(
            "/v1/streaming.create_token",
            post(|| async { Json(serde_json::json!({"data": {}})) }),
        );
        let url = fake_provider(router).await;
        let broker = AvatarBroker::new(url, Some(SecretString::from("k")));

        let err = broker.create_token().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid response from HeyGen API: missing token"
        );
    }
}
