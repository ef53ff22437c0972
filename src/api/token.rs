use async_trait::async_trait;
use hyper::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::HttpApi;
use crate::error::{Result, StressError};

const TOKEN_PATH: &str = "/api/centrifugo-token";

/// Short-lived connection token, owned by the session that asked for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub issued_for: String,
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self, client_id: &str) -> Result<Credential>;
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

#[async_trait]
impl TokenProvider for HttpApi {
    async fn fetch_token(&self, client_id: &str) -> Result<Credential> {
        let (status, body) = self.get(TOKEN_PATH).await.map_err(StressError::Auth)?;
        if status != StatusCode::OK {
            return Err(StressError::Auth(format!("token endpoint returned {}", status)));
        }

        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| StressError::Auth(format!("malformed token response: {}", e)))?;
        debug!("Issued token for {}", client_id);

        Ok(Credential {
            token: parsed.token,
            issued_for: client_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::spawn_server;
    use std::time::Duration;

    #[tokio::test]
    async fn fetches_token_for_client() {
        let url = spawn_server(|_, path, _| {
            assert_eq!(path, TOKEN_PATH);
            (StatusCode::OK, r#"{"token":"abc.def"}"#.to_string())
        })
        .await;
        let api = HttpApi::new(url, Duration::from_secs(5));

        let credential = api.fetch_token("client_1").await.unwrap();
        assert_eq!(credential.token, "abc.def");
        assert_eq!(credential.issued_for, "client_1");
    }

    #[tokio::test]
    async fn non_ok_status_is_auth_error() {
        let url = spawn_server(|_, _, _| (StatusCode::SERVICE_UNAVAILABLE, String::new())).await;
        let api = HttpApi::new(url, Duration::from_secs(5));

        let err = api.fetch_token("client_1").await.unwrap_err();
        assert!(matches!(err, StressError::Auth(_)));
    }

    #[tokio::test]
    async fn malformed_body_is_auth_error() {
        let url = spawn_server(|_, _, _| (StatusCode::OK, "not json".to_string())).await;
        let api = HttpApi::new(url, Duration::from_secs(5));

        let err = api.fetch_token("client_1").await.unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_auth_error() {
        let api = HttpApi::new("http://127.0.0.1:1", Duration::from_secs(2));
        let err = api.fetch_token("client_1").await.unwrap_err();
        assert!(matches!(err, StressError::Auth(_)));
    }
}
