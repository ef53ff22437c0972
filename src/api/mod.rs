//! HTTP side of the backend: the token issuer and the chat endpoint.

mod chat;
mod token;

pub use chat::{ChatReceipt, ChatSubmitter};
pub use token::{Credential, TokenProvider};

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Request, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Thin JSON-over-HTTP client for the backend API.
///
/// Failures come back as plain strings; the token and chat wrappers decide
/// which error kind they become.
#[derive(Clone)]
pub struct HttpApi {
    base_url: String,
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        let base_url = base_url.into().trim_end_matches('/').to_string();

        Self {
            base_url,
            client,
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get(&self, path: &str) -> Result<(StatusCode, Bytes), String> {
        let req = Request::builder()
            .method("GET")
            .uri(self.uri(path)?)
            .body(Full::new(Bytes::new()))
            .map_err(|e| format!("failed to build request: {}", e))?;
        self.send(req).await
    }

    async fn post_json<T: Serialize>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<(StatusCode, Bytes), String> {
        let body =
            serde_json::to_vec(payload).map_err(|e| format!("failed to encode body: {}", e))?;
        let req = Request::builder()
            .method("POST")
            .uri(self.uri(path)?)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| format!("failed to build request: {}", e))?;
        self.send(req).await
    }

    async fn send(&self, req: Request<Full<Bytes>>) -> Result<(StatusCode, Bytes), String> {
        let uri = req.uri().clone();
        let exchange = async {
            let resp = self
                .client
                .request(req)
                .await
                .map_err(|e| format!("request to {} failed: {}", uri, e))?;
            let status = resp.status();
            let bytes = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| format!("failed to read response from {}: {}", uri, e))?
                .to_bytes();
            Ok((status, bytes))
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => {
                if let Ok((status, _)) = &result {
                    debug!("{} answered {}", uri, status);
                }
                result
            }
            Err(_) => Err(format!("request to {} timed out after {:?}", uri, self.timeout)),
        }
    }

    fn uri(&self, path: &str) -> Result<Uri, String> {
        format!("{}{}", self.base_url, path)
            .parse()
            .map_err(|e| format!("invalid URI: {}", e))
    }
}
