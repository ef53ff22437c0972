use async_trait::async_trait;
use hyper::StatusCode;
use serde::{Deserialize, Serialize};

use super::HttpApi;
use crate::error::{Result, StressError};

const CHAT_PATH: &str = "/api/chat";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReceipt {
    pub channel: String,
    pub message_id: String,
}

#[async_trait]
pub trait ChatSubmitter: Send + Sync {
    /// Post one user message into the chat identified by `channel_id`.
    async fn submit(&self, channel_id: &str, text: &str) -> Result<ChatReceipt>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    id: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    parts: Vec<ChatPart<'a>>,
}

#[derive(Serialize)]
struct ChatPart<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

impl<'a> ChatRequest<'a> {
    fn user_text(channel_id: &'a str, text: &'a str) -> Self {
        Self {
            id: channel_id,
            messages: vec![ChatMessage {
                role: "user",
                parts: vec![ChatPart { kind: "text", text }],
            }],
        }
    }
}

#[async_trait]
impl ChatSubmitter for HttpApi {
    async fn submit(&self, channel_id: &str, text: &str) -> Result<ChatReceipt> {
        let request = ChatRequest::user_text(channel_id, text);
        let (status, body) = self
            .post_json(CHAT_PATH, &request)
            .await
            .map_err(StressError::Submission)?;

        if status != StatusCode::OK {
            return Err(StressError::Submission(format!(
                "chat endpoint returned {}",
                status
            )));
        }

        serde_json::from_slice(&body)
            .map_err(|e| StressError::Submission(format!("malformed chat response: {}", e)))
    }
}
