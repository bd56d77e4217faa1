//! Text-generation client (OpenAI-compatible chat completions or Anthropic messages)

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ApiFormat, LlmConfig};
use crate::error::{SyncError, SyncResult};
use crate::ratelimit::RateLimiter;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_OUTPUT_TOKENS: u32 = 4096;

/// Prompt in, free-form text out. Implementations enforce their own response shape.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> SyncResult<String>;
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [Message<'a>; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

/// Pull the message body out of a response, or fail as malformed.
fn extract_body(format: ApiFormat, raw: &str) -> SyncResult<String> {
    let body = match format {
        ApiFormat::ChatCompletions => serde_json::from_str::<ChatResponse>(raw)
            .ok()
            .and_then(|r| r.choices.into_iter().next())
            .and_then(|c| c.message)
            .and_then(|m| m.content),
        ApiFormat::Messages => serde_json::from_str::<MessagesResponse>(raw)
            .ok()
            .and_then(|r| r.content.into_iter().next())
            .and_then(|b| b.text),
    };
    body.ok_or_else(|| {
        let snippet: String = raw.chars().take(200).collect();
        SyncError::Fatal(format!("response has no message body: {}", snippet))
    })
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> SyncError {
    let snippet: String = body.chars().take(200).collect();
    match status.as_u16() {
        429 => SyncError::RateLimited { reset_at: Utc::now() + chrono::Duration::seconds(30) },
        401 | 403 => SyncError::Fatal(format!("{}: {}", status, snippet)),
        408 | 500..=599 => SyncError::Transient(format!("{}: {}", status, snippet)),
        _ => SyncError::Fatal(format!("{}: {}", status, snippet)),
    }
}

pub struct ChatClient {
    client: reqwest::Client,
    config: LlmConfig,
    limiter: Arc<RateLimiter>,
}

impl ChatClient {
    pub fn new(config: LlmConfig, limiter: Arc<RateLimiter>) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Fatal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config, limiter })
    }

    async fn send_once(&self, prompt: &str) -> SyncResult<String> {
        let request = ChatRequest {
            model: &self.config.model_id,
            messages: [Message { role: "user", content: prompt }],
            max_tokens: match self.config.format {
                ApiFormat::Messages => Some(MAX_OUTPUT_TOKENS),
                ApiFormat::ChatCompletions => None,
            },
        };

        let builder = self.client.post(&self.config.url).json(&request);
        let builder = match self.config.format {
            ApiFormat::Messages => builder
                .header("x-api-key", &self.config.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            ApiFormat::ChatCompletions => builder.header("Authorization", format!("Bearer {}", self.config.api_key)),
        };

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::Timeout(format!("text generation: {}", e))
            } else {
                SyncError::from(e)
            }
        })?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }
        extract_body(self.config.format, &text)
    }
}

#[async_trait]
impl TextGenerator for ChatClient {
    async fn generate(&self, prompt: &str) -> SyncResult<String> {
        self.limiter.call("llm", || self.send_once(prompt)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_extract_chat_completion_body() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"你好/Hello"}}]}"#;
        assert_eq!(extract_body(ApiFormat::ChatCompletions, raw).unwrap(), "你好/Hello");
    }

    #[test]
    fn test_extract_messages_body() {
        let raw = r#"{"content":[{"type":"text","text":"ok"}],"stop_reason":"end_turn"}"#;
        assert_eq!(extract_body(ApiFormat::Messages, raw).unwrap(), "ok");
    }

    #[test]
    fn test_missing_body_is_fatal() {
        for raw in [r#"{"choices":[]}"#, r#"{"choices":[{"message":{}}]}"#, "not json"] {
            let err = extract_body(ApiFormat::ChatCompletions, raw).unwrap_err();
            assert!(matches!(err, SyncError::Fatal(_)), "{}", raw);
            assert!(!err.is_transient());
        }
        assert!(matches!(extract_body(ApiFormat::Messages, r#"{"content":[]}"#), Err(SyncError::Fatal(_))));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(classify_status(StatusCode::TOO_MANY_REQUESTS, ""), SyncError::RateLimited { .. }));
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "bad key").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_transient());
    }
}
