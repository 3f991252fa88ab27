use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LMConfig;

/// Chat message structure for the AI API
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

const RECOGNIZED_ROLES: [&str; 3] = ["system", "user", "assistant"];

/// API request structure for AI completion
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: i32,
    stream: bool,
}

/// API response structure for AI completion
#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<MessageContent>,
}

#[derive(Deserialize)]
struct MessageContent {
    content: Option<String>,
}

/// Model listing response (`GET /v1/models`)
#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// Error types for completion requests
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection to backend failed: {0}")]
    ConnectionRefused(String),
    #[error("API returned HTTP {status}: {body}")]
    BadResponse { status: u16, body: String },
    #[error("API response contained no usable completion")]
    EmptyChoice,
}

impl CompletionError {
    /// Transport-level failures are worth retrying with backoff; the rest are not
    pub fn is_transient(&self) -> bool {
        matches!(self, CompletionError::Timeout(_) | CompletionError::ConnectionRefused(_))
    }
}

/// One completion call: role-tagged messages in, text out
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: i32,
    pub timeout: Duration,
}

/// Backend seam shared by the probe, the pipeline, and the tests
#[async_trait]
pub trait LmBackend: Send + Sync {
    async fn list_models(&self) -> Result<Vec<String>, CompletionError>;
    async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError>;
}

/// Stateless HTTP client for an LM Studio-compatible backend.
/// Retry policy belongs to the callers, not here.
pub struct HttpLmClient {
    base_url: String,
    temperature: f32,
}

impl HttpLmClient {
    pub fn new(config: &LMConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            temperature: config.default_temperature,
        }
    }

    fn classify_transport_error(err: reqwest::Error, timeout: Duration) -> CompletionError {
        if err.is_timeout() {
            CompletionError::Timeout(timeout)
        } else {
            CompletionError::ConnectionRefused(err.to_string())
        }
    }
}

/// Drop messages whose role the backend does not understand, keeping order
fn filter_recognized_roles(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    messages
        .into_iter()
        .filter(|m| {
            let recognized = RECOGNIZED_ROLES.contains(&m.role.as_str());
            if !recognized {
                warn!("⚠️ Dropping message with unrecognized role '{}'", m.role);
            }
            recognized
        })
        .collect()
}

/// Extract `choices[0].message.content` from a completion response body
fn extract_completion_text(body: &str) -> Result<String, CompletionError> {
    let response: ChatResponse =
        serde_json::from_str(body).map_err(|_| CompletionError::EmptyChoice)?;

    let text = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());

    text.ok_or(CompletionError::EmptyChoice)
}

#[async_trait]
impl LmBackend for HttpLmClient {
    async fn list_models(&self) -> Result<Vec<String>, CompletionError> {
        let timeout = Duration::from_secs(10);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CompletionError::ConnectionRefused(e.to_string()))?;

        let response = client
            .get(&format!("{}/v1/models", self.base_url))
            .send()
            .await
            .map_err(|e| Self::classify_transport_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::BadResponse { status: status.as_u16(), body });
        }

        let list: ModelList = response
            .json()
            .await
            .map_err(|e| CompletionError::BadResponse {
                status: status.as_u16(),
                body: format!("unparseable model list: {}", e),
            })?;

        Ok(list.data.into_iter().map(|m| m.id).collect())
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError> {
        let messages = filter_recognized_roles(request.messages);
        if messages.is_empty() {
            return Err(CompletionError::BadResponse {
                status: 0,
                body: "no messages provided".to_string(),
            });
        }

        let chat_request = ChatRequest {
            model: request.model,
            messages,
            temperature: self.temperature,
            max_tokens: request.max_tokens,
            stream: false,
        };

        let client = reqwest::Client::builder()
            .timeout(request.timeout)
            .build()
            .map_err(|e| CompletionError::ConnectionRefused(e.to_string()))?;

        debug!(
            "🤖 POST /v1/chat/completions (model={}, max_tokens={}, timeout={:?})",
            chat_request.model, chat_request.max_tokens, request.timeout
        );

        let response = client
            .post(&format!("{}/v1/chat/completions", self.base_url))
            .json(&chat_request)
            .send()
            .await
            .map_err(|e| Self::classify_transport_error(e, request.timeout))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Self::classify_transport_error(e, request.timeout))?;

        if !status.is_success() {
            return Err(CompletionError::BadResponse { status: status.as_u16(), body });
        }

        extract_completion_text(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_drops_unknown_roles_and_keeps_order() {
        let messages = vec![
            ChatMessage::system("a"),
            ChatMessage { role: "tool".to_string(), content: "x".to_string() },
            ChatMessage::user("b"),
            ChatMessage { role: "assistant".to_string(), content: "c".to_string() },
        ];
        let filtered = filter_recognized_roles(messages);
        let roles: Vec<&str> = filtered.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant"]);
        assert_eq!(filtered[1].content, "b");
    }

    #[test]
    fn test_extract_completion_text() {
        let body = r#"{"choices":[{"message":{"content":"  Bonjour  "}}]}"#;
        assert_eq!(extract_completion_text(body).unwrap(), "Bonjour");
    }

    #[test]
    fn test_extract_completion_text_empty_choices_is_empty_choice() {
        let body = r#"{"choices":[]}"#;
        assert!(matches!(
            extract_completion_text(body),
            Err(CompletionError::EmptyChoice)
        ));
    }

    #[test]
    fn test_extract_completion_text_blank_content_is_empty_choice() {
        let body = r#"{"choices":[{"message":{"content":"   "}}]}"#;
        assert!(matches!(
            extract_completion_text(body),
            Err(CompletionError::EmptyChoice)
        ));
    }

    #[test]
    fn test_transient_classification() {
        assert!(CompletionError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(CompletionError::ConnectionRefused("refused".to_string()).is_transient());
        assert!(!CompletionError::BadResponse { status: 500, body: String::new() }.is_transient());
        assert!(!CompletionError::EmptyChoice.is_transient());
    }

    #[tokio::test]
    async fn test_complete_rejects_empty_message_list_without_network() {
        // base_url points nowhere; the empty-list check must fire first
        let client = HttpLmClient {
            base_url: "http://127.0.0.1:1".to_string(),
            temperature: 0.7,
        };
        let request = CompletionRequest {
            model: "test".to_string(),
            messages: vec![],
            max_tokens: 16,
            timeout: Duration::from_secs(1),
        };
        match client.complete(request).await {
            Err(CompletionError::BadResponse { status: 0, body }) => {
                assert!(body.contains("no messages"));
            }
            other => panic!("expected BadResponse for empty messages, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_complete_rejects_all_filtered_message_list() {
        let client = HttpLmClient {
            base_url: "http://127.0.0.1:1".to_string(),
            temperature: 0.7,
        };
        let request = CompletionRequest {
            model: "test".to_string(),
            messages: vec![ChatMessage { role: "function".to_string(), content: "x".to_string() }],
            max_tokens: 16,
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            client.complete(request).await,
            Err(CompletionError::BadResponse { status: 0, .. })
        ));
    }
}
