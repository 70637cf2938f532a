//! Ollama Chat Client
//!
//! Non-streaming `/api/chat` calls used by the chat and image-analysis
//! pipelines. Images ride along as base64 on the user message.

use super::PipelineError;
use async_trait::async_trait;
use base64::Engine as _;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

static THINK_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").unwrap());

/// Language model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    /// Let reasoning models think out loud (qwen3)
    pub enable_reasoning: bool,
    pub system_prompt: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "qwen3:14b".to_string(),
            max_tokens: 4096,
            timeout_secs: 60,
            enable_reasoning: false,
            system_prompt: "You are a helpful assistant in a WhatsApp group. Keep your responses \
                concise and to the point unless the user asks for detail."
                .to_string(),
        }
    }
}

/// A completion backend
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Complete `prompt`, optionally with attached images
    async fn complete(&self, prompt: &str, images: &[Vec<u8>]) -> Result<String, PipelineError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// Remove `<think>` blocks emitted by reasoning models
pub fn strip_thinking(text: &str) -> String {
    THINK_BLOCK.replace_all(text, "").trim().to_string()
}

/// Ollama-backed chat model
pub struct OllamaClient {
    client: reqwest::Client,
    config: LlmConfig,
    service: &'static str,
}

impl OllamaClient {
    /// `service` names the backend in errors shown to users ("chat", "vision")
    pub fn new(config: LlmConfig, service: &'static str) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            service,
        }
    }

    fn user_content(&self, prompt: &str) -> String {
        if self.config.model.starts_with("qwen3") && !self.config.enable_reasoning {
            format!("{}/no_think", prompt)
        } else {
            prompt.to_string()
        }
    }
}

#[async_trait]
impl ChatModel for OllamaClient {
    async fn complete(&self, prompt: &str, images: &[Vec<u8>]) -> Result<String, PipelineError> {
        let url = format!("{}/api/chat", self.config.endpoint.trim_end_matches('/'));
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: self.config.system_prompt.clone(),
                    images: Vec::new(),
                },
                ChatMessage {
                    role: "user",
                    content: self.user_content(prompt),
                    images: images
                        .iter()
                        .map(|i| base64::engine::general_purpose::STANDARD.encode(i))
                        .collect(),
                },
            ],
            stream: false,
            options: ChatOptions {
                num_predict: self.config.max_tokens,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::transport(self.service, e))?;

        if !response.status().is_success() {
            return Err(PipelineError::Status {
                service: self.service,
                status: response.status().as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| PipelineError::transport(self.service, e))?;

        let content = match serde_json::from_str::<ChatResponse>(&body) {
            Ok(ChatResponse { message: Some(m), .. }) => m.content,
            Ok(ChatResponse { response: Some(r), .. }) => r,
            Ok(_) => String::new(),
            // Some proxies return plain text
            Err(_) => body,
        };

        let content = strip_thinking(&content);
        if content.is_empty() {
            return Err(PipelineError::decode(self.service, "empty completion"));
        }

        debug!("{} model returned {} chars", self.service, content.len());
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};

    #[test]
    fn test_strip_thinking() {
        assert_eq!(strip_thinking("<think>\nhmm\n</think>\n\nHello!"), "Hello!");
        assert_eq!(strip_thinking("<think></think>Hi"), "Hi");
        assert_eq!(strip_thinking("plain"), "plain");
    }

    #[test]
    fn test_no_think_suffix_for_qwen3() {
        let client = OllamaClient::new(LlmConfig::default(), "chat");
        assert_eq!(client.user_content("hi"), "hi/no_think");

        let client = OllamaClient::new(
            LlmConfig {
                model: "gemma3:1b".to_string(),
                ..Default::default()
            },
            "chat",
        );
        assert_eq!(client.user_content("hi"), "hi");
    }

    #[tokio::test]
    async fn test_complete_against_fake_ollama() {
        let app = Router::new().route(
            "/api/chat",
            post(|Json(body): Json<serde_json::Value>| async move {
                let images = body["messages"][1]["images"].as_array().map(|a| a.len()).unwrap_or(0);
                Json(serde_json::json!({
                    "message": {"role": "assistant", "content": format!("<think>x</think>saw {} image(s)", images)}
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = OllamaClient::new(
            LlmConfig {
                endpoint: format!("http://{}", addr),
                ..Default::default()
            },
            "vision",
        );
        let reply = client.complete("what is this", &[vec![1, 2, 3]]).await.unwrap();
        assert_eq!(reply, "saw 1 image(s)");
    }
}
