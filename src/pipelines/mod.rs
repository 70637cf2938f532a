//! Response Pipelines
//!
//! One pipeline per intent. Each is a thin adapter over a single external
//! collaborator (LLM, vision model, image generator, webhook) and shares the
//! same contract:
//!
//! - external calls run under a per-pipeline timeout
//! - failures come back as `PipelineError`; the engine turns them into an
//!   apologetic reply
//! - transcript lines go to the registry, never directly into its maps

pub mod canned;
pub mod chat;
pub mod comfy;
pub mod imagegen;
pub mod llm;
pub mod vision;
pub mod webhook;

use crate::channels::{ChannelError, InboundEvent};
use crate::conversation::ConversationRegistry;
use crate::dispatcher::OutboundDispatcher;
use crate::memory::StorageError;
use crate::router::{Intent, IntentRouter};
use crate::session::{SessionKey, SessionStore};
use crate::sync::MemorySync;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use canned::CannedReplies;
pub use chat::ChatPipeline;
pub use comfy::{ComfyConfig, ImageEditPipeline};
pub use imagegen::{ImageGenConfig, ImageGenerationPipeline};
pub use llm::{ChatModel, LlmConfig, OllamaClient};
pub use vision::{ImageAnalysisPipeline, VisionConfig};
pub use webhook::{ResponseShape, WebhookConfig, WebhookPipeline};

/// Errors from an external collaborator
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{service} timed out after {secs}s")]
    Timeout { service: &'static str, secs: u64 },

    #[error("{service} returned status {status}")]
    Status { service: &'static str, status: u16 },

    #[error("{service} request failed: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} returned an unusable response: {detail}")]
    Decode { service: &'static str, detail: String },

    #[error("{service} reported an error: {detail}")]
    Service { service: &'static str, detail: String },

    #[error("{0} is not enabled")]
    Disabled(&'static str),

    /// The message itself is unusable; the text is shown to the user as-is
    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("network error: {0}")]
    Channel(#[from] ChannelError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl PipelineError {
    pub fn transport(service: &'static str, source: reqwest::Error) -> Self {
        Self::Transport { service, source }
    }

    pub fn decode(service: &'static str, detail: impl ToString) -> Self {
        Self::Decode {
            service,
            detail: detail.to_string(),
        }
    }

    /// Apologetic text sent back to the user
    pub fn user_message(&self) -> String {
        match self {
            Self::Timeout { service, .. } => format!(
                "Sorry, the {} service took too long to respond. Please try again later.",
                service
            ),
            Self::Status { service, status } => {
                format!("The {} service returned an error: {}", service, status)
            }
            Self::Transport { service, .. } => format!(
                "Sorry, I couldn't connect to the {} service. Please try again later.",
                service
            ),
            Self::Decode { service, .. } => {
                format!("The {} service did not return a valid response.", service)
            }
            Self::Service { service, .. } => format!(
                "Sorry, the {} service couldn't complete that request.",
                service
            ),
            Self::Disabled(service) => format!("Sorry, {} is not available right now.", service),
            Self::InvalidInput(message) => message.clone(),
            Self::Channel(_) => "Sorry, I couldn't process that media. Please try again.".to_string(),
            Self::Storage(_) => "Sorry, I couldn't save that right now. Please try again later.".to_string(),
        }
    }
}

/// Run an external call under a timeout budget
pub async fn with_timeout<T, F>(service: &'static str, budget: Duration, call: F) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, PipelineError>>,
{
    match tokio::time::timeout(budget, call).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Timeout {
            service,
            secs: budget.as_secs(),
        }),
    }
}

/// One admitted, classified message
#[derive(Debug, Clone)]
pub struct Turn {
    pub event: InboundEvent,
    pub conversation_id: String,
    pub session: SessionKey,
    pub text: Option<String>,
    pub is_reply_to_bot: bool,
}

impl Turn {
    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }
}

/// Shared handles every pipeline may use
#[derive(Clone)]
pub struct PipelineContext {
    pub dispatcher: Arc<OutboundDispatcher>,
    pub registry: Arc<ConversationRegistry>,
    pub sessions: Arc<SessionStore>,
    pub memory_sync: Arc<MemorySync>,
    pub router: Arc<IntentRouter>,
}

impl PipelineContext {
    /// Record a user line and a bot line in the conversation transcript
    pub async fn record_exchange(&self, turn: &Turn, user_line: &str, bot_line: &str) {
        self.registry
            .record(&turn.conversation_id, &format!("User: {}", user_line))
            .await;
        self.registry
            .record(&turn.conversation_id, &format!("Bot: {}", bot_line))
            .await;
    }
}

/// A handler for one intent
#[async_trait]
pub trait Pipeline: Send + Sync {
    fn intent(&self) -> Intent;

    async fn run(&self, turn: &Turn) -> Result<(), PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_fails_fast() {
        let result: Result<(), PipelineError> = with_timeout("slow", Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, PipelineError::Timeout { service: "slow", .. }));
        assert!(err.user_message().contains("took too long"));
    }

    #[test]
    fn test_user_messages() {
        let status = PipelineError::Status { service: "food", status: 502 };
        assert_eq!(status.user_message(), "The food service returned an error: 502");

        let invalid = PipelineError::InvalidInput("Please describe the image.".to_string());
        assert_eq!(invalid.user_message(), "Please describe the image.");
    }
}
