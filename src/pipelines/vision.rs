//! Image analysis through a vision-capable model.

use super::{with_timeout, ChatModel, LlmConfig, Pipeline, PipelineContext, PipelineError, Turn};
use crate::router::Intent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_VISION_PROMPT: &str = "Describe what is in this image in detail.";
pub const ANALYZING_NOTICE: &str = "I'm analyzing this image, please wait a moment...";

/// Vision model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://localhost:11434".to_string(),
            model: "llava:7b".to_string(),
            max_tokens: 1024,
            timeout_secs: 120,
        }
    }
}

impl VisionConfig {
    /// Model client settings for the vision backend
    pub fn llm_config(&self) -> LlmConfig {
        LlmConfig {
            endpoint: self.endpoint.clone(),
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            timeout_secs: self.timeout_secs,
            enable_reasoning: false,
            system_prompt: "You are an image analysis assistant. Describe images accurately and concisely."
                .to_string(),
        }
    }
}

pub struct ImageAnalysisPipeline {
    ctx: PipelineContext,
    model: Arc<dyn ChatModel>,
    enabled: bool,
    timeout: Duration,
}

impl ImageAnalysisPipeline {
    pub fn new(ctx: PipelineContext, model: Arc<dyn ChatModel>, config: &VisionConfig) -> Self {
        Self {
            ctx,
            model,
            enabled: config.enabled,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    fn prompt(&self, turn: &Turn) -> String {
        let clean = self.ctx.router.strip_wake_words(turn.text());
        if clean.chars().count() < 5 {
            DEFAULT_VISION_PROMPT.to_string()
        } else {
            clean
        }
    }
}

#[async_trait]
impl Pipeline for ImageAnalysisPipeline {
    fn intent(&self) -> Intent {
        Intent::ImageAnalysis
    }

    async fn run(&self, turn: &Turn) -> Result<(), PipelineError> {
        if !self.enabled {
            return Err(PipelineError::Disabled("image analysis"));
        }
        let media = turn
            .event
            .image_payload()
            .ok_or_else(|| PipelineError::InvalidInput("Please attach an image to analyze.".to_string()))?;

        let prompt = self.prompt(turn);
        self.ctx.dispatcher.send_raw(ANALYZING_NOTICE, &turn.event).await?;

        let client = self.ctx.dispatcher.client().clone();
        let description = with_timeout("vision", self.timeout, async {
            let bytes = client.download_media(media).await?;
            info!("Analyzing {} byte image for {}", bytes.len(), turn.session);
            self.model.complete(&prompt, &[bytes]).await
        })
        .await?;

        self.ctx
            .record_exchange(turn, &format!("[image] {}", prompt), &description)
            .await;
        self.ctx.dispatcher.send_raw(&description, &turn.event).await?;
        Ok(())
    }
}
