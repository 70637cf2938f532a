//! Text-to-image generation via an HTTP image service.

use super::{with_timeout, Pipeline, PipelineContext, PipelineError, Turn};
use crate::router::{remove_terms, Intent, IMAGE_GEN_TAG};
use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

const SERVICE: &str = "image generation";

/// Image generation service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageGenConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for ImageGenConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://localhost:5000/generate".to_string(),
            timeout_secs: 160,
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    text: &'a str,
    #[serde(rename = "image-size")]
    image_size: &'static str,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    image: String,
    #[serde(default)]
    parameters: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Output size keyword found in the request
pub fn image_size(lower: &str) -> &'static str {
    if lower.contains("square") {
        "512x512"
    } else if lower.contains("portrait") {
        "256x512"
    } else {
        "512x256"
    }
}

pub struct ImageGenerationPipeline {
    ctx: PipelineContext,
    client: reqwest::Client,
    config: ImageGenConfig,
}

impl ImageGenerationPipeline {
    pub fn new(ctx: PipelineContext, config: ImageGenConfig) -> Self {
        Self {
            ctx,
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Prompt with the handle, the tag and size keywords removed
    pub fn clean_prompt(&self, text: &str) -> String {
        let lower = text.to_lowercase();
        remove_terms(&lower, &[self.ctx.router.handle(), IMAGE_GEN_TAG, "square", "portrait"])
    }

    async fn generate(&self, prompt: &str, size: &'static str) -> Result<Vec<u8>, PipelineError> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .json(&GenerateRequest {
                text: prompt,
                image_size: size,
            })
            .send()
            .await
            .map_err(|e| PipelineError::transport(SERVICE, e))?;

        if !response.status().is_success() {
            return Err(PipelineError::Status {
                service: SERVICE,
                status: response.status().as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| PipelineError::transport(SERVICE, e))?;

        let parsed: GenerateResponse = serde_json::from_slice(&body).unwrap_or_default();
        if let Some(error) = parsed.error.filter(|e| !e.is_empty()) {
            return Err(PipelineError::Service {
                service: SERVICE,
                detail: error,
            });
        }
        if let Some(parameters) = &parsed.parameters {
            info!("Image generated with parameters {}", parameters);
        }

        if parsed.image.is_empty() {
            // Service answered with the image itself
            if body.is_empty() {
                return Err(PipelineError::decode(SERVICE, "empty response"));
            }
            return Ok(body.to_vec());
        }

        base64::engine::general_purpose::STANDARD
            .decode(parsed.image.trim())
            .map_err(|e| PipelineError::decode(SERVICE, e))
    }
}

#[async_trait]
impl Pipeline for ImageGenerationPipeline {
    fn intent(&self) -> Intent {
        Intent::ImageGeneration
    }

    async fn run(&self, turn: &Turn) -> Result<(), PipelineError> {
        if !self.config.enabled {
            return Err(PipelineError::Disabled(SERVICE));
        }

        let prompt = self.clean_prompt(turn.text());
        if prompt.is_empty() {
            return Err(PipelineError::InvalidInput(format!(
                "Please describe the image, e.g. \"{} {} a red fox in the snow\". Add \"square\" or \"portrait\" to change the size.",
                self.ctx.router.handle(),
                IMAGE_GEN_TAG
            )));
        }
        let size = image_size(&turn.text().to_lowercase());

        self.ctx
            .dispatcher
            .send_raw("🎨 Generating your image, this can take a minute...", &turn.event)
            .await?;

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let image = with_timeout(SERVICE, timeout, self.generate(&prompt, size)).await?;
        if image.is_empty() {
            warn!("Image service returned no bytes for '{}'", prompt);
            return Err(PipelineError::decode(SERVICE, "no image data"));
        }

        let caption = format!("🎨 Generated image: {}", prompt);
        self.ctx
            .record_exchange(turn, &format!("{} {}", IMAGE_GEN_TAG, prompt), &caption)
            .await;
        self.ctx
            .dispatcher
            .send_image(image, "image/png", &caption, &turn.event)
            .await?;
        Ok(())
    }
}
