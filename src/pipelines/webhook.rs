//! Webhook Relay Pipelines
//!
//! Family, food and web search are relayed to external automation webhooks.
//! Each webhook answers in its own shape, so the reply text is pulled out by
//! trying a chain of [`ResponseShape`]s in order and taking the first hit.

use super::{with_timeout, Pipeline, PipelineContext, PipelineError, Turn};
use crate::router::{Intent, FAMILY_TAG, FOOD_TAG, WEB_TAG};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

/// Webhook relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub webhook_url: String,
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: String::new(),
            timeout_secs: 30,
        }
    }
}

/// One way a webhook may encode its answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// `{"<field>": "text"}`
    Object(&'static str),
    /// `[{"<field>": "text"}, ...]`, texts joined by blank lines
    ArrayOfObjects(&'static str),
    /// First element of an array: its `text` field, else its JSON
    FirstArrayItem,
    /// The body as-is
    RawText,
}

impl ResponseShape {
    fn extract(&self, body: &str, parsed: Option<&Value>) -> Option<String> {
        match self {
            ResponseShape::Object(field) => parsed?.as_object()?.get(*field)?.as_str().map(str::to_string),
            ResponseShape::ArrayOfObjects(field) => {
                let texts: Vec<&str> = parsed?
                    .as_array()?
                    .iter()
                    .filter_map(|item| item.get(*field)?.as_str())
                    .filter(|t| !t.trim().is_empty())
                    .collect();
                (!texts.is_empty()).then(|| texts.join("\n\n"))
            }
            ResponseShape::FirstArrayItem => {
                let first = parsed?.as_array()?.first()?;
                match first.get("text").and_then(Value::as_str) {
                    Some(text) => Some(text.to_string()),
                    None => Some(first.to_string()),
                }
            }
            ResponseShape::RawText => Some(body.to_string()),
        }
    }
}

/// Decode a webhook body with the first matching shape
pub fn decode(body: &str, chain: &[ResponseShape]) -> Option<String> {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    chain
        .iter()
        .filter_map(|shape| shape.extract(body, parsed.as_ref()))
        .map(|text| text.trim().to_string())
        .find(|text| !text.is_empty())
}

/// Which webhook relay this is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relay {
    Family,
    Food,
    Web,
}

impl Relay {
    fn service(&self) -> &'static str {
        match self {
            Relay::Family => "family",
            Relay::Food => "food",
            Relay::Web => "web search",
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            Relay::Family => FAMILY_TAG,
            Relay::Food => FOOD_TAG,
            Relay::Web => WEB_TAG,
        }
    }

    fn chain(&self) -> &'static [ResponseShape] {
        match self {
            Relay::Family => &[ResponseShape::Object("response"), ResponseShape::RawText],
            Relay::Food => &[
                ResponseShape::ArrayOfObjects("text"),
                ResponseShape::FirstArrayItem,
                ResponseShape::Object("response"),
                ResponseShape::RawText,
            ],
            Relay::Web => &[ResponseShape::Object("whatsapp_message"), ResponseShape::RawText],
        }
    }
}

pub struct WebhookPipeline {
    ctx: PipelineContext,
    client: reqwest::Client,
    config: WebhookConfig,
    relay: Relay,
}

impl WebhookPipeline {
    fn new(ctx: PipelineContext, config: WebhookConfig, relay: Relay) -> Self {
        Self {
            ctx,
            client: reqwest::Client::new(),
            config,
            relay,
        }
    }

    pub fn family(ctx: PipelineContext, config: WebhookConfig) -> Self {
        Self::new(ctx, config, Relay::Family)
    }

    pub fn food(ctx: PipelineContext, config: WebhookConfig) -> Self {
        Self::new(ctx, config, Relay::Food)
    }

    pub fn web(ctx: PipelineContext, config: WebhookConfig) -> Self {
        Self::new(ctx, config, Relay::Web)
    }

    fn payload(&self, text: &str) -> (String, Value) {
        match self.relay {
            // Family automations read the message verbatim, tag included
            Relay::Family => (text.to_string(), json!({"action": "sendMessage", "chatInput": text})),
            Relay::Food => {
                let clean = self.ctx.router.strip_with_tags(text, &[FOOD_TAG]);
                let body = json!({"action": "sendMessage", "chatInput": clean});
                (clean, body)
            }
            Relay::Web => {
                let clean = self.ctx.router.strip_with_tags(text, &[WEB_TAG]);
                let body = json!({"query": clean});
                (clean, body)
            }
        }
    }

    async fn call(&self, body: &Value) -> Result<String, PipelineError> {
        let service = self.relay.service();
        let response = self
            .client
            .post(&self.config.webhook_url)
            .json(body)
            .send()
            .await
            .map_err(|e| PipelineError::transport(service, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Status {
                service,
                status: status.as_u16(),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| PipelineError::transport(service, e))?;
        debug!("{} webhook returned {} bytes", service, text.len());

        decode(&text, self.relay.chain()).ok_or_else(|| PipelineError::decode(service, "empty response"))
    }
}

#[async_trait]
impl Pipeline for WebhookPipeline {
    fn intent(&self) -> Intent {
        match self.relay {
            Relay::Family => Intent::Family,
            Relay::Food => Intent::Food,
            Relay::Web => Intent::WebSearch,
        }
    }

    async fn run(&self, turn: &Turn) -> Result<(), PipelineError> {
        let service = self.relay.service();
        if !self.config.enabled || self.config.webhook_url.is_empty() {
            return Err(PipelineError::Disabled(service));
        }

        let (clean, body) = self.payload(turn.text());
        if clean.is_empty() {
            return Err(PipelineError::InvalidInput(format!(
                "Please add a message after {}.",
                self.relay.tag()
            )));
        }

        info!("Relaying {} request for {}", service, turn.session);
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let reply = with_timeout(service, timeout, self.call(&body)).await?;

        self.ctx.record_exchange(turn, &clean, &reply).await;
        match self.relay {
            // Already formatted for WhatsApp by the workflow
            Relay::Web => self.ctx.dispatcher.send_raw(&reply, &turn.event).await?,
            Relay::Family | Relay::Food => self.ctx.dispatcher.send(&reply, &turn.event).await?,
        };
        Ok(())
    }
}
