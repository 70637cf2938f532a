//! Configuration management
//!
//! A JSON file supplies the full configuration; `SASI_*` environment
//! variables override individual values. Every section has defaults, so an
//! empty file (or none at all) yields a runnable, if quiet, bot.

use crate::channels::{BridgeConfig, RateLimitConfig};
use crate::dedup::DedupConfig;
use crate::pipelines::{ComfyConfig, ImageGenConfig, LlmConfig, VisionConfig, WebhookConfig};
use crate::router::EnabledPipelines;
use crate::server::ServerConfig;
use crate::sync::MemoryConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Bot persona and triggering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub bot_name: String,
    /// Named in identity answers
    pub creator: String,
    /// Model name given out instead of the real one
    pub model_alias: String,
    /// Wake words, matched case-insensitively anywhere in the text
    pub trigger_words: Vec<String>,
    /// Single wake word from older configs, used as a fallback
    pub trigger_word: Option<String>,
    /// Mention handle required by the image tags
    pub handle: String,
    /// Group IDs (substring match) the bot answers in; `"*"` for all
    pub allowed_groups: Vec<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            bot_name: "Sasi".to_string(),
            creator: "Avarachan".to_string(),
            model_alias: "Avarran 007".to_string(),
            trigger_words: vec!["@sasi".to_string(), "sasi".to_string(), "Sasi".to_string()],
            trigger_word: Some("@sasi".to_string()),
            handle: "@sasi".to_string(),
            allowed_groups: Vec::new(),
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bot: BotConfig,
    pub bridge: BridgeConfig,
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub vision: VisionConfig,
    pub image_gen: ImageGenConfig,
    pub comfy: ComfyConfig,
    pub family: WebhookConfig,
    pub food: WebhookConfig,
    pub web: WebhookConfig,
    pub rate_limit: RateLimitConfig,
    pub memory: MemoryConfig,
    pub dedup: DedupConfig,
}

impl Config {
    /// Load from `path` (or `SASI_CONFIG`), then apply environment overrides.
    ///
    /// An explicitly named file must exist. Without one, defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path: Option<PathBuf> = path
            .map(Path::to_path_buf)
            .or_else(|| env_var("SASI_CONFIG").map(PathBuf::from));

        let mut config = match &path {
            Some(path) => Self::from_file(path)?,
            None => {
                info!("No config file given, using defaults");
                Self::default()
            }
        };

        config.apply_env(env_var);
        config.validate();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
        let raw = std::fs::read_to_string(&expanded)
            .with_context(|| format!("Failed to read config file {}", expanded))?;
        let config: Self =
            serde_json::from_str(&raw).with_context(|| format!("Invalid config file {}", expanded))?;
        info!("Loaded config from {}", expanded);
        Ok(config)
    }

    /// Apply `SASI_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("SASI_BRIDGE_URL") {
            self.bridge.base_url = url;
        }
        if let Some(token) = lookup("SASI_BRIDGE_TOKEN") {
            self.bridge.api_token = Some(token);
        }
        if let Some(groups) = lookup("SASI_ALLOWED_GROUPS") {
            self.bot.allowed_groups = groups
                .split(',')
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(words) = lookup("SASI_TRIGGER_WORDS") {
            self.bot.trigger_words = words
                .split(',')
                .map(str::trim)
                .filter(|w| !w.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(path) = lookup("SASI_DB_PATH") {
            self.memory.db_path = path;
        }
        if let Some(bind) = lookup("SASI_BIND") {
            match bind.parse() {
                Ok(addr) => self.server.bind_addr = addr,
                Err(_) => warn!("Ignoring invalid SASI_BIND '{}'", bind),
            }
        }
        if let Some(port) = lookup("SASI_PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!("Ignoring invalid SASI_PORT '{}'", port),
            }
        }
        if let Some(endpoint) = lookup("SASI_LLM_ENDPOINT") {
            self.llm.endpoint = endpoint;
        }
        if let Some(model) = lookup("SASI_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(endpoint) = lookup("SASI_VISION_ENDPOINT") {
            self.vision.endpoint = endpoint;
        }
        if let Some(url) = lookup("SASI_FAMILY_WEBHOOK") {
            self.family.webhook_url = url;
            self.family.enabled = true;
        }
        if let Some(url) = lookup("SASI_FOOD_WEBHOOK") {
            self.food.webhook_url = url;
            self.food.enabled = true;
        }
        if let Some(url) = lookup("SASI_WEB_WEBHOOK") {
            self.web.webhook_url = url;
            self.web.enabled = true;
        }
    }

    fn validate(&mut self) {
        if self.bot.allowed_groups.is_empty() {
            warn!("No allowed groups configured; the bot will not answer anywhere");
        }
        if self.bot.trigger_words.is_empty() && self.bot.trigger_word.is_none() {
            warn!("No trigger words configured; only replies to the bot will be answered");
        }
        for (name, webhook) in [("family", &mut self.family), ("food", &mut self.food), ("web", &mut self.web)] {
            if webhook.enabled && webhook.webhook_url.is_empty() {
                warn!("{} webhook enabled without a URL, disabling", name);
                webhook.enabled = false;
            }
        }
    }

    /// Which optional pipelines the router may pick
    pub fn enabled_pipelines(&self) -> EnabledPipelines {
        EnabledPipelines {
            image_edit: self.comfy.enabled,
            image_generation: self.image_gen.enabled,
            family: self.family.enabled,
            food: self.food.enabled,
            web: self.web.enabled,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
