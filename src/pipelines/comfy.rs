//! ComfyUI Image Edit Pipeline
//!
//! Runs the user's image through a stored ComfyUI workflow:
//!
//! 1. Upload the image (`POST /upload/image`, multipart)
//! 2. Patch the workflow: first `LoadImage` node gets the uploaded file,
//!    first `CLIPTextEncode` node gets the prompt
//! 3. Queue it (`POST /prompt`)
//! 4. Poll `/history/{prompt_id}` until it completes
//! 5. Fetch the first output image from `/view`

use super::{with_timeout, Pipeline, PipelineContext, PipelineError, Turn};
use crate::router::{Intent, IMAGE_EDIT_TAG};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

const SERVICE: &str = "image editing";

/// ComfyUI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComfyConfig {
    pub enabled: bool,
    pub endpoint: String,
    /// Workflow in ComfyUI API format
    pub workflow_path: PathBuf,
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for ComfyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://localhost:8188".to_string(),
            workflow_path: PathBuf::from("./comfyui/flux_8_steps.json"),
            timeout_secs: 160,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Serialize)]
struct QueueRequest<'a> {
    prompt: &'a Value,
    client_id: String,
}

#[derive(Debug, Deserialize)]
struct QueueResponse {
    #[serde(default)]
    prompt_id: String,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    outputs: HashMap<String, NodeOutput>,
    #[serde(default)]
    status: HistoryStatus,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryStatus {
    #[serde(default)]
    completed: bool,
    #[serde(default)]
    status_str: String,
}

#[derive(Debug, Deserialize)]
struct NodeOutput {
    #[serde(default)]
    images: Vec<OutputImage>,
}

#[derive(Debug, Clone, Deserialize)]
struct OutputImage {
    filename: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    subfolder: String,
}

static EDIT_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("(?i){}", regex::escape(IMAGE_EDIT_TAG))).unwrap());

/// Text following the `@img` tag
pub fn edit_prompt(text: &str) -> String {
    match EDIT_TAG.find(text) {
        Some(tag) => text[tag.end()..].trim().to_string(),
        None => String::new(),
    }
}

/// Point the workflow at the uploaded image and the user's prompt
pub fn patch_workflow(workflow: &mut Value, image_name: &str, prompt: &str) -> Result<(), PipelineError> {
    let nodes = workflow
        .as_object_mut()
        .ok_or_else(|| PipelineError::decode(SERVICE, "workflow is not a JSON object"))?;

    let mut loader_found = false;
    let mut prompt_found = false;

    for (id, node) in nodes.iter_mut() {
        let class = node.get("class_type").and_then(Value::as_str).unwrap_or_default().to_string();
        let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
            continue;
        };

        if class == "LoadImage" && !loader_found {
            inputs.insert("image".to_string(), Value::String(image_name.to_string()));
            loader_found = true;
            debug!("Patched LoadImage node {}", id);
        } else if class == "CLIPTextEncode" && !prompt_found && inputs.contains_key("text") {
            inputs.insert("text".to_string(), Value::String(prompt.to_string()));
            prompt_found = true;
            debug!("Patched CLIPTextEncode node {}", id);
        }
    }

    if !loader_found {
        return Err(PipelineError::Service {
            service: SERVICE,
            detail: "workflow has no LoadImage node".to_string(),
        });
    }
    Ok(())
}

pub struct ImageEditPipeline {
    ctx: PipelineContext,
    client: reqwest::Client,
    config: ComfyConfig,
}

impl ImageEditPipeline {
    pub fn new(ctx: PipelineContext, config: ComfyConfig) -> Self {
        Self {
            ctx,
            client: reqwest::Client::new(),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    async fn load_workflow(&self) -> Result<Value, PipelineError> {
        let raw = tokio::fs::read_to_string(&self.config.workflow_path)
            .await
            .map_err(|e| PipelineError::Service {
                service: SERVICE,
                detail: format!("cannot read workflow {}: {}", self.config.workflow_path.display(), e),
            })?;
        serde_json::from_str(&raw).map_err(|e| PipelineError::decode(SERVICE, e))
    }

    fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, PipelineError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(PipelineError::Status {
                service: SERVICE,
                status: response.status().as_u16(),
            })
        }
    }

    async fn upload(&self, image: Vec<u8>) -> Result<String, PipelineError> {
        let part = reqwest::multipart::Part::bytes(image)
            .file_name(format!("whatsapp_{}.jpg", uuid::Uuid::new_v4()))
            .mime_str("image/jpeg")
            .map_err(|e| PipelineError::transport(SERVICE, e))?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("overwrite", "true");

        let response = self
            .client
            .post(self.url("/upload/image"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| PipelineError::transport(SERVICE, e))?;
        let upload: UploadResponse = self
            .check(response)?
            .json()
            .await
            .map_err(|e| PipelineError::decode(SERVICE, e))?;

        if upload.name.is_empty() {
            return Err(PipelineError::decode(SERVICE, "upload returned no file name"));
        }
        Ok(upload.name)
    }

    async fn queue(&self, workflow: &Value) -> Result<String, PipelineError> {
        let request = QueueRequest {
            prompt: workflow,
            client_id: format!("sasi_relay_{}", uuid::Uuid::new_v4()),
        };
        let response = self
            .client
            .post(self.url("/prompt"))
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::transport(SERVICE, e))?;
        let queued: QueueResponse = self
            .check(response)?
            .json()
            .await
            .map_err(|e| PipelineError::decode(SERVICE, e))?;

        if let Some(error) = queued.error.filter(|e| !e.is_null()) {
            return Err(PipelineError::Service {
                service: SERVICE,
                detail: error.to_string(),
            });
        }
        if queued.prompt_id.is_empty() {
            return Err(PipelineError::decode(SERVICE, "no prompt_id in response"));
        }
        Ok(queued.prompt_id)
    }

    /// Poll history until the prompt completes, returning its first image
    async fn wait_for_output(&self, prompt_id: &str) -> Result<OutputImage, PipelineError> {
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(10));
        let url = self.url(&format!("/history/{}", prompt_id));

        loop {
            tokio::time::sleep(interval).await;

            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| PipelineError::transport(SERVICE, e))?;
            if !response.status().is_success() {
                debug!("History poll for {} returned {}", prompt_id, response.status());
                continue;
            }

            let history: HashMap<String, HistoryEntry> = match response.json().await {
                Ok(history) => history,
                Err(e) => {
                    debug!("History for {} not ready: {}", prompt_id, e);
                    continue;
                }
            };
            let Some(entry) = history.get(prompt_id) else {
                continue;
            };

            if entry.status.completed && entry.status.status_str != "success" {
                return Err(PipelineError::Service {
                    service: SERVICE,
                    detail: format!("workflow finished with status '{}'", entry.status.status_str),
                });
            }
            if !entry.status.completed {
                continue;
            }

            let image = entry
                .outputs
                .values()
                .flat_map(|output| output.images.iter())
                .find(|image| image.kind == "output" || image.kind == "image")
                .cloned();
            return image.ok_or_else(|| PipelineError::decode(SERVICE, "workflow produced no image"));
        }
    }

    async fn fetch(&self, image: &OutputImage) -> Result<Vec<u8>, PipelineError> {
        let response = self
            .client
            .get(self.url("/view"))
            .query(&[
                ("filename", image.filename.as_str()),
                ("type", image.kind.as_str()),
                ("subfolder", image.subfolder.as_str()),
            ])
            .send()
            .await
            .map_err(|e| PipelineError::transport(SERVICE, e))?;
        let bytes = self
            .check(response)?
            .bytes()
            .await
            .map_err(|e| PipelineError::transport(SERVICE, e))?;
        Ok(bytes.to_vec())
    }

    async fn edit(&self, source: Vec<u8>, prompt: &str) -> Result<Vec<u8>, PipelineError> {
        let mut workflow = self.load_workflow().await?;
        let uploaded = self.upload(source).await?;
        patch_workflow(&mut workflow, &uploaded, prompt)?;

        let prompt_id = self.queue(&workflow).await?;
        info!("ComfyUI prompt {} queued", prompt_id);

        let output = self.wait_for_output(&prompt_id).await?;
        self.fetch(&output).await
    }
}

#[async_trait]
impl Pipeline for ImageEditPipeline {
    fn intent(&self) -> Intent {
        Intent::ImageEdit
    }

    async fn run(&self, turn: &Turn) -> Result<(), PipelineError> {
        if !self.config.enabled {
            return Err(PipelineError::Disabled(SERVICE));
        }

        let media = turn.event.image_payload().ok_or_else(|| {
            PipelineError::InvalidInput("Please attach an image to edit along with your @img request.".to_string())
        })?;
        let prompt = edit_prompt(turn.text());
        if prompt.is_empty() {
            return Err(PipelineError::InvalidInput(format!(
                "Please describe the edit after {}, e.g. \"{} {} make it a watercolor\".",
                IMAGE_EDIT_TAG,
                self.ctx.router.handle(),
                IMAGE_EDIT_TAG
            )));
        }

        self.ctx
            .dispatcher
            .send_raw("🖌️ Working on your image, please wait...", &turn.event)
            .await?;

        let client = self.ctx.dispatcher.client().clone();
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let edited = with_timeout(SERVICE, timeout, async {
            let source = client.download_media(media).await?;
            self.edit(source, &prompt).await
        })
        .await?;

        self.ctx
            .record_exchange(turn, &format!("{} {}", IMAGE_EDIT_TAG, prompt), "[edited image]")
            .await;
        self.ctx
            .dispatcher
            .send_image(edited, "image/png", "Generated with ComfyUI", &turn.event)
            .await?;
        Ok(())
    }
}
