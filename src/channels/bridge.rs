//! WhatsApp Bridge Client
//!
//! Talks to a sidecar bridge process that owns the WhatsApp Web session
//! (pairing, encryption, media transport). The bridge POSTs inbound events to
//! the relay's `/events` endpoint and exposes a small REST API for the reverse
//! direction.
//!
//! # Bridge API
//!
//! - `GET  /status` - `{connected, jid}`
//! - `POST /messages/text` - send text, optionally threaded
//! - `POST /messages/image` - send an uploaded image
//! - `POST /media` - upload raw bytes, returns a media reference
//! - `GET  /groups`, `GET /groups/{jid}` - group metadata
//!
//! # Configuration
//!
//! - `SASI_BRIDGE_URL`: bridge base URL (default `http://127.0.0.1:3000`)
//! - `SASI_BRIDGE_TOKEN`: bearer token, if the bridge requires one

use super::traits::*;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Bridge client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Base URL of the bridge REST API
    pub base_url: String,
    /// Bearer token for the bridge API
    pub api_token: Option<String>,
    /// Per-request timeout (send, upload, lookup)
    pub request_timeout_secs: u64,
    /// How often the connection status is refreshed
    pub status_poll_secs: u64,
    /// Maximum message length (WhatsApp limit: 4096)
    pub max_message_length: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_string(),
            api_token: None,
            request_timeout_secs: 30,
            status_poll_secs: 15,
            max_message_length: 4096,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    connected: bool,
    #[serde(default)]
    jid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct SendTextRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply: Option<&'a ReplyMeta>,
}

#[derive(Debug, Serialize)]
struct SendImageRequest<'a> {
    chat_id: &'a str,
    media_id: &'a str,
    mime_type: &'a str,
    caption: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply: Option<&'a ReplyMeta>,
}

/// WhatsApp network client backed by the bridge
pub struct BridgeClient {
    config: BridgeConfig,
    client: reqwest::Client,
    connected: AtomicBool,
    identity: RwLock<Option<String>>,
}

impl BridgeClient {
    pub fn new(config: BridgeConfig) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ChannelError::Internal(e.to_string()))?;

        Ok(Self {
            config,
            client,
            connected: AtomicBool::new(false),
            identity: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn map_transport(&self, e: reqwest::Error) -> ChannelError {
        if e.is_timeout() {
            ChannelError::Timeout(self.config.request_timeout_secs)
        } else if e.is_connect() {
            ChannelError::ConnectionFailed(e.to_string())
        } else {
            ChannelError::SendFailed(e.to_string())
        }
    }

    /// Poll the bridge for connection state and the bot's own JID
    pub async fn refresh_status(&self) -> Result<bool, ChannelError> {
        let response = self
            .authorized(self.client.get(self.url("/status")))
            .send()
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            self.connected.store(false, Ordering::Relaxed);
            return Err(ChannelError::ConnectionFailed(format!(
                "bridge status returned {}",
                response.status()
            )));
        }

        let status: StatusResponse = response
            .json()
            .await
            .map_err(|e| ChannelError::Internal(e.to_string()))?;

        let was_connected = self.connected.swap(status.connected, Ordering::Relaxed);
        if status.connected != was_connected {
            info!(
                "Bridge connection state changed: {}",
                if status.connected { "connected" } else { "disconnected" }
            );
        }
        if let Some(jid) = status.jid {
            *self.identity.write() = Some(jid);
        }
        Ok(status.connected)
    }

    /// Keep the connection state fresh until shutdown is signalled
    pub async fn watch_status(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.status_poll_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_status().await {
                        self.connected.store(false, Ordering::Relaxed);
                        warn!("Bridge status check failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Bridge status watcher stopping");
                    return;
                }
            }
        }
    }

    /// Split long messages into chunks
    fn split_message(&self, content: &str) -> Vec<String> {
        let max_len = self.config.max_message_length;
        if content.len() <= max_len {
            return vec![content.to_string()];
        }

        let mut chunks = Vec::new();
        let mut current = String::new();

        for line in content.lines() {
            if current.len() + line.len() + 1 > max_len {
                if !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                }

                if line.len() > max_len {
                    let mut piece = String::new();
                    for ch in line.chars() {
                        if piece.len() + ch.len_utf8() > max_len {
                            chunks.push(std::mem::take(&mut piece));
                        }
                        piece.push(ch);
                    }
                    current = piece;
                } else {
                    current = line.to_string();
                }
            } else {
                if !current.is_empty() {
                    current.push('\n');
                }
                current.push_str(line);
            }
        }

        if !current.is_empty() {
            chunks.push(current);
        }

        chunks
    }

    async fn post_send<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<String, ChannelError> {
        let response = self
            .authorized(self.client.post(self.url(path)))
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed(format!(
                "bridge error {}: {}",
                status, error_text
            )));
        }

        let result: SendResponse = response
            .json()
            .await
            .map_err(|e| ChannelError::Internal(e.to_string()))?;
        Ok(result.id)
    }
}

#[async_trait]
impl NetworkClient for BridgeClient {
    fn name(&self) -> &str {
        "whatsapp"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn own_identity(&self) -> Option<String> {
        self.identity.read().clone()
    }

    async fn send_text(
        &self,
        chat_id: &str,
        text: &str,
        reply: Option<&ReplyMeta>,
    ) -> Result<String, ChannelError> {
        let chunks = self.split_message(text);
        let mut last_id = String::new();

        for (i, chunk) in chunks.iter().enumerate() {
            // Only the first chunk is threaded
            let request = SendTextRequest {
                chat_id,
                text: chunk,
                reply: if i == 0 { reply } else { None },
            };
            last_id = self.post_send("/messages/text", &request).await?;

            // Small delay between chunks to maintain order
            if i < chunks.len() - 1 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        debug!("Sent {} chunk(s) to {}", chunks.len(), chat_id);
        Ok(last_id)
    }

    async fn upload_media(&self, bytes: Vec<u8>, mime_type: &str) -> Result<MediaRef, ChannelError> {
        let size = bytes.len();
        let response = self
            .authorized(self.client.post(self.url("/media")))
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| ChannelError::MediaUploadFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChannelError::MediaUploadFailed(format!(
                "bridge returned {}",
                response.status()
            )));
        }

        let media: MediaRef = response
            .json()
            .await
            .map_err(|e| ChannelError::MediaUploadFailed(e.to_string()))?;
        debug!("Uploaded {} bytes as {}", size, media.id);
        Ok(media)
    }

    async fn send_image(
        &self,
        chat_id: &str,
        media: &MediaRef,
        caption: &str,
        reply: Option<&ReplyMeta>,
    ) -> Result<String, ChannelError> {
        let request = SendImageRequest {
            chat_id,
            media_id: &media.id,
            mime_type: &media.mime_type,
            caption,
            reply,
        };
        self.post_send("/messages/image", &request).await
    }

    async fn group_metadata(&self, chat_id: &str) -> Result<GroupMetadata, ChannelError> {
        let response = self
            .authorized(self.client.get(self.url(&format!("/groups/{}", chat_id))))
            .send()
            .await
            .map_err(|e| ChannelError::GroupLookupFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChannelError::GroupLookupFailed(format!(
                "bridge returned {} for {}",
                response.status(),
                chat_id
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ChannelError::GroupLookupFailed(e.to_string()))
    }

    async fn joined_groups(&self) -> Result<Vec<GroupMetadata>, ChannelError> {
        let response = self
            .authorized(self.client.get(self.url("/groups")))
            .send()
            .await
            .map_err(|e| ChannelError::GroupLookupFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChannelError::GroupLookupFailed(format!(
                "bridge returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ChannelError::GroupLookupFailed(e.to_string()))
    }

    async fn download_media(&self, media: &MediaPayload) -> Result<Vec<u8>, ChannelError> {
        if media.data.is_some() {
            return decode_inline_media(media);
        }

        let url = media
            .url
            .as_deref()
            .ok_or_else(|| ChannelError::MediaDownloadFailed("media has no data or url".to_string()))?;
        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            self.url(url)
        };

        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ChannelError::MediaDownloadFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChannelError::MediaDownloadFailed(format!(
                "bridge returned {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ChannelError::MediaDownloadFailed(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}
