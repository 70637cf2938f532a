//! Shared doubles for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use sasi_relay::channels::{ChannelError, GroupMetadata, MediaRef, NetworkClient, ReplyMeta};
use sasi_relay::pipelines::{ChatModel, PipelineError};
use std::sync::atomic::{AtomicBool, Ordering};

pub const BOT_JID: &str = "15550000:4@s.whatsapp.net";
pub const GROUP: &str = "120363000000000001@g.us";

/// Network client that records outgoing text
pub struct RecordingNetwork {
    connected: AtomicBool,
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNetwork {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, text)| text.clone()).collect()
    }
}

#[async_trait]
impl NetworkClient for RecordingNetwork {
    fn name(&self) -> &str {
        "whatsapp"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn own_identity(&self) -> Option<String> {
        Some(BOT_JID.to_string())
    }

    async fn send_text(&self, chat_id: &str, text: &str, _reply: Option<&ReplyMeta>) -> Result<String, ChannelError> {
        let mut sent = self.sent.lock();
        sent.push((chat_id.to_string(), text.to_string()));
        Ok(format!("OUT{}", sent.len()))
    }

    async fn upload_media(&self, _bytes: Vec<u8>, mime_type: &str) -> Result<MediaRef, ChannelError> {
        Ok(MediaRef {
            id: "media-1".to_string(),
            mime_type: mime_type.to_string(),
        })
    }

    async fn send_image(
        &self,
        chat_id: &str,
        _media: &MediaRef,
        caption: &str,
        _reply: Option<&ReplyMeta>,
    ) -> Result<String, ChannelError> {
        let mut sent = self.sent.lock();
        sent.push((chat_id.to_string(), caption.to_string()));
        Ok(format!("OUT{}", sent.len()))
    }

    async fn group_metadata(&self, chat_id: &str) -> Result<GroupMetadata, ChannelError> {
        Ok(GroupMetadata {
            id: chat_id.to_string(),
            name: "Family".to_string(),
            member_count: 4,
        })
    }

    async fn joined_groups(&self) -> Result<Vec<GroupMetadata>, ChannelError> {
        Ok(vec![self.group_metadata(GROUP).await?])
    }
}

/// Model with a fixed answer
pub struct CannedModel(pub &'static str);

#[async_trait]
impl ChatModel for CannedModel {
    async fn complete(&self, _prompt: &str, _images: &[Vec<u8>]) -> Result<String, PipelineError> {
        Ok(self.0.to_string())
    }
}
