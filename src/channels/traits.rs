//! Channel Trait Definitions
//!
//! The inbound event shape delivered by the messaging bridge and the narrow
//! client interface the relay uses to talk back to the network.

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Error types for network operations
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Media upload failed: {0}")]
    MediaUploadFailed(String),

    #[error("Media download failed: {0}")]
    MediaDownloadFailed(String),

    #[error("Group lookup failed: {0}")]
    GroupLookupFailed(String),

    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    #[error("Channel not ready")]
    NotReady,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Reply metadata attached to a message that quotes another one
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyContext {
    /// ID of the quoted message
    pub stanza_id: Option<String>,
    /// Author of the quoted message
    pub participant: Option<String>,
    /// Text of the quoted message, when the bridge forwards it
    pub quoted_text: Option<String>,
}

/// Media sub-payload (image, video, audio, document)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaPayload {
    pub caption: Option<String>,
    pub mime_type: Option<String>,
    /// Location the bridge serves the decrypted media from
    pub url: Option<String>,
    /// Inline base64 data for small media
    pub data: Option<String>,
    pub context: Option<ReplyContext>,
}

/// Message body. Exactly one variant is populated per event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    Conversation {
        text: String,
    },
    ExtendedText {
        text: String,
        #[serde(default)]
        context: Option<ReplyContext>,
    },
    Image(MediaPayload),
    Video(MediaPayload),
    Audio(MediaPayload),
    Document(MediaPayload),
    #[serde(other)]
    Unsupported,
}

/// Inbound network event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Network message ID (empty when the bridge could not supply one)
    #[serde(default)]
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub timestamp: i64,
    pub message: MessagePayload,
}

impl InboundEvent {
    /// Plain text group message
    pub fn text(id: &str, chat_id: &str, sender_id: &str, text: &str) -> Self {
        Self {
            id: id.to_string(),
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            push_name: None,
            is_group: true,
            timestamp: chrono::Utc::now().timestamp(),
            message: MessagePayload::Conversation {
                text: text.to_string(),
            },
        }
    }

    /// Group image message with optional caption and inline data
    pub fn image(id: &str, chat_id: &str, sender_id: &str, caption: Option<&str>, data: &[u8]) -> Self {
        Self {
            id: id.to_string(),
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            push_name: None,
            is_group: true,
            timestamp: chrono::Utc::now().timestamp(),
            message: MessagePayload::Image(MediaPayload {
                caption: caption.map(str::to_string),
                mime_type: Some("image/jpeg".to_string()),
                url: None,
                data: Some(base64::engine::general_purpose::STANDARD.encode(data)),
                context: None,
            }),
        }
    }

    /// Turn this event into a reply quoting a message by `participant`
    pub fn replying_to(mut self, stanza_id: &str, participant: &str) -> Self {
        let context = ReplyContext {
            stanza_id: Some(stanza_id.to_string()),
            participant: Some(participant.to_string()),
            quoted_text: None,
        };
        self.message = match self.message {
            MessagePayload::Conversation { text } | MessagePayload::ExtendedText { text, .. } => {
                MessagePayload::ExtendedText {
                    text,
                    context: Some(context),
                }
            }
            MessagePayload::Image(mut media) => {
                media.context = Some(context);
                MessagePayload::Image(media)
            }
            MessagePayload::Video(mut media) => {
                media.context = Some(context);
                MessagePayload::Video(media)
            }
            MessagePayload::Audio(mut media) => {
                media.context = Some(context);
                MessagePayload::Audio(media)
            }
            MessagePayload::Document(mut media) => {
                media.context = Some(context);
                MessagePayload::Document(media)
            }
            MessagePayload::Unsupported => MessagePayload::Unsupported,
        };
        self
    }

    pub fn is_group_chat(&self) -> bool {
        self.is_group
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Text of the message: body text, or the image caption
    pub fn extract_text(&self) -> Option<&str> {
        let text = match &self.message {
            MessagePayload::Conversation { text } => Some(text.as_str()),
            MessagePayload::ExtendedText { text, .. } => Some(text.as_str()),
            MessagePayload::Image(media) => media.caption.as_deref(),
            _ => None,
        };
        text.map(str::trim).filter(|t| !t.is_empty())
    }

    pub fn has_image(&self) -> bool {
        matches!(self.message, MessagePayload::Image(_))
    }

    pub fn image_payload(&self) -> Option<&MediaPayload> {
        match &self.message {
            MessagePayload::Image(media) => Some(media),
            _ => None,
        }
    }

    /// Reply metadata from whichever sub-payload is populated
    pub fn extract_reply_context(&self) -> Option<&ReplyContext> {
        match &self.message {
            MessagePayload::ExtendedText { context, .. } => context.as_ref(),
            MessagePayload::Image(media)
            | MessagePayload::Video(media)
            | MessagePayload::Audio(media)
            | MessagePayload::Document(media) => media.context.as_ref(),
            MessagePayload::Conversation { .. } | MessagePayload::Unsupported => None,
        }
    }

    /// Threading metadata for a reply to this event
    pub fn reply_meta(&self) -> ReplyMeta {
        ReplyMeta {
            stanza_id: self.id.clone(),
            participant: self.sender_id.clone(),
            quoted_text: self.extract_text().map(str::to_string),
        }
    }
}

/// Threading metadata attached to an outbound reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyMeta {
    pub stanza_id: String,
    pub participant: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quoted_text: Option<String>,
}

/// Handle to media uploaded to the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub id: String,
    pub mime_type: String,
}

/// Group metadata as reported by the network
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupMetadata {
    pub id: String,
    pub name: String,
    pub member_count: usize,
}

/// Network client interface used by the relay
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Network name, used as the conversation ID prefix
    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// The bot's own account identity, if known
    fn own_identity(&self) -> Option<String>;

    /// Send a text message, returns the network message ID
    async fn send_text(
        &self,
        chat_id: &str,
        text: &str,
        reply: Option<&ReplyMeta>,
    ) -> Result<String, ChannelError>;

    async fn upload_media(&self, bytes: Vec<u8>, mime_type: &str) -> Result<MediaRef, ChannelError>;

    async fn send_image(
        &self,
        chat_id: &str,
        media: &MediaRef,
        caption: &str,
        reply: Option<&ReplyMeta>,
    ) -> Result<String, ChannelError>;

    async fn group_metadata(&self, chat_id: &str) -> Result<GroupMetadata, ChannelError>;

    async fn joined_groups(&self) -> Result<Vec<GroupMetadata>, ChannelError>;

    /// Fetch media bytes. Inline data is decoded without a network call.
    async fn download_media(&self, media: &MediaPayload) -> Result<Vec<u8>, ChannelError> {
        decode_inline_media(media)
    }
}

/// Decode base64 data carried inline in a media payload
pub fn decode_inline_media(media: &MediaPayload) -> Result<Vec<u8>, ChannelError> {
    let data = media
        .data
        .as_deref()
        .ok_or_else(|| ChannelError::MediaDownloadFailed("no inline media data".to_string()))?;
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| ChannelError::MediaDownloadFailed(format!("invalid base64: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_extended_text_with_context() {
        let raw = r#"{
            "id": "ABC",
            "chat_id": "1203@g.us",
            "sender_id": "4477@s.whatsapp.net",
            "is_group": true,
            "message": {
                "type": "extended_text",
                "text": "thanks!",
                "context": {"stanza_id": "XYZ", "participant": "1555:3@s.whatsapp.net"}
            }
        }"#;

        let event: InboundEvent = serde_json::from_str(raw).unwrap();
        assert!(event.is_group_chat());
        assert_eq!(event.extract_text(), Some("thanks!"));
        let ctx = event.extract_reply_context().unwrap();
        assert_eq!(ctx.participant.as_deref(), Some("1555:3@s.whatsapp.net"));
    }

    #[test]
    fn test_unknown_payload_type_is_unsupported() {
        let raw = r#"{"chat_id":"c","sender_id":"s","message":{"type":"sticker"}}"#;
        let event: InboundEvent = serde_json::from_str(raw).unwrap();
        assert!(matches!(event.message, MessagePayload::Unsupported));
        assert_eq!(event.extract_text(), None);
        assert!(event.id.is_empty());
    }

    #[test]
    fn test_image_caption_is_text() {
        let event = InboundEvent::image("1", "g", "u", Some("  @sasi look  "), b"png");
        assert!(event.has_image());
        assert_eq!(event.extract_text(), Some("@sasi look"));

        let bare = InboundEvent::image("2", "g", "u", None, b"png");
        assert_eq!(bare.extract_text(), None);
    }

    #[test]
    fn test_replying_to_attaches_context() {
        let event = InboundEvent::image("1", "g", "u", None, b"x").replying_to("S1", "bot@s.whatsapp.net");
        let ctx = event.extract_reply_context().unwrap();
        assert_eq!(ctx.stanza_id.as_deref(), Some("S1"));
        assert!(event.has_image());
    }

    #[test]
    fn test_decode_inline_media() {
        let event = InboundEvent::image("1", "g", "u", None, b"hello");
        let bytes = decode_inline_media(event.image_payload().unwrap()).unwrap();
        assert_eq!(bytes, b"hello");

        let err = decode_inline_media(&MediaPayload::default()).unwrap_err();
        assert!(matches!(err, ChannelError::MediaDownloadFailed(_)));
    }

    #[test]
    fn test_reply_meta_quotes_event() {
        let event = InboundEvent::text("M1", "g", "alice", "hello bot");
        let meta = event.reply_meta();
        assert_eq!(meta.stanza_id, "M1");
        assert_eq!(meta.participant, "alice");
        assert_eq!(meta.quoted_text.as_deref(), Some("hello bot"));
    }
}
