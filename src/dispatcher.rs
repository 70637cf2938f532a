//! Outbound Dispatcher
//!
//! Every reply goes through here: connection check, rate-limit token,
//! threading metadata, then the network call under a send timeout.

use crate::channels::{ChannelError, InboundEvent, NetworkClient, TokenBucket};
use crate::formatter::format_message;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Dispatch counters
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub sent: AtomicU64,
    pub failed: AtomicU64,
}

/// Sends replies threaded to the event that triggered them
pub struct OutboundDispatcher {
    client: Arc<dyn NetworkClient>,
    limiter: Arc<TokenBucket>,
    send_timeout: Duration,
    stats: DispatchStats,
}

impl OutboundDispatcher {
    pub fn new(client: Arc<dyn NetworkClient>, limiter: Arc<TokenBucket>, send_timeout: Duration) -> Self {
        Self {
            client,
            limiter,
            send_timeout,
            stats: DispatchStats::default(),
        }
    }

    pub fn client(&self) -> &Arc<dyn NetworkClient> {
        &self.client
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Format and send a threaded text reply
    pub async fn send(&self, text: &str, reply_to: &InboundEvent) -> Result<String, ChannelError> {
        self.deliver_text(&format_message(text), reply_to).await
    }

    /// Send a threaded text reply without cosmetic formatting
    pub async fn send_raw(&self, text: &str, reply_to: &InboundEvent) -> Result<String, ChannelError> {
        self.deliver_text(text, reply_to).await
    }

    /// Upload image bytes and send them as a threaded reply
    pub async fn send_image(
        &self,
        bytes: Vec<u8>,
        mime_type: &str,
        caption: &str,
        reply_to: &InboundEvent,
    ) -> Result<String, ChannelError> {
        self.ensure_connected()?;
        self.limiter.acquire().await;

        let meta = reply_to.reply_meta();
        let result = self
            .with_timeout(async {
                let media = self.client.upload_media(bytes, mime_type).await?;
                self.client
                    .send_image(reply_to.chat_id(), &media, caption, Some(&meta))
                    .await
            })
            .await;
        self.record(result, reply_to.chat_id())
    }

    async fn deliver_text(&self, text: &str, reply_to: &InboundEvent) -> Result<String, ChannelError> {
        if text.trim().is_empty() {
            return Err(ChannelError::SendFailed("refusing to send an empty message".to_string()));
        }
        self.ensure_connected()?;
        self.limiter.acquire().await;

        let meta = reply_to.reply_meta();
        let result = self
            .with_timeout(self.client.send_text(reply_to.chat_id(), text, Some(&meta)))
            .await;
        self.record(result, reply_to.chat_id())
    }

    fn ensure_connected(&self) -> Result<(), ChannelError> {
        if self.client.is_connected() {
            Ok(())
        } else {
            error!("Cannot send reply: network client not connected");
            Err(ChannelError::NotReady)
        }
    }

    async fn with_timeout<F>(&self, send: F) -> Result<String, ChannelError>
    where
        F: std::future::Future<Output = Result<String, ChannelError>>,
    {
        match tokio::time::timeout(self.send_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout(self.send_timeout.as_secs())),
        }
    }

    fn record(&self, result: Result<String, ChannelError>, chat_id: &str) -> Result<String, ChannelError> {
        match &result {
            Ok(id) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                debug!("Reply {} delivered to {}", id, chat_id);
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!("Failed to send reply to {}: {}", chat_id, e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::RateLimitConfig;
    use crate::testing::{FakeNetwork, Sent};

    fn dispatcher(network: Arc<FakeNetwork>) -> OutboundDispatcher {
        OutboundDispatcher::new(
            network,
            Arc::new(TokenBucket::new(&RateLimitConfig::default())),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_send_formats_and_threads() {
        let network = Arc::new(FakeNetwork::new());
        let d = dispatcher(network.clone());
        let event = InboundEvent::text("M1", "g@g.us", "alice", "@sasi list please");

        d.send("- apples\n- pears", &event).await.unwrap();

        let sent = network.sent();
        assert_eq!(sent.len(), 1);
        let Sent::Text { chat_id, text, reply } = &sent[0] else {
            panic!("expected a text message");
        };
        assert_eq!(chat_id, "g@g.us");
        assert_eq!(text, "• apples\n• pears");
        let reply = reply.as_ref().unwrap();
        assert_eq!(reply.stanza_id, "M1");
        assert_eq!(reply.participant, "alice");
        assert_eq!(reply.quoted_text.as_deref(), Some("@sasi list please"));
    }

    #[tokio::test]
    async fn test_send_raw_skips_formatting() {
        let network = Arc::new(FakeNetwork::new());
        let d = dispatcher(network.clone());
        let event = InboundEvent::text("M1", "g@g.us", "alice", "hi");

        d.send_raw("# keep me", &event).await.unwrap();
        assert_eq!(network.sent_texts(), vec!["# keep me"]);
    }

    #[tokio::test]
    async fn test_not_connected() {
        let network = Arc::new(FakeNetwork::new());
        network.set_connected(false);
        let d = dispatcher(network.clone());
        let event = InboundEvent::text("M1", "g@g.us", "alice", "hi");

        let err = d.send("hello", &event).await.unwrap_err();
        assert!(matches!(err, ChannelError::NotReady));
        assert!(network.sent().is_empty());
        assert_eq!(d.stats().sent.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_send_image_uploads_first() {
        let network = Arc::new(FakeNetwork::new());
        let d = dispatcher(network.clone());
        let event = InboundEvent::text("M1", "g@g.us", "alice", "draw");

        d.send_image(vec![1, 2, 3], "image/png", "🎨 cat", &event).await.unwrap();

        let sent = network.sent();
        assert!(matches!(&sent[0], Sent::Image { caption, bytes, .. } if caption == "🎨 cat" && bytes.len() == 3));
    }

    #[tokio::test]
    async fn test_transport_failure_counted() {
        let network = Arc::new(FakeNetwork::new());
        network.fail_sends(true);
        let d = dispatcher(network.clone());
        let event = InboundEvent::text("M1", "g@g.us", "alice", "hi");

        assert!(d.send("hello", &event).await.is_err());
        assert_eq!(d.stats().failed.load(Ordering::Relaxed), 1);
    }
}
