//! Messaging Network Plumbing
//!
//! - `traits`: inbound event shape and the `NetworkClient` interface
//! - `bridge`: WhatsApp bridge client
//! - `rate_limit`: outbound token bucket

pub mod bridge;
pub mod rate_limit;
pub mod traits;

pub use bridge::{BridgeClient, BridgeConfig};
pub use rate_limit::{RateLimitConfig, RateLimitStats, TokenBucket};
pub use traits::{
    decode_inline_media, ChannelError, GroupMetadata, InboundEvent, MediaPayload, MediaRef, MessagePayload,
    NetworkClient, ReplyContext, ReplyMeta,
};
