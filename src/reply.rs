//! Reply-Thread Detection
//!
//! Decides whether an inbound message replies to something the bot sent.
//! Identities are compared on their primary segment only, so
//! `15551234:12@s.whatsapp.net` (a linked device) matches `15551234@s.whatsapp.net`.

use crate::channels::InboundEvent;

/// Primary identity segment: before `@`, then before `:`
pub fn normalize_identity(identity: &str) -> &str {
    let user = identity.split('@').next().unwrap_or(identity);
    user.split(':').next().unwrap_or(user).trim()
}

/// True when `event` quotes a message authored by `bot_identity`
pub fn is_reply_to_bot(event: &InboundEvent, bot_identity: Option<&str>) -> bool {
    let Some(bot) = bot_identity.map(normalize_identity).filter(|b| !b.is_empty()) else {
        return false;
    };
    let Some(context) = event.extract_reply_context() else {
        return false;
    };
    if context.stanza_id.is_none() {
        return false;
    }

    context
        .participant
        .as_deref()
        .map(normalize_identity)
        .is_some_and(|participant| participant == bot)
}
