//! Conversational pipeline: canned answers, the "remember" directive, and
//! language-model replies with session context for threaded follow-ups.

use super::{with_timeout, CannedReplies, ChatModel, Pipeline, PipelineContext, PipelineError, Turn};
use crate::router::Intent;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

static REMEMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)^remember(\s+that)?\b[\s,:]*(.*)$").unwrap());

/// Pull the fact out of "remember ..." / "remember that ..."
pub fn parse_remember(text: &str) -> Option<&str> {
    REMEMBER
        .captures(text.trim())
        .and_then(|caps| caps.get(2))
        .map(|m| m.as_str().trim())
}

/// Build the model prompt for a follow-up in a thread with the bot
pub fn build_threaded_prompt(context: &[String], memories: &[String], message: &str) -> String {
    let mut prompt = String::new();
    if !context.is_empty() {
        prompt.push_str("[CONTEXT]\n");
        prompt.push_str(&context.join("\n"));
        prompt.push_str("\n[/CONTEXT]\n\n");
    }
    if !memories.is_empty() {
        prompt.push_str("[MEMORIES]\n");
        for memory in memories {
            prompt.push_str("- ");
            prompt.push_str(memory);
            prompt.push('\n');
        }
        prompt.push_str("[/MEMORIES]\n\n");
    }
    prompt.push_str("User's message: ");
    prompt.push_str(message);
    prompt
}

pub struct ChatPipeline {
    ctx: PipelineContext,
    model: Arc<dyn ChatModel>,
    canned: CannedReplies,
    timeout: Duration,
}

impl ChatPipeline {
    pub fn new(ctx: PipelineContext, model: Arc<dyn ChatModel>, canned: CannedReplies, timeout: Duration) -> Self {
        Self {
            ctx,
            model,
            canned,
            timeout,
        }
    }

    async fn record(&self, turn: &Turn, line: String) {
        self.ctx.sessions.add_context_line(&turn.session, &line);
        self.ctx.registry.record(&turn.conversation_id, &line).await;
    }

    async fn reply(&self, turn: &Turn, text: &str) -> Result<(), PipelineError> {
        self.record(turn, format!("Bot: {}", text)).await;
        self.ctx.dispatcher.send(text, &turn.event).await?;
        Ok(())
    }
}

#[async_trait]
impl Pipeline for ChatPipeline {
    fn intent(&self) -> Intent {
        Intent::Chat
    }

    async fn run(&self, turn: &Turn) -> Result<(), PipelineError> {
        let clean = self.ctx.router.strip_wake_words(turn.text());
        if clean.is_empty() {
            return Err(PipelineError::InvalidInput(
                "Hi! Ask me something after mentioning my name.".to_string(),
            ));
        }

        self.record(turn, format!("User: {}", clean)).await;

        if let Some(fact) = parse_remember(&clean) {
            if fact.is_empty() {
                return Err(PipelineError::InvalidInput(
                    "What should I remember? Try \"remember that I like tea\".".to_string(),
                ));
            }
            let is_new = self.ctx.memory_sync.remember(&turn.session, fact).await?;
            info!("Stored memory for {} (new: {})", turn.session, is_new);
            let ack = if is_new {
                "Got it, I'll remember that. 🧠"
            } else {
                "I already knew that. 🧠"
            };
            return self.reply(turn, ack).await;
        }

        if let Some(canned) = self.canned.check(&clean) {
            debug!("Canned reply for {}", turn.session);
            return self.reply(turn, &canned).await;
        }

        let prompt = if turn.is_reply_to_bot {
            let context = self.ctx.sessions.get_context(&turn.session);
            let memories: Vec<String> = self
                .ctx
                .sessions
                .get_memories(&turn.session)
                .into_iter()
                .map(|m| m.content)
                .collect();
            build_threaded_prompt(&context, &memories, &clean)
        } else {
            clean.clone()
        };

        let answer = with_timeout("chat", self.timeout, self.model.complete(&prompt, &[])).await?;
        self.reply(turn, &answer).await
    }
}
