//! Intent Router
//!
//! Decides which response pipeline owns an inbound message. Rules are an
//! ordered list of predicates evaluated first-match-wins; several trigger tags
//! overlap (an image caption can also mention food), so the order is fixed.
//!
//! A message must carry a wake word or reply to the bot before any rule is
//! tried. Matching is case-insensitive substring containment. No tokenization.

use crate::config::BotConfig;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

pub const IMAGE_EDIT_TAG: &str = "@img";
pub const IMAGE_GEN_TAG: &str = "@image";
pub const FAMILY_TAG: &str = "@family";
pub const FOOD_TAG: &str = "@food";
pub const WEB_TAG: &str = "@web";

/// Response pipelines, in routing priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    ImageEdit,
    ImageGeneration,
    Family,
    ImageAnalysis,
    Food,
    WebSearch,
    Chat,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::ImageEdit => "image_edit",
            Intent::ImageGeneration => "image_generation",
            Intent::Family => "family",
            Intent::ImageAnalysis => "image_analysis",
            Intent::Food => "food",
            Intent::WebSearch => "web_search",
            Intent::Chat => "chat",
        }
    }
}

/// Why a message was not dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Neither a trigger, a wake word nor a reply to the bot
    NoTrigger,
    /// Addressed to the bot but nothing to answer (e.g. bare image)
    NoText,
}

/// Routing outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Dispatch(Intent),
    Drop(DropReason),
}

/// Which optional pipelines are switched on
#[derive(Debug, Clone, Copy)]
pub struct EnabledPipelines {
    pub image_edit: bool,
    pub image_generation: bool,
    pub family: bool,
    pub food: bool,
    pub web: bool,
}

impl Default for EnabledPipelines {
    fn default() -> Self {
        Self {
            image_edit: true,
            image_generation: true,
            family: true,
            food: true,
            web: true,
        }
    }
}

/// Facts about one message the rules are evaluated against
#[derive(Debug)]
pub struct Signals {
    pub lower: String,
    pub has_text: bool,
    pub has_image: bool,
    pub is_reply_to_bot: bool,
    /// Any wake word (plural list, then the legacy single word)
    pub is_mention: bool,
    /// A wake word from the plural list specifically
    pub has_listed_wake_word: bool,
}

type Predicate = fn(&IntentRouter, &Signals) -> bool;

struct Rule {
    intent: Intent,
    matches: Predicate,
}

fn image_edit(r: &IntentRouter, s: &Signals) -> bool {
    r.enabled.image_edit && s.lower.contains(r.handle.as_str()) && s.lower.contains(IMAGE_EDIT_TAG)
}

fn image_generation(r: &IntentRouter, s: &Signals) -> bool {
    r.enabled.image_generation && s.lower.contains(r.handle.as_str()) && s.lower.contains(IMAGE_GEN_TAG)
}

fn family(r: &IntentRouter, s: &Signals) -> bool {
    r.enabled.family && s.lower.contains(FAMILY_TAG)
}

fn image_analysis(_: &IntentRouter, s: &Signals) -> bool {
    s.has_image && (s.is_reply_to_bot || (s.has_text && s.is_mention))
}

fn food(r: &IntentRouter, s: &Signals) -> bool {
    r.enabled.food && s.lower.contains(FOOD_TAG)
}

fn web_search(r: &IntentRouter, s: &Signals) -> bool {
    r.enabled.web && s.lower.contains(WEB_TAG) && s.has_listed_wake_word
}

fn chat(_: &IntentRouter, s: &Signals) -> bool {
    s.has_text && (s.is_mention || s.is_reply_to_bot)
}

/// Routing table. Do not reorder without re-checking tag overlaps.
const RULES: &[Rule] = &[
    Rule { intent: Intent::ImageEdit, matches: image_edit },
    Rule { intent: Intent::ImageGeneration, matches: image_generation },
    Rule { intent: Intent::Family, matches: family },
    Rule { intent: Intent::ImageAnalysis, matches: image_analysis },
    Rule { intent: Intent::Food, matches: food },
    Rule { intent: Intent::WebSearch, matches: web_search },
    Rule { intent: Intent::Chat, matches: chat },
];

/// Intent classifier over configured wake words and trigger tags
pub struct IntentRouter {
    wake_words: Vec<String>,
    legacy_wake_word: Option<String>,
    handle: String,
    enabled: EnabledPipelines,
    wake_pattern: Option<Regex>,
}

impl IntentRouter {
    pub fn new(bot: &BotConfig, enabled: EnabledPipelines) -> Self {
        let wake_words: Vec<String> = bot
            .trigger_words
            .iter()
            .map(|w| w.trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();
        let legacy_wake_word = bot
            .trigger_word
            .as_deref()
            .map(|w| w.trim().to_lowercase())
            .filter(|w| !w.is_empty());

        let mut all_words: Vec<&str> = wake_words.iter().map(String::as_str).collect();
        if let Some(legacy) = &legacy_wake_word {
            all_words.push(legacy);
        }
        let wake_pattern = build_pattern(&all_words);

        Self {
            wake_words,
            legacy_wake_word,
            handle: bot.handle.trim().to_lowercase(),
            enabled,
            wake_pattern,
        }
    }

    /// Compute the routing signals for a message
    pub fn signals(&self, text: Option<&str>, has_image: bool, is_reply_to_bot: bool) -> Signals {
        let lower = text.unwrap_or_default().to_lowercase();
        let has_listed_wake_word = self.wake_words.iter().any(|w| lower.contains(w.as_str()));
        let is_mention = has_listed_wake_word
            || self
                .legacy_wake_word
                .as_deref()
                .is_some_and(|w| lower.contains(w));

        Signals {
            has_text: !lower.trim().is_empty(),
            lower,
            has_image,
            is_reply_to_bot,
            is_mention,
            has_listed_wake_word,
        }
    }

    /// Route a message, first matching rule wins
    pub fn route(&self, text: Option<&str>, has_image: bool, is_reply_to_bot: bool) -> Route {
        let signals = self.signals(text, has_image, is_reply_to_bot);
        self.route_signals(&signals)
    }

    pub fn route_signals(&self, signals: &Signals) -> Route {
        // Unaddressed messages never reach a rule, tags included
        if !signals.is_mention && !signals.is_reply_to_bot {
            return Route::Drop(DropReason::NoTrigger);
        }

        if let Some(rule) = RULES.iter().find(|rule| (rule.matches)(self, signals)) {
            debug!("Routed to {}", rule.intent.as_str());
            return Route::Dispatch(rule.intent);
        }

        if (signals.is_mention || signals.is_reply_to_bot) && !signals.has_text {
            Route::Drop(DropReason::NoText)
        } else {
            Route::Drop(DropReason::NoTrigger)
        }
    }

    /// Does the text carry any wake word?
    pub fn is_mention(&self, text: &str) -> bool {
        self.signals(Some(text), false, false).is_mention
    }

    /// Remove every wake word, case-insensitively, and tidy whitespace
    pub fn strip_wake_words(&self, text: &str) -> String {
        match &self.wake_pattern {
            Some(pattern) => collapse_whitespace(&pattern.replace_all(text, " ")),
            None => collapse_whitespace(text),
        }
    }

    /// Remove wake words plus extra tags such as `@food`
    pub fn strip_with_tags(&self, text: &str, tags: &[&str]) -> String {
        let stripped = self.strip_wake_words(text);
        remove_terms(&stripped, tags)
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }
}

/// Case-insensitive removal of literal terms
pub fn remove_terms(text: &str, terms: &[&str]) -> String {
    match build_pattern(terms) {
        Some(pattern) => collapse_whitespace(&pattern.replace_all(text, " ")),
        None => collapse_whitespace(text),
    }
}

fn build_pattern(terms: &[&str]) -> Option<Regex> {
    let mut terms: Vec<&str> = terms.iter().copied().filter(|t| !t.trim().is_empty()).collect();
    if terms.is_empty() {
        return None;
    }
    // Longest first so "@sasi" wins over "sasi"
    terms.sort_by_key(|t| std::cmp::Reverse(t.len()));
    let alternation = terms.iter().map(|t| regex::escape(t)).collect::<Vec<_>>().join("|");
    Regex::new(&format!("(?i){}", alternation)).ok()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
