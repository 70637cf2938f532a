//! Outbound Message Formatter
//!
//! Cosmetic markdown-to-WhatsApp rewriting: heading and list emoji, inline
//! code, link markers, note callouts, greetings. Pure text transform.
//! Fenced code blocks pass through untouched.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static H1: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#\s+(.+)$").unwrap());
static H2: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^##\s+(.+)$").unwrap());
static H3: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^###\s+(.+)$").unwrap());
static BULLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[*\-]\s+(.+)$").unwrap());
static NUMBERED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^(\d+)\.\s+(.+)$").unwrap());
static INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`\n]+)`").unwrap());
static LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[([^\]]+)\]\((https?://[^)\s]+)\)|(https?://[^\s)]+)").unwrap()
});
static CALLOUT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^(note|warning|tip|important):").unwrap());
static GREETING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(hi|hello|hey|greetings)\b").unwrap());
static THANKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(thank you|thanks)\b").unwrap());

static TOPICS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(?i)\b(weather|temperature|forecast)\b", "🌤️"),
        (r"(?i)\b(news|headline|article)\b", "📰"),
        (r"(?i)\b(sports?|match|score)\b", "🏆"),
        (r"(?i)\b(finance|money|stock|market|price)\b", "💰"),
        (r"(?i)\b(food|recipe|cook|restaurant)\b", "🍽️"),
        (r"(?i)\b(travel|trip|vacation|flight|hotel)\b", "✈️"),
        (r"(?i)\b(health|exercise|fitness|workout|diet)\b", "🏋️"),
    ]
    .into_iter()
    .map(|(pattern, emoji)| (Regex::new(pattern).unwrap(), emoji))
    .collect()
});

const NUMBER_EMOJI: [&str; 10] = ["1️⃣", "2️⃣", "3️⃣", "4️⃣", "5️⃣", "6️⃣", "7️⃣", "8️⃣", "9️⃣", "🔟"];

/// Rewrite markdown-ish model output for chat display
pub fn format_message(message: &str) -> String {
    // Odd segments are inside ``` fences
    let formatted: Vec<String> = message
        .split("```")
        .enumerate()
        .map(|(i, segment)| if i % 2 == 1 { segment.to_string() } else { format_prose(segment) })
        .collect();

    let mut result = formatted.join("```");
    result = add_topic_emoji(&result);
    result = GREETING.replace(&result, "👋 $1").into_owned();
    result
}

fn format_prose(text: &str) -> String {
    let text = H3.replace_all(text, "✨ _${1}_");
    let text = H2.replace_all(&text, "🔹 *${1}*");
    let text = H1.replace_all(&text, "📌 *${1}*");
    let text = BULLET.replace_all(&text, "• ${1}");
    let text = NUMBERED.replace_all(&text, |caps: &Captures| {
        match caps[1].parse::<usize>() {
            Ok(n) if (1..=10).contains(&n) => format!("{} {}", NUMBER_EMOJI[n - 1], &caps[2]),
            _ => caps[0].to_string(),
        }
    });
    let text = INLINE_CODE.replace_all(&text, "```${1}```");
    let text = LINK.replace_all(&text, |caps: &Captures| match (caps.get(1), caps.get(2)) {
        (Some(label), Some(url)) => format!("{} 🔗 {}", label.as_str(), url.as_str()),
        _ => format!("🔗 {}", &caps[0]),
    });
    let text = CALLOUT.replace_all(&text, |caps: &Captures| {
        let (emoji, label) = match caps[1].to_lowercase().as_str() {
            "note" => ("📝", "Note"),
            "warning" => ("⚠️", "Warning"),
            "tip" => ("💡", "Tip"),
            _ => ("❗", "Important"),
        };
        format!("{} *{}:*", emoji, label)
    });
    THANKS.replace_all(&text, "${1} 🙏").into_owned()
}

/// Prefix one topic emoji when the first line is about a known topic
fn add_topic_emoji(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or_default();
    for (pattern, emoji) in TOPICS.iter() {
        if pattern.is_match(first_line) {
            if message.trim_start().starts_with(emoji) {
                return message.to_string();
            }
            return format!("{} {}", emoji, message);
        }
    }
    message.to_string()
}
