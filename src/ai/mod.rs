//! Reply generation.
//!
//! The state machine talks to one [`ReplyGenerator`] and never learns which
//! backend is behind it. [`GeminiClient`] calls the Generative Language API
//! and degrades per-call to the deterministic [`MockGenerator`], which is
//! also what runs when no API key is configured. Generation is infallible
//! by contract — a negotiation must not die because a model call did.

pub mod client;
pub mod mock;

pub use client::GeminiClient;
pub use mock::MockGenerator;

use async_trait::async_trait;

use crate::core::types::{AiStatus, ChatMessage, NegotiationGoals};

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Composes the opening message for a product when the operator did not
    /// supply a template.
    async fn opening_message(
        &self,
        goals: &NegotiationGoals,
        product_url: Option<&str>,
        locale: &str,
    ) -> String;

    /// Composes the next turn from the transcript so far and the latest
    /// counterparty message.
    async fn next_reply(
        &self,
        transcript: &[ChatMessage],
        supplier_text: &str,
        goals: &NegotiationGoals,
        product_url: &str,
        locale: &str,
    ) -> String;

    fn name(&self) -> &'static str;

    fn status(&self) -> AiStatus;
}

/// Characters common enough in Chinese prose to identify the language from
/// a single message.
const COMMON_HANZI: &str = "的你了是在有我他对她这那之个得地";

/// A conversation counts as Chinese when the locale says so, or when either
/// the supplier's latest message or the opening message reads as Chinese.
pub(crate) fn chinese_context(locale: &str, supplier_text: &str, transcript: &[ChatMessage]) -> bool {
    if locale == "zh" {
        return true;
    }
    let has_hanzi = |text: &str| text.chars().any(|c| COMMON_HANZI.contains(c));
    if has_hanzi(supplier_text) {
        return true;
    }
    transcript.first().is_some_and(|m| has_hanzi(&m.text))
}

/// Renders a goal value as plain text, skipping nulls and empty strings.
pub(crate) fn goal_text(goals: &NegotiationGoals, key: &str) -> Option<String> {
    let value = goals.get(key)?;
    match value {
        serde_json::Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(true) => Some("yes".to_string()),
        _ => None,
    }
}

pub(crate) fn goal_flag(goals: &NegotiationGoals, key: &str) -> bool {
    match goals.get(key) {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
        _ => false,
    }
}

/// Well-known goal keys rendered with labels; anything else is passed
/// through as `key: value` so free-form goals still reach the prompt.
pub(crate) fn describe_goals(goals: &NegotiationGoals) -> String {
    const LABELED: [(&str, &str); 7] = [
        ("target_price", "Target price"),
        ("moq", "MOQ"),
        ("lead_time", "Lead time"),
        ("quality_requirements", "Quality"),
        ("shipping_terms", "Shipping"),
        ("payment_terms", "Payment"),
        ("style", "Style"),
    ];
    let mut lines = Vec::new();
    for (key, label) in LABELED {
        if let Some(value) = goal_text(goals, key) {
            lines.push(format!("{label}: {value}"));
        }
    }
    if goal_flag(goals, "samples") {
        lines.push("Request samples".to_string());
    }
    for key in goals.keys() {
        if key == "samples" || LABELED.iter().any(|(k, _)| k == key) {
            continue;
        }
        if let Some(text) = goal_text(goals, key) {
            lines.push(format!("{key}: {text}"));
        }
    }
    if lines.is_empty() {
        "Standard B2B inquiry".to_string()
    } else {
        lines.join("\n")
    }
}

pub(crate) fn aggressive_style(goals: &NegotiationGoals) -> bool {
    goal_text(goals, "style").is_some_and(|s| s.eq_ignore_ascii_case("aggressive"))
}

/// Replaces `{key}` placeholders in an operator-supplied opening template
/// with goal values. Unknown placeholders are left untouched.
pub fn substitute_goals(template: &str, goals: &NegotiationGoals) -> String {
    let mut out = template.to_string();
    for (key, _) in goals {
        if let Some(value) = goal_text(goals, key) {
            out = out.replace(&format!("{{{key}}}"), &value);
        }
    }
    out
}
