//! Google Generative Language API client.
//!
//! Thin wrapper over `models/{model}:generateContent`. Every failure path —
//! malformed key, transport error, HTTP error, empty candidate — lands on
//! the embedded [`MockGenerator`] so the caller always gets a reply.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::ai::{aggressive_style, chinese_context, describe_goals, MockGenerator, ReplyGenerator};
use crate::core::types::{AiStatus, ChatMessage, NegotiationGoals};

/// Per-request budget; negotiation replies are short.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport failures get one extra attempt. HTTP-level errors do not —
/// a 400 or 429 will not improve on immediate retry.
const ATTEMPTS: u32 = 2;

pub struct GeminiClient {
    http: reqwest::Client,
    api_key: Option<String>,
    model: String,
    endpoint: String,
    fallback: MockGenerator,
}

impl GeminiClient {
    pub fn new(
        http: reqwest::Client,
        key: String,
        model: String,
        endpoint: String,
        locale: String,
    ) -> Self {
        // Same format check the API enforces; catching a pasted-wrong key
        // here keeps it from silently burning a whole run.
        let api_key = if key.starts_with("AIza") && key.len() >= 20 {
            tracing::info!("reply generation via Google AI model {}", model);
            Some(key)
        } else {
            tracing::error!(
                "API key looks malformed (expected to start with 'AIza', ≥20 chars) — \
                 running on mock replies"
            );
            None
        };
        Self {
            http,
            api_key,
            model,
            endpoint,
            fallback: MockGenerator::new(locale),
        }
    }

    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("no API key configured"))?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.endpoint, self.model
        );
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }]
        });

        let mut last_err: Option<reqwest::Error> = None;
        for attempt in 1..=ATTEMPTS {
            // Key travels in a header, never in the URL: reqwest errors
            // print the URL and those lines end up in logs.
            let sent = self
                .http
                .post(&url)
                .header("x-goog-api-key", key)
                .timeout(REQUEST_TIMEOUT)
                .json(&body)
                .send()
                .await;
            match sent {
                Ok(resp) => {
                    let status = resp.status();
                    let payload: Value = resp.json().await.unwrap_or_default();
                    if !status.is_success() {
                        let detail = payload
                            .pointer("/error/message")
                            .and_then(Value::as_str)
                            .unwrap_or("no detail");
                        bail!("generateContent returned {status}: {detail}");
                    }
                    let text = extract_text(&payload);
                    if text.is_empty() {
                        bail!("generateContent returned an empty candidate");
                    }
                    return Ok(text);
                }
                Err(e) => {
                    tracing::warn!(
                        "generateContent transport error (attempt {}/{}): {}",
                        attempt,
                        ATTEMPTS,
                        e
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .map(Into::into)
            .unwrap_or_else(|| anyhow!("generateContent failed")))
    }
}

#[async_trait]
impl ReplyGenerator for GeminiClient {
    async fn opening_message(
        &self,
        goals: &NegotiationGoals,
        product_url: Option<&str>,
        locale: &str,
    ) -> String {
        if !self.is_available() {
            return self.fallback.opening_message(goals, product_url, locale).await;
        }
        let zh = chinese_context(locale, "", &[]);
        let prompt = build_opener_prompt(goals, product_url, zh);
        match self.generate(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("opener generation failed, using template: {:#}", e);
                self.fallback.opening_message(goals, product_url, locale).await
            }
        }
    }

    async fn next_reply(
        &self,
        transcript: &[ChatMessage],
        supplier_text: &str,
        goals: &NegotiationGoals,
        product_url: &str,
        locale: &str,
    ) -> String {
        if !self.is_available() {
            return self
                .fallback
                .next_reply(transcript, supplier_text, goals, product_url, locale)
                .await;
        }
        let zh = chinese_context(locale, supplier_text, transcript);
        let prompt = build_reply_prompt(transcript, supplier_text, goals, product_url, zh);
        match self.generate(&prompt).await {
            Ok(text) => {
                tracing::info!("reply via {}: {}", self.model, preview(&text));
                text
            }
            Err(e) => {
                tracing::error!("model call failed, using mock reply: {:#}", e);
                self.fallback
                    .next_reply(transcript, supplier_text, goals, product_url, locale)
                    .await
            }
        }
    }

    fn name(&self) -> &'static str {
        "gemini"
    }

    fn status(&self) -> AiStatus {
        AiStatus {
            available: self.is_available(),
            model: self.model.clone(),
            mock: !self.is_available(),
        }
    }
}

fn build_reply_prompt(
    transcript: &[ChatMessage],
    supplier_text: &str,
    goals: &NegotiationGoals,
    product_url: &str,
    zh: bool,
) -> String {
    let goals_str = describe_goals(goals);
    let history = transcript
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.text))
        .collect::<Vec<_>>()
        .join("\n");

    if zh {
        let style = if aggressive_style(goals) {
            "使用激进的谈判语气，专注于推动更好的价格和更快的交货期。"
        } else {
            "保持礼貌和专业。"
        };
        format!(
            "你是一个专业的B2B采购谈判助手。请根据对话历史和采购目标生成简洁的回复。\n\n\
             产品链接: {product_url}\n\n\
             采购目标:\n{goals_str}\n\n\
             对话历史:\n{history}\n\n\
             供应商最新消息: \"{supplier_text}\"\n\n\
             {style}\n\n\
             请生成1-2句话的回复，专注于未解决的关键信息（价格、MOQ、交期、样品等）。\
             如果供应商用中文回复，请用中文回复。"
        )
    } else {
        let style = if aggressive_style(goals) {
            "Use an aggressive negotiation tone focused on pushing better prices and faster delivery."
        } else {
            "Be professional and goal-oriented."
        };
        format!(
            "You are a professional B2B negotiation assistant. Generate a concise reply based \
             on conversation history and goals.\n\n\
             Product URL: {product_url}\n\n\
             Goals:\n{goals_str}\n\n\
             Conversation History:\n{history}\n\n\
             Latest supplier message: \"{supplier_text}\"\n\n\
             {style}\n\n\
             Generate a 1-2 sentence reply focusing on missing key details (price, MOQ, lead \
             time, samples, etc.). Use simple English unless the supplier uses Chinese."
        )
    }
}

fn build_opener_prompt(goals: &NegotiationGoals, product_url: Option<&str>, zh: bool) -> String {
    let goals_str = describe_goals(goals);
    let url = product_url.unwrap_or("(not provided)");
    if zh {
        format!(
            "你是一个专业的B2B采购谈判助手。请为以下产品撰写一条简洁的开场询价消息\
             （2-3句话），覆盖最关键的采购目标。\n\n\
             产品链接: {url}\n\n\
             采购目标:\n{goals_str}\n\n\
             只输出消息本身，不要任何解释。"
        )
    } else {
        format!(
            "You are a professional B2B negotiation assistant. Write a concise opening inquiry \
             (2-3 sentences) for the product below, covering the most important goals.\n\n\
             Product URL: {url}\n\n\
             Goals:\n{goals_str}\n\n\
             Output only the message itself, no explanation."
        )
    }
}

/// Joined text of the first candidate's parts, empty when absent.
fn extract_text(payload: &Value) -> String {
    let Some(parts) = payload
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
    else {
        return String::new();
    };
    parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("")
        .trim()
        .to_string()
}

fn preview(text: &str) -> String {
    text.chars().take(100).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client(key: &str) -> GeminiClient {
        GeminiClient::new(
            reqwest::Client::new(),
            key.to_string(),
            "gemini-2.5-flash".to_string(),
            "https://generativelanguage.googleapis.com".to_string(),
            "zh".to_string(),
        )
    }

    #[test]
    fn malformed_keys_disable_the_client() {
        assert!(!client("short").is_available());
        assert!(!client("sk-this-is-the-wrong-vendor-prefix").is_available());
        assert!(client("AIzaSyA-0123456789abcdefghij").is_available());
    }

    #[test]
    fn extract_text_joins_candidate_parts() {
        let payload = json!({
            "candidates": [{
                "content": {
                    "parts": [{ "text": "你好，" }, { "text": "请报价。" }],
                    "role": "model"
                }
            }]
        });
        assert_eq!(extract_text(&payload), "你好，请报价。");
        assert_eq!(extract_text(&json!({"candidates": []})), "");
    }

    #[test]
    fn reply_prompt_carries_goals_and_history() {
        let goals = json!({"target_price": "80元", "style": "aggressive"})
            .as_object()
            .cloned()
            .unwrap();
        let prompt = build_reply_prompt(&[], "价格是100元", &goals, "https://x.1688.com/offer/1.html", true);
        assert!(prompt.contains("Target price: 80元"));
        assert!(prompt.contains("激进"));
        assert!(prompt.contains("价格是100元"));
    }

    #[tokio::test]
    async fn unavailable_client_falls_back_to_mock() {
        let c = client("bogus");
        let reply = c
            .next_reply(&[], "我们的价格是100元", &NegotiationGoals::new(), "u", "zh")
            .await;
        assert!(!reply.is_empty());
        assert!(c.status().mock);
    }
}
