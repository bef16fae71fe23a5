//! Deterministic fallback generator.
//!
//! Runs whenever no API key is configured or a model call fails. Picks a
//! reply by scanning the supplier's message for topic keywords, then shades
//! it by conversation stage: early turns gather basics, mid turns negotiate
//! terms, late turns push toward closing. Same inputs, same output — the
//! scripted-run tests depend on that.

use std::hash::{Hash, Hasher};

use async_trait::async_trait;

use crate::ai::{chinese_context, goal_flag, ReplyGenerator};
use crate::core::types::{AiStatus, ChatMessage, NegotiationGoals};

/// Rotation of opening messages for Chinese negotiations; picked by a
/// stable hash of the product URL so repeat calls agree.
const ZH_OPENERS: [&str; 5] = [
    "你好，我对这款产品感兴趣。请问最小起订量、单价（含税/不含税）、运费、交货期是多少？支持定制和开增票吗？谢谢！",
    "您好，我想了解这款产品的详细信息。请问：1. 最小起订量 2. 批发价格 3. 生产周期 4. 是否支持OEM定制？期待您的回复！",
    "你好，我们是采购公司，对贵司产品感兴趣。请提供产品目录、价格表、最小订单量和交货时间。谢谢！",
    "您好，请问这款产品的样品价格和大货价格分别是多少？最小起订量多少？交货期多久？",
    "你好，我司长期采购此类产品，请告知最优价格、MOQ、交期及是否支持定制。谢谢！",
];

const EN_OPENER: &str = "Hello, we are interested in this product. Could you share the MOQ, \
unit price, shipping cost and lead time? Do you support customization and VAT invoices? Thanks!";

pub struct MockGenerator {
    locale: String,
}

impl MockGenerator {
    pub fn new(locale: String) -> Self {
        Self { locale }
    }

    /// Request locale wins; the configured default covers an empty one.
    fn effective_locale<'a>(&'a self, locale: &'a str) -> &'a str {
        if locale.is_empty() { &self.locale } else { locale }
    }

    /// Pure reply selection; the async trait method delegates here.
    pub fn compose_reply(
        &self,
        transcript: &[ChatMessage],
        supplier_text: &str,
        goals: &NegotiationGoals,
        locale: &str,
    ) -> String {
        let zh = chinese_context(self.effective_locale(locale), supplier_text, transcript);
        let supplier = supplier_text.to_lowercase();
        let turn_count = transcript.len();
        let early = turn_count <= 2;
        let mid = turn_count > 2 && turn_count <= 4;

        let mentions = |keywords: &[&str]| keywords.iter().any(|k| supplier.contains(k));

        // Direct questions get answered before topic matching.
        if mentions(&["what", "什么", "how", "如何", "which", "哪个"]) {
            return pick(
                zh,
                "我们正在评估多个供应商，需要比较价格和服务。请提供详细的报价信息。",
                "We're evaluating multiple suppliers and need to compare pricing and services. \
                 Please provide detailed quotation information.",
            );
        }

        if mentions(&["price", "价格", "yuan", "元", "$", "cost", "费用"]) {
            return if early {
                pick(
                    zh,
                    "谢谢报价。请问最小起订量是多少？交货期多久？支持定制和开增票吗？",
                    "Thank you for the pricing. What is the MOQ and lead time? Do you support \
                     customization and VAT invoices?",
                )
            } else if mid {
                pick(
                    zh,
                    "了解了价格。如果订购1000件以上，价格能优惠多少？样品费用如何计算？",
                    "Price noted. Any discount for orders over 1000 pieces? How about sample costs?",
                )
            } else {
                pick(
                    zh,
                    "价格基本确认。请问付款方式是什么？是否支持分期付款？",
                    "Price is mostly confirmed. What are the payment terms? Do you support \
                     installment payments?",
                )
            };
        }

        if mentions(&["moq", "起订", "quantity", "数量", "minimum"]) {
            return pick(
                zh,
                "MOQ了解了。请问这个价格对应多少数量？是否包含运费和税费？",
                "MOQ understood. Does this price include shipping and taxes? What about sample \
                 availability?",
            );
        }

        if mentions(&["lead time", "交期", "delivery", "production", "生产"]) {
            return pick(
                zh,
                "交期确认。请问样品制作时间多久？加急订单如何处理？",
                "Lead time confirmed. How long for sample production? Can you handle rush orders?",
            );
        }

        if mentions(&["quality", "质量", "certification", "认证", "standard", "标准"]) {
            return pick(
                zh,
                "质量标准很重要。请问有哪些认证证书？是否支持第三方验货？",
                "Quality standards are important. What certifications do you have? Do you support \
                 third-party inspection?",
            );
        }

        if mentions(&["custom", "定制", "oem", "odm"]) {
            return pick(
                zh,
                "定制需求可以讨论。请问定制费用和最低起订量是多少？",
                "Customization can be discussed. What are the costs and MOQ for customized orders?",
            );
        }

        if mentions(&["sample", "样品", "specimen"]) {
            return pick(
                zh,
                "样品需要确认质量。请问样品费用多少？是否可以退还？",
                "We need samples for quality confirmation. What's the sample cost? Is it refundable?",
            );
        }

        if early {
            if goal_flag(goals, "target_price") {
                pick(
                    zh,
                    "谢谢回复。我们的目标价格范围是多少？量大能优惠吗？",
                    "Thanks for your reply. What's your target price range? Any discount for bulk \
                     orders?",
                )
            } else {
                pick(
                    zh,
                    "谢谢，我想了解更多产品详情。请问最小起订量、单价区间和交货期？",
                    "Thank you, I'd like more product details. What are the MOQ, price range, and \
                     lead time?",
                )
            }
        } else if mid {
            pick(
                zh,
                "基本了解了。请问付款方式是什么？是否支持30%定金，70%发货前付清？",
                "Basic information understood. What are the payment terms? Do you support 30% \
                 deposit, 70% before shipment?",
            )
        } else {
            pick(
                zh,
                "条件基本确认，我需要和团队讨论一下。请问报价有效期多久？",
                "Terms are mostly confirmed. I need to discuss with my team. How long is the \
                 quotation valid?",
            )
        }
    }

    pub fn compose_opener(&self, product_url: Option<&str>, locale: &str) -> String {
        if self.effective_locale(locale) != "zh" {
            return EN_OPENER.to_string();
        }
        let index = match product_url {
            Some(url) => {
                // DefaultHasher with fixed keys keeps the pick stable
                // across restarts.
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                url.hash(&mut hasher);
                (hasher.finish() % ZH_OPENERS.len() as u64) as usize
            }
            None => 0,
        };
        ZH_OPENERS[index].to_string()
    }
}

#[async_trait]
impl ReplyGenerator for MockGenerator {
    async fn opening_message(
        &self,
        _goals: &NegotiationGoals,
        product_url: Option<&str>,
        locale: &str,
    ) -> String {
        self.compose_opener(product_url, locale)
    }

    async fn next_reply(
        &self,
        transcript: &[ChatMessage],
        supplier_text: &str,
        goals: &NegotiationGoals,
        _product_url: &str,
        locale: &str,
    ) -> String {
        let reply = self.compose_reply(transcript, supplier_text, goals, locale);
        tracing::info!("🤖 composed mock reply: {}", reply);
        reply
    }

    fn name(&self) -> &'static str {
        "mock-enhanced"
    }

    fn status(&self) -> AiStatus {
        AiStatus {
            available: false,
            model: "mock-enhanced".to_string(),
            mock: true,
        }
    }
}

fn pick(zh: bool, zh_text: &str, en_text: &str) -> String {
    if zh { zh_text.to_string() } else { en_text.to_string() }
}
