//! Anti-bot challenge detection.
//!
//! Checks run in a fixed order, cheapest and most reliable first:
//! container in the DOM (existence counts, a challenge iframe often mounts
//! before it paints), anti-bot URL markers, verification URLs reached while
//! still on the target domain, title phrases, then body phrases in English
//! and Chinese. Every probe tolerates page exceptions as "no match" — a
//! half-loaded page must not read as blocked.

use std::time::Duration;

use aho_corasick::AhoCorasick;
use tokio::sync::watch;

use crate::browser::page::PageDriver;
use crate::core::loghub::SessionLog;
use crate::core::site::SiteProfile;
use crate::detect::{tolerate, PollLoop, Verdict, WaitOutcome};

/// Poll interval while waiting for a human to clear a challenge.
pub const CAPTCHA_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct CaptchaDetector {
    site: SiteProfile,
    phrases: Option<AhoCorasick>,
}

impl CaptchaDetector {
    pub fn new(site: SiteProfile) -> Self {
        // Phrase lists come from config, so a bad pattern set degrades to
        // "no body matching" instead of failing construction.
        let phrases = match AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(&site.captcha_body_phrases)
        {
            Ok(ac) => Some(ac),
            Err(e) => {
                tracing::warn!("captcha body phrase matcher unavailable: {}", e);
                None
            }
        };
        Self { site, phrases }
    }

    /// One fresh pass over all challenge signals.
    pub async fn scan(&self, page: &dyn PageDriver) -> Verdict {
        for sel in &self.site.captcha_container_selectors {
            let probe = tolerate(page.probe_selector(sel).await, "captcha container");
            if probe.any_present() {
                return Verdict::hit(format!("challenge container in DOM: {sel}"));
            }
        }

        let url = tolerate(page.current_url().await, "captcha url");
        for marker in &self.site.captcha_url_markers {
            if !marker.is_empty() && url.contains(marker.as_str()) {
                return Verdict::hit(format!("anti-bot URL marker '{marker}'"));
            }
        }
        if self.site.is_target_domain(&url) && self.site.is_verification_url(&url) {
            return Verdict::hit(format!("verification URL on target domain: {url}"));
        }

        let title = tolerate(page.title().await, "captcha title");
        for phrase in &self.site.captcha_title_phrases {
            if !phrase.is_empty() && title.contains(phrase.as_str()) {
                return Verdict::hit(format!("challenge title phrase '{phrase}'"));
            }
        }

        let body = tolerate(page.body_text().await, "captcha body");
        if let Some(phrase) = self.body_hit(&body) {
            return Verdict::hit(format!("challenge body phrase '{phrase}'"));
        }

        Verdict::miss("no challenge signal")
    }

    /// First configured challenge phrase found in `text`, if any. ASCII
    /// matching is case-insensitive; CJK phrases match exactly.
    pub fn body_hit(&self, text: &str) -> Option<String> {
        let ac = self.phrases.as_ref()?;
        ac.find(text)
            .map(|m| self.site.captcha_body_phrases[m.pattern().as_usize()].clone())
    }

    /// Polls until the challenge disappears or `timeout` elapses.
    /// `TimedOut` means still blocked — recoverable, the caller decides
    /// whether to keep holding.
    pub async fn wait_for_clear(
        &self,
        page: &dyn PageDriver,
        timeout: Duration,
        abort: &mut watch::Receiver<bool>,
        log: &SessionLog,
    ) -> WaitOutcome {
        let poll = PollLoop::new(CAPTCHA_POLL_INTERVAL, Some(timeout));
        loop {
            if *abort.borrow() {
                return WaitOutcome::Cancelled;
            }
            if page.is_closed() {
                return WaitOutcome::PageClosed;
            }
            let verdict = self.scan(page).await;
            if !verdict.hit {
                log.info("captcha", "challenge cleared");
                return WaitOutcome::Satisfied;
            }
            if poll.expired() {
                log.warn("captcha", format!("still blocked after wait — {}", verdict.reason));
                return WaitOutcome::TimedOut;
            }
            poll.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> CaptchaDetector {
        CaptchaDetector::new(SiteProfile::default())
    }

    #[test]
    fn body_hit_finds_english_phrase_case_insensitively() {
        let d = detector();
        let hit = d.body_hit("We detected UNUSUAL TRAFFIC from your network, please verify.");
        assert_eq!(hit.as_deref(), Some("unusual traffic"));
    }

    #[test]
    fn body_hit_finds_chinese_phrase() {
        let d = detector();
        let hit = d.body_hit("检测到异常流量，请完成滑动验证后继续访问。");
        assert!(hit.is_some());
    }

    #[test]
    fn body_hit_ignores_ordinary_text() {
        let d = detector();
        assert!(d.body_hit("批发价格 ¥12.50 起订量 100件").is_none());
    }
}
