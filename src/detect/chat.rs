//! Counterparty-chat activation.
//!
//! The opener never assumes the widget markup: it walks a prioritized
//! selector list for the entry point, clicks the first visible match, waits
//! a fixed settle delay for the widget to mount, then probes for an input
//! surface. A captcha screen short-circuits everything — retrying into a
//! challenge only digs the hole deeper, so that outcome is surfaced
//! immediately and only a human clears it.

use std::time::Duration;

use tokio::sync::watch;

use crate::browser::page::PageDriver;
use crate::core::loghub::SessionLog;
use crate::core::site::SiteProfile;
use crate::detect::{tolerate, CaptchaDetector, WaitOutcome};

/// Total activation attempts before giving up on the chat entry.
pub const CHAT_ATTEMPTS: u32 = 3;

/// Tag names searched when falling back to text-based entry clicks.
const CLICKABLE_TAGS: &str = "a,button,span,div";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatProbeKind {
    ChatReady,
    BlockedByCaptcha,
    ChatNotFound,
    Cancelled,
}

/// Outcome of one activation pass, with the trail that produced it.
#[derive(Debug, Clone)]
pub struct ChatProbeOutcome {
    pub kind: ChatProbeKind,
    pub reason: String,
}

impl ChatProbeOutcome {
    fn ready(reason: impl Into<String>) -> Self {
        Self {
            kind: ChatProbeKind::ChatReady,
            reason: reason.into(),
        }
    }

    fn blocked(reason: impl Into<String>) -> Self {
        Self {
            kind: ChatProbeKind::BlockedByCaptcha,
            reason: reason.into(),
        }
    }

    fn not_found(reason: impl Into<String>) -> Self {
        Self {
            kind: ChatProbeKind::ChatNotFound,
            reason: reason.into(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.kind == ChatProbeKind::ChatReady
    }
}

pub struct ChatOpener {
    site: SiteProfile,
    captcha: CaptchaDetector,
    settle: Duration,
    backoff: Duration,
}

impl ChatOpener {
    pub fn new(site: SiteProfile) -> Self {
        let captcha = CaptchaDetector::new(site.clone());
        Self {
            site,
            captcha,
            settle: Duration::from_millis(2500),
            backoff: Duration::from_secs(2),
        }
    }

    /// Shrinks the settle/backoff delays; scripted-page tests use this.
    pub fn with_pacing(mut self, settle: Duration, backoff: Duration) -> Self {
        self.settle = settle;
        self.backoff = backoff;
        self
    }

    pub fn captcha(&self) -> &CaptchaDetector {
        &self.captcha
    }

    /// One activation pass: captcha gate, entry search, click, settle,
    /// input probe.
    pub async fn open_once(&self, page: &dyn PageDriver, log: &SessionLog) -> ChatProbeOutcome {
        let blocked = self.captcha.scan(page).await;
        if blocked.hit {
            return ChatProbeOutcome::blocked(blocked.reason);
        }

        let mut hidden_matches = 0usize;
        let mut entry: Option<String> = None;
        for sel in &self.site.chat_entry_selectors {
            let probe = tolerate(page.probe_selector(sel).await, "chat entry");
            if probe.any_visible() {
                log.info(
                    "chat",
                    format!("chat entry '{}': {} match(es), visible", sel, probe.matches),
                );
                if !tolerate(page.click_selector(sel).await, "chat entry click") {
                    log.warn("chat", format!("click on '{sel}' did not land, continuing"));
                }
                entry = Some(sel.clone());
                break;
            }
            hidden_matches += probe.matches;
        }

        if entry.is_none() {
            for text in &self.site.chat_entry_texts {
                if tolerate(page.click_text(CLICKABLE_TAGS, text).await, "chat entry text") {
                    log.info("chat", format!("chat entry via text '{text}'"));
                    entry = Some(format!("text:{text}"));
                    break;
                }
            }
        }

        let Some(entry) = entry else {
            return ChatProbeOutcome::not_found(format!(
                "no visible chat entry ({} selectors, {} hidden matches)",
                self.site.chat_entry_selectors.len(),
                hidden_matches
            ));
        };

        tokio::time::sleep(self.settle).await;

        if self.input_surface_present(page).await {
            ChatProbeOutcome::ready(format!("chat input ready via {entry}"))
        } else {
            // Entry consumed the click; the widget is mounting. Callers
            // re-verify the input before typing anyway.
            ChatProbeOutcome::ready(format!("activated via {entry}, input still loading"))
        }
    }

    /// Whether any configured chat input is visible right now.
    pub async fn input_surface_present(&self, page: &dyn PageDriver) -> bool {
        for sel in &self.site.chat_input_selectors {
            if tolerate(page.probe_selector(sel).await, "chat input").any_visible() {
                return true;
            }
        }
        false
    }

    /// Runs [`open_once`] up to [`CHAT_ATTEMPTS`] times with a fixed
    /// backoff. Captcha blocks return immediately — they are never retried
    /// here.
    ///
    /// [`open_once`]: ChatOpener::open_once
    pub async fn ensure_ready(
        &self,
        page: &dyn PageDriver,
        abort: &mut watch::Receiver<bool>,
        log: &SessionLog,
    ) -> ChatProbeOutcome {
        let mut last = ChatProbeOutcome::not_found("chat entry never probed");
        for attempt in 1..=CHAT_ATTEMPTS {
            if *abort.borrow() {
                return ChatProbeOutcome {
                    kind: ChatProbeKind::Cancelled,
                    reason: "stopped by operator".to_string(),
                };
            }
            let outcome = self.open_once(page, log).await;
            match outcome.kind {
                ChatProbeKind::ChatReady | ChatProbeKind::BlockedByCaptcha => return outcome,
                _ => {
                    log.warn(
                        "chat",
                        format!("attempt {attempt}/{CHAT_ATTEMPTS}: {}", outcome.reason),
                    );
                    last = outcome;
                }
            }
            if attempt < CHAT_ATTEMPTS {
                tokio::time::sleep(self.backoff).await;
            }
        }
        last
    }

    /// Holds while a challenge is on screen, up to `timeout`.
    pub async fn wait_for_captcha_clear(
        &self,
        page: &dyn PageDriver,
        timeout: Duration,
        abort: &mut watch::Receiver<bool>,
        log: &SessionLog,
    ) -> WaitOutcome {
        self.captcha.wait_for_clear(page, timeout, abort, log).await
    }
}
