//! The driving state machine and the run lifecycle around it.
//!
//! A run moves through login, product-and-chat activation, then the send /
//! wait / generate reply loop, pausing at operator gates between phases.
//! Terminal states latch: once `S_DONE`, `S_ERROR` or `CANCELLED` is
//! reached, the machine issues no further browser actions. All page access
//! goes through [`PageDriver`], so the whole flow runs against a scripted
//! page in tests.
//!
//! The free functions at the bottom (`start_negotiation`, `start_login_only`,
//! `goto_product`, `stop_active`) are the admission layer the HTTP API calls:
//! they enforce the single-run rule, validate input, and spawn the driving
//! task that owns the browser.

use crate::ai::{substitute_goals, ReplyGenerator};
use crate::browser::identity;
use crate::browser::launcher::BrowserSession;
use crate::browser::page::PageDriver;
use crate::core::app_state::{AppState, RunHandle, RunSlot, SharedDriver};
use crate::core::loghub::SessionLog;
use crate::core::site::SiteProfile;
use crate::core::types::{
    ChatRole, GotoProductRequest, NegotiationGoals, NegotiationState, RunKind, StartRequest,
};
use crate::detect::{tolerate, ChatOpener, ChatProbeKind, LoginDetector, PollLoop, WaitOutcome};
use crate::negotiate::artifacts::ArtifactStore;
use crate::negotiate::gates::{GateController, GateName, GateWait};
use crate::negotiate::session::{Session, SharedSession};
use crate::negotiate::NegotiateError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Home-bounce retries when the product deep link gets punished with an
/// error redirect.
const NAV_RETRIES: u32 = 2;

/// Probes for the chat input before a send is declared failed.
const INPUT_RETRIES: u32 = 3;

/// Upper bound on the per-turn reply wait (24 h). Anything past that is a
/// typo, not a plan.
const MAX_WAIT_TIMEOUT_S: u64 = 86_400;

/// Timing knobs, defaulted for a real site and shrunk to near-zero by
/// scenario tests.
#[derive(Debug, Clone, Copy)]
pub struct MachinePacing {
    /// Interval for reply/captcha/login/hold polling.
    pub poll: Duration,
    /// Settle delay after navigations and sends.
    pub settle: Duration,
    /// Backoff between chat-activation attempts.
    pub backoff: Duration,
    /// Randomized pre-submit pause, so sends do not fire machine-fast.
    pub humanize: bool,
}

impl Default for MachinePacing {
    fn default() -> Self {
        Self {
            poll: Duration::from_secs(2),
            settle: Duration::from_millis(2500),
            backoff: Duration::from_secs(2),
            humanize: true,
        }
    }
}

impl MachinePacing {
    pub fn instant() -> Self {
        Self {
            poll: Duration::from_millis(1),
            settle: Duration::from_millis(1),
            backoff: Duration::from_millis(1),
            humanize: false,
        }
    }
}

/// Everything the machine needs, injected so tests can swap the page and
/// the reply generator.
pub struct MachineDeps {
    pub page: Arc<dyn PageDriver>,
    pub site: Arc<SiteProfile>,
    pub gates: Arc<GateController>,
    pub reply_gen: Arc<dyn ReplyGenerator>,
    pub artifacts: ArtifactStore,
    pub log: SessionLog,
    pub pacing: MachinePacing,
}

/// How a login-only hold ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldEnd {
    Stopped,
    WindowClosed,
}

pub struct Machine {
    deps: MachineDeps,
    session: SharedSession,
    abort: watch::Receiver<bool>,
    login: LoginDetector,
    opener: ChatOpener,
}

/// Drives a full negotiation to a terminal state over an already-launched
/// page. The caller owns browser setup and teardown.
pub async fn run_machine(
    deps: MachineDeps,
    session: SharedSession,
    abort: watch::Receiver<bool>,
) -> Result<(), NegotiateError> {
    let mut machine = Machine::new(deps, session, abort);
    machine.drive().await
}

impl Machine {
    pub fn new(deps: MachineDeps, session: SharedSession, abort: watch::Receiver<bool>) -> Self {
        let site = (*deps.site).clone();
        let login = LoginDetector::new(site.clone());
        let opener = ChatOpener::new(site).with_pacing(deps.pacing.settle, deps.pacing.backoff);
        Self {
            deps,
            session,
            abort,
            login,
            opener,
        }
    }

    pub async fn drive(&mut self) -> Result<(), NegotiateError> {
        self.ensure_login().await?;
        self.pause_at(GateName::AfterLogin).await?;

        self.open_product_and_chat().await?;
        self.pause_at(GateName::ProductAndChat).await?;

        let opening = self.compose_opening().await;
        self.transition(NegotiationState::SendMessage).await;
        let mut baseline = self.send_chat_message(&opening).await?;
        self.record_message(ChatRole::User, &opening).await;
        self.shoot("opener_sent").await;
        self.deps.log.info("send", "opening message sent");
        let mut last_sent = opening;

        loop {
            self.pause_at(GateName::AfterSend).await?;

            self.transition(NegotiationState::WaitForReply).await;
            let reply = self.wait_for_reply(&mut baseline, &last_sent).await?;
            self.record_message(ChatRole::Supplier, &reply).await;
            self.shoot("reply_received").await;
            self.deps
                .log
                .info("reply", format!("counterparty: {}", preview(&reply)));

            self.transition(NegotiationState::GenerateAndReply).await;
            let ours = self.compose_reply(&reply).await;

            self.transition(NegotiationState::SendMessage).await;
            baseline = self.send_chat_message(&ours).await?;
            self.record_message(ChatRole::Assistant, &ours).await;
            last_sent = ours;

            let (turn, max) = {
                let mut s = self.session.write().await;
                s.current_turn += 1;
                (s.current_turn, s.max_turns)
            };
            self.shoot(&format!("turn_{turn}_sent")).await;
            self.persist().await;
            self.deps
                .log
                .info("send", format!("reply turn {turn}/{max} sent"));

            if turn >= max {
                self.transition(NegotiationState::Done).await;
                self.deps
                    .log
                    .info("machine", "turn budget reached — negotiation complete");
                return Ok(());
            }
        }
    }

    /// Login phase for a browser-holding run: sign in, park on the
    /// workbench page and wait for a product URL.
    pub async fn login_and_park(&mut self) -> Result<(), NegotiateError> {
        self.ensure_login().await?;
        self.check_stop()?;
        if let Err(e) = self.deps.page.goto(&self.deps.site.work_home_url).await {
            self.deps
                .log
                .warn("login", format!("workbench navigation failed: {e}"));
        }
        tokio::time::sleep(self.deps.pacing.settle).await;
        self.transition(NegotiationState::ReadyForProduct).await;
        self.deps
            .log
            .info("session", "signed in and parked — send a product URL to continue");
        Ok(())
    }

    /// Keeps a parked browser alive until the operator stops the run or
    /// closes the window.
    pub async fn hold(&mut self) -> HoldEnd {
        loop {
            if *self.abort.borrow() {
                return HoldEnd::Stopped;
            }
            if self.deps.page.is_closed() {
                return HoldEnd::WindowClosed;
            }
            tokio::time::sleep(self.deps.pacing.poll).await;
        }
    }

    // ── states ──────────────────────────────────────────────────────────

    async fn ensure_login(&mut self) -> Result<(), NegotiateError> {
        self.transition(NegotiationState::EnsureLogin).await;
        self.check_stop()?;

        if let Err(e) = self.deps.page.goto(&self.deps.site.home_url).await {
            self.deps
                .log
                .warn("login", format!("home navigation failed: {e}"));
        }
        tokio::time::sleep(self.deps.pacing.settle).await;

        let verdict = self.login.assess(self.deps.page.as_ref()).await;
        if verdict.hit {
            self.deps
                .log
                .info("login", format!("already signed in ({})", verdict.reason));
        } else {
            self.deps.log.info(
                "login",
                format!(
                    "not signed in ({}) — opening the sign-in page; complete it in the browser window",
                    verdict.reason
                ),
            );
            if let Err(e) = self.deps.page.goto(&self.deps.site.login_entry_url).await {
                self.deps
                    .log
                    .warn("login", format!("sign-in page navigation failed: {e}"));
            }
            match self
                .login
                .wait_until_logged_in(self.deps.page.as_ref(), &mut self.abort, &self.deps.log)
                .await
            {
                WaitOutcome::Satisfied => {}
                WaitOutcome::PageClosed => return Err(NegotiateError::PageClosed),
                WaitOutcome::Cancelled => return Err(NegotiateError::Cancelled),
                // The login wait has no deadline; a timeout here means the
                // wait primitive changed underneath us.
                WaitOutcome::TimedOut => {
                    return Err(NegotiateError::Navigation(
                        "login wait ended without a signal".into(),
                    ))
                }
            }
            // Land back on the main domain so the fresh session settles.
            if let Err(e) = self.deps.page.goto(&self.deps.site.home_url).await {
                self.deps
                    .log
                    .warn("login", format!("post-login home navigation failed: {e}"));
            }
            tokio::time::sleep(self.deps.pacing.settle).await;
        }
        self.shoot("login_ok").await;
        Ok(())
    }

    async fn open_product_and_chat(&mut self) -> Result<(), NegotiateError> {
        self.transition(NegotiationState::OpenProductAndChat).await;
        let product_url = { self.session.read().await.product_url.clone() };

        let mut bounces = 0u32;
        loop {
            self.check_stop()?;
            let nav_err = self.deps.page.goto(&product_url).await.err();
            tokio::time::sleep(self.deps.pacing.settle).await;
            let landed = tolerate(self.deps.page.current_url().await, "current url");
            let redirected = self.deps.site.is_error_redirect(&landed);
            if nav_err.is_none() && !redirected {
                break;
            }
            let why = match nav_err {
                Some(e) => e.to_string(),
                None => format!("error redirect to {landed}"),
            };
            if bounces >= NAV_RETRIES {
                return Err(NegotiateError::Navigation(format!(
                    "product page unreachable after {} attempts: {why}",
                    bounces + 1
                )));
            }
            bounces += 1;
            self.deps.log.warn(
                "navigate",
                format!("{why} — bouncing through home ({bounces}/{NAV_RETRIES})"),
            );
            if let Err(e) = self.deps.page.goto(&self.deps.site.home_url).await {
                self.deps
                    .log
                    .warn("navigate", format!("home bounce failed: {e}"));
            }
            tokio::time::sleep(self.deps.pacing.settle).await;
        }
        self.shoot("product_open").await;
        self.deps
            .log
            .info("navigate", format!("product page open: {product_url}"));

        // A challenge holds us here until a human clears it; the nav retry
        // budget is not consumed by that.
        loop {
            let outcome = self
                .opener
                .ensure_ready(self.deps.page.as_ref(), &mut self.abort, &self.deps.log)
                .await;
            match outcome.kind {
                ChatProbeKind::ChatReady => {
                    self.shoot("chat_ready").await;
                    self.deps.log.info("chat", outcome.reason);
                    return Ok(());
                }
                ChatProbeKind::Cancelled => return Err(NegotiateError::Cancelled),
                ChatProbeKind::ChatNotFound => {
                    return Err(NegotiateError::ChatNotFound(outcome.reason))
                }
                ChatProbeKind::BlockedByCaptcha => {
                    self.shoot("captcha").await;
                    let budget = { self.session.read().await.wait_timeout };
                    self.deps.log.warn(
                        "captcha",
                        format!(
                            "{} — solve it in the browser window (waiting up to {}s)",
                            outcome.reason,
                            budget.as_secs()
                        ),
                    );
                    match self
                        .opener
                        .wait_for_captcha_clear(
                            self.deps.page.as_ref(),
                            budget,
                            &mut self.abort,
                            &self.deps.log,
                        )
                        .await
                    {
                        WaitOutcome::Satisfied => continue,
                        WaitOutcome::TimedOut => {
                            return Err(NegotiateError::BlockedByCaptcha(outcome.reason))
                        }
                        WaitOutcome::PageClosed => return Err(NegotiateError::PageClosed),
                        WaitOutcome::Cancelled => return Err(NegotiateError::Cancelled),
                    }
                }
            }
        }
    }

    /// Types `text` into the chat input and submits it. Returns the bubble
    /// count after the send settled, which the reply wait uses as its
    /// baseline.
    async fn send_chat_message(&self, text: &str) -> Result<usize, NegotiateError> {
        self.check_stop()?;
        let page = self.deps.page.as_ref();

        // The input may still be mounting right after activation.
        let mut probes = 0u32;
        let input_sel = loop {
            match self.first_visible_input().await {
                Some(sel) => break sel,
                None => {
                    probes += 1;
                    if probes >= INPUT_RETRIES {
                        return Err(NegotiateError::SendFailed("no visible chat input".into()));
                    }
                    tokio::time::sleep(self.deps.pacing.settle).await;
                }
            }
        };

        if !tolerate(page.type_text(&input_sel, text).await, "chat input typing") {
            return Err(NegotiateError::SendFailed(format!(
                "typing into '{input_sel}' did not take"
            )));
        }
        self.human_pause().await;

        // Submit: configured button, then visible button text, then Enter.
        let mut submitted = false;
        for sel in &self.deps.site.send_button_selectors {
            if tolerate(page.click_selector(sel).await, "send button") {
                submitted = true;
                break;
            }
        }
        if !submitted {
            for needle in &self.deps.site.send_button_texts {
                if tolerate(
                    page.click_text("button,a,span,div", needle).await,
                    "send button text",
                ) {
                    submitted = true;
                    break;
                }
            }
        }
        if !submitted {
            submitted = tolerate(page.press_enter(&input_sel).await, "enter submit");
            if submitted {
                self.deps
                    .log
                    .info("send", "no send button matched — submitted with Enter");
            }
        }
        if !submitted {
            return Err(NegotiateError::SendFailed(
                "no send button and Enter had no target".into(),
            ));
        }

        tokio::time::sleep(self.deps.pacing.settle).await;
        Ok(self.read_bubbles().await.len())
    }

    /// Polls the message thread for content beyond `baseline`, filtering out
    /// the echo of our own last message. One in-place retry is allowed while
    /// the turn budget has room; after that the timeout is fatal.
    async fn wait_for_reply(
        &mut self,
        baseline: &mut usize,
        last_sent: &str,
    ) -> Result<String, NegotiateError> {
        let (timeout, turn, max) = {
            let s = self.session.read().await;
            (s.wait_timeout, s.current_turn, s.max_turns)
        };
        let sent = last_sent.trim();
        let mut attempt = 1u32;
        loop {
            self.deps.log.info(
                "reply",
                format!(
                    "waiting for a counterparty reply (up to {}s, attempt {attempt})",
                    timeout.as_secs()
                ),
            );
            let poll = PollLoop::new(self.deps.pacing.poll, Some(timeout));
            loop {
                self.check_stop()?;
                let bubbles = self.read_bubbles().await;
                if bubbles.len() < *baseline {
                    // A widget rerender collapsed the thread; re-anchor so
                    // the next appended message still counts.
                    *baseline = bubbles.len();
                }
                if bubbles.len() > *baseline {
                    let fresh: Vec<String> = bubbles[*baseline..]
                        .iter()
                        .map(|b| b.trim().to_string())
                        .filter(|b| !b.is_empty() && b.as_str() != sent)
                        .collect();
                    *baseline = bubbles.len();
                    if !fresh.is_empty() {
                        return Ok(fresh.join("\n"));
                    }
                    // Only our own echo so far; keep waiting past it.
                }
                if poll.expired() {
                    break;
                }
                poll.tick().await;
            }
            if attempt == 1 && turn < max {
                attempt += 1;
                self.deps.log.warn(
                    "reply",
                    format!("no reply within {}s — retrying the wait once", timeout.as_secs()),
                );
                continue;
            }
            return Err(NegotiateError::ReplyTimeout(timeout));
        }
    }

    // ── composition ─────────────────────────────────────────────────────

    async fn compose_opening(&self) -> String {
        let (template, goals, product_url, locale) = {
            let s = self.session.read().await;
            (
                s.opening_template.clone(),
                s.goals.clone(),
                s.product_url.clone(),
                s.locale.clone(),
            )
        };
        let text = match template {
            Some(t) => substitute_goals(&t, &goals),
            None => {
                self.deps
                    .reply_gen
                    .opening_message(&goals, Some(&product_url), &locale)
                    .await
            }
        };
        let text = text.trim().to_string();
        if text.is_empty() {
            fallback_reply(&locale).to_string()
        } else {
            text
        }
    }

    async fn compose_reply(&self, supplier_text: &str) -> String {
        let (messages, goals, product_url, locale) = {
            let s = self.session.read().await;
            (
                s.messages.clone(),
                s.goals.clone(),
                s.product_url.clone(),
                s.locale.clone(),
            )
        };
        let text = self
            .deps
            .reply_gen
            .next_reply(&messages, supplier_text, &goals, &product_url, &locale)
            .await;
        let text = text.trim().to_string();
        if text.is_empty() {
            self.deps.log.warn(
                "ai",
                "generator returned empty text — using the courtesy fallback",
            );
            fallback_reply(&locale).to_string()
        } else {
            text
        }
    }

    // ── plumbing ────────────────────────────────────────────────────────

    fn check_stop(&self) -> Result<(), NegotiateError> {
        if *self.abort.borrow() {
            return Err(NegotiateError::Cancelled);
        }
        if self.deps.page.is_closed() {
            return Err(NegotiateError::PageClosed);
        }
        Ok(())
    }

    async fn pause_at(&mut self, gate: GateName) -> Result<(), NegotiateError> {
        self.check_stop()?;
        let auto = self.deps.gates.auto_open(gate).as_secs();
        self.deps.log.info(
            "gate",
            format!("paused at '{gate}' — open it or it auto-opens in {auto}s"),
        );
        match self.deps.gates.await_open(gate, &mut self.abort).await {
            GateWait::Opened => {
                self.deps
                    .log
                    .info("gate", format!("'{gate}' opened by operator"));
                Ok(())
            }
            GateWait::AutoAdvanced => {
                self.deps
                    .log
                    .info("gate", format!("'{gate}' auto-opened after {auto}s"));
                Ok(())
            }
            GateWait::Cancelled => Err(NegotiateError::Cancelled),
        }
    }

    async fn transition(&self, state: NegotiationState) {
        {
            let mut s = self.session.write().await;
            s.set_state(state);
        }
        self.persist().await;
        self.deps
            .log
            .info("machine", format!("state → {}", state.as_str()));
    }

    async fn persist(&self) {
        let snap = { self.session.read().await.snapshot() };
        self.deps.artifacts.save_status(&snap);
    }

    async fn record_message(&self, role: ChatRole, text: &str) {
        let (id, messages) = {
            let mut s = self.session.write().await;
            s.push_message(role, text);
            (s.id.clone(), s.messages.clone())
        };
        self.deps.artifacts.save_transcript(&id, &messages);
    }

    async fn shoot(&self, tag: &str) {
        let id = { self.session.read().await.id.clone() };
        self.deps
            .artifacts
            .save_screenshot(&id, self.deps.page.as_ref(), tag)
            .await;
    }

    async fn first_visible_input(&self) -> Option<String> {
        for sel in &self.deps.site.chat_input_selectors {
            if tolerate(self.deps.page.probe_selector(sel).await, "chat input").any_visible() {
                return Some(sel.clone());
            }
        }
        None
    }

    /// Bubble texts under the first configured selector that matches
    /// anything right now.
    async fn read_bubbles(&self) -> Vec<String> {
        for sel in &self.deps.site.message_bubble_selectors {
            let texts = tolerate(self.deps.page.collect_texts(sel).await, "message bubbles");
            if !texts.is_empty() {
                return texts;
            }
        }
        Vec::new()
    }

    async fn human_pause(&self) {
        if !self.deps.pacing.humanize {
            return;
        }
        let ms = {
            use rand::prelude::*;
            let mut rng = rand::rng();
            rng.random_range(400..=1200)
        };
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

/// Last-resort reply when the generator produces nothing usable.
fn fallback_reply(locale: &str) -> &'static str {
    if locale.starts_with("en") {
        "Thank you for your reply. We will get back to you shortly."
    } else {
        "感谢您的回复，我们会尽快与您联系。"
    }
}

fn preview(text: &str) -> String {
    let flat = text.replace('\n', " ");
    let mut out: String = flat.chars().take(80).collect();
    if flat.chars().count() > 80 {
        out.push('…');
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Admission and run lifecycle
// ─────────────────────────────────────────────────────────────────────────────

/// Rejections at the start boundary, before any browser exists.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("a run is already active — stop it first")]
    AlreadyRunning,
    #[error("{0}")]
    Invalid(String),
    #[error("no login-only session is holding a browser")]
    NoHeldBrowser,
    #[error("held session is not ready for a product: {0}")]
    NotReady(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
}

/// Validates a start request, creates the session and spawns the driving
/// task. Returns the new session id.
pub async fn start_negotiation(
    state: &AppState,
    req: StartRequest,
) -> Result<String, AdmissionError> {
    let mut slot = state.run_slot.lock().await;
    retire_finished(&mut slot);
    if slot.active.is_some() {
        return Err(AdmissionError::AlreadyRunning);
    }

    let url = state
        .site
        .normalize_product_url(&req.product_url)
        .map_err(|e| AdmissionError::Invalid(format!("product_url: {e}")))?;
    let max_turns = req
        .max_turns
        .unwrap_or_else(|| state.config.resolve_max_turns());
    if max_turns == 0 {
        return Err(AdmissionError::Invalid("max_turns must be at least 1".into()));
    }
    let wait_timeout_s = req
        .wait_timeout_s
        .unwrap_or_else(|| state.config.resolve_wait_timeout_s());
    if !(1..=MAX_WAIT_TIMEOUT_S).contains(&wait_timeout_s) {
        return Err(AdmissionError::Invalid(format!(
            "wait_timeout_s must be between 1 and {MAX_WAIT_TIMEOUT_S}"
        )));
    }
    let wait_timeout = Duration::from_secs(wait_timeout_s);
    let locale = req
        .locale
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| state.config.resolve_locale());

    let session_obj = Session::new(
        RunKind::Negotiation,
        url.as_str(),
        req.goals,
        locale,
        max_turns,
        wait_timeout,
    )
    .with_opening_template(req.opening_template);
    let id = session_obj.id.clone();
    let session = session_obj.shared();

    state.gates.reset_all();
    let (abort_tx, abort_rx) = watch::channel(false);
    let driver: SharedDriver = Arc::new(tokio::sync::Mutex::new(None));
    let log = SessionLog::new(state.log_hub.clone(), id.as_str());
    log.info("session", format!("negotiation {id} created for {url}"));

    let task = tokio::spawn(drive_negotiation(
        state.clone(),
        session.clone(),
        abort_rx,
        driver.clone(),
        log,
    ));
    slot.active = Some(RunHandle {
        session,
        kind: RunKind::Negotiation,
        abort: abort_tx,
        task,
        driver,
    });
    Ok(id)
}

/// Launches a browser, signs in, and parks it for later product navigation.
pub async fn start_login_only(state: &AppState) -> Result<String, AdmissionError> {
    let mut slot = state.run_slot.lock().await;
    retire_finished(&mut slot);
    if slot.active.is_some() {
        return Err(AdmissionError::AlreadyRunning);
    }

    let session_obj = Session::new(
        RunKind::LoginOnly,
        String::new(),
        NegotiationGoals::new(),
        state.config.resolve_locale(),
        1,
        Duration::from_secs(state.config.resolve_wait_timeout_s()),
    );
    let id = session_obj.id.clone();
    let session = session_obj.shared();

    let (abort_tx, abort_rx) = watch::channel(false);
    let driver: SharedDriver = Arc::new(tokio::sync::Mutex::new(None));
    let log = SessionLog::new(state.log_hub.clone(), id.as_str());
    log.info("session", format!("login-only session {id} created"));

    let task = tokio::spawn(drive_login_only(
        state.clone(),
        session.clone(),
        abort_rx,
        driver.clone(),
        log,
    ));
    slot.active = Some(RunHandle {
        session,
        kind: RunKind::LoginOnly,
        abort: abort_tx,
        task,
        driver,
    });
    Ok(id)
}

/// Steers a held login-only browser to a product page. Requires the session
/// to be parked at `READY_FOR_PRODUCT`; returns the normalized URL on
/// success and moves the session to `AT_PRODUCT`.
pub async fn goto_product(
    state: &AppState,
    req: GotoProductRequest,
) -> Result<String, AdmissionError> {
    // Snapshot the handle under the lock, navigate after releasing it so
    // status queries are not blocked behind a page load.
    let (session, driver) = {
        let slot = state.run_slot.lock().await;
        let handle = slot
            .active
            .as_ref()
            .filter(|h| !h.task.is_finished())
            .ok_or(AdmissionError::NoHeldBrowser)?;
        if handle.kind != RunKind::LoginOnly {
            return Err(AdmissionError::NotReady(
                "active run is a negotiation, not a held login session".into(),
            ));
        }
        (handle.session.clone(), handle.driver.clone())
    };
    let page = { driver.lock().await.clone() }.ok_or(AdmissionError::NoHeldBrowser)?;
    {
        let s = session.read().await;
        if s.state != NegotiationState::ReadyForProduct {
            return Err(AdmissionError::NotReady(format!(
                "session is at {}, needs READY_FOR_PRODUCT",
                s.state.as_str()
            )));
        }
    }
    let url = state
        .site
        .normalize_product_url(&req.product_url)
        .map_err(|e| AdmissionError::Invalid(format!("product_url: {e}")))?;

    page.goto(url.as_str())
        .await
        .map_err(|e| AdmissionError::Navigation(e.to_string()))?;
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let landed = tolerate(page.current_url().await, "current url");
    if state.site.is_error_redirect(&landed) {
        return Err(AdmissionError::Navigation(format!(
            "site pushed back to {landed}"
        )));
    }

    let snap = {
        let mut s = session.write().await;
        s.product_url = url.to_string();
        s.set_state(NegotiationState::AtProduct);
        s.snapshot()
    };
    let artifacts = ArtifactStore::new(&state.data_dir());
    artifacts.save_status(&snap);
    artifacts
        .save_screenshot(&snap.session_id, page.as_ref(), "product_open")
        .await;
    let log = SessionLog::new(state.log_hub.clone(), snap.session_id.as_str());
    log.info("navigate", format!("product page open: {url}"));
    Ok(url.to_string())
}

/// Flips the abort switch on the active run. Returns the stopped session's
/// id, or `None` when nothing is running.
pub async fn stop_active(state: &AppState) -> Option<String> {
    let slot = state.run_slot.lock().await;
    let handle = slot.active.as_ref()?;
    if handle.task.is_finished() {
        return None;
    }
    let _ = handle.abort.send(true);
    let id = handle.session.read().await.id.clone();
    Some(id)
}

/// Moves a finished handle out of the active slot so the latched last
/// session takes over for status queries.
fn retire_finished(slot: &mut RunSlot) {
    let finished = slot
        .active
        .as_ref()
        .map(|h| h.task.is_finished())
        .unwrap_or(false);
    if finished {
        if let Some(h) = slot.active.take() {
            slot.last = Some(h.session);
        }
    }
}

async fn drive_negotiation(
    state: AppState,
    session: SharedSession,
    abort: watch::Receiver<bool>,
    driver: SharedDriver,
    log: SessionLog,
) {
    let data_dir = state.data_dir();
    let artifacts = ArtifactStore::new(&data_dir);

    let mut browser = match BrowserSession::launch(&state.config).await {
        Ok(b) => b,
        Err(e) => {
            fail_before_browser(&artifacts, &session, &log, NegotiateError::Launch(e.to_string()))
                .await;
            return;
        }
    };
    identity::auto_inject(browser.page(), &data_dir).await;
    {
        session.write().await.mark_started();
    }

    let page = browser.driver();
    {
        *driver.lock().await = Some(page.clone());
    }

    let deps = MachineDeps {
        page: page.clone(),
        site: state.site.clone(),
        gates: state.gates.clone(),
        reply_gen: state.reply_gen.clone(),
        artifacts: ArtifactStore::new(&data_dir),
        log: log.clone(),
        pacing: MachinePacing::default(),
    };
    let outcome = run_machine(deps, session.clone(), abort).await;

    if let Err(e) = &outcome {
        if !matches!(e, NegotiateError::Cancelled) {
            let id = { session.read().await.id.clone() };
            artifacts.save_screenshot(&id, page.as_ref(), "error").await;
        }
    }
    identity::capture_from_page(browser.page(), &data_dir).await;
    let id = finalize_run(&artifacts, &session, &log, &outcome).await;
    {
        *driver.lock().await = None;
    }
    browser.close().await;
    log.info("session", format!("browser closed — artifacts under sessions/{id}"));
}

/// Latches the run outcome on the session and persists the final status,
/// transcript and summary. Browserless on purpose — every ending, including
/// the failing ones, goes through here. Returns the session id.
pub async fn finalize_run(
    artifacts: &ArtifactStore,
    session: &SharedSession,
    log: &SessionLog,
    outcome: &Result<(), NegotiateError>,
) -> String {
    match outcome {
        Ok(()) => log.info("session", "negotiation complete"),
        Err(NegotiateError::Cancelled) => {
            session.write().await.set_state(NegotiationState::Cancelled);
            log.info("session", "run stopped by operator");
        }
        Err(e) => {
            session.write().await.fail(e);
            log.error("session", format!("run failed: {e}"));
        }
    }

    let (id, snap, messages, summary) = {
        let s = session.read().await;
        (s.id.clone(), s.snapshot(), s.messages.clone(), s.summary())
    };
    artifacts.save_status(&snap);
    artifacts.save_transcript(&id, &messages);
    artifacts.save_summary(&summary);
    id
}

async fn drive_login_only(
    state: AppState,
    session: SharedSession,
    abort: watch::Receiver<bool>,
    driver: SharedDriver,
    log: SessionLog,
) {
    let data_dir = state.data_dir();
    let artifacts = ArtifactStore::new(&data_dir);

    let mut browser = match BrowserSession::launch(&state.config).await {
        Ok(b) => b,
        Err(e) => {
            fail_before_browser(&artifacts, &session, &log, NegotiateError::Launch(e.to_string()))
                .await;
            return;
        }
    };
    identity::auto_inject(browser.page(), &data_dir).await;
    {
        session.write().await.mark_started();
    }

    let page = browser.driver();
    {
        *driver.lock().await = Some(page.clone());
    }

    let deps = MachineDeps {
        page: page.clone(),
        site: state.site.clone(),
        gates: state.gates.clone(),
        reply_gen: state.reply_gen.clone(),
        artifacts: ArtifactStore::new(&data_dir),
        log: log.clone(),
        pacing: MachinePacing::default(),
    };
    let mut machine = Machine::new(deps, session.clone(), abort);

    match machine.login_and_park().await {
        Ok(()) => {
            identity::capture_from_page(browser.page(), &data_dir).await;
            match machine.hold().await {
                HoldEnd::Stopped => {
                    session.write().await.set_state(NegotiationState::Cancelled);
                    log.info("session", "held session stopped by operator");
                }
                HoldEnd::WindowClosed => {
                    session.write().await.set_state(NegotiationState::Done);
                    log.info("session", "held browser window closed — session over");
                }
            }
            if !browser.is_closed() {
                identity::capture_from_page(browser.page(), &data_dir).await;
            }
        }
        Err(NegotiateError::Cancelled) => {
            session.write().await.set_state(NegotiationState::Cancelled);
            log.info("session", "run stopped by operator");
        }
        Err(e) => {
            session.write().await.fail(&e);
            log.error("session", format!("login-only run failed: {e}"));
            let id = { session.read().await.id.clone() };
            artifacts.save_screenshot(&id, page.as_ref(), "error").await;
        }
    }

    let snap = { session.read().await.snapshot() };
    artifacts.save_status(&snap);
    {
        *driver.lock().await = None;
    }
    browser.close().await;
    log.info("session", "browser closed");
}

/// Launch failed: latch the error and persist what little there is.
async fn fail_before_browser(
    artifacts: &ArtifactStore,
    session: &SharedSession,
    log: &SessionLog,
    err: NegotiateError,
) {
    log.error("browser", err.to_string());
    let snap = {
        let mut s = session.write().await;
        s.fail(&err);
        s.snapshot()
    };
    artifacts.save_status(&snap);
}
