//! Behavioral checks for the login and challenge detectors.
//!
//! These run the detectors against a read-only stub page carrying the
//! shipped site profile, so the ladder order (URL beats cookie, cookie
//! beats affordance, visibility rules) is pinned against the production
//! selector set. Waits run on the paused tokio clock.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

use cortex_parley::browser::page::{PageDriver, SelectorProbe};
use cortex_parley::core::loghub::{LogHub, SessionLog};
use cortex_parley::detect::{CaptchaDetector, LoginDetector, WaitOutcome};
use cortex_parley::site::SiteProfile;

#[derive(Default)]
struct StubState {
    url: String,
    title: String,
    body: String,
    cookies: Vec<String>,
    /// Selectors that match and render.
    visible: HashSet<String>,
    /// Selectors that match but are styled away.
    hidden: HashSet<String>,
}

/// Read-only page: detectors only observe it, so every mutation path is a
/// no-op and tests poke the state directly.
#[derive(Default)]
struct StubPage {
    s: Mutex<StubState>,
}

impl StubPage {
    fn new(url: &str) -> Arc<Self> {
        let page = Arc::new(Self::default());
        page.s.lock().unwrap().url = url.to_string();
        page
    }

    fn set_cookies(&self, names: &[&str]) {
        self.s.lock().unwrap().cookies = names.iter().map(|s| s.to_string()).collect();
    }

    fn set_title(&self, title: &str) {
        self.s.lock().unwrap().title = title.to_string();
    }

    fn set_body(&self, body: &str) {
        self.s.lock().unwrap().body = body.to_string();
    }

    fn show(&self, selector: &str) {
        self.s.lock().unwrap().visible.insert(selector.to_string());
    }

    fn show_hidden(&self, selector: &str) {
        self.s.lock().unwrap().hidden.insert(selector.to_string());
    }

    fn clear_selector(&self, selector: &str) {
        let mut s = self.s.lock().unwrap();
        s.visible.remove(selector);
        s.hidden.remove(selector);
    }
}

#[async_trait]
impl PageDriver for StubPage {
    fn is_closed(&self) -> bool {
        false
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.s.lock().unwrap().url.clone())
    }

    async fn title(&self) -> Result<String> {
        Ok(self.s.lock().unwrap().title.clone())
    }

    async fn body_text(&self) -> Result<String> {
        Ok(self.s.lock().unwrap().body.clone())
    }

    async fn cookie_names(&self) -> Result<Vec<String>> {
        Ok(self.s.lock().unwrap().cookies.clone())
    }

    async fn goto(&self, url: &str) -> Result<()> {
        self.s.lock().unwrap().url = url.to_string();
        Ok(())
    }

    async fn probe_selector(&self, selector: &str) -> Result<SelectorProbe> {
        let s = self.s.lock().unwrap();
        if s.visible.contains(selector) {
            Ok(SelectorProbe {
                matches: 1,
                visible: 1,
            })
        } else if s.hidden.contains(selector) {
            Ok(SelectorProbe {
                matches: 1,
                visible: 0,
            })
        } else {
            Ok(SelectorProbe::default())
        }
    }

    async fn text_visible(&self, needle: &str) -> Result<bool> {
        Ok(self.s.lock().unwrap().body.contains(needle))
    }

    async fn click_selector(&self, _selector: &str) -> Result<bool> {
        Ok(false)
    }

    async fn click_text(&self, _tags: &str, _needle: &str) -> Result<bool> {
        Ok(false)
    }

    async fn type_text(&self, _selector: &str, _text: &str) -> Result<bool> {
        Ok(false)
    }

    async fn press_enter(&self, _selector: &str) -> Result<bool> {
        Ok(false)
    }

    async fn collect_texts(&self, _selector: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

fn login_detector() -> LoginDetector {
    LoginDetector::new(SiteProfile::default())
}

fn captcha_detector() -> CaptchaDetector {
    CaptchaDetector::new(SiteProfile::default())
}

fn test_log() -> SessionLog {
    SessionLog::new(Arc::new(LogHub::new()), "detector-test")
}

#[tokio::test]
async fn stale_auth_cookie_on_the_login_page_never_counts() {
    let page = StubPage::new("https://login.1688.com/member/signin.htm?redirect=x");
    page.set_cookies(&["cookie2", "_tb_token_"]);

    let verdict = login_detector().assess(page.as_ref()).await;
    assert!(!verdict.hit, "login page must never read as signed in");
    assert!(verdict.reason.contains("login/verification"));
}

#[tokio::test]
async fn verification_page_never_counts_either() {
    let page = StubPage::new("https://www.1688.com/identity/verify?token=y");
    page.set_cookies(&["cookie2"]);

    let verdict = login_detector().assess(page.as_ref()).await;
    assert!(!verdict.hit);
}

#[tokio::test]
async fn auth_cookie_on_the_main_domain_wins() {
    let page = StubPage::new("https://www.1688.com/");
    page.set_cookies(&["cna", "cookie2"]);
    // Even a visible login link loses to the cookie at this rung.
    page.show(r#"a[href*="login"]"#);

    let verdict = login_detector().assess(page.as_ref()).await;
    assert!(verdict.hit);
    assert!(verdict.reason.contains("auth cookie"));
}

#[tokio::test]
async fn visible_login_affordance_without_cookie_reads_signed_out() {
    let page = StubPage::new("https://www.1688.com/");
    page.show(".login-btn");

    let verdict = login_detector().assess(page.as_ref()).await;
    assert!(!verdict.hit);
    assert!(verdict.reason.contains("login affordance"));
}

#[tokio::test]
async fn hidden_login_affordance_does_not_flip_the_verdict() {
    let page = StubPage::new("https://www.1688.com/");
    page.show_hidden(".login-btn");

    let verdict = login_detector().assess(page.as_ref()).await;
    assert!(verdict.hit, "a styled-away login link is not a signal");
}

#[tokio::test]
async fn quiet_main_domain_page_defaults_to_signed_in() {
    let page = StubPage::new("https://detail.1688.com/offer/609815753222.html");

    let verdict = login_detector().assess(page.as_ref()).await;
    assert!(verdict.hit);
    assert!(verdict.reason.contains("no contrary signal"));
}

#[tokio::test]
async fn off_domain_page_without_signals_defaults_to_signed_out() {
    let page = StubPage::new("https://example.com/somewhere");

    let verdict = login_detector().assess(page.as_ref()).await;
    assert!(!verdict.hit, "off the target domain the default flips");
}

#[tokio::test]
async fn account_affordance_rescues_an_off_domain_page() {
    let page = StubPage::new("https://example.com/somewhere");
    page.show(".member-nickname");

    let verdict = login_detector().assess(page.as_ref()).await;
    assert!(verdict.hit);
    assert!(verdict.reason.contains("account affordance"));
}

#[tokio::test(start_paused = true)]
async fn login_wait_resolves_once_the_auth_cookie_lands() {
    let page = StubPage::new("https://login.1688.com/member/signin.htm");
    let (_abort_tx, mut abort_rx) = watch::channel(false);
    let log = test_log();

    let mover = Arc::clone(&page);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        mover.goto("https://work.1688.com/home/seller.htm").await.unwrap();
        mover.set_cookies(&["cookie2"]);
    });

    let outcome = login_detector()
        .wait_until_logged_in(page.as_ref(), &mut abort_rx, &log)
        .await;
    assert_eq!(outcome, WaitOutcome::Satisfied);
}

#[tokio::test(start_paused = true)]
async fn login_wait_stops_on_operator_abort() {
    let page = StubPage::new("https://login.1688.com/member/signin.htm");
    let (abort_tx, mut abort_rx) = watch::channel(false);
    let log = test_log();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        let _ = abort_tx.send(true);
    });

    let outcome = login_detector()
        .wait_until_logged_in(page.as_ref(), &mut abort_rx, &log)
        .await;
    assert_eq!(outcome, WaitOutcome::Cancelled);
}

#[tokio::test]
async fn challenge_container_counts_even_when_styled_invisible() {
    let page = StubPage::new("https://detail.1688.com/offer/609815753222.html");
    page.show_hidden("#nocaptcha");

    let verdict = captcha_detector().scan(page.as_ref()).await;
    assert!(verdict.hit, "a mounted challenge iframe counts before it paints");
    assert!(verdict.reason.contains("challenge container"));
}

#[tokio::test]
async fn punish_url_marker_reads_as_blocked() {
    let page = StubPage::new("https://g.alicdn.com/punish/sliding-verify.html");

    let verdict = captcha_detector().scan(page.as_ref()).await;
    assert!(verdict.hit);
    assert!(verdict.reason.contains("URL marker"));
}

#[tokio::test]
async fn verification_url_only_blocks_on_the_target_domain() {
    let on_site = StubPage::new("https://www.1688.com/identity/verify?x=1");
    assert!(captcha_detector().scan(on_site.as_ref()).await.hit);

    // The same path elsewhere is someone else's problem, not a challenge.
    let off_site = StubPage::new("https://example.com/identity/verify");
    assert!(!captcha_detector().scan(off_site.as_ref()).await.hit);
}

#[tokio::test]
async fn challenge_title_and_body_phrases_read_as_blocked() {
    let titled = StubPage::new("https://detail.1688.com/offer/1.html");
    titled.set_title("安全验证 - 1688.com");
    assert!(captcha_detector().scan(titled.as_ref()).await.hit);

    let bodied = StubPage::new("https://detail.1688.com/offer/1.html");
    bodied.set_body("We have detected Unusual Traffic from your network.");
    let verdict = captcha_detector().scan(bodied.as_ref()).await;
    assert!(verdict.hit);
    assert!(verdict.reason.contains("body phrase"));
}

#[tokio::test]
async fn ordinary_product_page_scans_clean() {
    let page = StubPage::new("https://detail.1688.com/offer/609815753222.html");
    page.set_title("医用隔帘 批发价格");
    page.set_body("批发价格 ¥12.50 起订量 100件 联系供应商");

    let verdict = captcha_detector().scan(page.as_ref()).await;
    assert!(!verdict.hit, "unexpected challenge verdict: {}", verdict.reason);
}

#[tokio::test(start_paused = true)]
async fn captcha_wait_resolves_when_the_challenge_clears() {
    let page = StubPage::new("https://detail.1688.com/offer/1.html");
    page.show("#nocaptcha");
    let (_abort_tx, mut abort_rx) = watch::channel(false);
    let log = test_log();

    let solver = Arc::clone(&page);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        solver.clear_selector("#nocaptcha");
    });

    let outcome = captcha_detector()
        .wait_for_clear(page.as_ref(), Duration::from_secs(60), &mut abort_rx, &log)
        .await;
    assert_eq!(outcome, WaitOutcome::Satisfied);
}

#[tokio::test(start_paused = true)]
async fn captcha_wait_times_out_while_still_blocked() {
    let page = StubPage::new("https://detail.1688.com/offer/1.html");
    page.show("#nocaptcha");
    let (_abort_tx, mut abort_rx) = watch::channel(false);
    let log = test_log();

    let outcome = captcha_detector()
        .wait_for_clear(page.as_ref(), Duration::from_secs(5), &mut abort_rx, &log)
        .await;
    assert_eq!(outcome, WaitOutcome::TimedOut);
}
