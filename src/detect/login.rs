//! Login-state detection.
//!
//! Classifies the live page as logged-in or not using only observable
//! signals: current URL, cookie names, and visible affordances. The ladder
//! is strictly ordered and the first conclusive signal wins:
//!
//! 1. A login or verification URL is never "logged in", whatever the
//!    cookies say — sites keep stale auth cookies on their login pages.
//! 2. On the main domain: auth cookie → yes; visible login/register
//!    affordance → no; visible account affordance → yes; otherwise assume
//!    the session is live rather than stall on a redesigned header.
//! 3. Anywhere else the default flips pessimistic: only a known
//!    authenticated URL pattern plus a cookie, an account affordance, or a
//!    bare auth cookie count as logged in.

use std::time::Duration;

use tokio::sync::watch;

use crate::browser::page::PageDriver;
use crate::core::loghub::SessionLog;
use crate::core::site::SiteProfile;
use crate::detect::{tolerate, PollLoop, Verdict, WaitOutcome};

/// Fixed poll interval for the indefinite login wait.
pub const LOGIN_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How many polls between "still waiting" log lines (~30 s at 2 s/poll).
const WAIT_LOG_EVERY: u64 = 15;

pub struct LoginDetector {
    site: SiteProfile,
}

impl LoginDetector {
    pub fn new(site: SiteProfile) -> Self {
        Self { site }
    }

    /// Fresh classification of the current page. Every probe failure is
    /// tolerated as "no signal" so a mid-navigation page cannot poison the
    /// verdict.
    pub async fn assess(&self, page: &dyn PageDriver) -> Verdict {
        let url = tolerate(page.current_url().await, "login url");

        if self.site.is_login_url(&url) || self.site.is_verification_url(&url) {
            return Verdict::miss(format!("on login/verification page: {url}"));
        }

        let has_cookie = self.has_auth_cookie(page).await;

        if self.site.is_target_domain(&url) {
            if has_cookie {
                return Verdict::hit("main domain with auth cookie");
            }
            if self.login_affordance_visible(page).await {
                return Verdict::miss("login affordance visible on main domain");
            }
            if self.authed_affordance_visible(page).await {
                return Verdict::hit("account affordance visible on main domain");
            }
            return Verdict::hit("main domain, no contrary signal");
        }

        if has_cookie && self.site.is_authed_url(&url) {
            return Verdict::hit(format!("authenticated URL with auth cookie: {url}"));
        }
        if self.login_affordance_visible(page).await {
            return Verdict::miss("login affordance visible");
        }
        if self.authed_affordance_visible(page).await {
            return Verdict::hit("account affordance visible");
        }
        if has_cookie {
            return Verdict::hit("auth cookie present");
        }
        Verdict::miss(format!("no authentication signal on {url}"))
    }

    /// Polls [`assess`] every 2 s with no deadline — login can involve a
    /// phone check or a slow human, so only success, page closure, or an
    /// operator stop end the wait.
    ///
    /// [`assess`]: LoginDetector::assess
    pub async fn wait_until_logged_in(
        &self,
        page: &dyn PageDriver,
        abort: &mut watch::Receiver<bool>,
        log: &SessionLog,
    ) -> WaitOutcome {
        let poll = PollLoop::unbounded(LOGIN_POLL_INTERVAL);
        let mut checks: u64 = 0;
        loop {
            if *abort.borrow() {
                return WaitOutcome::Cancelled;
            }
            if page.is_closed() {
                log.warn("login", "page closed while waiting for login");
                return WaitOutcome::PageClosed;
            }
            let verdict = self.assess(page).await;
            if verdict.hit {
                log.info("login", format!("logged in — {}", verdict.reason));
                return WaitOutcome::Satisfied;
            }
            checks += 1;
            if checks % WAIT_LOG_EVERY == 1 {
                log.info("login", format!("waiting for login — {}", verdict.reason));
            }
            poll.tick().await;
        }
    }

    async fn has_auth_cookie(&self, page: &dyn PageDriver) -> bool {
        let names = tolerate(page.cookie_names().await, "cookie");
        names
            .iter()
            .any(|n| self.site.auth_cookie_names.iter().any(|a| a == n))
    }

    async fn login_affordance_visible(&self, page: &dyn PageDriver) -> bool {
        for sel in &self.site.login_affordance_selectors {
            if tolerate(page.probe_selector(sel).await, "login affordance").any_visible() {
                return true;
            }
        }
        for text in &self.site.login_affordance_texts {
            if tolerate(page.text_visible(text).await, "login text") {
                return true;
            }
        }
        false
    }

    async fn authed_affordance_visible(&self, page: &dyn PageDriver) -> bool {
        for sel in &self.site.authed_affordance_selectors {
            if tolerate(page.probe_selector(sel).await, "account affordance").any_visible() {
                return true;
            }
        }
        false
    }
}
