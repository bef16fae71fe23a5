use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use url::Url;

/// Everything the engine knows about one target marketplace.
///
/// Detectors and the state machine read every selector, cookie name and URL
/// marker from here; no site constant lives anywhere else. `default()`
/// carries the production 1688.com values, and because the struct is
/// `#[serde(default)]` a partial JSON override keeps the defaults for any
/// field it omits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteProfile {
    /// Registrable domain the negotiation runs against.
    pub main_domain: String,
    pub home_url: String,
    /// Where a login-only run parks the browser after sign-in.
    pub work_home_url: String,
    /// Where the login phase parks the browser for a manual sign-in.
    pub login_entry_url: String,

    /// URL substrings that mark login or verification pages. Strongest
    /// negative signal: a page on one of these is never "logged in".
    pub login_url_markers: Vec<String>,
    /// Cookie names that only exist on an authenticated profile.
    pub auth_cookie_names: Vec<String>,
    /// URL substrings only reachable while logged in.
    pub authed_url_markers: Vec<String>,
    pub login_affordance_selectors: Vec<String>,
    pub login_affordance_texts: Vec<String>,
    pub authed_affordance_selectors: Vec<String>,

    /// Challenge containers count even when styled invisible.
    pub captcha_container_selectors: Vec<String>,
    pub captcha_url_markers: Vec<String>,
    pub verification_url_markers: Vec<String>,
    pub captcha_title_phrases: Vec<String>,
    pub captcha_body_phrases: Vec<String>,

    pub chat_entry_selectors: Vec<String>,
    pub chat_entry_texts: Vec<String>,
    pub chat_input_selectors: Vec<String>,
    pub send_button_selectors: Vec<String>,
    pub send_button_texts: Vec<String>,
    pub message_bubble_selectors: Vec<String>,

    /// Landing on one of these after a navigation means the target page is
    /// gone or the site bounced us.
    pub error_redirect_markers: Vec<String>,
    /// `{id}` is replaced with the numeric offer id.
    pub product_url_template: String,
    /// Query parameters stripped from product URLs before navigation.
    pub tracking_params: Vec<String>,
}

impl Default for SiteProfile {
    fn default() -> Self {
        fn v(items: &[&str]) -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        }
        Self {
            main_domain: "1688.com".to_string(),
            home_url: "https://www.1688.com".to_string(),
            work_home_url: "https://work.1688.com/?tracelog=login_target_is_blank_1688"
                .to_string(),
            // The taobao redirect chain that lands on the 1688 seller
            // workbench after sign-in. Kept verbatim: hand-editing the
            // nested encoding breaks it.
            login_entry_url: "https://login.taobao.com/?redirect_url=https%3A%2F%2Flogin.1688.com%2Fmember%2Fjump.htm%3Ftarget%3Dhttps%253A%252F%252Flogin.1688.com%252Fmember%252FmarketSigninJump.htm%253FDone%253Dhttps%25253A%25252F%25252Fwork.1688.com%25252Fhome%25252Fseller.htm%25253Fspm%25253Da261p.11773258.topmenu.dsellercenterentry&style=tao_custom&from=1688web".to_string(),
            login_url_markers: v(&[
                "login.1688.com",
                "login.taobao.com",
                "passport.",
                "/member/signin",
                "auth.alibaba.com",
                "/identity/verify",
            ]),
            auth_cookie_names: v(&["UC1", "cna", "_tb_token_", "login_aliyun", "cookie2"]),
            authed_url_markers: v(&["member.1688.com", "work.1688.com", "my.1688.com"]),
            login_affordance_selectors: v(&[
                r#"a[href*="login"]"#,
                ".login-btn",
                ".header-login a",
            ]),
            login_affordance_texts: v(&["请登录", "免费注册", "登录"]),
            authed_affordance_selectors: v(&[
                r#"a[href*="logout"]"#,
                ".member-nickname",
                ".user-name",
                ".nickname",
                r#"img[alt*="avatar"]"#,
            ]),
            captcha_container_selectors: v(&["#nc_1_wrapper", ".nc-container", "#nocaptcha"]),
            captcha_url_markers: v(&["alicdn.com/punish", "punish"]),
            verification_url_markers: v(&["identity/verify"]),
            captcha_title_phrases: v(&["安全验证"]),
            captcha_body_phrases: v(&[
                "访问被拒绝",
                "您的访问被拒绝",
                "异常流量",
                "安全验证",
                "人机验证",
                "unusual traffic",
                "unusual traffic from your network",
                "verify you are a human",
                "security check",
            ]),
            chat_entry_selectors: v(&[
                r#"a[href*="im.1688.com"]"#,
                ".offer-contact .contact-im",
                ".J_WWButton",
                r#"[class*="ww-online"]"#,
            ]),
            chat_entry_texts: v(&["联系供应商", "客服"]),
            chat_input_selectors: v(&[
                r#"pre.edit[contenteditable="true"]"#,
                r#"div[contenteditable="true"]"#,
                "textarea.chat-input",
                "textarea",
                r#"[class*="send-textarea"]"#,
            ]),
            send_button_selectors: v(&["button.send-btn", r#"[class*="send-button"]"#]),
            send_button_texts: v(&["发送"]),
            message_bubble_selectors: v(&[
                ".message-item",
                ".msg-content",
                r#"[class*="message-text"]"#,
                r#"[class*="bubble"]"#,
            ]),
            error_redirect_markers: v(&[
                "error.1688.com",
                "err.taobao",
                "about:blank",
                "chrome-error://",
            ]),
            product_url_template: "https://detail.1688.com/offer/{id}.html".to_string(),
            tracking_params: v(&["spm"]),
        }
    }
}

static OFFER_PATH_RE: OnceLock<Regex> = OnceLock::new();
static DIGIT_RUN_RE: OnceLock<Regex> = OnceLock::new();

fn offer_path_re() -> &'static Regex {
    OFFER_PATH_RE
        .get_or_init(|| Regex::new(r"/offer/(\d{6,})\.html").expect("valid offer path pattern"))
}

fn digit_run_re() -> &'static Regex {
    DIGIT_RUN_RE.get_or_init(|| Regex::new(r"\d{6,}").expect("valid digit run pattern"))
}

impl SiteProfile {
    /// Main domain or any subdomain of it.
    pub fn host_matches(&self, host: &str) -> bool {
        host == self.main_domain || host.ends_with(&format!(".{}", self.main_domain))
    }

    pub fn is_target_domain(&self, url: &str) -> bool {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| self.host_matches(h)))
            .unwrap_or(false)
    }

    pub fn is_login_url(&self, url: &str) -> bool {
        contains_any(url, &self.login_url_markers)
    }

    pub fn is_verification_url(&self, url: &str) -> bool {
        contains_any(url, &self.verification_url_markers)
    }

    pub fn is_authed_url(&self, url: &str) -> bool {
        contains_any(url, &self.authed_url_markers)
    }

    pub fn is_error_redirect(&self, url: &str) -> bool {
        url.is_empty() || contains_any(url, &self.error_redirect_markers)
    }

    pub fn offer_url(&self, id: &str) -> String {
        self.product_url_template.replace("{id}", id)
    }

    /// Canonicalizes whatever the operator pasted into a product URL.
    ///
    /// Accepts a bare numeric offer id, a URL carrying an `offerId` query
    /// parameter, any `/offer/<id>.html` path (mobile and detail variants),
    /// or any on-domain URL with a recoverable run of 6+ digits. Every
    /// accepted form is rewritten to the canonical offer-detail URL.
    /// Foreign hosts are rejected outright.
    pub fn normalize_product_url(&self, input: &str) -> Result<Url> {
        let raw = input.trim();
        if raw.is_empty() {
            bail!("empty product URL");
        }

        if raw.chars().all(|c| c.is_ascii_digit()) {
            if raw.len() < 6 {
                bail!("offer id too short: {raw}");
            }
            return Url::parse(&self.offer_url(raw)).context("building canonical offer URL");
        }

        let url = Url::parse(raw).with_context(|| format!("unparseable product URL: {raw}"))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("unsupported scheme: {}", url.scheme());
        }
        let host = url.host_str().unwrap_or_default();
        if !self.host_matches(host) {
            bail!("host {host} is outside {}", self.main_domain);
        }

        if let Some((_, value)) = url
            .query_pairs()
            .find(|(k, _)| k.eq_ignore_ascii_case("offerId"))
        {
            let id: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
            if id.len() >= 6 {
                return Url::parse(&self.offer_url(&id)).context("building canonical offer URL");
            }
        }

        if let Some(caps) = offer_path_re().captures(url.path()) {
            return Url::parse(&self.offer_url(&caps[1])).context("building canonical offer URL");
        }

        if let Some(m) = digit_run_re().find(raw) {
            return Url::parse(&self.offer_url(m.as_str())).context("building canonical offer URL");
        }

        bail!("no offer id found in {raw}")
    }

    /// Drops tracking query parameters; leaves unparseable input untouched.
    pub fn strip_tracking(&self, raw: &str) -> String {
        match Url::parse(raw) {
            Ok(url) => self.strip_tracking_url(url).to_string(),
            Err(_) => raw.to_string(),
        }
    }

    fn strip_tracking_url(&self, mut url: Url) -> Url {
        if url.query().is_none() {
            return url;
        }
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| {
                !self
                    .tracking_params
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(k.as_ref()))
            })
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut()
                .clear()
                .extend_pairs(kept.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        url
    }
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles
        .iter()
        .any(|n| !n.is_empty() && haystack.contains(n.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdomains_match_main_domain() {
        let site = SiteProfile::default();
        assert!(site.is_target_domain("https://detail.1688.com/offer/609815753222.html"));
        assert!(site.is_target_domain("https://www.1688.com"));
        assert!(!site.is_target_domain("https://evil.example.com/1688.com"));
        // Lookalike registrable domain must not pass.
        assert!(!site.is_target_domain("https://fake-1688.com/offer/609815753222.html"));
    }

    #[test]
    fn bare_offer_id_becomes_canonical_url() {
        let site = SiteProfile::default();
        let url = site.normalize_product_url("609815753222").unwrap();
        assert_eq!(
            url.as_str(),
            "https://detail.1688.com/offer/609815753222.html"
        );
    }

    #[test]
    fn offer_id_query_param_wins() {
        let site = SiteProfile::default();
        let url = site
            .normalize_product_url("https://m.1688.com/winport/b2b.html?offerId=609815753222&spm=a26352.1")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://detail.1688.com/offer/609815753222.html"
        );
    }

    #[test]
    fn offer_paths_are_rewritten_to_canonical() {
        let site = SiteProfile::default();
        for input in [
            "https://detail.1688.com/offer/609815753222.html?spm=a26352.13672862",
            "https://m.1688.com/offer/609815753222.html",
            "https://detail.1688.com/detail/offer/609815753222.html",
        ] {
            let url = site.normalize_product_url(input).unwrap();
            assert_eq!(
                url.as_str(),
                "https://detail.1688.com/offer/609815753222.html"
            );
        }
    }

    #[test]
    fn digit_run_is_recovered_from_odd_paths() {
        let site = SiteProfile::default();
        let url = site
            .normalize_product_url("https://www.1688.com/product/609815753222/detail")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://detail.1688.com/offer/609815753222.html"
        );
    }

    #[test]
    fn foreign_hosts_are_rejected() {
        let site = SiteProfile::default();
        assert!(site.normalize_product_url("https://www.alibaba.com/offer/609815753222.html").is_err());
        assert!(site.normalize_product_url("12345").is_err());
        assert!(site.normalize_product_url("https://www.1688.com/about").is_err());
    }

    #[test]
    fn strip_tracking_preserves_other_params() {
        let site = SiteProfile::default();
        let out = site.strip_tracking("https://detail.1688.com/offer/1.html?spm=x&keep=1");
        assert_eq!(out, "https://detail.1688.com/offer/1.html?keep=1");
        let bare = site.strip_tracking("https://detail.1688.com/offer/1.html?spm=x");
        assert_eq!(bare, "https://detail.1688.com/offer/1.html");
    }

    #[test]
    fn login_and_verification_urls_classify() {
        let site = SiteProfile::default();
        assert!(site.is_login_url("https://login.1688.com/member/signin.htm?redirect=x"));
        assert!(site.is_login_url("https://www.1688.com/identity/verify?token=y"));
        assert!(site.is_verification_url("https://www.1688.com/identity/verify?token=y"));
        assert!(!site.is_login_url("https://detail.1688.com/offer/609815753222.html"));
    }

    #[test]
    fn error_redirects_classify() {
        let site = SiteProfile::default();
        assert!(site.is_error_redirect("about:blank"));
        assert!(site.is_error_redirect("https://error.1688.com/404"));
        assert!(site.is_error_redirect(""));
        assert!(!site.is_error_redirect("https://detail.1688.com/offer/1.html"));
    }
}
