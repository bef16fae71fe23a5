//! Page-query seam between the engine and the live browser.
//!
//! Everything the detectors and the state machine do against a page goes
//! through [`PageDriver`], so the whole negotiation flow runs against a
//! scripted fake in tests. The real implementation ([`CdpPage`]) talks to a
//! chromiumoxide tab and performs every DOM interaction through injected
//! JavaScript — there is no per-element CDP round-trip to get stale handles
//! from.

use anyhow::Result;
use async_trait::async_trait;
use chromiumoxide::Page;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Match counts for one CSS selector.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SelectorProbe {
    pub matches: usize,
    pub visible: usize,
}

impl SelectorProbe {
    pub fn any_visible(&self) -> bool {
        self.visible > 0
    }

    pub fn any_present(&self) -> bool {
        self.matches > 0
    }
}

/// Every browser primitive the engine needs. Probe methods return `Err` only
/// on transport problems; "selector matched nothing" is a normal `Ok` value.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// True once the tab or browser is gone. Must not perform I/O.
    fn is_closed(&self) -> bool;

    async fn current_url(&self) -> Result<String>;
    async fn title(&self) -> Result<String>;
    /// Rendered body text, capped; hidden nodes excluded.
    async fn body_text(&self) -> Result<String>;
    async fn cookie_names(&self) -> Result<Vec<String>>;

    async fn goto(&self, url: &str) -> Result<()>;
    async fn probe_selector(&self, selector: &str) -> Result<SelectorProbe>;
    /// Whether `needle` occurs in the rendered body text.
    async fn text_visible(&self, needle: &str) -> Result<bool>;
    /// Clicks the first visible match. `Ok(false)` = nothing clickable.
    async fn click_selector(&self, selector: &str) -> Result<bool>;
    /// Clicks the first visible element among `tags` whose text contains
    /// `needle`.
    async fn click_text(&self, tags: &str, needle: &str) -> Result<bool>;
    /// Puts `text` into the first visible input-like match and fires input
    /// events. `Ok(false)` = no usable target.
    async fn type_text(&self, selector: &str, text: &str) -> Result<bool>;
    /// Dispatches an Enter key sequence on the first match.
    async fn press_enter(&self, selector: &str) -> Result<bool>;
    /// Trimmed visible texts of all matches, oldest first.
    async fn collect_texts(&self, selector: &str) -> Result<Vec<String>>;
    async fn screenshot_png(&self) -> Result<Vec<u8>>;
}

/// [`PageDriver`] over a live chromiumoxide tab.
#[derive(Clone)]
pub struct CdpPage {
    page: Page,
    closed: Arc<AtomicBool>,
}

impl CdpPage {
    pub fn new(page: Page, closed: Arc<AtomicBool>) -> Self {
        Self { page, closed }
    }

    async fn eval<T: serde::de::DeserializeOwned + Default>(&self, js: String) -> Result<T> {
        let outcome = self.page.evaluate(js).await?;
        Ok(outcome.into_value::<T>().unwrap_or_default())
    }
}

/// JS string literal with proper escaping for embedding in a script.
fn js_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

#[async_trait]
impl PageDriver for CdpPage {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn title(&self) -> Result<String> {
        self.eval("document.title || ''".to_string()).await
    }

    async fn body_text(&self) -> Result<String> {
        self.eval(
            "document.body ? (document.body.innerText || '').slice(0, 20000) : ''".to_string(),
        )
        .await
    }

    async fn cookie_names(&self) -> Result<Vec<String>> {
        let cookies = self.page.get_cookies().await?;
        Ok(cookies.into_iter().map(|c| c.name).collect())
    }

    async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        Ok(())
    }

    async fn probe_selector(&self, selector: &str) -> Result<SelectorProbe> {
        let js = format!(
            r#"(() => {{
                let els;
                try {{ els = document.querySelectorAll({sel}); }} catch (e) {{ return {{ matches: 0, visible: 0 }}; }}
                let visible = 0;
                for (const el of els) {{
                    const r = el.getBoundingClientRect();
                    const st = window.getComputedStyle(el);
                    if (r.width > 0 && r.height > 0 && st.visibility !== 'hidden' && st.display !== 'none') visible++;
                }}
                return {{ matches: els.length, visible }};
            }})()"#,
            sel = js_str(selector)
        );
        self.eval(js).await
    }

    async fn text_visible(&self, needle: &str) -> Result<bool> {
        let js = format!(
            r#"(() => {{
                const body = document.body ? (document.body.innerText || '') : '';
                return body.includes({needle});
            }})()"#,
            needle = js_str(needle)
        );
        self.eval(js).await
    }

    async fn click_selector(&self, selector: &str) -> Result<bool> {
        let js = format!(
            r#"(() => {{
                let els;
                try {{ els = document.querySelectorAll({sel}); }} catch (e) {{ return false; }}
                for (const el of els) {{
                    const r = el.getBoundingClientRect();
                    const st = window.getComputedStyle(el);
                    if (r.width > 0 && r.height > 0 && st.visibility !== 'hidden' && st.display !== 'none') {{
                        el.scrollIntoView({{ block: 'center' }});
                        el.click();
                        return true;
                    }}
                }}
                return false;
            }})()"#,
            sel = js_str(selector)
        );
        self.eval(js).await
    }

    async fn click_text(&self, tags: &str, needle: &str) -> Result<bool> {
        let js = format!(
            r#"(() => {{
                let els;
                try {{ els = document.querySelectorAll({tags}); }} catch (e) {{ return false; }}
                for (const el of els) {{
                    const t = (el.textContent || '').trim();
                    // Long text means a container, not the affordance itself.
                    if (!t || t.length > 40 || !t.includes({needle})) continue;
                    const r = el.getBoundingClientRect();
                    const st = window.getComputedStyle(el);
                    if (r.width > 0 && r.height > 0 && st.visibility !== 'hidden' && st.display !== 'none') {{
                        el.scrollIntoView({{ block: 'center' }});
                        el.click();
                        return true;
                    }}
                }}
                return false;
            }})()"#,
            tags = js_str(tags),
            needle = js_str(needle)
        );
        self.eval(js).await
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<bool> {
        let js = format!(
            r#"(() => {{
                let els;
                try {{ els = document.querySelectorAll({sel}); }} catch (e) {{ return false; }}
                for (const el of els) {{
                    const r = el.getBoundingClientRect();
                    if (r.width === 0 || r.height === 0) continue;
                    el.focus();
                    const tag = el.tagName.toLowerCase();
                    if (tag === 'textarea' || tag === 'input') {{
                        el.value = {text};
                    }} else {{
                        el.textContent = {text};
                    }}
                    el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                    el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                    return true;
                }}
                return false;
            }})()"#,
            sel = js_str(selector),
            text = js_str(text)
        );
        self.eval(js).await
    }

    async fn press_enter(&self, selector: &str) -> Result<bool> {
        let js = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                for (const type of ['keydown', 'keypress', 'keyup']) {{
                    el.dispatchEvent(new KeyboardEvent(type, {{
                        key: 'Enter', code: 'Enter', keyCode: 13, which: 13,
                        bubbles: true, cancelable: true
                    }}));
                }}
                return true;
            }})()"#,
            sel = js_str(selector)
        );
        self.eval(js).await
    }

    async fn collect_texts(&self, selector: &str) -> Result<Vec<String>> {
        let js = format!(
            r#"(() => {{
                let els;
                try {{ els = document.querySelectorAll({sel}); }} catch (e) {{ return []; }}
                const out = [];
                for (const el of els) {{
                    const t = (el.innerText || el.textContent || '').trim();
                    if (t) out.push(t.slice(0, 2000));
                }}
                return out.slice(-200);
            }})()"#,
            sel = js_str(selector)
        );
        self.eval(js).await
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>> {
        use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
        use chromiumoxide::page::ScreenshotParams;

        let bytes = self
            .page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .build(),
            )
            .await?;
        Ok(bytes)
    }
}
