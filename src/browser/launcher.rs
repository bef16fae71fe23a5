//! Browser discovery and lifecycle.
//!
//! One negotiation run owns one launched browser with a persistent
//! `--user-data-dir` under the data root, so the logged-in identity survives
//! restarts. The browser is visible by default — the operator performs the
//! login and may watch or take over at any point.

use crate::browser::page::{CdpPage, PageDriver};
use crate::core::config::ParleyConfig;
use anyhow::{anyhow, Context, Result};
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

const WINDOW_WIDTH: u32 = 1440;
const WINDOW_HEIGHT: u32 = 900;

/// Find a usable Chromium-family browser executable.
///
/// Resolution order:
/// 1. Config / env override (`chrome_executable`, `PARLEY_CHROME_EXECUTABLE`,
///    `CHROME_EXECUTABLE`).
/// 2. PATH lookup — finds package-manager installs on all platforms.
/// 3. OS-specific well-known install paths.
pub fn find_chrome_executable(config: &ParleyConfig) -> Option<String> {
    if let Some(p) = config.resolve_chrome_executable() {
        return Some(p);
    }

    // PATH lookup. Brave first: it presents the least automation-looking
    // fingerprint to anti-bot checks.
    let candidates = [
        "brave-browser",
        "brave",
        "google-chrome",
        "chromium",
        "chromium-browser",
        "chrome",
    ];
    for exe in candidates {
        if let Ok(full) = which::which(exe) {
            return Some(full.to_string_lossy().to_string());
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = [
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/bin/brave-browser",
            "/usr/bin/brave",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/local/bin/chromium",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        let candidates = [
            r"C:\Program Files\BraveSoftware\Brave-Browser\Application\brave.exe",
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

/// Build the launch config. Minimal flags — the window should behave like a
/// normal user browser, plus the one stealth flag that hides
/// `navigator.webdriver`.
fn build_browser_config(
    exe: &str,
    headless: bool,
    user_data_dir: &Path,
    locale: &str,
) -> Result<BrowserConfig> {
    let lang = if locale.starts_with("zh") {
        "zh-CN"
    } else {
        "en-US"
    };
    let mut builder = BrowserConfig::builder()
        .chrome_executable(exe)
        .viewport(Viewport {
            width: WINDOW_WIDTH,
            height: WINDOW_HEIGHT,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .window_size(WINDOW_WIDTH, WINDOW_HEIGHT)
        .user_data_dir(user_data_dir)
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--disable-infobars")
        .arg("--no-sandbox") // required in containers / restricted environments
        .arg("--disable-dev-shm-usage")
        .arg("--disable-blink-features=AutomationControlled")
        .arg(format!("--lang={lang}"));
    if !headless {
        builder = builder.with_head();
    }
    builder
        .build()
        .map_err(|e| anyhow!("Failed to build browser config: {}", e))
}

/// Chrome refuses to start on a profile with a leftover `SingletonLock`
/// from a crashed run. Only an aged lock is removed; a fresh one likely
/// belongs to a live browser.
fn remove_stale_singleton_lock(user_data_dir: &Path) {
    let lock_path = user_data_dir.join("SingletonLock");
    let meta = match std::fs::metadata(&lock_path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let age_ok = SystemTime::now()
        .duration_since(modified)
        .ok()
        .map(|d| d >= Duration::from_secs(120))
        .unwrap_or(false);
    if !age_ok {
        return;
    }

    match std::fs::remove_file(&lock_path) {
        Ok(_) => info!("removed stale SingletonLock at {}", lock_path.display()),
        Err(e) => warn!(
            "failed to remove stale SingletonLock at {}: {}",
            lock_path.display(),
            e
        ),
    }
}

fn spawn_handler_task(
    mut handler: chromiumoxide::Handler,
    closed: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            match event {
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("chromiumoxide handler event error: {}", e);
                }
            }
        }
        // Stream end means the browser process is gone.
        closed.store(true, Ordering::SeqCst);
    })
}

/// One launched browser plus its working tab and event-drain task.
pub struct BrowserSession {
    browser: Browser,
    page: Page,
    handler_task: tokio::task::JoinHandle<()>,
    closed: Arc<AtomicBool>,
}

impl BrowserSession {
    pub async fn launch(config: &ParleyConfig) -> Result<Self> {
        let exe = find_chrome_executable(config).ok_or_else(|| {
            anyhow!("Browser executable not found (tried Brave, Chrome, Chromium)")
        })?;

        let profile_dir = config.resolve_data_dir().join("browser");
        std::fs::create_dir_all(&profile_dir)
            .with_context(|| format!("creating browser profile dir {}", profile_dir.display()))?;
        remove_stale_singleton_lock(&profile_dir);

        let headless = config.resolve_headless();
        let browser_config =
            build_browser_config(&exe, headless, &profile_dir, &config.resolve_locale())?;

        info!(
            "launching {} ({}) with profile {}",
            exe,
            if headless { "headless" } else { "visible" },
            profile_dir.display()
        );
        let (browser, handler) = Browser::launch(browser_config)
            .await
            .with_context(|| format!("launching browser at {exe}"))?;

        let closed = Arc::new(AtomicBool::new(false));
        let handler_task = spawn_handler_task(handler, Arc::clone(&closed));

        let page = browser
            .new_page("about:blank")
            .await
            .context("opening working tab")?;

        // Suppress the automation fingerprint before the first navigation.
        page.execute(
            chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams::new(
                STEALTH_INIT.to_string(),
            ),
        )
        .await
        .map_err(|e| anyhow!("Failed to inject stealth script: {}", e))?;

        Ok(Self {
            browser,
            page,
            handler_task,
            closed,
        })
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    /// The seam handed to detectors and the state machine.
    pub fn driver(&self) -> Arc<dyn PageDriver> {
        Arc::new(CdpPage::new(self.page.clone(), Arc::clone(&self.closed)))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Graceful shutdown; safe to call when the window is already gone.
    pub async fn close(&mut self) {
        let _ = self.browser.close().await;
        let _ = self.browser.wait().await;
        self.handler_task.abort();
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        // The launched child is killed by the Browser drop; only the drain
        // task needs stopping here.
        self.handler_task.abort();
    }
}

const STEALTH_INIT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
window.chrome = window.chrome || { runtime: {} };
"#;
