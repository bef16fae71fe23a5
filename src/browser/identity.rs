//! Persisted browser identity — cookie snapshot load/save/inject.
//!
//! The Chrome profile under `<data_dir>/browser/` is the primary identity
//! store. On top of that, `<data_dir>/cookies.json` keeps an exported cookie
//! snapshot captured after a successful login and after terminal states, and
//! injected at session start. It covers profile loss (fresh machine, wiped
//! profile dir) without forcing the operator through another manual login.

use chromiumoxide::Page;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub fn cookie_store_path(data_dir: &Path) -> PathBuf {
    data_dir.join("cookies.json")
}

// ─────────────────────────────────────────────────────────────────────────────
// Load / save
// ─────────────────────────────────────────────────────────────────────────────

/// Load the stored snapshot as raw JSON values.
///
/// Returns `None` when the file is missing, unreadable or empty. A corrupt
/// file is logged and treated as missing — identity loss degrades to a manual
/// login, never to a failed start.
pub fn load_raw(data_dir: &Path) -> Option<Vec<serde_json::Value>> {
    let path = cookie_store_path(data_dir);
    if !path.exists() {
        return None;
    }
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => {
            warn!("identity: failed to read {}: {}", path.display(), e);
            return None;
        }
    };
    let cookies: Vec<serde_json::Value> = match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            warn!(
                "identity: corrupt cookie snapshot at {}: {} — ignoring",
                path.display(),
                e
            );
            return None;
        }
    };
    if cookies.is_empty() {
        return None;
    }
    info!(
        "identity: 🍪 loaded {} cookies from {}",
        cookies.len(),
        path.display()
    );
    Some(cookies)
}

/// Persist a snapshot atomically (`.tmp` + rename) so readers never observe
/// a partial file. All failures are logged and swallowed.
pub fn save_raw(data_dir: &Path, cookies: &[serde_json::Value]) {
    let path = cookie_store_path(data_dir);
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("identity: failed to create {}: {}", parent.display(), e);
            return;
        }
    }
    let json = match serde_json::to_string_pretty(cookies) {
        Ok(s) => s,
        Err(e) => {
            warn!("identity: serialization failed: {}", e);
            return;
        }
    };
    let tmp = path.with_extension("tmp");
    if let Err(e) = std::fs::write(&tmp, &json) {
        warn!("identity: failed to write temp file {}: {}", tmp.display(), e);
        return;
    }
    if let Err(e) = std::fs::rename(&tmp, &path) {
        warn!(
            "identity: failed to rename {} → {}: {}",
            tmp.display(),
            path.display(),
            e
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inject / capture
// ─────────────────────────────────────────────────────────────────────────────

/// Inject stored cookies into a live CDP page **before** the first
/// navigation, so they ride along on the initial request.
///
/// Each entry deserializes into a chromiumoxide `CookieParam`; malformed
/// entries are skipped individually so a partially-stale snapshot never
/// blocks a run.
pub async fn inject_into_page(page: &Page, raw_cookies: &[serde_json::Value]) {
    use chromiumoxide::cdp::browser_protocol::network::{CookieParam, SetCookiesParams};

    let cookie_params: Vec<CookieParam> = raw_cookies
        .iter()
        .filter_map(|v| serde_json::from_value::<CookieParam>(v.clone()).ok())
        .collect();

    if cookie_params.is_empty() {
        warn!("identity: snapshot contained no valid cookies — skipping injection");
        return;
    }

    let count = cookie_params.len();
    match page.execute(SetCookiesParams::new(cookie_params)).await {
        Ok(_) => info!("identity: 💉 injected {} cookies", count),
        Err(e) => warn!("identity: cookie injection failed: {}", e),
    }
}

/// Load-and-inject in one call. Returns `true` when a snapshot was found.
pub async fn auto_inject(page: &Page, data_dir: &Path) -> bool {
    if let Some(raw) = load_raw(data_dir) {
        inject_into_page(page, &raw).await;
        true
    } else {
        false
    }
}

/// Export the page's current cookie jar to the snapshot file. Returns the
/// number of cookies captured; failures are logged and return 0.
pub async fn capture_from_page(page: &Page, data_dir: &Path) -> usize {
    let cookies = match page.get_cookies().await {
        Ok(c) => c,
        Err(e) => {
            warn!("identity: cookie export failed: {}", e);
            return 0;
        }
    };
    if cookies.is_empty() {
        return 0;
    }
    let raw: Vec<serde_json::Value> = cookies
        .iter()
        .filter_map(|c| serde_json::to_value(c).ok())
        .collect();
    let count = raw.len();
    save_raw(data_dir, &raw);
    info!("identity: captured {} cookies", count);
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cookies = vec![
            json!({"name": "cookie2", "value": "abc", "domain": ".1688.com", "path": "/", "expires": 1_900_000_000.0}),
            json!({"name": "cna", "value": "xyz", "domain": ".1688.com", "path": "/", "expires": -1.0}),
        ];
        save_raw(dir.path(), &cookies);
        let loaded = load_raw(dir.path()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0]["name"], "cookie2");
    }

    #[test]
    fn missing_and_corrupt_files_yield_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_raw(dir.path()).is_none());
        std::fs::write(cookie_store_path(dir.path()), "not json{{").unwrap();
        assert!(load_raw(dir.path()).is_none());
    }

    #[test]
    fn empty_snapshot_is_treated_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        save_raw(dir.path(), &[]);
        assert!(load_raw(dir.path()).is_none());
    }
}
