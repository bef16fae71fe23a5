use crate::core::site::SiteProfile;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// ParleyConfig — file-based config loader (parley_config.json) with env-var
// fallback per field
// ---------------------------------------------------------------------------

pub const ENV_CONFIG_PATH: &str = "PARLEY_CONFIG";
pub const ENV_PORT: &str = "PARLEY_PORT";
pub const ENV_DATA_DIR: &str = "PARLEY_DATA_DIR";
pub const ENV_HEADLESS: &str = "PARLEY_HEADLESS";
pub const ENV_CHROME_EXECUTABLE: &str = "PARLEY_CHROME_EXECUTABLE";
pub const ENV_CHROME_EXECUTABLE_FALLBACK: &str = "CHROME_EXECUTABLE";
pub const ENV_MAX_TURNS: &str = "PARLEY_MAX_TURNS";
pub const ENV_WAIT_TIMEOUT_S: &str = "PARLEY_WAIT_TIMEOUT_S";
pub const ENV_LOCALE: &str = "PARLEY_LOCALE";
pub const ENV_AI_API_KEY: &str = "PARLEY_AI_API_KEY";
pub const ENV_AI_API_KEY_FALLBACK: &str = "GOOGLE_API_KEY";
pub const ENV_AI_MODEL: &str = "PARLEY_AI_MODEL";
pub const ENV_AI_ENDPOINT: &str = "PARLEY_AI_ENDPOINT";

pub const DEFAULT_PORT: u16 = 8700;
pub const DEFAULT_AI_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_AI_ENDPOINT: &str = "https://generativelanguage.googleapis.com";

/// Top-level config loaded from `parley_config.json`.
///
/// Every field is optional; resolution per field is JSON → env var → default,
/// so a missing or partial file still yields a fully working setup.
#[derive(serde::Serialize, serde::Deserialize, Default, Clone, Debug)]
#[serde(default)]
pub struct ParleyConfig {
    /// HTTP port for the control API. Default: 8700.
    pub port: Option<u16>,
    /// Data root for browser profile, cookie snapshot and session artifacts.
    /// Default: `~/.cortex-parley`.
    pub data_dir: Option<String>,
    /// The product needs a visible window for manual login, so this defaults
    /// to `false`. Headless is only useful on a farm with a baked identity.
    pub headless: Option<bool>,
    /// Explicit browser binary. Default: auto-discovery.
    pub chrome_executable: Option<String>,
    /// Negotiation turn budget when the start request does not set one.
    pub default_max_turns: Option<u32>,
    /// Reply wait budget in seconds when the start request does not set one.
    pub default_wait_timeout_s: Option<u64>,
    /// `zh` or `en`. Drives prompt language and the mock generator.
    pub default_locale: Option<String>,
    /// API key for the reply generator. Never logged. Absent key = mock mode.
    pub ai_api_key: Option<String>,
    pub ai_model: Option<String>,
    /// REST base for the `generateContent` endpoint.
    pub ai_endpoint: Option<String>,
    /// Per-gate auto-open timeouts in seconds, keyed by gate name.
    pub gate_auto_open_s: Option<HashMap<String, u64>>,
    /// Target marketplace profile; defaults to the production site.
    pub site: Option<SiteProfile>,
}

/// Load `parley_config.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `PARLEY_CONFIG` env var path
/// 2. `./parley_config.json` (process cwd)
/// 3. `~/.cortex-parley/config.json`
///
/// Missing file → `ParleyConfig::default()` (silent, env fallbacks apply).
/// Parse error → log a warning, return defaults.
pub fn load_parley_config() -> ParleyConfig {
    let candidates: Vec<PathBuf> = {
        let mut v = vec![PathBuf::from("parley_config.json")];
        if let Some(home) = dirs::home_dir() {
            v.push(home.join(".cortex-parley").join("config.json"));
        }
        if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
            v.insert(0, PathBuf::from(env_path));
        }
        v
    };

    for path in &candidates {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<ParleyConfig>(&contents) {
                Ok(cfg) => {
                    tracing::info!("parley_config.json loaded from {}", path.display());
                    return cfg;
                }
                Err(e) => {
                    tracing::warn!(
                        "parley_config.json parse error at {}: {} — using defaults",
                        path.display(),
                        e
                    );
                    return ParleyConfig::default();
                }
            },
            Err(_) => continue, // not at this path — try next
        }
    }

    ParleyConfig::default()
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_truthy(key: &str) -> Option<bool> {
    let v = std::env::var(key).ok()?;
    let v = v.trim().to_ascii_lowercase();
    if v.is_empty() {
        return None;
    }
    Some(matches!(v.as_str(), "1" | "true" | "yes" | "on"))
}

impl ParleyConfig {
    /// Port: JSON field → `PARLEY_PORT` env → 8700.
    pub fn resolve_port(&self) -> u16 {
        if let Some(p) = self.port {
            return p;
        }
        env_string(ENV_PORT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }

    /// Data root: JSON field → `PARLEY_DATA_DIR` env → `~/.cortex-parley`.
    pub fn resolve_data_dir(&self) -> PathBuf {
        if let Some(d) = &self.data_dir {
            if !d.trim().is_empty() {
                return PathBuf::from(d.trim());
            }
        }
        if let Some(d) = env_string(ENV_DATA_DIR) {
            return PathBuf::from(d);
        }
        dirs::home_dir()
            .map(|h| h.join(".cortex-parley"))
            .unwrap_or_else(|| PathBuf::from(".cortex-parley"))
    }

    /// Headless: JSON field → `PARLEY_HEADLESS` env → `false`.
    pub fn resolve_headless(&self) -> bool {
        if let Some(b) = self.headless {
            return b;
        }
        env_truthy(ENV_HEADLESS).unwrap_or(false)
    }

    /// Browser binary override: JSON field → `PARLEY_CHROME_EXECUTABLE` →
    /// `CHROME_EXECUTABLE` → `None` (auto-discovery).
    ///
    /// Only returns a value that points at an existing path.
    pub fn resolve_chrome_executable(&self) -> Option<String> {
        let candidate = self
            .chrome_executable
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| env_string(ENV_CHROME_EXECUTABLE))
            .or_else(|| env_string(ENV_CHROME_EXECUTABLE_FALLBACK))?;
        if Path::new(&candidate).exists() {
            Some(candidate)
        } else {
            None
        }
    }

    /// Turn budget: JSON field → `PARLEY_MAX_TURNS` env → 6.
    pub fn resolve_max_turns(&self) -> u32 {
        if let Some(n) = self.default_max_turns {
            return n;
        }
        env_string(ENV_MAX_TURNS)
            .and_then(|v| v.parse().ok())
            .unwrap_or(6)
    }

    /// Reply wait budget in seconds: JSON field → `PARLEY_WAIT_TIMEOUT_S` → 300.
    pub fn resolve_wait_timeout_s(&self) -> u64 {
        if let Some(n) = self.default_wait_timeout_s {
            return n;
        }
        env_string(ENV_WAIT_TIMEOUT_S)
            .and_then(|v| v.parse().ok())
            .unwrap_or(300)
    }

    /// Locale: JSON field → `PARLEY_LOCALE` env → `zh`.
    pub fn resolve_locale(&self) -> String {
        if let Some(l) = &self.default_locale {
            if !l.trim().is_empty() {
                return l.trim().to_string();
            }
        }
        env_string(ENV_LOCALE).unwrap_or_else(|| "zh".to_string())
    }

    /// AI key: JSON field → `PARLEY_AI_API_KEY` → `GOOGLE_API_KEY` → `None`.
    ///
    /// `None` means the deterministic mock generator runs instead.
    pub fn resolve_ai_api_key(&self) -> Option<String> {
        if let Some(k) = &self.ai_api_key {
            let k = k.trim();
            if !k.is_empty() {
                return Some(k.to_string());
            }
        }
        env_string(ENV_AI_API_KEY).or_else(|| env_string(ENV_AI_API_KEY_FALLBACK))
    }

    /// Model: JSON field → `PARLEY_AI_MODEL` env → `gemini-2.5-flash`.
    pub fn resolve_ai_model(&self) -> String {
        if let Some(m) = &self.ai_model {
            if !m.trim().is_empty() {
                return m.trim().to_string();
            }
        }
        env_string(ENV_AI_MODEL).unwrap_or_else(|| DEFAULT_AI_MODEL.to_string())
    }

    /// Endpoint base: JSON field → `PARLEY_AI_ENDPOINT` env → Google's.
    pub fn resolve_ai_endpoint(&self) -> String {
        if let Some(e) = &self.ai_endpoint {
            let e = e.trim().trim_end_matches('/');
            if !e.is_empty() {
                return e.to_string();
            }
        }
        env_string(ENV_AI_ENDPOINT)
            .map(|e| e.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_AI_ENDPOINT.to_string())
    }

    /// Auto-open timeout in seconds for a named gate: JSON map entry →
    /// built-in default for that gate.
    pub fn resolve_gate_auto_open_s(&self, gate: &str) -> u64 {
        if let Some(map) = &self.gate_auto_open_s {
            if let Some(s) = map.get(gate) {
                return *s;
            }
        }
        default_gate_auto_open_s(gate)
    }

    pub fn resolve_site(&self) -> SiteProfile {
        self.site.clone().unwrap_or_default()
    }
}

fn default_gate_auto_open_s(gate: &str) -> u64 {
    match gate {
        "after_login" => 120,
        "product_and_chat" => 90,
        "after_send" => 30,
        _ => 60,
    }
}
