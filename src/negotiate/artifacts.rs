//! Per-session artifact persistence.
//!
//! Every run writes into `<data_dir>/sessions/<session_id>/`:
//! `status.json` (the live snapshot, rewritten on every transition),
//! `transcript.json` (the message log), `summary.json` (the closing digest)
//! and `shot_<tag>_<timestamp>.png` checkpoint screenshots. Writes are
//! tmp-then-rename and never fatal — losing an artifact must not kill a run
//! that is mid-conversation with a real counterparty.

use crate::browser::page::PageDriver;
use crate::core::types::{
    ArtifactFile, ArtifactSummary, ChatMessage, NegotiationState, NegotiationSummary,
    SessionArtifacts, SessionSnapshot,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const STATUS_FILE: &str = "status.json";
pub const TRANSCRIPT_FILE: &str = "transcript.json";
pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("sessions"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    pub fn save_status(&self, snap: &SessionSnapshot) {
        self.write_json(&snap.session_id, STATUS_FILE, snap);
    }

    pub fn save_transcript(&self, session_id: &str, messages: &[ChatMessage]) {
        self.write_json(session_id, TRANSCRIPT_FILE, &messages);
    }

    pub fn save_summary(&self, summary: &NegotiationSummary) {
        self.write_json(&summary.session_id, SUMMARY_FILE, summary);
    }

    /// Captures a checkpoint screenshot. Returns the stored file name, or
    /// `None` when the page is already unusable — a missing picture is an
    /// acceptable loss.
    pub async fn save_screenshot(
        &self,
        session_id: &str,
        page: &dyn PageDriver,
        tag: &str,
    ) -> Option<String> {
        let bytes = match page.screenshot_png().await {
            Ok(b) => b,
            Err(e) => {
                warn!("artifacts: screenshot '{}' failed: {}", tag, e);
                return None;
            }
        };
        let dir = self.session_dir(session_id);
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!("artifacts: failed to create {}: {}", dir.display(), e);
            return None;
        }
        let name = format!("shot_{}_{}.png", tag, Utc::now().format("%Y%m%d_%H%M%S"));
        match fs::write(dir.join(&name), &bytes) {
            Ok(()) => Some(name),
            Err(e) => {
                warn!("artifacts: failed to write screenshot {}: {}", name, e);
                None
            }
        }
    }

    /// All stored sessions, newest first. A directory with a corrupt or
    /// missing `status.json` is still listed — its screenshots may be the
    /// only evidence of what happened.
    pub fn list(&self) -> Vec<ArtifactSummary> {
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };
        let mut rows: Vec<ArtifactSummary> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                if !name.starts_with("session_") || !entry.path().is_dir() {
                    return None;
                }
                Some(self.summarize(&name, &entry.path()))
            })
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows
    }

    fn summarize(&self, session_id: &str, dir: &Path) -> ArtifactSummary {
        let status: Option<SessionSnapshot> = read_json(&dir.join(STATUS_FILE));
        ArtifactSummary {
            session_id: session_id.to_string(),
            product_url: status
                .as_ref()
                .map(|s| s.product_url.clone())
                .filter(|u| !u.is_empty()),
            created_at: status.as_ref().map(|s| s.created_at),
            completed_at: status.as_ref().and_then(|s| s.finished_at),
            total_turns: status.as_ref().map(|s| s.total_turns).unwrap_or(0),
            current_state: status.as_ref().map(|s| s.current_state),
            success: status
                .as_ref()
                .map(|s| s.current_state == NegotiationState::Done)
                .unwrap_or(false),
            screenshots: png_names(dir),
            has_transcript: dir.join(TRANSCRIPT_FILE).exists(),
            has_summary: dir.join(SUMMARY_FILE).exists(),
        }
    }

    /// Everything persisted for one session. `None` when the id is unknown
    /// (or not a plain session id — path separators are not welcome here).
    pub fn load_session(&self, session_id: &str) -> Option<SessionArtifacts> {
        if !safe_id(session_id) {
            return None;
        }
        let dir = self.session_dir(session_id);
        if !dir.is_dir() {
            return None;
        }
        Some(SessionArtifacts {
            session_id: session_id.to_string(),
            status: read_json(&dir.join(STATUS_FILE)),
            messages: read_json(&dir.join(TRANSCRIPT_FILE)),
            summary: read_json(&dir.join(SUMMARY_FILE)),
            screenshots: png_files(&dir),
        })
    }

    fn write_json(&self, session_id: &str, file: &str, value: &impl Serialize) {
        let dir = self.session_dir(session_id);
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!("artifacts: failed to create {}: {}", dir.display(), e);
            return;
        }
        let bytes = match serde_json::to_vec_pretty(value) {
            Ok(b) => b,
            Err(e) => {
                warn!("artifacts: failed to serialize {}: {}", file, e);
                return;
            }
        };
        let path = dir.join(file);
        let tmp = dir.join(format!("{file}.tmp"));
        if let Err(e) = fs::write(&tmp, &bytes).and_then(|_| fs::rename(&tmp, &path)) {
            warn!("artifacts: failed to write {}: {}", path.display(), e);
        }
    }
}

/// Session ids are generated by us and never contain path syntax; anything
/// else coming in over the API is rejected before it touches the filesystem.
fn safe_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("artifacts: corrupt {}: {}", path.display(), e);
            None
        }
    }
}

fn png_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.ends_with(".png").then_some(name)
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

fn png_files(dir: &Path) -> Vec<ArtifactFile> {
    let mut files: Vec<ArtifactFile> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                if !name.ends_with(".png") {
                    return None;
                }
                let meta = e.metadata().ok();
                Some(ArtifactFile {
                    name,
                    bytes: meta.as_ref().map(|m| m.len()).unwrap_or(0),
                    modified: meta
                        .and_then(|m| m.modified().ok())
                        .map(DateTime::<Utc>::from),
                })
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    files.sort_by(|a, b| a.name.cmp(&b.name));
    files
}
