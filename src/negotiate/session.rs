//! In-memory session state for one run.
//!
//! The [`Session`] is the single source of truth while a run is alive; the
//! machine mutates it through a `tokio::sync::RwLock` and the API reads it
//! for status. Snapshots of it are what the artifact store persists.

use crate::core::types::{
    ChatMessage, ChatRole, NegotiationGoals, NegotiationState, NegotiationSummary, RunKind,
    SessionSnapshot,
};
use crate::negotiate::NegotiateError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type SharedSession = Arc<RwLock<Session>>;

/// Everything one run knows about itself.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub kind: RunKind,
    pub state: NegotiationState,
    pub product_url: String,
    /// Used verbatim (after `{key}` goal substitution) as the opening
    /// message; `None` hands composition to the reply generator.
    pub opening_template: Option<String>,
    pub goals: NegotiationGoals,
    pub locale: String,
    /// Assistant-reply budget; the run completes after this many replies.
    pub max_turns: u32,
    /// Per-turn budget for a counterparty reply to appear.
    pub wait_timeout: Duration,
    pub current_turn: u32,
    pub messages: Vec<ChatMessage>,
    pub error_message: Option<String>,
    pub error_kind: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Timestamped ids sort chronologically in the artifacts directory; the
/// short random tail keeps two starts within the same second apart.
fn new_session_id() -> String {
    let tail: String = Uuid::new_v4().simple().to_string().chars().take(6).collect();
    format!("session_{}_{}", Utc::now().timestamp(), tail)
}

impl Session {
    pub fn new(
        kind: RunKind,
        product_url: impl Into<String>,
        goals: NegotiationGoals,
        locale: impl Into<String>,
        max_turns: u32,
        wait_timeout: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_session_id(),
            kind,
            state: NegotiationState::EnsureLogin,
            product_url: product_url.into(),
            opening_template: None,
            goals,
            locale: locale.into(),
            max_turns,
            wait_timeout,
            current_turn: 0,
            messages: Vec::new(),
            error_message: None,
            error_kind: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    pub fn with_opening_template(mut self, template: Option<String>) -> Self {
        self.opening_template = template.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn shared(self) -> SharedSession {
        Arc::new(RwLock::new(self))
    }

    /// The browser is up and the machine is about to drive it.
    pub fn mark_started(&mut self) {
        let now = Utc::now();
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// Transitions latch: once terminal, further state changes are ignored.
    pub fn set_state(&mut self, state: NegotiationState) {
        if self.state.is_terminal() {
            return;
        }
        let now = Utc::now();
        self.state = state;
        self.updated_at = now;
        if state.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
    }

    /// Records a fatal failure and latches the error state.
    pub fn fail(&mut self, err: &NegotiateError) {
        self.error_message = Some(err.to_string());
        self.error_kind = Some(err.kind().to_string());
        self.set_state(NegotiationState::Error);
    }

    pub fn push_message(&mut self, role: ChatRole, text: impl Into<String>) {
        let now = Utc::now();
        self.messages.push(ChatMessage {
            role,
            text: text.into(),
            timestamp: now,
        });
        self.updated_at = now;
    }

    /// Transcript length: opener + counterparty replies + our replies.
    pub fn total_turns(&self) -> usize {
        self.messages.len()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            kind: self.kind,
            current_state: self.state,
            product_url: self.product_url.clone(),
            current_turn: self.current_turn,
            max_turns: self.max_turns,
            total_turns: self.total_turns(),
            locale: self.locale.clone(),
            error_message: self.error_message.clone(),
            error_kind: self.error_kind.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            updated_at: self.updated_at,
        }
    }

    /// The closing digest persisted next to the transcript. The structured
    /// price/moq/lead-time slots stay empty until term extraction exists;
    /// consumers read the transcript for the actual figures.
    pub fn summary(&self) -> NegotiationSummary {
        let mut notes = Vec::new();
        if self.state == NegotiationState::Done {
            notes.push(format!(
                "completed {} of {} planned reply turns",
                self.current_turn, self.max_turns
            ));
        }
        if let Some(err) = &self.error_message {
            notes.push(format!("ended with error: {err}"));
        }
        if self.state == NegotiationState::Cancelled {
            notes.push("stopped by operator".to_string());
        }
        NegotiationSummary {
            product_url: self.product_url.clone(),
            session_id: self.id.clone(),
            total_turns: self.total_turns(),
            price: None,
            moq: None,
            lead_time: None,
            notes,
            success: self.state == NegotiationState::Done,
            error_message: self.error_message.clone(),
        }
    }
}
