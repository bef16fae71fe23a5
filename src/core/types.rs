use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form key/value hints handed to the reply generator. Well-known keys
/// (`target_price`, `moq`, `lead_time`, `quality_requirements`, `samples`,
/// `shipping_terms`, `payment_terms`, `style`) get labeled treatment;
/// everything else is passed through as context lines.
pub type NegotiationGoals = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Deserialize)]
pub struct StartRequest {
    pub product_url: String,
    /// Used verbatim as the opening message (after `{key}` substitution from
    /// goals); absent → the reply generator composes an opener.
    #[serde(default)]
    pub opening_template: Option<String>,
    #[serde(default)]
    pub goals: NegotiationGoals,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub wait_timeout_s: Option<u64>,
    #[serde(default)]
    pub locale: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GotoProductRequest {
    pub product_url: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GenerateOpenerRequest {
    pub product_url: Option<String>,
    pub goals: NegotiationGoals,
    pub locale: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationState {
    #[serde(rename = "S0_ENSURE_LOGIN")]
    EnsureLogin,
    #[serde(rename = "S1_OPEN_PRODUCT_AND_CHAT")]
    OpenProductAndChat,
    #[serde(rename = "S2_SEND_OPENING_MESSAGE")]
    SendMessage,
    #[serde(rename = "S3_WAIT_FOR_REPLY")]
    WaitForReply,
    #[serde(rename = "S4_GENERATE_AND_REPLY")]
    GenerateAndReply,
    /// Login-only run holding the browser, waiting for a product request.
    #[serde(rename = "READY_FOR_PRODUCT")]
    ReadyForProduct,
    /// Login-only run parked on a product page for manual inspection.
    #[serde(rename = "AT_PRODUCT")]
    AtProduct,
    #[serde(rename = "S_DONE")]
    Done,
    #[serde(rename = "S_ERROR")]
    Error,
    /// Operator stopped the run. Terminal, but not an error.
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl NegotiationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::EnsureLogin => "S0_ENSURE_LOGIN",
            NegotiationState::OpenProductAndChat => "S1_OPEN_PRODUCT_AND_CHAT",
            NegotiationState::SendMessage => "S2_SEND_OPENING_MESSAGE",
            NegotiationState::WaitForReply => "S3_WAIT_FOR_REPLY",
            NegotiationState::GenerateAndReply => "S4_GENERATE_AND_REPLY",
            NegotiationState::ReadyForProduct => "READY_FOR_PRODUCT",
            NegotiationState::AtProduct => "AT_PRODUCT",
            NegotiationState::Done => "S_DONE",
            NegotiationState::Error => "S_ERROR",
            NegotiationState::Cancelled => "CANCELLED",
        }
    }

    /// Terminal states latch; the machine issues no browser action past them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NegotiationState::Done | NegotiationState::Error | NegotiationState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Negotiation,
    LoginOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// The operator side: the opening message.
    User,
    /// The counterparty across the chat widget.
    Supplier,
    /// Replies the generator composed and the machine sent.
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Supplier => "supplier",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Full session snapshot, persisted as `status.json` after every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub kind: RunKind,
    pub current_state: NegotiationState,
    pub product_url: String,
    pub current_turn: u32,
    pub max_turns: u32,
    /// Every transcript entry counts: opener, supplier replies, our replies.
    pub total_turns: usize,
    pub locale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Dashboard-facing status shape.
#[derive(Debug, Clone, Serialize, Default)]
pub struct NegotiationStatus {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_state: Option<NegotiationState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_turn: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_turns: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl NegotiationStatus {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn from_snapshot(active: bool, snap: &SessionSnapshot) -> Self {
        Self {
            active,
            session_id: Some(snap.session_id.clone()),
            current_state: Some(snap.current_state),
            current_turn: Some(snap.current_turn),
            max_turns: Some(snap.max_turns),
            product_url: Some(snap.product_url.clone()),
            total_turns: Some(snap.total_turns),
            created_at: Some(snap.created_at),
            started_at: snap.started_at,
            error_message: snap.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GateStatus {
    pub name: String,
    pub open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    pub auto_open_after_s: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AiStatus {
    pub available: bool,
    pub model: String,
    /// True when running on the deterministic fallback generator.
    pub mock: bool,
}

/// One row of the artifacts listing, built from a persisted `status.json`.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactSummary {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub total_turns: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_state: Option<NegotiationState>,
    pub success: bool,
    pub screenshots: Vec<String>,
    pub has_transcript: bool,
    pub has_summary: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactFile {
    pub name: String,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

/// Everything persisted for one session, for the detail endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionArtifacts {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ChatMessage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<NegotiationSummary>,
    pub screenshots: Vec<ArtifactFile>,
}

/// Closing digest written next to the transcript when a run ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationSummary {
    pub product_url: String,
    pub session_id: String,
    pub total_turns: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moq: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_time: Option<String>,
    #[serde(default)]
    pub notes: Vec<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub status: String,
    pub server: String,
    pub version: String,
    pub has_ai_api: bool,
    pub ai_model: String,
    pub active_sessions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_state: Option<NegotiationState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}
