//! The negotiation engine: sessions, pause gates, the state machine that
//! drives the browser, and the artifact store every run writes into.
//!
//! One run owns one browser. The machine advances through the login,
//! product-chat and reply-loop phases, pausing at operator gates between
//! them; every transition is persisted so a crash leaves an inspectable
//! trail rather than a mystery.

pub mod artifacts;
pub mod gates;
pub mod machine;
pub mod session;

pub use artifacts::ArtifactStore;
pub use gates::{GateController, GateName, GateWait};
pub use session::{Session, SharedSession};

use std::time::Duration;
use thiserror::Error;

/// Run-fatal failures. Each carries a stable machine-readable kind that ends
/// up in the persisted snapshot and the status API.
#[derive(Debug, Error)]
pub enum NegotiateError {
    #[error("browser page closed")]
    PageClosed,

    #[error("blocked by a verification challenge: {0}")]
    BlockedByCaptcha(String),

    #[error("chat entry not found: {0}")]
    ChatNotFound(String),

    #[error("no counterparty reply within {0:?}")]
    ReplyTimeout(Duration),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("message send failed: {0}")]
    SendFailed(String),

    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("stopped by operator")]
    Cancelled,
}

impl NegotiateError {
    pub fn kind(&self) -> &'static str {
        match self {
            NegotiateError::PageClosed => "page_closed",
            NegotiateError::BlockedByCaptcha(_) => "blocked_by_captcha",
            NegotiateError::ChatNotFound(_) => "chat_not_found",
            NegotiateError::ReplyTimeout(_) => "reply_timeout",
            NegotiateError::Navigation(_) => "navigation_error",
            NegotiateError::SendFailed(_) => "send_failed",
            NegotiateError::Launch(_) => "launch_error",
            NegotiateError::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_are_stable_wire_codes() {
        assert_eq!(NegotiateError::PageClosed.kind(), "page_closed");
        assert_eq!(
            NegotiateError::BlockedByCaptcha("slider".into()).kind(),
            "blocked_by_captcha"
        );
        assert_eq!(
            NegotiateError::ReplyTimeout(Duration::from_secs(300)).kind(),
            "reply_timeout"
        );
        assert_eq!(NegotiateError::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn messages_carry_the_detail() {
        let e = NegotiateError::ChatNotFound("no visible entry".into());
        assert!(e.to_string().contains("no visible entry"));
    }
}
