//! Operator pause gates.
//!
//! The machine stops at three checkpoints so a human can eyeball the browser
//! before it proceeds: after login, after the product chat is open, and after
//! each sent message. Arriving at a gate always resets it first — a
//! confirmation given for a previous pass never carries over — then the
//! machine waits for the gate to open or for its auto-open timeout, whichever
//! comes first. A run left unattended therefore keeps moving.

use crate::core::config::ParleyConfig;
use crate::core::types::GateStatus;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateName {
    AfterLogin,
    ProductAndChat,
    AfterSend,
}

impl GateName {
    pub const ALL: [GateName; 3] = [
        GateName::AfterLogin,
        GateName::ProductAndChat,
        GateName::AfterSend,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GateName::AfterLogin => "after_login",
            GateName::ProductAndChat => "product_and_chat",
            GateName::AfterSend => "after_send",
        }
    }

    pub fn parse(name: &str) -> Option<GateName> {
        match name {
            "after_login" => Some(GateName::AfterLogin),
            "product_and_chat" => Some(GateName::ProductAndChat),
            "after_send" => Some(GateName::AfterSend),
            _ => None,
        }
    }
}

impl std::fmt::Display for GateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one pause at a gate ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateWait {
    /// Operator opened the gate.
    Opened,
    /// Auto-open timeout elapsed with no operator action.
    AutoAdvanced,
    /// The run was stopped while paused here.
    Cancelled,
}

struct GateSlot {
    open_tx: watch::Sender<bool>,
    auto_open: Duration,
    opened_at: Mutex<Option<DateTime<Utc>>>,
}

impl GateSlot {
    fn new(auto_open: Duration) -> Self {
        let (open_tx, _) = watch::channel(false);
        Self {
            open_tx,
            auto_open,
            opened_at: Mutex::new(None),
        }
    }
}

/// All three gates; shared between the API handlers (open/reset) and the
/// machine (await).
pub struct GateController {
    slots: [GateSlot; 3],
}

impl GateController {
    pub fn from_config(config: &ParleyConfig) -> Self {
        let slot = |name: GateName| {
            GateSlot::new(Duration::from_secs(
                config.resolve_gate_auto_open_s(name.as_str()),
            ))
        };
        Self {
            slots: [
                slot(GateName::AfterLogin),
                slot(GateName::ProductAndChat),
                slot(GateName::AfterSend),
            ],
        }
    }

    fn slot(&self, name: GateName) -> &GateSlot {
        &self.slots[name as usize]
    }

    /// Opens a gate. Idempotent; the first open stamps `opened_at`.
    pub fn open(&self, name: GateName) {
        let slot = self.slot(name);
        let was_open = slot.open_tx.send_replace(true);
        if !was_open {
            let mut at = slot
                .opened_at
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *at = Some(Utc::now());
        }
    }

    pub fn reset(&self, name: GateName) {
        let slot = self.slot(name);
        slot.open_tx.send_replace(false);
        let mut at = slot
            .opened_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *at = None;
    }

    /// A new run starts with every gate closed.
    pub fn reset_all(&self) {
        for name in GateName::ALL {
            self.reset(name);
        }
    }

    pub fn is_open(&self, name: GateName) -> bool {
        *self.slot(name).open_tx.borrow()
    }

    pub fn auto_open(&self, name: GateName) -> Duration {
        self.slot(name).auto_open
    }

    pub fn snapshot(&self) -> Vec<GateStatus> {
        GateName::ALL
            .iter()
            .map(|&name| {
                let slot = self.slot(name);
                let opened_at = *slot
                    .opened_at
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                GateStatus {
                    name: name.as_str().to_string(),
                    open: *slot.open_tx.borrow(),
                    opened_at,
                    auto_open_after_s: slot.auto_open.as_secs(),
                }
            })
            .collect()
    }

    /// Pauses at a gate: resets it, then waits for an operator open or the
    /// auto-open timeout. Returns immediately with `Cancelled` when the run's
    /// abort flag flips.
    pub async fn await_open(
        &self,
        name: GateName,
        abort: &mut watch::Receiver<bool>,
    ) -> GateWait {
        self.reset(name);
        let slot = self.slot(name);
        let mut rx = slot.open_tx.subscribe();
        tokio::select! {
            // Either a true value or a closed channel stops the run.
            _ = abort.wait_for(|stop| *stop) => GateWait::Cancelled,
            opened = tokio::time::timeout(slot.auto_open, rx.wait_for(|open| *open)) => {
                match opened {
                    Ok(_) => GateWait::Opened,
                    Err(_) => GateWait::AutoAdvanced,
                }
            }
        }
    }
}
