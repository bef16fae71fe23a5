use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Bounded ring: once full, the oldest record is dropped. Consumers that
/// poll slower than the engine logs will observe a gap, never a block.
pub const LOG_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Info,
    Warn,
    Error,
}

/// One entry of the in-process log stream backing `/api/logs`.
///
/// `seq` is the delivery contract: strictly increasing, never reused.
/// Consumers poll with `after=<last seen seq>` and tolerate duplicates.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub severity: LogSeverity,
    pub phase: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug)]
struct LogBuf {
    next_seq: u64,
    capacity: usize,
    records: VecDeque<LogRecord>,
}

#[derive(Debug)]
pub struct LogHub {
    inner: Mutex<LogBuf>,
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LogHub {
    pub fn new() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LogBuf {
                next_seq: 1,
                capacity: capacity.max(1),
                records: VecDeque::new(),
            }),
        }
    }

    /// Appends a record and mirrors it as a `tracing` event at the matching
    /// level. Returns the assigned sequence number.
    pub fn push(
        &self,
        severity: LogSeverity,
        phase: &str,
        message: impl Into<String>,
        session_id: Option<&str>,
    ) -> u64 {
        let message = message.into();
        let seq = {
            let mut buf = self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let seq = buf.next_seq;
            buf.next_seq += 1;
            if buf.records.len() >= buf.capacity {
                buf.records.pop_front();
            }
            buf.records.push_back(LogRecord {
                seq,
                timestamp: Utc::now(),
                severity,
                phase: phase.to_string(),
                message: message.clone(),
                session_id: session_id.map(|s| s.to_string()),
            });
            seq
        };
        match severity {
            LogSeverity::Info => tracing::info!(phase = phase, "{}", message),
            LogSeverity::Warn => tracing::warn!(phase = phase, "{}", message),
            LogSeverity::Error => tracing::error!(phase = phase, "{}", message),
        }
        seq
    }

    pub fn info(&self, phase: &str, message: impl Into<String>) -> u64 {
        self.push(LogSeverity::Info, phase, message, None)
    }

    pub fn warn(&self, phase: &str, message: impl Into<String>) -> u64 {
        self.push(LogSeverity::Warn, phase, message, None)
    }

    pub fn error(&self, phase: &str, message: impl Into<String>) -> u64 {
        self.push(LogSeverity::Error, phase, message, None)
    }

    /// Records with `seq > after`, oldest first, capped at `limit`.
    pub fn since(&self, after: u64, limit: usize) -> Vec<LogRecord> {
        let buf = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        buf.records
            .iter()
            .filter(|r| r.seq > after)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn last_seq(&self) -> u64 {
        let buf = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        buf.next_seq.saturating_sub(1)
    }
}

/// Hub handle bound to one session id; what the engine components carry.
#[derive(Debug, Clone)]
pub struct SessionLog {
    hub: Arc<LogHub>,
    session_id: String,
}

impl SessionLog {
    pub fn new(hub: Arc<LogHub>, session_id: impl Into<String>) -> Self {
        Self {
            hub,
            session_id: session_id.into(),
        }
    }

    pub fn info(&self, phase: &str, message: impl Into<String>) {
        self.hub
            .push(LogSeverity::Info, phase, message, Some(&self.session_id));
    }

    pub fn warn(&self, phase: &str, message: impl Into<String>) {
        self.hub
            .push(LogSeverity::Warn, phase, message, Some(&self.session_id));
    }

    pub fn error(&self, phase: &str, message: impl Into<String>) {
        self.hub
            .push(LogSeverity::Error, phase, message, Some(&self.session_id));
    }

    pub fn hub(&self) -> &Arc<LogHub> {
        &self.hub
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}
