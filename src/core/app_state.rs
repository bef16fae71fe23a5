use crate::ai::{GeminiClient, MockGenerator, ReplyGenerator};
use crate::browser::page::PageDriver;
use crate::core::config::ParleyConfig;
use crate::core::loghub::LogHub;
use crate::core::site::SiteProfile;
use crate::core::types::RunKind;
use crate::negotiate::gates::GateController;
use crate::negotiate::session::SharedSession;
use std::path::PathBuf;
use std::sync::Arc;

/// Page handle published by a driving task once its browser is up. Login-only
/// runs park here so the goto-product endpoint can steer the same page.
pub type SharedDriver = Arc<tokio::sync::Mutex<Option<Arc<dyn PageDriver>>>>;

/// A spawned driving task plus the switches the API needs to reach it.
pub struct RunHandle {
    pub session: SharedSession,
    pub kind: RunKind,
    /// Flipping this to true is the only cancellation mechanism; every poll
    /// loop observes it within one interval.
    pub abort: tokio::sync::watch::Sender<bool>,
    pub task: tokio::task::JoinHandle<()>,
    pub driver: SharedDriver,
}

/// At most one driving task exists at a time. The slot also latches the last
/// finished session so status stays queryable until the next start.
#[derive(Default)]
pub struct RunSlot {
    pub active: Option<RunHandle>,
    pub last: Option<SharedSession>,
}

#[derive(Clone)]
pub struct AppState {
    pub http_client: reqwest::Client,
    pub config: Arc<ParleyConfig>,
    pub site: Arc<SiteProfile>,
    pub log_hub: Arc<LogHub>,
    pub gates: Arc<GateController>,
    pub reply_gen: Arc<dyn ReplyGenerator>,
    pub run_slot: Arc<tokio::sync::Mutex<RunSlot>>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("site", &self.site.main_domain)
            .field("reply_gen", &self.reply_gen.name())
            .finish()
    }
}

impl AppState {
    pub fn new(http_client: reqwest::Client, config: ParleyConfig) -> Self {
        let reply_gen: Arc<dyn ReplyGenerator> = match config.resolve_ai_api_key() {
            Some(key) => Arc::new(GeminiClient::new(
                http_client.clone(),
                key,
                config.resolve_ai_model(),
                config.resolve_ai_endpoint(),
                config.resolve_locale(),
            )),
            None => Arc::new(MockGenerator::new(config.resolve_locale())),
        };
        let site = Arc::new(config.resolve_site());
        let gates = Arc::new(GateController::from_config(&config));
        Self {
            http_client,
            config: Arc::new(config),
            site,
            log_hub: Arc::new(LogHub::new()),
            gates,
            reply_gen,
            run_slot: Arc::new(tokio::sync::Mutex::new(RunSlot::default())),
        }
    }

    /// Swap the reply generator (tests use a scripted one).
    pub fn with_reply_gen(mut self, reply_gen: Arc<dyn ReplyGenerator>) -> Self {
        self.reply_gen = reply_gen;
        self
    }

    pub fn data_dir(&self) -> PathBuf {
        self.config.resolve_data_dir()
    }

    /// The session to report on: the active run if any, else the latched
    /// last one.
    pub async fn current_session(&self) -> Option<SharedSession> {
        let slot = self.run_slot.lock().await;
        slot.active
            .as_ref()
            .map(|h| h.session.clone())
            .or_else(|| slot.last.clone())
    }

    pub async fn is_run_active(&self) -> bool {
        let slot = self.run_slot.lock().await;
        slot.active
            .as_ref()
            .map(|h| !h.task.is_finished())
            .unwrap_or(false)
    }
}
