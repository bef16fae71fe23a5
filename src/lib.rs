pub mod ai;
pub mod api;
pub mod browser;
pub mod core;
pub mod detect;
pub mod negotiate;

// --- Primary core exports ---
pub use core::config;
pub use core::site;
pub use core::types;
pub use core::types::*;
pub use core::AppState;

// --- Convenience module paths ---
pub use ai::{GeminiClient, MockGenerator, ReplyGenerator};
pub use browser::{identity, launcher, page};
pub use detect::{captcha, chat, login};
pub use negotiate::{artifacts, gates, machine, session};
