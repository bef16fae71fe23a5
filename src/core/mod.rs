pub mod app_state;
pub mod config;
pub mod loghub;
pub mod site;
pub mod types;

pub use app_state::AppState;
