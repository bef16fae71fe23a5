pub mod identity;
pub mod launcher;
pub mod page;

pub use launcher::{find_chrome_executable, BrowserSession};
pub use page::{CdpPage, PageDriver, SelectorProbe};
