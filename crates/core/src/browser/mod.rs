//! Browser automation.
//!
//! The ingestion and realtime flows talk to a `BrowserSession` obtained from a
//! `BrowserLauncher`. The production launcher speaks W3C WebDriver over HTTP,
//! normally to a driver process it starts for each session.

mod driver;
mod profile;
mod types;
mod webdriver;

pub use profile::{copy_profile, prepare_profile, CERT_NICKNAME};
pub use types::*;
pub use webdriver::{WebDriverLauncher, WebDriverSession};
