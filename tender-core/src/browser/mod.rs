mod automation;
mod driver;
mod error;
mod error_handler;
mod session;

pub use automation::{ChromiumBrowser, ChromiumDriver, ChromiumPage};
pub use driver::{BrowserDriver, BrowserHandle, ControlState, PageDriver};
pub use error::{BrowserError, BrowserResult};
pub use error_handler::{ErrorCategorizer, FaultClass};
pub use session::{Session, SessionManager};
