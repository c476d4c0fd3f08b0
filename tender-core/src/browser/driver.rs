use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::tenders::ListingDraft;

use super::error::BrowserResult;

/// Text and enabled state of a pagination control.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlState {
    pub text: String,
    pub disabled: bool,
}

/// Starts browser instances.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self) -> BrowserResult<Box<dyn BrowserHandle>>;
}

/// A running browser instance.
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    async fn new_page(&mut self) -> BrowserResult<Box<dyn PageDriver>>;
    async fn close(self: Box<Self>) -> BrowserResult<()>;
}

/// One tab. Selector arguments are CSS selectors.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Navigates and returns the HTTP status of the main document when the
    /// engine reports one.
    async fn goto(&self, url: &str, timeout: Duration) -> BrowserResult<Option<u16>>;
    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> BrowserResult<()>;
    async fn type_text(&self, selector: &str, text: &str) -> BrowserResult<()>;
    async fn click(&self, selector: &str) -> BrowserResult<()>;
    async fn count(&self, selector: &str) -> BrowserResult<usize>;
    async fn inner_html(&self, selector: &str) -> BrowserResult<Option<String>>;
    async fn text_content(&self, selector: &str) -> BrowserResult<Option<String>>;
    /// Reads every row matched by `row_selector`, in document order.
    async fn extract_rows(&self, row_selector: &str) -> BrowserResult<Vec<ListingDraft>>;
    async fn control_state(&self, selector: &str) -> BrowserResult<Option<ControlState>>;
    /// Rendered text of the whole document.
    async fn page_text(&self) -> BrowserResult<String>;
    async fn is_alive(&self) -> bool;
    async fn close(self: Box<Self>) -> BrowserResult<()>;
}
