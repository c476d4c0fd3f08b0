use thiserror::Error;

use super::error_handler::{ErrorCategorizer, FaultClass};

pub type BrowserResult<T> = Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("session closed: {0}")]
    SessionClosed(String),
    #[error("navigation to {url} returned status {status}")]
    Navigation { url: String, status: u16 },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl BrowserError {
    pub fn fault_class(&self) -> FaultClass {
        ErrorCategorizer::categorize(self)
    }

    pub fn is_fatal(&self) -> bool {
        self.fault_class() == FaultClass::Fatal
    }
}

impl From<tokio::task::JoinError> for BrowserError {
    fn from(err: tokio::task::JoinError) -> Self {
        BrowserError::Unexpected(err.to_string())
    }
}

impl From<serde_json::Error> for BrowserError {
    fn from(err: serde_json::Error) -> Self {
        BrowserError::Extraction(err.to_string())
    }
}
