use chromiumoxide::error::CdpError;
use serde::Serialize;

use super::error::BrowserError;

/// How a browser failure should be handled by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultClass {
    /// The session is still usable; the step can be retried in place.
    Soft,
    /// The page or browser is gone and must be rebuilt.
    Fatal,
}

/// Substrings that mark a message as session-fatal. Matched lowercase.
const FATAL_MARKERS: &[&str] = &[
    "target closed",
    "targetcloseerror",
    "session closed",
    "protocol error",
    "main frame too early",
    "detached",
    "frame not found",
    "websocket",
    "connection closed",
    "channel closed",
    "browser closed",
    "not attached",
    "no target with given id",
    "session with given id not found",
];

pub struct ErrorCategorizer;

impl ErrorCategorizer {
    pub fn categorize(error: &BrowserError) -> FaultClass {
        match error {
            BrowserError::Launch(_) | BrowserError::SessionClosed(_) => FaultClass::Fatal,
            BrowserError::Timeout(_) | BrowserError::Navigation { .. } => FaultClass::Soft,
            BrowserError::Configuration(_) => FaultClass::Soft,
            BrowserError::Cdp(err) => Self::categorize_cdp(err),
            BrowserError::Extraction(message) | BrowserError::Unexpected(message) => {
                Self::categorize_message(message)
            }
        }
    }

    fn categorize_cdp(error: &CdpError) -> FaultClass {
        match error {
            CdpError::Timeout => FaultClass::Soft,
            CdpError::Ws(_)
            | CdpError::NoResponse
            | CdpError::ChannelSendError(_)
            | CdpError::FrameNotFound(_) => FaultClass::Fatal,
            other => Self::categorize_message(&other.to_string()),
        }
    }

    pub fn categorize_message(message: &str) -> FaultClass {
        let text = message.to_lowercase();
        if FATAL_MARKERS.iter().any(|marker| text.contains(marker)) {
            FaultClass::Fatal
        } else {
            FaultClass::Soft
        }
    }
}
