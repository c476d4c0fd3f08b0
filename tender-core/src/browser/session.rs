use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::driver::{BrowserDriver, BrowserHandle, PageDriver};
use super::error::BrowserResult;

/// One browser plus its working page. Not `Clone`; handed back to
/// [`SessionManager::close`] when done.
pub struct Session {
    id: Uuid,
    opened_at: DateTime<Utc>,
    browser: Box<dyn BrowserHandle>,
    page: Box<dyn PageDriver>,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn page(&self) -> &dyn PageDriver {
        self.page.as_ref()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("opened_at", &self.opened_at)
            .finish()
    }
}

#[derive(Clone)]
pub struct SessionManager {
    driver: Arc<dyn BrowserDriver>,
}

impl SessionManager {
    pub fn new(driver: Arc<dyn BrowserDriver>) -> Self {
        Self { driver }
    }

    pub async fn open(&self) -> BrowserResult<Session> {
        let mut browser = self.driver.launch().await?;
        let page = match browser.new_page().await {
            Ok(page) => page,
            Err(err) => {
                if let Err(close_err) = browser.close().await {
                    warn!(error = %close_err, "failed to close browser after page error");
                }
                return Err(err);
            }
        };
        let session = Session {
            id: Uuid::new_v4(),
            opened_at: Utc::now(),
            browser,
            page,
        };
        info!(session = %session.id, "browser session opened");
        Ok(session)
    }

    /// Swaps in a fresh page on the session's existing browser. The old page
    /// is closed best-effort.
    pub async fn new_page(&self, session: &mut Session) -> BrowserResult<()> {
        let page = session.browser.new_page().await?;
        let old = std::mem::replace(&mut session.page, page);
        if let Err(err) = old.close().await {
            debug!(session = %session.id, error = %err, "old page close failed");
        }
        info!(session = %session.id, "page rebuilt on existing browser");
        Ok(())
    }

    /// Closes page then browser. Errors are logged, never returned, so a
    /// teardown cannot hide the failure that caused it.
    pub async fn close(&self, session: Session) {
        let Session {
            id,
            opened_at,
            browser,
            page,
        } = session;
        if let Err(err) = page.close().await {
            debug!(session = %id, error = %err, "page close failed");
        }
        if let Err(err) = browser.close().await {
            warn!(session = %id, error = %err, "browser close failed");
        }
        let age_s = (Utc::now() - opened_at).num_seconds();
        debug!(session = %id, age_s, "browser session closed");
    }
}
