use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::browser::{BrowserError, BrowserResult, Session};
use crate::config::{CrawlerConfig, SelectorSection, TimeoutSection};
use crate::tenders::ListingDraft;

/// What the pagination control currently says.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NextPageState {
    pub exists: bool,
    pub disabled: bool,
    pub current_page_has_rows: bool,
}

impl NextPageState {
    pub fn can_advance(&self) -> bool {
        self.exists && !self.disabled
    }
}

/// Search, scan and pagination over the portal's result table. Holds no
/// crawl position; callers pass the session and track the page index.
#[derive(Debug, Clone)]
pub struct ListingCrawler {
    base_url: String,
    selectors: SelectorSection,
    timeouts: TimeoutSection,
}

impl ListingCrawler {
    pub fn new(config: &CrawlerConfig) -> Self {
        Self {
            base_url: config.portal.base_url.clone(),
            selectors: config.portal.selectors.clone(),
            timeouts: config.timeouts.clone(),
        }
    }

    pub async fn search(&self, session: &Session, keyword: &str) -> BrowserResult<()> {
        let page = session.page();
        let status = page
            .goto(&self.base_url, self.timeouts.navigation())
            .await?;
        match status {
            Some(code) if code == 304 || (200..300).contains(&code) => {}
            None => {}
            Some(code) => {
                return Err(BrowserError::Navigation {
                    url: self.base_url.clone(),
                    status: code,
                })
            }
        }

        let keyword = keyword.trim();
        if !keyword.is_empty() {
            page.wait_for_selector(&self.selectors.search_input, self.timeouts.selector())
                .await?;
            page.type_text(&self.selectors.search_input, keyword).await?;
            page.click(&self.selectors.search_button).await?;
        }
        page.wait_for_selector(&self.selectors.result_table, self.timeouts.selector())
            .await?;
        info!(keyword, status = ?status, "search submitted");
        Ok(())
    }

    /// Reads the rows of the page currently shown. Does not touch the
    /// pagination state.
    pub async fn scan_current_page(&self, session: &Session) -> BrowserResult<Vec<ListingDraft>> {
        let page = session.page();
        page.wait_for_selector(&self.selectors.rows, self.timeouts.rows())
            .await?;
        let rows = page.extract_rows(&self.selectors.rows).await?;
        let total = rows.len();
        let drafts: Vec<ListingDraft> = rows.into_iter().filter(|row| !row.is_blank()).collect();
        debug!(rows = total, kept = drafts.len(), "page scanned");
        Ok(drafts)
    }

    pub async fn has_next_page(&self, session: &Session) -> BrowserResult<NextPageState> {
        let page = session.page();
        if !self.selectors.range_label.is_empty() {
            if let Some(range) = page.text_content(&self.selectors.range_label).await? {
                info!(range = %range, "pagination range");
            }
        }
        let control = page.control_state(&self.selectors.next_button).await?;
        let current_page_has_rows = page.count(&self.selectors.rows).await? > 0;
        let state = match control {
            Some(control) => NextPageState {
                exists: self.selectors.next_label.is_empty()
                    || control.text.contains(&self.selectors.next_label),
                disabled: control.disabled,
                current_page_has_rows,
            },
            None => NextPageState {
                exists: false,
                disabled: false,
                current_page_has_rows,
            },
        };
        debug!(?state, "next page state");
        Ok(state)
    }

    /// Serialized row body of the page currently shown.
    pub async fn row_snapshot(&self, session: &Session) -> BrowserResult<String> {
        Ok(session
            .page()
            .inner_html(&self.selectors.row_body)
            .await?
            .unwrap_or_default())
    }

    /// True once the row body differs from `before` and holds rows again.
    pub async fn turned_since(&self, session: &Session, before: &str) -> BrowserResult<bool> {
        let current = self.row_snapshot(session).await?;
        Ok(current != before && session.page().count(&self.selectors.rows).await? > 0)
    }

    /// Clicks "next" and waits until the row body differs from what was shown
    /// before the click. A click the portal ignored surfaces as a timeout.
    pub async fn advance_page(&self, session: &Session) -> BrowserResult<()> {
        let before = self.row_snapshot(session).await?;
        self.advance_from(session, &before).await
    }

    /// Like [`advance_page`](Self::advance_page) with the pre-click snapshot
    /// taken by the caller, so a late turn can still be recognised after a
    /// timeout.
    pub async fn advance_from(&self, session: &Session, before: &str) -> BrowserResult<()> {
        session.page().click(&self.selectors.next_button).await?;
        let deadline = Instant::now() + self.timeouts.page_turn();
        loop {
            if self.turned_since(session, before).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::Timeout("page turn".into()));
            }
            sleep(self.timeouts.poll_interval()).await;
        }
    }
}
