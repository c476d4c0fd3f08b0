use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::browser::{BrowserError, BrowserResult, Session, SessionManager};
use crate::config::CrawlerConfig;
use crate::tenders::{ListingDraft, StoreError, TenderRepository};

use super::listing::ListingCrawler;
use super::machine::{
    AbortReason, CrawlEvent, CrawlState, CrawlStep, RecoveryMachine, RecoveryPolicy, StopReason,
};

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("crawl for '{keyword}' aborted ({reason:?}) on page {page}: {last_error}")]
    Aborted {
        keyword: String,
        reason: AbortReason,
        page: u32,
        last_error: String,
    },
}

pub type CrawlResult<T> = std::result::Result<T, CrawlError>;

#[derive(Debug, Clone, Serialize)]
pub struct CrawlStats {
    pub run_id: Uuid,
    pub keyword: String,
    pub started_at: DateTime<Utc>,
    pub pages_scanned: u32,
    pub rows_seen: usize,
    pub listings_inserted: usize,
    pub retries: u32,
    pub page_rebuilds: u32,
    pub session_rebuilds: u32,
    pub persistence_errors: u32,
    pub last_page: u32,
    pub stop_reason: Option<StopReason>,
    pub duration_ms: u64,
}

impl CrawlStats {
    fn new(keyword: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            keyword: keyword.to_string(),
            started_at: Utc::now(),
            pages_scanned: 0,
            rows_seen: 0,
            listings_inserted: 0,
            retries: 0,
            page_rebuilds: 0,
            session_rebuilds: 0,
            persistence_errors: 0,
            last_page: 1,
            stop_reason: None,
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KeywordFailure {
    pub keyword: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlReport {
    pub runs: Vec<CrawlStats>,
    pub failures: Vec<KeywordFailure>,
}

impl CrawlReport {
    pub fn listings_inserted(&self) -> usize {
        self.runs.iter().map(|run| run.listings_inserted).sum()
    }
}

/// Drives [`ListingCrawler`] through the recovery machine, owning the one
/// live session of the crawl stream.
pub struct RecoveryController {
    sessions: SessionManager,
    crawler: ListingCrawler,
    repository: Arc<dyn TenderRepository>,
    policy: RecoveryPolicy,
    origin: String,
    keywords: Vec<String>,
    settle_delay: Duration,
}

impl RecoveryController {
    pub fn new(
        config: &CrawlerConfig,
        sessions: SessionManager,
        repository: Arc<dyn TenderRepository>,
    ) -> Self {
        Self {
            sessions,
            crawler: ListingCrawler::new(config),
            repository,
            policy: RecoveryPolicy::from_config(&config.recovery),
            origin: config.portal.origin.clone(),
            keywords: config.portal.keywords.clone(),
            settle_delay: Duration::from_millis(config.recovery.settle_delay_ms),
        }
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    /// Crawls each keyword in turn, each with its own session. A keyword
    /// that aborts is recorded and the next one still runs.
    pub async fn crawl_all(&self) -> CrawlReport {
        let keywords = if self.keywords.is_empty() {
            vec![String::new()]
        } else {
            self.keywords.clone()
        };
        let mut report = CrawlReport::default();
        for keyword in keywords {
            match self.crawl(&keyword).await {
                Ok(stats) => report.runs.push(stats),
                Err(err) => {
                    error!(keyword = %keyword, error = %err, "crawl failed");
                    report.failures.push(KeywordFailure {
                        keyword,
                        error: err.to_string(),
                    });
                }
            }
        }
        report
    }

    pub async fn crawl(&self, keyword: &str) -> CrawlResult<CrawlStats> {
        let started = Instant::now();
        let mut stats = CrawlStats::new(keyword);
        let mut machine = RecoveryMachine::new(self.policy.clone());
        let mut session = Some(self.sessions.open().await?);
        let mut last_error = String::new();
        // Row body seen before an unconfirmed "next" click.
        let mut turn_from: Option<String> = None;
        info!(run_id = %stats.run_id, keyword, "crawl started");

        loop {
            let state = machine.state().clone();
            let event = match state {
                CrawlState::Scanning => {
                    let scanned = match active(&session) {
                        Ok(active) => self.crawler.scan_current_page(active).await,
                        Err(err) => Err(err),
                    };
                    match scanned {
                        Ok(rows) => {
                            self.persist(rows, machine.page_index(), &mut stats).await;
                            CrawlEvent::PageScanned
                        }
                        Err(err) => fault(CrawlStep::Scan, err, &machine, &mut last_error),
                    }
                }
                CrawlState::Paginating => {
                    self.paginate(&session, &mut machine, &mut turn_from, &mut last_error)
                        .await
                }
                CrawlState::Retrying { step, delay } => {
                    debug!(?step, delay_ms = delay.as_millis() as u64, "retrying after delay");
                    sleep(delay).await;
                    CrawlEvent::RetryElapsed
                }
                CrawlState::RebuildingPage => {
                    turn_from = None;
                    let target = machine.page_index();
                    let rebuilt = match session.as_mut() {
                        Some(active) => self.rebuild_page(active, keyword, target).await,
                        None => Err(BrowserError::SessionClosed("no live session".into())),
                    };
                    match rebuilt {
                        Ok(page) => CrawlEvent::PageRebuilt { page },
                        Err(err) => {
                            warn!(page = target, error = %err, "page rebuild failed");
                            last_error = err.to_string();
                            CrawlEvent::PageRebuildFailed
                        }
                    }
                }
                CrawlState::RebuildingSession { delay } => {
                    turn_from = None;
                    let target = machine.page_index();
                    if let Some(old) = session.take() {
                        self.sessions.close(old).await;
                    }
                    warn!(
                        page = target,
                        rebuild = machine.counters().session_rebuilds,
                        delay_ms = delay.as_millis() as u64,
                        "relaunching browser session"
                    );
                    sleep(delay).await;
                    match self.rebuild_session(keyword, target).await {
                        Ok((fresh, page)) => {
                            session = Some(fresh);
                            CrawlEvent::SessionRebuilt { page }
                        }
                        Err(err) => {
                            error!(page = target, error = %err, "session rebuild failed");
                            last_error = err.to_string();
                            CrawlEvent::SessionRebuildFailed
                        }
                    }
                }
                CrawlState::Done(reason) => {
                    stats.stop_reason = Some(reason);
                    break;
                }
                CrawlState::Aborted(reason) => {
                    if let Some(active) = session.take() {
                        self.sessions.close(active).await;
                    }
                    return Err(CrawlError::Aborted {
                        keyword: keyword.to_string(),
                        reason,
                        page: machine.page_index(),
                        last_error,
                    });
                }
            };
            machine.on_event(event);
        }

        if let Some(active) = session.take() {
            self.sessions.close(active).await;
        }
        let counters = machine.counters();
        stats.retries = counters.retries;
        stats.page_rebuilds = counters.page_rebuilds;
        stats.session_rebuilds = counters.session_rebuilds;
        stats.last_page = machine.page_index();
        stats.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            run_id = %stats.run_id,
            keyword,
            pages = stats.pages_scanned,
            inserted = stats.listings_inserted,
            retries = stats.retries,
            page_rebuilds = stats.page_rebuilds,
            session_rebuilds = stats.session_rebuilds,
            stop = ?stats.stop_reason,
            "crawl finished"
        );
        Ok(stats)
    }

    async fn paginate(
        &self,
        session: &Option<Session>,
        machine: &mut RecoveryMachine,
        turn_from: &mut Option<String>,
        last_error: &mut String,
    ) -> CrawlEvent {
        let active = match active(session) {
            Ok(active) => active,
            Err(err) => return fault(CrawlStep::CheckNext, err, machine, last_error),
        };
        if let Some(before) = turn_from.as_deref() {
            // An earlier click may have landed after its wait ran out.
            match self.crawler.turned_since(active, before).await {
                Ok(true) => {
                    *turn_from = None;
                    info!(page = machine.page_index() + 1, "late page turn detected");
                    return CrawlEvent::Advanced;
                }
                Ok(false) => {}
                Err(err) => return fault(CrawlStep::Advance, err, machine, last_error),
            }
        }
        let next = match self.crawler.has_next_page(active).await {
            Ok(next) => next,
            Err(err) => return fault(CrawlStep::CheckNext, err, machine, last_error),
        };
        if !next.exists {
            return CrawlEvent::Exhausted(StopReason::LastPage);
        }
        if next.disabled {
            return CrawlEvent::Exhausted(StopReason::NextDisabled);
        }
        if machine.on_event(CrawlEvent::NextPage).is_terminal() {
            // Page ceiling reached; terminal states ignore this repeat.
            return CrawlEvent::NextPage;
        }
        let before = match self.crawler.row_snapshot(active).await {
            Ok(before) => before,
            Err(err) => return fault(CrawlStep::Advance, err, machine, last_error),
        };
        let advanced = self.crawler.advance_from(active, &before).await;
        *turn_from = Some(before);
        match advanced {
            Ok(()) => {
                *turn_from = None;
                sleep(self.settle_delay).await;
                debug!(page = machine.page_index() + 1, "advanced");
                CrawlEvent::Advanced
            }
            Err(err) => fault(CrawlStep::Advance, err, machine, last_error),
        }
    }

    async fn persist(&self, rows: Vec<ListingDraft>, page: u32, stats: &mut CrawlStats) {
        let seen = rows.len();
        stats.pages_scanned += 1;
        stats.rows_seen += seen;
        match self.repository.insert_listings(rows, &self.origin).await {
            Ok(inserted) => {
                stats.listings_inserted += inserted;
                info!(page, rows = seen, inserted, "page stored");
            }
            Err(err) => {
                stats.persistence_errors += 1;
                warn!(page, rows = seen, error = %err, "failed to store page");
            }
        }
    }

    async fn rebuild_page(
        &self,
        session: &mut Session,
        keyword: &str,
        target: u32,
    ) -> BrowserResult<u32> {
        if !session.page().is_alive().await {
            self.sessions.new_page(session).await?;
        }
        self.replay(session, keyword, target).await
    }

    async fn rebuild_session(&self, keyword: &str, target: u32) -> BrowserResult<(Session, u32)> {
        let fresh = self.sessions.open().await?;
        match self.replay(&fresh, keyword, target).await {
            Ok(page) => Ok((fresh, page)),
            Err(err) => {
                self.sessions.close(fresh).await;
                Err(err)
            }
        }
    }

    /// Searches again and clicks "next" `target - 1` times, checking the
    /// control and the presence of rows before each click. Returns the page
    /// actually reached.
    async fn replay(&self, session: &Session, keyword: &str, target: u32) -> BrowserResult<u32> {
        self.crawler.search(session, keyword).await?;
        let mut reached = 1;
        while reached < target {
            let next = self.crawler.has_next_page(session).await?;
            if !next.can_advance() || !next.current_page_has_rows {
                warn!(reached, target, ?next, "portal exhausted during replay");
                break;
            }
            self.crawler.advance_page(session).await?;
            reached += 1;
            debug!(reached, target, "replay advanced");
        }
        if target > 1 {
            info!(reached, target, "pagination replayed");
        }
        Ok(reached)
    }
}

fn active(session: &Option<Session>) -> BrowserResult<&Session> {
    session
        .as_ref()
        .ok_or_else(|| BrowserError::SessionClosed("no live session".into()))
}

fn fault(
    step: CrawlStep,
    err: BrowserError,
    machine: &RecoveryMachine,
    last_error: &mut String,
) -> CrawlEvent {
    let class = err.fault_class();
    warn!(
        ?step,
        ?class,
        page = machine.page_index(),
        attempt = machine.attempts() + 1,
        error = %err,
        "crawl step failed"
    );
    *last_error = err.to_string();
    CrawlEvent::Fault { step, class }
}
