use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::browser::{BrowserError, BrowserResult, Session, SessionManager};
use crate::classifier::Classifier;
use crate::config::CrawlerConfig;
use crate::tenders::{Detail, Listing, StoreError, TenderRepository};

#[derive(Debug, Error)]
pub enum DetailError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("drain aborted after {failures} consecutive launch failures: {source}")]
    LaunchAborted {
        failures: u32,
        #[source]
        source: BrowserError,
    },
}

pub type DetailResult<T> = std::result::Result<T, DetailError>;

/// What happened to one listing in a drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Qualified; detail stored and listing marked processed.
    Saved,
    /// Did not qualify; marked processed without a detail.
    Rejected,
    /// A non-fatal visit or classification error; marked processed.
    Failed,
    /// Left unprocessed for a later pass.
    RetryLater,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainStats {
    pub passes: u32,
    pub seen: usize,
    pub saved: usize,
    pub rejected: usize,
    pub errors: usize,
    pub retry_later: usize,
}

impl DrainStats {
    fn record(&mut self, outcome: ItemOutcome) {
        self.seen += 1;
        match outcome {
            ItemOutcome::Saved => self.saved += 1,
            ItemOutcome::Rejected => self.rejected += 1,
            ItemOutcome::Failed => self.errors += 1,
            ItemOutcome::RetryLater => self.retry_later += 1,
        }
    }

    /// Items whose processed flag was set in this pass.
    pub fn settled(&self) -> usize {
        self.seen - self.retry_later
    }

    fn absorb(&mut self, other: &DrainStats) {
        self.passes += other.passes;
        self.seen += other.seen;
        self.saved += other.saved;
        self.rejected += other.rejected;
        self.errors += other.errors;
        self.retry_later += other.retry_later;
    }
}

/// Works through unprocessed listings one at a time, each in a fresh browser
/// session.
pub struct DetailQueueProcessor {
    sessions: SessionManager,
    repository: Arc<dyn TenderRepository>,
    classifier: Arc<dyn Classifier>,
    navigation_timeout: Duration,
    item_delay: Duration,
    max_consecutive_launch_failures: u32,
}

impl DetailQueueProcessor {
    pub fn new(
        config: &CrawlerConfig,
        sessions: SessionManager,
        repository: Arc<dyn TenderRepository>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        Self {
            sessions,
            repository,
            classifier,
            navigation_timeout: config.timeouts.navigation(),
            item_delay: Duration::from_millis(config.detail.item_delay_ms),
            max_consecutive_launch_failures: config.detail.max_consecutive_launch_failures.max(1),
        }
    }

    /// One pass over a snapshot of the unprocessed listings.
    pub async fn drain(&self) -> DetailResult<DrainStats> {
        let listings = self.repository.unprocessed_listings().await?;
        let mut stats = DrainStats {
            passes: 1,
            ..DrainStats::default()
        };
        info!(pending = listings.len(), "detail drain started");
        let mut launch_failures = 0u32;

        for (index, listing) in listings.iter().enumerate() {
            if index > 0 {
                sleep(self.item_delay).await;
            }
            if url::Url::parse(&listing.link).is_err() {
                warn!(id = listing.id, link = %listing.link, "listing link is not an absolute url");
                let outcome = self.settle(listing, ItemOutcome::Failed).await;
                stats.record(outcome);
                continue;
            }

            let session = match self.sessions.open().await {
                Ok(session) => {
                    launch_failures = 0;
                    session
                }
                Err(err) => {
                    launch_failures += 1;
                    stats.record(ItemOutcome::RetryLater);
                    warn!(
                        id = listing.id,
                        failures = launch_failures,
                        error = %err,
                        "browser launch failed; listing left for retry"
                    );
                    if launch_failures >= self.max_consecutive_launch_failures {
                        error!(failures = launch_failures, "aborting detail drain");
                        return Err(DetailError::LaunchAborted {
                            failures: launch_failures,
                            source: err,
                        });
                    }
                    continue;
                }
            };
            let outcome = self.process(&session, listing).await;
            self.sessions.close(session).await;
            stats.record(outcome);
            info!(id = listing.id, number = %listing.number, ?outcome, "listing handled");
        }

        info!(
            seen = stats.seen,
            saved = stats.saved,
            rejected = stats.rejected,
            errors = stats.errors,
            retry_later = stats.retry_later,
            "detail drain finished"
        );
        Ok(stats)
    }

    /// Runs passes until one settles nothing, nothing is left to retry, or
    /// `max_passes` is reached.
    pub async fn drain_until_settled(&self, max_passes: u32) -> DetailResult<DrainStats> {
        let mut total = DrainStats::default();
        for pass in 1..=max_passes.max(1) {
            let stats = self.drain().await?;
            total.absorb(&stats);
            debug!(pass, settled = stats.settled(), retry_later = stats.retry_later, "pass done");
            if stats.retry_later == 0 || stats.settled() == 0 {
                break;
            }
        }
        Ok(total)
    }

    async fn process(&self, session: &Session, listing: &Listing) -> ItemOutcome {
        let text = match self.visit(session, &listing.link).await {
            Ok(text) => text,
            Err(err) if err.is_fatal() => {
                warn!(id = listing.id, error = %err, "session lost; listing left for retry");
                return ItemOutcome::RetryLater;
            }
            Err(err) => {
                warn!(id = listing.id, error = %err, "detail page could not be read");
                return self.settle(listing, ItemOutcome::Failed).await;
            }
        };

        let verdict = match self.classifier.classify(&text).await {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(id = listing.id, error = %err, "classification failed; treated as rejection");
                return self.settle(listing, ItemOutcome::Failed).await;
            }
        };

        if !verdict.qualifies {
            debug!(id = listing.id, message = ?verdict.message, "listing rejected");
            return self.settle(listing, ItemOutcome::Rejected).await;
        }

        let record = match verdict.to_record() {
            Ok(record) => record,
            Err(err) => {
                warn!(id = listing.id, error = %err, "verdict could not be recorded; listing left for retry");
                return ItemOutcome::RetryLater;
            }
        };
        let detail = Detail::new(listing, text, record);
        match self.repository.save_detail(detail).await {
            Ok(inserted) => {
                if !inserted {
                    debug!(id = listing.id, number = %listing.number, "detail already stored");
                }
                self.settle(listing, ItemOutcome::Saved).await
            }
            Err(err) => {
                warn!(id = listing.id, error = %err, "failed to store detail; listing left for retry");
                ItemOutcome::RetryLater
            }
        }
    }

    async fn visit(&self, session: &Session, link: &str) -> BrowserResult<String> {
        let page = session.page();
        match page.goto(link, self.navigation_timeout).await? {
            Some(status) if status != 304 && !(200..300).contains(&status) => {
                Err(BrowserError::Navigation {
                    url: link.to_string(),
                    status,
                })
            }
            _ => page.page_text().await,
        }
    }

    /// Marks the listing processed. A failed update leaves it for retry.
    async fn settle(&self, listing: &Listing, outcome: ItemOutcome) -> ItemOutcome {
        match self.repository.mark_processed(listing.id).await {
            Ok(_) => outcome,
            Err(err) => {
                warn!(id = listing.id, error = %err, "failed to mark listing processed");
                ItemOutcome::RetryLater
            }
        }
    }
}
