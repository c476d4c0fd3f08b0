pub mod browser;
pub mod classifier;
pub mod config;
pub mod correction;
pub mod crawler;
pub mod detail;
pub mod error;
pub mod sqlite;
pub mod tenders;

pub use browser::{
    BrowserDriver, BrowserError, BrowserHandle, BrowserResult, ChromiumDriver, ControlState,
    FaultClass, PageDriver, Session, SessionManager,
};
pub use classifier::{Classification, Classifier, ClassifierError, OpenAiClassifier};
pub use config::{load_crawler_config, CrawlerConfig};
pub use correction::{CorrectionError, CorrectionProcessor, CorrectionStats, PromptStats};
pub use crawler::{
    CrawlError, CrawlReport, CrawlStats, ListingCrawler, NextPageState, RecoveryController,
    RecoveryMachine, RecoveryPolicy, StopReason,
};
pub use detail::{DetailError, DetailQueueProcessor, DrainStats, ItemOutcome};
pub use error::{ConfigError, Result};
pub use tenders::{
    Analysis, Detail, Listing, ListingDraft, ListingFilter, SqliteTenderStore, StoreError,
    StoreResult, StoreSummary, TenderRepository,
};
