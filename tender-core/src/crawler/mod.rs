pub mod listing;
pub mod machine;
pub mod recovery;

pub use listing::{ListingCrawler, NextPageState};
pub use machine::{
    AbortReason, CrawlEvent, CrawlState, CrawlStep, MachineCounters, RecoveryMachine,
    RecoveryPolicy, StopReason,
};
pub use recovery::{
    CrawlError, CrawlReport, CrawlResult, CrawlStats, KeywordFailure, RecoveryController,
};
