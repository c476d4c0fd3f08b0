use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{error, info};

use tender_core::detail::DetailResult;
use tender_core::tenders::{Listing, ListingFilter, SqliteTenderStore, StoreSummary};
use tender_core::{
    load_crawler_config, ChromiumDriver, ClassifierError, ConfigError, CorrectionError,
    CorrectionProcessor, CorrectionStats, CrawlError, CrawlReport, CrawlerConfig, DetailError,
    DetailQueueProcessor, DrainStats, OpenAiClassifier, RecoveryController, SessionManager,
    StoreError, TenderRepository,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("crawl error: {0}")]
    Crawl(#[from] CrawlError),
    #[error("detail error: {0}")]
    Detail(#[from] DetailError),
    #[error("classifier error: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("correction error: {0}")]
    Correction(#[from] CorrectionError),
    #[error("no correction prompt named {0}")]
    UnknownPrompt(String),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("pipeline task failed: {0}")]
    Join(#[from] JoinError),
    #[error("{failed} of {total} keyword crawls failed")]
    CrawlFailures { failed: usize, total: usize },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Procurement notice crawler control interface", long_about = None)]
pub struct Cli {
    /// Path to crawler.toml
    #[arg(long, default_value = "configs/crawler.toml")]
    pub config: PathBuf,
    /// Alternative path for the tenders SQLite database
    #[arg(long)]
    pub store: Option<PathBuf>,
    /// Show the browser window instead of running headless
    #[arg(long, default_value_t = false)]
    pub headed: bool,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Crawl result listings for the configured keywords
    Crawl(CrawlArgs),
    /// Visit and classify unprocessed listings
    Drain(DrainArgs),
    /// Crawl and optionally drain details concurrently
    Run(RunArgs),
    /// Re-analyze stored details under each correction prompt
    Correct(CorrectArgs),
    /// Show store counters
    Status,
    /// List stored listings
    Listings(ListingsArgs),
}

#[derive(Args, Debug)]
pub struct CrawlArgs {
    /// Keyword to search for; repeat for several. Defaults to portal.keywords
    #[arg(long = "keyword")]
    pub keywords: Vec<String>,
}

#[derive(Args, Debug)]
pub struct DrainArgs {
    /// Maximum passes over the unprocessed listings
    #[arg(long)]
    pub passes: Option<u32>,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(long = "keyword")]
    pub keywords: Vec<String>,
    /// Also run the detail drain alongside the crawl
    #[arg(long, default_value_t = false)]
    pub with_details: bool,
    /// Seconds to wait before the detail drain starts
    #[arg(long)]
    pub details_delay: Option<u64>,
}

#[derive(Args, Debug)]
pub struct CorrectArgs {
    /// Only run the named prompt; repeat for several. Defaults to all
    #[arg(long = "prompt")]
    pub prompts: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ListingsArgs {
    /// Only listings not yet processed
    #[arg(long, default_value_t = false)]
    pub unprocessed: bool,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

pub async fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Crawl(args) => {
            let report = context.controller(&args.keywords).crawl_all().await;
            render(&report, cli.format)?;
            crawl_outcome(&report)?;
        }
        Commands::Drain(args) => {
            let passes = args.passes.unwrap_or(context.config.detail.max_passes);
            let stats = context.processor()?.drain_until_settled(passes).await?;
            render(&stats, cli.format)?;
        }
        Commands::Run(args) => {
            let report = context.run(args).await?;
            render(&report, cli.format)?;
            crawl_outcome(&report.crawl)?;
        }
        Commands::Correct(args) => {
            let stats = context.corrector(&args.prompts)?.run().await?;
            render(&stats, cli.format)?;
        }
        Commands::Status => {
            let status = context.status()?;
            render(&status, cli.format)?;
        }
        Commands::Listings(args) => {
            let listings = context.listings(args)?;
            render(&listings, cli.format)?;
        }
    }

    Ok(())
}

fn crawl_outcome(report: &CrawlReport) -> Result<()> {
    if report.failures.is_empty() {
        Ok(())
    } else {
        Err(AppError::CrawlFailures {
            failed: report.failures.len(),
            total: report.failures.len() + report.runs.len(),
        })
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: CrawlerConfig,
    store: SqliteTenderStore,
    headed: bool,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_crawler_config(&cli.config)?;
        let store_path = cli.store.clone().unwrap_or_else(|| config.store_path());
        let store = SqliteTenderStore::new(&store_path)?;
        store.initialize()?;
        Ok(Self {
            config,
            store,
            headed: cli.headed,
        })
    }

    fn sessions(&self) -> SessionManager {
        let driver = ChromiumDriver::new(&self.config).with_headless(
            !self.headed && self.config.chromium.headless,
        );
        SessionManager::new(Arc::new(driver))
    }

    fn repository(&self) -> Arc<dyn TenderRepository> {
        Arc::new(self.store.clone())
    }

    fn controller(&self, keywords: &[String]) -> RecoveryController {
        let controller = RecoveryController::new(&self.config, self.sessions(), self.repository());
        if keywords.is_empty() {
            controller
        } else {
            controller.with_keywords(keywords.to_vec())
        }
    }

    fn processor(&self) -> Result<DetailQueueProcessor> {
        let classifier = OpenAiClassifier::from_config(&self.config.classifier)?;
        Ok(DetailQueueProcessor::new(
            &self.config,
            self.sessions(),
            self.repository(),
            Arc::new(classifier),
        ))
    }

    fn corrector(&self, prompts: &[String]) -> Result<CorrectionProcessor> {
        let mut config = self.config.clone();
        if !prompts.is_empty() {
            if let Some(unknown) = prompts.iter().find(|name| {
                !config
                    .correction
                    .prompts
                    .iter()
                    .any(|prompt| &prompt.name == *name)
            }) {
                return Err(AppError::UnknownPrompt(unknown.clone()));
            }
            config
                .correction
                .prompts
                .retain(|prompt| prompts.contains(&prompt.name));
        }
        let classifier = OpenAiClassifier::from_config(&config.classifier)?;
        Ok(CorrectionProcessor::new(
            &config,
            self.repository(),
            Arc::new(classifier),
        )?)
    }

    async fn run(&self, args: &RunArgs) -> Result<RunReport> {
        let controller = self.controller(&args.keywords);
        if !args.with_details {
            let crawl = controller.crawl_all().await;
            return Ok(settle_run(crawl, None));
        }

        let processor = self.processor()?;
        let delay = Duration::from_secs(
            args.details_delay
                .unwrap_or(self.config.detail.start_delay_seconds),
        );
        let passes = self.config.detail.max_passes;
        let crawl = tokio::spawn(async move { controller.crawl_all().await });
        let details = tokio::spawn(async move {
            info!(delay_s = delay.as_secs(), "detail drain scheduled");
            tokio::time::sleep(delay).await;
            processor.drain_until_settled(passes).await
        });
        let (crawl, details) = tokio::join!(crawl, details);
        Ok(settle_run(crawl?, Some(details)))
    }

    fn status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            generated_at: Utc::now(),
            store_path: self.store.path().display().to_string(),
            summary: self.store.summary()?,
        })
    }

    fn listings(&self, args: &ListingsArgs) -> Result<ListingList> {
        let rows = self.store.list_listings(&ListingFilter {
            processed: args.unprocessed.then_some(false),
            limit: Some(args.limit),
        })?;
        Ok(ListingList { rows })
    }
}

/// A failed detail drain is logged and reported next to the crawl; only
/// the crawl decides the exit status of `run`.
fn settle_run(
    crawl: CrawlReport,
    details: Option<std::result::Result<DetailResult<DrainStats>, JoinError>>,
) -> RunReport {
    let (details, details_error) = match details {
        None => (None, None),
        Some(Ok(Ok(stats))) => (Some(stats), None),
        Some(Ok(Err(err))) => {
            error!(error = %err, "detail drain failed");
            (None, Some(err.to_string()))
        }
        Some(Err(err)) => {
            error!(error = %err, "detail drain task failed");
            (None, Some(err.to_string()))
        }
    };
    RunReport {
        crawl,
        details,
        details_error,
    }
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub crawl: CrawlReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<DrainStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub store_path: String,
    pub summary: StoreSummary,
}

#[derive(Debug, Serialize)]
pub struct ListingList {
    pub rows: Vec<Listing>,
}

impl DisplayFallback for CrawlReport {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for run in &self.runs {
            let stop = run
                .stop_reason
                .map(|reason| format!("{reason:?}"))
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "'{}' pages={} rows={} new={} retries={} page_rebuilds={} session_rebuilds={} stop={} ({} ms)",
                run.keyword,
                run.pages_scanned,
                run.rows_seen,
                run.listings_inserted,
                run.retries,
                run.page_rebuilds,
                run.session_rebuilds,
                stop,
                run.duration_ms,
            ));
        }
        for failure in &self.failures {
            lines.push(format!("'{}' FAILED: {}", failure.keyword, failure.error));
        }
        if lines.is_empty() {
            return "No keywords crawled".to_string();
        }
        lines.join("\n")
    }
}

impl DisplayFallback for DrainStats {
    fn display(&self) -> String {
        format!(
            "passes={} seen={} saved={} rejected={} errors={} retry_later={}",
            self.passes, self.seen, self.saved, self.rejected, self.errors, self.retry_later
        )
    }
}

impl DisplayFallback for RunReport {
    fn display(&self) -> String {
        match (&self.details, &self.details_error) {
            (Some(details), _) => {
                format!("{}\ndetails: {}", self.crawl.display(), details.display())
            }
            (None, Some(err)) => format!("{}\ndetails FAILED: {}", self.crawl.display(), err),
            (None, None) => self.crawl.display(),
        }
    }
}

impl DisplayFallback for CorrectionStats {
    fn display(&self) -> String {
        let mut lines = vec![format!("details={}", self.details)];
        for prompt in &self.prompts {
            lines.push(format!(
                "'{}' analyzed={} qualifying={} already_analyzed={} excluded={} errors={}",
                prompt.prompt,
                prompt.analyzed,
                prompt.qualifying,
                prompt.already_analyzed,
                prompt.excluded,
                prompt.errors
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        [
            format!("Store: {}", self.store_path),
            format!("  - listings: {}", self.summary.listings),
            format!("  - unprocessed: {}", self.summary.unprocessed),
            format!("  - processed: {}", self.summary.processed),
            format!("  - details: {}", self.summary.details),
            format!("  - analyses: {}", self.summary.analyses),
        ]
        .join("\n")
    }
}

impl DisplayFallback for ListingList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No listings found".to_string();
        }
        self.rows
            .iter()
            .map(|listing| {
                format!(
                    "#{} {} | {} | {} | processed={}",
                    listing.id,
                    listing.number,
                    listing.title,
                    listing.status,
                    listing.processed
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tender_core::tenders::ListingDraft;

    fn prepare_test_context() -> Result<(TempDir, AppContext)> {
        let temp = TempDir::new().unwrap();
        let configs_dir = temp.path().join("configs");
        fs::create_dir_all(&configs_dir).unwrap();
        fs::copy("../configs/crawler.toml", configs_dir.join("crawler.toml")).unwrap();

        let cli = Cli {
            config: configs_dir.join("crawler.toml"),
            store: Some(temp.path().join("data/tenders.sqlite")),
            headed: false,
            format: OutputFormat::Json,
            command: Commands::Status,
        };
        let context = AppContext::new(&cli)?;

        let drafts: Vec<ListingDraft> = (1..=3)
            .map(|n| ListingDraft {
                title: format!("Licencje Microsoft {n}"),
                number: format!("2024/BZP-{n}"),
                status: "Ogłoszone".into(),
                publication_date: None,
                link: format!("https://portal.example/notice/{n}"),
            })
            .collect();
        context.store.insert_listings(&drafts, "browser")?;
        Ok((temp, context))
    }

    #[test]
    fn status_reports_store_counters() {
        let (_temp, context) = prepare_test_context().unwrap();
        let first = context.store.unprocessed_listings().unwrap()[0].id;
        context.store.mark_processed(first).unwrap();

        let status = context.status().unwrap();
        assert_eq!(status.summary.listings, 3);
        assert_eq!(status.summary.unprocessed, 2);
        assert!(status.store_path.ends_with("tenders.sqlite"));
        assert!(status.display().contains("unprocessed: 2"));
    }

    #[test]
    fn listings_respect_filter_and_limit() {
        let (_temp, context) = prepare_test_context().unwrap();
        let list = context
            .listings(&ListingsArgs {
                unprocessed: true,
                limit: 2,
            })
            .unwrap();
        assert_eq!(list.rows.len(), 2);
        assert_eq!(list.rows[0].number, "2024/BZP-1");
        let json = serde_json::to_value(&list).unwrap();
        assert_eq!(json["rows"][1]["processed"], serde_json::json!(false));
    }

    #[test]
    fn cli_parses_repeated_keywords() {
        let cli = Cli::try_parse_from([
            "tenderctl",
            "--format",
            "json",
            "crawl",
            "--keyword",
            "microsoft",
            "--keyword",
            "licencja",
        ])
        .unwrap();
        match cli.command {
            Commands::Crawl(args) => assert_eq!(args.keywords, vec!["microsoft", "licencja"]),
            other => panic!("unexpected command {other:?}"),
        }
        assert!(matches!(cli.format, OutputFormat::Json));
    }

    #[test]
    fn failed_keywords_fail_the_command() {
        let report = CrawlReport {
            runs: Vec::new(),
            failures: vec![tender_core::crawler::KeywordFailure {
                keyword: "microsoft".into(),
                error: "aborted".into(),
            }],
        };
        assert!(matches!(
            crawl_outcome(&report),
            Err(AppError::CrawlFailures { failed: 1, total: 1 })
        ));
        assert!(report.display().contains("FAILED"));
    }

    #[test]
    fn failed_drain_keeps_the_crawl_report() {
        let crawl = CrawlReport::default();
        let drain: DetailResult<DrainStats> = Err(DetailError::LaunchAborted {
            failures: 3,
            source: tender_core::browser::BrowserError::Launch("chromium exited early".into()),
        });

        let report = settle_run(crawl, Some(Ok(drain)));

        assert!(report.details.is_none());
        assert!(report
            .details_error
            .as_deref()
            .is_some_and(|err| err.contains("3 consecutive launch failures")));
        assert!(crawl_outcome(&report.crawl).is_ok());
        assert!(report.display().contains("details FAILED"));
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("details").is_none());
        assert!(json["details_error"].is_string());
    }

    #[test]
    fn cli_parses_correct_with_prompt_filter() {
        let cli =
            Cli::try_parse_from(["tenderctl", "correct", "--prompt", "section_specific"]).unwrap();
        match cli.command {
            Commands::Correct(args) => assert_eq!(args.prompts, vec!["section_specific"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn unknown_prompt_is_rejected() {
        let (_temp, context) = prepare_test_context().unwrap();
        let err = context.corrector(&["missing".to_string()]).err().unwrap();
        assert!(matches!(err, AppError::UnknownPrompt(name) if name == "missing"));
        assert!(context.status().unwrap().display().contains("analyses: 0"));
    }
}
