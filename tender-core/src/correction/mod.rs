use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::classifier::Classifier;
use crate::config::{CrawlerConfig, PromptSection};
use crate::tenders::{Analysis, Detail, StoreError, TenderRepository};

#[derive(Debug, Error)]
pub enum CorrectionError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid title exclusion pattern: {0}")]
    Pattern(#[from] regex::Error),
}

pub type CorrectionResult<T> = std::result::Result<T, CorrectionError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PromptStats {
    pub prompt: String,
    pub analyzed: usize,
    pub qualifying: usize,
    pub already_analyzed: usize,
    pub excluded: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CorrectionStats {
    pub details: usize,
    pub prompts: Vec<PromptStats>,
}

impl CorrectionStats {
    pub fn analyzed(&self) -> usize {
        self.prompts.iter().map(|prompt| prompt.analyzed).sum()
    }

    pub fn errors(&self) -> usize {
        self.prompts.iter().map(|prompt| prompt.errors).sum()
    }
}

/// Re-analyzes stored details under each configured prompt. A
/// (tender, prompt) pair is analyzed at most once; failed analyses are not
/// recorded and are picked up by the next run.
pub struct CorrectionProcessor {
    repository: Arc<dyn TenderRepository>,
    classifier: Arc<dyn Classifier>,
    prompts: Vec<PromptSection>,
    exclude_title: Option<Regex>,
    item_delay: Duration,
}

impl CorrectionProcessor {
    pub fn new(
        config: &CrawlerConfig,
        repository: Arc<dyn TenderRepository>,
        classifier: Arc<dyn Classifier>,
    ) -> CorrectionResult<Self> {
        let pattern = config.correction.exclude_title_pattern.trim();
        let exclude_title = if pattern.is_empty() {
            None
        } else {
            Some(Regex::new(pattern)?)
        };
        Ok(Self {
            repository,
            classifier,
            prompts: config.correction.prompts.clone(),
            exclude_title,
            item_delay: config.correction.item_delay(),
        })
    }

    pub async fn run(&self) -> CorrectionResult<CorrectionStats> {
        let details = self.repository.details().await?;
        info!(details = details.len(), prompts = self.prompts.len(), "correction pass started");
        let mut stats = CorrectionStats {
            details: details.len(),
            prompts: Vec::with_capacity(self.prompts.len()),
        };
        for prompt in &self.prompts {
            let prompt_stats = self.run_prompt(prompt, &details).await?;
            info!(
                prompt = %prompt.name,
                analyzed = prompt_stats.analyzed,
                qualifying = prompt_stats.qualifying,
                skipped = prompt_stats.already_analyzed,
                excluded = prompt_stats.excluded,
                errors = prompt_stats.errors,
                "prompt finished"
            );
            stats.prompts.push(prompt_stats);
        }
        Ok(stats)
    }

    async fn run_prompt(
        &self,
        prompt: &PromptSection,
        details: &[Detail],
    ) -> CorrectionResult<PromptStats> {
        let mut stats = PromptStats {
            prompt: prompt.name.clone(),
            ..PromptStats::default()
        };
        for detail in details {
            if self.is_excluded(&detail.original_listing.title) {
                debug!(tender = %detail.tender_id, "title excluded from correction");
                stats.excluded += 1;
                continue;
            }
            if self
                .repository
                .has_analysis(&detail.tender_id, &prompt.name)
                .await?
            {
                stats.already_analyzed += 1;
                continue;
            }

            let verdict = match self
                .classifier
                .classify_with(&prompt.system_prompt, &detail.full_content)
                .await
            {
                Ok(verdict) => verdict,
                Err(err) => {
                    warn!(tender = %detail.tender_id, prompt = %prompt.name, error = %err, "analysis failed");
                    stats.errors += 1;
                    continue;
                }
            };
            let record = match verdict.to_record() {
                Ok(record) => record,
                Err(err) => {
                    warn!(tender = %detail.tender_id, prompt = %prompt.name, error = %err, "analysis could not be recorded");
                    stats.errors += 1;
                    continue;
                }
            };

            let analysis = Analysis::new(detail, &prompt.name, verdict.qualifies, record);
            if self.repository.save_analysis(analysis).await? {
                stats.analyzed += 1;
                if verdict.qualifies {
                    stats.qualifying += 1;
                }
                info!(tender = %detail.tender_id, prompt = %prompt.name, qualifies = verdict.qualifies, "tender analyzed");
            } else {
                stats.already_analyzed += 1;
            }
            sleep(self.item_delay).await;
        }
        Ok(stats)
    }

    fn is_excluded(&self, title: &str) -> bool {
        self.exclude_title
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(title))
    }
}
