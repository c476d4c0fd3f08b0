use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CrawlerConfig {
    pub portal: PortalSection,
    #[serde(default)]
    pub chromium: ChromiumSection,
    #[serde(default)]
    pub user_agents: UserAgentSection,
    #[serde(default)]
    pub viewport: ViewportSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub detail: DetailSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub classifier: ClassifierSection,
    #[serde(default)]
    pub correction: CorrectionSection,
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

impl CrawlerConfig {
    /// Relative paths are resolved against the directory of the loaded
    /// config file, or kept as-is for configs built in code.
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        match &self.base_dir {
            Some(base) if !path.is_absolute() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.resolve_path(&self.store.path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.portal.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "portal.base_url",
                reason: "must not be empty".into(),
            });
        }
        url::Url::parse(&self.portal.base_url).map_err(|err| ConfigError::Invalid {
            field: "portal.base_url",
            reason: err.to_string(),
        })?;
        if self.recovery.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "recovery.max_attempts",
                reason: "must be at least 1".into(),
            });
        }
        if self.recovery.failed_page_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "recovery.failed_page_threshold",
                reason: "must be at least 1".into(),
            });
        }
        if self.recovery.max_pages == 0 {
            return Err(ConfigError::Invalid {
                field: "recovery.max_pages",
                reason: "must be at least 1".into(),
            });
        }
        self.correction.validate()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorrectionSection {
    pub prompts: Vec<PromptSection>,
    /// Titles matching this pattern are never re-analyzed. Empty disables it.
    pub exclude_title_pattern: String,
    pub item_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PromptSection {
    pub name: String,
    pub system_prompt: String,
}

impl Default for CorrectionSection {
    fn default() -> Self {
        Self {
            prompts: vec![
                PromptSection {
                    name: "basic".into(),
                    system_prompt: BASIC_ANALYSIS_PROMPT.into(),
                },
                PromptSection {
                    name: "section_specific".into(),
                    system_prompt: SECTION_ANALYSIS_PROMPT.into(),
                },
            ],
            exclude_title_pattern:
                r"(?i)^Ogłoszenie o\s+(?:wykonaniu umowy|wyniku postępowania|zmian(?:ie)?)".into(),
            item_delay_ms: 1000,
        }
    }
}

const BASIC_ANALYSIS_PROMPT: &str = "Analyze the tender notice for Microsoft licensing and \
subscription services. Return JSON only with keys: save (boolean), message, products, \
agreement_type, license_counts, values {net, gross, currency}, scoring_criteria {price_points, \
formula, other_criteria [{name, points}]}, partial_offers_allowed, duration, deadline. Use null \
for missing values; currency defaults to PLN.";

const SECTION_ANALYSIS_PROMPT: &str = "Analyze the tender notice for Microsoft licensing and \
subscription services. Take the contract value only from the sections \"Wartość zamówienia\", \
\"Szacunkowa wartość\" or \"Cena\", distinguishing netto from brutto, and the scoring rules only \
from \"Kryteria oceny ofert\". Return JSON only with keys: save (boolean), message, products, \
agreement_type, license_counts, values {net, gross, currency}, scoring_criteria {price_points, \
formula, other_criteria [{name, points}]}, partial_offers_allowed, duration, deadline. Use null \
for missing values; currency defaults to PLN.";

impl CorrectionSection {
    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }

    fn validate(&self) -> Result<()> {
        let mut names = std::collections::HashSet::new();
        for prompt in &self.prompts {
            if prompt.name.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "correction.prompts.name",
                    reason: "must not be empty".into(),
                });
            }
            if !names.insert(prompt.name.as_str()) {
                return Err(ConfigError::Invalid {
                    field: "correction.prompts.name",
                    reason: format!("duplicate prompt name '{}'", prompt.name),
                });
            }
        }
        if !self.exclude_title_pattern.is_empty() {
            regex::Regex::new(&self.exclude_title_pattern).map_err(|err| {
                ConfigError::Invalid {
                    field: "correction.exclude_title_pattern",
                    reason: err.to_string(),
                }
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalSection {
    pub base_url: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_origin")]
    pub origin: String,
    #[serde(default)]
    pub selectors: SelectorSection,
}

impl Default for PortalSection {
    fn default() -> Self {
        Self {
            base_url: "https://ezamowienia.gov.pl/mo-client-board/bzp/list".into(),
            keywords: vec!["microsoft".into()],
            origin: default_origin(),
            selectors: SelectorSection::default(),
        }
    }
}

fn default_origin() -> String {
    "browser".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectorSection {
    pub search_input: String,
    pub search_button: String,
    pub result_table: String,
    pub rows: String,
    pub row_body: String,
    pub next_button: String,
    /// Text the "next" control must contain to count as present. Empty
    /// disables the label check.
    pub next_label: String,
    pub range_label: String,
}

impl Default for SelectorSection {
    fn default() -> Self {
        Self {
            search_input: "input.form-control.ng-untouched.ng-pristine.ng-valid".into(),
            search_button: ".app-button.btn.btn-secondary.btn-block".into(),
            result_table: "lib-table".into(),
            rows: "tbody tr".into(),
            row_body: "tbody".into(),
            next_button: ".btn.btn-sm.btn-outline-secondary.append-arrow".into(),
            next_label: "Następna".into(),
            range_label: ".mat-mdc-paginator-range-label".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChromiumSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub request_timeout_seconds: Option<u64>,
    pub extra_args: Vec<String>,
}

impl Default for ChromiumSection {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: true,
            sandbox: false,
            disable_gpu: true,
            request_timeout_seconds: Some(60),
            extra_args: vec![
                "--disable-web-security".into(),
                "--disable-features=IsolateOrigins,site-per-process".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UserAgentSection {
    pub pool: Vec<String>,
    pub accept_language: Option<String>,
}

impl Default for UserAgentSection {
    fn default() -> Self {
        Self {
            pool: vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36".into(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".into(),
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36".into(),
            ],
            accept_language: Some("pl-PL,pl;q=0.9,en-US;q=0.8,en;q=0.7".into()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ViewportSection {
    pub width: u32,
    pub height: u32,
}

impl Default for ViewportSection {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    pub navigation_seconds: u64,
    pub selector_seconds: u64,
    pub rows_seconds: u64,
    pub page_turn_seconds: u64,
    pub poll_interval_ms: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            navigation_seconds: 60,
            selector_seconds: 30,
            rows_seconds: 10,
            page_turn_seconds: 5,
            poll_interval_ms: 250,
        }
    }
}

impl TimeoutSection {
    pub fn navigation(&self) -> Duration {
        Duration::from_secs(self.navigation_seconds)
    }

    pub fn selector(&self) -> Duration {
        Duration::from_secs(self.selector_seconds)
    }

    pub fn rows(&self) -> Duration {
        Duration::from_secs(self.rows_seconds)
    }

    pub fn page_turn(&self) -> Duration {
        Duration::from_secs(self.page_turn_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub page_cooldown_ms: u64,
    pub failed_page_threshold: u32,
    pub relaunch_delay_ms: u64,
    pub max_session_rebuilds: u32,
    pub max_pages: u32,
    pub settle_delay_ms: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff_ms: 2000,
            page_cooldown_ms: 5000,
            failed_page_threshold: 3,
            relaunch_delay_ms: 5000,
            max_session_rebuilds: 5,
            max_pages: 1000,
            settle_delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetailSection {
    pub item_delay_ms: u64,
    pub start_delay_seconds: u64,
    pub max_passes: u32,
    pub max_consecutive_launch_failures: u32,
}

impl Default for DetailSection {
    fn default() -> Self {
        Self {
            item_delay_ms: 1000,
            start_delay_seconds: 30,
            max_passes: 3,
            max_consecutive_launch_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub path: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: "data/tenders.sqlite".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierSection {
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub max_input_chars: usize,
    pub system_prompt: String,
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.2,
            api_key_env: "OPENAI_API_KEY".into(),
            timeout_seconds: 120,
            max_input_chars: 120_000,
            system_prompt: String::new(),
        }
    }
}

pub fn load_crawler_config<P: AsRef<Path>>(path: P) -> Result<CrawlerConfig> {
    let path = path.as_ref();
    let mut config: CrawlerConfig = load_toml(path)?;
    config.base_dir = path.parent().map(Path::to_path_buf);
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/crawler.toml");
        let config = load_crawler_config(&path).expect("config should parse");
        assert_eq!(config.portal.keywords, vec!["microsoft", "license"]);
        assert_eq!(config.recovery.max_attempts, 3);
        assert_eq!(config.recovery.failed_page_threshold, 3);
        assert!(config.user_agents.pool.len() >= 2);
        assert!(config.store_path().ends_with("data/tenders.sqlite"));
        assert!(config.store_path().is_absolute());
        assert_eq!(config.correction.prompts.len(), 2);
        assert!(config.correction.validate().is_ok());
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config: CrawlerConfig = toml::from_str(
            r#"
            [portal]
            base_url = "https://portal.example/list"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.portal.origin, "browser");
        assert_eq!(config.timeouts.navigation(), Duration::from_secs(60));
        assert_eq!(config.viewport.width, 1920);
        assert_eq!(config.portal.selectors.rows, "tbody tr");
    }

    #[test]
    fn duplicate_prompt_names_rejected() {
        let mut config = CrawlerConfig::default();
        config.correction.prompts.push(PromptSection {
            name: "basic".into(),
            system_prompt: "again".into(),
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "correction.prompts.name",
                ..
            })
        ));
    }

    #[test]
    fn default_exclusion_matches_result_notices() {
        let pattern = regex::Regex::new(&CorrectionSection::default().exclude_title_pattern).unwrap();
        assert!(pattern.is_match("Ogłoszenie o wyniku postępowania"));
        assert!(pattern.is_match("ogłoszenie o  zmianie ogłoszenia"));
        assert!(!pattern.is_match("Ogłoszenie o zamówieniu: licencje Microsoft 365"));
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut config = CrawlerConfig::default();
        config.recovery.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "recovery.max_attempts",
                ..
            })
        ));
    }
}
