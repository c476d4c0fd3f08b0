#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use tender_core::browser::{
    BrowserDriver, BrowserError, BrowserHandle, BrowserResult, ControlState, PageDriver,
};
use tender_core::classifier::{Classification, Classifier, ClassifierError};
use tender_core::config::{CrawlerConfig, SelectorSection};
use tender_core::tenders::{ListingDraft, SqliteTenderStore};

pub const PORTAL_URL: &str = "https://portal.example/list";

pub fn test_config(store: &Path) -> CrawlerConfig {
    let mut config = CrawlerConfig::default();
    config.portal.base_url = PORTAL_URL.into();
    config.portal.keywords = vec!["microsoft".into()];
    config.store.path = store.display().to_string();
    config.recovery.retry_backoff_ms = 10;
    config.recovery.page_cooldown_ms = 50;
    config.recovery.relaunch_delay_ms = 100;
    config.recovery.settle_delay_ms = 0;
    config.detail.item_delay_ms = 10;
    config
}

pub fn open_store(dir: &Path) -> SqliteTenderStore {
    let store = SqliteTenderStore::new(dir.join("tenders.sqlite")).unwrap();
    store.initialize().unwrap();
    store
}

pub fn rows(page: usize, count: usize) -> Vec<ListingDraft> {
    (1..=count)
        .map(|row| {
            let number = format!("2024/BZP-{page:02}{row:02}");
            ListingDraft {
                title: format!("Dostawa licencji {page}-{row}"),
                link: format!("https://portal.example/notice/{number}"),
                number,
                status: "Ogłoszone".into(),
                publication_date: Some("2024-05-01".into()),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Soft,
    Fatal,
}

#[derive(Debug, Clone)]
pub enum DetailPage {
    Text(String),
    Status(u16),
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRecord {
    pub page: usize,
    pub advances_since_search: usize,
}

#[derive(Debug, Default)]
struct PortalState {
    pages: Vec<Vec<ListingDraft>>,
    /// Result set that replaces `pages` once the given search is submitted.
    reshape: Option<(usize, Vec<Vec<ListingDraft>>)>,
    scan_faults: HashMap<usize, VecDeque<Fault>>,
    /// Keyed by the 1-based number of the "next" click.
    advance_faults: HashMap<usize, Fault>,
    turn_delays: HashMap<usize, Duration>,
    navigations_before_failure: usize,
    failing_navigations: usize,
    details: HashMap<String, DetailPage>,
    launches_before_failure: usize,
    failing_launches: usize,
    launches: usize,
    pages_opened: usize,
    searches: usize,
    advances: usize,
    advances_since_search: usize,
    scans: Vec<ScanRecord>,
    visits: Vec<String>,
}

/// In-memory portal with a paginated result table and detail pages.
#[derive(Clone, Default)]
pub struct Portal {
    state: Arc<Mutex<PortalState>>,
    selectors: SelectorSection,
}

impl Portal {
    pub fn with_pages(pages: Vec<Vec<ListingDraft>>) -> Self {
        let portal = Self::default();
        portal.state.lock().unwrap().pages = pages;
        portal
    }

    pub fn uniform(pages: usize, per_page: usize) -> Self {
        Self::with_pages((1..=pages).map(|page| rows(page, per_page)).collect())
    }

    pub fn driver(&self) -> Arc<dyn BrowserDriver> {
        Arc::new(self.clone())
    }

    /// Queues faults returned by successive scans of `page` (1-based).
    pub fn fail_scan(&self, page: usize, faults: &[Fault]) {
        self.state
            .lock()
            .unwrap()
            .scan_faults
            .entry(page)
            .or_default()
            .extend(faults.iter().copied());
    }

    /// Makes the `advance`-th "next" click fail instead of turning the page.
    pub fn fail_advance(&self, advance: usize, fault: Fault) {
        self.state
            .lock()
            .unwrap()
            .advance_faults
            .insert(advance, fault);
    }

    /// The `advance`-th "next" click turns the page only after `delay`.
    pub fn delay_turn(&self, advance: usize, delay: Duration) {
        self.state.lock().unwrap().turn_delays.insert(advance, delay);
    }

    /// Swaps the result set when the `search`-th search is submitted.
    pub fn reshape_after_search(&self, search: usize, pages: Vec<Vec<ListingDraft>>) {
        self.state.lock().unwrap().reshape = Some((search, pages));
    }

    /// Lets `successes` portal navigations through, then answers the next
    /// `count` with HTTP 503.
    pub fn fail_navigations_after(&self, successes: usize, count: usize) {
        let mut state = self.state.lock().unwrap();
        state.navigations_before_failure = successes;
        state.failing_navigations = count;
    }

    pub fn fail_launches(&self, count: usize) {
        self.fail_launches_after(0, count);
    }

    /// Lets `successes` launches through, then fails the next `count`.
    pub fn fail_launches_after(&self, successes: usize, count: usize) {
        let mut state = self.state.lock().unwrap();
        state.launches_before_failure = successes;
        state.failing_launches = count;
    }

    pub fn set_detail(&self, link: &str, page: DetailPage) {
        self.state
            .lock()
            .unwrap()
            .details
            .insert(link.to_string(), page);
    }

    pub fn launches(&self) -> usize {
        self.state.lock().unwrap().launches
    }

    pub fn pages_opened(&self) -> usize {
        self.state.lock().unwrap().pages_opened
    }

    pub fn searches(&self) -> usize {
        self.state.lock().unwrap().searches
    }

    pub fn advances(&self) -> usize {
        self.state.lock().unwrap().advances
    }

    pub fn scans(&self) -> Vec<ScanRecord> {
        self.state.lock().unwrap().scans.clone()
    }

    pub fn visits(&self) -> Vec<String> {
        self.state.lock().unwrap().visits.clone()
    }
}

#[async_trait]
impl BrowserDriver for Portal {
    async fn launch(&self) -> BrowserResult<Box<dyn BrowserHandle>> {
        let mut state = self.state.lock().unwrap();
        if state.launches_before_failure > 0 {
            state.launches_before_failure -= 1;
        } else if state.failing_launches > 0 {
            state.failing_launches -= 1;
            return Err(BrowserError::Launch("chromium exited early".into()));
        }
        state.launches += 1;
        Ok(Box::new(MockBrowser {
            portal: self.clone(),
        }))
    }
}

struct MockBrowser {
    portal: Portal,
}

#[async_trait]
impl BrowserHandle for MockBrowser {
    async fn new_page(&mut self) -> BrowserResult<Box<dyn PageDriver>> {
        self.portal.state.lock().unwrap().pages_opened += 1;
        Ok(Box::new(MockPage {
            portal: self.portal.clone(),
            tab: Mutex::new(Tab {
                alive: true,
                ..Tab::default()
            }),
        }))
    }

    async fn close(self: Box<Self>) -> BrowserResult<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Tab {
    alive: bool,
    url: String,
    /// 0 until a search is submitted.
    current: usize,
    /// A "next" click the portal has not rendered yet.
    pending_turn: Option<Instant>,
}

struct MockPage {
    portal: Portal,
    tab: Mutex<Tab>,
}

fn target_closed() -> BrowserError {
    BrowserError::Unexpected("Protocol error (Runtime.evaluate): Target closed.".into())
}

impl MockPage {
    fn live(&self) -> BrowserResult<std::sync::MutexGuard<'_, Tab>> {
        let mut tab = self.tab.lock().unwrap();
        if !tab.alive {
            return Err(target_closed());
        }
        if tab.pending_turn.is_some_and(|at| Instant::now() >= at) {
            tab.pending_turn = None;
            let total = self.portal.state.lock().unwrap().pages.len();
            if tab.current < total {
                tab.current += 1;
            }
        }
        Ok(tab)
    }

    fn current_rows(&self, current: usize) -> Vec<ListingDraft> {
        let state = self.portal.state.lock().unwrap();
        current
            .checked_sub(1)
            .and_then(|index| state.pages.get(index))
            .cloned()
            .unwrap_or_default()
    }

    fn selectors(&self) -> &SelectorSection {
        &self.portal.selectors
    }
}

#[async_trait]
impl PageDriver for MockPage {
    async fn goto(&self, url: &str, _timeout: Duration) -> BrowserResult<Option<u16>> {
        let mut tab = self.live()?;
        tab.url = url.to_string();
        tab.current = 0;
        tab.pending_turn = None;
        let mut state = self.portal.state.lock().unwrap();
        if url == PORTAL_URL {
            if state.navigations_before_failure > 0 {
                state.navigations_before_failure -= 1;
            } else if state.failing_navigations > 0 {
                state.failing_navigations -= 1;
                return Ok(Some(503));
            }
            return Ok(Some(200));
        }
        state.visits.push(url.to_string());
        match state.details.get(url) {
            Some(DetailPage::Status(status)) => Ok(Some(*status)),
            Some(DetailPage::Fatal) => {
                tab.alive = false;
                Err(target_closed())
            }
            Some(DetailPage::Text(_)) => Ok(Some(200)),
            None => Ok(Some(404)),
        }
    }

    async fn wait_for_selector(&self, selector: &str, _timeout: Duration) -> BrowserResult<()> {
        let current = self.live()?.current;
        if selector == self.selectors().rows && self.current_rows(current).is_empty() {
            return Err(BrowserError::Timeout(selector.to_string()));
        }
        Ok(())
    }

    async fn type_text(&self, _selector: &str, _text: &str) -> BrowserResult<()> {
        self.live()?;
        Ok(())
    }

    async fn click(&self, selector: &str) -> BrowserResult<()> {
        let mut tab = self.live()?;
        let mut state = self.portal.state.lock().unwrap();
        if selector == self.selectors().search_button {
            tab.current = 1;
            tab.pending_turn = None;
            state.searches += 1;
            state.advances_since_search = 0;
            let searches = state.searches;
            if state.reshape.as_ref().is_some_and(|(at, _)| *at == searches) {
                if let Some((_, pages)) = state.reshape.take() {
                    state.pages = pages;
                }
            }
        } else if selector == self.selectors().next_button {
            let click = state.advances + 1;
            match state.advance_faults.remove(&click) {
                Some(Fault::Fatal) => {
                    tab.alive = false;
                    return Err(target_closed());
                }
                Some(Fault::Soft) => {
                    return Err(BrowserError::Timeout("next button".into()));
                }
                None => {}
            }
            state.advances += 1;
            state.advances_since_search += 1;
            if let Some(delay) = state.turn_delays.remove(&click) {
                tab.pending_turn = Some(Instant::now() + delay);
            } else if tab.current < state.pages.len() {
                tab.current += 1;
            }
        }
        Ok(())
    }

    async fn count(&self, selector: &str) -> BrowserResult<usize> {
        let current = self.live()?.current;
        if selector == self.selectors().rows {
            Ok(self.current_rows(current).len())
        } else {
            Ok(usize::from(current > 0))
        }
    }

    async fn inner_html(&self, selector: &str) -> BrowserResult<Option<String>> {
        let current = self.live()?.current;
        if selector == self.selectors().row_body && current > 0 {
            Ok(Some(format!("<tr data-page=\"{current}\"></tr>")))
        } else {
            Ok(None)
        }
    }

    async fn text_content(&self, selector: &str) -> BrowserResult<Option<String>> {
        let current = self.live()?.current;
        if selector == self.selectors().range_label && current > 0 {
            let total = self.portal.state.lock().unwrap().pages.len();
            Ok(Some(format!("strona {current} z {total}")))
        } else {
            Ok(None)
        }
    }

    async fn extract_rows(&self, _row_selector: &str) -> BrowserResult<Vec<ListingDraft>> {
        let mut tab = self.live()?;
        let current = tab.current;
        let mut state = self.portal.state.lock().unwrap();
        let fault = state
            .scan_faults
            .get_mut(&current)
            .and_then(|queue| queue.pop_front());
        match fault {
            Some(Fault::Fatal) => {
                tab.alive = false;
                return Err(target_closed());
            }
            Some(Fault::Soft) => {
                return Err(BrowserError::Timeout("tbody tr".into()));
            }
            None => {}
        }
        let advances_since_search = state.advances_since_search;
        state.scans.push(ScanRecord {
            page: current,
            advances_since_search,
        });
        Ok(current
            .checked_sub(1)
            .and_then(|index| state.pages.get(index))
            .cloned()
            .unwrap_or_default())
    }

    async fn control_state(&self, selector: &str) -> BrowserResult<Option<ControlState>> {
        let current = self.live()?.current;
        if selector != self.selectors().next_button || current == 0 {
            return Ok(None);
        }
        let total = self.portal.state.lock().unwrap().pages.len();
        Ok(Some(ControlState {
            text: "Następna".into(),
            disabled: current >= total,
        }))
    }

    async fn page_text(&self) -> BrowserResult<String> {
        let tab = self.live()?;
        let state = self.portal.state.lock().unwrap();
        match state.details.get(&tab.url) {
            Some(DetailPage::Text(text)) => Ok(text.clone()),
            _ => Ok(String::new()),
        }
    }

    async fn is_alive(&self) -> bool {
        self.tab.lock().unwrap().alive
    }

    async fn close(self: Box<Self>) -> BrowserResult<()> {
        Ok(())
    }
}

/// Qualifies any text mentioning Microsoft; texts containing "unavailable"
/// make the service fail.
#[derive(Default)]
pub struct KeywordClassifier {
    calls: Mutex<usize>,
    prompts: Mutex<Vec<String>>,
}

impl KeywordClassifier {
    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }

    /// System prompts passed to `classify_with`, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, ClassifierError> {
        self.classify_with("default", text).await
    }

    async fn classify_with(
        &self,
        system_prompt: &str,
        text: &str,
    ) -> Result<Classification, ClassifierError> {
        *self.calls.lock().unwrap() += 1;
        self.prompts.lock().unwrap().push(system_prompt.to_string());
        if text.contains("unavailable") {
            return Err(ClassifierError::Status {
                status: 503,
                body: "upstream unavailable".into(),
            });
        }
        let qualifies = text.to_lowercase().contains("microsoft");
        Ok(Classification {
            qualifies,
            message: Some(if qualifies { "licencje Microsoft" } else { "inne" }.into()),
            products: if qualifies {
                vec!["Microsoft 365".into()]
            } else {
                Vec::new()
            },
            ..Classification::default()
        })
    }
}
