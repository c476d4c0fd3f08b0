use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::{ChromiumSection, CrawlerConfig, UserAgentSection, ViewportSection};
use crate::tenders::ListingDraft;

use super::driver::{BrowserDriver, BrowserHandle, ControlState, PageDriver};
use super::error::{BrowserError, BrowserResult};

const FALLBACK_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";

const NAVIGATION_STATUS_SCRIPT: &str = r#"
    const entry = performance.getEntriesByType('navigation')[0];
    return entry && entry.responseStatus ? entry.responseStatus : 0;
"#;

const ROWS_SCRIPT: &str = r#"
    return Array.from(document.querySelectorAll(__SELECTOR__)).map((row) => {
        const cells = Array.from(row.querySelectorAll('td'));
        const text = (cell) => (cell && cell.textContent ? cell.textContent.trim() : '');
        const anchor = row.querySelector('a');
        const date = text(cells[3]);
        return {
            title: text(cells[0]),
            number: text(cells[1]),
            status: text(cells[2]),
            publication_date: date.length ? date : null,
            link: anchor && anchor.href ? anchor.href : '',
        };
    });
"#;

// Styled buttons are often disabled by class only, with no `disabled`
// property set.
const CONTROL_SCRIPT: &str = r#"
    const el = document.querySelector(__SELECTOR__);
    if (!el) return null;
    const disabled = !!el.disabled
        || el.hasAttribute('disabled')
        || el.classList.contains('disabled')
        || el.getAttribute('aria-disabled') === 'true';
    return { text: (el.textContent || '').trim(), disabled };
"#;

/// Launches Chromium over CDP with a user agent drawn from the configured
/// pool on every launch.
#[derive(Debug, Clone)]
pub struct ChromiumDriver {
    chromium: ChromiumSection,
    user_agents: UserAgentSection,
    viewport: ViewportSection,
    poll_interval: Duration,
}

impl ChromiumDriver {
    pub fn new(config: &CrawlerConfig) -> Self {
        Self {
            chromium: config.chromium.clone(),
            user_agents: config.user_agents.clone(),
            viewport: config.viewport.clone(),
            poll_interval: config.timeouts.poll_interval(),
        }
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.chromium.headless = headless;
        self
    }

    fn select_user_agent(&self) -> String {
        let mut rng = rand::thread_rng();
        self.user_agents
            .pool
            .choose(&mut rng)
            .cloned()
            .unwrap_or_else(|| FALLBACK_USER_AGENT.to_string())
    }

    fn build_chromium_config(&self, user_agent: &str) -> BrowserResult<ChromiumConfig> {
        let mut builder = ChromiumConfig::builder().viewport(ChromiumViewport {
            width: self.viewport.width,
            height: self.viewport.height,
            device_scale_factor: None,
            emulating_mobile: false,
            is_landscape: self.viewport.width >= self.viewport.height,
            has_touch: false,
        });

        if let Some(path) = &self.chromium.executable_path {
            builder = builder.chrome_executable(path);
        }
        if !self.chromium.headless {
            builder = builder.with_head();
        }
        if !self.chromium.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(seconds) = self.chromium.request_timeout_seconds {
            builder = builder.request_timeout(Duration::from_secs(seconds));
        }

        let mut args = vec![
            format!("--user-agent={user_agent}"),
            format!(
                "--window-size={},{}",
                self.viewport.width, self.viewport.height
            ),
        ];
        if self.chromium.disable_gpu {
            args.push("--disable-gpu".into());
        }
        if let Some(accept) = &self.user_agents.accept_language {
            args.push(format!("--accept-lang={accept}"));
        }
        args.extend(self.chromium.extra_args.iter().cloned());
        builder = builder.args(args);

        builder.build().map_err(BrowserError::Configuration)
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn launch(&self) -> BrowserResult<Box<dyn BrowserHandle>> {
        let user_agent = self.select_user_agent();
        let config = self.build_chromium_config(&user_agent)?;
        info!(
            ua = %user_agent,
            width = self.viewport.width,
            height = self.viewport.height,
            headless = self.chromium.headless,
            "launching chromium instance"
        );

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        Ok(Box::new(ChromiumBrowser {
            browser,
            handler_task: Some(handler_task),
            user_agent,
            accept_language: self.user_agents.accept_language.clone(),
            poll_interval: self.poll_interval,
        }))
    }
}

pub struct ChromiumBrowser {
    browser: Browser,
    handler_task: Option<JoinHandle<()>>,
    user_agent: String,
    accept_language: Option<String>,
    poll_interval: Duration,
}

#[async_trait]
impl BrowserHandle for ChromiumBrowser {
    async fn new_page(&mut self) -> BrowserResult<Box<dyn PageDriver>> {
        let page = self
            .browser
            .new_page(CreateTargetParams::new("about:blank"))
            .await?;
        let mut params = SetUserAgentOverrideParams::builder().user_agent(self.user_agent.clone());
        if let Some(accept) = &self.accept_language {
            params = params.accept_language(accept.clone());
        }
        page.set_user_agent(params.build().map_err(BrowserError::Configuration)?)
            .await?;
        Ok(Box::new(ChromiumPage {
            page,
            poll_interval: self.poll_interval,
        }))
    }

    async fn close(mut self: Box<Self>) -> BrowserResult<()> {
        let closed = self.browser.close().await;
        if let Some(mut handle) = self.handler_task.take() {
            match timeout(Duration::from_secs(5), &mut handle).await {
                Ok(Err(err)) => warn!(error = %err, "browser handler join error"),
                Ok(Ok(())) => {}
                Err(_) => handle.abort(),
            }
        }
        closed?;
        Ok(())
    }
}

impl Drop for ChromiumBrowser {
    fn drop(&mut self) {
        if let Some(handle) = self.handler_task.take() {
            if !handle.is_finished() {
                warn!("chromium browser dropped without explicit close");
                handle.abort();
            }
        }
    }
}

pub struct ChromiumPage {
    page: Page,
    poll_interval: Duration,
}

impl ChromiumPage {
    /// Runs `body` as a function body and decodes its JSON-serialized return
    /// value, so `null` results survive the CDP round-trip.
    async fn eval<T: DeserializeOwned>(&self, body: &str) -> BrowserResult<T> {
        let script = format!("JSON.stringify((() => {{ {body} }})())");
        let encoded: String = self
            .page
            .evaluate(script)
            .await?
            .into_value()
            .map_err(|err| BrowserError::Extraction(err.to_string()))?;
        Ok(serde_json::from_str(&encoded)?)
    }
}

fn quote(selector: &str) -> BrowserResult<String> {
    Ok(serde_json::to_string(selector)?)
}

#[async_trait]
impl PageDriver for ChromiumPage {
    async fn goto(&self, url: &str, limit: Duration) -> BrowserResult<Option<u16>> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::Configuration)?;
        let navigation = async {
            self.page.goto(params).await?;
            self.page.wait_for_navigation().await?;
            self.eval::<u16>(NAVIGATION_STATUS_SCRIPT).await
        };
        let status = timeout(limit, navigation)
            .await
            .map_err(|_| BrowserError::Timeout(format!("navigation to {url}")))??;
        Ok((status != 0).then_some(status))
    }

    async fn wait_for_selector(&self, selector: &str, limit: Duration) -> BrowserResult<()> {
        let deadline = Instant::now() + limit;
        loop {
            if self.count(selector).await? > 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::Timeout(selector.to_string()));
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn type_text(&self, selector: &str, text: &str) -> BrowserResult<()> {
        self.page
            .find_element(selector)
            .await?
            .click()
            .await?
            .type_str(text)
            .await?;
        Ok(())
    }

    async fn click(&self, selector: &str) -> BrowserResult<()> {
        self.page.find_element(selector).await?.click().await?;
        Ok(())
    }

    async fn count(&self, selector: &str) -> BrowserResult<usize> {
        let body = format!(
            "return document.querySelectorAll({}).length;",
            quote(selector)?
        );
        self.eval(&body).await
    }

    async fn inner_html(&self, selector: &str) -> BrowserResult<Option<String>> {
        let body = format!(
            "const el = document.querySelector({}); return el ? el.innerHTML : null;",
            quote(selector)?
        );
        self.eval(&body).await
    }

    async fn text_content(&self, selector: &str) -> BrowserResult<Option<String>> {
        let body = format!(
            "const el = document.querySelector({}); return el ? el.textContent.trim() : null;",
            quote(selector)?
        );
        self.eval(&body).await
    }

    async fn extract_rows(&self, row_selector: &str) -> BrowserResult<Vec<ListingDraft>> {
        let body = ROWS_SCRIPT.replace("__SELECTOR__", &quote(row_selector)?);
        self.eval(&body).await
    }

    async fn control_state(&self, selector: &str) -> BrowserResult<Option<ControlState>> {
        let body = CONTROL_SCRIPT.replace("__SELECTOR__", &quote(selector)?);
        self.eval(&body).await
    }

    async fn page_text(&self) -> BrowserResult<String> {
        self.eval("return document.documentElement.innerText || '';")
            .await
    }

    async fn is_alive(&self) -> bool {
        matches!(
            timeout(Duration::from_secs(2), self.eval::<u8>("return 1;")).await,
            Ok(Ok(1))
        )
    }

    async fn close(self: Box<Self>) -> BrowserResult<()> {
        self.page.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_script_treats_disabled_class_as_disabled() {
        let body = CONTROL_SCRIPT.replace("__SELECTOR__", &quote(".append-arrow").unwrap());
        assert!(body.contains(r#"document.querySelector(".append-arrow")"#));
        assert!(body.contains("el.classList.contains('disabled')"));
        assert!(body.contains("el.hasAttribute('disabled')"));
        assert!(!body.contains("__SELECTOR__"));
    }
}
