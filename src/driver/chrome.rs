//! Chromium-backed driver.
//!
//! One [`ChromeSession`] owns one Chromium process: the CDP websocket handler
//! runs on a background task for the life of the session, and every bot in
//! the pool gets its own isolated user-data directory. Result parsing runs as
//! a single injected script per page so the wire between Rust and the page
//! stays one JSON value.

use super::{
    Driver, DriverError, DriverSession, DriverTimeouts, PlaceRecord, ScrollProgress,
};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CaptureScreenshotParams,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SEARCH_BOX_SELECTOR: &str = "input#searchboxinput";
const SEARCH_BUTTON_SELECTOR: &str = "button#searchbox-searchbutton";
const RESULT_FEED_SELECTOR: &str = "div[role='feed']";
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Driver factory launching one Chromium per session.
pub struct ChromeDriver {
    headless: bool,
    timeouts: DriverTimeouts,
}

impl ChromeDriver {
    pub fn new(headless: bool) -> Self {
        ChromeDriver {
            headless,
            timeouts: DriverTimeouts::default(),
        }
    }

    /// Locate a Chrome/Chromium executable: `CHROMIUM_PATH` first, then the
    /// usual install locations, then `which`.
    fn find_executable() -> Result<PathBuf, DriverError> {
        if let Ok(path) = std::env::var("CHROMIUM_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(path);
            }
            warn!(path = %path.display(), "CHROMIUM_PATH points to a non-existent file");
        }

        let candidates: &[&str] = if cfg!(target_os = "macos") {
            &[
                "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
                "/Applications/Chromium.app/Contents/MacOS/Chromium",
                "/opt/homebrew/bin/chromium",
            ]
        } else {
            &[
                "/usr/bin/google-chrome",
                "/usr/bin/google-chrome-stable",
                "/usr/bin/chromium",
                "/usr/bin/chromium-browser",
                "/snap/bin/chromium",
                "/opt/google/chrome/chrome",
            ]
        };
        for candidate in candidates {
            let path = PathBuf::from(candidate);
            if path.exists() {
                return Ok(path);
            }
        }

        for name in ["chromium", "chromium-browser", "google-chrome", "chrome"] {
            if let Ok(output) = std::process::Command::new("which").arg(name).output() {
                if output.status.success() {
                    let found = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !found.is_empty() {
                        return Ok(PathBuf::from(found));
                    }
                }
            }
        }

        Err(DriverError::Permanent(
            "no Chrome/Chromium executable found (set CHROMIUM_PATH)".into(),
        ))
    }
}

#[async_trait]
impl Driver for ChromeDriver {
    async fn open(&self) -> Result<Box<dyn DriverSession>, DriverError> {
        let executable = Self::find_executable()?;
        let user_data_dir = std::env::temp_dir().join(format!(
            "placehound_chrome_{}_{}",
            std::process::id(),
            uuid::Uuid::now_v7().simple()
        ));
        std::fs::create_dir_all(&user_data_dir)
            .map_err(|e| DriverError::Transient(format!("cannot create profile dir: {e}")))?;

        let mut builder = BrowserConfigBuilder::default()
            .request_timeout(self.timeouts.navigate)
            .window_size(1280, 900)
            .user_data_dir(&user_data_dir)
            .chrome_executable(executable);
        builder = if self.headless {
            builder.headless_mode(HeadlessMode::default())
        } else {
            builder.with_head()
        };
        let config = builder
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-notifications")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--no-sandbox")
            .arg("--mute-audio")
            .arg("--hide-scrollbars")
            .arg("--disable-background-networking")
            .build()
            .map_err(DriverError::Permanent)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| DriverError::Transient(format!("browser launch failed: {e}")))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    // Chrome emits CDP events chromiumoxide cannot always
                    // deserialize; those are noise, the rest matter.
                    let message = e.to_string();
                    if message.contains("did not match any variant") {
                        debug!(error = %message, "ignoring CDP deserialization noise");
                    } else {
                        warn!(error = %message, "browser handler error");
                    }
                }
            }
            debug!("browser handler task finished");
        });

        info!(profile = %user_data_dir.display(), "chrome session opened");
        Ok(Box::new(ChromeSession {
            browser,
            handler: handler_task,
            page: None,
            user_data_dir,
        }))
    }
}

struct ChromeSession {
    browser: Browser,
    handler: JoinHandle<()>,
    page: Option<Page>,
    user_data_dir: PathBuf,
}

#[derive(Deserialize)]
struct ScrollEval {
    found: bool,
    end: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParsedListing {
    name: String,
    address: Option<String>,
    category: Option<String>,
    rating: Option<f64>,
    review_count: Option<i64>,
}

/// Classify a CDP error: a dead websocket means the session is gone, the
/// rest is retriable.
fn classify(err: impl std::fmt::Display) -> DriverError {
    let message = err.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("channel") || lowered.contains("connection") || lowered.contains("closed") {
        DriverError::Crashed(message)
    } else {
        DriverError::Transient(message)
    }
}

impl ChromeSession {
    fn page(&self) -> Result<&Page, DriverError> {
        self.page
            .as_ref()
            .ok_or_else(|| DriverError::Permanent("no page open; navigate first".into()))
    }

    async fn eval<T: serde::de::DeserializeOwned>(&self, script: &str) -> Result<T, DriverError> {
        let result = self.page()?.evaluate(script).await.map_err(classify)?;
        result
            .into_value::<T>()
            .map_err(|e| DriverError::Permanent(format!("unexpected page script result: {e}")))
    }
}

#[async_trait]
impl DriverSession for ChromeSession {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError> {
        match &self.page {
            None => {
                let page = self
                    .browser
                    .new_page(url)
                    .await
                    .map_err(classify)?;
                page.wait_for_navigation().await.map_err(classify)?;
                self.page = Some(page);
            }
            Some(page) => {
                page.goto(url).await.map_err(classify)?;
                page.wait_for_navigation().await.map_err(classify)?;
            }
        }
        Ok(())
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<(), DriverError> {
        let page = self.page()?.clone();
        let started = Instant::now();
        loop {
            if page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(DriverError::Transient(format!(
                    "timed out after {:?} waiting for {selector:?}",
                    timeout
                )));
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    async fn fill_query(&mut self, text: &str) -> Result<(), DriverError> {
        let quoted = serde_json::to_string(text)
            .map_err(|e| DriverError::Permanent(format!("query not encodable: {e}")))?;
        let script = format!(
            r#"(() => {{
                const box = document.querySelector("{SEARCH_BOX_SELECTOR}");
                if (!box) return false;
                box.value = {quoted};
                box.dispatchEvent(new Event('input', {{ bubbles: true }}));
                const button = document.querySelector("{SEARCH_BUTTON_SELECTOR}");
                if (button) {{ button.click(); }}
                else if (box.form) {{ box.form.submit(); }}
                return true;
            }})()"#
        );
        let filled: bool = self.eval(&script).await?;
        if !filled {
            return Err(DriverError::Permanent(format!(
                "search box {SEARCH_BOX_SELECTOR:?} not present on page"
            )));
        }
        Ok(())
    }

    async fn scroll_result_list(&mut self, max_scrolls: u32) -> Result<ScrollProgress, DriverError> {
        let script = format!(
            r#"(() => {{
                const feed = document.querySelector("{RESULT_FEED_SELECTOR}");
                if (!feed) return {{ found: false, end: false }};
                const before = feed.scrollTop;
                feed.scrollTop = feed.scrollHeight;
                return {{ found: true, end: feed.scrollTop === before }};
            }})()"#
        );
        for _ in 0..max_scrolls {
            let outcome: ScrollEval = self.eval(&script).await?;
            if !outcome.found {
                return Err(DriverError::Permanent(format!(
                    "result feed {RESULT_FEED_SELECTOR:?} not present on page"
                )));
            }
            if outcome.end {
                return Ok(ScrollProgress { reached_end: true });
            }
            // Let the lazy-loaded list grow before the next scroll.
            tokio::time::sleep(Duration::from_millis(400)).await;
        }
        Ok(ScrollProgress { reached_end: false })
    }

    async fn parse_results(&mut self, max_results: u32) -> Result<Vec<PlaceRecord>, DriverError> {
        let script = format!(
            r#"(() => {{
                const out = [];
                const seen = new Set();
                const links = document.querySelectorAll(
                    "{RESULT_FEED_SELECTOR} a[href*='/maps/place/']");
                for (const link of links) {{
                    if (out.length >= {max_results}) break;
                    const name = link.getAttribute('aria-label');
                    if (!name || seen.has(name)) continue;
                    seen.add(name);
                    const card = link.closest('div[jsaction]') || link.parentElement;
                    const text = card ? card.innerText : '';
                    const lines = text.split('\n').map(l => l.trim()).filter(Boolean);
                    let rating = null, reviewCount = null;
                    const ratingEl = card && card.querySelector("span[role='img']");
                    if (ratingEl) {{
                        const label = ratingEl.getAttribute('aria-label') || '';
                        const ratingMatch = label.match(/([0-9][.,][0-9])/);
                        if (ratingMatch) rating = parseFloat(ratingMatch[1].replace(',', '.'));
                        const countMatch = label.replace(/[.,](?=[0-9]{{3}})/g, '')
                            .match(/([0-9]+)\s/g);
                        if (countMatch && countMatch.length > 1)
                            reviewCount = parseInt(countMatch[countMatch.length - 1], 10);
                    }}
                    const detail = lines.find(l => l.includes(' · '));
                    let category = null, address = null;
                    if (detail) {{
                        const parts = detail.split(' · ').map(p => p.trim());
                        category = parts[0] || null;
                        address = parts[parts.length - 1] || null;
                    }}
                    out.push({{ name, address, category, rating, reviewCount }});
                }}
                return out;
            }})()"#
        );
        let listings: Vec<ParsedListing> = self.eval(&script).await?;
        Ok(listings
            .into_iter()
            .map(|listing| PlaceRecord {
                name: listing.name,
                address: listing.address.unwrap_or_default(),
                category: listing.category.unwrap_or_else(|| "point_of_interest".into()),
                rating: listing.rating,
                review_count: listing.review_count,
                phone: None,
                website: None,
                latitude: None,
                longitude: None,
                reviews: Vec::new(),
            })
            .collect())
    }

    async fn capture_image(&mut self) -> Result<Vec<u8>, DriverError> {
        let params = CaptureScreenshotParams {
            format: Some(CaptureScreenshotFormat::Png),
            ..Default::default()
        };
        self.page()?.screenshot(params).await.map_err(classify)
    }

    async fn current_url(&mut self) -> String {
        match &self.page {
            Some(page) => page.url().await.ok().flatten().unwrap_or_default(),
            None => String::new(),
        }
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        self.page = None;
        if let Err(e) = self.browser.close().await {
            warn!(error = %e, "browser close failed");
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
        if let Err(e) = std::fs::remove_dir_all(&self.user_data_dir) {
            debug!(error = %e, "could not remove profile dir");
        }
        Ok(())
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        self.handler.abort();
    }
}
