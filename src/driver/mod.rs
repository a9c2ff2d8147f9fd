//! Headless-browser capability port.
//!
//! One [`DriverSession`] is one browser context. The port exposes exactly the
//! capabilities the extraction pipeline needs: open, navigate, wait, fill,
//! scroll, parse, capture, close. Nothing driver-specific leaks through;
//! classifying a failure as transient or permanent is the implementation's
//! job.

mod chrome;
mod scripted;

pub use chrome::ChromeDriver;
pub use scripted::{ScriptedBehavior, ScriptedDriver};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Driver failure classes.
///
/// `Transient` is retriable (network hiccup, timeout), `Permanent` is not
/// (selector missing, page unrecognized), `Cancelled` is a cooperative abort,
/// and `Crashed` means the session itself is gone and must be replaced.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("transient driver failure: {0}")]
    Transient(String),
    #[error("permanent driver failure: {0}")]
    Permanent(String),
    #[error("driver operation cancelled")]
    Cancelled,
    #[error("driver session crashed: {0}")]
    Crashed(String),
}

/// A parsed review, as the driver sees it on the page.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewRecord {
    pub author: String,
    pub rating: f64,
    pub text: String,
    pub posted_at: Option<DateTime<Utc>>,
}

/// A parsed place listing, straight off the result list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlaceRecord {
    pub name: String,
    pub address: String,
    pub category: String,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub reviews: Vec<ReviewRecord>,
}

/// Whether the result list can still grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollProgress {
    pub reached_end: bool,
}

/// Per-capability timeout budget. A timeout raises `Transient`.
#[derive(Debug, Clone)]
pub struct DriverTimeouts {
    pub open: Duration,
    pub navigate: Duration,
    pub wait_for: Duration,
    pub scroll: Duration,
    pub parse: Duration,
    pub capture: Duration,
    pub close: Duration,
}

impl Default for DriverTimeouts {
    fn default() -> Self {
        DriverTimeouts {
            open: Duration::from_secs(45),
            navigate: Duration::from_secs(30),
            wait_for: Duration::from_secs(20),
            scroll: Duration::from_secs(15),
            parse: Duration::from_secs(10),
            capture: Duration::from_secs(5),
            close: Duration::from_secs(10),
        }
    }
}

/// Factory for browser sessions. The bot pool is the only caller.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn open(&self) -> Result<Box<dyn DriverSession>, DriverError>;
}

/// One headless-browser context.
#[async_trait]
pub trait DriverSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError>;

    /// Wait until `selector` matches, polling up to `timeout`.
    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<(), DriverError>;

    /// Type a query into the page's search box and submit it.
    async fn fill_query(&mut self, text: &str) -> Result<(), DriverError>;

    /// Scroll the result list `max_scrolls` times to load more entries.
    async fn scroll_result_list(&mut self, max_scrolls: u32) -> Result<ScrollProgress, DriverError>;

    /// Parse up to `max_results` place records off the current result list.
    async fn parse_results(&mut self, max_results: u32) -> Result<Vec<PlaceRecord>, DriverError>;

    /// Capture the current viewport as a PNG.
    async fn capture_image(&mut self) -> Result<Vec<u8>, DriverError>;

    /// Best-effort current URL for snapshot events.
    async fn current_url(&mut self) -> String;

    async fn close(&mut self) -> Result<(), DriverError>;
}
