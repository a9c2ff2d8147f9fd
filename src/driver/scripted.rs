//! Deterministic in-process driver.
//!
//! Backs the test suites and `--driver scripted` smoke runs. Behavior is
//! scripted per search seed (keyed by city name), so a test can make one
//! city succeed, another fail permanently, and a third crash its session,
//! all without a browser.

use super::{
    Driver, DriverError, DriverSession, PlaceRecord, ReviewRecord, ScrollProgress,
};
use async_trait::async_trait;
use chrono::TimeZone;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A valid 1x1 transparent PNG, served as every scripted screenshot.
const PIXEL_PNG: [u8; 67] = [
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

/// What a scripted session does for a given search seed.
#[derive(Debug, Clone)]
pub enum ScriptedBehavior {
    /// Parse `places` records on every attempt.
    Succeed { places: u32 },
    /// Fail `failures` attempts with Transient, then succeed.
    TransientFailures { failures: u32, places: u32 },
    /// Fail every attempt with Permanent.
    Permanent { message: String },
    /// Crash the session on the first attempt, succeed after replacement.
    CrashOnce { places: u32 },
    /// Crash the session on every attempt.
    AlwaysCrash,
}

struct Inner {
    behaviors: Mutex<HashMap<String, ScriptedBehavior>>,
    attempts: Mutex<HashMap<String, u32>>,
    default_places: u32,
    fail_first_opens: AtomicU32,
    open_budget: Mutex<Option<u32>>,
    opened: AtomicU32,
    closed: AtomicU32,
    step_delay: Duration,
}

/// Deterministic driver factory. Cloneable handle around shared scripting
/// state, so a test can keep one handle and give the pool another.
#[derive(Clone)]
pub struct ScriptedDriver {
    inner: Arc<Inner>,
}

impl ScriptedDriver {
    pub fn new(default_places: u32) -> Self {
        ScriptedDriver {
            inner: Arc::new(Inner {
                behaviors: Mutex::new(HashMap::new()),
                attempts: Mutex::new(HashMap::new()),
                default_places,
                fail_first_opens: AtomicU32::new(0),
                open_budget: Mutex::new(None),
                opened: AtomicU32::new(0),
                closed: AtomicU32::new(0),
                step_delay: Duration::ZERO,
            }),
        }
    }

    /// Insert an artificial pause at every capability call, for tests that
    /// need to interleave cancellation with driver steps.
    pub fn with_step_delay(self, delay: Duration) -> Self {
        let inner = Arc::try_unwrap(self.inner).unwrap_or_else(|arc| Inner {
            behaviors: Mutex::new(arc.behaviors.lock().unwrap().clone()),
            attempts: Mutex::new(arc.attempts.lock().unwrap().clone()),
            default_places: arc.default_places,
            fail_first_opens: AtomicU32::new(arc.fail_first_opens.load(Ordering::Relaxed)),
            open_budget: Mutex::new(*arc.open_budget.lock().unwrap()),
            opened: AtomicU32::new(arc.opened.load(Ordering::Relaxed)),
            closed: AtomicU32::new(arc.closed.load(Ordering::Relaxed)),
            step_delay: arc.step_delay,
        });
        ScriptedDriver {
            inner: Arc::new(Inner {
                step_delay: delay,
                ..inner
            }),
        }
    }

    /// Script the behavior for any seed containing `key`.
    pub fn set_behavior(&self, key: &str, behavior: ScriptedBehavior) {
        self.inner
            .behaviors
            .lock()
            .unwrap()
            .insert(key.to_string(), behavior);
    }

    /// Make the first `n` `open()` calls fail with Transient, then recover.
    pub fn fail_first_opens(&self, n: u32) {
        self.inner.fail_first_opens.store(n, Ordering::Relaxed);
    }

    /// Cap the number of successful `open()` calls; later opens fail. Used to
    /// exhaust pool replacement.
    pub fn limit_opens(&self, budget: u32) {
        *self.inner.open_budget.lock().unwrap() = Some(budget);
    }

    pub fn opened(&self) -> u32 {
        self.inner.opened.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> u32 {
        self.inner.closed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn open(&self) -> Result<Box<dyn DriverSession>, DriverError> {
        tokio::time::sleep(self.inner.step_delay).await;
        let remaining = self.inner.fail_first_opens.load(Ordering::Relaxed);
        if remaining > 0 {
            self.inner
                .fail_first_opens
                .store(remaining - 1, Ordering::Relaxed);
            return Err(DriverError::Transient("scripted open failure".into()));
        }
        {
            let budget = self.inner.open_budget.lock().unwrap();
            if let Some(limit) = *budget {
                if self.inner.opened.load(Ordering::Relaxed) >= limit {
                    return Err(DriverError::Transient("scripted open budget exhausted".into()));
                }
            }
        }
        self.inner.opened.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(ScriptedSession {
            inner: Arc::clone(&self.inner),
            url: String::new(),
            query: String::new(),
            crashed: false,
        }))
    }
}

struct ScriptedSession {
    inner: Arc<Inner>,
    url: String,
    query: String,
    crashed: bool,
}

impl ScriptedSession {
    fn behavior(&self) -> (String, ScriptedBehavior) {
        let behaviors = self.inner.behaviors.lock().unwrap();
        for (key, behavior) in behaviors.iter() {
            if self.query.contains(key.as_str()) || self.url.contains(key.as_str()) {
                return (key.clone(), behavior.clone());
            }
        }
        (
            "default".to_string(),
            ScriptedBehavior::Succeed {
                places: self.inner.default_places,
            },
        )
    }

    fn attempt(&self, key: &str) -> u32 {
        *self.inner.attempts.lock().unwrap().get(key).unwrap_or(&0)
    }

    fn bump_attempt(&self, key: &str) -> u32 {
        let mut attempts = self.inner.attempts.lock().unwrap();
        let counter = attempts.entry(key.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    fn guard(&self) -> Result<(), DriverError> {
        if self.crashed {
            return Err(DriverError::Crashed("scripted session is dead".into()));
        }
        Ok(())
    }

    fn records(&self, key: &str, count: u32, max_results: u32) -> Vec<PlaceRecord> {
        let city = if key == "default" { "Testville" } else { key };
        let n = count.min(max_results);
        (1..=n)
            .map(|i| PlaceRecord {
                name: format!("{} spot {}", self.query.trim(), i),
                address: format!("{} High Street, {}", i, city),
                category: "point_of_interest".into(),
                rating: Some(3.0 + f64::from(i % 20) / 10.0),
                review_count: Some(i64::from(i) * 7),
                phone: (i % 2 == 1).then(|| format!("+34 600 000 {:03}", i)),
                website: (i % 2 == 0).then(|| format!("https://spot-{i}.example.com")),
                latitude: Some(40.0 + f64::from(i) / 1000.0),
                longitude: Some(-3.7 - f64::from(i) / 1000.0),
                reviews: if i % 3 == 0 {
                    vec![ReviewRecord {
                        author: format!("reviewer-{i}"),
                        rating: 4.0,
                        text: "solid choice".into(),
                        posted_at: Some(chrono::Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()),
                    }]
                } else {
                    Vec::new()
                },
            })
            .collect()
    }
}

#[async_trait]
impl DriverSession for ScriptedSession {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError> {
        tokio::time::sleep(self.inner.step_delay).await;
        self.guard()?;
        self.url = url.to_string();
        Ok(())
    }

    async fn wait_for(&mut self, _selector: &str, _timeout: Duration) -> Result<(), DriverError> {
        tokio::time::sleep(self.inner.step_delay).await;
        self.guard()?;
        let (_, behavior) = self.behavior();
        if let ScriptedBehavior::Permanent { message } = behavior {
            return Err(DriverError::Permanent(message));
        }
        Ok(())
    }

    async fn fill_query(&mut self, text: &str) -> Result<(), DriverError> {
        tokio::time::sleep(self.inner.step_delay).await;
        self.guard()?;
        self.query = text.to_string();
        let (key, _) = self.behavior();
        self.bump_attempt(&key);
        Ok(())
    }

    async fn scroll_result_list(&mut self, _max_scrolls: u32) -> Result<ScrollProgress, DriverError> {
        tokio::time::sleep(self.inner.step_delay).await;
        self.guard()?;
        let (key, behavior) = self.behavior();
        match behavior {
            ScriptedBehavior::CrashOnce { .. } if self.attempt(&key) == 1 => {
                self.crashed = true;
                Err(DriverError::Crashed("scripted crash".into()))
            }
            ScriptedBehavior::AlwaysCrash => {
                self.crashed = true;
                Err(DriverError::Crashed("scripted crash".into()))
            }
            _ => Ok(ScrollProgress { reached_end: true }),
        }
    }

    async fn parse_results(&mut self, max_results: u32) -> Result<Vec<PlaceRecord>, DriverError> {
        tokio::time::sleep(self.inner.step_delay).await;
        self.guard()?;
        let (key, behavior) = self.behavior();
        match behavior {
            ScriptedBehavior::Succeed { places } => Ok(self.records(&key, places, max_results)),
            ScriptedBehavior::TransientFailures { failures, places } => {
                if self.attempt(&key) <= failures {
                    Err(DriverError::Transient("scripted transient parse failure".into()))
                } else {
                    Ok(self.records(&key, places, max_results))
                }
            }
            ScriptedBehavior::CrashOnce { places } => Ok(self.records(&key, places, max_results)),
            ScriptedBehavior::Permanent { message } => Err(DriverError::Permanent(message)),
            ScriptedBehavior::AlwaysCrash => {
                self.crashed = true;
                Err(DriverError::Crashed("scripted crash".into()))
            }
        }
    }

    async fn capture_image(&mut self) -> Result<Vec<u8>, DriverError> {
        tokio::time::sleep(self.inner.step_delay).await;
        self.guard()?;
        Ok(PIXEL_PNG.to_vec())
    }

    async fn current_url(&mut self) -> String {
        self.url.clone()
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        self.inner.closed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
