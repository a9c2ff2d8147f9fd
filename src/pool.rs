//! Bounded pool of driver-backed bots.
//!
//! The pool owns every driver session in the process; no other component
//! calls a driver directly. `free + in_use = total` at every scheduler-visible
//! moment (total dips only transiently inside `replace`), acquisition is
//! fair FIFO, and `drain` is idempotent.

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::events::{DomainEvent, EventBus};
use crate::ids::CampaignId;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Attempts per session open before giving up.
const OPEN_RETRY_BUDGET: u32 = 3;
/// Base delay for exponential backoff between open attempts.
const OPEN_BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Ceiling on one driver `open()` call.
const OPEN_TIMEOUT: Duration = Duration::from_secs(45);
/// Ceiling on one driver `close()` call.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// One driver session checked out of or parked in the pool.
pub struct Bot {
    pub id: u32,
    pub session: Box<dyn crate::driver::DriverSession>,
}

impl std::fmt::Debug for Bot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bot").field("id", &self.id).finish()
    }
}

/// Scheduler-visible pool census, served by `get_bot_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub free: usize,
    pub in_use: usize,
}

pub struct BotPool {
    driver: Arc<dyn Driver>,
    bus: Arc<EventBus>,
    campaign_id: CampaignId,
    free: Mutex<VecDeque<Bot>>,
    permits: Arc<Semaphore>,
    total: AtomicUsize,
    in_use: AtomicUsize,
    next_bot_id: AtomicU32,
    draining: AtomicBool,
}

impl BotPool {
    pub fn new(driver: Arc<dyn Driver>, bus: Arc<EventBus>, campaign_id: CampaignId) -> Self {
        BotPool {
            driver,
            bus,
            campaign_id,
            free: Mutex::new(VecDeque::new()),
            permits: Arc::new(Semaphore::new(0)),
            total: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            next_bot_id: AtomicU32::new(0),
            draining: AtomicBool::new(false),
        }
    }

    /// Open `n` sessions in parallel, emitting `BotInitialized` per bot.
    /// Exhausting the per-session retry budget is fatal: the pool closes
    /// whatever did open and no work begins.
    pub async fn initialize(&self, n: usize) -> Result<()> {
        if n == 0 {
            return Err(Error::Validation("pool size must be at least 1".into()));
        }
        let opens = (0..n).map(|_| self.open_bot());
        let results = futures::future::join_all(opens).await;
        let mut failure = None;
        for result in results {
            match result {
                Ok(bot) => {
                    self.bus
                        .publish(DomainEvent::BotInitialized {
                            campaign_id: self.campaign_id.clone(),
                            bot_id: bot.id,
                        })
                        .await;
                    self.park(bot);
                }
                Err(err) => failure = Some(err),
            }
        }
        if let Some(err) = failure {
            self.drain().await;
            return Err(Error::Fatal(format!("pool initialization failed: {err}")));
        }
        info!(campaign = %self.campaign_id, bots = n, "bot pool initialized");
        Ok(())
    }

    /// Check a bot out, suspending until one is free. Waiters are served in
    /// FIFO order. Fails once the pool is drained.
    pub async fn acquire(&self) -> Result<Bot> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Fatal("bot pool is drained".into()))?;
        permit.forget();
        let bot = self
            .free
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .ok_or_else(|| Error::Fatal("pool permit without a free bot".into()))?;
        self.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(bot)
    }

    /// Return a bot to the free set and wake one waiter. After `drain`, the
    /// session is closed instead of parked.
    pub async fn release(&self, mut bot: Bot) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        if self.draining.load(Ordering::SeqCst) {
            self.close_bot(&mut bot).await;
            return;
        }
        self.park(bot);
    }

    /// Destroy a crashed session and open a replacement in its place,
    /// preserving pool size. The caller keeps the returned bot checked out.
    /// Replacement failure shrinks the pool and surfaces as fatal.
    pub async fn replace(&self, mut bot: Bot) -> Result<Bot> {
        warn!(campaign = %self.campaign_id, bot = bot.id, "replacing crashed bot");
        self.close_bot(&mut bot).await;
        match self.open_bot().await {
            Ok(replacement) => {
                self.bus
                    .publish(DomainEvent::BotInitialized {
                        campaign_id: self.campaign_id.clone(),
                        bot_id: replacement.id,
                    })
                    .await;
                Ok(replacement)
            }
            Err(err) => {
                // close_bot already dropped the crashed session from `total`.
                self.in_use.fetch_sub(1, Ordering::SeqCst);
                Err(Error::Fatal(format!("bot replacement failed: {err}")))
            }
        }
    }

    /// Close every free session, emitting `BotClosed` for each. Idempotent;
    /// bots still checked out are closed on their release.
    pub async fn drain(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        self.permits.close();
        loop {
            let next = self
                .free
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .pop_front();
            match next {
                Some(mut bot) => self.close_bot(&mut bot).await,
                None => break,
            }
        }
        info!(campaign = %self.campaign_id, "bot pool drained");
    }

    pub fn stats(&self) -> PoolStats {
        let free = self.free.lock().unwrap_or_else(|p| p.into_inner()).len();
        PoolStats {
            total: self.total.load(Ordering::SeqCst),
            free,
            in_use: self.in_use.load(Ordering::SeqCst),
        }
    }

    async fn open_bot(&self) -> Result<Bot> {
        let mut last_error = None;
        for attempt in 0..OPEN_RETRY_BUDGET {
            if attempt > 0 {
                tokio::time::sleep(OPEN_BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
            }
            let opened = match tokio::time::timeout(OPEN_TIMEOUT, self.driver.open()).await {
                Ok(result) => result,
                Err(_) => Err(crate::driver::DriverError::Transient(format!(
                    "session open timed out after {OPEN_TIMEOUT:?}"
                ))),
            };
            match opened {
                Ok(session) => {
                    let id = self.next_bot_id.fetch_add(1, Ordering::SeqCst);
                    self.total.fetch_add(1, Ordering::SeqCst);
                    return Ok(Bot { id, session });
                }
                Err(err) => {
                    warn!(campaign = %self.campaign_id, attempt = attempt + 1, error = %err, "bot open failed");
                    last_error = Some(err);
                }
            }
        }
        Err(Error::Fatal(format!(
            "could not open a driver session after {OPEN_RETRY_BUDGET} attempts: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn park(&self, bot: Bot) {
        self.free
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(bot);
        self.permits.add_permits(1);
    }

    async fn close_bot(&self, bot: &mut Bot) {
        match tokio::time::timeout(CLOSE_TIMEOUT, bot.session.close()).await {
            Ok(Err(err)) => warn!(bot = bot.id, error = %err, "session close failed"),
            Err(_) => warn!(bot = bot.id, "session close timed out"),
            Ok(Ok(())) => {}
        }
        self.total.fetch_sub(1, Ordering::SeqCst);
        self.bus
            .publish(DomainEvent::BotClosed {
                campaign_id: self.campaign_id.clone(),
                bot_id: bot.id,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ScriptedDriver;
    use crate::events::EventKind;
    use futures::FutureExt;

    fn pool_with(driver: ScriptedDriver) -> (Arc<BotPool>, Arc<EventBus>) {
        let bus = EventBus::new();
        let pool = Arc::new(BotPool::new(
            Arc::new(driver),
            Arc::clone(&bus),
            CampaignId::generate(),
        ));
        (pool, bus)
    }

    fn kind_log(bus: &Arc<EventBus>) -> (crate::events::Subscription, Arc<Mutex<Vec<EventKind>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let sub = bus.subscribe_all(move |event| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(event.kind());
                Ok(())
            }
            .boxed()
        });
        (sub, log)
    }

    #[tokio::test]
    async fn initialize_parks_n_bots_and_emits_events() {
        let (pool, bus) = pool_with(ScriptedDriver::new(5));
        let (_sub, log) = kind_log(&bus);
        pool.initialize(3).await.unwrap();
        assert_eq!(
            pool.stats(),
            PoolStats { total: 3, free: 3, in_use: 0 }
        );
        assert_eq!(
            log.lock().unwrap().iter().filter(|k| **k == EventKind::BotInitialized).count(),
            3
        );
    }

    #[tokio::test]
    async fn acquire_release_keeps_census_invariant() {
        let (pool, _) = pool_with(ScriptedDriver::new(5));
        pool.initialize(2).await.unwrap();
        let bot = pool.acquire().await.unwrap();
        assert_eq!(pool.stats(), PoolStats { total: 2, free: 1, in_use: 1 });
        pool.release(bot).await;
        assert_eq!(pool.stats(), PoolStats { total: 2, free: 2, in_use: 0 });
    }

    #[tokio::test]
    async fn acquire_waiters_are_served_fifo() {
        let (pool, _) = pool_with(ScriptedDriver::new(5));
        pool.initialize(1).await.unwrap();
        let held = pool.acquire().await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut waiters = Vec::new();
        for label in 0..3u32 {
            let pool = Arc::clone(&pool);
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                let bot = pool.acquire().await.unwrap();
                order.lock().unwrap().push(label);
                pool.release(bot).await;
            }));
            // Give each waiter time to join the semaphore queue in order.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        pool.release(held).await;
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(&*order.lock().unwrap(), &[0, 1, 2]);
    }

    #[tokio::test]
    async fn replace_preserves_pool_size() {
        let driver = ScriptedDriver::new(5);
        let (pool, _) = pool_with(driver.clone());
        pool.initialize(2).await.unwrap();
        let bot = pool.acquire().await.unwrap();
        let old_id = bot.id;
        let replacement = pool.replace(bot).await.unwrap();
        assert_ne!(replacement.id, old_id);
        assert_eq!(pool.stats(), PoolStats { total: 2, free: 1, in_use: 1 });
        pool.release(replacement).await;
        assert_eq!(driver.opened(), 3);
        assert_eq!(driver.closed(), 1);
    }

    #[tokio::test]
    async fn replace_failure_is_fatal_and_shrinks_pool() {
        let driver = ScriptedDriver::new(5);
        let (pool, _) = pool_with(driver.clone());
        pool.initialize(2).await.unwrap();
        driver.limit_opens(2);
        let bot = pool.acquire().await.unwrap();
        tokio::time::pause();
        let err = pool.replace(bot).await.unwrap_err();
        assert_eq!(err.code(), "fatal");
        assert_eq!(pool.stats(), PoolStats { total: 1, free: 1, in_use: 0 });
    }

    #[tokio::test]
    async fn initialize_retries_failed_opens() {
        let driver = ScriptedDriver::new(5);
        driver.fail_first_opens(2);
        let (pool, _) = pool_with(driver.clone());
        tokio::time::pause();
        let init = pool.initialize(2);
        tokio::pin!(init);
        // Backoff sleeps are auto-advanced under the paused clock.
        init.await.unwrap();
        assert_eq!(pool.stats().total, 2);
    }

    #[tokio::test]
    async fn initialize_exhaustion_is_fatal() {
        let driver = ScriptedDriver::new(5);
        driver.limit_opens(0);
        let (pool, _) = pool_with(driver);
        tokio::time::pause();
        let err = pool.initialize(2).await.unwrap_err();
        assert_eq!(err.code(), "fatal");
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn drain_is_idempotent_and_emits_bot_closed() {
        let (pool, bus) = pool_with(ScriptedDriver::new(5));
        let (_sub, log) = kind_log(&bus);
        pool.initialize(2).await.unwrap();
        pool.drain().await;
        pool.drain().await;
        let closed = log
            .lock()
            .unwrap()
            .iter()
            .filter(|k| **k == EventKind::BotClosed)
            .count();
        assert_eq!(closed, 2);
        assert!(pool.acquire().await.is_err());
    }

    #[tokio::test]
    async fn release_after_drain_closes_session() {
        let driver = ScriptedDriver::new(5);
        let (pool, _) = pool_with(driver.clone());
        pool.initialize(1).await.unwrap();
        let bot = pool.acquire().await.unwrap();
        pool.drain().await;
        pool.release(bot).await;
        assert_eq!(driver.closed(), 1);
        assert_eq!(pool.stats(), PoolStats { total: 0, free: 0, in_use: 0 });
    }
}
