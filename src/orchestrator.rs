//! # Orchestrator — Worker Loops over Pool, Queue, Storage, and Events
//!
//! Runs one campaign to completion: transitions it to IN_PROGRESS, enqueues
//! its pending task ids, and drives `max_bots` worker loops. Each iteration
//! dequeues an id, checks a bot out of the pool, hydrates the task under a
//! fresh unit of work, executes the extraction pipeline, and persists the
//! outcome in the same transaction as the task transition.
//!
//! ## Failure handling
//!
//! Transient failures requeue the task until its retry budget (2 attempts)
//! is spent; Permanent failures fail it immediately; a crashed session is
//! replaced and counts as Transient. Replacement exhaustion is fatal: the
//! run aborts, the pool drains, and the campaign is marked FAILED.
//!
//! ## Ordering
//!
//! Per task, events are published strictly as `TaskStarted`, zero or more
//! `BotSnapshotCaptured`, `PlaceExtracted` per unique place, then
//! `TaskCompleted` or `TaskFailed`. Across tasks nothing is promised.
//!
//! ## Cancellation
//!
//! The cancel flag is observed between iterations and between driver steps.
//! In-flight work gets a bounded grace window (10 s) before the remaining
//! workers are aborted; tasks that were IN_PROGRESS stay that way in storage
//! and reconcile to PENDING on resume.

use crate::db::Database;
use crate::domain::{place_fingerprint, CampaignStatus, ExtractedPlace, PlaceReview};
use crate::driver::{DriverError, DriverTimeouts, PlaceRecord};
use crate::error::{Error, Result};
use crate::events::{DomainEvent, EventBus};
use crate::ids::{CampaignId, PlaceId, TaskId};
use crate::pool::{Bot, BotPool};
use crate::queue::TaskQueue;
use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Attempts a task gets before it goes FAILED.
pub const TASK_RETRY_BUDGET: i32 = 2;
/// How long in-flight workers get to finish after cancellation.
pub const CANCEL_GRACE: Duration = Duration::from_secs(10);
/// One scripted scroll batch; the pipeline interleaves snapshots between batches.
const SCROLLS_PER_ROUND: u32 = 2;
/// Roughly how many listings one scroll batch loads.
const RESULTS_PER_ROUND: i32 = 10;

// ── Cancellation ────────────────────────────────────────────────

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation signal shared between the service, the gateway,
/// and the worker loops.
#[derive(Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            // Register interest before re-checking the flag, or a cancel
            // landing between check and await is lost.
            let mut notified = std::pin::pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

// ── Orchestrator ────────────────────────────────────────────────

pub struct Orchestrator {
    db: Database,
    bus: Arc<EventBus>,
    snapshot_interval: Duration,
    timeouts: DriverTimeouts,
    grace: Duration,
}

/// Immutable campaign facts every worker needs.
struct CampaignSnapshot {
    id: CampaignId,
    activity: String,
    locale: String,
    max_results: i32,
    min_rating: Option<f64>,
}

struct RunCtx {
    db: Database,
    bus: Arc<EventBus>,
    pool: Arc<BotPool>,
    queue: TaskQueue,
    campaign: CampaignSnapshot,
    cancel: CancelFlag,
    snapshot_interval: Duration,
    timeouts: DriverTimeouts,
    fatal: Mutex<Option<Error>>,
}

enum TaskOutcome {
    /// Keep iterating with this bot.
    Continue(Bot),
    /// Cancellation observed mid-task; the task row stays IN_PROGRESS.
    Cancelled(Bot),
    /// The run is over; the bot (if any) is already gone.
    Fatal(Error),
}

impl Orchestrator {
    pub fn new(db: Database, bus: Arc<EventBus>, snapshot_interval: Duration) -> Self {
        Orchestrator {
            db,
            bus,
            snapshot_interval,
            timeouts: DriverTimeouts::default(),
            grace: CANCEL_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run the campaign to completion (or cancellation) on the given pool.
    ///
    /// On a clean finish the terminal campaign status is computed from the
    /// task census. After cancellation the campaign row is left IN_PROGRESS
    /// for the service to settle. Fatal errors mark it FAILED here.
    pub async fn run(
        &self,
        campaign_id: &CampaignId,
        pool: Arc<BotPool>,
        cancel: CancelFlag,
    ) -> Result<()> {
        let (snapshot, task_ids, max_bots) = self.claim_campaign(campaign_id).await?;
        info!(campaign = %campaign_id, tasks = task_ids.len(), "extraction run starting");

        if let Err(err) = pool.initialize(max_bots as usize).await {
            self.abort_campaign(campaign_id, &err).await;
            return Err(err);
        }

        let ctx = Arc::new(RunCtx {
            db: self.db.clone(),
            bus: Arc::clone(&self.bus),
            pool: Arc::clone(&pool),
            queue: TaskQueue::new(),
            campaign: snapshot,
            cancel: cancel.clone(),
            snapshot_interval: self.snapshot_interval,
            timeouts: self.timeouts.clone(),
            fatal: Mutex::new(None),
        });
        ctx.queue.enqueue_all(task_ids);

        let mut workers = JoinSet::new();
        for worker in 0..max_bots {
            let ctx = Arc::clone(&ctx);
            workers.spawn(async move { worker_loop(ctx, worker as u32).await });
        }
        self.await_workers(&mut workers, &cancel).await;

        let fatal = ctx.fatal.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(err) = fatal {
            self.abort_campaign(campaign_id, &err).await;
            pool.drain().await;
            return Err(err);
        }

        if !cancel.is_cancelled() {
            self.finalize_campaign(campaign_id).await?;
        }
        pool.drain().await;
        info!(campaign = %campaign_id, cancelled = cancel.is_cancelled(), "extraction run finished");
        Ok(())
    }

    /// Transition the campaign to IN_PROGRESS and collect its runnable task
    /// ids, all under one unit of work.
    async fn claim_campaign(
        &self,
        campaign_id: &CampaignId,
    ) -> Result<(CampaignSnapshot, Vec<TaskId>, i32)> {
        let mut uow = self.db.begin().await?;
        let mut campaign = uow.campaigns().get(campaign_id).await?;
        campaign.begin()?;
        uow.campaigns().save(&campaign).await?;
        let task_ids = uow.tasks().pending_tasks_of(campaign_id).await?;
        uow.commit().await?;
        let snapshot = CampaignSnapshot {
            id: campaign.id.clone(),
            activity: campaign.activity.clone(),
            locale: campaign.locale.clone(),
            max_results: campaign.max_results,
            min_rating: campaign.min_rating,
        };
        Ok((snapshot, task_ids, campaign.max_bots))
    }

    async fn await_workers(&self, workers: &mut JoinSet<()>, cancel: &CancelFlag) {
        let mut grace_armed = false;
        let mut deadline = tokio::time::Instant::now() + self.grace;
        loop {
            tokio::select! {
                joined = workers.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
                _ = cancel.cancelled(), if !grace_armed => {
                    grace_armed = true;
                    deadline = tokio::time::Instant::now() + self.grace;
                }
                _ = tokio::time::sleep_until(deadline), if grace_armed => {
                    warn!("cancellation grace window elapsed, aborting workers");
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                    break;
                }
            }
        }
    }

    async fn finalize_campaign(&self, campaign_id: &CampaignId) -> Result<()> {
        let mut uow = self.db.begin().await?;
        let mut campaign = uow.campaigns().get(campaign_id).await?;
        let statuses = uow.tasks().statuses_of(campaign_id).await?;
        campaign.finalize(&statuses);
        uow.campaigns().save(&campaign).await?;
        uow.commit().await?;
        Ok(())
    }

    /// Fatal path: record the failure and mark the campaign FAILED.
    async fn abort_campaign(&self, campaign_id: &CampaignId, err: &Error) {
        error!(campaign = %campaign_id, error = %err, "aborting campaign");
        self.bus
            .publish(DomainEvent::BotError {
                campaign_id: campaign_id.clone(),
                bot_id: None,
                task_id: None,
                message: err.to_string(),
            })
            .await;
        let marked = async {
            let mut uow = self.db.begin().await?;
            let mut campaign = uow.campaigns().get(campaign_id).await?;
            campaign.status = CampaignStatus::Failed;
            campaign.completed_at = Some(Utc::now());
            uow.campaigns().save(&campaign).await?;
            uow.commit().await
        }
        .await;
        if let Err(mark_err) = marked {
            error!(campaign = %campaign_id, error = %mark_err, "could not mark campaign failed");
        }
    }
}

// ── Worker loop ─────────────────────────────────────────────────

async fn worker_loop(ctx: Arc<RunCtx>, worker: u32) {
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let Some(task_id) = ctx.queue.dequeue() else {
            break;
        };
        let bot = tokio::select! {
            acquired = ctx.pool.acquire() => match acquired {
                Ok(bot) => bot,
                Err(_) => {
                    // Pool drained under us; put the id back for a resume.
                    ctx.queue.enqueue(task_id);
                    break;
                }
            },
            _ = ctx.cancel.cancelled() => {
                ctx.queue.enqueue(task_id);
                break;
            }
        };
        match process_task(&ctx, &task_id, bot).await {
            TaskOutcome::Continue(bot) => ctx.pool.release(bot).await,
            TaskOutcome::Cancelled(bot) => {
                ctx.pool.release(bot).await;
                break;
            }
            TaskOutcome::Fatal(err) => {
                *ctx.fatal.lock().unwrap_or_else(|p| p.into_inner()) = Some(err);
                ctx.cancel.cancel();
                break;
            }
        }
    }
    tracing::debug!(worker, "worker loop exited");
}

/// One task, end to end, on one bot.
async fn process_task(ctx: &RunCtx, task_id: &TaskId, mut bot: Bot) -> TaskOutcome {
    // Claim: hydrate, transition to IN_PROGRESS, commit, then announce.
    let task = {
        let claimed = async {
            let mut uow = ctx.db.begin().await?;
            let mut task = uow.tasks().get(task_id).await?;
            task.begin()?;
            uow.tasks().save(&task).await?;
            uow.commit().await?;
            Ok::<_, Error>(task)
        }
        .await;
        match claimed {
            Ok(task) => task,
            Err(Error::Conflict(reason)) => {
                // Already terminal (e.g. duplicate id in the queue); skip it.
                warn!(task = %task_id, %reason, "skipping unclaimable task");
                return TaskOutcome::Continue(bot);
            }
            Err(err) => return TaskOutcome::Fatal(err),
        }
    };
    ctx.bus
        .publish(DomainEvent::TaskStarted {
            campaign_id: ctx.campaign.id.clone(),
            task_id: task.id.clone(),
            geoname_id: task.geoname_id,
            geoname_name: task.geoname_name.clone(),
            attempt: task.attempts,
            started_at: task.started_at.unwrap_or_else(Utc::now),
        })
        .await;
    ctx.bus
        .publish(DomainEvent::BotTaskAssigned {
            campaign_id: ctx.campaign.id.clone(),
            bot_id: bot.id,
            task_id: task.id.clone(),
            geoname_name: task.geoname_name.clone(),
        })
        .await;

    match extraction_pipeline(ctx, &task, &mut bot).await {
        Ok(records) => match persist_success(ctx, task_id, bot.id, records).await {
            Ok(outcome) => outcome_or_continue(outcome, bot),
            Err(err) => TaskOutcome::Fatal(err),
        },
        Err(DriverError::Cancelled) => TaskOutcome::Cancelled(bot),
        Err(DriverError::Crashed(message)) => {
            ctx.bus
                .publish(DomainEvent::BotError {
                    campaign_id: ctx.campaign.id.clone(),
                    bot_id: Some(bot.id),
                    task_id: Some(task_id.clone()),
                    message: message.clone(),
                })
                .await;
            match ctx.pool.replace(bot).await {
                Ok(replacement) => {
                    let transient = Error::Transient(format!("driver session crashed: {message}"));
                    match settle_failure(ctx, task_id, &transient).await {
                        Ok(()) => TaskOutcome::Continue(replacement),
                        Err(err) => TaskOutcome::Fatal(err),
                    }
                }
                Err(fatal) => {
                    // No session left to run the task on; fail it in place.
                    let _ = settle_failure(ctx, task_id, &Error::Transient(message)).await;
                    TaskOutcome::Fatal(fatal)
                }
            }
        }
        Err(driver_err) => {
            let err = Error::from(driver_err);
            ctx.bus
                .publish(DomainEvent::BotError {
                    campaign_id: ctx.campaign.id.clone(),
                    bot_id: Some(bot.id),
                    task_id: Some(task_id.clone()),
                    message: err.to_string(),
                })
                .await;
            match settle_failure(ctx, task_id, &err).await {
                Ok(()) => TaskOutcome::Continue(bot),
                Err(fatal) => TaskOutcome::Fatal(fatal),
            }
        }
    }
}

fn outcome_or_continue(cancelled: bool, bot: Bot) -> TaskOutcome {
    if cancelled {
        TaskOutcome::Cancelled(bot)
    } else {
        TaskOutcome::Continue(bot)
    }
}

/// The driver side of one task: navigate, query, wait, scroll with periodic
/// snapshots, parse, and a final capture.
async fn extraction_pipeline(
    ctx: &RunCtx,
    task: &crate::domain::PlaceExtractionTask,
    bot: &mut Bot,
) -> std::result::Result<Vec<PlaceRecord>, DriverError> {
    let query = format!("{} in {}", task.search_seed, task.geoname_name);
    let url = search_url(&query, &ctx.campaign.locale);
    let mut ticker = SnapshotTicker::new(ctx.snapshot_interval);

    check_cancel(ctx)?;
    with_timeout(ctx.timeouts.navigate, bot.session.navigate(&url)).await?;
    check_cancel(ctx)?;
    with_timeout(ctx.timeouts.navigate, bot.session.fill_query(&query)).await?;
    check_cancel(ctx)?;
    with_timeout(
        ctx.timeouts.wait_for,
        bot.session
            .wait_for("div[role='feed']", ctx.timeouts.wait_for),
    )
    .await?;
    ticker.maybe_snapshot(ctx, task, bot).await?;

    for _ in 0..scroll_rounds(ctx.campaign.max_results) {
        check_cancel(ctx)?;
        let progress = with_timeout(
            ctx.timeouts.scroll,
            bot.session.scroll_result_list(SCROLLS_PER_ROUND),
        )
        .await?;
        ticker.maybe_snapshot(ctx, task, bot).await?;
        if progress.reached_end {
            break;
        }
    }

    check_cancel(ctx)?;
    let records = with_timeout(
        ctx.timeouts.parse,
        bot.session.parse_results(ctx.campaign.max_results as u32),
    )
    .await?;

    // Final frame so subscribers see the finished list.
    ticker.force_snapshot(ctx, task, bot).await?;
    Ok(records)
}

/// Persist places and the COMPLETED transition in one unit of work, then
/// publish. Returns whether cancellation was observed afterwards.
async fn persist_success(
    ctx: &RunCtx,
    task_id: &TaskId,
    bot_id: u32,
    records: Vec<PlaceRecord>,
) -> Result<bool> {
    let records: Vec<PlaceRecord> = match ctx.campaign.min_rating {
        Some(min) => records
            .into_iter()
            .filter(|r| r.rating.map(|rating| rating >= min).unwrap_or(false))
            .collect(),
        None => records,
    };

    let mut uow = ctx.db.begin().await?;
    let mut task = uow.tasks().get(task_id).await?;
    let mut persisted = Vec::new();
    for record in records {
        let place = ExtractedPlace {
            id: PlaceId::generate(),
            fingerprint: place_fingerprint(&task.id, &record.name, &record.address),
            source_task_id: task.id.clone(),
            name: record.name,
            address: record.address,
            city: task.geoname_name.clone(),
            category: record.category,
            rating: record.rating,
            review_count: record.review_count,
            phone: record.phone,
            website: record.website,
            coordinates: match (record.latitude, record.longitude) {
                (Some(latitude), Some(longitude)) => {
                    Some(crate::domain::Coordinates { latitude, longitude })
                }
                _ => None,
            },
            extracted_at: Utc::now(),
            reviews: record
                .reviews
                .into_iter()
                .map(|review| PlaceReview {
                    author: review.author,
                    rating: review.rating,
                    text: review.text,
                    posted_at: review.posted_at.unwrap_or_else(Utc::now),
                })
                .collect(),
        };
        if uow.places().save(&place).await? {
            persisted.push(place);
        }
    }
    task.complete()?;
    uow.tasks().save(&task).await?;
    let mut campaign = uow.campaigns().get(&ctx.campaign.id).await?;
    campaign.record_task_completed();
    uow.campaigns().save(&campaign).await?;
    uow.commit().await?;

    let extracted = persisted.len() as u64;
    for place in persisted {
        ctx.bus
            .publish(DomainEvent::PlaceExtracted {
                campaign_id: ctx.campaign.id.clone(),
                task_id: task.id.clone(),
                place_id: place.id,
                name: place.name,
            })
            .await;
    }
    ctx.bus
        .publish(DomainEvent::BotTaskCompleted {
            campaign_id: ctx.campaign.id.clone(),
            bot_id,
            task_id: task.id.clone(),
            places_extracted: extracted,
        })
        .await;
    ctx.bus
        .publish(DomainEvent::TaskCompleted {
            campaign_id: ctx.campaign.id.clone(),
            task_id: task.id.clone(),
            places_extracted: extracted,
            completed_at: task.completed_at.unwrap_or_else(Utc::now),
        })
        .await;
    Ok(ctx.cancel.is_cancelled())
}

/// Requeue a transiently failed task while budget remains, otherwise fail it
/// and bump the campaign's failure counter.
async fn settle_failure(ctx: &RunCtx, task_id: &TaskId, err: &Error) -> Result<()> {
    let mut uow = ctx.db.begin().await?;
    let mut task = uow.tasks().get(task_id).await?;
    let retriable = err.is_transient() && task.attempts < TASK_RETRY_BUDGET;
    if retriable {
        task.requeue(&err.to_string())?;
        uow.tasks().save(&task).await?;
        uow.commit().await?;
        ctx.queue.enqueue(task_id.clone());
        return Ok(());
    }
    task.fail(&err.to_string())?;
    uow.tasks().save(&task).await?;
    let mut campaign = uow.campaigns().get(&ctx.campaign.id).await?;
    campaign.record_task_failed();
    uow.campaigns().save(&campaign).await?;
    uow.commit().await?;
    ctx.bus
        .publish(DomainEvent::TaskFailed {
            campaign_id: ctx.campaign.id.clone(),
            task_id: task.id.clone(),
            error: err.to_string(),
            attempts: task.attempts,
            failed_at: task.completed_at.unwrap_or_else(Utc::now),
        })
        .await;
    Ok(())
}

// ── Pipeline helpers ────────────────────────────────────────────

fn check_cancel(ctx: &RunCtx) -> std::result::Result<(), DriverError> {
    if ctx.cancel.is_cancelled() {
        Err(DriverError::Cancelled)
    } else {
        Ok(())
    }
}

async fn with_timeout<T>(
    limit: Duration,
    operation: impl Future<Output = std::result::Result<T, DriverError>>,
) -> std::result::Result<T, DriverError> {
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Transient(format!(
            "driver step timed out after {limit:?}"
        ))),
    }
}

/// Scroll batches needed to surface `max_results` listings.
fn scroll_rounds(max_results: i32) -> u32 {
    let rounds = (max_results + RESULTS_PER_ROUND - 1) / RESULTS_PER_ROUND;
    rounds.max(1) as u32
}

fn search_url(query: &str, locale: &str) -> String {
    let encoded = urlencoding::encode(query).replace("%20", "+");
    format!("https://www.google.com/maps/search/{encoded}?hl={locale}")
}

/// Publishes `BotSnapshotCaptured` at most once per interval. Capture
/// failures are swallowed (a missed frame must not fail the task) except
/// when the session itself died.
struct SnapshotTicker {
    interval: Duration,
    last: Option<tokio::time::Instant>,
}

impl SnapshotTicker {
    fn new(interval: Duration) -> Self {
        SnapshotTicker { interval, last: None }
    }

    async fn maybe_snapshot(
        &mut self,
        ctx: &RunCtx,
        task: &crate::domain::PlaceExtractionTask,
        bot: &mut Bot,
    ) -> std::result::Result<(), DriverError> {
        let due = self
            .last
            .map(|last| last.elapsed() >= self.interval)
            .unwrap_or(true);
        if !due {
            return Ok(());
        }
        self.force_snapshot(ctx, task, bot).await
    }

    async fn force_snapshot(
        &mut self,
        ctx: &RunCtx,
        task: &crate::domain::PlaceExtractionTask,
        bot: &mut Bot,
    ) -> std::result::Result<(), DriverError> {
        self.last = Some(tokio::time::Instant::now());
        let image = match with_timeout(ctx.timeouts.capture, bot.session.capture_image()).await {
            Ok(image) => image,
            Err(DriverError::Crashed(message)) => return Err(DriverError::Crashed(message)),
            Err(err) => {
                warn!(task = %task.id, error = %err, "snapshot capture failed");
                return Ok(());
            }
        };
        let url = bot.session.current_url().await;
        ctx.bus
            .publish(DomainEvent::BotSnapshotCaptured {
                campaign_id: ctx.campaign.id.clone(),
                bot_id: bot.id,
                task_id: task.id.clone(),
                screenshot: image,
                url,
                captured_at: Utc::now(),
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_url_encodes_query_and_locale() {
        let url = search_url("restaurants in Alcalá de Henares", "es-ES");
        assert!(url.starts_with("https://www.google.com/maps/search/restaurants+in+"));
        assert!(url.ends_with("?hl=es-ES"));
        assert!(!url.contains(' '));
    }

    #[test]
    fn scroll_rounds_covers_max_results() {
        assert_eq!(scroll_rounds(1), 1);
        assert_eq!(scroll_rounds(10), 1);
        assert_eq!(scroll_rounds(11), 2);
        assert_eq!(scroll_rounds(100), 10);
    }

    #[tokio::test]
    async fn cancel_flag_wakes_waiters() {
        let flag = CancelFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move {
                flag.cancelled().await;
                true
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        flag.cancel();
        assert!(waiter.await.unwrap());
        assert!(flag.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_when_already_set() {
        let flag = CancelFlag::new();
        flag.cancel();
        tokio::time::timeout(Duration::from_millis(50), flag.cancelled())
            .await
            .expect("cancelled() must not block once the flag is set");
    }

    #[tokio::test]
    async fn with_timeout_classifies_as_transient() {
        let result: std::result::Result<(), DriverError> = with_timeout(
            Duration::from_millis(10),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;
        assert!(matches!(result, Err(DriverError::Transient(_))));
    }
}
