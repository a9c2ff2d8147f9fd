//! # Events — Process-Wide Pub/Sub for Extraction Activity
//!
//! A kind-keyed publisher/subscriber registry. The orchestrator and the bot
//! pool publish domain events carrying identifiers only; the WebSocket
//! gateway subscribes per session and forwards them through the wire mappers.
//!
//! ## Event Kinds
//!
//! | Variant | Emitted When |
//! |---------|-------------|
//! | `BotInitialized` | A pool slot opened its driver session |
//! | `BotTaskAssigned` | A worker handed a task to a bot |
//! | `BotSnapshotCaptured` | The periodic screenshot tick fired |
//! | `BotTaskCompleted` | A bot finished its extraction pipeline |
//! | `BotError` | A driver step failed |
//! | `BotClosed` | A pool slot was drained |
//! | `TaskStarted` | A task transitioned to IN_PROGRESS |
//! | `PlaceExtracted` | A unique place was persisted |
//! | `TaskCompleted` | A task transitioned to COMPLETED |
//! | `TaskFailed` | A task transitioned to FAILED |
//!
//! ## Delivery
//!
//! `publish` dispatches sequentially, in registration order, on the caller's
//! scheduler. A failing handler is logged and never prevents delivery to the
//! remaining handlers. The registry lock is held only to snapshot the handler
//! list, never across dispatch, so handlers may themselves subscribe or
//! unsubscribe. Handlers must not block; long work belongs behind a bounded
//! queue on the subscriber's side.

use crate::ids::{CampaignId, PlaceId, TaskId};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Discriminator for subscription routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BotInitialized,
    BotTaskAssigned,
    BotSnapshotCaptured,
    BotTaskCompleted,
    BotError,
    BotClosed,
    TaskStarted,
    PlaceExtracted,
    TaskCompleted,
    TaskFailed,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::BotInitialized,
        EventKind::BotTaskAssigned,
        EventKind::BotSnapshotCaptured,
        EventKind::BotTaskCompleted,
        EventKind::BotError,
        EventKind::BotClosed,
        EventKind::TaskStarted,
        EventKind::PlaceExtracted,
        EventKind::TaskCompleted,
        EventKind::TaskFailed,
    ];
}

/// Domain events carry identifiers and plain values only; entities never hold
/// back-references to the bus or to driver sessions.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    BotInitialized {
        campaign_id: CampaignId,
        bot_id: u32,
    },
    BotTaskAssigned {
        campaign_id: CampaignId,
        bot_id: u32,
        task_id: TaskId,
        geoname_name: String,
    },
    BotSnapshotCaptured {
        campaign_id: CampaignId,
        bot_id: u32,
        task_id: TaskId,
        screenshot: Vec<u8>,
        url: String,
        captured_at: DateTime<Utc>,
    },
    BotTaskCompleted {
        campaign_id: CampaignId,
        bot_id: u32,
        task_id: TaskId,
        places_extracted: u64,
    },
    BotError {
        campaign_id: CampaignId,
        bot_id: Option<u32>,
        task_id: Option<TaskId>,
        message: String,
    },
    BotClosed {
        campaign_id: CampaignId,
        bot_id: u32,
    },
    TaskStarted {
        campaign_id: CampaignId,
        task_id: TaskId,
        geoname_id: i64,
        geoname_name: String,
        attempt: i32,
        started_at: DateTime<Utc>,
    },
    PlaceExtracted {
        campaign_id: CampaignId,
        task_id: TaskId,
        place_id: PlaceId,
        name: String,
    },
    TaskCompleted {
        campaign_id: CampaignId,
        task_id: TaskId,
        places_extracted: u64,
        completed_at: DateTime<Utc>,
    },
    TaskFailed {
        campaign_id: CampaignId,
        task_id: TaskId,
        error: String,
        attempts: i32,
        failed_at: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::BotInitialized { .. } => EventKind::BotInitialized,
            DomainEvent::BotTaskAssigned { .. } => EventKind::BotTaskAssigned,
            DomainEvent::BotSnapshotCaptured { .. } => EventKind::BotSnapshotCaptured,
            DomainEvent::BotTaskCompleted { .. } => EventKind::BotTaskCompleted,
            DomainEvent::BotError { .. } => EventKind::BotError,
            DomainEvent::BotClosed { .. } => EventKind::BotClosed,
            DomainEvent::TaskStarted { .. } => EventKind::TaskStarted,
            DomainEvent::PlaceExtracted { .. } => EventKind::PlaceExtracted,
            DomainEvent::TaskCompleted { .. } => EventKind::TaskCompleted,
            DomainEvent::TaskFailed { .. } => EventKind::TaskFailed,
        }
    }

    /// Campaign the event belongs to; sessions filter on this.
    pub fn campaign_id(&self) -> &CampaignId {
        match self {
            DomainEvent::BotInitialized { campaign_id, .. }
            | DomainEvent::BotTaskAssigned { campaign_id, .. }
            | DomainEvent::BotSnapshotCaptured { campaign_id, .. }
            | DomainEvent::BotTaskCompleted { campaign_id, .. }
            | DomainEvent::BotError { campaign_id, .. }
            | DomainEvent::BotClosed { campaign_id, .. }
            | DomainEvent::TaskStarted { campaign_id, .. }
            | DomainEvent::PlaceExtracted { campaign_id, .. }
            | DomainEvent::TaskCompleted { campaign_id, .. }
            | DomainEvent::TaskFailed { campaign_id, .. } => campaign_id,
        }
    }
}

type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;
type Handler = Arc<dyn Fn(DomainEvent) -> HandlerFuture + Send + Sync>;

/// Process-wide event bus. Constructed once at startup and injected as a
/// capability; never looked up implicitly.
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<HashMap<EventKind, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a handler for one event kind. The returned subscription
    /// removes the handler when dropped or explicitly unsubscribed.
    pub fn subscribe<F>(self: &Arc<Self>, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(DomainEvent) -> HandlerFuture + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            bus: Arc::clone(self),
            entries: vec![(kind, id)],
        }
    }

    /// Register one handler for every event kind, as the gateway does when a
    /// session subscribes to a campaign stream.
    pub fn subscribe_all<F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        F: Fn(DomainEvent) -> HandlerFuture + Send + Sync + Clone + 'static,
    {
        let mut entries = Vec::with_capacity(EventKind::ALL.len());
        {
            let mut handlers = self.handlers.lock().unwrap_or_else(|p| p.into_inner());
            for kind in EventKind::ALL {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                handlers
                    .entry(kind)
                    .or_default()
                    .push((id, Arc::new(handler.clone())));
                entries.push((kind, id));
            }
        }
        Subscription {
            bus: Arc::clone(self),
            entries,
        }
    }

    /// Dispatch to every handler registered for the event's kind.
    pub async fn publish(&self, event: DomainEvent) {
        let snapshot: Vec<Handler> = {
            let handlers = self.handlers.lock().unwrap_or_else(|p| p.into_inner());
            handlers
                .get(&event.kind())
                .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in snapshot {
            if let Err(err) = handler(event.clone()).await {
                warn!(kind = ?event.kind(), error = %err, "event handler failed");
            }
        }
    }

    /// Number of live handler registrations, across all kinds.
    pub fn handler_count(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }

    fn remove(&self, entries: &[(EventKind, u64)]) {
        let mut handlers = self.handlers.lock().unwrap_or_else(|p| p.into_inner());
        for (kind, id) in entries {
            if let Some(list) = handlers.get_mut(kind) {
                list.retain(|(entry_id, _)| entry_id != id);
            }
        }
    }
}

/// Handle to one or more handler registrations. Unsubscribes on drop.
pub struct Subscription {
    bus: Arc<EventBus>,
    entries: Vec<(EventKind, u64)>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        let entries = std::mem::take(&mut self.entries);
        self.bus.remove(&entries);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            self.bus.remove(&self.entries);
        }
    }
}
