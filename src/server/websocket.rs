//! # WebSocket Gateway — `/ws/extraction/stream`
//!
//! One duplex endpoint per client session, multiplexing three roles:
//!
//! - **Commands** (`start_extraction`, `pause_extraction`, `cancel_extraction`)
//!   mutate state and answer with a `command_result`. They are handled inline
//!   in the session loop, so at most one is in flight per session.
//! - **Queries** (`get_status`, `get_statistics`, `get_bot_info`) are
//!   read-only and may interleave with the event stream.
//! - **`subscribe`** binds an event-bus subscription filtered to one
//!   campaign; every matching domain event is forwarded through the wire
//!   mappers. `auto_start` is the legacy one-shot that subscribes and starts
//!   in a single message.
//!
//! Outbound traffic runs through the bounded [`super::outbound::OutboundQueue`]:
//! snapshots coalesce under pressure, lifecycle events block briefly and, on
//! timeout, the session dies with a protocol error. A disconnect tears down
//! only the forwarding, never the extraction itself.

use super::outbound::{OutboundQueue, OUTBOUND_CAPACITY};
use super::AppState;
use crate::error::Error;
use crate::events::Subscription;
use crate::ids::CampaignId;
use crate::service::CreateCampaignRequest;
use crate::wire::{self, ClientEnvelope, OutboundMessage};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a lifecycle event may wait on a full outbound buffer.
const EVENT_PUSH_TIMEOUT: Duration = Duration::from_secs(2);

pub(super) async fn handler_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| session_loop(socket, state))
}

struct Session {
    state: Arc<AppState>,
    outbound: Arc<OutboundQueue>,
    subscription: Option<Subscription>,
}

async fn session_loop(mut socket: WebSocket, state: Arc<AppState>) {
    let outbound = Arc::new(OutboundQueue::new(OUTBOUND_CAPACITY));
    let mut session = Session {
        state,
        outbound: Arc::clone(&outbound),
        subscription: None,
    };

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => session.handle_text(&text).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket receive error");
                        break;
                    }
                }
            }
            next = outbound.pop() => {
                match next {
                    Some(message) => {
                        if socket.send(Message::Text(message.to_json().into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // The queue only closes on overflow; tell the client why.
                        let goodbye = wire::protocol_error("outbound buffer overflow");
                        let _ = socket.send(Message::Text(goodbye.to_json().into())).await;
                        break;
                    }
                }
            }
        }
    }
    // Dropping the session drops the subscription; extraction keeps running.
}

#[derive(Deserialize, Default)]
struct CampaignRef {
    campaign_id: Option<String>,
}

#[derive(Deserialize, Default)]
struct StartData {
    campaign_id: Option<String>,
    spec: Option<CreateCampaignRequest>,
}

impl Session {
    async fn handle_text(&mut self, text: &str) {
        let envelope: ClientEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.push(wire::protocol_error(&format!("malformed envelope: {e}")))
                    .await;
                return;
            }
        };
        match envelope {
            ClientEnvelope::Command { command, data } => {
                let reply = self.run_command(&command, data).await;
                self.push(reply).await;
            }
            ClientEnvelope::Query { query, data } => {
                let reply = self.run_query(&query, data).await;
                self.push(reply).await;
            }
            ClientEnvelope::Subscribe { data } => {
                let reply = self.subscribe(data);
                self.push(reply).await;
            }
            ClientEnvelope::AutoStart { data } => self.auto_start(data).await,
        }
    }

    // ── Commands ────────────────────────────────────────────────

    async fn run_command(&mut self, command: &str, data: serde_json::Value) -> OutboundMessage {
        match command {
            "start_extraction" => self.start_extraction(data).await,
            "pause_extraction" => match self.campaign_ref(data) {
                Ok(id) => command_outcome(self.state.service.pause(&id).map(|()| {
                    json!({ "campaign_id": id.to_text(), "paused": true })
                })),
                Err(e) => wire::command_result(false, json!(null), Some(&e.to_string())),
            },
            "cancel_extraction" => match self.campaign_ref(data) {
                Ok(id) => command_outcome(self.state.service.cancel(&id).map(|()| {
                    json!({ "campaign_id": id.to_text(), "cancelled": true })
                })),
                Err(e) => wire::command_result(false, json!(null), Some(&e.to_string())),
            },
            unknown => wire::command_result(
                false,
                json!(null),
                Some(&format!("unknown command {unknown:?}")),
            ),
        }
    }

    async fn start_extraction(&mut self, data: serde_json::Value) -> OutboundMessage {
        match self.resolve_start_target(data).await {
            Ok(campaign_id) => match self.state.service.start(&campaign_id).await {
                Ok(()) => wire::command_result(
                    true,
                    json!({ "campaign_id": campaign_id.to_text(), "started": true }),
                    None,
                ),
                Err(e) => wire::command_result(false, json!(null), Some(&e.to_string())),
            },
            Err(e) => wire::command_result(false, json!(null), Some(&e.to_string())),
        }
    }

    /// `start_extraction` takes an existing `campaign_id`, a nested `spec`,
    /// or (legacy) the spec fields inline in `data`.
    async fn resolve_start_target(
        &self,
        data: serde_json::Value,
    ) -> Result<CampaignId, Error> {
        let start: StartData = serde_json::from_value(data.clone())
            .map_err(|e| Error::Protocol(format!("bad start_extraction payload: {e}")))?;
        if let Some(raw) = start.campaign_id {
            return raw
                .parse()
                .map_err(|e| Error::Validation(format!("bad campaign id {raw:?}: {e}")));
        }
        let spec = match start.spec {
            Some(spec) => spec,
            None => serde_json::from_value::<CreateCampaignRequest>(data).map_err(|e| {
                Error::Protocol(format!(
                    "start_extraction needs campaign_id or a campaign spec: {e}"
                ))
            })?,
        };
        let campaign = self.state.service.create(spec).await?;
        Ok(campaign.id)
    }

    // ── Queries ─────────────────────────────────────────────────

    async fn run_query(&self, query: &str, data: serde_json::Value) -> OutboundMessage {
        match query {
            "get_status" => match self.campaign_ref(data) {
                Ok(id) => match self.state.service.get(&id).await {
                    Ok(campaign) => wire::query_result(
                        true,
                        json!({
                            "campaign": wire::campaign_to_wire(&campaign),
                            "running": self.state.service.is_running(&id),
                        }),
                        None,
                    ),
                    Err(e) => wire::query_result(false, json!(null), Some(&e.to_string())),
                },
                Err(e) => wire::query_result(false, json!(null), Some(&e.to_string())),
            },
            "get_statistics" => match self.campaign_ref(data) {
                Ok(id) => match self.state.service.statistics_of(&id).await {
                    Ok(stats) => wire::query_result(true, json!({ "statistics": stats }), None),
                    Err(e) => wire::query_result(false, json!(null), Some(&e.to_string())),
                },
                Err(e) => wire::query_result(false, json!(null), Some(&e.to_string())),
            },
            "get_bot_info" => {
                let bots: Vec<_> = self
                    .state
                    .service
                    .bot_info()
                    .into_iter()
                    .map(|(campaign_id, stats)| {
                        json!({
                            "campaign_id": campaign_id.to_text(),
                            "total": stats.total,
                            "free": stats.free,
                            "in_use": stats.in_use,
                        })
                    })
                    .collect();
                wire::query_result(true, json!({ "bots": bots }), None)
            }
            unknown => wire::query_result(
                false,
                json!(null),
                Some(&format!("unknown query {unknown:?}")),
            ),
        }
    }

    // ── Subscription ────────────────────────────────────────────

    fn subscribe(&mut self, data: serde_json::Value) -> OutboundMessage {
        match self.campaign_ref(data) {
            Ok(id) => {
                self.bind_subscription(&id);
                wire::stream_started(&id)
            }
            Err(e) => wire::protocol_error(&e.to_string()),
        }
    }

    fn bind_subscription(&mut self, campaign_id: &CampaignId) {
        let outbound = Arc::clone(&self.outbound);
        let campaign = campaign_id.clone();
        let subscription = self.state.bus.subscribe_all(move |event| {
            let outbound = Arc::clone(&outbound);
            let campaign = campaign.clone();
            async move {
                if event.campaign_id() != &campaign {
                    return Ok(());
                }
                let message = wire::event_to_wire(&event);
                if message.is_snapshot() {
                    outbound.push_snapshot(message);
                    return Ok(());
                }
                if outbound.push_event(message, EVENT_PUSH_TIMEOUT).await.is_err() {
                    warn!(campaign = %campaign, "outbound buffer overflow, closing session");
                    outbound.close();
                }
                Ok(())
            }
            .boxed()
        });
        // A fresh subscribe replaces the previous binding.
        self.subscription = Some(subscription);
    }

    /// Legacy convenience: subscribe and start in one message.
    async fn auto_start(&mut self, data: serde_json::Value) {
        match self.resolve_start_target(data).await {
            Ok(campaign_id) => {
                self.bind_subscription(&campaign_id);
                self.push(wire::stream_started(&campaign_id)).await;
                let reply = match self.state.service.start(&campaign_id).await {
                    Ok(()) => wire::command_result(
                        true,
                        json!({ "campaign_id": campaign_id.to_text(), "started": true }),
                        None,
                    ),
                    Err(e) => wire::command_result(false, json!(null), Some(&e.to_string())),
                };
                self.push(reply).await;
            }
            Err(e) => {
                self.push(wire::command_result(false, json!(null), Some(&e.to_string())))
                    .await;
            }
        }
    }

    // ── Helpers ─────────────────────────────────────────────────

    fn campaign_ref(&self, data: serde_json::Value) -> Result<CampaignId, Error> {
        let reference: CampaignRef = serde_json::from_value(data)
            .map_err(|e| Error::Protocol(format!("bad payload: {e}")))?;
        let raw = reference
            .campaign_id
            .ok_or_else(|| Error::Protocol("campaign_id is required".into()))?;
        raw.parse()
            .map_err(|e| Error::Validation(format!("bad campaign id {raw:?}: {e}")))
    }

    async fn push(&self, message: OutboundMessage) {
        if self
            .outbound
            .push_event(message, EVENT_PUSH_TIMEOUT)
            .await
            .is_err()
        {
            self.outbound.close();
        }
    }
}

fn command_outcome(result: Result<serde_json::Value, Error>) -> OutboundMessage {
    match result {
        Ok(payload) => wire::command_result(true, payload, None),
        Err(e) => wire::command_result(false, json!(null), Some(&e.to_string())),
    }
}
