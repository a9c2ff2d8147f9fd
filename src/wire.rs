//! Domain ↔ wire conversion.
//!
//! Everything that crosses the HTTP or WebSocket boundary goes through an
//! explicit mapper in this module: binary screenshots become base64 PNG,
//! timestamps become `YYYY-MM-DDTHH:MM:SS.ffffffZ`, and status enums become
//! their string names. Never raw bytes, never numeric ordinals. Each event
//! variant has its own mapping; gateway dispatch is a match on the variant.

use crate::domain::{Campaign, ExtractedPlace, PlaceExtractionTask, PlaceReview};
use crate::error::{Error, Result};
use crate::events::DomainEvent;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

// ── Timestamps ──────────────────────────────────────────────────

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    let trimmed = text
        .strip_suffix('Z')
        .ok_or_else(|| Error::Validation(format!("timestamp {text:?} is not UTC")))?;
    let naive = chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|e| Error::Validation(format!("bad timestamp {text:?}: {e}")))?;
    Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
}

fn optional_timestamp(at: &Option<DateTime<Utc>>) -> Option<String> {
    at.as_ref().map(format_timestamp)
}

// ── Client envelopes ────────────────────────────────────────────

/// Everything a client may send over the extraction stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    Command {
        command: String,
        #[serde(default)]
        data: serde_json::Value,
    },
    Query {
        query: String,
        #[serde(default)]
        data: serde_json::Value,
    },
    Subscribe {
        #[serde(default)]
        data: serde_json::Value,
    },
    /// Legacy convenience: subscribe and start in one message.
    AutoStart {
        #[serde(default)]
        data: serde_json::Value,
    },
}

// ── Outbound messages ───────────────────────────────────────────

/// One JSON message headed for a client, tagged so the outbound queue can
/// apply its snapshot-coalescing policy without reparsing.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub message_type: &'static str,
    pub body: serde_json::Value,
}

impl OutboundMessage {
    fn new(message_type: &'static str, data: serde_json::Value) -> Self {
        OutboundMessage {
            message_type,
            body: json!({ "type": message_type, "data": data }),
        }
    }

    pub fn is_snapshot(&self) -> bool {
        self.message_type == "bot_snapshot"
    }

    pub fn to_json(&self) -> String {
        self.body.to_string()
    }
}

pub fn command_result(success: bool, payload: serde_json::Value, error: Option<&str>) -> OutboundMessage {
    OutboundMessage {
        message_type: "command_result",
        body: json!({
            "type": "command_result",
            "success": success,
            "result": payload,
            "error": error,
        }),
    }
}

pub fn query_result(success: bool, payload: serde_json::Value, error: Option<&str>) -> OutboundMessage {
    OutboundMessage {
        message_type: "query_result",
        body: json!({
            "type": "query_result",
            "success": success,
            "result": payload,
            "error": error,
        }),
    }
}

pub fn stream_started(campaign_id: &crate::ids::CampaignId) -> OutboundMessage {
    OutboundMessage::new("stream_started", json!({ "campaign_id": campaign_id.to_text() }))
}

pub fn protocol_error(message: &str) -> OutboundMessage {
    OutboundMessage {
        message_type: "error",
        body: json!({ "type": "error", "message": message }),
    }
}

/// Map a domain event to its wire form. Snapshots become `bot_snapshot`,
/// driver failures `bot_error`, and every other lifecycle event rides in a
/// `bot_status` envelope discriminated by `data.event`.
pub fn event_to_wire(event: &DomainEvent) -> OutboundMessage {
    match event {
        DomainEvent::BotInitialized { campaign_id, bot_id } => OutboundMessage::new(
            "bot_status",
            json!({
                "event": "bot_initialized",
                "campaign_id": campaign_id.to_text(),
                "bot_id": bot_id,
            }),
        ),
        DomainEvent::BotTaskAssigned {
            campaign_id,
            bot_id,
            task_id,
            geoname_name,
        } => OutboundMessage::new(
            "bot_status",
            json!({
                "event": "bot_task_assigned",
                "campaign_id": campaign_id.to_text(),
                "bot_id": bot_id,
                "task_id": task_id.to_text(),
                "geoname_name": geoname_name,
            }),
        ),
        DomainEvent::BotSnapshotCaptured {
            campaign_id,
            bot_id,
            task_id,
            screenshot,
            url,
            captured_at,
        } => OutboundMessage::new(
            "bot_snapshot",
            json!({
                "campaign_id": campaign_id.to_text(),
                "bot_id": bot_id,
                "task_id": task_id.to_text(),
                "screenshot": base64::engine::general_purpose::STANDARD.encode(screenshot),
                "url": url,
                "captured_at": format_timestamp(captured_at),
            }),
        ),
        DomainEvent::BotTaskCompleted {
            campaign_id,
            bot_id,
            task_id,
            places_extracted,
        } => OutboundMessage::new(
            "bot_status",
            json!({
                "event": "bot_task_completed",
                "campaign_id": campaign_id.to_text(),
                "bot_id": bot_id,
                "task_id": task_id.to_text(),
                "places_extracted": places_extracted,
            }),
        ),
        DomainEvent::BotError {
            campaign_id,
            bot_id,
            task_id,
            message,
        } => OutboundMessage::new(
            "bot_error",
            json!({
                "campaign_id": campaign_id.to_text(),
                "bot_id": bot_id,
                "task_id": task_id.as_ref().map(|id| id.to_text()),
                "message": message,
            }),
        ),
        DomainEvent::BotClosed { campaign_id, bot_id } => OutboundMessage::new(
            "bot_status",
            json!({
                "event": "bot_closed",
                "campaign_id": campaign_id.to_text(),
                "bot_id": bot_id,
            }),
        ),
        DomainEvent::TaskStarted {
            campaign_id,
            task_id,
            geoname_id,
            geoname_name,
            attempt,
            started_at,
        } => OutboundMessage::new(
            "bot_status",
            json!({
                "event": "task_started",
                "campaign_id": campaign_id.to_text(),
                "task_id": task_id.to_text(),
                "geoname_id": geoname_id,
                "geoname_name": geoname_name,
                "attempt": attempt,
                "started_at": format_timestamp(started_at),
            }),
        ),
        DomainEvent::PlaceExtracted {
            campaign_id,
            task_id,
            place_id,
            name,
        } => OutboundMessage::new(
            "bot_status",
            json!({
                "event": "place_extracted",
                "campaign_id": campaign_id.to_text(),
                "task_id": task_id.to_text(),
                "place_id": place_id.to_text(),
                "name": name,
            }),
        ),
        DomainEvent::TaskCompleted {
            campaign_id,
            task_id,
            places_extracted,
            completed_at,
        } => OutboundMessage::new(
            "bot_status",
            json!({
                "event": "task_completed",
                "campaign_id": campaign_id.to_text(),
                "task_id": task_id.to_text(),
                "places_extracted": places_extracted,
                "completed_at": format_timestamp(completed_at),
            }),
        ),
        DomainEvent::TaskFailed {
            campaign_id,
            task_id,
            error,
            attempts,
            failed_at,
        } => OutboundMessage::new(
            "bot_status",
            json!({
                "event": "task_failed",
                "campaign_id": campaign_id.to_text(),
                "task_id": task_id.to_text(),
                "error": error,
                "attempts": attempts,
                "failed_at": format_timestamp(failed_at),
            }),
        ),
    }
}

// ── Entity DTOs ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignWire {
    pub campaign_id: String,
    pub title: String,
    pub activity: String,
    pub country_code: String,
    pub admin1_code: Option<String>,
    pub admin2_code: Option<String>,
    pub city_geoname_id: Option<i64>,
    pub location_name: String,
    pub iso_language: String,
    pub locale: String,
    pub max_results: i32,
    pub min_rating: Option<f64>,
    pub min_population: i64,
    pub max_bots: i32,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub status: String,
}

pub fn campaign_to_wire(campaign: &Campaign) -> CampaignWire {
    CampaignWire {
        campaign_id: campaign.id.to_text(),
        title: campaign.title.clone(),
        activity: campaign.activity.clone(),
        country_code: campaign.country_code.clone(),
        admin1_code: campaign.admin1_code.clone(),
        admin2_code: campaign.admin2_code.clone(),
        city_geoname_id: campaign.city_geoname_id,
        location_name: campaign.location_name.clone(),
        iso_language: campaign.iso_language.clone(),
        locale: campaign.locale.clone(),
        max_results: campaign.max_results,
        min_rating: campaign.min_rating,
        min_population: campaign.min_population,
        max_bots: campaign.max_bots,
        total_tasks: campaign.total_tasks,
        completed_tasks: campaign.completed_tasks,
        failed_tasks: campaign.failed_tasks,
        created_at: format_timestamp(&campaign.created_at),
        started_at: optional_timestamp(&campaign.started_at),
        completed_at: optional_timestamp(&campaign.completed_at),
        status: campaign.status.as_str().to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskWire {
    pub task_id: String,
    pub campaign_id: String,
    pub geoname_id: i64,
    pub geoname_name: String,
    pub search_seed: String,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

pub fn task_to_wire(task: &PlaceExtractionTask) -> TaskWire {
    TaskWire {
        task_id: task.id.to_text(),
        campaign_id: task.campaign_id.to_text(),
        geoname_id: task.geoname_id,
        geoname_name: task.geoname_name.clone(),
        search_seed: task.search_seed.clone(),
        status: task.status.as_str().to_string(),
        attempts: task.attempts,
        last_error: task.last_error.clone(),
        started_at: optional_timestamp(&task.started_at),
        completed_at: optional_timestamp(&task.completed_at),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewWire {
    pub author: String,
    pub rating: f64,
    pub text: String,
    pub posted_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaceWire {
    pub place_id: String,
    pub source_task_id: String,
    pub fingerprint: String,
    pub name: String,
    pub address: String,
    pub city: String,
    pub category: String,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub extracted_at: String,
    pub reviews: Vec<ReviewWire>,
}

pub fn place_to_wire(place: &ExtractedPlace) -> PlaceWire {
    PlaceWire {
        place_id: place.id.to_text(),
        source_task_id: place.source_task_id.to_text(),
        fingerprint: place.fingerprint.clone(),
        name: place.name.clone(),
        address: place.address.clone(),
        city: place.city.clone(),
        category: place.category.clone(),
        rating: place.rating,
        review_count: place.review_count,
        phone: place.phone.clone(),
        website: place.website.clone(),
        latitude: place.coordinates.map(|c| c.latitude),
        longitude: place.coordinates.map(|c| c.longitude),
        extracted_at: format_timestamp(&place.extracted_at),
        reviews: place
            .reviews
            .iter()
            .map(|review| ReviewWire {
                author: review.author.clone(),
                rating: review.rating,
                text: review.text.clone(),
                posted_at: format_timestamp(&review.posted_at),
            })
            .collect(),
    }
}

pub fn place_from_wire(wire: &PlaceWire) -> Result<ExtractedPlace> {
    let coordinates = match (wire.latitude, wire.longitude) {
        (Some(latitude), Some(longitude)) => {
            Some(crate::domain::Coordinates { latitude, longitude })
        }
        _ => None,
    };
    Ok(ExtractedPlace {
        id: wire
            .place_id
            .parse()
            .map_err(|e| Error::Validation(format!("bad place id: {e}")))?,
        source_task_id: wire
            .source_task_id
            .parse()
            .map_err(|e| Error::Validation(format!("bad task id: {e}")))?,
        fingerprint: wire.fingerprint.clone(),
        name: wire.name.clone(),
        address: wire.address.clone(),
        city: wire.city.clone(),
        category: wire.category.clone(),
        rating: wire.rating,
        review_count: wire.review_count,
        phone: wire.phone.clone(),
        website: wire.website.clone(),
        coordinates,
        extracted_at: parse_timestamp(&wire.extracted_at)?,
        reviews: wire
            .reviews
            .iter()
            .map(|review| {
                Ok(PlaceReview {
                    author: review.author.clone(),
                    rating: review.rating,
                    text: review.text.clone(),
                    posted_at: parse_timestamp(&review.posted_at)?,
                })
            })
            .collect::<Result<Vec<_>>>()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{place_fingerprint, Coordinates};
    use crate::ids::{CampaignId, PlaceId, TaskId};
    use chrono::TimeZone;

    fn place() -> ExtractedPlace {
        let task_id = TaskId::generate();
        ExtractedPlace {
            id: PlaceId::generate(),
            fingerprint: place_fingerprint(&task_id, "Casa Lucio", "Calle Cava Baja 35"),
            source_task_id: task_id,
            name: "Casa Lucio".into(),
            address: "Calle Cava Baja 35".into(),
            city: "Madrid".into(),
            category: "restaurant".into(),
            rating: Some(4.4),
            review_count: Some(5123),
            phone: Some("+34 913 65 32 52".into()),
            website: None,
            coordinates: Some(Coordinates { latitude: 40.411, longitude: -3.709 }),
            extracted_at: Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap(),
            reviews: vec![PlaceReview {
                author: "ana".into(),
                rating: 5.0,
                text: "huevos rotos".into(),
                posted_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            }],
        }
    }

    #[test]
    fn timestamp_format_matches_contract() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        assert_eq!(format_timestamp(&at), "2026-03-14T09:26:53.000000Z");
    }

    #[test]
    fn timestamp_parse_accepts_optional_fraction() {
        assert!(parse_timestamp("2026-03-14T09:26:53Z").is_ok());
        assert!(parse_timestamp("2026-03-14T09:26:53.123456Z").is_ok());
        assert!(parse_timestamp("2026-03-14T09:26:53").is_err());
        assert!(parse_timestamp("garbage").is_err());
    }

    #[test]
    fn timestamp_round_trips() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap()
            + chrono::Duration::microseconds(123_456);
        assert_eq!(parse_timestamp(&format_timestamp(&at)).unwrap(), at);
    }

    #[test]
    fn place_wire_round_trip_is_identity() {
        let original = place();
        let wire = place_to_wire(&original);
        let back = place_from_wire(&wire).unwrap();
        assert_eq!(place_to_wire(&back), wire);
    }

    #[test]
    fn snapshot_event_is_base64_png() {
        let event = DomainEvent::BotSnapshotCaptured {
            campaign_id: CampaignId::generate(),
            bot_id: 1,
            task_id: TaskId::generate(),
            screenshot: vec![0x89, b'P', b'N', b'G'],
            url: "https://maps.example.com".into(),
            captured_at: Utc::now(),
        };
        let message = event_to_wire(&event);
        assert!(message.is_snapshot());
        let data = &message.body["data"];
        assert_eq!(data["screenshot"], "iVBORw==");
        assert_eq!(message.body["type"], "bot_snapshot");
    }

    #[test]
    fn statuses_cross_as_string_names() {
        let event = DomainEvent::TaskFailed {
            campaign_id: CampaignId::generate(),
            task_id: TaskId::generate(),
            error: "boom".into(),
            attempts: 2,
            failed_at: Utc::now(),
        };
        let message = event_to_wire(&event);
        assert_eq!(message.message_type, "bot_status");
        assert_eq!(message.body["data"]["event"], "task_failed");
        assert_eq!(message.body["data"]["attempts"], 2);
    }

    #[test]
    fn client_envelope_parses_all_types() {
        let command: ClientEnvelope = serde_json::from_str(
            r#"{"type":"command","command":"start_extraction","data":{"campaign_id":"x"}}"#,
        )
        .unwrap();
        assert!(matches!(command, ClientEnvelope::Command { .. }));

        let query: ClientEnvelope =
            serde_json::from_str(r#"{"type":"query","query":"get_status","data":{}}"#).unwrap();
        assert!(matches!(query, ClientEnvelope::Query { .. }));

        let subscribe: ClientEnvelope =
            serde_json::from_str(r#"{"type":"subscribe","data":{"campaign_id":"x"}}"#).unwrap();
        assert!(matches!(subscribe, ClientEnvelope::Subscribe { .. }));

        let auto: ClientEnvelope =
            serde_json::from_str(r#"{"type":"auto_start","data":{}}"#).unwrap();
        assert!(matches!(auto, ClientEnvelope::AutoStart { .. }));
    }

    #[test]
    fn unknown_envelope_type_is_rejected() {
        let result: std::result::Result<ClientEnvelope, _> =
            serde_json::from_str(r#"{"type":"shout","data":{}}"#);
        assert!(result.is_err());
    }
}
