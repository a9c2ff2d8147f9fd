//! Property-based tests for identifiers, fingerprints, and wire mappings.
//!
//! # How to run
//!
//! ```bash
//! cargo test --test property_tests
//! PROPTEST_CASES=10000 cargo test --test property_tests
//! ```
//!
//! No database or network access required.

use chrono::TimeZone;
use placehound::domain::{campaign_title, place_fingerprint, Coordinates, ExtractedPlace, PlaceReview};
use placehound::ids::{CampaignId, PlaceId, TaskId};
use placehound::wire::{format_timestamp, parse_timestamp, place_from_wire, place_to_wire};
use proptest::prelude::*;

/// A UTC timestamp with microsecond precision, the finest the wire format
/// carries.
fn arb_timestamp() -> impl Strategy<Value = chrono::DateTime<chrono::Utc>> {
    // 1970 through 2099.
    (0i64..4_102_444_800, 0u32..1_000_000).prop_map(|(secs, micros)| {
        chrono::Utc
            .timestamp_opt(secs, micros * 1_000)
            .single()
            .expect("in-range timestamp")
    })
}

proptest! {
    /// The fingerprint ignores case and surrounding whitespace in name and
    /// address: the same listing scraped twice must fold to one row.
    #[test]
    fn prop_fingerprint_normalization_invariant(
        name in "[a-zA-Z0-9 ]{1,40}",
        address in "[a-zA-Z0-9 ]{1,40}",
        left_pad in " {0,3}",
        right_pad in " {0,3}",
    ) {
        let task = TaskId::generate();
        let plain = place_fingerprint(&task, &name, &address);
        let shouted = place_fingerprint(
            &task,
            &format!("{left_pad}{}{right_pad}", name.to_uppercase()),
            &format!("{right_pad}{}{left_pad}", address.to_lowercase()),
        );
        prop_assert_eq!(&plain, &shouted);
        prop_assert_eq!(plain.len(), 64);
        prop_assert!(plain.chars().all(|c| c.is_ascii_hexdigit()));
    }

    /// Fingerprints are scoped to the task: the same listing under two tasks
    /// is two observations.
    #[test]
    fn prop_fingerprint_scoped_by_task(
        name in "[a-zA-Z0-9 ]{1,40}",
        address in "[a-zA-Z0-9 ]{1,40}",
    ) {
        let a = place_fingerprint(&TaskId::generate(), &name, &address);
        let b = place_fingerprint(&TaskId::generate(), &name, &address);
        prop_assert_ne!(a, b);
    }

    /// Identifier text round-trips through parse regardless of input case.
    #[test]
    fn prop_id_text_round_trips(_seed in any::<u8>()) {
        let id = CampaignId::generate();
        let text = id.to_text();
        prop_assert_eq!(text.len(), 26);
        let reparsed: CampaignId = text.parse().unwrap();
        prop_assert_eq!(&reparsed, &id);
        let relaxed: CampaignId = text.to_lowercase().parse().unwrap();
        prop_assert_eq!(&relaxed, &id);
    }

    /// Arbitrary junk never parses as an identifier unless it is exactly 26
    /// alphabet characters.
    #[test]
    fn prop_id_rejects_junk(junk in "[a-zA-Z0-9!@# ]{0,40}") {
        if junk.len() != 26 {
            prop_assert!(junk.parse::<TaskId>().is_err());
        }
    }

    /// Wire timestamps parse back to the exact instant they were formatted
    /// from.
    #[test]
    fn prop_timestamp_round_trips(at in arb_timestamp()) {
        let text = format_timestamp(&at);
        prop_assert!(text.ends_with('Z'));
        let back = parse_timestamp(&text).unwrap();
        prop_assert_eq!(back, at);
    }

    /// `to_wire(place) -> from_wire -> to_wire` is identity.
    #[test]
    fn prop_place_wire_round_trip(
        name in "[a-zA-Z0-9 ]{1,40}",
        address in "[a-zA-Z0-9 ]{1,40}",
        city in "[a-zA-Z ]{1,20}",
        rating in proptest::option::of(0.0f64..=5.0),
        review_count in proptest::option::of(0i64..1_000_000),
        has_coords in any::<bool>(),
        latitude in -90.0f64..=90.0,
        longitude in -180.0f64..=180.0,
        extracted_at in arb_timestamp(),
        review_rating in 0.0f64..=5.0,
        review_text in "[a-zA-Z0-9 ]{0,60}",
        posted_at in arb_timestamp(),
    ) {
        let task_id = TaskId::generate();
        let place = ExtractedPlace {
            id: PlaceId::generate(),
            fingerprint: place_fingerprint(&task_id, &name, &address),
            source_task_id: task_id,
            name,
            address,
            city,
            category: "point_of_interest".into(),
            rating,
            review_count,
            phone: None,
            website: Some("https://example.com".into()),
            coordinates: has_coords.then_some(Coordinates { latitude, longitude }),
            extracted_at,
            reviews: vec![PlaceReview {
                author: "reviewer".into(),
                rating: review_rating,
                text: review_text,
                posted_at,
            }],
        };
        let wire = place_to_wire(&place);
        let back = place_from_wire(&wire).unwrap();
        prop_assert_eq!(place_to_wire(&back), wire);
    }

    /// Titles always lead with an upper-case activity and keep the location
    /// verbatim.
    #[test]
    fn prop_title_capitalizes(
        activity in "[a-z][a-z ]{0,20}",
        location in "[A-Za-z][A-Za-z ]{0,20}",
    ) {
        let title = campaign_title(&activity, &location);
        let first = title.chars().next().unwrap();
        prop_assert!(first.is_uppercase() || !first.is_alphabetic());
        prop_assert!(title.contains(" in "));
        prop_assert!(title.ends_with(location.trim()));
    }
}

/// Sequential generation produces strictly increasing textual ids; this is
/// what makes `ORDER BY id` a creation-time ordering.
#[test]
fn ids_generated_in_sequence_sort() {
    let ids: Vec<String> = (0..500).map(|_| TaskId::generate().to_text()).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
}
