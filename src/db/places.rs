//! Extracted place rows and their reviews.

use super::{Database, PlaceRow, ReviewRow};
use crate::domain::{ExtractedPlace, PlaceReview};
use crate::error::Result;
use crate::ids::CampaignId;
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;

const PLACE_COLUMNS: &str = "id, source_task_id, fingerprint, name, address, city, category, \
     rating, review_count, phone, website, latitude, longitude, extracted_at";

pub struct PlaceRepo<'a> {
    tx: &'a mut Transaction<'static, Postgres>,
}

impl<'a> PlaceRepo<'a> {
    pub(super) fn new(tx: &'a mut Transaction<'static, Postgres>) -> Self {
        PlaceRepo { tx }
    }

    /// Insert a place, folding duplicates on the fingerprint. Returns whether
    /// a new row was written; reviews are only stored for new rows.
    pub async fn save(&mut self, place: &ExtractedPlace) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO extracted_places
                 (id, source_task_id, fingerprint, name, address, city, category,
                  rating, review_count, phone, website, latitude, longitude, extracted_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             ON CONFLICT (fingerprint) DO NOTHING",
        )
        .bind(place.id.to_text())
        .bind(place.source_task_id.to_text())
        .bind(&place.fingerprint)
        .bind(&place.name)
        .bind(&place.address)
        .bind(&place.city)
        .bind(&place.category)
        .bind(place.rating)
        .bind(place.review_count)
        .bind(&place.phone)
        .bind(&place.website)
        .bind(place.coordinates.map(|c| c.latitude))
        .bind(place.coordinates.map(|c| c.longitude))
        .bind(place.extracted_at)
        .execute(&mut **self.tx)
        .await?
        .rows_affected()
            > 0;

        if inserted {
            for review in &place.reviews {
                sqlx::query(
                    "INSERT INTO extracted_place_reviews (place_id, author, rating, text, posted_at)
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(place.id.to_text())
                .bind(&review.author)
                .bind(review.rating)
                .bind(&review.text)
                .bind(review.posted_at)
                .execute(&mut **self.tx)
                .await?;
            }
        }
        Ok(inserted)
    }
}

// ── Read side ───────────────────────────────────────────────────

impl Database {
    /// Every place extracted under the campaign's tasks, reviews attached.
    pub async fn places_of_campaign(
        &self,
        campaign_id: &CampaignId,
    ) -> Result<Vec<ExtractedPlace>> {
        let query = format!(
            "SELECT {PLACE_COLUMNS} FROM extracted_places
             WHERE source_task_id IN
                 (SELECT id FROM place_extraction_tasks WHERE campaign_id = $1)
             ORDER BY id"
        );
        let place_rows = sqlx::query_as::<_, PlaceRow>(&query)
            .bind(campaign_id.to_text())
            .fetch_all(self.pool())
            .await?;

        let review_rows = sqlx::query_as::<_, ReviewRow>(
            "SELECT r.place_id, r.author, r.rating, r.text, r.posted_at
             FROM extracted_place_reviews r
             JOIN extracted_places p ON p.id = r.place_id
             WHERE p.source_task_id IN
                 (SELECT id FROM place_extraction_tasks WHERE campaign_id = $1)
             ORDER BY r.id",
        )
        .bind(campaign_id.to_text())
        .fetch_all(self.pool())
        .await?;

        let mut reviews_by_place: HashMap<String, Vec<PlaceReview>> = HashMap::new();
        for row in review_rows {
            reviews_by_place
                .entry(row.place_id.trim().to_string())
                .or_default()
                .push(PlaceReview {
                    author: row.author,
                    rating: row.rating,
                    text: row.text,
                    posted_at: row.posted_at,
                });
        }

        place_rows
            .into_iter()
            .map(|row| {
                let reviews = reviews_by_place
                    .remove(row.id.trim())
                    .unwrap_or_default();
                row.into_domain(reviews)
            })
            .collect()
    }
}
