//! Cached client for the external geonames hierarchy service.
//!
//! Country, region, province, and city lookups are plain GETs against
//! `GEONAMES_BASE_URL`, cached by full request path for an hour. Campaign
//! creation resolves its geographic scope through [`GeonamesClient::resolve_scope`].

use crate::error::{Error, Result};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

const CACHE_CAPACITY: usize = 256;
const CACHE_TTL: Duration = Duration::from_secs(3_600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Country {
    pub code: String,
    pub name: String,
    pub population: i64,
    pub languages: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub geoname_id: i64,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct City {
    pub geoname_id: i64,
    pub code: String,
    pub name: String,
    pub population: i64,
}

/// One resolved city a campaign task is materialized for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CityRef {
    pub geoname_id: i64,
    pub name: String,
}

pub struct GeonamesClient {
    base_url: String,
    http: reqwest::Client,
    cache: Mutex<LruCache<String, (Instant, serde_json::Value)>>,
}

impl GeonamesClient {
    pub fn new(base_url: &str) -> Self {
        GeonamesClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub async fn countries(&self) -> Result<Vec<Country>> {
        self.get_cached("/countries").await
    }

    pub async fn regions(&self, country_code: &str) -> Result<Vec<Region>> {
        self.get_cached(&format!("/countries/{country_code}/regions"))
            .await
    }

    pub async fn provinces(&self, country_code: &str, admin1_code: &str) -> Result<Vec<Region>> {
        self.get_cached(&format!(
            "/countries/{country_code}/provinces?admin1_code={}",
            urlencoding::encode(admin1_code)
        ))
        .await
    }

    pub async fn cities(
        &self,
        country_code: &str,
        admin1_code: Option<&str>,
        admin2_code: Option<&str>,
        min_population: i64,
    ) -> Result<Vec<City>> {
        let mut path = format!(
            "/countries/{country_code}/cities?min_population={min_population}"
        );
        if let Some(admin1) = admin1_code {
            path.push_str(&format!("&admin1_code={}", urlencoding::encode(admin1)));
        }
        if let Some(admin2) = admin2_code {
            path.push_str(&format!("&admin2_code={}", urlencoding::encode(admin2)));
        }
        self.get_cached(&path).await
    }

    /// Resolve a campaign's geographic scope to the list of cities its tasks
    /// are materialized for. A `city_geoname_id` pins the scope to one city;
    /// otherwise every city in the narrowest given admin level at or above
    /// `min_population` qualifies.
    pub async fn resolve_scope(
        &self,
        country_code: &str,
        admin1_code: Option<&str>,
        admin2_code: Option<&str>,
        city_geoname_id: Option<i64>,
        min_population: i64,
    ) -> Result<Vec<CityRef>> {
        let cities = self
            .cities(country_code, admin1_code, admin2_code, min_population)
            .await?;
        let resolved: Vec<CityRef> = match city_geoname_id {
            Some(wanted) => cities
                .into_iter()
                .filter(|city| city.geoname_id == wanted)
                .map(|city| CityRef {
                    geoname_id: city.geoname_id,
                    name: city.name,
                })
                .collect(),
            None => cities
                .into_iter()
                .map(|city| CityRef {
                    geoname_id: city.geoname_id,
                    name: city.name,
                })
                .collect(),
        };
        if resolved.is_empty() {
            return Err(Error::Validation(
                "geographic scope resolves to no cities".into(),
            ));
        }
        Ok(resolved)
    }

    async fn get_cached<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        if let Some(value) = self.cache_lookup(path) {
            return serde_json::from_value(value)
                .map_err(|e| Error::Fatal(format!("corrupt geonames cache entry: {e}")));
        }
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "geonames fetch");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("geonames request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Transient(format!(
                "geonames returned {} for {path}",
                response.status()
            )));
        }
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Transient(format!("geonames returned invalid JSON: {e}")))?;
        self.cache_store(path, value.clone());
        serde_json::from_value(value)
            .map_err(|e| Error::Transient(format!("unexpected geonames payload: {e}")))
    }

    fn cache_lookup(&self, path: &str) -> Option<serde_json::Value> {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        match cache.get(path) {
            Some((stored_at, value)) if stored_at.elapsed() < CACHE_TTL => Some(value.clone()),
            Some(_) => {
                cache.pop(path);
                None
            }
            None => None,
        }
    }

    fn cache_store(&self, path: &str, value: serde_json::Value) {
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .put(path.to_string(), (Instant::now(), value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    async fn mock_geonames(hits: Arc<AtomicU32>) -> String {
        let cities = get(
            move |State(hits): State<Arc<AtomicU32>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Json(serde_json::json!([
                    { "geoname_id": 3117735, "code": "MAD", "name": "Madrid", "population": 3_223_334 },
                    { "geoname_id": 3128760, "code": "ALC", "name": "Alcalá de Henares", "population": 196_888 }
                ]))
            },
        );
        let app = Router::new()
            .route("/countries/{cc}/cities", cities)
            .with_state(hits);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn cities_are_fetched_and_cached() {
        let hits = Arc::new(AtomicU32::new(0));
        let base = mock_geonames(Arc::clone(&hits)).await;
        let client = GeonamesClient::new(&base);

        let first = client.cities("ES", Some("MD"), None, 15_000).await.unwrap();
        let second = client.cities("ES", Some("MD"), None, 15_000).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_filters_miss_the_cache() {
        let hits = Arc::new(AtomicU32::new(0));
        let base = mock_geonames(Arc::clone(&hits)).await;
        let client = GeonamesClient::new(&base);

        client.cities("ES", Some("MD"), None, 15_000).await.unwrap();
        client.cities("ES", Some("MD"), None, 50_000).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn resolve_scope_returns_all_cities() {
        let hits = Arc::new(AtomicU32::new(0));
        let base = mock_geonames(hits).await;
        let client = GeonamesClient::new(&base);

        let cities = client
            .resolve_scope("ES", Some("MD"), None, None, 15_000)
            .await
            .unwrap();
        assert_eq!(
            cities,
            vec![
                CityRef { geoname_id: 3117735, name: "Madrid".into() },
                CityRef { geoname_id: 3128760, name: "Alcalá de Henares".into() },
            ]
        );
    }

    #[tokio::test]
    async fn resolve_scope_pins_to_one_city() {
        let hits = Arc::new(AtomicU32::new(0));
        let base = mock_geonames(hits).await;
        let client = GeonamesClient::new(&base);

        let cities = client
            .resolve_scope("ES", Some("MD"), None, Some(3117735), 0)
            .await
            .unwrap();
        assert_eq!(cities.len(), 1);
        assert_eq!(cities[0].name, "Madrid");
    }

    #[tokio::test]
    async fn resolve_scope_rejects_empty_result() {
        let hits = Arc::new(AtomicU32::new(0));
        let base = mock_geonames(hits).await;
        let client = GeonamesClient::new(&base);

        let err = client
            .resolve_scope("ES", Some("MD"), None, Some(999), 0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[tokio::test]
    async fn unreachable_service_is_transient() {
        let client = GeonamesClient::new("http://127.0.0.1:1");
        let err = client.countries().await.unwrap_err();
        assert_eq!(err.code(), "transient");
    }
}
