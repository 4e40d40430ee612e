//! Cache-then-fetch access to observations, taxa, places and OSM ways
//!
//! Every operation derives a [`CacheKey`] from its parameters, answers from
//! the [`DiskCache`] when it can and otherwise fetches, decodes into typed
//! records and stores the result. Results with missing parts (a sub-request
//! answered with an error envelope) are returned but not stored, so the next
//! run asks again.

use crate::api::{ApiRequest, FetchOutcome, Fetcher, RateLimiter, Transport};
use crate::cache::{CacheKey, DiskCache};
use crate::config::ApiConfig;
use crate::model::{
    ObservationQuery, OsmData, OverpassResponse, PlaceRecord, PlacesNearby, RawObservation,
    TaxonRecord, decode_items, taxon_fields,
};
use crate::utils::{BoundingBox, PLACES_PRECISION, TRAILS_PRECISION};
use crate::{Error, Result};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Retrieval facade over the iNaturalist and Overpass APIs
///
/// Each API gets its own [`RateLimiter`]; the two call budgets are independent.
pub struct Retriever {
    cache: Arc<DiskCache>,
    inat: Fetcher,
    overpass: Fetcher,
    inat_v1_url: String,
    inat_v2_url: String,
    overpass_url: String,
}

impl Retriever {
    pub fn new(cache: Arc<DiskCache>, transport: Arc<dyn Transport>, config: &ApiConfig) -> Self {
        let inat_limiter = Arc::new(RateLimiter::new(config.call_limit, config.call_window));
        let overpass_limiter = Arc::new(RateLimiter::new(config.call_limit, config.call_window));
        Self {
            cache,
            inat: Fetcher::new(Arc::clone(&transport), inat_limiter, config),
            overpass: Fetcher::new(transport, overpass_limiter, config),
            inat_v1_url: config.inat_v1_url.trim_end_matches('/').to_string(),
            inat_v2_url: config.inat_v2_url.trim_end_matches('/').to_string(),
            overpass_url: config.overpass_url.clone(),
        }
    }

    #[inline]
    pub fn cache(&self) -> &DiskCache {
        &self.cache
    }

    /// Observations within the query's bounding box matching its filters
    pub async fn fetch_observations(&self, query: &ObservationQuery) -> Result<Vec<RawObservation>> {
        let key = CacheKey::observations(query);
        self.cached(&key, move || async move {
            let url = format!("{}/observations", self.inat_v2_url);
            let fetched = self.inat.fetch_all_pages(&url, &query.params()).await?;
            let items = fetched.outcome.into_list("observations")?;
            let observations: Vec<RawObservation> = decode_items("observations", items);
            tracing::info!("Downloaded {} observations", observations.len());
            Ok::<_, Error>((observations, fetched.complete))
        })
        .await
    }

    /// Taxa by id, in ascending id order
    ///
    /// All taxa ever fetched are kept in one cache entry. Only ids missing
    /// from it are requested, and the entry is rewritten only when it grew.
    /// Ids the provider does not know are absent from the result.
    pub async fn fetch_taxa_by_ids(&self, ids: &[u64]) -> Result<Vec<TaxonRecord>> {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let key = CacheKey::taxa();
        let mut known: BTreeMap<u64, TaxonRecord> = self.cache_get(&key).await?.unwrap_or_default();
        let missing: Vec<u64> = ids
            .iter()
            .copied()
            .filter(|id| !known.contains_key(id))
            .collect();

        if !missing.is_empty() {
            tracing::debug!("{} of {} taxa not cached", missing.len(), ids.len());
            let url = format!("{}/taxa", self.inat_v2_url);
            let params = [("fields".to_string(), taxon_fields())];
            let fetched = self.inat.fetch_in_batches(&url, &missing, &params).await?;
            let taxa: Vec<TaxonRecord> = decode_items("taxa", fetched.outcome.into_list("taxa")?);

            let before = known.len();
            known.extend(taxa.into_iter().map(|taxon| (taxon.id, taxon)));
            if known.len() > before {
                known = self.cache_put(&key, known).await?;
            }
        }

        Ok(ids.iter().filter_map(|id| known.remove(id)).collect())
    }

    /// Standard and community places overlapping `bbox`
    pub async fn fetch_places_nearby(&self, bbox: &BoundingBox) -> Result<PlacesNearby> {
        let key = CacheKey::places_nearby(bbox);
        self.cached(&key, move || async move {
            let bbox = bbox.quantize(PLACES_PRECISION);
            let url = format!("{}/places/nearby", self.inat_v1_url);
            let params = [
                ("nelat".to_string(), bbox.max_lat.to_string()),
                ("nelng".to_string(), bbox.max_lon.to_string()),
                ("swlat".to_string(), bbox.min_lat.to_string()),
                ("swlng".to_string(), bbox.min_lon.to_string()),
            ];
            let fetched = self.inat.fetch_all_pages(&url, &params).await?;
            let places = match fetched.outcome.into_object("places/nearby")? {
                Some(results) => serde_json::from_value(results)?,
                None => PlacesNearby::default(),
            };
            Ok::<_, Error>((places, fetched.complete))
        })
        .await
    }

    /// Places by id, in ascending id order
    pub async fn fetch_places_by_ids(&self, ids: &[u64]) -> Result<Vec<PlaceRecord>> {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let key = CacheKey::places_by_ids(&ids);
        let ids = ids.as_slice();
        self.cached(&key, move || async move {
            let url = format!("{}/places", self.inat_v1_url);
            let fetched = self.inat.fetch_in_batches(&url, ids, &[]).await?;
            let places: Vec<PlaceRecord> =
                decode_items("places", fetched.outcome.into_list("places")?);
            Ok::<_, Error>((places, fetched.complete))
        })
        .await
    }

    /// Roads and trails (`highway` ways with their nodes) within `bbox`
    ///
    /// An answer that is not an `elements` document is returned as
    /// [`OverpassResponse::Unparsed`] and not cached.
    pub async fn fetch_ways(&self, bbox: &BoundingBox) -> Result<OverpassResponse> {
        let key = CacheKey::trails(bbox);
        if let Some(data) = self.cache_get::<OsmData>(&key).await? {
            return Ok(OverpassResponse::Elements(data));
        }

        let bbox = bbox.quantize(TRAILS_PRECISION);
        let query = format!(
            "[out:json];\nway[\"highway\"]({},{},{},{});\n(._;>;);\nout;",
            bbox.min_lat, bbox.min_lon, bbox.max_lat, bbox.max_lon
        );
        let request = ApiRequest::post_form(self.overpass_url.as_str(), vec![("data".to_string(), query)]);
        let fetched = self.overpass.fetch_once(request).await?;

        let response = match fetched.outcome {
            FetchOutcome::Object(document) => match OsmData::from_overpass(&document) {
                Some(data) => {
                    tracing::debug!(
                        "Overpass returned {} ways and {} nodes",
                        data.ways.len(),
                        data.nodes.len()
                    );
                    OverpassResponse::Elements(self.cache_put(&key, data).await?)
                }
                None => OverpassResponse::Unparsed(document.to_string()),
            },
            FetchOutcome::Raw(body) => OverpassResponse::Unparsed(body),
            FetchOutcome::List(_) => OverpassResponse::Unparsed(String::new()),
        };
        Ok(response)
    }

    /// Answer from the cache, or run `fetch` and store its result if complete
    async fn cached<T, F, Fut>(&self, key: &CacheKey, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(T, bool)>>,
    {
        if let Some(value) = self.cache_get(key).await? {
            return Ok(value);
        }
        let (value, complete) = fetch().await?;
        if complete {
            self.cache_put(key, value).await
        } else {
            tracing::warn!("Result for {} is incomplete and will not be cached", key);
            Ok(value)
        }
    }

    /// [`DiskCache::get`] on the blocking pool; decompression and file I/O stay off the runtime
    async fn cache_get<T>(&self, key: &CacheKey) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let cache = Arc::clone(&self.cache);
        let key = key.clone();
        tokio::task::spawn_blocking(move || cache.get(&key)).await?
    }

    /// [`DiskCache::put`] on the blocking pool, handing `value` back once stored
    async fn cache_put<T>(&self, key: &CacheKey, value: T) -> Result<T>
    where
        T: Serialize + Send + 'static,
    {
        let cache = Arc::clone(&self.cache);
        let key = key.clone();
        tokio::task::spawn_blocking(move || -> Result<T> {
            cache.put(&key, &value)?;
            Ok(value)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{FakeTransport, page_of_ids};
    use crate::config::CacheConfig;
    use serde_json::json;

    fn retriever(dir: &std::path::Path, transport: Arc<FakeTransport>) -> Retriever {
        let cache = Arc::new(DiskCache::open(&CacheConfig::in_directory(dir)).unwrap());
        Retriever::new(cache, transport, &ApiConfig::default())
    }

    fn observation_page(request: &ApiRequest) -> String {
        let page: u64 = request.param("page").unwrap().parse().unwrap();
        let results: Vec<_> = ((page - 1) * 200 + 1..=(page * 200).min(250))
            .map(|id| json!({"id": id, "location": "37.5,-122.25", "quality_grade": "research"}))
            .collect();
        json!({"total_results": 250, "per_page": 200, "results": results}).to_string()
    }

    fn bbox() -> BoundingBox {
        BoundingBox::new(-122.2555, 37.4955, -122.2445, 37.5045)
    }

    #[tokio::test]
    async fn test_warm_cache_makes_no_calls() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new(|request| Ok(observation_page(request))));
        let query = ObservationQuery::new(bbox());

        let cold = retriever(dir.path(), transport.clone())
            .fetch_observations(&query)
            .await
            .unwrap();
        assert_eq!(transport.calls(), 2);
        assert_eq!(cold.len(), 250);

        let warm = retriever(dir.path(), transport.clone())
            .fetch_observations(&query)
            .await
            .unwrap();
        assert_eq!(transport.calls(), 2);
        assert_eq!(warm, cold);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cache_io_runs_on_blocking_pool() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new(|request| Ok(observation_page(request))));
        let retriever = retriever(dir.path(), transport.clone());
        let query = ObservationQuery::new(bbox());
        let cold = retriever.fetch_observations(&query).await.unwrap();

        let key = CacheKey::observations(&query);
        let stored: Vec<RawObservation> = retriever.cache_get(&key).await.unwrap().unwrap();
        assert_eq!(stored, cold);

        let (a, b, c) = tokio::join!(
            retriever.fetch_observations(&query),
            retriever.fetch_observations(&query),
            retriever.fetch_observations(&query),
        );
        assert_eq!(a.unwrap(), cold);
        assert_eq!(b.unwrap(), cold);
        assert_eq!(c.unwrap(), cold);
        assert_eq!(transport.calls(), 2);

        let missing: Option<Vec<RawObservation>> =
            retriever.cache_get(&CacheKey::trails(&bbox())).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_incomplete_result_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new(|request| {
            match request.param("page") {
                Some("2") => Ok(r#"{"errors":["slow down"],"status":429}"#.to_string()),
                _ => Ok(observation_page(request)),
            }
        }));
        let retriever = retriever(dir.path(), transport.clone());
        let query = ObservationQuery::new(bbox());

        let partial = retriever.fetch_observations(&query).await.unwrap();
        assert_eq!(partial.len(), 200);
        retriever.fetch_observations(&query).await.unwrap();
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test]
    async fn test_taxa_are_merged_into_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new(|request| {
            let ids: Vec<u64> = request
                .url
                .rsplit('/')
                .next()
                .unwrap()
                .split(',')
                .map(|id| id.parse().unwrap())
                .collect();
            let results: Vec<_> = ids
                .iter()
                .map(|id| json!({"id": id, "name": format!("Taxon {id}"), "rank": "species"}))
                .collect();
            Ok(json!({"total_results": ids.len(), "results": results}).to_string())
        }));
        let retriever = retriever(dir.path(), transport.clone());

        let taxa = retriever.fetch_taxa_by_ids(&[2, 1]).await.unwrap();
        assert_eq!(taxa.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(transport.calls(), 1);

        let taxa = retriever.fetch_taxa_by_ids(&[3, 1, 2]).await.unwrap();
        assert_eq!(taxa.len(), 3);
        assert_eq!(transport.calls(), 2);
        assert!(transport.requests()[1].url.ends_with("/taxa/3"));

        let taxa = retriever.fetch_taxa_by_ids(&[3, 1]).await.unwrap();
        assert_eq!(taxa[1].name, "Taxon 3");
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_places_nearby_object_results() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new(|request| {
            assert!(request.url.ends_with("/places/nearby"));
            assert_eq!(request.param("nelat"), Some("37.505"));
            Ok(json!({
                "total_results": 2,
                "page": 1,
                "per_page": 2,
                "results": {
                    "standard": [{"id": 1, "name": "California", "bbox_area": 100.0}],
                    "community": [{"id": 2, "name": "Ridge Park", "bbox_area": 0.1}]
                }
            })
            .to_string())
        }));
        let retriever = retriever(dir.path(), transport.clone());

        let places = retriever.fetch_places_nearby(&bbox()).await.unwrap();
        assert_eq!(places.standard[0].name, "California");
        assert_eq!(places.community[0].id, 2);
        retriever.fetch_places_nearby(&bbox()).await.unwrap();
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_places_by_ids() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new(|_| {
            Ok(page_of_ids(2, 30, [7, 3].into_iter()))
        }));
        let retriever = retriever(dir.path(), transport.clone());

        assert!(retriever.fetch_places_by_ids(&[]).await.unwrap().is_empty());
        assert_eq!(transport.calls(), 0);

        let places = retriever.fetch_places_by_ids(&[7, 3]).await.unwrap();
        assert_eq!(places.iter().map(|p| p.id).collect::<Vec<_>>(), vec![3, 7]);
        retriever.fetch_places_by_ids(&[3, 7]).await.unwrap();
        assert_eq!(transport.calls(), 1);
        assert!(transport.requests()[0].url.ends_with("/places/3,7"));
    }

    #[tokio::test]
    async fn test_ways_are_cached() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new(|request| {
            let form = request.form.as_ref().unwrap();
            assert!(form[0].1.contains("way[\"highway\"](37.49,-122.26,37.51,-122.24)"));
            Ok(json!({
                "elements": [
                    {"type": "node", "id": 1, "lat": 37.5, "lon": -122.25},
                    {"type": "node", "id": 2, "lat": 37.501, "lon": -122.25},
                    {"type": "way", "id": 9, "nodes": [1, 2], "tags": {"highway": "path", "name": "Ridge Trail"}}
                ]
            })
            .to_string())
        }));
        let retriever = retriever(dir.path(), transport.clone());

        let first = retriever.fetch_ways(&bbox()).await.unwrap();
        let second = retriever.fetch_ways(&bbox()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.calls(), 1);
        match first {
            OverpassResponse::Elements(data) => assert_eq!(data.ways.len(), 1),
            other => panic!("expected elements, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unparsed_ways_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new(|_| {
            Ok("<?xml version=\"1.0\"?><osm><remark>runtime error</remark></osm>".to_string())
        }));
        let retriever = retriever(dir.path(), transport.clone());

        let response = retriever.fetch_ways(&bbox()).await.unwrap();
        assert!(matches!(response, OverpassResponse::Unparsed(body) if body.contains("runtime error")));
        retriever.fetch_ways(&bbox()).await.unwrap();
        assert_eq!(transport.calls(), 2);
    }
}
