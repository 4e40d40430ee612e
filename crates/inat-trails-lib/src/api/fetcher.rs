//! Rate-limited calls with concurrent page and id-batch fan-out
//!
//! A logical query is expanded into one call per page (or per chunk of ids).
//! The calls run as tasks of a [`JoinSet`] and complete in any order; the
//! merged result is sorted by `id` before it is handed out.
//!
//! Failure policy:
//! - transport errors, timeouts and task panics abort the sibling tasks and
//!   are returned to the caller
//! - provider error envelopes (`errors` and `status` both present) are logged
//!   and count as zero results, siblings proceed
//! - a body that is not JSON is returned verbatim as [`FetchOutcome::Raw`]

use super::{ApiRequest, RateLimiter, Transport};
use crate::config::ApiConfig;
use crate::utils::join_comma;
use crate::{Error, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Merged payload of one logical query
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Items of `results` lists, sorted by `id` and free of duplicates
    List(Vec<Value>),
    /// A `results` object, or the whole document when it has no `results`
    Object(Value),
    /// A response that is not JSON
    Raw(String),
}

impl FetchOutcome {
    /// The list items; an object or raw text is an unexpected response
    pub fn into_list(self, resource: &str) -> Result<Vec<Value>> {
        match self {
            Self::List(items) => Ok(items),
            Self::Object(_) => Err(Error::UnexpectedResponse {
                resource: resource.to_string(),
                detail: "expected a list of results, got an object".to_string(),
            }),
            Self::Raw(body) => Err(non_json(resource, &body)),
        }
    }

    /// The result object; `None` when nothing came back (an empty list)
    pub fn into_object(self, resource: &str) -> Result<Option<Value>> {
        match self {
            Self::Object(object) => Ok(Some(object)),
            Self::List(items) if items.is_empty() => Ok(None),
            Self::List(_) => Err(Error::UnexpectedResponse {
                resource: resource.to_string(),
                detail: "expected a result object, got a list".to_string(),
            }),
            Self::Raw(body) => Err(non_json(resource, &body)),
        }
    }
}

fn non_json(resource: &str, body: &str) -> Error {
    let excerpt: String = body.chars().take(80).collect();
    Error::UnexpectedResponse {
        resource: resource.to_string(),
        detail: format!("response is not JSON: {excerpt:?}"),
    }
}

/// Result of a fetch together with whether every sub-request contributed
///
/// Incomplete results (a sub-request answered with an error envelope or
/// with non-JSON text) are still returned but should not be cached.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub outcome: FetchOutcome,
    pub complete: bool,
}

impl Fetched {
    fn empty(complete: bool) -> Self {
        Self {
            outcome: FetchOutcome::List(Vec::new()),
            complete,
        }
    }

    fn raw(body: String) -> Self {
        Self {
            outcome: FetchOutcome::Raw(body),
            complete: true,
        }
    }
}

/// Classified answer of one call
#[derive(Debug)]
enum Reply {
    Data(Value),
    ErrorEnvelope,
    Raw(String),
}

/// Merges the `results` of many replies of the same resource
enum Merged {
    Empty,
    List(Vec<Value>),
    Object(Value),
}

struct Accumulator<'a> {
    resource: &'a str,
    merged: Merged,
}

impl<'a> Accumulator<'a> {
    fn new(resource: &'a str) -> Self {
        Self {
            resource,
            merged: Merged::Empty,
        }
    }

    fn absorb(&mut self, document: Value) -> Result<()> {
        let results = match document {
            Value::Object(mut map) => match map.remove("results") {
                Some(results) => results,
                None => Value::Object(map),
            },
            other => other,
        };

        self.merged = match (std::mem::replace(&mut self.merged, Merged::Empty), results) {
            (merged, Value::Null) => merged,
            (Merged::Empty, Value::Array(items)) => Merged::List(items),
            (Merged::List(mut list), Value::Array(items)) => {
                list.extend(items);
                Merged::List(list)
            }
            (Merged::Empty, object) => Merged::Object(object),
            (Merged::List(list), object) if list.is_empty() => Merged::Object(object),
            (Merged::Object(existing), Value::Array(items)) if items.is_empty() => {
                Merged::Object(existing)
            }
            _ => {
                return Err(Error::MixedEnvelope {
                    resource: self.resource.to_string(),
                });
            }
        };
        Ok(())
    }

    fn finish(self, complete: bool) -> Fetched {
        let outcome = match self.merged {
            Merged::Empty => FetchOutcome::List(Vec::new()),
            Merged::List(mut items) => {
                items.sort_by_key(id_of);
                items.dedup_by(|a, b| id_of(a).is_some() && id_of(a) == id_of(b));
                FetchOutcome::List(items)
            }
            Merged::Object(object) => FetchOutcome::Object(object),
        };
        Fetched { outcome, complete }
    }
}

fn id_of(item: &Value) -> Option<u64> {
    item.get("id").and_then(Value::as_u64)
}

/// Issues rate-limited calls against one API
#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    per_page: usize,
    max_pages: usize,
    id_batch_size: usize,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, limiter: Arc<RateLimiter>, config: &ApiConfig) -> Self {
        Self {
            transport,
            limiter,
            per_page: config.per_page.max(1),
            max_pages: config.max_pages(),
            id_batch_size: config.id_batch_size.max(1),
        }
    }

    #[inline]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// One call: wait for the rate limiter, send, classify the body
    async fn call(&self, request: &ApiRequest) -> Result<Reply> {
        self.limiter.acquire().await;
        tracing::debug!("Calling {}", request.url);
        let body = self.transport.send(request).await?;

        let document: Value = match serde_json::from_str(&body) {
            Ok(document) => document,
            Err(_) => return Ok(Reply::Raw(body)),
        };
        if let (Some(errors), Some(status)) = (document.get("errors"), document.get("status")) {
            tracing::warn!(
                "{} returned an error (status {}): {}",
                request.url,
                status,
                errors
            );
            return Ok(Reply::ErrorEnvelope);
        }
        Ok(Reply::Data(document))
    }

    /// A single call without pagination
    pub async fn fetch_once(&self, request: ApiRequest) -> Result<Fetched> {
        match self.call(&request).await? {
            Reply::Raw(body) => Ok(Fetched::raw(body)),
            Reply::ErrorEnvelope => Ok(Fetched::empty(false)),
            Reply::Data(document) => {
                let mut merged = Accumulator::new(&request.url);
                merged.absorb(document)?;
                Ok(merged.finish(true))
            }
        }
    }

    /// Every page of a paginated list resource
    ///
    /// The first page reveals `total_results`; the remaining pages (capped by
    /// the download limit) are then requested concurrently.
    pub async fn fetch_all_pages(&self, url: &str, params: &[(String, String)]) -> Result<Fetched> {
        let first = match self.call(&self.page_request(url, params, 1)).await? {
            Reply::Raw(body) => return Ok(Fetched::raw(body)),
            Reply::ErrorEnvelope => return Ok(Fetched::empty(false)),
            Reply::Data(document) => document,
        };

        let total = first.get("total_results").and_then(Value::as_u64);
        let per_page = first
            .get("per_page")
            .and_then(Value::as_u64)
            .filter(|&n| n > 0)
            .unwrap_or(self.per_page as u64);
        let paginated = first.get("results").is_some_and(Value::is_array);
        let pages = match total {
            Some(total) if paginated => (total.div_ceil(per_page) as usize).clamp(1, self.max_pages),
            _ => 1,
        };
        if let Some(total) = total
            && total > pages as u64 * per_page
        {
            tracing::warn!(
                "{} has {} results, downloading only the first {}",
                url,
                total,
                pages as u64 * per_page
            );
        }

        let mut merged = Accumulator::new(url);
        merged.absorb(first)?;

        let mut tasks = JoinSet::new();
        for page in 2..=pages {
            let fetcher = self.clone();
            let request = self.page_request(url, params, page);
            tasks.spawn(async move { fetcher.call(&request).await.map(|reply| (page, reply)) });
        }
        let complete = collect(url, tasks, &mut merged).await?;
        Ok(merged.finish(complete))
    }

    /// Records looked up by id, `batch size` ids per call (`{url}/{id,id,...}`)
    pub async fn fetch_in_batches(
        &self,
        url: &str,
        ids: &[u64],
        params: &[(String, String)],
    ) -> Result<Fetched> {
        let mut merged = Accumulator::new(url);
        let mut tasks = JoinSet::new();
        for (batch, chunk) in ids.chunks(self.id_batch_size).enumerate() {
            let fetcher = self.clone();
            let request =
                ApiRequest::get(format!("{}/{}", url, join_comma(chunk))).with_query(params.to_vec());
            tasks.spawn(async move { fetcher.call(&request).await.map(|reply| (batch + 1, reply)) });
        }
        let complete = collect(url, tasks, &mut merged).await?;
        Ok(merged.finish(complete))
    }

    fn page_request(&self, url: &str, params: &[(String, String)], page: usize) -> ApiRequest {
        ApiRequest::get(url)
            .with_query(params.to_vec())
            .with_param("per_page", self.per_page)
            .with_param("page", page)
    }
}

/// Drain the task group into `merged`; the first hard failure aborts the rest
async fn collect(
    url: &str,
    mut tasks: JoinSet<Result<(usize, Reply)>>,
    merged: &mut Accumulator<'_>,
) -> Result<bool> {
    let mut complete = true;
    while let Some(joined) = tasks.join_next().await {
        // Returning drops the set, which aborts the remaining tasks
        let (part, reply) = joined??;
        match reply {
            Reply::Data(document) => merged.absorb(document)?,
            Reply::ErrorEnvelope => complete = false,
            Reply::Raw(_) => {
                tracing::warn!("Part {} of {} is not JSON, skipping it", part, url);
                complete = false;
            }
        }
    }
    Ok(complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{FakeTransport, page_of_ids};
    use std::time::Duration;

    fn fetcher(transport: Arc<FakeTransport>) -> Fetcher {
        let limiter = Arc::new(RateLimiter::new(1000, Duration::from_secs(60)));
        Fetcher::new(transport, limiter, &ApiConfig::default())
    }

    fn page_of(request: &ApiRequest) -> u64 {
        request.param("page").unwrap().parse().unwrap()
    }

    fn ids(outcome: &FetchOutcome) -> Vec<u64> {
        match outcome {
            FetchOutcome::List(items) => items.iter().map(|i| id_of(i).unwrap()).collect(),
            other => panic!("expected a list, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_all_pages_are_merged_sorted() {
        // 450 results, 200 per page; each page lists its ids in reverse
        let transport = Arc::new(FakeTransport::new(|request| {
            let page = page_of(request);
            let start = (page - 1) * 200 + 1;
            let end = (page * 200).min(450);
            Ok(page_of_ids(450, 200, (start..=end).rev()))
        }));
        let fetched = fetcher(transport.clone())
            .fetch_all_pages("https://inat.test/v2/observations", &[])
            .await
            .unwrap();

        assert_eq!(transport.calls(), 3);
        assert!(fetched.complete);
        assert_eq!(ids(&fetched.outcome), (1..=450).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_download_limit_caps_pages() {
        let transport = Arc::new(FakeTransport::new(|request| {
            let page = page_of(request);
            let start = (page - 1) * 200 + 1;
            Ok(page_of_ids(1_000_000, 200, start..start + 200))
        }));
        let fetched = fetcher(transport.clone())
            .fetch_all_pages("https://inat.test/v2/observations", &[])
            .await
            .unwrap();

        assert_eq!(transport.calls(), 50);
        assert_eq!(ids(&fetched.outcome).len(), 10_000);
        assert!(transport.requests().iter().all(|r| page_of(r) <= 50));
    }

    #[tokio::test]
    async fn test_error_envelope_keeps_siblings() {
        let transport = Arc::new(FakeTransport::new(|request| match page_of(request) {
            2 => Ok(r#"{"errors":[{"message":"Too many requests"}],"status":429}"#.to_string()),
            page => {
                let start = (page - 1) * 200 + 1;
                let end = (page * 200).min(450);
                Ok(page_of_ids(450, 200, start..=end))
            }
        }));
        let fetched = fetcher(transport.clone())
            .fetch_all_pages("https://inat.test/v2/observations", &[])
            .await
            .unwrap();

        assert_eq!(transport.calls(), 3);
        assert!(!fetched.complete);
        let ids = ids(&fetched.outcome);
        assert_eq!(ids.len(), 250);
        assert_eq!(ids.first(), Some(&1));
        assert_eq!(ids.last(), Some(&450));
    }

    #[tokio::test]
    async fn test_error_envelope_on_first_page_is_empty() {
        let transport = Arc::new(FakeTransport::new(|_| {
            Ok(r#"{"errors":["bad request"],"status":422}"#.to_string())
        }));
        let fetched = fetcher(transport.clone())
            .fetch_all_pages("https://inat.test/v2/observations", &[])
            .await
            .unwrap();

        assert_eq!(fetched, Fetched::empty(false));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_hard_failure_is_propagated() {
        let transport = Arc::new(FakeTransport::new(|request| match page_of(request) {
            3 => Err(Error::Timeout {
                url: request.url.clone(),
            }),
            page => Ok(page_of_ids(1000, 200, (page - 1) * 200 + 1..=page * 200)),
        }));
        let result = fetcher(transport)
            .fetch_all_pages("https://inat.test/v2/observations", &[])
            .await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_raw_body_is_returned_verbatim() {
        let transport = Arc::new(FakeTransport::new(|_| Ok("<html>busy</html>".to_string())));
        let fetched = fetcher(transport)
            .fetch_all_pages("https://inat.test/v2/observations", &[])
            .await
            .unwrap();

        assert_eq!(fetched.outcome, FetchOutcome::Raw("<html>busy</html>".to_string()));
        assert!(fetched.outcome.into_list("observations").is_err());
    }

    #[tokio::test]
    async fn test_object_results_are_not_paginated() {
        let transport = Arc::new(FakeTransport::new(|_| {
            Ok(r#"{"total_results":2,"per_page":1,"results":{"standard":[],"community":[]}}"#
                .to_string())
        }));
        let fetched = fetcher(transport.clone())
            .fetch_all_pages("https://inat.test/v1/places/nearby", &[])
            .await
            .unwrap();

        assert_eq!(transport.calls(), 1);
        assert!(matches!(fetched.outcome, FetchOutcome::Object(_)));
    }

    #[tokio::test]
    async fn test_batches_of_ids() {
        let transport = Arc::new(FakeTransport::new(|request| {
            let ids: Vec<u64> = request
                .url
                .rsplit('/')
                .next()
                .unwrap()
                .split(',')
                .map(|id| id.parse().unwrap())
                .collect();
            Ok(page_of_ids(ids.len(), 30, ids.into_iter()))
        }));
        let wanted: Vec<u64> = (1..=65).rev().collect();
        let fetched = fetcher(transport.clone())
            .fetch_in_batches("https://inat.test/v2/taxa", &wanted, &[])
            .await
            .unwrap();

        assert_eq!(transport.calls(), 3);
        assert_eq!(ids(&fetched.outcome), (1..=65).collect::<Vec<_>>());
        assert!(
            transport
                .requests()
                .iter()
                .any(|r| r.url == "https://inat.test/v2/taxa/5,4,3,2,1")
        );
    }

    #[tokio::test]
    async fn test_no_ids_means_no_calls() {
        let transport = Arc::new(FakeTransport::new(|_| unreachable!()));
        let fetched = fetcher(transport.clone())
            .fetch_in_batches("https://inat.test/v2/taxa", &[], &[])
            .await
            .unwrap();

        assert_eq!(transport.calls(), 0);
        assert_eq!(fetched, Fetched::empty(true));
    }

    #[tokio::test]
    async fn test_mixed_envelopes_are_rejected() {
        let transport = Arc::new(FakeTransport::new(|request| {
            if request.url.ends_with("/1") {
                Ok(page_of_ids(1, 30, std::iter::once(1)))
            } else {
                Ok(r#"{"results":{"id":2}}"#.to_string())
            }
        }));
        let config = ApiConfig {
            id_batch_size: 1,
            ..ApiConfig::default()
        };
        let limiter = Arc::new(RateLimiter::new(1000, Duration::from_secs(60)));
        let result = Fetcher::new(transport, limiter, &config)
            .fetch_in_batches("https://inat.test/v1/places", &[1, 2], &[])
            .await;

        // One call per id; a list and an object disagree whatever the order
        assert!(matches!(result, Err(Error::MixedEnvelope { .. })));
    }

    #[test]
    fn test_accumulator_rules() {
        let mut merged = Accumulator::new("test");
        merged.absorb(serde_json::json!({"results": [{"id": 2}, {"id": 1}]})).unwrap();
        merged.absorb(serde_json::json!({"results": [{"id": 2}]})).unwrap();
        assert!(matches!(
            merged.absorb(serde_json::json!({"results": {"id": 3}})),
            Err(Error::MixedEnvelope { .. })
        ));

        let mut merged = Accumulator::new("test");
        merged.absorb(serde_json::json!({"results": []})).unwrap();
        merged.absorb(serde_json::json!({"elements": []})).unwrap();
        assert!(matches!(merged.finish(true).outcome, FetchOutcome::Object(_)));
    }

    #[tokio::test]
    async fn test_fetch_once_without_results_key() {
        let transport = Arc::new(FakeTransport::new(|request| {
            assert!(request.form.is_some());
            Ok(r#"{"version":0.6,"elements":[]}"#.to_string())
        }));
        let request = ApiRequest::post_form(
            "https://overpass.test/api/interpreter",
            vec![("data".to_string(), "[out:json];".to_string())],
        );
        let fetched = fetcher(transport).fetch_once(request).await.unwrap();

        match fetched.outcome {
            FetchOutcome::Object(document) => assert!(document.get("elements").is_some()),
            other => panic!("expected an object, got {other:?}"),
        }
    }
}
