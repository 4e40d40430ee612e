//! Offline transport for tests

use super::{ApiRequest, Transport};
use crate::Result;
use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

type Handler = Box<dyn Fn(&ApiRequest) -> Result<String> + Send + Sync>;

/// Answers every request through a closure and records what was asked
pub(crate) struct FakeTransport {
    handler: Handler,
    calls: AtomicUsize,
    requests: Mutex<Vec<ApiRequest>>,
}

impl FakeTransport {
    pub(crate) fn new(handler: impl Fn(&ApiRequest) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: &ApiRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        (self.handler)(request)
    }
}

/// iNaturalist list envelope with the given ids
pub(crate) fn page_of_ids(total: usize, per_page: usize, ids: impl Iterator<Item = u64>) -> String {
    let results: Vec<_> = ids.map(|id| serde_json::json!({ "id": id })).collect();
    serde_json::json!({
        "total_results": total,
        "per_page": per_page,
        "results": results,
    })
    .to_string()
}
