use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use harvest_common::{HarvestError, RawPage, Result};
use harvest_sources::{HttpRequest, Transport};

type Responder = Box<dyn Fn(&HttpRequest) -> Option<String> + Send + Sync>;

/// Answers from a closure; `None` becomes a 404-class error. Every request
/// is logged.
pub struct FakeTransport {
    respond: Responder,
    log: Mutex<Vec<HttpRequest>>,
    resets: AtomicUsize,
}

impl FakeTransport {
    pub fn new(respond: impl Fn(&HttpRequest) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            log: Mutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.log.lock().unwrap().clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.url).collect()
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn execute(&self, request: &HttpRequest) -> Result<RawPage> {
        self.log.lock().unwrap().push(request.clone());
        match (self.respond)(request) {
            Some(body) => Ok(RawPage::new(request.url.clone(), 200, body)),
            None => Err(HarvestError::Parse(format!("HTTP 404 from {}", request.url))),
        }
    }

    async fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn query<'a>(request: &'a HttpRequest, key: &str) -> Option<&'a str> {
    request
        .query
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}
