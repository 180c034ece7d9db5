//! In-process test harness (SPEC_FULL.md §3.4), grounded on the base
//! crate's `core/src/test.rs` `TestClient`/`TestRequest`/`TestResponse`:
//! drives `http_engine::dispatch` and `queue::dispatch_batch` directly
//! against an in-memory `Collaborators` bundle, with no real socket and no
//! host adapter in the loop. Gated behind the `testing` feature, as the
//! base crate gates its own equivalent.

use crate::error::Result;
use crate::host::{
    Collaborators, FixedRemainingTime, InMemoryWsHost, ItemIdentifier, QueueBackend, QueueMessage, UrlTable,
};
use crate::manifest::{SharedServices, Services};
use crate::request::{Method, Request, Uri};
use crate::response::Response;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// An in-memory `QueueBackend` that records every `push` rather than
/// talking to a real queue, for assertions in tests that call
/// `context::queue_job` from inside a handler.
#[derive(Default)]
pub struct RecordingQueueBackend {
    pushed: Mutex<Vec<(String, Option<String>, serde_json::Value)>>,
}

impl RecordingQueueBackend {
    pub fn new() -> Self {
        RecordingQueueBackend::default()
    }

    pub fn pushed(&self) -> Vec<(String, Option<String>, serde_json::Value)> {
        self.pushed.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueBackend for RecordingQueueBackend {
    async fn push(&self, queue_name: &str, group_id: Option<&str>, payload: serde_json::Value) -> Result<String> {
        let id = format!("test-msg-{}", self.pushed.lock().unwrap().len() + 1);
        self.pushed
            .lock()
            .unwrap()
            .push((queue_name.to_string(), group_id.map(|s| s.to_string()), payload));
        Ok(id)
    }

    async fn delete_message(&self, _queue_name: &str, _receipt_handle: &str) -> Result<()> {
        Ok(())
    }

    fn is_local(&self) -> bool {
        true
    }
}

/// Drives the engine against `Services::build()`'s current registrations
/// (spec.md §3 "Services"), with an in-memory connection store/transport
/// and a recording queue backend a test can inspect afterward.
pub struct TestClient {
    collaborators: Collaborators,
    queue_backend: Arc<RecordingQueueBackend>,
}

impl TestClient {
    pub fn new() -> std::result::Result<TestClient, crate::error::ManifestError> {
        let services: SharedServices = Arc::new(Services::build()?);
        Ok(TestClient::with_services(services))
    }

    pub fn with_services(services: SharedServices) -> TestClient {
        let ws_host = Arc::new(InMemoryWsHost::new());
        let queue_backend = Arc::new(RecordingQueueBackend::new());
        TestClient {
            collaborators: Collaborators {
                services,
                connections: ws_host.clone(),
                queue_backend: queue_backend.clone(),
                ws_transport: ws_host,
                urls: UrlTable::default(),
            },
            queue_backend,
        }
    }

    pub fn get(&self, path: &str) -> TestRequest<'_> {
        TestRequest::new(self, Method::Get, path)
    }

    pub fn post(&self, path: &str) -> TestRequest<'_> {
        TestRequest::new(self, Method::Post, path)
    }

    pub fn put(&self, path: &str) -> TestRequest<'_> {
        TestRequest::new(self, Method::Put, path)
    }

    pub fn patch(&self, path: &str) -> TestRequest<'_> {
        TestRequest::new(self, Method::Patch, path)
    }

    pub fn delete(&self, path: &str) -> TestRequest<'_> {
        TestRequest::new(self, Method::Delete, path)
    }

    pub fn options(&self, path: &str) -> TestRequest<'_> {
        TestRequest::new(self, Method::Options, path)
    }

    /// Messages enqueued via `context::queue_job` during any dispatch made
    /// through this client, in push order.
    pub fn queued_messages(&self) -> Vec<(String, Option<String>, serde_json::Value)> {
        self.queue_backend.pushed()
    }

    /// Dispatches a batch of already-constructed `QueueMessage`s against
    /// `queue_name`, with a fixed `remainingMs` deadline, and returns the
    /// `itemIdentifier`s the caller would have to redeliver (spec.md §4.G).
    pub async fn dispatch_queue_batch(
        &self,
        queue_name: &str,
        messages: Vec<QueueMessage>,
        remaining_ms: u64,
    ) -> Vec<ItemIdentifier> {
        crate::queue::dispatch_batch(
            queue_name,
            messages,
            Arc::new(FixedRemainingTime(remaining_ms)),
            self.collaborators.clone(),
        )
        .await
    }
}

impl Default for TestClient {
    fn default() -> Self {
        TestClient::new().expect("Services::build() failed in TestClient::default()")
    }
}

/// Builds one request and sends it through `http_engine::dispatch`,
/// mirroring the base crate's `TestRequest` builder surface
/// (`header`/`json`/`body`/`query`/`send`).
pub struct TestRequest<'a> {
    client: &'a TestClient,
    method: Method,
    path: String,
    headers: HashMap<String, Vec<String>>,
    body: Vec<u8>,
    query: HashMap<String, Vec<String>>,
    cookies: HashMap<String, String>,
}

impl<'a> TestRequest<'a> {
    fn new(client: &'a TestClient, method: Method, path: &str) -> Self {
        TestRequest {
            client,
            method,
            path: path.to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
            query: HashMap::new(),
            cookies: HashMap::new(),
        }
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.entry(key.to_string()).or_default().push(value.to_string());
        self
    }

    pub fn cookie(mut self, key: &str, value: &str) -> Self {
        self.cookies.insert(key.to_string(), value.to_string());
        self
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.entry(key.to_string()).or_default().push(value.to_string());
        self
    }

    pub fn json(mut self, value: &serde_json::Value) -> Self {
        self.body = serde_json::to_vec(value).expect("serializing test request body");
        self.headers
            .entry("Content-Type".to_string())
            .or_default()
            .push("application/json".to_string());
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub async fn send(self) -> TestResponse {
        let request = Request {
            method: self.method,
            uri: Uri { path: self.path, query: self.query },
            headers: self.headers,
            body: self.body,
            cookies: self.cookies,
            remote_addr: None,
        };
        let response = crate::http_engine::dispatch(request, self.client.collaborators.clone()).await;
        TestResponse { response }
    }
}

/// Wraps a dispatched `Response` with the assertion helpers the base
/// crate's `TestResponse` offers.
pub struct TestResponse {
    response: Response,
}

impl TestResponse {
    pub fn status(&self) -> u16 {
        self.response.status
    }

    pub fn body(&self) -> &[u8] {
        &self.response.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.response.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.response.body)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.response.header(name)
    }

    pub fn assert_status(&self, expected: u16) -> &Self {
        assert_eq!(self.response.status, expected, "expected status {}, got {}", expected, self.response.status);
        self
    }

    pub fn assert_ok(&self) -> &Self {
        self.assert_status(200)
    }

    pub fn assert_not_found(&self) -> &Self {
        self.assert_status(404)
    }

    pub fn assert_header_eq(&self, name: &str, value: &str) -> &Self {
        assert_eq!(self.header(name), Some(value), "header `{}` mismatch", name);
        self
    }

    pub fn into_response(self) -> Response {
        self.response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unmatched_route_is_404() {
        let client = TestClient::new().unwrap();
        client.get("/nonexistent").send().await.assert_not_found();
    }
}
