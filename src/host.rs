//! Host adapter interfaces (spec.md §4.H, §6 "Collaborator interfaces
//! required from the host/runtime embedder"). These are traits only — no
//! concrete cloud adapters are implemented, per spec.md §1's explicit
//! scope boundary. A real embedder implements them against its queue
//! backend and connection store and wires a `RuntimeHandle` into
//! `context::Ambient::enter`.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// `bind`/`unbind`/`resolveUser`/`connectionsFor` from spec.md §6.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn bind(&self, connection_id: &str, user_id: &str) -> Result<()>;
    /// Returns whether the user has no remaining connections after this
    /// one is removed, plus the user id that was bound (if any), per
    /// spec.md §4.F's `onOffline` trigger.
    async fn unbind(&self, connection_id: &str) -> Result<UnbindOutcome>;
    async fn resolve_user(&self, connection_id: &str) -> Result<Option<String>>;
    async fn connections_for(&self, user_ids: &[String]) -> Result<Vec<String>>;
    /// Remembers which route a connection was accepted on and the path
    /// parameters it matched, so a later `message`/`disconnect` event for
    /// the same connection id (which carries no path) can be routed back
    /// to the same handler (spec.md §4.F: "the matched route is fixed for
    /// the lifetime of the connection").
    async fn attach_route(&self, connection_id: &str, path: &str, params: HashMap<String, String>) -> Result<()>;
    async fn resolve_route(&self, connection_id: &str) -> Result<Option<(String, HashMap<String, String>)>>;
}

pub struct UnbindOutcome {
    pub went_offline: bool,
    pub user_id: Option<String>,
}

/// `deleteMessage` plus a region/locality hint (spec.md §6). Enqueue is
/// modeled as a single `push` rather than the host's native send API so
/// the ambient context's `queue_job` has one call to make regardless of
/// host.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn push(&self, queue_name: &str, group_id: Option<&str>, payload: serde_json::Value) -> Result<String>;
    async fn delete_message(&self, queue_name: &str, receipt_handle: &str) -> Result<()>;
    /// True when running against a local/dev backend rather than a remote
    /// queue service (spec.md §4.G: "delete the message ... no-op in local
    /// mode").
    fn is_local(&self) -> bool;
}

/// Static `{http, ws}` base URLs installed at process start (spec.md §6).
#[derive(Clone, Default)]
pub struct UrlTable {
    pub http: Option<String>,
    pub ws: Option<String>,
}

/// Delivery side of the WebSocket host, separate from `ConnectionStore`
/// (which only tracks user/connection bindings). Backs the ambient
/// `sendWebSocketMessage`/`closeWebSocket` operations (spec.md §4.C).
#[async_trait]
pub trait WsTransport: Send + Sync {
    async fn send(&self, connection_id: &str, payload: Vec<u8>) -> Result<()>;
    async fn close(&self, connection_id: &str) -> Result<()>;
}

/// An inbound HTTP event, already decoded from whatever wire shape the
/// host adapter received (spec.md §6 "Events consumed").
#[derive(Clone)]
pub struct HttpEvent {
    pub request: crate::request::Request,
}

/// An inbound WebSocket event.
pub enum WsEvent {
    Connect {
        connection_id: String,
        request_id: String,
        path: String,
        headers: HashMap<String, String>,
    },
    Message {
        connection_id: String,
        request_id: String,
        body: Vec<u8>,
        base64: bool,
    },
    Disconnect {
        connection_id: String,
    },
}

/// One message in an inbound queue batch (spec.md §6).
#[derive(Clone)]
pub struct QueueMessage {
    pub message_id: String,
    pub body: String,
    pub event_source_arn: String,
    pub receipt_handle: String,
    pub attributes: HashMap<String, String>,
    pub message_attributes: HashMap<String, String>,
}

/// The host's `remainingTime()` oracle, reported in milliseconds
/// (spec.md §6).
pub trait RemainingTime: Send + Sync {
    fn remaining_ms(&self) -> u64;
}

pub struct FixedRemainingTime(pub u64);

impl RemainingTime for FixedRemainingTime {
    fn remaining_ms(&self) -> u64 {
        self.0
    }
}

/// Result item the host must redeliver (spec.md §6 "Queue dispatch
/// result").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemIdentifier {
    pub item_identifier: String,
}

/// The full set of host-provided collaborators a running handler can
/// reach, bundled so `http_engine`/`websocket`/`queue` dispatch each build
/// one `context::AmbientState` the same way (spec.md §6).
#[derive(Clone)]
pub struct Collaborators {
    pub services: crate::manifest::SharedServices,
    pub connections: std::sync::Arc<dyn ConnectionStore>,
    pub queue_backend: std::sync::Arc<dyn QueueBackend>,
    pub ws_transport: std::sync::Arc<dyn WsTransport>,
    pub urls: UrlTable,
}

/// In-process `ConnectionStore` + `WsTransport`, for local development and
/// the test harness (SPEC_FULL.md §3.4). Grounded on the base crate's
/// `OnceLock<RwLock<PluginRegistry>>` pattern in `plugin.rs`: a single
/// lock-guarded table rather than a real fan-out transport.
pub struct InMemoryWsHost {
    state: tokio::sync::RwLock<InMemoryWsState>,
}

#[derive(Default)]
struct InMemoryWsState {
    user_of: HashMap<String, String>,
    connections_of: HashMap<String, Vec<String>>,
    route_of: HashMap<String, (String, HashMap<String, String>)>,
    sent: Vec<(String, Vec<u8>)>,
    closed: Vec<String>,
}

impl InMemoryWsHost {
    pub fn new() -> Self {
        InMemoryWsHost {
            state: tokio::sync::RwLock::new(InMemoryWsState::default()),
        }
    }

    /// Messages handed to `send`, in delivery order — for test assertions.
    pub async fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.state.read().await.sent.clone()
    }

    pub async fn closed(&self) -> Vec<String> {
        self.state.read().await.closed.clone()
    }
}

impl Default for InMemoryWsHost {
    fn default() -> Self {
        InMemoryWsHost::new()
    }
}

#[async_trait]
impl ConnectionStore for InMemoryWsHost {
    async fn bind(&self, connection_id: &str, user_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.user_of.insert(connection_id.to_string(), user_id.to_string());
        state
            .connections_of
            .entry(user_id.to_string())
            .or_default()
            .push(connection_id.to_string());
        Ok(())
    }

    async fn unbind(&self, connection_id: &str) -> Result<UnbindOutcome> {
        let mut state = self.state.write().await;
        let user_id = state.user_of.remove(connection_id);
        state.route_of.remove(connection_id);
        let mut went_offline = false;
        if let Some(uid) = &user_id {
            if let Some(list) = state.connections_of.get_mut(uid) {
                list.retain(|c| c != connection_id);
                went_offline = list.is_empty();
                if went_offline {
                    state.connections_of.remove(uid);
                }
            }
        }
        Ok(UnbindOutcome { went_offline, user_id })
    }

    async fn resolve_user(&self, connection_id: &str) -> Result<Option<String>> {
        Ok(self.state.read().await.user_of.get(connection_id).cloned())
    }

    async fn connections_for(&self, user_ids: &[String]) -> Result<Vec<String>> {
        let state = self.state.read().await;
        Ok(user_ids
            .iter()
            .filter_map(|u| state.connections_of.get(u))
            .flatten()
            .cloned()
            .collect())
    }

    async fn attach_route(&self, connection_id: &str, path: &str, params: HashMap<String, String>) -> Result<()> {
        self.state
            .write()
            .await
            .route_of
            .insert(connection_id.to_string(), (path.to_string(), params));
        Ok(())
    }

    async fn resolve_route(&self, connection_id: &str) -> Result<Option<(String, HashMap<String, String>)>> {
        Ok(self.state.read().await.route_of.get(connection_id).cloned())
    }
}

#[async_trait]
impl WsTransport for InMemoryWsHost {
    async fn send(&self, connection_id: &str, payload: Vec<u8>) -> Result<()> {
        self.state.write().await.sent.push((connection_id.to_string(), payload));
        Ok(())
    }

    async fn close(&self, connection_id: &str) -> Result<()> {
        self.state.write().await.closed.push(connection_id.to_string());
        Ok(())
    }
}

/// Static file serving, grounded on the base crate's `serve.rs`
/// (`serve_file`/`serve_static`, content-type guessing, traversal guard).
/// Not part of the dispatch core — a fallback route a host adapter
/// commonly wires in front of the engine for assets the manifest has no
/// handler for (SPEC_FULL.md §5).
pub mod static_files {
    use crate::response::Response;
    use std::path::{Path, PathBuf};

    /// Serves `request_path` relative to `base_dir`, rejecting any path
    /// that climbs above it via `..` (spec.md §6 collaborator surface: a
    /// host commonly needs this for the assets a manifest has no route
    /// for). Directories fall back to `index.html`.
    pub async fn serve(base_dir: impl AsRef<Path>, request_path: &str) -> Response {
        let base_dir = base_dir.as_ref();
        let trimmed = request_path.trim_start_matches('/');
        let candidate = PathBuf::from(trimmed);
        if candidate.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Response::new(403, "Access denied").with_header("Content-Type", "text/plain; charset=utf-8");
        }

        let mut file_path = base_dir.join(&candidate);
        if file_path.is_dir() {
            file_path = file_path.join("index.html");
        }
        serve_file(&file_path).await
    }

    /// Serves one file, guessing its `Content-Type` from the extension.
    pub async fn serve_file(path: impl AsRef<Path>) -> Response {
        let path = path.as_ref();
        match tokio::fs::read(path).await {
            Ok(bytes) => Response::new(200, bytes).with_header("Content-Type", guess_content_type(path)),
            Err(_) => Response::new(404, "Not Found").with_header("Content-Type", "text/plain; charset=utf-8"),
        }
    }

    fn guess_content_type(path: &Path) -> &'static str {
        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "html" | "htm" => "text/html; charset=utf-8",
            "css" => "text/css; charset=utf-8",
            "js" | "mjs" => "application/javascript; charset=utf-8",
            "json" => "application/json",
            "txt" => "text/plain; charset=utf-8",
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            "gif" => "image/gif",
            "svg" => "image/svg+xml",
            "webp" => "image/webp",
            "ico" => "image/x-icon",
            "woff" => "font/woff",
            "woff2" => "font/woff2",
            "pdf" => "application/pdf",
            _ => "application/octet-stream",
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn traversal_outside_base_dir_is_rejected() {
            let response = serve("/tmp", "../etc/passwd").await;
            assert_eq!(response.status, 403);
        }

        #[tokio::test]
        async fn missing_file_is_404() {
            let response = serve_file("/nonexistent/path/for/kindling/tests").await;
            assert_eq!(response.status, 404);
        }
    }
}
