//! Ambient request context (spec.md §4.C), propagated via
//! `tokio::task_local!` rather than a module-global: the source system
//! relies on its runtime's implicit per-request global, which Rust has no
//! equivalent for, so every dispatch path (`http_engine`, `websocket`,
//! `queue`) opens exactly one scope around a single request, message, or
//! connection event and closes it when that future resolves. Opening a
//! second scope on top of an already-open one is a programmer error — it
//! panics rather than silently shadowing, since a shadowed scope would
//! leak the wrong signal/user into whatever called it.

use crate::error::{Error, Result};
use crate::host::{Collaborators, ConnectionStore, QueueBackend, UrlTable, WsTransport};
use crate::manifest::SharedServices;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// The authenticated caller, set at most once per scope by `authenticate`
/// (spec.md §4.E.7) and read-only afterward.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct User {
    pub id: String,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A one-shot, broadcast cancellation flag: fired once when a step's
/// deadline elapses, observed by any number of waiters (spec.md §4.E.10
/// "the handler's signal fires when the timeout elapses"). Plain
/// `Arc<AtomicBool> + Notify` rather than a dependency on a cancellation-
/// token crate — the entire API surface here is "fire" and "wait", and
/// pulling in a crate for two primitives would just be another dependency
/// to keep aligned with the rest of the stack.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

struct SignalInner {
    fired: AtomicBool,
    notify: tokio::sync::Notify,
}

impl Signal {
    pub fn new() -> Self {
        Signal {
            inner: Arc::new(SignalInner {
                fired: AtomicBool::new(false),
                notify: tokio::sync::Notify::new(),
            }),
        }
    }

    pub fn fire(&self) {
        self.inner.fired.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Resolves once `fire` has been (or is) called. Safe to await from
    /// several places concurrently.
    pub async fn fired(&self) {
        if self.is_fired() {
            return;
        }
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        if self.is_fired() {
            return;
        }
        notified.await;
    }
}

impl Default for Signal {
    fn default() -> Self {
        Signal::new()
    }
}

/// The collaborators and per-event state a running handler can reach
/// through the free functions below (spec.md §4.C, §6). Held inside a
/// `tokio::task_local!` cell rather than threaded through every call.
pub struct AmbientState {
    pub services: SharedServices,
    pub connections: Arc<dyn ConnectionStore>,
    pub queue_backend: Arc<dyn QueueBackend>,
    pub ws_transport: Arc<dyn WsTransport>,
    pub urls: UrlTable,
    /// Set when the scope belongs to a live WebSocket connection rather
    /// than an HTTP request or queue message (spec.md §4.F).
    pub connection_id: Option<String>,
    signal: Signal,
    user: Mutex<Option<User>>,
    user_assigned: AtomicBool,
}

impl AmbientState {
    pub fn new(collaborators: Collaborators) -> Self {
        AmbientState {
            services: collaborators.services,
            connections: collaborators.connections,
            queue_backend: collaborators.queue_backend,
            ws_transport: collaborators.ws_transport,
            urls: collaborators.urls,
            connection_id: None,
            signal: Signal::new(),
            user: Mutex::new(None),
            user_assigned: AtomicBool::new(false),
        }
    }

    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn with_user(self, user: User) -> Self {
        *self.user.lock().unwrap() = Some(user);
        self.user_assigned.store(true, Ordering::SeqCst);
        self
    }

    pub fn signal(&self) -> Signal {
        self.signal.clone()
    }
}

tokio::task_local! {
    static CURRENT: AmbientState;
}

/// Scope guard: `Ambient::enter` opens the context for the lifetime of
/// `fut` and tears it down when `fut` completes, same as the base crate's
/// request-scoped plugin hooks but generalised to an async task boundary.
pub struct Ambient;

impl Ambient {
    /// Runs `fut` with `state` installed as the ambient context. Panics if
    /// called while a context is already open on this task — nesting
    /// would silently shadow the outer request's signal and user, which
    /// is always a bug in the engine, never something a handler can hit.
    pub async fn enter<F, T>(state: AmbientState, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        if CURRENT.try_with(|_| ()).is_ok() {
            panic!("Ambient::enter called while a context is already open on this task");
        }
        CURRENT.scope(state, fut).await
    }

    /// Spawns `fut` as a detached task outside the calling scope: it does
    /// not observe the enclosing request's `Signal` and keeps running even
    /// after the response has been sent (spec.md §4.C "work started this
    /// way must not be tied to the request's own deadline"). Used by
    /// fire-and-forget operations like a queued job whose enqueue should
    /// not be cancelled just because the handler that started it returned.
    pub fn escape<F>(fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(fut);
    }
}

fn no_context() -> Error {
    Error::Handler("Runtime not available".to_string())
}

pub fn services() -> Result<SharedServices> {
    CURRENT.try_with(|s| s.services.clone()).map_err(|_| no_context())
}

pub fn signal() -> Result<Signal> {
    CURRENT.try_with(|s| s.signal()).map_err(|_| no_context())
}

pub fn urls() -> Result<UrlTable> {
    CURRENT.try_with(|s| s.urls.clone()).map_err(|_| no_context())
}

pub fn connection_id() -> Result<Option<String>> {
    CURRENT.try_with(|s| s.connection_id.clone()).map_err(|_| no_context())
}

pub fn user() -> Result<Option<User>> {
    CURRENT.try_with(|s| s.user.lock().unwrap().clone()).map_err(|_| no_context())
}

/// Installs the authenticated user for the remainder of the scope.
/// Transitions exactly once, `null -> value` or `null -> null`; a second
/// assignment is a programmer error and fails rather than overwriting
/// (spec.md §3 invariant 4, §8 property 4).
pub fn set_user(user: User) -> Result<()> {
    CURRENT
        .try_with(|s| {
            if s.user_assigned.swap(true, Ordering::SeqCst) {
                return Err(Error::Handler("authenticated user already assigned for this context".to_string()));
            }
            *s.user.lock().unwrap() = Some(user);
            Ok(())
        })
        .map_err(|_| no_context())?
}

/// `queueJob` (spec.md §4.C): enqueue a message on a named queue from
/// inside a running handler, independent of whether that handler is
/// itself an HTTP route, a WebSocket handler, or another queue.
pub async fn queue_job(
    queue_name: &str,
    group_id: Option<&str>,
    payload: serde_json::Value,
) -> Result<String> {
    let backend = CURRENT.try_with(|s| s.queue_backend.clone()).map_err(|_| no_context())?;
    backend.push(queue_name, group_id, payload).await
}

/// `sendWebSocketMessage` (spec.md §4.C): deliver `payload` to every
/// connection currently bound to any of `user_ids`. Returns the number of
/// connections the payload was actually handed to; a user with no open
/// connection is not an error (spec.md §4.F "sending to an offline user is
/// a no-op").
pub async fn send_websocket_message(user_ids: &[String], payload: impl Into<Vec<u8>>) -> Result<usize> {
    let (connections, transport) =
        CURRENT.try_with(|s| (s.connections.clone(), s.ws_transport.clone())).map_err(|_| no_context())?;
    let connection_ids = connections.connections_for(user_ids).await?;
    let bytes = payload.into();
    let mut delivered = 0;
    for connection_id in &connection_ids {
        if transport.send(connection_id, bytes.clone()).await.is_ok() {
            delivered += 1;
        }
    }
    Ok(delivered)
}

/// `closeWebSocket` (spec.md §4.C): force-close every connection bound to
/// any of `user_ids`.
pub async fn close_websocket(user_ids: &[String]) -> Result<()> {
    let (connections, transport) =
        CURRENT.try_with(|s| (s.connections.clone(), s.ws_transport.clone())).map_err(|_| no_context())?;
    let connection_ids = connections.connections_for(user_ids).await?;
    for connection_id in &connection_ids {
        transport.close(connection_id).await?;
    }
    Ok(())
}

/// `getConnections` (spec.md §4.C): the connection ids currently bound to
/// any of `user_ids`, for callers that want to fan out themselves rather
/// than go through `send_websocket_message`.
pub async fn get_connections(user_ids: &[String]) -> Result<Vec<String>> {
    let connections = CURRENT.try_with(|s| s.connections.clone()).map_err(|_| no_context())?;
    connections.connections_for(user_ids).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::UnbindOutcome;
    use async_trait::async_trait;

    struct NullConnections;

    #[async_trait]
    impl ConnectionStore for NullConnections {
        async fn bind(&self, _connection_id: &str, _user_id: &str) -> Result<()> {
            Ok(())
        }
        async fn unbind(&self, _connection_id: &str) -> Result<UnbindOutcome> {
            Ok(UnbindOutcome { went_offline: true, user_id: None })
        }
        async fn resolve_user(&self, _connection_id: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn connections_for(&self, _user_ids: &[String]) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    struct NullQueue;

    #[async_trait]
    impl QueueBackend for NullQueue {
        async fn push(&self, _queue_name: &str, _group_id: Option<&str>, _payload: serde_json::Value) -> Result<String> {
            Ok("msg-1".to_string())
        }
        async fn delete_message(&self, _queue_name: &str, _receipt_handle: &str) -> Result<()> {
            Ok(())
        }
        fn is_local(&self) -> bool {
            true
        }
    }

    struct NullTransport;

    #[async_trait]
    impl WsTransport for NullTransport {
        async fn send(&self, _connection_id: &str, _payload: Vec<u8>) -> Result<()> {
            Ok(())
        }
        async fn close(&self, _connection_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn test_state() -> AmbientState {
        let services = Arc::new(crate::manifest::Services::build().unwrap());
        AmbientState::new(Collaborators {
            services,
            connections: Arc::new(NullConnections),
            queue_backend: Arc::new(NullQueue),
            ws_transport: Arc::new(NullTransport),
            urls: UrlTable::default(),
        })
    }

    #[tokio::test]
    async fn signal_wakes_concurrent_waiters() {
        let signal = Signal::new();
        let a = signal.clone();
        let b = signal.clone();
        let waiter_a = tokio::spawn(async move {
            a.fired().await;
        });
        let waiter_b = tokio::spawn(async move {
            b.fired().await;
        });
        tokio::task::yield_now().await;
        signal.fire();
        waiter_a.await.unwrap();
        waiter_b.await.unwrap();
    }

    #[tokio::test]
    async fn accessors_fail_closed_outside_a_scope() {
        assert!(signal().is_err());
        assert!(services().is_err());
    }

    #[tokio::test]
    async fn user_round_trips_inside_a_scope() {
        Ambient::enter(test_state(), async {
            assert!(user().unwrap().is_none());
            set_user(User { id: "u1".to_string(), extra: HashMap::new() }).unwrap();
            assert_eq!(user().unwrap().unwrap().id, "u1");
        })
        .await;
    }

    #[tokio::test]
    async fn second_user_assignment_fails() {
        Ambient::enter(test_state(), async {
            set_user(User { id: "u1".to_string(), extra: HashMap::new() }).unwrap();
            assert!(set_user(User { id: "u2".to_string(), extra: HashMap::new() }).is_err());
            assert_eq!(user().unwrap().unwrap().id, "u1");
        })
        .await;
    }

    #[tokio::test]
    #[should_panic(expected = "already open")]
    async fn nested_enter_panics() {
        Ambient::enter(test_state(), async {
            Ambient::enter(test_state(), async {}).await;
        })
        .await;
    }
}
