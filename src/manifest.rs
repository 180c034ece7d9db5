//! Manifest loader (spec.md §4.B) and the registration records that stand
//! in for filesystem enumeration (see SPEC_FULL.md §2). Each `#[route]`,
//! `#[queue]`, and `#[websocket]` invocation from `kindling_macros` drops a
//! record into one of the `linkme::distributed_slice`s below, the same
//! mechanism the base crate uses for its own `ROUTES`/`WS_ROUTES` slices.
//! `Services::build()` walks them exactly the way spec.md describes
//! walking files.

use crate::error::{ManifestError, Result};
use crate::path::Template;
use crate::request::Request;
use crate::response::HandlerReturn;
use crate::websocket::{WsData, WsMeta, WsMessage};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type HttpHandlerFn = fn(Request, HttpMeta) -> Pin<Box<dyn Future<Output = Result<HandlerReturn>> + Send>>;
pub type QueueHandlerFn =
    fn(serde_json::Value, MessageMeta) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type WsHandlerFn = fn(WsData, WsMeta) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
/// `authenticate` at connect time (spec.md §4.F "Connect").
pub type WsAuthenticateFn = fn(
    &HashMap<String, String>,
) -> Pin<Box<dyn Future<Output = Result<Option<crate::context::User>>> + Send>>;
/// `onOnline`/`onOffline` (spec.md §4.F): fired on a user's first accepted
/// connection / last connection closing, not on every connect/disconnect.
pub type WsLifecycleFn = fn(&str) -> Pin<Box<dyn Future<Output = ()> + Send>>;
/// `onMessageReceived`/`onMessageSent` (spec.md §4.F): observability hooks
/// around message delivery; failures are logged, never propagated.
pub type WsObserveFn = fn(&WsMeta, &WsMessage) -> Pin<Box<dyn Future<Output = ()> + Send>>;
/// A WebSocket module's `onError` (spec.md §4.F, §7).
pub type WsErrorFn = fn(&crate::error::Error, &str) -> Pin<Box<dyn Future<Output = ()> + Send>>;

/// How a `Message` event's decoded frame is interpreted (spec.md §4.F),
/// closed over the route's `config.type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum WsMessageType {
    Json,
    #[default]
    Text,
    Binary,
}
/// A queue module's `onError` (spec.md §4.G: "invoke the queue module's
/// `onError` if present" on dispatch failure).
pub type QueueErrorFn = fn(&crate::error::Error, &serde_json::Value) -> Pin<Box<dyn Future<Output = ()> + Send>>;

pub const DEFAULT_HTTP_TIMEOUT: u64 = 10;
pub const MAX_HTTP_TIMEOUT: u64 = 30;
pub const DEFAULT_QUEUE_TIMEOUT: u64 = 30;
pub const MIN_QUEUE_TIMEOUT: u64 = 1;
pub const MAX_QUEUE_TIMEOUT: u64 = 500;
pub const DEFAULT_WS_TIMEOUT: u64 = 10;
pub const MAX_WS_TIMEOUT: u64 = 30;

/// Metadata handed to an HTTP handler alongside the request (spec.md
/// §4.E.8): cookies, matched path parameters, the cancellation signal for
/// the route's deadline, and the authenticated user (if any).
#[derive(Clone)]
pub struct HttpMeta {
    pub cookies: HashMap<String, String>,
    pub params: HashMap<String, String>,
    pub signal: crate::context::Signal,
    pub user: Option<crate::context::User>,
}

/// Metadata handed to a queue handler (spec.md §4.G).
#[derive(Clone)]
pub struct MessageMeta {
    pub message_id: String,
    pub group_id: Option<String>,
    pub params: HashMap<String, String>,
    pub queue_name: String,
    pub received_count: u32,
    pub sent_at: Option<String>,
    pub sequence_number: Option<String>,
    pub user: Option<crate::context::User>,
    pub signal: crate::context::Signal,
}

/// One registration produced by `#[get]`/`#[post]`/`#[route(...)]` etc.
/// The macro emits one of these per HTTP verb the handler answers to; a
/// route with several verbs (a file with both a `get` and a `post` export,
/// in the source system's terms) is simply several registrations sharing
/// the same `path`.
#[derive(Clone, Copy)]
pub struct RouteInfo {
    pub method: &'static str,
    pub path: &'static str,
    pub accepts: &'static [&'static str],
    pub cors: bool,
    pub cache_seconds: Option<u32>,
    pub etag: bool,
    pub timeout: Option<u64>,
    pub source: &'static str,
    pub handler: HttpHandlerFn,
}

#[derive(Clone, Copy)]
pub struct QueueInfo {
    pub name: &'static str,
    pub url: Option<&'static str>,
    pub timeout: Option<u64>,
    pub accepts: &'static [&'static str],
    pub source: &'static str,
    pub handler: QueueHandlerFn,
    pub on_error: Option<QueueErrorFn>,
}

#[derive(Clone, Copy)]
pub struct WsInfo {
    pub path: &'static str,
    pub timeout: Option<u64>,
    pub msg_type: WsMessageType,
    pub source: &'static str,
    pub handler: WsHandlerFn,
    pub authenticate: Option<WsAuthenticateFn>,
    pub on_online: Option<WsLifecycleFn>,
    pub on_offline: Option<WsLifecycleFn>,
    pub on_message_received: Option<WsObserveFn>,
    pub on_message_sent: Option<WsObserveFn>,
    pub on_error: Option<WsErrorFn>,
}

#[linkme::distributed_slice]
pub static ROUTE_REGISTRATIONS: [RouteInfo];

#[linkme::distributed_slice]
pub static QUEUE_REGISTRATIONS: [QueueInfo];

#[linkme::distributed_slice]
pub static WS_REGISTRATIONS: [WsInfo];

/// One HTTP endpoint, fully resolved (spec.md §3 "Route"). `Clone` lets
/// the engine copy a matched route out of `Services` before moving the
/// collaborators bundle that route was borrowed from into an owned
/// ambient scope (see `http_engine::dispatch`).
#[derive(Clone)]
pub struct Route {
    pub template: Template,
    pub methods: HashMap<String, HttpHandlerFn>,
    pub accepts: Vec<String>,
    pub cors: bool,
    pub cache_seconds: Option<u32>,
    pub etag: bool,
    pub timeout: u64,
    pub source: String,
    /// Set when this route exists only because a queue module declared a
    /// `config.url` (spec.md §3 "Route-backed queue"); the HTTP engine
    /// dispatches to the named queue's handler instead of `methods`.
    pub backing_queue: Option<String>,
}

impl Route {
    pub fn accepts_method(&self, method: &str) -> bool {
        self.methods.contains_key(method) || self.methods.contains_key("*")
    }

    pub fn accepts_content_type(&self, content_type: &str) -> bool {
        if self.accepts.is_empty() {
            return true;
        }
        let family = content_type.split('/').next().unwrap_or(content_type);
        self.accepts.iter().any(|a| {
            a == content_type || a == "*/*" || a.strip_suffix("/*").map(|f| f == family).unwrap_or(false)
        })
    }

    pub fn allowed_methods_header(&self) -> String {
        if self.methods.contains_key("*") {
            "*".to_string()
        } else {
            let mut methods: Vec<&str> = self.methods.keys().map(|s| s.as_str()).collect();
            methods.sort();
            methods.join(", ")
        }
    }
}

/// One queue (spec.md §3 "Queue descriptor").
pub struct QueueDescriptor {
    pub name: String,
    pub fifo: bool,
    pub url: Option<String>,
    pub timeout: u64,
    pub accepts: Vec<String>,
    pub source: String,
    pub handler: QueueHandlerFn,
    pub on_error: Option<QueueErrorFn>,
}

/// One WebSocket route.
pub struct WsRoute {
    pub template: Template,
    pub timeout: u64,
    pub msg_type: WsMessageType,
    pub source: String,
    pub handler: WsHandlerFn,
    pub authenticate: Option<WsAuthenticateFn>,
    pub on_online: Option<WsLifecycleFn>,
    pub on_offline: Option<WsLifecycleFn>,
    pub on_message_received: Option<WsObserveFn>,
    pub on_message_sent: Option<WsObserveFn>,
    pub on_error: Option<WsErrorFn>,
}

/// The immutable manifest produced once at startup (spec.md §3 "Services").
pub struct Services {
    routes: Vec<Route>,
    queues: HashMap<String, QueueDescriptor>,
    ws_routes: Vec<WsRoute>,
}

fn valid_queue_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 40 {
        return false;
    }
    let base = name.strip_suffix(".fifo").unwrap_or(name);
    !base.is_empty() && base.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl Services {
    /// Build the manifest from whatever has been registered via
    /// `kindling_macros`. Called once, before the listener binds; any
    /// validation failure is fatal (spec.md §4.B, §7 "Manifest-error").
    pub fn build() -> std::result::Result<Services, ManifestError> {
        let mut routes: Vec<Route> = Vec::new();
        let mut shapes: HashMap<String, String> = HashMap::new();

        for reg in ROUTE_REGISTRATIONS.iter() {
            insert_route_registration(&mut routes, &mut shapes, reg)?;
        }

        let mut queues = HashMap::new();
        for reg in QUEUE_REGISTRATIONS.iter() {
            if !valid_queue_name(reg.name) {
                return Err(ManifestError::new(
                    reg.source,
                    format!("invalid queue name `{}`", reg.name),
                ));
            }
            let fifo = reg.name.ends_with(".fifo");
            let timeout = clamp(
                reg.timeout.unwrap_or(DEFAULT_QUEUE_TIMEOUT),
                MIN_QUEUE_TIMEOUT,
                MAX_QUEUE_TIMEOUT,
            );
            if queues.contains_key(reg.name) {
                return Err(ManifestError::new(
                    reg.source,
                    format!("duplicate queue name `{}`", reg.name),
                ));
            }
            queues.insert(
                reg.name.to_string(),
                QueueDescriptor {
                    name: reg.name.to_string(),
                    fifo,
                    url: reg.url.map(|s| s.to_string()),
                    timeout,
                    accepts: reg.accepts.iter().map(|s| s.to_string()).collect(),
                    source: reg.source.to_string(),
                    handler: reg.handler,
                    on_error: reg.on_error,
                },
            );
        }

        // Route-backed queues: a queue's `config.url` injects a POST-only
        // synthetic route into the same collision table (spec.md §3, §4.B.5).
        for queue in queues.values() {
            let Some(url) = &queue.url else { continue };
            let template = Template::parse(url)
                .map_err(|e| ManifestError::new(&queue.source, e.to_string()))?;
            if queue.fifo && !template.param_names().contains(&"group") {
                return Err(ManifestError::new(
                    &queue.source,
                    format!(
                        "FIFO queue `{}` exposes URL `{}` but is missing a `:group` parameter",
                        queue.name, url
                    ),
                ));
            }
            let shape = template.shape();
            if let Some(existing) = shapes.get(&shape) {
                return Err(ManifestError::new(
                    &queue.source,
                    format!(
                        "route shape `{}` collides with `{}`",
                        shape, existing
                    ),
                ));
            }
            shapes.insert(shape, queue.source.clone());

            let mut methods = HashMap::new();
            methods.insert("POST".to_string(), http_noop_placeholder as HttpHandlerFn);
            routes.push(Route {
                template,
                methods,
                accepts: queue.accepts.clone(),
                cors: false,
                cache_seconds: None,
                etag: false,
                timeout: queue.timeout,
                source: queue.source.clone(),
                backing_queue: Some(queue.name.clone()),
            });
        }

        let mut ws_routes = Vec::new();
        let mut ws_shapes: HashMap<String, String> = HashMap::new();
        for reg in WS_REGISTRATIONS.iter() {
            let template = Template::parse(reg.path)
                .map_err(|e| ManifestError::new(reg.source, e.to_string()))?;
            let shape = template.shape();
            if let Some(existing) = ws_shapes.get(&shape) {
                return Err(ManifestError::new(
                    reg.source,
                    format!("websocket route shape `{}` collides with `{}`", shape, existing),
                ));
            }
            ws_shapes.insert(shape.clone(), reg.source.to_string());
            ws_routes.push(WsRoute {
                template,
                timeout: clamp(reg.timeout.unwrap_or(DEFAULT_WS_TIMEOUT), 1, MAX_WS_TIMEOUT),
                msg_type: reg.msg_type,
                source: reg.source.to_string(),
                handler: reg.handler,
                authenticate: reg.authenticate,
                on_online: reg.on_online,
                on_offline: reg.on_offline,
                on_message_received: reg.on_message_received,
                on_message_sent: reg.on_message_sent,
                on_error: reg.on_error,
            });
        }

        Ok(Services {
            routes,
            queues,
            ws_routes,
        })
    }

    pub fn resolve_route(&self, path: &str) -> Option<(&Route, HashMap<String, String>)> {
        self.routes
            .iter()
            .find_map(|r| r.template.match_path(path).map(|params| (r, params)))
    }

    pub fn queue(&self, name: &str) -> Option<&QueueDescriptor> {
        self.queues.get(name)
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn ws_routes(&self) -> &[WsRoute] {
        &self.ws_routes
    }

    pub fn resolve_ws(&self, path: &str) -> Option<(&WsRoute, HashMap<String, String>)> {
        self.ws_routes
            .iter()
            .find_map(|r| r.template.match_path(path).map(|params| (r, params)))
    }
}

fn insert_route_registration(
    routes: &mut Vec<Route>,
    shapes: &mut HashMap<String, String>,
    reg: &RouteInfo,
) -> std::result::Result<(), ManifestError> {
    let template =
        Template::parse(reg.path).map_err(|e| ManifestError::new(reg.source, e.to_string()))?;
    let shape = template.shape();

    // Merging applies only to a second verb on the *same* canonical path
    // (e.g. a `get` and a `post` sharing one route file). Two distinct
    // paths that happen to share a shape (`/a/:x` vs `/a/:y`) must still be
    // rejected below — matching on `raw` here, not `shape`, is what keeps
    // that distinction (spec.md §3 invariant 1, §8 scenario 2).
    if let Some(existing) = routes.iter_mut().find(|r| r.template.raw == template.raw) {
        if existing.methods.contains_key(reg.method) {
            return Err(ManifestError::new(
                reg.source,
                format!("duplicate method `{}` for path `{}`", reg.method, reg.path),
            ));
        }
        existing.methods.insert(reg.method.to_string(), reg.handler);
        if existing.accepts.is_empty() && !reg.accepts.is_empty() {
            existing.accepts = reg.accepts.iter().map(|s| s.to_string()).collect();
        }
        existing.cors |= reg.cors;
        existing.etag |= reg.etag;
        if existing.cache_seconds.is_none() {
            existing.cache_seconds = reg.cache_seconds;
        }
        return Ok(());
    }

    if shapes.contains_key(&shape) {
        return Err(ManifestError::new(
            reg.source,
            format!("route shape `{}` collides with `{}`", shape, shapes[&shape]),
        ));
    }
    shapes.insert(shape, reg.source.to_string());

    let mut methods = HashMap::new();
    methods.insert(reg.method.to_string(), reg.handler);

    routes.push(Route {
        template,
        methods,
        accepts: reg.accepts.iter().map(|s| s.to_string()).collect(),
        cors: reg.cors,
        cache_seconds: reg.cache_seconds,
        etag: reg.etag,
        timeout: clamp(reg.timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT), 1, MAX_HTTP_TIMEOUT),
        source: reg.source.to_string(),
        backing_queue: None,
    });

    Ok(())
}

fn clamp(value: u64, min: u64, max: u64) -> u64 {
    value.clamp(min, max)
}

/// Placeholder occupying a route-backed queue's method slot: never called
/// directly, since `http_engine::dispatch` checks `Route::backing_queue`
/// before consulting `methods` and dispatches through the queue path
/// instead. It exists only so `Route::accepts_method`/405 bookkeeping has
/// an entry to find.
fn http_noop_placeholder(
    _req: Request,
    _meta: HttpMeta,
) -> Pin<Box<dyn Future<Output = Result<HandlerReturn>> + Send>> {
    Box::pin(async { Err(crate::error::Error::Handler("unreachable".into())) })
}

pub type SharedServices = Arc<Services>;
