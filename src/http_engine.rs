//! HTTP request engine (spec.md §4.E): the fixed eleven-step pipeline from
//! route resolution through error-classified response. Grounded on the
//! base crate's request-handling loop in `serve.rs`, generalised from a
//! direct `TcpStream` accept loop to a single `dispatch()` entry point a
//! host adapter calls once per decoded `Request`.

use crate::context::{self, Ambient, AmbientState, User};
use crate::error::{Error, Result};
use crate::host::Collaborators;
use crate::manifest::{HttpMeta, Route};
use crate::middleware::Chain;
use crate::request::{Method, Request};
use crate::response::{self, HandlerReturn, Response};
use std::time::Duration;

/// Runs the full pipeline for one request. Always produces a `Response` —
/// every error kind in spec.md §7 is classified into a status code here
/// rather than propagated to the caller.
pub async fn dispatch(request: Request, collaborators: Collaborators) -> Response {
    let (route, params) = match resolve(&collaborators, &request) {
        Ok(found) => found,
        Err(_) => return Response::new(404, "Not Found").with_header("Content-Type", "text/plain; charset=utf-8"),
    };

    if route.cors && request.method == Method::Options {
        return cors_preflight(&route);
    }

    if !accepts_method(&route, request.method) {
        return Response::empty(405).with_header("Allow", route.allowed_methods_header());
    }

    if carries_body(request.method) && !accepts_content_type(&route, &request) {
        let ct = request.content_type().unwrap_or_default();
        return Response::new(415, format!("Unsupported Media Type: {}", ct))
            .with_header("Content-Type", "text/plain; charset=utf-8");
    }

    let chain = Chain::resolve(&route.template.raw);
    let outcome = run_scope(&route, &chain, request.clone(), params, collaborators).await;

    let mut response = match outcome {
        Ok(response) => response,
        Err(Error::Response(response)) => response,
        Err(Error::AuthMisconfigured(message)) => {
            log::error!("route {}: authenticate misconfigured: {}", route.source, message);
            Response::new(403, "Forbidden").with_header("Content-Type", "text/plain; charset=utf-8")
        }
        Err(Error::Timeout) => {
            log::warn!("route {} timed out after {}s", route.source, route.timeout);
            Response::new(500, "Timed Out").with_header("Content-Type", "text/plain; charset=utf-8")
        }
        Err(e) => {
            log::error!("route {}: handler error: {}", route.source, e);
            if let Some(on_error) = chain.on_error {
                on_error(&e, &request).await;
            }
            Response::new(500, "Internal Server Error").with_header("Content-Type", "text/plain; charset=utf-8")
        }
    };

    post_process(&route, response.status, &mut response);

    if let Some(on_response) = chain.on_response {
        match on_response(&request, &mut response).await {
            Ok(()) => {}
            Err(Error::Response(replacement)) => response = replacement,
            // spec.md §4.E.10: a non-response throw from `onResponse` is
            // logged and reported to `onError`, but `onResponse` itself is
            // not re-invoked.
            Err(e) => {
                log::error!("route {}: onResponse failed: {}", route.source, e);
                if let Some(on_error) = chain.on_error {
                    on_error(&e, &request).await;
                }
            }
        }
    }

    response
}

fn resolve(collaborators: &Collaborators, request: &Request) -> Result<(Route, std::collections::HashMap<String, String>)> {
    collaborators
        .services
        .resolve_route(&request.uri.path)
        .map(|(route, params)| (route.clone(), params))
        .ok_or_else(|| Error::NotFound(request.uri.path.clone()))
}

fn accepts_method(route: &Route, method: Method) -> bool {
    if route.accepts_method(method.as_str()) {
        return true;
    }
    // HEAD falls through to GET (spec.md §4.E.3).
    method == Method::Head && route.accepts_method("GET")
}

fn carries_body(method: Method) -> bool {
    !matches!(method, Method::Get | Method::Head)
}

fn accepts_content_type(route: &Route, request: &Request) -> bool {
    let content_type = request.content_type().unwrap_or_default();
    route.accepts_content_type(&content_type)
}

fn cors_preflight(route: &Route) -> Response {
    Response::empty(204)
        .with_header("Access-Control-Allow-Origin", "*")
        .with_header("Access-Control-Allow-Methods", route.allowed_methods_header())
        .with_header("Access-Control-Allow-Headers", "Content-Type, Authorization")
}

/// Opens the ambient scope and runs `onRequest` → `authenticate` →
/// handler (or the route-backed queue push), racing the route's timeout
/// against the whole sub-chain (spec.md §4.E.5-8, §4.E "Timeout").
async fn run_scope(
    route: &Route,
    chain: &Chain,
    request: Request,
    params: std::collections::HashMap<String, String>,
    collaborators: Collaborators,
) -> Result<Response> {
    let state = AmbientState::new(collaborators.clone());
    let signal = state.signal();
    let timeout = Duration::from_secs(route.timeout);

    let route = route.clone();
    let chain = *chain;

    let body = Ambient::enter(state, async move {
        if let Some(on_request) = chain.on_request {
            on_request(&request).await?;
        }

        let mut user: Option<User> = None;
        if let Some(authenticate) = chain.authenticate {
            if let Some(found) = authenticate(&request).await? {
                if found.id.is_empty() {
                    return Err(Error::AuthMisconfigured(
                        "authenticate returned a user without an id".to_string(),
                    ));
                }
                context::set_user(found.clone())?;
                user = Some(found);
            }
        }

        if let Some(queue_name) = route.backing_queue.clone() {
            return dispatch_route_backed_queue(&queue_name, &request, &params).await;
        }

        let meta = HttpMeta { cookies: request.cookies.clone(), params, signal: signal.clone(), user };
        // HEAD falls through to the GET handler (spec.md §4.E.3): the gate in
        // `accepts_method` already let a HEAD request with no registered HEAD
        // handler through on the strength of a GET registration, so the
        // lookup here has to honor the same fallthrough or a valid HEAD
        // request would reach the generic 500 arm in `dispatch`.
        let lookup_method = if request.method == Method::Head && !route.methods.contains_key("HEAD") {
            "GET"
        } else {
            request.method.as_str()
        };
        let handler = route
            .methods
            .get(lookup_method)
            .or_else(|| route.methods.get("*"))
            .copied()
            .ok_or(Error::MethodNotAllowed)?;

        let fut = handler(request, meta);
        handler_timeout(fut, timeout, &signal).await.map(|ret| {
            if matches!(ret, HandlerReturn::Empty) {
                log::warn!("route {}: handler returned no value, responding 204", route.source);
            }
            response::coerce(ret)
        })
    })
    .await;

    body
}

async fn handler_timeout<F>(fut: F, timeout: Duration, signal: &context::Signal) -> Result<HandlerReturn>
where
    F: std::future::Future<Output = Result<HandlerReturn>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            signal.fire();
            Err(Error::Timeout)
        }
    }
}

/// A route whose HTTP path exists only because a queue declared
/// `config.url` (spec.md §3 "Route-backed queue"): the request body
/// becomes the enqueued payload rather than being handed to a handler.
async fn dispatch_route_backed_queue(
    queue_name: &str,
    request: &Request,
    params: &std::collections::HashMap<String, String>,
) -> Result<Response> {
    let group_id = params.get("group").cloned();
    let payload = match request.body_str() {
        Ok(text) => serde_json::from_str(text).unwrap_or_else(|_| serde_json::Value::String(text.to_string())),
        Err(_) => serde_json::Value::Null,
    };
    let message_id = context::queue_job(queue_name, group_id.as_deref(), payload).await?;
    Ok(Response::new(
        202,
        serde_json::to_vec(&serde_json::json!({ "messageId": message_id })).unwrap_or_default(),
    )
    .with_header("Content-Type", "application/json"))
}

/// Response post-processing (spec.md §4.E.9): ETag/Cache-Control only for
/// 200s, CORS merged whenever the route enables it, regardless of status.
fn post_process(route: &Route, status: u16, response: &mut Response) {
    if status == 200 {
        if route.etag && response.header("ETag").is_none() {
            response.headers.insert("ETag".to_string(), etag_for(&response.body));
        }
        if let Some(seconds) = route.cache_seconds {
            if seconds > 0 && response.header("Cache-Control").is_none() {
                response.headers.insert(
                    "Cache-Control".to_string(),
                    format!("private, max-age={}, must-revalidate", seconds),
                );
            }
        }
    }
    if route.cors {
        response.set_header_if_absent("Access-Control-Allow-Origin", "*".to_string());
    }
}

fn etag_for(body: &[u8]) -> String {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.update(body);
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("\"{}\"", hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_falls_through_to_get_acceptance() {
        let mut methods = std::collections::HashMap::new();
        methods.insert("GET".to_string(), noop_handler as crate::manifest::HttpHandlerFn);
        let route = sample_route(methods);
        assert!(accepts_method(&route, Method::Head));
        assert!(!accepts_method(&route, Method::Post));
    }

    struct NoopQueueBackend;

    #[async_trait::async_trait]
    impl crate::host::QueueBackend for NoopQueueBackend {
        async fn push(&self, _queue_name: &str, _group_id: Option<&str>, _payload: serde_json::Value) -> Result<String> {
            Ok("noop".to_string())
        }
        async fn delete_message(&self, _queue_name: &str, _receipt_handle: &str) -> Result<()> {
            Ok(())
        }
        fn is_local(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn head_request_dispatches_to_the_get_handler() {
        let mut methods = std::collections::HashMap::new();
        methods.insert("GET".to_string(), noop_handler as crate::manifest::HttpHandlerFn);
        let route = sample_route(methods);
        let request = Request {
            method: Method::Head,
            uri: crate::request::Uri { path: "/x".to_string(), query: std::collections::HashMap::new() },
            headers: std::collections::HashMap::new(),
            body: Vec::new(),
            cookies: std::collections::HashMap::new(),
            remote_addr: None,
        };
        let collaborators = crate::host::Collaborators {
            services: std::sync::Arc::new(crate::manifest::Services::build().unwrap()),
            connections: std::sync::Arc::new(crate::host::InMemoryWsHost::new()),
            queue_backend: std::sync::Arc::new(NoopQueueBackend),
            ws_transport: std::sync::Arc::new(crate::host::InMemoryWsHost::new()),
            urls: crate::host::UrlTable::default(),
        };
        let chain = Chain::resolve(&route.template.raw);
        let response = run_scope(&route, &chain, request, std::collections::HashMap::new(), collaborators)
            .await
            .unwrap();
        assert_eq!(response.status, 204);
    }

    #[test]
    fn etag_is_stable_for_identical_bodies() {
        assert_eq!(etag_for(b"hello"), etag_for(b"hello"));
        assert_ne!(etag_for(b"hello"), etag_for(b"world"));
    }

    fn noop_handler(
        _req: Request,
        _meta: HttpMeta,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<HandlerReturn>> + Send>> {
        Box::pin(async { Ok(HandlerReturn::Empty) })
    }

    fn sample_route(methods: std::collections::HashMap<String, crate::manifest::HttpHandlerFn>) -> Route {
        Route {
            template: crate::path::Template::parse("/x").unwrap(),
            methods,
            accepts: Vec::new(),
            cors: false,
            cache_seconds: None,
            etag: false,
            timeout: 10,
            source: "test".to_string(),
            backing_queue: None,
        }
    }
}
