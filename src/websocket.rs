//! WebSocket dispatch (spec.md §4.F): a single registered handler answers
//! three shapes of event — connect, message, disconnect — on the same
//! connection over its lifetime. Grounded on the base crate's
//! `core/src/websocket.rs` (`Message`, handshake accept-key) and its own
//! `WS_ROUTES` dispatch, generalised from a direct `TcpStream` upgrade to
//! host-supplied `WsEvent`s so the same engine runs whether the host is a
//! long-lived listener or a per-event serverless invocation.

use crate::context::{Ambient, AmbientState, User};
use crate::error::{Error, Result};
use crate::host::{Collaborators, WsEvent};
use crate::manifest::{WsHandlerFn, WsMessageType};
use base64::Engine;
use std::collections::HashMap;

/// Computes the `Sec-WebSocket-Accept` header value for a handshake's
/// `Sec-WebSocket-Key`, per RFC 6455 §1.3. Grounded directly on the base
/// crate's `generate_accept_key` (`core/src/websocket.rs`). Not called by
/// `dispatch` itself — the handshake belongs to whatever host adapter
/// terminates the raw TCP connection (spec.md §1 "does not own a
/// connection multiplexer") — but it is the one piece of that handshake
/// that is pure protocol math rather than host-specific plumbing, so any
/// adapter needing it can reach for this instead of re-deriving it.
pub fn accept_key(sec_websocket_key: &str) -> String {
    use sha1::{Digest, Sha1};
    const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
    let mut hasher = Sha1::new();
    hasher.update(sec_websocket_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Everything `run` needs from a matched `WsRoute`, copied out up front so
/// the route lookup's borrow of `collaborators.services` doesn't have to
/// outlive the move of `collaborators` into `run` below.
struct ResolvedWs {
    raw_path: String,
    timeout: u64,
    msg_type: WsMessageType,
    handler: WsHandlerFn,
    authenticate: Option<crate::manifest::WsAuthenticateFn>,
    on_online: Option<crate::manifest::WsLifecycleFn>,
    on_offline: Option<crate::manifest::WsLifecycleFn>,
    on_message_received: Option<crate::manifest::WsObserveFn>,
    on_message_sent: Option<crate::manifest::WsObserveFn>,
    on_error: Option<crate::manifest::WsErrorFn>,
}

/// A decoded `Message` frame, interpreted per the route's configured
/// `config.type` (spec.md §4.F): `json` is parsed, `text` is a UTF-8
/// string, `binary` is handed through unparsed.
#[derive(Debug, Clone, PartialEq)]
pub enum WsMessage {
    Json(serde_json::Value),
    Text(String),
    Binary(Vec<u8>),
}

/// What the registered handler sees on each invocation; `Connect` and
/// `Disconnect` carry no payload.
pub enum WsData {
    Connect,
    Message(WsMessage),
    Disconnect,
}

/// Metadata handed alongside `WsData` (spec.md §4.F), mirroring
/// `manifest::HttpMeta` but without cookies — the handshake's own headers
/// are exposed only at `Connect` time via `authenticate`.
#[derive(Clone)]
pub struct WsMeta {
    pub connection_id: String,
    pub request_id: String,
    pub params: HashMap<String, String>,
    pub user: Option<User>,
    pub signal: crate::context::Signal,
}

/// Decode a `Message` event's raw frame per spec.md §4.F: base64-decode
/// first if the transport flagged it, then interpret per the route's
/// configured type.
fn decode_message(body: Vec<u8>, base64: bool, msg_type: WsMessageType) -> Result<WsMessage> {
    let bytes = if base64 {
        base64::engine::general_purpose::STANDARD
            .decode(&body)
            .map_err(|e| Error::Handler(format!("invalid base64 message frame: {}", e)))?
    } else {
        body
    };

    Ok(match msg_type {
        WsMessageType::Binary => WsMessage::Binary(bytes),
        WsMessageType::Json => {
            let value: serde_json::Value = serde_json::from_slice(&bytes)?;
            WsMessage::Json(value)
        }
        WsMessageType::Text => {
            let text = String::from_utf8(bytes)
                .map_err(|_| Error::Handler("message frame was not valid UTF-8".to_string()))?;
            WsMessage::Text(text)
        }
    })
}

/// Dispatches one `WsEvent` to its registered handler, opening exactly one
/// `Ambient` scope around the call (spec.md §4.C, §4.F). `authenticate`
/// runs only for `Connect`; the resulting user (if any) is persisted via
/// `ConnectionStore::bind` so later `Message`/`Disconnect` events on the
/// same connection see it too.
pub async fn dispatch(event: WsEvent, collaborators: Collaborators) -> Result<()> {
    match event {
        WsEvent::Connect { connection_id, request_id, path, headers } => {
            dispatch_connect(connection_id, request_id, path, headers, collaborators).await
        }
        WsEvent::Message { connection_id, request_id, body, base64 } => {
            dispatch_message(connection_id, request_id, body, base64, collaborators).await
        }
        WsEvent::Disconnect { connection_id } => dispatch_disconnect(connection_id, collaborators).await,
    }
}

async fn dispatch_connect(
    connection_id: String,
    request_id: String,
    path: String,
    headers: HashMap<String, String>,
    collaborators: Collaborators,
) -> Result<()> {
    let (route, params) = resolve(&collaborators, &path)?;

    let user = match route.authenticate {
        Some(auth) => auth(&headers).await?,
        None => None,
    };

    if let Some(user) = &user {
        let was_offline = collaborators.connections.connections_for(std::slice::from_ref(&user.id)).await?.is_empty();
        collaborators.connections.bind(&connection_id, &user.id).await?;
        if was_offline {
            if let Some(on_online) = route.on_online {
                on_online(&user.id).await;
            }
        }
    }
    collaborators
        .connections
        .attach_route(&connection_id, &route.raw_path, params.clone())
        .await?;

    run(route, connection_id, request_id, params, user, collaborators, WsData::Connect).await
}

async fn dispatch_message(
    connection_id: String,
    request_id: String,
    body: Vec<u8>,
    base64: bool,
    collaborators: Collaborators,
) -> Result<()> {
    let (path, params) = collaborators
        .connections
        .resolve_route(&connection_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("no route bound to connection `{}`", connection_id)))?;
    let (route, _) = resolve(&collaborators, &path)?;
    let user_id = collaborators.connections.resolve_user(&connection_id).await?;
    let user = user_id.map(|id| User { id, extra: HashMap::new() });

    let message = decode_message(body, base64, route.msg_type)?;
    run(route, connection_id, request_id, params, user, collaborators, WsData::Message(message)).await
}

async fn dispatch_disconnect(connection_id: String, collaborators: Collaborators) -> Result<()> {
    let bound = collaborators.connections.resolve_route(&connection_id).await?;
    let user_id = collaborators.connections.resolve_user(&connection_id).await?;
    let user = user_id.clone().map(|id| User { id, extra: HashMap::new() });
    let outcome = collaborators.connections.unbind(&connection_id).await?;

    let Some((path, params)) = bound else {
        // Disconnect for a connection we never recorded a route for — the
        // host may replay this after a crash; nothing to run.
        return Ok(());
    };
    let (route, _) = resolve(&collaborators, &path)?;

    if outcome.went_offline {
        if let (Some(on_offline), Some(uid)) = (route.on_offline, &outcome.user_id) {
            on_offline(uid).await;
        }
    }

    run(route, connection_id, String::new(), params, user, collaborators, WsData::Disconnect).await
}

fn resolve(collaborators: &Collaborators, path: &str) -> Result<(ResolvedWs, HashMap<String, String>)> {
    let (route, params) = collaborators
        .services
        .resolve_ws(path)
        .ok_or_else(|| Error::NotFound(format!("no websocket route for `{}`", path)))?;
    Ok((
        ResolvedWs {
            raw_path: route.template.raw.clone(),
            timeout: route.timeout,
            msg_type: route.msg_type,
            handler: route.handler,
            authenticate: route.authenticate,
            on_online: route.on_online,
            on_offline: route.on_offline,
            on_message_received: route.on_message_received,
            on_message_sent: route.on_message_sent,
            on_error: route.on_error,
        },
        params,
    ))
}

async fn run(
    route: ResolvedWs,
    connection_id: String,
    request_id: String,
    params: HashMap<String, String>,
    user: Option<User>,
    collaborators: Collaborators,
    data: WsData,
) -> Result<()> {
    let mut state = AmbientState::new(collaborators).with_connection_id(connection_id.clone());
    if let Some(user) = user.clone() {
        state = state.with_user(user);
    }
    let signal = state.signal();
    let meta = WsMeta { connection_id: connection_id.clone(), request_id, params, user, signal: signal.clone() };
    let handler = route.handler;
    let timeout = std::time::Duration::from_secs(route.timeout);

    if let (Some(on_received), WsData::Message(message)) = (route.on_message_received, &data) {
        on_received(&meta, message).await;
    }
    let sent_hook_data = if let WsData::Message(message) = &data { Some(message.clone()) } else { None };

    let meta_for_handler = meta.clone();
    let result = Ambient::enter(state, async move {
        match tokio::time::timeout(timeout, handler(data, meta_for_handler)).await {
            Ok(result) => result,
            Err(_) => {
                signal.fire();
                Err(Error::Timeout)
            }
        }
    })
    .await;

    match &result {
        Ok(()) => {
            if let (Some(on_sent), Some(message)) = (route.on_message_sent, &sent_hook_data) {
                on_sent(&meta, message).await;
            }
        }
        Err(e) => {
            log::error!("websocket route {}: {}", route.raw_path, e);
            if let Some(on_error) = route.on_error {
                on_error(e, &connection_id).await;
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_the_rfc6455_worked_example() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn binary_frames_decode_base64() {
        let encoded = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]);
        let decoded = decode_message(encoded.into_bytes(), true, WsMessageType::Binary).unwrap();
        assert_eq!(decoded, WsMessage::Binary(vec![1, 2, 3]));
    }

    #[test]
    fn text_frames_require_valid_utf8() {
        let result = decode_message(vec![0xff, 0xfe], false, WsMessageType::Text);
        assert!(result.is_err());
    }

    #[test]
    fn json_frames_parse_into_a_value() {
        let decoded = decode_message(b"{\"n\":1}".to_vec(), false, WsMessageType::Json).unwrap();
        assert_eq!(decoded, WsMessage::Json(serde_json::json!({"n": 1})));
    }
}
