//! Queue dispatcher (spec.md §4.G): standard (parallel, per-message partial
//! failure) and FIFO (strict in-order, cut-off on first failure) batch
//! dispatch over a shared `remainingTime()` budget. Grounded on the same
//! `Ambient::enter` + `tokio::time::timeout` race the HTTP and WebSocket
//! engines use (`http_engine::handler_timeout`, `websocket::run`), applied
//! per-message instead of per-request.

use crate::context::{Ambient, AmbientState, User};
use crate::error::{Error, Result};
use crate::host::{Collaborators, ItemIdentifier, QueueMessage, RemainingTime};
use crate::manifest::{MessageMeta, QueueDescriptor};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Percent-decodes and splits a `params` attribute's query-string form back
/// into a map (spec.md §3 "Message": `params` as a query-string).
fn parse_query_string(qs: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if qs.is_empty() {
        return map;
    }
    for pair in qs.split('&') {
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_default();
        map.insert(urldecode(key), urldecode(value));
    }
    map
}

fn urldecode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
                out.push(bytes[i]);
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Decode a message body per spec.md §4.G: JSON if the `type` attribute
/// says so, otherwise attempt JSON and fall back to the raw string.
fn decode_payload(body: &str, declared_type: Option<&str>) -> serde_json::Value {
    let looks_json = declared_type.map(|t| t.eq_ignore_ascii_case("application/json")).unwrap_or(false);
    if looks_json {
        if let Ok(value) = serde_json::from_str(body) {
            return value;
        }
    }
    serde_json::from_str(body).unwrap_or_else(|_| serde_json::Value::String(body.to_string()))
}

/// Classification per spec.md §4.G: a FIFO queue is inferred from the
/// `.fifo` name suffix (carried on `QueueDescriptor`) or the presence of a
/// `MessageGroupId` attribute on any message in the batch.
pub fn is_fifo(queue: &QueueDescriptor, messages: &[QueueMessage]) -> bool {
    queue.fifo || messages.iter().any(|m| m.attributes.contains_key("MessageGroupId"))
}

/// Outcome of dispatching one message: success deletes it from the queue
/// (state `deleted`, terminal); failure reports it back to the host for
/// redelivery (state `failed`).
enum Outcome {
    Deleted,
    Failed,
}

async fn dispatch_one(
    queue: &QueueDescriptor,
    message: &QueueMessage,
    remaining: &Arc<dyn RemainingTime>,
    collaborators: &Collaborators,
) -> Outcome {
    let remaining_secs = remaining.remaining_ms() / 1000;
    let effective_timeout = queue.timeout.min(remaining_secs);
    if effective_timeout == 0 {
        log::warn!(
            "queue {}: message {} left pending, no time remaining in batch deadline",
            queue.name,
            message.message_id
        );
        return Outcome::Failed;
    }

    let group_id = message.attributes.get("MessageGroupId").cloned();
    let received_count: u32 = message
        .attributes
        .get("ApproximateReceiveCount")
        .and_then(|s| s.parse().ok())
        .unwrap_or(1);
    let sent_at = message.attributes.get("SentTimestamp").cloned();
    let sequence_number = message.attributes.get("SequenceNumber").cloned();
    let params = message
        .message_attributes
        .get("params")
        .map(|qs| parse_query_string(qs))
        .unwrap_or_default();
    let user = message
        .message_attributes
        .get("userId")
        .map(|id| User { id: id.clone(), extra: HashMap::new() });
    let declared_type = message.message_attributes.get("type").map(|s| s.as_str());
    let payload = decode_payload(&message.body, declared_type);

    let state = AmbientState::new(collaborators.clone());
    let signal = state.signal();
    let state = match user.clone() {
        Some(u) => state.with_user(u),
        None => state,
    };

    let meta = MessageMeta {
        message_id: message.message_id.clone(),
        group_id,
        params,
        queue_name: queue.name.clone(),
        received_count,
        sent_at,
        sequence_number,
        user,
        signal: signal.clone(),
    };

    let handler = queue.handler;
    let timeout = Duration::from_secs(effective_timeout);
    let payload_for_error = payload.clone();
    let result = Ambient::enter(state, async move {
        match tokio::time::timeout(timeout, handler(payload, meta)).await {
            Ok(result) => result,
            Err(_) => {
                signal.fire();
                Err(Error::Timeout)
            }
        }
    })
    .await;

    match result {
        Ok(()) => {
            if let Err(e) = collaborators.queue_backend.delete_message(&queue.name, &message.receipt_handle).await {
                log::error!("queue {}: failed to delete message {}: {}", queue.name, message.message_id, e);
            }
            Outcome::Deleted
        }
        Err(e) => {
            log::error!("queue {}: message {} failed: {}", queue.name, message.message_id, e);
            if let Some(on_error) = queue.on_error {
                on_error(&e, &payload_for_error).await;
            }
            Outcome::Failed
        }
    }
}

/// Dispatches one batch of messages for a single queue (spec.md §4.G).
/// `messages` must all belong to `queue` — splitting an event-source batch
/// by queue is the host adapter's job (spec.md §4.H). Returns the
/// `itemIdentifier`s the host must redeliver.
pub async fn dispatch_batch(
    queue_name: &str,
    messages: Vec<QueueMessage>,
    remaining: Arc<dyn RemainingTime>,
    collaborators: Collaborators,
) -> Vec<ItemIdentifier> {
    let Some(queue) = collaborators.services.queue(queue_name) else {
        log::error!("queue {}: no handler registered", queue_name);
        return messages
            .into_iter()
            .map(|m| ItemIdentifier { item_identifier: m.message_id })
            .collect();
    };

    if is_fifo(queue, &messages) {
        dispatch_fifo(queue, messages, &remaining, &collaborators).await
    } else {
        dispatch_standard(queue, messages, &remaining, &collaborators).await
    }
}

/// Standard batch semantics (spec.md §4.G, §8 property 6): every message
/// dispatches in parallel; the result is whichever didn't reach `deleted`,
/// independent of order.
async fn dispatch_standard(
    queue: &QueueDescriptor,
    messages: Vec<QueueMessage>,
    remaining: &Arc<dyn RemainingTime>,
    collaborators: &Collaborators,
) -> Vec<ItemIdentifier> {
    let futures = messages.iter().map(|message| {
        let remaining = remaining.clone();
        async move {
            let outcome = dispatch_one(queue, message, &remaining, collaborators).await;
            (message.message_id.clone(), outcome)
        }
    });
    let results = futures_util::future::join_all(futures).await;
    results
        .into_iter()
        .filter_map(|(id, outcome)| match outcome {
            Outcome::Deleted => None,
            Outcome::Failed => Some(ItemIdentifier { item_identifier: id }),
        })
        .collect()
}

/// FIFO batch semantics (spec.md §4.G, §8 property 5): strictly sequential;
/// the first failure cuts off every message at or after it. Earlier
/// successes stand, since they were already deleted.
async fn dispatch_fifo(
    queue: &QueueDescriptor,
    messages: Vec<QueueMessage>,
    remaining: &Arc<dyn RemainingTime>,
    collaborators: &Collaborators,
) -> Vec<ItemIdentifier> {
    let mut failed = Vec::new();
    let mut cut_off = false;
    for message in &messages {
        if cut_off {
            failed.push(ItemIdentifier { item_identifier: message.message_id.clone() });
            continue;
        }
        match dispatch_one(queue, message, remaining, collaborators).await {
            Outcome::Deleted => {}
            Outcome::Failed => {
                cut_off = true;
                failed.push(ItemIdentifier { item_identifier: message.message_id.clone() });
            }
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_string_round_trips_percent_encoding() {
        let parsed = parse_query_string("a=1&b=hello%20world");
        assert_eq!(parsed.get("a"), Some(&"1".to_string()));
        assert_eq!(parsed.get("b"), Some(&"hello world".to_string()));
    }

    #[test]
    fn payload_falls_back_to_raw_string_on_parse_failure() {
        let value = decode_payload("not json", Some("application/json"));
        assert_eq!(value, serde_json::Value::String("not json".to_string()));
    }

    #[test]
    fn payload_parses_json_without_a_declared_type() {
        let value = decode_payload("{\"n\":1}", None);
        assert_eq!(value, serde_json::json!({"n": 1}));
    }
}
