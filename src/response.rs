//! HTTP response type and the value-to-response coercion the engine needs
//! (spec.md §4.E.8-9). Grounded on the base crate's `firework::Response` /
//! `StatusCode`, simplified to a fixed status code rather than an enum of
//! named variants — the engine only ever needs the numeric code.

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Response {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn empty(status: u16) -> Self {
        Response::new(status, Vec::new())
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header_if_absent(&mut self, key: &str, value: String) {
        if self.header(key).is_none() {
            self.headers.insert(key.to_string(), value);
        }
    }
}

impl Default for Response {
    fn default() -> Self {
        Response::empty(204)
    }
}

/// What a route handler hands back before coercion (spec.md §4.E.8):
/// a full response, a text/binary buffer, or a JSON value. `Empty` models
/// a handler that returned nothing, which becomes 204 with a logged
/// warning.
pub enum HandlerReturn {
    Response(Response),
    Text(String),
    Raw(Vec<u8>, String),
    Json(serde_json::Value),
    Empty,
}

impl HandlerReturn {
    pub fn json(value: impl serde::Serialize) -> crate::error::Result<HandlerReturn> {
        Ok(HandlerReturn::Json(serde_json::to_value(value)?))
    }

    pub fn text(body: impl Into<String>) -> HandlerReturn {
        HandlerReturn::Text(body.into())
    }
}

impl From<Response> for HandlerReturn {
    fn from(r: Response) -> Self {
        HandlerReturn::Response(r)
    }
}

impl From<String> for HandlerReturn {
    fn from(s: String) -> Self {
        HandlerReturn::Text(s)
    }
}

impl From<&str> for HandlerReturn {
    fn from(s: &str) -> Self {
        HandlerReturn::Text(s.to_string())
    }
}

impl From<()> for HandlerReturn {
    fn from(_: ()) -> Self {
        HandlerReturn::Empty
    }
}

/// Coerce a `HandlerReturn` into a concrete `Response`, preserving headers
/// from a user-supplied response (spec.md §4.E.9, first half).
pub fn coerce(ret: HandlerReturn) -> Response {
    match ret {
        HandlerReturn::Response(r) => r,
        HandlerReturn::Text(body) => {
            Response::new(200, body.into_bytes()).with_header("Content-Type", "text/plain; charset=utf-8")
        }
        HandlerReturn::Raw(body, mime) => Response::new(200, body).with_header("Content-Type", mime),
        HandlerReturn::Json(value) => {
            let body = serde_json::to_vec(&value).unwrap_or_else(|_| b"null".to_vec());
            Response::new(200, body).with_header("Content-Type", "application/json")
        }
        HandlerReturn::Empty => Response::empty(204),
    }
}
