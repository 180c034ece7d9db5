//! HTTP request type, grounded on the base crate's `request.rs` (headers as
//! `Vec<String>` to allow repeats, a `Uri` with a parsed query map).

use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Head,
    Other,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Head => "HEAD",
            Method::Other => "OTHER",
        }
    }

    pub fn parse(raw: &str) -> Method {
        match raw.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "PATCH" => Method::Patch,
            // `del` stands in for `delete` when the latter is a reserved word
            // in the handler's source language (spec.md §4.E.3).
            "DELETE" | "DEL" => Method::Delete,
            "OPTIONS" => Method::Options,
            "HEAD" => Method::Head,
            _ => Method::Other,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Uri {
    pub path: String,
    pub query: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
    pub cookies: HashMap<String, String>,
    pub remote_addr: Option<std::net::SocketAddr>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Request {
            method,
            uri: Uri {
                path: path.into(),
                query: HashMap::new(),
            },
            headers: HashMap::new(),
            body: Vec::new(),
            cookies: HashMap::new(),
            remote_addr: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.first())
            .map(|s| s.as_str())
    }

    /// Primary token of `Content-Type`, lower-cased, ignoring parameters
    /// such as `; charset=utf-8` (spec.md §4.E.4).
    pub fn content_type(&self) -> Option<String> {
        self.header("Content-Type")
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase())
    }

    pub fn body_str(&self) -> std::result::Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.body)
    }
}
